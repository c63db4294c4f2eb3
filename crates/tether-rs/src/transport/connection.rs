//! Connection lifecycle for a single transport.
//!
//! All mutable state lives in one `Core` behind a mutex that is never held
//! across an await point. Connect attempts are additionally serialized by an
//! async lock so at most one attempt is in flight per transport.
//!
//! Every connection epoch (one successful connect until the next failure or
//! close) has a number. Heartbeats and streams remember the epoch they were
//! started in; once it changes, their results are discarded and their
//! failures are ignored.

use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard};
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use futures::stream::{self, BoxStream, Stream, StreamExt};
use reqwest::header::ACCEPT;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use super::{ConnectionHealth, ConnectionState, Endpoint, TransportDescriptor};
use crate::api::retry::{Backoff, CircuitStatus, RetryDecision, RetryState};
use crate::api::streaming::{FrameReader, StreamEvent, StreamFramer, StreamOutcome};
use crate::config::TransportConfig;
use crate::error::{ConnectionError, ErrorClassifier};
use crate::status::{StatusBus, StatusEvent, generate_message_id};
use crate::{
    CHAT_PATH, ChatMessage, ChatRequest, NDJSON_CONTENT_TYPE, TAGS_PATH, TagsResponse,
    VERSION_PATH, VersionResponse,
};

const CONNECTION_LOST: &str = "connection lost";

/// Where a failure was observed. Only changes logging and which task handle
/// may be aborted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FailureSource {
    Connect,
    Request,
    Stream,
    Heartbeat,
    Tunnel,
}

struct Core {
    backoff: Backoff,
    epoch: u64,
    active_streams: usize,
    heartbeat: Option<JoinHandle<()>>,
    reconnect: Option<JoinHandle<()>>,
    tunnel_watch: Option<JoinHandle<()>>,
}

struct Inner {
    endpoint: Box<dyn Endpoint>,
    config: TransportConfig,
    client: reqwest::Client,
    classifier: Arc<dyn ErrorClassifier>,
    bus: StatusBus,
    health: watch::Sender<ConnectionHealth>,
    core: Mutex<Core>,
    connect_lock: tokio::sync::Mutex<()>,
}

/// One logical connection to a backend over a given [`Endpoint`].
///
/// Cheap to clone; clones share the same state machine.
#[derive(Clone)]
pub struct TransportConnection {
    inner: Arc<Inner>,
}

impl TransportConnection {
    pub fn new(
        endpoint: impl Endpoint + 'static,
        config: TransportConfig,
        classifier: Arc<dyn ErrorClassifier>,
        bus: StatusBus,
    ) -> Result<Self, ConnectionError> {
        let client = reqwest::Client::builder()
            .connect_timeout(config.probe_timeout)
            .build()
            .map_err(|e| ConnectionError::Config(format!("failed to build HTTP client: {e}")))?;
        let (health, _) = watch::channel(ConnectionHealth::initial(endpoint.identifier()));
        let backoff = Backoff::new(config.retry.clone());

        Ok(Self {
            inner: Arc::new(Inner {
                endpoint: Box::new(endpoint),
                config,
                client,
                classifier,
                bus,
                health,
                core: Mutex::new(Core {
                    backoff,
                    epoch: 0,
                    active_streams: 0,
                    heartbeat: None,
                    reconnect: None,
                    tunnel_watch: None,
                }),
                connect_lock: tokio::sync::Mutex::new(()),
            }),
        })
    }

    /// Connect unless already connected or streaming.
    ///
    /// Fails synchronously with [`ConnectionError::CircuitOpen`] while the
    /// circuit breaker is open, without touching the network.
    pub async fn establish_connection(&self) -> Result<(), ConnectionError> {
        self.inner.establish().await
    }

    /// Stream a chat response for `prompt` after `history`.
    ///
    /// Connects first if needed. Failures before the first byte are returned
    /// as `Err`; failures mid-stream end the returned stream with a single
    /// [`StreamEvent::Error`].
    pub async fn stream_chat(
        &self,
        prompt: &str,
        model: &str,
        conversation_id: &str,
        history: &[ChatMessage],
    ) -> Result<ChatStream, ConnectionError> {
        self.inner
            .stream_chat(prompt, model, conversation_id, history)
            .await
    }

    /// Model names advertised by the backend.
    pub async fn list_models(&self) -> Result<Vec<String>, ConnectionError> {
        self.inner.list_models().await
    }

    /// `establish_connection` as a boolean.
    pub async fn test_connection(&self) -> bool {
        match self.inner.establish().await {
            Ok(()) => true,
            Err(e) => {
                debug!("Connection test failed for {}: {e}", self.endpoint_identifier());
                false
            }
        }
    }

    /// Clear the retry counter and force-close the circuit breaker.
    pub fn reset_connection_state(&self) {
        let mut core = self.inner.core();
        core.backoff.reset();
        if let Some(pending) = core.reconnect.take() {
            pending.abort();
        }
        info!("Connection state reset for {}", self.inner.endpoint.identifier());
    }

    /// Close the connection: cancel heartbeat and reconnect timers and move to
    /// `Disconnected`. Streams still being read end with an error.
    pub fn close_connection(&self) {
        self.inner.close();
    }

    pub fn health(&self) -> ConnectionHealth {
        self.inner.health.borrow().clone()
    }

    pub fn subscribe_health(&self) -> watch::Receiver<ConnectionHealth> {
        self.inner.health.subscribe()
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.state()
    }

    pub fn is_healthy(&self) -> bool {
        self.state().is_healthy()
    }

    pub fn retry_state(&self) -> RetryState {
        self.inner.core().backoff.retry_state()
    }

    /// Remaining circuit breaker cool-down, if open.
    pub fn circuit_remaining(&self) -> Option<Duration> {
        self.inner.core().backoff.breaker().remaining(Instant::now())
    }

    pub fn circuit_status(&self) -> CircuitStatus {
        self.inner.core().backoff.breaker().status(Instant::now())
    }

    pub fn has_pending_reconnect(&self) -> bool {
        self.inner
            .core()
            .reconnect
            .as_ref()
            .is_some_and(|h| !h.is_finished())
    }

    pub fn active_streams(&self) -> usize {
        self.inner.core().active_streams
    }

    pub fn descriptor(&self) -> TransportDescriptor {
        self.inner.endpoint.descriptor()
    }

    pub fn endpoint_identifier(&self) -> String {
        self.inner.endpoint.identifier()
    }
}

impl std::fmt::Debug for TransportConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportConnection")
            .field("endpoint", &self.inner.endpoint.identifier())
            .field("state", &self.state())
            .finish()
    }
}

impl Inner {
    fn core(&self) -> MutexGuard<'_, Core> {
        self.core.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn state(&self) -> ConnectionState {
        self.health.borrow().state
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.endpoint.base_url())
    }

    /// Replace the health snapshot and publish it. Callers hold the core lock.
    fn transition(
        &self,
        state: ConnectionState,
        error: Option<String>,
        latency: Option<Duration>,
    ) -> ConnectionHealth {
        let next = {
            let current = self.health.borrow();
            let mut next = current.transition(state);
            if let Some(error) = error {
                next = next.with_error(error);
            }
            if let Some(latency) = latency {
                next = next.with_latency(latency);
            }
            next
        };
        debug!("{} -> {state}", next.endpoint);
        self.health.send_replace(next.clone());
        self.bus.publish(StatusEvent::from(&next));
        next
    }

    // ── Connect ────────────────────────────────────────────────────

    async fn establish(self: &Arc<Self>) -> Result<(), ConnectionError> {
        let _attempt = self.connect_lock.lock().await;

        let epoch = {
            let mut core = self.core();
            if self.state().is_healthy() {
                return Ok(());
            }
            if let Err(retry_in) = core.backoff.admit(Instant::now()) {
                debug!(
                    "Circuit open for {}, rejecting attempt ({retry_in:?} left)",
                    self.endpoint.identifier()
                );
                return Err(ConnectionError::CircuitOpen { retry_in });
            }
            self.ensure_tunnel_watch(&mut core);
            if let Err(e) = self.endpoint.preflight() {
                // Waiting on a precondition: no attempt is consumed and no
                // timer is armed. Repeated identical failures are not republished.
                debug!("Preflight failed for {}: {e}", self.endpoint.identifier());
                let message = e.to_string();
                let unchanged = {
                    let current = self.health.borrow();
                    current.state == ConnectionState::Error
                        && current.last_error.as_deref() == Some(message.as_str())
                };
                if !unchanged {
                    self.transition(ConnectionState::Error, Some(message), None);
                }
                return Err(e);
            }
            self.transition(ConnectionState::Connecting, None, None);
            core.epoch
        };

        let token = match self.endpoint.authorization() {
            Ok(token) => token,
            Err(e) => return Err(self.fail(e, FailureSource::Connect, epoch)),
        };

        let started = Instant::now();
        match self.probe(token.as_deref()).await {
            Ok(version) => {
                let latency = started.elapsed();
                let mut core = self.core();
                if core.epoch != epoch {
                    debug!("Connection to {} closed during probe", self.endpoint.identifier());
                    return Err(ConnectionError::Closed);
                }
                core.backoff.on_success();
                if let Some(pending) = core.reconnect.take() {
                    pending.abort();
                }
                self.transition(ConnectionState::Connected, None, Some(latency));
                self.start_heartbeat(&mut core, epoch);
                info!(
                    "Connected to {} (version {version}, {latency:?})",
                    self.endpoint.identifier()
                );
                Ok(())
            }
            Err(e) => Err(self.fail(e, FailureSource::Connect, epoch)),
        }
    }

    async fn probe(&self, token: Option<&str>) -> Result<String, ConnectionError> {
        let mut request = self
            .client
            .get(self.url(VERSION_PATH))
            .timeout(self.config.probe_timeout);
        if let Some(token) = token {
            request = request.bearer_auth(token);
        }
        let response = check_status(request.send().await?).await?;
        let body: VersionResponse = response.json().await.map_err(|e| ConnectionError::Protocol {
            status: None,
            message: format!("invalid version response: {e}"),
        })?;
        Ok(body.version)
    }

    // ── Failure handling ───────────────────────────────────────────

    /// Record a failure observed in `epoch`: move to `Error`, invalidate the
    /// epoch and schedule the next attempt. Stale failures are ignored.
    /// Returns `error` for propagation to the caller.
    fn fail(
        self: &Arc<Self>,
        error: ConnectionError,
        source: FailureSource,
        epoch: u64,
    ) -> ConnectionError {
        let classification = self.classifier.classify(&error);
        {
            let mut core = self.core();
            if core.epoch != epoch {
                trace!("Ignoring stale {source:?} failure: {error}");
                return error;
            }
            core.epoch += 1;
            core.active_streams = 0;
            if let Some(heartbeat) = core.heartbeat.take()
                && source != FailureSource::Heartbeat
            {
                heartbeat.abort();
            }

            warn!(
                "{} failed ({source:?}, {}): {error}",
                self.endpoint.identifier(),
                error.category()
            );
            self.transition(ConnectionState::Error, Some(error.to_string()), None);

            let delay = match core
                .backoff
                .on_failure(classification.is_retryable, Instant::now())
            {
                RetryDecision::RetryAfter(delay) => delay,
                RetryDecision::CircuitOpened { cooldown } => cooldown,
            };
            self.schedule_reconnect(&mut core, delay);
        }

        if matches!(error, ConnectionError::Auth(_)) {
            self.endpoint.auth_rejected();
        }
        error
    }

    /// Arm the reconnect timer unless one is already pending.
    fn schedule_reconnect(self: &Arc<Self>, core: &mut Core, delay: Duration) {
        if !self.config.auto_reconnect {
            return;
        }
        if core.reconnect.as_ref().is_some_and(|h| !h.is_finished()) {
            trace!("Reconnect already pending for {}", self.endpoint.identifier());
            return;
        }
        debug!(
            "Reconnecting to {} in {delay:?} (attempt {})",
            self.endpoint.identifier(),
            core.backoff.retry_state().attempt_count
        );

        let weak = Arc::downgrade(self);
        core.reconnect = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let Some(inner) = weak.upgrade() else { return };
            {
                let mut core = inner.core();
                core.reconnect = None;
                if inner.state() == ConnectionState::Disconnected {
                    return;
                }
            }
            if let Err(e) = inner.establish().await {
                debug!("Reconnect to {} failed: {e}", inner.endpoint.identifier());
            }
        }));
    }

    // ── Heartbeat ──────────────────────────────────────────────────

    fn start_heartbeat(self: &Arc<Self>, core: &mut Core, epoch: u64) {
        if let Some(previous) = core.heartbeat.take() {
            previous.abort();
        }
        if !self.config.heartbeat_enabled {
            return;
        }

        let weak = Arc::downgrade(self);
        let interval = self.config.heartbeat_interval;
        core.heartbeat = Some(tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                let Some(inner) = weak.upgrade() else { return };
                if inner.core().epoch != epoch {
                    return;
                }

                let token = match inner.endpoint.authorization() {
                    Ok(token) => token,
                    Err(e) => {
                        inner.fail(e, FailureSource::Heartbeat, epoch);
                        return;
                    }
                };
                let started = Instant::now();
                match inner.probe(token.as_deref()).await {
                    Ok(_) => inner.record_heartbeat(epoch, started.elapsed()),
                    Err(e) => {
                        inner.fail(e, FailureSource::Heartbeat, epoch);
                        return;
                    }
                }
            }
        }));
    }

    /// Refresh latency and activity after a successful heartbeat. Not a state
    /// transition, so nothing is published on the bus.
    fn record_heartbeat(&self, epoch: u64, latency: Duration) {
        let core = self.core();
        if core.epoch != epoch {
            return;
        }
        let next = {
            let current = self.health.borrow();
            let state = current.state;
            current.transition(state).with_latency(latency)
        };
        self.health.send_replace(next);
        trace!("Heartbeat ok for {} ({latency:?})", self.endpoint.identifier());
    }

    // ── Tunnel gating ──────────────────────────────────────────────

    fn ensure_tunnel_watch(self: &Arc<Self>, core: &mut Core) {
        if core.tunnel_watch.as_ref().is_some_and(|h| !h.is_finished()) {
            return;
        }
        let Some(mut status) = self.endpoint.tunnel_status() else {
            return;
        };

        let weak = Arc::downgrade(self);
        core.tunnel_watch = Some(tokio::spawn(async move {
            let mut was_connected = status.borrow_and_update().is_connected;
            while status.changed().await.is_ok() {
                let connected = status.borrow_and_update().is_connected;
                if connected == was_connected {
                    continue;
                }
                was_connected = connected;
                let Some(inner) = weak.upgrade() else { return };
                if connected {
                    inner.on_tunnel_up();
                } else {
                    inner.on_tunnel_down();
                }
            }
        }));
    }

    fn on_tunnel_down(self: &Arc<Self>) {
        let epoch = {
            let core = self.core();
            if !self.state().is_healthy() {
                return;
            }
            core.epoch
        };
        self.fail(
            ConnectionError::Process("tunnel disconnected".into()),
            FailureSource::Tunnel,
            epoch,
        );
    }

    fn on_tunnel_up(self: &Arc<Self>) {
        if self.state() != ConnectionState::Error {
            return;
        }
        if self.core().backoff.breaker().remaining(Instant::now()).is_some() {
            debug!(
                "Tunnel is back but the circuit for {} is open",
                self.endpoint.identifier()
            );
            return;
        }
        info!("Tunnel is back, reconnecting {}", self.endpoint.identifier());
        let inner = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(e) = inner.establish().await {
                debug!("Reconnect after tunnel recovery failed: {e}");
            }
        });
    }

    // ── Requests ───────────────────────────────────────────────────

    async fn stream_chat(
        self: &Arc<Self>,
        prompt: &str,
        model: &str,
        conversation_id: &str,
        history: &[ChatMessage],
    ) -> Result<ChatStream, ConnectionError> {
        self.establish().await?;
        let epoch = self.core().epoch;

        let token = match self.endpoint.authorization() {
            Ok(token) => token,
            Err(e) => return Err(self.fail(e, FailureSource::Request, epoch)),
        };
        let body = ChatRequest::streaming(model, history, prompt);
        let mut request = self
            .client
            .post(self.url(CHAT_PATH))
            .header(ACCEPT, NDJSON_CONTENT_TYPE)
            .json(&body);
        if let Some(token) = token.as_deref() {
            request = request.bearer_auth(token);
        }

        // Bound the wait for headers only. The body streams unbounded.
        let sent = tokio::time::timeout(self.config.request_timeout, request.send()).await;
        let response = match sent {
            Ok(Ok(response)) => response,
            Ok(Err(e)) => return Err(self.fail(e.into(), FailureSource::Stream, epoch)),
            Err(_) => {
                let err = ConnectionError::Connectivity(format!(
                    "no response from {} within {:?}",
                    self.endpoint.identifier(),
                    self.config.request_timeout
                ));
                return Err(self.fail(err, FailureSource::Stream, epoch));
            }
        };
        let response = match check_status(response).await {
            Ok(response) => response,
            Err(e) => return Err(self.fail(e, FailureSource::Stream, epoch)),
        };

        let id = generate_message_id();
        {
            let mut core = self.core();
            if core.epoch != epoch {
                return Err(ConnectionError::Connectivity(
                    "connection lost before the stream started".into(),
                ));
            }
            core.active_streams += 1;
            if self.state() == ConnectionState::Connected {
                self.transition(ConnectionState::Streaming, None, None);
            }
        }
        debug!("Streaming {id} from {}", self.endpoint.identifier());

        let bytes = stream::unfold(response, |mut response| async move {
            match response.chunk().await {
                Ok(Some(chunk)) => Some((Ok(chunk), response)),
                Ok(None) => None,
                Err(e) => Some((Err(e), response)),
            }
        })
        .boxed();

        let reader = FrameReader::new(StreamFramer::new(id.clone(), conversation_id, model), bytes);
        let guard = StreamGuard {
            inner: Arc::clone(self),
            epoch,
            settled: false,
        };
        let events = stream::unfold((reader, guard), |(mut reader, mut guard)| async move {
            if guard.settled {
                return None;
            }
            let event = if guard.is_stale() {
                reader.abort(CONNECTION_LOST)
            } else {
                let next = reader.next().await;
                let stale = guard.is_stale();
                match next {
                    Some(event) if stale => reader.preempt(event, CONNECTION_LOST),
                    other => other,
                }
            };

            let Some(event) = event else {
                guard.settle(reader.outcome());
                return None;
            };
            if event.is_terminal() {
                guard.settle(reader.outcome());
            }
            Some((event, (reader, guard)))
        })
        .boxed();

        Ok(ChatStream { id, events })
    }

    async fn list_models(self: &Arc<Self>) -> Result<Vec<String>, ConnectionError> {
        self.establish().await?;
        let epoch = self.core().epoch;

        let token = match self.endpoint.authorization() {
            Ok(token) => token,
            Err(e) => return Err(self.fail(e, FailureSource::Request, epoch)),
        };
        match self.fetch_tags(token.as_deref()).await {
            Ok(tags) => Ok(tags.models.into_iter().map(|m| m.name).collect()),
            Err(e) => Err(self.fail(e, FailureSource::Request, epoch)),
        }
    }

    async fn fetch_tags(&self, token: Option<&str>) -> Result<TagsResponse, ConnectionError> {
        let mut request = self
            .client
            .get(self.url(TAGS_PATH))
            .timeout(self.config.request_timeout);
        if let Some(token) = token {
            request = request.bearer_auth(token);
        }
        let response = check_status(request.send().await?).await?;
        response.json().await.map_err(|e| ConnectionError::Protocol {
            status: None,
            message: format!("invalid model list: {e}"),
        })
    }

    /// A stream in `epoch` finished without a transport failure.
    fn finish_stream(&self, epoch: u64) {
        let mut core = self.core();
        if core.epoch != epoch {
            return;
        }
        core.active_streams = core.active_streams.saturating_sub(1);
        if core.active_streams == 0 && self.state() == ConnectionState::Streaming {
            self.transition(ConnectionState::Connected, None, None);
        }
    }

    fn close(&self) {
        let mut core = self.core();
        core.epoch += 1;
        core.active_streams = 0;
        for handle in [
            core.heartbeat.take(),
            core.reconnect.take(),
            core.tunnel_watch.take(),
        ]
        .into_iter()
        .flatten()
        {
            handle.abort();
        }
        if self.state() != ConnectionState::Disconnected {
            self.transition(ConnectionState::Disconnected, None, None);
            info!("Closed connection to {}", self.endpoint.identifier());
        }
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        let core = self.core.get_mut().unwrap_or_else(|e| e.into_inner());
        for handle in [
            core.heartbeat.take(),
            core.reconnect.take(),
            core.tunnel_watch.take(),
        ]
        .into_iter()
        .flatten()
        {
            handle.abort();
        }
    }
}

async fn check_status(response: reqwest::Response) -> Result<reqwest::Response, ConnectionError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(ConnectionError::from_status(status.as_u16(), body))
}

// ── Chat stream ────────────────────────────────────────────────────

/// Ties a stream to the epoch it was started in and reports how it ended.
struct StreamGuard {
    inner: Arc<Inner>,
    epoch: u64,
    settled: bool,
}

impl StreamGuard {
    fn is_stale(&self) -> bool {
        self.inner.core().epoch != self.epoch
    }

    fn settle(&mut self, outcome: Option<&StreamOutcome>) {
        if self.settled {
            return;
        }
        self.settled = true;
        match outcome {
            Some(StreamOutcome::TransportFailed(message)) => {
                self.inner.fail(
                    ConnectionError::Connectivity(message.clone()),
                    FailureSource::Stream,
                    self.epoch,
                );
            }
            _ => self.inner.finish_stream(self.epoch),
        }
    }
}

impl Drop for StreamGuard {
    fn drop(&mut self) {
        if !self.settled {
            self.settled = true;
            self.inner.finish_stream(self.epoch);
        }
    }
}

/// Lazy, finite stream of [`StreamEvent`]s for one chat response.
///
/// Always ends with [`StreamEvent::Complete`] or [`StreamEvent::Error`].
/// Dropping it early releases the connection back to `Connected`.
pub struct ChatStream {
    id: String,
    events: BoxStream<'static, StreamEvent>,
}

impl ChatStream {
    /// Message id carried by every event of this stream.
    pub fn id(&self) -> &str {
        &self.id
    }
}

impl Stream for ChatStream {
    type Item = StreamEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.events.poll_next_unpin(cx)
    }
}

impl std::fmt::Debug for ChatStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChatStream").field("id", &self.id).finish()
    }
}
