//! Best-available connection selection.
//!
//! [`ConnectionRouter`] holds every [`TransportConnection`] plus the optional
//! [`TunnelSupervisor`], picks a healthy transport on every call and exposes
//! one status view for the whole engine. It only reads published health
//! snapshots; transports own their state.
//!
//! Selection, evaluated per call:
//!
//! 1. local, if local is preferred and healthy;
//! 2. otherwise cloud, if healthy;
//! 3. otherwise local, if healthy;
//! 4. otherwise [`ConnectionError::NoProvider`].
//!
//! Within a kind the lowest `priority` value wins. Failures are returned to
//! the caller as-is; a partially streamed answer is never retried on another
//! transport.

use std::collections::BTreeSet;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use futures::future::join_all;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::ChatMessage;
use crate::error::ConnectionError;
use crate::transport::{
    ChatStream, ConnectionHealth, TransportConnection, TransportDescriptor, TransportKind,
};
use crate::tunnel::{TunnelProcessState, TunnelSupervisor};

#[derive(Debug, Default)]
struct ModelCatalog {
    available: Vec<String>,
    selected: Option<String>,
}

/// Status of one transport as seen by the router.
#[derive(Debug, Clone, Serialize)]
pub struct TransportStatus {
    pub descriptor: TransportDescriptor,
    pub health: ConnectionHealth,
    /// Remaining circuit breaker cool-down, if open.
    pub circuit_retry_in: Option<Duration>,
}

/// Aggregated, user-facing engine status.
#[derive(Debug, Clone, Serialize)]
pub struct RouterStatus {
    /// Kind of the transport the next call would use.
    pub active: Option<TransportKind>,
    pub prefer_local: bool,
    pub selected_model: Option<String>,
    pub available_models: Vec<String>,
    pub transports: Vec<TransportStatus>,
    pub tunnel: Option<TunnelProcessState>,
    /// Human-readable summary, including the breaker cool-down when open.
    pub message: String,
}

/// Presents a single logical "best available connection".
#[derive(Default)]
pub struct ConnectionRouter {
    transports: Vec<TransportConnection>,
    tunnel: Option<TunnelSupervisor>,
    prefer_local: AtomicBool,
    catalog: Mutex<ModelCatalog>,
}

impl ConnectionRouter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_transport(mut self, transport: TransportConnection) -> Self {
        self.transports.push(transport);
        self
    }

    pub fn with_tunnel(mut self, tunnel: TunnelSupervisor) -> Self {
        self.tunnel = Some(tunnel);
        self
    }

    pub fn with_prefer_local(self, prefer: bool) -> Self {
        self.prefer_local.store(prefer, Ordering::Relaxed);
        self
    }

    pub fn set_prefer_local(&self, prefer: bool) {
        self.prefer_local.store(prefer, Ordering::Relaxed);
        debug!("Prefer local set to {prefer}");
    }

    pub fn prefer_local(&self) -> bool {
        self.prefer_local.load(Ordering::Relaxed)
    }

    pub fn transports(&self) -> &[TransportConnection] {
        &self.transports
    }

    pub fn tunnel(&self) -> Option<&TunnelSupervisor> {
        self.tunnel.as_ref()
    }

    fn catalog(&self) -> std::sync::MutexGuard<'_, ModelCatalog> {
        self.catalog.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn best_healthy(&self, kind: TransportKind) -> Option<&TransportConnection> {
        self.transports
            .iter()
            .filter(|t| t.descriptor().kind == kind && t.is_healthy())
            .min_by_key(|t| t.descriptor().priority)
    }

    /// The transport the next call would use.
    pub fn select_transport(&self) -> Result<TransportConnection, ConnectionError> {
        let chosen = if self.prefer_local() {
            self.best_healthy(TransportKind::Local)
                .or_else(|| self.best_healthy(TransportKind::Cloud))
        } else {
            self.best_healthy(TransportKind::Cloud)
                .or_else(|| self.best_healthy(TransportKind::Local))
        };
        chosen.cloned().ok_or(ConnectionError::NoProvider)
    }

    /// Stream a reply to `prompt` from the selected model over the selected
    /// transport.
    pub async fn send_chat_message(
        &self,
        prompt: &str,
        conversation_id: &str,
        history: &[ChatMessage],
    ) -> Result<ChatStream, ConnectionError> {
        let transport = self.select_transport()?;
        let model = self.selected_model().ok_or(ConnectionError::NoModelSelected)?;
        debug!(
            "Routing chat for {conversation_id} to {} with {model}",
            transport.endpoint_identifier()
        );
        transport
            .stream_chat(prompt, &model, conversation_id, history)
            .await
    }

    /// Establish every transport concurrently, then refresh the model list.
    /// Returns the number of healthy transports.
    pub async fn connect_all(&self) -> usize {
        let results = join_all(self.transports.iter().map(|t| t.establish_connection())).await;
        for (transport, result) in self.transports.iter().zip(&results) {
            if let Err(e) = result {
                warn!("Could not connect {}: {e}", transport.endpoint_identifier());
            }
        }
        let healthy = self.transports.iter().filter(|t| t.is_healthy()).count();
        if healthy > 0 {
            self.refresh_models().await;
        }
        info!("{healthy} of {} transport(s) connected", self.transports.len());
        healthy
    }

    /// Merge the model names of all healthy transports into one sorted,
    /// de-duplicated list. Selects the first model when none is selected.
    pub async fn refresh_models(&self) -> Vec<String> {
        let healthy: Vec<&TransportConnection> =
            self.transports.iter().filter(|t| t.is_healthy()).collect();
        let results = join_all(healthy.iter().map(|t| t.list_models())).await;

        let mut merged = BTreeSet::new();
        for (transport, result) in healthy.iter().zip(results) {
            match result {
                Ok(models) => merged.extend(models),
                Err(e) => warn!(
                    "Could not list models on {}: {e}",
                    transport.endpoint_identifier()
                ),
            }
        }

        let mut catalog = self.catalog();
        catalog.available = merged.into_iter().collect();
        if catalog.selected.is_none()
            && let Some(first) = catalog.available.first()
        {
            info!("Auto-selected model {first}");
            catalog.selected = Some(first.clone());
        }
        catalog.available.clone()
    }

    pub fn select_model(&self, model: impl Into<String>) {
        self.catalog().selected = Some(model.into());
    }

    pub fn selected_model(&self) -> Option<String> {
        self.catalog().selected.clone()
    }

    pub fn available_models(&self) -> Vec<String> {
        self.catalog().available.clone()
    }

    /// Close every transport and stop the tunnel.
    pub fn shutdown(&self) {
        for transport in &self.transports {
            transport.close_connection();
        }
        if let Some(tunnel) = &self.tunnel {
            tunnel.disconnect();
        }
    }

    pub fn status(&self) -> RouterStatus {
        let transports: Vec<TransportStatus> = self
            .transports
            .iter()
            .map(|t| TransportStatus {
                descriptor: t.descriptor(),
                health: t.health(),
                circuit_retry_in: t.circuit_remaining(),
            })
            .collect();
        let active = self.select_transport().ok();
        let message = status_message(active.as_ref(), &transports);
        let catalog = self.catalog();

        RouterStatus {
            active: active.map(|t| t.descriptor().kind),
            prefer_local: self.prefer_local(),
            selected_model: catalog.selected.clone(),
            available_models: catalog.available.clone(),
            transports,
            tunnel: self.tunnel.as_ref().map(TunnelSupervisor::state),
            message,
        }
    }
}

fn status_message(active: Option<&TransportConnection>, transports: &[TransportStatus]) -> String {
    if let Some(active) = active {
        return format!("Connected via {}", active.endpoint_identifier());
    }
    if transports.is_empty() {
        return "No transports configured".to_string();
    }
    if let Some(retry_in) = transports.iter().filter_map(|t| t.circuit_retry_in).min() {
        return format!(
            "Backend is {}",
            ConnectionError::CircuitOpen { retry_in }
        );
    }
    match transports
        .iter()
        .find_map(|t| t.health.last_error.as_deref())
    {
        Some(error) => format!("No provider available: {error}"),
        None => "Not connected".to_string(),
    }
}
