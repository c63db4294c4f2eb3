//! Reverse-tunnel subprocess supervision.
//!
//! [`TunnelSupervisor`] launches a chisel-compatible binary that forwards a
//! relay-assigned port to the local backend:
//!
//! ```text
//! <binary> client <relay-host:port> R:0:localhost:<backend-port> --auth <token> --keepalive 30s
//! ```
//!
//! The child's output has no formal schema. A stdout line that is a JSON
//! object `{"status":"connected","port":N}` is taken as an authoritative
//! handshake; otherwise lines are scanned for a port announcement and for
//! connection keywords. Error keywords on stderr, or any exit the supervisor
//! did not ask for, tear the process down and schedule exactly one restart
//! with exponential backoff.
//!
//! Each spawned process gets a generation number. Output readers and the exit
//! monitor carry the generation they were started with, so late signals from
//! a process that was already torn down are ignored.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, LazyLock, Mutex, MutexGuard, Weak};

use regex::Regex;
use reqwest::Url;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::DEFAULT_BACKEND_PORT;
use crate::api::retry::RetryState;
use crate::config::TunnelConfig;
use crate::credentials::CredentialProvider;
use crate::error::ConnectionError;
use crate::status::{StatusBus, StatusEvent};
use crate::transport::ConnectionState;

/// Observable state of the tunnel subprocess.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TunnelProcessState {
    pub pid: Option<u32>,
    /// Set only once a health signal carrying a port has been parsed.
    pub assigned_port: Option<u16>,
    pub is_connected: bool,
}

// ── Output scanning ────────────────────────────────────────────────

static PORT_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\bport[\s:=#]*(\d{1,5})\b").expect("port pattern is a valid regex")
});

const CONNECTED_KEYWORDS: &[&str] = &["connected", "tunnel established", "tunnel ready"];
const ERROR_KEYWORDS: &[&str] = &["error", "fail", "refused"];

/// A connection signal found in one line of output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct TunnelSignal {
    pub port: Option<u16>,
}

#[derive(Deserialize)]
struct Handshake {
    status: String,
    port: Option<u16>,
}

/// Scan one output line for a connection signal.
pub(crate) fn scan_output_line(line: &str) -> Option<TunnelSignal> {
    let line = line.trim();
    if line.starts_with('{')
        && let Ok(handshake) = serde_json::from_str::<Handshake>(line)
    {
        return handshake
            .status
            .eq_ignore_ascii_case("connected")
            .then_some(TunnelSignal {
                port: handshake.port.filter(|p| *p != 0),
            });
    }

    let lower = line.to_lowercase();
    if lower.contains("disconnected") || is_error_line(&lower) {
        return None;
    }

    if let Some(port) = PORT_PATTERN
        .captures(line)
        .and_then(|c| c.get(1))
        .and_then(|m| m.as_str().parse::<u16>().ok())
        .filter(|p| *p != 0)
    {
        return Some(TunnelSignal { port: Some(port) });
    }

    CONNECTED_KEYWORDS
        .iter()
        .any(|k| lower.contains(k))
        .then_some(TunnelSignal { port: None })
}

/// Whether a stderr line reports a failure.
pub(crate) fn is_error_line(line: &str) -> bool {
    let lower = line.to_lowercase();
    ERROR_KEYWORDS.iter().any(|k| lower.contains(k))
}

// ── Endpoint derivation ────────────────────────────────────────────

/// Derive `host:port` of the relay and the local backend port.
pub(crate) fn tunnel_endpoints(
    relay_url: &str,
    backend_url: &str,
) -> Result<(String, u16), ConnectionError> {
    let relay = Url::parse(relay_url.trim())
        .map_err(|e| ConnectionError::Config(format!("malformed relay url '{relay_url}': {e}")))?;
    let host = relay
        .host_str()
        .ok_or_else(|| ConnectionError::Config(format!("relay url '{relay_url}' has no host")))?;
    let port = relay.port_or_known_default().ok_or_else(|| {
        ConnectionError::Config(format!("relay url '{relay_url}' has no port"))
    })?;

    let local_port = match Url::parse(backend_url.trim()) {
        Ok(url) => url.port().unwrap_or(DEFAULT_BACKEND_PORT),
        Err(e) => {
            return Err(ConnectionError::Config(format!(
                "malformed backend url '{backend_url}': {e}"
            )));
        }
    };

    Ok((format!("{host}:{port}"), local_port))
}

// ── Binary resolution ──────────────────────────────────────────────

/// Platform file name of the tunnel binary.
pub fn binary_file_name(name: &str, os: &str) -> String {
    if os == "windows" && !name.ends_with(".exe") {
        format!("{name}.exe")
    } else {
        name.to_string()
    }
}

/// Directories searched for the tunnel binary, in order, before `PATH`.
pub fn search_dirs(os: &str, home: Option<&Path>, exe_dir: Option<&Path>) -> Vec<PathBuf> {
    let mut dirs = Vec::new();
    if let Some(exe_dir) = exe_dir {
        dirs.push(exe_dir.to_path_buf());
        dirs.push(exe_dir.join("bin"));
        if os == "macos" {
            dirs.push(exe_dir.join("../Resources"));
        }
    }
    match os {
        "macos" => {
            dirs.push(PathBuf::from("/opt/homebrew/bin"));
            dirs.push(PathBuf::from("/usr/local/bin"));
            if let Some(home) = home {
                dirs.push(home.join(".local/bin"));
            }
        }
        "windows" => {
            if let Some(home) = home {
                dirs.push(home.join("AppData").join("Local").join("tether").join("bin"));
            }
        }
        _ => {
            if let Some(home) = home {
                dirs.push(home.join(".local/bin"));
            }
            dirs.push(PathBuf::from("/usr/local/bin"));
            dirs.push(PathBuf::from("/usr/bin"));
        }
    }
    dirs
}

/// Resolve the tunnel binary: explicit path, then the platform search
/// directories, then `PATH`.
pub fn resolve_binary(config: &TunnelConfig) -> Result<PathBuf, ConnectionError> {
    if let Some(path) = &config.binary_path {
        return if path.is_file() {
            Ok(path.clone())
        } else {
            Err(ConnectionError::Process(format!(
                "tunnel binary not found at {}",
                path.display()
            )))
        };
    }

    let os = std::env::consts::OS;
    let file_name = binary_file_name(&config.binary_name, os);
    let home = std::env::var_os("HOME")
        .or_else(|| std::env::var_os("USERPROFILE"))
        .map(PathBuf::from);
    let exe_dir = std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(Path::to_path_buf));

    let path_dirs = std::env::var_os("PATH")
        .map(|p| std::env::split_paths(&p).collect::<Vec<_>>())
        .unwrap_or_default();

    search_dirs(os, home.as_deref(), exe_dir.as_deref())
        .into_iter()
        .chain(path_dirs)
        .map(|dir| dir.join(&file_name))
        .find(|candidate| candidate.is_file())
        .ok_or_else(|| {
            ConnectionError::Process(format!("tunnel binary '{file_name}' not found"))
        })
}

// ── Supervisor ─────────────────────────────────────────────────────

struct TunnelRuntime {
    generation: u64,
    /// Set by `connect`, cleared by `disconnect`. Disconnections are only
    /// retried while active.
    active: bool,
    kill: Option<oneshot::Sender<()>>,
    readers: Vec<JoinHandle<()>>,
    reconnect: Option<JoinHandle<()>>,
    retry: RetryState,
}

struct Inner {
    config: TunnelConfig,
    credentials: Arc<dyn CredentialProvider>,
    bus: StatusBus,
    endpoint: String,
    state: watch::Sender<TunnelProcessState>,
    runtime: Mutex<TunnelRuntime>,
    reconnects_scheduled: AtomicU64,
}

/// Starts, monitors and restarts the reverse-tunnel subprocess.
///
/// The supervisor is the only owner of the child process. Cloning shares the
/// same supervisor.
#[derive(Clone)]
pub struct TunnelSupervisor {
    inner: Arc<Inner>,
}

impl TunnelSupervisor {
    pub fn new(
        config: TunnelConfig,
        credentials: Arc<dyn CredentialProvider>,
        bus: StatusBus,
    ) -> Self {
        let (state, _) = watch::channel(TunnelProcessState::default());
        let retry = RetryState::new(&config.retry);
        let endpoint = format!("tunnel ({})", config.relay_url);
        Self {
            inner: Arc::new(Inner {
                config,
                credentials,
                bus,
                endpoint,
                state,
                runtime: Mutex::new(TunnelRuntime {
                    generation: 0,
                    active: false,
                    kill: None,
                    readers: Vec::new(),
                    reconnect: None,
                    retry,
                }),
                reconnects_scheduled: AtomicU64::new(0),
            }),
        }
    }

    /// Launch the tunnel process. No-op while one is already running.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn connect(&self) -> Result<(), ConnectionError> {
        Inner::connect(&self.inner)
    }

    /// Stop the tunnel without scheduling a restart.
    pub fn disconnect(&self) {
        self.inner.disconnect();
    }

    pub fn state(&self) -> TunnelProcessState {
        self.inner.state.borrow().clone()
    }

    /// Watch the tunnel state. Transports gate their reachability on this.
    pub fn subscribe(&self) -> watch::Receiver<TunnelProcessState> {
        self.inner.state.subscribe()
    }

    pub fn has_pending_reconnect(&self) -> bool {
        self.inner
            .runtime()
            .reconnect
            .as_ref()
            .is_some_and(|h| !h.is_finished())
    }

    /// Total restarts scheduled since creation.
    pub fn reconnects_scheduled(&self) -> u64 {
        self.inner.reconnects_scheduled.load(Ordering::Relaxed)
    }

    pub fn retry_state(&self) -> RetryState {
        self.inner.runtime().retry
    }

    pub fn config(&self) -> &TunnelConfig {
        &self.inner.config
    }
}

impl Inner {
    fn runtime(&self) -> MutexGuard<'_, TunnelRuntime> {
        self.runtime.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn connect(self: &Arc<Self>) -> Result<(), ConnectionError> {
        let mut runtime = self.runtime();
        if runtime.kill.is_some() {
            debug!("Tunnel already running");
            return Ok(());
        }
        if let Some(pending) = runtime.reconnect.take() {
            pending.abort();
        }

        // A first connect fails fast. Once supervising, setup failures are
        // retried like any other launch failure.
        let (binary, args) = match self.launch_command() {
            Ok(command) => command,
            Err(err) => {
                if runtime.active {
                    warn!("Tunnel restart failed: {err}");
                    self.publish(ConnectionState::Error, Some(err.to_string()));
                    self.schedule_reconnect(&mut runtime);
                }
                return Err(err);
            }
        };
        runtime.active = true;
        let redacted: Vec<&str> = args
            .iter()
            .enumerate()
            .map(|(i, a)| if i == 4 { "***" } else { a.as_str() })
            .collect();
        info!("Starting tunnel: {} {}", binary.display(), redacted.join(" "));

        let mut child = match Command::new(&binary)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
        {
            Ok(child) => child,
            Err(e) => {
                let err = ConnectionError::Process(format!(
                    "failed to launch {}: {e}",
                    binary.display()
                ));
                warn!("{err}");
                self.publish(ConnectionState::Error, Some(err.to_string()));
                self.schedule_reconnect(&mut runtime);
                return Err(err);
            }
        };

        runtime.generation += 1;
        let generation = runtime.generation;
        let pid = child.id();
        self.state.send_replace(TunnelProcessState {
            pid,
            assigned_port: None,
            is_connected: false,
        });
        self.publish(ConnectionState::Connecting, None);
        debug!("Tunnel process started (pid {pid:?}, generation {generation})");

        if let Some(stdout) = child.stdout.take() {
            let reader = self.spawn_reader(stdout, generation, Inner::on_stdout_line);
            runtime.readers.push(reader);
        }
        if let Some(stderr) = child.stderr.take() {
            let reader = self.spawn_reader(stderr, generation, Inner::on_stderr_line);
            runtime.readers.push(reader);
        }

        let (kill_tx, kill_rx) = oneshot::channel();
        runtime.kill = Some(kill_tx);
        let weak = Arc::downgrade(self);
        tokio::spawn(async move {
            tokio::select! {
                status = child.wait() => {
                    let reason = match status {
                        Ok(status) => format!("tunnel process exited ({status})"),
                        Err(e) => format!("tunnel process wait failed: {e}"),
                    };
                    if let Some(inner) = weak.upgrade() {
                        inner.handle_disconnection(generation, &reason);
                    }
                }
                _ = kill_rx => {
                    if let Err(e) = child.kill().await {
                        debug!("Tunnel kill failed: {e}");
                    }
                }
            }
        });

        Ok(())
    }

    /// Binary path and arguments for one launch. The token sits at index 4.
    fn launch_command(&self) -> Result<(PathBuf, Vec<String>), ConnectionError> {
        let binary = resolve_binary(&self.config)?;
        let (remote, local_port) = tunnel_endpoints(&self.config.relay_url, &self.config.backend_url)?;
        let token = self.credentials.access_token().ok_or_else(|| {
            ConnectionError::Auth("no access token available for the tunnel".into())
        })?;
        let args = vec![
            "client".to_string(),
            remote,
            format!("R:0:localhost:{local_port}"),
            "--auth".to_string(),
            token,
            "--keepalive".to_string(),
            self.config.keepalive.clone(),
        ];
        Ok((binary, args))
    }

    /// Feed each line of `pipe` to `on_line` until EOF. Undecodable bytes are
    /// replaced rather than ending the reader.
    fn spawn_reader<R>(
        self: &Arc<Self>,
        pipe: R,
        generation: u64,
        on_line: fn(&Arc<Inner>, u64, &str),
    ) -> JoinHandle<()>
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let weak = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut reader = BufReader::new(pipe);
            let mut buf = Vec::new();
            loop {
                buf.clear();
                match reader.read_until(b'\n', &mut buf).await {
                    Ok(0) => return,
                    Ok(_) => {
                        let Some(inner) = weak.upgrade() else { return };
                        let line = String::from_utf8_lossy(&buf);
                        on_line(&inner, generation, line.trim_end_matches(['\n', '\r']));
                    }
                    Err(e) => {
                        debug!("Tunnel output read failed: {e}");
                        return;
                    }
                }
            }
        })
    }

    fn on_stdout_line(self: &Arc<Self>, generation: u64, line: &str) {
        trace!("tunnel stdout: {line}");
        if let Some(signal) = scan_output_line(line) {
            self.mark_connected(generation, signal);
        }
    }

    fn on_stderr_line(self: &Arc<Self>, generation: u64, line: &str) {
        trace!("tunnel stderr: {line}");
        if is_error_line(line) {
            self.handle_disconnection(generation, &format!("tunnel reported: {}", line.trim()));
        } else if let Some(signal) = scan_output_line(line) {
            self.mark_connected(generation, signal);
        }
    }

    fn mark_connected(&self, generation: u64, signal: TunnelSignal) {
        let mut runtime = self.runtime();
        if runtime.generation != generation || runtime.kill.is_none() {
            return;
        }

        let current = self.state.borrow().clone();
        let next = TunnelProcessState {
            pid: current.pid,
            assigned_port: current.assigned_port.or(signal.port),
            is_connected: true,
        };
        if next == current {
            return;
        }
        runtime.retry.reset(&self.config.retry);
        self.state.send_replace(next.clone());
        drop(runtime);

        info!(
            "Tunnel connected (pid {:?}, port {:?})",
            next.pid, next.assigned_port
        );
        self.publish(ConnectionState::Connected, None);
    }

    /// Tear down the process for `generation` and schedule one restart.
    fn handle_disconnection(self: &Arc<Self>, generation: u64, reason: &str) {
        let mut runtime = self.runtime();
        if runtime.generation != generation || !runtime.active {
            trace!("Ignoring stale tunnel signal: {reason}");
            return;
        }
        warn!("Tunnel disconnected: {reason}");

        runtime.generation += 1;
        Self::stop_process(&mut runtime);
        self.state.send_replace(TunnelProcessState::default());
        self.publish(ConnectionState::Error, Some(reason.to_string()));
        self.schedule_reconnect(&mut runtime);
    }

    fn schedule_reconnect(self: &Arc<Self>, runtime: &mut TunnelRuntime) {
        if runtime.reconnect.as_ref().is_some_and(|h| !h.is_finished()) {
            debug!("Tunnel reconnect already pending");
            return;
        }
        let delay = runtime.retry.record_failure(&self.config.retry);
        self.reconnects_scheduled.fetch_add(1, Ordering::Relaxed);
        info!(
            "Tunnel reconnect {} scheduled in {delay:?}",
            runtime.retry.attempt_count
        );

        let weak: Weak<Inner> = Arc::downgrade(self);
        runtime.reconnect = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let Some(inner) = weak.upgrade() else { return };
            {
                let mut runtime = inner.runtime();
                runtime.reconnect = None;
                if !runtime.active {
                    return;
                }
            }
            if let Err(e) = inner.connect() {
                debug!("Tunnel reconnect attempt failed: {e}");
            }
        }));
    }

    fn disconnect(&self) {
        let mut runtime = self.runtime();
        runtime.active = false;
        runtime.generation += 1;
        Self::stop_process(&mut runtime);
        if let Some(pending) = runtime.reconnect.take() {
            pending.abort();
        }
        runtime.retry.reset(&self.config.retry);
        drop(runtime);

        self.state.send_replace(TunnelProcessState::default());
        self.publish(ConnectionState::Disconnected, None);
        info!("Tunnel stopped");
    }

    fn stop_process(runtime: &mut TunnelRuntime) {
        if let Some(kill) = runtime.kill.take() {
            let _ = kill.send(());
        }
        for reader in runtime.readers.drain(..) {
            reader.abort();
        }
    }

    fn publish(&self, state: ConnectionState, error: Option<String>) {
        let mut event = StatusEvent::new(state, self.endpoint.clone());
        if let Some(error) = error {
            event = event.with_error(error);
        }
        self.bus.publish(event);
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        let runtime = self.runtime.get_mut().unwrap_or_else(|e| e.into_inner());
        Inner::stop_process(runtime);
        if let Some(pending) = runtime.reconnect.take() {
            pending.abort();
        }
    }
}
