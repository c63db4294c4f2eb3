//! Transports: one concrete way of reaching an inference backend.
//!
//! A [`TransportConnection`] owns the lifecycle of a single logical
//! connection. What differs between transports (the base URL, whether a
//! credential is mandatory, whether a tunnel must be up) lives behind the
//! [`Endpoint`] capability trait, with two implementations:
//!
//! - [`DirectHttpEndpoint`]: a locally reachable backend process.
//! - [`TunneledEndpoint`]: the cloud relay, reachable only while the reverse
//!   tunnel is up and a bearer token is available.
//!
//! # State machine
//!
//! ```text
//! Disconnected ──▶ Connecting ──▶ Connected ──▶ Streaming
//!       ▲              │  ▲           │  ▲          │
//!       │              ▼  │ backoff   │  └──────────┤ complete
//!       └────────────  Error ◀────────┴─────────────┘ failure
//!         close()
//! ```

mod connection;
mod endpoint;

pub use connection::{ChatStream, TransportConnection};
pub use endpoint::{DirectHttpEndpoint, TunneledEndpoint};

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use crate::error::ConnectionError;
use crate::tunnel::TunnelProcessState;

/// Lifecycle state of one transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Streaming,
    Error,
}

impl ConnectionState {
    /// Connected or streaming.
    pub fn is_healthy(self) -> bool {
        matches!(self, ConnectionState::Connected | ConnectionState::Streaming)
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionState::Disconnected => write!(f, "disconnected"),
            ConnectionState::Connecting => write!(f, "connecting"),
            ConnectionState::Connected => write!(f, "connected"),
            ConnectionState::Streaming => write!(f, "streaming"),
            ConnectionState::Error => write!(f, "error"),
        }
    }
}

/// Immutable health snapshot, replaced on every transition.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConnectionHealth {
    pub state: ConnectionState,
    pub endpoint: String,
    pub last_error: Option<String>,
    pub last_latency: Option<Duration>,
    pub last_activity: DateTime<Utc>,
}

impl ConnectionHealth {
    pub fn initial(endpoint: impl Into<String>) -> Self {
        Self {
            state: ConnectionState::Disconnected,
            endpoint: endpoint.into(),
            last_error: None,
            last_latency: None,
            last_activity: Utc::now(),
        }
    }

    pub fn is_healthy(&self) -> bool {
        self.state.is_healthy()
    }

    /// A new snapshot in `state`. The error is cleared unless the new state
    /// is `Error`; latency is carried over.
    pub(crate) fn transition(&self, state: ConnectionState) -> Self {
        Self {
            state,
            endpoint: self.endpoint.clone(),
            last_error: if state == ConnectionState::Error {
                self.last_error.clone()
            } else {
                None
            },
            last_latency: self.last_latency,
            last_activity: Utc::now(),
        }
    }

    pub(crate) fn with_error(mut self, error: impl Into<String>) -> Self {
        self.last_error = Some(error.into());
        self
    }

    pub(crate) fn with_latency(mut self, latency: Duration) -> Self {
        self.last_latency = Some(latency);
        self
    }
}

/// Which family a transport belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    Local,
    Cloud,
}

impl std::fmt::Display for TransportKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportKind::Local => write!(f, "local"),
            TransportKind::Cloud => write!(f, "cloud"),
        }
    }
}

/// Static description of a transport. Lower `priority` wins within a kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TransportDescriptor {
    pub kind: TransportKind,
    pub priority: u32,
}

/// Capability interface for the part of a transport that varies by variant.
///
/// Implementations are synchronous and cheap: they are consulted before every
/// network call.
pub trait Endpoint: Send + Sync {
    fn descriptor(&self) -> TransportDescriptor;

    /// Base URL requests are sent to, without a trailing slash.
    fn base_url(&self) -> &str;

    /// Human-readable identifier used in health snapshots and logs.
    fn identifier(&self) -> String {
        format!("{} ({})", self.descriptor().kind, self.base_url())
    }

    /// Bearer token for the next request. `Err` when the endpoint requires
    /// one and none is available.
    fn authorization(&self) -> Result<Option<String>, ConnectionError>;

    /// Preconditions checked before any network call. A failure here leaves
    /// the transport waiting for the precondition rather than backing off.
    fn preflight(&self) -> Result<(), ConnectionError> {
        Ok(())
    }

    /// Called when the endpoint rejected the credential.
    fn auth_rejected(&self) {}

    /// Tunnel status the endpoint depends on, if any.
    fn tunnel_status(&self) -> Option<watch::Receiver<TunnelProcessState>> {
        None
    }
}
