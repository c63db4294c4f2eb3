//! Process-wide status bus and message identifiers.
//!
//! Every connection and tunnel transition publishes a [`StatusEvent`] on the
//! shared [`StatusBus`]. Publishing is fire-and-forget: a bus with no
//! subscribers, or with subscribers that fell behind, never blocks or fails
//! the transition that published.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;

use crate::transport::{ConnectionHealth, ConnectionState};

/// Default number of buffered events per subscriber.
pub const DEFAULT_BUS_CAPACITY: usize = 256;

/// One observed transition.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatusEvent {
    pub state: ConnectionState,
    pub endpoint: String,
    pub error: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub latency_ms: Option<u64>,
}

impl StatusEvent {
    pub fn new(state: ConnectionState, endpoint: impl Into<String>) -> Self {
        Self {
            state,
            endpoint: endpoint.into(),
            error: None,
            timestamp: Utc::now(),
            latency_ms: None,
        }
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency_ms = Some(latency.as_millis() as u64);
        self
    }
}

impl From<&ConnectionHealth> for StatusEvent {
    fn from(health: &ConnectionHealth) -> Self {
        Self {
            state: health.state,
            endpoint: health.endpoint.clone(),
            error: health.last_error.clone(),
            timestamp: health.last_activity,
            latency_ms: health.last_latency.map(|l| l.as_millis() as u64),
        }
    }
}

/// Broadcast channel carrying [`StatusEvent`]s to observability consumers.
///
/// Cheap to clone; all clones publish into the same channel.
#[derive(Debug, Clone)]
pub struct StatusBus {
    sender: broadcast::Sender<StatusEvent>,
}

impl StatusBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Publish an event. Silently ignores send errors (no subscribers is fine).
    pub fn publish(&self, event: StatusEvent) {
        let _ = self.sender.send(event);
    }

    /// Subscribe to events published from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<StatusEvent> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for StatusBus {
    fn default() -> Self {
        Self::new(DEFAULT_BUS_CAPACITY)
    }
}

/// Generate a unique identifier for one streamed chat response.
pub fn generate_message_id() -> String {
    let ts = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    // Use a counter to handle sub-nanosecond calls.
    static COUNTER: AtomicU64 = AtomicU64::new(0);
    let count = COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("msg-{ts:x}-{count:04x}")
}
