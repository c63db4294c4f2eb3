//! Error taxonomy for connection, streaming and tunnel failures.
//!
//! Every fallible engine operation returns a [`ConnectionError`]. Whether a
//! failure is worth retrying is decided by an [`ErrorClassifier`]; the
//! [`DefaultErrorClassifier`] follows this table:
//!
//! | Variant | Retryable |
//! |---------|-----------|
//! | `Connectivity` (DNS, refused, timeout) | yes |
//! | `Protocol` (malformed response, unexpected status) | yes, unless 401/403 |
//! | `Auth` (missing, expired or rejected credential) | no |
//! | `Process` (tunnel failed to launch or exited) | yes |
//! | `Parse` (single malformed stream line) | recovered locally |
//! | `Config` (malformed endpoint, bad settings) | no |

use std::time::Duration;

use thiserror::Error;

/// Errors surfaced by transports, the router and the tunnel supervisor.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConnectionError {
    /// The endpoint could not be reached (DNS, refused, timeout, reset).
    #[error("connection failed: {0}")]
    Connectivity(String),
    /// The endpoint answered, but not with what the protocol expects.
    #[error("{}", protocol_message(.status, .message))]
    Protocol {
        status: Option<u16>,
        message: String,
    },
    /// The credential was missing, expired or rejected.
    #[error("authentication failed: {0}")]
    Auth(String),
    /// The tunnel subprocess failed to launch or went away.
    #[error("tunnel process error: {0}")]
    Process(String),
    /// A single stream line could not be decoded.
    #[error("malformed stream line: {0}")]
    Parse(String),
    /// The circuit breaker is open; no network call was made.
    #[error("{}", circuit_message(.retry_in))]
    CircuitOpen { retry_in: Duration },
    /// No transport is currently healthy.
    #[error("no provider available: every transport is disconnected")]
    NoProvider,
    /// A chat was requested before any model was selected.
    #[error("no model selected")]
    NoModelSelected,
    /// The connection was closed while the operation was in flight.
    #[error("connection closed")]
    Closed,
    /// Invalid configuration, including malformed endpoint URLs.
    #[error("invalid configuration: {0}")]
    Config(String),
}

fn protocol_message(status: &Option<u16>, message: &str) -> String {
    match status {
        Some(code) => format!("unexpected response (HTTP {code}): {message}"),
        None => format!("unexpected response: {message}"),
    }
}

fn circuit_message(retry_in: &Duration) -> String {
    let secs = retry_in.as_secs();
    if secs >= 60 {
        let minutes = secs.div_ceil(60);
        let unit = if minutes == 1 { "minute" } else { "minutes" };
        format!("temporarily unavailable, retry in {minutes} {unit}")
    } else {
        let secs = secs.max(1);
        let unit = if secs == 1 { "second" } else { "seconds" };
        format!("temporarily unavailable, retry in {secs} {unit}")
    }
}

impl ConnectionError {
    /// Map an HTTP status and response body to the matching variant.
    pub fn from_status(status: u16, body: impl Into<String>) -> Self {
        let body = body.into();
        match status {
            401 | 403 => ConnectionError::Auth(format!("HTTP {status}: {body}")),
            _ => ConnectionError::Protocol {
                status: Some(status),
                message: body,
            },
        }
    }

    /// Short category name used in logs and status events.
    pub fn category(&self) -> &'static str {
        match self {
            ConnectionError::Connectivity(_) => "connectivity",
            ConnectionError::Protocol { .. } => "protocol",
            ConnectionError::Auth(_) => "auth",
            ConnectionError::Process(_) => "process",
            ConnectionError::Parse(_) => "parse",
            ConnectionError::CircuitOpen { .. } => "circuit_open",
            ConnectionError::NoProvider => "no_provider",
            ConnectionError::NoModelSelected => "no_model",
            ConnectionError::Closed => "closed",
            ConnectionError::Config(_) => "config",
        }
    }

    /// Whether the taxonomy considers this failure transient.
    pub fn is_retryable(&self) -> bool {
        match self {
            ConnectionError::Connectivity(_)
            | ConnectionError::Process(_)
            | ConnectionError::Parse(_)
            | ConnectionError::Closed => true,
            ConnectionError::Protocol { status, .. } => !matches!(status, Some(401 | 403)),
            ConnectionError::Auth(_)
            | ConnectionError::Config(_)
            | ConnectionError::CircuitOpen { .. }
            | ConnectionError::NoProvider
            | ConnectionError::NoModelSelected => false,
        }
    }
}

impl From<reqwest::Error> for ConnectionError {
    fn from(e: reqwest::Error) -> Self {
        if let Some(status) = e.status() {
            return ConnectionError::from_status(status.as_u16(), e.to_string());
        }
        if e.is_builder() {
            return ConnectionError::Config(format!("invalid request: {e}"));
        }
        if e.is_decode() {
            return ConnectionError::Protocol {
                status: None,
                message: format!("failed to decode response: {e}"),
            };
        }
        ConnectionError::Connectivity(format!("request failed: {e}"))
    }
}

// ── Classification ─────────────────────────────────────────────────

/// Outcome of classifying a failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Classification {
    pub is_retryable: bool,
    pub user_friendly_message: String,
}

/// Decides retry-versus-circuit-open for a failure.
///
/// Transports consult the classifier on every failed connect, heartbeat or
/// stream. Implement it to plug in product-specific rules (for example,
/// treating a particular relay status code as permanent).
pub trait ErrorClassifier: Send + Sync {
    fn classify(&self, error: &ConnectionError) -> Classification;
}

/// Classifier that follows the taxonomy table in the module docs.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultErrorClassifier;

impl ErrorClassifier for DefaultErrorClassifier {
    fn classify(&self, error: &ConnectionError) -> Classification {
        let is_retryable = match error {
            // Unstatused protocol failures carry only a message; fall back to
            // the string heuristics.
            ConnectionError::Protocol {
                status: None,
                message,
            } => !is_permanent_error(message) || is_transient_error(message),
            other => other.is_retryable(),
        };

        let user_friendly_message = match error {
            ConnectionError::Connectivity(_) => {
                "Cannot reach the backend. Check that it is running and reachable.".to_string()
            }
            ConnectionError::Protocol { .. } => {
                "The backend returned an unexpected response.".to_string()
            }
            ConnectionError::Auth(_) => "Your session has expired. Please sign in again.".to_string(),
            ConnectionError::Process(_) => "The tunnel is not running. Reconnecting.".to_string(),
            ConnectionError::Parse(_) => "Part of the response could not be read.".to_string(),
            ConnectionError::CircuitOpen { .. } => {
                format!("The backend is {error}.")
            }
            ConnectionError::NoProvider => "No backend is available right now.".to_string(),
            ConnectionError::NoModelSelected => "Select a model first.".to_string(),
            ConnectionError::Closed => "The connection was closed.".to_string(),
            ConnectionError::Config(_) => {
                "The connection settings are invalid. Check the backend address.".to_string()
            }
        };

        Classification {
            is_retryable,
            user_friendly_message,
        }
    }
}

/// Whether an error string indicates a transient (retryable) failure.
pub fn is_transient_error(error: &str) -> bool {
    let transient_statuses = ["429", "500", "502", "503", "504"];
    if transient_statuses
        .iter()
        .any(|s| error.contains(&format!("HTTP {s}")))
    {
        return true;
    }

    let lower = error.to_lowercase();
    [
        "request failed:",
        "connection reset",
        "connection refused",
        "timed out",
        "timeout",
        "broken pipe",
        "dns",
        "network",
    ]
    .iter()
    .any(|p| lower.contains(p))
}

/// Whether an error string indicates a permanent (non-retryable) failure.
pub fn is_permanent_error(error: &str) -> bool {
    [
        "HTTP 400",
        "HTTP 401",
        "HTTP 403",
        "HTTP 404",
        "HTTP 422",
        "invalid",
        "bad request",
        "unauthorized",
    ]
    .iter()
    .any(|p| error.contains(p))
}
