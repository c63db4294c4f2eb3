//! Engine configuration.
//!
//! Every component takes a plain config struct with sensible defaults and
//! `with_*` builder methods. [`EngineConfig`] gathers them and can be loaded
//! from a JSON file, with a handful of `TETHER_*` environment variables
//! layered on top:
//!
//! ```json
//! {
//!   "backend_url": "http://localhost:11434",
//!   "relay_url": "https://relay.example.com",
//!   "prefer_local": true,
//!   "transport": { "probe_timeout": 2.5, "retry": { "max_attempts": 3 } },
//!   "tunnel": { "binary_name": "chisel", "keepalive": "25s" }
//! }
//! ```
//!
//! Durations are expressed in (fractional) seconds.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::DEFAULT_BACKEND_URL;
use crate::api::retry::RetryPolicy;
use crate::error::ConnectionError;
use crate::status::DEFAULT_BUS_CAPACITY;

/// Serde helpers for `Duration` fields stored as fractional seconds.
pub mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(value.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom)
    }
}

// ── Transport ──────────────────────────────────────────────────────

/// Per-transport timing and reconnect behaviour.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Bound on a single health probe, also used as the connect timeout.
    #[serde(with = "duration_secs")]
    pub probe_timeout: Duration,
    /// Bound on non-streaming requests such as the model listing.
    #[serde(with = "duration_secs")]
    pub request_timeout: Duration,
    pub heartbeat_enabled: bool,
    #[serde(with = "duration_secs")]
    pub heartbeat_interval: Duration,
    /// Schedule reconnects automatically after failures.
    pub auto_reconnect: bool,
    pub retry: RetryPolicy,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            probe_timeout: Duration::from_secs(5),
            request_timeout: Duration::from_secs(120),
            heartbeat_enabled: true,
            heartbeat_interval: Duration::from_secs(30),
            auto_reconnect: true,
            retry: RetryPolicy::transport(),
        }
    }
}

impl TransportConfig {
    pub fn with_probe_timeout(mut self, timeout: Duration) -> Self {
        self.probe_timeout = timeout;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Enable the heartbeat with the given interval.
    pub fn with_heartbeat(mut self, interval: Duration) -> Self {
        self.heartbeat_enabled = true;
        self.heartbeat_interval = interval;
        self
    }

    pub fn without_heartbeat(mut self) -> Self {
        self.heartbeat_enabled = false;
        self
    }

    pub fn with_auto_reconnect(mut self, enabled: bool) -> Self {
        self.auto_reconnect = enabled;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }
}

// ── Tunnel ─────────────────────────────────────────────────────────

/// Reverse-tunnel subprocess settings.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct TunnelConfig {
    /// Explicit binary location. Skips the search when set.
    pub binary_path: Option<PathBuf>,
    /// File name searched for when `binary_path` is unset.
    pub binary_name: String,
    /// Relay the tunnel connects to. Filled from [`EngineConfig::relay_url`].
    #[serde(skip)]
    pub relay_url: String,
    /// Local backend the tunnel exposes. Filled from [`EngineConfig::backend_url`].
    #[serde(skip)]
    pub backend_url: String,
    /// Passed verbatim as `--keepalive`.
    pub keepalive: String,
    pub retry: RetryPolicy,
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            binary_path: None,
            binary_name: "chisel".to_string(),
            relay_url: String::new(),
            backend_url: DEFAULT_BACKEND_URL.to_string(),
            keepalive: "30s".to_string(),
            retry: RetryPolicy::tunnel(),
        }
    }
}

impl TunnelConfig {
    pub fn new(relay_url: impl Into<String>) -> Self {
        Self {
            relay_url: relay_url.into(),
            ..Self::default()
        }
    }

    pub fn with_binary_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.binary_path = Some(path.into());
        self
    }

    pub fn with_binary_name(mut self, name: impl Into<String>) -> Self {
        self.binary_name = name.into();
        self
    }

    pub fn with_backend_url(mut self, url: impl Into<String>) -> Self {
        self.backend_url = url.into();
        self
    }

    pub fn with_keepalive(mut self, keepalive: impl Into<String>) -> Self {
        self.keepalive = keepalive.into();
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }
}

// ── Engine ─────────────────────────────────────────────────────────

/// Top-level configuration consumed by [`EngineBuilder`](crate::platform::EngineBuilder).
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Base URL of the local backend.
    pub backend_url: String,
    /// Cloud relay. No cloud transport is created without one.
    pub relay_url: Option<String>,
    /// Prefer the local transport whenever it is healthy.
    pub prefer_local: bool,
    /// Run the reverse tunnel (when the platform supports it).
    pub tunnel_enabled: bool,
    pub transport: TransportConfig,
    pub tunnel: TunnelConfig,
    pub status_bus_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            backend_url: DEFAULT_BACKEND_URL.to_string(),
            relay_url: None,
            prefer_local: false,
            tunnel_enabled: true,
            transport: TransportConfig::default(),
            tunnel: TunnelConfig::default(),
            status_bus_capacity: DEFAULT_BUS_CAPACITY,
        }
    }
}

impl EngineConfig {
    /// Load from a JSON file. Missing fields take their defaults.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConnectionError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| {
            ConnectionError::Config(format!("cannot read {}: {e}", path.display()))
        })?;
        serde_json::from_str(&raw)
            .map_err(|e| ConnectionError::Config(format!("invalid {}: {e}", path.display())))
    }

    /// Layer the `TETHER_*` environment variables over this config.
    pub fn with_env_overrides(self) -> Result<Self, ConnectionError> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    /// Layer overrides from `lookup` (an environment-like key/value source).
    pub fn apply_overrides(
        mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, ConnectionError> {
        let lookup = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(url) = lookup("TETHER_BACKEND_URL") {
            self.backend_url = url;
        }
        if let Some(url) = lookup("TETHER_RELAY_URL") {
            self.relay_url = Some(url);
        }
        if let Some(raw) = lookup("TETHER_PREFER_LOCAL") {
            self.prefer_local = parse_bool(&raw).ok_or_else(|| {
                ConnectionError::Config(format!("TETHER_PREFER_LOCAL: expected a boolean, got '{raw}'"))
            })?;
        }
        if let Some(path) = lookup("TETHER_TUNNEL_BINARY") {
            self.tunnel.binary_path = Some(PathBuf::from(path));
        }
        Ok(self)
    }

    pub fn with_backend_url(mut self, url: impl Into<String>) -> Self {
        self.backend_url = url.into();
        self
    }

    pub fn with_relay_url(mut self, url: impl Into<String>) -> Self {
        self.relay_url = Some(url.into());
        self
    }

    pub fn with_prefer_local(mut self, prefer: bool) -> Self {
        self.prefer_local = prefer;
        self
    }

    pub fn with_tunnel_enabled(mut self, enabled: bool) -> Self {
        self.tunnel_enabled = enabled;
        self
    }

    pub fn with_transport(mut self, transport: TransportConfig) -> Self {
        self.transport = transport;
        self
    }

    pub fn with_tunnel(mut self, tunnel: TunnelConfig) -> Self {
        self.tunnel = tunnel;
        self
    }

    /// Tunnel settings with the relay and backend URLs filled in, or `None`
    /// when the tunnel is disabled or no relay is configured.
    pub fn tunnel_config(&self) -> Option<TunnelConfig> {
        if !self.tunnel_enabled {
            return None;
        }
        let relay_url = self.relay_url.clone()?;
        Some(TunnelConfig {
            relay_url,
            backend_url: self.backend_url.clone(),
            ..self.tunnel.clone()
        })
    }
}

fn parse_bool(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
