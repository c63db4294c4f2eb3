//! Convenience re-exports for common `tether-rs` types.
//!
//! Meant to be glob-imported by applications embedding the engine:
//!
//! ```ignore
//! use tether_rs::prelude::*;
//! ```
//!
//! Pulls in the engine builder and config, the router and transport types,
//! stream events, credential providers and the status bus, plus
//! [`StreamExt`] so a [`ChatStream`] can be consumed with `.next().await`.
//! Lower-level pieces (the framer, backoff internals, output scanning) are
//! left to their modules.

// ── Engine ──────────────────────────────────────────────────────────
pub use crate::config::{EngineConfig, TransportConfig, TunnelConfig};
pub use crate::platform::{Engine, EngineBuilder, HostPlatform, PlatformCapabilities};
pub use crate::{ChatMessage, ConnectionError, MessageRole};

// ── Connections ─────────────────────────────────────────────────────
pub use crate::api::retry::RetryPolicy;
pub use crate::api::router::{ConnectionRouter, RouterStatus};
pub use crate::api::streaming::{StreamEvent, collect_text};
pub use crate::transport::{
    ChatStream, ConnectionHealth, ConnectionState, DirectHttpEndpoint, TransportConnection,
    TransportKind, TunneledEndpoint,
};
pub use crate::tunnel::{TunnelProcessState, TunnelSupervisor};

// ── Collaborators ───────────────────────────────────────────────────
pub use crate::credentials::{CredentialProvider, EnvToken, NoCredentials, StaticToken};
pub use crate::error::{DefaultErrorClassifier, ErrorClassifier};
pub use crate::status::{StatusBus, StatusEvent};

pub use futures::StreamExt;
