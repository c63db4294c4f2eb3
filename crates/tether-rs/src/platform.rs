//! Platform capabilities and the engine composition root.
//!
//! Which components exist is decided once at startup from a
//! [`PlatformCapabilities`] implementation, never by compile-time file
//! substitution. [`EngineBuilder`] wires the transports, the tunnel
//! supervisor, the router and the status bus together and hands back an
//! [`Engine`] that owns them for the life of the process.

use std::sync::Arc;

use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::api::router::ConnectionRouter;
use crate::config::EngineConfig;
use crate::credentials::{CredentialProvider, NoCredentials};
use crate::error::{ConnectionError, DefaultErrorClassifier, ErrorClassifier};
use crate::status::{StatusBus, StatusEvent};
use crate::transport::{DirectHttpEndpoint, TransportConnection, TunneledEndpoint};
use crate::tunnel::TunnelSupervisor;

/// What the host platform lets the engine do.
pub trait PlatformCapabilities: Send + Sync {
    /// Operating system name, as in `std::env::consts::OS`.
    fn os(&self) -> &str;

    /// Whether subprocesses (and so the reverse tunnel) can be spawned.
    fn supports_tunnel(&self) -> bool;
}

/// The machine the engine runs on.
#[derive(Debug, Clone, Copy, Default)]
pub struct HostPlatform;

impl PlatformCapabilities for HostPlatform {
    fn os(&self) -> &str {
        std::env::consts::OS
    }

    fn supports_tunnel(&self) -> bool {
        matches!(self.os(), "linux" | "macos" | "windows" | "freebsd")
    }
}

/// A sandboxed host where no subprocess may be spawned.
#[derive(Debug, Clone)]
pub struct RestrictedPlatform {
    os: String,
}

impl RestrictedPlatform {
    pub fn new(os: impl Into<String>) -> Self {
        Self { os: os.into() }
    }
}

impl PlatformCapabilities for RestrictedPlatform {
    fn os(&self) -> &str {
        &self.os
    }

    fn supports_tunnel(&self) -> bool {
        false
    }
}

/// Builds an [`Engine`] from an [`EngineConfig`] and its collaborators.
pub struct EngineBuilder {
    config: EngineConfig,
    credentials: Arc<dyn CredentialProvider>,
    classifier: Arc<dyn ErrorClassifier>,
    platform: Arc<dyn PlatformCapabilities>,
    bus: Option<StatusBus>,
}

impl EngineBuilder {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config,
            credentials: Arc::new(NoCredentials),
            classifier: Arc::new(DefaultErrorClassifier),
            platform: Arc::new(HostPlatform),
            bus: None,
        }
    }

    pub fn with_credentials(mut self, credentials: Arc<dyn CredentialProvider>) -> Self {
        self.credentials = credentials;
        self
    }

    pub fn with_classifier(mut self, classifier: Arc<dyn ErrorClassifier>) -> Self {
        self.classifier = classifier;
        self
    }

    pub fn with_platform(mut self, platform: Arc<dyn PlatformCapabilities>) -> Self {
        self.platform = platform;
        self
    }

    /// Publish on an existing bus instead of creating one.
    pub fn with_status_bus(mut self, bus: StatusBus) -> Self {
        self.bus = Some(bus);
        self
    }

    pub fn build(self) -> Result<Engine, ConnectionError> {
        let config = self.config;
        let bus = self
            .bus
            .unwrap_or_else(|| StatusBus::new(config.status_bus_capacity));

        let local = TransportConnection::new(
            DirectHttpEndpoint::new(&config.backend_url, Arc::clone(&self.credentials))?,
            config.transport.clone(),
            Arc::clone(&self.classifier),
            bus.clone(),
        )?;
        let mut router = ConnectionRouter::new()
            .with_transport(local)
            .with_prefer_local(config.prefer_local);

        let tunnel = match config.tunnel_config() {
            Some(tunnel_config) if self.platform.supports_tunnel() => Some(TunnelSupervisor::new(
                tunnel_config,
                Arc::clone(&self.credentials),
                bus.clone(),
            )),
            Some(_) => {
                debug!(
                    "Tunnel disabled: subprocesses unsupported on {}",
                    self.platform.os()
                );
                None
            }
            None => None,
        };

        if let Some(relay_url) = &config.relay_url {
            let mut endpoint = TunneledEndpoint::new(relay_url, Arc::clone(&self.credentials))?;
            if let Some(tunnel) = &tunnel {
                endpoint = endpoint.with_tunnel(tunnel.subscribe());
            }
            router = router.with_transport(TransportConnection::new(
                endpoint,
                config.transport.clone(),
                Arc::clone(&self.classifier),
                bus.clone(),
            )?);
        }
        if let Some(tunnel) = &tunnel {
            router = router.with_tunnel(tunnel.clone());
        }

        info!(
            "Engine built with {} transport(s){}",
            router.transports().len(),
            if tunnel.is_some() { " and a tunnel" } else { "" }
        );
        Ok(Engine {
            router: Arc::new(router),
            tunnel,
            bus,
        })
    }
}

/// Process-scoped owner of every engine component.
pub struct Engine {
    pub router: Arc<ConnectionRouter>,
    tunnel: Option<TunnelSupervisor>,
    bus: StatusBus,
}

impl Engine {
    /// Start the tunnel (if any) and connect every transport.
    pub async fn start(&self) -> usize {
        if let Some(tunnel) = &self.tunnel
            && let Err(e) = tunnel.connect()
        {
            warn!("Tunnel did not start: {e}");
        }
        self.router.connect_all().await
    }

    /// Close all transports and stop the tunnel.
    pub fn shutdown(&self) {
        self.router.shutdown();
    }

    pub fn tunnel(&self) -> Option<&TunnelSupervisor> {
        self.tunnel.as_ref()
    }

    pub fn status_bus(&self) -> &StatusBus {
        &self.bus
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StatusEvent> {
        self.bus.subscribe()
    }
}
