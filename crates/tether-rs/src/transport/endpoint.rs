use std::sync::Arc;

use reqwest::Url;
use tokio::sync::watch;

use super::{Endpoint, TransportDescriptor, TransportKind};
use crate::credentials::CredentialProvider;
use crate::error::ConnectionError;
use crate::tunnel::TunnelProcessState;

/// Parse and normalize a base URL, rejecting anything that is not http(s).
pub(crate) fn normalize_base_url(raw: &str) -> Result<String, ConnectionError> {
    let url = Url::parse(raw.trim())
        .map_err(|e| ConnectionError::Config(format!("malformed endpoint '{raw}': {e}")))?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(ConnectionError::Config(format!(
            "unsupported scheme '{}' in endpoint '{raw}'",
            url.scheme()
        )));
    }
    if url.host_str().is_none() {
        return Err(ConnectionError::Config(format!(
            "endpoint '{raw}' has no host"
        )));
    }
    Ok(url.as_str().trim_end_matches('/').to_string())
}

/// A backend reachable directly over HTTP. A token is sent when available,
/// never required.
pub struct DirectHttpEndpoint {
    base_url: String,
    priority: u32,
    credentials: Arc<dyn CredentialProvider>,
}

impl DirectHttpEndpoint {
    pub fn new(
        base_url: &str,
        credentials: Arc<dyn CredentialProvider>,
    ) -> Result<Self, ConnectionError> {
        Ok(Self {
            base_url: normalize_base_url(base_url)?,
            priority: 0,
            credentials,
        })
    }

    pub fn with_priority(mut self, priority: u32) -> Self {
        self.priority = priority;
        self
    }
}

impl Endpoint for DirectHttpEndpoint {
    fn descriptor(&self) -> TransportDescriptor {
        TransportDescriptor {
            kind: TransportKind::Local,
            priority: self.priority,
        }
    }

    fn base_url(&self) -> &str {
        &self.base_url
    }

    fn authorization(&self) -> Result<Option<String>, ConnectionError> {
        Ok(self.credentials.access_token())
    }

    fn auth_rejected(&self) {
        self.credentials.on_auth_rejected();
    }
}

/// The cloud relay. Every request needs a bearer token, and when a tunnel is
/// attached the relay is only considered reachable while the tunnel is up.
pub struct TunneledEndpoint {
    relay_url: String,
    priority: u32,
    credentials: Arc<dyn CredentialProvider>,
    tunnel: Option<watch::Receiver<TunnelProcessState>>,
}

impl TunneledEndpoint {
    pub fn new(
        relay_url: &str,
        credentials: Arc<dyn CredentialProvider>,
    ) -> Result<Self, ConnectionError> {
        Ok(Self {
            relay_url: normalize_base_url(relay_url)?,
            priority: 0,
            credentials,
            tunnel: None,
        })
    }

    /// Gate reachability on a tunnel supervisor's status channel.
    pub fn with_tunnel(mut self, status: watch::Receiver<TunnelProcessState>) -> Self {
        self.tunnel = Some(status);
        self
    }

    pub fn with_priority(mut self, priority: u32) -> Self {
        self.priority = priority;
        self
    }
}

impl Endpoint for TunneledEndpoint {
    fn descriptor(&self) -> TransportDescriptor {
        TransportDescriptor {
            kind: TransportKind::Cloud,
            priority: self.priority,
        }
    }

    fn base_url(&self) -> &str {
        &self.relay_url
    }

    fn authorization(&self) -> Result<Option<String>, ConnectionError> {
        self.credentials
            .access_token()
            .map(Some)
            .ok_or_else(|| ConnectionError::Auth("no access token available for the relay".into()))
    }

    fn preflight(&self) -> Result<(), ConnectionError> {
        match &self.tunnel {
            Some(status) if !status.borrow().is_connected => {
                Err(ConnectionError::Process("tunnel is not connected".into()))
            }
            _ => Ok(()),
        }
    }

    fn auth_rejected(&self) {
        self.credentials.on_auth_rejected();
    }

    fn tunnel_status(&self) -> Option<watch::Receiver<TunnelProcessState>> {
        self.tunnel.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::{NoCredentials, StaticToken};

    #[test]
    fn base_urls_are_normalized() {
        assert_eq!(
            normalize_base_url("http://localhost:11434/").unwrap(),
            "http://localhost:11434"
        );
        assert!(matches!(
            normalize_base_url("not a url"),
            Err(ConnectionError::Config(_))
        ));
        assert!(matches!(
            normalize_base_url("ftp://example.com"),
            Err(ConnectionError::Config(_))
        ));
    }

    #[test]
    fn direct_endpoint_token_is_optional() {
        let endpoint =
            DirectHttpEndpoint::new("http://localhost:11434", Arc::new(NoCredentials)).unwrap();
        assert_eq!(endpoint.authorization(), Ok(None));
        assert_eq!(endpoint.descriptor().kind, TransportKind::Local);
        assert!(endpoint.identifier().contains("localhost:11434"));
    }

    #[test]
    fn tunneled_endpoint_requires_token() {
        let endpoint =
            TunneledEndpoint::new("https://relay.example.com", Arc::new(NoCredentials)).unwrap();
        assert!(matches!(
            endpoint.authorization(),
            Err(ConnectionError::Auth(_))
        ));

        let endpoint = TunneledEndpoint::new(
            "https://relay.example.com",
            Arc::new(StaticToken::new("tok")),
        )
        .unwrap();
        assert_eq!(endpoint.authorization(), Ok(Some("tok".to_string())));
    }

    #[test]
    fn tunneled_endpoint_waits_for_tunnel() {
        let (tx, rx) = watch::channel(TunnelProcessState::default());
        let endpoint = TunneledEndpoint::new(
            "https://relay.example.com",
            Arc::new(StaticToken::new("tok")),
        )
        .unwrap()
        .with_tunnel(rx);

        assert!(matches!(
            endpoint.preflight(),
            Err(ConnectionError::Process(_))
        ));

        tx.send_replace(TunnelProcessState {
            pid: Some(42),
            assigned_port: Some(40123),
            is_connected: true,
        });
        assert!(endpoint.preflight().is_ok());
    }
}
