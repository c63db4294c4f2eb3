//! Bearer-token provider seam.
//!
//! The engine never acquires or refreshes credentials itself. It asks a
//! [`CredentialProvider`] for the current token right before each
//! authenticated call. "No token" and "token could not be read" are the same
//! answer (`None`): local transports then proceed unauthenticated and cloud
//! transports fail the request.

/// Supplies the current access token.
pub trait CredentialProvider: Send + Sync {
    /// The token to send as `Authorization: Bearer`, or `None`.
    fn access_token(&self) -> Option<String>;

    /// Called when an endpoint rejected the token, so the provider can start
    /// its refresh flow. Default: no-op.
    fn on_auth_rejected(&self) {}
}

/// Provider that never has a token.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoCredentials;

impl CredentialProvider for NoCredentials {
    fn access_token(&self) -> Option<String> {
        None
    }
}

/// Provider holding a fixed token.
#[derive(Clone)]
pub struct StaticToken(String);

impl StaticToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }
}

impl std::fmt::Debug for StaticToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("StaticToken(***)")
    }
}

impl CredentialProvider for StaticToken {
    fn access_token(&self) -> Option<String> {
        non_empty(Some(self.0.clone()))
    }
}

/// Provider that reads the token from an environment variable on every call.
#[derive(Debug, Clone)]
pub struct EnvToken {
    var: String,
}

impl EnvToken {
    pub fn new(var: impl Into<String>) -> Self {
        Self { var: var.into() }
    }
}

impl CredentialProvider for EnvToken {
    fn access_token(&self) -> Option<String> {
        non_empty(std::env::var(&self.var).ok())
    }
}

/// Closure-backed provider, handy for wiring in an existing token store.
pub struct FnCredentials<F>(pub F);

impl<F> CredentialProvider for FnCredentials<F>
where
    F: Fn() -> Option<String> + Send + Sync,
{
    fn access_token(&self) -> Option<String> {
        non_empty((self.0)())
    }
}

fn non_empty(token: Option<String>) -> Option<String> {
    token
        .map(|t| t.trim().to_string())
        .filter(|t| !t.is_empty())
}
