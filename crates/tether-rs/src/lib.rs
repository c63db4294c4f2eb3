//! Resilient connection and streaming engine for inference backends.
//!
//! `tether-rs` keeps a client connected to a language-model backend that may be
//! reachable in several ways: directly over HTTP on the local machine, or
//! through an authenticated cloud relay whose reverse tunnel is maintained by a
//! supervised subprocess. The engine survives flaky networks, backend restarts
//! and tunnel crashes without blocking callers longer than necessary and
//! without hammering a dead endpoint.
//!
//! # Getting started
//!
//! ```ignore
//! use tether_rs::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), ConnectionError> {
//!     let config = EngineConfig::default();
//!     let engine = EngineBuilder::new(config).build()?;
//!     engine.start().await;
//!
//!     let mut stream = engine
//!         .router
//!         .send_chat_message("Why is the sky blue?", "conv-1", &[])
//!         .await?;
//!     while let Some(event) = stream.next().await {
//!         if let StreamEvent::Chunk { text, .. } = event {
//!             print!("{text}");
//!         }
//!     }
//!     Ok(())
//! }
//! ```
//!
//! # Where to find things
//!
//! - **Decode a streaming response:** [`StreamFramer`](api::streaming::StreamFramer)
//!   turns newline-delimited JSON into [`StreamEvent`](api::streaming::StreamEvent)s.
//! - **Backoff and circuit breaking:** [`RetryPolicy`](api::retry::RetryPolicy),
//!   [`RetryState`](api::retry::RetryState) and
//!   [`CircuitBreaker`](api::retry::CircuitBreaker), combined in
//!   [`Backoff`](api::retry::Backoff).
//! - **One logical connection:** [`TransportConnection`](transport::TransportConnection)
//!   owns the state machine, heartbeat and reconnect timer for a single
//!   [`Endpoint`](transport::Endpoint).
//! - **Reverse tunnel:** [`TunnelSupervisor`](tunnel::TunnelSupervisor).
//! - **Pick the best transport:** [`ConnectionRouter`](api::router::ConnectionRouter).
//! - **Observe everything:** subscribe to the [`StatusBus`](status::StatusBus).
//! - **Wire it all together:** [`EngineBuilder`](platform::EngineBuilder).
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | [`api`] | Stream framing, retry/circuit breaker, connection routing |
//! | [`transport`] | Connection state machine and the direct/tunneled endpoint variants |
//! | [`tunnel`] | Reverse-tunnel subprocess supervision |
//! | [`platform`] | Platform capabilities and the engine composition root |
//! | [`config`] | Engine configuration with file and environment loading |
//! | [`credentials`] | Bearer-token provider seam |
//! | [`error`] | Error taxonomy and classification |
//! | [`status`] | Process-wide status event bus |

pub mod api;
pub mod config;
pub mod credentials;
pub mod error;
pub mod platform;
pub mod prelude;
pub mod status;
pub mod transport;
pub mod tunnel;

use serde::{Deserialize, Serialize};

pub use error::ConnectionError;

// ── Constants ──────────────────────────────────────────────────────

/// Default base URL of a locally running backend.
pub const DEFAULT_BACKEND_URL: &str = "http://localhost:11434";

/// Backend port assumed when a backend URL carries no explicit port.
pub const DEFAULT_BACKEND_PORT: u16 = 11434;

/// Health probe endpoint. Responds with `{"version": "..."}`.
pub const VERSION_PATH: &str = "/api/version";

/// Model listing endpoint. Responds with `{"models": [{"name": "..."}]}`.
pub const TAGS_PATH: &str = "/api/tags";

/// Streaming chat endpoint.
pub const CHAT_PATH: &str = "/api/chat";

/// Media type of the streaming chat response body.
pub const NDJSON_CONTENT_TYPE: &str = "application/x-ndjson";

// ── Message types ──────────────────────────────────────────────────

/// Role of a message in the conversation.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    System,
    User,
    Assistant,
}

impl std::fmt::Display for MessageRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MessageRole::System => write!(f, "system"),
            MessageRole::User => write!(f, "user"),
            MessageRole::Assistant => write!(f, "assistant"),
        }
    }
}

/// A message in the conversation history.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct ChatMessage {
    pub role: MessageRole,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::Assistant,
            content: content.into(),
        }
    }
}

// ── Wire types ─────────────────────────────────────────────────────

/// Body of `POST /api/chat`.
#[derive(Serialize, Debug, Clone)]
pub struct ChatRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    pub stream: bool,
}

impl ChatRequest {
    /// Build a streaming request: the prior history followed by the new user prompt.
    pub fn streaming(model: impl Into<String>, history: &[ChatMessage], prompt: &str) -> Self {
        let mut messages = Vec::with_capacity(history.len() + 1);
        messages.extend_from_slice(history);
        messages.push(ChatMessage::user(prompt));
        Self {
            model: model.into(),
            messages,
            stream: true,
        }
    }
}

/// Response of the health probe.
#[derive(Deserialize, Debug, Clone)]
pub struct VersionResponse {
    pub version: String,
}

/// Response of the model listing endpoint.
#[derive(Deserialize, Debug, Clone, Default)]
pub struct TagsResponse {
    #[serde(default)]
    pub models: Vec<ModelTag>,
}

#[derive(Deserialize, Debug, Clone)]
pub struct ModelTag {
    pub name: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_constructors() {
        let sys = ChatMessage::system("be brief");
        assert_eq!(sys.role, MessageRole::System);
        assert_eq!(ChatMessage::user("hi").role, MessageRole::User);
        assert_eq!(ChatMessage::assistant("hello").content, "hello");
    }

    #[test]
    fn streaming_request_appends_prompt_after_history() {
        let history = vec![ChatMessage::user("first"), ChatMessage::assistant("reply")];
        let req = ChatRequest::streaming("llama3", &history, "second");
        let json = serde_json::to_value(&req).unwrap();
        assert_eq!(json["model"], "llama3");
        assert_eq!(json["stream"], true);
        let messages = json["messages"].as_array().unwrap();
        assert_eq!(messages.len(), 3);
        assert_eq!(messages[2]["role"], "user");
        assert_eq!(messages[2]["content"], "second");
    }

    #[test]
    fn tags_response_tolerates_missing_models() {
        let tags: TagsResponse = serde_json::from_str("{}").unwrap();
        assert!(tags.models.is_empty());
    }
}
