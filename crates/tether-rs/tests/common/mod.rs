//! Fake inference backend shared by the integration tests.
//!
//! Serves `/api/version`, `/api/tags` and `/api/chat` on a random local port
//! and counts every call so tests can assert how often the engine touched
//! the network.

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::extract::State;
use axum::http::header::{ACCEPT, AUTHORIZATION, CONTENT_TYPE};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::{Value, json};
use tether_rs::config::TransportConfig;
use tether_rs::credentials::{CredentialProvider, NoCredentials};
use tether_rs::error::DefaultErrorClassifier;
use tether_rs::status::StatusBus;
use tether_rs::transport::{DirectHttpEndpoint, TransportConnection};

/// What the last `POST /api/chat` looked like.
#[derive(Debug, Clone)]
pub struct CapturedChat {
    pub body: Value,
    pub accept: Option<String>,
    pub authorization: Option<String>,
}

pub struct BackendState {
    pub healthy: AtomicBool,
    pub reject_auth: AtomicBool,
    pub stall_chat: AtomicBool,
    pub version_calls: AtomicUsize,
    pub tags_calls: AtomicUsize,
    pub chat_calls: AtomicUsize,
    pub models: Mutex<Vec<String>>,
    pub chat_lines: Mutex<Vec<String>>,
    pub last_chat: Mutex<Option<CapturedChat>>,
}

impl BackendState {
    fn rejects(&self) -> Option<Response> {
        if self.reject_auth.load(Ordering::SeqCst) {
            return Some((StatusCode::UNAUTHORIZED, "token expired").into_response());
        }
        None
    }
}

pub struct FakeBackend {
    pub state: Arc<BackendState>,
    pub url: String,
}

impl FakeBackend {
    pub fn set_healthy(&self, healthy: bool) {
        self.state.healthy.store(healthy, Ordering::SeqCst);
    }

    pub fn set_reject_auth(&self, reject: bool) {
        self.state.reject_auth.store(reject, Ordering::SeqCst);
    }

    /// Make `/api/chat` accept the request and then hold back the headers.
    pub fn set_stall_chat(&self, stall: bool) {
        self.state.stall_chat.store(stall, Ordering::SeqCst);
    }

    pub fn set_models(&self, models: &[&str]) {
        *self.state.models.lock().unwrap() = models.iter().map(|m| m.to_string()).collect();
    }

    pub fn set_chat_lines(&self, lines: &[&str]) {
        *self.state.chat_lines.lock().unwrap() = lines.iter().map(|l| l.to_string()).collect();
    }

    pub fn version_calls(&self) -> usize {
        self.state.version_calls.load(Ordering::SeqCst)
    }

    pub fn tags_calls(&self) -> usize {
        self.state.tags_calls.load(Ordering::SeqCst)
    }

    pub fn chat_calls(&self) -> usize {
        self.state.chat_calls.load(Ordering::SeqCst)
    }

    pub fn last_chat(&self) -> Option<CapturedChat> {
        self.state.last_chat.lock().unwrap().clone()
    }
}

async fn version(State(state): State<Arc<BackendState>>) -> Response {
    state.version_calls.fetch_add(1, Ordering::SeqCst);
    if let Some(rejected) = state.rejects() {
        return rejected;
    }
    if !state.healthy.load(Ordering::SeqCst) {
        return (StatusCode::SERVICE_UNAVAILABLE, "backend unavailable").into_response();
    }
    Json(json!({ "version": "0.5.1" })).into_response()
}

async fn tags(State(state): State<Arc<BackendState>>) -> Response {
    state.tags_calls.fetch_add(1, Ordering::SeqCst);
    if let Some(rejected) = state.rejects() {
        return rejected;
    }
    let models: Vec<Value> = state
        .models
        .lock()
        .unwrap()
        .iter()
        .map(|name| json!({ "name": name }))
        .collect();
    Json(json!({ "models": models })).into_response()
}

async fn chat(
    State(state): State<Arc<BackendState>>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    state.chat_calls.fetch_add(1, Ordering::SeqCst);
    let header = |name: axum::http::HeaderName| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
    };
    *state.last_chat.lock().unwrap() = Some(CapturedChat {
        body,
        accept: header(ACCEPT),
        authorization: header(AUTHORIZATION),
    });
    if let Some(rejected) = state.rejects() {
        return rejected;
    }
    if state.stall_chat.load(Ordering::SeqCst) {
        tokio::time::sleep(Duration::from_secs(30)).await;
    }

    let mut payload = state.chat_lines.lock().unwrap().join("\n");
    payload.push('\n');
    ([(CONTENT_TYPE, "application/x-ndjson")], payload).into_response()
}

/// Spawn a healthy fake backend on port 0 (random available port).
pub async fn spawn_backend() -> FakeBackend {
    let state = Arc::new(BackendState {
        healthy: AtomicBool::new(true),
        reject_auth: AtomicBool::new(false),
        stall_chat: AtomicBool::new(false),
        version_calls: AtomicUsize::new(0),
        tags_calls: AtomicUsize::new(0),
        chat_calls: AtomicUsize::new(0),
        models: Mutex::new(vec!["llama3".to_string()]),
        chat_lines: Mutex::new(vec![
            r#"{"message":{"role":"assistant","content":"Hello"},"done":false}"#.to_string(),
            r#"{"message":{"role":"assistant","content":" world"},"done":false}"#.to_string(),
            r#"{"done":true}"#.to_string(),
        ]),
        last_chat: Mutex::new(None),
    });

    let router = Router::new()
        .route("/api/version", get(version))
        .route("/api/tags", get(tags))
        .route("/api/chat", post(chat))
        .with_state(Arc::clone(&state));

    let listener = tokio::net::TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });

    FakeBackend {
        state,
        url: format!("http://{addr}"),
    }
}

/// A local URL nothing listens on.
pub async fn dead_url() -> String {
    let listener = tokio::net::TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    format!("http://{addr}")
}

/// Fast timings for tests: no heartbeat, no automatic reconnects.
pub fn quiet_config() -> TransportConfig {
    TransportConfig::default()
        .with_probe_timeout(Duration::from_secs(2))
        .with_request_timeout(Duration::from_secs(5))
        .without_heartbeat()
        .with_auto_reconnect(false)
}

pub fn direct_transport(url: &str, config: TransportConfig) -> TransportConnection {
    direct_transport_with(url, config, Arc::new(NoCredentials), StatusBus::default())
}

pub fn direct_transport_with(
    url: &str,
    config: TransportConfig,
    credentials: Arc<dyn CredentialProvider>,
    bus: StatusBus,
) -> TransportConnection {
    TransportConnection::new(
        DirectHttpEndpoint::new(url, credentials).unwrap(),
        config,
        Arc::new(DefaultErrorClassifier),
        bus,
    )
    .unwrap()
}

/// Poll `check` every 10ms until it holds or `timeout` elapses.
pub async fn eventually(timeout: Duration, mut check: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}
