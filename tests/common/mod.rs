//! Test utilities: scripted agent runtime and in-process app setup.
#![allow(dead_code)] // each test binary uses a different slice of this module

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use axum::Router;
use axum::body::Body;
use axum::http::{Method, Request, StatusCode, header};
use serde_json::Value;
use tower::ServiceExt;

use claude_broker::agent::{
    AgentClient, AgentError, AgentEvent, AgentOptions, AgentRuntime, EventStream,
};
use claude_broker::api::{self, AppState};
use claude_broker::session::SessionManager;
use claude_broker::settings::AppConfig;
use claude_broker::storage::MemoryStore;

/// Default scripted turn: two text fragments, one tool round-trip, done.
pub fn default_turn() -> Vec<AgentEvent> {
    vec![
        AgentEvent::TextDelta {
            text: "Hello ".to_string(),
        },
        AgentEvent::TextDelta {
            text: "from the agent".to_string(),
        },
        AgentEvent::ToolUse {
            id: "tu_1".to_string(),
            name: "Read".to_string(),
            input: serde_json::json!({"path": "notes.txt"}),
        },
        AgentEvent::ToolResult {
            id: "tu_1".to_string(),
            output: serde_json::json!("jotted down"),
        },
        AgentEvent::Done,
    ]
}

/// An agent client that replays a scripted turn after a configurable delay.
pub struct StubClient {
    turn: Vec<AgentEvent>,
    turn_delay: Duration,
    rss_bytes: u64,
    closed: AtomicBool,
    last_used: std::sync::Mutex<Instant>,
}

impl StubClient {
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl AgentClient for StubClient {
    async fn ask(&self, _prompt: &str) -> Result<EventStream, AgentError> {
        if self.is_closed() {
            return Err(AgentError::Closed);
        }
        *self.last_used.lock().unwrap() = Instant::now();

        let (tx, rx) = tokio::sync::mpsc::channel(64);
        let turn = self.turn.clone();
        let delay = self.turn_delay;
        tokio::spawn(async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            let ends_turn = turn.last() == Some(&AgentEvent::Done);
            for event in turn {
                if tx.send(event).await.is_err() {
                    return;
                }
            }
            if !ends_turn {
                // Scripts without a terminal record simulate a stalled
                // agent: keep the turn open until the receiver gives up.
                tx.closed().await;
            }
        });
        Ok(rx)
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    fn last_used(&self) -> Instant {
        *self.last_used.lock().unwrap()
    }

    fn rss_bytes(&self) -> u64 {
        self.rss_bytes
    }
}

/// Scripted agent runtime. Tracks every spawned client so tests can assert
/// nothing leaks.
pub struct StubRuntime {
    turn: Vec<AgentEvent>,
    turn_delay: Duration,
    rss_bytes: u64,
    spawn_count: AtomicUsize,
    clients: std::sync::Mutex<Vec<Arc<StubClient>>>,
}

impl Default for StubRuntime {
    fn default() -> Self {
        Self {
            turn: default_turn(),
            turn_delay: Duration::ZERO,
            rss_bytes: 0,
            spawn_count: AtomicUsize::new(0),
            clients: std::sync::Mutex::new(Vec::new()),
        }
    }
}

impl StubRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every turn take at least this long before events flow.
    pub fn with_turn_delay(mut self, delay: Duration) -> Self {
        self.turn_delay = delay;
        self
    }

    /// Report this RSS for every spawned client.
    pub fn with_rss_bytes(mut self, rss_bytes: u64) -> Self {
        self.rss_bytes = rss_bytes;
        self
    }

    /// Replay this event script for every turn.
    pub fn with_turn(mut self, turn: Vec<AgentEvent>) -> Self {
        self.turn = turn;
        self
    }

    pub fn spawn_count(&self) -> usize {
        self.spawn_count.load(Ordering::SeqCst)
    }

    /// Clients spawned and not yet closed.
    pub fn open_client_count(&self) -> usize {
        self.clients
            .lock()
            .unwrap()
            .iter()
            .filter(|client| !client.is_closed())
            .count()
    }
}

#[async_trait]
impl AgentRuntime for StubRuntime {
    async fn spawn(&self, _options: AgentOptions) -> Result<Arc<dyn AgentClient>, AgentError> {
        self.spawn_count.fetch_add(1, Ordering::SeqCst);
        let client = Arc::new(StubClient {
            turn: self.turn.clone(),
            turn_delay: self.turn_delay,
            rss_bytes: self.rss_bytes,
            closed: AtomicBool::new(false),
            last_used: std::sync::Mutex::new(Instant::now()),
        });
        self.clients.lock().unwrap().push(Arc::clone(&client));
        Ok(client)
    }
}

/// Fully wired in-process application over a memory store and stub agents.
pub struct TestApp {
    pub router: Router,
    pub manager: Arc<SessionManager>,
    pub runtime: Arc<StubRuntime>,
    _base_dir: tempfile::TempDir,
}

pub async fn test_app() -> TestApp {
    test_app_with(StubRuntime::new(), |_| {}).await
}

pub async fn test_app_with(
    runtime: StubRuntime,
    configure: impl FnOnce(&mut AppConfig),
) -> TestApp {
    let base_dir = tempfile::tempdir().unwrap();

    let mut config = AppConfig::default();
    config.user.base_dir = base_dir.path().to_string_lossy().to_string();
    config.limits.memory_limit_mb = 0; // memory checks opt-in per test
    configure(&mut config);
    config.validate().unwrap();

    let runtime = Arc::new(runtime);
    let store = Arc::new(MemoryStore::new());
    let manager = SessionManager::new(
        Arc::new(config),
        store,
        Arc::clone(&runtime) as Arc<dyn AgentRuntime>,
    );

    let router = api::create_router(AppState::new(Arc::clone(&manager)));
    TestApp {
        router,
        manager,
        runtime,
        _base_dir: base_dir,
    }
}

/// One-shot JSON request against the router.
pub async fn request_json(
    router: &Router,
    method: Method,
    uri: &str,
    body: Option<Value>,
) -> (StatusCode, Value) {
    let request = match body {
        Some(json) => Request::builder()
            .uri(uri)
            .method(method)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(json.to_string()))
            .unwrap(),
        None => Request::builder()
            .uri(uri)
            .method(method)
            .body(Body::empty())
            .unwrap(),
    };

    let response = router.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), 4 * 1024 * 1024)
        .await
        .unwrap();
    let json = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or(Value::Null)
    };
    (status, json)
}
