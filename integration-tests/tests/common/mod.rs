use std::collections::HashMap;
use std::future::Future;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use carpool_edge_client::EdgeConfig;
use clap::Parser;
use serde_json::{json, Value};
use tempfile::TempDir;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

pub const NODE_ID: &str = "node-test-1";

/// Poll `check` until it holds or `timeout` passes.
pub async fn wait_until<F, Fut>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check().await {
            return true;
        }
        if tokio::time::Instant::now() > deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

#[derive(Debug, Clone)]
enum Outgoing {
    Text(String),
    Close,
}

#[derive(Debug, Clone)]
pub struct Registration {
    pub public_key: Option<String>,
    pub body: Value,
}

#[derive(Debug, Clone)]
pub struct WsConnect {
    pub authorization: Option<String>,
    pub node_id: Option<String>,
}

#[derive(Default)]
struct Recorded {
    registrations: Vec<Registration>,
    sync_requests: Vec<(Option<String>, Value)>,
    metrics: Vec<Value>,
    messages: Vec<Value>,
    connects: Vec<WsConnect>,
    open_sockets: usize,
}

struct Shared {
    reject_registration: bool,
    config: Mutex<Option<Value>>,
    recorded: Mutex<Recorded>,
    outgoing: broadcast::Sender<Outgoing>,
}

impl Shared {
    fn record<R>(&self, f: impl FnOnce(&mut Recorded) -> R) -> R {
        let mut recorded = self.recorded.lock().unwrap();
        f(&mut recorded)
    }
}

/// Stand-in for the central server: HTTP API, control channel, and a fake
/// Claude endpoint, all on one ephemeral port.
pub struct MockCentral {
    addr: SocketAddr,
    shared: Arc<Shared>,
    task: JoinHandle<()>,
}

impl MockCentral {
    pub async fn start() -> Self {
        Self::with_options(false).await
    }

    pub async fn rejecting() -> Self {
        Self::with_options(true).await
    }

    async fn with_options(reject_registration: bool) -> Self {
        let (outgoing, _) = broadcast::channel(64);
        let shared = Arc::new(Shared {
            reject_registration,
            config: Mutex::new(None),
            recorded: Mutex::new(Recorded::default()),
            outgoing,
        });

        let app = Router::new()
            .route("/health", get(|| async { "ok" }))
            .route("/api/edge-nodes/register", post(register))
            .route("/api/edge-nodes/config/sync", post(sync_config))
            .route("/api/edge-nodes/metrics", post(metrics))
            .route("/v1/messages", post(claude_messages))
            .route("/ws", get(ws_upgrade))
            .with_state(shared.clone());

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("Failed to bind mock central server");
        let addr = listener.local_addr().unwrap();
        let task = tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self { addr, shared, task }
    }

    pub fn url(&self) -> String {
        format!("http://{}", self.addr)
    }

    /// Configuration served by the sync endpoint from now on.
    pub fn set_config(&self, config: Value) {
        *self.shared.config.lock().unwrap() = Some(config);
    }

    /// Config with a single Claude service that points back at this server.
    pub fn claude_config(&self, version: &str) -> Value {
        json!({
            "version": version,
            "aiServices": [{
                "type": "claude",
                "name": "claude-main",
                "apiKey": "sk-test",
                "baseUrl": self.url(),
                "enabled": true
            }],
            "routingRules": []
        })
    }

    pub fn registrations(&self) -> Vec<Registration> {
        self.shared.record(|r| r.registrations.clone())
    }

    pub fn sync_requests(&self) -> Vec<(Option<String>, Value)> {
        self.shared.record(|r| r.sync_requests.clone())
    }

    pub fn metrics(&self) -> Vec<Value> {
        self.shared.record(|r| r.metrics.clone())
    }

    pub fn connects(&self) -> Vec<WsConnect> {
        self.shared.record(|r| r.connects.clone())
    }

    pub fn open_sockets(&self) -> usize {
        self.shared.record(|r| r.open_sockets)
    }

    /// Control channel messages of one type, oldest first.
    pub fn messages_of(&self, kind: &str) -> Vec<Value> {
        self.shared.record(|r| {
            r.messages
                .iter()
                .filter(|m| m["type"] == kind)
                .cloned()
                .collect()
        })
    }

    pub fn send(&self, message: Value) {
        let _ = self.shared.outgoing.send(Outgoing::Text(message.to_string()));
    }

    pub fn send_command(&self, id: &str, command: &str) {
        self.send(json!({
            "type": "node_command",
            "id": id,
            "timestamp": "2026-01-01T00:00:00Z",
            "data": {"command": command}
        }));
    }

    /// Close every open control channel from the server side.
    pub fn close_sockets(&self) {
        let _ = self.shared.outgoing.send(Outgoing::Close);
    }

    pub fn command_result(&self, id: &str) -> Option<Value> {
        self.messages_of("command_result")
            .into_iter()
            .find(|m| m["data"]["commandId"] == id)
            .map(|m| m["data"].clone())
    }
}

impl Drop for MockCentral {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn register(
    State(shared): State<Arc<Shared>>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Json<Value> {
    let public_key = headers
        .get("x-node-public-key")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    shared.record(|r| r.registrations.push(Registration { public_key, body }));

    if shared.reject_registration {
        return Json(json!({"success": false, "error": "node name already taken"}));
    }
    Json(json!({"success": true, "data": {"nodeId": NODE_ID}}))
}

async fn sync_config(
    State(shared): State<Arc<Shared>>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Json<Value> {
    let auth = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    shared.record(|r| r.sync_requests.push((auth, body.clone())));

    let config = shared.config.lock().unwrap().clone();
    match config {
        Some(config) if body["currentVersion"] != config["version"] => {
            Json(json!({"success": true, "data": config}))
        }
        _ => Json(json!({"success": true})),
    }
}

async fn metrics(State(shared): State<Arc<Shared>>, Json(body): Json<Value>) -> StatusCode {
    shared.record(|r| r.metrics.push(body));
    StatusCode::OK
}

async fn claude_messages(Json(body): Json<Value>) -> Json<Value> {
    let prompt = body["messages"][0]["content"].as_str().unwrap_or_default();
    Json(json!({
        "content": [{"type": "text", "text": format!("echo: {}", prompt)}],
        "usage": {"input_tokens": 7, "output_tokens": 3}
    }))
}

async fn ws_upgrade(
    State(shared): State<Arc<Shared>>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    let authorization = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    if authorization.is_none() {
        return StatusCode::UNAUTHORIZED.into_response();
    }

    shared.record(|r| {
        r.connects.push(WsConnect {
            authorization,
            node_id: query.get("nodeId").cloned(),
        })
    });
    let outgoing = shared.outgoing.subscribe();
    ws.on_upgrade(move |socket| handle_socket(socket, shared, outgoing))
}

async fn handle_socket(
    mut socket: WebSocket,
    shared: Arc<Shared>,
    mut outgoing: broadcast::Receiver<Outgoing>,
) {
    shared.record(|r| r.open_sockets += 1);

    loop {
        tokio::select! {
            incoming = socket.recv() => match incoming {
                Some(Ok(Message::Text(text))) => {
                    if let Ok(value) = serde_json::from_str::<Value>(&text) {
                        shared.record(|r| r.messages.push(value));
                    }
                }
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => {}
            },
            out = outgoing.recv() => match out {
                Ok(Outgoing::Text(text)) => {
                    if socket.send(Message::Text(text)).await.is_err() {
                        break;
                    }
                }
                Ok(Outgoing::Close) => {
                    let _ = socket.send(Message::Close(None)).await;
                    break;
                }
                Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => break,
            },
        }
    }

    shared.record(|r| r.open_sockets -= 1);
}

/// Client configuration pointed at `central`, with fast timers and keys in
/// `dir`.
pub fn edge_config(central: &MockCentral, dir: &TempDir, extra: &[&str]) -> EdgeConfig {
    let key = |name: &str| path_arg(dir.path(), name);
    let central_url = central.url();
    let private_key = key("private.pem");
    let public_key = key("public.pem");

    let mut args: Vec<&str> = vec![
        "carpool-edge-client",
        "--central-url",
        central_url.as_str(),
        "--bind",
        "127.0.0.1:0",
        "--node-name",
        "test-node",
        "--node-location",
        "test-lab",
        "--private-key-path",
        private_key.as_str(),
        "--public-key-path",
        public_key.as_str(),
        "--central-retry-attempts",
        "1",
        "--reconnect-base-delay-ms",
        "100",
        "--heartbeat-interval-secs",
        "1",
        "--health-check-interval-secs",
        "1",
        "--metrics-interval-secs",
        "1",
    ];
    args.extend_from_slice(extra);

    EdgeConfig::try_parse_from(args).expect("Invalid test configuration")
}

fn path_arg(dir: &Path, name: &str) -> String {
    dir.join(name).to_string_lossy().to_string()
}
