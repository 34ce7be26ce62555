//! Common test utilities for fedtree integration tests.
//!
//! Provides `TestEnv` for isolated CLI runs that never read the user's
//! `~/.config/fedtree/config.kdl`, and `MockAgent`, an in-process WebSocket
//! agent listening on a loopback port.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use assert_cmd::Command;
use assert_cmd::assert::Assert;
use fedtree::models::Address;
use futures::{SinkExt, StreamExt};
use serde_json::{Value, json};
pub use tempfile::TempDir;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_tungstenite::accept_async;
use tokio_tungstenite::tungstenite::Message;

/// A test environment with an isolated working directory.
///
/// The `fedtree()` method returns a `Command` that runs inside the temp
/// directory (so `./topology.json` lands there) and points
/// `FEDTREE_CONFIG` at a config file inside it.
pub struct TestEnv {
    pub dir: TempDir,
}

impl TestEnv {
    /// Create a new test environment.
    pub fn new() -> Self {
        Self {
            dir: TempDir::new().unwrap(),
        }
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    /// Default topology file of the environment.
    pub fn topology_path(&self) -> PathBuf {
        self.dir.path().join("topology.json")
    }

    pub fn config_path(&self) -> PathBuf {
        self.dir.path().join("config.kdl")
    }

    /// Write config.kdl for subsequent commands.
    pub fn write_config(&self, kdl: &str) {
        std::fs::write(self.config_path(), kdl).unwrap();
    }

    /// Get a Command for the fedtree binary with isolated configuration.
    pub fn fedtree(&self) -> Command {
        let mut cmd = Command::new(env!("CARGO_BIN_EXE_fedtree"));
        cmd.current_dir(self.dir.path());
        cmd.env("FEDTREE_CONFIG", self.config_path());
        cmd.env_remove("FEDTREE_TOPOLOGY");
        cmd.env_remove("FEDTREE_CALL_TIMEOUT_SECS");
        cmd.env_remove("FEDTREE_RETRY_DELAY_MS");
        cmd.env_remove("RUST_LOG");
        cmd
    }

    /// Add a node through the CLI and return its local id.
    pub fn add_node(&self, tier: &str, label: &str, address: Option<&str>) -> String {
        let mut cmd = self.fedtree();
        cmd.args(["node", "add", tier, "--label", label]);
        if let Some(address) = address {
            cmd.args(["--address", address]);
        }
        let output = cmd.output().unwrap();
        assert!(
            output.status.success(),
            "node add failed: {}",
            String::from_utf8_lossy(&output.stderr)
        );
        let value: Value = serde_json::from_slice(&output.stdout).unwrap();
        value["node"]["local_id"].as_str().unwrap().to_string()
    }

    /// Link two nodes through the CLI.
    pub fn link(&self, parent: &str, child: &str) {
        self.fedtree()
            .args(["edge", "add", parent, child])
            .assert()
            .success();
    }

    /// The topology file as raw JSON.
    pub fn topology_json(&self) -> Value {
        let contents = std::fs::read_to_string(self.topology_path()).unwrap();
        serde_json::from_str(&contents).unwrap()
    }

    /// The `data` object of one node in the topology file.
    pub fn node_data(&self, local_id: &str) -> Value {
        self.topology_json()["nodes"]
            .as_array()
            .unwrap()
            .iter()
            .find(|n| n["id"] == local_id)
            .map(|n| n["data"].clone())
            .unwrap_or(Value::Null)
    }
}

impl Default for TestEnv {
    fn default() -> Self {
        Self::new()
    }
}

/// Run a CLI command without blocking the async test's runtime.
pub async fn run(mut cmd: Command) -> Assert {
    tokio::task::spawn_blocking(move || cmd.assert())
        .await
        .unwrap()
}

/// Parse stdout of a finished command as JSON.
pub fn stdout_json(assert: &Assert) -> Value {
    serde_json::from_slice(&assert.get_output().stdout).unwrap()
}

/// How a mock agent answers requests.
#[derive(Debug, Clone, PartialEq)]
pub enum Mode {
    /// Behave like a well-formed agent
    Normal,
    /// Answer every request with `{"error": msg}`
    Failing(String),
    /// Answer with a frame that is not JSON
    Malformed,
    /// Answer with valid JSON that lacks the expected field
    Unexpected,
    /// Never answer
    Silent,
    /// Close the socket instead of answering
    Hangup,
    /// Behave normally but hold each reply back this long
    Delayed(Duration),
}

#[derive(Debug)]
struct AgentState {
    mode: Mode,
    requests: Vec<(String, Value)>,
    node_id: Option<u64>,
    hide_mac: bool,
    name: Option<String>,
    node_type: Option<Value>,
    parent: Option<Value>,
    children: Vec<Value>,
    connections: usize,
}

/// An in-process agent speaking the operation protocol over WebSocket.
///
/// Agent ids come from a counter that may be shared between agents, and
/// are sent as JSON numbers.
pub struct MockAgent {
    port: u16,
    state: Arc<Mutex<AgentState>>,
    pushes: broadcast::Sender<String>,
    shutdown: broadcast::Sender<()>,
    task: JoinHandle<()>,
}

impl MockAgent {
    /// Start an agent on a free loopback port with its own id counter.
    pub async fn spawn() -> Self {
        Self::spawn_with_ids(Arc::new(AtomicU64::new(1))).await
    }

    /// Start an agent drawing ids from a shared counter.
    pub async fn spawn_with_ids(ids: Arc<AtomicU64>) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        Self::serve(listener, ids)
    }

    /// Start an agent on a specific port.
    pub async fn spawn_on(port: u16) -> Self {
        let listener = TcpListener::bind(("127.0.0.1", port)).await.unwrap();
        Self::serve(listener, Arc::new(AtomicU64::new(1)))
    }

    fn serve(listener: TcpListener, ids: Arc<AtomicU64>) -> Self {
        let port = listener.local_addr().unwrap().port();
        let state = Arc::new(Mutex::new(AgentState {
            mode: Mode::Normal,
            requests: Vec::new(),
            node_id: None,
            hide_mac: false,
            name: None,
            node_type: None,
            parent: None,
            children: Vec::new(),
            connections: 0,
        }));
        let (pushes, _) = broadcast::channel(64);
        let (shutdown, _) = broadcast::channel(1);

        let task = {
            let state = Arc::clone(&state);
            let pushes = pushes.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                while let Ok((stream, peer)) = listener.accept().await {
                    tokio::spawn(handle_socket(
                        stream,
                        peer,
                        Arc::clone(&state),
                        Arc::clone(&ids),
                        pushes.subscribe(),
                        shutdown.subscribe(),
                    ));
                }
            })
        };

        Self {
            port,
            state,
            pushes,
            shutdown,
            task,
        }
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn address(&self) -> Address {
        Address::new("127.0.0.1", self.port)
    }

    /// `host:port` as the CLI expects it.
    pub fn address_arg(&self) -> String {
        format!("127.0.0.1:{}", self.port)
    }

    pub fn set_mode(&self, mode: Mode) {
        self.state.lock().unwrap().mode = mode;
    }

    /// Every request received, as (operation, data).
    pub fn requests(&self) -> Vec<(String, Value)> {
        self.state.lock().unwrap().requests.clone()
    }

    /// Data of every request for one operation.
    pub fn requests_for(&self, operation: &str) -> Vec<Value> {
        self.requests()
            .into_iter()
            .filter(|(op, _)| op == operation)
            .map(|(_, data)| data)
            .collect()
    }

    pub fn node_id(&self) -> Option<u64> {
        self.state.lock().unwrap().node_id
    }

    /// Pretend the agent was initialized earlier with `id`.
    pub fn preset_id(&self, id: u64) {
        self.state.lock().unwrap().node_id = Some(id);
    }

    pub fn parent(&self) -> Option<Value> {
        self.state.lock().unwrap().parent.clone()
    }

    /// Leave `device_mac` out of node replies.
    pub fn hide_mac(&self, hide: bool) {
        self.state.lock().unwrap().hide_mac = hide;
    }

    pub fn set_parent(&self, parent: Option<Value>) {
        self.state.lock().unwrap().parent = parent;
    }

    pub fn children(&self) -> Vec<Value> {
        self.state.lock().unwrap().children.clone()
    }

    pub fn set_children(&self, children: Vec<Value>) {
        self.state.lock().unwrap().children = children;
    }

    /// Number of WebSocket sessions accepted so far.
    pub fn connections(&self) -> usize {
        self.state.lock().unwrap().connections
    }

    /// Send a `status_update` frame to every connected client.
    pub fn push_status(&self, status: &str, message: &str, code: i64) {
        self.push_frame(json!({
            "type": "status_update",
            "status": status,
            "message": message,
            "timestamp": 1_700_000_000.5,
            "code": code,
        }));
    }

    /// Send an arbitrary frame to every connected client.
    pub fn push_frame(&self, frame: Value) {
        let _ = self.pushes.send(frame.to_string());
    }

    /// Wait until at least `n` sessions have been accepted.
    pub async fn wait_for_connections(&self, n: usize) {
        tokio::time::timeout(Duration::from_secs(10), async {
            while self.connections() < n {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
    }

    /// Wait until at least `n` requests have arrived.
    pub async fn wait_for_requests(&self, n: usize) {
        tokio::time::timeout(Duration::from_secs(10), async {
            while self.requests().len() < n {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
    }

    /// Stop listening and drop every open session.
    pub fn shutdown(&self) {
        self.task.abort();
        let _ = self.shutdown.send(());
    }
}

impl Drop for MockAgent {
    fn drop(&mut self) {
        self.shutdown();
    }
}

async fn handle_socket(
    stream: TcpStream,
    _peer: SocketAddr,
    state: Arc<Mutex<AgentState>>,
    ids: Arc<AtomicU64>,
    mut pushes: broadcast::Receiver<String>,
    mut shutdown: broadcast::Receiver<()>,
) {
    let Ok(ws) = accept_async(stream).await else {
        return;
    };
    state.lock().unwrap().connections += 1;
    let (mut sink, mut source) = ws.split();

    loop {
        tokio::select! {
            _ = shutdown.recv() => {
                let _ = sink.close().await;
                return;
            }
            push = pushes.recv() => {
                if let Ok(text) = push {
                    if sink.send(Message::text(text)).await.is_err() {
                        return;
                    }
                }
            }
            inbound = source.next() => {
                let text = match inbound {
                    Some(Ok(Message::Text(text))) => text.to_string(),
                    Some(Ok(Message::Close(_))) | None | Some(Err(_)) => return,
                    Some(Ok(_)) => continue,
                };
                match respond(&state, &ids, &text) {
                    Reply::Frame(frame) => {
                        if sink.send(Message::text(frame)).await.is_err() {
                            return;
                        }
                    }
                    Reply::Later(delay, frame) => {
                        tokio::time::sleep(delay).await;
                        if sink.send(Message::text(frame)).await.is_err() {
                            return;
                        }
                    }
                    Reply::Nothing => {}
                    Reply::Hangup => {
                        let _ = sink.close().await;
                        return;
                    }
                }
            }
        }
    }
}

enum Reply {
    Frame(String),
    Later(Duration, String),
    Nothing,
    Hangup,
}

fn id_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn respond(state: &Mutex<AgentState>, ids: &AtomicU64, text: &str) -> Reply {
    let mut state = state.lock().unwrap();
    let request: Value = match serde_json::from_str(text) {
        Ok(value) => value,
        Err(_) => return Reply::Frame(json!({ "error": "bad request" }).to_string()),
    };
    let operation = request["operation"].as_str().unwrap_or_default().to_string();
    let data = request["data"].clone();
    state.requests.push((operation.clone(), data.clone()));

    let delay = match state.mode.clone() {
        Mode::Normal => None,
        Mode::Delayed(delay) => Some(delay),
        Mode::Failing(message) => return Reply::Frame(json!({ "error": message }).to_string()),
        Mode::Malformed => return Reply::Frame("<<not json>>".to_string()),
        Mode::Unexpected => return Reply::Frame(json!({ "ok": true }).to_string()),
        Mode::Silent => return Reply::Nothing,
        Mode::Hangup => return Reply::Hangup,
    };

    let node = |state: &AgentState| {
        let mut node = json!({
            "id": state.node_id,
            "name": state.name,
            "node_type": state.node_type,
        });
        if !state.hide_mac {
            node["device_mac"] =
                json!(state.node_id.map(|id| format!("02:00:00:00:00:{:02x}", id % 256)));
        }
        node
    };

    let reply = match operation.as_str() {
        "initialize" => {
            if state.node_id.is_none() {
                state.node_id = Some(ids.fetch_add(1, Ordering::SeqCst));
            }
            state.name = data["name"].as_str().map(str::to_string);
            state.node_type = Some(data["node_type"].clone());
            json!({ "node": node(&state) })
        }
        "get_node_info" => match state.node_id {
            Some(_) => json!({ "node": node(&state) }),
            None => json!({ "error": "node is not initialized" }),
        },
        "set_parent" => {
            state.parent = Some(data);
            json!({ "message": "parent set" })
        }
        "set_children" => {
            state.children = data.as_array().cloned().unwrap_or_default();
            json!({ "message": "children set" })
        }
        "remove_parent" => {
            state.parent = None;
            json!({ "message": "parent removed" })
        }
        "remove_child" => {
            let child = id_text(&data["child_id"]);
            state.children.retain(|c| id_text(&c["id"]) != child);
            json!({ "message": "child removed" })
        }
        "get_parent" => json!({ "parent_node": state.parent.clone().unwrap_or(Value::Null) }),
        "get_children" => json!({ "children": state.children.clone() }),
        other => json!({ "error": format!("unknown operation {}", other) }),
    };
    match delay {
        Some(delay) => Reply::Later(delay, reply.to_string()),
        None => Reply::Frame(reply.to_string()),
    }
}

/// A loopback port with nothing listening on it.
pub async fn unused_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}
