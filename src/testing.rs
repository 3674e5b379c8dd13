//! In-memory test doubles shared by the unit tests

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value as JsonValue};
use tokio::sync::mpsc;

use crate::bridge::auth::{ResolvedAuth, TokenSource};
use crate::bridge::connection::BridgeConnection;
use crate::bridge::envelope::Frame;
use crate::bridge::transport::{Handshake, Transport};
use crate::config::BridgeConfig;
use crate::hygiene::process::{ProcessProbe, RawProcess, RawWindow, Signal, SignalError};
use crate::runtime::RuntimeManager;
use crate::{Error, Result};

const ALL_ACTIONS: &[&str] = &[
    "capabilities",
    "health_ping",
    "get_objects_in_patch",
    "get_objects_in_selected",
    "get_patcher_context",
    "add_object",
    "remove_object",
    "connect_objects",
    "disconnect_objects",
    "set_object_attribute",
    "set_message_text",
    "send_message_to_object",
    "send_bang_to_object",
    "set_number",
    "create_subpatcher",
    "enter_subpatcher",
    "exit_subpatcher",
    "add_subpatcher_io",
    "recreate_with_args",
    "move_object",
    "autofit_existing",
    "encapsulate",
    "set_workspace_target",
    "apply_topology_snapshot",
];

#[derive(Default)]
struct PeerState {
    supported: Vec<String>,
    boxes: Vec<JsonValue>,
    lines: Vec<JsonValue>,
    target: String,
    requests: Vec<JsonValue>,
    delays: HashMap<String, Duration>,
    dropped: HashSet<String>,
    failures: HashMap<String, (String, String)>,
    reject_handshake: bool,
    refuse_connections: bool,
}

/// Scripted peer implementing [`Transport`]. Keeps a single live topology and
/// answers the actions the runtime layer uses.
pub(crate) struct FakePeer {
    connected: AtomicBool,
    inbound: Mutex<Option<mpsc::UnboundedSender<Frame>>>,
    state: Mutex<PeerState>,
}

impl FakePeer {
    pub fn new() -> Arc<Self> {
        Self::with_actions(ALL_ACTIONS)
    }

    pub fn with_actions(actions: &[&str]) -> Arc<Self> {
        Arc::new(Self {
            connected: AtomicBool::new(false),
            inbound: Mutex::new(None),
            state: Mutex::new(PeerState {
                supported: actions.iter().map(|a| a.to_string()).collect(),
                target: "active".to_string(),
                ..PeerState::default()
            }),
        })
    }

    pub fn set_delay(&self, action: &str, delay: Duration) {
        self.state.lock().delays.insert(action.to_string(), delay);
    }

    /// Never answer `action`
    pub fn drop_action(&self, action: &str) {
        self.state.lock().dropped.insert(action.to_string());
    }

    pub fn restore_action(&self, action: &str) {
        self.state.lock().dropped.remove(action);
    }

    pub fn fail_action(&self, action: &str, code: &str, message: &str) {
        self.state
            .lock()
            .failures
            .insert(action.to_string(), (code.to_string(), message.to_string()));
    }

    pub fn clear_failure(&self, action: &str) {
        self.state.lock().failures.remove(action);
    }

    pub fn reject_handshake(&self) {
        self.state.lock().reject_handshake = true;
    }

    pub fn refuse_connections(&self, refuse: bool) {
        self.state.lock().refuse_connections = refuse;
    }

    /// Simulate the peer going away
    pub fn kill(&self) {
        self.connected.store(false, Ordering::SeqCst);
        self.inbound.lock().take();
    }

    pub fn set_topology(&self, topology: &JsonValue) {
        let mut state = self.state.lock();
        state.boxes = array_of(topology, "boxes");
        state.lines = array_of(topology, "lines");
    }

    pub fn topology(&self) -> JsonValue {
        let state = self.state.lock();
        json!({"boxes": state.boxes, "lines": state.lines})
    }

    pub fn box_count(&self) -> usize {
        self.state.lock().boxes.len()
    }

    pub fn target(&self) -> String {
        self.state.lock().target.clone()
    }

    pub fn count(&self, action: &str) -> usize {
        self.state
            .lock()
            .requests
            .iter()
            .filter(|r| r["action"] == action)
            .count()
    }

    pub fn last_request(&self, action: &str) -> Option<JsonValue> {
        self.state
            .lock()
            .requests
            .iter()
            .rev()
            .find(|r| r["action"] == action)
            .cloned()
    }

    fn respond(state: &mut PeerState, action: &str, payload: &JsonValue) -> std::result::Result<JsonValue, (String, String)> {
        if let Some(failure) = state.failures.get(action) {
            return Err(failure.clone());
        }
        let varname = payload["varname"].as_str().unwrap_or_default().to_string();
        match action {
            "capabilities" => Ok(json!({
                "supported_actions": state.supported,
                "supports_auth": true,
                "protocol_version": "2.0",
            })),
            "health_ping" => Ok(json!({"ok": true})),
            "get_objects_in_patch" | "get_objects_in_selected" => {
                Ok(json!({"boxes": state.boxes, "lines": state.lines}))
            }
            "get_patcher_context" => Ok(json!({"name": "fake", "depth": 0, "target": state.target})),
            "set_workspace_target" => {
                state.target = payload["target_id"].as_str().unwrap_or("active").to_string();
                Ok(json!({"target_id": state.target}))
            }
            "apply_topology_snapshot" => {
                let snapshot = &payload["snapshot"];
                state.boxes = array_of(snapshot, "boxes");
                state.lines = array_of(snapshot, "lines");
                Ok(json!({
                    "restored_boxes": state.boxes.len(),
                    "restored_lines": state.lines.len(),
                    "skipped_boxes": 0,
                    "skipped_lines": 0,
                }))
            }
            "add_object" | "create_subpatcher" | "add_subpatcher_io" => {
                if state.boxes.iter().any(|b| b["box"]["varname"] == varname.as_str()) {
                    return Err(("VALIDATION_ERROR".into(), format!("Varname '{varname}' already exists.")));
                }
                let position = payload["position"].as_array().cloned().unwrap_or_default();
                let x = position.first().and_then(JsonValue::as_f64).unwrap_or(0.0);
                let y = position.get(1).and_then(JsonValue::as_f64).unwrap_or(0.0);
                let obj_type = payload["obj_type"].as_str().unwrap_or("p");
                state.boxes.push(json!({"box": {
                    "id": format!("obj-{}", state.boxes.len() + 1),
                    "varname": varname,
                    "maxclass": "newobj",
                    "text": obj_type,
                    "patching_rect": [x, y, 60.0, 22.0],
                    "numinlets": 2,
                    "numoutlets": 1,
                }}));
                Ok(json!({"varname": varname}))
            }
            "remove_object" => {
                let before = state.boxes.len();
                state.boxes.retain(|b| b["box"]["varname"] != varname.as_str());
                if state.boxes.len() == before {
                    return Err(("OBJECT_NOT_FOUND".into(), format!("No object '{varname}'.")));
                }
                state.lines.retain(|l| {
                    l["patchline"]["source"][0] != varname.as_str()
                        && l["patchline"]["destination"][0] != varname.as_str()
                });
                Ok(json!({"removed": varname}))
            }
            "connect_objects" => {
                let line = json!({"patchline": {
                    "source": [payload["src_varname"], payload["outlet_idx"]],
                    "destination": [payload["dst_varname"], payload["inlet_idx"]],
                }});
                state.lines.push(line);
                Ok(json!({"connected": true}))
            }
            "disconnect_objects" => {
                let source = json!([payload["src_varname"], payload["outlet_idx"]]);
                let destination = json!([payload["dst_varname"], payload["inlet_idx"]]);
                state.lines.retain(|l| {
                    l["patchline"]["source"] != source || l["patchline"]["destination"] != destination
                });
                Ok(json!({"disconnected": true}))
            }
            "move_object" => {
                for entry in state.boxes.iter_mut() {
                    if entry["box"]["varname"] == varname.as_str() {
                        entry["box"]["patching_rect"][0] = payload["x"].clone();
                        entry["box"]["patching_rect"][1] = payload["y"].clone();
                    }
                }
                Ok(json!({"moved": varname}))
            }
            _ => Ok(json!({"ok": true})),
        }
    }
}

fn array_of(value: &JsonValue, key: &str) -> Vec<JsonValue> {
    value[key].as_array().cloned().unwrap_or_default()
}

#[async_trait]
impl Transport for FakePeer {
    async fn connect(&self, _handshake: &Handshake, inbound: mpsc::UnboundedSender<Frame>) -> Result<()> {
        let reject = {
            let state = self.state.lock();
            if state.refuse_connections {
                return Err(Error::Transport("connection refused".to_string()));
            }
            state.reject_handshake
        };
        if reject {
            let _ = inbound.send(Frame::new("handshake_rejected", json!({"message": "invalid token"})));
        }
        *self.inbound.lock() = Some(inbound);
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn emit(&self, frame: Frame) -> Result<()> {
        if !self.is_connected() {
            return Err(Error::Transport("not connected".to_string()));
        }
        if frame.event != "request" {
            self.state.lock().requests.push(frame.data);
            return Ok(());
        }

        let request_id = frame.data["request_id"].as_str().unwrap_or_default().to_string();
        let action = frame.data["action"].as_str().unwrap_or_default().to_string();
        let (reply, delay) = {
            let mut state = self.state.lock();
            state.requests.push(frame.data.clone());
            if state.dropped.contains(&action) || state.reject_handshake {
                return Ok(());
            }
            let delay = state.delays.get(&action).copied().unwrap_or_default();
            let reply = match Self::respond(&mut state, &action, &frame.data["payload"]) {
                Ok(results) => json!({
                    "protocol_version": "2.0",
                    "request_id": request_id,
                    "state": "succeeded",
                    "results": results,
                }),
                Err((code, message)) => json!({
                    "protocol_version": "2.0",
                    "request_id": request_id,
                    "state": "failed",
                    "error": {"code": code, "message": message, "recoverable": true, "details": {}},
                }),
            };
            (reply, delay)
        };

        let sender = self.inbound.lock().clone();
        if let Some(sender) = sender {
            tokio::spawn(async move {
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                let _ = sender.send(Frame::new("response", reply));
            });
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn disconnect(&self) {
        self.kill();
    }
}

pub(crate) fn test_auth() -> ResolvedAuth {
    ResolvedAuth {
        token: Some("test-token".to_string()),
        source: TokenSource::Override,
        token_file: std::env::temp_dir().join("maxbridge-test-token"),
        required: true,
    }
}

/// Config with all state under the system temp dir; runtime tests use [`test_config_in`].
pub(crate) fn test_config() -> BridgeConfig {
    test_config_in(&std::env::temp_dir().join("maxbridge-tests"))
}

pub(crate) fn test_config_in(dir: &Path) -> BridgeConfig {
    let mut config = BridgeConfig {
        state_dir: dir.to_path_buf(),
        ..BridgeConfig::default()
    };
    config.connection.connect_retries = 0;
    config.connection.connect_retry_delay_ms = 10;
    config.runtime.session_id = Some("testsession".to_string());
    config.runtime.capture_backoff_ms = 10;
    config.runtime.capture_timeout_ms = 300;
    config.hygiene.window_scan = false;
    config.finalize()
}

pub(crate) async fn connected_bridge(config: BridgeConfig) -> (Arc<BridgeConnection>, Arc<FakePeer>) {
    connect_with_peer(config, FakePeer::new()).await
}

pub(crate) async fn connect_with_peer(
    config: BridgeConfig,
    peer: Arc<FakePeer>,
) -> (Arc<BridgeConnection>, Arc<FakePeer>) {
    let bridge = Arc::new(BridgeConnection::new(&config, peer.clone(), test_auth()));
    bridge.connect().await.unwrap();
    (bridge, peer)
}

/// Runtime over a connected fake peer with all session state under `dir`.
pub(crate) async fn runtime_with_peer(dir: &Path) -> (Arc<RuntimeManager>, Arc<FakePeer>) {
    runtime_with(test_config_in(dir), FakePeer::new()).await
}

pub(crate) async fn runtime_with(config: BridgeConfig, peer: Arc<FakePeer>) -> (Arc<RuntimeManager>, Arc<FakePeer>) {
    let (bridge, peer) = connect_with_peer(config.clone(), peer).await;
    let runtime = RuntimeManager::new(bridge, &config, None).unwrap();
    (runtime, peer)
}

#[derive(Default)]
struct ProbeState {
    processes: Vec<RawProcess>,
    listener: Option<u32>,
    windows: Option<Vec<RawWindow>>,
    denied: HashSet<u32>,
    table_reads: usize,
}

/// Scripted process table. Signals remove the target unless it is denied.
pub(crate) struct FakeProbe {
    state: Mutex<ProbeState>,
}

impl FakeProbe {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(ProbeState::default()),
        })
    }

    pub fn add_process(&self, process: RawProcess) {
        self.state.lock().processes.push(process);
    }

    pub fn set_listener(&self, pid: u32) {
        self.state.lock().listener = Some(pid);
    }

    pub fn set_windows(&self, windows: Vec<(String, String)>) {
        self.state.lock().windows = Some(
            windows
                .into_iter()
                .map(|(name, path)| RawWindow { name, path })
                .collect(),
        );
    }

    pub fn deny_signals(&self, pid: u32) {
        self.state.lock().denied.insert(pid);
    }

    pub fn is_alive(&self, pid: u32) -> bool {
        self.state.lock().processes.iter().any(|p| p.pid == pid)
    }

    pub fn table_reads(&self) -> usize {
        self.state.lock().table_reads
    }
}

#[async_trait]
impl ProcessProbe for FakeProbe {
    async fn process_table(&self) -> Result<Vec<RawProcess>> {
        let mut state = self.state.lock();
        state.table_reads += 1;
        Ok(state.processes.clone())
    }

    async fn listener_pid(&self, _port: u16) -> Option<u32> {
        self.state.lock().listener
    }

    async fn open_documents(&self) -> std::result::Result<Vec<RawWindow>, String> {
        self.state
            .lock()
            .windows
            .clone()
            .ok_or_else(|| "unsupported_platform".to_string())
    }

    async fn signal(&self, pid: u32, _signal: Signal) -> std::result::Result<(), SignalError> {
        let mut state = self.state.lock();
        if state.denied.contains(&pid) {
            return Err(SignalError::PermissionDenied);
        }
        let before = state.processes.len();
        state.processes.retain(|p| p.pid != pid);
        if state.processes.len() == before {
            return Err(SignalError::NoSuchProcess);
        }
        Ok(())
    }

    async fn pid_exists(&self, pid: u32) -> bool {
        self.is_alive(pid)
    }
}
