//! Shared fixtures for integration tests.
//!
//! - [`MockQmpServer`]: scripted QMP endpoint on a Unix socket
//! - [`MockEngine`]: in-process storage engine that always succeeds or fails
//! - [`MockRpcServer`]: JSON-RPC endpoint answering with a canned reply

#![allow(dead_code)]

use async_trait::async_trait;
use nvme_hotplug::engine::{EngineError, EngineResult, StorageEngine};
use nvme_hotplug::listener::ListenerParams;
use nvme_hotplug::store::{
    NvmeController, NvmeControllerSpec, NvmeControllerStatus, NvmeSubsystem, PcieEndpoint,
    ResourceStore, resource_id_to_volume_name,
};
use serde_json::{Value, json};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{UnixListener, UnixStream};
use tokio::task::JoinHandle;

// =============================================================================
// Fixture Values
// =============================================================================

pub const TEST_CONTROLLER_ID: &str = "nvme-43";
pub const TEST_SUBSYSTEM_ID: &str = "subsystem0";
pub const TEST_NQN: &str = "nqn.2022-09.io.spdk:opi2";
pub const MONITOR_TIMEOUT: Duration = Duration::from_millis(500);
pub const POLL_STEP: Duration = Duration::from_millis(10);

pub fn test_controller_name() -> String {
    resource_id_to_volume_name(TEST_CONTROLLER_ID)
}

pub fn test_subsystem_name() -> String {
    resource_id_to_volume_name(TEST_SUBSYSTEM_ID)
}

pub fn test_subsystem() -> NvmeSubsystem {
    NvmeSubsystem {
        name: test_subsystem_name(),
        nqn: TEST_NQN.to_string(),
    }
}

/// Controller as a caller submits it for attach.
pub fn test_controller(physical_function: i32) -> NvmeController {
    NvmeController {
        name: String::new(),
        spec: NvmeControllerSpec {
            subsystem_id: Some(test_subsystem_name()),
            pcie_id: Some(PcieEndpoint {
                physical_function,
                virtual_function: 0,
            }),
            nvme_controller_id: 43,
        },
        status: NvmeControllerStatus { active: true },
    }
}

/// Store holding the test subsystem.
pub async fn store_with_subsystem() -> Arc<ResourceStore> {
    let store = Arc::new(ResourceStore::new());
    store.insert_subsystem(test_subsystem()).await;
    store
}

// =============================================================================
// Mock QMP Server
// =============================================================================

pub const GREETING: &str = concat!(
    r#"{"QMP": {"version": {"qemu": {"micro": 0, "minor": 2, "major": 8}, "package": ""}, "#,
    r#""capabilities": []}}"#,
);

/// One `query-pci` device entry with every field QEMU reports.
pub fn pci_device(bus: i64, slot: i64, qdev_id: &str) -> Value {
    json!({
        "bus": bus,
        "slot": slot,
        "function": 0,
        "class_info": {"class": 264, "desc": "NVMe"},
        "id": {"device": 16, "vendor": 19540},
        "irq_pin": 0,
        "qdev_id": qdev_id,
        "regions": [],
    })
}

/// Payload of a `DEVICE_DELETED` event for `id`.
pub fn device_deleted_data(id: &str) -> Value {
    json!({"device": id, "path": format!("/machine/peripheral/{id}")})
}

/// Payload of an `RTC_CHANGE` event.
pub fn rtc_change_data() -> Value {
    json!({"offset": 78, "qom-path": "/machine/unattached/device[8]"})
}

#[derive(Debug, Clone)]
enum ExpectedArgs {
    Empty,
    DeviceAdd {
        id: String,
        subsystem_id: String,
        bus: Option<String>,
        addr: Option<String>,
    },
    DeviceDel {
        id: String,
    },
}

#[derive(Debug, Clone)]
struct ExpectedCall {
    execute: &'static str,
    args: ExpectedArgs,
    response: Value,
    events_before: Vec<Value>,
}

/// Drops `null` members so optional fields compare the same whether they
/// were omitted or sent as `null`.
fn without_nulls(arguments: &Value) -> Value {
    match arguments {
        Value::Object(map) => Value::Object(
            map.iter()
                .filter(|(_, v)| !v.is_null())
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        ),
        other => other.clone(),
    }
}

impl ExpectedCall {
    fn matches(&self, command: &Value, test_dir: &Path) -> bool {
        if command["execute"] != self.execute {
            return false;
        }
        let arguments = without_nulls(&command["arguments"]);
        match &self.args {
            ExpectedArgs::Empty => {
                arguments.is_null() || arguments.as_object().is_some_and(|m| m.is_empty())
            }
            ExpectedArgs::DeviceAdd {
                id,
                subsystem_id,
                bus,
                addr,
            } => {
                let socket = test_dir.join(subsystem_id).join("cntrl");
                let mut expected = json!({
                    "driver": "vfio-user-pci",
                    "id": id,
                    "socket": {"type": "unix", "path": socket.to_string_lossy()},
                });
                if let Some(bus) = bus {
                    expected["bus"] = json!(bus);
                }
                if let Some(addr) = addr {
                    expected["addr"] = json!(addr);
                }
                arguments == expected
            }
            ExpectedArgs::DeviceDel { id } => arguments == json!({ "id": id }),
        }
    }
}

/// Ordered QMP calls the mock server expects.
#[derive(Debug, Clone, Default)]
pub struct MockQmpCalls {
    calls: Vec<ExpectedCall>,
}

impl MockQmpCalls {
    pub fn new() -> Self {
        Self::default()
    }

    fn push(mut self, execute: &'static str, args: ExpectedArgs, response: Value) -> Self {
        self.calls.push(ExpectedCall {
            execute,
            args,
            response,
            events_before: Vec::new(),
        });
        self
    }

    /// `device_add` without bus placement.
    pub fn expect_add_nvme_controller(self, id: &str, subsystem_id: &str) -> Self {
        self.push(
            "device_add",
            ExpectedArgs::DeviceAdd {
                id: id.to_string(),
                subsystem_id: subsystem_id.to_string(),
                bus: None,
                addr: None,
            },
            json!({"return": {}}),
        )
    }

    /// `device_add` on `bus` at `slot`.
    pub fn expect_add_nvme_controller_with_address(
        self,
        id: &str,
        subsystem_id: &str,
        bus: &str,
        slot: u32,
    ) -> Self {
        self.push(
            "device_add",
            ExpectedArgs::DeviceAdd {
                id: id.to_string(),
                subsystem_id: subsystem_id.to_string(),
                bus: Some(bus.to_string()),
                addr: Some(format!("{slot:#x}")),
            },
            json!({"return": {}}),
        )
    }

    /// `query-pci` reporting `id` on bus 0.
    pub fn expect_query_pci(self, id: &str) -> Self {
        self.push(
            "query-pci",
            ExpectedArgs::Empty,
            json!({"return": [{
                "bus": 0,
                "devices": [pci_device(0, 0, ""), pci_device(0, 11, id)],
            }]}),
        )
    }

    /// `query-pci` reporting no hot-plugged device.
    pub fn expect_no_device_query_pci(self) -> Self {
        self.push(
            "query-pci",
            ExpectedArgs::Empty,
            json!({"return": [{
                "bus": 0,
                "devices": [pci_device(0, 0, "")],
            }]}),
        )
    }

    /// `device_del` for `id`.
    pub fn expect_delete_nvme_controller(self, id: &str) -> Self {
        self.push(
            "device_del",
            ExpectedArgs::DeviceDel { id: id.to_string() },
            json!({"return": {}}),
        )
    }

    /// Makes the last expected call fail.
    pub fn with_error_response(mut self) -> Self {
        if let Some(call) = self.calls.last_mut() {
            call.response = json!({"error": {"class": "GenericError", "desc": "mock error"}});
        }
        self
    }

    /// Sends an asynchronous event before answering the last expected call.
    pub fn with_event_before(mut self, event: &str, data: Value) -> Self {
        if let Some(call) = self.calls.last_mut() {
            call.events_before.push(json!({
                "event": event,
                "data": data,
                "timestamp": {"seconds": 1, "microseconds": 0},
            }));
        }
        self
    }
}

#[derive(Debug, Default)]
struct MockState {
    calls: Vec<ExpectedCall>,
    next: usize,
    unexpected: Vec<String>,
}

/// Scripted QMP endpoint living in its own temporary directory.
///
/// The directory doubles as the controller base dir for the test.
pub struct MockQmpServer {
    temp_dir: TempDir,
    socket_path: PathBuf,
    state: Arc<Mutex<MockState>>,
    handle: JoinHandle<()>,
}

impl MockQmpServer {
    /// Starts a server expecting `calls` in order.
    pub fn start(calls: MockQmpCalls) -> Self {
        let temp_dir = TempDir::new().unwrap();
        let socket_path = temp_dir.path().join("qmp.sock");
        let listener = UnixListener::bind(&socket_path).unwrap();
        let state = Arc::new(Mutex::new(MockState {
            calls: calls.calls,
            ..MockState::default()
        }));

        let test_dir = temp_dir.path().to_path_buf();
        let server_state = Arc::clone(&state);
        let handle = tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let state = Arc::clone(&server_state);
                let test_dir = test_dir.clone();
                tokio::spawn(serve_qmp_connection(stream, state, test_dir));
            }
        });

        Self {
            temp_dir,
            socket_path,
            state,
            handle,
        }
    }

    /// QMP socket path.
    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Temporary directory holding the socket; used as controller base dir.
    pub fn test_dir(&self) -> &Path {
        self.temp_dir.path()
    }

    /// True if every expected call arrived, in order, and nothing else did.
    pub fn were_expected_calls_performed(&self) -> bool {
        let state = self.state.lock().unwrap();
        if !state.unexpected.is_empty() {
            eprintln!("unexpected QMP commands: {:?}", state.unexpected);
        }
        state.next == state.calls.len() && state.unexpected.is_empty()
    }
}

impl Drop for MockQmpServer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// Removes every complete JSON value from the front of `buf`.
pub fn drain_json_values(buf: &mut Vec<u8>) -> Vec<Value> {
    let mut values = Vec::new();
    let consumed = {
        let mut stream =
            serde_json::Deserializer::from_slice(buf.as_slice()).into_iter::<Value>();
        let mut consumed = 0;
        loop {
            match stream.next() {
                Some(Ok(value)) => {
                    values.push(value);
                    consumed = stream.byte_offset();
                }
                Some(Err(e)) if e.is_eof() => break consumed,
                Some(Err(_)) | None => break buf.len(),
            }
        }
    };
    buf.drain(..consumed);
    values
}

async fn serve_qmp_connection(stream: UnixStream, state: Arc<Mutex<MockState>>, test_dir: PathBuf) {
    let (mut reader, mut writer) = stream.into_split();

    if writer
        .write_all(format!("{GREETING}\n").as_bytes())
        .await
        .is_err()
    {
        return;
    }

    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];
    loop {
        match reader.read(&mut chunk).await {
            Ok(0) | Err(_) => return,
            Ok(n) => buf.extend_from_slice(&chunk[..n]),
        }

        for command in drain_json_values(&mut buf) {
            let mut replies = Vec::new();
            let mut response = if command["execute"] == "qmp_capabilities" {
                json!({"return": {}})
            } else {
                let mut state = state.lock().unwrap();
                let next = state.next;
                match state.calls.get(next).cloned() {
                    Some(call) if call.matches(&command, &test_dir) => {
                        state.next += 1;
                        replies.extend(call.events_before);
                        call.response
                    }
                    _ => {
                        state.unexpected.push(command.to_string());
                        json!({"error": {"class": "GenericError", "desc": "unexpected command"}})
                    }
                }
            };
            if let Some(id) = command.get("id") {
                response["id"] = id.clone();
            }
            replies.push(response);

            for reply in replies {
                if writer
                    .write_all(format!("{reply}\n").as_bytes())
                    .await
                    .is_err()
                {
                    return;
                }
            }
        }
    }
}

// =============================================================================
// Mock Storage Engine
// =============================================================================

/// Storage engine recording every call.
#[derive(Debug, Default)]
pub struct MockEngine {
    fail: bool,
    calls: Mutex<Vec<(String, ListenerParams)>>,
}

impl MockEngine {
    /// Engine whose calls all succeed.
    pub fn succeeding() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Engine whose calls all fail.
    pub fn failing() -> Arc<Self> {
        Arc::new(Self {
            fail: true,
            calls: Mutex::new(Vec::new()),
        })
    }

    /// Method names called so far.
    pub fn methods(&self) -> Vec<String> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .map(|(method, _)| method.clone())
            .collect()
    }

    /// Parameters of every call so far.
    pub fn params(&self) -> Vec<ListenerParams> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .map(|(_, params)| params.clone())
            .collect()
    }

    fn record(&self, method: &str, params: &ListenerParams) -> EngineResult<()> {
        self.calls
            .lock()
            .unwrap()
            .push((method.to_string(), params.clone()));
        if self.fail {
            return Err(EngineError::Rpc {
                code: -32603,
                message: "some internal error".to_string(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl StorageEngine for MockEngine {
    async fn add_listener(&self, params: &ListenerParams) -> EngineResult<()> {
        self.record("nvmf_subsystem_add_listener", params)
    }

    async fn remove_listener(&self, params: &ListenerParams) -> EngineResult<()> {
        self.record("nvmf_subsystem_remove_listener", params)
    }
}

// =============================================================================
// Mock JSON-RPC Server
// =============================================================================

/// JSON-RPC endpoint building each reply from the received request.
pub struct MockRpcServer {
    temp_dir: TempDir,
    socket_path: PathBuf,
    requests: Arc<Mutex<Vec<Value>>>,
    handle: JoinHandle<()>,
}

impl MockRpcServer {
    /// Starts a server answering with `reply(request)`.
    ///
    /// Replies are written in two chunks without a trailing newline.
    pub fn start<F>(reply: F) -> Self
    where
        F: Fn(&Value) -> Value + Send + Sync + 'static,
    {
        let temp_dir = TempDir::new().unwrap();
        let socket_path = temp_dir.path().join("spdk.sock");
        let listener = UnixListener::bind(&socket_path).unwrap();
        let requests = Arc::new(Mutex::new(Vec::new()));
        let reply = Arc::new(reply);

        let server_requests = Arc::clone(&requests);
        let handle = tokio::spawn(async move {
            while let Ok((mut stream, _)) = listener.accept().await {
                let requests = Arc::clone(&server_requests);
                let reply = Arc::clone(&reply);
                tokio::spawn(async move {
                    let Some(request) = read_json(&mut stream).await else {
                        return;
                    };
                    requests.lock().unwrap().push(request.clone());
                    let body = reply(&request).to_string().into_bytes();
                    let (head, tail) = body.split_at(body.len() / 2);
                    let _ = stream.write_all(head).await;
                    let _ = stream.flush().await;
                    tokio::time::sleep(Duration::from_millis(5)).await;
                    let _ = stream.write_all(tail).await;
                });
            }
        });

        Self {
            temp_dir,
            socket_path,
            requests,
            handle,
        }
    }

    /// Socket path.
    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Requests received so far.
    pub fn requests(&self) -> Vec<Value> {
        self.requests.lock().unwrap().clone()
    }
}

impl Drop for MockRpcServer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

async fn read_json(stream: &mut UnixStream) -> Option<Value> {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 1024];
    loop {
        let n = stream.read(&mut chunk).await.ok()?;
        if n == 0 {
            return None;
        }
        buf.extend_from_slice(&chunk[..n]);
        match serde_json::from_slice(&buf) {
            Ok(value) => return Some(value),
            Err(e) if e.is_eof() => continue,
            Err(_) => return None,
        }
    }
}
