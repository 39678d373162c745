//! Test utilities for the USB passthrough client
//!
//! Provides an in-process broker speaking the wire protocol and a connector
//! that hands out in-memory streams to it. Compiled for this crate's own
//! tests and, through the `test-utils` feature, for downstream dev builds.

use crate::connector::Connector;
use protocol::{Frame, FrameDecoder, ProtocolError, RESULT_OK, read_frame_async, write_frame_async};
use serde_json::{Value, json};
use std::collections::HashMap;
use std::future::Future;
use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, DuplexStream};
use tokio::sync::{broadcast, watch};
use tracing::debug;

/// Default test timeout (5 seconds)
pub const DEFAULT_TEST_TIMEOUT: Duration = Duration::from_secs(5);

/// In-memory pipe capacity used by [`MockConnector`]
const PIPE_CAPACITY: usize = 64 * 1024;

/// Build a raw device object as the broker would list it
pub fn create_mock_device(device_node: &str, product_name: &str, allowed_vms: &[&str]) -> Value {
    json!({
        "device_node": device_node,
        "product_name": product_name,
        "allowed_vms": allowed_vms,
    })
}

/// Run a future with [`DEFAULT_TEST_TIMEOUT`], panicking if it elapses
pub async fn with_timeout<F: Future>(future: F) -> F::Output {
    match tokio::time::timeout(DEFAULT_TEST_TIMEOUT, future).await {
        Ok(output) => output,
        Err(_) => panic!("test operation timed out after {:?}", DEFAULT_TEST_TIMEOUT),
    }
}

#[derive(Default)]
struct BrokerState {
    devices: Vec<Value>,
    /// Fixed replies per action, overriding the built-in behavior
    replies: HashMap<String, Value>,
    /// Remaining number of times to drop the connection instead of replying
    hang_ups: HashMap<String, usize>,
    requests: Vec<Frame>,
}

struct Inner {
    state: Mutex<BrokerState>,
    pushes: broadcast::Sender<Vec<u8>>,
    /// Bumped to close every open connection
    kick: watch::Sender<u64>,
    connections: AtomicUsize,
}

/// Scriptable in-process broker
///
/// Default behavior per action:
/// - `enable_notifications`: `{"result":"ok"}`, connection starts receiving pushes
/// - `usb_list`: `{"result":"ok","usb_devices":[...]}`
/// - `usb_attach` / `usb_detach`: update the device's `vm`, `{"result":"ok"}`
/// - anything else: `{"result":"error","error":"unknown action"}`
#[derive(Clone)]
pub struct MockBroker {
    inner: Arc<Inner>,
}

impl Default for MockBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl MockBroker {
    pub fn new() -> Self {
        let (pushes, _) = broadcast::channel(64);
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(BrokerState::default()),
                pushes,
                kick: watch::Sender::new(0),
                connections: AtomicUsize::new(0),
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, BrokerState> {
        match self.inner.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Replace the device list
    pub fn set_devices(&self, devices: Vec<Value>) {
        self.state().devices = devices;
    }

    /// Current device list, including `vm` changes made by attach/detach
    pub fn devices(&self) -> Vec<Value> {
        self.state().devices.clone()
    }

    /// Always answer `action` with `reply`
    pub fn set_reply(&self, action: &str, reply: Value) {
        self.state().replies.insert(action.to_string(), reply);
    }

    /// Drop the connection instead of answering the next `times` `action` requests
    pub fn hang_up_on(&self, action: &str, times: usize) {
        self.state().hang_ups.insert(action.to_string(), times);
    }

    /// Every request received so far, in order
    pub fn requests(&self) -> Vec<Frame> {
        self.state().requests.clone()
    }

    /// Number of requests received for `action`
    pub fn request_count(&self, action: &str) -> usize {
        self.state()
            .requests
            .iter()
            .filter(|r| r.get("action").and_then(Value::as_str) == Some(action))
            .count()
    }

    /// Number of connections accepted so far
    pub fn connections(&self) -> usize {
        self.inner.connections.load(Ordering::SeqCst)
    }

    /// Number of connections currently subscribed to pushes
    pub fn subscribers(&self) -> usize {
        self.inner.pushes.receiver_count()
    }

    /// Send a push frame to every subscribed connection
    pub fn push(&self, event: Value) -> usize {
        let mut bytes = event.to_string().into_bytes();
        bytes.push(protocol::FRAME_DELIMITER);
        self.push_raw(bytes)
    }

    /// Send raw bytes to every subscribed connection
    pub fn push_raw(&self, bytes: impl Into<Vec<u8>>) -> usize {
        self.inner.pushes.send(bytes.into()).unwrap_or(0)
    }

    /// Close every open connection
    pub fn disconnect_all(&self) {
        self.inner.kick.send_modify(|generation| *generation += 1);
    }

    /// Wait until at least `count` connections are subscribed
    pub async fn wait_for_subscribers(&self, count: usize) {
        with_timeout(async {
            while self.subscribers() < count {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
    }

    /// Serve one connection until the peer closes it
    pub async fn serve<S>(&self, stream: S) -> io::Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        self.inner.connections.fetch_add(1, Ordering::SeqCst);

        let mut kicked = self.inner.kick.subscribe();
        let (mut reader, mut writer) = tokio::io::split(stream);
        let mut decoder = FrameDecoder::new();
        let mut pushes: Option<broadcast::Receiver<Vec<u8>>> = None;

        loop {
            tokio::select! {
                request = read_frame_async(&mut reader, &mut decoder) => {
                    let frame = match request {
                        Ok(Some(frame)) => frame,
                        Ok(None) => return Ok(()),
                        Err(e) if e.is_recoverable() => {
                            debug!("Mock broker skipped malformed request: {}", e);
                            continue;
                        }
                        Err(ProtocolError::Io(e)) => return Err(e),
                        Err(e) => return Err(io::Error::other(e)),
                    };

                    let Some(reply) = self.handle(&frame) else {
                        debug!("Mock broker hanging up on {}", frame);
                        return Ok(());
                    };

                    if frame.get("action").and_then(Value::as_str) == Some("enable_notifications")
                        && pushes.is_none()
                    {
                        pushes = Some(self.inner.pushes.subscribe());
                    }

                    write_frame_async(&mut writer, &reply)
                        .await
                        .map_err(io::Error::other)?;
                }
                push = next_push(&mut pushes) => {
                    match push {
                        Some(bytes) => {
                            writer.write_all(&bytes).await?;
                            writer.flush().await?;
                        }
                        None => pushes = None,
                    }
                }
                _ = kicked.changed() => {
                    return Ok(());
                }
            }
        }
    }

    /// Compute the reply for one request, or `None` to hang up
    fn handle(&self, request: &Frame) -> Option<Value> {
        let mut state = self.state();
        state.requests.push(request.clone());

        let action = request
            .get("action")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();

        if let Some(remaining) = state.hang_ups.get_mut(&action)
            && *remaining > 0
        {
            *remaining -= 1;
            return None;
        }

        if let Some(reply) = state.replies.get(&action) {
            return Some(reply.clone());
        }

        let device_node = request.get("device_node").cloned().unwrap_or(Value::Null);
        let reply = match action.as_str() {
            "enable_notifications" => json!({"result": RESULT_OK}),
            "usb_list" => json!({"result": RESULT_OK, "usb_devices": state.devices}),
            "usb_attach" => {
                let vm = request.get("vm").cloned().unwrap_or(Value::Null);
                set_device_vm(&mut state.devices, &device_node, vm);
                json!({"result": RESULT_OK})
            }
            "usb_detach" => {
                set_device_vm(&mut state.devices, &device_node, Value::Null);
                json!({"result": RESULT_OK})
            }
            _ => json!({"result": "error", "error": "unknown action"}),
        };

        Some(reply)
    }
}

fn set_device_vm(devices: &mut [Value], device_node: &Value, vm: Value) {
    for device in devices.iter_mut() {
        if device.get("device_node") == Some(device_node)
            && let Some(fields) = device.as_object_mut()
        {
            fields.insert("vm".to_string(), vm.clone());
        }
    }
}

async fn next_push(pushes: &mut Option<broadcast::Receiver<Vec<u8>>>) -> Option<Vec<u8>> {
    let Some(rx) = pushes else {
        return std::future::pending().await;
    };

    loop {
        match rx.recv().await {
            Ok(bytes) => return Some(bytes),
            Err(broadcast::error::RecvError::Lagged(_)) => continue,
            Err(broadcast::error::RecvError::Closed) => return None,
        }
    }
}

/// Connector handing out in-memory streams served by a [`MockBroker`]
///
/// Can be told to refuse a number of connection attempts first.
#[derive(Clone)]
pub struct MockConnector {
    broker: MockBroker,
    failures: Arc<AtomicUsize>,
    attempts: Arc<AtomicUsize>,
}

impl MockConnector {
    pub fn new(broker: MockBroker) -> Self {
        Self::failing(broker, 0)
    }

    /// Refuse the first `failures` connection attempts
    pub fn failing(broker: MockBroker, failures: usize) -> Self {
        Self {
            broker,
            failures: Arc::new(AtomicUsize::new(failures)),
            attempts: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Refuse the next `failures` connection attempts
    pub fn fail_next(&self, failures: usize) {
        self.failures.store(failures, Ordering::SeqCst);
    }

    /// Total connection attempts, refused ones included
    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    pub fn broker(&self) -> &MockBroker {
        &self.broker
    }
}

impl Connector for MockConnector {
    type Stream = DuplexStream;

    async fn connect(&self) -> io::Result<DuplexStream> {
        self.attempts.fetch_add(1, Ordering::SeqCst);

        let refused = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if refused {
            return Err(io::Error::new(
                io::ErrorKind::ConnectionRefused,
                "mock broker refused connection",
            ));
        }

        let (client, server) = tokio::io::duplex(PIPE_CAPACITY);
        let broker = self.broker.clone();
        tokio::spawn(async move {
            if let Err(e) = broker.serve(server).await {
                debug!("Mock broker connection ended: {}", e);
            }
        });

        Ok(client)
    }

    fn describe(&self) -> String {
        "mock broker".to_string()
    }
}
