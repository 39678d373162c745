//! Notification listener
//!
//! Keeps a dedicated broker connection subscribed to push notifications and
//! forwards them to a [`NotificationHandler`]. The listener runs for the life
//! of the process: every fault (refused connect, I/O error, broker hang-up)
//! closes the connection and starts over with a fresh one. The first fault of
//! an outage is retried at once; every further fault waits the fixed
//! reconnect delay first. Reaching Listening ends the outage.
//!
//! ```text
//! Disconnected -> Connecting -> AwaitingEnableAck -> Listening
//!       ^______________|_______________|________________|  (fault)
//! ```

use common::Connector;
use protocol::{Event, Frame, Message};
use std::convert::Infallible;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::{JoinError, JoinHandle};
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use crate::error::ApiError;
use crate::registry::SelectVmRequest;
use crate::session::ApiClient;

/// Delay between a fault and the next connection attempt
pub const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_secs(3);

/// Listener lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerState {
    /// Between attempts, or stopped
    Disconnected,
    /// Opening a connection
    Connecting,
    /// Subscription sent, waiting for its reply
    AwaitingEnableAck,
    /// Subscribed and dispatching pushes
    Listening,
}

impl fmt::Display for ListenerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ListenerState::Disconnected => "disconnected",
            ListenerState::Connecting => "connecting",
            ListenerState::AwaitingEnableAck => "awaiting enable ack",
            ListenerState::Listening => "listening",
        };
        f.write_str(name)
    }
}

/// Receives dispatched notifications
///
/// Called from the listener task; implementations must not block.
pub trait NotificationHandler: Send + Sync + 'static {
    /// Device state changed on the broker side
    fn refresh(&self);

    /// The broker wants the user to choose a VM for a device
    fn select_vm(&self, request: SelectVmRequest);
}

impl<T: NotificationHandler> NotificationHandler for Arc<T> {
    fn refresh(&self) {
        (**self).refresh()
    }

    fn select_vm(&self, request: SelectVmRequest) {
        (**self).select_vm(request)
    }
}

/// Handler built from two closures
pub struct CallbackHandler<R, S> {
    on_refresh: R,
    on_select_vm: S,
}

impl<R, S> CallbackHandler<R, S>
where
    R: Fn() + Send + Sync + 'static,
    S: Fn(SelectVmRequest) + Send + Sync + 'static,
{
    pub fn new(on_refresh: R, on_select_vm: S) -> Self {
        Self {
            on_refresh,
            on_select_vm,
        }
    }
}

impl<R, S> NotificationHandler for CallbackHandler<R, S>
where
    R: Fn() + Send + Sync + 'static,
    S: Fn(SelectVmRequest) + Send + Sync + 'static,
{
    fn refresh(&self) {
        (self.on_refresh)()
    }

    fn select_vm(&self, request: SelectVmRequest) {
        (self.on_select_vm)(request)
    }
}

/// Notification as delivered by [`ChannelHandler`]
#[derive(Debug, Clone, PartialEq)]
pub enum ListenerEvent {
    Refresh,
    SelectVm(SelectVmRequest),
}

/// Handler that forwards notifications into an async channel
///
/// Lets the consumer handle them on its own task instead of the listener's.
#[derive(Clone)]
pub struct ChannelHandler {
    tx: async_channel::Sender<ListenerEvent>,
}

impl ChannelHandler {
    pub fn new() -> (Self, async_channel::Receiver<ListenerEvent>) {
        let (tx, rx) = async_channel::unbounded();
        (Self { tx }, rx)
    }

    fn forward(&self, event: ListenerEvent) {
        if self.tx.try_send(event).is_err() {
            debug!("Notification dropped, receiver is gone");
        }
    }
}

impl NotificationHandler for ChannelHandler {
    fn refresh(&self) {
        self.forward(ListenerEvent::Refresh)
    }

    fn select_vm(&self, request: SelectVmRequest) {
        self.forward(ListenerEvent::SelectVm(request))
    }
}

/// Listener settings
#[derive(Debug, Clone)]
pub struct ListenerConfig {
    pub reconnect_delay: Duration,
    pub max_frame_size: Option<usize>,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            reconnect_delay: DEFAULT_RECONNECT_DELAY,
            max_frame_size: None,
        }
    }
}

#[derive(Default)]
struct Shared {
    shutdown: AtomicBool,
    backoffs: AtomicU64,
    dispatched: AtomicU64,
}

/// Long-lived subscriber for broker notifications
pub struct NotificationListener<C, H> {
    connector: C,
    handler: H,
    config: ListenerConfig,
}

impl<C, H> NotificationListener<C, H>
where
    C: Connector,
    H: NotificationHandler,
{
    pub fn new(connector: C, handler: H) -> Self {
        Self {
            connector,
            handler,
            config: ListenerConfig::default(),
        }
    }

    pub fn with_config(mut self, config: ListenerConfig) -> Self {
        self.config = config;
        self
    }

    /// Start the listener on its own task
    pub fn spawn(self) -> ListenerHandle {
        let (state_tx, state_rx) = watch::channel(ListenerState::Disconnected);
        let shared = Arc::new(Shared::default());
        let task = tokio::spawn(self.run(state_tx, shared.clone()));

        ListenerHandle {
            task,
            state: state_rx,
            shared,
        }
    }

    async fn run(self, state: watch::Sender<ListenerState>, shared: Arc<Shared>) {
        let mut client = ApiClient::new(self.connector.clone());
        if let Some(max) = self.config.max_frame_size {
            client = client.with_max_frame_size(max);
        }

        let mut retry_at_once = true;

        loop {
            if shared.shutdown.load(Ordering::Relaxed) {
                info!("Notification listener stopped");
                state.send_replace(ListenerState::Disconnected);
                return;
            }

            state.send_replace(ListenerState::Connecting);
            match self.session(&mut client, &state, &shared).await {
                Err(e) => warn!("Notification listener error: {}", e),
                Ok(never) => match never {},
            }

            if *state.borrow() == ListenerState::Listening {
                retry_at_once = true;
            }

            client.close().await;
            state.send_replace(ListenerState::Disconnected);

            if retry_at_once {
                retry_at_once = false;
                info!("Reconnecting to broker");
                continue;
            }

            shared.backoffs.fetch_add(1, Ordering::Relaxed);

            info!("Reconnecting to broker in {:?}", self.config.reconnect_delay);
            sleep(self.config.reconnect_delay).await;
        }
    }

    /// One connection's worth of listening; only ever returns an error
    async fn session(
        &self,
        client: &mut ApiClient<C>,
        state: &watch::Sender<ListenerState>,
        shared: &Shared,
    ) -> Result<Infallible, ApiError> {
        client.connect().await?;

        state.send_replace(ListenerState::AwaitingEnableAck);
        client.enable_notifications().await?;

        state.send_replace(ListenerState::Listening);
        info!("Listening for broker notifications");

        loop {
            let frame = client.next_frame().await?;
            self.dispatch(frame);
            shared.dispatched.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn dispatch(&self, frame: Frame) {
        info!("Device notification: {}", frame);

        match frame.message() {
            Message::Event(Event::UsbSelectVm {
                usb_device,
                allowed_vms,
            }) => match SelectVmRequest::from_event(usb_device, allowed_vms) {
                Some(request) => self.handler.select_vm(request),
                None => error!("VMs not available to make choice: {}", frame),
            },
            _ => self.handler.refresh(),
        }
    }
}

/// Handle to a running [`NotificationListener`]
pub struct ListenerHandle {
    task: JoinHandle<()>,
    state: watch::Receiver<ListenerState>,
    shared: Arc<Shared>,
}

impl ListenerHandle {
    pub fn state(&self) -> ListenerState {
        *self.state.borrow()
    }

    /// Watch state transitions
    pub fn subscribe(&self) -> watch::Receiver<ListenerState> {
        self.state.clone()
    }

    /// Wait until the listener is in `target`; false if it has exited
    pub async fn wait_for(&mut self, target: ListenerState) -> bool {
        self.state.wait_for(|state| *state == target).await.is_ok()
    }

    /// Number of reconnect delays slept so far
    pub fn backoffs(&self) -> u64 {
        self.shared.backoffs.load(Ordering::Relaxed)
    }

    /// Number of frames handed to the handler so far
    pub fn dispatched(&self) -> u64 {
        self.shared.dispatched.load(Ordering::Relaxed)
    }

    /// Ask the listener to stop
    ///
    /// Checked before each connection attempt, so a healthy connection keeps
    /// listening until its next fault. Use [`abort`](Self::abort) to stop at
    /// once.
    pub fn shutdown(&self) {
        self.shared.shutdown.store(true, Ordering::Relaxed);
    }

    /// Cancel the listener task immediately
    pub fn abort(&self) {
        self.task.abort();
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Wait for the listener task to end
    pub async fn join(self) -> Result<(), JoinError> {
        self.task.await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::test_utils::{MockBroker, MockConnector, with_timeout};
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;

    fn fast() -> ListenerConfig {
        ListenerConfig {
            reconnect_delay: Duration::from_millis(10),
            max_frame_size: None,
        }
    }

    #[test]
    fn test_listener_state_display() {
        assert_eq!(ListenerState::Listening.to_string(), "listening");
        assert_eq!(ListenerState::AwaitingEnableAck.to_string(), "awaiting enable ack");
    }

    #[tokio::test]
    async fn test_listener_subscribes() {
        let broker = MockBroker::new();
        let (handler, _events) = ChannelHandler::new();
        let mut handle = NotificationListener::new(MockConnector::new(broker.clone()), handler)
            .with_config(fast())
            .spawn();

        assert!(with_timeout(handle.wait_for(ListenerState::Listening)).await);
        assert_eq!(broker.request_count("enable_notifications"), 1);
        assert_eq!(handle.backoffs(), 0);
        handle.abort();
    }

    #[tokio::test]
    async fn test_callback_handler_receives_refresh() {
        let broker = MockBroker::new();
        let refreshes = Arc::new(AtomicUsize::new(0));
        let counter = refreshes.clone();
        let handler = CallbackHandler::new(
            move || {
                counter.fetch_add(1, Ordering::SeqCst);
            },
            |_| {},
        );

        let mut handle = NotificationListener::new(MockConnector::new(broker.clone()), handler)
            .with_config(fast())
            .spawn();
        assert!(with_timeout(handle.wait_for(ListenerState::Listening)).await);

        broker.push(json!({"event": "usb_detached", "device_node": "/dev/a"}));
        with_timeout(async {
            while refreshes.load(Ordering::SeqCst) == 0 {
                sleep(Duration::from_millis(5)).await;
            }
        })
        .await;
        assert_eq!(handle.dispatched(), 1);
        handle.abort();
    }

    #[tokio::test]
    async fn test_shutdown_while_unreachable() {
        let connector = MockConnector::failing(MockBroker::new(), usize::MAX);
        let (handler, _events) = ChannelHandler::new();
        let handle = NotificationListener::new(connector.clone(), handler)
            .with_config(fast())
            .spawn();

        with_timeout(async {
            while connector.attempts() < 2 {
                sleep(Duration::from_millis(5)).await;
            }
        })
        .await;

        handle.shutdown();
        with_timeout(handle.join()).await.expect("Failed to join listener");
    }
}
