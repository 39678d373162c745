//! USB passthrough client
//!
//! Talks to the host's USB passthrough broker over vsock (or a Unix socket):
//! lists devices, attaches and detaches them to VMs, and follows the broker's
//! push notifications on a separate, self-healing connection.
//!
//! - [`session::ApiClient`]: one request, one reply
//! - [`listener::NotificationListener`]: long-lived subscription with reconnect
//! - [`registry::Registry`]: labelled device view built from `usb_list`
//! - [`store::DeviceStore`] and [`controller::DeviceController`]: refresh and
//!   attach/detach with retries and optimistic updates

pub mod config;
pub mod controller;
pub mod error;
pub mod listener;
pub mod registry;
pub mod session;
pub mod store;
pub mod transport;

pub use controller::{DeviceController, SelectOutcome};
pub use error::{ApiError, ControlError, RefreshError, Result};
pub use listener::{
    CallbackHandler, ChannelHandler, ListenerConfig, ListenerEvent, ListenerHandle, ListenerState,
    NotificationHandler, NotificationListener,
};
pub use registry::{Device, Registry, SelectVmRequest};
pub use session::ApiClient;
pub use store::{DeviceStore, RefreshPolicy, StoreEvent};
pub use transport::{BrokerConnector, ConnectionState, Transport, UnixConnector, VsockConnector};
