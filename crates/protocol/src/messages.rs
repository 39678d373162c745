//! Protocol message definitions
//!
//! Requests are a closed set and serialize with an `action` discriminator.
//! Everything the broker sends back is a loosely typed JSON object; it is kept
//! as a [`Frame`] so unknown fields survive, and [`Frame::message`] gives a
//! typed view keyed on the `event` or `result` discriminator.

use crate::types::RawDevice;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

/// `result` value reported for a successful request
pub const RESULT_OK: &str = "ok";

/// Event names pushed (or embedded in replies) by the broker
pub mod events {
    /// Device was passed through to a VM
    pub const USB_ATTACHED: &str = "usb_attached";
    /// Device was taken away from its VM
    pub const USB_DETACHED: &str = "usb_detached";
    /// A newly plugged device needs the user to pick a VM
    pub const USB_SELECT_VM: &str = "usb_select_vm";
}

/// Requests sent to the broker
///
/// Serialized as `{"action": "<snake_case name>", ...fields}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum Request {
    /// Subscribe this connection to push notifications
    EnableNotifications,

    /// Request the current device list
    UsbList,

    /// Pass a device through to a VM
    UsbAttach {
        /// Kernel device node, e.g. `/dev/bus/usb/001/004`
        device_node: String,
        /// Target VM name
        vm: String,
    },

    /// Detach a device from whatever VM holds it
    UsbDetach {
        /// Kernel device node
        device_node: String,
    },
}

impl Request {
    /// Wire name of the action
    pub fn action(&self) -> &'static str {
        match self {
            Request::EnableNotifications => "enable_notifications",
            Request::UsbList => "usb_list",
            Request::UsbAttach { .. } => "usb_attach",
            Request::UsbDetach { .. } => "usb_detach",
        }
    }
}

/// One decoded frame received from the broker
///
/// Always a JSON object. Fields are preserved verbatim, including ones this
/// crate does not know about.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Frame(Map<String, Value>);

impl Frame {
    /// Create an empty frame
    pub fn new() -> Self {
        Self(Map::new())
    }

    /// Builder-style field insertion
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.0.insert(key.into(), value.into());
        self
    }

    /// Get a raw field
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    /// Borrow the underlying JSON object
    pub fn as_map(&self) -> &Map<String, Value> {
        &self.0
    }

    /// Take the underlying JSON object
    pub fn into_map(self) -> Map<String, Value> {
        self.0
    }

    /// The `result` discriminator, if present and a string
    pub fn result(&self) -> Option<&str> {
        self.0.get("result").and_then(Value::as_str)
    }

    /// The `event` discriminator, if present and a string
    pub fn event(&self) -> Option<&str> {
        self.0.get("event").and_then(Value::as_str)
    }

    /// True when the broker answered `result: ok`
    pub fn is_ok(&self) -> bool {
        self.result() == Some(RESULT_OK)
    }

    /// Success check for attach/detach replies
    ///
    /// The broker confirms either with `result: ok` or with the matching
    /// event embedded in the reply; both count.
    pub fn is_success(&self) -> bool {
        self.is_ok()
            || matches!(
                self.event(),
                Some(events::USB_ATTACHED) | Some(events::USB_DETACHED)
            )
    }

    /// Typed view of this frame
    ///
    /// `event` takes precedence over `result`, since pushes are identified by
    /// their event name.
    pub fn message(&self) -> Message {
        if let Some(name) = self.0.get("event") {
            return Message::Event(Event::from_frame(name, self));
        }

        match self.0.get("result") {
            Some(Value::String(result)) if result == RESULT_OK => Message::Ok,
            Some(Value::String(result)) => Message::Failed {
                result: result.clone(),
            },
            Some(other) => Message::Failed {
                result: other.to_string(),
            },
            None => Message::Unrecognized,
        }
    }
}

impl From<Map<String, Value>> for Frame {
    fn from(map: Map<String, Value>) -> Self {
        Self(map)
    }
}

impl fmt::Display for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match serde_json::to_string(&self.0) {
            Ok(json) => f.write_str(&json),
            Err(_) => write!(f, "{:?}", self.0),
        }
    }
}

/// Typed view of a broker frame, decoded by discriminator
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    /// `{"result": "ok", ...}`
    Ok,
    /// `{"result": <anything else>, ...}`
    Failed { result: String },
    /// `{"event": <name>, ...}`
    Event(Event),
    /// Neither `event` nor `result` present
    Unrecognized,
}

/// Events carried by push frames
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    /// Device was passed through to a VM
    UsbAttached {
        device_node: Option<String>,
        vm: Option<String>,
    },
    /// Device was detached
    UsbDetached { device_node: Option<String> },
    /// Broker asks the user to choose a VM for a newly plugged device
    UsbSelectVm {
        usb_device: RawDevice,
        allowed_vms: Vec<String>,
    },
    /// Any other event name (device list changed, removal, ...)
    Other(String),
}

impl Event {
    fn from_frame(name: &Value, frame: &Frame) -> Self {
        let string_field = |key: &str| frame.get(key).and_then(Value::as_str).map(str::to_string);

        match name.as_str() {
            Some(events::USB_ATTACHED) => Event::UsbAttached {
                device_node: string_field("device_node"),
                vm: string_field("vm"),
            },
            Some(events::USB_DETACHED) => Event::UsbDetached {
                device_node: string_field("device_node"),
            },
            Some(events::USB_SELECT_VM) => Event::UsbSelectVm {
                usb_device: frame
                    .get("usb_device")
                    .and_then(|device| serde_json::from_value(device.clone()).ok())
                    .unwrap_or_default(),
                allowed_vms: frame
                    .get("allowed_vms")
                    .and_then(Value::as_array)
                    .map(|vms| {
                        vms.iter()
                            .filter_map(Value::as_str)
                            .map(str::to_string)
                            .collect()
                    })
                    .unwrap_or_default(),
            },
            Some(other) => Event::Other(other.to_string()),
            None => Event::Other(name.to_string()),
        }
    }

    /// Wire name of the event
    pub fn name(&self) -> &str {
        match self {
            Event::UsbAttached { .. } => events::USB_ATTACHED,
            Event::UsbDetached { .. } => events::USB_DETACHED,
            Event::UsbSelectVm { .. } => events::USB_SELECT_VM,
            Event::Other(name) => name,
        }
    }
}
