//! Device types as the broker reports them

use crate::error::{ProtocolError, Result};
use crate::messages::Frame;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// One entry of the broker's `usb_devices` list, before any normalization
///
/// Every field is optional on the wire. Fields this crate does not interpret
/// (vendor/product ids, serials, ...) are kept in `extra`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawDevice {
    /// Kernel device node, unique per device on the broker side
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_node: Option<String>,
    /// Free-text product name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub product_name: Option<String>,
    /// VMs the device may be passed to
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allowed_vms: Option<Vec<String>>,
    /// VM currently holding the device
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vm: Option<String>,
    /// Remaining fields, untouched
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Parsed `usb_list` reply
#[derive(Debug, Default)]
pub struct DeviceList {
    /// Entries that decoded into a [`RawDevice`], in broker order
    pub devices: Vec<RawDevice>,
    /// One error per entry that did not
    pub rejected: Vec<ProtocolError>,
}

impl DeviceList {
    /// Extract the device list from a `usb_list` reply
    ///
    /// A missing `usb_devices` field is an empty list. A field that is not an
    /// array is an error. Individual entries that fail to decode are collected
    /// in `rejected` so one odd device does not hide the others.
    pub fn from_frame(frame: &Frame) -> Result<Self> {
        let entries = match frame.get("usb_devices") {
            None | Some(Value::Null) => return Ok(Self::default()),
            Some(Value::Array(entries)) => entries,
            Some(other) => {
                return Err(ProtocolError::InvalidField {
                    field: "usb_devices",
                    reason: format!("expected an array, got {}", other),
                });
            }
        };

        let mut list = Self::default();
        for entry in entries {
            match serde_json::from_value::<RawDevice>(entry.clone()) {
                Ok(device) => list.devices.push(device),
                Err(e) => list.rejected.push(ProtocolError::InvalidField {
                    field: "usb_devices",
                    reason: format!("{}: {}", e, entry),
                }),
            }
        }

        Ok(list)
    }

    /// Number of decoded devices
    pub fn len(&self) -> usize {
        self.devices.len()
    }

    /// True if no device decoded
    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_raw_device_keeps_unknown_fields() {
        let device: RawDevice = serde_json::from_value(json!({
            "device_node": "/dev/bus/usb/001/004",
            "product_name": "Mass_Storage",
            "vendor_id": "0781",
            "allowed_vms": ["vmA"],
        }))
        .unwrap();

        assert_eq!(device.device_node.as_deref(), Some("/dev/bus/usb/001/004"));
        assert!(device.vm.is_none());
        assert_eq!(device.extra.len(), 1);
        assert_eq!(device.extra["vendor_id"], "0781");
    }

    #[test]
    fn test_null_fields_are_absent() {
        let device: RawDevice =
            serde_json::from_value(json!({"vm": null, "allowed_vms": null})).unwrap();
        assert!(device.vm.is_none());
        assert!(device.allowed_vms.is_none());
    }

    #[test]
    fn test_device_list_from_frame() {
        let frame: Frame = serde_json::from_value(json!({
            "result": "ok",
            "usb_devices": [
                {"device_node": "/dev/a", "product_name": "A"},
                {"device_node": "/dev/b", "product_name": 42},
                {"device_node": "/dev/c", "product_name": "C"}
            ]
        }))
        .unwrap();

        let list = DeviceList::from_frame(&frame).unwrap();
        assert_eq!(list.len(), 2);
        assert_eq!(list.rejected.len(), 1);
        assert_eq!(list.devices[1].device_node.as_deref(), Some("/dev/c"));
    }

    #[test]
    fn test_device_list_missing_field_is_empty() {
        let frame = Frame::new().with("result", "ok");
        let list = DeviceList::from_frame(&frame).unwrap();
        assert!(list.is_empty());
        assert!(list.rejected.is_empty());
    }

    #[test]
    fn test_device_list_wrong_shape() {
        let frame = Frame::new().with("usb_devices", "nope");
        let result = DeviceList::from_frame(&frame);
        assert!(matches!(
            result,
            Err(ProtocolError::InvalidField {
                field: "usb_devices",
                ..
            })
        ));
    }
}
