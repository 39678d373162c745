//! Device registry
//!
//! Turns the broker's raw device list into labelled, display-ready records.
//! Labels are the product name with underscores turned into spaces; colliding
//! names get a `(n)` suffix so every label is unique within one registry.

use protocol::RawDevice;
use serde::Serialize;
use tracing::debug;

/// Pseudo-target meaning "not passed to any VM"
pub const NONE_TARGET: &str = "None";

/// Display name for devices without a usable product name
pub const UNKNOWN_DEVICE: &str = "<unknown device>";

/// Longest product name shown in a VM selection prompt, in characters
pub const SELECTION_NAME_MAX_CHARS: usize = 20;

/// True for the "None" pseudo-target, in any letter case
pub fn is_none_target(vm: &str) -> bool {
    vm.eq_ignore_ascii_case(NONE_TARGET)
}

/// Display form of a product name
///
/// All-digit names carry no information and become [`UNKNOWN_DEVICE`].
pub fn display_name(product_name: &str) -> String {
    if !product_name.is_empty() && product_name.bytes().all(|b| b.is_ascii_digit()) {
        UNKNOWN_DEVICE.to_string()
    } else {
        product_name.replace('_', " ")
    }
}

/// A device as presented to the user
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Device {
    pub device_node: String,
    pub product_name: String,
    /// Never empty; starts with [`NONE_TARGET`] when there are several targets
    pub allowed_vms: Vec<String>,
    /// Current holder, [`NONE_TARGET`] when unattached
    pub vm: String,
}

impl Device {
    pub fn is_attached(&self) -> bool {
        !is_none_target(&self.vm)
    }

    pub fn allows(&self, vm: &str) -> bool {
        self.allowed_vms.iter().any(|allowed| allowed == vm)
    }
}

/// Labelled devices in broker order
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Registry {
    entries: Vec<(String, Device)>,
}

impl Registry {
    /// Build a registry from the broker's device list
    ///
    /// Entries without any allowed VM are skipped, as are entries lacking a
    /// device node or product name.
    pub fn build(devices: impl IntoIterator<Item = RawDevice>) -> Self {
        let mut registry = Self::default();
        let mut next_suffix = 1usize;

        for raw in devices {
            let Some(mut allowed_vms) = raw.allowed_vms.filter(|vms| !vms.is_empty()) else {
                debug!("Skipping device without allowed VMs: {:?}", raw.device_node);
                continue;
            };

            if allowed_vms.len() > 1 && !allowed_vms.iter().any(|vm| is_none_target(vm)) {
                allowed_vms.insert(0, NONE_TARGET.to_string());
            }

            let (Some(device_node), Some(product_name)) = (raw.device_node, raw.product_name)
            else {
                debug!("Skipping device without node or product name");
                continue;
            };

            let vm = raw
                .vm
                .filter(|vm| !vm.is_empty())
                .unwrap_or_else(|| NONE_TARGET.to_string());

            let label = registry.unique_label(display_name(&product_name), &mut next_suffix);
            registry.entries.push((
                label,
                Device {
                    device_node,
                    product_name,
                    allowed_vms,
                    vm,
                },
            ));
        }

        registry
    }

    fn unique_label(&self, name: String, next_suffix: &mut usize) -> String {
        if !self.contains(&name) {
            return name;
        }
        loop {
            let candidate = format!("{}({})", name, next_suffix);
            *next_suffix += 1;
            if !self.contains(&candidate) {
                return candidate;
            }
        }
    }

    pub fn contains(&self, label: &str) -> bool {
        self.get(label).is_some()
    }

    pub fn get(&self, label: &str) -> Option<&Device> {
        self.entries
            .iter()
            .find(|(l, _)| l == label)
            .map(|(_, device)| device)
    }

    /// Look up by device node
    pub fn find_by_node(&self, device_node: &str) -> Option<(&str, &Device)> {
        self.iter().find(|(_, device)| device.device_node == device_node)
    }

    /// Look up by label first, then by device node
    pub fn resolve(&self, label_or_node: &str) -> Option<(&str, &Device)> {
        self.iter()
            .find(|(label, _)| *label == label_or_node)
            .or_else(|| self.find_by_node(label_or_node))
    }

    /// Record a new holder for `label`; false if there is no such device
    pub fn set_vm(&mut self, label: &str, vm: &str) -> bool {
        match self.entries.iter_mut().find(|(l, _)| l == label) {
            Some((_, device)) => {
                device.vm = vm.to_string();
                true
            }
            None => false,
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Device)> {
        self.entries
            .iter()
            .map(|(label, device)| (label.as_str(), device))
    }

    pub fn labels(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(label, _)| label.as_str())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// A pending VM choice pushed by the broker
#[derive(Debug, Clone, PartialEq)]
pub struct SelectVmRequest {
    /// The device object exactly as pushed, unknown fields included
    pub device: RawDevice,
    /// Display form, at most [`SELECTION_NAME_MAX_CHARS`] characters
    pub product_name: String,
    /// Candidate VMs, taken from the event rather than the device entry
    pub allowed_vms: Vec<String>,
    /// Current holder, if any
    pub vm: Option<String>,
}

impl SelectVmRequest {
    /// Build a prompt from a `usb_select_vm` event
    ///
    /// Returns `None` when there are fewer than two VMs to choose from.
    pub fn from_event(usb_device: RawDevice, allowed_vms: Vec<String>) -> Option<Self> {
        if allowed_vms.len() < 2 {
            return None;
        }

        let name = match usb_device.product_name.as_deref() {
            Some(name) if !name.is_empty() => display_name(name),
            _ => UNKNOWN_DEVICE.to_string(),
        };

        Some(Self {
            product_name: name.chars().take(SELECTION_NAME_MAX_CHARS).collect(),
            allowed_vms,
            vm: usb_device.vm.clone().filter(|vm| !vm.is_empty()),
            device: usb_device,
        })
    }

    pub fn device_node(&self) -> Option<&str> {
        self.device.device_node.as_deref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw(node: &str, name: &str, allowed: &[&str], vm: Option<&str>) -> RawDevice {
        RawDevice {
            device_node: Some(node.to_string()),
            product_name: Some(name.to_string()),
            allowed_vms: Some(allowed.iter().map(|s| s.to_string()).collect()),
            vm: vm.map(str::to_string),
            ..Default::default()
        }
    }

    #[test]
    fn test_display_name() {
        assert_eq!(display_name("Mass_Storage_Device"), "Mass Storage Device");
        assert_eq!(display_name("0483"), UNKNOWN_DEVICE);
        assert_eq!(display_name("USB2.0 Hub"), "USB2.0 Hub");
        assert_eq!(display_name(""), "");
    }

    #[test]
    fn test_build_single_vm_device() {
        let registry = Registry::build([raw("/dev/a", "Mass_Storage", &["vmA"], None)]);

        let device = registry.get("Mass Storage").unwrap();
        assert_eq!(device.allowed_vms, vec!["vmA"]);
        assert_eq!(device.vm, NONE_TARGET);
        assert!(!device.is_attached());
    }

    #[test]
    fn test_build_prepends_none_target() {
        let registry = Registry::build([raw("/dev/a", "Keyboard", &["vmA", "vmB"], Some("vmA"))]);

        let device = registry.get("Keyboard").unwrap();
        assert_eq!(device.allowed_vms, vec!["None", "vmA", "vmB"]);
        assert_eq!(device.vm, "vmA");
        assert!(device.is_attached());
    }

    #[test]
    fn test_build_keeps_existing_none_target() {
        let registry = Registry::build([
            raw("/dev/a", "Keyboard", &["vmA", "none"], None),
            raw("/dev/b", "Mouse", &["None", "vmB"], None),
        ]);

        assert_eq!(registry.get("Keyboard").unwrap().allowed_vms, vec!["vmA", "none"]);
        assert_eq!(registry.get("Mouse").unwrap().allowed_vms, vec!["None", "vmB"]);
    }

    #[test]
    fn test_build_skips_devices_without_targets() {
        let mut no_field = raw("/dev/c", "Camera", &[], None);
        no_field.allowed_vms = None;

        let registry = Registry::build([
            raw("/dev/a", "Keyboard", &[], None),
            no_field,
            raw("/dev/b", "Mouse", &["vmA"], None),
        ]);

        assert_eq!(registry.len(), 1);
        assert_eq!(registry.labels().collect::<Vec<_>>(), vec!["Mouse"]);
    }

    #[test]
    fn test_build_numeric_name_with_two_targets() {
        let registry = Registry::build([RawDevice {
            device_node: Some("/dev/bus/usb/1/2".to_string()),
            product_name: Some("123".to_string()),
            allowed_vms: Some(vec!["vmA".to_string(), "vmB".to_string()]),
            ..Default::default()
        }]);

        assert_eq!(registry.len(), 1);
        let device = registry.get(UNKNOWN_DEVICE).unwrap();
        assert_eq!(device.device_node, "/dev/bus/usb/1/2");
        assert_eq!(device.product_name, "123");
        assert_eq!(device.allowed_vms, vec!["None", "vmA", "vmB"]);
        assert_eq!(device.vm, NONE_TARGET);
    }

    #[test]
    fn test_none_target_any_case() {
        assert!(is_none_target("None"));
        assert!(is_none_target("none"));
        assert!(is_none_target("NONE"));
        assert!(!is_none_target("vmNone"));
    }

    #[test]
    fn test_build_dedups_labels() {
        let registry = Registry::build([
            raw("/dev/a", "Storage", &["vmA"], None),
            raw("/dev/b", "Storage", &["vmA"], None),
            raw("/dev/c", "Storage", &["vmA"], None),
            raw("/dev/d", "0001", &["vmA"], None),
            raw("/dev/e", "0002", &["vmA"], None),
        ]);

        assert_eq!(
            registry.labels().collect::<Vec<_>>(),
            vec![
                "Storage",
                "Storage(1)",
                "Storage(2)",
                "<unknown device>",
                "<unknown device>(3)"
            ]
        );
        assert_eq!(registry.get("Storage(2)").unwrap().device_node, "/dev/c");
    }

    #[test]
    fn test_build_suffix_skips_taken_labels() {
        let registry = Registry::build([
            raw("/dev/a", "Storage(1)", &["vmA"], None),
            raw("/dev/b", "Storage", &["vmA"], None),
            raw("/dev/c", "Storage", &["vmA"], None),
        ]);

        assert_eq!(
            registry.labels().collect::<Vec<_>>(),
            vec!["Storage(1)", "Storage", "Storage(2)"]
        );
    }

    #[test]
    fn test_resolve_and_set_vm() {
        let mut registry =
            Registry::build([raw("/dev/a", "Keyboard", &["vmA", "vmB"], Some("vmA"))]);

        let (label, _) = registry.resolve("/dev/a").unwrap();
        assert_eq!(label, "Keyboard");
        assert!(registry.resolve("Keyboard").is_some());
        assert!(registry.resolve("/dev/zzz").is_none());

        assert!(registry.set_vm("Keyboard", "vmB"));
        assert_eq!(registry.get("Keyboard").unwrap().vm, "vmB");
        assert!(!registry.set_vm("Mouse", "vmB"));
    }

    #[test]
    fn test_select_vm_request_requires_two_targets() {
        let device = raw("/dev/a", "Keyboard", &["vmA", "vmB"], None);
        assert!(SelectVmRequest::from_event(device.clone(), vec!["vmA".into()]).is_none());
        assert!(SelectVmRequest::from_event(device, vec![]).is_none());
    }

    #[test]
    fn test_select_vm_request_formats_name() {
        let device = raw("/dev/a", "Very_Long_Product_Name_Indeed", &["vmA"], Some("vmA"));
        let request =
            SelectVmRequest::from_event(device, vec!["vmB".into(), "vmC".into()]).unwrap();

        assert_eq!(request.product_name, "Very Long Product Na");
        assert_eq!(request.product_name.chars().count(), SELECTION_NAME_MAX_CHARS);
        // Targets come from the event, not from the device entry
        assert_eq!(request.allowed_vms, vec!["vmB", "vmC"]);
        assert_eq!(request.vm.as_deref(), Some("vmA"));
    }

    #[test]
    fn test_select_vm_request_without_name() {
        let request = SelectVmRequest::from_event(
            RawDevice::default(),
            vec!["vmA".into(), "vmB".into()],
        )
        .unwrap();

        assert_eq!(request.product_name, UNKNOWN_DEVICE);
        assert_eq!(request.device_node(), None);
        assert_eq!(request.vm, None);
    }

    #[test]
    fn test_select_vm_request_keeps_raw_device() {
        let device: RawDevice = serde_json::from_value(serde_json::json!({
            "device_node": "/dev/a",
            "product_name": "Very_Long_Product_Name_Indeed",
            "vendor_id": "046d",
            "product_id": "c52b",
        }))
        .unwrap();
        let request = SelectVmRequest::from_event(device, vec!["vmA".into(), "vmB".into()]).unwrap();

        assert_eq!(request.product_name, "Very Long Product Na");
        assert_eq!(request.device_node(), Some("/dev/a"));
        assert_eq!(
            request.device.product_name.as_deref(),
            Some("Very_Long_Product_Name_Indeed")
        );
        assert_eq!(request.device.extra["vendor_id"], "046d");
        assert_eq!(request.device.extra["product_id"], "c52b");
    }
}
