//! Attach/detach requests on behalf of the user

use common::Connector;
use tracing::{info, warn};

use crate::error::ControlError;
use crate::registry::{NONE_TARGET, is_none_target};
use crate::store::DeviceStore;

/// What [`DeviceController::select_target`] did
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SelectOutcome {
    /// The device was already on the requested target; nothing was sent
    Unchanged { label: String },
    Attached { label: String, vm: String },
    Detached { label: String },
}

/// Moves devices between VMs through the broker
pub struct DeviceController<C: Connector> {
    store: DeviceStore<C>,
}

impl<C: Connector> DeviceController<C> {
    pub fn new(store: DeviceStore<C>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &DeviceStore<C> {
        &self.store
    }

    /// Pass the device named by `device` (label or device node) to `target`
    ///
    /// A `target` of "None"/"none" detaches it. On a successful reply the
    /// registry is updated right away without waiting for a refresh; on a
    /// refused one a background refresh is started and the reply is
    /// returned in the error.
    pub async fn select_target(&self, device: &str, target: &str) -> Result<SelectOutcome, ControlError> {
        let (label, device) = {
            let registry = self.store.registry().await;
            let (label, device) = registry
                .resolve(device)
                .ok_or_else(|| ControlError::UnknownDevice(device.to_string()))?;
            (label.to_string(), device.clone())
        };

        let detach = is_none_target(target);
        if !detach && !device.allows(target) {
            return Err(ControlError::TargetNotAllowed {
                label,
                target: target.to_string(),
                allowed: device.allowed_vms,
            });
        }

        let unchanged = if detach {
            !device.is_attached()
        } else {
            device.vm == target
        };
        if unchanged {
            info!("{} is already on {}", label, target);
            return Ok(SelectOutcome::Unchanged { label });
        }

        let reply = {
            let mut api = self.store.api().lock().await;
            if !api.is_connected() {
                api.connect().await?;
            }
            if detach {
                api.detach(&device.device_node).await?
            } else {
                api.attach(&device.device_node, target).await?
            }
        };

        if !reply.is_success() {
            warn!("Broker refused to move {} to {}: {}", label, target, reply);
            self.store.spawn_refresh();
            return Err(ControlError::Refused { label, reply });
        }

        if detach {
            self.store.set_vm(&label, NONE_TARGET).await;
            info!("{} detached", label);
            Ok(SelectOutcome::Detached { label })
        } else {
            self.store.set_vm(&label, target).await;
            info!("{} passed to {}", label, target);
            Ok(SelectOutcome::Attached {
                label,
                vm: target.to_string(),
            })
        }
    }
}
