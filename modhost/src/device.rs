//! Device handler registry and device inventory.

use crate::registry::ModuleChain;
use modhost_common::abi::{Address, DeviceSink};
use parking_lot::RwLock;
use std::collections::VecDeque;
use std::sync::Arc;

/// A device type served by a module.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceHandler {
    /// Device type name as declared (compared case-insensitively).
    pub type_name: String,
    /// Handler address.
    pub handler: Address,
}

/// Sink behind [`modhost_common::abi::DeviceRegistrar`].
pub(crate) struct DeviceCollector<'a> {
    handlers: &'a mut VecDeque<DeviceHandler>,
}

impl<'a> DeviceCollector<'a> {
    pub(crate) fn new(handlers: &'a mut VecDeque<DeviceHandler>) -> Self {
        Self { handlers }
    }
}

impl DeviceSink for DeviceCollector<'_> {
    fn register_device(&mut self, type_name: &str, handler: Address) {
        self.handlers.push_front(DeviceHandler {
            type_name: type_name.to_string(),
            handler,
        });
    }
}

/// First handler in chain order whose type matches, ignoring case.
pub(crate) fn find_handler(chain: &ModuleChain, type_name: &str) -> Option<Address> {
    chain
        .iter()
        .flat_map(|m| m.devices.iter())
        .find(|d| d.type_name.eq_ignore_ascii_case(type_name))
        .map(|d| d.handler)
}

/// Name of the module expected to serve `type_name`, e.g. `hdt3270`.
pub fn device_module_name(prefix: &str, type_name: &str) -> String {
    format!("{prefix}{type_name}").to_ascii_lowercase()
}

/// A configured device and the handler currently serving it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ActiveDevice {
    /// Logical channel subsystem.
    pub lcss: u8,
    /// Device number.
    pub devnum: u16,
    /// Handler bound to the device.
    pub handler: Address,
}

/// Source of the host's active devices, consulted before an unload.
pub trait DeviceInventory: Send + Sync {
    /// Snapshot of the devices currently configured.
    fn active_devices(&self) -> Vec<ActiveDevice>;
}

/// Inventory for hosts without devices.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoDevices;

impl DeviceInventory for NoDevices {
    fn active_devices(&self) -> Vec<ActiveDevice> {
        Vec::new()
    }
}

/// Simple shared device list.
#[derive(Debug, Default)]
pub struct DeviceList {
    devices: RwLock<Vec<ActiveDevice>>,
}

impl DeviceList {
    /// Empty list.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add (or rebind) a device.
    pub fn attach(&self, device: ActiveDevice) {
        let mut devices = self.devices.write();
        devices.retain(|d| (d.lcss, d.devnum) != (device.lcss, device.devnum));
        devices.push(device);
    }

    /// Remove a device. Returns `true` if it was present.
    pub fn detach(&self, lcss: u8, devnum: u16) -> bool {
        let mut devices = self.devices.write();
        let before = devices.len();
        devices.retain(|d| (d.lcss, d.devnum) != (lcss, devnum));
        devices.len() != before
    }
}

impl DeviceInventory for DeviceList {
    fn active_devices(&self) -> Vec<ActiveDevice> {
        self.devices.read().clone()
    }
}

impl<T: DeviceInventory + ?Sized> DeviceInventory for Arc<T> {
    fn active_devices(&self) -> Vec<ActiveDevice> {
        (**self).active_devices()
    }
}
