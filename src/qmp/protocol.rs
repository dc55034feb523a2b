//! QMP command shaping for vfio-user NVMe devices.
//!
//! Wire encoding, the greeting and capability negotiation are handled by
//! `qapi`; the typed commands come from `qapi_qmp`. This module only builds
//! the `device_add` arguments for a vfio-user controller and walks the
//! `query-pci` tree.
//!
//! # Commands Used
//!
//! | Command | Purpose |
//! |---------|---------|
//! | `qmp_capabilities` | Leave negotiation mode |
//! | `device_add` | Hot-plug the vfio-user NVMe device |
//! | `device_del` | Request hot-unplug |
//! | `query-pci` | Confirm presence and guest address |
//!
//! # `device_add` Shape
//!
//! ```text
//! {"driver": "vfio-user-pci", "id": "<controller id>",
//!  "socket": {"type": "unix", "path": "<ctrlr_dir>/<subsystem>/cntrl"},
//!  "bus": "<bus name>", "addr": "<slot as 0x-hex>"}      ← bus mode only
//! ```

use crate::bus::DeviceLocation;
use crate::constants::VFIO_USER_PCI_DRIVER;
use qapi_qmp::{PciDeviceInfo, PciInfo, device_add};
use qapi_spec::Dictionary;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::path::PathBuf;

/// A vfio-user NVMe controller to hot-plug.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NvmeDevice {
    /// Device id, the controller's resource id.
    pub id: String,
    /// Subsystem NQN served behind the socket.
    pub nqn: String,
    /// Transport socket created by the storage engine.
    pub socket_path: PathBuf,
    /// Guest placement.
    pub location: DeviceLocation,
}

impl NvmeDevice {
    /// Builds the `device_add` command for this device.
    #[must_use]
    pub fn device_add(&self) -> device_add {
        let mut arguments = Dictionary::new();
        arguments.insert(
            "socket".to_owned(),
            json!({
                "type": "unix",
                "path": self.socket_path.to_string_lossy(),
            }),
        );
        if let Some(addr) = self.location.addr() {
            arguments.insert("addr".to_owned(), addr.into());
        }

        device_add {
            driver: VFIO_USER_PCI_DRIVER.to_string(),
            bus: self.location.bus().map(str::to_string),
            id: Some(self.id.clone()),
            arguments,
        }
    }
}

/// Guest-observed address of a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PciAddress {
    /// Bus number.
    pub bus: i64,
    /// Slot number.
    pub slot: i64,
    /// Function number.
    pub function: i64,
}

impl From<&PciDeviceInfo> for PciAddress {
    fn from(device: &PciDeviceInfo) -> Self {
        Self {
            bus: device.bus,
            slot: device.slot,
            function: device.function,
        }
    }
}

impl std::fmt::Display for PciAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:02x}:{:02x}.{:x}", self.bus, self.slot, self.function)
    }
}

/// Searches `query-pci` output for a device, descending into bridges.
#[must_use]
pub fn find_device(buses: &[PciInfo], qdev_id: &str) -> Option<PciAddress> {
    buses
        .iter()
        .find_map(|bus| find_in_devices(&bus.devices, qdev_id))
}

fn find_in_devices(devices: &[PciDeviceInfo], qdev_id: &str) -> Option<PciAddress> {
    for device in devices {
        if device.qdev_id == qdev_id {
            return Some(PciAddress::from(device));
        }
        let behind_bridge = device
            .pci_bridge
            .as_ref()
            .and_then(|bridge| bridge.devices.as_deref())
            .and_then(|devices| find_in_devices(devices, qdev_id));
        if behind_bridge.is_some() {
            return behind_bridge;
        }
    }
    None
}
