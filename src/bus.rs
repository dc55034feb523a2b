//! # PCI Bus Allocation
//!
//! Maps a requested PCIe endpoint (physical function, virtual function) to
//! the location the hypervisor should place the hot-plugged device at.
//!
//! ## Addressing Modes
//!
//! ```text
//! buses = []                       buses = ["pci.opi.0", "pci.opi.1"]
//!
//! (pf, vf) ──► Direct { pf, vf }   pf = 43 ──► bus  = buses[43 / 32] = "pci.opi.1"
//!                                              slot = 43 % 32        = 11
//! ```
//!
//! Without configured buses the endpoint passes through unchanged and the
//! hypervisor chooses placement. With buses, every bus offers
//! [`BUS_SLOT_CAPACITY`] slots and a physical function beyond the last bus
//! is rejected.
//!
//! Allocation is a pure function with no side effects, safe to call from any
//! number of tasks.

use crate::constants::BUS_SLOT_CAPACITY;
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};

/// Where a hot-plugged device lands in the guest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum DeviceLocation {
    /// No bus indirection; the raw endpoint is the device address.
    Direct {
        /// PCIe physical function.
        physical_function: u32,
        /// PCIe virtual function.
        virtual_function: u32,
    },
    /// Slot on a named virtual PCI bus.
    Bus {
        /// Bus name as known to the hypervisor.
        bus: String,
        /// Device slot on the bus.
        slot: u32,
    },
}

impl DeviceLocation {
    /// Returns the bus name, if the location uses bus indirection.
    #[must_use]
    pub fn bus(&self) -> Option<&str> {
        match self {
            Self::Bus { bus, .. } => Some(bus),
            Self::Direct { .. } => None,
        }
    }

    /// Returns the slot formatted as a hypervisor `addr` property (`0xb`).
    #[must_use]
    pub fn addr(&self) -> Option<String> {
        match self {
            Self::Bus { slot, .. } => Some(format!("{slot:#x}")),
            Self::Direct { .. } => None,
        }
    }
}

impl std::fmt::Display for DeviceLocation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Direct {
                physical_function,
                virtual_function,
            } => write!(f, "pf={physical_function} vf={virtual_function}"),
            Self::Bus { bus, slot } => write!(f, "{bus}:{slot:#x}"),
        }
    }
}

/// Computes the device location for a PCIe endpoint.
///
/// # Errors
///
/// Returns [`Error::InvalidEndpoint`] if either function is negative or the
/// physical function does not fit on the configured buses.
pub fn allocate<S: AsRef<str>>(
    buses: &[S],
    physical_function: i32,
    virtual_function: i32,
) -> Result<DeviceLocation> {
    let pf = u32::try_from(physical_function).map_err(|_| Error::InvalidEndpoint {
        reason: format!("physical function {physical_function} is negative"),
    })?;
    let vf = u32::try_from(virtual_function).map_err(|_| Error::InvalidEndpoint {
        reason: format!("virtual function {virtual_function} is negative"),
    })?;

    if buses.is_empty() {
        return Ok(DeviceLocation::Direct {
            physical_function: pf,
            virtual_function: vf,
        });
    }

    let bus_index = (pf / BUS_SLOT_CAPACITY) as usize;
    let slot = pf % BUS_SLOT_CAPACITY;
    let bus = buses.get(bus_index).ok_or_else(|| Error::InvalidEndpoint {
        reason: format!(
            "physical function {pf} exceeds capacity of {} bus(es) ({} slots)",
            buses.len(),
            buses.len() * BUS_SLOT_CAPACITY as usize
        ),
    })?;

    Ok(DeviceLocation::Bus {
        bus: bus.as_ref().to_string(),
        slot,
    })
}
