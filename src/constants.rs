//! # Hot-Plug Bridge Constants
//!
//! Defines the addressing limits, timeouts, driver names and naming
//! conventions shared by the bridge. These constants are the **single source
//! of truth** for values that must agree between the storage engine, the
//! hypervisor and the resource store.
//!
//! ## Cross-References
//!
//! - [`crate::bus`]: Uses [`BUS_SLOT_CAPACITY`] for bus/slot arithmetic
//! - [`crate::listener`]: Uses [`VFIO_USER_TRANSPORT`]
//! - [`crate::qmp`]: Uses [`VFIO_USER_PCI_DRIVER`] and [`CONTROLLER_SOCKET_NAME`]
//! - [`crate::hotplug`]: Uses [`UNSET_CONTROLLER_ID`]

use std::time::Duration;

// =============================================================================
// PCI Addressing
// =============================================================================

/// Number of device slots on a single virtual PCI bus.
///
/// A conventional PCI bus exposes 32 device numbers. Physical function `pf`
/// maps to bus `pf / 32`, slot `pf % 32` when buses are configured.
pub const BUS_SLOT_CAPACITY: u32 = 32;

// =============================================================================
// Storage Engine Transport
// =============================================================================

/// Transport type used for the storage engine's local-socket listener.
pub const VFIO_USER_TRANSPORT: &str = "vfiouser";

/// Name of the socket the storage engine creates inside a controller directory.
pub const CONTROLLER_SOCKET_NAME: &str = "cntrl";

/// JSON-RPC method registering a subsystem listener.
pub const RPC_ADD_LISTENER: &str = "nvmf_subsystem_add_listener";

/// JSON-RPC method removing a subsystem listener.
pub const RPC_REMOVE_LISTENER: &str = "nvmf_subsystem_remove_listener";

/// Timeout for a single storage engine JSON-RPC round trip (10 seconds).
pub const ENGINE_RPC_TIMEOUT: Duration = Duration::from_secs(10);

/// Maximum size of a storage engine response (1 MiB).
///
/// The responses this bridge consumes are booleans; anything larger than
/// this indicates a broken or hostile peer.
pub const MAX_ENGINE_RESPONSE_SIZE: usize = 1024 * 1024;

// =============================================================================
// Hypervisor Monitor
// =============================================================================

/// QEMU device driver for vfio-user backed PCI devices.
pub const VFIO_USER_PCI_DRIVER: &str = "vfio-user-pci";

/// Default QMP connect and read timeout (5 seconds).
pub const DEFAULT_MONITOR_TIMEOUT: Duration = Duration::from_secs(5);

/// Upper bound for the QMP timeout and presence poll interval (10 minutes).
pub const MAX_MONITOR_TIMEOUT: Duration = Duration::from_secs(600);

/// Default interval between `query-pci` polls while waiting for a device
/// to disappear after `device_del`.
pub const DEFAULT_POLL_DEVICE_PRESENCE_STEP: Duration = Duration::from_millis(50);

// =============================================================================
// Resource Naming
// =============================================================================

/// Prefix of canonical resource names handed out by the resource store.
pub const RESOURCE_NAME_PREFIX: &str = "//storage.opiproject.org/volumes/";

/// Value reported in place of the hypervisor-assigned controller slot.
pub const UNSET_CONTROLLER_ID: i32 = -1;

// =============================================================================
// Control Service
// =============================================================================

/// Default Unix socket path for the control service.
pub const DEFAULT_LISTEN_ADDRESS: &str = "/var/run/nvme-hotplug.sock";

/// Maximum control request line length (64 KiB).
pub const MAX_REQUEST_LINE_LEN: usize = 64 * 1024;

/// Timeout for reading a single control request (30 seconds).
pub const REQUEST_READ_TIMEOUT: Duration = Duration::from_secs(30);

/// Maximum concurrent control connections.
pub const MAX_CONNECTIONS: usize = 64;
