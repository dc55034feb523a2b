//! # nvme-hotplug
//!
//! **Hot-plug bridge for vfio-user NVMe controllers**
//!
//! Attaches storage-engine NVMe controllers to a running QEMU virtual
//! machine as PCI devices, and detaches them again. One attach touches
//! three places, and the crate keeps them consistent:
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────┐
//! │                            nvme-hotplug                              │
//! ├──────────────────────────────────────────────────────────────────────┤
//! │  ControlServer (JSON lines on a Unix socket)                         │
//! │        │                                                             │
//! │        ▼                                                             │
//! │  ┌────────────────────────────────────────────────────────────┐      │
//! │  │                     HotplugServer                          │      │
//! │  │  create_controller(req) ──► NvmeController                 │      │
//! │  │  delete_controller(req) ──► Ok | partially | not deleted   │      │
//! │  └──────┬───────────────────────┬──────────────────────┬──────┘      │
//! │         │                       │                      │             │
//! │  ┌──────▼───────┐   ┌───────────▼──────────┐   ┌───────▼─────────┐   │
//! │  │ ControllerDir│   │   StorageEngine      │   │ MonitorSession  │   │
//! │  │ <ctrlr_dir>/ │   │ nvmf_subsystem_*_    │   │ QMP device_add/ │   │
//! │  │  <subsys_id> │   │ listener (JSON-RPC)  │   │ device_del      │   │
//! │  └──────────────┘   └──────────────────────┘   └─────────────────┘   │
//! └──────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Device Placement
//!
//! With no configured buses a device is placed by the hypervisor. With N
//! buses, physical function `pf` lands on `buses[pf / 32]` at slot
//! `pf % 32` (see [`bus::allocate`]).
//!
//! # Example
//!
//! ```rust,ignore
//! use nvme_hotplug::{BridgeConfig, HotplugServer, JsonRpcEngine, ResourceStore};
//! use std::sync::Arc;
//!
//! let config = BridgeConfig::new("/var/run/qemu/qmp.sock", "/var/tmp/ctrlrs")
//!     .with_buses(["pci.opi.0", "pci.opi.1"]);
//! let store = Arc::new(ResourceStore::new());
//! let engine = Arc::new(JsonRpcEngine::new("/var/tmp/spdk.sock"));
//! let server = HotplugServer::new(store, engine, &config)?;
//! let controller = server.create_controller(request).await?;
//! ```

pub mod bus;
pub mod config;
pub mod constants;
pub mod controller_dir;
pub mod engine;
pub mod error;
pub mod hotplug;
pub mod listener;
pub mod qmp;
pub mod service;
pub mod store;

// Re-exports
pub use bus::{DeviceLocation, allocate};
pub use config::BridgeConfig;
pub use controller_dir::{ControllerDir, DirReservation};
pub use engine::{EngineError, JsonRpcEngine, StorageEngine};
pub use error::{Error, Result, StatusCode};
pub use hotplug::{CreateNvmeControllerRequest, DeleteNvmeControllerRequest, HotplugServer};
pub use listener::{ListenerParams, VfioUserListener};
pub use qmp::{MonitorError, MonitorSession, NvmeDevice, PciAddress};
pub use service::{ControlClient, ControlServer};
pub use store::{
    NvmeController, NvmeControllerSpec, NvmeControllerStatus, NvmeSubsystem, PcieEndpoint,
    ResourceStore,
};
