//! # Hypervisor Monitor (QMP)
//!
//! Short-lived sessions against QEMU's machine-control socket, used to
//! hot-plug and hot-unplug vfio-user NVMe controllers.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────────┐      QMP (qapi)      ┌──────────────────────────┐
//! │  HotplugServer    │ ───────────────────► │  QEMU                    │
//! │  MonitorSession   │  device_add/del      │  vfio-user-pci device    │
//! └───────────────────┘  query-pci           │      │ connects to       │
//!                                            │      ▼                   │
//!                                            │  <ctrlr_dir>/<id>/cntrl  │
//!                                            └──────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`]: vfio-user `device_add` shaping and `query-pci` lookup
//! - [`monitor`]: Session client on top of `qapi`

pub mod monitor;
pub mod protocol;

pub use monitor::{MonitorError, MonitorResult, MonitorSession};
pub use protocol::{NvmeDevice, PciAddress};
