//! # Hot-Plug Orchestrator
//!
//! Sequences the storage engine, the controller directory and a QMP session
//! into one attach ([`HotplugServer::create_controller`]) or detach
//! ([`HotplugServer::delete_controller`]) operation with well-defined
//! partial-failure outcomes.
//!
//! ## Attach
//!
//! ```text
//!  Validating ──► DirReserved ──► ListenerAdded ──► MonitorOpen ──► DeviceAdding ──► Confirming ──► Attached
//!      │               │                │                │               │
//!      │ (no side      │ engine error   │ monitor error  │ device error  │
//!      │  effects)     ▼                ▼                ▼               │
//!      ▼            release dir    remove listener, release dir ◄────────┘
//!    error                           (rollback to Absent)
//! ```
//!
//! The controller directory is the first side effect and the rollback
//! anchor: it is held by a [`DirReservation`] guard, so any return before
//! the final step (including a panic) removes it again. On success the
//! directory stays in place as the attached-state marker.
//!
//! ## Detach
//!
//! ```text
//!  Validating ──► (inactive or dir absent?) ──yes──► Ok (already detached)
//!                      │ no
//!                      ▼
//!                 MonitorOpen ──► DeviceDeleting ──► ListenerRemoving ──► DirReleasing ──► classify
//! ```
//!
//! | device_del | engine | dir released | outcome |
//! |------------|--------|--------------|---------|
//! | ok | ok | yes | `Ok(())` |
//! | err | err | any | [`Error::DeviceNotDeleted`] |
//! | any other combination ||| [`Error::DevicePartiallyDeleted`] |
//!
//! ## Concurrency
//!
//! Calls hold no lock across requests. The exclusive `mkdir` of the
//! controller directory guarantees at most one attach in flight per
//! subsystem; a concurrent second attach fails with [`Error::DirConflict`].
//! Nothing here retries; retry policy belongs to the caller.

use crate::bus::{self, DeviceLocation};
use crate::config::BridgeConfig;
use crate::constants::{
    CONTROLLER_SOCKET_NAME, RPC_ADD_LISTENER, RPC_REMOVE_LISTENER, UNSET_CONTROLLER_ID,
};
use crate::controller_dir::ControllerDir;
use crate::engine::{EngineError, StorageEngine};
use crate::error::{Error, Result};
use crate::listener::{ListenerParams, VfioUserListener};
use crate::qmp::{MonitorSession, NvmeDevice};
use crate::store::{
    NvmeController, ResourceStore, generate_resource_id, resource_id_from_name,
    resource_id_to_volume_name,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

// =============================================================================
// Requests
// =============================================================================

/// Request to attach a controller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateNvmeControllerRequest {
    /// Caller-chosen resource id; generated when absent.
    #[serde(default)]
    pub nvme_controller_id: Option<String>,
    /// Controller to attach.
    pub nvme_controller: NvmeController,
}

/// Request to detach a controller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeleteNvmeControllerRequest {
    /// Canonical controller name.
    pub name: String,
}

// =============================================================================
// Orchestrator
// =============================================================================

/// Attaches and detaches vfio-user NVMe controllers to a running VM.
pub struct HotplugServer {
    /// Declarative resource state.
    store: Arc<ResourceStore>,
    /// Storage engine client.
    engine: Arc<dyn StorageEngine>,
    /// Listener parameter builder (validated controller base dir).
    listener: VfioUserListener,
    /// QMP socket path.
    qmp_address: PathBuf,
    /// Virtual PCI buses; empty for direct addressing.
    buses: Vec<String>,
    /// QMP connect/read timeout.
    timeout: Duration,
    /// Presence poll interval after `device_del`.
    poll_step: Duration,
}

impl std::fmt::Debug for HotplugServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HotplugServer")
            .field("qmp_address", &self.qmp_address)
            .field("ctrlr_dir", &self.listener.ctrlr_dir())
            .field("buses", &self.buses)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl HotplugServer {
    /// Creates an orchestrator.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the configuration is invalid or the
    /// controller base directory is not an existing directory.
    pub fn new(
        store: Arc<ResourceStore>,
        engine: Arc<dyn StorageEngine>,
        config: &BridgeConfig,
    ) -> Result<Self> {
        config.validate()?;
        let listener = VfioUserListener::new(&config.ctrlr_dir)?;
        Ok(Self {
            store,
            engine,
            listener,
            qmp_address: config.qmp_address.clone(),
            buses: config.buses.clone(),
            timeout: config.monitor_timeout(),
            poll_step: config.poll_device_presence_step(),
        })
    }

    /// Returns the controller base directory.
    #[must_use]
    pub fn ctrlr_dir(&self) -> &Path {
        self.listener.ctrlr_dir()
    }

    /// Returns the resource store.
    #[must_use]
    pub fn store(&self) -> &Arc<ResourceStore> {
        &self.store
    }

    /// Returns the directory handle for a subsystem.
    #[must_use]
    pub fn controller_dir(&self, subsystem_id: &str) -> ControllerDir {
        ControllerDir::new(self.listener.ctrlr_dir(), subsystem_id)
    }

    /// Computes the device location for a physical/virtual function pair.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidEndpoint`] if the endpoint is out of range.
    pub fn locate(&self, physical_function: i32, virtual_function: i32) -> Result<DeviceLocation> {
        bus::allocate(&self.buses, physical_function, virtual_function)
    }

    // =========================================================================
    // Attach
    // =========================================================================

    /// Attaches a controller to the VM.
    ///
    /// The returned controller carries the caller's spec, the canonical
    /// name, `active = true`, and `nvme_controller_id = -1`.
    ///
    /// # Errors
    ///
    /// See the module documentation for the failure kinds. Every failure
    /// after the directory reservation leaves no directory behind.
    pub async fn create_controller(
        &self,
        request: CreateNvmeControllerRequest,
    ) -> Result<NvmeController> {
        info!(request = ?request, "create controller");
        let CreateNvmeControllerRequest {
            nvme_controller_id,
            nvme_controller: mut controller,
        } = request;

        // Validating
        let subsystem_name = controller
            .spec
            .subsystem_id
            .as_deref()
            .filter(|name| !name.is_empty())
            .ok_or(Error::InvalidSubsystem(None))?;
        let subsystem = self
            .store
            .subsystem(subsystem_name)
            .await
            .ok_or_else(|| Error::InvalidSubsystem(Some(subsystem_name.to_string())))?;
        let pcie = controller.spec.pcie_id.ok_or(Error::NoPcieEndpoint)?;
        let location = self.locate(pcie.physical_function, pcie.virtual_function)?;

        let resource_id = nvme_controller_id
            .filter(|id| !id.is_empty())
            .unwrap_or_else(generate_resource_id);
        let name = resource_id_to_volume_name(&resource_id);
        let subsystem_id = resource_id_from_name(&subsystem.name);

        // DirReserved
        let reservation = self.controller_dir(subsystem_id).reserve()?;
        debug!(
            path = %reservation.dir().path().display(),
            location = %location,
            "controller dir reserved"
        );

        // ListenerAdded
        let params = self.listener.params(subsystem_id, &subsystem.nqn);
        self.engine
            .add_listener(&params)
            .await
            .map_err(|e| engine_error(RPC_ADD_LISTENER, e))?;

        // MonitorOpen
        let mut session = match self.open_monitor().await {
            Ok(session) => session,
            Err(e) => {
                self.rollback_listener(&params).await;
                return Err(e);
            }
        };

        // DeviceAdding
        let device = NvmeDevice {
            id: resource_id.clone(),
            nqn: subsystem.nqn.clone(),
            socket_path: reservation.dir().path().join(CONTROLLER_SOCKET_NAME),
            location,
        };
        if let Err(e) = session.add_nvme_device(&device).await {
            error!(id = %resource_id, error = %e, "hot-plug rejected, rolling back");
            close_session(session).await;
            self.rollback_listener(&params).await;
            return Err(Error::AddDeviceFailed(e.to_string()));
        }

        // Confirming (the confirmed address is not reported back)
        match session.query_device_address(&resource_id).await {
            Ok(address) => info!(id = %resource_id, address = %address, "device attached"),
            Err(e) => warn!(id = %resource_id, error = %e, "could not confirm device address"),
        }
        close_session(session).await;

        // Attached
        let dir = reservation.keep();
        controller.name = name.clone();
        controller.spec.nvme_controller_id = UNSET_CONTROLLER_ID;
        controller.status.active = true;
        self.store.insert_controller(name, controller.clone()).await;

        info!(
            name = %controller.name,
            path = %dir.path().display(),
            "controller created"
        );
        Ok(controller)
    }

    // =========================================================================
    // Detach
    // =========================================================================

    /// Detaches a controller from the VM.
    ///
    /// Succeeds without contacting the hypervisor if the controller was
    /// already detached or the subsystem's controller directory does not
    /// exist. An inactive record never touches the directory, which may
    /// belong to a later attachment on the same subsystem.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NoController`] for an unknown name,
    /// [`Error::MonitorCreationFailed`] without touching any state, or a
    /// partial/total deletion error after the removal attempt.
    pub async fn delete_controller(&self, request: DeleteNvmeControllerRequest) -> Result<()> {
        info!(name = %request.name, "delete controller");

        // Validating
        let controller = self
            .store
            .controller(&request.name)
            .await
            .ok_or_else(|| Error::NoController(request.name.clone()))?;
        // The subsystem dir may belong to a newer attachment by now.
        if !controller.status.active {
            info!(name = %request.name, "controller inactive, already detached");
            return Ok(());
        }
        let subsystem_name = controller
            .spec
            .subsystem_id
            .as_deref()
            .filter(|name| !name.is_empty())
            .ok_or(Error::InvalidSubsystem(None))?;
        let subsystem_id = resource_id_from_name(subsystem_name);
        let dir = self.controller_dir(subsystem_id);
        if !dir.exists() {
            info!(
                name = %request.name,
                path = %dir.path().display(),
                "controller dir absent, already detached"
            );
            return Ok(());
        }
        let device_id = resource_id_from_name(&controller.name);

        // MonitorOpen
        let mut session = self.open_monitor().await?;

        // DeviceDeleting
        let device_result = session.delete_device(device_id).await;
        if let Err(e) = &device_result {
            warn!(id = device_id, error = %e, "device_del failed");
        }
        close_session(session).await;

        // ListenerRemoving
        let engine_result = match self.store.subsystem(subsystem_name).await {
            Some(subsystem) => {
                let params = self.listener.params(subsystem_id, &subsystem.nqn);
                self.engine
                    .remove_listener(&params)
                    .await
                    .map_err(|e| engine_error(RPC_REMOVE_LISTENER, e).to_string())
            }
            None => Err(Error::InvalidSubsystem(Some(subsystem_name.to_string())).to_string()),
        };
        if let Err(e) = &engine_result {
            warn!(id = device_id, error = %e, "storage engine unregistration failed");
        }

        // DirReleasing
        let dir_result = dir.release();

        let mut failures = Vec::new();
        if let Err(e) = &device_result {
            failures.push(format!("hypervisor: {e}"));
        }
        if let Err(e) = &engine_result {
            failures.push(format!("storage engine: {e}"));
        }
        match &dir_result {
            Ok(true) => {}
            Ok(false) => failures.push(format!(
                "controller dir {} is not empty",
                dir.path().display()
            )),
            Err(e) => failures.push(format!(
                "controller dir {} not removed: {e}",
                dir.path().display()
            )),
        }

        if device_result.is_err() && engine_result.is_err() {
            let err = Error::DeviceNotDeleted(failures.join("; "));
            error!(name = %request.name, error = %err, "detach failed");
            return Err(err);
        }
        if !failures.is_empty() {
            let err = Error::DevicePartiallyDeleted(failures.join("; "));
            error!(name = %request.name, error = %err, "detach incomplete");
            return Err(err);
        }

        self.store.set_controller_active(&request.name, false).await;
        info!(name = %request.name, "controller deleted");
        Ok(())
    }

    // =========================================================================
    // Helpers
    // =========================================================================

    async fn open_monitor(&self) -> Result<MonitorSession> {
        MonitorSession::open(&self.qmp_address, self.timeout)
            .await
            .map(|session| session.with_poll_step(self.poll_step))
            .map_err(|e| {
                error!(
                    address = %self.qmp_address.display(),
                    error = %e,
                    "failed to create monitor"
                );
                Error::MonitorCreationFailed(e.to_string())
            })
    }

    async fn rollback_listener(&self, params: &ListenerParams) {
        if let Err(e) = self.engine.remove_listener(params).await {
            warn!(nqn = %params.nqn, error = %e, "failed to roll back storage engine listener");
        }
    }
}

async fn close_session(session: MonitorSession) {
    if let Err(e) = session.close().await {
        debug!(error = %e, "error closing QMP session");
    }
}

fn engine_error(method: &str, e: EngineError) -> Error {
    Error::StorageEngine {
        method: method.to_string(),
        reason: e.to_string(),
    }
}
