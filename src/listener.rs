//! Storage engine listener parameters for vfio-user subsystems.
//!
//! The storage engine exposes a subsystem to the hypervisor through a
//! local-socket (vfio-user) listener rooted in the subsystem's controller
//! directory. [`VfioUserListener`] computes those parameters; it holds no
//! state beyond the validated base directory.

use crate::constants::VFIO_USER_TRANSPORT;
use crate::controller_dir::controller_dir_path;
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Listen address of a subsystem listener.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListenAddress {
    /// Transport type.
    pub trtype: String,
    /// Transport address (directory holding the socket).
    pub traddr: String,
}

/// Parameters for `nvmf_subsystem_add_listener` / `nvmf_subsystem_remove_listener`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListenerParams {
    /// Subsystem NQN.
    pub nqn: String,
    /// Listen address.
    pub listen_address: ListenAddress,
}

/// Builder for vfio-user listener parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VfioUserListener {
    ctrlr_dir: PathBuf,
}

impl VfioUserListener {
    /// Creates a builder rooted at `ctrlr_dir`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the path is empty, does not exist or is
    /// not a directory.
    pub fn new(ctrlr_dir: impl Into<PathBuf>) -> Result<Self> {
        let ctrlr_dir = ctrlr_dir.into();
        if ctrlr_dir.as_os_str().is_empty() {
            return Err(Error::Config("controller dir path is empty".to_string()));
        }
        let metadata = std::fs::metadata(&ctrlr_dir).map_err(|e| {
            Error::Config(format!(
                "controller dir {} is not accessible: {e}",
                ctrlr_dir.display()
            ))
        })?;
        if !metadata.is_dir() {
            return Err(Error::Config(format!(
                "controller dir {} is not a directory",
                ctrlr_dir.display()
            )));
        }
        Ok(Self { ctrlr_dir })
    }

    /// Returns the base directory.
    #[must_use]
    pub fn ctrlr_dir(&self) -> &Path {
        &self.ctrlr_dir
    }

    /// Computes listener parameters for a subsystem.
    #[must_use]
    pub fn params(&self, subsystem_id: &str, nqn: &str) -> ListenerParams {
        ListenerParams {
            nqn: nqn.to_string(),
            listen_address: ListenAddress {
                trtype: VFIO_USER_TRANSPORT.to_string(),
                traddr: controller_dir_path(&self.ctrlr_dir, subsystem_id)
                    .to_string_lossy()
                    .into_owned(),
            },
        }
    }
}
