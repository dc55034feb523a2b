//! # Controller Directory Management
//!
//! Each subsystem attached to the VM owns a directory under the configured
//! base path. The storage engine creates its vfio-user socket inside it and
//! the hypervisor connects to that socket.
//!
//! ```text
//! <ctrlr_dir>/
//! └── <subsystem-id>/      ← reserved by attach, released by detach
//!     └── cntrl            ← transport socket (owned by the storage engine)
//! ```
//!
//! ## Reservation Semantics
//!
//! The directory's existence is the single source of truth for "an attach
//! has reserved this subsystem's transport endpoint":
//!
//! - [`ControllerDir::reserve`] uses an exclusive `mkdir`, so a second
//!   concurrent attach for the same subsystem fails with
//!   [`Error::DirConflict`] without any in-process lock.
//! - [`ControllerDir::release`] only removes an empty directory. A non-empty
//!   directory means the transport socket is still held and is reported as
//!   `Ok(false)`, never as a hard error.
//!
//! [`DirReservation`] wraps a fresh reservation and releases it on drop
//! unless [`DirReservation::keep`] is called, so every early return of an
//! attach rolls the reservation back.

use crate::error::{Error, Result};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Returns the controller directory path for a subsystem.
#[must_use]
pub fn controller_dir_path(base_dir: &Path, subsystem_id: &str) -> PathBuf {
    base_dir.join(subsystem_id)
}

/// Filesystem directory anchoring one subsystem's transport endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControllerDir {
    path: PathBuf,
}

impl ControllerDir {
    /// Creates a handle for the subsystem's directory. No I/O is performed.
    #[must_use]
    pub fn new(base_dir: &Path, subsystem_id: &str) -> Self {
        Self {
            path: controller_dir_path(base_dir, subsystem_id),
        }
    }

    /// Returns the directory path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Checks if the directory exists.
    #[must_use]
    pub fn exists(&self) -> bool {
        self.path.is_dir()
    }

    /// Creates the directory, failing if it is already reserved.
    ///
    /// # Errors
    ///
    /// Returns [`Error::DirConflict`] if the directory exists, or
    /// [`Error::Io`] if it cannot be created.
    pub fn reserve(&self) -> Result<DirReservation> {
        match fs::create_dir(&self.path) {
            Ok(()) => {
                debug!(path = %self.path.display(), "controller dir reserved");
                Ok(DirReservation {
                    dir: self.clone(),
                    armed: true,
                })
            }
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => Err(Error::DirConflict {
                path: self.path.clone(),
            }),
            Err(e) => Err(Error::Io(e)),
        }
    }

    /// Removes the directory if it is empty.
    ///
    /// Returns `Ok(true)` if the directory is gone afterwards (including when
    /// it never existed) and `Ok(false)` if it still holds entries.
    ///
    /// # Errors
    ///
    /// Returns the underlying I/O error for any other failure.
    pub fn release(&self) -> io::Result<bool> {
        match fs::remove_dir(&self.path) {
            Ok(()) => {
                debug!(path = %self.path.display(), "controller dir released");
                Ok(true)
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::DirectoryNotEmpty => {
                debug!(path = %self.path.display(), "controller dir still in use");
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }
}

/// A directory reserved by the current operation.
///
/// Dropping an armed reservation releases the directory.
#[derive(Debug)]
#[must_use = "dropping a reservation releases the controller directory"]
pub struct DirReservation {
    dir: ControllerDir,
    armed: bool,
}

impl DirReservation {
    /// Returns the reserved directory.
    #[must_use]
    pub fn dir(&self) -> &ControllerDir {
        &self.dir
    }

    /// Keeps the directory in place; it becomes the attached-state marker.
    pub fn keep(mut self) -> ControllerDir {
        self.armed = false;
        self.dir.clone()
    }
}

impl Drop for DirReservation {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        match self.dir.release() {
            Ok(true) => {}
            Ok(false) => warn!(
                path = %self.dir.path().display(),
                "rollback left non-empty controller dir in place"
            ),
            Err(e) => warn!(
                path = %self.dir.path().display(),
                error = %e,
                "failed to roll back controller dir"
            ),
        }
    }
}
