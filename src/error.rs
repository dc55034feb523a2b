//! Error types for the hot-plug bridge.
//!
//! Every failure surfaced to a caller maps to a transport-level
//! [`StatusCode`] and a deterministic message. Callers match on the
//! variant; wire clients see `code` + `Display` output.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Result type alias for bridge operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while attaching or detaching controllers.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    // =========================================================================
    // Request Validation Errors
    // =========================================================================
    /// Subsystem reference missing or not present in the resource store.
    #[error("invalid subsystem{}", name_suffix(.0))]
    InvalidSubsystem(Option<String>),

    /// Controller request carries no PCIe endpoint.
    #[error("no pcie endpoint provided")]
    NoPcieEndpoint,

    /// PCIe endpoint is malformed or outside the configured bus capacity.
    #[error("invalid device endpoint: {reason}")]
    InvalidEndpoint { reason: String },

    /// Detach target is not known to the resource store.
    #[error("unable to find key {0}")]
    NoController(String),

    // =========================================================================
    // Controller Directory Errors
    // =========================================================================
    /// A controller directory for the subsystem is already reserved.
    #[error("Could not create Nvme: controller already exists under {}", .path.display())]
    DirConflict { path: PathBuf },

    // =========================================================================
    // Hypervisor Errors
    // =========================================================================
    /// The hypervisor monitor socket could not be reached.
    #[error("monitor error: {0}")]
    MonitorCreationFailed(String),

    /// The hypervisor rejected the hot-plug request.
    #[error("device error: {0}")]
    AddDeviceFailed(String),

    // =========================================================================
    // Storage Engine Errors
    // =========================================================================
    /// A storage engine RPC failed.
    #[error("{method}: {reason}")]
    StorageEngine { method: String, reason: String },

    // =========================================================================
    // Detach Outcome Errors
    // =========================================================================
    /// Detach left one side attached or the transport socket in place.
    #[error("device is partially deleted: {0}")]
    DevicePartiallyDeleted(String),

    /// Neither the hypervisor nor the storage engine confirmed removal.
    #[error("device is not deleted: {0}")]
    DeviceNotDeleted(String),

    // =========================================================================
    // Configuration Errors
    // =========================================================================
    /// Invalid configuration detected at construction time.
    #[error("invalid configuration: {0}")]
    Config(String),

    // =========================================================================
    // I/O Errors
    // =========================================================================
    /// Generic I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Internal error (should not happen).
    #[error("internal error: {0}")]
    Internal(String),
}

fn name_suffix(name: &Option<String>) -> String {
    match name {
        Some(name) if !name.is_empty() => format!(": {name}"),
        _ => String::new(),
    }
}

impl Error {
    /// Returns the transport-level status code for this error.
    #[must_use]
    pub fn code(&self) -> StatusCode {
        match self {
            Self::InvalidSubsystem(_)
            | Self::NoPcieEndpoint
            | Self::InvalidEndpoint { .. }
            | Self::Config(_) => StatusCode::InvalidArgument,
            Self::NoController(_) => StatusCode::NotFound,
            Self::DirConflict { .. } => StatusCode::AlreadyExists,
            Self::MonitorCreationFailed(_) => StatusCode::Unavailable,
            Self::AddDeviceFailed(_) | Self::DeviceNotDeleted(_) => StatusCode::FailedPrecondition,
            Self::StorageEngine { .. }
            | Self::DevicePartiallyDeleted(_)
            | Self::Io(_)
            | Self::Serialization(_)
            | Self::Internal(_) => StatusCode::Internal,
        }
    }

    /// Returns true if the error was caused by the request itself and
    /// retrying without changing it cannot succeed.
    #[must_use]
    pub fn is_client_error(&self) -> bool {
        matches!(
            self.code(),
            StatusCode::InvalidArgument | StatusCode::NotFound | StatusCode::AlreadyExists
        )
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}

/// Transport-level status codes reported to callers.
///
/// The set mirrors the canonical RPC status codes the storage API uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusCode {
    /// Request is malformed.
    InvalidArgument,
    /// Referenced resource does not exist.
    NotFound,
    /// Resource already exists.
    AlreadyExists,
    /// System is not in a state required for the operation.
    FailedPrecondition,
    /// A remote dependency is unreachable.
    Unavailable,
    /// Internal failure.
    Internal,
}

impl StatusCode {
    /// Returns the wire name of the code.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InvalidArgument => "invalid_argument",
            Self::NotFound => "not_found",
            Self::AlreadyExists => "already_exists",
            Self::FailedPrecondition => "failed_precondition",
            Self::Unavailable => "unavailable",
            Self::Internal => "internal",
        }
    }
}

impl std::fmt::Display for StatusCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
