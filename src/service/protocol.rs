//! Control service wire protocol.
//!
//! - **Transport**: Unix stream socket
//! - **Encoding**: JSON
//! - **Framing**: Newline-delimited, one response per request
//!
//! ```json
//! // Request
//! {"action":"delete_controller","name":"//storage.opiproject.org/volumes/nvme-43"}\n
//!
//! // Response (success)
//! {"status":"ok"}\n
//!
//! // Response (error)
//! {"status":"error","code":"internal","message":"device is partially deleted: ..."}\n
//! ```
//!
//! | Action | Description |
//! |--------|-------------|
//! | `ping` | Liveness check |
//! | `create_subsystem` | Register a subsystem in the resource store |
//! | `get_subsystem` | Look up a subsystem |
//! | `create_controller` | Attach a controller (hot-plug) |
//! | `delete_controller` | Detach a controller (hot-unplug) |
//! | `get_controller` | Look up a controller |

use crate::error::{Error, StatusCode};
use crate::hotplug::{CreateNvmeControllerRequest, DeleteNvmeControllerRequest};
use crate::store::{NvmeController, NvmeSubsystem};
use serde::{Deserialize, Serialize};

// =============================================================================
// Request Types
// =============================================================================

/// Request from a caller to the bridge.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum Request {
    /// Liveness check.
    Ping,

    /// Register a subsystem.
    CreateSubsystem(CreateSubsystemRequest),

    /// Look up a subsystem.
    GetSubsystem {
        /// Canonical name.
        name: String,
    },

    /// Attach a controller.
    CreateController(CreateNvmeControllerRequest),

    /// Detach a controller.
    DeleteController(DeleteNvmeControllerRequest),

    /// Look up a controller.
    GetController {
        /// Canonical name.
        name: String,
    },
}

/// Register a subsystem.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateSubsystemRequest {
    /// Caller-chosen resource id; generated when absent.
    #[serde(default)]
    pub subsystem_id: Option<String>,
    /// NVMe qualified name.
    pub nqn: String,
}

// =============================================================================
// Response Types
// =============================================================================

/// Response from the bridge.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Response {
    /// Success response.
    Ok(OkPayload),
    /// Error response.
    Error(ErrorPayload),
}

impl Response {
    /// Creates a success response with no data.
    #[must_use]
    pub fn ok() -> Self {
        Self::Ok(OkPayload { data: None })
    }

    /// Creates a success response with data.
    #[must_use]
    pub fn ok_with_data(data: ResponseData) -> Self {
        Self::Ok(OkPayload { data: Some(data) })
    }

    /// Creates an error response.
    #[must_use]
    pub fn error(code: StatusCode, message: impl Into<String>) -> Self {
        Self::Error(ErrorPayload {
            code,
            message: message.into(),
        })
    }

    /// Returns true if this is a success response.
    #[must_use]
    pub fn is_ok(&self) -> bool {
        matches!(self, Self::Ok(_))
    }
}

impl From<Error> for Response {
    fn from(e: Error) -> Self {
        Self::error(e.code(), e.to_string())
    }
}

/// Success payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OkPayload {
    /// Optional response data.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<ResponseData>,
}

/// Response data variants.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ResponseData {
    /// Pong response.
    Pong {
        /// Bridge version.
        version: String,
    },
    /// A subsystem.
    Subsystem(NvmeSubsystem),
    /// A controller.
    Controller(NvmeController),
}

/// Error payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorPayload {
    /// Status code.
    pub code: StatusCode,
    /// Human-readable message.
    pub message: String,
}

// =============================================================================
// Wire Format Helpers
// =============================================================================

impl Request {
    /// Serializes request to JSON line (with newline).
    ///
    /// # Errors
    ///
    /// Returns error if JSON serialization fails.
    pub fn to_json_line(&self) -> Result<String, serde_json::Error> {
        let mut json = serde_json::to_string(self)?;
        json.push('\n');
        Ok(json)
    }

    /// Deserializes request from JSON.
    ///
    /// # Errors
    ///
    /// Returns error if JSON deserialization fails.
    pub fn from_json(s: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(s.trim())
    }
}

impl Response {
    /// Serializes response to JSON line (with newline).
    ///
    /// # Errors
    ///
    /// Returns error if JSON serialization fails.
    pub fn to_json_line(&self) -> Result<String, serde_json::Error> {
        let mut json = serde_json::to_string(self)?;
        json.push('\n');
        Ok(json)
    }

    /// Deserializes response from JSON.
    ///
    /// # Errors
    ///
    /// Returns error if JSON deserialization fails.
    pub fn from_json(s: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(s.trim())
    }
}
