//! Control client for the bridge's Unix socket.
//!
//! Each request opens a new connection, writes one JSON line and reads one
//! response line.
//!
//! ```rust,ignore
//! use nvme_hotplug::service::ControlClient;
//!
//! let client = ControlClient::new("/var/run/nvme-hotplug.sock");
//! let version = client.ping().await?;
//! client.delete_controller("//storage.opiproject.org/volumes/nvme-43").await?;
//! ```

use super::protocol::{CreateSubsystemRequest, Request, Response, ResponseData};
use crate::error::StatusCode;
use crate::hotplug::{CreateNvmeControllerRequest, DeleteNvmeControllerRequest};
use crate::store::{NvmeController, NvmeSubsystem};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;
use tokio::time::timeout;

/// Default timeout for control requests (60 seconds).
///
/// Detach waits for the guest to release the device, so this is longer
/// than a single QMP round trip.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);

/// Control client error.
#[derive(Debug, thiserror::Error)]
pub enum ControlError {
    /// Connection failed.
    #[error("failed to connect to bridge at {}: {source}", address.display())]
    ConnectionFailed {
        /// Socket path.
        address: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// Request timeout.
    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The bridge returned an error.
    #[error("bridge error ({code}): {message}")]
    Bridge {
        /// Status code.
        code: StatusCode,
        /// Error message.
        message: String,
    },

    /// Unexpected response.
    #[error("unexpected response: expected {expected}, got {got}")]
    UnexpectedResponse {
        /// Expected response type.
        expected: String,
        /// Actual response.
        got: String,
    },

    /// Connection closed before a response arrived.
    #[error("connection closed by bridge")]
    Closed,
}

/// Result type for control client operations.
pub type ControlResult<T> = std::result::Result<T, ControlError>;

/// Client for the bridge control socket.
#[derive(Debug, Clone)]
pub struct ControlClient {
    /// Socket path.
    address: PathBuf,
    /// Request timeout.
    timeout: Duration,
}

impl ControlClient {
    /// Creates a client with the default timeout.
    #[must_use]
    pub fn new(address: impl Into<PathBuf>) -> Self {
        Self {
            address: address.into(),
            timeout: DEFAULT_TIMEOUT,
        }
    }

    /// Sets the request timeout.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Returns the socket path.
    #[must_use]
    pub fn address(&self) -> &Path {
        &self.address
    }

    /// Sends a request and returns the success payload data.
    async fn send_request(&self, request: &Request) -> ControlResult<Option<ResponseData>> {
        let stream = timeout(self.timeout, UnixStream::connect(&self.address))
            .await
            .map_err(|_| ControlError::Timeout(self.timeout))?
            .map_err(|source| ControlError::ConnectionFailed {
                address: self.address.clone(),
                source,
            })?;

        let (reader, mut writer) = stream.into_split();
        let mut reader = BufReader::new(reader);

        writer.write_all(request.to_json_line()?.as_bytes()).await?;
        writer.flush().await?;

        let mut line = String::new();
        let n = timeout(self.timeout, reader.read_line(&mut line))
            .await
            .map_err(|_| ControlError::Timeout(self.timeout))??;
        if n == 0 {
            return Err(ControlError::Closed);
        }

        match Response::from_json(&line)? {
            Response::Ok(payload) => Ok(payload.data),
            Response::Error(e) => Err(ControlError::Bridge {
                code: e.code,
                message: e.message,
            }),
        }
    }

    /// Pings the bridge and returns its version.
    ///
    /// # Errors
    ///
    /// Returns error if the bridge is unreachable.
    pub async fn ping(&self) -> ControlResult<String> {
        match self.send_request(&Request::Ping).await? {
            Some(ResponseData::Pong { version }) => Ok(version),
            other => Err(unexpected("Pong", other)),
        }
    }

    /// Registers a subsystem.
    ///
    /// # Errors
    ///
    /// Returns error if the bridge rejects the request.
    pub async fn create_subsystem(
        &self,
        subsystem_id: Option<String>,
        nqn: impl Into<String>,
    ) -> ControlResult<NvmeSubsystem> {
        let request = Request::CreateSubsystem(CreateSubsystemRequest {
            subsystem_id,
            nqn: nqn.into(),
        });
        match self.send_request(&request).await? {
            Some(ResponseData::Subsystem(subsystem)) => Ok(subsystem),
            other => Err(unexpected("Subsystem", other)),
        }
    }

    /// Looks up a subsystem.
    ///
    /// # Errors
    ///
    /// Returns error if the subsystem is unknown.
    pub async fn get_subsystem(&self, name: impl Into<String>) -> ControlResult<NvmeSubsystem> {
        let request = Request::GetSubsystem { name: name.into() };
        match self.send_request(&request).await? {
            Some(ResponseData::Subsystem(subsystem)) => Ok(subsystem),
            other => Err(unexpected("Subsystem", other)),
        }
    }

    /// Attaches a controller.
    ///
    /// # Errors
    ///
    /// Returns error if the attach fails.
    pub async fn create_controller(
        &self,
        request: CreateNvmeControllerRequest,
    ) -> ControlResult<NvmeController> {
        match self.send_request(&Request::CreateController(request)).await? {
            Some(ResponseData::Controller(controller)) => Ok(controller),
            other => Err(unexpected("Controller", other)),
        }
    }

    /// Detaches a controller.
    ///
    /// # Errors
    ///
    /// Returns error if the detach fails or is incomplete.
    pub async fn delete_controller(&self, name: impl Into<String>) -> ControlResult<()> {
        let request = Request::DeleteController(DeleteNvmeControllerRequest { name: name.into() });
        self.send_request(&request).await?;
        Ok(())
    }

    /// Looks up a controller.
    ///
    /// # Errors
    ///
    /// Returns error if the controller is unknown.
    pub async fn get_controller(&self, name: impl Into<String>) -> ControlResult<NvmeController> {
        let request = Request::GetController { name: name.into() };
        match self.send_request(&request).await? {
            Some(ResponseData::Controller(controller)) => Ok(controller),
            other => Err(unexpected("Controller", other)),
        }
    }
}

fn unexpected(expected: &str, got: Option<ResponseData>) -> ControlError {
    ControlError::UnexpectedResponse {
        expected: expected.to_string(),
        got: format!("{got:?}"),
    }
}
