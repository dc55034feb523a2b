//! # Storage Engine Interface
//!
//! The storage engine owns the NVMe-oF target and its vfio-user transport.
//! The bridge only needs it to start and stop listening on a subsystem's
//! local socket, in lock-step with the hypervisor hot-plug calls.
//!
//! ```text
//! attach:  add_listener(params)     ──► engine creates <ctrlr_dir>/<subsys>/cntrl
//! detach:  remove_listener(params)  ──► engine closes and unlinks the socket
//! ```
//!
//! ## Modules
//!
//! - [`jsonrpc`]: JSON-RPC 2.0 client over the engine's Unix socket

use crate::listener::ListenerParams;
use async_trait::async_trait;
use std::time::Duration;

pub mod jsonrpc;

pub use jsonrpc::JsonRpcEngine;

/// Storage engine client error.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// Connection failed.
    #[error("failed to connect to storage engine at {address}: {source}")]
    ConnectionFailed {
        /// Socket path.
        address: String,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// Request timeout.
    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Peer closed the connection before a full response arrived.
    #[error("EOF")]
    Eof,

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Response id does not match the request id.
    #[error("json response ID mismatch")]
    IdMismatch,

    /// The engine returned a JSON-RPC error.
    #[error("json response error: {message}")]
    Rpc {
        /// JSON-RPC error code.
        code: i64,
        /// Error message.
        message: String,
    },

    /// The engine answered but reported the operation as not performed.
    #[error("{0}")]
    Rejected(String),

    /// Response exceeded the size limit.
    #[error("response exceeds {0} bytes")]
    ResponseTooLarge(usize),
}

/// Result type for storage engine operations.
pub type EngineResult<T> = Result<T, EngineError>;

/// Storage engine operations used by the orchestrator.
///
/// Implementations must be `Send + Sync`; calls for unrelated subsystems may
/// run concurrently.
#[async_trait]
pub trait StorageEngine: Send + Sync {
    /// Starts listening for a subsystem on its vfio-user socket.
    async fn add_listener(&self, params: &ListenerParams) -> EngineResult<()>;

    /// Stops listening for a subsystem and releases its socket.
    async fn remove_listener(&self, params: &ListenerParams) -> EngineResult<()>;
}
