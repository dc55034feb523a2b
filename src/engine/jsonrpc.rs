//! JSON-RPC 2.0 client for the storage engine.
//!
//! Each call opens a new Unix socket connection, writes one request object,
//! reads until a complete response object has arrived and closes the
//! connection. The engine does not frame responses with newlines, so the
//! reader accumulates bytes until `serde_json` stops reporting EOF.
//!
//! # Example
//!
//! ```rust,ignore
//! use nvme_hotplug::engine::{JsonRpcEngine, StorageEngine};
//!
//! let engine = JsonRpcEngine::new("/var/tmp/spdk.sock");
//! engine.add_listener(&params).await?;
//! ```

use super::{EngineError, EngineResult, StorageEngine};
use crate::constants::{
    ENGINE_RPC_TIMEOUT, MAX_ENGINE_RESPONSE_SIZE, RPC_ADD_LISTENER, RPC_REMOVE_LISTENER,
};
use crate::listener::ListenerParams;
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;
use tokio::time::timeout;
use tracing::debug;

// =============================================================================
// Wire Types
// =============================================================================

#[derive(Debug, Serialize)]
struct RpcRequest<'a, P> {
    jsonrpc: &'static str,
    id: u64,
    method: &'a str,
    params: &'a P,
}

#[derive(Debug, Deserialize)]
struct RpcResponse<R> {
    id: u64,
    result: Option<R>,
    error: Option<RpcErrorObject>,
}

#[derive(Debug, Deserialize)]
struct RpcErrorObject {
    code: i64,
    message: String,
}

// =============================================================================
// Client
// =============================================================================

/// JSON-RPC client for the storage engine's Unix socket.
#[derive(Debug)]
pub struct JsonRpcEngine {
    /// Socket path.
    address: PathBuf,
    /// Per-call timeout.
    timeout: Duration,
    /// Next request id.
    next_id: AtomicU64,
}

impl JsonRpcEngine {
    /// Creates a client for the given socket path.
    #[must_use]
    pub fn new(address: impl Into<PathBuf>) -> Self {
        Self {
            address: address.into(),
            timeout: ENGINE_RPC_TIMEOUT,
            next_id: AtomicU64::new(1),
        }
    }

    /// Sets the per-call timeout.
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

    /// Calls `method` and decodes its result.
    ///
    /// # Errors
    ///
    /// Returns an error on connection, framing or protocol failure, or if
    /// the engine returned a JSON-RPC error object.
    pub async fn call<P, R>(&self, method: &str, params: &P) -> EngineResult<R>
    where
        P: Serialize + Sync,
        R: DeserializeOwned,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let request = serde_json::to_vec(&RpcRequest {
            jsonrpc: "2.0",
            id,
            method,
            params,
        })?;

        let mut stream = timeout(self.timeout, UnixStream::connect(&self.address))
            .await
            .map_err(|_| EngineError::Timeout(self.timeout))?
            .map_err(|e| EngineError::ConnectionFailed {
                address: self.address.display().to_string(),
                source: e,
            })?;

        debug!(method, id, "sending storage engine request");
        stream.write_all(&request).await?;
        stream.flush().await?;

        let response: RpcResponse<R> = timeout(self.timeout, read_response(&mut stream))
            .await
            .map_err(|_| EngineError::Timeout(self.timeout))??;

        if response.id != id {
            return Err(EngineError::IdMismatch);
        }
        if let Some(err) = response.error {
            return Err(EngineError::Rpc {
                code: err.code,
                message: err.message,
            });
        }
        response.result.ok_or(EngineError::Eof)
    }
}

/// Reads one JSON value from the stream.
async fn read_response<R: DeserializeOwned>(stream: &mut UnixStream) -> EngineResult<R> {
    let mut buf = Vec::with_capacity(4096);
    let mut chunk = [0u8; 4096];
    loop {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Err(EngineError::Eof);
        }
        buf.extend_from_slice(&chunk[..n]);
        if buf.len() > MAX_ENGINE_RESPONSE_SIZE {
            return Err(EngineError::ResponseTooLarge(MAX_ENGINE_RESPONSE_SIZE));
        }
        match serde_json::from_slice(&buf) {
            Ok(value) => return Ok(value),
            Err(e) if e.is_eof() => continue,
            Err(e) => return Err(e.into()),
        }
    }
}

#[async_trait]
impl StorageEngine for JsonRpcEngine {
    async fn add_listener(&self, params: &ListenerParams) -> EngineResult<()> {
        let added: bool = self.call(RPC_ADD_LISTENER, params).await?;
        if !added {
            return Err(EngineError::Rejected(format!(
                "Could not add listener for {}",
                params.nqn
            )));
        }
        Ok(())
    }

    async fn remove_listener(&self, params: &ListenerParams) -> EngineResult<()> {
        let removed: bool = self.call(RPC_REMOVE_LISTENER, params).await?;
        if !removed {
            return Err(EngineError::Rejected(format!(
                "Could not remove listener for {}",
                params.nqn
            )));
        }
        Ok(())
    }
}
