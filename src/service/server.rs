//! Control server accepting JSON-line requests on a Unix socket.
//!
//! Each accepted connection runs in its own task and may carry any number
//! of requests; the server answers each line before reading the next.
//! Concurrent requests for unrelated subsystems proceed in parallel, the
//! orchestrator itself enforces one attach per subsystem.

use super::protocol::{CreateSubsystemRequest, Request, Response, ResponseData};
use crate::constants::{MAX_CONNECTIONS, MAX_REQUEST_LINE_LEN, REQUEST_READ_TIMEOUT};
use crate::error::{Error, Result, StatusCode};
use crate::hotplug::HotplugServer;
use crate::store::{NvmeSubsystem, generate_resource_id, resource_id_to_volume_name};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tracing::{debug, info, warn};

/// Control server bound to a Unix socket.
#[derive(Debug)]
pub struct ControlServer {
    /// Orchestrator handling attach/detach.
    hotplug: Arc<HotplugServer>,
    /// Socket path.
    listen_address: PathBuf,
    /// Bound listener.
    listener: UnixListener,
}

impl ControlServer {
    /// Binds the control socket, replacing a stale socket file.
    ///
    /// # Errors
    ///
    /// Returns error if the socket cannot be bound.
    pub fn bind(hotplug: Arc<HotplugServer>, listen_address: impl Into<PathBuf>) -> Result<Self> {
        let listen_address = listen_address.into();
        match std::fs::remove_file(&listen_address) {
            Ok(()) => debug!(path = %listen_address.display(), "removed stale control socket"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(Error::Io(e)),
        }
        let listener = UnixListener::bind(&listen_address)?;
        info!(path = %listen_address.display(), "control server listening");
        Ok(Self {
            hotplug,
            listen_address,
            listener,
        })
    }

    /// Returns the socket path.
    #[must_use]
    pub fn listen_address(&self) -> &Path {
        &self.listen_address
    }

    /// Serves connections until `shutdown` completes.
    ///
    /// # Errors
    ///
    /// Returns error if removing the socket file on shutdown fails.
    pub async fn serve(self, shutdown: impl Future<Output = ()>) -> Result<()> {
        let connection_count = Arc::new(AtomicUsize::new(0));
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("control server shutting down");
                    break;
                }
                result = self.listener.accept() => {
                    match result {
                        Ok((stream, _)) => {
                            if connection_count.load(Ordering::Relaxed) >= MAX_CONNECTIONS {
                                warn!(max = MAX_CONNECTIONS, "connection rejected: limit reached");
                                continue;
                            }
                            let hotplug = Arc::clone(&self.hotplug);
                            let counter = Arc::clone(&connection_count);
                            counter.fetch_add(1, Ordering::Relaxed);
                            tokio::spawn(async move {
                                if let Err(e) = handle_connection(stream, hotplug).await {
                                    debug!(error = %e, "control connection error");
                                }
                                counter.fetch_sub(1, Ordering::Relaxed);
                            });
                        }
                        Err(e) => warn!(error = %e, "failed to accept connection"),
                    }
                }
            }
        }

        match std::fs::remove_file(&self.listen_address) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::Io(e)),
        }
    }
}

/// Handles all requests on one connection.
async fn handle_connection(stream: UnixStream, hotplug: Arc<HotplugServer>) -> Result<()> {
    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);

    loop {
        let mut line = String::new();
        let read_result =
            tokio::time::timeout(REQUEST_READ_TIMEOUT, reader.read_line(&mut line)).await;

        let response = match read_result {
            Ok(Ok(0)) => return Ok(()),
            Ok(Ok(n)) if n > MAX_REQUEST_LINE_LEN => {
                Response::error(StatusCode::InvalidArgument, "request too large")
            }
            Ok(Ok(_)) => match Request::from_json(&line) {
                Ok(request) => handle_request(request, &hotplug).await,
                Err(e) => Response::error(
                    StatusCode::InvalidArgument,
                    format!("JSON parse error: {e}"),
                ),
            },
            Ok(Err(e)) => return Err(Error::Io(e)),
            Err(_) => {
                debug!("control connection idle, closing");
                return Ok(());
            }
        };

        writer.write_all(response.to_json_line()?.as_bytes()).await?;
        writer.flush().await?;
    }
}

/// Dispatches a parsed request.
pub async fn handle_request(request: Request, hotplug: &HotplugServer) -> Response {
    let result = match request {
        Request::Ping => Ok(Response::ok_with_data(ResponseData::Pong {
            version: env!("CARGO_PKG_VERSION").to_string(),
        })),
        Request::CreateSubsystem(req) => create_subsystem(req, hotplug).await,
        Request::GetSubsystem { name } => hotplug
            .store()
            .subsystem(&name)
            .await
            .map(|s| Response::ok_with_data(ResponseData::Subsystem(s)))
            .ok_or_else(|| Error::InvalidSubsystem(Some(name.clone()))),
        Request::CreateController(req) => hotplug
            .create_controller(req)
            .await
            .map(|c| Response::ok_with_data(ResponseData::Controller(c))),
        Request::DeleteController(req) => hotplug.delete_controller(req).await.map(|()| Response::ok()),
        Request::GetController { name } => hotplug
            .store()
            .controller(&name)
            .await
            .map(|c| Response::ok_with_data(ResponseData::Controller(c)))
            .ok_or_else(|| Error::NoController(name.clone())),
    };
    result.unwrap_or_else(Response::from)
}

async fn create_subsystem(req: CreateSubsystemRequest, hotplug: &HotplugServer) -> Result<Response> {
    if req.nqn.trim().is_empty() {
        return Err(Error::InvalidSubsystem(None));
    }
    let resource_id = req
        .subsystem_id
        .filter(|id| !id.is_empty())
        .unwrap_or_else(generate_resource_id);
    let name = resource_id_to_volume_name(&resource_id);
    let store = hotplug.store();
    if let Some(existing) = store.subsystem(&name).await {
        debug!(name = %name, "subsystem already registered");
        return Ok(Response::ok_with_data(ResponseData::Subsystem(existing)));
    }
    let subsystem = NvmeSubsystem {
        name,
        nqn: req.nqn,
    };
    store.insert_subsystem(subsystem.clone()).await;
    info!(name = %subsystem.name, nqn = %subsystem.nqn, "subsystem registered");
    Ok(Response::ok_with_data(ResponseData::Subsystem(subsystem)))
}
