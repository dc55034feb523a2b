//! QMP monitor session.
//!
//! A [`MonitorSession`] owns exactly one connection to the hypervisor's QMP
//! socket. The orchestrator opens one per attach/detach call and closes it
//! before returning; dropping a session on an early return closes the socket
//! as well, so no connection outlives the call that created it.
//!
//! The protocol itself is spoken by [`qapi::Qmp`]: it reads the greeting,
//! negotiates capabilities and queues asynchronous events while a command
//! waits for its reply. `qapi::Qmp` is a blocking client, so every exchange
//! runs on the blocking pool and is bounded by the session timeout, both as
//! a socket read/write timeout and as an async deadline. A session whose
//! exchange was abandoned on timeout reports [`MonitorError::Disconnected`]
//! from then on. The session never retries; a failure is final for the call.

use super::protocol::{NvmeDevice, PciAddress, find_device};
use crate::constants::DEFAULT_POLL_DEVICE_PRESENCE_STEP;
use qapi::ExecuteError;
use qapi_qmp::{PciInfo, device_add, device_del, query_pci};
use std::io::{self, BufReader};
use std::net::Shutdown;
use std::os::unix::net::UnixStream as StdUnixStream;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::net::UnixStream;
use tokio::task;
use tokio::time::{Instant, sleep, timeout};
use tracing::{debug, info};

type QmpStream = qapi::Qmp<qapi::Stream<BufReader<StdUnixStream>, StdUnixStream>>;

/// QMP session error.
#[derive(Debug, thiserror::Error)]
pub enum MonitorError {
    /// Connection failed.
    #[error("failed to connect to QMP socket {address}: {source}")]
    ConnectionFailed {
        /// Socket path.
        address: String,
        /// Underlying I/O error.
        source: io::Error,
    },

    /// Operation timed out.
    #[error("QMP operation timed out after {0:?}")]
    Timeout(Duration),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Greeting or capability negotiation failed.
    #[error("QMP handshake failed: {0}")]
    Handshake(String),

    /// QEMU closed the connection.
    #[error("QMP connection closed by peer")]
    Disconnected,

    /// QEMU rejected a command.
    #[error("{command} failed ({class}): {desc}")]
    CommandFailed {
        /// Command name.
        command: String,
        /// QMP error class.
        class: String,
        /// QMP error description.
        desc: String,
    },

    /// Device is not present on any PCI bus.
    #[error("device {0} not found on any PCI bus")]
    DeviceNotFound(String),

    /// Device was still present when the wait for its removal expired.
    #[error("device {id} still present after {waited:?}")]
    DeviceStillPresent {
        /// Device id.
        id: String,
        /// Time waited.
        waited: Duration,
    },
}

/// Result type for QMP operations.
pub type MonitorResult<T> = Result<T, MonitorError>;

/// An open, negotiated QMP connection.
pub struct MonitorSession {
    /// Socket path.
    address: PathBuf,
    /// Negotiated client; `None` after an exchange was abandoned.
    qmp: Option<QmpStream>,
    /// Connect/read timeout.
    timeout: Duration,
    /// Interval between presence polls after `device_del`.
    poll_step: Duration,
}

// qapi::Qmp is not Debug.
impl std::fmt::Debug for MonitorSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MonitorSession")
            .field("address", &self.address)
            .field("open", &self.qmp.is_some())
            .field("timeout", &self.timeout)
            .field("poll_step", &self.poll_step)
            .finish()
    }
}

impl MonitorSession {
    /// Connects to the QMP socket and completes capability negotiation.
    ///
    /// # Errors
    ///
    /// Returns error if the socket cannot be reached, the greeting does not
    /// arrive within `timeout`, or negotiation is rejected.
    pub async fn open(address: impl AsRef<Path>, timeout_duration: Duration) -> MonitorResult<Self> {
        let address = address.as_ref().to_path_buf();
        let stream = timeout(timeout_duration, UnixStream::connect(&address))
            .await
            .map_err(|_| MonitorError::Timeout(timeout_duration))?
            .map_err(|e| MonitorError::ConnectionFailed {
                address: address.display().to_string(),
                source: e,
            })?;

        let stream = stream.into_std()?;
        stream.set_nonblocking(false)?;
        stream.set_read_timeout(Some(timeout_duration))?;
        stream.set_write_timeout(Some(timeout_duration))?;
        let qmp = qapi::Qmp::new(qapi::Stream::new(
            BufReader::new(stream.try_clone()?),
            stream,
        ));

        let mut session = Self {
            address,
            qmp: Some(qmp),
            timeout: timeout_duration,
            poll_step: DEFAULT_POLL_DEVICE_PRESENCE_STEP,
        };
        let info = session
            .exchange("qmp_capabilities", |qmp| qmp.handshake())
            .await
            .map_err(|e| match e {
                MonitorError::Timeout(_) => e,
                other => MonitorError::Handshake(other.to_string()),
            })?;

        debug!(
            address = %session.address.display(),
            version = ?info.version,
            "QMP session open"
        );
        Ok(session)
    }

    /// Sets the interval between presence polls after `device_del`.
    #[must_use]
    pub fn with_poll_step(mut self, poll_step: Duration) -> Self {
        self.poll_step = poll_step;
        self
    }

    /// Returns the socket path.
    #[must_use]
    pub fn address(&self) -> &Path {
        &self.address
    }

    // =========================================================================
    // Device Operations
    // =========================================================================

    /// Hot-plugs a vfio-user NVMe controller.
    ///
    /// # Errors
    ///
    /// Returns [`MonitorError::CommandFailed`] if QEMU rejects the device.
    pub async fn add_nvme_device(&mut self, device: &NvmeDevice) -> MonitorResult<()> {
        info!(
            id = %device.id,
            nqn = %device.nqn,
            location = %device.location,
            "adding NVMe device"
        );
        self.add_device(device.device_add()).await
    }

    /// Issues a raw `device_add`.
    ///
    /// # Errors
    ///
    /// Returns [`MonitorError::CommandFailed`] if QEMU rejects the device.
    pub async fn add_device(&mut self, command: device_add) -> MonitorResult<()> {
        self.exchange("device_add", move |qmp| qmp.execute(&command))
            .await
            .map(|_| ())
    }

    /// Requests removal of a device and waits until it leaves the PCI tree.
    ///
    /// # Errors
    ///
    /// Returns [`MonitorError::CommandFailed`] if QEMU rejects the request,
    /// or [`MonitorError::DeviceStillPresent`] if the guest does not release
    /// the device within the session timeout.
    pub async fn delete_device(&mut self, id: &str) -> MonitorResult<()> {
        info!(id, "deleting device");
        let command = device_del { id: id.to_string() };
        self.exchange("device_del", move |qmp| qmp.execute(&command))
            .await?;
        self.wait_device_absent(id).await
    }

    /// Returns the guest-observed address of a device.
    ///
    /// # Errors
    ///
    /// Returns [`MonitorError::DeviceNotFound`] if the device is absent.
    pub async fn query_device_address(&mut self, id: &str) -> MonitorResult<PciAddress> {
        let buses = self.query_pci().await?;
        find_device(&buses, id).ok_or_else(|| MonitorError::DeviceNotFound(id.to_string()))
    }

    /// Returns the full `query-pci` tree.
    ///
    /// # Errors
    ///
    /// Returns error if the command fails or the reply is malformed.
    pub async fn query_pci(&mut self) -> MonitorResult<Vec<PciInfo>> {
        self.exchange("query-pci", |qmp| qmp.execute(&query_pci {}))
            .await
    }

    /// Closes the session.
    ///
    /// # Errors
    ///
    /// Returns error if shutting down the socket fails.
    pub async fn close(mut self) -> MonitorResult<()> {
        if let Some(mut qmp) = self.qmp.take() {
            qmp.inner_mut().get_mut_write().shutdown(Shutdown::Both)?;
        }
        debug!(address = %self.address.display(), "QMP session closed");
        Ok(())
    }

    // =========================================================================
    // Helpers
    // =========================================================================

    async fn wait_device_absent(&mut self, id: &str) -> MonitorResult<()> {
        let started = Instant::now();
        loop {
            let buses = self.query_pci().await?;
            if find_device(&buses, id).is_none() {
                debug!(id, waited = ?started.elapsed(), "device removed");
                return Ok(());
            }
            if started.elapsed() >= self.timeout {
                return Err(MonitorError::DeviceStillPresent {
                    id: id.to_string(),
                    waited: started.elapsed(),
                });
            }
            sleep(self.poll_step).await;
        }
    }

    /// Runs one blocking exchange with QEMU on the blocking pool.
    async fn exchange<T, E, F>(&mut self, command: &'static str, op: F) -> MonitorResult<T>
    where
        F: FnOnce(&mut QmpStream) -> Result<T, E> + Send + 'static,
        E: Into<ExecuteError> + Send + 'static,
        T: Send + 'static,
    {
        let mut qmp = self.qmp.take().ok_or(MonitorError::Disconnected)?;
        let exchange = task::spawn_blocking(move || {
            let result = op(&mut qmp);
            (qmp, result)
        });

        let (qmp, result) = timeout(self.timeout, exchange)
            .await
            .map_err(|_| MonitorError::Timeout(self.timeout))?
            .map_err(io::Error::from)?;
        self.qmp = Some(qmp);

        result.map_err(|e| command_error(command, e.into(), self.timeout))
    }
}

fn command_error(command: &str, error: ExecuteError, timeout: Duration) -> MonitorError {
    match error {
        ExecuteError::Qapi(e) => MonitorError::CommandFailed {
            command: command.to_string(),
            class: format!("{:?}", e.class),
            desc: e.desc,
        },
        ExecuteError::Io(e) => match e.kind() {
            io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut => MonitorError::Timeout(timeout),
            io::ErrorKind::UnexpectedEof
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted => MonitorError::Disconnected,
            _ => MonitorError::Io(e),
        },
    }
}
