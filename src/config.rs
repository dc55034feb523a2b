//! Bridge configuration.
//!
//! Loaded once at startup from YAML (JSON is accepted as well, YAML being a
//! superset):
//!
//! ```yaml
//! qmp_address: /var/run/qemu/qmp.sock
//! spdk_address: /var/tmp/spdk.sock
//! ctrlr_dir: /var/tmp/ctrlrs
//! buses: [pci.opi.0, pci.opi.1]
//! listen_address: /var/run/nvme-hotplug.sock
//! monitor_timeout_ms: 5000
//! poll_device_presence_step_ms: 50
//! log_level: info
//! ```
//!
//! An empty `buses` list selects direct addressing.

use crate::constants::{
    DEFAULT_LISTEN_ADDRESS, DEFAULT_MONITOR_TIMEOUT, DEFAULT_POLL_DEVICE_PRESENCE_STEP,
    MAX_MONITOR_TIMEOUT,
};
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Maximum size of a configuration file (64 KiB).
pub const MAX_CONFIG_SIZE: u64 = 64 * 1024;

/// Hot-plug bridge configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BridgeConfig {
    /// QEMU QMP socket.
    pub qmp_address: PathBuf,
    /// Base directory for controller directories.
    pub ctrlr_dir: PathBuf,
    /// Ordered virtual PCI bus names.
    #[serde(default)]
    pub buses: Vec<String>,
    /// Storage engine JSON-RPC socket.
    #[serde(default)]
    pub spdk_address: Option<PathBuf>,
    /// Control service socket.
    #[serde(default = "default_listen_address")]
    pub listen_address: PathBuf,
    /// QMP connect/read timeout in milliseconds.
    #[serde(default = "default_monitor_timeout_ms")]
    pub monitor_timeout_ms: u64,
    /// Presence poll interval after `device_del`, in milliseconds.
    #[serde(default = "default_poll_step_ms")]
    pub poll_device_presence_step_ms: u64,
    /// Log level (`error`, `warn`, `info`, `debug`, `trace`).
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_listen_address() -> PathBuf {
    PathBuf::from(DEFAULT_LISTEN_ADDRESS)
}

fn default_monitor_timeout_ms() -> u64 {
    DEFAULT_MONITOR_TIMEOUT.as_millis() as u64
}

fn default_poll_step_ms() -> u64 {
    DEFAULT_POLL_DEVICE_PRESENCE_STEP.as_millis() as u64
}

fn default_log_level() -> String {
    "info".to_string()
}

impl BridgeConfig {
    /// Creates a configuration with defaults for everything but the two
    /// required paths.
    #[must_use]
    pub fn new(qmp_address: impl Into<PathBuf>, ctrlr_dir: impl Into<PathBuf>) -> Self {
        Self {
            qmp_address: qmp_address.into(),
            ctrlr_dir: ctrlr_dir.into(),
            buses: Vec::new(),
            spdk_address: None,
            listen_address: default_listen_address(),
            monitor_timeout_ms: default_monitor_timeout_ms(),
            poll_device_presence_step_ms: default_poll_step_ms(),
            log_level: default_log_level(),
        }
    }

    /// Sets the virtual PCI buses.
    #[must_use]
    pub fn with_buses<I, S>(mut self, buses: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.buses = buses.into_iter().map(Into::into).collect();
        self
    }

    /// Sets the QMP timeout.
    #[must_use]
    pub fn with_monitor_timeout(mut self, timeout: Duration) -> Self {
        self.monitor_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Sets the presence poll interval.
    #[must_use]
    pub fn with_poll_step(mut self, step: Duration) -> Self {
        self.poll_device_presence_step_ms = step.as_millis() as u64;
        self
    }

    /// Loads and validates a configuration file.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the file cannot be read, is too large,
    /// does not parse, or fails validation.
    pub fn from_file(path: &Path) -> Result<Self> {
        let metadata = std::fs::metadata(path)
            .map_err(|e| Error::Config(format!("cannot read {}: {e}", path.display())))?;
        if metadata.len() > MAX_CONFIG_SIZE {
            return Err(Error::Config(format!(
                "{} exceeds {MAX_CONFIG_SIZE} bytes",
                path.display()
            )));
        }
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("cannot read {}: {e}", path.display())))?;
        Self::from_yaml_str(&content)
    }

    /// Parses and validates a configuration document.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] on parse or validation failure.
    pub fn from_yaml_str(content: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(content)
            .map_err(|e| Error::Config(format!("failed to parse config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Validates field values.
    ///
    /// Directory existence is checked when the orchestrator is constructed.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] describing the first invalid field.
    pub fn validate(&self) -> Result<()> {
        if self.qmp_address.as_os_str().is_empty() {
            return Err(Error::Config("qmp_address is empty".to_string()));
        }
        if self.ctrlr_dir.as_os_str().is_empty() {
            return Err(Error::Config("ctrlr_dir is empty".to_string()));
        }
        if self.monitor_timeout_ms == 0 {
            return Err(Error::Config("monitor_timeout_ms must be positive".to_string()));
        }
        if self.poll_device_presence_step_ms == 0 {
            return Err(Error::Config(
                "poll_device_presence_step_ms must be positive".to_string(),
            ));
        }
        let max_ms = MAX_MONITOR_TIMEOUT.as_millis();
        if u128::from(self.monitor_timeout_ms) > max_ms {
            return Err(Error::Config(format!("monitor_timeout_ms exceeds {max_ms}")));
        }
        if u128::from(self.poll_device_presence_step_ms) > max_ms {
            return Err(Error::Config(format!(
                "poll_device_presence_step_ms exceeds {max_ms}"
            )));
        }
        for (i, bus) in self.buses.iter().enumerate() {
            if bus.trim().is_empty() {
                return Err(Error::Config(format!("bus {i} has an empty name")));
            }
            if self.buses[..i].contains(bus) {
                return Err(Error::Config(format!("bus '{bus}' is listed twice")));
            }
        }
        match self.log_level.as_str() {
            "error" | "warn" | "info" | "debug" | "trace" => Ok(()),
            other => Err(Error::Config(format!("unknown log_level '{other}'"))),
        }
    }

    /// Returns the QMP timeout.
    #[must_use]
    pub fn monitor_timeout(&self) -> Duration {
        Duration::from_millis(self.monitor_timeout_ms)
    }

    /// Returns the presence poll interval.
    #[must_use]
    pub fn poll_device_presence_step(&self) -> Duration {
        Duration::from_millis(self.poll_device_presence_step_ms)
    }
}
