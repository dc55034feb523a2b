//! Tests for bridge configuration loading and validation.

use nvme_hotplug::config::MAX_CONFIG_SIZE;
use nvme_hotplug::{BridgeConfig, Error};
use std::path::Path;
use std::time::Duration;
use tempfile::TempDir;

const FULL_CONFIG: &str = r#"
qmp_address: /var/run/qemu/qmp.sock
spdk_address: /var/tmp/spdk.sock
ctrlr_dir: /var/tmp/ctrlrs
buses: [pci.opi.0, pci.opi.1]
listen_address: /run/bridge.sock
monitor_timeout_ms: 2000
poll_device_presence_step_ms: 25
log_level: debug
"#;

// =============================================================================
// Parsing Tests
// =============================================================================

#[test]
fn test_parse_full_config() {
    let config = BridgeConfig::from_yaml_str(FULL_CONFIG).unwrap();

    assert_eq!(config.qmp_address, Path::new("/var/run/qemu/qmp.sock"));
    assert_eq!(config.spdk_address.as_deref(), Some(Path::new("/var/tmp/spdk.sock")));
    assert_eq!(config.ctrlr_dir, Path::new("/var/tmp/ctrlrs"));
    assert_eq!(config.buses, vec!["pci.opi.0", "pci.opi.1"]);
    assert_eq!(config.listen_address, Path::new("/run/bridge.sock"));
    assert_eq!(config.monitor_timeout(), Duration::from_secs(2));
    assert_eq!(config.poll_device_presence_step(), Duration::from_millis(25));
    assert_eq!(config.log_level, "debug");
}

#[test]
fn test_defaults() {
    let config =
        BridgeConfig::from_yaml_str("qmp_address: /tmp/qmp.sock\nctrlr_dir: /tmp\n").unwrap();

    assert!(config.buses.is_empty());
    assert!(config.spdk_address.is_none());
    assert_eq!(config.listen_address, Path::new("/var/run/nvme-hotplug.sock"));
    assert_eq!(config.monitor_timeout(), Duration::from_secs(5));
    assert_eq!(config.poll_device_presence_step(), Duration::from_millis(50));
    assert_eq!(config.log_level, "info");
    assert_eq!(config, BridgeConfig::new("/tmp/qmp.sock", "/tmp"));
}

#[test]
fn test_json_is_accepted() {
    let config =
        BridgeConfig::from_yaml_str(r#"{"qmp_address": "/tmp/qmp.sock", "ctrlr_dir": "/tmp"}"#)
            .unwrap();
    assert_eq!(config.qmp_address, Path::new("/tmp/qmp.sock"));
}

#[test]
fn test_unknown_field_rejected() {
    let err = BridgeConfig::from_yaml_str("qmp_address: /a\nctrlr_dir: /b\nbusses: []\n")
        .unwrap_err();
    assert!(matches!(err, Error::Config(_)));
}

#[test]
fn test_missing_required_field() {
    let err = BridgeConfig::from_yaml_str("ctrlr_dir: /tmp\n").unwrap_err();
    assert!(err.to_string().contains("qmp_address"));
}

// =============================================================================
// Validation Tests
// =============================================================================

#[test]
fn test_validate_rejects_empty_paths() {
    assert!(BridgeConfig::new("", "/tmp").validate().is_err());
    assert!(BridgeConfig::new("/tmp/qmp.sock", "").validate().is_err());
}

#[test]
fn test_validate_rejects_zero_durations() {
    let config = BridgeConfig::new("/tmp/qmp.sock", "/tmp").with_monitor_timeout(Duration::ZERO);
    assert!(config.validate().is_err());

    let config = BridgeConfig::new("/tmp/qmp.sock", "/tmp").with_poll_step(Duration::ZERO);
    assert!(config.validate().is_err());
}

#[test]
fn test_validate_rejects_oversized_durations() {
    let mut config = BridgeConfig::new("/tmp/qmp.sock", "/tmp");
    config.monitor_timeout_ms = u64::MAX;
    let err = config.validate().unwrap_err();
    assert!(err.to_string().contains("monitor_timeout_ms exceeds"));

    let config =
        BridgeConfig::new("/tmp/qmp.sock", "/tmp").with_poll_step(Duration::from_secs(601));
    assert!(config.validate().is_err());

    let config =
        BridgeConfig::new("/tmp/qmp.sock", "/tmp").with_monitor_timeout(Duration::from_secs(600));
    assert!(config.validate().is_ok());

    let yaml = "qmp_address: /a\nctrlr_dir: /b\nmonitor_timeout_ms: 18446744073709551615\n";
    assert!(BridgeConfig::from_yaml_str(yaml).is_err());
}

#[test]
fn test_validate_rejects_bad_buses() {
    let config = BridgeConfig::new("/tmp/qmp.sock", "/tmp").with_buses(["pci.opi.0", " "]);
    assert!(config.validate().is_err());

    let config = BridgeConfig::new("/tmp/qmp.sock", "/tmp").with_buses(["pci.opi.0", "pci.opi.0"]);
    let err = config.validate().unwrap_err();
    assert!(err.to_string().contains("listed twice"));
}

#[test]
fn test_validate_rejects_unknown_log_level() {
    let mut config = BridgeConfig::new("/tmp/qmp.sock", "/tmp");
    config.log_level = "verbose".to_string();
    assert!(config.validate().is_err());
}

// =============================================================================
// File Loading Tests
// =============================================================================

#[test]
fn test_from_file() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("bridge.yaml");
    std::fs::write(&path, FULL_CONFIG).unwrap();

    let config = BridgeConfig::from_file(&path).unwrap();
    assert_eq!(config.buses.len(), 2);
}

#[test]
fn test_from_missing_file() {
    let temp_dir = TempDir::new().unwrap();
    let err = BridgeConfig::from_file(&temp_dir.path().join("missing.yaml")).unwrap_err();
    assert!(matches!(err, Error::Config(_)));
}

#[test]
fn test_from_oversized_file() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("big.yaml");
    let padding = "#".repeat(MAX_CONFIG_SIZE as usize + 1);
    std::fs::write(&path, format!("{FULL_CONFIG}\n{padding}\n")).unwrap();

    let err = BridgeConfig::from_file(&path).unwrap_err();
    assert!(err.to_string().contains("exceeds"));
}
