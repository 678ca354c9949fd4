//! Shipped configuration tests

#![allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable

use std::io::Write;
use std::path::PathBuf;
use std::time::Duration;

use devsrv::core::config::DevsrvConfig;
use devsrv::core::transport::TransportType;
use devsrv::device::DeviceRegistry;

fn sample_path() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("config/devsrv.yaml")
}

#[test]
fn test_sample_config_is_valid() {
    let registry = DeviceRegistry::with_builtin();
    let config = DevsrvConfig::load(sample_path(), &registry.keys()).unwrap();

    let names: Vec<&str> = config.devices.iter().map(|d| d.name.as_str()).collect();
    assert_eq!(names, vec!["scanner", "cash-1", "receipt-printer"]);
    assert_eq!(config.devices[2].transport, TransportType::None);
    assert_eq!(
        config.devices[1].handshake.map(|h| h.ack_timeout),
        Some(Duration::from_millis(800))
    );
    assert!(config.status.persistence_file.is_some());
    assert_eq!(config.status.messages.len(), 3);
}

#[test]
fn test_effective_config_reloads() {
    let registry = DeviceRegistry::with_builtin();
    let config = DevsrvConfig::load(sample_path(), &registry.keys()).unwrap();

    // What `--validate` prints must itself be a loadable config
    let printed = serde_yaml::to_string(&config).unwrap();
    let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
    file.write_all(printed.as_bytes()).unwrap();

    let reloaded = DevsrvConfig::load(file.path(), &registry.keys()).unwrap();
    assert_eq!(reloaded.devices, config.devices);
    assert_eq!(reloaded.status.policies, config.status.policies);
}
