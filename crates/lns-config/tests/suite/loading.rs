use std::io::Write;
use std::net::SocketAddr;
use std::time::Duration;

use lns_config::{ConfigError, DedupMode, LnsConfig};
use lns_core::{DevAddr, DevEui, DeviceClass};
use tempfile::NamedTempFile;

#[test]
fn loads_a_full_config_from_disk() {
    let mut file = NamedTempFile::new().expect("tempfile");
    write!(
        file,
        r#"
[node]
gateway_id = "gw-eu-1"

[stations]
listen = "127.0.0.1:5900"
idle_timeout_ms = 120000

[dedup]
mode = "mark"
window_ms = 30000

[frame_counter]
save_frequency = 5

[bus]
broker = "10.0.0.5:6000"

[[devices]]
dev_eui = "0004A30B001C0530"
dev_addr = "26011F2A"
class = "C"
gateway_id = "gw-eu-1"
fcnt_down = 42
"#
    )
    .expect("write config");

    let config = LnsConfig::load_from_path(file.path()).expect("config should load");

    assert_eq!(config.node.gateway_id().expect("gateway id").as_str(), "gw-eu-1");
    assert_eq!(
        config.stations.listen,
        "127.0.0.1:5900".parse::<SocketAddr>().unwrap()
    );
    assert_eq!(config.stations.idle_timeout(), Some(Duration::from_secs(120)));
    assert_eq!(config.dedup.mode, DedupMode::Mark);
    assert_eq!(config.dedup.window(), Duration::from_secs(30));
    assert_eq!(config.frame_counter.save_frequency, 5);
    assert_eq!(
        config.bus.broker,
        Some("10.0.0.5:6000".parse::<SocketAddr>().unwrap())
    );
    assert_eq!(config.queue.max_depth, 10);

    let device = &config.devices[0];
    assert_eq!(device.dev_eui, DevEui::new(0x0004_A30B_001C_0530));
    assert_eq!(device.dev_addr, DevAddr::new(0x2601_1F2A));
    assert_eq!(device.class, DeviceClass::C);
    assert_eq!(device.fcnt_down, 42);
    assert!(!device.relaxed_counters);
}

#[test]
fn missing_file_reports_its_path() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("absent.toml");

    let err = LnsConfig::load_from_path(&path).expect_err("missing file should fail");
    match err {
        ConfigError::Io { path: reported, .. } => {
            assert!(reported.ends_with("absent.toml"), "{reported}")
        }
        other => panic!("unexpected error: {other:?}"),
    }
}

#[test]
fn class_b_devices_fail_to_parse() {
    let text = r#"
[[devices]]
dev_eui = "0004A30B001C0530"
dev_addr = "26011F2A"
class = "B"
"#;

    assert!(matches!(
        LnsConfig::load_from_str_with_diagnostics(text),
        Err(ConfigError::Toml(_))
    ));
}

#[test]
fn empty_input_yields_defaults() {
    let (config, diagnostics) =
        LnsConfig::load_from_str_with_diagnostics("").expect("empty config should parse");
    assert_eq!(config, LnsConfig::default());
    assert_eq!(config.stations.idle_timeout(), None);
    assert!(diagnostics.is_empty(), "{diagnostics:?}");
}
