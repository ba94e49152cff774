use lns_config::{ConfigValidationError, ConfigWarning, LnsConfig};

#[test]
fn reports_unknown_keys_with_full_paths() {
    let text = r#"
typo = 1

[dedup]
windw_ms = 1000

[[devices]]
dev_eui = "0004A30B001C0530"
dev_addr = "26011F2A"
clas = "C"
"#;

    let (_config, diagnostics) =
        LnsConfig::load_from_str_with_diagnostics(text).expect("config should parse");

    assert_eq!(
        diagnostics.unknown_keys,
        vec!["dedup.windw_ms", "devices[0].clas", "typo"]
    );
    assert!(diagnostics.is_ok());
}

#[test]
fn zero_queue_depth_is_an_error() {
    let text = r#"
[queue]
max_depth = 0
"#;

    let (_config, diagnostics) =
        LnsConfig::load_from_str_with_diagnostics(text).expect("config should parse");

    assert_eq!(
        diagnostics.errors,
        vec![ConfigValidationError::InvalidValue {
            toml_path: "queue.max_depth".to_owned(),
            message: "must be >= 1".to_owned(),
        }]
    );
}

#[test]
fn zero_station_idle_timeout_is_an_error() {
    let text = r#"
[stations]
idle_timeout_ms = 0
"#;

    let (config, diagnostics) =
        LnsConfig::load_from_str_with_diagnostics(text).expect("config should parse");

    assert_eq!(config.stations.idle_timeout(), Some(std::time::Duration::ZERO));
    assert_eq!(
        diagnostics.errors,
        vec![ConfigValidationError::InvalidValue {
            toml_path: "stations.idle_timeout_ms".to_owned(),
            message: "must be >= 1 when set".to_owned(),
        }]
    );
}

#[test]
fn duplicate_devices_are_reported_by_index() {
    let text = r#"
[[devices]]
dev_eui = "0004A30B001C0530"
dev_addr = "26011F2A"

[[devices]]
dev_eui = "0004a30b001c0530"
dev_addr = "26011F2B"
"#;

    let (_config, diagnostics) =
        LnsConfig::load_from_str_with_diagnostics(text).expect("config should parse");

    assert_eq!(
        diagnostics.errors,
        vec![ConfigValidationError::DuplicateDevice {
            toml_path: "devices[1].dev_eui".to_owned(),
            dev_eui: "0004A30B001C0530".to_owned(),
        }]
    );
}

#[test]
fn disabling_dedup_with_multi_gateway_devices_warns() {
    let text = r#"
[dedup]
mode = "none"

[[devices]]
dev_eui = "0004A30B001C0530"
dev_addr = "26011F2A"

[[devices]]
dev_eui = "0004A30B001C0531"
dev_addr = "26011F2B"
gateway_id = "gw-1"
"#;

    let (_config, diagnostics) =
        LnsConfig::load_from_str_with_diagnostics(text).expect("config should parse");

    assert_eq!(
        diagnostics.warnings,
        vec![ConfigWarning::DedupDisabledWithMultiGatewayDevices { devices: 1 }]
    );
    assert!(diagnostics.is_ok());
}

#[test]
fn empty_gateway_id_is_an_error() {
    let text = r#"
[node]
gateway_id = "  "
"#;

    let (_config, diagnostics) =
        LnsConfig::load_from_str_with_diagnostics(text).expect("config should parse");

    assert!(!diagnostics.is_ok());
    assert!(matches!(
        diagnostics.errors.as_slice(),
        [ConfigValidationError::InvalidValue { toml_path, .. }] if toml_path == "node.gateway_id"
    ));
}

#[test]
fn invalid_logging_directive_warns() {
    let text = r#"
[logging]
level = "lns.router=notalevel"
"#;

    let (_config, diagnostics) =
        LnsConfig::load_from_str_with_diagnostics(text).expect("config should parse");

    assert!(matches!(
        diagnostics.warnings.as_slice(),
        [ConfigWarning::LoggingLevelInvalid { .. }]
    ));
}
