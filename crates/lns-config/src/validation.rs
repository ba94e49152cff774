use std::collections::HashSet;

use crate::diagnostics::{ConfigValidationError, ConfigWarning, ValidationDiagnostics};
use crate::{DedupMode, LnsConfig, LoggingConfig};

impl LnsConfig {
    /// Validate semantic invariants for a configuration.
    ///
    /// Validation is best-effort: it attempts to report as many problems as possible in one pass.
    #[must_use]
    pub fn validate(&self) -> ValidationDiagnostics {
        let mut out = ValidationDiagnostics::default();

        validate_node(self, &mut out);
        validate_intervals(self, &mut out);
        validate_queue(self, &mut out);
        validate_devices(self, &mut out);
        validate_logging(self, &mut out);

        out
    }
}

fn validate_node(config: &LnsConfig, out: &mut ValidationDiagnostics) {
    if config.node.gateway_id().is_err() {
        out.errors.push(ConfigValidationError::InvalidValue {
            toml_path: "node.gateway_id".to_owned(),
            message: "must not be empty".to_owned(),
        });
    }
}

fn validate_intervals(config: &LnsConfig, out: &mut ValidationDiagnostics) {
    let zero_is_fatal = [
        ("stations.prune_interval_ms", config.stations.prune_interval_ms),
        ("dedup.sweep_interval_ms", config.dedup.sweep_interval_ms),
        ("queue.idle_timeout_ms", config.queue.idle_timeout_ms),
    ];
    for (toml_path, value) in zero_is_fatal {
        if value == 0 {
            out.errors.push(ConfigValidationError::InvalidValue {
                toml_path: toml_path.to_owned(),
                message: "must be >= 1".to_owned(),
            });
        }
    }

    if config.stations.idle_timeout_ms == Some(0) {
        out.errors.push(ConfigValidationError::InvalidValue {
            toml_path: "stations.idle_timeout_ms".to_owned(),
            message: "must be >= 1 when set".to_owned(),
        });
    }

    if config.dedup.mode != DedupMode::None {
        if config.dedup.window_ms == 0 {
            out.errors.push(ConfigValidationError::InvalidValue {
                toml_path: "dedup.window_ms".to_owned(),
                message: "must be >= 1 unless dedup.mode = \"none\"".to_owned(),
            });
        }
        if config.dedup.capacity == 0 {
            out.errors.push(ConfigValidationError::InvalidValue {
                toml_path: "dedup.capacity".to_owned(),
                message: "must be >= 1".to_owned(),
            });
        }
    }

    if config.frame_counter.save_frequency == 0 {
        out.errors.push(ConfigValidationError::InvalidValue {
            toml_path: "frame_counter.save_frequency".to_owned(),
            message: "must be >= 1".to_owned(),
        });
    }

    if config.bus.channel_capacity == 0 {
        out.errors.push(ConfigValidationError::InvalidValue {
            toml_path: "bus.channel_capacity".to_owned(),
            message: "must be >= 1".to_owned(),
        });
    }
    if config.bus.topic.trim().is_empty() {
        out.errors.push(ConfigValidationError::InvalidValue {
            toml_path: "bus.topic".to_owned(),
            message: "must not be empty".to_owned(),
        });
    }
}

fn validate_queue(config: &LnsConfig, out: &mut ValidationDiagnostics) {
    if config.queue.max_depth == 0 {
        out.errors.push(ConfigValidationError::InvalidValue {
            toml_path: "queue.max_depth".to_owned(),
            message: "must be >= 1".to_owned(),
        });
    } else if config.queue.max_depth > 1_000 {
        out.warnings.push(ConfigWarning::InvalidValue {
            toml_path: "queue.max_depth".to_owned(),
            message: "unusually deep device queue; requests may age out of their receive window"
                .to_owned(),
        });
    }
}

fn validate_devices(config: &LnsConfig, out: &mut ValidationDiagnostics) {
    let mut seen = HashSet::new();
    let mut multi_gateway = 0usize;

    for (idx, device) in config.devices.iter().enumerate() {
        if !seen.insert(device.dev_eui) {
            out.errors.push(ConfigValidationError::DuplicateDevice {
                toml_path: format!("devices[{idx}].dev_eui"),
                dev_eui: device.dev_eui.to_string(),
            });
        }

        match device.gateway_id.as_deref() {
            Some(id) if id.trim().is_empty() => {
                out.errors.push(ConfigValidationError::InvalidValue {
                    toml_path: format!("devices[{idx}].gateway_id"),
                    message: "must not be empty when set".to_owned(),
                });
            }
            Some(_) => {}
            None => multi_gateway += 1,
        }
    }

    if config.dedup.mode == DedupMode::None && multi_gateway > 0 {
        out.warnings
            .push(ConfigWarning::DedupDisabledWithMultiGatewayDevices {
                devices: multi_gateway,
            });
    }
}

fn validate_logging(config: &LnsConfig, out: &mut ValidationDiagnostics) {
    let normalized = LoggingConfig::normalize_level_directives(&config.logging.level);
    if !config.logging.level.trim().is_empty()
        && tracing_subscriber::EnvFilter::try_new(normalized.clone()).is_err()
    {
        out.warnings.push(ConfigWarning::LoggingLevelInvalid {
            value: config.logging.level.clone(),
            normalized,
        });
    }
}
