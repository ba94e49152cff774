use std::io::{self, Write};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Once};
use std::time::Duration;

use lns_core::{DevAddr, DevEui, DeviceClass, GatewayId, IdParseError};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing_subscriber::fmt::writer::{BoxMakeWriter, MakeWriterExt};
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::prelude::*;

mod diagnostics;
mod validation;

pub use diagnostics::{
    ConfigDiagnostics, ConfigValidationError, ConfigWarning, ValidationDiagnostics,
};

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
/// Top-level LNS configuration.
///
/// Example:
/// ```toml
/// [node]
/// gateway_id = "gw-eu-1"
///
/// [stations]
/// listen = "0.0.0.0:5000"
/// prune_interval_ms = 30000
/// idle_timeout_ms = 300000
///
/// [dedup]
/// mode = "drop"
/// window_ms = 60000
///
/// [queue]
/// max_depth = 10
///
/// [bus]
/// broker = "10.0.0.5:6000"
/// topic = "lns.remote-calls"
///
/// [[devices]]
/// dev_eui = "0004A30B001C0530"
/// dev_addr = "26011F2A"
/// class = "A"
/// ```
pub struct LnsConfig {
    /// Identity of this instance.
    #[serde(default)]
    pub node: NodeConfig,

    /// Station socket listener and liveness pruning.
    #[serde(default)]
    pub stations: StationsConfig,

    /// Concentrator-level uplink deduplication.
    #[serde(default)]
    pub dedup: DedupConfig,

    /// Per-device request lanes.
    #[serde(default)]
    pub queue: QueueConfig,

    #[serde(default)]
    pub frame_counter: FrameCounterConfig,

    /// Cross-instance broadcast channel.
    #[serde(default)]
    pub bus: BusConfig,

    /// Global logging settings for LNS crates.
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Devices seeded into the in-memory device store.
    #[serde(default)]
    pub devices: Vec<DeviceSeed>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Gateway identity used for single-gateway device affinity.
    #[serde(default = "NodeConfig::default_gateway_id")]
    pub gateway_id: String,
}

impl NodeConfig {
    fn default_gateway_id() -> String {
        "lns-gateway".to_owned()
    }

    pub fn gateway_id(&self) -> Result<GatewayId, IdParseError> {
        GatewayId::new(self.gateway_id.clone())
    }
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            gateway_id: Self::default_gateway_id(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StationsConfig {
    #[serde(default = "StationsConfig::default_listen")]
    pub listen: SocketAddr,

    /// How often closed station sockets are pruned from the registry.
    #[serde(default = "StationsConfig::default_prune_interval_ms")]
    pub prune_interval_ms: u64,

    /// Station connections that do not send `Hello` within this budget are dropped.
    #[serde(default = "StationsConfig::default_hello_timeout_ms")]
    pub hello_timeout_ms: u64,

    /// Close station connections silent for this long. Unset keeps quiet stations connected.
    #[serde(default)]
    pub idle_timeout_ms: Option<u64>,
}

impl StationsConfig {
    fn default_listen() -> SocketAddr {
        SocketAddr::from(([0, 0, 0, 0], 5000))
    }

    fn default_prune_interval_ms() -> u64 {
        30_000
    }

    fn default_hello_timeout_ms() -> u64 {
        5_000
    }

    pub fn prune_interval(&self) -> Duration {
        Duration::from_millis(self.prune_interval_ms)
    }

    pub fn hello_timeout(&self) -> Duration {
        Duration::from_millis(self.hello_timeout_ms)
    }

    pub fn idle_timeout(&self) -> Option<Duration> {
        self.idle_timeout_ms.map(Duration::from_millis)
    }
}

impl Default for StationsConfig {
    fn default() -> Self {
        Self {
            listen: Self::default_listen(),
            prune_interval_ms: Self::default_prune_interval_ms(),
            hello_timeout_ms: Self::default_hello_timeout_ms(),
            idle_timeout_ms: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum DedupMode {
    /// Duplicates are dropped before they reach a device lane.
    #[default]
    Drop,
    /// Duplicates are processed for counter bookkeeping but never answered.
    Mark,
    /// Deduplication disabled.
    None,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DedupConfig {
    #[serde(default)]
    pub mode: DedupMode,

    #[serde(default = "DedupConfig::default_window_ms")]
    pub window_ms: u64,

    /// Upper bound on tracked frame fingerprints.
    #[serde(default = "DedupConfig::default_capacity")]
    pub capacity: usize,

    #[serde(default = "DedupConfig::default_sweep_interval_ms")]
    pub sweep_interval_ms: u64,
}

impl DedupConfig {
    fn default_window_ms() -> u64 {
        60_000
    }

    fn default_capacity() -> usize {
        100_000
    }

    fn default_sweep_interval_ms() -> u64 {
        10_000
    }

    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            mode: DedupMode::default(),
            window_ms: Self::default_window_ms(),
            capacity: Self::default_capacity(),
            sweep_interval_ms: Self::default_sweep_interval_ms(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Maximum number of pending (queued or in-flight) requests per device.
    #[serde(default = "QueueConfig::default_max_depth")]
    pub max_depth: usize,

    /// Idle device lanes are torn down after this long without work.
    #[serde(default = "QueueConfig::default_idle_timeout_ms")]
    pub idle_timeout_ms: u64,
}

impl QueueConfig {
    fn default_max_depth() -> usize {
        10
    }

    fn default_idle_timeout_ms() -> u64 {
        30_000
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_depth: Self::default_max_depth(),
            idle_timeout_ms: Self::default_idle_timeout_ms(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameCounterConfig {
    /// Single-gateway devices persist their down-counter every N increments.
    #[serde(default = "FrameCounterConfig::default_save_frequency")]
    pub save_frequency: u32,
}

impl FrameCounterConfig {
    fn default_save_frequency() -> u32 {
        10
    }
}

impl Default for FrameCounterConfig {
    fn default() -> Self {
        Self {
            save_frequency: Self::default_save_frequency(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BusConfig {
    /// Address of the broadcast broker. When unset, remote calls stay in-process.
    #[serde(default)]
    pub broker: Option<SocketAddr>,

    #[serde(default = "BusConfig::default_topic")]
    pub topic: String,

    /// Per-subscriber buffer; slower subscribers lose messages.
    #[serde(default = "BusConfig::default_channel_capacity")]
    pub channel_capacity: usize,
}

impl BusConfig {
    fn default_topic() -> String {
        "lns.remote-calls".to_owned()
    }

    fn default_channel_capacity() -> usize {
        1024
    }
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            broker: None,
            topic: Self::default_topic(),
            channel_capacity: Self::default_channel_capacity(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceSeed {
    pub dev_eui: DevEui,
    pub dev_addr: DevAddr,
    #[serde(default)]
    pub class: DeviceClass,
    /// Binds the device to one gateway (single-gateway affinity).
    #[serde(default)]
    pub gateway_id: Option<String>,
    /// The device may restart its counters without rejoining (ABP relaxed).
    #[serde(default)]
    pub relaxed_counters: bool,
    #[serde(default)]
    pub fcnt_up: u32,
    #[serde(default)]
    pub fcnt_down: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Logging level for all LNS crates.
    #[serde(default = "LoggingConfig::default_level")]
    pub level: String,

    /// Emit logs in JSON format.
    #[serde(default)]
    pub json: bool,

    /// Mirror logs to stderr.
    #[serde(default = "LoggingConfig::default_stderr")]
    pub stderr: bool,

    /// Append logs to the given file path.
    ///
    /// If the file cannot be opened, file logging is disabled while other sinks
    /// remain active.
    #[serde(default)]
    pub file: Option<PathBuf>,
}

impl LoggingConfig {
    fn default_level() -> String {
        "info".to_owned()
    }

    fn default_stderr() -> bool {
        true
    }

    pub(crate) fn normalize_level_directives(input: &str) -> String {
        let trimmed = input.trim();
        if trimmed.is_empty() {
            return Self::default_level();
        }

        match trimmed.to_ascii_lowercase().as_str() {
            "trace" => "trace".to_owned(),
            "debug" => "debug".to_owned(),
            "info" => "info".to_owned(),
            "warn" | "warning" => "warn".to_owned(),
            "error" => "error".to_owned(),
            // Anything else is treated as an `EnvFilter` directive string.
            _ => trimmed.to_owned(),
        }
    }

    fn config_env_filter(&self) -> tracing_subscriber::EnvFilter {
        let directives = Self::normalize_level_directives(&self.level);
        tracing_subscriber::EnvFilter::try_new(directives).unwrap_or_else(|_| {
            tracing_subscriber::EnvFilter::default()
                .add_directive(tracing_subscriber::filter::LevelFilter::INFO.into())
        })
    }

    /// Create the effective `EnvFilter`.
    ///
    /// `level` may be either a simple level (`info`, `debug`, ...) or a full
    /// `tracing_subscriber::EnvFilter` directive string. If `RUST_LOG` is set, it is merged in.
    pub fn env_filter(&self) -> tracing_subscriber::EnvFilter {
        let env_directives = std::env::var("RUST_LOG")
            .ok()
            .map(|value| value.trim().to_owned())
            .filter(|value| !value.is_empty());

        let config_directives = Self::normalize_level_directives(&self.level);

        match env_directives {
            Some(env_directives) => {
                let combined = format!("{config_directives},{env_directives}");
                tracing_subscriber::EnvFilter::try_new(combined)
                    .or_else(|_| tracing_subscriber::EnvFilter::try_new(env_directives))
                    .unwrap_or_else(|_| self.config_env_filter())
            }
            None => self.config_env_filter(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: Self::default_level(),
            json: false,
            stderr: Self::default_stderr(),
            file: None,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse toml config: {0}")]
    Toml(String),
}

impl From<toml::de::Error> for ConfigError {
    fn from(err: toml::de::Error) -> Self {
        // The default `Display` includes a source snippet; keep just the message.
        ConfigError::Toml(err.message().to_owned())
    }
}

impl LnsConfig {
    /// Load a config file from TOML.
    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = read_config(path.as_ref())?;
        Self::load_from_str(&text)
    }

    pub fn load_from_str(text: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(text)?)
    }

    /// Load a config file from TOML and return diagnostics (unknown keys and semantic
    /// validation failures).
    pub fn load_from_path_with_diagnostics(
        path: impl AsRef<Path>,
    ) -> Result<(Self, ConfigDiagnostics), ConfigError> {
        let text = read_config(path.as_ref())?;
        Self::load_from_str_with_diagnostics(&text)
    }

    pub fn load_from_str_with_diagnostics(
        text: &str,
    ) -> Result<(Self, ConfigDiagnostics), ConfigError> {
        let (config, unknown_keys) =
            diagnostics::deserialize_toml_with_unknown_keys::<LnsConfig>(text)?;

        let mut diagnostics = ConfigDiagnostics {
            unknown_keys,
            ..ConfigDiagnostics::default()
        };
        diagnostics.extend_validation(config.validate());

        Ok((config, diagnostics))
    }
}

fn read_config(path: &Path) -> Result<String, ConfigError> {
    std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.display().to_string(),
        source,
    })
}

struct MutexFileMakeWriter {
    file: Arc<Mutex<std::fs::File>>,
}

impl<'a> MakeWriter<'a> for MutexFileMakeWriter {
    type Writer = MutexFileWriter<'a>;

    fn make_writer(&'a self) -> Self::Writer {
        MutexFileWriter {
            guard: self.file.lock(),
        }
    }
}

struct MutexFileWriter<'a> {
    guard: parking_lot::MutexGuard<'a, std::fs::File>,
}

impl Write for MutexFileWriter<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.guard.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.guard.flush()
    }
}

static TRACING_INIT: Once = Once::new();

/// Initializes structured `tracing` logging.
///
/// This function is safe to call multiple times; only the first call installs a
/// global subscriber.
pub fn init_tracing(logging: &LoggingConfig) {
    TRACING_INIT.call_once(|| {
        let filter = logging.env_filter();

        let file = logging
            .file
            .as_ref()
            .and_then(|path| {
                std::fs::OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(path)
                    .ok()
            })
            .map(|file| Arc::new(Mutex::new(file)));
        let file_open_failed = logging.file.is_some() && file.is_none();

        let mut make_writer = if logging.stderr {
            // `cargo test` output capture only works for the stdlib's `print!/eprint!`
            // macros; `TestWriter` keeps unit tests quiet in debug builds.
            if cfg!(debug_assertions) {
                BoxMakeWriter::new(tracing_subscriber::fmt::writer::TestWriter::with_stderr)
            } else {
                BoxMakeWriter::new(std::io::stderr)
            }
        } else {
            BoxMakeWriter::new(std::io::sink)
        };
        if let Some(file) = file {
            make_writer = BoxMakeWriter::new(make_writer.and(MutexFileMakeWriter { file }));
        }

        let layer: Box<dyn tracing_subscriber::Layer<_> + Send + Sync> = if logging.json {
            tracing_subscriber::fmt::layer()
                .json()
                .with_writer(make_writer)
                .with_ansi(false)
                .boxed()
        } else {
            tracing_subscriber::fmt::layer()
                .with_writer(make_writer)
                .with_ansi(false)
                .boxed()
        };

        let subscriber = tracing_subscriber::registry().with(filter).with(layer);
        if tracing::subscriber::set_global_default(subscriber).is_ok() && file_open_failed {
            if let Some(path) = logging.file.as_ref() {
                tracing::warn!(
                    target: "lns.config",
                    path = %path.display(),
                    "failed to open log file; file logging disabled"
                );
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn level_directives_are_forgiving() {
        assert_eq!(LoggingConfig::normalize_level_directives("WARNING"), "warn");
        assert_eq!(LoggingConfig::normalize_level_directives(""), "info");
        assert_eq!(
            LoggingConfig::normalize_level_directives("lns.router=debug"),
            "lns.router=debug"
        );
    }

    #[test]
    fn defaults_match_documented_values() {
        let config = LnsConfig::default();
        assert_eq!(config.queue.max_depth, 10);
        assert_eq!(config.dedup.mode, DedupMode::Drop);
        assert_eq!(config.dedup.window(), Duration::from_secs(60));
        assert_eq!(config.frame_counter.save_frequency, 10);
        assert_eq!(config.bus.topic, "lns.remote-calls");
        assert!(config.bus.broker.is_none());
    }
}
