//! Configuration loading traits and types.
//!
//! Every binary and test loads its TOML configuration through the blanket
//! [`ConfigLoader`] trait. [`CommConfig`] describes the station fleet driven
//! by the engine.
//!
//! # Usage
//!
//! ```rust,no_run
//! use mps_common::config::{CommConfig, ConfigError, ConfigLoader};
//! use std::path::Path;
//!
//! fn main() -> Result<(), ConfigError> {
//!     let config = CommConfig::load(Path::new("comm.toml"))?;
//!     config.validate()?;
//!     println!("{} stations", config.stations.len());
//!     Ok(())
//! }
//! ```

use crate::consts::{
    DEFAULT_HEARTBEAT_INTERVAL, DEFAULT_MODBUS_PORT, DEFAULT_NODE_PORT, DEFAULT_POLL_INTERVAL,
    POLLING_HEARTBEAT_FAILURES, PUBSUB_HEARTBEAT_FAILURES,
};
use crate::machine::MachineType;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Error type for configuration loading operations.
#[derive(Debug, Clone, Error)]
pub enum ConfigError {
    /// Configuration file not found at specified path.
    #[error("Configuration file not found")]
    FileNotFound,

    /// TOML parsing failed.
    #[error("Failed to parse configuration: {0}")]
    ParseError(String),

    /// Semantic validation failed.
    #[error("Configuration validation failed: {0}")]
    ValidationError(String),
}

/// Log level for application logging.
///
/// Uses lowercase serde values for TOML compatibility.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    /// Most verbose, detailed tracing information.
    Trace,
    /// Debug information useful during development.
    Debug,
    /// General information about application operation.
    #[default]
    Info,
    /// Warning messages for potentially problematic situations.
    Warn,
    /// Error messages for serious problems.
    Error,
}

impl LogLevel {
    /// Directive understood by `tracing_subscriber::EnvFilter`.
    pub const fn as_filter(self) -> &'static str {
        match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

/// Common configuration fields.
///
/// # TOML Example
///
/// ```toml
/// [shared]
/// log_level = "debug"
/// service_name = "mps-comm"
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SharedConfig {
    /// Logging verbosity level.
    #[serde(default)]
    pub log_level: LogLevel,

    /// Application instance identifier.
    pub service_name: String,
}

impl SharedConfig {
    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationError` if `service_name` is empty.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.service_name.is_empty() {
            return Err(ConfigError::ValidationError(
                "service_name cannot be empty".to_string(),
            ));
        }
        Ok(())
    }
}

impl Default for SharedConfig {
    fn default() -> Self {
        Self {
            log_level: LogLevel::Info,
            service_name: "mps-comm".to_string(),
        }
    }
}

/// Trait for loading configuration from TOML files.
///
/// # Contract
///
/// - Returns `ConfigError::FileNotFound` if the file does not exist
/// - Returns `ConfigError::ParseError` if TOML syntax is invalid
pub trait ConfigLoader: Sized + serde::de::DeserializeOwned {
    /// Load configuration from a TOML file.
    fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                ConfigError::FileNotFound
            } else {
                ConfigError::ParseError(e.to_string())
            }
        })?;

        toml::from_str(&content).map_err(|e| ConfigError::ParseError(e.to_string()))
    }
}

impl<T: serde::de::DeserializeOwned> ConfigLoader for T {}

// ─── Engine configuration ───────────────────────────────────────────

/// Field protocol of one station.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    /// Node-based pub/sub protocol (monitored items).
    Node,
    /// Register-based Modbus/TCP, polled.
    Modbus,
    /// In-process station model, driven through the pub/sub backend.
    Simulation,
}

impl Protocol {
    /// Lowercase name, as used in configuration files.
    pub const fn as_str(self) -> &'static str {
        match self {
            Protocol::Node => "node",
            Protocol::Modbus => "modbus",
            Protocol::Simulation => "simulation",
        }
    }

    /// True if stations on this protocol are driven by the polling backend.
    pub const fn is_polling(self) -> bool {
        matches!(self, Protocol::Modbus)
    }

    /// Default TCP port.
    pub const fn default_port(self) -> u16 {
        match self {
            Protocol::Modbus => DEFAULT_MODBUS_PORT,
            Protocol::Node | Protocol::Simulation => DEFAULT_NODE_PORT,
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// `[heartbeat]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HeartbeatConfig {
    /// Interval between liveness checks in milliseconds.
    #[serde(default = "default_heartbeat_interval_ms")]
    pub interval_ms: u64,
    /// Consecutive failures before a pub/sub session is rebuilt.
    #[serde(default = "default_pubsub_failures")]
    pub pubsub_failures: u32,
    /// Consecutive failures before a polling link is rebuilt.
    #[serde(default = "default_polling_failures")]
    pub polling_failures: u32,
}

fn default_heartbeat_interval_ms() -> u64 {
    DEFAULT_HEARTBEAT_INTERVAL.as_millis() as u64
}

fn default_pubsub_failures() -> u32 {
    PUBSUB_HEARTBEAT_FAILURES
}

fn default_polling_failures() -> u32 {
    POLLING_HEARTBEAT_FAILURES
}

impl HeartbeatConfig {
    /// Interval as a `Duration`.
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    /// Failure threshold for the given protocol.
    pub fn threshold(&self, protocol: Protocol) -> u32 {
        if protocol.is_polling() {
            self.polling_failures
        } else {
            self.pubsub_failures
        }
    }
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_heartbeat_interval_ms(),
            pubsub_failures: PUBSUB_HEARTBEAT_FAILURES,
            polling_failures: POLLING_HEARTBEAT_FAILURES,
        }
    }
}

/// `[dispatcher]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DispatcherConfig {
    /// Polling interval in milliseconds; also the budget of zero-timeout instructions.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// How long start-up waits for the fleet to become `Ready`.
    #[serde(default = "default_startup_wait_ms")]
    pub startup_wait_ms: u64,
}

fn default_poll_interval_ms() -> u64 {
    DEFAULT_POLL_INTERVAL.as_millis() as u64
}

fn default_startup_wait_ms() -> u64 {
    2000
}

impl DispatcherConfig {
    /// Polling interval as a `Duration`.
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Start-up wait as a `Duration`.
    pub fn startup_wait(&self) -> Duration {
        Duration::from_millis(self.startup_wait_ms)
    }
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
            startup_wait_ms: default_startup_wait_ms(),
        }
    }
}

/// One `[[stations]]` entry.
///
/// ```toml
/// [[stations]]
/// name = "C-RS1"
/// machine_type = "RS"
/// protocol = "node"
/// host = "192.168.2.27"
/// port = 4840
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StationConfig {
    /// Station name; the fleet key.
    pub name: String,
    /// Station type.
    pub machine_type: MachineType,
    /// Field protocol.
    pub protocol: Protocol,
    /// Controller host name or address.
    #[serde(default = "default_host")]
    pub host: String,
    /// Controller port; the protocol default when omitted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    /// Modbus unit id.
    #[serde(default = "default_unit_id")]
    pub unit_id: u8,
    /// Replace the live transport with the in-process station model.
    #[serde(default)]
    pub simulate: bool,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_unit_id() -> u8 {
    1
}

impl StationConfig {
    /// Minimal entry with defaults for host, port and unit id.
    pub fn new(name: impl Into<String>, machine_type: MachineType, protocol: Protocol) -> Self {
        Self {
            name: name.into(),
            machine_type,
            protocol,
            host: default_host(),
            port: None,
            unit_id: default_unit_id(),
            simulate: false,
        }
    }

    /// Effective port.
    pub fn port(&self) -> u16 {
        self.port.unwrap_or_else(|| self.protocol.default_port())
    }

    /// `host:port` endpoint.
    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.host, self.port())
    }

    /// True if the in-process station model replaces the live link.
    pub fn is_simulated(&self) -> bool {
        self.simulate || self.protocol == Protocol::Simulation
    }

    /// Validate one station entry.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationError` if the name or host is empty,
    /// the port is zero, or a Pick & place station is not on Modbus.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.name.trim().is_empty() {
            return Err(ConfigError::ValidationError(
                "station name cannot be empty".to_string(),
            ));
        }
        if self.host.trim().is_empty() {
            return Err(ConfigError::ValidationError(format!(
                "station '{}': host cannot be empty",
                self.name
            )));
        }
        if self.port == Some(0) {
            return Err(ConfigError::ValidationError(format!(
                "station '{}': port must be non-zero",
                self.name
            )));
        }
        if self.machine_type == MachineType::PickPlace && self.protocol == Protocol::Node {
            return Err(ConfigError::ValidationError(format!(
                "station '{}': pick & place stations are driven over modbus",
                self.name
            )));
        }
        Ok(())
    }
}

/// Top-level engine configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CommConfig {
    /// Shared fields.
    #[serde(default)]
    pub shared: SharedConfig,
    /// Heartbeat supervisor settings.
    #[serde(default)]
    pub heartbeat: HeartbeatConfig,
    /// Dispatcher settings.
    #[serde(default)]
    pub dispatcher: DispatcherConfig,
    /// Station fleet.
    #[serde(default)]
    pub stations: Vec<StationConfig>,
}

impl CommConfig {
    /// Validate the whole configuration.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationError` on the first invalid section,
    /// duplicate station name, zero interval or zero failure threshold.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.shared.validate()?;

        if self.heartbeat.interval_ms == 0 {
            return Err(ConfigError::ValidationError(
                "heartbeat.interval_ms must be non-zero".to_string(),
            ));
        }
        if self.heartbeat.pubsub_failures == 0 || self.heartbeat.polling_failures == 0 {
            return Err(ConfigError::ValidationError(
                "heartbeat failure thresholds must be at least 1".to_string(),
            ));
        }
        if self.dispatcher.poll_interval_ms == 0 {
            return Err(ConfigError::ValidationError(
                "dispatcher.poll_interval_ms must be non-zero".to_string(),
            ));
        }

        let mut names = HashSet::new();
        for station in &self.stations {
            station.validate()?;
            if !names.insert(station.name.as_str()) {
                return Err(ConfigError::ValidationError(format!(
                    "duplicate station name '{}'",
                    station.name
                )));
            }
        }
        Ok(())
    }

    /// Look a station entry up by name.
    pub fn station(&self, name: &str) -> Option<&StationConfig> {
        self.stations.iter().find(|s| s.name == name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn write_config(content: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().expect("temp file");
        write!(file, "{content}").expect("write");
        file.flush().expect("flush");
        file
    }

    #[test]
    fn test_log_level_default() {
        assert_eq!(LogLevel::default(), LogLevel::Info);
        assert_eq!(LogLevel::Warn.as_filter(), "warn");
    }

    #[test]
    fn test_config_loader_file_not_found() {
        let result = CommConfig::load(Path::new("/nonexistent/path/comm.toml"));
        assert!(matches!(result, Err(ConfigError::FileNotFound)));
    }

    #[test]
    fn test_config_loader_parse_error() {
        let file = write_config("invalid toml {{{{");
        let result = CommConfig::load(file.path());
        assert!(matches!(result, Err(ConfigError::ParseError(_))));
    }

    #[test]
    fn test_full_config() {
        let file = write_config(
            r#"
[shared]
log_level = "debug"
service_name = "refbox-comm"

[heartbeat]
interval_ms = 500

[[stations]]
name = "C-BS"
machine_type = "BS"
protocol = "node"
host = "192.168.2.27"

[[stations]]
name = "C-PP"
machine_type = "PP"
protocol = "modbus"
host = "192.168.2.30"
unit_id = 3
"#,
        );

        let config = CommConfig::load(file.path()).expect("load");
        config.validate().expect("valid");
        assert_eq!(config.shared.log_level, LogLevel::Debug);
        assert_eq!(config.heartbeat.interval(), Duration::from_millis(500));
        assert_eq!(config.heartbeat.pubsub_failures, PUBSUB_HEARTBEAT_FAILURES);
        assert_eq!(config.dispatcher.poll_interval(), DEFAULT_POLL_INTERVAL);

        let bs = config.station("C-BS").expect("C-BS");
        assert_eq!(bs.machine_type, MachineType::BaseStation);
        assert_eq!(bs.endpoint(), "192.168.2.27:4840");

        let pp = config.station("C-PP").expect("C-PP");
        assert_eq!(pp.port(), DEFAULT_MODBUS_PORT);
        assert_eq!(pp.unit_id, 3);
        assert_eq!(config.heartbeat.threshold(pp.protocol), POLLING_HEARTBEAT_FAILURES);
    }

    #[test]
    fn test_unknown_station_field_rejected() {
        let file = write_config(
            r#"
[[stations]]
name = "C-BS"
machine_type = "BS"
protocol = "node"
colour = "cyan"
"#,
        );
        assert!(matches!(
            CommConfig::load(file.path()),
            Err(ConfigError::ParseError(_))
        ));
    }

    #[test]
    fn test_duplicate_station_rejected() {
        let mut config = CommConfig::default();
        config.stations.push(StationConfig::new(
            "C-CS1",
            MachineType::CapStation,
            Protocol::Simulation,
        ));
        config.stations.push(StationConfig::new(
            "C-CS1",
            MachineType::CapStation,
            Protocol::Simulation,
        ));
        assert!(matches!(
            config.validate(),
            Err(ConfigError::ValidationError(msg)) if msg.contains("duplicate")
        ));
    }

    #[test]
    fn test_zero_port_rejected() {
        let mut station = StationConfig::new("C-DS", MachineType::DeliveryStation, Protocol::Node);
        station.port = Some(0);
        assert!(station.validate().is_err());
    }

    #[test]
    fn test_pick_place_must_use_modbus() {
        let station = StationConfig::new("C-PP", MachineType::PickPlace, Protocol::Node);
        assert!(station.validate().is_err());
        let station = StationConfig::new("C-PP", MachineType::PickPlace, Protocol::Modbus);
        assert!(station.validate().is_ok());
    }

    #[test]
    fn test_zero_heartbeat_interval_rejected() {
        let mut config = CommConfig::default();
        config.heartbeat.interval_ms = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_simulation_flag() {
        let mut station = StationConfig::new("C-SS", MachineType::StorageStation, Protocol::Node);
        assert!(!station.is_simulated());
        station.simulate = true;
        assert!(station.is_simulated());
        let station = StationConfig::new("C-SS", MachineType::StorageStation, Protocol::Simulation);
        assert!(station.is_simulated());
    }
}
