//! # Configuration Module
//!
//! Handles loading and validating configuration from TOML files.

use serde::de::Error;
use serde::Deserialize;
use std::collections::HashMap;
use std::fs;
use std::io::ErrorKind;
use std::path::Path;
use std::time::Duration;

use crate::codec::protocol::TransferMode;
use crate::codec::transfer::MAX_CHUNK_SIZE;
use crate::error::{GatewayError, Result};

/// Main configuration structure
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub session: SessionConfig,

    #[serde(default)]
    pub command: CommandConfig,

    #[serde(default)]
    pub file_transfer: FileTransferConfig,

    #[serde(default)]
    pub logging: LoggingConfig,

    #[serde(default)]
    pub telemetry: TelemetryConfig,

    #[serde(default)]
    pub debug: DebugConfig,

    #[serde(default)]
    pub devices: DevicesConfig,
}

/// Transport the listener binds
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Tcp,
    Udp,
}

/// Listener configuration
#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_protocol")]
    pub protocol: Protocol,

    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(default = "default_max_frame_size")]
    pub max_frame_size: usize,
}

/// Device session configuration
#[derive(Debug, Deserialize, Clone)]
pub struct SessionConfig {
    #[serde(default = "default_handshake_timeout_ms")]
    pub handshake_timeout_ms: u64,

    #[serde(default = "default_idle_timeout_ms")]
    pub idle_timeout_ms: u64,
}

/// Command channel configuration
#[derive(Debug, Deserialize, Clone)]
pub struct CommandConfig {
    #[serde(default = "default_response_timeout_ms")]
    pub response_timeout_ms: u64,
}

/// File transfer configuration
#[derive(Debug, Deserialize, Clone)]
pub struct FileTransferConfig {
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,

    #[serde(default = "default_transfer_mode")]
    pub mode: TransferMode,

    #[serde(default = "default_ack_timeout_ms")]
    pub ack_timeout_ms: u64,

    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

/// Diagnostic log configuration
#[derive(Debug, Deserialize, Clone)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Directory for rolling log files; console only when empty
    #[serde(default)]
    pub dir: String,

    #[serde(default = "default_file_prefix")]
    pub file_prefix: String,

    #[serde(default = "default_rotation")]
    pub rotation: String,
}

/// Telemetry recorder configuration
#[derive(Debug, Deserialize, Clone)]
pub struct TelemetryConfig {
    #[serde(default = "default_telemetry_enabled")]
    pub enabled: bool,

    #[serde(default = "default_log_dir")]
    pub log_dir: String,

    #[serde(default = "default_max_records_per_file")]
    pub max_records_per_file: usize,

    #[serde(default = "default_max_files_to_keep")]
    pub max_files_to_keep: usize,
}

/// Artificial delays for exercising device retransmission
#[derive(Debug, Deserialize, Clone, Default)]
pub struct DebugConfig {
    #[serde(default)]
    pub imei_ack_delay_ms: u64,

    #[serde(default)]
    pub record_ack_delay_ms: u64,
}

/// Operator labels for known devices
#[derive(Debug, Deserialize, Clone, Default)]
pub struct DevicesConfig {
    /// IMEI -> label
    #[serde(default)]
    pub names: HashMap<String, String>,
}

// Default value functions
fn default_protocol() -> Protocol { Protocol::Tcp }
fn default_host() -> String { "0.0.0.0".to_string() }
fn default_port() -> u16 { 9000 }
fn default_max_frame_size() -> usize { crate::codec::protocol::DEFAULT_MAX_FRAME_SIZE }

fn default_handshake_timeout_ms() -> u64 { 10_000 }
fn default_idle_timeout_ms() -> u64 { 300_000 }

fn default_response_timeout_ms() -> u64 { 30_000 }

fn default_chunk_size() -> usize { 1024 }
fn default_transfer_mode() -> TransferMode { TransferMode::Full }
fn default_ack_timeout_ms() -> u64 { 10_000 }
fn default_max_retries() -> u32 { 3 }

fn default_log_level() -> String { "info".to_string() }
fn default_file_prefix() -> String { "gateway.log".to_string() }
fn default_rotation() -> String { "daily".to_string() }

fn default_telemetry_enabled() -> bool { false }
fn default_log_dir() -> String { "./logs".to_string() }
fn default_max_records_per_file() -> usize { 10000 }
fn default_max_files_to_keep() -> usize { 10 }

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            protocol: default_protocol(),
            host: default_host(),
            port: default_port(),
            max_frame_size: default_max_frame_size(),
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            handshake_timeout_ms: default_handshake_timeout_ms(),
            idle_timeout_ms: default_idle_timeout_ms(),
        }
    }
}

impl Default for CommandConfig {
    fn default() -> Self {
        Self { response_timeout_ms: default_response_timeout_ms() }
    }
}

impl Default for FileTransferConfig {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
            mode: default_transfer_mode(),
            ack_timeout_ms: default_ack_timeout_ms(),
            max_retries: default_max_retries(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            dir: String::new(),
            file_prefix: default_file_prefix(),
            rotation: default_rotation(),
        }
    }
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            enabled: default_telemetry_enabled(),
            log_dir: default_log_dir(),
            max_records_per_file: default_max_records_per_file(),
            max_files_to_keep: default_max_files_to_keep(),
        }
    }
}

impl ServerConfig {
    /// `host:port` bind address
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl SessionConfig {
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }
}

impl CommandConfig {
    pub fn response_timeout(&self) -> Duration {
        Duration::from_millis(self.response_timeout_ms)
    }
}

impl FileTransferConfig {
    pub fn ack_timeout(&self) -> Duration {
        Duration::from_millis(self.ack_timeout_ms)
    }
}

impl DebugConfig {
    pub fn imei_ack_delay(&self) -> Option<Duration> {
        (self.imei_ack_delay_ms > 0).then(|| Duration::from_millis(self.imei_ack_delay_ms))
    }

    pub fn record_ack_delay(&self) -> Option<Duration> {
        (self.record_ack_delay_ms > 0).then(|| Duration::from_millis(self.record_ack_delay_ms))
    }
}

fn invalid(message: impl std::fmt::Display) -> GatewayError {
    GatewayError::Config(toml::de::Error::custom(message))
}

impl Config {
    /// Load configuration from a TOML file
    ///
    /// # Arguments
    ///
    /// * `path` - Path to the configuration file
    ///
    /// # Returns
    ///
    /// * `Result<Config>` - Loaded and validated configuration
    ///
    /// # Errors
    ///
    /// Returns error if:
    /// - File cannot be read
    /// - TOML parsing fails
    /// - Validation fails
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use teltonika_gateway::config::Config;
    ///
    /// let config = Config::load("config/default.toml")?;
    /// # Ok::<(), Box<dyn std::error::Error>>(())
    /// ```
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = fs::read_to_string(path)?;
        let config: Config = toml::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration, falling back to defaults when the file is missing
    ///
    /// The flag is `false` when the defaults were used.
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> Result<(Self, bool)> {
        match Self::load(path.as_ref()) {
            Ok(config) => Ok((config, true)),
            Err(GatewayError::Io(e)) if e.kind() == ErrorKind::NotFound => Ok((Self::default(), false)),
            Err(e) => Err(e),
        }
    }

    /// Validate configuration values
    ///
    /// # Errors
    ///
    /// Returns error if any configuration value is out of valid range
    pub fn validate(&self) -> Result<()> {
        if self.server.host.is_empty() {
            return Err(invalid("server host cannot be empty"));
        }

        if self.server.max_frame_size < 16 || self.server.max_frame_size > 16 * 1024 * 1024 {
            return Err(invalid("max_frame_size must be between 16 and 16777216"));
        }

        if self.session.handshake_timeout_ms == 0 || self.session.handshake_timeout_ms > 300_000 {
            return Err(invalid("handshake_timeout_ms must be between 1 and 300000"));
        }

        if self.session.idle_timeout_ms == 0 {
            return Err(invalid("idle_timeout_ms must be greater than 0"));
        }

        if self.command.response_timeout_ms == 0 || self.command.response_timeout_ms > 600_000 {
            return Err(invalid("response_timeout_ms must be between 1 and 600000"));
        }

        if self.file_transfer.chunk_size == 0 || self.file_transfer.chunk_size > MAX_CHUNK_SIZE {
            return Err(invalid(format!("chunk_size must be between 1 and {}", MAX_CHUNK_SIZE)));
        }

        if self.file_transfer.chunk_size + 13 > self.server.max_frame_size {
            return Err(invalid("chunk_size does not fit in max_frame_size"));
        }

        if self.file_transfer.ack_timeout_ms == 0 || self.file_transfer.ack_timeout_ms > 600_000 {
            return Err(invalid("ack_timeout_ms must be between 1 and 600000"));
        }

        if self.file_transfer.max_retries > 100 {
            return Err(invalid("max_retries must be at most 100"));
        }

        if !["daily", "hourly", "never"].contains(&self.logging.rotation.as_str()) {
            return Err(invalid("logging rotation must be one of: daily, hourly, never"));
        }

        if self.logging.file_prefix.is_empty() {
            return Err(invalid("logging file_prefix cannot be empty"));
        }

        if self.telemetry.enabled && self.telemetry.log_dir.is_empty() {
            return Err(invalid("telemetry log_dir cannot be empty when enabled"));
        }

        if self.telemetry.max_records_per_file == 0 {
            return Err(invalid("max_records_per_file must be greater than 0"));
        }

        if self.telemetry.max_files_to_keep == 0 {
            return Err(invalid("max_files_to_keep must be greater than 0"));
        }

        if self.debug.imei_ack_delay_ms > 60_000 || self.debug.record_ack_delay_ms > 60_000 {
            return Err(invalid("debug delays must be at most 60000 ms"));
        }

        for imei in self.devices.names.keys() {
            if crate::imei::Imei::parse(imei).is_err() {
                return Err(invalid(format!("devices.names key {:?} is not a 15-digit IMEI", imei)));
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.server.bind_addr(), "0.0.0.0:9000");
        assert_eq!(config.server.protocol, Protocol::Tcp);
        assert_eq!(config.debug.imei_ack_delay(), None);
    }

    #[test]
    fn test_load_config_from_file() {
        use std::io::Write;
        use tempfile::NamedTempFile;

        let toml_content = r#"
[server]
protocol = "udp"
port = 5027

[file_transfer]
mode = "delta"
chunk_size = 512

[debug]
record_ack_delay_ms = 250

[devices.names]
"356307042441013" = "Truck 7"
"#;

        let mut temp_file = NamedTempFile::new().unwrap();
        temp_file.write_all(toml_content.as_bytes()).unwrap();
        temp_file.flush().unwrap();

        let config = Config::load(temp_file.path()).unwrap();
        assert_eq!(config.server.protocol, Protocol::Udp);
        assert_eq!(config.server.port, 5027);
        assert_eq!(config.server.host, "0.0.0.0");
        assert_eq!(config.file_transfer.mode, TransferMode::Delta);
        assert_eq!(config.file_transfer.chunk_size, 512);
        assert_eq!(config.debug.record_ack_delay(), Some(Duration::from_millis(250)));
        assert_eq!(config.devices.names["356307042441013"], "Truck 7");
    }

    #[test]
    fn test_empty_file_uses_defaults() {
        let config: Config = toml::from_str("").unwrap();
        assert!(config.validate().is_ok());
        assert_eq!(config.session.idle_timeout(), Duration::from_secs(300));
    }

    #[test]
    fn test_missing_file_falls_back() {
        let dir = tempfile::tempdir().unwrap();
        let (config, found) = Config::load_or_default(dir.path().join("absent.toml")).unwrap();
        assert_eq!(config.server.port, 9000);
        assert!(!found);
    }

    #[test]
    fn test_sample_config_matches_defaults() {
        let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("config/default.toml");
        let config = Config::load(path).unwrap();
        let defaults = Config::default();
        assert_eq!(config.server.bind_addr(), defaults.server.bind_addr());
        assert_eq!(config.server.max_frame_size, defaults.server.max_frame_size);
        assert_eq!(config.file_transfer.mode, defaults.file_transfer.mode);
        assert_eq!(config.command.response_timeout(), defaults.command.response_timeout());
        assert!(config.devices.names.is_empty());
    }

    #[test]
    fn test_malformed_file_is_error() {
        use std::io::Write;
        use tempfile::NamedTempFile;

        let mut temp_file = NamedTempFile::new().unwrap();
        temp_file.write_all(b"[server]\nprotocol = \"sctp\"\n").unwrap();
        temp_file.flush().unwrap();

        assert!(matches!(
            Config::load_or_default(temp_file.path()),
            Err(GatewayError::Config(_))
        ));
    }

    #[test]
    fn test_empty_host() {
        let mut config = Config::default();
        config.server.host = String::new();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_handshake_timeout_zero() {
        let mut config = Config::default();
        config.session.handshake_timeout_ms = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_idle_timeout_zero() {
        let mut config = Config::default();
        config.session.idle_timeout_ms = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_response_timeout_too_high() {
        let mut config = Config::default();
        config.command.response_timeout_ms = 600_001;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_chunk_size_zero() {
        let mut config = Config::default();
        config.file_transfer.chunk_size = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_chunk_size_exceeds_frame() {
        let mut config = Config::default();
        config.server.max_frame_size = 1024;
        config.file_transfer.chunk_size = 1024;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_invalid_rotation() {
        let mut config = Config::default();
        config.logging.rotation = "weekly".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_empty_log_dir_when_enabled() {
        let mut config = Config::default();
        config.telemetry.enabled = true;
        config.telemetry.log_dir = String::new();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_empty_log_dir_when_disabled() {
        let mut config = Config::default();
        config.telemetry.enabled = false;
        config.telemetry.log_dir = String::new();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_max_files_to_keep_zero() {
        let mut config = Config::default();
        config.telemetry.max_files_to_keep = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_invalid_device_name_key() {
        let mut config = Config::default();
        config.devices.names.insert("12345".to_string(), "short".to_string());
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_default_functions() {
        assert_eq!(default_port(), 9000);
        assert_eq!(default_host(), "0.0.0.0");
        assert_eq!(default_chunk_size(), 1024);
        assert_eq!(default_max_retries(), 3);
        assert_eq!(default_rotation(), "daily");
        assert_eq!(default_max_records_per_file(), 10000);
    }
}
