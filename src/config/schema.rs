//! Configuration schema definitions.
//!
//! Every section is `#[serde(default)]`, so a file only needs the keys it
//! changes.

use super::error::{ConfigError, ConfigResult};
use crate::fdset::FD_SETSIZE;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Root configuration structure.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Backend selection
    pub backend: BackendConfig,
    /// Descriptor table
    pub registry: RegistryConfig,
    /// Overlapped COMM emulation tuning
    pub emulation: EmulationConfig,
    /// Logging configuration
    pub logging: LoggingConfig,
    /// Hardware testing configuration
    pub testing: TestingConfig,
}

impl Config {
    /// Reject values no backend can work with.
    pub fn validate(&self) -> ConfigResult<()> {
        if self.registry.max_ports == 0 || self.registry.max_ports > FD_SETSIZE {
            return Err(ConfigError::validation(
                "registry.max_ports",
                format!("must be between 1 and {}", FD_SETSIZE),
            ));
        }
        if self.emulation.rx_buffer_size == 0 || self.emulation.tx_buffer_size == 0 {
            return Err(ConfigError::validation(
                "emulation.rx_buffer_size / tx_buffer_size",
                "buffer sizes must be non-zero",
            ));
        }
        if self.emulation.xon_limit == 0 || self.emulation.xoff_limit == 0 {
            return Err(ConfigError::validation(
                "emulation.xon_limit / xoff_limit",
                "flow-control limits must be non-zero",
            ));
        }
        if self.emulation.baud_base == 0 {
            return Err(ConfigError::validation("emulation.baud_base", "must be non-zero"));
        }
        Ok(())
    }
}

/// Which backend `backend::probe` should construct.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// Pick by host capability
    #[default]
    Auto,
    /// Direct termios/ioctl calls
    Posix,
    /// Overlapped COMM emulation
    Emulated,
}

/// Backend section.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    /// Backend kind: "auto", "posix" or "emulated"
    pub kind: BackendKind,
}

/// Descriptor registry section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// Number of descriptor slots
    pub max_ports: usize,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self { max_ports: 256 }
    }
}

/// Overlapped COMM emulation section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EmulationConfig {
    /// Driver receive queue size requested at open
    pub rx_buffer_size: u32,
    /// Driver transmit queue size requested at open
    pub tx_buffer_size: u32,
    /// Free-space threshold for sending XON
    pub xon_limit: u16,
    /// Fill threshold for sending XOFF
    pub xoff_limit: u16,
    /// UART base clock used for custom divisors
    pub baud_base: u32,
    /// Log a warning when close waits this long for cancellation
    pub close_warn_ms: u64,
}

impl Default for EmulationConfig {
    fn default() -> Self {
        Self {
            rx_buffer_size: 2048,
            tx_buffer_size: 2048,
            xon_limit: 128,
            xoff_limit: 128,
            baud_base: 115_200,
            close_warn_ms: 1000,
        }
    }
}

impl EmulationConfig {
    /// Close wait warning interval as Duration
    pub fn close_warn(&self) -> Duration {
        Duration::from_millis(self.close_warn_ms)
    }
}

/// Hardware testing configuration section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TestingConfig {
    /// Port under test
    pub port: Option<String>,
    /// Second port wired to `port` (null-modem), if any
    pub peer_port: Option<String>,
    /// Test baud rate
    pub baud: u32,
    /// Whether TX is looped back to RX on the test port
    pub loopback_enabled: bool,
    /// Test timeout in milliseconds
    pub timeout_ms: u64,
}

impl Default for TestingConfig {
    fn default() -> Self {
        Self {
            port: None,
            peer_port: None,
            baud: 9600,
            loopback_enabled: false,
            timeout_ms: 2000,
        }
    }
}

impl TestingConfig {
    /// Get the test timeout as Duration
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Logging configuration section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Filter directive used when RUST_LOG is unset, e.g. "info" or "serial_termios=debug"
    pub level: String,
    /// Log format: "json", "pretty", "compact"
    pub format: LogFormat,
    /// Append to this file instead of stderr
    pub file: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Pretty,
            file: None,
        }
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// JSON format
    Json,
    /// Pretty format with colors
    #[default]
    Pretty,
    /// Compact format
    Compact,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.backend.kind, BackendKind::Auto);
        assert_eq!(config.registry.max_ports, 256);
        assert_eq!(config.emulation.rx_buffer_size, 2048);
        assert_eq!(config.emulation.xon_limit, 128);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_serialization() {
        let config = Config::default();
        let toml_str = toml::to_string_pretty(&config).unwrap();
        assert!(toml_str.contains("[backend]"));
        assert!(toml_str.contains("[emulation]"));
        let back: Config = toml::from_str(&toml_str).unwrap();
        assert_eq!(back, config);
    }

    #[test]
    fn test_config_deserialization() {
        let toml_str = r#"
            [backend]
            kind = "emulated"

            [emulation]
            baud_base = 1843200
        "#;

        let config: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(config.backend.kind, BackendKind::Emulated);
        assert_eq!(config.emulation.baud_base, 1_843_200);
        // Defaults should still work
        assert_eq!(config.emulation.tx_buffer_size, 2048);
        assert_eq!(config.logging.format, LogFormat::Pretty);
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        let mut config = Config::default();
        config.registry.max_ports = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.registry.max_ports = FD_SETSIZE + 1;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.emulation.xoff_limit = 0;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("xoff_limit"));

        let mut config = Config::default();
        config.emulation.baud_base = 0;
        assert!(config.validate().is_err());
    }
}
