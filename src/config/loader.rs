//! Configuration loader with file resolution and environment override support.

use super::error::{ConfigError, ConfigResult};
use super::schema::{BackendKind, Config, LogFormat};
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Environment variable prefix for overrides
const ENV_PREFIX: &str = "SERIAL_TERMIOS";

/// Config file name inside the per-user config directory
const CONFIG_FILE_NAME: &str = "config.toml";

/// Config file name looked up in the current directory
const LOCAL_CONFIG_FILE_NAME: &str = "serial-termios.toml";

/// Environment variable for explicit config path
const CONFIG_PATH_ENV: &str = "SERIAL_TERMIOS_CONFIG";

/// Application directory name under the platform config root
const APP_DIR: &str = "serial-termios";

/// Configuration loader with resolution and override logic.
#[derive(Debug, Clone)]
pub struct ConfigLoader {
    /// Resolved config file path (if any)
    pub config_path: Option<PathBuf>,
    /// The loaded configuration
    pub config: Config,
}

impl ConfigLoader {
    /// Load configuration using standard resolution order.
    ///
    /// Resolution priority (highest to lowest):
    /// 1. `SERIAL_TERMIOS_CONFIG` environment variable (explicit path)
    /// 2. `./serial-termios.toml` (current directory)
    /// 3. `<platform config dir>/serial-termios/config.toml`
    /// 4. Built-in defaults (no file required)
    ///
    /// Environment variables override file values; the result is validated.
    pub fn load() -> ConfigResult<Self> {
        let config_path = resolve_config_path();

        let mut config = if let Some(ref path) = config_path {
            load_from_file(path)?
        } else {
            Config::default()
        };

        apply_env_overrides(&mut config)?;
        config.validate()?;

        Ok(Self { config_path, config })
    }

    /// Load configuration from a specific file path.
    pub fn load_from(path: impl AsRef<Path>) -> ConfigResult<Self> {
        let path = path.as_ref().to_path_buf();
        let mut config = load_from_file(&path)?;
        apply_env_overrides(&mut config)?;
        config.validate()?;

        Ok(Self {
            config_path: Some(path),
            config,
        })
    }

    /// Create a loader with default configuration (no file).
    ///
    /// Malformed environment overrides are ignored here; use [`load`](Self::load)
    /// to have them reported.
    pub fn with_defaults() -> Self {
        let mut config = Config::default();
        if apply_env_overrides(&mut config).and_then(|_| config.validate()).is_err() {
            config = Config::default();
        }

        Self {
            config_path: None,
            config,
        }
    }

    /// Get the loaded configuration.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Get a mutable reference to the configuration.
    pub fn config_mut(&mut self) -> &mut Config {
        &mut self.config
    }

    /// Consume the loader and return the configuration.
    pub fn into_config(self) -> Config {
        self.config
    }

    /// Save the current configuration to file.
    pub fn save(&self) -> ConfigResult<()> {
        let path = self
            .config_path
            .as_ref()
            .ok_or_else(|| ConfigError::MissingRequired("No config file path set".to_string()))?;

        save_to_file(&self.config, path)
    }

    /// Save the current configuration to a specific file.
    pub fn save_to(&self, path: impl AsRef<Path>) -> ConfigResult<()> {
        save_to_file(&self.config, path.as_ref())
    }

    /// Reload configuration from file (if path is set).
    pub fn reload(&mut self) -> ConfigResult<()> {
        if let Some(ref path) = self.config_path {
            let mut config = load_from_file(path)?;
            apply_env_overrides(&mut config)?;
            config.validate()?;
            self.config = config;
        }
        Ok(())
    }
}

/// Resolve the configuration file path using standard locations.
pub fn resolve_config_path() -> Option<PathBuf> {
    if let Ok(path) = std::env::var(CONFIG_PATH_ENV) {
        let path = PathBuf::from(path);
        if path.exists() {
            return Some(path);
        }
    }

    let cwd_config = PathBuf::from(LOCAL_CONFIG_FILE_NAME);
    if cwd_config.exists() {
        return Some(cwd_config);
    }

    get_default_config_path().filter(|p| p.exists())
}

/// Get the default config directory for creating new config files.
pub fn get_default_config_dir() -> Option<PathBuf> {
    directories::ProjectDirs::from("", "", APP_DIR).map(|dirs| dirs.config_dir().to_path_buf())
}

/// Get the default config file path for creating new config files.
pub fn get_default_config_path() -> Option<PathBuf> {
    get_default_config_dir().map(|d| d.join(CONFIG_FILE_NAME))
}

/// Load configuration from a file.
fn load_from_file(path: &Path) -> ConfigResult<Config> {
    let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadError {
        path: path.to_path_buf(),
        source: e,
    })?;

    toml::from_str(&content).map_err(ConfigError::ParseError)
}

/// Save configuration to a file.
fn save_to_file(config: &Config, path: &Path) -> ConfigResult<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).map_err(|e| ConfigError::WriteError {
            path: path.to_path_buf(),
            source: e,
        })?;
    }

    let content = toml::to_string_pretty(config)?;
    std::fs::write(path, content).map_err(|e| ConfigError::WriteError {
        path: path.to_path_buf(),
        source: e,
    })
}

fn env_key(section_key: &str) -> String {
    format!("{}_{}", ENV_PREFIX, section_key)
}

/// Parse `SERIAL_TERMIOS_<key>` into `T` if it is set.
fn env_parse<T: FromStr>(section_key: &str, what: &str) -> ConfigResult<Option<T>> {
    let var = env_key(section_key);
    match std::env::var(&var) {
        Ok(val) => val
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::env_parse(var, format!("Invalid {}", what))),
        Err(_) => Ok(None),
    }
}

/// Apply environment variable overrides to the configuration.
///
/// Environment variables follow the pattern `SERIAL_TERMIOS_<SECTION>_<KEY>`,
/// for example `SERIAL_TERMIOS_EMULATION_BAUD_BASE=1843200`.
fn apply_env_overrides(config: &mut Config) -> ConfigResult<()> {
    if let Ok(val) = std::env::var(env_key("BACKEND_KIND")) {
        config.backend.kind = match val.to_lowercase().as_str() {
            "auto" => BackendKind::Auto,
            "posix" => BackendKind::Posix,
            "emulated" => BackendKind::Emulated,
            _ => {
                return Err(ConfigError::env_parse(
                    env_key("BACKEND_KIND"),
                    "Expected auto, posix or emulated",
                ))
            }
        };
    }

    if let Some(v) = env_parse("REGISTRY_MAX_PORTS", "slot count")? {
        config.registry.max_ports = v;
    }

    if let Some(v) = env_parse("EMULATION_RX_BUFFER_SIZE", "buffer size")? {
        config.emulation.rx_buffer_size = v;
    }
    if let Some(v) = env_parse("EMULATION_TX_BUFFER_SIZE", "buffer size")? {
        config.emulation.tx_buffer_size = v;
    }
    if let Some(v) = env_parse("EMULATION_XON_LIMIT", "limit")? {
        config.emulation.xon_limit = v;
    }
    if let Some(v) = env_parse("EMULATION_XOFF_LIMIT", "limit")? {
        config.emulation.xoff_limit = v;
    }
    if let Some(v) = env_parse("EMULATION_BAUD_BASE", "base clock")? {
        config.emulation.baud_base = v;
    }

    if let Ok(val) = std::env::var(env_key("LOGGING_LEVEL")) {
        config.logging.level = val;
    }
    if let Ok(val) = std::env::var(env_key("LOGGING_FORMAT")) {
        config.logging.format = match val.to_lowercase().as_str() {
            "json" => LogFormat::Json,
            "pretty" => LogFormat::Pretty,
            "compact" => LogFormat::Compact,
            _ => {
                return Err(ConfigError::env_parse(
                    env_key("LOGGING_FORMAT"),
                    "Expected json, pretty or compact",
                ))
            }
        };
    }

    // Testing overrides (also support legacy TEST_PORT etc.)
    if let Ok(val) = std::env::var(env_key("TESTING_PORT")).or_else(|_| std::env::var("TEST_PORT")) {
        config.testing.port = Some(val);
    }
    if let Ok(val) =
        std::env::var(env_key("TESTING_PEER_PORT")).or_else(|_| std::env::var("TEST_PEER_PORT"))
    {
        config.testing.peer_port = Some(val);
    }
    if let Ok(val) = std::env::var(env_key("TESTING_BAUD")).or_else(|_| std::env::var("TEST_BAUD")) {
        config.testing.baud = val.parse().map_err(|_| {
            ConfigError::env_parse(
                format!("{} or TEST_BAUD", env_key("TESTING_BAUD")),
                "Invalid baud rate",
            )
        })?;
    }
    if let Ok(val) = std::env::var("TEST_LOOPBACK") {
        config.testing.loopback_enabled = val.to_lowercase() == "true" || val == "1";
    }

    Ok(())
}
