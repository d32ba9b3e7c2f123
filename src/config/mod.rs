//! Configuration module for serial_termios.
//!
//! This module provides TOML-based configuration with environment variable overrides.
//!
//! # Configuration Resolution
//!
//! Configuration is loaded from the following locations (in order of priority):
//!
//! 1. `SERIAL_TERMIOS_CONFIG` environment variable (explicit path)
//! 2. `./serial-termios.toml` (current directory)
//! 3. `~/.config/serial-termios/config.toml` (XDG on Linux)
//! 4. `%APPDATA%\serial-termios\config\config.toml` (Windows)
//! 5. Built-in defaults (no file required)
//!
//! # Environment Overrides
//!
//! The pattern is `SERIAL_TERMIOS_<SECTION>_<KEY>`:
//! - `SERIAL_TERMIOS_BACKEND_KIND=emulated`
//! - `SERIAL_TERMIOS_EMULATION_BAUD_BASE=1843200`
//! - `SERIAL_TERMIOS_LOGGING_LEVEL=serial_termios=debug`
//!
//! Legacy test variables `TEST_PORT`, `TEST_PEER_PORT`, `TEST_BAUD` and
//! `TEST_LOOPBACK` are also honored.
//!
//! # Example
//!
//! ```rust,no_run
//! use serial_termios::config::ConfigLoader;
//!
//! let loader = ConfigLoader::load()?;
//! println!("descriptor slots: {}", loader.config().registry.max_ports);
//! # Ok::<(), serial_termios::config::ConfigError>(())
//! ```

mod error;
mod loader;
mod schema;

pub use error::{ConfigError, ConfigResult};
pub use loader::{
    get_default_config_dir, get_default_config_path, resolve_config_path, ConfigLoader,
};
pub use schema::{
    BackendConfig, BackendKind, Config, EmulationConfig, LogFormat, LoggingConfig,
    RegistryConfig, TestingConfig,
};
