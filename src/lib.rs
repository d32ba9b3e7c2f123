//! Serial Termios Library
//!
//! A POSIX termios-shaped serial port API. Programs written against
//! `open`/`tcsetattr`/`read`/`select` keep working on hosts whose native
//! serial interface is handle-based overlapped I/O with no readiness
//! multiplexing.
//!
//! # Modules
//!
//! - `api`: `-1`/errno facade over a backend
//! - `backend`: the `Backend` trait, the POSIX pass-through and the emulated backend
//! - `termios`: termios model, baud resolution and VMIN/VTIME policy
//! - `registry`: descriptor slot allocation
//! - `fdset`: `fd_set`, `pollfd` and `timeval` equivalents
//! - `config`: Configuration management with TOML support
//! - `error`: Unified error handling
//! - `logging`: tracing subscriber setup

pub mod api;
pub mod backend;
pub mod config;
pub mod error;
pub mod fdset;
pub mod logging;
pub mod registry;
pub mod termios;

/// A small non-negative integer naming an open port.
pub type Fd = i32;

// Re-export commonly used types for convenience
pub use api::PortApi;
pub use backend::{
    probe, Backend, FcntlCommand, FlushQueue, IoctlCommand, ModemLines, OpenFlags, SetAttrWhen,
};
pub use error::{Result, TermiosError};
pub use fdset::{FdSet, PollEvents, PollFd, TimeVal, FD_SETSIZE};
pub use registry::PortRegistry;
pub use termios::{
    cfgetispeed, cfgetospeed, cfmakeraw, cfsetispeed, cfsetospeed, cfsetspeed, BaudError,
    CharSize, ControlFlags, InputFlags, LocalFlags, OutputFlags, ReadMode, Termios,
};

// Re-export config types
pub use config::{Config, ConfigError, ConfigLoader, ConfigResult};
