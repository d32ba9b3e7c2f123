//! Unified error handling for descriptor operations.
//!
//! Every backend call returns [`Result<T>`]. The POSIX-convention facade in
//! [`crate::api`] flattens these into `-1` plus an errno via
//! [`TermiosError::errno`].

use crate::termios::BaudError;
use crate::Fd;
use std::io;
use thiserror::Error;

/// Errno values reported by the POSIX-convention facade.
///
/// On Unix these are the host's own constants; elsewhere the Linux numbering
/// is used so callers see stable values.
pub mod errno {
    #[cfg(unix)]
    mod values {
        pub const EINTR: i32 = libc::EINTR;
        pub const EIO: i32 = libc::EIO;
        pub const EBADF: i32 = libc::EBADF;
        pub const EAGAIN: i32 = libc::EAGAIN;
        pub const EINVAL: i32 = libc::EINVAL;
        pub const EMFILE: i32 = libc::EMFILE;
        pub const ENOTSUP: i32 = libc::ENOTSUP;
    }

    #[cfg(not(unix))]
    mod values {
        pub const EINTR: i32 = 4;
        pub const EIO: i32 = 5;
        pub const EBADF: i32 = 9;
        pub const EAGAIN: i32 = 11;
        pub const EINVAL: i32 = 22;
        pub const EMFILE: i32 = 24;
        pub const ENOTSUP: i32 = 95;
    }

    pub use values::*;
}

/// Errors that can occur during serial descriptor operations.
#[derive(Debug, Error)]
pub enum TermiosError {
    /// The descriptor is not open (never opened, or already closed).
    #[error("Bad file descriptor: {0}")]
    InvalidDescriptor(Fd),

    /// A non-blocking operation had nothing to transfer.
    #[error("Operation would block")]
    WouldBlock,

    /// An in-flight operation was aborted, typically by `close()`.
    #[error("Operation interrupted: {0}")]
    Interrupted(&'static str),

    /// The request is valid POSIX but this backend cannot honor it.
    #[error("Operation not supported: {0}")]
    Unsupported(String),

    /// Malformed request (bad flag combination, out-of-range value).
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Every descriptor slot is in use.
    #[error("Too many open ports (limit {0})")]
    Exhausted(usize),

    /// The requested line speed cannot be programmed.
    #[error("Baud rate error: {0}")]
    Baud(#[from] BaudError),

    /// The native serial subsystem reported a failure.
    #[error("Native failure: {0}")]
    Native(#[from] io::Error),
}

impl TermiosError {
    /// Create an Unsupported error from a message.
    pub fn unsupported(message: impl Into<String>) -> Self {
        Self::Unsupported(message.into())
    }

    /// Create an InvalidArgument error from a message.
    pub fn invalid(message: impl Into<String>) -> Self {
        Self::InvalidArgument(message.into())
    }

    /// Wrap a native error, recognizing the conditions that have their own variant.
    pub fn from_native(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::WouldBlock => Self::WouldBlock,
            io::ErrorKind::Interrupted => Self::Interrupted("native operation aborted"),
            _ => Self::Native(err),
        }
    }

    /// The errno a POSIX caller would observe for this error.
    pub fn errno(&self) -> i32 {
        match self {
            Self::InvalidDescriptor(_) => errno::EBADF,
            Self::WouldBlock => errno::EAGAIN,
            Self::Interrupted(_) => errno::EINTR,
            Self::Unsupported(_) => errno::ENOTSUP,
            Self::InvalidArgument(_) | Self::Baud(_) => errno::EINVAL,
            Self::Exhausted(_) => errno::EMFILE,
            Self::Native(e) => native_errno(e),
        }
    }

    /// The raw OS code carried by a native failure, if any.
    pub fn native_code(&self) -> Option<i32> {
        match self {
            Self::Native(e) => e.raw_os_error(),
            _ => None,
        }
    }
}

// Windows error codes are not errno values; only Unix passes them through.
#[cfg(unix)]
fn native_errno(err: &io::Error) -> i32 {
    err.raw_os_error().unwrap_or(errno::EIO)
}

#[cfg(not(unix))]
fn native_errno(_err: &io::Error) -> i32 {
    errno::EIO
}

/// Result type for descriptor operations.
pub type Result<T> = std::result::Result<T, TermiosError>;
