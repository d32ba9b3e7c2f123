//! Platform backends behind one descriptor-oriented interface.
//!
//! A [`Backend`] is chosen once with [`probe`] and then passed around
//! explicitly; there is no process-wide instance.
//!
//! ```text
//!                      ┌─> PosixBackend ───────> termios / ioctl / select / poll
//! PortApi ─> Backend ──┤
//!                      └─> EmulatedBackend ────> PortRegistry ─> Port
//!                                 │                               │
//!                                 └─> multiplex (select/poll) ──> CommDevice (overlapped I/O)
//! ```

pub mod emulated;
#[cfg(unix)]
pub mod posix;

use crate::config::{BackendKind, Config};
use crate::error::{Result, TermiosError};
use crate::fdset::{FdSet, PollFd, TimeVal};
use crate::termios::Termios;
use crate::Fd;
use bitflags::bitflags;
use std::fmt::Debug;
use tracing::debug;

bitflags! {
    /// `open()` and `fcntl(F_GETFL/F_SETFL)` flags.
    ///
    /// Read-only access is the absence of `O_WRONLY` and `O_RDWR`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct OpenFlags: i32 {
        /// Write-only access.
        const O_WRONLY = 0x0001;
        /// Read-write access.
        const O_RDWR = 0x0002;
        /// Do not become the controlling terminal.
        const O_NOCTTY = 0x0100;
        /// Non-blocking reads and writes.
        const O_NONBLOCK = 0x0800;
    }
}

impl OpenFlags {
    /// Read-only access.
    pub const O_RDONLY: Self = Self::empty();

    /// Flags `F_SETFL` may change; access mode and O_NOCTTY are fixed at open.
    pub const STATUS: Self = Self::O_NONBLOCK;

    /// True when the descriptor was opened in non-blocking mode.
    pub fn is_nonblocking(self) -> bool {
        self.contains(Self::O_NONBLOCK)
    }

    /// Reject `O_WRONLY | O_RDWR`.
    pub fn validate(self) -> Result<Self> {
        if self.contains(Self::O_WRONLY | Self::O_RDWR) {
            return Err(TermiosError::invalid("O_WRONLY and O_RDWR are exclusive"));
        }
        Ok(self)
    }
}

bitflags! {
    /// Modem line bits for TIOCMGET / TIOCMSET.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct ModemLines: i32 {
        /// Data terminal ready (output).
        const DTR = 0x002;
        /// Request to send (output).
        const RTS = 0x004;
        /// Clear to send (input).
        const CTS = 0x020;
        /// Carrier detect (input).
        const CAR = 0x040;
        /// Ring indicator (input).
        const RNG = 0x080;
        /// Data set ready (input).
        const DSR = 0x100;
    }
}

impl ModemLines {
    /// Lines the host drives.
    pub const OUTPUTS: Self = Self::DTR.union(Self::RTS);
}

/// When `tcsetattr` takes effect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetAttrWhen {
    /// TCSANOW: immediately.
    Now,
    /// TCSADRAIN: after queued output is transmitted.
    Drain,
    /// TCSAFLUSH: after output drains; pending input is discarded.
    Flush,
}

/// Which queue `tcflush` discards.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushQueue {
    /// TCIFLUSH: received but unread data.
    Input,
    /// TCOFLUSH: written but untransmitted data.
    Output,
    /// TCIOFLUSH: both.
    Both,
}

/// Supported `ioctl` requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoctlCommand {
    /// FIONREAD: bytes waiting in the input queue.
    Fionread,
    /// TIOCOUTQ: bytes waiting in the output queue.
    Tiocoutq,
    /// TIOCMGET: current modem lines.
    Tiocmget,
    /// TIOCMSET: drive DTR/RTS to exactly these values.
    Tiocmset(ModemLines),
    /// TIOCMBIS: assert the given output lines.
    Tiocmbis(ModemLines),
    /// TIOCMBIC: clear the given output lines.
    Tiocmbic(ModemLines),
}

/// Supported `fcntl` requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FcntlCommand {
    /// F_GETFL: report the open flags.
    GetFl,
    /// F_SETFL: replace the status flags.
    SetFl(OpenFlags),
}

/// The descriptor API every platform implements.
///
/// Methods mirror their POSIX namesakes; failures are typed instead of
/// `-1`/errno. See [`crate::api::PortApi`] for the C-convention surface.
pub trait Backend: Send + Sync + Debug {
    /// Short backend name for diagnostics.
    fn name(&self) -> &'static str;

    /// Open a serial device and return its descriptor.
    fn open(&self, path: &str, flags: OpenFlags) -> Result<Fd>;

    /// Close a descriptor, cancelling any operation still in progress on it.
    fn close(&self, fd: Fd) -> Result<()>;

    /// Read per the descriptor's VMIN/VTIME and O_NONBLOCK settings.
    fn read(&self, fd: Fd, buf: &mut [u8]) -> Result<usize>;

    /// Write bytes, returning how many were accepted.
    fn write(&self, fd: Fd, buf: &[u8]) -> Result<usize>;

    /// Current configuration.
    fn tcgetattr(&self, fd: Fd) -> Result<Termios>;

    /// Apply a configuration. On failure the previous one stays in force.
    fn tcsetattr(&self, fd: Fd, when: SetAttrWhen, termios: &Termios) -> Result<()>;

    /// Discard queued data.
    fn tcflush(&self, fd: Fd, queue: FlushQueue) -> Result<()>;

    /// Wait until queued output has been transmitted.
    fn tcdrain(&self, fd: Fd) -> Result<()>;

    /// Transmit a break; `duration` 0 means 250 ms, otherwise `duration × 250 ms`.
    fn tcsendbreak(&self, fd: Fd, duration: i32) -> Result<()>;

    /// Device control request; the return value is command-defined.
    fn ioctl(&self, fd: Fd, command: IoctlCommand) -> Result<i32>;

    /// Descriptor flag request.
    fn fcntl(&self, fd: Fd, command: FcntlCommand) -> Result<i32>;

    /// Wait until a descriptor in the sets is ready. Sets are rewritten to
    /// the ready subset; `timeout` is never modified.
    fn select(
        &self,
        nfds: usize,
        read: Option<&mut FdSet>,
        write: Option<&mut FdSet>,
        except: Option<&mut FdSet>,
        timeout: Option<&TimeVal>,
    ) -> Result<usize>;

    /// Wait until an entry is ready; negative `timeout_ms` waits forever.
    fn poll(&self, fds: &mut [PollFd], timeout_ms: i32) -> Result<usize>;

    /// Descriptors opened through this backend and not yet closed.
    fn open_descriptors(&self) -> Vec<Fd>;

    /// Close every open descriptor.
    fn shutdown(&self) {
        for fd in self.open_descriptors() {
            if let Err(e) = self.close(fd) {
                debug!("shutdown: closing {} failed: {}", fd, e);
            }
        }
    }
}

/// Break length unit for `tcsendbreak`.
pub(crate) const BREAK_UNIT_MS: u64 = 250;

/// Duration a break is held for the given `tcsendbreak` argument.
pub(crate) fn break_duration(duration: i32) -> std::time::Duration {
    let units = u64::try_from(duration).unwrap_or(0).max(1);
    std::time::Duration::from_millis(units * BREAK_UNIT_MS)
}

/// Construct the backend selected by configuration and host capability.
pub fn probe(config: &Config) -> Result<Box<dyn Backend>> {
    config
        .validate()
        .map_err(|e| TermiosError::invalid(e.to_string()))?;

    let backend = match config.backend.kind {
        BackendKind::Posix => posix_backend(config)?,
        BackendKind::Emulated => emulated_backend(config)?,
        BackendKind::Auto if cfg!(windows) => emulated_backend(config)?,
        BackendKind::Auto => posix_backend(config)?,
    };
    debug!("Selected {} backend", backend.name());
    Ok(backend)
}

#[cfg(unix)]
fn posix_backend(_config: &Config) -> Result<Box<dyn Backend>> {
    Ok(Box::new(posix::PosixBackend::new()))
}

#[cfg(not(unix))]
fn posix_backend(_config: &Config) -> Result<Box<dyn Backend>> {
    Err(TermiosError::unsupported("POSIX backend requires a Unix host"))
}

#[cfg(windows)]
fn emulated_backend(config: &Config) -> Result<Box<dyn Backend>> {
    Ok(Box::new(emulated::EmulatedBackend::new(
        emulated::Win32Driver::new(),
        config,
    )))
}

#[cfg(not(windows))]
fn emulated_backend(_config: &Config) -> Result<Box<dyn Backend>> {
    Err(TermiosError::unsupported(
        "no native COMM driver on this host; build EmulatedBackend with SimulatedDriver",
    ))
}
