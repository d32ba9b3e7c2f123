//! POSIX-convention facade.
//!
//! [`PortApi`] wraps a [`Backend`] and flattens every typed result into the
//! C convention: a non-negative value on success, `-1` on failure with the
//! cause stored in a per-thread errno slot read back through [`errno`].
//!
//! ```rust,no_run
//! use serial_termios::api::{self, PortApi};
//! use serial_termios::{Config, OpenFlags, SetAttrWhen, Termios};
//!
//! let ports = PortApi::new(&Config::default())?;
//! let fd = ports.open("ttyUSB0", OpenFlags::O_RDWR | OpenFlags::O_NOCTTY);
//! if fd < 0 {
//!     api::perror("open");
//!     return Ok(());
//! }
//! let mut termios = Termios::default();
//! ports.tcgetattr(fd, &mut termios);
//! api::cfmakeraw(&mut termios);
//! api::cfsetspeed(&mut termios, 115200);
//! ports.tcsetattr(fd, SetAttrWhen::Now, &termios);
//! ports.close(fd);
//! # Ok::<(), serial_termios::TermiosError>(())
//! ```

use crate::backend::{
    self, Backend, FcntlCommand, FlushQueue, IoctlCommand, OpenFlags, SetAttrWhen,
};
use crate::config::Config;
use crate::error::{Result, TermiosError};
use crate::fdset::{FdSet, PollFd, TimeVal};
use crate::termios::{self, Termios};
use crate::Fd;
use std::cell::{Cell, RefCell};
use tracing::{debug, trace};

thread_local! {
    static ERRNO: Cell<i32> = const { Cell::new(0) };
    static LAST_ERROR: RefCell<Option<String>> = const { RefCell::new(None) };
}

/// The errno left by the last failing call on this thread.
///
/// Like the C variable it is only written on failure; a successful call
/// leaves the previous value in place.
pub fn errno() -> i32 {
    ERRNO.with(Cell::get)
}

/// Overwrite this thread's errno, typically to 0 before a call.
pub fn set_errno(value: i32) {
    ERRNO.with(|slot| slot.set(value));
}

/// Description of the last failure on this thread, if any.
pub fn last_error() -> Option<String> {
    LAST_ERROR.with(|slot| slot.borrow().clone())
}

/// The line `perror(msg)` prints.
pub fn perror_message(msg: &str) -> String {
    let detail = last_error().unwrap_or_else(|| "Success".to_string());
    if msg.is_empty() {
        detail
    } else {
        format!("{}: {}", msg, detail)
    }
}

/// Print `msg: <last error>` to stderr.
pub fn perror(msg: &str) {
    eprintln!("{}", perror_message(msg));
}

fn record(call: &'static str, err: &TermiosError) {
    let code = err.errno();
    match err {
        TermiosError::WouldBlock => trace!("{} would block", call),
        _ => debug!("{} failed (errno {}): {}", call, code, err),
    }
    ERRNO.with(|slot| slot.set(code));
    LAST_ERROR.with(|slot| *slot.borrow_mut() = Some(err.to_string()));
}

fn status(call: &'static str, result: Result<()>) -> i32 {
    match result {
        Ok(()) => 0,
        Err(e) => {
            record(call, &e);
            -1
        }
    }
}

fn count(call: &'static str, result: Result<usize>) -> isize {
    match result {
        Ok(n) => isize::try_from(n).unwrap_or(isize::MAX),
        Err(e) => {
            record(call, &e);
            -1
        }
    }
}

fn value(call: &'static str, result: Result<i32>) -> i32 {
    result.unwrap_or_else(|e| {
        record(call, &e);
        -1
    })
}

fn ready(call: &'static str, result: Result<usize>) -> i32 {
    match result {
        Ok(n) => i32::try_from(n).unwrap_or(i32::MAX),
        Err(e) => {
            record(call, &e);
            -1
        }
    }
}

/// Descriptor calls in the C convention over an injected [`Backend`].
#[derive(Debug)]
pub struct PortApi {
    backend: Box<dyn Backend>,
}

impl PortApi {
    /// Probe for the backend `config` selects.
    pub fn new(config: &Config) -> Result<Self> {
        Ok(Self::with_backend(backend::probe(config)?))
    }

    /// Use an already constructed backend.
    pub fn with_backend(backend: Box<dyn Backend>) -> Self {
        Self { backend }
    }

    /// The typed interface underneath.
    pub fn backend(&self) -> &dyn Backend {
        self.backend.as_ref()
    }

    pub fn open(&self, path: &str, flags: OpenFlags) -> Fd {
        self.backend.open(path, flags).unwrap_or_else(|e| {
            record("open", &e);
            -1
        })
    }

    pub fn close(&self, fd: Fd) -> i32 {
        status("close", self.backend.close(fd))
    }

    pub fn read(&self, fd: Fd, buf: &mut [u8]) -> isize {
        count("read", self.backend.read(fd, buf))
    }

    pub fn write(&self, fd: Fd, buf: &[u8]) -> isize {
        count("write", self.backend.write(fd, buf))
    }

    /// Fill `termios` with the descriptor's configuration. On failure
    /// `termios` is left untouched.
    pub fn tcgetattr(&self, fd: Fd, termios: &mut Termios) -> i32 {
        status(
            "tcgetattr",
            self.backend.tcgetattr(fd).map(|current| *termios = current),
        )
    }

    pub fn tcsetattr(&self, fd: Fd, when: SetAttrWhen, termios: &Termios) -> i32 {
        status("tcsetattr", self.backend.tcsetattr(fd, when, termios))
    }

    pub fn tcflush(&self, fd: Fd, queue: FlushQueue) -> i32 {
        status("tcflush", self.backend.tcflush(fd, queue))
    }

    pub fn tcdrain(&self, fd: Fd) -> i32 {
        status("tcdrain", self.backend.tcdrain(fd))
    }

    pub fn tcsendbreak(&self, fd: Fd, duration: i32) -> i32 {
        status("tcsendbreak", self.backend.tcsendbreak(fd, duration))
    }

    pub fn ioctl(&self, fd: Fd, command: IoctlCommand) -> i32 {
        value("ioctl", self.backend.ioctl(fd, command))
    }

    pub fn fcntl(&self, fd: Fd, command: FcntlCommand) -> i32 {
        value("fcntl", self.backend.fcntl(fd, command))
    }

    /// `select(2)`. The sets are rewritten to the ready subset and
    /// `timeout` is never modified.
    pub fn select(
        &self,
        nfds: usize,
        read: Option<&mut FdSet>,
        write: Option<&mut FdSet>,
        except: Option<&mut FdSet>,
        timeout: Option<&TimeVal>,
    ) -> i32 {
        ready(
            "select",
            self.backend.select(nfds, read, write, except, timeout),
        )
    }

    pub fn poll(&self, fds: &mut [PollFd], timeout_ms: i32) -> i32 {
        ready("poll", self.backend.poll(fds, timeout_ms))
    }

    /// Close everything still open.
    pub fn shutdown(&self) {
        self.backend.shutdown();
    }
}

/// Switch `termios` to raw mode.
pub fn cfmakeraw(termios: &mut Termios) {
    termios::cfmakeraw(termios);
}

pub fn cfgetispeed(termios: &Termios) -> u32 {
    termios::cfgetispeed(termios)
}

pub fn cfgetospeed(termios: &Termios) -> u32 {
    termios::cfgetospeed(termios)
}

// Speeds are plain rates here, so there is nothing to reject until the
// configuration reaches a device in `tcsetattr`.

pub fn cfsetispeed(termios: &mut Termios, speed: u32) -> i32 {
    termios::cfsetispeed(termios, speed);
    0
}

pub fn cfsetospeed(termios: &mut Termios, speed: u32) -> i32 {
    termios::cfsetospeed(termios, speed);
    0
}

pub fn cfsetspeed(termios: &mut Termios, speed: u32) -> i32 {
    termios::cfsetspeed(termios, speed);
    0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::emulated::{EmulatedBackend, SimulatedDriver, SimulatedLine};
    use crate::error::errno as codes;

    fn api() -> (PortApi, SimulatedLine) {
        let driver = SimulatedDriver::new();
        let line = driver.add_line("COM1");
        let backend = EmulatedBackend::new(driver, &Config::default());
        (PortApi::with_backend(Box::new(backend)), line)
    }

    #[test]
    fn test_failure_sets_errno() {
        let (ports, _line) = api();
        set_errno(0);
        assert_eq!(ports.close(42), -1);
        assert_eq!(errno(), codes::EBADF);
        assert!(perror_message("close").starts_with("close: Bad file descriptor"));
    }

    #[test]
    fn test_success_keeps_errno() {
        let (ports, _line) = api();
        assert_eq!(ports.read(9, &mut [0u8; 4]), -1);
        let fd = ports.open("COM1", OpenFlags::O_RDWR);
        assert!(fd >= 0);
        assert_eq!(errno(), codes::EBADF);
        assert_eq!(ports.close(fd), 0);
    }

    #[test]
    fn test_nonblocking_read_reports_eagain() {
        let (ports, _line) = api();
        let fd = ports.open("COM1", OpenFlags::O_RDWR | OpenFlags::O_NONBLOCK);
        assert_eq!(ports.read(fd, &mut [0u8; 8]), -1);
        assert_eq!(errno(), codes::EAGAIN);
        ports.close(fd);
    }

    #[test]
    fn test_errno_is_per_thread() {
        let (ports, _line) = api();
        assert_eq!(ports.close(77), -1);
        let other = std::thread::spawn(errno).join().unwrap();
        assert_eq!(other, 0);
        assert_eq!(errno(), codes::EBADF);
    }

    #[test]
    fn test_tcgetattr_failure_leaves_output() {
        let (ports, _line) = api();
        let mut termios = Termios::raw_at(4800);
        let before = termios;
        assert_eq!(ports.tcgetattr(3, &mut termios), -1);
        assert_eq!(termios, before);
    }

    #[test]
    fn test_speed_helpers() {
        let mut termios = Termios::default();
        assert_eq!(cfsetspeed(&mut termios, 57600), 0);
        assert_eq!(cfgetispeed(&termios), 57600);
        assert_eq!(cfsetospeed(&mut termios, 9600), 0);
        assert_eq!(cfgetospeed(&termios), 9600);
        assert_eq!(cfsetispeed(&mut termios, 0), 0);
        assert_eq!(cfgetispeed(&termios), 0);
    }
}
