//! Backend for hosts with a native termios layer.
//!
//! Calls go straight to the kernel; this layer only tracks which
//! descriptors it opened, translates flag layouts and speed constants, and
//! programs Linux custom divisors for rates the kernel has no `B*` constant
//! for.
//!
//! `close` does not interrupt a `read` blocked in the kernel on the same
//! descriptor; the read ends when its VMIN/VTIME condition is met.

mod flags;
mod speed;

use super::{
    break_duration, Backend, FcntlCommand, FlushQueue, IoctlCommand, ModemLines, OpenFlags,
    SetAttrWhen,
};
use crate::error::{Result, TermiosError};
use crate::fdset::{FdSet, PollEvents, PollFd, TimeVal, FD_SETSIZE};
use crate::termios::{lookup_rate, BaudSetting, CustomDivisor, Termios};
use crate::Fd;
use libc::c_int;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::ffi::CString;
use std::io;
use std::mem;
use std::ptr;
use std::thread;
use tracing::{debug, info};

/// Map a negative return to the thread's OS error.
fn cvt(ret: c_int) -> Result<c_int> {
    if ret < 0 {
        Err(TermiosError::from_native(io::Error::last_os_error()))
    } else {
        Ok(ret)
    }
}

fn device_path(path: &str) -> String {
    if path.starts_with('/') {
        path.to_string()
    } else {
        format!("/dev/{}", path)
    }
}

fn host_open_flags(flags: OpenFlags) -> c_int {
    let mut host = if flags.contains(OpenFlags::O_RDWR) {
        libc::O_RDWR
    } else if flags.contains(OpenFlags::O_WRONLY) {
        libc::O_WRONLY
    } else {
        libc::O_RDONLY
    };
    if flags.contains(OpenFlags::O_NOCTTY) {
        host |= libc::O_NOCTTY;
    }
    if flags.contains(OpenFlags::O_NONBLOCK) {
        host |= libc::O_NONBLOCK;
    }
    host | libc::O_CLOEXEC
}

fn open_flags_from_host(host: c_int) -> OpenFlags {
    let mut flags = match host & libc::O_ACCMODE {
        libc::O_RDWR => OpenFlags::O_RDWR,
        libc::O_WRONLY => OpenFlags::O_WRONLY,
        _ => OpenFlags::O_RDONLY,
    };
    if host & libc::O_NOCTTY != 0 {
        flags |= OpenFlags::O_NOCTTY;
    }
    if host & libc::O_NONBLOCK != 0 {
        flags |= OpenFlags::O_NONBLOCK;
    }
    flags
}

const MODEM_LINES: [(ModemLines, c_int); 6] = [
    (ModemLines::DTR, libc::TIOCM_DTR),
    (ModemLines::RTS, libc::TIOCM_RTS),
    (ModemLines::CTS, libc::TIOCM_CTS),
    (ModemLines::CAR, libc::TIOCM_CAR),
    (ModemLines::RNG, libc::TIOCM_RNG),
    (ModemLines::DSR, libc::TIOCM_DSR),
];

fn host_modem(lines: ModemLines) -> c_int {
    MODEM_LINES
        .iter()
        .filter(|(line, _)| lines.contains(*line))
        .fold(0, |acc, (_, bit)| acc | bit)
}

fn modem_from_host(bits: c_int) -> ModemLines {
    MODEM_LINES
        .iter()
        .filter(|(_, bit)| bits & bit != 0)
        .fold(ModemLines::empty(), |acc, (line, _)| acc | *line)
}

const POLL_EVENTS: [(PollEvents, libc::c_short); 6] = [
    (PollEvents::POLLIN, libc::POLLIN),
    (PollEvents::POLLPRI, libc::POLLPRI),
    (PollEvents::POLLOUT, libc::POLLOUT),
    (PollEvents::POLLERR, libc::POLLERR),
    (PollEvents::POLLHUP, libc::POLLHUP),
    (PollEvents::POLLNVAL, libc::POLLNVAL),
];

fn host_events(events: PollEvents) -> libc::c_short {
    POLL_EVENTS
        .iter()
        .filter(|(ev, _)| events.contains(*ev))
        .fold(0, |acc, (_, bit)| acc | bit)
}

fn events_from_host(bits: libc::c_short) -> PollEvents {
    POLL_EVENTS
        .iter()
        .filter(|(_, bit)| bits & bit != 0)
        .fold(PollEvents::empty(), |acc, (ev, _)| acc | *ev)
}

fn host_fd_set(set: &Option<&mut FdSet>, nfds: usize) -> Option<libc::fd_set> {
    set.as_ref().map(|set| {
        let mut host: libc::fd_set = unsafe { mem::zeroed() };
        unsafe { libc::FD_ZERO(&mut host) };
        for fd in set.iter_below(nfds) {
            unsafe { libc::FD_SET(fd, &mut host) };
        }
        host
    })
}

fn fd_set_ptr(set: &mut Option<libc::fd_set>) -> *mut libc::fd_set {
    set.as_mut().map_or(ptr::null_mut(), |s| s as *mut _)
}

fn publish(set: Option<&mut FdSet>, host: &Option<libc::fd_set>, nfds: usize) {
    if let (Some(set), Some(host)) = (set, host) {
        set.zero();
        for fd in 0..nfds as Fd {
            if unsafe { libc::FD_ISSET(fd, host) } {
                set.set(fd);
            }
        }
    }
}

/// Native termios backend.
#[derive(Debug, Default)]
pub struct PosixBackend {
    /// Descriptors opened here, with the custom divisor each one runs at.
    open: Mutex<HashMap<Fd, Option<CustomDivisor>>>,
}

impl PosixBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn check(&self, fd: Fd) -> Result<()> {
        if self.open.lock().contains_key(&fd) {
            Ok(())
        } else {
            Err(TermiosError::InvalidDescriptor(fd))
        }
    }

    fn host_termios(fd: Fd) -> Result<libc::termios> {
        let mut host: libc::termios = unsafe { mem::zeroed() };
        cvt(unsafe { libc::tcgetattr(fd, &mut host) })?;
        Ok(host)
    }

    fn base_clock(fd: Fd) -> Option<u32> {
        #[cfg(any(target_os = "linux", target_os = "android"))]
        {
            speed::custom::base_clock(fd)
        }
        #[cfg(not(any(target_os = "linux", target_os = "android")))]
        {
            let _ = fd;
            None
        }
    }

    /// Commit `host` with the line speed `setting`, keeping the divisor
    /// and termios consistent when either step fails.
    #[cfg(any(target_os = "linux", target_os = "android"))]
    fn commit(
        &self,
        fd: Fd,
        action: c_int,
        host: &libc::termios,
        setting: &BaudSetting<libc::speed_t>,
    ) -> Result<Option<CustomDivisor>> {
        use crate::termios::BaudError;
        match setting {
            BaudSetting::Custom(divisor) => {
                let previous = speed::custom::program(fd, divisor).map_err(|e| {
                    debug!("fd {}: TIOCSSERIAL failed: {}", fd, e);
                    TermiosError::Baud(BaudError::NoCustomDivisor(divisor.requested))
                })?;
                if let Err(e) = cvt(unsafe { libc::tcsetattr(fd, action, host) }) {
                    if let Err(restore) = speed::custom::set(fd, &previous) {
                        debug!("fd {}: restoring serial settings failed: {}", fd, restore);
                    }
                    return Err(e);
                }
                Ok(Some(*divisor))
            }
            BaudSetting::Standard { .. } => {
                cvt(unsafe { libc::tcsetattr(fd, action, host) })?;
                let had_custom = matches!(self.open.lock().get(&fd), Some(Some(_)));
                if had_custom {
                    if let Err(e) = speed::custom::clear(fd) {
                        debug!("fd {}: clearing custom divisor failed: {}", fd, e);
                    }
                }
                Ok(None)
            }
        }
    }

    #[cfg(not(any(target_os = "linux", target_os = "android")))]
    fn commit(
        &self,
        fd: Fd,
        action: c_int,
        host: &libc::termios,
        setting: &BaudSetting<libc::speed_t>,
    ) -> Result<Option<CustomDivisor>> {
        if let BaudSetting::Custom(divisor) = setting {
            return Err(crate::termios::BaudError::NoCustomDivisor(divisor.requested).into());
        }
        cvt(unsafe { libc::tcsetattr(fd, action, host) })?;
        Ok(None)
    }
}

impl Backend for PosixBackend {
    fn name(&self) -> &'static str {
        "posix"
    }

    fn open(&self, path: &str, flags: OpenFlags) -> Result<Fd> {
        let flags = flags.validate()?;
        let path = device_path(path);
        let c_path = CString::new(path.as_str())
            .map_err(|_| TermiosError::invalid("device path contains a NUL byte"))?;
        let fd = cvt(unsafe { libc::open(c_path.as_ptr(), host_open_flags(flags)) })?;
        self.open.lock().insert(fd, None);
        info!("Opened {} as fd {}", path, fd);
        Ok(fd)
    }

    fn close(&self, fd: Fd) -> Result<()> {
        if self.open.lock().remove(&fd).is_none() {
            return Err(TermiosError::InvalidDescriptor(fd));
        }
        cvt(unsafe { libc::close(fd) })?;
        info!("Closed fd {}", fd);
        Ok(())
    }

    fn read(&self, fd: Fd, buf: &mut [u8]) -> Result<usize> {
        self.check(fd)?;
        let n = unsafe { libc::read(fd, buf.as_mut_ptr().cast(), buf.len()) };
        if n < 0 {
            return Err(TermiosError::from_native(io::Error::last_os_error()));
        }
        Ok(n as usize)
    }

    fn write(&self, fd: Fd, buf: &[u8]) -> Result<usize> {
        self.check(fd)?;
        let n = unsafe { libc::write(fd, buf.as_ptr().cast(), buf.len()) };
        if n < 0 {
            return Err(TermiosError::from_native(io::Error::last_os_error()));
        }
        Ok(n as usize)
    }

    fn tcgetattr(&self, fd: Fd) -> Result<Termios> {
        self.check(fd)?;
        let host = Self::host_termios(fd)?;
        let mut termios = flags::decode_termios(&host);

        let table = speed::rate_table();
        let mut ospeed = lookup_rate(unsafe { libc::cfgetospeed(&host) }, &table).unwrap_or(0);
        let mut ispeed = lookup_rate(unsafe { libc::cfgetispeed(&host) }, &table).unwrap_or(0);
        if let Some(Some(custom)) = self.open.lock().get(&fd) {
            if ospeed == 38400 {
                ospeed = custom.requested;
            }
            if ispeed == 38400 {
                ispeed = custom.requested;
            }
        }
        termios.c_ospeed = ospeed;
        termios.c_ispeed = ispeed;
        Ok(termios)
    }

    fn tcsetattr(&self, fd: Fd, when: SetAttrWhen, termios: &Termios) -> Result<()> {
        self.check(fd)?;
        let mut host = Self::host_termios(fd)?;
        flags::encode_termios(termios, &mut host);

        let output = speed::resolve_rate(termios.c_ospeed, || Self::base_clock(fd))?;
        let out_native = match output {
            BaudSetting::Standard { native, .. } => native,
            BaudSetting::Custom(_) => libc::B38400,
        };
        let in_native = if termios.c_ispeed == 0 || termios.c_ispeed == termios.c_ospeed {
            out_native
        } else {
            match speed::resolve_rate(termios.c_ispeed, || None)? {
                BaudSetting::Standard { native, .. } => native,
                BaudSetting::Custom(_) => {
                    return Err(TermiosError::invalid(
                        "a custom input speed must equal the output speed",
                    ))
                }
            }
        };
        cvt(unsafe { libc::cfsetospeed(&mut host, out_native) })?;
        cvt(unsafe { libc::cfsetispeed(&mut host, in_native) })?;

        let action = match when {
            SetAttrWhen::Now => libc::TCSANOW,
            SetAttrWhen::Drain => libc::TCSADRAIN,
            SetAttrWhen::Flush => libc::TCSAFLUSH,
        };
        let custom = self.commit(fd, action, &host, &output)?;
        if let Some(c) = &custom {
            debug!(
                "fd {}: custom divisor {} for {} baud (actual {})",
                fd, c.divisor, c.requested, c.actual
            );
        }
        if let Some(slot) = self.open.lock().get_mut(&fd) {
            *slot = custom;
        }
        Ok(())
    }

    fn tcflush(&self, fd: Fd, queue: FlushQueue) -> Result<()> {
        self.check(fd)?;
        let selector = match queue {
            FlushQueue::Input => libc::TCIFLUSH,
            FlushQueue::Output => libc::TCOFLUSH,
            FlushQueue::Both => libc::TCIOFLUSH,
        };
        cvt(unsafe { libc::tcflush(fd, selector) })?;
        Ok(())
    }

    fn tcdrain(&self, fd: Fd) -> Result<()> {
        self.check(fd)?;
        cvt(unsafe { libc::tcdrain(fd) })?;
        Ok(())
    }

    fn tcsendbreak(&self, fd: Fd, duration: i32) -> Result<()> {
        self.check(fd)?;
        cvt(unsafe { libc::ioctl(fd, libc::TIOCSBRK) })?;
        thread::sleep(break_duration(duration));
        cvt(unsafe { libc::ioctl(fd, libc::TIOCCBRK) })?;
        Ok(())
    }

    fn ioctl(&self, fd: Fd, command: IoctlCommand) -> Result<i32> {
        self.check(fd)?;
        let mut value: c_int = 0;
        match command {
            IoctlCommand::Fionread => {
                cvt(unsafe { libc::ioctl(fd, libc::FIONREAD, &mut value as *mut c_int) })?;
                Ok(value)
            }
            IoctlCommand::Tiocoutq => {
                cvt(unsafe { libc::ioctl(fd, libc::TIOCOUTQ, &mut value as *mut c_int) })?;
                Ok(value)
            }
            IoctlCommand::Tiocmget => {
                cvt(unsafe { libc::ioctl(fd, libc::TIOCMGET, &mut value as *mut c_int) })?;
                Ok(modem_from_host(value).bits())
            }
            IoctlCommand::Tiocmset(lines) => {
                value = host_modem(lines);
                cvt(unsafe { libc::ioctl(fd, libc::TIOCMSET, &mut value as *mut c_int) })?;
                Ok(0)
            }
            IoctlCommand::Tiocmbis(lines) => {
                value = host_modem(lines);
                cvt(unsafe { libc::ioctl(fd, libc::TIOCMBIS, &mut value as *mut c_int) })?;
                Ok(0)
            }
            IoctlCommand::Tiocmbic(lines) => {
                value = host_modem(lines);
                cvt(unsafe { libc::ioctl(fd, libc::TIOCMBIC, &mut value as *mut c_int) })?;
                Ok(0)
            }
        }
    }

    fn fcntl(&self, fd: Fd, command: FcntlCommand) -> Result<i32> {
        self.check(fd)?;
        let host = cvt(unsafe { libc::fcntl(fd, libc::F_GETFL) })?;
        match command {
            FcntlCommand::GetFl => Ok(open_flags_from_host(host).bits()),
            FcntlCommand::SetFl(flags) => {
                let updated = if flags.is_nonblocking() {
                    host | libc::O_NONBLOCK
                } else {
                    host & !libc::O_NONBLOCK
                };
                cvt(unsafe { libc::fcntl(fd, libc::F_SETFL, updated) })?;
                Ok(0)
            }
        }
    }

    fn select(
        &self,
        nfds: usize,
        read: Option<&mut FdSet>,
        write: Option<&mut FdSet>,
        except: Option<&mut FdSet>,
        timeout: Option<&TimeVal>,
    ) -> Result<usize> {
        if nfds > FD_SETSIZE {
            return Err(TermiosError::invalid(format!(
                "nfds {} exceeds FD_SETSIZE {}",
                nfds, FD_SETSIZE
            )));
        }
        {
            let open = self.open.lock();
            for set in [&read, &write, &except].into_iter().flatten() {
                if let Some(fd) = set.iter_below(nfds).find(|fd| !open.contains_key(fd)) {
                    return Err(TermiosError::InvalidDescriptor(fd));
                }
            }
        }
        let empty = [&read, &write, &except]
            .into_iter()
            .flatten()
            .all(|set| set.iter_below(nfds).next().is_none());
        if let Some(t) = timeout {
            t.checked_duration()?;
        }
        if empty && timeout.is_none() {
            return Err(TermiosError::invalid(
                "select with no descriptors and no timeout",
            ));
        }

        let mut host_read = host_fd_set(&read, nfds);
        let mut host_write = host_fd_set(&write, nfds);
        let mut host_except = host_fd_set(&except, nfds);
        // The kernel may rewrite the timeval; it gets a copy.
        let mut host_timeout = timeout.map(|t| libc::timeval {
            tv_sec: t.tv_sec as libc::time_t,
            tv_usec: t.tv_usec as libc::suseconds_t,
        });

        let ready = cvt(unsafe {
            libc::select(
                nfds as c_int,
                fd_set_ptr(&mut host_read),
                fd_set_ptr(&mut host_write),
                fd_set_ptr(&mut host_except),
                host_timeout
                    .as_mut()
                    .map_or(ptr::null_mut(), |t| t as *mut _),
            )
        })?;

        publish(read, &host_read, nfds);
        publish(write, &host_write, nfds);
        publish(except, &host_except, nfds);
        Ok(ready as usize)
    }

    fn poll(&self, fds: &mut [PollFd], timeout_ms: i32) -> Result<usize> {
        let mut invalid = 0;
        {
            let open = self.open.lock();
            for entry in fds.iter_mut() {
                entry.revents = PollEvents::empty();
                if entry.fd >= 0 && !open.contains_key(&entry.fd) {
                    entry.revents = PollEvents::POLLNVAL;
                    invalid += 1;
                }
            }
        }
        if invalid > 0 {
            return Ok(invalid);
        }

        let mut host: Vec<libc::pollfd> = fds
            .iter()
            .map(|entry| libc::pollfd {
                fd: entry.fd,
                events: host_events(entry.events),
                revents: 0,
            })
            .collect();
        let ready = cvt(unsafe {
            libc::poll(host.as_mut_ptr(), host.len() as libc::nfds_t, timeout_ms)
        })?;
        for (entry, host) in fds.iter_mut().zip(&host) {
            entry.revents = events_from_host(host.revents);
        }
        Ok(ready as usize)
    }

    fn open_descriptors(&self) -> Vec<Fd> {
        let mut fds: Vec<Fd> = self.open.lock().keys().copied().collect();
        fds.sort_unstable();
        fds
    }
}

impl Drop for PosixBackend {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::errno;
    use std::time::{Duration, Instant};

    #[test]
    fn test_device_paths() {
        assert_eq!(device_path("ttyUSB0"), "/dev/ttyUSB0");
        assert_eq!(device_path("/dev/pts/3"), "/dev/pts/3");
    }

    #[test]
    fn test_open_flag_mapping() {
        let host = host_open_flags(OpenFlags::O_RDWR | OpenFlags::O_NONBLOCK | OpenFlags::O_NOCTTY);
        assert_eq!(host & libc::O_ACCMODE, libc::O_RDWR);
        assert_eq!(
            open_flags_from_host(host),
            OpenFlags::O_RDWR | OpenFlags::O_NONBLOCK | OpenFlags::O_NOCTTY
        );
        assert_eq!(open_flags_from_host(libc::O_RDONLY), OpenFlags::O_RDONLY);
    }

    #[test]
    fn test_modem_and_poll_mapping() {
        let lines = ModemLines::DTR | ModemLines::CTS | ModemLines::CAR;
        assert_eq!(modem_from_host(host_modem(lines)), lines);
        let events = PollEvents::POLLIN | PollEvents::POLLOUT | PollEvents::POLLERR;
        assert_eq!(events_from_host(host_events(events)), events);
    }

    #[test]
    fn test_missing_device() {
        let backend = PosixBackend::new();
        let err = backend
            .open("/dev/serial-termios-does-not-exist", OpenFlags::O_RDWR)
            .unwrap_err();
        assert_eq!(err.errno(), libc::ENOENT);
        assert!(backend.open_descriptors().is_empty());
    }

    #[test]
    fn test_foreign_descriptors_are_rejected() {
        let backend = PosixBackend::new();
        let mut buf = [0u8; 4];
        // stdin is open in the process but was not opened through the backend.
        assert_eq!(backend.read(0, &mut buf).unwrap_err().errno(), errno::EBADF);
        assert_eq!(backend.close(0).unwrap_err().errno(), errno::EBADF);

        let mut set = FdSet::new();
        set.set(0);
        let err = backend
            .select(1, Some(&mut set), None, None, Some(&TimeVal::new(0, 0)))
            .unwrap_err();
        assert_eq!(err.errno(), errno::EBADF);

        let mut fds = [PollFd::new(0, PollEvents::POLLIN), PollFd::new(-1, PollEvents::POLLIN)];
        assert_eq!(backend.poll(&mut fds, 0).unwrap(), 1);
        assert_eq!(fds[0].revents, PollEvents::POLLNVAL);
        assert!(fds[1].revents.is_empty());
    }

    #[test]
    fn test_select_without_descriptors() {
        let backend = PosixBackend::new();
        let timeout = TimeVal::new(0, 20_000);
        let start = Instant::now();
        assert_eq!(backend.select(0, None, None, None, Some(&timeout)).unwrap(), 0);
        assert!(start.elapsed() >= Duration::from_millis(15));
        assert_eq!(timeout, TimeVal::new(0, 20_000));

        assert_eq!(
            backend.select(0, None, None, None, None).unwrap_err().errno(),
            errno::EINVAL
        );
    }
}
