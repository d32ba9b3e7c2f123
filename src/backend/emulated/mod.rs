//! POSIX descriptor semantics on top of overlapped COMM devices.
//!
//! The backend is generic over a [`CommDriver`]: on Windows the real one is
//! `Win32Driver`, everywhere the in-memory [`SimulatedDriver`] is available
//! for tests and demos.
//!
//! Close ordering for a descriptor:
//! 1. the registry slot is reserved, so new calls fail with EBADF;
//! 2. multiplexers are told, and every queued native operation is cancelled;
//! 3. close waits until the device has completed all of them;
//! 4. the device is released and the slot freed for reuse.

pub mod mapping;
mod multiplex;
pub mod native;
mod port;
pub mod simulated;
#[cfg(windows)]
mod win32;

pub use mapping::{Applied, DcbLimits, Fingerprint};
pub use native::{
    ComStat, CommDevice, CommDriver, CommErrors, Completion, CompletionData, CompletionHandle,
    Dcb, DcbFlags, EscapeFunction, EventMask, ModemStatus, NativeParity, NativeStopBits,
    PurgeFlags, STANDARD_RATES,
};
pub use simulated::{FailPoint, NativeCallStats, SimulatedComm, SimulatedDriver, SimulatedLine};
#[cfg(windows)]
pub use win32::{Win32Comm, Win32Driver};

use self::mapping::apply_termios;
use self::port::Port;
use super::{
    break_duration, Backend, FcntlCommand, FlushQueue, IoctlCommand, ModemLines, OpenFlags,
    SetAttrWhen,
};
use crate::config::{Config, EmulationConfig};
use crate::error::{Result, TermiosError};
use crate::fdset::{FdSet, PollFd, TimeVal};
use crate::registry::PortRegistry;
use crate::termios::{ReadPlan, Termios};
use crate::Fd;
use std::sync::mpsc::{self, Receiver};
use std::sync::Arc;
use std::thread;
use tracing::{debug, info, warn};

/// Speed a port is configured for when opened.
pub const DEFAULT_BAUD: u32 = 9600;

/// Emulated backend over `Dr`'s devices.
#[derive(Debug)]
pub struct EmulatedBackend<Dr: CommDriver> {
    driver: Dr,
    registry: PortRegistry<Port<Dr::Device>>,
    settings: EmulationConfig,
}

/// Strip the Win32 device namespace prefix.
fn device_name(path: &str) -> &str {
    path.strip_prefix(r"\\.\").unwrap_or(path)
}

/// The path a native driver opens for `name`. Names already in a `\\`
/// namespace are used as given.
#[cfg_attr(not(windows), allow(dead_code))]
pub(crate) fn device_path(name: &str) -> String {
    if name.starts_with(r"\\") {
        name.to_string()
    } else {
        format!(r"\\.\{}", name)
    }
}

fn modem_lines(status: ModemStatus) -> ModemLines {
    let mut lines = ModemLines::empty();
    if status.contains(ModemStatus::CTS_ON) {
        lines |= ModemLines::CTS;
    }
    if status.contains(ModemStatus::DSR_ON) {
        lines |= ModemLines::DSR;
    }
    if status.contains(ModemStatus::RING_ON) {
        lines |= ModemLines::RNG;
    }
    if status.contains(ModemStatus::RLSD_ON) {
        lines |= ModemLines::CAR;
    }
    lines
}

/// Block until the single operation reporting on `rx` completes.
fn await_completion(rx: Receiver<Completion>) -> Result<CompletionData> {
    match rx.recv() {
        Ok(Completion::Finished { result, .. }) => result.map_err(TermiosError::from_native),
        Ok(Completion::PortClosed { .. }) | Err(_) => Err(TermiosError::Interrupted("port closed")),
    }
}

impl<Dr: CommDriver> EmulatedBackend<Dr> {
    pub fn new(driver: Dr, config: &Config) -> Self {
        Self {
            driver,
            registry: PortRegistry::new(config.registry.max_ports),
            settings: config.emulation.clone(),
        }
    }

    /// The driver devices are opened through.
    pub fn driver(&self) -> &Dr {
        &self.driver
    }

    fn limits(&self) -> DcbLimits {
        DcbLimits {
            xon_lim: self.settings.xon_limit,
            xoff_lim: self.settings.xoff_limit,
            baud_base: self.settings.baud_base,
        }
    }

    /// Open and configure the device. Nothing is reachable until it succeeds.
    fn open_port(&self, fd: Fd, name: &str, flags: OpenFlags) -> Result<Port<Dr::Device>> {
        let device = self.driver.open(name).map_err(TermiosError::from_native)?;

        let termios = Termios::raw_at(DEFAULT_BAUD);
        let mut applied = Applied::default();
        let configured = device
            .setup_queues(self.settings.rx_buffer_size, self.settings.tx_buffer_size)
            .map_err(TermiosError::from_native)
            .and_then(|()| apply_termios(&device, &mut applied, &termios, &self.limits()));

        if let Err(e) = configured {
            if let Err(close) = device.close() {
                warn!("{}: closing after failed open: {}", name, close);
            }
            return Err(e);
        }
        Ok(Port::new(fd, name, device, flags, termios, applied))
    }

    fn queued(port: &Port<Dr::Device>) -> Result<(usize, usize)> {
        let stat = port
            .device
            .clear_error()
            .map_err(TermiosError::from_native)?;
        Ok((stat.in_queue as usize, stat.out_queue as usize))
    }
}

impl<Dr: CommDriver> Backend for EmulatedBackend<Dr> {
    fn name(&self) -> &'static str {
        "emulated"
    }

    fn open(&self, path: &str, flags: OpenFlags) -> Result<Fd> {
        let flags = flags.validate()?;
        let name = device_name(path);
        let fd = self.registry.allocate()?;

        match self.open_port(fd, name, flags) {
            Ok(port) => {
                self.registry.install(fd, Arc::new(port));
                info!("Opened {} as fd {}", name, fd);
                Ok(fd)
            }
            Err(e) => {
                self.registry.release(fd);
                debug!("Opening {} failed: {}", name, e);
                Err(e)
            }
        }
    }

    fn close(&self, fd: Fd) -> Result<()> {
        let port = self.registry.begin_close(fd)?;
        port.shut();
        port.in_flight()
            .wait_idle(self.settings.close_warn(), |outstanding| {
                warn!(
                    "{}: close still waiting for {} operation(s) to cancel",
                    port.name, outstanding
                );
            });
        let closed = port.device.close();
        self.registry.release(fd);
        info!("Closed fd {} ({})", fd, port.name);
        closed.map_err(TermiosError::from_native)
    }

    fn read(&self, fd: Fd, buf: &mut [u8]) -> Result<usize> {
        let port = self.registry.resolve(fd)?;
        let _op = port.enter()?;
        let _lane = port.read_lane.lock();

        let (mode, flags) = {
            let state = port.state()?;
            (state.termios.read_mode(), state.flags)
        };
        if flags.contains(OpenFlags::O_WRONLY) {
            return Err(TermiosError::InvalidDescriptor(fd));
        }

        let (queued, _) = Self::queued(&port)?;
        let len = match mode.plan(buf.len(), queued, flags.is_nonblocking()) {
            ReadPlan::Immediate(n) => return Ok(n),
            ReadPlan::WouldBlock => return Err(TermiosError::WouldBlock),
            ReadPlan::Issue(n) => n,
        };

        let (tx, rx) = mpsc::channel();
        port.submit(|device, op| device.read_async(len, CompletionHandle::new(0, tx, op)))?;
        match await_completion(rx)? {
            CompletionData::Read(bytes) => {
                let n = bytes.len().min(buf.len());
                buf[..n].copy_from_slice(&bytes[..n]);
                Ok(n)
            }
            other => Err(TermiosError::invalid(format!(
                "read completed with {:?}",
                other
            ))),
        }
    }

    fn write(&self, fd: Fd, buf: &[u8]) -> Result<usize> {
        let port = self.registry.resolve(fd)?;
        let _op = port.enter()?;
        let _lane = port.write_lane.lock();

        let flags = port.state()?.flags;
        if !flags.intersects(OpenFlags::O_WRONLY | OpenFlags::O_RDWR) {
            return Err(TermiosError::InvalidDescriptor(fd));
        }
        if buf.is_empty() {
            return Ok(0);
        }

        let mut len = buf.len();
        if flags.is_nonblocking() {
            let (_, pending) = Self::queued(&port)?;
            let room = (self.settings.tx_buffer_size as usize).saturating_sub(pending);
            if room == 0 {
                return Err(TermiosError::WouldBlock);
            }
            len = len.min(room);
        }

        let (tx, rx) = mpsc::channel();
        let data = buf[..len].to_vec();
        port.submit(|device, op| device.write_async(data, CompletionHandle::new(0, tx, op)))?;
        match await_completion(rx)? {
            CompletionData::Written(n) => Ok(n),
            other => Err(TermiosError::invalid(format!(
                "write completed with {:?}",
                other
            ))),
        }
    }

    fn tcgetattr(&self, fd: Fd) -> Result<Termios> {
        let port = self.registry.resolve(fd)?;
        let state = port.state()?;
        Ok(state.termios)
    }

    fn tcsetattr(&self, fd: Fd, when: SetAttrWhen, termios: &Termios) -> Result<()> {
        let port = self.registry.resolve(fd)?;
        let _op = port.enter()?;
        let _config = port.config.lock();

        if when != SetAttrWhen::Now {
            port.device.flush().map_err(TermiosError::from_native)?;
        }

        {
            let mut guard = port.state()?;
            let state = &mut *guard;
            apply_termios(&port.device, &mut state.applied, termios, &self.limits())?;
            state.termios = *termios;
        }
        debug!(
            "fd {}: termios applied ({} baud, {:?})",
            fd,
            termios.ospeed(),
            termios.read_mode()
        );

        if when == SetAttrWhen::Flush {
            port.device
                .purge(PurgeFlags::RXCLEAR)
                .map_err(TermiosError::from_native)?;
        }
        Ok(())
    }

    fn tcflush(&self, fd: Fd, queue: FlushQueue) -> Result<()> {
        let port = self.registry.resolve(fd)?;
        let _op = port.enter()?;
        let flags = match queue {
            FlushQueue::Input => PurgeFlags::RXCLEAR,
            FlushQueue::Output => PurgeFlags::TXCLEAR,
            FlushQueue::Both => PurgeFlags::RXCLEAR | PurgeFlags::TXCLEAR,
        };
        port.device.purge(flags).map_err(TermiosError::from_native)
    }

    fn tcdrain(&self, fd: Fd) -> Result<()> {
        let port = self.registry.resolve(fd)?;
        let _op = port.enter()?;
        port.device.flush().map_err(TermiosError::from_native)
    }

    fn tcsendbreak(&self, fd: Fd, duration: i32) -> Result<()> {
        let port = self.registry.resolve(fd)?;
        let _op = port.enter()?;
        let _lane = port.write_lane.lock();

        port.device.set_break().map_err(TermiosError::from_native)?;
        thread::sleep(break_duration(duration));
        port.device.clear_break().map_err(TermiosError::from_native)
    }

    fn ioctl(&self, fd: Fd, command: IoctlCommand) -> Result<i32> {
        let port = self.registry.resolve(fd)?;
        let _op = port.enter()?;

        let drive = |lines: ModemLines| -> Result<()> {
            let dtr = if lines.contains(ModemLines::DTR) {
                EscapeFunction::SetDtr
            } else {
                EscapeFunction::ClrDtr
            };
            let rts = if lines.contains(ModemLines::RTS) {
                EscapeFunction::SetRts
            } else {
                EscapeFunction::ClrRts
            };
            port.device.escape(dtr).map_err(TermiosError::from_native)?;
            port.device.escape(rts).map_err(TermiosError::from_native)
        };

        match command {
            IoctlCommand::Fionread => Ok(Self::queued(&port)?.0 as i32),
            IoctlCommand::Tiocoutq => Ok(Self::queued(&port)?.1 as i32),
            IoctlCommand::Tiocmget => {
                let status = port
                    .device
                    .modem_status()
                    .map_err(TermiosError::from_native)?;
                let outputs = port.state()?.outputs;
                Ok((modem_lines(status) | outputs).bits())
            }
            IoctlCommand::Tiocmset(lines)
            | IoctlCommand::Tiocmbis(lines)
            | IoctlCommand::Tiocmbic(lines) => {
                let mut state = port.state()?;
                let outputs = match command {
                    IoctlCommand::Tiocmbis(_) => state.outputs | lines,
                    IoctlCommand::Tiocmbic(_) => state.outputs - lines,
                    _ => lines,
                } & ModemLines::OUTPUTS;
                drive(outputs)?;
                state.outputs = outputs;
                Ok(0)
            }
        }
    }

    fn fcntl(&self, fd: Fd, command: FcntlCommand) -> Result<i32> {
        let port = self.registry.resolve(fd)?;
        let mut state = port.state()?;
        match command {
            FcntlCommand::GetFl => Ok(state.flags.bits()),
            FcntlCommand::SetFl(flags) => {
                state.flags = (state.flags - OpenFlags::STATUS) | (flags & OpenFlags::STATUS);
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
        multiplex::select(
            &self.registry,
            self.settings.tx_buffer_size,
            nfds,
            read,
            write,
            except,
            timeout,
        )
    }

    fn poll(&self, fds: &mut [PollFd], timeout_ms: i32) -> Result<usize> {
        multiplex::poll(&self.registry, self.settings.tx_buffer_size, fds, timeout_ms)
    }

    fn open_descriptors(&self) -> Vec<Fd> {
        self.registry.open_descriptors()
    }
}

impl<Dr: CommDriver> Drop for EmulatedBackend<Dr> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::termios::{ControlFlags, VMIN, VTIME};
    use pretty_assertions::assert_eq;
    use std::time::{Duration, Instant};

    fn backend() -> (EmulatedBackend<SimulatedDriver>, SimulatedLine) {
        let driver = SimulatedDriver::new();
        let line = driver.add_line("COM1");
        (EmulatedBackend::new(driver, &Config::default()), line)
    }

    #[test]
    fn test_device_path_keeps_existing_namespace() {
        assert_eq!(device_path("COM3"), r"\\.\COM3");
        assert_eq!(device_path(device_name(r"\\.\COM12")), r"\\.\COM12");
        assert_eq!(device_path(r"\\?\COM12"), r"\\?\COM12");
    }

    #[test]
    fn test_open_configures_raw_9600() {
        let (backend, line) = backend();
        let fd = backend.open(r"\\.\COM1", OpenFlags::O_RDWR).unwrap();
        assert_eq!(fd, 0);

        let dcb = line.dcb().unwrap();
        assert_eq!(dcb.baud_rate, 9600);
        assert_eq!(dcb.byte_size, 8);
        assert_eq!(line.queue_sizes(), (2048, 2048));

        let termios = backend.tcgetattr(fd).unwrap();
        assert_eq!(termios, Termios::raw_at(DEFAULT_BAUD));
        assert!(line.dtr() && line.rts());
    }

    #[test]
    fn test_failed_open_releases_everything() {
        let (backend, line) = backend();
        line.fail_next(FailPoint::SetState);
        assert!(backend.open("COM1", OpenFlags::O_RDWR).is_err());
        assert!(backend.open_descriptors().is_empty());
        assert!(!line.is_open());

        assert_eq!(backend.open("COM1", OpenFlags::O_RDWR).unwrap(), 0);
        assert!(matches!(
            backend.open("COM9", OpenFlags::O_RDWR),
            Err(TermiosError::Native(_))
        ));
    }

    #[test]
    fn test_poll_mode_read() {
        let (backend, line) = backend();
        let fd = backend.open("COM1", OpenFlags::O_RDWR).unwrap();
        let mut buf = [0u8; 8];
        assert_eq!(backend.read(fd, &mut buf).unwrap(), 0);

        line.inject(b"0123456789");
        assert_eq!(backend.read(fd, &mut buf).unwrap(), 8);
        assert_eq!(&buf, b"01234567");
        assert_eq!(backend.read(fd, &mut buf).unwrap(), 2);
    }

    #[test]
    fn test_nonblocking_read_would_block() {
        let (backend, line) = backend();
        let fd = backend
            .open("COM1", OpenFlags::O_RDWR | OpenFlags::O_NONBLOCK)
            .unwrap();
        let mut termios = backend.tcgetattr(fd).unwrap();
        termios.set_read_timing(1, 0);
        backend.tcsetattr(fd, SetAttrWhen::Now, &termios).unwrap();

        let mut buf = [0u8; 4];
        assert!(matches!(
            backend.read(fd, &mut buf),
            Err(TermiosError::WouldBlock)
        ));
        line.inject(b"ab");
        assert_eq!(backend.read(fd, &mut buf).unwrap(), 2);
    }

    #[test]
    fn test_threshold_read_waits_for_vmin() {
        let (backend, line) = backend();
        let fd = backend.open("COM1", OpenFlags::O_RDWR).unwrap();
        let mut termios = backend.tcgetattr(fd).unwrap();
        termios.c_cc[VMIN] = 3;
        termios.c_cc[VTIME] = 0;
        backend.tcsetattr(fd, SetAttrWhen::Now, &termios).unwrap();

        let feeder = thread::spawn(move || {
            line.inject(b"a");
            thread::sleep(Duration::from_millis(60));
            line.inject(b"bc");
        });
        let start = Instant::now();
        let mut buf = [0u8; 16];
        assert_eq!(backend.read(fd, &mut buf).unwrap(), 3);
        assert!(start.elapsed() >= Duration::from_millis(30));
        assert_eq!(&buf[..3], b"abc");
        feeder.join().unwrap();
    }

    #[test]
    fn test_access_modes() {
        let (backend, _line) = backend();
        let fd = backend.open("COM1", OpenFlags::O_RDONLY).unwrap();
        assert!(matches!(
            backend.write(fd, b"x"),
            Err(TermiosError::InvalidDescriptor(_))
        ));
        backend.close(fd).unwrap();

        let fd = backend.open("COM1", OpenFlags::O_WRONLY).unwrap();
        let mut buf = [0u8; 1];
        assert!(matches!(
            backend.read(fd, &mut buf),
            Err(TermiosError::InvalidDescriptor(_))
        ));
        assert_eq!(backend.write(fd, b"").unwrap(), 0);
    }

    #[test]
    fn test_nonblocking_write_respects_queue_room() {
        let driver = SimulatedDriver::new();
        let line = driver.add_line("COM1");
        let mut config = Config::default();
        config.emulation.tx_buffer_size = 4;
        let backend = EmulatedBackend::new(driver, &config);
        let fd = backend
            .open("COM1", OpenFlags::O_RDWR | OpenFlags::O_NONBLOCK)
            .unwrap();

        line.hold_tx(true);
        assert_eq!(backend.write(fd, b"abcdef").unwrap(), 4);
        assert!(matches!(
            backend.write(fd, b"g"),
            Err(TermiosError::WouldBlock)
        ));
        assert_eq!(backend.ioctl(fd, IoctlCommand::Tiocoutq).unwrap(), 4);
        line.release_tx();
        assert_eq!(line.take_written(), b"abcd");
    }

    #[test]
    fn test_tcsetattr_rejects_unreachable_rate_without_change() {
        let (backend, line) = backend();
        let fd = backend.open("COM1", OpenFlags::O_RDWR).unwrap();
        let before = backend.tcgetattr(fd).unwrap();
        let calls = line.stats();

        let mut termios = before;
        termios.set_speed(31250);
        assert!(matches!(
            backend.tcsetattr(fd, SetAttrWhen::Now, &termios),
            Err(TermiosError::Baud(_))
        ));
        assert_eq!(backend.tcgetattr(fd).unwrap(), before);
        assert_eq!(line.stats(), calls);
    }

    #[test]
    fn test_rollback_when_timeouts_fail() {
        let (backend, line) = backend();
        let fd = backend.open("COM1", OpenFlags::O_RDWR).unwrap();
        let before = backend.tcgetattr(fd).unwrap();
        let dcb = line.dcb();

        let mut termios = before;
        termios.set_speed(19200);
        termios.c_cflag |= ControlFlags::PARENB;
        termios.set_read_timing(0, 5);
        line.fail_next(FailPoint::SetTimeouts);
        assert!(backend.tcsetattr(fd, SetAttrWhen::Now, &termios).is_err());
        assert_eq!(backend.tcgetattr(fd).unwrap(), before);
        assert_eq!(line.dcb(), dcb);

        backend.tcsetattr(fd, SetAttrWhen::Now, &termios).unwrap();
        assert_eq!(line.dcb().unwrap().baud_rate, 19200);
    }

    #[test]
    fn test_tcsaflush_discards_input() {
        let (backend, line) = backend();
        let fd = backend.open("COM1", OpenFlags::O_RDWR).unwrap();
        line.inject(b"stale");
        let termios = backend.tcgetattr(fd).unwrap();
        backend.tcsetattr(fd, SetAttrWhen::Flush, &termios).unwrap();
        assert_eq!(line.pending_rx(), 0);
    }

    #[test]
    fn test_modem_ioctls() {
        let (backend, line) = backend();
        let fd = backend.open("COM1", OpenFlags::O_RDWR).unwrap();
        line.set_modem(ModemStatus::CTS_ON | ModemStatus::RLSD_ON);

        let lines = ModemLines::from_bits_truncate(backend.ioctl(fd, IoctlCommand::Tiocmget).unwrap());
        assert_eq!(
            lines,
            ModemLines::DTR | ModemLines::RTS | ModemLines::CTS | ModemLines::CAR
        );

        backend
            .ioctl(fd, IoctlCommand::Tiocmbic(ModemLines::DTR))
            .unwrap();
        assert!(!line.dtr());
        assert!(line.rts());

        backend
            .ioctl(fd, IoctlCommand::Tiocmset(ModemLines::DTR | ModemLines::CTS))
            .unwrap();
        assert!(line.dtr());
        assert!(!line.rts());

        line.inject(b"xyz");
        assert_eq!(backend.ioctl(fd, IoctlCommand::Fionread).unwrap(), 3);
    }

    #[test]
    fn test_fcntl_toggles_nonblocking_only() {
        let (backend, _line) = backend();
        let fd = backend.open("COM1", OpenFlags::O_RDWR).unwrap();
        assert_eq!(
            backend.fcntl(fd, FcntlCommand::GetFl).unwrap(),
            OpenFlags::O_RDWR.bits()
        );
        backend
            .fcntl(fd, FcntlCommand::SetFl(OpenFlags::O_NONBLOCK | OpenFlags::O_WRONLY))
            .unwrap();
        assert_eq!(
            backend.fcntl(fd, FcntlCommand::GetFl).unwrap(),
            (OpenFlags::O_RDWR | OpenFlags::O_NONBLOCK).bits()
        );
    }

    #[test]
    fn test_sendbreak_and_drain() {
        let (backend, line) = backend();
        let fd = backend.open("COM1", OpenFlags::O_RDWR).unwrap();
        backend.tcsendbreak(fd, 0).unwrap();
        assert_eq!(line.breaks_sent(), 1);
        backend.write(fd, b"data").unwrap();
        backend.tcdrain(fd).unwrap();
        backend.tcflush(fd, FlushQueue::Both).unwrap();
    }

    #[test]
    fn test_drop_closes_open_ports() {
        let (backend, line) = backend();
        backend.open("COM1", OpenFlags::O_RDWR).unwrap();
        drop(backend);
        assert!(!line.is_open());
    }
}
