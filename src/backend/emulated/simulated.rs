//! In-memory COMM driver.
//!
//! Provides a [`SimulatedDriver`] whose devices behave like overlapped
//! serial handles without any hardware: the timeout block governs reads,
//! event watches only fire for events that happen after they are armed,
//! changing the mask completes a pending watch, and `cancel_io` aborts
//! everything outstanding. Each device has a [`SimulatedLine`] handle for
//! the test side of the wire.
//!
//! # Example
//! ```
//! use serial_termios::backend::emulated::{EmulatedBackend, SimulatedDriver};
//! use serial_termios::backend::{Backend, OpenFlags};
//! use serial_termios::Config;
//!
//! let driver = SimulatedDriver::new();
//! let line = driver.add_line("COM3");
//! let backend = EmulatedBackend::new(driver, &Config::default());
//!
//! let fd = backend.open("COM3", OpenFlags::O_RDWR).unwrap();
//! line.inject(b"Hello");
//!
//! let mut buf = [0u8; 16];
//! let n = backend.read(fd, &mut buf).unwrap();
//! assert_eq!(&buf[..n], b"Hello");
//!
//! backend.write(fd, b"Response").unwrap();
//! assert_eq!(line.take_written(), b"Response");
//! backend.close(fd).unwrap();
//! ```

use super::native::{
    aborted, ComStat, CommDevice, CommDriver, CommErrors, CompletionData, CompletionHandle, Dcb,
    EscapeFunction, EventMask, ModemStatus, PurgeFlags,
};
use crate::termios::{CommTimeouts, MAXDWORD};
use parking_lot::{Condvar, Mutex, MutexGuard};
use std::collections::{HashMap, HashSet, VecDeque};
use std::io;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

/// Native calls whose failure can be injected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailPoint {
    Open,
    SetupQueues,
    SetState,
    SetTimeouts,
}

/// How often configuration calls reached the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct NativeCallStats {
    pub set_state: usize,
    pub set_timeouts: usize,
    pub purge: usize,
    pub cancel_io: usize,
}

#[derive(Debug, Default)]
struct LineState {
    open: bool,
    rx: VecDeque<u8>,
    tx_queue: VecDeque<u8>,
    written: Vec<u8>,
    hold_tx: bool,
    loopback: bool,
    queue_sizes: (u32, u32),
    dcb: Option<Dcb>,
    timeouts: CommTimeouts,
    mask: EventMask,
    pending_watch: Option<CompletionHandle>,
    errors: CommErrors,
    modem: ModemStatus,
    dtr: bool,
    rts: bool,
    breaking: bool,
    breaks_sent: usize,
    /// Bumped by cancel/close; reads submitted under an older epoch abort.
    epoch: u64,
    stats: NativeCallStats,
    failures: HashSet<FailPoint>,
}

impl LineState {
    fn fail(&mut self, point: FailPoint) -> io::Result<()> {
        if self.failures.remove(&point) {
            return Err(io::Error::other(format!("injected {:?} failure", point)));
        }
        Ok(())
    }

    /// Complete the armed watch if `events` intersects the mask.
    fn fire(&mut self, events: EventMask) {
        let hit = self.mask & events;
        if hit.is_empty() {
            return;
        }
        if let Some(watch) = self.pending_watch.take() {
            watch.complete(Ok(CompletionData::Event(hit)));
        }
    }

    fn receive(&mut self, data: &[u8]) {
        if data.is_empty() {
            return;
        }
        self.rx.extend(data.iter().copied());
        self.fire(EventMask::RXCHAR);
    }

    fn abort_all(&mut self) {
        self.epoch += 1;
        if let Some(watch) = self.pending_watch.take() {
            watch.complete(Err(aborted()));
        }
    }
}

#[derive(Debug, Default)]
struct Shared {
    state: Mutex<LineState>,
    changed: Condvar,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, LineState> {
        self.state.lock()
    }

    /// Blocking read honoring the timeout block, run on a completion thread.
    fn read_blocking(&self, len: usize, epoch: u64) -> io::Result<Vec<u8>> {
        let mut st = self.lock();
        let t = st.timeouts;
        let start = Instant::now();

        let immediate = t.read_interval == MAXDWORD
            && t.read_total_multiplier == 0
            && t.read_total_constant == 0;
        let wait_any = t.read_interval == MAXDWORD
            && t.read_total_multiplier == MAXDWORD
            && t.read_total_constant > 0
            && t.read_total_constant < MAXDWORD;
        let total = if wait_any {
            Some(Duration::from_millis(u64::from(t.read_total_constant)))
        } else if immediate {
            None
        } else {
            let ms = u64::from(t.read_total_multiplier) * len as u64
                + u64::from(t.read_total_constant);
            (ms > 0).then(|| Duration::from_millis(ms))
        };
        let interval = match t.read_interval {
            0 | MAXDWORD => None,
            ms => Some(Duration::from_millis(u64::from(ms))),
        };
        let deadline = total.map(|d| start + d);

        let mut out = Vec::with_capacity(len);
        let mut last_byte: Option<Instant> = None;
        loop {
            if st.epoch != epoch || !st.open {
                return Err(aborted());
            }
            let take = (len - out.len()).min(st.rx.len());
            if take > 0 {
                out.extend(st.rx.drain(..take));
                last_byte = Some(Instant::now());
            }
            if out.len() == len || immediate || (wait_any && !out.is_empty()) {
                return Ok(out);
            }

            let gap_deadline = match (interval, last_byte) {
                (Some(i), Some(at)) => Some(at + i),
                _ => None,
            };
            let wake = match (deadline, gap_deadline) {
                (Some(a), Some(b)) => Some(a.min(b)),
                (a, b) => a.or(b),
            };
            match wake {
                Some(at) if Instant::now() >= at => return Ok(out),
                Some(at) => {
                    self.changed.wait_until(&mut st, at);
                }
                None => self.changed.wait(&mut st),
            }
        }
    }
}

/// Test-side handle of a simulated wire.
#[derive(Debug, Clone, Default)]
pub struct SimulatedLine {
    shared: Arc<Shared>,
}

impl SimulatedLine {
    /// Deliver bytes from the remote end.
    pub fn inject(&self, data: &[u8]) {
        self.shared.lock().receive(data);
        self.shared.changed.notify_all();
    }

    /// Everything transmitted so far, clearing the log.
    pub fn take_written(&self) -> Vec<u8> {
        std::mem::take(&mut self.shared.lock().written)
    }

    /// Echo transmitted bytes back into the receive queue.
    pub fn set_loopback(&self, enabled: bool) {
        self.shared.lock().loopback = enabled;
    }

    /// Keep written bytes in the transmit queue until [`release_tx`](Self::release_tx).
    pub fn hold_tx(&self, hold: bool) {
        self.shared.lock().hold_tx = hold;
    }

    /// Transmit everything held in the output queue.
    pub fn release_tx(&self) {
        let mut st = self.shared.lock();
        let pending: Vec<u8> = st.tx_queue.drain(..).collect();
        if !pending.is_empty() {
            st.written.extend_from_slice(&pending);
            st.fire(EventMask::TXEMPTY);
        }
        drop(st);
        self.shared.changed.notify_all();
    }

    /// Report line errors and raise an error event.
    pub fn raise_errors(&self, errors: CommErrors) {
        let mut st = self.shared.lock();
        st.errors |= errors;
        let mut events = EventMask::ERR;
        if errors.contains(CommErrors::BREAK) {
            events |= EventMask::BREAK;
        }
        st.fire(events);
    }

    /// Set the modem input lines.
    pub fn set_modem(&self, status: ModemStatus) {
        self.shared.lock().modem = status;
    }

    /// Make the next call to `point` fail.
    pub fn fail_next(&self, point: FailPoint) {
        self.shared.lock().failures.insert(point);
    }

    pub fn dtr(&self) -> bool {
        self.shared.lock().dtr
    }

    pub fn rts(&self) -> bool {
        self.shared.lock().rts
    }

    /// Number of completed break conditions.
    pub fn breaks_sent(&self) -> usize {
        self.shared.lock().breaks_sent
    }

    /// Control block last programmed.
    pub fn dcb(&self) -> Option<Dcb> {
        self.shared.lock().dcb
    }

    /// Timeout block last programmed.
    pub fn timeouts(&self) -> CommTimeouts {
        self.shared.lock().timeouts
    }

    /// Sizes passed to `setup_queues`.
    pub fn queue_sizes(&self) -> (u32, u32) {
        self.shared.lock().queue_sizes
    }

    pub fn stats(&self) -> NativeCallStats {
        self.shared.lock().stats
    }

    /// Bytes received and not yet read.
    pub fn pending_rx(&self) -> usize {
        self.shared.lock().rx.len()
    }

    pub fn is_open(&self) -> bool {
        self.shared.lock().open
    }
}

/// A simulated device handle.
#[derive(Debug)]
pub struct SimulatedComm {
    shared: Arc<Shared>,
    base_clock: Option<u32>,
}

impl CommDevice for SimulatedComm {
    fn setup_queues(&self, rx: u32, tx: u32) -> io::Result<()> {
        let mut st = self.shared.lock();
        st.fail(FailPoint::SetupQueues)?;
        st.queue_sizes = (rx, tx);
        Ok(())
    }

    fn set_state(&self, dcb: &Dcb) -> io::Result<()> {
        let mut st = self.shared.lock();
        st.stats.set_state += 1;
        st.fail(FailPoint::SetState)?;
        if !(5..=8).contains(&dcb.byte_size) || dcb.xon_lim == 0 || dcb.xoff_lim == 0 {
            return Err(io::Error::from(io::ErrorKind::InvalidInput));
        }
        st.dcb = Some(*dcb);
        Ok(())
    }

    fn set_timeouts(&self, timeouts: &CommTimeouts) -> io::Result<()> {
        let mut st = self.shared.lock();
        st.stats.set_timeouts += 1;
        st.fail(FailPoint::SetTimeouts)?;
        st.timeouts = *timeouts;
        Ok(())
    }

    fn clear_error(&self) -> io::Result<ComStat> {
        let mut st = self.shared.lock();
        Ok(ComStat {
            errors: std::mem::take(&mut st.errors),
            in_queue: st.rx.len() as u32,
            out_queue: st.tx_queue.len() as u32,
        })
    }

    fn read_async(&self, len: usize, done: CompletionHandle) -> io::Result<()> {
        let epoch = self.shared.lock().epoch;
        let shared = Arc::clone(&self.shared);
        thread::Builder::new()
            .name("sim-comm-read".into())
            .spawn(move || {
                let result = shared.read_blocking(len, epoch);
                done.complete(result.map(CompletionData::Read));
            })?;
        Ok(())
    }

    fn write_async(&self, data: Vec<u8>, done: CompletionHandle) -> io::Result<()> {
        let mut st = self.shared.lock();
        if st.loopback {
            st.receive(&data);
        }
        let n = data.len();
        if st.hold_tx {
            st.tx_queue.extend(data);
        } else {
            st.written.extend_from_slice(&data);
            if n > 0 {
                st.fire(EventMask::TXEMPTY);
            }
        }
        drop(st);
        self.shared.changed.notify_all();
        done.complete(Ok(CompletionData::Written(n)));
        Ok(())
    }

    fn set_event_mask(&self, mask: EventMask) -> io::Result<()> {
        let mut st = self.shared.lock();
        st.mask = mask;
        if let Some(watch) = st.pending_watch.take() {
            watch.complete(Ok(CompletionData::Event(EventMask::empty())));
        }
        Ok(())
    }

    fn wait_event_async(&self, done: CompletionHandle) -> io::Result<()> {
        let mut st = self.shared.lock();
        if st.mask.is_empty() || st.pending_watch.is_some() || !st.open {
            return Err(io::Error::from(io::ErrorKind::InvalidInput));
        }
        st.pending_watch = Some(done);
        Ok(())
    }

    fn cancel_io(&self) -> io::Result<()> {
        let mut st = self.shared.lock();
        st.stats.cancel_io += 1;
        st.abort_all();
        drop(st);
        self.shared.changed.notify_all();
        Ok(())
    }

    fn purge(&self, flags: PurgeFlags) -> io::Result<()> {
        let mut st = self.shared.lock();
        st.stats.purge += 1;
        if flags.contains(PurgeFlags::RXCLEAR) {
            st.rx.clear();
        }
        if flags.contains(PurgeFlags::TXCLEAR) {
            st.tx_queue.clear();
        }
        if flags.intersects(PurgeFlags::RXABORT | PurgeFlags::TXABORT) {
            st.abort_all();
        }
        drop(st);
        self.shared.changed.notify_all();
        Ok(())
    }

    fn flush(&self) -> io::Result<()> {
        let mut st = self.shared.lock();
        let epoch = st.epoch;
        while !st.tx_queue.is_empty() {
            if st.epoch != epoch || !st.open {
                return Err(aborted());
            }
            self.shared.changed.wait(&mut st);
        }
        Ok(())
    }

    fn escape(&self, function: EscapeFunction) -> io::Result<()> {
        let mut st = self.shared.lock();
        match function {
            EscapeFunction::SetDtr => st.dtr = true,
            EscapeFunction::ClrDtr => st.dtr = false,
            EscapeFunction::SetRts => st.rts = true,
            EscapeFunction::ClrRts => st.rts = false,
            EscapeFunction::SetBreak => st.breaking = true,
            EscapeFunction::ClrBreak => st.breaking = false,
            EscapeFunction::SetXon | EscapeFunction::SetXoff => {}
        }
        Ok(())
    }

    fn modem_status(&self) -> io::Result<ModemStatus> {
        Ok(self.shared.lock().modem)
    }

    fn set_break(&self) -> io::Result<()> {
        self.shared.lock().breaking = true;
        Ok(())
    }

    fn clear_break(&self) -> io::Result<()> {
        let mut st = self.shared.lock();
        if st.breaking {
            st.breaks_sent += 1;
        }
        st.breaking = false;
        Ok(())
    }

    fn base_clock(&self) -> Option<u32> {
        self.base_clock
    }

    fn close(&self) -> io::Result<()> {
        let mut st = self.shared.lock();
        st.open = false;
        st.abort_all();
        st.mask = EventMask::empty();
        drop(st);
        self.shared.changed.notify_all();
        Ok(())
    }
}

/// Driver for [`SimulatedComm`] devices.
#[derive(Debug, Default)]
pub struct SimulatedDriver {
    lines: Mutex<HashMap<String, SimulatedLine>>,
    base_clock: Option<u32>,
}

impl SimulatedDriver {
    /// A driver with no lines; devices report no base clock.
    pub fn new() -> Self {
        Self::default()
    }

    /// A driver whose devices report `base` as their UART clock.
    pub fn with_base_clock(base: u32) -> Self {
        Self {
            base_clock: Some(base),
            ..Self::default()
        }
    }

    /// Create (or fetch) the line called `name`.
    pub fn add_line(&self, name: &str) -> SimulatedLine {
        self.lines
            .lock()
            .entry(name.to_string())
            .or_default()
            .clone()
    }

    /// The line called `name`, if it exists.
    pub fn line(&self, name: &str) -> Option<SimulatedLine> {
        self.lines.lock().get(name).cloned()
    }
}

impl CommDriver for SimulatedDriver {
    type Device = SimulatedComm;

    fn open(&self, name: &str) -> io::Result<SimulatedComm> {
        let line = self
            .line(name)
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, name.to_string()))?;
        let mut st = line.shared.lock();
        st.fail(FailPoint::Open)?;
        if st.open {
            return Err(io::Error::new(
                io::ErrorKind::PermissionDenied,
                format!("{} is already open", name),
            ));
        }
        st.open = true;
        st.mask = EventMask::empty();
        st.dtr = true;
        st.rts = true;
        drop(st);
        Ok(SimulatedComm {
            shared: Arc::clone(&line.shared),
            base_clock: self.base_clock,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::super::native::{Completion, InFlight};
    use super::*;
    use std::sync::mpsc;

    fn device() -> (SimulatedLine, SimulatedComm) {
        let driver = SimulatedDriver::new();
        let line = driver.add_line("SIM0");
        let dev = driver.open("SIM0").unwrap();
        (line, dev)
    }

    fn handle(token: usize) -> (CompletionHandle, mpsc::Receiver<Completion>) {
        let in_flight = Arc::new(InFlight::default());
        let (tx, rx) = mpsc::channel();
        (CompletionHandle::new(token, tx, in_flight.begin()), rx)
    }

    fn read_result(rx: &mpsc::Receiver<Completion>) -> io::Result<Vec<u8>> {
        match rx.recv_timeout(Duration::from_secs(5)).unwrap() {
            Completion::Finished { result, .. } => result.map(|d| match d {
                CompletionData::Read(bytes) => bytes,
                other => panic!("expected read data, got {:?}", other),
            }),
            other => panic!("unexpected {:?}", other),
        }
    }

    fn set_timeouts(dev: &SimulatedComm, interval: u32, constant: u32, multiplier: u32) {
        dev.set_timeouts(&CommTimeouts {
            read_interval: interval,
            read_total_constant: constant,
            read_total_multiplier: multiplier,
            ..CommTimeouts::default()
        })
        .unwrap();
    }

    #[test]
    fn test_open_twice_is_refused() {
        let driver = SimulatedDriver::new();
        driver.add_line("SIM0");
        let _dev = driver.open("SIM0").unwrap();
        assert_eq!(
            driver.open("SIM0").unwrap_err().kind(),
            io::ErrorKind::PermissionDenied
        );
        assert_eq!(driver.open("SIM9").unwrap_err().kind(), io::ErrorKind::NotFound);
    }

    #[test]
    fn test_immediate_read_returns_queued() {
        let (line, dev) = device();
        set_timeouts(&dev, MAXDWORD, 0, 0);
        line.inject(b"abc");
        let (done, rx) = handle(0);
        dev.read_async(8, done).unwrap();
        assert_eq!(read_result(&rx).unwrap(), b"abc");

        let (done, rx) = handle(0);
        dev.read_async(8, done).unwrap();
        assert!(read_result(&rx).unwrap().is_empty());
    }

    #[test]
    fn test_wait_any_read_times_out() {
        let (_line, dev) = device();
        set_timeouts(&dev, MAXDWORD, 100, MAXDWORD);
        let (done, rx) = handle(0);
        let start = Instant::now();
        dev.read_async(8, done).unwrap();
        assert!(read_result(&rx).unwrap().is_empty());
        assert!(start.elapsed() >= Duration::from_millis(100));
    }

    #[test]
    fn test_wait_any_read_returns_first_arrival() {
        let (line, dev) = device();
        set_timeouts(&dev, MAXDWORD, 2000, MAXDWORD);
        let (done, rx) = handle(0);
        dev.read_async(8, done).unwrap();
        thread::sleep(Duration::from_millis(30));
        line.inject(b"xy");
        assert_eq!(read_result(&rx).unwrap(), b"xy");
    }

    #[test]
    fn test_watch_ignores_data_queued_before_arming() {
        let (line, dev) = device();
        line.inject(b"old");
        dev.set_event_mask(EventMask::RXCHAR).unwrap();
        let (done, rx) = handle(4);
        dev.wait_event_async(done).unwrap();
        assert!(rx.recv_timeout(Duration::from_millis(50)).is_err());

        line.inject(b"new");
        match rx.recv_timeout(Duration::from_secs(1)).unwrap() {
            Completion::Finished {
                token: 4,
                result: Ok(CompletionData::Event(mask)),
            } => assert_eq!(mask, EventMask::RXCHAR),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_mask_change_completes_watch() {
        let (_line, dev) = device();
        dev.set_event_mask(EventMask::RXCHAR).unwrap();
        let (done, rx) = handle(1);
        dev.wait_event_async(done).unwrap();
        dev.set_event_mask(EventMask::empty()).unwrap();
        match rx.recv_timeout(Duration::from_secs(1)).unwrap() {
            Completion::Finished {
                result: Ok(CompletionData::Event(mask)),
                ..
            } => assert!(mask.is_empty()),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_cancel_aborts_blocking_read() {
        let (_line, dev) = device();
        set_timeouts(&dev, 0, 0, 0);
        let (done, rx) = handle(0);
        dev.read_async(4, done).unwrap();
        thread::sleep(Duration::from_millis(20));
        dev.cancel_io().unwrap();
        let err = read_result(&rx).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::Interrupted);
        assert_eq!(dev_stats(&dev).cancel_io, 1);
    }

    fn dev_stats(dev: &SimulatedComm) -> NativeCallStats {
        dev.shared.lock().stats
    }

    #[test]
    fn test_held_tx_and_loopback() {
        let (line, dev) = device();
        line.hold_tx(true);
        line.set_loopback(true);
        let (done, _rx) = handle(0);
        dev.write_async(b"ping".to_vec(), done).unwrap();

        let stat = dev.clear_error().unwrap();
        assert_eq!((stat.in_queue, stat.out_queue), (4, 4));
        assert!(line.take_written().is_empty());

        line.release_tx();
        assert_eq!(dev.clear_error().unwrap().out_queue, 0);
        assert_eq!(line.take_written(), b"ping");
    }

    #[test]
    fn test_injected_failures_and_errors() {
        let (line, dev) = device();
        line.fail_next(FailPoint::SetTimeouts);
        assert!(dev.set_timeouts(&CommTimeouts::default()).is_err());
        assert!(dev.set_timeouts(&CommTimeouts::default()).is_ok());

        line.raise_errors(CommErrors::FRAME);
        assert_eq!(dev.clear_error().unwrap().errors, CommErrors::FRAME);
        assert!(dev.clear_error().unwrap().errors.is_empty());
    }
}
