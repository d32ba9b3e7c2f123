//! The overlapped COMM model the emulation layer is written against.
//!
//! [`CommDevice`] is deliberately shaped like the Win32 serial API:
//! a device control block, a timeout block, queue/error inspection, event
//! masks and asynchronous read/write/wait operations that finish by posting
//! a [`Completion`] to a channel. The real driver lives in `win32.rs`; an
//! in-memory one in `simulated.rs`.

use crate::termios::CommTimeouts;
use bitflags::bitflags;
use parking_lot::{Condvar, Mutex};
use std::fmt;
use std::io;
use std::sync::mpsc::Sender;
use std::sync::Arc;
use std::time::Duration;

/// Standard rates the COMM driver accepts verbatim (`CBR_*`). Each constant
/// equals its rate.
pub const STANDARD_RATES: &[(u32, u32)] = &[
    (110, 110),
    (300, 300),
    (600, 600),
    (1200, 1200),
    (2400, 2400),
    (4800, 4800),
    (9600, 9600),
    (14400, 14400),
    (19200, 19200),
    (38400, 38400),
    (57600, 57600),
    (115200, 115200),
    (128000, 128000),
    (256000, 256000),
];

bitflags! {
    /// Bit-field word of the device control block.
    ///
    /// Bit positions match the native `DCB` bit fields, so `bits()` can be
    /// stored into it unchanged.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct DcbFlags: u32 {
        const BINARY = 0x0001;
        const PARITY = 0x0002;
        const OUTX_CTS_FLOW = 0x0004;
        const OUTX_DSR_FLOW = 0x0008;
        const DTR_CONTROL_ENABLE = 0x0010;
        const DTR_CONTROL_HANDSHAKE = 0x0020;
        const DSR_SENSITIVITY = 0x0040;
        const TX_CONTINUE_ON_XOFF = 0x0080;
        const OUTX = 0x0100;
        const INX = 0x0200;
        const ERROR_CHAR = 0x0400;
        const NULL = 0x0800;
        const RTS_CONTROL_ENABLE = 0x1000;
        const RTS_CONTROL_HANDSHAKE = 0x2000;
        const ABORT_ON_ERROR = 0x4000;
    }
}

/// Parity encoding of the control block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(u8)]
pub enum NativeParity {
    #[default]
    None = 0,
    Odd = 1,
    Even = 2,
    Mark = 3,
    Space = 4,
}

/// Stop-bit encoding of the control block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(u8)]
pub enum NativeStopBits {
    #[default]
    One = 0,
    OnePointFive = 1,
    Two = 2,
}

/// Device control block: everything the driver needs to frame bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Dcb {
    pub baud_rate: u32,
    pub flags: DcbFlags,
    pub xon_lim: u16,
    pub xoff_lim: u16,
    pub byte_size: u8,
    pub parity: NativeParity,
    pub stop_bits: NativeStopBits,
    pub xon_char: u8,
    pub xoff_char: u8,
    pub error_char: u8,
    pub eof_char: u8,
    pub evt_char: u8,
}

bitflags! {
    /// Line errors reported (and cleared) by [`CommDevice::clear_error`].
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct CommErrors: u32 {
        const RXOVER = 0x0001;
        const OVERRUN = 0x0002;
        const RXPARITY = 0x0004;
        const FRAME = 0x0008;
        const BREAK = 0x0010;
    }
}

/// Queue and error snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ComStat {
    pub errors: CommErrors,
    /// Bytes received and not yet read.
    pub in_queue: u32,
    /// Bytes written and not yet transmitted.
    pub out_queue: u32,
}

bitflags! {
    /// Events an armed watch can report.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct EventMask: u32 {
        const RXCHAR = 0x0001;
        const RXFLAG = 0x0002;
        const TXEMPTY = 0x0004;
        const CTS = 0x0008;
        const DSR = 0x0010;
        const RLSD = 0x0020;
        const BREAK = 0x0040;
        const ERR = 0x0080;
        const RING = 0x0100;
    }
}

bitflags! {
    /// Which queues [`CommDevice::purge`] discards or aborts.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct PurgeFlags: u32 {
        const TXABORT = 0x0001;
        const RXABORT = 0x0002;
        const TXCLEAR = 0x0004;
        const RXCLEAR = 0x0008;
    }
}

bitflags! {
    /// Modem input lines.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct ModemStatus: u32 {
        const CTS_ON = 0x0010;
        const DSR_ON = 0x0020;
        const RING_ON = 0x0040;
        const RLSD_ON = 0x0080;
    }
}

/// Extended functions of [`CommDevice::escape`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum EscapeFunction {
    SetXoff = 1,
    SetXon = 2,
    SetRts = 3,
    ClrRts = 4,
    SetDtr = 5,
    ClrDtr = 6,
    SetBreak = 8,
    ClrBreak = 9,
}

/// Payload of a finished asynchronous operation.
#[derive(Debug)]
pub enum CompletionData {
    /// Bytes a read produced (possibly none, on timeout).
    Read(Vec<u8>),
    /// Bytes a write transferred.
    Written(usize),
    /// Events a watch observed; empty when the mask was changed under it.
    Event(EventMask),
}

/// Message delivered on a completion channel.
#[derive(Debug)]
pub enum Completion {
    /// A native operation finished.
    Finished {
        token: usize,
        result: io::Result<CompletionData>,
    },
    /// The port was closed while a multiplexer was waiting on it.
    PortClosed { token: usize },
}

/// The error an operation completes with when it is cancelled.
pub fn aborted() -> io::Error {
    io::Error::new(io::ErrorKind::Interrupted, "I/O operation aborted")
}

/// Counts native operations still outstanding on one port.
#[derive(Debug, Default)]
pub struct InFlight {
    count: Mutex<usize>,
    idle: Condvar,
}

impl InFlight {
    /// Register one outstanding operation.
    pub fn begin(self: &Arc<Self>) -> OpGuard {
        *self.count.lock() += 1;
        OpGuard(Arc::clone(self))
    }

    /// Operations currently outstanding.
    pub fn outstanding(&self) -> usize {
        *self.count.lock()
    }

    /// Block until nothing is outstanding, calling `slow` with the remaining
    /// count every `warn_every`.
    pub fn wait_idle(&self, warn_every: Duration, mut slow: impl FnMut(usize)) {
        let mut count = self.count.lock();
        while *count > 0 {
            if self.idle.wait_for(&mut count, warn_every).timed_out() && *count > 0 {
                slow(*count);
            }
        }
    }
}

/// Keeps its [`InFlight`] counter raised until dropped.
pub struct OpGuard(Arc<InFlight>);

impl Drop for OpGuard {
    fn drop(&mut self) {
        let mut count = self.0.count.lock();
        *count = count.saturating_sub(1);
        if *count == 0 {
            self.0.idle.notify_all();
        }
    }
}

impl fmt::Debug for OpGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("OpGuard")
    }
}

/// Where and how a device reports one asynchronous operation.
///
/// Consuming [`complete`](Self::complete) posts the result and only then
/// releases the in-flight registration, so a closing port never frees the
/// device while a completion is still on its way.
#[derive(Debug)]
pub struct CompletionHandle {
    token: usize,
    sink: Sender<Completion>,
    _op: OpGuard,
}

impl CompletionHandle {
    pub fn new(token: usize, sink: Sender<Completion>, op: OpGuard) -> Self {
        Self {
            token,
            sink,
            _op: op,
        }
    }

    /// Token chosen by the submitter.
    pub fn token(&self) -> usize {
        self.token
    }

    /// Deliver the outcome. A receiver that went away is not an error.
    pub fn complete(self, result: io::Result<CompletionData>) {
        let _ = self.sink.send(Completion::Finished {
            token: self.token,
            result,
        });
    }
}

/// One open serial device.
///
/// Synchronous methods return once the driver has acted. The `*_async`
/// methods return as soon as the request is queued and later call
/// [`CompletionHandle::complete`] exactly once, unless they fail to queue.
pub trait CommDevice: Send + Sync + fmt::Debug {
    /// Size the driver's receive and transmit queues.
    fn setup_queues(&self, rx: u32, tx: u32) -> io::Result<()>;

    /// Program framing, speed and flow control.
    fn set_state(&self, dcb: &Dcb) -> io::Result<()>;

    /// Program read/write timeouts for subsequent reads.
    fn set_timeouts(&self, timeouts: &CommTimeouts) -> io::Result<()>;

    /// Snapshot queue counters and take the pending line errors.
    fn clear_error(&self) -> io::Result<ComStat>;

    /// Read up to `len` bytes under the current timeouts.
    fn read_async(&self, len: usize, done: CompletionHandle) -> io::Result<()>;

    /// Queue `data` for transmission.
    fn write_async(&self, data: Vec<u8>, done: CompletionHandle) -> io::Result<()>;

    /// Replace the event mask. A pending watch completes with an empty mask.
    fn set_event_mask(&self, mask: EventMask) -> io::Result<()>;

    /// Complete `done` on the next masked event that happens after this call.
    fn wait_event_async(&self, done: CompletionHandle) -> io::Result<()>;

    /// Abort every outstanding operation; each completes with [`aborted`].
    fn cancel_io(&self) -> io::Result<()>;

    /// Discard or abort queued data.
    fn purge(&self, flags: PurgeFlags) -> io::Result<()>;

    /// Block until the transmit queue is empty.
    fn flush(&self) -> io::Result<()>;

    /// Drive an output line or flow-control state.
    fn escape(&self, function: EscapeFunction) -> io::Result<()>;

    /// Current modem input lines.
    fn modem_status(&self) -> io::Result<ModemStatus>;

    /// Start transmitting a break.
    fn set_break(&self) -> io::Result<()>;

    /// Stop transmitting a break.
    fn clear_break(&self) -> io::Result<()>;

    /// The UART base clock, when the driver knows it.
    fn base_clock(&self) -> Option<u32>;

    /// Release the device. Called once nothing is outstanding.
    fn close(&self) -> io::Result<()>;
}

/// Opens [`CommDevice`]s by name.
pub trait CommDriver: Send + Sync + fmt::Debug {
    type Device: CommDevice + 'static;

    /// Open the device called `name`.
    fn open(&self, name: &str) -> io::Result<Self::Device>;
}
