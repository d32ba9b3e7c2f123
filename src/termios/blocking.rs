//! VMIN/VTIME blocking-mode policy.
//!
//! POSIX non-canonical reads are governed by two control characters. Hosts
//! without termios express read blocking as a timeout triple
//! (inter-byte interval, total constant, total per-byte multiplier); this
//! module derives that triple and plans how many bytes a read should ask for.

use std::time::Duration;

/// "Infinite" / "return immediately" sentinel of the native timeout model.
pub const MAXDWORD: u32 = u32::MAX;

/// Native read/write timeout block, all values in milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct CommTimeouts {
    /// Maximum gap between two received bytes.
    pub read_interval: u32,
    /// Per-byte component of the total read timeout.
    pub read_total_multiplier: u32,
    /// Constant component of the total read timeout.
    pub read_total_constant: u32,
    /// Per-byte component of the total write timeout.
    pub write_total_multiplier: u32,
    /// Constant component of the total write timeout.
    pub write_total_constant: u32,
}

/// The four non-canonical read disciplines.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadMode {
    /// VMIN=0, VTIME=0: return whatever is queued, possibly nothing.
    Poll,
    /// VMIN=0, VTIME>0: return as soon as anything arrives, or 0 after the timeout.
    Timed { timeout: Duration },
    /// VMIN>0, VTIME=0: block until `min` bytes arrive.
    Threshold { min: u8 },
    /// VMIN>0, VTIME>0: block for the first byte, then stop after `min`
    /// bytes or a `gap` of silence.
    ///
    /// Backends with only an inter-byte interval and a total timeout cannot
    /// express this exactly. The interval timeout plus a request length of
    /// `max(min, queued)` is used instead, so a read may return after the
    /// first `min` bytes even when more were about to arrive within `gap`.
    InterByte { min: u8, gap: Duration },
}

/// What a read should do before touching the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadPlan {
    /// Return this many bytes right away without a native request.
    Immediate(usize),
    /// Non-blocking descriptor with nothing queued.
    WouldBlock,
    /// Issue a native read for this many bytes.
    Issue(usize),
}

fn deciseconds(vtime: u8) -> Duration {
    Duration::from_millis(u64::from(vtime) * 100)
}

impl ReadMode {
    /// Classify a VMIN/VTIME pair.
    pub fn from_cc(vmin: u8, vtime: u8) -> Self {
        match (vmin, vtime) {
            (0, 0) => Self::Poll,
            (0, t) => Self::Timed {
                timeout: deciseconds(t),
            },
            (m, 0) => Self::Threshold { min: m },
            (m, t) => Self::InterByte {
                min: m,
                gap: deciseconds(t),
            },
        }
    }

    /// Whether the native timeout triple reproduces POSIX semantics exactly.
    pub fn is_exact(&self) -> bool {
        !matches!(self, Self::InterByte { .. })
    }

    /// The native timeout block for this mode. Writes never time out.
    pub fn comm_timeouts(&self) -> CommTimeouts {
        let (read_interval, read_total_constant, read_total_multiplier) = match *self {
            Self::Poll => (MAXDWORD, 0, 0),
            Self::Timed { timeout } => (MAXDWORD, millis(timeout), MAXDWORD),
            Self::Threshold { .. } => (0, 0, 0),
            Self::InterByte { gap, .. } => (millis(gap), 0, 0),
        };
        CommTimeouts {
            read_interval,
            read_total_multiplier,
            read_total_constant,
            write_total_multiplier: 0,
            write_total_constant: 0,
        }
    }

    /// Decide the native request length for a read of `requested` bytes
    /// when `queued` bytes are already waiting.
    pub fn plan(&self, requested: usize, queued: usize, nonblocking: bool) -> ReadPlan {
        if requested == 0 {
            return ReadPlan::Immediate(0);
        }
        if nonblocking {
            return match queued {
                0 => ReadPlan::WouldBlock,
                n => ReadPlan::Issue(n.min(requested)),
            };
        }
        match *self {
            Self::Poll if queued == 0 => ReadPlan::Immediate(0),
            Self::Poll => ReadPlan::Issue(queued.min(requested)),
            Self::Timed { .. } => ReadPlan::Issue(requested),
            Self::Threshold { min } | Self::InterByte { min, .. } => {
                ReadPlan::Issue(usize::from(min).max(queued).min(requested))
            }
        }
    }
}

fn millis(d: Duration) -> u32 {
    u32::try_from(d.as_millis()).unwrap_or(MAXDWORD - 1)
}
