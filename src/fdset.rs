//! Readiness sets for `select()` and `poll()`.

use crate::error::{Result, TermiosError};
use crate::Fd;
use bitflags::bitflags;
use std::time::Duration;

/// Largest descriptor count an [`FdSet`] can hold.
pub const FD_SETSIZE: usize = 1024;

const WORD_BITS: usize = 32;

const USEC_PER_SEC: i64 = 1_000_000;

/// Fixed-size descriptor bitset, the `fd_set` of `select()`.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct FdSet {
    bits: [u32; FD_SETSIZE / WORD_BITS],
}

impl Default for FdSet {
    fn default() -> Self {
        Self::new()
    }
}

impl FdSet {
    /// An empty set (`FD_ZERO`).
    pub const fn new() -> Self {
        Self {
            bits: [0; FD_SETSIZE / WORD_BITS],
        }
    }

    fn slot(fd: Fd) -> Option<(usize, u32)> {
        let idx = usize::try_from(fd).ok().filter(|&i| i < FD_SETSIZE)?;
        Some((idx / WORD_BITS, 1 << (idx % WORD_BITS)))
    }

    /// `FD_ZERO`.
    pub fn zero(&mut self) {
        self.bits = [0; FD_SETSIZE / WORD_BITS];
    }

    /// `FD_SET`. Out-of-range descriptors are ignored.
    pub fn set(&mut self, fd: Fd) {
        if let Some((word, mask)) = Self::slot(fd) {
            self.bits[word] |= mask;
        }
    }

    /// `FD_CLR`.
    pub fn clear(&mut self, fd: Fd) {
        if let Some((word, mask)) = Self::slot(fd) {
            self.bits[word] &= !mask;
        }
    }

    /// `FD_ISSET`.
    pub fn is_set(&self, fd: Fd) -> bool {
        Self::slot(fd).map_or(false, |(word, mask)| self.bits[word] & mask != 0)
    }

    /// True when no descriptor is set.
    pub fn is_empty(&self) -> bool {
        self.bits.iter().all(|w| *w == 0)
    }

    /// Number of descriptors set.
    pub fn count(&self) -> usize {
        self.bits.iter().map(|w| w.count_ones() as usize).sum()
    }

    /// Descriptors below `nfds` that are set, ascending.
    pub fn iter_below(&self, nfds: usize) -> impl Iterator<Item = Fd> + '_ {
        let limit = nfds.min(FD_SETSIZE);
        self.bits
            .iter()
            .enumerate()
            .filter(|(_, word)| **word != 0)
            .flat_map(|(w, word)| {
                (0..WORD_BITS)
                    .filter(move |b| *word & (1u32 << *b) != 0)
                    .map(move |b| w * WORD_BITS + b)
            })
            .take_while(move |idx| *idx < limit)
            .map(|idx| idx as Fd)
    }
}

impl std::fmt::Debug for FdSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_set().entries(self.iter_below(FD_SETSIZE)).finish()
    }
}

impl FromIterator<Fd> for FdSet {
    fn from_iter<I: IntoIterator<Item = Fd>>(iter: I) -> Self {
        let mut set = Self::new();
        for fd in iter {
            set.set(fd);
        }
        set
    }
}

bitflags! {
    /// Event bits of a [`PollFd`].
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct PollEvents: i16 {
        /// Data may be read without blocking.
        const POLLIN = 0x0001;
        /// Urgent data may be read.
        const POLLPRI = 0x0002;
        /// Data may be written without blocking.
        const POLLOUT = 0x0004;
        /// Error condition (output only).
        const POLLERR = 0x0008;
        /// Hang up (output only).
        const POLLHUP = 0x0010;
        /// Descriptor is not open (output only).
        const POLLNVAL = 0x0020;
    }
}

/// One entry of a `poll()` array.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollFd {
    /// Descriptor to watch; negative entries are skipped.
    pub fd: Fd,
    /// Requested events.
    pub events: PollEvents,
    /// Returned events, written by `poll()`.
    pub revents: PollEvents,
}

impl PollFd {
    /// Watch `fd` for `events`.
    pub fn new(fd: Fd, events: PollEvents) -> Self {
        Self {
            fd,
            events,
            revents: PollEvents::empty(),
        }
    }
}

/// Seconds plus microseconds, the `select()` timeout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct TimeVal {
    pub tv_sec: i64,
    pub tv_usec: i64,
}

impl TimeVal {
    /// Build from seconds and microseconds.
    pub fn new(tv_sec: i64, tv_usec: i64) -> Self {
        Self { tv_sec, tv_usec }
    }

    /// The timeout `select()` waits for, rejecting a negative field or
    /// `tv_usec` outside `0..1_000_000`.
    pub fn checked_duration(&self) -> Result<Duration> {
        if self.tv_sec < 0 || !(0..USEC_PER_SEC).contains(&self.tv_usec) {
            return Err(TermiosError::invalid(format!(
                "timeval {{ tv_sec: {}, tv_usec: {} }} out of range",
                self.tv_sec, self.tv_usec
            )));
        }
        Ok(self.to_duration())
    }

    /// Negative fields clamp to zero.
    pub fn to_duration(&self) -> Duration {
        let secs = u64::try_from(self.tv_sec).unwrap_or(0);
        let micros = u64::try_from(self.tv_usec).unwrap_or(0);
        Duration::from_secs(secs) + Duration::from_micros(micros)
    }
}

impl From<Duration> for TimeVal {
    fn from(d: Duration) -> Self {
        Self {
            tv_sec: d.as_secs() as i64,
            tv_usec: i64::from(d.subsec_micros()),
        }
    }
}

/// Convert a `poll()` millisecond timeout; negative means wait forever.
pub fn poll_timeout(timeout_ms: i32) -> Option<Duration> {
    u64::try_from(timeout_ms).ok().map(Duration::from_millis)
}
