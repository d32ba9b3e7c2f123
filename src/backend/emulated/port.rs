//! Per-descriptor state of the emulated backend.

use super::mapping::Applied;
use super::native::{CommDevice, Completion, InFlight, OpGuard};
use crate::backend::{ModemLines, OpenFlags};
use crate::error::{Result, TermiosError};
use crate::termios::Termios;
use crate::Fd;
use parking_lot::{Condvar, Mutex, MutexGuard};
use std::io;
use std::sync::mpsc::Sender;
use std::sync::Arc;

/// Mutable port state. Its lock is also the submission lock: native
/// operations are only queued while holding it and after checking `closed`.
#[derive(Debug)]
pub(crate) struct PortState {
    pub termios: Termios,
    pub flags: OpenFlags,
    pub applied: Applied,
    /// Cached DTR/RTS levels; the driver cannot report its own outputs.
    pub outputs: ModemLines,
    pub closed: bool,
    watchers: Vec<(usize, Sender<Completion>)>,
}

/// One open device.
#[derive(Debug)]
pub(crate) struct Port<D> {
    pub fd: Fd,
    pub name: String,
    pub device: D,
    state: Mutex<PortState>,
    /// Serializes configuration sequences (drain, apply) against each other.
    pub config: Mutex<()>,
    pub read_lane: Mutex<()>,
    pub write_lane: Mutex<()>,
    watching: Mutex<bool>,
    watch_released: Condvar,
    in_flight: Arc<InFlight>,
}

impl<D: CommDevice> Port<D> {
    pub fn new(
        fd: Fd,
        name: impl Into<String>,
        device: D,
        flags: OpenFlags,
        termios: Termios,
        applied: Applied,
    ) -> Self {
        Self {
            fd,
            name: name.into(),
            device,
            state: Mutex::new(PortState {
                termios,
                flags,
                applied,
                outputs: ModemLines::OUTPUTS,
                closed: false,
                watchers: Vec::new(),
            }),
            config: Mutex::new(()),
            read_lane: Mutex::new(()),
            write_lane: Mutex::new(()),
            watching: Mutex::new(false),
            watch_released: Condvar::new(),
            in_flight: Arc::new(InFlight::default()),
        }
    }

    /// Start an operation on this port. The guard keeps `close` from
    /// releasing the device until the operation is over.
    pub fn enter(&self) -> Result<OpGuard> {
        let state = self.state.lock();
        if state.closed {
            return Err(TermiosError::InvalidDescriptor(self.fd));
        }
        Ok(self.in_flight.begin())
    }

    /// Lock the mutable state of an open port.
    pub fn state(&self) -> Result<MutexGuard<'_, PortState>> {
        let state = self.state.lock();
        if state.closed {
            return Err(TermiosError::InvalidDescriptor(self.fd));
        }
        Ok(state)
    }

    /// Queue an asynchronous native operation unless the port is closing.
    pub fn submit(&self, issue: impl FnOnce(&D, OpGuard) -> io::Result<()>) -> Result<()> {
        let state = self.state.lock();
        if state.closed {
            return Err(TermiosError::Interrupted("port closed"));
        }
        let guard = self.in_flight.begin();
        let result = issue(&self.device, guard);
        drop(state);
        result.map_err(TermiosError::from_native)
    }

    /// Take the multiplex lock, waiting for another `select`/`poll` on this
    /// port to finish.
    pub fn lock_watch(self: &Arc<Self>) -> WatchGuard<D> {
        let mut watching = self.watching.lock();
        while *watching {
            self.watch_released.wait(&mut watching);
        }
        *watching = true;
        WatchGuard {
            port: Arc::clone(self),
        }
    }

    /// Have `sink` told with `PortClosed { token }` if the port closes.
    pub fn add_watcher(&self, token: usize, sink: Sender<Completion>) -> Result<()> {
        let mut state = self.state()?;
        state.watchers.push((token, sink));
        Ok(())
    }

    pub fn remove_watcher(&self, token: usize) {
        self.state.lock().watchers.retain(|(t, _)| *t != token);
    }

    /// First half of close: refuse new work, wake multiplexers and abort
    /// everything the device still has queued.
    pub fn shut(&self) {
        let mut state = self.state.lock();
        state.closed = true;
        for (token, sink) in state.watchers.drain(..) {
            let _ = sink.send(Completion::PortClosed { token });
        }
        if let Err(e) = self.device.cancel_io() {
            tracing::warn!("{}: cancelling outstanding I/O failed: {}", self.name, e);
        }
    }

    pub fn in_flight(&self) -> &InFlight {
        &self.in_flight
    }
}

/// Holds a port's multiplex lock.
pub(crate) struct WatchGuard<D: CommDevice> {
    port: Arc<Port<D>>,
}

impl<D: CommDevice> WatchGuard<D> {
    pub fn port(&self) -> &Arc<Port<D>> {
        &self.port
    }
}

impl<D: CommDevice> Drop for WatchGuard<D> {
    fn drop(&mut self) {
        *self.port.watching.lock() = false;
        self.port.watch_released.notify_one();
    }
}
