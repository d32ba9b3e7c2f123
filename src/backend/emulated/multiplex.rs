//! `select()` and `poll()` over overlapped COMM devices.
//!
//! Native event watches only report activity that happens after they are
//! armed, so every wait starts with a direct queue inspection, arms one
//! watch per port, inspects again to cover the arming window, and only then
//! sleeps on the shared completion channel.
//!
//! Per watched port: Idle -> Armed -> (Signaled | TimedOut | Cancelled).
//! Cancelled means the port was closed under the wait; the call then
//! reports zero ready descriptors.

use super::native::{CommDevice, Completion, CompletionHandle, EventMask};
use super::port::{Port, WatchGuard};
use crate::error::{Result, TermiosError};
use crate::fdset::{poll_timeout, FdSet, PollEvents, PollFd, TimeVal, FD_SETSIZE};
use crate::registry::PortRegistry;
use crate::Fd;
use bitflags::bitflags;
use std::collections::BTreeMap;
use std::io;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, trace, warn};

bitflags! {
    /// Conditions a caller waits for on one port, and those found ready.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub(crate) struct Interest: u8 {
        const READ = 0x1;
        const WRITE = 0x2;
        const EXCEPT = 0x4;
    }
}

impl Interest {
    fn event_mask(self) -> EventMask {
        let mut mask = EventMask::empty();
        if self.contains(Self::READ) {
            mask |= EventMask::RXCHAR;
        }
        if self.contains(Self::WRITE) {
            mask |= EventMask::TXEMPTY;
        }
        if self.contains(Self::EXCEPT) {
            mask |= EventMask::ERR | EventMask::BREAK;
        }
        mask
    }
}

/// How a wait ended.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Outcome {
    /// Readiness per watched port, in the order given.
    Ready(Vec<Interest>),
    /// A watched port was closed.
    Cancelled,
}

/// Current readiness of one port, or `None` once it is closing.
fn readiness<D: CommDevice>(
    port: &Port<D>,
    want: Interest,
    tx_capacity: u32,
) -> Result<Option<Interest>> {
    let Ok(_op) = port.enter() else {
        return Ok(None);
    };
    let stat = port
        .device
        .clear_error()
        .map_err(TermiosError::from_native)?;

    let mut ready = Interest::empty();
    if stat.in_queue > 0 {
        ready |= Interest::READ;
    }
    if stat.out_queue < tx_capacity {
        ready |= Interest::WRITE;
    }
    if !stat.errors.is_empty() {
        trace!("{}: line errors {:?}", port.name, stat.errors);
        ready |= Interest::EXCEPT;
    }
    Ok(Some(ready & want))
}

fn scan<D: CommDevice>(
    watched: &[(Arc<Port<D>>, Interest)],
    tx_capacity: u32,
) -> Result<Option<Vec<Interest>>> {
    let mut out = Vec::with_capacity(watched.len());
    for (port, want) in watched {
        match readiness(port, *want, tx_capacity)? {
            Some(ready) => out.push(ready),
            None => return Ok(None),
        }
    }
    Ok(Some(out))
}

fn any_ready(ready: &[Interest]) -> bool {
    ready.iter().any(|r| !r.is_empty())
}

/// Wait until a watched port is ready, the timeout passes, or a port closes.
///
/// The caller holds every port's watch lock.
pub(crate) fn wait<D: CommDevice>(
    watched: &[(Arc<Port<D>>, Interest)],
    timeout: Option<Duration>,
    tx_capacity: u32,
) -> Result<Outcome> {
    // Too far out to represent means no deadline at all.
    let deadline = timeout.and_then(|t| Instant::now().checked_add(t));

    let Some(ready) = scan(watched, tx_capacity)? else {
        return Ok(Outcome::Cancelled);
    };
    if any_ready(&ready) || timeout == Some(Duration::ZERO) {
        return Ok(Outcome::Ready(ready));
    }

    let (tx, rx) = mpsc::channel();
    let mut set = ArmedSet {
        watched,
        engaged: vec![false; watched.len()],
        tx: Some(tx),
        rx,
    };
    set.run(deadline, tx_capacity)
}

/// Watches armed by one wait. Dropping it disarms them and waits for their
/// completions, so no watch outlives the call.
struct ArmedSet<'a, D: CommDevice> {
    watched: &'a [(Arc<Port<D>>, Interest)],
    /// Mask programmed and close notification registered.
    engaged: Vec<bool>,
    tx: Option<Sender<Completion>>,
    rx: Receiver<Completion>,
}

impl<D: CommDevice> ArmedSet<'_, D> {
    fn sender(&self) -> Result<Sender<Completion>> {
        self.tx
            .clone()
            .ok_or(TermiosError::Interrupted("multiplex wait finished"))
    }

    /// Arm a watch on port `idx`. `false` means the port is closing.
    fn arm(&mut self, idx: usize) -> Result<bool> {
        let watched = self.watched;
        let (port, want) = &watched[idx];

        if !self.engaged[idx] {
            match port.add_watcher(idx, self.sender()?) {
                Ok(()) => {}
                Err(TermiosError::InvalidDescriptor(_)) => return Ok(false),
                Err(e) => return Err(e),
            }
            self.engaged[idx] = true;
            let Ok(_op) = port.enter() else {
                return Ok(false);
            };
            port.device
                .set_event_mask(want.event_mask())
                .map_err(TermiosError::from_native)?;
        }

        let sink = self.sender()?;
        match port.submit(|device, op| device.wait_event_async(CompletionHandle::new(idx, sink, op)))
        {
            Ok(()) => Ok(true),
            Err(TermiosError::Interrupted(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    fn run(&mut self, deadline: Option<Instant>, tx_capacity: u32) -> Result<Outcome> {
        for idx in 0..self.watched.len() {
            if !self.arm(idx)? {
                return Ok(Outcome::Cancelled);
            }
        }

        // Data that arrived while arming raised no event.
        match scan(self.watched, tx_capacity)? {
            None => return Ok(Outcome::Cancelled),
            Some(ready) if any_ready(&ready) => return Ok(Outcome::Ready(ready)),
            Some(_) => {}
        }

        loop {
            let message = match deadline {
                Some(at) => self
                    .rx
                    .recv_timeout(at.saturating_duration_since(Instant::now())),
                None => self.rx.recv().map_err(|_| RecvTimeoutError::Disconnected),
            };

            let token = match message {
                Ok(Completion::PortClosed { token }) => {
                    debug!("{}: closed during wait", self.watched[token].0.name);
                    return Ok(Outcome::Cancelled);
                }
                Ok(Completion::Finished { token, result }) => match result {
                    Ok(_) => token,
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => {
                        return Ok(Outcome::Cancelled)
                    }
                    Err(e) => return Err(TermiosError::from_native(e)),
                },
                Err(RecvTimeoutError::Timeout) => {
                    // A completion may have raced the deadline.
                    return Ok(match scan(self.watched, tx_capacity)? {
                        Some(ready) => Outcome::Ready(ready),
                        None => Outcome::Cancelled,
                    });
                }
                Err(RecvTimeoutError::Disconnected) => return Ok(Outcome::Cancelled),
            };

            let watched = self.watched;
            let (port, want) = &watched[token];
            match readiness(port, *want, tx_capacity)? {
                None => return Ok(Outcome::Cancelled),
                Some(ready) if !ready.is_empty() => {
                    return Ok(match scan(self.watched, tx_capacity)? {
                        Some(ready) => Outcome::Ready(ready),
                        None => Outcome::Cancelled,
                    });
                }
                Some(_) => {
                    trace!("{}: event without readiness, re-arming", port.name);
                    if !self.arm(token)? {
                        return Ok(Outcome::Cancelled);
                    }
                }
            }
        }
    }
}

impl<D: CommDevice> Drop for ArmedSet<'_, D> {
    fn drop(&mut self) {
        for (idx, (port, _)) in self.watched.iter().enumerate() {
            if !self.engaged[idx] {
                continue;
            }
            if let Ok(_op) = port.enter() {
                // Changing the mask completes a pending watch.
                if let Err(e) = port.device.set_event_mask(EventMask::empty()) {
                    warn!("{}: clearing event mask failed: {}", port.name, e);
                    if let Err(e) = port.device.cancel_io() {
                        warn!("{}: cancelling watch failed: {}", port.name, e);
                    }
                }
            }
            port.remove_watcher(idx);
        }

        // Every remaining sender belongs to an outstanding watch.
        self.tx = None;
        while let Ok(message) = self.rx.recv() {
            trace!("drained {:?}", message);
        }
    }
}

/// Resolve and watch-lock `fds` in ascending order.
fn lock_ports<D: CommDevice>(
    registry: &PortRegistry<Port<D>>,
    fds: &BTreeMap<Fd, Interest>,
) -> Result<(Vec<WatchGuard<D>>, Vec<(Arc<Port<D>>, Interest)>)> {
    let ports = fds
        .iter()
        .map(|(&fd, &want)| registry.resolve(fd).map(|port| (port, want)))
        .collect::<Result<Vec<_>>>()?;
    let guards = ports.iter().map(|(port, _)| port.lock_watch()).collect();
    Ok((guards, ports))
}

fn collect(set: &Option<&mut FdSet>, nfds: usize, flag: Interest, into: &mut BTreeMap<Fd, Interest>) {
    if let Some(set) = set {
        for fd in set.iter_below(nfds) {
            *into.entry(fd).or_default() |= flag;
        }
    }
}

fn publish(set: Option<&mut FdSet>, flag: Interest, ready: &[(Fd, Interest)]) -> usize {
    let Some(set) = set else {
        return 0;
    };
    set.zero();
    let mut count = 0;
    for (fd, r) in ready {
        if r.contains(flag) {
            set.set(*fd);
            count += 1;
        }
    }
    count
}

/// `select()` over ports in `registry`.
pub(crate) fn select<D: CommDevice>(
    registry: &PortRegistry<Port<D>>,
    tx_capacity: u32,
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
    let timeout = timeout.map(TimeVal::checked_duration).transpose()?;

    let mut wanted = BTreeMap::new();
    collect(&read, nfds, Interest::READ, &mut wanted);
    collect(&write, nfds, Interest::WRITE, &mut wanted);
    collect(&except, nfds, Interest::EXCEPT, &mut wanted);

    if wanted.is_empty() {
        let Some(timeout) = timeout else {
            return Err(TermiosError::invalid(
                "select with no descriptors and no timeout",
            ));
        };
        thread::sleep(timeout);
        return Ok(0);
    }

    let (_guards, ports) = lock_ports(registry, &wanted)?;
    let ready: Vec<(Fd, Interest)> = match wait(&ports, timeout, tx_capacity)? {
        Outcome::Ready(ready) => wanted.keys().copied().zip(ready).collect(),
        Outcome::Cancelled => Vec::new(),
    };

    Ok(publish(read, Interest::READ, &ready)
        + publish(write, Interest::WRITE, &ready)
        + publish(except, Interest::EXCEPT, &ready))
}

/// `poll()` over ports in `registry`. Errors are always reported.
pub(crate) fn poll<D: CommDevice>(
    registry: &PortRegistry<Port<D>>,
    tx_capacity: u32,
    fds: &mut [PollFd],
    timeout_ms: i32,
) -> Result<usize> {
    let mut wanted = BTreeMap::new();
    let mut invalid = 0;
    for entry in fds.iter_mut() {
        entry.revents = PollEvents::empty();
        if entry.fd < 0 {
            continue;
        }
        if registry.resolve(entry.fd).is_err() {
            entry.revents = PollEvents::POLLNVAL;
            invalid += 1;
            continue;
        }
        let mut want = Interest::EXCEPT;
        if entry.events.contains(PollEvents::POLLIN) {
            want |= Interest::READ;
        }
        if entry.events.contains(PollEvents::POLLOUT) {
            want |= Interest::WRITE;
        }
        *wanted.entry(entry.fd).or_default() |= want;
    }
    // Invalid entries make poll return at once, after a scan of the rest.
    let timeout = if invalid > 0 {
        Some(Duration::ZERO)
    } else {
        poll_timeout(timeout_ms)
    };
    if wanted.is_empty() {
        if let Some(timeout) = timeout {
            thread::sleep(timeout);
        }
        return Ok(invalid);
    }

    // A close between the validity scan and locking reports POLLNVAL too.
    let (_guards, ports) = match lock_ports(registry, &wanted) {
        Ok(locked) => locked,
        Err(TermiosError::InvalidDescriptor(fd)) => {
            for entry in fds.iter_mut().filter(|e| e.fd == fd) {
                entry.revents = PollEvents::POLLNVAL;
            }
            return Ok(fds.iter().filter(|e| !e.revents.is_empty()).count());
        }
        Err(e) => return Err(e),
    };
    let ready: BTreeMap<Fd, Interest> = match wait(&ports, timeout, tx_capacity)? {
        Outcome::Ready(ready) => wanted.keys().copied().zip(ready).collect(),
        Outcome::Cancelled => BTreeMap::new(),
    };

    for entry in fds.iter_mut().filter(|e| e.fd >= 0) {
        let Some(r) = ready.get(&entry.fd) else {
            continue;
        };
        if r.contains(Interest::READ) && entry.events.contains(PollEvents::POLLIN) {
            entry.revents |= PollEvents::POLLIN;
        }
        if r.contains(Interest::WRITE) && entry.events.contains(PollEvents::POLLOUT) {
            entry.revents |= PollEvents::POLLOUT;
        }
        if r.contains(Interest::EXCEPT) {
            entry.revents |= PollEvents::POLLERR;
        }
    }
    Ok(fds.iter().filter(|e| !e.revents.is_empty()).count())
}
