//! Virtual descriptor table.
//!
//! Maps small integers to per-port state. Allocation takes the first free
//! slot, like the kernel's descriptor table. A slot that is still opening or
//! already closing is reserved: neither resolvable nor reusable until
//! [`PortRegistry::release`].

use crate::error::{Result, TermiosError};
use crate::Fd;
use parking_lot::Mutex;
use std::sync::Arc;

#[derive(Debug)]
enum Slot<P> {
    Vacant,
    Reserved,
    Open(Arc<P>),
}

/// Fixed-capacity descriptor table.
#[derive(Debug)]
pub struct PortRegistry<P> {
    slots: Mutex<Vec<Slot<P>>>,
}

impl<P> PortRegistry<P> {
    /// Create a table with `capacity` slots.
    pub fn new(capacity: usize) -> Self {
        let mut slots = Vec::with_capacity(capacity);
        slots.resize_with(capacity, || Slot::Vacant);
        Self {
            slots: Mutex::new(slots),
        }
    }

    /// Number of slots.
    pub fn capacity(&self) -> usize {
        self.slots.lock().len()
    }

    /// Reserve the lowest free descriptor.
    ///
    /// The slot is invisible to `resolve` until [`install`](Self::install);
    /// a failed open hands it back with [`release`](Self::release).
    pub fn allocate(&self) -> Result<Fd> {
        let mut slots = self.slots.lock();
        let capacity = slots.len();
        let index = slots
            .iter()
            .position(|s| matches!(s, Slot::Vacant))
            .ok_or(TermiosError::Exhausted(capacity))?;
        slots[index] = Slot::Reserved;
        Ok(index as Fd)
    }

    /// Publish the port for a reserved descriptor.
    pub fn install(&self, fd: Fd, port: Arc<P>) {
        let mut slots = self.slots.lock();
        if let Some(slot) = index(fd).and_then(|i| slots.get_mut(i)) {
            if matches!(slot, Slot::Reserved) {
                *slot = Slot::Open(port);
            }
        }
    }

    /// Look up an open descriptor.
    pub fn resolve(&self, fd: Fd) -> Result<Arc<P>> {
        let slots = self.slots.lock();
        match index(fd).and_then(|i| slots.get(i)) {
            Some(Slot::Open(port)) => Ok(Arc::clone(port)),
            _ => Err(TermiosError::InvalidDescriptor(fd)),
        }
    }

    /// Mark a descriptor as closing and hand back its port.
    ///
    /// From here on `resolve` fails with InvalidDescriptor, while the slot
    /// stays reserved until `release`.
    pub fn begin_close(&self, fd: Fd) -> Result<Arc<P>> {
        let mut slots = self.slots.lock();
        let slot = index(fd)
            .and_then(|i| slots.get_mut(i))
            .ok_or(TermiosError::InvalidDescriptor(fd))?;
        match std::mem::replace(slot, Slot::Reserved) {
            Slot::Open(port) => Ok(port),
            other => {
                *slot = other;
                Err(TermiosError::InvalidDescriptor(fd))
            }
        }
    }

    /// Return a reserved slot to the free pool.
    pub fn release(&self, fd: Fd) {
        let mut slots = self.slots.lock();
        if let Some(slot) = index(fd).and_then(|i| slots.get_mut(i)) {
            if matches!(slot, Slot::Reserved) {
                *slot = Slot::Vacant;
            }
        }
    }

    /// Descriptors currently open, ascending.
    pub fn open_descriptors(&self) -> Vec<Fd> {
        self.slots
            .lock()
            .iter()
            .enumerate()
            .filter(|(_, s)| matches!(s, Slot::Open(_)))
            .map(|(i, _)| i as Fd)
            .collect()
    }
}

fn index(fd: Fd) -> Option<usize> {
    usize::try_from(fd).ok()
}
