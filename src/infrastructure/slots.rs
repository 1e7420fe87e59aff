//! Thread slots
//!
//! A fixed set of numbered tokens on a bounded channel. A thread takes a token
//! before it starts and the token goes back when the [`Slot`] drops, normally
//! when the thread exits. Threads that were abandoned but are still running keep
//! their token, so they count against the limit.

use crossbeam::channel::{bounded, Receiver, RecvTimeoutError, Sender};
use std::time::Instant;

pub struct Slots {
    tx: Sender<usize>,
    rx: Receiver<usize>,
    capacity: usize,
}

impl Slots {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (tx, rx) = bounded(capacity);
        for id in 0..capacity {
            let _ = tx.send(id);
        }
        Self { tx, rx, capacity }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Tokens not held by any live thread
    pub fn available(&self) -> usize {
        self.rx.len()
    }

    pub fn try_acquire(&self) -> Option<Slot> {
        self.rx.try_recv().ok().map(|id| self.claim(id))
    }

    /// Wait for a token until `deadline`
    pub fn acquire_deadline(&self, deadline: Instant) -> Option<Slot> {
        match self.rx.recv_deadline(deadline) {
            Ok(id) => Some(self.claim(id)),
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => None,
        }
    }

    /// Token channel, for waiting on it inside a `Select`
    pub fn receiver(&self) -> &Receiver<usize> {
        &self.rx
    }

    /// Wrap a token taken directly from [`Slots::receiver`]
    pub fn claim(&self, id: usize) -> Slot {
        Slot {
            id,
            tx: self.tx.clone(),
        }
    }
}

/// A held token; returned on drop
pub struct Slot {
    id: usize,
    tx: Sender<usize>,
}

impl Slot {
    pub fn id(&self) -> usize {
        self.id
    }
}

impl Drop for Slot {
    fn drop(&mut self) {
        let _ = self.tx.send(self.id);
    }
}
