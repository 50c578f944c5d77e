//! Admission control
//!
//! At most `capacity` sessions hold a slot (Provisioning or Running). Later
//! arrivals wait in FIFO order. A freed slot goes straight to the oldest live
//! waiter, so the active count never dips while someone is queued.

use crate::error::TimeoutError;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::trace;

/// Occupancy snapshot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoordinatorStats {
    pub capacity: usize,
    pub active: usize,
    pub queued: usize,
}

#[derive(Default)]
struct State {
    active: usize,
    /// Arrival order. May hold tickets whose waiter already left.
    queue: VecDeque<u64>,
    /// Live waiters by ticket
    waiters: HashMap<u64, oneshot::Sender<SlotPermit>>,
    next_ticket: u64,
}

struct Inner {
    capacity: usize,
    state: Mutex<State>,
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Bounds concurrent sessions and queues the rest
#[derive(Clone)]
pub struct Coordinator {
    inner: Arc<Inner>,
}

impl Coordinator {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(Inner {
                capacity: capacity.max(1),
                state: Mutex::new(State::default()),
            }),
        }
    }

    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    pub fn stats(&self) -> CoordinatorStats {
        let state = self.inner.lock();
        CoordinatorStats {
            capacity: self.inner.capacity,
            active: state.active,
            queued: state.waiters.len(),
        }
    }

    /// Take a slot without waiting, if one is free and nobody is queued
    pub fn try_acquire(&self) -> Option<SlotPermit> {
        let mut state = self.inner.lock();
        if state.active < self.inner.capacity && state.waiters.is_empty() {
            state.active += 1;
            Some(SlotPermit::new(self.inner.clone()))
        } else {
            None
        }
    }

    /// Wait for a slot for at most `max_wait`, measured from this call.
    ///
    /// Dropping the returned future leaves the queue in O(1).
    pub async fn acquire(&self, max_wait: Duration) -> Result<SlotPermit, TimeoutError> {
        let (ticket, rx) = {
            let mut state = self.inner.lock();
            if state.active < self.inner.capacity && state.waiters.is_empty() {
                state.active += 1;
                return Ok(SlotPermit::new(self.inner.clone()));
            }
            if state.waiters.is_empty() {
                state.queue.clear();
            }
            let ticket = state.next_ticket;
            state.next_ticket += 1;
            let (tx, rx) = oneshot::channel();
            state.queue.push_back(ticket);
            state.waiters.insert(ticket, tx);
            (ticket, rx)
        };
        trace!(ticket, "queued for a slot");

        let _waiting = QueuedTicket {
            inner: &self.inner,
            ticket,
        };
        match tokio::time::timeout(max_wait, rx).await {
            Ok(Ok(permit)) => Ok(permit),
            Ok(Err(_)) | Err(_) => Err(TimeoutError::QueueWait(max_wait)),
        }
    }
}

impl fmt::Debug for Coordinator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Coordinator")
            .field("stats", &self.stats())
            .finish()
    }
}

/// Removes an abandoned waiter; its stale queue entry is skipped on release
struct QueuedTicket<'a> {
    inner: &'a Arc<Inner>,
    ticket: u64,
}

impl Drop for QueuedTicket<'_> {
    fn drop(&mut self) {
        let removed = self.inner.lock().waiters.remove(&self.ticket);
        // Dropped outside the lock: a permit racing into the channel would
        // release on drop.
        drop(removed);
    }
}

/// One occupied slot. Dropping it frees the slot.
pub struct SlotPermit {
    inner: Arc<Inner>,
    armed: bool,
}

impl SlotPermit {
    fn new(inner: Arc<Inner>) -> Self {
        Self { inner, armed: true }
    }
}

impl fmt::Debug for SlotPermit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SlotPermit").field("armed", &self.armed).finish()
    }
}

impl Drop for SlotPermit {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let mut state = self.inner.lock();
        while let Some(ticket) = state.queue.pop_front() {
            let Some(tx) = state.waiters.remove(&ticket) else {
                continue;
            };
            match tx.send(SlotPermit::new(self.inner.clone())) {
                Ok(()) => {
                    trace!(ticket, "slot handed over");
                    return;
                }
                Err(mut unsent) => unsent.armed = false,
            }
        }
        state.active -= 1;
    }
}
