//! Bounded FIFO wait queue with cancellable waiters.
//!
//! Producers [`enqueue`](WaitQueue::enqueue) items (waiting for a free slot
//! when the queue is full) and consumers [`dequeue`](WaitQueue::dequeue) the
//! oldest item (waiting for one to arrive).  Both waits honour a
//! [`CancellationToken`], and a producer that gives up after enqueueing can
//! pull its own entry back out with [`remove`](WaitQueue::remove), so a
//! cancelled waiter never leaves a dangling entry behind.
//!
//! Capacity is enforced with a [`Semaphore`]: each queued entry owns one
//! permit, released when the entry leaves the queue by any path.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::{Notify, OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;

use crate::cancel::until_cancelled;
use crate::error::{KernelError, Result};

/// Handle identifying one queued entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Ticket(u64);

struct Entry<T> {
    ticket: Ticket,
    item: T,
    _slot: OwnedSemaphorePermit,
}

struct QueueState<T> {
    next_ticket: u64,
    entries: VecDeque<Entry<T>>,
}

/// A strictly bounded FIFO queue.
pub struct WaitQueue<T> {
    name: &'static str,
    capacity: usize,
    slots: Arc<Semaphore>,
    available: Notify,
    state: Mutex<QueueState<T>>,
}

impl<T> WaitQueue<T> {
    /// Create a queue holding at most `capacity` entries (minimum 1).
    #[must_use]
    pub fn new(name: &'static str, capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            name,
            capacity,
            slots: Arc::new(Semaphore::new(capacity)),
            available: Notify::new(),
            state: Mutex::new(QueueState {
                next_ticket: 0,
                entries: VecDeque::with_capacity(capacity),
            }),
        }
    }

    /// Append `item`, waiting for a free slot if the queue is full.
    pub async fn enqueue(&self, item: T, token: &CancellationToken) -> Result<Ticket> {
        let slot = until_cancelled(token, Arc::clone(&self.slots).acquire_owned())
            .await?
            .map_err(|_| KernelError::Internal(format!("wait queue `{}` closed", self.name)))?;

        let ticket = {
            let mut state = self.lock();
            let ticket = Ticket(state.next_ticket);
            state.next_ticket += 1;
            state.entries.push_back(Entry {
                ticket,
                item,
                _slot: slot,
            });
            tracing::trace!(queue = self.name, depth = state.entries.len(), "entry enqueued");
            ticket
        };
        self.available.notify_one();
        Ok(ticket)
    }

    /// Take the oldest entry, waiting until one is available.
    pub async fn dequeue(&self, token: &CancellationToken) -> Result<T> {
        loop {
            let next = self.lock().entries.pop_front();
            if let Some(entry) = next {
                return Ok(entry.item);
            }
            until_cancelled(token, self.available.notified()).await?;
        }
    }

    /// Take the oldest entry without waiting.
    pub fn try_dequeue(&self) -> Option<T> {
        self.lock().entries.pop_front().map(|entry| entry.item)
    }

    /// Remove a still-queued entry.  Returns `None` if it was already taken.
    pub fn remove(&self, ticket: Ticket) -> Option<T> {
        let mut state = self.lock();
        let position = state.entries.iter().position(|e| e.ticket == ticket)?;
        state.entries.remove(position).map(|entry| entry.item)
    }

    /// Number of queued entries.
    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    /// `true` if nothing is queued.
    pub fn is_empty(&self) -> bool {
        self.lock().entries.is_empty()
    }

    /// Maximum number of queued entries.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    fn lock(&self) -> MutexGuard<'_, QueueState<T>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
