//! Bounded frame queue
//!
//! Multi-producer/multi-consumer FIFO between acquisition and persistence.
//! Producers suspend while the queue is full instead of growing it, and
//! consumers acknowledge each entry with `mark_done` so `join` can report when
//! everything enqueued so far has been persisted.
//!
//! All bookkeeping (entries, pending counts, per-channel pending counts) sits
//! behind one lock so it changes atomically with respect to task interleaving.
//! Wakeups go through [`Notify`]; every waiter registers interest before it
//! re-checks the state, so no notification is lost between check and await.

use crate::source::{ChannelId, Frame};
use crate::utils::error::QueueError;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use tokio::sync::Notify;

/// A frame and the channel it was acquired on
#[derive(Debug)]
pub struct QueueEntry {
    pub frame: Frame,
    pub channel: ChannelId,
}

impl QueueEntry {
    pub fn new(frame: Frame, channel: ChannelId) -> Self {
        Self { frame, channel }
    }
}

/// Rejected non-blocking enqueue; the entry is handed back
#[derive(Debug)]
pub enum TryEnqueueError {
    Full(QueueEntry),
    Closed(QueueEntry),
}

impl TryEnqueueError {
    pub fn into_entry(self) -> QueueEntry {
        match self {
            TryEnqueueError::Full(entry) | TryEnqueueError::Closed(entry) => entry,
        }
    }
}

impl fmt::Display for TryEnqueueError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TryEnqueueError::Full(_) => f.write_str("queue is full"),
            TryEnqueueError::Closed(_) => f.write_str("queue is closed"),
        }
    }
}

/// Point-in-time occupancy figures
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueStats {
    pub capacity: usize,
    pub len: usize,
    pub pending: usize,
    pub high_water: usize,
    pub total_enqueued: u64,
    pub full_waits: u64,
}

#[derive(Default)]
struct QueueState {
    entries: VecDeque<QueueEntry>,
    pending: usize,
    pending_by_channel: HashMap<ChannelId, usize>,
    closed: bool,
    high_water: usize,
    total_enqueued: u64,
    full_waits: u64,
}

/// Capacity-bounded MPMC queue with drain tracking
pub struct BoundedFrameQueue {
    capacity: usize,
    state: Mutex<QueueState>,
    not_empty: Notify,
    not_full: Notify,
    drained: Notify,
}

impl BoundedFrameQueue {
    /// Create a queue holding at most `capacity` unconsumed entries (minimum 1)
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            state: Mutex::new(QueueState::default()),
            not_empty: Notify::new(),
            not_full: Notify::new(),
            drained: Notify::new(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Entries waiting to be dequeued
    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Entries enqueued but not yet marked done
    pub fn pending(&self) -> usize {
        self.state.lock().pending
    }

    pub fn pending_for(&self, channel: &ChannelId) -> usize {
        self.state
            .lock()
            .pending_by_channel
            .get(channel)
            .copied()
            .unwrap_or(0)
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    pub fn stats(&self) -> QueueStats {
        let state = self.state.lock();
        QueueStats {
            capacity: self.capacity,
            len: state.entries.len(),
            pending: state.pending,
            high_water: state.high_water,
            total_enqueued: state.total_enqueued,
            full_waits: state.full_waits,
        }
    }

    /// Add an entry without waiting
    pub fn try_enqueue(&self, entry: QueueEntry) -> Result<(), TryEnqueueError> {
        {
            let mut state = self.state.lock();
            if state.closed {
                return Err(TryEnqueueError::Closed(entry));
            }
            if state.entries.len() >= self.capacity {
                return Err(TryEnqueueError::Full(entry));
            }

            *state
                .pending_by_channel
                .entry(entry.channel.clone())
                .or_insert(0) += 1;
            state.pending += 1;
            state.total_enqueued += 1;
            state.entries.push_back(entry);
            state.high_water = state.high_water.max(state.entries.len());
        }
        self.not_empty.notify_one();
        Ok(())
    }

    /// Add an entry, suspending while the queue is full
    pub async fn enqueue(&self, mut entry: QueueEntry) -> Result<(), QueueError> {
        let mut waited = false;
        loop {
            let notified = self.not_full.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            match self.try_enqueue(entry) {
                Ok(()) => return Ok(()),
                Err(TryEnqueueError::Closed(_)) => return Err(QueueError::Closed),
                Err(TryEnqueueError::Full(rejected)) => {
                    if !waited {
                        waited = true;
                        self.state.lock().full_waits += 1;
                        tracing::debug!(
                            "Queue full ({} entries), {} waiting for space",
                            self.capacity,
                            rejected.channel
                        );
                    }
                    entry = rejected;
                }
            }

            notified.await;
        }
    }

    /// Take the oldest entry, suspending while the queue is empty.
    ///
    /// Cancel-safe: an entry is only removed in the same poll that returns it.
    pub async fn dequeue(&self) -> QueueEntry {
        loop {
            let notified = self.not_empty.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let entry = self.state.lock().entries.pop_front();
            if let Some(entry) = entry {
                self.not_full.notify_one();
                return entry;
            }

            notified.await;
        }
    }

    /// Acknowledge that one entry of `channel` has been fully processed
    pub fn mark_done(&self, channel: &ChannelId) -> Result<(), QueueError> {
        let (channel_drained, all_drained) = {
            let mut state = self.state.lock();
            let remaining = match state.pending_by_channel.get_mut(channel) {
                Some(count) if *count > 0 => {
                    *count -= 1;
                    *count
                }
                _ => return Err(QueueError::NothingPending(channel.clone())),
            };
            if remaining == 0 {
                state.pending_by_channel.remove(channel);
            }
            state.pending -= 1;
            (remaining == 0, state.pending == 0)
        };

        if channel_drained || all_drained {
            self.drained.notify_waiters();
        }
        Ok(())
    }

    /// Wait until every entry enqueued so far has been marked done
    pub async fn join(&self) {
        loop {
            let notified = self.drained.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.pending() == 0 {
                return;
            }

            notified.await;
        }
    }

    /// Wait until every entry of `channel` enqueued so far has been marked done
    pub async fn join_channel(&self, channel: &ChannelId) {
        loop {
            let notified = self.drained.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.pending_for(channel) == 0 {
                return;
            }

            notified.await;
        }
    }

    /// Refuse all further enqueues and wake producers blocked on a full queue
    pub fn close(&self) {
        self.state.lock().closed = true;
        self.not_full.notify_waiters();
    }
}

impl fmt::Debug for BoundedFrameQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BoundedFrameQueue")
            .field("stats", &self.stats())
            .finish()
    }
}
