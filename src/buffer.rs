//! Bounded buffer between the source reader and the broker publisher.
//!
//! When the broker is slow or unreachable the buffer fills up and the
//! configured [`OverflowPolicy`] decides what happens next:
//!
//! - `Block`: the reader waits for space, which stalls the source read
//! - `DropOldest`: the oldest buffered entry is evicted to make room and
//!   the caller is told so it can count the drop
//!
//! Entries leave the buffer strictly in FIFO order.

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use thiserror::Error;
use tokio::sync::{Mutex, Notify};

/// What to do when the buffer is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
    /// Wait until the drain side makes room.
    #[default]
    Block,
    /// Evict the oldest entry and accept the new one.
    DropOldest,
}

/// Result of a successful push.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    Queued,
    /// The entry was queued after evicting the oldest one
    DroppedOldest,
}

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("publish buffer is closed")]
pub struct BufferClosed;

struct Inner<T> {
    entries: VecDeque<T>,
    closed: bool,
}

/// Bounded FIFO with an overflow policy, shared by one producer and one
/// consumer task.
pub struct PublishBuffer<T> {
    inner: Mutex<Inner<T>>,
    capacity: usize,
    policy: OverflowPolicy,
    items: Notify,
    space: Notify,
}

impl<T> PublishBuffer<T> {
    /// Create a buffer holding at most `capacity` entries (minimum 1).
    pub fn new(capacity: usize, policy: OverflowPolicy) -> Self {
        let capacity = capacity.max(1);
        Self {
            inner: Mutex::new(Inner {
                entries: VecDeque::with_capacity(capacity),
                closed: false,
            }),
            capacity,
            policy,
            items: Notify::new(),
            space: Notify::new(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn policy(&self) -> OverflowPolicy {
        self.policy
    }

    /// Add an entry, applying the overflow policy when full.
    pub async fn push(&self, entry: T) -> Result<PushOutcome, BufferClosed> {
        let mut entry = Some(entry);
        loop {
            {
                let mut inner = self.inner.lock().await;
                if inner.closed {
                    return Err(BufferClosed);
                }

                if inner.entries.len() < self.capacity {
                    if let Some(entry) = entry.take() {
                        inner.entries.push_back(entry);
                    }
                    drop(inner);
                    self.items.notify_one();
                    return Ok(PushOutcome::Queued);
                }

                if self.policy == OverflowPolicy::DropOldest {
                    inner.entries.pop_front();
                    if let Some(entry) = entry.take() {
                        inner.entries.push_back(entry);
                    }
                    drop(inner);
                    self.items.notify_one();
                    return Ok(PushOutcome::DroppedOldest);
                }
            }

            self.space.notified().await;
        }
    }

    /// Take the oldest entry, waiting until one is available.
    ///
    /// Returns `None` once the buffer is closed and empty.
    pub async fn pop(&self) -> Option<T> {
        loop {
            {
                let mut inner = self.inner.lock().await;
                if let Some(entry) = inner.entries.pop_front() {
                    drop(inner);
                    self.space.notify_one();
                    return Some(entry);
                }
                if inner.closed {
                    return None;
                }
            }

            self.items.notified().await;
        }
    }

    /// Stop accepting entries. Buffered entries can still be popped.
    pub async fn close(&self) {
        self.inner.lock().await.closed = true;
        self.items.notify_waiters();
        self.items.notify_one();
        self.space.notify_waiters();
        self.space.notify_one();
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.entries.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}
