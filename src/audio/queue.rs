//! # Bounded Frame Queue
//!
//! Single-producer/single-consumer buffer that decouples one transport's
//! receive loop from the other transport's send loop.
//!
//! ## Behaviour:
//! - **push** never blocks: at capacity the oldest entry is evicted and counted
//! - **pop** suspends the consumer until an entry arrives or the queue closes
//! - **close** wakes the consumer; after close, pushes are ignored and any
//!   entries still buffered are discarded (stale real-time audio is worthless)
//! - **close_after_drain** also refuses further pushes, but the consumer
//!   still receives what was buffered before `pop` reports the end
//!
//! The same type backs the per-direction relay queues, the operator feed and
//! every observer subscription, so all of them share one overflow policy.

use crate::audio::frame::AudioFrame;
use parking_lot::Mutex;
use std::collections::VecDeque;
use tokio::sync::Notify;

/// Queue of audio frames, one per relay direction.
pub type FrameQueue = BoundedQueue<AudioFrame>;

/// Result of a non-blocking push.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    Accepted,
    /// Accepted after evicting the oldest entry.
    DroppedOldest,
    /// Queue already closed; the entry was discarded.
    Closed,
}

struct QueueInner<T> {
    items: VecDeque<T>,
    closed: bool,
    pushed: u64,
    dropped: u64,
}

/// Drop-oldest bounded FIFO with an async `pop`.
pub struct BoundedQueue<T> {
    inner: Mutex<QueueInner<T>>,
    notify: Notify,
    capacity: usize,
}

/// Counters exposed in session snapshots and the finalize event.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct QueueStats {
    pub pushed: u64,
    pub dropped: u64,
    pub buffered: usize,
}

impl<T> BoundedQueue<T> {
    /// A capacity of zero is treated as one.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            inner: Mutex::new(QueueInner {
                items: VecDeque::with_capacity(capacity),
                closed: false,
                pushed: 0,
                dropped: 0,
            }),
            notify: Notify::new(),
            capacity,
        }
    }

    pub fn push(&self, item: T) -> PushOutcome {
        let outcome = {
            let mut inner = self.inner.lock();
            if inner.closed {
                return PushOutcome::Closed;
            }

            inner.pushed += 1;
            let outcome = if inner.items.len() >= self.capacity {
                inner.items.pop_front();
                inner.dropped += 1;
                PushOutcome::DroppedOldest
            } else {
                PushOutcome::Accepted
            };
            inner.items.push_back(item);
            outcome
        };

        // Single consumer: a stored permit is enough to avoid a lost wakeup.
        self.notify.notify_one();
        outcome
    }

    /// Wait for the next entry. Returns `None` once the queue is closed and
    /// nothing is left buffered.
    pub async fn pop(&self) -> Option<T> {
        loop {
            {
                let mut inner = self.inner.lock();
                if let Some(item) = inner.items.pop_front() {
                    return Some(item);
                }
                if inner.closed {
                    return None;
                }
            }
            self.notify.notified().await;
        }
    }

    /// Non-blocking variant of `pop`.
    pub fn try_pop(&self) -> Option<T> {
        self.inner.lock().items.pop_front()
    }

    /// Discard everything buffered, returning how many entries were flushed.
    /// Flushed entries are not counted as overflow drops.
    pub fn clear(&self) -> usize {
        let mut inner = self.inner.lock();
        let flushed = inner.items.len();
        inner.items.clear();
        flushed
    }

    pub fn close(&self) {
        self.shut(true);
    }

    /// Close without discarding: the consumer drains what is buffered first.
    pub fn close_after_drain(&self) {
        self.shut(false);
    }

    fn shut(&self, discard: bool) {
        {
            let mut inner = self.inner.lock();
            if discard {
                inner.items.clear();
            }
            if inner.closed {
                return;
            }
            inner.closed = true;
        }
        self.notify.notify_one();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }

    pub fn len(&self) -> usize {
        self.inner.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().items.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn stats(&self) -> QueueStats {
        let inner = self.inner.lock();
        QueueStats {
            pushed: inner.pushed,
            dropped: inner.dropped,
            buffered: inner.items.len(),
        }
    }
}
