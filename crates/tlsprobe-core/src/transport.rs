//! Bounded relay between instrumentation points and a module's consumer loop
//!
//! Producers never block: when the queue is full the oldest unread record is
//! displaced and counted. The single consumer waits with a bounded timeout so
//! cancellation stays observable when no traffic arrives.

use crate::events::RawRecord;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

/// Default number of records buffered per module
pub const DEFAULT_CAPACITY: usize = 1024;

struct Shared {
    queue: Mutex<VecDeque<RawRecord>>,
    capacity: usize,
    dropped: AtomicU64,
    pushed: AtomicU64,
    closed: AtomicBool,
    notify: Notify,
}

/// Create a transport holding at most `capacity` unread records
pub fn channel(capacity: usize) -> (TransportProducer, TransportConsumer) {
    let capacity = capacity.max(1);
    let shared = Arc::new(Shared {
        queue: Mutex::new(VecDeque::with_capacity(capacity)),
        capacity,
        dropped: AtomicU64::new(0),
        pushed: AtomicU64::new(0),
        closed: AtomicBool::new(false),
        notify: Notify::new(),
    });

    (
        TransportProducer {
            shared: shared.clone(),
        },
        TransportConsumer { shared },
    )
}

/// Producer side, cloned into every instrumentation relay
#[derive(Clone)]
pub struct TransportProducer {
    shared: Arc<Shared>,
}

impl TransportProducer {
    /// Enqueue a record without blocking.
    ///
    /// Returns `true` when an unread record had to be displaced to make room.
    pub fn push(&self, record: RawRecord) -> bool {
        let displaced = {
            // Checked under the queue lock so a record never lands after the final drain
            let mut queue = self.shared.queue.lock();
            if self.shared.closed.load(Ordering::Acquire) {
                drop(queue);
                self.shared.dropped.fetch_add(1, Ordering::Relaxed);
                return false;
            }
            let displaced = if queue.len() >= self.shared.capacity {
                queue.pop_front();
                true
            } else {
                false
            };
            queue.push_back(record);
            displaced
        };

        self.shared.pushed.fetch_add(1, Ordering::Relaxed);
        if displaced {
            self.shared.dropped.fetch_add(1, Ordering::Relaxed);
        }
        self.shared.notify.notify_one();
        displaced
    }

    /// Account for records lost before they reached this transport
    pub fn record_loss(&self, count: u64) {
        if count > 0 {
            self.shared.dropped.fetch_add(count, Ordering::Relaxed);
        }
    }

    /// Stop accepting records; the consumer still drains what is buffered
    pub fn close(&self) {
        {
            let _queue = self.shared.queue.lock();
            self.shared.closed.store(true, Ordering::Release);
        }
        self.shared.notify.notify_one();
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }
}

/// Outcome of one bounded wait on the transport
#[derive(Debug)]
pub enum Recv {
    /// Records in arrival order
    Batch(Vec<RawRecord>),
    /// Nothing arrived within the wait
    Idle,
    /// Closed and fully drained
    Closed,
}

/// Consumer side, owned by exactly one module
pub struct TransportConsumer {
    shared: Arc<Shared>,
}

impl TransportConsumer {
    /// Wait at most `wait` for records and return up to `max` of them
    pub async fn recv_batch(&mut self, max: usize, wait: Duration) -> Recv {
        loop {
            let batch = self.take(max.max(1));
            if !batch.is_empty() {
                return Recv::Batch(batch);
            }
            if self.shared.closed.load(Ordering::Acquire) {
                return Recv::Closed;
            }

            let notified = self.shared.notify.notified();
            if tokio::time::timeout(wait, notified).await.is_err() {
                let batch = self.take(max.max(1));
                return if batch.is_empty() {
                    Recv::Idle
                } else {
                    Recv::Batch(batch)
                };
            }
        }
    }

    /// Take everything currently buffered
    pub fn drain(&mut self) -> Vec<RawRecord> {
        self.shared.queue.lock().drain(..).collect()
    }

    /// Cumulative number of displaced or lost records
    pub fn dropped(&self) -> u64 {
        self.shared.dropped.load(Ordering::Relaxed)
    }

    /// Cumulative number of records accepted by producers
    pub fn pushed(&self) -> u64 {
        self.shared.pushed.load(Ordering::Relaxed)
    }

    pub fn len(&self) -> usize {
        self.shared.queue.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.shared.capacity
    }

    fn take(&self, max: usize) -> Vec<RawRecord> {
        let mut queue = self.shared.queue.lock();
        let n = queue.len().min(max);
        queue.drain(..n).collect()
    }
}
