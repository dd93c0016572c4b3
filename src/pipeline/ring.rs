//! Bounded drop-oldest channel for real-time audio flow.
//!
//! The two audio channels (capture → VAD, TTS → output) prefer freshness
//! over completeness: when full, the oldest undelivered record is dropped
//! and counted, and the producer never blocks. The text channels use plain
//! bounded mpsc channels instead, because utterances must never be dropped.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;
use tokio::sync::Notify;

struct Shared<T> {
    queue: Mutex<VecDeque<T>>,
    capacity: usize,
    notify: Notify,
    dropped: AtomicU64,
    tx_closed: AtomicBool,
    rx_closed: AtomicBool,
}

/// Creates a bounded drop-oldest channel.
pub fn sliding_channel<T>(capacity: usize) -> (SlidingSender<T>, SlidingReceiver<T>) {
    let shared = Arc::new(Shared {
        queue: Mutex::new(VecDeque::with_capacity(capacity)),
        capacity: capacity.max(1),
        notify: Notify::new(),
        dropped: AtomicU64::new(0),
        tx_closed: AtomicBool::new(false),
        rx_closed: AtomicBool::new(false),
    });

    (
        SlidingSender {
            shared: shared.clone(),
        },
        SlidingReceiver { shared },
    )
}

/// Producer half. Never blocks.
pub struct SlidingSender<T> {
    shared: Arc<Shared<T>>,
}

impl<T> SlidingSender<T> {
    /// Enqueues a record, evicting the oldest one when full.
    ///
    /// Returns false when the receiver is gone.
    pub fn send(&self, item: T) -> bool {
        if self.shared.rx_closed.load(Ordering::Acquire) {
            return false;
        }

        {
            let mut queue = self.shared.queue.lock().unwrap();
            if queue.len() >= self.shared.capacity {
                queue.pop_front();
                self.shared.dropped.fetch_add(1, Ordering::Relaxed);
            }
            queue.push_back(item);
        }
        self.shared.notify.notify_one();
        true
    }

    /// Number of records evicted so far.
    pub fn dropped(&self) -> u64 {
        self.shared.dropped.load(Ordering::Relaxed)
    }

    /// Current queue depth.
    pub fn depth(&self) -> usize {
        self.shared.queue.lock().unwrap().len()
    }

    /// A read-only depth handle that does not keep the channel open.
    pub fn depth_probe(&self) -> DepthProbe<T> {
        DepthProbe {
            shared: self.shared.clone(),
        }
    }
}

/// Observes a sliding channel's depth without affecting its lifecycle.
pub struct DepthProbe<T> {
    shared: Arc<Shared<T>>,
}

impl<T> DepthProbe<T> {
    pub fn depth(&self) -> usize {
        self.shared.queue.lock().unwrap().len()
    }

    pub fn dropped(&self) -> u64 {
        self.shared.dropped.load(Ordering::Relaxed)
    }
}

impl<T> Drop for SlidingSender<T> {
    fn drop(&mut self) {
        self.shared.tx_closed.store(true, Ordering::Release);
        self.shared.notify.notify_waiters();
    }
}

/// Consumer half.
pub struct SlidingReceiver<T> {
    shared: Arc<Shared<T>>,
}

impl<T> SlidingReceiver<T> {
    /// Waits for the next record. Returns `None` once the sender is gone
    /// and the queue is drained.
    pub async fn recv(&mut self) -> Option<T> {
        loop {
            // Register for notification before checking, so a send between
            // the check and the await is not missed.
            let notified = self.shared.notify.notified();

            if let Some(item) = self.shared.queue.lock().unwrap().pop_front() {
                return Some(item);
            }
            if self.shared.tx_closed.load(Ordering::Acquire) {
                return None;
            }

            notified.await;
        }
    }

    /// Non-blocking read.
    pub fn try_recv(&mut self) -> Option<T> {
        self.shared.queue.lock().unwrap().pop_front()
    }

    /// Current queue depth.
    pub fn depth(&self) -> usize {
        self.shared.queue.lock().unwrap().len()
    }

    /// Number of records evicted so far.
    pub fn dropped(&self) -> u64 {
        self.shared.dropped.load(Ordering::Relaxed)
    }
}

impl<T> Drop for SlidingReceiver<T> {
    fn drop(&mut self) {
        self.shared.rx_closed.store(true, Ordering::Release);
    }
}
