//! Bounded ingest queue from C1 into C2 with drop-oldest backpressure (§4.1, §5).
//!
//! A stock `tokio::sync::mpsc` channel rejects the *newest* item when full;
//! §4.1 requires the opposite ("on channel full, drop oldest and increment
//! a drop counter"), so this is the one hand-rolled concurrency primitive
//! in the crate (per the Design Notes). Built on `parking_lot::Mutex` +
//! `tokio::sync::Notify`, preferring `parking_lot` over `std::sync` for
//! size and fairness under contention.

use crate::models::MetricPoint;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Notify;

/// A point tagged with the session it belongs to. Identity resolution
/// (§4.1) happens once per ingested batch in C1, not once per point, so
/// this is what actually flows through the queue into the drain loop.
#[derive(Debug, Clone)]
pub struct IngestItem {
    pub session_id: String,
    pub point: MetricPoint,
}

struct Inner {
    items: Mutex<VecDeque<IngestItem>>,
    capacity: usize,
    notify: Notify,
    dropped: AtomicU64,
    closed: std::sync::atomic::AtomicBool,
    saturated_since: Mutex<Option<Instant>>,
}

/// Multi-producer, single-consumer bounded queue that sheds the oldest
/// entry instead of rejecting the newest one when full.
#[derive(Clone)]
pub struct IngestQueue {
    inner: Arc<Inner>,
}

impl IngestQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(Inner {
                items: Mutex::new(VecDeque::with_capacity(capacity)),
                capacity: capacity.max(1),
                notify: Notify::new(),
                dropped: AtomicU64::new(0),
                closed: std::sync::atomic::AtomicBool::new(false),
                saturated_since: Mutex::new(None),
            }),
        }
    }

    /// Push a point, preserving per-request ordering (§4.1 concurrency
    /// note). Evicts the oldest entry on overflow and bumps the drop
    /// counter rather than rejecting this point.
    pub fn push(&self, item: IngestItem) {
        {
            let mut items = self.inner.items.lock();
            if items.len() >= self.inner.capacity {
                items.pop_front();
                self.inner.dropped.fetch_add(1, Ordering::Relaxed);
            }
            items.push_back(item);
            if items.len() >= self.inner.capacity {
                self.inner.saturated_since.lock().get_or_insert_with(Instant::now);
            } else {
                *self.inner.saturated_since.lock() = None;
            }
        }
        self.inner.notify.notify_one();
    }

    /// Push a whole batch, preserving its internal order.
    pub fn push_batch(&self, items: impl IntoIterator<Item = IngestItem>) {
        for item in items {
            self.push(item);
        }
    }

    /// Pop the oldest point, waiting if the queue is empty.
    pub async fn pop(&self) -> Option<IngestItem> {
        loop {
            {
                let mut items = self.inner.items.lock();
                if let Some(p) = items.pop_front() {
                    if items.len() < self.inner.capacity {
                        *self.inner.saturated_since.lock() = None;
                    }
                    return Some(p);
                }
            }
            if self.inner.closed.load(Ordering::Acquire) {
                return None;
            }
            self.inner.notify.notified().await;
        }
    }

    pub fn len(&self) -> usize {
        self.inner.items.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_saturated(&self) -> bool {
        self.len() >= self.inner.capacity
    }

    /// Whether `close()` has been called (§5 shutdown sequence: "the
    /// receiver stops accepting"). Readiness probes use this as a proxy for
    /// C1/C2 no longer being operational.
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// How long the queue has been continuously at capacity, if it is right
    /// now. Backs C1's "503 if the downstream channel has been full for
    /// more than `shedTimeout`" rule (§4.1) -- a bare `is_saturated` bool
    /// can't distinguish a queue that just filled up from one stuck full.
    pub fn saturated_duration(&self) -> Option<std::time::Duration> {
        self.inner.saturated_since.lock().map(|since| since.elapsed())
    }

    pub fn dropped_count(&self) -> u64 {
        self.inner.dropped.load(Ordering::Relaxed)
    }

    /// Signal the consumer to stop waiting once drained (graceful shutdown, §5).
    pub fn close(&self) {
        self.inner.closed.store(true, Ordering::Release);
        self.inner.notify.notify_waiters();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn item(name: &str, ts: i64) -> IngestItem {
        IngestItem {
            session_id: "s-1".to_string(),
            point: MetricPoint {
                name: name.to_string(),
                value: crate::models::MetricValue::Int(1),
                timestamp_ns: ts,
                attributes: HashMap::new(),
                is_delta: false,
            },
        }
    }

    #[test]
    fn overflow_drops_oldest_not_newest() {
        let q = IngestQueue::new(2);
        q.push(item("a", 1));
        q.push(item("b", 2));
        q.push(item("c", 3));
        assert_eq!(q.dropped_count(), 1);
        assert_eq!(q.len(), 2);
        let first = q.inner.items.lock().front().cloned().unwrap();
        assert_eq!(first.point.name, "b");
    }

    #[tokio::test]
    async fn pop_preserves_fifo_order() {
        let q = IngestQueue::new(8);
        q.push(item("a", 1));
        q.push(item("b", 2));
        assert_eq!(q.pop().await.unwrap().point.name, "a");
        assert_eq!(q.pop().await.unwrap().point.name, "b");
    }

    #[tokio::test]
    async fn pop_returns_none_after_close_when_drained() {
        let q = IngestQueue::new(4);
        q.push(item("a", 1));
        q.close();
        assert_eq!(q.pop().await.unwrap().point.name, "a");
        assert!(q.pop().await.is_none());
    }

    #[tokio::test]
    async fn saturated_duration_tracks_continuous_fullness() {
        let q = IngestQueue::new(1);
        assert!(q.saturated_duration().is_none());

        q.push(item("a", 1));
        assert!(q.saturated_duration().is_some());

        // still full after overflow (push evicts then re-fills to capacity).
        q.push(item("b", 2));
        assert!(q.saturated_duration().is_some());

        q.pop().await;
        assert!(q.saturated_duration().is_none());
    }
}
