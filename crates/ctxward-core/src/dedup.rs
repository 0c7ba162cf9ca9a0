//! Per-session dedup LRU (§4.2 step 2, §5 "dedup LRU is per session to
//! avoid global contention").

use crate::models::MetricPoint;
use lru::LruCache;
use std::num::NonZeroUsize;

/// Tracks recently seen `(name, timestampNs, attrHash)` keys for one
/// session so identical OTLP data points are idempotent (P8).
pub struct DedupCache {
    seen: LruCache<(String, i64, u64), ()>,
}

impl DedupCache {
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity.max(1)).unwrap();
        Self {
            seen: LruCache::new(capacity),
        }
    }

    /// Returns `true` if this is a new point (and records it), `false` if
    /// it is a duplicate of one already seen.
    pub fn observe(&mut self, point: &MetricPoint) -> bool {
        let key = point.dedup_key();
        if self.seen.contains(&key) {
            // Touch to keep recency accurate even on a duplicate.
            self.seen.get(&key);
            false
        } else {
            self.seen.put(key, ());
            true
        }
    }
}
