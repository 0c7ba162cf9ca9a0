//! Wire-agnostic metric representation (§3 `MetricPoint`, `Aggregate`) plus
//! the fixed-capacity ring buffer C5 uses for velocity/compaction detection.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};

/// A decoded numeric value, preserving whether it arrived as `asInt` or
/// `asDouble` (§6 wire protocol) so downstream code can keep integer
/// semantics for token counts.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MetricValue {
    Int(i64),
    Float(f64),
}

impl MetricValue {
    pub fn as_f64(&self) -> f64 {
        match self {
            MetricValue::Int(v) => *v as f64,
            MetricValue::Float(v) => *v,
        }
    }

    pub fn as_u64(&self) -> u64 {
        match self {
            MetricValue::Int(v) => (*v).max(0) as u64,
            MetricValue::Float(v) => v.max(0.0) as u64,
        }
    }
}

/// One decoded data point, already resolved to a session (§3, §4.1).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricPoint {
    pub name: String,
    pub value: MetricValue,
    pub timestamp_ns: i64,
    pub attributes: HashMap<String, String>,
    /// Whether this point came from a `sum` with `aggregationTemporality ==
    /// AGGREGATION_TEMPORALITY_DELTA` (§4.2): the processor accumulates
    /// deltas into a running total rather than treating `value` as the
    /// already-cumulative reading.
    #[serde(default)]
    pub is_delta: bool,
}

impl MetricPoint {
    /// Dedup key per §4.2: `(sessionId, name, timestampNs, attrs-hash)`.
    /// `session_id` is folded in by the caller (the dedup LRU is per
    /// session, so the key only needs name/timestamp/attrs here).
    pub fn dedup_key(&self) -> (String, i64, u64) {
        (self.name.clone(), self.timestamp_ns, self.attrs_hash())
    }

    fn attrs_hash(&self) -> u64 {
        use std::collections::hash_map::DefaultHasher;
        use std::hash::{Hash, Hasher};

        let mut pairs: Vec<_> = self.attributes.iter().collect();
        pairs.sort();
        let mut hasher = DefaultHasher::new();
        for (k, v) in pairs {
            k.hash(&mut hasher);
            v.hash(&mut hasher);
        }
        hasher.finish()
    }
}

/// Decoded histogram shape, retained in full per Open Question #3 even
/// though only `sum/count` is currently exposed through any endpoint.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HistogramData {
    pub count: u64,
    pub sum: f64,
    pub bucket_counts: Vec<u64>,
    pub explicit_bounds: Vec<f64>,
}

/// Fixed-capacity ring buffer backing `Aggregate.windowValues` (§3). Named
/// once so the eviction policy (oldest value dropped on overflow) lives in
/// a single place.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RingBuffer<T> {
    capacity: usize,
    buf: VecDeque<T>,
}

impl<T> RingBuffer<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            buf: VecDeque::with_capacity(capacity),
        }
    }

    pub fn push(&mut self, value: T) {
        if self.buf.len() == self.capacity {
            self.buf.pop_front();
        }
        self.buf.push_back(value);
    }

    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.buf.iter()
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn back(&self) -> Option<&T> {
        self.buf.back()
    }
}

/// A timestamped sample kept in a metric's window, used to compute
/// velocity between consecutive updates.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct WindowSample {
    pub timestamp_ns: i64,
    pub value: f64,
}

/// Per `(sessionId, name)` aggregate (§3 `Aggregate`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Aggregate {
    pub latest: f64,
    pub count: u64,
    pub sum: f64,
    pub window_values: RingBuffer<WindowSample>,
    /// Running total used only when `aggregationTemporality == delta` (§4.2).
    pub running_total: f64,
    pub histogram: Option<HistogramData>,
    /// Distinct attribute tuples observed, capped per §4.2; beyond the cap
    /// new tuples collapse into a synthetic `__other__` bucket.
    pub attribute_tuples_seen: usize,
}

impl Aggregate {
    pub fn new(window_capacity: usize) -> Self {
        Self {
            latest: 0.0,
            count: 0,
            sum: 0.0,
            window_values: RingBuffer::new(window_capacity),
            running_total: 0.0,
            histogram: None,
            attribute_tuples_seen: 0,
        }
    }

    /// Record one sample. `is_delta` (§4.2) selects whether `value` is
    /// already cumulative (the common case: sums/gauges report the running
    /// total directly) or an increment that must be folded into
    /// `running_total` to recover the cumulative reading.
    pub fn record(&mut self, value: f64, timestamp_ns: i64, is_delta: bool) {
        let effective = if is_delta {
            self.running_total += value;
            self.running_total
        } else {
            value
        };
        self.latest = effective;
        self.count += 1;
        self.sum += effective;
        self.window_values.push(WindowSample {
            timestamp_ns,
            value: effective,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ring_buffer_evicts_oldest_on_overflow() {
        let mut rb = RingBuffer::new(3);
        rb.push(1);
        rb.push(2);
        rb.push(3);
        rb.push(4);
        let values: Vec<_> = rb.iter().copied().collect();
        assert_eq!(values, vec![2, 3, 4]);
    }

    #[test]
    fn dedup_key_stable_for_same_attrs_regardless_of_insertion_order() {
        let mut a = HashMap::new();
        a.insert("k1".to_string(), "v1".to_string());
        a.insert("k2".to_string(), "v2".to_string());
        let mut b = HashMap::new();
        b.insert("k2".to_string(), "v2".to_string());
        b.insert("k1".to_string(), "v1".to_string());

        let p1 = MetricPoint {
            name: "claude.tokens.total".into(),
            value: MetricValue::Int(100),
            timestamp_ns: 42,
            attributes: a,
            is_delta: false,
        };
        let p2 = MetricPoint {
            name: "claude.tokens.total".into(),
            value: MetricValue::Int(100),
            timestamp_ns: 42,
            attributes: b,
            is_delta: false,
        };
        assert_eq!(p1.dedup_key(), p2.dedup_key());
    }

    #[test]
    fn metric_value_conversions() {
        assert_eq!(MetricValue::Int(-5).as_u64(), 0);
        assert_eq!(MetricValue::Float(3.7).as_u64(), 3);
        assert_eq!(MetricValue::Int(7).as_f64(), 7.0);
    }
}
