//! Metric Processor (C2, §4.2): normalizes, deduplicates and aggregates
//! metric points into a session's record, then recomputes the derived
//! fields (`utilization`, `tokenVelocity`) the rest of the pipeline reads.

use crate::models::{now_millis, Aggregate, MetricPoint, SessionStatus};
use crate::optimizer::CheckpointOptimizer;
use crate::registry::SessionState;
use tracing::warn;

/// Names enumerated in §4.2 step 3; exhaustive for the core.
pub mod metric_names {
    pub const TOKENS_TOTAL: &str = "claude.tokens.total";
    pub const TOKENS_INPUT: &str = "claude.tokens.input";
    pub const TOKENS_OUTPUT: &str = "claude.tokens.output";
    pub const TOKENS_CACHE_READ: &str = "claude.tokens.cache_read";
    pub const CONTEXT_UTILIZATION: &str = "claude.context.utilization";
    pub const CONTEXT_RESET: &str = "claude.context.reset";
    pub const CHECKPOINT_CREATED: &str = "claude.checkpoint.created";
    pub const ERRORS_COUNT: &str = "claude.errors.count";
    pub const OPERATIONS_COUNT: &str = "claude.operations.count";
}

/// Result of processing one point: whether a compaction was just detected
/// (so the caller can route optimizer feedback + an alert), and whether the
/// session was updated at all (duplicates produce no update, P8).
#[derive(Debug, Default)]
pub struct ProcessOutcome {
    pub updated: bool,
    pub compaction_detected: Option<f64>, // utilization before the drop
    pub checkpoint_created: bool,
    pub invariant_violation: bool,
}

pub struct MetricProcessor {
    pub watermark_secs: u64,
    pub compaction_drop_fraction: f64,
    pub attribute_cardinality_cap: usize,
    /// §4.2's own 2s grace window for `claude.context.reset`.
    pub reset_grace_ms: u64,
    pub velocity_alpha: f64,
}

impl MetricProcessor {
    pub fn new(
        watermark_secs: u64,
        compaction_drop_fraction: f64,
        attribute_cardinality_cap: usize,
    ) -> Self {
        Self {
            watermark_secs,
            compaction_drop_fraction,
            attribute_cardinality_cap,
            reset_grace_ms: 2_000,
            velocity_alpha: 0.3,
        }
    }

    /// Apply one already-deduplicated point to `state`. The caller owns
    /// the session's single-writer lock for the duration of this call.
    pub fn apply(&self, state: &mut SessionState, point: MetricPoint) -> ProcessOutcome {
        let mut outcome = ProcessOutcome::default();
        let now = now_millis();

        // Watermark: drop points older than `watermark_secs` behind the
        // latest timestamp seen for this session (§3 `MetricPoint`).
        if let Some(latest_ns) = state
            .record
            .aggregates
            .get(&point.name)
            .and_then(|a| a.window_values.back())
            .map(|s| s.timestamp_ns)
        {
            let watermark_ns = (self.watermark_secs as i64) * 1_000_000_000;
            if point.timestamp_ns < latest_ns - watermark_ns {
                return outcome;
            }
        }

        if !state.dedup.observe(&point) {
            return outcome; // P8: identical point, no state change.
        }

        state.record.last_seen_at = now;
        if matches!(state.record.status, SessionStatus::Idle) {
            state.record.status = SessionStatus::Active;
        }
        outcome.updated = true;

        let window_capacity = state.window_capacity;
        let agg = state
            .record
            .aggregates
            .entry(point.name.clone())
            .or_insert_with(|| Aggregate::new(window_capacity));
        self.apply_cardinality_cap(agg, &point);
        agg.record(point.value.as_f64(), point.timestamp_ns, point.is_delta);
        // §4.2: a delta-temporality sum's cumulative reading is the
        // aggregate's running total, not the raw per-point value.
        let effective_value = if point.is_delta {
            agg.latest
        } else {
            point.value.as_f64()
        };

        match point.name.as_str() {
            metric_names::TOKENS_TOTAL => {
                let tokens = effective_value.max(0.0) as u64;
                self.apply_tokens_total(state, tokens, point.timestamp_ns, now, &mut outcome);
            }
            metric_names::TOKENS_INPUT | metric_names::TOKENS_OUTPUT | metric_names::TOKENS_CACHE_READ => {
                // Running totals only; no session-level field to mutate beyond the aggregate.
            }
            metric_names::CONTEXT_UTILIZATION => {
                if state.record.current_tokens == 0 {
                    state.record.utilization = effective_value.clamp(0.0, 1.0);
                }
                // else ignored per §4.2 step 3.
            }
            metric_names::CONTEXT_RESET => {
                state.record.pending_reset_at = Some(now);
            }
            metric_names::CHECKPOINT_CREATED => {
                state.record.checkpoints += 1;
                outcome.checkpoint_created = true;
            }
            metric_names::ERRORS_COUNT => {
                state.record.errors += 1;
            }
            metric_names::OPERATIONS_COUNT => {
                state.record.operations += 1;
            }
            _ => {
                // Not in the enumerated set; stored in the aggregate but
                // drives no session-level semantics.
            }
        }

        outcome
    }

    fn apply_cardinality_cap(&self, agg: &mut Aggregate, point: &MetricPoint) {
        if agg.attribute_tuples_seen >= self.attribute_cardinality_cap {
            return; // merged into the synthetic __other__ bucket conceptually; we just stop counting new tuples.
        }
        if !point.attributes.is_empty() {
            agg.attribute_tuples_seen += 1;
        }
    }

    fn apply_tokens_total(
        &self,
        state: &mut SessionState,
        value: u64,
        timestamp_ns: i64,
        now: u64,
        outcome: &mut ProcessOutcome,
    ) {
        let previous = state.record.current_tokens;
        let previous_ts = state.record.last_tokens_sample_at;
        let previous_sample = state.record.last_tokens_sample_value;

        let is_compaction = CheckpointOptimizer::is_compaction(
            previous,
            value,
            state.record.window_size,
            self.compaction_drop_fraction,
            state.record.pending_reset_at,
            now,
            self.reset_grace_ms,
        );

        if is_compaction {
            outcome.compaction_detected = Some(state.record.utilization);
            state.record.compaction_saves += 1;
        }

        state.record.current_tokens = value;
        if state.record.pending_reset_at.is_some() && value <= previous {
            // The baseline has landed; clear the pending-reset marker (Open Question #1).
            state.record.pending_reset_at = None;
        }
        if state.suppress_decisions_until_baseline {
            // §4.6 "Re-entry from telemetry during emergency": this is the
            // post-clear baseline the bridge was waiting for; resume deciding.
            state.suppress_decisions_until_baseline = false;
        }

        let overflowed = state.record.recompute_utilization();
        if overflowed {
            outcome.invariant_violation = true;
            warn!(
                session_id = %state.record.session_id,
                "utilization reading above 1.0 clamped"
            );
        }

        // EWMA velocity (α ≈ 0.3) over the gap to the previous tokens.total sample.
        if let (Some(prev_ts), Some(prev_val)) = (previous_ts, previous_sample) {
            let dt_secs = ((timestamp_ns - prev_ts).max(1)) as f64 / 1_000_000_000.0;
            let instantaneous = ((value as i64 - prev_val as i64) as f64 / dt_secs).max(0.0);
            state.record.token_velocity = if state.record.velocity_initialized {
                self.velocity_alpha * instantaneous + (1.0 - self.velocity_alpha) * state.record.token_velocity
            } else {
                instantaneous
            };
            state.record.velocity_initialized = true;
        }
        state.record.last_tokens_sample_at = Some(timestamp_ns);
        state.record.last_tokens_sample_value = Some(value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{LearnedThresholds, MetricValue, SessionRecord};
    use std::collections::HashMap;

    fn fresh_state() -> SessionState {
        SessionState::new(
            SessionRecord::new("s-1".into(), "p".into(), None, 200_000, LearnedThresholds::default(), 0),
            4096,
            128,
        )
    }

    fn point(name: &str, value: i64, ts: i64) -> MetricPoint {
        MetricPoint {
            name: name.to_string(),
            value: MetricValue::Int(value),
            timestamp_ns: ts,
            attributes: HashMap::new(),
            is_delta: false,
        }
    }

    fn delta_point(name: &str, value: i64, ts: i64) -> MetricPoint {
        MetricPoint {
            name: name.to_string(),
            value: MetricValue::Int(value),
            timestamp_ns: ts,
            attributes: HashMap::new(),
            is_delta: true,
        }
    }

    #[test]
    fn tokens_total_updates_current_tokens_and_utilization() {
        let processor = MetricProcessor::new(60, 0.25, 64);
        let mut state = fresh_state();
        let outcome = processor.apply(&mut state, point(metric_names::TOKENS_TOTAL, 150_000, 1_000_000_000));
        assert!(outcome.updated);
        assert_eq!(state.record.current_tokens, 150_000);
        assert!((state.record.utilization - 0.75).abs() < 1e-9);
    }

    #[test]
    fn duplicate_point_is_idempotent_p8() {
        let processor = MetricProcessor::new(60, 0.25, 64);
        let mut state = fresh_state();
        processor.apply(&mut state, point(metric_names::OPERATIONS_COUNT, 1, 1_000_000_000));
        let outcome = processor.apply(&mut state, point(metric_names::OPERATIONS_COUNT, 1, 1_000_000_000));
        assert!(!outcome.updated);
        assert_eq!(state.record.operations, 1);
    }

    #[test]
    fn large_drop_without_reset_is_flagged_as_compaction() {
        let processor = MetricProcessor::new(60, 0.25, 64);
        let mut state = fresh_state();
        processor.apply(&mut state, point(metric_names::TOKENS_TOTAL, 180_000, 1_000_000_000));
        let outcome = processor.apply(
            &mut state,
            point(metric_names::TOKENS_TOTAL, 120_000, 1_500_000_000),
        );
        assert!(outcome.compaction_detected.is_some());
        assert_eq!(state.record.compaction_saves, 1);
    }

    #[test]
    fn reset_then_drop_within_grace_is_not_compaction() {
        let processor = MetricProcessor::new(60, 0.25, 64);
        let mut state = fresh_state();
        processor.apply(&mut state, point(metric_names::TOKENS_TOTAL, 180_000, 1_000_000_000));
        state.record.pending_reset_at = Some(crate::models::now_millis());
        let outcome = processor.apply(
            &mut state,
            point(metric_names::TOKENS_TOTAL, 0, 1_100_000_000),
        );
        assert!(outcome.compaction_detected.is_none());
        assert!(state.record.pending_reset_at.is_none());
    }

    #[test]
    fn context_utilization_ignored_once_current_tokens_present() {
        let processor = MetricProcessor::new(60, 0.25, 64);
        let mut state = fresh_state();
        processor.apply(&mut state, point(metric_names::TOKENS_TOTAL, 100_000, 1_000_000_000));
        let before = state.record.utilization;
        processor.apply(
            &mut state,
            point(metric_names::CONTEXT_UTILIZATION, 1, 1_100_000_000),
        );
        assert_eq!(state.record.utilization, before);
    }

    #[test]
    fn checkpoint_created_increments_counter() {
        let processor = MetricProcessor::new(60, 0.25, 64);
        let mut state = fresh_state();
        let outcome = processor.apply(
            &mut state,
            point(metric_names::CHECKPOINT_CREATED, 1, 1_000_000_000),
        );
        assert!(outcome.checkpoint_created);
        assert_eq!(state.record.checkpoints, 1);
    }

    #[test]
    fn velocity_alert_scenario_matches_spec_example_6() {
        // §8 scenario 6: 0, 6000 one second apart -> velocity ~= 6000 tok/s.
        let processor = MetricProcessor::new(60, 0.25, 64);
        let mut state = fresh_state();
        processor.apply(&mut state, point(metric_names::TOKENS_TOTAL, 0, 0));
        processor.apply(
            &mut state,
            point(metric_names::TOKENS_TOTAL, 6000, 1_000_000_000),
        );
        assert!((state.record.token_velocity - 6000.0).abs() < 1.0);
    }

    #[test]
    fn delta_temporality_accumulates_into_running_total() {
        let processor = MetricProcessor::new(60, 0.25, 64);
        let mut state = fresh_state();
        processor.apply(
            &mut state,
            delta_point(metric_names::TOKENS_TOTAL, 50_000, 1_000_000_000),
        );
        assert_eq!(state.record.current_tokens, 50_000);
        processor.apply(
            &mut state,
            delta_point(metric_names::TOKENS_TOTAL, 25_000, 2_000_000_000),
        );
        assert_eq!(state.record.current_tokens, 75_000);
    }
}
