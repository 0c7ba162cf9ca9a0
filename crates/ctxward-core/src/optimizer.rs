//! Checkpoint Optimizer (C4, §4.4): the per-session threshold learner.
//!
//! Pure functions over the session's `LearnedThresholds` + `ThresholdHistory`
//! so they're trivial to unit test without touching the registry lock;
//! callers (the orchestrator, the bridge) already hold the session's single
//! writer lock when they call these.

use crate::models::{LearnedThresholds, ThresholdHistory};
use tracing::info;

pub struct CheckpointOptimizer;

impl CheckpointOptimizer {
    /// §4.4 `onCheckpointSuccess`: no compaction occurred since the prior
    /// checkpoint, so nudge `checkpointThreshold` up toward 0.85.
    pub fn on_checkpoint_success(
        session_id: &str,
        thresholds: &mut LearnedThresholds,
        history: &mut ThresholdHistory,
    ) {
        thresholds.on_checkpoint_success(history);
        info!(
            session_id,
            checkpoint_threshold = thresholds.checkpoint_threshold,
            "checkpoint threshold relaxed after successful checkpoint"
        );
    }

    /// §4.4 `onCompactionDetected`: aggressively lower all three thresholds.
    /// Returns the resulting drop in `checkpointThreshold`, used to verify P6.
    pub fn on_compaction_detected(
        session_id: &str,
        utilization_before: f64,
        thresholds: &mut LearnedThresholds,
        history: &mut ThresholdHistory,
    ) -> f64 {
        let drop = thresholds.on_compaction_detected(utilization_before, history);
        info!(
            session_id,
            utilization_before,
            checkpoint_threshold = thresholds.checkpoint_threshold,
            drop,
            "thresholds lowered after detected compaction"
        );
        drop
    }

    /// §4.4 detection rule: a `currentTokens` drop of at least
    /// `compaction_drop_fraction * windowSize` between consecutive updates,
    /// not preceded by an explicit reset within `reset_grace_ms`.
    pub fn is_compaction(
        previous_tokens: u64,
        current_tokens: u64,
        window_size: u64,
        compaction_drop_fraction: f64,
        pending_reset_at: Option<u64>,
        now: u64,
        reset_grace_ms: u64,
    ) -> bool {
        if current_tokens >= previous_tokens {
            return false;
        }
        let drop = previous_tokens - current_tokens;
        let threshold = (window_size as f64 * compaction_drop_fraction) as u64;
        if drop < threshold {
            return false;
        }
        if let Some(reset_at) = pending_reset_at {
            if now.saturating_sub(reset_at) <= reset_grace_ms {
                return false;
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drop_below_fraction_is_not_compaction() {
        assert!(!CheckpointOptimizer::is_compaction(
            100_000, 90_000, 200_000, 0.25, None, 0, 2000
        ));
    }

    #[test]
    fn drop_at_or_above_fraction_is_compaction() {
        assert!(CheckpointOptimizer::is_compaction(
            180_000, 120_000, 200_000, 0.25, None, 0, 2000
        ));
    }

    #[test]
    fn explicit_reset_within_grace_window_suppresses_detection() {
        assert!(!CheckpointOptimizer::is_compaction(
            180_000,
            120_000,
            200_000,
            0.25,
            Some(1000),
            1500,
            2000
        ));
    }

    #[test]
    fn reset_outside_grace_window_still_detects() {
        assert!(CheckpointOptimizer::is_compaction(
            180_000,
            120_000,
            200_000,
            0.25,
            Some(0),
            5000,
            2000
        ));
    }

    #[test]
    fn increasing_tokens_is_never_compaction() {
        assert!(!CheckpointOptimizer::is_compaction(
            100_000, 150_000, 200_000, 0.25, None, 0, 2000
        ));
    }
}
