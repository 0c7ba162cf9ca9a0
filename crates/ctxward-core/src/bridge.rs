//! Context Bridge (C5, §4.5): translates a processed update into exactly
//! one safety [`Decision`] (P5, decision totality).

use crate::models::{now_millis, Decision, DecisionKind, DecisionPayload, LearnedThresholds, Severity};

pub struct ContextBridge {
    pub high_velocity_tokens_per_sec: f64,
}

impl ContextBridge {
    pub fn new(high_velocity_tokens_per_sec: f64) -> Self {
        Self {
            high_velocity_tokens_per_sec,
        }
    }

    /// §4.5 decision ladder, evaluated in order: emergency, then required,
    /// then recommended, then the high-velocity warning, else proceed.
    pub fn decide(
        &self,
        session_id: &str,
        utilization: f64,
        velocity: f64,
        window_size: u64,
        thresholds: &LearnedThresholds,
    ) -> Decision {
        let now = now_millis();
        let u = utilization;
        let v = velocity;

        if u >= thresholds.compaction_threshold {
            return Decision {
                session_id: session_id.to_string(),
                kind: DecisionKind::EmergencySaveAndClear,
                severity: Severity::Critical,
                payload: DecisionPayload {
                    utilization: Some(u),
                    velocity: Some(v),
                    ..Default::default()
                },
                observed_at: now,
            };
        }

        if u >= thresholds.warning_threshold {
            let eta = (thresholds.compaction_threshold - u) * window_size as f64 / v.max(1.0);
            return Decision {
                session_id: session_id.to_string(),
                kind: DecisionKind::CheckpointRequired,
                severity: Severity::Critical,
                payload: DecisionPayload {
                    eta_to_compaction_secs: Some(eta),
                    utilization: Some(u),
                    velocity: Some(v),
                    ..Default::default()
                },
                observed_at: now,
            };
        }

        if u >= thresholds.checkpoint_threshold {
            return Decision {
                session_id: session_id.to_string(),
                kind: DecisionKind::CheckpointRecommended,
                severity: Severity::Warning,
                payload: DecisionPayload {
                    utilization: Some(u),
                    velocity: Some(v),
                    ..Default::default()
                },
                observed_at: now,
            };
        }

        if v >= self.high_velocity_tokens_per_sec {
            return Decision {
                session_id: session_id.to_string(),
                kind: DecisionKind::Warning,
                severity: Severity::Warning,
                payload: DecisionPayload {
                    reason: Some("high-velocity".to_string()),
                    utilization: Some(u),
                    velocity: Some(v),
                    ..Default::default()
                },
                observed_at: now,
            };
        }

        Decision {
            session_id: session_id.to_string(),
            kind: DecisionKind::Proceed,
            severity: Severity::Info,
            payload: DecisionPayload {
                utilization: Some(u),
                velocity: Some(v),
                ..Default::default()
            },
            observed_at: now,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn thresholds() -> LearnedThresholds {
        LearnedThresholds::default()
    }

    #[test]
    fn low_utilization_proceeds() {
        let bridge = ContextBridge::new(1000.0);
        let d = bridge.decide("s", 0.1, 10.0, 200_000, &thresholds());
        assert_eq!(d.kind, DecisionKind::Proceed);
    }

    #[test]
    fn reaching_checkpoint_threshold_recommends() {
        let bridge = ContextBridge::new(1000.0);
        let d = bridge.decide("s", 0.75, 10.0, 200_000, &thresholds());
        assert_eq!(d.kind, DecisionKind::CheckpointRecommended);
    }

    #[test]
    fn reaching_warning_threshold_requires_checkpoint_with_eta() {
        let bridge = ContextBridge::new(1000.0);
        let d = bridge.decide("s", 0.86, 1000.0, 200_000, &thresholds());
        assert_eq!(d.kind, DecisionKind::CheckpointRequired);
        assert!(d.payload.eta_to_compaction_secs.is_some());
    }

    #[test]
    fn reaching_compaction_threshold_emergency() {
        let bridge = ContextBridge::new(1000.0);
        let d = bridge.decide("s", 0.96, 10.0, 200_000, &thresholds());
        assert_eq!(d.kind, DecisionKind::EmergencySaveAndClear);
    }

    #[test]
    fn high_velocity_below_checkpoint_threshold_warns() {
        let bridge = ContextBridge::new(1000.0);
        let d = bridge.decide("s", 0.1, 6000.0, 200_000, &thresholds());
        assert_eq!(d.kind, DecisionKind::Warning);
        assert_eq!(d.payload.reason.as_deref(), Some("high-velocity"));
    }

    #[test]
    fn normal_ramp_scenario_matches_spec_example() {
        // §8 scenario 1: 10000, 50000, 120000, 150000 on a 200000 window.
        let bridge = ContextBridge::new(1000.0);
        let t = thresholds();
        let utils = [10_000.0, 50_000.0, 120_000.0, 150_000.0].map(|tok| tok / 200_000.0);
        let kinds: Vec<_> = utils
            .iter()
            .map(|u| bridge.decide("s-1", *u, 0.0, 200_000, &t).kind)
            .collect();
        assert_eq!(
            kinds,
            vec![
                DecisionKind::Proceed,
                DecisionKind::Proceed,
                DecisionKind::Proceed,
                DecisionKind::CheckpointRecommended,
            ]
        );
        assert!((utils[3] - 0.75).abs() < 0.001);
    }
}
