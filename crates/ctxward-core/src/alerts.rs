//! Alert Engine (C9, §4.9): evaluates the fixed rule set on each processed
//! update and on each registry sweep, de-bounces so a flapping condition
//! doesn't spam, and keeps a bounded in-memory ring of recent alerts.

use crate::event::{EventBus, GovernorEvent};
use crate::models::{now_millis, Alert, AlertRule, Severity};
use crate::registry::SessionRegistry;
use parking_lot::Mutex;
use std::collections::{HashSet, VecDeque};

const HIGH_UTILIZATION: f64 = 0.85;
const CRITICAL_UTILIZATION: f64 = 0.95;
const HIGH_VELOCITY: f64 = 1000.0;
const PARALLEL_SESSIONS_THRESHOLD: usize = 3;

/// One input snapshot the engine reacts to per processed update (§4.9).
#[derive(Debug, Clone, Copy, Default)]
pub struct AlertInputs {
    pub utilization: f64,
    pub velocity: f64,
    pub compaction_just_detected: bool,
}

pub struct AlertEngine {
    ring: Mutex<VecDeque<Alert>>,
    capacity: usize,
    /// Rules currently "active" (triggering) per scope key, so re-evaluating
    /// the same condition on the next update doesn't re-fire (§4.9 "once per
    /// transition into the triggering state").
    active: Mutex<HashSet<(AlertRule, String)>>,
    events: EventBus,
}

impl AlertEngine {
    pub fn new(capacity: usize, events: EventBus) -> Self {
        Self {
            ring: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
            active: Mutex::new(HashSet::new()),
            events,
        }
    }

    /// Evaluate the per-session rules (`HighContextUtilization`,
    /// `CriticalContextUtilization`, `RapidTokenConsumption`,
    /// `CompactionDetected`) for one session's latest update.
    pub fn evaluate_session(&self, session_id: &str, inputs: AlertInputs) -> Vec<Alert> {
        let mut fired = Vec::new();

        self.edge_trigger(
            AlertRule::CriticalContextUtilization,
            session_id,
            inputs.utilization > CRITICAL_UTILIZATION,
            || format!("utilization {:.1}%", inputs.utilization * 100.0),
            Some(session_id),
            &mut fired,
        );
        // Critical and high-utilization are mutually exclusive states for a
        // given scope key, but they share the same underlying metric: only
        // fire the warning tier while not already critical.
        if inputs.utilization <= CRITICAL_UTILIZATION {
            self.edge_trigger(
                AlertRule::HighContextUtilization,
                session_id,
                inputs.utilization > HIGH_UTILIZATION,
                || format!("utilization {:.1}%", inputs.utilization * 100.0),
                Some(session_id),
                &mut fired,
            );
        } else {
            self.clear(AlertRule::HighContextUtilization, session_id);
        }

        self.edge_trigger(
            AlertRule::RapidTokenConsumption,
            session_id,
            inputs.velocity > HIGH_VELOCITY,
            || format!("{:.0} tokens/sec", inputs.velocity),
            Some(session_id),
            &mut fired,
        );

        if inputs.compaction_just_detected {
            // Level-triggered by nature (a discrete event, not a standing
            // condition), so always fires rather than going through
            // edge_trigger's active-set bookkeeping.
            let alert = Alert {
                rule: AlertRule::CompactionDetected,
                session_id: Some(session_id.to_string()),
                severity: AlertRule::CompactionDetected.default_severity(),
                message: "compaction detected".to_string(),
                observed_at: now_millis(),
            };
            self.record(alert.clone());
            fired.push(alert);
        }

        fired
    }

    /// Sweep the registry for `ParallelSessionsHigh` (§4.9): three or more
    /// active sessions sharing a `projectId`.
    pub async fn evaluate_parallel_sessions(&self, registry: &SessionRegistry) -> Vec<Alert> {
        let mut fired = Vec::new();
        for (project_id, count) in registry.project_session_counts().await {
            let key = project_id.as_str();
            let before = fired.len();
            self.edge_trigger(
                AlertRule::ParallelSessionsHigh,
                key,
                count >= PARALLEL_SESSIONS_THRESHOLD,
                || format!("{count} active sessions in project {key}"),
                None,
                &mut fired,
            );
            if fired.len() > before {
                // Dedicated SSE pattern event alongside the alert (§4.8 event
                // catalogue lists `pattern:parallel-sessions` separately from
                // `alert:triggered`; §8 scenario 4 asserts on the former).
                self.events.publish(GovernorEvent::ParallelSessions {
                    project_id: key.to_string(),
                    session_count: count,
                });
            }
        }
        fired
    }

    /// Supplemental rule: the store has failed `consecutive_failures` times
    /// in a row. Not in the original rule table but a natural extension of
    /// it once persistence has retry/backoff (§4.7, §4.6).
    pub fn evaluate_persistence_degraded(&self, consecutive_failures: u32) -> Option<Alert> {
        let mut fired = Vec::new();
        self.edge_trigger(
            AlertRule::PersistenceDegraded,
            "store",
            consecutive_failures >= 3,
            || format!("{consecutive_failures} consecutive persistence failures"),
            None,
            &mut fired,
        );
        fired.into_iter().next()
    }

    /// Supplemental rule: active session count is approaching the
    /// configured ceiling, so operators get a warning before new sessions
    /// start hitting capacity errors (§6 `maxConcurrentSessions`).
    pub fn evaluate_capacity_soft_limit(&self, active: usize, max: usize) -> Option<Alert> {
        if max == 0 {
            return None;
        }
        let ratio = active as f64 / max as f64;
        let mut fired = Vec::new();
        self.edge_trigger(
            AlertRule::CapacitySoftLimit,
            "registry",
            ratio >= 0.9,
            || format!("{active}/{max} active sessions"),
            None,
            &mut fired,
        );
        fired.into_iter().next()
    }

    fn edge_trigger(
        &self,
        rule: AlertRule,
        scope: &str,
        is_triggering: bool,
        message: impl FnOnce() -> String,
        session_id: Option<&str>,
        out: &mut Vec<Alert>,
    ) {
        let key = (rule, scope.to_string());
        let mut active = self.active.lock();
        let was_active = active.contains(&key);
        if is_triggering && !was_active {
            active.insert(key);
            drop(active);
            let alert = Alert {
                rule,
                session_id: session_id.map(str::to_string),
                severity: rule.default_severity(),
                message: message(),
                observed_at: now_millis(),
            };
            self.record(alert.clone());
            out.push(alert);
        } else if !is_triggering && was_active {
            active.remove(&key);
        }
    }

    fn clear(&self, rule: AlertRule, scope: &str) {
        self.active.lock().remove(&(rule, scope.to_string()));
    }

    fn record(&self, alert: Alert) {
        self.events.publish(GovernorEvent::AlertTriggered(alert.clone()));
        let mut ring = self.ring.lock();
        if ring.len() >= self.capacity {
            ring.pop_front();
        }
        ring.push_back(alert);
    }

    pub fn recent(&self) -> Vec<Alert> {
        self.ring.lock().iter().cloned().collect()
    }
}

/// Severity ordering sanity: `Info < Warning < Error < Critical` per the
/// derive on [`Severity`], used by callers that want to filter by minimum
/// severity (e.g. a future `?min_severity=` query parameter).
pub fn min_severity_at_least(severity: Severity, floor: Severity) -> bool {
    severity >= floor
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn high_utilization_fires_once_then_suppresses_while_still_high() {
        let engine = AlertEngine::new(100, EventBus::default());
        let fired1 = engine.evaluate_session(
            "s-1",
            AlertInputs {
                utilization: 0.90,
                velocity: 0.0,
                compaction_just_detected: false,
            },
        );
        assert_eq!(fired1.len(), 1);
        assert_eq!(fired1[0].rule, AlertRule::HighContextUtilization);

        let fired2 = engine.evaluate_session(
            "s-1",
            AlertInputs {
                utilization: 0.91,
                velocity: 0.0,
                compaction_just_detected: false,
            },
        );
        assert!(fired2.is_empty());
    }

    #[test]
    fn dropping_below_threshold_then_crossing_again_refires() {
        let engine = AlertEngine::new(100, EventBus::default());
        engine.evaluate_session(
            "s-1",
            AlertInputs {
                utilization: 0.90,
                velocity: 0.0,
                compaction_just_detected: false,
            },
        );
        engine.evaluate_session(
            "s-1",
            AlertInputs {
                utilization: 0.50,
                velocity: 0.0,
                compaction_just_detected: false,
            },
        );
        let fired = engine.evaluate_session(
            "s-1",
            AlertInputs {
                utilization: 0.90,
                velocity: 0.0,
                compaction_just_detected: false,
            },
        );
        assert_eq!(fired.len(), 1);
    }

    #[test]
    fn critical_and_high_are_mutually_exclusive() {
        let engine = AlertEngine::new(100, EventBus::default());
        let fired = engine.evaluate_session(
            "s-1",
            AlertInputs {
                utilization: 0.97,
                velocity: 0.0,
                compaction_just_detected: false,
            },
        );
        assert_eq!(fired.len(), 1);
        assert_eq!(fired[0].rule, AlertRule::CriticalContextUtilization);
    }

    #[test]
    fn compaction_detected_always_fires_and_is_recorded() {
        let engine = AlertEngine::new(100, EventBus::default());
        let fired = engine.evaluate_session(
            "s-1",
            AlertInputs {
                utilization: 0.5,
                velocity: 0.0,
                compaction_just_detected: true,
            },
        );
        assert_eq!(fired.len(), 1);
        assert_eq!(engine.recent().len(), 1);
    }

    #[test]
    fn ring_buffer_is_bounded() {
        let engine = AlertEngine::new(2, EventBus::default());
        for i in 0..5 {
            engine.evaluate_session(
                &format!("s-{i}"),
                AlertInputs {
                    utilization: 0.0,
                    velocity: 0.0,
                    compaction_just_detected: true,
                },
            );
        }
        assert_eq!(engine.recent().len(), 2);
    }

    #[tokio::test]
    async fn parallel_sessions_high_fires_at_three_in_same_project() {
        let engine = AlertEngine::new(100, EventBus::default());
        let registry = SessionRegistry::new(200_000, 4096, 128, std::time::Duration::from_secs(900));
        for i in 0..3 {
            registry.get_or_create(&format!("s-{i}").as_str().into(), &"proj-a".into(), None, 0);
        }
        let fired = engine.evaluate_parallel_sessions(&registry).await;
        assert_eq!(fired.len(), 1);
        assert_eq!(fired[0].rule, AlertRule::ParallelSessionsHigh);
    }
}
