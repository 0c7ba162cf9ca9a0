//! Continuous-Loop Orchestrator (C6, §4.6): the only component allowed to
//! mutate durable session state (§2 control flow). Executes the decisions
//! C5 emits against the state machine `running -> checkpointing -> running`,
//! `running -> wrapping-up -> closed`, `running -> emergency -> running`.
//!
//! Persistence I/O is spawned off the session's lock (Design Notes
//! concurrency realization): the state machine transition happens
//! synchronously under the lock, then a detached task performs the actual
//! write and briefly re-acquires the lock to record the outcome and feed
//! the optimizer. This keeps C2 (and any other session activity) from
//! blocking on disk.

use crate::alerts::AlertEngine;
use crate::event::{EventBus, GovernorEvent};
use crate::models::{now_millis, Alert, AlertRule, Decision, DecisionKind, Severity};
use crate::optimizer::CheckpointOptimizer;
use crate::registry::{OrchestratorPhase, SessionRegistry, SessionState};
use crate::store::{CheckpointRecord, SessionBlob, StateStore};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CheckpointKind {
    Recommended,
    Required,
}

enum Action {
    None,
    Checkpoint {
        generation: u64,
        kind: CheckpointKind,
    },
    Emergency {
        generation: u64,
    },
}

pub struct Orchestrator {
    store: Arc<dyn StateStore>,
    events: EventBus,
    alerts: Arc<AlertEngine>,
    attempt_timeout: Duration,
    total_budget: Duration,
    max_attempts: u32,
}

impl Orchestrator {
    pub fn new(
        store: Arc<dyn StateStore>,
        events: EventBus,
        alerts: Arc<AlertEngine>,
        attempt_timeout: Duration,
        total_budget: Duration,
        max_attempts: u32,
    ) -> Self {
        Self {
            store,
            events,
            alerts,
            attempt_timeout,
            total_budget,
            max_attempts,
        }
    }

    /// Entry point: a decision just came out of C5 for `session_id`. Alert
    /// evaluation for the utilization/velocity rules already happened in
    /// the governor's drain loop via `AlertEngine` (which debounces per
    /// §4.9); the orchestrator only executes the state-machine transition.
    pub async fn handle_decision(&self, registry: Arc<SessionRegistry>, decision: Decision) {
        let session_id = decision.session_id.clone();
        let Some(handle) = registry.get(&session_id.clone().into()) else {
            return;
        };

        let action = {
            let mut state = handle.lock().await;
            self.transition(&mut state, &decision)
        };

        match action {
            Action::None => {}
            Action::Checkpoint { generation, kind } => {
                self.spawn_checkpoint(registry.clone(), handle.clone(), session_id.clone(), generation, kind);
            }
            Action::Emergency { generation } => {
                self.spawn_emergency(registry.clone(), handle.clone(), session_id.clone(), generation);
            }
        }
    }

    /// External `wrap-up` request (§4.6, triggered via `POST /api/sessions/:id/end`).
    pub async fn wrap_up(&self, registry: Arc<SessionRegistry>, session_id: &str) {
        let Some(handle) = registry.get(&session_id.into()) else {
            return;
        };
        {
            let mut state = handle.lock().await;
            state.phase = OrchestratorPhase::WrappingUp;
        }
        let blob = {
            let state = handle.lock().await;
            blob_from_state(&state)
        };
        if let Err(e) = self.store.put_session(&session_id.into(), &blob).await {
            error!(session_id = %session_id, error = %e, "failed to persist final session state during wrap-up");
        }
        {
            let mut state = handle.lock().await;
            state.phase = OrchestratorPhase::Closed;
            state.record.status = crate::models::SessionStatus::Closed;
            state.record.last_seen_at = now_millis();
        }
        self.events.publish(GovernorEvent::SessionClosed {
            session_id: session_id.to_string(),
            reason: "wrap-up".to_string(),
        });
    }

    /// §4.6 transition table, executed under the session's lock. Mutates
    /// `phase`/`checkpoint_generation` synchronously; the actual I/O is
    /// left to the caller to spawn.
    fn transition(&self, state: &mut SessionState, decision: &Decision) -> Action {
        match decision.kind {
            DecisionKind::Proceed | DecisionKind::Warning | DecisionKind::Reset => Action::None,
            DecisionKind::CheckpointRecommended | DecisionKind::CheckpointRequired => {
                if state.phase == OrchestratorPhase::Emergency {
                    // Emergency always wins; a checkpoint request during it is ignored (§4.6).
                    return Action::None;
                }
                // Coalesce: a newer checkpoint request supersedes any in flight.
                state.checkpoint_generation += 1;
                state.checkpoint_attempts = 0;
                state.checkpoint_started_at = Some(Instant::now());
                state.phase = OrchestratorPhase::Checkpointing;
                let kind = if decision.kind == DecisionKind::CheckpointRequired {
                    CheckpointKind::Required
                } else {
                    CheckpointKind::Recommended
                };
                Action::Checkpoint {
                    generation: state.checkpoint_generation,
                    kind,
                }
            }
            DecisionKind::EmergencySaveAndClear => {
                // Cancel any in-flight checkpoint by invalidating its generation.
                state.checkpoint_generation += 1;
                state.phase = OrchestratorPhase::Emergency;
                state.suppress_decisions_until_baseline = true;
                Action::Emergency {
                    generation: state.checkpoint_generation,
                }
            }
            DecisionKind::WrapUp => {
                state.phase = OrchestratorPhase::WrappingUp;
                Action::None
            }
        }
    }

    fn spawn_checkpoint(
        &self,
        registry: Arc<SessionRegistry>,
        handle: Arc<Mutex<SessionState>>,
        session_id: String,
        generation: u64,
        kind: CheckpointKind,
    ) {
        let store = self.store.clone();
        let events = self.events.clone();
        let alerts = self.alerts.clone();
        let attempt_timeout = self.attempt_timeout;
        let total_budget = self.total_budget;
        let max_attempts = self.max_attempts;

        tokio::spawn(async move {
            let deadline = Instant::now() + total_budget;
            let mut attempt = 0u32;
            let mut last_err = None;
            let result = loop {
                attempt += 1;
                let blob = {
                    let state = handle.lock().await;
                    if state.checkpoint_generation != generation {
                        return; // superseded or cancelled, nothing to do
                    }
                    blob_from_state(&state)
                };

                let write = tokio::time::timeout(
                    attempt_timeout,
                    store.put_session(&session_id.as_str().into(), &blob),
                )
                .await;

                match write {
                    Ok(Ok(())) => break Ok(()),
                    Ok(Err(e)) => last_err = Some(e),
                    Err(_) => {
                        last_err = Some(crate::error::CoreError::PersistenceTransient {
                            session_id: session_id.clone(),
                            source: std::io::Error::new(std::io::ErrorKind::TimedOut, "checkpoint attempt timed out"),
                        })
                    }
                }

                // §6 `PersistenceTransientError`: surface once attempt 2 fails.
                if let Some(alert) = alerts.evaluate_persistence_degraded(attempt) {
                    events.publish(GovernorEvent::AlertTriggered(alert));
                }

                if attempt >= max_attempts || Instant::now() >= deadline {
                    break Err(last_err.take());
                }
                let backoff = Duration::from_millis(100 * 2u64.pow(attempt.min(6)));
                tokio::time::sleep(backoff).await;
            };

            let mut state = handle.lock().await;
            if state.checkpoint_generation != generation {
                return;
            }

            match result {
                Ok(()) => {
                    let compactions_before = state.threshold_history.compactions;
                    let record = CheckpointRecord {
                        created_at: now_millis(),
                        utilization_at_checkpoint: state.record.utilization,
                        kind: format!("{kind:?}"),
                        note: None,
                    };
                    let _ = store.append_checkpoint(&session_id.as_str().into(), &record).await;
                    state.record.checkpoints += 1;
                    state.phase = OrchestratorPhase::Running;
                    if state.threshold_history.compactions == compactions_before {
                        CheckpointOptimizer::on_checkpoint_success(
                            &session_id,
                            &mut state.record.thresholds,
                            &mut state.threshold_history,
                        );
                        let _ = store
                            .put_thresholds(&session_id.as_str().into(), &state.record.thresholds)
                            .await;
                    }
                    info!(session_id = %session_id, "checkpoint committed");
                }
                Err(e) => {
                    warn!(session_id = %session_id, error = ?e, "checkpoint failed after retry budget");
                    if state.record.utilization >= state.record.thresholds.warning_threshold {
                        // §4.6 failure semantics: escalate to emergency.
                        state.checkpoint_generation += 1;
                        let generation = state.checkpoint_generation;
                        state.phase = OrchestratorPhase::Emergency;
                        drop(state);
                        Self::run_emergency(
                            registry,
                            handle,
                            session_id,
                            generation,
                            store,
                            events,
                            alerts,
                            attempt_timeout,
                            total_budget,
                            max_attempts,
                        )
                        .await;
                    } else {
                        state.phase = OrchestratorPhase::Running;
                    }
                }
            }
        });
    }

    fn spawn_emergency(
        &self,
        registry: Arc<SessionRegistry>,
        handle: Arc<Mutex<SessionState>>,
        session_id: String,
        generation: u64,
    ) {
        let store = self.store.clone();
        let events = self.events.clone();
        let alerts = self.alerts.clone();
        let attempt_timeout = self.attempt_timeout;
        let total_budget = self.total_budget;
        let max_attempts = self.max_attempts;
        tokio::spawn(Self::run_emergency(
            registry,
            handle,
            session_id,
            generation,
            store,
            events,
            alerts,
            attempt_timeout,
            total_budget,
            max_attempts,
        ));
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_emergency(
        _registry: Arc<SessionRegistry>,
        handle: Arc<Mutex<SessionState>>,
        session_id: String,
        generation: u64,
        store: Arc<dyn StateStore>,
        events: EventBus,
        alerts: Arc<AlertEngine>,
        attempt_timeout: Duration,
        total_budget: Duration,
        max_attempts: u32,
    ) {
        let deadline = Instant::now() + total_budget;
        let mut attempt = 0u32;
        let result = loop {
            attempt += 1;
            let blob = {
                let state = handle.lock().await;
                if state.checkpoint_generation != generation {
                    return;
                }
                blob_from_state(&state)
            };
            let write = tokio::time::timeout(
                attempt_timeout,
                store.put_session(&session_id.as_str().into(), &blob),
            )
            .await;
            match write {
                Ok(Ok(())) => break Ok(()),
                Ok(Err(_)) | Err(_) => {}
            }
            // §6 `PersistenceTransientError`: surface once attempt 2 fails.
            if let Some(alert) = alerts.evaluate_persistence_degraded(attempt) {
                events.publish(GovernorEvent::AlertTriggered(alert));
            }
            if attempt >= max_attempts || Instant::now() >= deadline {
                break Err(());
            }
            tokio::time::sleep(Duration::from_millis(100 * 2u64.pow(attempt.min(6)))).await;
        };

        let mut state = handle.lock().await;
        if state.checkpoint_generation != generation {
            return;
        }

        match result {
            Ok(()) => {
                let before_tokens = state.record.current_tokens;
                let utilization_before = state.record.utilization;
                state.record.compaction_saves += 1;
                state.record.current_tokens = 0;
                state.record.recompute_utilization();
                state.record.pending_reset_at = Some(now_millis());
                state.suppress_decisions_until_baseline = true;
                state.phase = OrchestratorPhase::Running;

                CheckpointOptimizer::on_compaction_detected(
                    &session_id,
                    utilization_before,
                    &mut state.record.thresholds,
                    &mut state.threshold_history,
                );
                let _ = store
                    .put_thresholds(&session_id.as_str().into(), &state.record.thresholds)
                    .await;

                info!(session_id = %session_id, before_tokens, "emergency save-and-clear completed");
                events.publish(GovernorEvent::ContextCleared {
                    session_id: session_id.clone(),
                    new_baseline_tokens: 0,
                });
            }
            Err(()) => {
                error!(session_id = %session_id, "emergency persistence failed, closing session as failed");
                state.phase = OrchestratorPhase::Closed;
                state.record.status = crate::models::SessionStatus::Closed;
                events.publish(GovernorEvent::AlertTriggered(Alert {
                    rule: AlertRule::CompactionDetected,
                    session_id: Some(session_id.clone()),
                    severity: Severity::Critical,
                    message: "emergency save-and-clear failed; session closed".to_string(),
                    observed_at: now_millis(),
                }));
                events.publish(GovernorEvent::SessionClosed {
                    session_id,
                    reason: "emergency-persistence-failed".to_string(),
                });
            }
        }
    }
}

fn blob_from_state(state: &SessionState) -> SessionBlob {
    SessionBlob {
        session_id: state.record.session_id.to_string(),
        project_id: state.record.project_id.to_string(),
        model: state.record.model.clone(),
        current_tokens: state.record.current_tokens,
        window_size: state.record.window_size,
        operations: state.record.operations,
        checkpoints: state.record.checkpoints,
        compaction_saves: state.record.compaction_saves,
        status: format!("{:?}", state.record.status),
        saved_at: now_millis(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::DecisionPayload;
    use std::time::Duration as StdDuration;

    async fn setup() -> (Arc<SessionRegistry>, Orchestrator, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store: Arc<dyn StateStore> = Arc::new(
            crate::store::FileStateStore::new(dir.path()).await.unwrap(),
        );
        let events = EventBus::default();
        let alerts = Arc::new(AlertEngine::new(100, events.clone()));
        let orchestrator = Orchestrator::new(
            store,
            events,
            alerts,
            StdDuration::from_secs(1),
            StdDuration::from_secs(5),
            3,
        );
        let registry = Arc::new(SessionRegistry::new(
            200_000,
            4096,
            128,
            StdDuration::from_secs(900),
        ));
        (registry, orchestrator, dir)
    }

    #[tokio::test]
    async fn checkpoint_recommended_transitions_then_returns_to_running() {
        let (registry, orchestrator, _dir) = setup().await;
        registry.get_or_create(&"s-1".into(), &"p".into(), None, 0);

        let decision = Decision {
            session_id: "s-1".into(),
            kind: DecisionKind::CheckpointRecommended,
            severity: Severity::Warning,
            payload: DecisionPayload {
                utilization: Some(0.75),
                ..Default::default()
            },
            observed_at: 0,
        };
        orchestrator.handle_decision(registry.clone(), decision).await;

        // Give the spawned checkpoint task a chance to run.
        tokio::time::sleep(StdDuration::from_millis(50)).await;

        let handle = registry.get(&"s-1".into()).unwrap();
        let state = handle.lock().await;
        assert_eq!(state.phase, OrchestratorPhase::Running);
        assert_eq!(state.record.checkpoints, 1);
    }

    #[tokio::test]
    async fn emergency_resets_current_tokens_and_clears() {
        let (registry, orchestrator, _dir) = setup().await;
        let (handle, _) = registry.get_or_create(&"s-2".into(), &"p".into(), None, 0);
        {
            let mut state = handle.lock().await;
            state.record.current_tokens = 190_000;
            state.record.recompute_utilization();
        }

        let decision = Decision {
            session_id: "s-2".into(),
            kind: DecisionKind::EmergencySaveAndClear,
            severity: Severity::Critical,
            payload: DecisionPayload {
                utilization: Some(0.95),
                ..Default::default()
            },
            observed_at: 0,
        };
        orchestrator.handle_decision(registry.clone(), decision).await;
        tokio::time::sleep(StdDuration::from_millis(50)).await;

        let state = handle.lock().await;
        assert_eq!(state.record.current_tokens, 0);
        assert_eq!(state.record.compaction_saves, 1);
    }

}
