//! Wires C1's ingest queue through C2 (process) -> C3 (registry) -> C5
//! (bridge) -> C6 (orchestrator) -> C8 (event bus) -> C9 (alerts), and owns
//! the background task that drains points in FIFO order plus the graceful
//! shutdown sequence (§5 "Cancellation & timeouts").
//!
//! This is the top-level assembly a binary depends on; it has no direct
//! counterpart in `spec.md`'s component table because §2 describes the
//! components, not how a single process glues them together.

use crate::alerts::{AlertEngine, AlertInputs};
use crate::bridge::ContextBridge;
use crate::config::Config;
use crate::event::{EventBus, GovernorEvent};
use crate::ingest_queue::{IngestItem, IngestQueue};
use crate::models::{now_millis, DecisionKind, SessionStatus};
use crate::orchestrator::Orchestrator;
use crate::otlp::DecodedBatch;
use crate::processor::MetricProcessor;
use crate::registry::SessionRegistry;
use crate::store::StateStore;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Shared handles every component of the pipeline needs. Cloned cheaply
/// (everything inside is already `Arc`/`Clone`) and passed to HTTP handlers
/// in `ctxward-web` as well as the drain loop here.
#[derive(Clone)]
pub struct Governor {
    pub registry: Arc<SessionRegistry>,
    pub queue: IngestQueue,
    pub events: EventBus,
    pub alerts: Arc<AlertEngine>,
    pub store: Arc<dyn StateStore>,
    processor: Arc<MetricProcessor>,
    bridge: Arc<ContextBridge>,
    orchestrator: Arc<Orchestrator>,
    processed_count: Arc<AtomicU64>,
    drain_shutdown: Arc<Notify>,
    /// §9 Open Question resolution: when set, telemetry without an
    /// explicit `claude.session.id` is rejected rather than assigned a
    /// synthetic, collision-prone id.
    strict_session_id: bool,
    /// §6 `maxConcurrentSessions`: soft limit only, checked by the
    /// housekeeping sweep's `CapacitySoftLimit` alert.
    max_concurrent_sessions: usize,
}

/// A batch was rejected before any point reached the queue (§4.1, §9 Open
/// Question on session-id disambiguation).
#[derive(Debug, thiserror::Error)]
pub enum IngestRejected {
    #[error("claude.session.id is required in strict mode and was not present")]
    MissingSessionId,
}

impl Governor {
    pub fn new(config: &Config, store: Arc<dyn StateStore>) -> Self {
        let events = EventBus::new(config.sse_replay_buffer);
        let default_thresholds = crate::models::LearnedThresholds::seeded(
            config.checkpoint_threshold,
            config.warning_threshold,
            config.compaction_threshold,
            config.learning_rate,
        );
        let registry = Arc::new(SessionRegistry::with_default_thresholds(
            config.context_window_size,
            config.dedup_lru_capacity,
            config.metric_window_capacity,
            Duration::from_secs(config.retention_after_close_secs),
            default_thresholds,
        ));
        let queue = IngestQueue::new(config.ingest_queue_capacity);
        let alerts = Arc::new(AlertEngine::new(100, events.clone()));
        let processor = Arc::new(MetricProcessor::new(
            config.metric_watermark_secs,
            config.compaction_drop_fraction,
            config.attribute_cardinality_cap,
        ));
        let bridge = Arc::new(ContextBridge::new(config.high_velocity_tokens_per_sec));
        let orchestrator = Arc::new(Orchestrator::new(
            store.clone(),
            events.clone(),
            alerts.clone(),
            Duration::from_secs(config.checkpoint_attempt_timeout_secs),
            Duration::from_secs(config.checkpoint_total_budget_secs),
            config.checkpoint_max_attempts,
        ));

        Self {
            registry,
            queue,
            events,
            alerts,
            store,
            processor,
            bridge,
            orchestrator,
            processed_count: Arc::new(AtomicU64::new(0)),
            drain_shutdown: Arc::new(Notify::new()),
            strict_session_id: config.strict_session_id,
            max_concurrent_sessions: config.max_concurrent_sessions,
        }
    }

    /// Accept a decoded OTLP batch from C1, assigning/creating the session
    /// and enqueueing each point for the drain loop (§4.1). Rejects the
    /// batch outright when `strict_session_id` is set and no
    /// `claude.session.id` was present (§9 Open Question).
    pub fn ingest(&self, batch: DecodedBatch) -> Result<(), IngestRejected> {
        if self.strict_session_id && batch.identity.claude_session_id.is_none() {
            return Err(IngestRejected::MissingSessionId);
        }

        let session_id = match batch.identity.claude_session_id.clone() {
            Some(id) => id,
            None => {
                // §4.1 fallback identity: service.instance.id, else a
                // synthetic id derived from project.path so telemetry
                // without an explicit session id still lands somewhere
                // instead of being dropped. This weak form is ambiguous
                // (two processes in the same project collide); salting with
                // the remote address is a transport-layer detail this
                // transport-free core does not see, so `strict_session_id`
                // is the documented way to refuse this ambiguity outright
                // in production.
                let fallback = batch.identity.service_instance_id.clone().unwrap_or_else(|| {
                    format!(
                        "unknown-{}",
                        batch.identity.project_path.as_deref().unwrap_or("anon")
                    )
                });
                warn!(
                    session_id = %fallback,
                    "claude.session.id absent; assigned weak fallback identity, may collide across processes"
                );
                fallback
            }
        };
        let project_id = batch
            .identity
            .project_name
            .clone()
            .unwrap_or_else(|| "unassigned".to_string());

        let (handle, created) = self.registry.get_or_create(
            &session_id.as_str().into(),
            &project_id.as_str().into(),
            batch.identity.model_name.as_deref(),
            now_millis(),
        );
        if created {
            self.events.publish(GovernorEvent::SessionCreated {
                session_id: session_id.clone(),
                project_id: project_id.clone(),
            });
        }
        drop(handle); // created lazily by get_or_create; the drain loop does the actual work.

        for point in batch.points {
            self.queue.push(IngestItem {
                session_id: session_id.clone(),
                point,
            });
        }
        Ok(())
    }

    /// Spawn the background drain loop. Returns a handle the caller can
    /// join during shutdown.
    pub fn spawn_drain_loop(&self) -> JoinHandle<()> {
        let this = self.clone();
        tokio::spawn(async move { this.drain_loop().await })
    }

    async fn drain_loop(&self) {
        info!("governor drain loop started");
        loop {
            tokio::select! {
                biased;
                _ = self.drain_shutdown.notified() => {
                    debug!("drain loop received shutdown signal");
                    break;
                }
                maybe_point = self.queue.pop() => {
                    match maybe_point {
                        Some(tagged) => self.process_one(tagged).await,
                        None => break, // queue closed and drained
                    }
                }
            }
        }
        info!(processed = self.processed_count.load(Ordering::Relaxed), "governor drain loop exiting");
    }

    async fn process_one(&self, tagged: IngestItem) {
        let Some(session_handle) = self.registry.get(&tagged.session_id.as_str().into()) else {
            warn!(session_id = %tagged.session_id, "dropping point for unknown session");
            return;
        };

        let (outcome, snapshot, decision) = {
            let mut state = session_handle.lock().await;
            let outcome = self.processor.apply(&mut state, tagged.point);
            if !outcome.updated {
                return;
            }
            // §4.6 "Re-entry from telemetry during emergency": keep
            // accepting metrics but stop running them through the bridge
            // until the processor has cleared this on a post-clear baseline.
            let decision = if state.suppress_decisions_until_baseline {
                None
            } else {
                Some(self.bridge.decide(
                    &tagged.session_id,
                    state.record.utilization,
                    state.record.token_velocity,
                    state.record.window_size,
                    &state.record.thresholds,
                ))
            };
            let snapshot = (
                state.record.current_tokens,
                state.record.utilization,
                state.record.token_velocity,
            );
            (outcome, snapshot, decision)
        };

        self.processed_count.fetch_add(1, Ordering::Relaxed);

        self.events.publish(GovernorEvent::SessionUpdated {
            session_id: tagged.session_id.clone(),
            current_tokens: snapshot.0,
            utilization: snapshot.1,
        });

        let alert_inputs = AlertInputs {
            utilization: snapshot.1,
            velocity: snapshot.2,
            compaction_just_detected: outcome.compaction_detected.is_some(),
        };
        self.alerts.evaluate_session(&tagged.session_id, alert_inputs);

        let Some(decision) = decision else {
            return;
        };

        if decision.kind == DecisionKind::Warning && decision.payload.reason.as_deref() == Some("high-velocity") {
            // Dedicated SSE pattern event alongside the generic `decision`
            // event (§4.8 event catalogue lists `pattern:high-velocity`
            // separately; §8 scenario 6 exercises this path).
            self.events.publish(GovernorEvent::HighVelocity {
                session_id: tagged.session_id.clone(),
                tokens_per_sec: snapshot.2,
            });
        }

        self.events.publish(GovernorEvent::Decision(decision.clone()));
        self.orchestrator.handle_decision(self.registry.clone(), decision).await;
    }

    /// Periodic housekeeping (§3 lifecycle, §4.9 `ParallelSessionsHigh`):
    /// flips sessions silent past `idle_after` from `Active` to `Idle`,
    /// evicts sessions closed past the retention window, and re-evaluates
    /// the fleet-level alert rules. Intended to be called on a fixed
    /// interval (e.g. every 30s) by the binary's housekeeping task.
    pub async fn sweep_idle_sessions(&self, idle_after: Duration) {
        let now = now_millis();
        let idle_after_ms = idle_after.as_millis() as u64;
        for snap in self.registry.list_active().await {
            if snap.status != SessionStatus::Active {
                continue;
            }
            let Some(handle) = self.registry.get(&snap.session_id) else {
                continue;
            };
            let mut state = handle.lock().await;
            if state.record.status == SessionStatus::Active
                && now.saturating_sub(state.record.last_seen_at) > idle_after_ms
            {
                state.record.status = SessionStatus::Idle;
            }
        }

        self.registry.evict_expired(now).await;
        let parallel_alerts = self.alerts.evaluate_parallel_sessions(&self.registry).await;
        for alert in parallel_alerts {
            self.events.publish(GovernorEvent::AlertTriggered(alert));
        }

        if let Some(alert) = self
            .alerts
            .evaluate_capacity_soft_limit(self.registry.active_count(), self.max_concurrent_sessions)
        {
            self.events.publish(GovernorEvent::AlertTriggered(alert));
        }
    }

    /// §5 shutdown sequence: stop accepting, drain with a deadline, flush
    /// the store, close.
    pub async fn shutdown(&self, drain_deadline: Duration) {
        info!("governor shutdown: closing ingest queue");
        self.queue.close();
        self.drain_shutdown.notify_one();

        let deadline = tokio::time::Instant::now() + drain_deadline;
        while !self.queue.is_empty() && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        if !self.queue.is_empty() {
            warn!(remaining = self.queue.len(), "drain deadline exceeded; remaining points dropped");
        }

        if let Err(e) = self.store.close().await {
            warn!(error = %e, "error closing state store during shutdown");
        }
        info!("governor shutdown complete");
    }

    pub fn processed_count(&self) -> u64 {
        self.processed_count.load(Ordering::Relaxed)
    }

    /// `POST /api/sessions/:id/end` (§4.8): external wrap-up request routed
    /// straight to C6.
    pub async fn wrap_up_session(&self, session_id: &str) {
        self.orchestrator.wrap_up(self.registry.clone(), session_id).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::MetricPoint;
    use crate::otlp::ResourceIdentity;
    use std::collections::HashMap;

    fn test_config(dir: &std::path::Path) -> Config {
        let mut c = Config::default();
        c.data_dir = dir.to_path_buf();
        c
    }

    #[tokio::test]
    async fn ingest_creates_session_and_drain_loop_updates_tokens() {
        let dir = tempfile::tempdir().unwrap();
        let store: Arc<dyn StateStore> = Arc::new(crate::store::FileStateStore::new(dir.path()).await.unwrap());
        let config = test_config(dir.path());
        let governor = Governor::new(&config, store);
        let drain = governor.spawn_drain_loop();

        let batch = DecodedBatch {
            identity: ResourceIdentity {
                service_name: Some("claude-code".into()),
                service_instance_id: None,
                claude_session_id: Some("sess-1".into()),
                project_name: Some("proj-a".into()),
                project_path: None,
                model_name: Some("claude-opus".into()),
            },
            points: vec![MetricPoint {
                name: "claude.tokens.total".to_string(),
                value: crate::models::MetricValue::Int(120_000),
                timestamp_ns: 1_000_000_000,
                attributes: HashMap::new(),
                is_delta: false,
            }],
            unknown_shapes: 0,
        };
        governor.ingest(batch).unwrap();

        // Give the drain loop a moment to process.
        tokio::time::sleep(Duration::from_millis(100)).await;

        let snap = governor
            .registry
            .get_snapshot(&"sess-1".into())
            .await
            .expect("session should exist");
        assert_eq!(snap.current_tokens, 120_000);

        governor.shutdown(Duration::from_secs(1)).await;
        let _ = drain.await;
    }

    #[tokio::test]
    async fn strict_mode_rejects_telemetry_without_claude_session_id() {
        let dir = tempfile::tempdir().unwrap();
        let store: Arc<dyn StateStore> = Arc::new(crate::store::FileStateStore::new(dir.path()).await.unwrap());
        let mut config = test_config(dir.path());
        config.strict_session_id = true;
        let governor = Governor::new(&config, store);

        let batch = DecodedBatch {
            identity: ResourceIdentity {
                service_name: Some("claude-code".into()),
                service_instance_id: Some("inst-1".into()),
                claude_session_id: None,
                project_name: Some("proj-a".into()),
                project_path: None,
                model_name: None,
            },
            points: vec![],
            unknown_shapes: 0,
        };
        let result = governor.ingest(batch);
        assert!(matches!(result, Err(IngestRejected::MissingSessionId)));
    }

    #[tokio::test]
    async fn lenient_mode_falls_back_to_weak_identity() {
        let dir = tempfile::tempdir().unwrap();
        let store: Arc<dyn StateStore> = Arc::new(crate::store::FileStateStore::new(dir.path()).await.unwrap());
        let config = test_config(dir.path());
        let governor = Governor::new(&config, store);

        let batch = DecodedBatch {
            identity: ResourceIdentity {
                service_name: Some("claude-code".into()),
                service_instance_id: None,
                claude_session_id: None,
                project_name: Some("proj-a".into()),
                project_path: Some("/repo/proj-a".into()),
                model_name: None,
            },
            points: vec![],
            unknown_shapes: 0,
        };
        governor.ingest(batch).unwrap();
        assert_eq!(governor.registry.len(), 1);
    }
}
