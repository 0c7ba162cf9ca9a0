//! Session Registry (C3, §4.3) and the per-session single-writer state it owns.
//!
//! Realizes the §5/§9 "per-session actor vs striped mutex" choice as a
//! striped mutex keyed by `sessionId`: one `tokio::sync::Mutex<SessionState>`
//! per session behind a `DashMap<SessionId, Arc<SessionMetadata>>`. This
//! enforces P1 (isolation) by construction — mutating session A can never
//! touch B's entry in the map.

use crate::dedup::DedupCache;
use crate::models::{LearnedThresholds, ProjectId, SessionId, SessionRecord, SessionStatus, ThresholdHistory};
use dashmap::DashMap;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

/// C6's running state machine for one session (§4.6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrchestratorPhase {
    Running,
    Checkpointing,
    WrappingUp,
    Emergency,
    Closed,
}

/// Everything mutated behind the single-writer lock for one session: the
/// durable-shaped record, its dedup cache, its orchestrator phase, and the
/// bookkeeping the orchestrator needs for coalescing/escalation (§4.6 edge
/// cases).
pub struct SessionState {
    pub record: SessionRecord,
    pub dedup: DedupCache,
    pub threshold_history: ThresholdHistory,
    pub phase: OrchestratorPhase,
    /// Monotonically increasing; a checkpoint started while another is
    /// already in flight supersedes it by generation number (§4.6 "coalesce").
    pub checkpoint_generation: u64,
    pub checkpoint_attempts: u32,
    pub checkpoint_started_at: Option<Instant>,
    /// Set while in `Emergency` and awaiting the post-clear baseline update
    /// (§4.6 "Re-entry from telemetry during emergency"); cleared by the
    /// processor when the next `tokens.total` sample lands.
    pub suppress_decisions_until_baseline: bool,
    /// `config.metric_window_capacity` (§6), carried per session so the
    /// processor can size each metric's ring buffer without a global.
    pub window_capacity: usize,
}

impl SessionState {
    pub(crate) fn new(record: SessionRecord, dedup_capacity: usize, window_capacity: usize) -> Self {
        Self {
            dedup: DedupCache::new(dedup_capacity),
            record,
            threshold_history: ThresholdHistory::default(),
            phase: OrchestratorPhase::Running,
            checkpoint_generation: 0,
            checkpoint_attempts: 0,
            checkpoint_started_at: None,
            suppress_decisions_until_baseline: false,
            window_capacity,
        }
    }
}

/// Owns the set of live sessions and their lifecycle (C3).
pub struct SessionRegistry {
    sessions: DashMap<SessionId, Arc<Mutex<SessionState>>>,
    dedup_capacity: usize,
    window_capacity: usize,
    default_window_size: u64,
    retention: Duration,
    suspicious_collisions: AtomicU64,
    /// Global seed for newly created sessions (§3 "may be seeded from a
    /// global default"), taken from `Config` at startup.
    default_thresholds: LearnedThresholds,
}

/// Cheap copy-on-read snapshot of one session for publication (§4.3 `listActive`).
#[derive(Debug, Clone, Serialize)]
pub struct SessionSnapshot {
    pub session_id: SessionId,
    pub project_id: ProjectId,
    pub model: Option<String>,
    pub status: SessionStatus,
    pub current_tokens: u64,
    pub window_size: u64,
    pub utilization: f64,
    pub token_velocity: f64,
    pub operations: u64,
    pub checkpoints: u64,
    pub compaction_saves: u64,
}

impl From<&SessionRecord> for SessionSnapshot {
    fn from(r: &SessionRecord) -> Self {
        Self {
            session_id: r.session_id.clone(),
            project_id: r.project_id.clone(),
            model: r.model.clone(),
            status: r.status,
            current_tokens: r.current_tokens,
            window_size: r.window_size,
            utilization: r.utilization,
            token_velocity: r.token_velocity,
            operations: r.operations,
            checkpoints: r.checkpoints,
            compaction_saves: r.compaction_saves,
        }
    }
}

impl SessionRegistry {
    pub fn new(
        default_window_size: u64,
        dedup_capacity: usize,
        window_capacity: usize,
        retention: Duration,
    ) -> Self {
        Self::with_default_thresholds(
            default_window_size,
            dedup_capacity,
            window_capacity,
            retention,
            LearnedThresholds::default(),
        )
    }

    pub fn with_default_thresholds(
        default_window_size: u64,
        dedup_capacity: usize,
        window_capacity: usize,
        retention: Duration,
        default_thresholds: LearnedThresholds,
    ) -> Self {
        Self {
            sessions: DashMap::new(),
            dedup_capacity,
            window_capacity,
            default_window_size,
            retention,
            suspicious_collisions: AtomicU64::new(0),
            default_thresholds,
        }
    }

    /// `getOrCreate` (§4.3): atomic, exactly one creation per id. Returns
    /// the session handle and whether it was newly created.
    pub fn get_or_create(
        &self,
        session_id: &SessionId,
        project_id: &ProjectId,
        model: Option<&str>,
        now: u64,
    ) -> (Arc<Mutex<SessionState>>, bool) {
        if let Some(existing) = self.sessions.get(session_id) {
            return (existing.clone(), false);
        }

        // Two distinct telemetry sources claiming the same id race here;
        // `DashMap::entry` makes the creation atomic and lets us detect the
        // collision after the fact by comparing project ids (§4.3 tie-breaks).
        let mut created = false;
        let handle = self
            .sessions
            .entry(session_id.clone())
            .or_insert_with(|| {
                created = true;
                Arc::new(Mutex::new(SessionState::new(
                    SessionRecord::new(
                        session_id.clone(),
                        project_id.clone(),
                        model.map(str::to_string),
                        self.default_window_size,
                        self.default_thresholds,
                        now,
                    ),
                    self.dedup_capacity,
                    self.window_capacity,
                )))
            })
            .clone();

        if !created {
            self.suspicious_collisions.fetch_add(1, Ordering::Relaxed);
        }
        (handle, created)
    }

    pub fn get(&self, session_id: &SessionId) -> Option<Arc<Mutex<SessionState>>> {
        self.sessions.get(session_id).map(|e| e.clone())
    }

    pub fn suspicious_collisions(&self) -> u64 {
        self.suspicious_collisions.load(Ordering::Relaxed)
    }

    pub fn retention(&self) -> Duration {
        self.retention
    }

    pub fn active_count(&self) -> usize {
        self.sessions
            .iter()
            .filter(|e| !matches!(e.value().try_lock().map(|s| s.record.status), Ok(SessionStatus::Closed)))
            .count()
    }

    /// Copy-on-read snapshot for C8 (§4.3 `listActive`). Best-effort: a
    /// session whose lock is momentarily held by the single writer is
    /// skipped rather than blocking the reader.
    pub async fn list_active(&self) -> Vec<SessionSnapshot> {
        let mut out = Vec::with_capacity(self.sessions.len());
        let handles: Vec<_> = self.sessions.iter().map(|e| e.value().clone()).collect();
        for handle in handles {
            let state = handle.lock().await;
            out.push(SessionSnapshot::from(&state.record));
        }
        out
    }

    pub async fn get_snapshot(&self, session_id: &SessionId) -> Option<SessionSnapshot> {
        let handle = self.get(session_id)?;
        let state = handle.lock().await;
        Some(SessionSnapshot::from(&state.record))
    }

    /// Sessions grouped by project, used by C9's `ParallelSessionsHigh` rule.
    pub async fn project_session_counts(&self) -> std::collections::HashMap<ProjectId, usize> {
        let mut counts = std::collections::HashMap::new();
        for snap in self.list_active().await {
            if !matches!(snap.status, SessionStatus::Closed) {
                *counts.entry(snap.project_id).or_insert(0) += 1;
            }
        }
        counts
    }

    /// Evict sessions that closed more than `retention` ago (§3 lifecycle).
    pub async fn evict_expired(&self, now: u64) {
        let mut to_remove = Vec::new();
        for entry in self.sessions.iter() {
            let state = entry.value().lock().await;
            if matches!(state.record.status, SessionStatus::Closed) {
                let closed_for = now.saturating_sub(state.record.last_seen_at);
                if closed_for > self.retention.as_millis() as u64 {
                    to_remove.push(entry.key().clone());
                }
            }
        }
        for id in to_remove {
            self.sessions.remove(&id);
        }
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }
}
