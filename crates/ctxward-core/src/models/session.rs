//! Session identity, status, execution plan and the per-session record (§3).

use crate::models::{Aggregate, LearnedThresholds};
use serde::{Deserialize, Serialize};
use std::borrow::Borrow;
use std::collections::HashMap;
use std::fmt;
use std::ops::Deref;
use std::time::{SystemTime, UNIX_EPOCH};

/// Opaque session identifier. Treated as an uninterpreted string per §3.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for SessionId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for SessionId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Deref for SessionId {
    type Target = str;
    fn deref(&self) -> &str {
        &self.0
    }
}

impl Borrow<str> for SessionId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

/// Coarser grouping used for fleet-level patterns and display only (§ Glossary).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProjectId(String);

impl ProjectId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for ProjectId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for ProjectId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl fmt::Display for ProjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Session lifecycle status (§3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SessionStatus {
    Active,
    Idle,
    WrappingUp,
    Closed,
}

/// Task status inside an [`ExecutionPlan`] (§3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
}

/// One task in a session's execution plan. Opaque to the core beyond its
/// status/progress fields, which drive no governor decisions by themselves.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub content: String,
    pub status: TaskStatus,
    /// 0-100.
    pub progress: u8,
    pub active_form: Option<String>,
}

/// Ordered sequence of tasks owned by a session, updated by external
/// callers through `POST /api/sessions/:id/plan` (§3, §4.8).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExecutionPlan {
    pub tasks: Vec<Task>,
}

impl ExecutionPlan {
    pub fn replace(&mut self, tasks: Vec<Task>) {
        self.tasks = tasks;
    }
}

/// Freeform progress fields an external controller can push via
/// `POST /api/sessions/:id/update` (§4.8). Opaque to the governor: these
/// never feed the decision ladder, they only ride along for display.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExternalStatus {
    pub current_task: Option<String>,
    pub phase: Option<String>,
    pub quality_score: Option<f64>,
    pub iteration: Option<u64>,
}

impl ExternalStatus {
    /// Apply whichever fields were present in the request; absent fields
    /// keep their previous value rather than being reset to `None`.
    pub fn apply(&mut self, update: ExternalStatusUpdate) {
        if update.current_task.is_some() {
            self.current_task = update.current_task;
        }
        if update.phase.is_some() {
            self.phase = update.phase;
        }
        if update.quality_score.is_some() {
            self.quality_score = update.quality_score;
        }
        if update.iteration.is_some() {
            self.iteration = update.iteration;
        }
    }
}

/// Wire shape for `POST /api/sessions/:id/update`; every field optional so a
/// caller can patch just one of them.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ExternalStatusUpdate {
    pub current_task: Option<String>,
    pub phase: Option<String>,
    pub quality_score: Option<f64>,
    pub iteration: Option<u64>,
}

/// Monotonic epoch-millisecond timestamp helper. The governor treats event
/// times as monotonic per §3; callers outside this module should not reach
/// for `SystemTime` directly so that tests can inject times.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// The live, in-memory record for one session (§3 `Session` entity).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionRecord {
    pub session_id: SessionId,
    pub project_id: ProjectId,
    pub model: Option<String>,
    pub created_at: u64,
    pub last_seen_at: u64,
    pub status: SessionStatus,

    pub current_tokens: u64,
    pub window_size: u64,
    pub utilization: f64,
    pub token_velocity: f64,

    pub operations: u64,
    pub checkpoints: u64,
    pub compaction_saves: u64,

    pub execution_plan: ExecutionPlan,
    pub external: ExternalStatus,
    pub thresholds: LearnedThresholds,

    /// Per-metric aggregates, keyed by metric name (§3 `Aggregate`).
    pub aggregates: HashMap<String, Aggregate>,

    /// Set when a `claude.context.reset` was observed and the next
    /// `claude.tokens.total` reading should be treated as a new baseline
    /// rather than a compaction (§4.2, Open Question #1).
    pub pending_reset_at: Option<u64>,

    /// Timestamp of the last sample used for velocity/compaction detection,
    /// to avoid mixing units across metrics with different cadences.
    pub last_tokens_sample_at: Option<u64>,
    pub last_tokens_sample_value: Option<u64>,
    /// Whether `token_velocity` has ever been set from a real sample pair;
    /// the first pair defines the baseline directly instead of blending
    /// against an artificial zero.
    pub velocity_initialized: bool,

    pub errors: u64,
    pub suspicious_collisions: u64,
}

impl SessionRecord {
    pub fn new(
        session_id: SessionId,
        project_id: ProjectId,
        model: Option<String>,
        window_size: u64,
        thresholds: LearnedThresholds,
        now: u64,
    ) -> Self {
        Self {
            session_id,
            project_id,
            model,
            created_at: now,
            last_seen_at: now,
            status: SessionStatus::Active,
            current_tokens: 0,
            window_size,
            utilization: 0.0,
            token_velocity: 0.0,
            operations: 0,
            checkpoints: 0,
            compaction_saves: 0,
            execution_plan: ExecutionPlan::default(),
            external: ExternalStatus::default(),
            thresholds,
            aggregates: HashMap::new(),
            pending_reset_at: None,
            last_tokens_sample_at: None,
            last_tokens_sample_value: None,
            velocity_initialized: false,
            errors: 0,
            suspicious_collisions: 0,
        }
    }

    /// Recompute `utilization` from `current_tokens`/`window_size`, clamping
    /// per the `utilization ∈ [0, 1]` invariant (§3 Invariants).
    pub fn recompute_utilization(&mut self) -> bool {
        let raw = self.current_tokens as f64 / self.window_size.max(1) as f64;
        let clamped = raw.clamp(0.0, 1.0);
        self.utilization = clamped;
        raw > 1.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::LearnedThresholds;

    #[test]
    fn utilization_clamps_and_flags_overflow() {
        let mut rec = SessionRecord::new(
            "s-1".into(),
            "p".into(),
            None,
            200_000,
            LearnedThresholds::default(),
            0,
        );
        rec.current_tokens = 300_000;
        let clamped = rec.recompute_utilization();
        assert!(clamped);
        assert_eq!(rec.utilization, 1.0);
    }

    #[test]
    fn utilization_normal_range_not_flagged() {
        let mut rec = SessionRecord::new(
            "s-1".into(),
            "p".into(),
            None,
            200_000,
            LearnedThresholds::default(),
            0,
        );
        rec.current_tokens = 150_000;
        let clamped = rec.recompute_utilization();
        assert!(!clamped);
        assert!((rec.utilization - 0.75).abs() < 1e-9);
    }

    #[test]
    fn session_id_derefs_to_str() {
        let id: SessionId = "abc".into();
        assert_eq!(&*id, "abc");
        assert_eq!(id.to_string(), "abc");
    }
}
