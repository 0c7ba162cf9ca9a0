//! Typed event bus for ctxward using `tokio::broadcast`.
//!
//! This is the "event bus as typed channels" re-architecture from the
//! Design Notes: every externally visible occurrence (session lifecycle,
//! decisions, alerts, clears, fleet patterns) is one variant of
//! [`GovernorEvent`]. The SSE layer (C8) is a pure projection of this bus:
//! it assigns the monotonic `seq` and serializes to JSON, it does not
//! decide what is an event.

use crate::models::{Alert, Decision};
use serde::Serialize;
use tokio::sync::broadcast;

/// Every event the core can emit, tagged for SSE (`GET /events`, §4.8).
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum GovernorEvent {
    #[serde(rename = "session:created")]
    SessionCreated { session_id: String, project_id: String },
    #[serde(rename = "session:updated")]
    SessionUpdated {
        session_id: String,
        current_tokens: u64,
        utilization: f64,
    },
    #[serde(rename = "session:closed")]
    SessionClosed { session_id: String, reason: String },
    #[serde(rename = "decision")]
    Decision(Decision),
    #[serde(rename = "alert:triggered")]
    AlertTriggered(Alert),
    #[serde(rename = "context:cleared")]
    ContextCleared {
        session_id: String,
        new_baseline_tokens: u64,
    },
    #[serde(rename = "pattern:parallel-sessions")]
    ParallelSessions {
        project_id: String,
        session_count: usize,
    },
    #[serde(rename = "pattern:high-velocity")]
    HighVelocity {
        session_id: String,
        tokens_per_sec: f64,
    },
}

/// Event bus for broadcasting governor events to SSE subscribers.
pub struct EventBus {
    sender: broadcast::Sender<GovernorEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn publish(&self, event: GovernorEvent) {
        // Ignore send errors: no subscribers is a normal, non-fatal state.
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<GovernorEvent> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

impl Clone for EventBus {
    fn clone(&self) -> Self {
        Self {
            sender: self.sender.clone(),
        }
    }
}
