//! Safety decisions emitted by the Context Bridge (§3 `Decision`, §4.5).

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DecisionKind {
    Proceed,
    CheckpointRecommended,
    CheckpointRequired,
    WrapUp,
    EmergencySaveAndClear,
    Warning,
    Reset,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Error,
    Critical,
}

/// Payload accompanying a decision; shape varies by `kind`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DecisionPayload {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub eta_to_compaction_secs: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub utilization: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub velocity: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Decision {
    pub session_id: String,
    pub kind: DecisionKind,
    pub severity: Severity,
    pub payload: DecisionPayload,
    pub observed_at: u64,
}
