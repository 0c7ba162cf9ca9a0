//! Alert rule set output (§4.9).

use serde::{Deserialize, Serialize};

use crate::models::Severity;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AlertRule {
    HighContextUtilization,
    CriticalContextUtilization,
    RapidTokenConsumption,
    CompactionDetected,
    ParallelSessionsHigh,
    PersistenceDegraded,
    CapacitySoftLimit,
}

impl AlertRule {
    pub fn default_severity(self) -> Severity {
        match self {
            AlertRule::HighContextUtilization => Severity::Warning,
            AlertRule::CriticalContextUtilization => Severity::Critical,
            AlertRule::RapidTokenConsumption => Severity::Warning,
            AlertRule::CompactionDetected => Severity::Error,
            AlertRule::ParallelSessionsHigh => Severity::Info,
            AlertRule::PersistenceDegraded => Severity::Warning,
            AlertRule::CapacitySoftLimit => Severity::Info,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Alert {
    pub rule: AlertRule,
    pub session_id: Option<String>,
    pub severity: Severity,
    pub message: String,
    pub observed_at: u64,
}
