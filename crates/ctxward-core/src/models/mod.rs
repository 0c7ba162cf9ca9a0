//! Domain models for the context-window governor (§3).

mod alert;
mod decision;
mod metric;
mod session;
mod thresholds;

pub use alert::{Alert, AlertRule};
pub use decision::{Decision, DecisionKind, DecisionPayload, Severity};
pub use metric::{Aggregate, HistogramData, MetricPoint, MetricValue, RingBuffer, WindowSample};
pub use session::{
    now_millis, ExecutionPlan, ExternalStatus, ExternalStatusUpdate, ProjectId, SessionId,
    SessionRecord, SessionStatus, Task, TaskStatus,
};
pub use thresholds::{LearnedThresholds, ThresholdHistory};
