//! ctxward-core - Core domain logic for the context-window governor.
//!
//! Owns session identity and the single-writer state machine per session,
//! OTLP decoding, threshold learning, the decision ladder, durable
//! persistence, and the alert rule set. Transport-free: `ctxward-web` is
//! the only crate that speaks HTTP.

pub mod alerts;
pub mod bridge;
pub mod config;
pub mod dedup;
pub mod error;
pub mod event;
pub mod governor;
pub mod ingest_queue;
pub mod models;
pub mod optimizer;
pub mod orchestrator;
pub mod otlp;
pub mod processor;
pub mod registry;
pub mod store;

pub use alerts::{AlertEngine, AlertInputs};
pub use bridge::ContextBridge;
pub use config::Config;
pub use error::CoreError;
pub use event::{EventBus, GovernorEvent};
pub use governor::Governor;
pub use ingest_queue::{IngestItem, IngestQueue};
pub use optimizer::CheckpointOptimizer;
pub use orchestrator::Orchestrator;
pub use otlp::{decode_otlp_json, DecodedBatch, OtlpDecodeError};
pub use processor::MetricProcessor;
pub use registry::{SessionRegistry, SessionSnapshot};
pub use store::{FileStateStore, StateStore};
