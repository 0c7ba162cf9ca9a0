//! Immutable governor configuration (§6, Design Notes "Config as a plain struct").
//!
//! Built once at startup from built-in defaults, an optional YAML file, then
//! environment variable overrides in upper-snake-case. Nothing downstream
//! reaches for `std::env` directly — every tunable lives on [`Config`].

use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

/// Top-level configuration, built once and shared behind an `Arc`.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    pub ingest_port: u16,
    pub api_port: u16,
    pub health_port: u16,
    pub prometheus_port: u16,

    pub context_window_size: u64,

    pub compaction_threshold: f64,
    pub warning_threshold: f64,
    pub checkpoint_threshold: f64,
    pub learning_rate: f64,

    pub compaction_drop_fraction: f64,
    pub high_velocity_tokens_per_sec: f64,

    pub max_concurrent_sessions: usize,

    pub retention_after_close_secs: u64,
    pub sse_replay_buffer: usize,

    pub metric_window_capacity: usize,
    pub dedup_lru_capacity: usize,
    pub attribute_cardinality_cap: usize,
    pub metric_watermark_secs: u64,

    pub shed_timeout_secs: u64,
    pub ingest_queue_capacity: usize,

    pub checkpoint_attempt_timeout_secs: u64,
    pub checkpoint_total_budget_secs: u64,
    pub checkpoint_max_attempts: u32,

    /// Reject telemetry lacking `claude.session.id` instead of falling back
    /// to weaker heuristics (resolves the §9 Open Question on disambiguation).
    pub strict_session_id: bool,

    pub data_dir: std::path::PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            ingest_port: 4318,
            api_port: 3030,
            health_port: 8080,
            prometheus_port: 9090,

            context_window_size: 200_000,

            compaction_threshold: 0.95,
            warning_threshold: 0.85,
            checkpoint_threshold: 0.75,
            learning_rate: 0.10,

            compaction_drop_fraction: 0.25,
            high_velocity_tokens_per_sec: 1000.0,

            max_concurrent_sessions: 64,

            retention_after_close_secs: 15 * 60,
            sse_replay_buffer: 1024,

            metric_window_capacity: 128,
            dedup_lru_capacity: 4096,
            attribute_cardinality_cap: 64,
            metric_watermark_secs: 60,

            shed_timeout_secs: 5,
            ingest_queue_capacity: 4096,

            checkpoint_attempt_timeout_secs: 10,
            checkpoint_total_budget_secs: 60,
            checkpoint_max_attempts: 5,

            strict_session_id: false,

            data_dir: std::path::PathBuf::from("./ctxward-data"),
        }
    }
}

impl Config {
    /// Load defaults, overlay an optional YAML file, then environment variables.
    pub fn load(yaml_path: Option<&Path>) -> Result<Self, crate::error::CoreError> {
        let mut cfg = Self::default();

        if let Some(path) = yaml_path {
            let text = std::fs::read_to_string(path)?;
            cfg = serde_yaml::from_str(&text).map_err(|e| {
                crate::error::CoreError::InvalidConfig(format!(
                    "failed to parse {}: {e}",
                    path.display()
                ))
            })?;
        }

        cfg.apply_env_overrides();
        cfg.validate()?;
        Ok(cfg)
    }

    fn apply_env_overrides(&mut self) {
        macro_rules! env_parse {
            ($field:ident, $name:literal) => {
                if let Ok(v) = std::env::var($name) {
                    if let Ok(parsed) = v.parse() {
                        self.$field = parsed;
                    }
                }
            };
        }

        env_parse!(ingest_port, "INGEST_PORT");
        env_parse!(api_port, "API_PORT");
        env_parse!(health_port, "HEALTH_PORT");
        env_parse!(prometheus_port, "PROMETHEUS_PORT");
        env_parse!(context_window_size, "CONTEXT_WINDOW_SIZE");
        env_parse!(compaction_threshold, "COMPACTION_THRESHOLD");
        env_parse!(warning_threshold, "WARNING_THRESHOLD");
        env_parse!(checkpoint_threshold, "CHECKPOINT_THRESHOLD");
        env_parse!(compaction_drop_fraction, "COMPACTION_DROP_FRACTION");
        env_parse!(
            high_velocity_tokens_per_sec,
            "HIGH_VELOCITY_TOKENS_PER_SEC"
        );
        env_parse!(max_concurrent_sessions, "MAX_CONCURRENT_SESSIONS");
        env_parse!(retention_after_close_secs, "RETENTION_AFTER_CLOSE_SECS");
        env_parse!(sse_replay_buffer, "SSE_REPLAY_BUFFER");
        env_parse!(strict_session_id, "STRICT_SESSION_ID");

        if let Ok(v) = std::env::var("DATA_DIR") {
            self.data_dir = std::path::PathBuf::from(v);
        }
    }

    fn validate(&self) -> Result<(), crate::error::CoreError> {
        if !(0.60..=0.85).contains(&self.checkpoint_threshold) {
            return Err(crate::error::CoreError::InvalidConfig(
                "checkpoint_threshold must be in [0.60, 0.85]".into(),
            ));
        }
        if self.warning_threshold <= self.checkpoint_threshold || self.warning_threshold > 0.90 {
            return Err(crate::error::CoreError::InvalidConfig(
                "warning_threshold must be in (checkpoint_threshold, 0.90]".into(),
            ));
        }
        if self.compaction_threshold <= self.warning_threshold || self.compaction_threshold > 0.99
        {
            return Err(crate::error::CoreError::InvalidConfig(
                "compaction_threshold must be in (warning_threshold, 0.99]".into(),
            ));
        }
        if self.context_window_size == 0 {
            return Err(crate::error::CoreError::InvalidConfig(
                "context_window_size must be positive".into(),
            ));
        }
        Ok(())
    }

    pub fn checkpoint_attempt_timeout(&self) -> Duration {
        Duration::from_secs(self.checkpoint_attempt_timeout_secs)
    }

    pub fn checkpoint_total_budget(&self) -> Duration {
        Duration::from_secs(self.checkpoint_total_budget_secs)
    }

    pub fn retention_after_close(&self) -> Duration {
        Duration::from_secs(self.retention_after_close_secs)
    }

    pub fn shed_timeout(&self) -> Duration {
        Duration::from_secs(self.shed_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_internally_consistent() {
        let cfg = Config::default();
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn rejects_inverted_thresholds() {
        let mut cfg = Config::default();
        cfg.warning_threshold = 0.5;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn env_override_applies() {
        std::env::set_var("CTXWARD_TEST_MARKER", "1");
        std::env::set_var("MAX_CONCURRENT_SESSIONS", "128");
        let mut cfg = Config::default();
        cfg.apply_env_overrides();
        assert_eq!(cfg.max_concurrent_sessions, 128);
        std::env::remove_var("MAX_CONCURRENT_SESSIONS");
        std::env::remove_var("CTXWARD_TEST_MARKER");
    }
}
