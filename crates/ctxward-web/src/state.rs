//! Shared Axum handler state: the assembled governor plus the bits the web
//! layer owns that `ctxward-core` doesn't know about (config, the SSE replay
//! hub). Cloned per request; everything inside is already `Arc`.

use crate::sse::SseHub;
use ctxward_core::{Config, Governor};
use std::sync::Arc;

#[derive(Clone)]
pub struct AppState {
    pub governor: Arc<Governor>,
    pub config: Arc<Config>,
    pub sse: Arc<SseHub>,
}

impl AppState {
    pub fn new(governor: Arc<Governor>, config: Arc<Config>) -> Self {
        let sse = Arc::new(SseHub::new(governor.events.clone(), config.sse_replay_buffer));
        Self { governor, config, sse }
    }
}
