//! ctxward-web: OTLP receiver (C1) plus the publication layer (C8) --
//! JSON session API, SSE event stream, health probes, and Prometheus
//! exposition (§6 External Interfaces).

pub mod api;
pub mod error;
pub mod health;
pub mod ingest;
pub mod metrics;
pub mod router;
pub mod sse;
pub mod state;

pub use state::AppState;

use anyhow::Result;
use ctxward_core::{Config, Governor};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tracing::info;

/// Binds all four listeners described in §6 and returns their join handles
/// so the caller can fold them into its own shutdown sequence. Each
/// listener serves its own `Router`; they share one `AppState`.
pub async fn serve(governor: Arc<Governor>, config: Arc<Config>) -> Result<Vec<JoinHandle<()>>> {
    let state = AppState::new(governor, config.clone());

    let ingest_addr = SocketAddr::from(([0, 0, 0, 0], config.ingest_port));
    let api_addr = SocketAddr::from(([0, 0, 0, 0], config.api_port));
    let health_addr = SocketAddr::from(([0, 0, 0, 0], config.health_port));
    let prometheus_addr = SocketAddr::from(([0, 0, 0, 0], config.prometheus_port));

    let ingest_listener = TcpListener::bind(ingest_addr).await?;
    let api_listener = TcpListener::bind(api_addr).await?;
    let health_listener = TcpListener::bind(health_addr).await?;
    let prometheus_listener = TcpListener::bind(prometheus_addr).await?;

    info!(%ingest_addr, "ingest listener bound");
    info!(%api_addr, "api listener bound");
    info!(%health_addr, "health listener bound");
    info!(%prometheus_addr, "prometheus listener bound");

    let ingest_router = router::ingest_router(state.clone());
    let api_router = router::api_router(state.clone());
    let health_router = router::health_router(state.clone());
    let prometheus_router = router::prometheus_router(state);

    Ok(vec![
        tokio::spawn(async move {
            if let Err(e) = axum::serve(ingest_listener, ingest_router).await {
                tracing::error!(error = %e, "ingest listener exited");
            }
        }),
        tokio::spawn(async move {
            if let Err(e) = axum::serve(api_listener, api_router).await {
                tracing::error!(error = %e, "api listener exited");
            }
        }),
        tokio::spawn(async move {
            if let Err(e) = axum::serve(health_listener, health_router).await {
                tracing::error!(error = %e, "health listener exited");
            }
        }),
        tokio::spawn(async move {
            if let Err(e) = axum::serve(prometheus_listener, prometheus_router).await {
                tracing::error!(error = %e, "prometheus listener exited");
            }
        }),
    ])
}
