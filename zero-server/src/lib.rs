//! Zero HTTP/WebSocket surface.
//!
//! Thin axum layer over `zero-core`: routes read from the store and
//! queue, submissions go through the queue, and `/ws/scan/{id}` bridges
//! a hub subscription onto a WebSocket.

pub mod error;
pub mod routes;
pub mod ws;

use std::sync::Arc;

use axum::Router;
use axum::routing::{get, post};
use tokio_util::sync::CancellationToken;
use tracing::info;

use zero_core::config::ZeroConfig;
use zero_core::diff::DiffEngine;
use zero_core::freshness::FreshnessEngine;
use zero_core::hub::ProgressHub;
use zero_core::queue::JobQueue;
use zero_core::registry::Registry;
use zero_core::store::ArtifactStore;
use zero_core::suppress::SuppressionService;

/// Shared state behind every handler.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<ZeroConfig>,
    pub store: ArtifactStore,
    pub freshness: Arc<FreshnessEngine>,
    pub registry: Arc<Registry>,
    pub queue: Arc<JobQueue>,
    pub hub: Arc<ProgressHub>,
    pub diff: Arc<DiffEngine>,
    pub suppression: Arc<SuppressionService>,
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState").finish_non_exhaustive()
    }
}

/// Build the full route table.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/health", get(routes::health))
        .route("/api/repos", get(routes::list_repos))
        .route(
            "/api/repos/{owner}/{name}",
            get(routes::repo_summary).delete(routes::delete_repo),
        )
        .route(
            "/api/repos/{owner}/{name}/freshness",
            get(routes::repo_freshness),
        )
        .route(
            "/api/repos/{owner}/{name}/analysis/{analyzer}",
            get(routes::read_artifact),
        )
        .route("/api/repos/{owner}/{name}/scans", get(routes::list_scans))
        .route("/api/repos/{owner}/{name}/diff", get(routes::diff_scans))
        .route(
            "/api/analysis/{owner}/{name}/summary",
            get(routes::analysis_summary),
        )
        .route("/api/scans", post(routes::submit_scan))
        .route("/api/scans/active", get(routes::active_scans))
        .route("/api/scans/recent", get(routes::recent_scans))
        .route(
            "/api/scans/{id}",
            get(routes::scan_detail).delete(routes::cancel_scan),
        )
        .route("/api/feedback", get(routes::list_feedback).post(routes::record_feedback))
        .route("/ws/scan/{id}", get(ws::scan_stream))
        .with_state(state)
}

/// Bind and serve until `shutdown` fires.
pub async fn serve(
    state: AppState,
    bind: &str,
    shutdown: CancellationToken,
) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::bind(bind).await?;
    info!(addr = %listener.local_addr()?, "API listening");
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
}
