//! HTTP server for rotord

use crate::middleware::body_size_limit;
use crate::modem::{AtPort, ImeiVault};
use crate::orchestrator::Orchestrator;
use crate::routes;
use crate::scheduler::AutoRotation;
use anyhow::{Context, Result};
use axum::{middleware, Router};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::info;

/// Application state shared across handlers
pub struct AppState {
    pub orchestrator: Arc<Orchestrator>,
    pub auto: Arc<AutoRotation>,
    pub at: Arc<dyn AtPort>,
    pub imei: ImeiVault,
    pub at_timeout: Duration,
}

/// The full control API
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .merge(routes::public_routes())
        .merge(routes::rotation_routes(state.clone()))
        .merge(routes::auto_rotation_routes(state.clone()))
        .merge(routes::admin_routes(state.clone()))
        .with_state(state)
        .layer(middleware::from_fn(body_size_limit))
        .layer(TraceLayer::new_for_http())
}

/// Bind and serve until `shutdown` fires
pub async fn run(state: AppState, addr: SocketAddr, shutdown: CancellationToken) -> Result<()> {
    let app = router(Arc::new(state));

    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind control API on {}", addr))?;
    info!("  Listening on http://{}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;
    Ok(())
}
