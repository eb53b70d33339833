//! Control API routes for rotord.
//!
//! `/status` is public. Everything else sits behind the token middleware.

use crate::config::reload;
use crate::middleware::require_token;
use crate::notifier::Notification;
use crate::orchestrator::{OutcomeKind, RotationTrigger};
use crate::server::AppState;
use axum::{
    extract::State,
    http::StatusCode,
    middleware,
    routing::{get, post},
    Json, Router,
};
use rotor_common::{
    AutoRotationStatus, ErrorResponse, ImeiStatus, IpHistory, NotifyResponse, RedactedConfig,
    RotateResponse, RotateStatus, StatusResponse,
};
use std::sync::Arc;
use tracing::{error, info};

type AppStateArc = Arc<AppState>;
type ApiError = (StatusCode, Json<ErrorResponse>);

fn api_error(code: StatusCode, status: &str, message: impl Into<String>) -> ApiError {
    (code, Json(ErrorResponse::new(status, message)))
}

// ============================================================================
// Public Routes
// ============================================================================

pub fn public_routes() -> Router<AppStateArc> {
    Router::new().route("/status", get(status))
}

async fn status(State(state): State<AppStateArc>) -> Json<StatusResponse> {
    Json(state.orchestrator.status().await)
}

// ============================================================================
// Rotation Routes
// ============================================================================

pub fn rotation_routes(state: AppStateArc) -> Router<AppStateArc> {
    Router::new()
        .route("/rotate", post(rotate))
        .route("/history", get(history))
        .route("/notify", post(notify))
        .route_layer(middleware::from_fn_with_state(state, require_token))
}

/// HTTP status for a rotation outcome
pub fn outcome_status(kind: OutcomeKind) -> StatusCode {
    match kind {
        OutcomeKind::Succeeded => StatusCode::OK,
        OutcomeKind::Busy => StatusCode::TOO_MANY_REQUESTS,
        OutcomeKind::LogicalFailure => StatusCode::BAD_REQUEST,
        OutcomeKind::DriverFailure => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

async fn rotate(State(state): State<AppStateArc>) -> (StatusCode, Json<RotateResponse>) {
    info!("  Rotation requested via API");

    // Detached so a client hanging up cannot abort a rotation halfway
    let orchestrator = state.orchestrator.clone();
    let task = tokio::spawn(async move { orchestrator.rotate(RotationTrigger::Api).await });

    match task.await {
        Ok(outcome) => (outcome_status(outcome.kind), Json(outcome.response)),
        Err(e) => {
            error!("  Rotation task crashed: {}", e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(RotateResponse {
                    status: RotateStatus::Failed,
                    public_ip: None,
                    previous_ip: None,
                    attempts: 0,
                    error: Some("Rotation task crashed".to_string()),
                    mode: None,
                    attempt_log: Vec::new(),
                }),
            )
        }
    }
}

async fn history(State(state): State<AppStateArc>) -> Json<IpHistory> {
    Json(state.orchestrator.history().snapshot().await)
}

async fn notify(State(state): State<AppStateArc>) -> Result<Json<NotifyResponse>, ApiError> {
    let (ip, mode) = state.orchestrator.current_ip().await;
    info!("  Manual notification ({})", ip.as_deref().unwrap_or("unknown"));

    state
        .orchestrator
        .notifier()
        .notify(&Notification::status(ip.clone(), mode))
        .await
        .map_err(|e| {
            error!("  Notification failed: {}", e);
            api_error(StatusCode::BAD_GATEWAY, "failed", e.to_string())
        })?;

    Ok(Json(NotifyResponse {
        status: "success".to_string(),
        ip,
    }))
}

// ============================================================================
// Auto-Rotation Routes
// ============================================================================

pub fn auto_rotation_routes(state: AppStateArc) -> Router<AppStateArc> {
    Router::new()
        .route("/auto-rotation/status", get(auto_status))
        .route("/auto-rotation/enable", post(auto_enable))
        .route("/auto-rotation/disable", post(auto_disable))
        .route("/auto-rotation/restart", post(auto_restart))
        .route_layer(middleware::from_fn_with_state(state, require_token))
}

async fn auto_status(State(state): State<AppStateArc>) -> Json<AutoRotationStatus> {
    Json(state.auto.status())
}

async fn auto_enable(State(state): State<AppStateArc>) -> Json<AutoRotationStatus> {
    info!("  Auto-rotation enable requested");
    Json(state.auto.enable())
}

async fn auto_disable(State(state): State<AppStateArc>) -> Json<AutoRotationStatus> {
    info!("  Auto-rotation disable requested");
    Json(state.auto.disable())
}

async fn auto_restart(State(state): State<AppStateArc>) -> Json<AutoRotationStatus> {
    info!("  Auto-rotation restart requested");
    Json(state.auto.restart())
}

// ============================================================================
// Admin Routes
// ============================================================================

pub fn admin_routes(state: AppStateArc) -> Router<AppStateArc> {
    Router::new()
        .route("/config", get(config))
        .route("/modem/imei", get(imei))
        .route_layer(middleware::from_fn_with_state(state, require_token))
}

async fn config(State(state): State<AppStateArc>) -> Json<RedactedConfig> {
    Json(RedactedConfig::from(&reload(state.orchestrator.config()).await))
}

/// Read-only audit: skipped mid-rotation, never takes the rotation lock.
/// The AT port serializes its own access.
async fn imei(State(state): State<AppStateArc>) -> Result<Json<ImeiStatus>, ApiError> {
    if state.orchestrator.state().is_rotating() {
        return Err(api_error(
            StatusCode::CONFLICT,
            "rotating",
            "Rotation in progress, modem busy",
        ));
    }
    Ok(Json(state.imei.audit(state.at.as_ref(), state.at_timeout).await))
}
