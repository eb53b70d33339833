//! Request middleware: API token check and body limits.

use crate::config::reload;
use crate::server::AppState;
use axum::{
    extract::{Request, State},
    http::StatusCode,
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use rotor_common::ErrorResponse;
use std::sync::Arc;
use subtle::ConstantTimeEq;
use tracing::{debug, warn};

/// Maximum body size: 16 KiB (no endpoint takes a real body)
pub const MAX_BODY_SIZE: usize = 16 * 1024;

/// Token middleware for every non-public route.
///
/// Rejects before any handler runs, so a bad token never touches the
/// rotation lock or the modem.
pub async fn require_token(
    State(state): State<Arc<AppState>>,
    request: Request,
    next: Next,
) -> Response {
    let expected = reload(state.orchestrator.config()).await.api.token;
    let path = request.uri().path().to_string();

    match extract_auth_token(&request) {
        Some(token) if token_matches(&token, &expected) => {
            debug!("  Authorized {}", path);
            next.run(request).await
        }
        Some(token) => {
            warn!("  Rejected token on {} ({})", path, token_hint(&token));
            unauthorized()
        }
        None => {
            warn!("  Missing token on {}", path);
            unauthorized()
        }
    }
}

fn unauthorized() -> Response {
    (
        StatusCode::UNAUTHORIZED,
        Json(ErrorResponse::new("unauthorized", "Invalid or missing API token")),
    )
        .into_response()
}

/// Rejects requests whose Content-Length exceeds [`MAX_BODY_SIZE`]
pub async fn body_size_limit(request: Request, next: Next) -> Result<Response, StatusCode> {
    if let Some(length) = request
        .headers()
        .get("content-length")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<usize>().ok())
    {
        if length > MAX_BODY_SIZE {
            warn!("  Request body too large: {} bytes (max: {})", length, MAX_BODY_SIZE);
            return Err(StatusCode::PAYLOAD_TOO_LARGE);
        }
    }
    Ok(next.run(request).await)
}

/// `Authorization: Bearer <token>`, or the bare token older clients send
pub fn extract_auth_token(request: &Request) -> Option<String> {
    let header = request.headers().get("authorization")?.to_str().ok()?;
    let token = header
        .strip_prefix("Bearer ")
        .unwrap_or(header)
        .trim();
    if token.is_empty() {
        None
    } else {
        Some(token.to_string())
    }
}

/// Constant-time comparison; an empty expected token never matches
pub fn token_matches(given: &str, expected: &str) -> bool {
    !expected.is_empty() && bool::from(given.as_bytes().ct_eq(expected.as_bytes()))
}

/// Loggable description of a token; never any of its characters
pub fn token_hint(token: &str) -> String {
    format!("*** {} chars", token.chars().count())
}
