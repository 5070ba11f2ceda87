//! Admin control surface: bearer-protected scheduler and ingestion control.
//!
//! The token comparison is constant-time so a remote caller cannot probe
//! the key byte by byte.

use axum::{
    extract::{Request, State},
    http::header::AUTHORIZATION,
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use subtle::ConstantTimeEq;
use tracing::warn;

use crate::updater::UpdaterStatus;
use crate::{AppState, Error, Result};

/// Constant-time bearer comparison; length mismatches fail without
/// touching the secret bytes.
fn token_matches(provided: &str, expected: &str) -> bool {
    let provided = provided.as_bytes();
    let expected = expected.as_bytes();
    if provided.len() != expected.len() {
        return false;
    }
    provided.ct_eq(expected).into()
}

/// Redacted form for warn logs: enough to correlate, never the secret
fn redact(token: Option<&str>) -> String {
    match token {
        None => "<missing>".to_string(),
        Some(token) if token.chars().count() <= 4 => "****".to_string(),
        Some(token) => format!("{}****", token.chars().take(4).collect::<String>()),
    }
}

/// Bearer-token gate for the /api/admin subtree
pub async fn require_admin(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Response {
    if state.config.admin.auth_disabled {
        return next.run(request).await;
    }

    let Some(expected) = state.config.admin.api_key.as_deref() else {
        warn!("Admin request rejected: no ADMIN_API_KEY configured");
        return Error::Unauthorized.into_response();
    };

    let provided = request
        .headers()
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "));

    match provided {
        Some(token) if token_matches(token, expected) => next.run(request).await,
        provided => {
            warn!(
                method = %request.method(),
                path = %request.uri().path(),
                token = %redact(provided),
                "Admin authentication failed"
            );
            Error::Unauthorized.into_response()
        }
    }
}

// ============================================
// Tracking Updater Control
// ============================================

pub async fn updater_status(State(state): State<AppState>) -> Json<UpdaterStatus> {
    Json(state.updater.status().await)
}

pub async fn updater_pause(State(state): State<AppState>) -> Json<serde_json::Value> {
    state.updater.pause();
    Json(json!({ "paused": true }))
}

pub async fn updater_resume(State(state): State<AppState>) -> Json<serde_json::Value> {
    state.updater.resume();
    Json(json!({ "paused": false }))
}

// ============================================
// Email Ingestion Control
// ============================================

pub async fn email_status(State(state): State<AppState>) -> Result<Json<serde_json::Value>> {
    let Some(ingestor) = &state.email else {
        return Ok(Json(json!({ "enabled": false })));
    };
    let metrics = ingestor.metrics();
    Ok(Json(json!({ "enabled": true, "metrics": metrics })))
}

pub async fn email_pause(State(state): State<AppState>) -> Result<Json<serde_json::Value>> {
    let ingestor = state
        .email
        .as_ref()
        .ok_or_else(|| Error::NotFound("email ingestion is not enabled".to_string()))?;
    ingestor.pause();
    Ok(Json(json!({ "paused": true })))
}

pub async fn email_resume(State(state): State<AppState>) -> Result<Json<serde_json::Value>> {
    let ingestor = state
        .email
        .as_ref()
        .ok_or_else(|| Error::NotFound("email ingestion is not enabled".to_string()))?;
    ingestor.resume();
    Ok(Json(json!({ "paused": false })))
}
