use std::sync::Arc;

use axum::{
    Json, Router,
    body::Bytes,
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde_json::json;
use tokio_util::task::TaskTracker;
use tracing::{debug, info};

use super::controller::LifecycleController;
use super::events::PullRequestEvent;
use super::webhook::{EVENT_HEADER, SIGNATURE_HEADER, SignatureVerifier};
use crate::errors::WebhookError;

// ── Shared application state ──────────────────────────────────────────

pub struct AppState {
    pub controller: Arc<LifecycleController>,
    pub verifier: SignatureVerifier,
    /// In-flight lifecycle work; drained on shutdown.
    pub tasks: TaskTracker,
}

pub type SharedState = Arc<AppState>;

// ── Error handling ────────────────────────────────────────────────────

#[derive(Debug)]
pub enum ApiError {
    NotFound(String),
    BadRequest(String),
    Unauthorized(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Unauthorized(msg) => (StatusCode::UNAUTHORIZED, msg),
        };
        (status, Json(json!({"error": message}))).into_response()
    }
}

impl From<WebhookError> for ApiError {
    fn from(err: WebhookError) -> Self {
        match err {
            WebhookError::MissingHeader(_) | WebhookError::InvalidPayload(_) => {
                ApiError::BadRequest(err.to_string())
            }
            WebhookError::InvalidSignatureFormat(_) | WebhookError::SignatureMismatch => {
                ApiError::Unauthorized("Invalid signature".to_string())
            }
        }
    }
}

// ── Router ────────────────────────────────────────────────────────────

pub fn api_router(webhook_path: &str) -> Router<SharedState> {
    Router::new()
        .route(webhook_path, post(receive_webhook))
        .route("/api/workspaces", get(list_workspaces))
        .route("/api/workspaces/{id}", get(get_workspace))
        .route("/health", get(health_check))
}

// ── Handlers ──────────────────────────────────────────────────────────

async fn health_check() -> &'static str {
    "ok"
}

fn header<'a>(headers: &'a HeaderMap, name: &'static str) -> Result<&'a str, WebhookError> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .ok_or(WebhookError::MissingHeader(name))
}

/// Verify, narrow and hand off one delivery. Pull-request events are
/// handled on a background task so the delivery is acknowledged well
/// within GitHub's timeout.
async fn receive_webhook(
    State(state): State<SharedState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ApiError> {
    let event_name = header(&headers, EVENT_HEADER)?;
    let signature = header(&headers, SIGNATURE_HEADER)?;
    if body.is_empty() {
        return Err(ApiError::BadRequest("Missing request body".to_string()));
    }

    state.verifier.verify(&body, signature)?;

    let payload: serde_json::Value = serde_json::from_slice(&body)
        .map_err(|e| WebhookError::InvalidPayload(format!("Invalid JSON: {}", e)))?;

    if event_name != "pull_request" {
        debug!(event = event_name, "ignoring webhook event");
        return Ok(Json(json!({"ok": true, "ignored": true, "event": event_name})).into_response());
    }

    let event = PullRequestEvent::from_value(payload)?;
    let action = event.action().to_string();
    if let PullRequestEvent::Other { .. } = event {
        debug!(action = %action, "ignoring pull request action");
        return Ok(Json(json!({"ok": true, "ignored": true, "action": action})).into_response());
    }

    info!(action = %action, "accepted pull request event");
    let controller = state.controller.clone();
    state.tasks.spawn(async move {
        // Failures are logged by the controller.
        let _ = controller.handle_event(event).await;
    });

    Ok((
        StatusCode::ACCEPTED,
        Json(json!({"ok": true, "action": action})),
    )
        .into_response())
}

async fn list_workspaces(State(state): State<SharedState>) -> impl IntoResponse {
    Json(state.controller.registry().list())
}

async fn get_workspace(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    match state.controller.registry().get(&id) {
        Some(workspace) => Ok(Json(workspace)),
        None => Err(ApiError::NotFound(format!("Workspace {} not found", id))),
    }
}
