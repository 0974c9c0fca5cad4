use axum::{
    Json,
    extract::{Query, State},
    http::StatusCode,
};
use heron_sftp::{EngineStatus, PamEvent};
use serde::Deserialize;

use crate::AppState;

// Request types
#[derive(Debug, Deserialize)]
pub struct PamEventQuery {
    pub username: Option<String>,
    #[serde(rename = "type")]
    pub event_type: Option<String>,
    pub service: Option<String>,
}

// Session event handler
pub async fn pam_event(
    State(state): State<AppState>,
    Query(query): Query<PamEventQuery>,
) -> StatusCode {
    let (Some(username), Some(event_type)) = (query.username, query.event_type) else {
        tracing::warn!("PAM event without username or type");
        return StatusCode::BAD_REQUEST;
    };
    tracing::debug!(
        "Received event for user '{}' with type '{}', {}",
        username,
        event_type,
        query.service.as_deref().unwrap_or_default()
    );

    let event = PamEvent {
        username,
        event_type,
        service: query.service,
    };
    if state.engine.handle_session(event).await {
        StatusCode::OK
    } else {
        StatusCode::BAD_REQUEST
    }
}

// Diagnostics handlers
pub async fn status(State(state): State<AppState>) -> Json<EngineStatus> {
    Json(state.engine.status())
}

pub async fn health() -> &'static str {
    "OK"
}
