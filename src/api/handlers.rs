//! HTTP request handlers

use super::sse::sse_stream;
use super::types::{ErrorResponse, EventBody, EventRequest, HealthResponse, StreamQuery};
use super::AppState;
use crate::runtime::{DispatchError, EngineError, Outcome};
use crate::state_machine::{Attachment, InboundEvent};
use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use base64::Engine as _;

/// Create the API router
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/api/events", post(post_event))
        .route("/api/notifications/stream", get(stream_notifications))
        .route("/api/health", get(health))
        .with_state(state)
}

// ============================================================
// Inbound Events
// ============================================================

async fn post_event(
    State(state): State<AppState>,
    Json(req): Json<EventRequest>,
) -> Result<Json<Outcome>, AppError> {
    let identity = req.identity;
    let event = match req.body {
        EventBody::Text { text } => InboundEvent::text(identity, text),
        EventBody::Selection { selection } => InboundEvent::selection(identity, selection),
        EventBody::Attachment { media_type, data } => {
            let data = base64::engine::general_purpose::STANDARD
                .decode(data)
                .map_err(|e| AppError::BadRequest(format!("attachment is not base64: {e}")))?;
            InboundEvent::attachment(identity, Attachment::new(media_type, data))
        }
    };

    let outcome = state.dispatcher.dispatch(event).await?;
    Ok(Json(outcome))
}

// ============================================================
// Notifications
// ============================================================

async fn stream_notifications(
    State(state): State<AppState>,
    Query(query): Query<StreamQuery>,
) -> impl IntoResponse {
    tracing::info!(identity = %query.identity, "Client subscribed to notifications");
    sse_stream(query.identity, state.notifier.subscribe())
}

// ============================================================
// Health
// ============================================================

async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    let engine = state.dispatcher.engine();
    Json(HealthResponse {
        status: "ok",
        active_workers: state.dispatcher.active_workers(),
        active_conversations: engine.conversations().len().await,
        unresolved_payments: engine.desk().queue().list_unresolved().len(),
    })
}

// ============================================================
// Error Handling
// ============================================================

#[derive(Debug)]
enum AppError {
    BadRequest(String),
    Forbidden(String),
    Conflict(String),
    Unavailable(String),
    Internal(String),
}

impl From<DispatchError> for AppError {
    fn from(e: DispatchError) -> Self {
        let message = e.to_string();
        match e {
            DispatchError::Engine(EngineError::Forbidden { .. }) => AppError::Forbidden(message),
            DispatchError::Engine(EngineError::StaleSelection(_)) => AppError::Conflict(message),
            DispatchError::Engine(EngineError::ResolutionFailed(_) | EngineError::Effect { .. }) => {
                AppError::Unavailable(message)
            }
            DispatchError::WorkerGone(_) => AppError::Internal(message),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            AppError::Forbidden(msg) => (StatusCode::FORBIDDEN, msg),
            AppError::Conflict(msg) => (StatusCode::CONFLICT, msg),
            AppError::Unavailable(msg) => (StatusCode::SERVICE_UNAVAILABLE, msg),
            AppError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };

        let body = Json(ErrorResponse::new(message));
        (status, body).into_response()
    }
}
