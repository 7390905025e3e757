//! HTTP routes for session management.

use axum::{
    Json, Router,
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use motorlink_core::{Session, SessionId, TelemetrySample, UserId};
use motorlink_session::CoordinatorError;
use serde::Deserialize;
use serde_json::json;
use thiserror::Error;
use tower_http::trace::TraceLayer;

use crate::{state::AppState, websocket::ws_handler};

/// Error returned by the session routes.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("Session not found: {0}")]
    NotFound(SessionId),
    #[error("{0}")]
    Internal(String),
}

impl From<CoordinatorError> for ApiError {
    fn from(err: CoordinatorError) -> Self {
        match err {
            CoordinatorError::NotFound(id) => Self::NotFound(id),
            CoordinatorError::Storage(e) => Self::Internal(e.to_string()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match self {
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            tracing::error!("Request failed: {self}");
        }
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}

#[derive(Debug, Deserialize)]
pub struct StartSession {
    pub user: String,
}

/// All routes: the observer websocket plus session management.
#[must_use]
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/sessions", post(start_session))
        .route("/sessions/{id}", get(get_session))
        .route("/sessions/{id}/stop", post(stop_session))
        .route("/sessions/{id}/samples", get(session_samples))
        .route("/users/{user}/sessions", get(list_sessions))
        .route("/users/{user}/active_session", get(active_session))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn start_session(
    State(state): State<AppState>,
    Json(body): Json<StartSession>,
) -> Result<(StatusCode, Json<Session>), ApiError> {
    let session = state.sessions.start_session(&UserId::new(body.user)).await?;
    Ok((StatusCode::CREATED, Json(session)))
}

async fn stop_session(State(state): State<AppState>, Path(id): Path<SessionId>) -> Result<Json<Session>, ApiError> {
    Ok(Json(state.sessions.stop_session(id).await?))
}

async fn get_session(State(state): State<AppState>, Path(id): Path<SessionId>) -> Result<Json<Session>, ApiError> {
    Ok(Json(state.sessions.get_session(id).await?))
}

async fn session_samples(
    State(state): State<AppState>,
    Path(id): Path<SessionId>,
) -> Result<Json<Vec<TelemetrySample>>, ApiError> {
    Ok(Json(state.sessions.session_samples(id).await?))
}

async fn list_sessions(State(state): State<AppState>, Path(user): Path<String>) -> Result<Json<Vec<Session>>, ApiError> {
    Ok(Json(state.sessions.list_sessions(&UserId::new(user)).await?))
}

async fn active_session(
    State(state): State<AppState>,
    Path(user): Path<String>,
) -> Result<Json<Option<Session>>, ApiError> {
    Ok(Json(state.sessions.get_active_session(&UserId::new(user)).await?))
}
