//! REST handlers for `/health` and `/api/sessions`.

use std::str::FromStr;
use std::sync::Arc;

use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::Json;
use nix::sys::signal::Signal;
use protocol::{
    CreateSessionRequest, HealthResponse, InputRequest, OutputQuery, OutputResponse,
    ResizeRequest, SessionInfo,
};
use serde::Deserialize;

use super::error::ApiError;
use super::AppState;
use crate::session::{Session, SessionRegistry, SessionSpec};

/// Query string for `DELETE /api/sessions/{id}`.
#[derive(Debug, Default, Deserialize)]
pub struct DeleteQuery {
    /// Signal name (`TERM`, `SIGKILL`) or number. Defaults to the backend's
    /// normal termination.
    pub signal: Option<String>,
}

/// Validates the path id and resolves the session.
pub(crate) fn lookup(state: &AppState, session_id: &str) -> Result<Arc<Session>, ApiError> {
    protocol::validate_session_id(session_id)?;
    Ok(state.registry.get(session_id)?)
}

fn body<T>(payload: Result<Json<T>, JsonRejection>) -> Result<T, ApiError> {
    payload
        .map(|Json(value)| value)
        .map_err(|rejection| ApiError::Validation(rejection.body_text()))
}

/// Parses a signal given by name or number.
pub fn parse_signal(raw: &str) -> Result<i32, ApiError> {
    let raw = raw.trim();
    if let Ok(number) = raw.parse::<i32>() {
        return Signal::try_from(number)
            .map(|signal| signal as i32)
            .map_err(|_| ApiError::Validation(format!("unknown signal: {raw}")));
    }

    let upper = raw.to_ascii_uppercase();
    let name = if upper.starts_with("SIG") {
        upper
    } else {
        format!("SIG{upper}")
    };
    Signal::from_str(&name)
        .map(|signal| signal as i32)
        .map_err(|_| ApiError::Validation(format!("unknown signal: {raw}")))
}

/// `GET /health`
pub async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        sessions: state.registry.count(),
        uptime_secs: state.started_at.elapsed().as_secs(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

/// `GET /api/sessions`
pub async fn list_sessions(State(state): State<AppState>) -> Json<Vec<SessionInfo>> {
    Json(state.registry.list().await)
}

/// `POST /api/sessions`
pub async fn create_session(
    State(state): State<AppState>,
    payload: Result<Json<CreateSessionRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<SessionInfo>), ApiError> {
    let request = body(payload)?;
    match (request.cols, request.rows) {
        (Some(0), _) | (_, Some(0)) => {
            return Err(ApiError::Validation(
                "cols and rows must be positive".to_string(),
            ));
        }
        (Some(_), None) | (None, Some(_)) => {
            return Err(ApiError::Validation(
                "cols and rows must be given together".to_string(),
            ));
        }
        _ => {}
    }

    let session = state.registry.create(SessionSpec::from(request)).await?;
    Ok((StatusCode::CREATED, Json(session.info().await)))
}

/// `GET /api/sessions/{id}`
pub async fn get_session(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Result<Json<SessionInfo>, ApiError> {
    let session = lookup(&state, &session_id)?;
    Ok(Json(session.info().await))
}

/// `DELETE /api/sessions/{id}`
///
/// Removing an id that is not registered still answers 204.
pub async fn delete_session(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    query: Result<Query<DeleteQuery>, QueryRejection>,
) -> Result<StatusCode, ApiError> {
    protocol::validate_session_id(&session_id)?;
    let Query(query) = query.map_err(|rejection| ApiError::Validation(rejection.body_text()))?;
    let signal = query.signal.as_deref().map(parse_signal).transpose()?;

    state.registry.remove_with_signal(&session_id, signal).await;
    Ok(StatusCode::NO_CONTENT)
}

/// `POST /api/sessions/{id}/input`
pub async fn send_input(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    payload: Result<Json<InputRequest>, JsonRejection>,
) -> Result<StatusCode, ApiError> {
    let session = lookup(&state, &session_id)?;
    let request = body(payload)?;
    session.write(request.data.as_bytes()).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// `POST /api/sessions/{id}/resize`
pub async fn resize_session(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    payload: Result<Json<ResizeRequest>, JsonRejection>,
) -> Result<StatusCode, ApiError> {
    let session = lookup(&state, &session_id)?;
    let request = body(payload)?;
    request.validate()?;
    session.resize(request.cols, request.rows).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// `GET /api/sessions/{id}/output?offset=N`
pub async fn read_output(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    query: Result<Query<OutputQuery>, QueryRejection>,
) -> Result<Json<OutputResponse>, ApiError> {
    let session = lookup(&state, &session_id)?;
    let Query(query) = query.map_err(|rejection| ApiError::Validation(rejection.body_text()))?;
    Ok(Json(session.read_output(query.offset).await))
}
