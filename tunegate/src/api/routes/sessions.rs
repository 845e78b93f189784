//! Session resource routes.

use axum::Json;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use uuid::Uuid;

use crate::api::error::{ApiError, ApiResult};
use crate::api::models::{
    Correlation, HeartbeatResponse, SessionResponse, SessionSummary, StopResponse,
};
use crate::api::server::AppState;

const LIST_LIMIT: u32 = 100;

fn parse_id(raw: &str, request_id: &str) -> Result<Uuid, ApiError> {
    Uuid::parse_str(raw).map_err(|_| {
        ApiError::invalid_input(format!("'{raw}' is not a valid session id"))
            .with_request_id(request_id)
    })
}

/// `GET /sessions/{id}`: point read of the session state.
pub async fn get_session(
    State(state): State<AppState>,
    Correlation(request_id): Correlation,
    Path(id): Path<String>,
) -> ApiResult<Json<SessionResponse>> {
    let id = parse_id(&id, &request_id)?;
    let session = state
        .intents
        .get(id)
        .await
        .map_err(|e| ApiError::from(e).with_request_id(&request_id))?;
    Ok(Json(SessionResponse::from(&session)))
}

/// `GET /sessions`: bounded operator listing.
pub async fn list_sessions(
    State(state): State<AppState>,
    Correlation(request_id): Correlation,
) -> ApiResult<Json<Vec<SessionSummary>>> {
    let sessions = state
        .intents
        .list(LIST_LIMIT)
        .await
        .map_err(|e| ApiError::from(e).with_request_id(&request_id))?;
    Ok(Json(sessions.iter().map(SessionSummary::from).collect()))
}

/// `POST /sessions/{id}/heartbeat`: extend the tuner lease.
pub async fn heartbeat(
    State(state): State<AppState>,
    Correlation(request_id): Correlation,
    Path(id): Path<String>,
) -> ApiResult<Json<HeartbeatResponse>> {
    let id = parse_id(&id, &request_id)?;
    let lease_expires_at = state
        .intents
        .heartbeat(id)
        .await
        .map_err(|e| ApiError::from(e).with_request_id(&request_id))?;
    Ok(Json(HeartbeatResponse { lease_expires_at }))
}

/// `POST /sessions/{id}/stop`: request teardown. Idempotent.
pub async fn stop(
    State(state): State<AppState>,
    Correlation(request_id): Correlation,
    Path(id): Path<String>,
) -> ApiResult<(StatusCode, Json<StopResponse>)> {
    let id = parse_id(&id, &request_id)?;
    state
        .intents
        .stop(id)
        .await
        .map_err(|e| ApiError::from(e).with_request_id(&request_id))?;
    Ok((StatusCode::ACCEPTED, Json(StopResponse { status: "accepted" })))
}
