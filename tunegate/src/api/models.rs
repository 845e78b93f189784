//! Request/response DTOs and extractors.
//!
//! Wire identifiers are camelCase, timestamps RFC3339. Request bodies are
//! strict: unknown JSON fields are rejected with `INVALID_INPUT` rather
//! than ignored.

use axum::body::Bytes;
use axum::extract::{FromRequest, FromRequestParts, Request};
use axum::http::request::Parts;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use uuid::Uuid;

use super::error::ApiError;
use crate::domain::{SessionRecord, SessionState, StopReason};

/// `POST /intents` body.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct CreateIntentRequest {
    pub service_ref: String,
    #[serde(rename = "profileID")]
    pub profile_id: String,
    pub idempotency_key: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateIntentResponse {
    pub session_id: Uuid,
    pub status: &'static str,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionResponse {
    pub state: SessionState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop_reason: Option<StopReason>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lease_expires_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub heartbeat_interval: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hls_path: Option<String>,
    pub correlation_id: String,
}

impl From<&SessionRecord> for SessionResponse {
    fn from(session: &SessionRecord) -> Self {
        let live = !session.is_terminal();
        Self {
            state: session.state,
            stop_reason: session.stop_reason,
            lease_expires_at: live.then_some(session.lease_expires_at),
            heartbeat_interval: live.then_some(session.heartbeat_interval_secs),
            hls_path: (session.state == SessionState::Ready)
                .then(|| format!("/sessions/{}/hls", session.id)),
            correlation_id: session.correlation_id.clone(),
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HeartbeatResponse {
    pub lease_expires_at: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StopResponse {
    pub status: &'static str,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSummary {
    pub session_id: Uuid,
    pub state: SessionState,
    pub service_ref: String,
    pub profile_id: String,
    pub created_at: DateTime<Utc>,
}

impl From<&SessionRecord> for SessionSummary {
    fn from(session: &SessionRecord) -> Self {
        Self {
            session_id: session.id,
            state: session.state,
            service_ref: session.service_ref.clone(),
            profile_id: session.profile_id.clone(),
            created_at: session.created_at,
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    pub status: &'static str,
    pub uptime_secs: u64,
}

/// Correlation id, taken from the request-id middleware.
pub struct Correlation(pub String);

impl<S: Send + Sync> FromRequestParts<S> for Correlation {
    type Rejection = std::convert::Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let id = parts
            .headers
            .get("x-request-id")
            .and_then(|v| v.to_str().ok())
            .map(str::to_owned)
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        Ok(Correlation(id))
    }
}

/// Strict JSON extractor with problem-details rejections.
///
/// The body limit layer caps reads at 1 MiB; oversize bodies surface as
/// 413, everything else malformed as 400 `INVALID_INPUT`.
pub struct ValidatedJson<T>(pub T);

impl<S, T> FromRequest<S> for ValidatedJson<T>
where
    S: Send + Sync,
    T: DeserializeOwned,
{
    type Rejection = ApiError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        let request_id = req
            .headers()
            .get("x-request-id")
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_owned();

        let bytes = Bytes::from_request(req, state).await.map_err(|rejection| {
            let err = if rejection.status() == axum::http::StatusCode::PAYLOAD_TOO_LARGE {
                ApiError::payload_too_large()
            } else {
                ApiError::invalid_input(format!("unreadable request body: {rejection}"))
            };
            err.with_request_id(request_id.clone())
        })?;

        serde_json::from_slice::<T>(&bytes)
            .map(ValidatedJson)
            .map_err(|e| {
                ApiError::invalid_input(format!("invalid request body: {e}"))
                    .with_request_id(request_id)
            })
    }
}
