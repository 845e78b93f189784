//! API error handling.
//!
//! Every error body is a problem-details object `{code, message, requestId,
//! details?}`; `requestId` carries the correlation id for end-to-end
//! tracing.

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;

use crate::error::Error;

/// Problem-details response body.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiErrorResponse {
    /// Machine-readable error code.
    pub code: String,
    /// Human-readable error message.
    pub message: String,
    /// Correlation id of the failing request.
    pub request_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

/// API error type that can be converted to HTTP responses.
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub code: String,
    pub message: String,
    pub request_id: String,
    pub details: Option<serde_json::Value>,
}

impl ApiError {
    pub fn new(status: StatusCode, code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            status,
            code: code.into(),
            message: message.into(),
            request_id: String::new(),
            details: None,
        }
    }

    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = request_id.into();
        self
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }

    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, "INVALID_INPUT", message)
    }

    pub fn session_not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, "SESSION_NOT_FOUND", message)
    }

    pub fn tuner_busy() -> Self {
        Self::new(
            StatusCode::CONFLICT,
            "TUNER_BUSY",
            "all tuner slots are leased; retry with backoff",
        )
    }

    pub fn lease_expired() -> Self {
        Self::new(
            StatusCode::GONE,
            "LEASE_EXPIRED",
            "the session lease is expired; stop playback and create a new session",
        )
    }

    pub fn payload_too_large() -> Self {
        Self::new(
            StatusCode::PAYLOAD_TOO_LARGE,
            "INVALID_INPUT",
            "request body exceeds the 1 MiB limit",
        )
    }

    pub fn store_unavailable() -> Self {
        Self::new(
            StatusCode::SERVICE_UNAVAILABLE,
            "STORE_UNAVAILABLE",
            "state store is temporarily unavailable; retry",
        )
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL", message)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = ApiErrorResponse {
            code: self.code,
            message: self.message,
            request_id: self.request_id,
            details: self.details,
        };
        (self.status, Json(body)).into_response()
    }
}

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        match err {
            Error::Validation(msg) => ApiError::invalid_input(msg),
            Error::TunerBusy => ApiError::tuner_busy(),
            Error::LeaseExpired => ApiError::lease_expired(),
            Error::NotFound { entity_type, id } => {
                ApiError::session_not_found(format!("{entity_type} '{id}' not found"))
            }
            Error::DatabaseSqlx(e) => {
                tracing::error!(error = %e, "store error surfaced to API");
                ApiError::store_unavailable()
            }
            Error::Storage(msg) => {
                tracing::error!(error = %msg, "store error surfaced to API");
                ApiError::store_unavailable()
            }
            Error::InvalidStateTransition { from, to } => ApiError::new(
                StatusCode::CONFLICT,
                "INVALID_STATE",
                format!("cannot transition from {from} to {to}"),
            ),
            other => {
                tracing::error!(error = %other, "unexpected error surfaced to API");
                ApiError::internal("an unexpected error occurred")
            }
        }
    }
}

/// Result type for API handlers.
pub type ApiResult<T> = Result<T, ApiError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn domain_errors_map_to_machine_codes() {
        let api: ApiError = Error::TunerBusy.into();
        assert_eq!(api.status, StatusCode::CONFLICT);
        assert_eq!(api.code, "TUNER_BUSY");

        let api: ApiError = Error::LeaseExpired.into();
        assert_eq!(api.status, StatusCode::GONE);
        assert_eq!(api.code, "LEASE_EXPIRED");

        let api: ApiError = Error::validation("bad serviceRef").into();
        assert_eq!(api.status, StatusCode::BAD_REQUEST);
        assert_eq!(api.code, "INVALID_INPUT");

        let api: ApiError = Error::not_found("Session", "abc").into();
        assert_eq!(api.status, StatusCode::NOT_FOUND);
        assert_eq!(api.code, "SESSION_NOT_FOUND");
    }

    #[test]
    fn request_id_is_carried_into_the_body() {
        let err = ApiError::tuner_busy().with_request_id("req-42");
        assert_eq!(err.request_id, "req-42");
    }
}
