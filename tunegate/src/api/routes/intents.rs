//! Intent admission route.

use axum::Json;
use axum::extract::State;
use axum::http::StatusCode;

use crate::api::error::{ApiError, ApiResult};
use crate::api::models::{Correlation, CreateIntentRequest, CreateIntentResponse, ValidatedJson};
use crate::api::server::AppState;
use crate::services::intents::CreateIntent;

/// `POST /intents`: lease a tuner and admit a new session.
pub async fn create_intent(
    State(state): State<AppState>,
    Correlation(request_id): Correlation,
    ValidatedJson(body): ValidatedJson<CreateIntentRequest>,
) -> ApiResult<(StatusCode, Json<CreateIntentResponse>)> {
    let outcome = state
        .intents
        .create(
            CreateIntent {
                service_ref: body.service_ref,
                profile_id: body.profile_id,
                idempotency_key: body.idempotency_key,
            },
            &request_id,
        )
        .await
        .map_err(|e| ApiError::from(e).with_request_id(&request_id))?;

    Ok((
        StatusCode::ACCEPTED,
        Json(CreateIntentResponse {
            session_id: outcome.session_id,
            status: "accepted",
        }),
    ))
}
