//! Liveness route.

use axum::Json;
use axum::extract::State;

use crate::api::models::HealthResponse;
use crate::api::server::AppState;

pub async fn healthz(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        uptime_secs: state.started_at.elapsed().as_secs(),
    })
}
