use axum::{extract::State, http::StatusCode, response::IntoResponse, Json};

use crate::{services::health_service::OverallStatus, AppState};

pub async fn health(State(state): State<AppState>) -> impl IntoResponse {
    let report = state.health.check().await;
    let code = match report.status {
        OverallStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
        OverallStatus::Healthy | OverallStatus::Degraded => StatusCode::OK,
    };
    (code, Json(report))
}
