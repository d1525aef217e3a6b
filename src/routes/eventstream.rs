use axum::{extract::State, Json};
use serde_json::{json, Value as JsonValue};

use crate::{error::Result, models::delivery_record::DeliveryStatus, AppState};

pub async fn test_eventstream(State(state): State<AppState>) -> Result<Json<JsonValue>> {
    let outcome = state.pipeline.send_test_event().await?;
    let success = outcome.status == DeliveryStatus::Success;
    let message = if success {
        "Test event delivered".to_string()
    } else {
        format!(
            "Test event failed: {}",
            outcome.error.as_deref().unwrap_or("unknown error")
        )
    };
    Ok(Json(json!({
        "success": success,
        "message": message,
        "outcome": outcome,
    })))
}
