use axum::{extract::State, Json};
use serde_json::{json, Value as JsonValue};

use crate::{
    dto::streaming_dto::{StartStreamingPayload, TestConnectionPayload},
    error::{Error, Result},
    models::{
        settings::KoboCredentials,
        streaming_session::{SessionStatus, StopOutcome},
    },
    services::kobo_service::{self, ConnectionReport, KoboProject},
    utils::validation::{present, require_fields},
    AppState,
};

async fn stored_credentials(state: &AppState) -> Result<KoboCredentials> {
    state.settings.kobo().await.ok_or_else(|| {
        Error::ConfigMissing("KoboToolbox credentials are not configured".to_string())
    })
}

pub async fn test_connection(
    State(state): State<AppState>,
    payload: Option<Json<TestConnectionPayload>>,
) -> Result<Json<ConnectionReport>> {
    let payload = payload.map(|Json(p)| p).unwrap_or_default();
    let creds = match (payload.server_url, payload.api_token) {
        (None, None) => stored_credentials(&state).await?,
        (server_url, api_token) => {
            require_fields(&[
                ("server_url", present(&server_url)),
                ("api_token", present(&api_token)),
            ])?;
            KoboCredentials {
                server_url: server_url.unwrap_or_default().trim().to_string(),
                api_token: api_token.unwrap_or_default().trim().to_string(),
            }
        }
    };
    let report = kobo_service::test_connection(state.streaming.source().as_ref(), &creds).await;
    Ok(Json(report))
}

pub async fn list_projects(State(state): State<AppState>) -> Result<Json<Vec<KoboProject>>> {
    let creds = stored_credentials(&state).await?;
    let projects = state.streaming.source().list_projects(&creds).await?;
    Ok(Json(projects))
}

pub async fn start_streaming(
    State(state): State<AppState>,
    payload: Option<Json<StartStreamingPayload>>,
) -> Result<Json<SessionStatus>> {
    let payload = payload.map(|Json(p)| p).unwrap_or_default();
    let status = state.streaming.start(payload.project_id).await?;
    Ok(Json(status))
}

pub async fn stop_streaming(State(state): State<AppState>) -> Json<JsonValue> {
    let outcome = state.streaming.stop().await;
    let message = match &outcome {
        StopOutcome::Stopped { forwarded, .. } => {
            format!("Streaming stopped after forwarding {} submissions", forwarded)
        }
        StopOutcome::NotActive { warning } => warning.clone(),
    };
    Json(json!({ "message": message, "result": outcome }))
}

pub async fn streaming_status(State(state): State<AppState>) -> Json<SessionStatus> {
    Json(state.streaming.status().await)
}
