use axum::{
    extract::{Query, State},
    Extension, Json,
};
use serde_json::Value as JsonValue;

use crate::{
    dto::config_dto::{
        ConfigurationQuery, ConfigurationResponse, EventStreamConfigPayload,
        KoboCredentialsPayload, UnmaskedConfigurationResponse, WebhookConfigPayload,
    },
    error::{Error, Result},
    middleware::auth::Claims,
    models::settings::RedactedSettings,
    AppState,
};

pub async fn get_configuration(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Query(query): Query<ConfigurationQuery>,
) -> Result<Json<JsonValue>> {
    let webhook_url = state.config.webhook_url();
    if query.unmask {
        if !claims.is_admin() {
            return Err(Error::Forbidden(
                "Only administrators can view unmasked configuration".to_string(),
            ));
        }
        tracing::info!(user = %claims.sub, "Unmasked configuration requested");
        let (settings, version) = state.settings.get_unmasked().await;
        return Ok(Json(serde_json::to_value(UnmaskedConfigurationResponse {
            version,
            settings,
            webhook_url,
        })?));
    }

    let settings = state.settings.get().await;
    Ok(Json(serde_json::to_value(ConfigurationResponse {
        settings,
        webhook_url,
    })?))
}

pub async fn set_eventstream(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Json(payload): Json<EventStreamConfigPayload>,
) -> Result<Json<RedactedSettings>> {
    let updated = state.settings.set_outbound(payload).await?;
    tracing::info!(user = %claims.sub, version = updated.version, "Event stream configuration saved");
    Ok(Json(updated))
}

pub async fn set_webhook(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Json(payload): Json<WebhookConfigPayload>,
) -> Result<Json<RedactedSettings>> {
    let updated = state.settings.set_webhook(payload).await?;
    tracing::info!(user = %claims.sub, version = updated.version, "Webhook configuration saved");
    Ok(Json(updated))
}

pub async fn set_kobo(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Json(payload): Json<KoboCredentialsPayload>,
) -> Result<Json<RedactedSettings>> {
    let updated = state.settings.set_kobo(payload).await?;
    tracing::info!(user = %claims.sub, version = updated.version, "KoboToolbox credentials saved");
    Ok(Json(updated))
}
