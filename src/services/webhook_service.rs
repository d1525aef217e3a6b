use serde_json::Value as JsonValue;
use std::sync::Arc;
use tokio::task::JoinHandle;

use crate::error::{Error, Result};
use crate::models::delivery_record::{NewDeliveryRecord, SourceKind};
use crate::services::config_service::ConfigStore;
use crate::services::delivery_service::DeliveryPipeline;
use crate::utils::signature::verify_hex_signature;
use crate::utils::validation::{sanitize_submission, validate_submission};

#[derive(Debug, Default, Clone)]
pub struct InboundWebhook<'a> {
    pub body: &'a [u8],
    pub signature: Option<&'a str>,
    pub source_ip: Option<String>,
    pub user_agent: Option<String>,
}

#[derive(Debug)]
pub struct Accepted {
    pub record_id: u64,
    pub payload_size: usize,
    /// Background delivery; callers normally let it run detached.
    pub delivery: JoinHandle<()>,
}

pub struct WebhookReceiver {
    config: Arc<ConfigStore>,
    pipeline: Arc<DeliveryPipeline>,
}

impl WebhookReceiver {
    pub fn new(config: Arc<ConfigStore>, pipeline: Arc<DeliveryPipeline>) -> Self {
        Self { config, pipeline }
    }

    /// Checks size, signature and shape, records the submission and starts delivery.
    pub async fn receive(&self, inbound: InboundWebhook<'_>) -> Result<Accepted> {
        let webhook = self.config.webhook().await;
        let size = inbound.body.len();

        if size > webhook.max_payload_size {
            tracing::warn!(size, limit = webhook.max_payload_size, "Rejected oversized webhook");
            return Err(Error::PayloadTooLarge {
                size,
                limit: webhook.max_payload_size,
            });
        }

        if webhook.verify_signature {
            let Some(secret) = webhook.kobo_secret.as_deref().filter(|s| !s.is_empty()) else {
                tracing::error!("Signature verification is enabled but no webhook secret is set");
                return Err(Error::Auth(
                    "Webhook signature verification is enabled but no secret is configured"
                        .to_string(),
                ));
            };
            let Some(signature) = inbound.signature else {
                tracing::warn!(source_ip = ?inbound.source_ip, "Webhook without signature header");
                return Err(Error::Auth("Missing X-Kobo-Signature header".to_string()));
            };
            if !verify_hex_signature(secret.as_bytes(), inbound.body, signature) {
                tracing::warn!(source_ip = ?inbound.source_ip, "Webhook signature mismatch");
                return Err(Error::Auth("Invalid webhook signature".to_string()));
            }
        }

        let payload: JsonValue = serde_json::from_slice(inbound.body)
            .map_err(|e| Error::Validation(format!("Invalid JSON payload: {}", e)))?;
        validate_submission(&payload).map_err(|errors| Error::Validation(errors.join("; ")))?;
        let payload = sanitize_submission(payload);

        if self.config.outbound().await.is_none() {
            return Err(Error::ConfigMissing(
                "Event stream connection is not configured".to_string(),
            ));
        }

        let mut new = NewDeliveryRecord::for_payload(SourceKind::Webhook, &payload)
            .with_client(inbound.source_ip, inbound.user_agent);
        new.payload_size = size as u64;
        let record = self.pipeline.store().append(new).await?;
        let record_id = record.id;
        tracing::info!(
            record_id,
            size,
            form_id = record.kobo_form_id.as_deref().unwrap_or("-"),
            "Accepted KoboToolbox webhook"
        );

        let pipeline = self.pipeline.clone();
        let delivery = tokio::spawn(async move {
            if let Err(e) = pipeline.deliver(&payload, record_id).await {
                tracing::error!(record_id, "Webhook delivery aborted: {}", e);
            }
        });

        Ok(Accepted {
            record_id,
            payload_size: size,
            delivery,
        })
    }
}
