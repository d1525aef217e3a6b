use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::config::DEFAULT_MAX_PAYLOAD_SIZE;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventStreamEndpoint {
    pub namespace: String,
    pub entity_path: String,
    pub key_name: String,
    pub key_value: String,
}

impl EventStreamEndpoint {
    /// Base URL of the event hub; a bare host gets `https://`.
    pub fn base_url(&self) -> String {
        let ns = self
            .namespace
            .trim()
            .trim_start_matches("sb://")
            .trim_end_matches('/');
        if ns.starts_with("http://") || ns.starts_with("https://") {
            ns.to_string()
        } else {
            format!("https://{}", ns)
        }
    }

    pub fn messages_url(&self) -> String {
        format!(
            "{}/{}/messages",
            self.base_url(),
            self.entity_path.trim_matches('/')
        )
    }

    /// Resource URI the SAS token is scoped to.
    pub fn resource_uri(&self) -> String {
        format!("{}/{}", self.base_url(), self.entity_path.trim_matches('/'))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboundConfig {
    pub endpoint: EventStreamEndpoint,
    pub max_retries: u32,
    /// Seconds between attempts.
    pub retry_delay: f64,
    /// Seconds allowed per attempt.
    pub timeout: u64,
}

impl OutboundConfig {
    pub fn retry_delay(&self) -> Duration {
        Duration::from_secs_f64(self.retry_delay.max(0.0))
    }

    pub fn attempt_timeout(&self) -> Duration {
        Duration::from_secs(self.timeout.max(1))
    }

    pub fn redacted(&self) -> RedactedOutboundConfig {
        RedactedOutboundConfig {
            namespace: self.endpoint.namespace.clone(),
            entity_path: self.endpoint.entity_path.clone(),
            key_name: self.endpoint.key_name.clone(),
            key_value_configured: !self.endpoint.key_value.is_empty(),
            max_retries: self.max_retries,
            retry_delay: self.retry_delay,
            timeout: self.timeout,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RedactedOutboundConfig {
    pub namespace: String,
    pub entity_path: String,
    pub key_name: String,
    pub key_value_configured: bool,
    pub max_retries: u32,
    pub retry_delay: f64,
    pub timeout: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebhookConfig {
    pub verify_signature: bool,
    pub kobo_secret: Option<String>,
    pub max_payload_size: usize,
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            verify_signature: true,
            kobo_secret: None,
            max_payload_size: DEFAULT_MAX_PAYLOAD_SIZE,
        }
    }
}

impl WebhookConfig {
    pub fn redacted(&self) -> RedactedWebhookConfig {
        RedactedWebhookConfig {
            verify_signature: self.verify_signature,
            kobo_secret_configured: self
                .kobo_secret
                .as_deref()
                .map(|s| !s.is_empty())
                .unwrap_or(false),
            max_payload_size: self.max_payload_size,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RedactedWebhookConfig {
    pub verify_signature: bool,
    pub kobo_secret_configured: bool,
    pub max_payload_size: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KoboCredentials {
    pub server_url: String,
    pub api_token: String,
}

impl KoboCredentials {
    pub fn redacted(&self) -> RedactedKoboCredentials {
        RedactedKoboCredentials {
            server_url: self.server_url.clone(),
            api_token_configured: !self.api_token.is_empty(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RedactedKoboCredentials {
    pub server_url: String,
    pub api_token_configured: bool,
}

/// Complete configuration held by the config store.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    pub outbound: Option<OutboundConfig>,
    pub webhook: WebhookConfig,
    pub kobo: Option<KoboCredentials>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RedactedSettings {
    pub version: u64,
    pub eventstream: Option<RedactedOutboundConfig>,
    pub webhook: RedactedWebhookConfig,
    pub kobo: Option<RedactedKoboCredentials>,
}

impl Settings {
    pub fn redacted(&self, version: u64) -> RedactedSettings {
        RedactedSettings {
            version,
            eventstream: self.outbound.as_ref().map(OutboundConfig::redacted),
            webhook: self.webhook.redacted(),
            kobo: self.kobo.as_ref().map(KoboCredentials::redacted),
        }
    }
}
