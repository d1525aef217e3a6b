use serde::{Deserialize, Serialize};
use validator::Validate;

use crate::error::{Error, Result};
use crate::models::settings::{
    EventStreamEndpoint, KoboCredentials, OutboundConfig, RedactedSettings, Settings,
    WebhookConfig,
};
use crate::utils::validation::{present, require_fields};

#[derive(Debug, Default, Deserialize, Validate)]
pub struct EventStreamConfigPayload {
    /// Pasted Azure connection string; split into the structured fields below.
    #[serde(default, deserialize_with = "trim_optional_string")]
    pub connection_string: Option<String>,
    #[serde(default, deserialize_with = "trim_optional_string")]
    pub namespace: Option<String>,
    #[serde(default, deserialize_with = "trim_optional_string")]
    pub entity_path: Option<String>,
    #[serde(default, deserialize_with = "trim_optional_string")]
    pub key_name: Option<String>,
    #[serde(default, deserialize_with = "trim_optional_string")]
    pub key_value: Option<String>,
    #[validate(range(max = 10, message = "max_retries must be between 0 and 10"))]
    pub max_retries: Option<u32>,
    #[validate(range(min = 0.0, max = 300.0, message = "retry_delay must be between 0 and 300 seconds"))]
    pub retry_delay: Option<f64>,
    #[validate(range(min = 1, max = 300, message = "timeout must be between 1 and 300 seconds"))]
    pub timeout: Option<u64>,
}

impl EventStreamConfigPayload {
    /// Builds a complete outbound config; endpoint and retry policy must all be present.
    pub fn into_outbound(mut self) -> Result<OutboundConfig> {
        self.validate()?;

        if let Some(raw) = self.connection_string.take() {
            let parsed = parse_connection_string(&raw)?;
            self.namespace = self.namespace.or(parsed.namespace);
            self.entity_path = self.entity_path.or(parsed.entity_path);
            self.key_name = self.key_name.or(parsed.key_name);
            self.key_value = self.key_value.or(parsed.key_value);
        }

        require_fields(&[
            ("namespace", present(&self.namespace)),
            ("entity_path", present(&self.entity_path)),
            ("key_name", present(&self.key_name)),
            ("key_value", present(&self.key_value)),
            ("max_retries", self.max_retries.is_some()),
            ("retry_delay", self.retry_delay.is_some()),
            ("timeout", self.timeout.is_some()),
        ])?;
        let (Some(max_retries), Some(retry_delay), Some(timeout)) =
            (self.max_retries, self.retry_delay, self.timeout)
        else {
            return Err(Error::Validation("Missing required fields".to_string()));
        };

        Ok(OutboundConfig {
            endpoint: EventStreamEndpoint {
                namespace: self.namespace.unwrap_or_default(),
                entity_path: self.entity_path.unwrap_or_default(),
                key_name: self.key_name.unwrap_or_default(),
                key_value: self.key_value.unwrap_or_default(),
            },
            max_retries,
            retry_delay,
            timeout,
        })
    }
}

#[derive(Debug, Default, PartialEq)]
pub struct ConnectionStringParts {
    pub namespace: Option<String>,
    pub entity_path: Option<String>,
    pub key_name: Option<String>,
    pub key_value: Option<String>,
}

/// Splits `Endpoint=sb://host/;SharedAccessKeyName=..;SharedAccessKey=..;EntityPath=..`.
pub fn parse_connection_string(raw: &str) -> Result<ConnectionStringParts> {
    let mut parts = ConnectionStringParts::default();
    for segment in raw.split(';').map(str::trim).filter(|s| !s.is_empty()) {
        let Some((key, value)) = segment.split_once('=') else {
            return Err(Error::Validation(format!(
                "Malformed connection string segment '{}'",
                segment
            )));
        };
        let value = value.trim().to_string();
        match key.trim().to_ascii_lowercase().as_str() {
            "endpoint" => {
                let host = value
                    .trim_start_matches("sb://")
                    .trim_end_matches('/')
                    .to_string();
                parts.namespace = Some(host);
            }
            "sharedaccesskeyname" => parts.key_name = Some(value),
            "sharedaccesskey" => parts.key_value = Some(value),
            "entitypath" => parts.entity_path = Some(value),
            _ => {}
        }
    }
    if parts == ConnectionStringParts::default() {
        return Err(Error::Validation(
            "Connection string does not contain any recognised field".to_string(),
        ));
    }
    Ok(parts)
}

#[derive(Debug, Default, Deserialize, Validate)]
pub struct WebhookConfigPayload {
    pub verify_signature: Option<bool>,
    /// Absent keeps the stored secret; an empty string clears it.
    pub kobo_secret: Option<String>,
    #[validate(range(
        min = 1,
        max = 104857600,
        message = "max_payload_size must be between 1 byte and 100 MiB"
    ))]
    pub max_payload_size: Option<usize>,
}

impl WebhookConfigPayload {
    /// Replaces the webhook config; only the secret may be omitted to keep the stored one.
    pub fn into_webhook(self, current: &WebhookConfig) -> Result<WebhookConfig> {
        self.validate()?;
        require_fields(&[
            ("verify_signature", self.verify_signature.is_some()),
            ("max_payload_size", self.max_payload_size.is_some()),
        ])?;
        let (Some(verify_signature), Some(max_payload_size)) =
            (self.verify_signature, self.max_payload_size)
        else {
            return Err(Error::Validation("Missing required fields".to_string()));
        };
        let kobo_secret = match self.kobo_secret {
            None => current.kobo_secret.clone(),
            Some(s) if s.trim().is_empty() => None,
            Some(s) => Some(s.trim().to_string()),
        };
        Ok(WebhookConfig {
            verify_signature,
            kobo_secret,
            max_payload_size,
        })
    }
}

#[derive(Debug, Default, Deserialize, Validate)]
pub struct KoboCredentialsPayload {
    #[serde(default, deserialize_with = "trim_optional_string")]
    pub server_url: Option<String>,
    #[serde(default, deserialize_with = "trim_optional_string")]
    pub api_token: Option<String>,
}

impl KoboCredentialsPayload {
    pub fn into_credentials(self) -> Result<KoboCredentials> {
        require_fields(&[
            ("server_url", present(&self.server_url)),
            ("api_token", present(&self.api_token)),
        ])?;
        let server_url = self.server_url.unwrap_or_default();
        let parsed = url::Url::parse(&server_url)
            .map_err(|e| Error::Validation(format!("server_url is not a valid URL: {}", e)))?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(Error::Validation(
                "server_url must use http or https".to_string(),
            ));
        }
        Ok(KoboCredentials {
            server_url: server_url.trim_end_matches('/').to_string(),
            api_token: self.api_token.unwrap_or_default(),
        })
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct ConfigurationQuery {
    #[serde(default)]
    pub unmask: bool,
}

#[derive(Debug, Serialize)]
pub struct ConfigurationResponse {
    #[serde(flatten)]
    pub settings: RedactedSettings,
    pub webhook_url: String,
}

#[derive(Debug, Serialize)]
pub struct UnmaskedConfigurationResponse {
    pub version: u64,
    #[serde(flatten)]
    pub settings: Settings,
    pub webhook_url: String,
}

fn trim_optional_string<'de, D>(deserializer: D) -> std::result::Result<Option<String>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let opt: Option<String> = Option::deserialize(deserializer)?;
    Ok(opt.and_then(|s| {
        let trimmed = s.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    }))
}
