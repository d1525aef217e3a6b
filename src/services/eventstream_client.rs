use async_trait::async_trait;
use reqwest::Client;
use serde_json::Value as JsonValue;
use std::time::Duration;

use crate::error::Error;
use crate::models::settings::EventStreamEndpoint;
use crate::utils::signature::shared_access_signature;

const SAS_TOKEN_TTL_SECS: i64 = 3600;
const MAX_ERROR_BODY: usize = 500;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SendError {
    #[error("{0}")]
    Transport(String),

    #[error("HTTP {status}: {body}")]
    Rejected { status: u16, body: String },
}

impl From<SendError> for Error {
    fn from(err: SendError) -> Self {
        match err {
            SendError::Transport(msg) => Error::Transport(msg),
            SendError::Rejected { status, ref body }
                if status >= 500 || status == 408 || status == 429 =>
            {
                Error::Transport(format!("HTTP {}: {}", status, body))
            }
            rejected @ SendError::Rejected { .. } => Error::RemoteRejected(rejected.to_string()),
        }
    }
}

/// Outbound event-stream transport.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn send(
        &self,
        endpoint: &EventStreamEndpoint,
        event: &JsonValue,
    ) -> std::result::Result<(), SendError>;
}

#[derive(Clone)]
pub struct HttpEventStreamClient {
    client: Client,
}

impl HttpEventStreamClient {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    pub fn with_default_client() -> crate::error::Result<Self> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self::new(client))
    }
}

#[async_trait]
impl EventSink for HttpEventStreamClient {
    async fn send(
        &self,
        endpoint: &EventStreamEndpoint,
        event: &JsonValue,
    ) -> std::result::Result<(), SendError> {
        let expiry = chrono::Utc::now().timestamp() + SAS_TOKEN_TTL_SECS;
        let token = shared_access_signature(
            &endpoint.resource_uri(),
            &endpoint.key_name,
            &endpoint.key_value,
            expiry,
        )
        .ok_or_else(|| SendError::Transport("invalid shared access key".to_string()))?;

        let res = self
            .client
            .post(endpoint.messages_url())
            .header(reqwest::header::AUTHORIZATION, token)
            .header("source", "kobodata")
            .json(event)
            .send()
            .await
            .map_err(|e| SendError::Transport(e.to_string()))?;

        let status = res.status();
        if status.is_success() {
            return Ok(());
        }
        let mut body = res.text().await.unwrap_or_default();
        if body.len() > MAX_ERROR_BODY {
            let mut cut = MAX_ERROR_BODY;
            while !body.is_char_boundary(cut) {
                cut -= 1;
            }
            body.truncate(cut);
        }
        Err(SendError::Rejected {
            status: status.as_u16(),
            body,
        })
    }
}
