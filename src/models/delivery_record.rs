use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    Webhook,
    StreamPoll,
}

impl SourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceKind::Webhook => "webhook",
            SourceKind::StreamPoll => "stream_poll",
        }
    }
}

impl std::str::FromStr for SourceKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "webhook" => Ok(SourceKind::Webhook),
            "stream_poll" => Ok(SourceKind::StreamPoll),
            other => Err(format!("unknown source kind '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    Pending,
    Retrying,
    Success,
    Failed,
}

impl DeliveryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeliveryStatus::Pending => "pending",
            DeliveryStatus::Retrying => "retrying",
            DeliveryStatus::Success => "success",
            DeliveryStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, DeliveryStatus::Success | DeliveryStatus::Failed)
    }

    /// pending -> retrying* -> {success | failed}; terminal states never move.
    pub fn can_advance_to(&self, next: DeliveryStatus) -> bool {
        match (self, next) {
            (DeliveryStatus::Success, _) | (DeliveryStatus::Failed, _) => false,
            (_, DeliveryStatus::Pending) => *self == DeliveryStatus::Pending,
            (DeliveryStatus::Pending, _) => true,
            (DeliveryStatus::Retrying, _) => true,
        }
    }
}

impl std::str::FromStr for DeliveryStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(DeliveryStatus::Pending),
            "retrying" => Ok(DeliveryStatus::Retrying),
            "success" => Ok(DeliveryStatus::Success),
            "failed" => Ok(DeliveryStatus::Failed),
            other => Err(format!("unknown delivery status '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeliveryRecord {
    pub id: u64,
    pub source: SourceKind,
    pub received_at: DateTime<Utc>,
    pub payload_size: u64,
    pub retry_count: u32,
    pub status: DeliveryStatus,
    pub processing_time_ms: Option<f64>,
    pub error_message: Option<String>,
    pub kobo_form_id: Option<String>,
    pub submission_uuid: Option<String>,
    pub source_ip: Option<String>,
    pub user_agent: Option<String>,
    pub payload_preview: Option<JsonValue>,
}

/// Fields known at receipt time; the store assigns the id.
#[derive(Debug, Clone, Default)]
pub struct NewDeliveryRecord {
    pub source: Option<SourceKind>,
    pub payload_size: u64,
    pub kobo_form_id: Option<String>,
    pub submission_uuid: Option<String>,
    pub source_ip: Option<String>,
    pub user_agent: Option<String>,
    pub payload_preview: Option<JsonValue>,
}

impl NewDeliveryRecord {
    pub fn for_payload(source: SourceKind, payload: &JsonValue) -> Self {
        let payload_size = serde_json::to_vec(payload).map(|b| b.len()).unwrap_or(0) as u64;
        Self {
            source: Some(source),
            payload_size,
            kobo_form_id: payload
                .get("_xform_id_string")
                .and_then(|v| v.as_str())
                .map(str::to_string),
            submission_uuid: payload
                .get("_uuid")
                .and_then(|v| v.as_str())
                .map(str::to_string),
            source_ip: None,
            user_agent: None,
            payload_preview: Some(payload_preview(payload, 5)),
        }
    }

    pub fn with_client(mut self, source_ip: Option<String>, user_agent: Option<String>) -> Self {
        self.source_ip = source_ip;
        self.user_agent = user_agent;
        self
    }

    pub fn into_record(self, id: u64, received_at: DateTime<Utc>) -> DeliveryRecord {
        DeliveryRecord {
            id,
            source: self.source.unwrap_or(SourceKind::Webhook),
            received_at,
            payload_size: self.payload_size,
            retry_count: 0,
            status: DeliveryStatus::Pending,
            processing_time_ms: None,
            error_message: None,
            kobo_form_id: self.kobo_form_id,
            submission_uuid: self.submission_uuid,
            source_ip: self.source_ip,
            user_agent: self.user_agent,
            payload_preview: self.payload_preview,
        }
    }
}

/// Keeps the first `max_fields` top-level entries; nested values are summarized.
pub fn payload_preview(payload: &JsonValue, max_fields: usize) -> JsonValue {
    let Some(obj) = payload.as_object() else {
        return JsonValue::Null;
    };

    let mut preview = serde_json::Map::new();
    for (key, value) in obj.iter().take(max_fields) {
        let summarized = match value {
            JsonValue::Object(m) => JsonValue::String(format!("<dict with {} keys>", m.len())),
            JsonValue::Array(a) => JsonValue::String(format!("<list with {} items>", a.len())),
            other => other.clone(),
        };
        preview.insert(key.clone(), summarized);
    }
    if obj.len() > max_fields {
        preview.insert(
            "_truncated".to_string(),
            JsonValue::String(format!("... and {} more fields", obj.len() - max_fields)),
        );
    }
    JsonValue::Object(preview)
}
