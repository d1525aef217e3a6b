use axum::{
    http::StatusCode,
    response::{IntoResponse, Json},
};
use serde_json::json;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Unauthorized: {0}")]
    Auth(String),

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Payload too large: {size} bytes exceeds limit of {limit} bytes")]
    PayloadTooLarge { size: usize, limit: usize },

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Remote endpoint rejected the event: {0}")]
    RemoteRejected(String),

    #[error("Configuration missing: {0}")]
    ConfigMissing(String),

    #[error("Cancelled: {0}")]
    Cancelled(String),

    #[error("Streaming session already active for project {0}")]
    SessionActive(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Database error: {0}")]
    Database(sqlx::Error),

    #[error("Migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    Reqwest(#[from] reqwest::Error),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Stable machine-readable code sent alongside the message.
    pub fn code(&self) -> &'static str {
        match self {
            Error::Config(_) => "config_error",
            Error::Auth(_) => "auth_error",
            Error::Forbidden(_) => "forbidden",
            Error::Validation(_) => "validation_error",
            Error::PayloadTooLarge { .. } => "payload_too_large",
            Error::Transport(_) => "transport_error",
            Error::RemoteRejected(_) => "remote_rejected",
            Error::ConfigMissing(_) => "config_missing",
            Error::Cancelled(_) => "cancelled",
            Error::SessionActive(_) => "session_active",
            Error::NotFound(_) => "not_found",
            Error::Json(_) => "invalid_json",
            Error::Reqwest(_) => "upstream_error",
            Error::Database(_) | Error::Migrate(_) | Error::Internal(_) | Error::Io(_) => {
                "internal_error"
            }
        }
    }

    /// Only transport failures are worth another attempt; a rejection is final.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Transport(_))
    }

    fn status(&self) -> StatusCode {
        match self {
            Error::Auth(_) => StatusCode::UNAUTHORIZED,
            Error::Forbidden(_) => StatusCode::FORBIDDEN,
            Error::Validation(_) | Error::Json(_) | Error::ConfigMissing(_) => {
                StatusCode::BAD_REQUEST
            }
            Error::PayloadTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            Error::Transport(_) | Error::RemoteRejected(_) | Error::Reqwest(_) => {
                StatusCode::BAD_GATEWAY
            }
            Error::SessionActive(_) => StatusCode::CONFLICT,
            Error::Cancelled(_) => StatusCode::SERVICE_UNAVAILABLE,
            Error::NotFound(_) => StatusCode::NOT_FOUND,
            Error::Config(_)
            | Error::Database(_)
            | Error::Migrate(_)
            | Error::Internal(_)
            | Error::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> axum::response::Response {
        let status = self.status();
        let message = match &self {
            Error::Database(_) | Error::Migrate(_) | Error::Io(_) => {
                tracing::error!(error = %self, "request failed with internal error");
                "An unexpected error occurred".to_string()
            }
            other => other.to_string(),
        };

        let body = Json(json!({ "error": self.code(), "message": message }));
        (status, body).into_response()
    }
}

impl From<sqlx::Error> for Error {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => Error::NotFound("Resource not found".to_string()),
            other => Error::Database(other),
        }
    }
}

impl From<validator::ValidationErrors> for Error {
    fn from(errs: validator::ValidationErrors) -> Self {
        let mut fields: Vec<String> = errs
            .field_errors()
            .into_iter()
            .map(|(field, problems)| {
                let detail = problems
                    .iter()
                    .filter_map(|p| p.message.as_ref().map(|m| m.to_string()))
                    .collect::<Vec<_>>()
                    .join(", ");
                if detail.is_empty() {
                    format!("{} is invalid", field)
                } else {
                    format!("{}: {}", field, detail)
                }
            })
            .collect();
        fields.sort();
        Error::Validation(fields.join("; "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_transport_errors_are_retryable() {
        assert!(Error::Transport("timeout".into()).is_retryable());
        assert!(!Error::RemoteRejected("HTTP 401".into()).is_retryable());
        assert!(!Error::Cancelled("shutdown".into()).is_retryable());
        assert!(!Error::ConfigMissing("eventstream".into()).is_retryable());
        assert!(!Error::Auth("bad".into()).is_retryable());
    }

    #[test]
    fn status_codes_follow_taxonomy() {
        let too_large = Error::PayloadTooLarge { size: 11, limit: 10 };
        assert_eq!(too_large.status(), StatusCode::PAYLOAD_TOO_LARGE);
        assert_eq!(too_large.code(), "payload_too_large");
        assert_eq!(Error::Auth("x".into()).status(), StatusCode::UNAUTHORIZED);
        assert_eq!(
            Error::SessionActive("p".into()).status(),
            StatusCode::CONFLICT
        );
    }
}
