use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value as JsonValue};
use std::time::Duration;

use crate::error::Error;
use crate::models::settings::KoboCredentials;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum KoboError {
    /// Credentials or project are wrong; polling cannot make progress.
    #[error("KoboToolbox returned HTTP {status}: {message}")]
    Unrecoverable { status: u16, message: String },

    #[error("{0}")]
    Transient(String),
}

impl KoboError {
    pub fn from_status(status: StatusCode, body: &str) -> Self {
        let message: String = body.chars().take(200).collect();
        match status {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN | StatusCode::NOT_FOUND => {
                KoboError::Unrecoverable {
                    status: status.as_u16(),
                    message,
                }
            }
            other => KoboError::Transient(format!("HTTP {}: {}", other.as_u16(), message)),
        }
    }

    pub fn is_unrecoverable(&self) -> bool {
        matches!(self, KoboError::Unrecoverable { .. })
    }
}

impl From<KoboError> for Error {
    fn from(err: KoboError) -> Self {
        match err {
            unrecoverable @ KoboError::Unrecoverable { .. } => {
                Error::RemoteRejected(unrecoverable.to_string())
            }
            KoboError::Transient(msg) => Error::Transport(msg),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KoboProject {
    pub uid: String,
    pub name: String,
    pub date_created: Option<String>,
    pub submission_count: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConnectionReport {
    pub success: bool,
    pub message: String,
    pub project_count: Option<u64>,
}

/// Read access to a KoboToolbox server.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SubmissionSource: Send + Sync {
    /// Total number of assets visible to the token.
    async fn count_assets(&self, creds: &KoboCredentials) -> Result<u64, KoboError>;

    async fn list_projects(&self, creds: &KoboCredentials) -> Result<Vec<KoboProject>, KoboError>;

    /// Submissions with `_id` above `after_id`, ascending, at most `limit`.
    async fn fetch_submissions(
        &self,
        creds: &KoboCredentials,
        project_id: &str,
        after_id: Option<u64>,
        limit: u32,
    ) -> Result<Vec<JsonValue>, KoboError>;
}

pub async fn test_connection(
    source: &dyn SubmissionSource,
    creds: &KoboCredentials,
) -> ConnectionReport {
    match source.count_assets(creds).await {
        Ok(count) => ConnectionReport {
            success: true,
            message: format!("Connection successful. Found {} projects.", count),
            project_count: Some(count),
        },
        Err(e) => {
            tracing::warn!("KoboToolbox connection test failed: {}", e);
            ConnectionReport {
                success: false,
                message: format!("Connection test failed: {}", e),
                project_count: None,
            }
        }
    }
}

/// `_id` of a submission; KoboToolbox sends it as a number, some exports as a string.
pub fn submission_id(submission: &JsonValue) -> Option<u64> {
    match submission.get("_id")? {
        JsonValue::Number(n) => n.as_u64(),
        JsonValue::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

#[derive(Clone)]
pub struct KoboClient {
    client: Client,
}

impl KoboClient {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    pub fn with_default_client() -> crate::error::Result<Self> {
        let client = Client::builder().timeout(REQUEST_TIMEOUT).build()?;
        Ok(Self::new(client))
    }

    fn api_url(creds: &KoboCredentials, path: &str) -> String {
        format!("{}/api/v2/{}", creds.server_url.trim_end_matches('/'), path)
    }

    async fn get_json(
        &self,
        creds: &KoboCredentials,
        url: &str,
        query: &[(&str, String)],
    ) -> Result<JsonValue, KoboError> {
        let res = self
            .client
            .get(url)
            .header(
                reqwest::header::AUTHORIZATION,
                format!("Token {}", creds.api_token),
            )
            .header(reqwest::header::ACCEPT, "application/json")
            .query(query)
            .send()
            .await
            .map_err(|e| KoboError::Transient(e.to_string()))?;

        let status = res.status();
        if !status.is_success() {
            let body = res.text().await.unwrap_or_default();
            return Err(KoboError::from_status(status, &body));
        }

        let content_type = res
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string();
        if !content_type.contains("application/json") {
            return Err(KoboError::Transient(format!(
                "Expected JSON but got '{}'. Check server URL and token.",
                content_type
            )));
        }
        res.json::<JsonValue>()
            .await
            .map_err(|e| KoboError::Transient(format!("Failed to parse JSON: {}", e)))
    }
}

#[async_trait]
impl SubmissionSource for KoboClient {
    async fn count_assets(&self, creds: &KoboCredentials) -> Result<u64, KoboError> {
        let url = Self::api_url(creds, "assets/");
        let body = self
            .get_json(creds, &url, &[("format", "json".to_string())])
            .await?;
        Ok(body.get("count").and_then(JsonValue::as_u64).unwrap_or(0))
    }

    async fn list_projects(&self, creds: &KoboCredentials) -> Result<Vec<KoboProject>, KoboError> {
        let url = Self::api_url(creds, "assets/");
        let body = self
            .get_json(creds, &url, &[("format", "json".to_string())])
            .await?;
        Ok(projects_from_assets(&body))
    }

    async fn fetch_submissions(
        &self,
        creds: &KoboCredentials,
        project_id: &str,
        after_id: Option<u64>,
        limit: u32,
    ) -> Result<Vec<JsonValue>, KoboError> {
        let url = Self::api_url(creds, &format!("assets/{}/data/", project_id));
        let filter = match after_id {
            Some(id) => json!({"_id": {"$gt": id}}),
            None => json!({}),
        };
        let body = self
            .get_json(
                creds,
                &url,
                &[
                    ("format", "json".to_string()),
                    ("limit", limit.to_string()),
                    ("query", filter.to_string()),
                    ("sort", json!({"_id": 1}).to_string()),
                ],
            )
            .await?;

        let mut results = body
            .get("results")
            .and_then(JsonValue::as_array)
            .cloned()
            .unwrap_or_default();
        results.sort_by_key(|s| submission_id(s).unwrap_or(0));
        tracing::debug!(project_id, "Retrieved {} submissions", results.len());
        Ok(results)
    }
}

fn projects_from_assets(body: &JsonValue) -> Vec<KoboProject> {
    let Some(results) = body.get("results").and_then(JsonValue::as_array) else {
        return Vec::new();
    };
    results
        .iter()
        .filter(|asset| asset.get("asset_type").and_then(JsonValue::as_str) == Some("survey"))
        .filter_map(|asset| {
            let uid = asset
                .get("uid")
                .and_then(JsonValue::as_str)
                .map(str::to_string)
                .or_else(|| {
                    asset
                        .get("url")
                        .and_then(JsonValue::as_str)
                        .and_then(|u| u.trim_end_matches('/').rsplit('/').next())
                        .map(str::to_string)
                })?;
            let name = asset
                .get("name")
                .or_else(|| asset.get("title"))
                .and_then(JsonValue::as_str)
                .filter(|n| !n.is_empty())
                .map(str::to_string)
                .unwrap_or_else(|| uid.clone());
            Some(KoboProject {
                name,
                date_created: asset
                    .get("date_created")
                    .and_then(JsonValue::as_str)
                    .map(str::to_string),
                submission_count: asset
                    .get("deployment__submission_count")
                    .or_else(|| asset.get("num_submissions"))
                    .and_then(JsonValue::as_u64)
                    .unwrap_or(0),
                uid,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn creds() -> KoboCredentials {
        KoboCredentials {
            server_url: "https://kf.kobotoolbox.org".into(),
            api_token: "tok".into(),
        }
    }

    #[test]
    fn auth_and_missing_project_are_unrecoverable() {
        assert!(KoboError::from_status(StatusCode::UNAUTHORIZED, "").is_unrecoverable());
        assert!(KoboError::from_status(StatusCode::FORBIDDEN, "").is_unrecoverable());
        assert!(KoboError::from_status(StatusCode::NOT_FOUND, "").is_unrecoverable());
        assert!(!KoboError::from_status(StatusCode::BAD_GATEWAY, "").is_unrecoverable());
        assert!(!KoboError::from_status(StatusCode::TOO_MANY_REQUESTS, "").is_unrecoverable());
    }

    #[test]
    fn only_survey_assets_become_projects() {
        let body = json!({
            "count": 3,
            "results": [
                {"uid": "aBc", "name": "Household", "asset_type": "survey",
                 "date_created": "2024-01-01T00:00:00Z", "deployment__submission_count": 12},
                {"uid": "q1", "name": "Question block", "asset_type": "block"},
                {"url": "https://kf.kobotoolbox.org/api/v2/assets/xYz/", "title": "", "asset_type": "survey"}
            ]
        });
        let projects = projects_from_assets(&body);
        assert_eq!(projects.len(), 2);
        assert_eq!(projects[0].uid, "aBc");
        assert_eq!(projects[0].submission_count, 12);
        assert_eq!(projects[1].uid, "xYz");
        assert_eq!(projects[1].name, "xYz");
    }

    #[test]
    fn submission_id_accepts_numbers_and_strings() {
        assert_eq!(submission_id(&json!({"_id": 17})), Some(17));
        assert_eq!(submission_id(&json!({"_id": "18"})), Some(18));
        assert_eq!(submission_id(&json!({"_id": null})), None);
        assert_eq!(submission_id(&json!({})), None);
    }

    #[tokio::test]
    async fn connection_report_reflects_source() {
        let mut source = MockSubmissionSource::new();
        source.expect_count_assets().returning(|_| Ok(4));
        let report = test_connection(&source, &creds()).await;
        assert!(report.success);
        assert_eq!(report.project_count, Some(4));

        let mut failing = MockSubmissionSource::new();
        failing.expect_count_assets().returning(|_| {
            Err(KoboError::Unrecoverable {
                status: 401,
                message: "Invalid token".into(),
            })
        });
        let report = test_connection(&failing, &creds()).await;
        assert!(!report.success);
        assert!(report.message.contains("401"));
    }
}
