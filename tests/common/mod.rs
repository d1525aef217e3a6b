#![allow(dead_code)]

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use axum::{
    body::{to_bytes, Body},
    http::{Request, Response},
    Router,
};
use serde_json::{json, Value as JsonValue};

use kobo_relay::{
    build_router,
    config::Config,
    middleware::auth::{issue_token, ADMIN_ROLE},
    models::settings::{EventStreamEndpoint, KoboCredentials},
    services::{
        eventstream_client::{EventSink, SendError},
        kobo_service::{submission_id, KoboError, KoboProject, SubmissionSource},
    },
    Adapters, AppState,
};

pub const JWT_SECRET: &str = "test_secret_key";

/// Fails the first `failures` sends at the transport level, then accepts everything.
pub struct FlakySink {
    failures_left: AtomicU32,
    calls: AtomicU32,
}

impl FlakySink {
    pub fn new(failures: u32) -> Arc<Self> {
        Arc::new(Self {
            failures_left: AtomicU32::new(failures),
            calls: AtomicU32::new(0),
        })
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl EventSink for FlakySink {
    async fn send(
        &self,
        _endpoint: &EventStreamEndpoint,
        _event: &JsonValue,
    ) -> Result<(), SendError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let left = self.failures_left.load(Ordering::SeqCst);
        if left > 0 {
            self.failures_left.store(left - 1, Ordering::SeqCst);
            return Err(SendError::Transport("connection reset by peer".to_string()));
        }
        Ok(())
    }
}

/// Serves a fixed set of submissions for any project.
pub struct StaticSource {
    submissions: Vec<JsonValue>,
}

impl StaticSource {
    pub fn new(submissions: Vec<JsonValue>) -> Arc<Self> {
        Arc::new(Self { submissions })
    }
}

#[async_trait]
impl SubmissionSource for StaticSource {
    async fn count_assets(&self, creds: &KoboCredentials) -> Result<u64, KoboError> {
        if creds.api_token == "bad-token" {
            return Err(KoboError::Unrecoverable {
                status: 401,
                message: "Invalid token.".to_string(),
            });
        }
        Ok(1)
    }

    async fn list_projects(&self, _creds: &KoboCredentials) -> Result<Vec<KoboProject>, KoboError> {
        Ok(vec![KoboProject {
            uid: "aBcDeF123".to_string(),
            name: "Household survey".to_string(),
            date_created: Some("2024-01-10T08:00:00Z".to_string()),
            submission_count: self.submissions.len() as u64,
        }])
    }

    async fn fetch_submissions(
        &self,
        _creds: &KoboCredentials,
        _project_id: &str,
        after_id: Option<u64>,
        limit: u32,
    ) -> Result<Vec<JsonValue>, KoboError> {
        Ok(self
            .submissions
            .iter()
            .filter(|s| match (submission_id(s), after_id) {
                (Some(id), Some(after)) => id > after,
                _ => true,
            })
            .take(limit as usize)
            .cloned()
            .collect())
    }
}

pub fn submission(id: u64) -> JsonValue {
    json!({
        "_id": id,
        "_uuid": format!("uuid-{}", id),
        "_submission_time": "2024-03-01T10:15:00",
        "_submitted_by": "enumerator1",
        "_xform_id_string": "aBcDeF123",
        "household_size": 4
    })
}

pub async fn setup_app(
    config: Config,
    sink: Arc<dyn EventSink>,
    source: Arc<dyn SubmissionSource>,
) -> (Router, AppState) {
    let adapters = Adapters::in_memory(&config, sink, source);
    let state = AppState::new(config, adapters).await.expect("app state");
    (build_router(state.clone()), state)
}

pub fn bearer(role: Option<&str>) -> String {
    let token = issue_token(JWT_SECRET, "operator", role, chrono::Duration::hours(1))
        .expect("token");
    format!("Bearer {}", token)
}

pub fn admin() -> String {
    bearer(Some(ADMIN_ROLE))
}

pub fn json_request(method: &str, uri: &str, auth: Option<&str>, body: JsonValue) -> Request<Body> {
    let mut builder = Request::builder()
        .method(method)
        .uri(uri)
        .header("content-type", "application/json");
    if let Some(auth) = auth {
        builder = builder.header("authorization", auth);
    }
    builder.body(Body::from(body.to_string())).unwrap()
}

pub fn get_request(uri: &str, auth: Option<&str>) -> Request<Body> {
    let mut builder = Request::builder().method("GET").uri(uri);
    if let Some(auth) = auth {
        builder = builder.header("authorization", auth);
    }
    builder.body(Body::empty()).unwrap()
}

pub async fn json_body(resp: Response<Body>) -> JsonValue {
    let bytes = to_bytes(resp.into_body(), 1024 * 1024).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

pub fn eventstream_payload(max_retries: u32) -> JsonValue {
    json!({
        "connection_string": "Endpoint=sb://relay-test.servicebus.windows.net/;SharedAccessKeyName=send;SharedAccessKey=c2VjcmV0;EntityPath=kobo-submissions",
        "max_retries": max_retries,
        "retry_delay": 0.0,
        "timeout": 5
    })
}
