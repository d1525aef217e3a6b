use chrono::{DateTime, Utc};
use serde_json::{json, Value as JsonValue};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};
use crate::models::delivery_record::{DeliveryStatus, NewDeliveryRecord, SourceKind};
use crate::models::settings::KoboCredentials;
use crate::models::streaming_session::{Checkpoint, SessionState, SessionStatus, StopOutcome};
use crate::services::checkpoint_store::CheckpointStore;
use crate::services::config_service::ConfigStore;
use crate::services::delivery_service::DeliveryPipeline;
use crate::services::kobo_service::{submission_id, SubmissionSource};
use crate::utils::validation::{present, require_fields};

pub const MAX_ERROR_BACKOFF: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy)]
pub struct PollingSettings {
    pub interval: Duration,
    pub batch_size: u32,
}

impl Default for PollingSettings {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            batch_size: 50,
        }
    }
}

/// Copies a polled submission and tags it as coming from the streaming session.
pub fn normalize_submission(mut submission: JsonValue, now: DateTime<Utc>) -> JsonValue {
    if let Some(obj) = submission.as_object_mut() {
        let stamp = now.to_rfc3339();
        obj.insert("_source".to_string(), json!("kobo_streaming"));
        obj.insert("_streaming_timestamp".to_string(), json!(stamp));
        obj.entry("_submission_time").or_insert_with(|| json!(stamp));
    }
    submission
}

struct ActiveSession {
    project_id: String,
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// Owns the single polling session of the process.
pub struct StreamingSessionManager {
    config: Arc<ConfigStore>,
    source: Arc<dyn SubmissionSource>,
    pipeline: Arc<DeliveryPipeline>,
    checkpoints: Arc<dyn CheckpointStore>,
    polling: PollingSettings,
    status: Arc<RwLock<SessionStatus>>,
    active: Mutex<Option<ActiveSession>>,
}

impl StreamingSessionManager {
    pub fn new(
        config: Arc<ConfigStore>,
        source: Arc<dyn SubmissionSource>,
        pipeline: Arc<DeliveryPipeline>,
        checkpoints: Arc<dyn CheckpointStore>,
        polling: PollingSettings,
    ) -> Self {
        Self {
            config,
            source,
            pipeline,
            checkpoints,
            polling,
            status: Arc::new(RwLock::new(SessionStatus::idle())),
            active: Mutex::new(None),
        }
    }

    pub fn source(&self) -> &Arc<dyn SubmissionSource> {
        &self.source
    }

    pub async fn status(&self) -> SessionStatus {
        self.status.read().await.clone()
    }

    /// A worker that already marked the session idle is only winding down.
    async fn is_running(&self, session: &ActiveSession) -> bool {
        !session.handle.is_finished() && self.status.read().await.state == SessionState::Active
    }

    pub async fn start(&self, project_id: Option<String>) -> Result<SessionStatus> {
        let mut active = self.active.lock().await;
        if let Some(session) = active.take() {
            if self.is_running(&session).await {
                let project_id = session.project_id.clone();
                *active = Some(session);
                return Err(Error::SessionActive(project_id));
            }
            reap(session).await;
        }

        let creds = self.config.kobo().await;
        let server_url = creds.as_ref().map(|c| c.server_url.clone());
        let api_token = creds.as_ref().map(|c| c.api_token.clone());
        let project_id = project_id.map(|p| p.trim().to_string());
        require_fields(&[
            ("project_id", present(&project_id)),
            ("server_url", present(&server_url)),
            ("api_token", present(&api_token)),
        ])?;
        let (Some(project_id), Some(creds)) = (project_id, creds) else {
            return Err(Error::Validation("Missing required fields".to_string()));
        };

        if self.config.outbound().await.is_none() {
            return Err(Error::ConfigMissing(
                "Event stream connection is not configured".to_string(),
            ));
        }

        let checkpoint = self.checkpoints.load(&project_id).await?;
        let now = Utc::now();
        let snapshot = SessionStatus {
            state: SessionState::Active,
            project_id: Some(project_id.clone()),
            server_url: Some(creds.server_url.clone()),
            started_at: Some(now),
            last_poll_at: None,
            last_error: None,
            forwarded: 0,
            checkpoint,
        };
        *self.status.write().await = snapshot.clone();

        let cancel = CancellationToken::new();
        let worker = PollWorker {
            project_id: project_id.clone(),
            creds,
            source: self.source.clone(),
            pipeline: self.pipeline.clone(),
            checkpoints: self.checkpoints.clone(),
            polling: self.polling,
            status: self.status.clone(),
            cancel: cancel.clone(),
            after: checkpoint.map(|c| c.last_submission_id),
        };
        let handle = tokio::spawn(worker.run());

        tracing::info!(
            project_id = %project_id,
            interval_secs = self.polling.interval.as_secs(),
            batch_size = self.polling.batch_size,
            "Started KoboToolbox streaming session"
        );
        *active = Some(ActiveSession {
            project_id,
            cancel,
            handle,
        });
        Ok(snapshot)
    }

    /// Cancels the session and waits for the record in flight to finish.
    pub async fn stop(&self) -> StopOutcome {
        let mut active = self.active.lock().await;
        let Some(session) = active.take() else {
            return StopOutcome::NotActive {
                warning: "Streaming is not active".to_string(),
            };
        };
        if !self.is_running(&session).await {
            reap(session).await;
            return StopOutcome::NotActive {
                warning: "Streaming is not active".to_string(),
            };
        }

        self.status.write().await.state = SessionState::Stopping;
        session.cancel.cancel();
        if let Err(e) = session.handle.await {
            tracing::error!("Streaming worker ended abnormally: {}", e);
        }

        let mut status = self.status.write().await;
        status.state = SessionState::Idle;
        tracing::info!(
            project_id = %session.project_id,
            forwarded = status.forwarded,
            "Stopped KoboToolbox streaming session"
        );
        StopOutcome::Stopped {
            project_id: session.project_id,
            forwarded: status.forwarded,
        }
    }
}

async fn reap(session: ActiveSession) {
    if let Err(e) = session.handle.await {
        tracing::error!(project_id = %session.project_id, "Streaming worker ended abnormally: {}", e);
    }
}

struct PollWorker {
    project_id: String,
    creds: KoboCredentials,
    source: Arc<dyn SubmissionSource>,
    pipeline: Arc<DeliveryPipeline>,
    checkpoints: Arc<dyn CheckpointStore>,
    polling: PollingSettings,
    status: Arc<RwLock<SessionStatus>>,
    cancel: CancellationToken,
    after: Option<u64>,
}

impl PollWorker {
    async fn run(mut self) {
        loop {
            let fetched = tokio::select! {
                _ = self.cancel.cancelled() => break,
                res = self.source.fetch_submissions(
                    &self.creds,
                    &self.project_id,
                    self.after,
                    self.polling.batch_size,
                ) => res,
            };
            self.status.write().await.last_poll_at = Some(Utc::now());

            let wait = match fetched {
                Ok(batch) => {
                    let full = batch.len() as u64 >= u64::from(self.polling.batch_size.max(1));
                    let (drained, advanced) = self.forward_batch(batch).await;
                    if full && drained && advanced > 0 {
                        Duration::ZERO
                    } else {
                        self.polling.interval
                    }
                }
                Err(e) if e.is_unrecoverable() => {
                    tracing::error!(project_id = %self.project_id, "Stopping streaming session: {}", e);
                    self.record_error(e.to_string()).await;
                    break;
                }
                Err(e) => {
                    tracing::warn!(project_id = %self.project_id, "Polling KoboToolbox failed: {}", e);
                    self.record_error(e.to_string()).await;
                    self.polling.interval.min(MAX_ERROR_BACKOFF)
                }
            };

            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = tokio::time::sleep(wait) => {}
            }
        }

        let mut status = self.status.write().await;
        status.state = SessionState::Idle;
    }

    /// Returns whether the whole batch was walked and how many records moved the checkpoint.
    async fn forward_batch(&mut self, batch: Vec<JsonValue>) -> (bool, usize) {
        let mut advanced = 0;
        for submission in batch {
            if self.cancel.is_cancelled() {
                return (false, advanced);
            }
            let Some(id) = submission_id(&submission) else {
                tracing::warn!(project_id = %self.project_id, "Skipping submission without a numeric _id");
                continue;
            };
            if self.after.is_some_and(|after| id <= after) {
                continue;
            }

            let payload = normalize_submission(submission, Utc::now());
            match self.forward_one(&payload).await {
                Ok(status) => {
                    self.advance(id, status == DeliveryStatus::Success).await;
                    advanced += 1;
                }
                Err(Error::ConfigMissing(msg)) => {
                    self.record_error(msg).await;
                    self.advance(id, false).await;
                    advanced += 1;
                }
                Err(Error::Cancelled(msg)) => {
                    tracing::info!(submission_id = id, "Stopped before submission was delivered: {}", msg);
                    return (false, advanced);
                }
                Err(e) => {
                    tracing::error!(submission_id = id, "Could not forward submission: {}", e);
                    self.record_error(e.to_string()).await;
                    return (false, advanced);
                }
            }
        }
        (true, advanced)
    }

    async fn forward_one(&self, payload: &JsonValue) -> Result<DeliveryStatus> {
        let record = self
            .pipeline
            .store()
            .append(NewDeliveryRecord::for_payload(SourceKind::StreamPoll, payload))
            .await?;
        let outcome = self
            .pipeline
            .deliver_until(payload, record.id, &self.cancel)
            .await?;
        Ok(outcome.status)
    }

    async fn advance(&mut self, id: u64, delivered: bool) {
        self.after = Some(id);
        let checkpoint = Checkpoint {
            last_submission_id: id,
            updated_at: Utc::now(),
        };
        let saved = self.checkpoints.save(&self.project_id, checkpoint).await;

        let mut status = self.status.write().await;
        status.checkpoint = Some(checkpoint);
        if delivered {
            status.forwarded += 1;
        }
        if let Err(e) = saved {
            tracing::error!(project_id = %self.project_id, "Failed to persist checkpoint: {}", e);
            status.last_error = Some(format!("checkpoint not persisted: {}", e));
        }
    }

    async fn record_error(&self, message: String) {
        self.status.write().await.last_error = Some(message);
    }
}
