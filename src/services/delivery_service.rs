use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{json, Value as JsonValue};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::config::BackoffStrategy;
use crate::error::{Error, Result};
use crate::models::delivery_record::{DeliveryRecord, DeliveryStatus, NewDeliveryRecord, SourceKind};
use crate::models::settings::OutboundConfig;
use crate::models::stats::{TransmissionMetrics, TransmissionSummary};
use crate::services::config_service::ConfigStore;
use crate::services::eventstream_client::EventSink;
use crate::services::log_store::DeliveryLogStore;
use crate::utils::clock::Sleeper;

pub const BREAKER_FAILURE_THRESHOLD: u32 = 5;
pub const BREAKER_RECOVERY: Duration = Duration::from_secs(60);
pub const MAX_BACKOFF: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Default)]
struct BreakerInner {
    failure_count: u32,
    open_until: Option<Instant>,
    half_open: bool,
}

/// Opens after `threshold` consecutive failures; lets one trial attempt through after `recovery`.
#[derive(Debug)]
pub struct CircuitBreaker {
    threshold: u32,
    recovery: Duration,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    pub fn new(threshold: u32, recovery: Duration) -> Self {
        Self {
            threshold: threshold.max(1),
            recovery,
            inner: Mutex::new(BreakerInner::default()),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BreakerInner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn try_acquire(&self) -> bool {
        let mut inner = self.lock();
        if let Some(until) = inner.open_until {
            if Instant::now() < until {
                return false;
            }
            inner.open_until = None;
            inner.half_open = true;
            tracing::info!("Outbound circuit breaker half-open, allowing a trial attempt");
        }
        true
    }

    pub fn record_success(&self) {
        let mut inner = self.lock();
        if inner.half_open || inner.failure_count > 0 {
            tracing::info!("Outbound circuit breaker closed");
        }
        *inner = BreakerInner::default();
    }

    pub fn record_failure(&self) {
        let mut inner = self.lock();
        inner.failure_count += 1;
        if inner.half_open || inner.failure_count >= self.threshold {
            inner.open_until = Some(Instant::now() + self.recovery);
            inner.half_open = false;
            tracing::warn!(
                failures = inner.failure_count,
                "Outbound circuit breaker opened for {:?}",
                self.recovery
            );
        }
    }

    pub fn state(&self) -> BreakerState {
        let inner = self.lock();
        match inner.open_until {
            Some(until) if Instant::now() < until => BreakerState::Open,
            Some(_) => BreakerState::HalfOpen,
            None if inner.half_open => BreakerState::HalfOpen,
            None => BreakerState::Closed,
        }
    }

    pub fn failure_count(&self) -> u32 {
        self.lock().failure_count
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStatus {
    Unknown,
    Healthy,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OutboundHealth {
    pub connection_status: ConnectionStatus,
    pub last_success_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub last_error_at: Option<DateTime<Utc>>,
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub breaker_state: BreakerState,
    pub consecutive_failures: u32,
}

impl Default for OutboundHealth {
    fn default() -> Self {
        Self {
            connection_status: ConnectionStatus::Unknown,
            last_success_at: None,
            last_error: None,
            last_error_at: None,
            last_attempt_at: None,
            breaker_state: BreakerState::Closed,
            consecutive_failures: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeliveryOutcome {
    pub record_id: u64,
    pub status: DeliveryStatus,
    pub retry_count: u32,
    pub processing_time_ms: f64,
    pub error: Option<String>,
}

impl DeliveryOutcome {
    fn from_record(record: &DeliveryRecord) -> Self {
        Self {
            record_id: record.id,
            status: record.status,
            retry_count: record.retry_count,
            processing_time_ms: record.processing_time_ms.unwrap_or(0.0),
            error: record.error_message.clone(),
        }
    }
}

/// Delay before retry number `retry` (1-based).
pub fn backoff_delay(strategy: BackoffStrategy, base: Duration, retry: u32) -> Duration {
    match strategy {
        BackoffStrategy::Fixed => base,
        BackoffStrategy::Exponential => {
            let factor = 2u32.saturating_pow(retry.saturating_sub(1));
            base.checked_mul(factor)
                .unwrap_or(MAX_BACKOFF)
                .min(MAX_BACKOFF)
        }
    }
}

fn elapsed_ms(started: Instant) -> f64 {
    (started.elapsed().as_secs_f64() * 1000.0 * 100.0).round() / 100.0
}

pub struct DeliveryPipeline {
    config: Arc<ConfigStore>,
    store: Arc<dyn DeliveryLogStore>,
    sink: Arc<dyn EventSink>,
    sleeper: Arc<dyn Sleeper>,
    backoff: BackoffStrategy,
    breaker: CircuitBreaker,
    health: RwLock<OutboundHealth>,
    transmissions: Mutex<TransmissionMetrics>,
}

impl DeliveryPipeline {
    pub fn new(
        config: Arc<ConfigStore>,
        store: Arc<dyn DeliveryLogStore>,
        sink: Arc<dyn EventSink>,
        sleeper: Arc<dyn Sleeper>,
        backoff: BackoffStrategy,
    ) -> Self {
        Self {
            config,
            store,
            sink,
            sleeper,
            backoff,
            breaker: CircuitBreaker::new(BREAKER_FAILURE_THRESHOLD, BREAKER_RECOVERY),
            health: RwLock::new(OutboundHealth::default()),
            transmissions: Mutex::new(TransmissionMetrics::default()),
        }
    }

    pub fn store(&self) -> &Arc<dyn DeliveryLogStore> {
        &self.store
    }

    /// Drives one record to a terminal status.
    pub async fn deliver(&self, payload: &JsonValue, record_id: u64) -> Result<DeliveryOutcome> {
        self.deliver_until(payload, record_id, &CancellationToken::new())
            .await
    }

    /// Like [`deliver`](Self::deliver), but abandons the record during a retry wait once
    /// `cancel` fires. An attempt already on the wire is always allowed to finish.
    pub async fn deliver_until(
        &self,
        payload: &JsonValue,
        record_id: u64,
        cancel: &CancellationToken,
    ) -> Result<DeliveryOutcome> {
        let mut record = self
            .store
            .get(record_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("delivery record {}", record_id)))?;
        if record.status.is_terminal() {
            return Ok(DeliveryOutcome::from_record(&record));
        }

        let started = Instant::now();
        let Some(outbound) = self.config.outbound().await else {
            let message = "Event stream connection is not configured".to_string();
            record.status = DeliveryStatus::Failed;
            record.error_message = Some(message.clone());
            record.processing_time_ms = Some(elapsed_ms(started));
            self.store.update(&record).await?;
            tracing::error!(record_id, "Delivery failed: {}", message);
            return Err(Error::ConfigMissing(message));
        };

        let mut retry: u32 = 0;
        loop {
            let result = self.attempt(&outbound, payload).await;
            record.processing_time_ms = Some(elapsed_ms(started));

            let err = match result {
                Ok(()) => {
                    record.status = DeliveryStatus::Success;
                    record.retry_count = retry;
                    record.error_message = None;
                    self.store.update(&record).await?;
                    tracing::info!(
                        record_id,
                        retries = retry,
                        "Delivered record in {:.2} ms",
                        record.processing_time_ms.unwrap_or_default()
                    );
                    return Ok(DeliveryOutcome::from_record(&record));
                }
                Err(err) => err,
            };

            tracing::warn!(record_id, attempt = retry + 1, "Delivery attempt failed: {}", err);
            record.error_message = Some(err.to_string());

            if !err.is_retryable() || retry >= outbound.max_retries {
                record.status = DeliveryStatus::Failed;
                self.store.update(&record).await?;
                tracing::error!(
                    record_id,
                    retries = retry,
                    "Delivery failed after {} attempts: {}",
                    retry + 1,
                    err
                );
                return Ok(DeliveryOutcome::from_record(&record));
            }

            retry += 1;
            record.retry_count = retry;
            record.status = DeliveryStatus::Retrying;
            self.store.update(&record).await?;
            let delay = backoff_delay(self.backoff, outbound.retry_delay(), retry);
            tokio::select! {
                _ = self.sleeper.sleep(delay) => {}
                _ = cancel.cancelled() => {
                    let message = "delivery cancelled during shutdown".to_string();
                    record.status = DeliveryStatus::Failed;
                    record.error_message = Some(message.clone());
                    record.processing_time_ms = Some(elapsed_ms(started));
                    self.store.update(&record).await?;
                    tracing::warn!(record_id, retries = retry, "Abandoned retry wait: {}", message);
                    return Err(Error::Cancelled(message));
                }
            }
        }
    }

    async fn attempt(&self, outbound: &OutboundConfig, payload: &JsonValue) -> Result<()> {
        if !self.breaker.try_acquire() {
            return Err(Error::Transport(
                "circuit breaker open, endpoint marked unavailable".to_string(),
            ));
        }

        self.mark_attempt();
        let sent_at = Instant::now();
        let result = match tokio::time::timeout(
            outbound.attempt_timeout(),
            self.sink.send(&outbound.endpoint, payload),
        )
        .await
        {
            Ok(sent) => sent.map_err(Error::from),
            Err(_) => Err(Error::Transport(format!(
                "attempt timed out after {}s",
                outbound.attempt_timeout().as_secs()
            ))),
        };
        self.record_transmission(elapsed_ms(sent_at), result.as_ref().err());

        match &result {
            Ok(()) => {
                self.breaker.record_success();
                self.mark_success();
            }
            Err(err) => {
                self.breaker.record_failure();
                self.mark_error(err.to_string());
            }
        }
        result
    }

    /// Sends one synthetic submission through the full pipeline and records it.
    pub async fn send_test_event(&self) -> Result<DeliveryOutcome> {
        if self.config.outbound().await.is_none() {
            return Err(Error::ConfigMissing(
                "Event stream connection is not configured".to_string(),
            ));
        }
        let now = Utc::now();
        let payload = json!({
            "_id": format!("test-{}", uuid::Uuid::new_v4()),
            "_submission_time": now.to_rfc3339(),
            "_submitted_by": "kobo-relay",
            "_source": "connection_test",
            "message": "Test event from kobo-relay",
        });
        let new = NewDeliveryRecord::for_payload(SourceKind::Webhook, &payload)
            .with_client(None, Some("kobo-relay/test-eventstream".to_string()));
        let record = self.store.append(new).await?;
        self.deliver(&payload, record.id).await
    }

    pub fn outbound_health(&self) -> OutboundHealth {
        let mut health = self
            .health
            .read()
            .map(|g| g.clone())
            .unwrap_or_else(|poisoned| poisoned.into_inner().clone());
        health.breaker_state = self.breaker.state();
        health.consecutive_failures = self.breaker.failure_count();
        health
    }

    /// Today's per-attempt counters; circuit-breaker fast fails are not counted.
    pub fn transmission_summary(&self, now: DateTime<Utc>) -> TransmissionSummary {
        self.transmissions
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .summary(now)
    }

    fn record_transmission(&self, elapsed_ms: f64, error: Option<&Error>) {
        self.transmissions
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .record(Utc::now(), elapsed_ms, error.map(|e| e.to_string()));
    }

    fn update_health(&self, apply: impl FnOnce(&mut OutboundHealth)) {
        match self.health.write() {
            Ok(mut guard) => apply(&mut *guard),
            Err(poisoned) => apply(&mut *poisoned.into_inner()),
        }
    }

    fn mark_attempt(&self) {
        self.update_health(|h| h.last_attempt_at = Some(Utc::now()));
    }

    fn mark_success(&self) {
        self.update_health(|h| {
            h.connection_status = ConnectionStatus::Healthy;
            h.last_success_at = Some(Utc::now());
        });
    }

    fn mark_error(&self, message: String) {
        self.update_health(|h| {
            h.connection_status = ConnectionStatus::Error;
            h.last_error = Some(message);
            h.last_error_at = Some(Utc::now());
        });
    }
}
