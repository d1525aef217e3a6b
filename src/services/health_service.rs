use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;

use crate::models::streaming_session::{SessionState, SessionStatus};
use crate::services::config_service::ConfigStore;
use crate::services::delivery_service::{
    BreakerState, ConnectionStatus, DeliveryPipeline, OutboundHealth,
};
use crate::services::log_store::DeliveryLogStore;
use crate::services::streaming_service::StreamingSessionManager;

pub const DEGRADED_ERROR_THRESHOLD: u64 = 10;
pub const ERROR_WINDOW_HOURS: i64 = 24;

/// Failed records received at or after this instant count towards `recent_errors`.
pub fn error_window_start(now: DateTime<Utc>) -> DateTime<Utc> {
    now - chrono::Duration::hours(ERROR_WINDOW_HOURS)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OverallStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

#[derive(Debug, Clone, Serialize)]
pub struct StorageHealth {
    pub backend: &'static str,
    pub reachable: bool,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct EventStreamHealth {
    pub configured: bool,
    #[serde(flatten)]
    pub outbound: OutboundHealth,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub status: OverallStatus,
    pub timestamp: DateTime<Utc>,
    pub recent_errors: u64,
    pub storage: StorageHealth,
    pub eventstream: EventStreamHealth,
    pub streaming: SessionStatus,
}

pub struct HealthService {
    store: Arc<dyn DeliveryLogStore>,
    config: Arc<ConfigStore>,
    pipeline: Arc<DeliveryPipeline>,
    streaming: Arc<StreamingSessionManager>,
}

impl HealthService {
    pub fn new(
        store: Arc<dyn DeliveryLogStore>,
        config: Arc<ConfigStore>,
        pipeline: Arc<DeliveryPipeline>,
        streaming: Arc<StreamingSessionManager>,
    ) -> Self {
        Self {
            store,
            config,
            pipeline,
            streaming,
        }
    }

    pub async fn check(&self) -> HealthReport {
        let now = Utc::now();

        let storage = match self.store.ping().await {
            Ok(()) => StorageHealth {
                backend: self.store.backend(),
                reachable: true,
                error: None,
            },
            Err(e) => {
                tracing::error!("Health check could not reach storage: {}", e);
                StorageHealth {
                    backend: self.store.backend(),
                    reachable: false,
                    error: Some(e.to_string()),
                }
            }
        };

        let recent_errors = if storage.reachable {
            self.store
                .recent_errors(error_window_start(now))
                .await
                .unwrap_or_else(|e| {
                    tracing::warn!("Could not count recent errors: {}", e);
                    0
                })
        } else {
            0
        };

        let eventstream = EventStreamHealth {
            configured: self.config.outbound().await.is_some(),
            outbound: self.pipeline.outbound_health(),
        };
        let streaming = self.streaming.status().await;

        HealthReport {
            status: overall_status(&storage, &eventstream, &streaming, recent_errors),
            timestamp: now,
            recent_errors,
            storage,
            eventstream,
            streaming,
        }
    }
}

pub fn overall_status(
    storage: &StorageHealth,
    eventstream: &EventStreamHealth,
    streaming: &SessionStatus,
    recent_errors: u64,
) -> OverallStatus {
    if !storage.reachable {
        return OverallStatus::Unhealthy;
    }
    let outbound_failing = eventstream.outbound.connection_status == ConnectionStatus::Error
        || eventstream.outbound.breaker_state == BreakerState::Open;
    let stream_failing =
        streaming.state == SessionState::Active && streaming.last_error.is_some();
    if recent_errors >= DEGRADED_ERROR_THRESHOLD || outbound_failing || stream_failing {
        OverallStatus::Degraded
    } else {
        OverallStatus::Healthy
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn storage(reachable: bool) -> StorageHealth {
        StorageHealth {
            backend: "memory",
            reachable,
            error: None,
        }
    }

    fn eventstream(status: ConnectionStatus) -> EventStreamHealth {
        EventStreamHealth {
            configured: true,
            outbound: OutboundHealth {
                connection_status: status,
                ..Default::default()
            },
        }
    }

    #[tokio::test]
    async fn failures_from_the_last_day_count_as_recent() {
        use crate::models::delivery_record::{DeliveryStatus, NewDeliveryRecord, SourceKind};
        use crate::services::log_store::InMemoryLogStore;

        let store = InMemoryLogStore::new();
        let now = Utc::now();
        for hours_ago in [2, 23, 25] {
            let mut record = store
                .append(NewDeliveryRecord::for_payload(
                    SourceKind::Webhook,
                    &serde_json::json!({"_id": hours_ago}),
                ))
                .await
                .unwrap();
            record.status = DeliveryStatus::Failed;
            record.received_at = now - chrono::Duration::hours(hours_ago);
            store.update(&record).await.unwrap();
        }

        assert_eq!(store.recent_errors(error_window_start(now)).await.unwrap(), 2);
    }

    #[test]
    fn unreachable_storage_is_unhealthy() {
        let status = overall_status(
            &storage(false),
            &eventstream(ConnectionStatus::Healthy),
            &SessionStatus::idle(),
            0,
        );
        assert_eq!(status, OverallStatus::Unhealthy);
    }

    #[test]
    fn error_threshold_degrades() {
        let es = eventstream(ConnectionStatus::Unknown);
        let idle = SessionStatus::idle();
        assert_eq!(
            overall_status(&storage(true), &es, &idle, DEGRADED_ERROR_THRESHOLD - 1),
            OverallStatus::Healthy
        );
        assert_eq!(
            overall_status(&storage(true), &es, &idle, DEGRADED_ERROR_THRESHOLD),
            OverallStatus::Degraded
        );
    }

    #[test]
    fn failing_outbound_or_stream_degrades() {
        let idle = SessionStatus::idle();
        assert_eq!(
            overall_status(&storage(true), &eventstream(ConnectionStatus::Error), &idle, 0),
            OverallStatus::Degraded
        );

        let mut active = SessionStatus::idle();
        active.state = SessionState::Active;
        active.last_error = Some("HTTP 502".into());
        assert_eq!(
            overall_status(&storage(true), &eventstream(ConnectionStatus::Healthy), &active, 0),
            OverallStatus::Degraded
        );
    }
}
