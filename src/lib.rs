pub mod config;
pub mod database;
pub mod dto;
pub mod error;
pub mod middleware;
pub mod models;
pub mod routes;
pub mod services;
pub mod utils;

use axum::{
    extract::DefaultBodyLimit,
    routing::{get, post},
    Router,
};
use sqlx::PgPool;
use std::sync::Arc;
use tower_http::trace::TraceLayer;

use crate::config::Config;
use crate::error::Result;
use crate::models::settings::{Settings, WebhookConfig};
use crate::services::{
    checkpoint_store::{CheckpointStore, FileCheckpointStore, PgCheckpointStore},
    config_service::{
        ConfigStore, InMemorySettingsRepository, PgSettingsRepository, SettingsRepository,
    },
    delivery_service::DeliveryPipeline,
    eventstream_client::EventSink,
    health_service::HealthService,
    kobo_service::SubmissionSource,
    log_store::{DeliveryLogStore, InMemoryLogStore, PgLogStore},
    streaming_service::{PollingSettings, StreamingSessionManager},
    webhook_service::WebhookReceiver,
};
use crate::utils::clock::{Sleeper, TokioSleeper};

/// Largest body axum will buffer; the configured webhook limit is enforced after that.
pub const MAX_CONFIGURABLE_PAYLOAD: usize = 100 * 1024 * 1024;

/// Storage and network edges of the service, swapped wholesale in tests.
pub struct Adapters {
    pub log_store: Arc<dyn DeliveryLogStore>,
    pub settings_repo: Arc<dyn SettingsRepository>,
    pub checkpoints: Arc<dyn CheckpointStore>,
    pub sink: Arc<dyn EventSink>,
    pub source: Arc<dyn SubmissionSource>,
    pub sleeper: Arc<dyn Sleeper>,
}

impl Adapters {
    pub fn in_memory(
        config: &Config,
        sink: Arc<dyn EventSink>,
        source: Arc<dyn SubmissionSource>,
    ) -> Self {
        Self {
            log_store: Arc::new(InMemoryLogStore::new()),
            settings_repo: Arc::new(InMemorySettingsRepository::new()),
            checkpoints: Arc::new(FileCheckpointStore::new(config.checkpoint_path.clone())),
            sink,
            source,
            sleeper: Arc::new(TokioSleeper),
        }
    }

    pub fn postgres(
        pool: PgPool,
        sink: Arc<dyn EventSink>,
        source: Arc<dyn SubmissionSource>,
    ) -> Self {
        Self {
            log_store: Arc::new(PgLogStore::new(pool.clone())),
            settings_repo: Arc::new(PgSettingsRepository::new(pool.clone())),
            checkpoints: Arc::new(PgCheckpointStore::new(pool)),
            sink,
            source,
            sleeper: Arc::new(TokioSleeper),
        }
    }
}

/// Settings used until an operator saves their own.
pub fn default_settings(config: &Config) -> Settings {
    Settings {
        outbound: None,
        webhook: WebhookConfig {
            verify_signature: config.webhook_verify_signature,
            kobo_secret: config.kobo_webhook_secret.clone(),
            max_payload_size: config.max_payload_size,
        },
        kobo: None,
    }
}

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub settings: Arc<ConfigStore>,
    pub store: Arc<dyn DeliveryLogStore>,
    pub pipeline: Arc<DeliveryPipeline>,
    pub receiver: Arc<WebhookReceiver>,
    pub streaming: Arc<StreamingSessionManager>,
    pub health: Arc<HealthService>,
}

impl AppState {
    pub async fn new(config: Config, adapters: Adapters) -> Result<Self> {
        let settings =
            Arc::new(ConfigStore::load(adapters.settings_repo, default_settings(&config)).await?);

        let pipeline = Arc::new(DeliveryPipeline::new(
            settings.clone(),
            adapters.log_store.clone(),
            adapters.sink,
            adapters.sleeper,
            config.retry_backoff,
        ));
        let receiver = Arc::new(WebhookReceiver::new(settings.clone(), pipeline.clone()));
        let streaming = Arc::new(StreamingSessionManager::new(
            settings.clone(),
            adapters.source,
            pipeline.clone(),
            adapters.checkpoints,
            PollingSettings {
                interval: config.kobo_polling_interval,
                batch_size: config.kobo_batch_size,
            },
        ));
        let health = Arc::new(HealthService::new(
            adapters.log_store.clone(),
            settings.clone(),
            pipeline.clone(),
            streaming.clone(),
        ));

        Ok(Self {
            config: Arc::new(config),
            settings,
            store: adapters.log_store,
            pipeline,
            receiver,
            streaming,
            health,
        })
    }
}

pub fn build_router(state: AppState) -> Router {
    let webhook_api = Router::new()
        .route("/kobo-webhook", post(routes::webhook::kobo_webhook))
        .layer(axum::middleware::from_fn_with_state(
            middleware::rate_limit::RateLimiter::new(state.config.webhook_rps),
            middleware::rate_limit::rps_middleware,
        ));

    let dashboard_api = Router::new()
        .route(
            "/api/test-eventstream",
            post(routes::eventstream::test_eventstream),
        )
        .route(
            "/api/configuration",
            get(routes::configuration::get_configuration),
        )
        .route(
            "/api/configuration/eventstream",
            post(routes::configuration::set_eventstream),
        )
        .route(
            "/api/configuration/webhook",
            post(routes::configuration::set_webhook),
        )
        .route(
            "/api/configuration/kobo",
            post(routes::configuration::set_kobo),
        )
        .route(
            "/api/kobo/test-connection",
            post(routes::kobo::test_connection),
        )
        .route("/api/kobo/projects", get(routes::kobo::list_projects))
        .route("/api/kobo/start", post(routes::kobo::start_streaming))
        .route("/api/kobo/stop", post(routes::kobo::stop_streaming))
        .route("/api/kobo/status", get(routes::kobo::streaming_status))
        .route("/api/streaming/stop", post(routes::kobo::stop_streaming))
        .route("/api/streaming/status", get(routes::kobo::streaming_status))
        .route("/api/recent-logs", get(routes::logs::recent_logs))
        .route("/api/stats", get(routes::logs::stats))
        .route("/api/latest-data", get(routes::logs::latest_data))
        .route_layer(axum::middleware::from_fn_with_state(
            state.clone(),
            middleware::auth::require_bearer_auth,
        ));

    let body_limit = state.config.max_payload_size.max(MAX_CONFIGURABLE_PAYLOAD) + 1;

    Router::new()
        .route("/health", get(routes::health::health))
        .merge(webhook_api)
        .merge(dashboard_api)
        .with_state(state)
        .layer(middleware::cors::dashboard_cors())
        .layer(TraceLayer::new_for_http())
        .layer(DefaultBodyLimit::max(body_limit))
}
