use async_trait::async_trait;
use sqlx::{PgPool, Row};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};

use crate::dto::config_dto::{EventStreamConfigPayload, KoboCredentialsPayload, WebhookConfigPayload};
use crate::error::{Error, Result};
use crate::models::settings::{
    KoboCredentials, OutboundConfig, RedactedSettings, Settings, WebhookConfig,
};

/// Durable home of the settings record.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SettingsRepository: Send + Sync {
    async fn load(&self) -> Result<Option<(Settings, u64)>>;

    /// Persists `settings` as `version`, failing if the stored version is not `expected`.
    async fn save(&self, settings: &Settings, expected: u64, version: u64) -> Result<()>;
}

#[derive(Default)]
pub struct InMemorySettingsRepository {
    stored: RwLock<Option<(Settings, u64)>>,
}

impl InMemorySettingsRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SettingsRepository for InMemorySettingsRepository {
    async fn load(&self) -> Result<Option<(Settings, u64)>> {
        Ok(self.stored.read().await.clone())
    }

    async fn save(&self, settings: &Settings, expected: u64, version: u64) -> Result<()> {
        let mut guard = self.stored.write().await;
        let current = guard.as_ref().map(|(_, v)| *v).unwrap_or(0);
        if current != expected {
            return Err(Error::Internal(format!(
                "settings version conflict: expected {}, found {}",
                expected, current
            )));
        }
        *guard = Some((settings.clone(), version));
        Ok(())
    }
}

#[derive(Clone)]
pub struct PgSettingsRepository {
    pool: PgPool,
}

impl PgSettingsRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl SettingsRepository for PgSettingsRepository {
    async fn load(&self) -> Result<Option<(Settings, u64)>> {
        let row = sqlx::query(
            "SELECT version, outbound, webhook, kobo FROM app_settings WHERE id = 1",
        )
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else { return Ok(None) };
        let outbound: Option<serde_json::Value> = row.try_get("outbound")?;
        let webhook: serde_json::Value = row.try_get("webhook")?;
        let kobo: Option<serde_json::Value> = row.try_get("kobo")?;
        let settings = Settings {
            outbound: outbound.map(serde_json::from_value).transpose()?,
            webhook: serde_json::from_value(webhook)?,
            kobo: kobo.map(serde_json::from_value).transpose()?,
        };
        Ok(Some((settings, row.try_get::<i64, _>("version")? as u64)))
    }

    async fn save(&self, settings: &Settings, expected: u64, version: u64) -> Result<()> {
        let outbound = settings.outbound.as_ref().map(serde_json::to_value).transpose()?;
        let webhook = serde_json::to_value(&settings.webhook)?;
        let kobo = settings.kobo.as_ref().map(serde_json::to_value).transpose()?;

        let result = sqlx::query(
            r#"
            INSERT INTO app_settings (id, version, outbound, webhook, kobo, updated_at)
            VALUES (1, $1, $2, $3, $4, NOW())
            ON CONFLICT (id) DO UPDATE
            SET version = EXCLUDED.version,
                outbound = EXCLUDED.outbound,
                webhook = EXCLUDED.webhook,
                kobo = EXCLUDED.kobo,
                updated_at = NOW()
            WHERE app_settings.version = $5
            "#,
        )
        .bind(version as i64)
        .bind(outbound)
        .bind(webhook)
        .bind(kobo)
        .bind(expected as i64)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(Error::Internal(format!(
                "settings version conflict: expected {}",
                expected
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
struct Versioned {
    settings: Settings,
    version: u64,
}

/// Current configuration; many readers, one serialized writer.
pub struct ConfigStore {
    current: RwLock<Versioned>,
    writer: Mutex<()>,
    repo: Arc<dyn SettingsRepository>,
}

impl ConfigStore {
    /// Uses the persisted record when there is one, otherwise `defaults` at version 0.
    pub async fn load(repo: Arc<dyn SettingsRepository>, defaults: Settings) -> Result<Self> {
        let current = match repo.load().await? {
            Some((settings, version)) => {
                tracing::info!("Loaded settings version {}", version);
                Versioned { settings, version }
            }
            None => Versioned {
                settings: defaults,
                version: 0,
            },
        };
        Ok(Self {
            current: RwLock::new(current),
            writer: Mutex::new(()),
            repo,
        })
    }

    pub async fn get(&self) -> RedactedSettings {
        let guard = self.current.read().await;
        guard.settings.redacted(guard.version)
    }

    pub async fn get_unmasked(&self) -> (Settings, u64) {
        let guard = self.current.read().await;
        (guard.settings.clone(), guard.version)
    }

    pub async fn outbound(&self) -> Option<OutboundConfig> {
        self.current.read().await.settings.outbound.clone()
    }

    pub async fn webhook(&self) -> WebhookConfig {
        self.current.read().await.settings.webhook.clone()
    }

    pub async fn kobo(&self) -> Option<KoboCredentials> {
        self.current.read().await.settings.kobo.clone()
    }

    pub async fn set_outbound(&self, payload: EventStreamConfigPayload) -> Result<RedactedSettings> {
        let outbound = payload.into_outbound()?;
        tracing::info!(
            namespace = %outbound.endpoint.namespace,
            entity_path = %outbound.endpoint.entity_path,
            "Updating event stream configuration"
        );
        self.replace(|settings| {
            settings.outbound = Some(outbound);
            Ok(())
        })
        .await
    }

    pub async fn set_webhook(&self, payload: WebhookConfigPayload) -> Result<RedactedSettings> {
        self.replace(|settings| {
            settings.webhook = payload.into_webhook(&settings.webhook)?;
            Ok(())
        })
        .await
    }

    pub async fn set_kobo(&self, payload: KoboCredentialsPayload) -> Result<RedactedSettings> {
        let credentials = payload.into_credentials()?;
        tracing::info!("Updating KoboToolbox credentials for {}", credentials.server_url);
        self.replace(|settings| {
            settings.kobo = Some(credentials);
            Ok(())
        })
        .await
    }

    async fn replace<F>(&self, apply: F) -> Result<RedactedSettings>
    where
        F: FnOnce(&mut Settings) -> Result<()>,
    {
        let _writer = self.writer.lock().await;

        let base = self.current.read().await.clone();
        let mut next = base.settings.clone();
        apply(&mut next)?;
        let version = base.version + 1;

        self.repo.save(&next, base.version, version).await?;

        let mut guard = self.current.write().await;
        if guard.version != base.version {
            return Err(Error::Internal(format!(
                "settings changed underneath writer (version {} != {})",
                guard.version, base.version
            )));
        }
        *guard = Versioned {
            settings: next,
            version,
        };
        Ok(guard.settings.redacted(version))
    }
}
