use async_trait::async_trait;
use sqlx::{PgPool, Row};
use std::collections::BTreeMap;
use std::path::PathBuf;
use tokio::sync::Mutex;

use crate::error::Result;
use crate::models::streaming_session::Checkpoint;

/// Durable per-project position of the polling session.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    async fn load(&self, project_id: &str) -> Result<Option<Checkpoint>>;

    /// Never moves a project's checkpoint backwards.
    async fn save(&self, project_id: &str, checkpoint: Checkpoint) -> Result<()>;
}

/// JSON file keyed by project id, replaced atomically on every save.
pub struct FileCheckpointStore {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl FileCheckpointStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    async fn read_all(&self) -> Result<BTreeMap<String, Checkpoint>> {
        match tokio::fs::read(&self.path).await {
            Ok(bytes) if bytes.is_empty() => Ok(BTreeMap::new()),
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(BTreeMap::new()),
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
impl CheckpointStore for FileCheckpointStore {
    async fn load(&self, project_id: &str) -> Result<Option<Checkpoint>> {
        Ok(self.read_all().await?.get(project_id).copied())
    }

    async fn save(&self, project_id: &str, checkpoint: Checkpoint) -> Result<()> {
        let _guard = self.write_lock.lock().await;

        let mut all = self.read_all().await?;
        if let Some(existing) = all.get(project_id) {
            if existing.last_submission_id > checkpoint.last_submission_id {
                return Ok(());
            }
        }
        all.insert(project_id.to_string(), checkpoint);

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        let tmp = self.path.with_extension("tmp");
        tokio::fs::write(&tmp, serde_json::to_vec_pretty(&all)?).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }
}

#[derive(Clone)]
pub struct PgCheckpointStore {
    pool: PgPool,
}

impl PgCheckpointStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl CheckpointStore for PgCheckpointStore {
    async fn load(&self, project_id: &str) -> Result<Option<Checkpoint>> {
        let row = sqlx::query(
            "SELECT last_submission_id, updated_at FROM stream_checkpoints WHERE project_id = $1",
        )
        .bind(project_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|row| {
            Ok(Checkpoint {
                last_submission_id: row.try_get::<i64, _>("last_submission_id")? as u64,
                updated_at: row.try_get("updated_at")?,
            })
        })
        .transpose()
    }

    async fn save(&self, project_id: &str, checkpoint: Checkpoint) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO stream_checkpoints (project_id, last_submission_id, updated_at)
            VALUES ($1, $2, $3)
            ON CONFLICT (project_id) DO UPDATE
            SET last_submission_id = GREATEST(stream_checkpoints.last_submission_id, EXCLUDED.last_submission_id),
                updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(project_id)
        .bind(checkpoint.last_submission_id as i64)
        .bind(checkpoint.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
