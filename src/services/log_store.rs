use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use sqlx::{postgres::PgRow, PgPool, Row};
use std::collections::BTreeMap;
use tokio::sync::RwLock;

use crate::error::{Error, Result};
use crate::models::delivery_record::{DeliveryRecord, DeliveryStatus, NewDeliveryRecord};
use crate::models::stats::{StatsCounters, StatsSnapshot};
use crate::utils::time::start_of_day;

pub const DEFAULT_RECENT_LIMIT: usize = 10;
pub const MAX_RECENT_LIMIT: usize = 100;

pub fn clamp_limit(limit: Option<usize>) -> usize {
    limit.unwrap_or(DEFAULT_RECENT_LIMIT).clamp(1, MAX_RECENT_LIMIT)
}

#[async_trait]
pub trait DeliveryLogStore: Send + Sync {
    async fn append(&self, new: NewDeliveryRecord) -> Result<DeliveryRecord>;

    /// Upserts by id; status must only move forward and terminal records are frozen.
    async fn update(&self, record: &DeliveryRecord) -> Result<()>;

    async fn get(&self, id: u64) -> Result<Option<DeliveryRecord>>;

    /// Newest first; `before_id` continues a previous page.
    async fn recent(&self, limit: usize, before_id: Option<u64>) -> Result<Vec<DeliveryRecord>>;

    async fn stats(&self, now: DateTime<Utc>) -> Result<StatsSnapshot>;

    async fn recent_errors(&self, since: DateTime<Utc>) -> Result<u64>;

    async fn ping(&self) -> Result<()>;

    fn backend(&self) -> &'static str;
}

fn check_transition(current: &DeliveryRecord, next: &DeliveryRecord) -> Result<()> {
    if current.status.is_terminal() {
        return Err(Error::Validation(format!(
            "delivery record {} is already {}",
            current.id,
            current.status.as_str()
        )));
    }
    if current.status != next.status && !current.status.can_advance_to(next.status) {
        return Err(Error::Validation(format!(
            "delivery record {} cannot move from {} to {}",
            current.id,
            current.status.as_str(),
            next.status.as_str()
        )));
    }
    Ok(())
}

#[derive(Default)]
struct MemoryLog {
    next_id: u64,
    records: BTreeMap<u64, DeliveryRecord>,
}

/// Process-local store used when no database is configured and in tests.
#[derive(Default)]
pub struct InMemoryLogStore {
    inner: RwLock<MemoryLog>,
}

impl InMemoryLogStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DeliveryLogStore for InMemoryLogStore {
    async fn append(&self, new: NewDeliveryRecord) -> Result<DeliveryRecord> {
        let mut guard = self.inner.write().await;
        guard.next_id += 1;
        let record = new.into_record(guard.next_id, Utc::now());
        guard.records.insert(record.id, record.clone());
        Ok(record)
    }

    async fn update(&self, record: &DeliveryRecord) -> Result<()> {
        let mut guard = self.inner.write().await;
        match guard.records.get(&record.id) {
            Some(current) => check_transition(current, record)?,
            None if record.id == 0 || record.id > guard.next_id => {
                return Err(Error::NotFound(format!("delivery record {}", record.id)))
            }
            None => {}
        }
        guard.records.insert(record.id, record.clone());
        Ok(())
    }

    async fn get(&self, id: u64) -> Result<Option<DeliveryRecord>> {
        Ok(self.inner.read().await.records.get(&id).cloned())
    }

    async fn recent(&self, limit: usize, before_id: Option<u64>) -> Result<Vec<DeliveryRecord>> {
        let guard = self.inner.read().await;
        let upper = before_id.unwrap_or(u64::MAX);
        Ok(guard
            .records
            .range(..upper)
            .rev()
            .take(limit)
            .map(|(_, r)| r.clone())
            .collect())
    }

    async fn stats(&self, now: DateTime<Utc>) -> Result<StatsSnapshot> {
        let guard = self.inner.read().await;
        let day_start = start_of_day(now);
        let mut counters = StatsCounters::default();
        for record in guard.records.values() {
            counters.observe(record, day_start);
        }
        Ok(counters.snapshot(now))
    }

    async fn recent_errors(&self, since: DateTime<Utc>) -> Result<u64> {
        let guard = self.inner.read().await;
        Ok(guard
            .records
            .values()
            .filter(|r| r.status == DeliveryStatus::Failed && r.received_at >= since)
            .count() as u64)
    }

    async fn ping(&self) -> Result<()> {
        Ok(())
    }

    fn backend(&self) -> &'static str {
        "memory"
    }
}

#[derive(Clone)]
pub struct PgLogStore {
    pool: PgPool,
}

impl PgLogStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

const RECORD_COLUMNS: &str = r#"id, source, received_at, payload_size, retry_count, status,
    processing_time_ms, error_message, kobo_form_id, submission_uuid, source_ip, user_agent,
    payload_preview"#;

fn record_from_row(row: &PgRow) -> Result<DeliveryRecord> {
    let source: String = row.try_get("source")?;
    let status: String = row.try_get("status")?;
    Ok(DeliveryRecord {
        id: row.try_get::<i64, _>("id")? as u64,
        source: source.parse().map_err(Error::Internal)?,
        received_at: row.try_get("received_at")?,
        payload_size: row.try_get::<i64, _>("payload_size")? as u64,
        retry_count: row.try_get::<i32, _>("retry_count")? as u32,
        status: status.parse().map_err(Error::Internal)?,
        processing_time_ms: row.try_get("processing_time_ms")?,
        error_message: row.try_get("error_message")?,
        kobo_form_id: row.try_get("kobo_form_id")?,
        submission_uuid: row.try_get("submission_uuid")?,
        source_ip: row.try_get("source_ip")?,
        user_agent: row.try_get("user_agent")?,
        payload_preview: row.try_get::<Option<JsonValue>, _>("payload_preview")?,
    })
}

#[async_trait]
impl DeliveryLogStore for PgLogStore {
    async fn append(&self, new: NewDeliveryRecord) -> Result<DeliveryRecord> {
        let draft = new.into_record(0, Utc::now());
        let sql = format!(
            r#"
            INSERT INTO delivery_records
                (source, received_at, payload_size, retry_count, status, kobo_form_id,
                 submission_uuid, source_ip, user_agent, payload_preview)
            VALUES ($1, $2, $3, 0, 'pending', $4, $5, $6, $7, $8)
            RETURNING {}
            "#,
            RECORD_COLUMNS
        );
        let row = sqlx::query(&sql)
            .bind(draft.source.as_str())
            .bind(draft.received_at)
            .bind(draft.payload_size as i64)
            .bind(&draft.kobo_form_id)
            .bind(&draft.submission_uuid)
            .bind(&draft.source_ip)
            .bind(&draft.user_agent)
            .bind(&draft.payload_preview)
            .fetch_one(&self.pool)
            .await?;
        record_from_row(&row)
    }

    async fn update(&self, record: &DeliveryRecord) -> Result<()> {
        // Single statement so concurrent writers cannot interleave a regression.
        let result = sqlx::query(
            r#"
            UPDATE delivery_records
            SET status = $2, retry_count = $3, processing_time_ms = $4, error_message = $5,
                updated_at = NOW()
            WHERE id = $1
              AND status IN ('pending', 'retrying')
              AND NOT (status = 'retrying' AND $2 = 'pending')
            "#,
        )
        .bind(record.id as i64)
        .bind(record.status.as_str())
        .bind(record.retry_count as i32)
        .bind(record.processing_time_ms)
        .bind(&record.error_message)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return match self.get(record.id).await? {
                Some(current) => {
                    check_transition(&current, record)?;
                    Err(Error::Internal(format!(
                        "delivery record {} was not updated",
                        record.id
                    )))
                }
                None => Err(Error::NotFound(format!("delivery record {}", record.id))),
            };
        }
        Ok(())
    }

    async fn get(&self, id: u64) -> Result<Option<DeliveryRecord>> {
        let sql = format!("SELECT {} FROM delivery_records WHERE id = $1", RECORD_COLUMNS);
        let row = sqlx::query(&sql)
            .bind(id as i64)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(record_from_row).transpose()
    }

    async fn recent(&self, limit: usize, before_id: Option<u64>) -> Result<Vec<DeliveryRecord>> {
        let sql = format!(
            "SELECT {} FROM delivery_records WHERE ($1::BIGINT IS NULL OR id < $1) ORDER BY id DESC LIMIT $2",
            RECORD_COLUMNS
        );
        let rows = sqlx::query(&sql)
            .bind(before_id.map(|id| id as i64))
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(record_from_row).collect()
    }

    async fn stats(&self, now: DateTime<Utc>) -> Result<StatsSnapshot> {
        let row = sqlx::query(
            r#"
            SELECT
                COUNT(*) AS total,
                COUNT(*) FILTER (WHERE status = 'success') AS success,
                COUNT(*) FILTER (WHERE status = 'failed') AS failed,
                COUNT(*) FILTER (WHERE received_at >= $1) AS today_total,
                COUNT(*) FILTER (WHERE received_at >= $1 AND status = 'success') AS today_success,
                COALESCE(SUM(processing_time_ms) FILTER (
                    WHERE status IN ('success', 'failed') AND processing_time_ms IS NOT NULL), 0
                )::DOUBLE PRECISION AS time_sum,
                COUNT(*) FILTER (
                    WHERE status IN ('success', 'failed') AND processing_time_ms IS NOT NULL
                ) AS timed
            FROM delivery_records
            "#,
        )
        .bind(start_of_day(now))
        .fetch_one(&self.pool)
        .await?;

        let counters = StatsCounters {
            total: row.try_get::<i64, _>("total")? as u64,
            success: row.try_get::<i64, _>("success")? as u64,
            failed: row.try_get::<i64, _>("failed")? as u64,
            today_total: row.try_get::<i64, _>("today_total")? as u64,
            today_success: row.try_get::<i64, _>("today_success")? as u64,
            completed_time_sum_ms: row.try_get("time_sum")?,
            completed_with_time: row.try_get::<i64, _>("timed")? as u64,
        };
        Ok(counters.snapshot(now))
    }

    async fn recent_errors(&self, since: DateTime<Utc>) -> Result<u64> {
        let row = sqlx::query(
            "SELECT COUNT(*) AS n FROM delivery_records WHERE status = 'failed' AND received_at >= $1",
        )
        .bind(since)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.try_get::<i64, _>("n")? as u64)
    }

    async fn ping(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    fn backend(&self) -> &'static str {
        "postgres"
    }
}
