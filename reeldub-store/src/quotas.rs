//! Per-user quota overrides. Absent fields fall back to the global defaults
//! carried in `RdConfig`; see the policy engine's `resolve_limits_for_user`.

use crate::models::QuotaRecord;
use async_trait::async_trait;
use reeldub_core::{RdError, RdResult};
use sqlx::{Row, SqlitePool};

#[async_trait]
pub trait QuotaStore: Send + Sync {
    async fn get(&self, user_id: &str) -> RdResult<Option<QuotaRecord>>;
    async fn upsert(&self, quota: &QuotaRecord) -> RdResult<()>;
}

pub struct SqliteQuotaStore {
    pool: SqlitePool,
}

impl SqliteQuotaStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

fn persist_err(e: sqlx::Error) -> RdError {
    RdError::persist_failed("quota store query failed").with_source(e.into())
}

fn row_to_quota(row: &sqlx::sqlite::SqliteRow) -> anyhow::Result<QuotaRecord> {
    Ok(QuotaRecord {
        user_id: row.try_get("user_id")?,
        max_upload_bytes: row.try_get("max_upload_bytes")?,
        max_storage_bytes: row.try_get("max_storage_bytes")?,
        jobs_per_day: row.try_get("jobs_per_day")?,
        max_concurrent_jobs: row.try_get("max_concurrent_jobs")?,
        max_queued_jobs: row.try_get("max_queued_jobs")?,
        max_processing_minutes_per_day: row.try_get("max_processing_minutes_per_day")?,
    })
}

#[async_trait]
impl QuotaStore for SqliteQuotaStore {
    async fn get(&self, user_id: &str) -> RdResult<Option<QuotaRecord>> {
        let row = sqlx::query("SELECT * FROM quotas WHERE user_id = ?")
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(persist_err)?;
        row.as_ref()
            .map(row_to_quota)
            .transpose()
            .map_err(|e| RdError::internal("corrupt quota row").with_source(e).into())
    }

    async fn upsert(&self, quota: &QuotaRecord) -> RdResult<()> {
        sqlx::query(
            "INSERT INTO quotas (user_id, max_upload_bytes, max_storage_bytes, jobs_per_day, \
             max_concurrent_jobs, max_queued_jobs, max_processing_minutes_per_day) VALUES (?,?,?,?,?,?,?) \
             ON CONFLICT(user_id) DO UPDATE SET \
             max_upload_bytes = excluded.max_upload_bytes, \
             max_storage_bytes = excluded.max_storage_bytes, \
             jobs_per_day = excluded.jobs_per_day, \
             max_concurrent_jobs = excluded.max_concurrent_jobs, \
             max_queued_jobs = excluded.max_queued_jobs, \
             max_processing_minutes_per_day = excluded.max_processing_minutes_per_day",
        )
        .bind(&quota.user_id)
        .bind(quota.max_upload_bytes)
        .bind(quota.max_storage_bytes)
        .bind(quota.jobs_per_day)
        .bind(quota.max_concurrent_jobs)
        .bind(quota.max_queued_jobs)
        .bind(quota.max_processing_minutes_per_day)
        .execute(&self.pool)
        .await
        .map_err(persist_err)?;
        Ok(())
    }
}
