//! Append-only audit trail for policy/quota/admin decisions.

use crate::models::{AuditOutcome, AuditRecord};
use async_trait::async_trait;
use reeldub_core::{RdError, RdResult};
use sqlx::{Row, SqlitePool};

#[async_trait]
pub trait AuditStore: Send + Sync {
    async fn append(&self, record: &AuditRecord) -> RdResult<()>;
    async fn list_for_job(&self, job_id: &str) -> RdResult<Vec<AuditRecord>>;
}

pub struct SqliteAuditStore {
    pool: SqlitePool,
}

impl SqliteAuditStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

fn row_to_audit(row: &sqlx::sqlite::SqliteRow) -> anyhow::Result<AuditRecord> {
    let outcome: String = row.try_get("outcome")?;
    let detail: String = row.try_get("detail")?;
    Ok(AuditRecord {
        id: row.try_get("id")?,
        ts: row.try_get("ts")?,
        actor_user_id: row.try_get("actor_user_id")?,
        action: row.try_get("action")?,
        outcome: match outcome.as_str() {
            "allow" => AuditOutcome::Allow,
            "deny" => AuditOutcome::Deny,
            "degrade" => AuditOutcome::Degrade,
            _ => return Err(anyhow::anyhow!("corrupt outcome column")),
        },
        reason: row.try_get("reason")?,
        job_id: row.try_get("job_id")?,
        detail: serde_json::from_str(&detail).unwrap_or(serde_json::json!({})),
    })
}

#[async_trait]
impl AuditStore for SqliteAuditStore {
    async fn append(&self, record: &AuditRecord) -> RdResult<()> {
        sqlx::query(
            "INSERT INTO audit_records (id, ts, actor_user_id, action, outcome, reason, job_id, detail) \
             VALUES (?,?,?,?,?,?,?,?)",
        )
        .bind(&record.id)
        .bind(record.ts)
        .bind(&record.actor_user_id)
        .bind(&record.action)
        .bind(record.outcome.as_str())
        .bind(&record.reason)
        .bind(&record.job_id)
        .bind(record.detail.to_string())
        .execute(&self.pool)
        .await
        .map_err(|e| RdError::persist_failed("audit append failed").with_source(e.into()))?;
        Ok(())
    }

    async fn list_for_job(&self, job_id: &str) -> RdResult<Vec<AuditRecord>> {
        let rows = sqlx::query("SELECT * FROM audit_records WHERE job_id = ? ORDER BY ts ASC")
            .bind(job_id)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| RdError::persist_failed("audit query failed").with_source(e.into()))?;
        rows.iter()
            .map(|r| row_to_audit(r).map_err(|e| RdError::internal("corrupt audit row").with_source(e).into()))
            .collect()
    }
}
