//! Resumable chunked upload session rows.

use crate::models::UploadSession;
use async_trait::async_trait;
use reeldub_core::{RdError, RdResult};
use sqlx::{Row, SqlitePool};

#[async_trait]
pub trait UploadStore: Send + Sync {
    async fn create(&self, session: &UploadSession) -> RdResult<()>;
    async fn get(&self, upload_id: &str) -> RdResult<Option<UploadSession>>;
    async fn record_chunk(&self, upload_id: &str, index: i64, bytes_in_chunk: i64) -> RdResult<UploadSession>;
    async fn finalize(&self, upload_id: &str, video_path: &str) -> RdResult<()>;
    async fn delete(&self, upload_id: &str) -> RdResult<()>;
    async fn list_expired(&self, now: chrono::DateTime<chrono::Utc>) -> RdResult<Vec<UploadSession>>;
}

pub struct SqliteUploadStore {
    pool: SqlitePool,
}

impl SqliteUploadStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

fn persist_err(e: sqlx::Error) -> RdError {
    RdError::persist_failed("upload store query failed").with_source(e.into())
}

fn row_to_session(row: &sqlx::sqlite::SqliteRow) -> anyhow::Result<UploadSession> {
    let chunks: String = row.try_get("chunks_received")?;
    Ok(UploadSession {
        upload_id: row.try_get("upload_id")?,
        owner_id: row.try_get("owner_id")?,
        filename: row.try_get("filename")?,
        total_bytes: row.try_get("total_bytes")?,
        chunk_bytes: row.try_get("chunk_bytes")?,
        received_bytes: row.try_get("received_bytes")?,
        sha256_partial: row.try_get("sha256_partial")?,
        chunks_received: serde_json::from_str(&chunks).unwrap_or_default(),
        finalized: row.try_get::<i64, _>("finalized")? != 0,
        video_path: row.try_get("video_path")?,
        created_at: row.try_get("created_at")?,
        expires_at: row.try_get("expires_at")?,
    })
}

#[async_trait]
impl UploadStore for SqliteUploadStore {
    async fn create(&self, session: &UploadSession) -> RdResult<()> {
        sqlx::query(
            "INSERT INTO upload_sessions (upload_id, owner_id, filename, total_bytes, chunk_bytes, \
             received_bytes, sha256_partial, chunks_received, finalized, video_path, created_at, expires_at) \
             VALUES (?,?,?,?,?,?,?,?,?,?,?,?)",
        )
        .bind(&session.upload_id)
        .bind(&session.owner_id)
        .bind(&session.filename)
        .bind(session.total_bytes)
        .bind(session.chunk_bytes)
        .bind(session.received_bytes)
        .bind(&session.sha256_partial)
        .bind(serde_json::to_string(&session.chunks_received).unwrap_or_default())
        .bind(session.finalized)
        .bind(&session.video_path)
        .bind(session.created_at)
        .bind(session.expires_at)
        .execute(&self.pool)
        .await
        .map_err(persist_err)?;
        Ok(())
    }

    async fn get(&self, upload_id: &str) -> RdResult<Option<UploadSession>> {
        let row = sqlx::query("SELECT * FROM upload_sessions WHERE upload_id = ?")
            .bind(upload_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(persist_err)?;
        row.as_ref()
            .map(row_to_session)
            .transpose()
            .map_err(|e| RdError::internal("corrupt upload session row").with_source(e).into())
    }

    /// Idempotent: re-posting an already-received chunk index is a no-op
    /// that returns the current session rather than double-counting bytes.
    async fn record_chunk(&self, upload_id: &str, index: i64, bytes_in_chunk: i64) -> RdResult<UploadSession> {
        let mut tx = self.pool.begin().await.map_err(persist_err)?;
        let row = sqlx::query("SELECT * FROM upload_sessions WHERE upload_id = ?")
            .bind(upload_id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(persist_err)?
            .ok_or_else(|| RdError::not_found("upload session not found"))?;
        let mut session =
            row_to_session(&row).map_err(|e| RdError::internal("corrupt upload session row").with_source(e))?;

        if session.chunks_received.contains(&index) {
            return Ok(session);
        }
        session.chunks_received.push(index);
        session.received_bytes += bytes_in_chunk;

        sqlx::query("UPDATE upload_sessions SET chunks_received = ?, received_bytes = ? WHERE upload_id = ?")
            .bind(serde_json::to_string(&session.chunks_received).unwrap_or_default())
            .bind(session.received_bytes)
            .bind(upload_id)
            .execute(&mut *tx)
            .await
            .map_err(persist_err)?;
        tx.commit().await.map_err(persist_err)?;
        Ok(session)
    }

    async fn finalize(&self, upload_id: &str, video_path: &str) -> RdResult<()> {
        sqlx::query("UPDATE upload_sessions SET finalized = 1, video_path = ? WHERE upload_id = ?")
            .bind(video_path)
            .bind(upload_id)
            .execute(&self.pool)
            .await
            .map_err(persist_err)?;
        Ok(())
    }

    async fn delete(&self, upload_id: &str) -> RdResult<()> {
        sqlx::query("DELETE FROM upload_sessions WHERE upload_id = ?")
            .bind(upload_id)
            .execute(&self.pool)
            .await
            .map_err(persist_err)?;
        Ok(())
    }

    async fn list_expired(&self, now: chrono::DateTime<chrono::Utc>) -> RdResult<Vec<UploadSession>> {
        let rows = sqlx::query("SELECT * FROM upload_sessions WHERE expires_at < ? AND finalized = 0")
            .bind(now)
            .fetch_all(&self.pool)
            .await
            .map_err(persist_err)?;
        rows.iter()
            .map(|r| row_to_session(r).map_err(|e| RdError::internal("corrupt upload session row").with_source(e).into()))
            .collect()
    }
}
