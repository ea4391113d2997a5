//! Transactional CRUD for [`Job`] rows.

use crate::models::{Job, JobDevice, JobFilter, JobMode, JobOrder, JobPatch, JobState, Visibility};
use anyhow::Context;
use async_trait::async_trait;
use chrono::Utc;
use reeldub_core::{ErrorKind, RdError, RdResult};
use sqlx::{Row, SqlitePool};

#[async_trait]
pub trait JobStore: Send + Sync {
    async fn put(&self, job: &Job) -> RdResult<()>;
    async fn get(&self, id: &str) -> RdResult<Option<Job>>;
    async fn update(&self, id: &str, patch: JobPatch) -> RdResult<Job>;
    async fn list(&self, filter: &JobFilter, order: JobOrder, limit: i64, offset: i64) -> RdResult<Vec<Job>>;
    async fn delete(&self, id: &str) -> RdResult<()>;
    async fn set_storage_bytes(&self, id: &str, bytes: i64) -> RdResult<()>;
    async fn user_storage_bytes(&self, owner_id: &str) -> RdResult<i64>;
    async fn count_jobs_created_since(&self, owner_id: &str, since: chrono::DateTime<Utc>) -> RdResult<i64>;
    async fn count_active(&self, owner_id: &str) -> RdResult<i64>;
    async fn count_queued(&self, owner_id: &str) -> RdResult<i64>;
    async fn count_running_with_mode(&self, mode: JobMode) -> RdResult<i64>;
}

pub struct SqliteJobStore {
    pool: SqlitePool,
}

impl SqliteJobStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

fn persist_err(e: sqlx::Error) -> RdError {
    RdError::persist_failed("job store query failed").with_source(e.into())
}

fn row_to_job(row: &sqlx::sqlite::SqliteRow) -> anyhow::Result<Job> {
    let mode: String = row.try_get("mode")?;
    let device: String = row.try_get("device")?;
    let visibility: String = row.try_get("visibility")?;
    let state: String = row.try_get("state")?;
    let runtime: String = row.try_get("runtime")?;
    Ok(Job {
        id: row.try_get("id")?,
        owner_id: row.try_get("owner_id")?,
        video_path: row.try_get("video_path")?,
        duration_s: row.try_get("duration_s")?,
        mode: JobMode::parse(&mode).context("corrupt mode column")?,
        device: JobDevice::parse(&device).context("corrupt device column")?,
        src_lang: row.try_get("src_lang")?,
        tgt_lang: row.try_get("tgt_lang")?,
        series_title: row.try_get("series_title")?,
        series_slug: row.try_get("series_slug")?,
        season_number: row.try_get("season_number")?,
        episode_number: row.try_get("episode_number")?,
        visibility: Visibility::parse(&visibility).context("corrupt visibility column")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
        state: JobState::parse(&state).context("corrupt state column")?,
        progress: row.try_get("progress")?,
        message: row.try_get("message")?,
        error: row.try_get("error")?,
        output_mkv: row.try_get("output_mkv")?,
        output_srt: row.try_get("output_srt")?,
        work_dir: row.try_get("work_dir")?,
        log_path: row.try_get("log_path")?,
        storage_bytes: row.try_get("storage_bytes")?,
        runtime: serde_json::from_str(&runtime).unwrap_or(serde_json::json!({})),
    })
}

#[async_trait]
impl JobStore for SqliteJobStore {
    async fn put(&self, job: &Job) -> RdResult<()> {
        sqlx::query(
            "INSERT INTO jobs (id, owner_id, video_path, duration_s, mode, device, src_lang, \
             tgt_lang, series_title, series_slug, season_number, episode_number, visibility, \
             created_at, updated_at, state, progress, message, error, output_mkv, output_srt, \
             work_dir, log_path, storage_bytes, runtime) \
             VALUES (?,?,?,?,?,?,?,?,?,?,?,?,?,?,?,?,?,?,?,?,?,?,?,?,?)",
        )
        .bind(&job.id)
        .bind(&job.owner_id)
        .bind(&job.video_path)
        .bind(job.duration_s)
        .bind(job.mode.as_str())
        .bind(job.device.as_str())
        .bind(&job.src_lang)
        .bind(&job.tgt_lang)
        .bind(&job.series_title)
        .bind(&job.series_slug)
        .bind(job.season_number)
        .bind(job.episode_number)
        .bind(job.visibility.as_str())
        .bind(job.created_at)
        .bind(job.updated_at)
        .bind(job.state.as_str())
        .bind(job.progress)
        .bind(&job.message)
        .bind(&job.error)
        .bind(&job.output_mkv)
        .bind(&job.output_srt)
        .bind(&job.work_dir)
        .bind(&job.log_path)
        .bind(job.storage_bytes)
        .bind(job.runtime.to_string())
        .execute(&self.pool)
        .await
        .map_err(persist_err)?;
        Ok(())
    }

    async fn get(&self, id: &str) -> RdResult<Option<Job>> {
        let row = sqlx::query("SELECT * FROM jobs WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(persist_err)?;
        match row {
            Some(r) => Ok(Some(
                row_to_job(&r).map_err(|e| RdError::internal("corrupt job row").with_source(e))?,
            )),
            None => Ok(None),
        }
    }

    async fn update(&self, id: &str, patch: JobPatch) -> RdResult<Job> {
        let mut tx = self.pool.begin().await.map_err(persist_err)?;
        let row = sqlx::query("SELECT * FROM jobs WHERE id = ? ")
            .bind(id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(persist_err)?
            .ok_or_else(|| RdError::not_found("job not found"))?;
        let mut job = row_to_job(&row).map_err(|e| RdError::internal("corrupt job row").with_source(e))?;
        let previous_state = job.state;

        if let Some(new_state) = patch.state {
            if !JobState::allowed_transition(job.state, new_state, patch.is_admin_requeue) {
                return Err(RdError::new(
                    ErrorKind::IllegalTransition,
                    format!("{} -> {}", job.state.as_str(), new_state.as_str()),
                )
                .into());
            }
            job.state = new_state;
            if patch.is_admin_requeue {
                job.progress = 0.0;
                job.error = None;
                let mut runtime = job.runtime.as_object().cloned().unwrap_or_default();
                runtime.insert(
                    "requeued_from".into(),
                    serde_json::json!({ "at": Utc::now(), "previous_state": previous_state.as_str() }),
                );
                job.runtime = serde_json::Value::Object(runtime);
            }
        }
        if let Some(p) = patch.progress {
            job.progress = p;
        }
        if let Some(m) = patch.message {
            job.message = m;
        }
        if let Some(e) = patch.error {
            job.error = e;
        }
        if let Some(m) = patch.mode {
            job.mode = m;
        }
        if let Some(d) = patch.device {
            job.device = d;
        }
        if let Some(o) = patch.output_mkv {
            job.output_mkv = o;
        }
        if let Some(o) = patch.output_srt {
            job.output_srt = o;
        }
        if let Some(r) = patch.runtime {
            job.runtime = r;
        }
        job.updated_at = Utc::now();

        sqlx::query(
            "UPDATE jobs SET state=?, progress=?, message=?, error=?, mode=?, device=?, \
             output_mkv=?, output_srt=?, runtime=?, updated_at=? WHERE id=?",
        )
        .bind(job.state.as_str())
        .bind(job.progress)
        .bind(&job.message)
        .bind(&job.error)
        .bind(job.mode.as_str())
        .bind(job.device.as_str())
        .bind(&job.output_mkv)
        .bind(&job.output_srt)
        .bind(job.runtime.to_string())
        .bind(job.updated_at)
        .bind(id)
        .execute(&mut *tx)
        .await
        .map_err(persist_err)?;

        tx.commit().await.map_err(persist_err)?;
        Ok(job)
    }

    async fn list(&self, filter: &JobFilter, order: JobOrder, limit: i64, offset: i64) -> RdResult<Vec<Job>> {
        let mut sql = String::from("SELECT * FROM jobs WHERE 1=1");
        if filter.owner_id.is_some() {
            sql.push_str(" AND owner_id = ?");
        }
        if filter.series_slug.is_some() {
            sql.push_str(" AND series_slug = ?");
        }
        if filter.visibility.is_some() {
            sql.push_str(" AND visibility = ?");
        }
        if let Some(states) = &filter.states {
            let placeholders = states.iter().map(|_| "?").collect::<Vec<_>>().join(",");
            sql.push_str(&format!(" AND state IN ({placeholders})"));
        }
        sql.push_str(match order {
            JobOrder::UpdatedDesc => " ORDER BY updated_at DESC",
            JobOrder::CreatedAsc => " ORDER BY created_at ASC",
        });
        sql.push_str(" LIMIT ? OFFSET ?");

        let mut q = sqlx::query(&sql);
        if let Some(o) = &filter.owner_id {
            q = q.bind(o);
        }
        if let Some(s) = &filter.series_slug {
            q = q.bind(s);
        }
        if let Some(v) = &filter.visibility {
            q = q.bind(v.as_str());
        }
        if let Some(states) = &filter.states {
            for s in states {
                q = q.bind(s.as_str());
            }
        }
        q = q.bind(limit).bind(offset);

        let rows = q.fetch_all(&self.pool).await.map_err(persist_err)?;
        rows.iter()
            .map(|r| row_to_job(r).map_err(|e| RdError::internal("corrupt job row").with_source(e).into()))
            .collect()
    }

    async fn delete(&self, id: &str) -> RdResult<()> {
        let job = self.get(id).await?.ok_or_else(|| RdError::not_found("job not found"))?;
        if !job.state.is_terminal() {
            return Err(RdError::conflict("job is not in a terminal state").into());
        }
        sqlx::query("DELETE FROM jobs WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(persist_err)?;
        Ok(())
    }

    async fn set_storage_bytes(&self, id: &str, bytes: i64) -> RdResult<()> {
        sqlx::query("UPDATE jobs SET storage_bytes = ? WHERE id = ?")
            .bind(bytes)
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(persist_err)?;
        Ok(())
    }

    async fn user_storage_bytes(&self, owner_id: &str) -> RdResult<i64> {
        let row = sqlx::query("SELECT COALESCE(SUM(storage_bytes), 0) AS total FROM jobs WHERE owner_id = ?")
            .bind(owner_id)
            .fetch_one(&self.pool)
            .await
            .map_err(persist_err)?;
        Ok(row.try_get::<i64, _>("total").unwrap_or(0))
    }

    async fn count_jobs_created_since(&self, owner_id: &str, since: chrono::DateTime<Utc>) -> RdResult<i64> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM jobs WHERE owner_id = ? AND created_at >= ?")
            .bind(owner_id)
            .bind(since)
            .fetch_one(&self.pool)
            .await
            .map_err(persist_err)?;
        Ok(row.try_get::<i64, _>("n").unwrap_or(0))
    }

    async fn count_active(&self, owner_id: &str) -> RdResult<i64> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM jobs WHERE owner_id = ? AND state = 'RUNNING'")
            .bind(owner_id)
            .fetch_one(&self.pool)
            .await
            .map_err(persist_err)?;
        Ok(row.try_get::<i64, _>("n").unwrap_or(0))
    }

    async fn count_queued(&self, owner_id: &str) -> RdResult<i64> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM jobs WHERE owner_id = ? AND state = 'QUEUED'")
            .bind(owner_id)
            .fetch_one(&self.pool)
            .await
            .map_err(persist_err)?;
        Ok(row.try_get::<i64, _>("n").unwrap_or(0))
    }

    async fn count_running_with_mode(&self, mode: JobMode) -> RdResult<i64> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM jobs WHERE state = 'RUNNING' AND mode = ?")
            .bind(mode.as_str())
            .fetch_one(&self.pool)
            .await
            .map_err(persist_err)?;
        Ok(row.try_get::<i64, _>("n").unwrap_or(0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn admin_requeue_is_the_only_door_back_from_terminal_states() {
        for terminal in [JobState::Done, JobState::Failed, JobState::Canceled] {
            assert!(!JobState::allowed_transition(terminal, JobState::Queued, false));
            assert!(JobState::allowed_transition(terminal, JobState::Queued, true));
        }
    }

    #[test]
    fn terminal_states_never_transition_to_each_other() {
        assert!(!JobState::allowed_transition(JobState::Done, JobState::Failed, false));
        assert!(!JobState::allowed_transition(JobState::Done, JobState::Failed, true));
    }
}
