//! Denormalized library listing: one row per (series, season, episode),
//! picking the most recently updated job in each slot and applying the
//! visibility rule (owner sees everything; everyone else sees only
//! `public`/`shared` jobs).

use crate::models::{LibraryRow, Visibility};
use async_trait::async_trait;
use reeldub_core::{RdError, RdResult};
use sqlx::{Row, SqlitePool};

#[async_trait]
pub trait LibraryStore: Send + Sync {
    async fn list_episodes(&self, viewer_id: &str, series_slug: Option<&str>) -> RdResult<Vec<LibraryRow>>;
}

pub struct SqliteLibraryStore {
    pool: SqlitePool,
}

impl SqliteLibraryStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

fn row_to_library(row: &sqlx::sqlite::SqliteRow) -> anyhow::Result<LibraryRow> {
    let visibility: String = row.try_get("visibility")?;
    Ok(LibraryRow {
        job_id: row.try_get("job_id")?,
        owner_id: row.try_get("owner_id")?,
        series_slug: row.try_get("series_slug")?,
        series_title: row.try_get("series_title")?,
        season_number: row.try_get("season_number")?,
        episode_number: row.try_get("episode_number")?,
        visibility: Visibility::parse(&visibility).ok_or_else(|| anyhow::anyhow!("corrupt visibility column"))?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

#[async_trait]
impl LibraryStore for SqliteLibraryStore {
    async fn list_episodes(&self, viewer_id: &str, series_slug: Option<&str>) -> RdResult<Vec<LibraryRow>> {
        let mut sql = String::from(
            "SELECT job_id, owner_id, series_slug, series_title, season_number, episode_number, \
             visibility, created_at, updated_at FROM ( \
                SELECT id AS job_id, owner_id, series_slug, series_title, season_number, episode_number, \
                       visibility, created_at, updated_at, \
                       ROW_NUMBER() OVER ( \
                           PARTITION BY series_slug, season_number, episode_number \
                           ORDER BY updated_at DESC \
                       ) AS rn \
                FROM jobs \
                WHERE (owner_id = ? OR visibility IN ('public', 'shared')) \
                  AND state = 'DONE'",
        );
        if series_slug.is_some() {
            sql.push_str(" AND series_slug = ?");
        }
        sql.push_str(") WHERE rn = 1 ORDER BY series_slug, season_number, episode_number");

        let mut q = sqlx::query(&sql).bind(viewer_id);
        if let Some(slug) = series_slug {
            q = q.bind(slug);
        }
        let rows = q
            .fetch_all(&self.pool)
            .await
            .map_err(|e| RdError::persist_failed("library query failed").with_source(e.into()))?;
        rows.iter()
            .map(|r| row_to_library(r).map_err(|e| RdError::internal("corrupt library row").with_source(e).into()))
            .collect()
    }
}
