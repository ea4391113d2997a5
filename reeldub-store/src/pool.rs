//! Connection setup. Two independent SQLite databases back the store: one
//! for job/library/upload/quota/audit state, one for identity (users, api
//! keys, refresh tokens) — mirroring `JOBS_DB_PATH`/`AUTH_DB_PATH`.

use anyhow::Context;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;
use std::path::Path;
use std::str::FromStr;

const JOBS_SCHEMA: &str = include_str!("schema/jobs.sql");
const AUTH_SCHEMA: &str = include_str!("schema/auth.sql");

async fn connect(path: &Path) -> anyhow::Result<SqlitePool> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await.ok();
    }
    let opts = SqliteConnectOptions::from_str(&format!("sqlite://{}", path.display()))
        .context("parsing sqlite connect options")?
        .create_if_missing(true)
        .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
        .synchronous(sqlx::sqlite::SqliteSynchronous::Normal);
    let pool = SqlitePoolOptions::new()
        .max_connections(8)
        .connect_with(opts)
        .await
        .context("connecting to sqlite database")?;
    Ok(pool)
}

async fn apply_schema(pool: &SqlitePool, schema: &str) -> anyhow::Result<()> {
    for stmt in schema.split(';') {
        let stmt = stmt.trim();
        if stmt.is_empty() {
            continue;
        }
        sqlx::query(stmt)
            .execute(pool)
            .await
            .with_context(|| format!("applying schema statement: {stmt}"))?;
    }
    Ok(())
}

/// Opens (creating if needed) the jobs database and runs its schema.
pub async fn open_jobs_db(path: &Path) -> anyhow::Result<SqlitePool> {
    let pool = connect(path).await?;
    apply_schema(&pool, JOBS_SCHEMA).await?;
    Ok(pool)
}

/// Opens (creating if needed) the identity database and runs its schema.
pub async fn open_auth_db(path: &Path) -> anyhow::Result<SqlitePool> {
    let pool = connect(path).await?;
    apply_schema(&pool, AUTH_SCHEMA).await?;
    Ok(pool)
}
