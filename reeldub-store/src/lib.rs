//! reeldub-store: transactional persistence for jobs, identity, uploads,
//! quotas, the library view, and the audit trail. Two SQLite databases
//! back it (`JOBS_DB_PATH`, `AUTH_DB_PATH`); both run in WAL mode and are
//! migrated at startup from the embedded schema files.

pub mod audit;
pub mod identity;
pub mod jobs;
pub mod library;
pub mod models;
pub mod pool;
pub mod quotas;
pub mod uploads;

use std::path::Path;
use std::sync::Arc;

pub use audit::{AuditStore, SqliteAuditStore};
pub use identity::{IdentityStore, SqliteIdentityStore};
pub use jobs::{JobStore, SqliteJobStore};
pub use library::{LibraryStore, SqliteLibraryStore};
pub use quotas::{QuotaStore, SqliteQuotaStore};
pub use uploads::{SqliteUploadStore, UploadStore};

/// All store handles the rest of the workspace depends on, wired once at
/// bootstrap and shared behind `Arc`.
#[derive(Clone)]
pub struct Store {
    pub jobs: Arc<dyn JobStore>,
    pub library: Arc<dyn LibraryStore>,
    pub uploads: Arc<dyn UploadStore>,
    pub quotas: Arc<dyn QuotaStore>,
    pub audit: Arc<dyn AuditStore>,
    pub identity: Arc<dyn IdentityStore>,
}

impl Store {
    pub async fn open(jobs_db_path: &Path, auth_db_path: &Path) -> anyhow::Result<Self> {
        let jobs_pool = pool::open_jobs_db(jobs_db_path).await?;
        let auth_pool = pool::open_auth_db(auth_db_path).await?;
        Ok(Self {
            jobs: Arc::new(SqliteJobStore::new(jobs_pool.clone())),
            library: Arc::new(SqliteLibraryStore::new(jobs_pool.clone())),
            uploads: Arc::new(SqliteUploadStore::new(jobs_pool.clone())),
            quotas: Arc::new(SqliteQuotaStore::new(jobs_pool.clone())),
            audit: Arc::new(SqliteAuditStore::new(jobs_pool)),
            identity: Arc::new(SqliteIdentityStore::new(auth_pool)),
        })
    }
}
