//! Background sweep for abandoned upload sessions, one task per the
//! scheduler's own task-per-concern model.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use reeldub_core::RdResult;
use reeldub_store::UploadStore;
use tokio_util::sync::CancellationToken;

pub struct UploadJanitor {
    uploads: Arc<dyn UploadStore>,
    incoming_dir: PathBuf,
    sweep_interval: Duration,
}

impl UploadJanitor {
    pub fn new(uploads: Arc<dyn UploadStore>, incoming_dir: PathBuf, sweep_interval: Duration) -> Self {
        Self { uploads, incoming_dir, sweep_interval }
    }

    pub async fn run(self, shutdown: CancellationToken) {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    tracing::info!("upload janitor shutting down");
                    return;
                }
                _ = tokio::time::sleep(self.sweep_interval) => {
                    match self.sweep_once().await {
                        Ok(0) => {}
                        Ok(n) => tracing::info!(reclaimed = n, "upload janitor reclaimed expired sessions"),
                        Err(e) => tracing::warn!(error = %e, "upload janitor sweep failed"),
                    }
                }
            }
        }
    }

    pub async fn sweep_once(&self) -> RdResult<usize> {
        let expired = self.uploads.list_expired(Utc::now()).await?;
        let mut reclaimed = 0;
        for session in expired {
            let sidecar = self.incoming_dir.join(format!("{}.part", session.upload_id));
            let _ = tokio::fs::remove_file(&sidecar).await;
            self.uploads.delete(&session.upload_id).await?;
            reclaimed += 1;
        }
        Ok(reclaimed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::Duration as ChronoDuration;
    use reeldub_store::models::UploadSession;
    use std::sync::Mutex;

    #[derive(Default)]
    struct FakeUploadStore {
        sessions: Mutex<Vec<UploadSession>>,
        deleted: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl UploadStore for FakeUploadStore {
        async fn create(&self, session: &UploadSession) -> RdResult<()> {
            self.sessions.lock().unwrap().push(session.clone());
            Ok(())
        }
        async fn get(&self, upload_id: &str) -> RdResult<Option<UploadSession>> {
            Ok(self.sessions.lock().unwrap().iter().find(|s| s.upload_id == upload_id).cloned())
        }
        async fn record_chunk(&self, upload_id: &str, _index: i64, _bytes_in_chunk: i64) -> RdResult<UploadSession> {
            self.get(upload_id).await?.ok_or_else(|| reeldub_core::RdError::not_found("missing").into())
        }
        async fn finalize(&self, _upload_id: &str, _video_path: &str) -> RdResult<()> {
            Ok(())
        }
        async fn delete(&self, upload_id: &str) -> RdResult<()> {
            self.deleted.lock().unwrap().push(upload_id.to_string());
            self.sessions.lock().unwrap().retain(|s| s.upload_id != upload_id);
            Ok(())
        }
        async fn list_expired(&self, now: chrono::DateTime<chrono::Utc>) -> RdResult<Vec<UploadSession>> {
            Ok(self.sessions.lock().unwrap().iter().filter(|s| !s.finalized && s.expires_at < now).cloned().collect())
        }
    }

    fn expired_session(upload_id: &str) -> UploadSession {
        let now = Utc::now();
        UploadSession {
            upload_id: upload_id.to_string(),
            owner_id: "user-1".to_string(),
            filename: "movie.mkv".to_string(),
            total_bytes: 100,
            chunk_bytes: 100,
            received_bytes: 0,
            sha256_partial: None,
            chunks_received: vec![],
            finalized: false,
            video_path: None,
            created_at: now - ChronoDuration::days(2),
            expires_at: now - ChronoDuration::days(1),
        }
    }

    #[tokio::test]
    async fn sweep_deletes_expired_unfinalized_sessions() {
        let store = Arc::new(FakeUploadStore::default());
        store.create(&expired_session("up_1")).await.unwrap();
        let janitor = UploadJanitor::new(store.clone(), PathBuf::from("/tmp/reeldub-test-incoming"), Duration::from_secs(60));
        let reclaimed = janitor.sweep_once().await.unwrap();
        assert_eq!(reclaimed, 1);
        assert!(store.get("up_1").await.unwrap().is_none());
    }
}
