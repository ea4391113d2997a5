//! A single job's own progress stream, for `/ws/jobs/{id}`. Unlike
//! `JobEventHub`, which fans one poll out to every subscriber, this polls
//! one job directly and closes once it reaches a terminal state —
//! authorization for the job is the caller's job, this module only knows
//! how to watch it.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use reeldub_core::{RdError, RdResult};
use reeldub_store::models::Job;
use reeldub_store::JobStore;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use crate::BoxStream;

const CHANNEL_CAPACITY: usize = 64;

/// Streams snapshots of `job_id` until it reaches a terminal state, then
/// closes. Each snapshot is only sent when something in it changed, keyed
/// the same way `JobEventHub` dedupes (state, updated_at, progress,
/// message).
pub fn stream_job(jobs: Arc<dyn JobStore>, job_id: String, poll_interval: Duration) -> BoxStream<RdResult<Job>> {
    let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
    tokio::spawn(async move {
        let mut last_key: Option<(String, chrono::DateTime<chrono::Utc>, String, String)> = None;
        loop {
            let job = match jobs.get(&job_id).await {
                Ok(Some(job)) => job,
                Ok(None) => {
                    let _ = tx.send(Err(RdError::not_found("job not found").into())).await;
                    return;
                }
                Err(e) => {
                    let _ = tx.send(Err(e)).await;
                    return;
                }
            };

            let key = (job.state.as_str().to_string(), job.updated_at, format!("{:.4}", job.progress), job.message.clone());
            let changed = last_key.as_ref() != Some(&key);
            let terminal = job.state.is_terminal();
            if changed {
                last_key = Some(key);
                if tx.send(Ok(job)).await.is_err() {
                    return;
                }
            }
            if terminal {
                return;
            }
            tokio::time::sleep(poll_interval).await;
        }
    });
    Box::pin(ReceiverStream::new(rx))
}

pub fn canonical_log_path(job: &Job) -> PathBuf {
    PathBuf::from(&job.log_path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::Utc;
    use reeldub_store::models::{JobDevice, JobFilter, JobMode, JobOrder, JobPatch, JobState, Visibility};
    use std::sync::Mutex;
    use tokio_stream::StreamExt;

    struct FakeJobStore {
        job: Mutex<Job>,
    }

    fn base_job(state: JobState, progress: f64) -> Job {
        let now = Utc::now();
        Job {
            id: "job_1".to_string(),
            owner_id: "u1".to_string(),
            video_path: "in.mkv".to_string(),
            duration_s: None,
            mode: JobMode::Medium,
            device: JobDevice::Cpu,
            src_lang: "en".to_string(),
            tgt_lang: "es".to_string(),
            series_title: "Show".to_string(),
            series_slug: "show".to_string(),
            season_number: 1,
            episode_number: 1,
            visibility: Visibility::Private,
            created_at: now,
            updated_at: now,
            state,
            progress,
            message: "working".to_string(),
            error: None,
            output_mkv: None,
            output_srt: None,
            work_dir: "/tmp/w".to_string(),
            log_path: "/tmp/w/job.log".to_string(),
            storage_bytes: 0,
            runtime: serde_json::json!({}),
        }
    }

    #[async_trait]
    impl JobStore for FakeJobStore {
        async fn put(&self, j: &Job) -> RdResult<()> {
            *self.job.lock().unwrap() = j.clone();
            Ok(())
        }
        async fn get(&self, id: &str) -> RdResult<Option<Job>> {
            let job = self.job.lock().unwrap();
            if job.id == id {
                Ok(Some(job.clone()))
            } else {
                Ok(None)
            }
        }
        async fn update(&self, _id: &str, _patch: JobPatch) -> RdResult<Job> {
            unimplemented!()
        }
        async fn list(&self, _filter: &JobFilter, _order: JobOrder, _limit: i64, _offset: i64) -> RdResult<Vec<Job>> {
            Ok(vec![self.job.lock().unwrap().clone()])
        }
        async fn delete(&self, _id: &str) -> RdResult<()> {
            Ok(())
        }
        async fn set_storage_bytes(&self, _id: &str, _bytes: i64) -> RdResult<()> {
            Ok(())
        }
        async fn user_storage_bytes(&self, _owner_id: &str) -> RdResult<i64> {
            Ok(0)
        }
        async fn count_jobs_created_since(&self, _owner_id: &str, _since: chrono::DateTime<Utc>) -> RdResult<i64> {
            Ok(0)
        }
        async fn count_active(&self, _owner_id: &str) -> RdResult<i64> {
            Ok(0)
        }
        async fn count_queued(&self, _owner_id: &str) -> RdResult<i64> {
            Ok(0)
        }
    }

    #[tokio::test]
    async fn stream_closes_after_the_job_reaches_a_terminal_state() {
        let store = Arc::new(FakeJobStore { job: Mutex::new(base_job(JobState::Running, 0.1)) });
        let mut stream = stream_job(store.clone(), "job_1".to_string(), Duration::from_millis(5));

        let first = stream.next().await.unwrap().unwrap();
        assert_eq!(first.state, JobState::Running);

        *store.job.lock().unwrap() = base_job(JobState::Done, 1.0);
        let mut saw_done = false;
        while let Some(item) = stream.next().await {
            let job = item.unwrap();
            if job.state == JobState::Done {
                saw_done = true;
            }
        }
        assert!(saw_done, "expected the stream to emit the terminal state before closing");
    }
}
