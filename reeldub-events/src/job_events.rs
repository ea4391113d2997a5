//! Polls the job store at a short, fixed interval and broadcasts a delta
//! for every job whose `state:updated_at:progress:message` tuple changed
//! since the last tick. Mirrors `reeldub-queue`'s own
//! `broadcast::Sender` + `BroadcastStream` pattern for its `event_stream()`.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use reeldub_auth::{is_visible, Identity};
use reeldub_core::RdResult;
use reeldub_store::models::{JobFilter, JobOrder, JobState, Visibility};
use reeldub_store::JobStore;
use serde::Serialize;
use tokio::sync::broadcast;
use tokio_stream::{wrappers::BroadcastStream, StreamExt};
use tokio_util::sync::CancellationToken;

use crate::BoxStream;

const CHANNEL_CAPACITY: usize = 1024;
const POLL_LIMIT: i64 = 2000;

/// A single job's dedupe key, used both as the broadcast payload's
/// identity and to decide whether a tick actually changed anything.
type DedupeKey = (&'static str, DateTime<Utc>, String, String);

#[derive(Debug, Clone, Serialize)]
pub struct JobDelta {
    pub job_id: String,
    #[serde(skip)]
    pub owner_id: String,
    #[serde(skip)]
    pub visibility: Visibility,
    pub state: JobState,
    pub updated_at: DateTime<Utc>,
    pub progress: f64,
    pub message: String,
}

impl JobDelta {
    fn dedupe_key(&self) -> DedupeKey {
        (self.state.as_str(), self.updated_at, format!("{:.4}", self.progress), self.message.clone())
    }
}

pub struct JobEventHub {
    jobs: Arc<dyn JobStore>,
    poll_interval: Duration,
    sender: broadcast::Sender<JobDelta>,
}

impl JobEventHub {
    pub fn new(jobs: Arc<dyn JobStore>, poll_interval: Duration) -> Self {
        let (sender, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self { jobs, poll_interval, sender }
    }

    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        let mut last_seen: HashMap<String, DedupeKey> = HashMap::new();
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    tracing::info!("job event poller shutting down");
                    return;
                }
                _ = tokio::time::sleep(self.poll_interval) => {
                    if let Err(e) = self.poll_once(&mut last_seen).await {
                        tracing::warn!(error = %e, "job event poll failed");
                    }
                }
            }
        }
    }

    async fn poll_once(&self, last_seen: &mut HashMap<String, DedupeKey>) -> RdResult<()> {
        let jobs = self.jobs.list(&JobFilter::default(), JobOrder::UpdatedDesc, POLL_LIMIT, 0).await?;
        let mut still_present = HashSet::with_capacity(jobs.len());
        for job in jobs {
            still_present.insert(job.id.clone());
            let delta = JobDelta {
                job_id: job.id.clone(),
                owner_id: job.owner_id,
                visibility: job.visibility,
                state: job.state,
                updated_at: job.updated_at,
                progress: job.progress,
                message: job.message,
            };
            let key = delta.dedupe_key();
            if last_seen.get(&delta.job_id) != Some(&key) {
                last_seen.insert(delta.job_id.clone(), key);
                let _ = self.sender.send(delta);
            }
        }
        last_seen.retain(|id, _| still_present.contains(id));
        Ok(())
    }

    /// Subscribes a caller, filtering every delta by the same owner/admin/
    /// visibility rule the library view uses. A subscriber that falls too
    /// far behind is dropped by the broadcast channel itself (lagged
    /// receivers surface as `Err` from `BroadcastStream`, filtered out
    /// here); the caller is expected to reconnect and fetch a fresh
    /// snapshot, per the backpressure contract.
    pub fn subscribe(&self, identity: Identity, allow_shared_read: bool) -> BoxStream<JobDelta> {
        let rx = self.sender.subscribe();
        Box::pin(
            BroadcastStream::new(rx)
                .filter_map(|r| r.ok())
                .filter(move |delta| is_visible(&identity, &delta.owner_id, delta.visibility, allow_shared_read)),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use reeldub_store::models::{Job, JobDevice, JobMode, JobPatch};
    use std::sync::Mutex;

    #[derive(Default)]
    struct FakeJobStore {
        jobs: Mutex<Vec<Job>>,
    }

    fn job(id: &str, owner: &str, visibility: Visibility, progress: f64) -> Job {
        let now = Utc::now();
        Job {
            id: id.to_string(),
            owner_id: owner.to_string(),
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
            visibility,
            created_at: now,
            updated_at: now,
            state: JobState::Running,
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
            self.jobs.lock().unwrap().push(j.clone());
            Ok(())
        }
        async fn get(&self, id: &str) -> RdResult<Option<Job>> {
            Ok(self.jobs.lock().unwrap().iter().find(|j| j.id == id).cloned())
        }
        async fn update(&self, _id: &str, _patch: JobPatch) -> RdResult<Job> {
            unimplemented!()
        }
        async fn list(&self, _filter: &JobFilter, _order: JobOrder, _limit: i64, _offset: i64) -> RdResult<Vec<Job>> {
            Ok(self.jobs.lock().unwrap().clone())
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
        async fn count_jobs_created_since(&self, _owner_id: &str, _since: DateTime<Utc>) -> RdResult<i64> {
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
    async fn unchanged_jobs_do_not_re_broadcast() {
        let store = Arc::new(FakeJobStore::default());
        store.put(&job("job_1", "u1", Visibility::Private, 0.5)).await.unwrap();
        let hub = JobEventHub::new(store.clone(), Duration::from_secs(60));
        let mut last_seen = HashMap::new();

        hub.poll_once(&mut last_seen).await.unwrap();
        assert_eq!(last_seen.len(), 1);
        let key_after_first_poll = last_seen.get("job_1").cloned();

        hub.poll_once(&mut last_seen).await.unwrap();
        assert_eq!(last_seen.get("job_1").cloned(), key_after_first_poll);
    }
}
