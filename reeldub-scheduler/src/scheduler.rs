use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use reeldub_core::RdConfig;
use reeldub_policy::PolicyEngine;
use reeldub_queue::{JobOutcome, JobPriority, LeasedEntry, QueueBackend};
use reeldub_store::models::{Job, JobFilter, JobMode, JobOrder, JobPatch, JobState, Role};
use reeldub_store::{IdentityStore, JobStore, QuotaStore};
use tokio::sync::{Mutex, Semaphore};
use tokio_util::sync::CancellationToken;

use crate::context::{JobRunContext, ProgressReporter};
use crate::phase::PhaseSemaphores;
use crate::runner::{StageOutcome, StageRunner};

/// The single logical queue this scheduler dispatches from. The queue
/// backend's `phase` parameter exists to let one backend multiplex
/// several independent dispatch queues; this substrate only needs one.
const DISPATCH_PHASE: &str = "dispatch";

/// A rejection at dispatch time backs off exponentially: the policy
/// engine's `retry_after_s` is the base delay, doubled on each
/// consecutive rejection of the same job, capped at `MAX_BACKOFF_S`.
const MAX_BACKOFF_S: f64 = 120.0;
const MAX_BACKOFF_DOUBLINGS: u32 = 6;

/// Drains the ready queue into the stage runner, honoring the global
/// in-flight cap and cooperative cancellation. Per-ML-phase capacity
/// (`audio`/`transcribe`/`tts`/`mux`) lives in [`PhaseSemaphores`] and is
/// acquired by the runner itself, not by this loop.
pub struct Scheduler {
    queue: Arc<dyn QueueBackend>,
    store: Arc<dyn JobStore>,
    identity: Arc<dyn IdentityStore>,
    quotas: Arc<dyn QuotaStore>,
    policy: Arc<PolicyEngine>,
    runner: Arc<dyn StageRunner>,
    phases: Arc<PhaseSemaphores>,
    global_slots: Arc<Semaphore>,
    cancel_tokens: Arc<Mutex<HashMap<String, CancellationToken>>>,
    dispatch_attempts: Arc<Mutex<HashMap<String, u32>>>,
    shutdown: CancellationToken,
    poll_interval: Duration,
}

impl Scheduler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: &RdConfig,
        queue: Arc<dyn QueueBackend>,
        store: Arc<dyn JobStore>,
        identity: Arc<dyn IdentityStore>,
        quotas: Arc<dyn QuotaStore>,
        policy: Arc<PolicyEngine>,
        runner: Arc<dyn StageRunner>,
    ) -> Self {
        let phases = Arc::new(PhaseSemaphores::new(
            config.max_concurrency_audio as usize,
            config.max_concurrency_transcribe as usize,
            config.max_concurrency_tts as usize,
            config.max_concurrency_mux as usize,
        ));
        Self {
            queue,
            store,
            identity,
            quotas,
            policy,
            runner,
            phases,
            global_slots: Arc::new(Semaphore::new(config.max_concurrency_global.max(1) as usize)),
            cancel_tokens: Arc::new(Mutex::new(HashMap::new())),
            dispatch_attempts: Arc::new(Mutex::new(HashMap::new())),
            shutdown: CancellationToken::new(),
            poll_interval: Duration::from_millis(250),
        }
    }

    /// Re-loads every persisted `QUEUED` job and re-enqueues it in
    /// `(priority desc, created_at asc)` order before the dispatch loop
    /// starts, so a restart never loses queued work.
    pub async fn readmit_on_startup(&self) -> reeldub_core::RdResult<usize> {
        let filter = JobFilter { states: Some(vec![JobState::Queued]), ..Default::default() };
        let mut jobs = self.store.list(&filter, JobOrder::CreatedAsc, i64::MAX, 0).await?;
        jobs.sort_by(|a, b| {
            JobPriority::from_mode(a.mode.as_str())
                .cmp(&JobPriority::from_mode(b.mode.as_str()))
                .reverse()
                .then(a.created_at.cmp(&b.created_at))
        });
        let mut readmitted = 0;
        for job in &jobs {
            let token = self
                .queue
                .reserve_submit(&job.owner_id, DISPATCH_PHASE)
                .await?;
            let priority = JobPriority::from_mode(job.mode.as_str());
            self.queue.commit(token, &job.id, priority, DISPATCH_PHASE).await?;
            readmitted += 1;
        }
        tracing::info!(readmitted, "requeued persisted jobs on startup");
        Ok(readmitted)
    }

    /// Requests cancellation of `job_id`. Queued jobs are pulled off
    /// the queue and transitioned immediately; running jobs have their
    /// cancel flag set and are expected to tear down at their own next
    /// safe point.
    pub async fn cancel(&self, job_id: &str) -> reeldub_core::RdResult<()> {
        if self.queue.cancel(job_id).await? {
            self.store
                .update(job_id, JobPatch { state: Some(JobState::Canceled), ..Default::default() })
                .await?;
            return Ok(());
        }
        let tokens = self.cancel_tokens.lock().await;
        if let Some(token) = tokens.get(job_id) {
            token.cancel();
        }
        Ok(())
    }

    pub fn request_shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Dispatch-time safety net, re-checked right before a lease is handed
    /// out, in case submission-time counts went stale. On rejection, the
    /// lease is given back to the queue after an exponential backoff and
    /// this returns `Ok(false)`; the caller must not proceed to run the job.
    async fn admit_dispatch(&self, job_id: &str, job: &Job, leased: &LeasedEntry) -> reeldub_core::RdResult<bool> {
        let role = match self.identity.get_user(&job.owner_id).await? {
            Some(user) => user.role,
            None => {
                tracing::warn!(job_id = %job_id, owner_id = %job.owner_id, "dispatching job for unknown owner, assuming least privilege");
                Role::Viewer
            }
        };
        let quota = self.quotas.get(&job.owner_id).await?;
        let running = self.store.count_active(&job.owner_id).await?;
        let global_high_running = self.store.count_running_with_mode(JobMode::High).await?;

        let decision = self
            .policy
            .evaluate_dispatch(&job.owner_id, role, job.mode.as_str(), running, global_high_running, quota.as_ref())
            .await;

        if decision.ok {
            return Ok(true);
        }

        let doublings = {
            let mut attempts = self.dispatch_attempts.lock().await;
            let attempt = attempts.entry(job_id.to_string()).or_insert(0);
            let doublings = (*attempt).min(MAX_BACKOFF_DOUBLINGS);
            *attempt += 1;
            doublings
        };
        let base = decision.retry_after_s.unwrap_or(5.0);
        let delay = (base * 2f64.powi(doublings as i32)).min(MAX_BACKOFF_S);

        tracing::info!(job_id = %job_id, reasons = ?decision.reasons, delay_s = delay, "dispatch deferred by policy, requeuing with backoff");

        if let Err(e) = self.queue.requeue(job_id, leased.lease_token.clone(), leased.entry.priority, delay).await {
            tracing::error!(job_id = %job_id, error = %e, "failed to requeue job after dispatch-time rejection");
        }
        Ok(false)
    }

    /// Runs the dispatch loop until `request_shutdown` is called. Meant
    /// to be spawned as its own task by the bootstrap binary.
    pub async fn run(&self) {
        loop {
            if self.shutdown.is_cancelled() {
                return;
            }

            let permit = tokio::select! {
                _ = self.shutdown.cancelled() => return,
                permit = self.global_slots.clone().acquire_owned() => permit.expect("global semaphore never closed"),
            };

            let leased = match self.queue.dequeue(DISPATCH_PHASE).await {
                Ok(Some(entry)) => entry,
                Ok(None) => {
                    drop(permit);
                    tokio::select! {
                        _ = self.shutdown.cancelled() => return,
                        _ = tokio::time::sleep(self.poll_interval) => continue,
                    }
                }
                Err(e) => {
                    tracing::warn!(error = %e, "dequeue failed, backing off");
                    drop(permit);
                    tokio::time::sleep(self.poll_interval).await;
                    continue;
                }
            };

            let job_id = leased.entry.job_id.clone();

            let job = match self.store.get(&job_id).await {
                Ok(Some(job)) => job,
                Ok(None) => {
                    tracing::error!(job_id = %job_id, "leased job missing from store");
                    drop(permit);
                    continue;
                }
                Err(e) => {
                    tracing::error!(job_id = %job_id, error = %e, "failed to load leased job");
                    drop(permit);
                    continue;
                }
            };

            match self.admit_dispatch(&job_id, &job, &leased).await {
                Ok(true) => {}
                Ok(false) => {
                    drop(permit);
                    continue;
                }
                Err(e) => {
                    tracing::error!(job_id = %job_id, error = %e, "dispatch-time admission check failed, leaving lease in place");
                    drop(permit);
                    continue;
                }
            }
            self.dispatch_attempts.lock().await.remove(&job_id);

            if let Err(e) = self.queue.before_job_run(&job_id).await {
                tracing::warn!(job_id = %job_id, error = %e, "before_job_run rejected, leaving job for a future dispatch attempt");
                drop(permit);
                continue;
            }

            let cancel_token = CancellationToken::new();
            self.cancel_tokens.lock().await.insert(job_id.clone(), cancel_token.clone());

            if let Err(e) = self
                .store
                .update(&job_id, JobPatch { state: Some(JobState::Running), ..Default::default() })
                .await
            {
                tracing::error!(job_id = %job_id, error = %e, "failed to mark job running");
            }

            let ctx = JobRunContext::new(
                job_id.clone(),
                job.owner_id.clone(),
                std::path::PathBuf::from(&job.work_dir),
                cancel_token,
                ProgressReporter::new(self.store.clone(), job_id.clone()),
                self.phases.clone(),
            );

            let queue = self.queue.clone();
            let store = self.store.clone();
            let runner = self.runner.clone();
            let lease_token = leased.lease_token.clone();
            let cancel_tokens = self.cancel_tokens.clone();

            // `permit` moves into the task so the global slot stays
            // occupied for the job's full run, not just the dispatch tick.
            tokio::spawn(async move {
                let _permit = permit;
                let outcome = runner.run(ctx).await;

                let (job_outcome, patch) = match &outcome {
                    StageOutcome::Done { output_mkv, output_srt } => (
                        JobOutcome::Completed,
                        JobPatch {
                            state: Some(JobState::Done),
                            progress: Some(1.0),
                            output_mkv: Some(output_mkv.clone()),
                            output_srt: Some(output_srt.clone()),
                            ..Default::default()
                        },
                    ),
                    StageOutcome::Failed(msg) => (
                        JobOutcome::Failed(msg.clone()),
                        JobPatch { state: Some(JobState::Failed), error: Some(Some(msg.clone())), ..Default::default() },
                    ),
                    StageOutcome::Canceled => (
                        JobOutcome::Failed("canceled".to_string()),
                        JobPatch { state: Some(JobState::Canceled), ..Default::default() },
                    ),
                };

                if let Err(e) = store.update(&job_id, patch).await {
                    tracing::error!(job_id = %job_id, error = %e, "failed to persist job outcome");
                }
                if let Err(e) = queue.on_job_done(&job_id, lease_token, job_outcome).await {
                    tracing::error!(job_id = %job_id, error = %e, "on_job_done failed");
                }
                cancel_tokens.lock().await.remove(&job_id);
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::Utc;
    use reeldub_queue::MemoryBackend;
    use reeldub_store::models::{Job, JobDevice, JobMode, Visibility};
    use std::sync::Mutex as StdMutex;

    #[derive(Default)]
    struct FakeJobStore {
        jobs: StdMutex<HashMap<String, Job>>,
    }

    fn sample_job(id: &str, mode: JobMode, created_at_offset_s: i64) -> Job {
        Job {
            id: id.to_string(),
            owner_id: "user-1".to_string(),
            video_path: "in.mp4".to_string(),
            duration_s: None,
            mode,
            device: JobDevice::Auto,
            src_lang: "en".to_string(),
            tgt_lang: "fr".to_string(),
            series_title: "Show".to_string(),
            series_slug: "show".to_string(),
            season_number: 1,
            episode_number: 1,
            visibility: Visibility::Private,
            created_at: Utc::now() + chrono::Duration::seconds(created_at_offset_s),
            updated_at: Utc::now(),
            state: JobState::Queued,
            progress: 0.0,
            message: String::new(),
            error: None,
            output_mkv: None,
            output_srt: None,
            work_dir: format!("/tmp/{id}"),
            log_path: format!("/tmp/{id}.log"),
            storage_bytes: 0,
            runtime: serde_json::json!({}),
        }
    }

    #[async_trait]
    impl JobStore for FakeJobStore {
        async fn put(&self, job: &Job) -> reeldub_core::RdResult<()> {
            self.jobs.lock().unwrap().insert(job.id.clone(), job.clone());
            Ok(())
        }

        async fn get(&self, id: &str) -> reeldub_core::RdResult<Option<Job>> {
            Ok(self.jobs.lock().unwrap().get(id).cloned())
        }

        async fn update(&self, id: &str, _patch: JobPatch) -> reeldub_core::RdResult<Job> {
            let jobs = self.jobs.lock().unwrap();
            jobs.get(id)
                .cloned()
                .ok_or_else(|| reeldub_core::RdError::not_found("job not found").into())
        }

        async fn list(&self, filter: &JobFilter, _order: JobOrder, _limit: i64, _offset: i64) -> reeldub_core::RdResult<Vec<Job>> {
            let jobs = self.jobs.lock().unwrap();
            Ok(jobs
                .values()
                .filter(|j| filter.states.as_ref().map(|s| s.contains(&j.state)).unwrap_or(true))
                .cloned()
                .collect())
        }

        async fn delete(&self, _id: &str) -> reeldub_core::RdResult<()> {
            Ok(())
        }

        async fn set_storage_bytes(&self, _id: &str, _bytes: i64) -> reeldub_core::RdResult<()> {
            Ok(())
        }

        async fn user_storage_bytes(&self, _owner_id: &str) -> reeldub_core::RdResult<i64> {
            Ok(0)
        }

        async fn count_jobs_created_since(&self, _owner_id: &str, _since: chrono::DateTime<Utc>) -> reeldub_core::RdResult<i64> {
            Ok(0)
        }

        async fn count_active(&self, _owner_id: &str) -> reeldub_core::RdResult<i64> {
            Ok(0)
        }

        async fn count_queued(&self, _owner_id: &str) -> reeldub_core::RdResult<i64> {
            Ok(0)
        }

        async fn count_running_with_mode(&self, _mode: JobMode) -> reeldub_core::RdResult<i64> {
            Ok(0)
        }
    }

    #[derive(Default)]
    struct FakeIdentityStore;

    #[async_trait]
    impl reeldub_store::IdentityStore for FakeIdentityStore {
        async fn create_user(&self, _user: &reeldub_store::models::User) -> reeldub_core::RdResult<()> {
            Ok(())
        }
        async fn get_user(&self, _id: &str) -> reeldub_core::RdResult<Option<reeldub_store::models::User>> {
            Ok(None)
        }
        async fn get_user_by_username(&self, _username: &str) -> reeldub_core::RdResult<Option<reeldub_store::models::User>> {
            Ok(None)
        }
        async fn create_api_key(&self, _key: &reeldub_store::models::ApiKey) -> reeldub_core::RdResult<()> {
            Ok(())
        }
        async fn get_api_key_by_prefix(&self, _prefix: &str) -> reeldub_core::RdResult<Option<reeldub_store::models::ApiKey>> {
            Ok(None)
        }
        async fn revoke_api_key(&self, _id: &str) -> reeldub_core::RdResult<()> {
            Ok(())
        }
        async fn create_refresh_token(&self, _token: &reeldub_store::models::RefreshToken) -> reeldub_core::RdResult<()> {
            Ok(())
        }
        async fn get_refresh_token_by_hash(&self, _hash: &str) -> reeldub_core::RdResult<Option<reeldub_store::models::RefreshToken>> {
            Ok(None)
        }
        async fn rotate_refresh_token(&self, _old_id: &str, _new_token: &reeldub_store::models::RefreshToken) -> reeldub_core::RdResult<()> {
            Ok(())
        }
        async fn revoke_refresh_token(&self, _id: &str) -> reeldub_core::RdResult<()> {
            Ok(())
        }
        async fn revoke_refresh_token_family(&self, _user_id: &str) -> reeldub_core::RdResult<()> {
            Ok(())
        }
    }

    #[derive(Default)]
    struct FakeQuotaStore;

    #[async_trait]
    impl reeldub_store::QuotaStore for FakeQuotaStore {
        async fn get(&self, _user_id: &str) -> reeldub_core::RdResult<Option<reeldub_store::models::QuotaRecord>> {
            Ok(None)
        }
        async fn upsert(&self, _quota: &reeldub_store::models::QuotaRecord) -> reeldub_core::RdResult<()> {
            Ok(())
        }
    }

    #[derive(Default)]
    struct FakeAuditStore;

    #[async_trait]
    impl reeldub_store::AuditStore for FakeAuditStore {
        async fn append(&self, _record: &reeldub_store::models::AuditRecord) -> reeldub_core::RdResult<()> {
            Ok(())
        }
        async fn list_for_job(&self, _job_id: &str) -> reeldub_core::RdResult<Vec<reeldub_store::models::AuditRecord>> {
            Ok(Vec::new())
        }
    }

    fn test_policy(config: Arc<RdConfig>) -> Arc<reeldub_policy::PolicyEngine> {
        Arc::new(reeldub_policy::PolicyEngine::new(
            config,
            Arc::new(FakeAuditStore),
            Arc::new(reeldub_policy::NoGpuProbe),
        ))
    }

    fn test_config() -> RdConfig {
        use reeldub_core::config::{QueueBackendKind, RemoteAccessMode};
        RdConfig {
            host: "127.0.0.1".to_string(),
            port: 8080,
            output_dir: std::path::PathBuf::from("/tmp/out"),
            input_dir: std::path::PathBuf::from("/tmp/in"),
            log_dir: std::path::PathBuf::from("/tmp/log"),
            state_dir: std::path::PathBuf::from("/tmp/state"),
            voice_store_root: std::path::PathBuf::from("/tmp/voices"),
            remote_access_mode: RemoteAccessMode::Off,
            allow_legacy_token_login: false,
            cookie_secure: true,
            jobs_db_path: std::path::PathBuf::from("/tmp/state/jobs.db"),
            auth_db_path: std::path::PathBuf::from("/tmp/state/auth.db"),
            jwt_secret: "test-secret-test-secret".to_string(),
            jwt_issuer: "reeldub".to_string(),
            jwt_audience: "reeldub-api".to_string(),
            access_token_ttl: Duration::from_secs(900),
            refresh_token_ttl: Duration::from_secs(1_209_600),
            session_cookie_ttl: Duration::from_secs(86_400),
            max_upload_bytes: 1 << 30,
            max_storage_bytes_per_user: 1 << 30,
            jobs_per_day_per_user: 20,
            max_concurrent_jobs_per_user: 2,
            max_queued_jobs_per_user: 5,
            max_high_running_global: 1,
            high_mode_admin_only: true,
            max_concurrency_global: 4,
            max_concurrency_transcribe: 2,
            max_concurrency_tts: 2,
            max_concurrency_audio: 2,
            max_concurrency_mux: 1,
            backpressure_q_max: 50,
            upload_session_ttl: Duration::from_secs(3600),
            queue_backend: QueueBackendKind::Local,
            redis_url: None,
        }
    }

    #[tokio::test]
    async fn readmit_commits_queued_jobs_in_priority_then_age_order() {
        let store = Arc::new(FakeJobStore::default());
        store.put(&sample_job("job-a", JobMode::Medium, 0)).await.unwrap();
        store.put(&sample_job("job-b", JobMode::High, 5)).await.unwrap();
        store.put(&sample_job("job-c", JobMode::Medium, -5)).await.unwrap();

        let queue: Arc<dyn QueueBackend> = Arc::new(MemoryBackend::new());
        struct NoopRunner;
        #[async_trait]
        impl StageRunner for NoopRunner {
            async fn run(&self, _ctx: JobRunContext) -> StageOutcome {
                StageOutcome::Done { output_mkv: None, output_srt: None }
            }
        }
        let config = Arc::new(test_config());
        let policy = test_policy(config.clone());
        let scheduler = Scheduler::new(
            &config,
            queue.clone(),
            store.clone(),
            Arc::new(FakeIdentityStore),
            Arc::new(FakeQuotaStore),
            policy,
            Arc::new(NoopRunner),
        );

        let readmitted = scheduler.readmit_on_startup().await.unwrap();
        assert_eq!(readmitted, 3);

        let first = queue.dequeue(DISPATCH_PHASE).await.unwrap().unwrap();
        assert_eq!(first.entry.job_id, "job-b", "high priority dispatches first regardless of age");

        let second = queue.dequeue(DISPATCH_PHASE).await.unwrap().unwrap();
        assert_eq!(second.entry.job_id, "job-c", "within a priority, older job dispatches first");
    }
}
