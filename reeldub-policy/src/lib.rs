//! reeldub-policy: submission-time and dispatch-time admission control.
//!
//! Both entry points share [`resolve_limits_for_user`] so a user's
//! effective running/queued caps can never drift between the two
//! enforcement points. Submission-time checks are best-effort (they
//! inform the client early); dispatch-time checks are the safety net
//! enforced again right before a lease is handed out, in case
//! submission-time counts were stale.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use reeldub_core::{RdConfig, RdError, RdResult};
use reeldub_store::models::{AuditOutcome, AuditRecord, QuotaRecord, Role};
use reeldub_store::AuditStore;
use serde::{Deserialize, Serialize};

/// Whether a CUDA device is available to dispatch onto. The job
/// substrate itself has no business probing hardware; it asks this
/// trait, the same way it asks `VoiceEmbedder` to embed audio or
/// `StageRunner` to run a pipeline stage.
#[async_trait]
pub trait GpuProbe: Send + Sync {
    async fn available(&self) -> bool;
}

/// Always reports no GPU. The honest default until a real probe
/// (`nvidia-smi`, a CUDA driver binding) is wired in by the binary.
pub struct NoGpuProbe;

#[async_trait]
impl GpuProbe for NoGpuProbe {
    async fn available(&self) -> bool {
        false
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct UserJobCounts {
    pub running: i64,
    pub queued: i64,
    pub today: i64,
}

/// A user's effective running/queued caps, folding role defaults with
/// any per-user quota override.
pub fn resolve_limits_for_user(config: &RdConfig, role: Role, quota: Option<&QuotaRecord>) -> (i64, i64) {
    let mut max_running = config.max_concurrent_jobs_per_user as i64;
    let mut max_queued = config.max_queued_jobs_per_user as i64;

    if role.is_admin() && quota.is_none() {
        return (max_running, max_queued);
    }
    if let Some(q) = quota {
        if let Some(v) = q.max_concurrent_jobs {
            max_running = v.max(0);
        }
        if let Some(v) = q.max_queued_jobs {
            max_queued = v.max(0);
        }
    }
    (max_running, max_queued)
}

/// Cheap pre-check the scheduler runs before a dispatch decision gets as
/// far as a full [`PolicyEngine::evaluate_dispatch`] call: is this user
/// already at their resolved concurrent-job cap? Kept as its own
/// function (rather than inlined in `evaluate_dispatch`) so both the
/// scheduler and any other dispatch-adjacent caller enforce the exact
/// same cap comparison `resolve_limits_for_user` resolves.
pub fn require_concurrent_jobs(config: &RdConfig, role: Role, running: i64, quota: Option<&QuotaRecord>) -> RdResult<()> {
    let (max_running, _) = resolve_limits_for_user(config, role, quota);
    if !role.is_admin() && max_running > 0 && running >= max_running {
        return Err(RdError::quota("per-user concurrent job cap reached", "user_running_cap").into());
    }
    Ok(())
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmissionDecision {
    pub ok: bool,
    pub status_code: u16,
    pub detail: String,
    pub effective_mode: String,
    pub effective_device: String,
    pub reasons: Vec<String>,
    pub counts: UserJobCounts,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchDecision {
    pub ok: bool,
    pub reasons: Vec<String>,
    pub retry_after_s: Option<f64>,
}

pub struct PolicyEngine {
    config: Arc<RdConfig>,
    audit: Arc<dyn AuditStore>,
    gpu: Arc<dyn GpuProbe>,
}

impl PolicyEngine {
    pub fn new(config: Arc<RdConfig>, audit: Arc<dyn AuditStore>, gpu: Arc<dyn GpuProbe>) -> Self {
        Self { config, audit, gpu }
    }

    async fn emit_audit(&self, action: &str, outcome: AuditOutcome, user_id: &str, job_id: Option<&str>, reason: Option<&str>, detail: serde_json::Value) {
        let record = AuditRecord {
            id: reeldub_core::ids::short_id(20),
            ts: Utc::now(),
            actor_user_id: Some(user_id.to_string()),
            action: action.to_string(),
            outcome,
            reason: reason.map(|s| s.to_string()),
            job_id: job_id.map(|s| s.to_string()),
            detail,
        };
        if let Err(e) = self.audit.append(&record).await {
            tracing::warn!(error = %e, action, "policy audit append failed");
        }
        tracing::info!(action, user_id, job_id = ?job_id, outcome = outcome.as_str(), "policy decision");
    }

    /// Submission-time admission check. No side effects beyond
    /// best-effort audit logging — never blocks the caller on its own
    /// failure.
    pub async fn evaluate_submission(
        &self,
        user_id: &str,
        role: Role,
        requested_mode: &str,
        requested_device: &str,
        counts: UserJobCounts,
        quota: Option<&QuotaRecord>,
        job_id: Option<&str>,
    ) -> SubmissionDecision {
        let mut mode = requested_mode.trim().to_lowercase();
        let mut device = requested_device.trim().to_lowercase();
        if mode.is_empty() {
            mode = "medium".to_string();
        }
        if device.is_empty() {
            device = "auto".to_string();
        }

        let (max_running, max_queued) = resolve_limits_for_user(&self.config, role, quota);
        let daily_cap = self.config.jobs_per_day_per_user as i64;

        let mut reasons = Vec::new();

        if mode == "high" && self.config.high_mode_admin_only && !role.is_admin() {
            reasons.push("high_mode_admin_only".to_string());
            self.emit_audit(
                "policy.job_rejected",
                AuditOutcome::Deny,
                user_id,
                job_id,
                Some("high_mode_admin_only"),
                serde_json::json!({ "requested_mode": requested_mode, "requested_device": requested_device }),
            )
            .await;
            return SubmissionDecision {
                ok: false,
                status_code: 403,
                detail: "high mode is restricted to admin".to_string(),
                effective_mode: mode,
                effective_device: device,
                reasons,
                counts,
            };
        }

        if device == "cuda" && !self.gpu.available().await {
            reasons.push("gpu_unavailable_device_downgrade".to_string());
            device = "cpu".to_string();
            if mode == "high" {
                reasons.push("gpu_unavailable_mode_downgrade".to_string());
                mode = "medium".to_string();
            }
        }

        if daily_cap > 0 && counts.today >= daily_cap && !role.is_admin() {
            reasons.push("daily_job_cap".to_string());
            self.emit_audit(
                "policy.job_rejected",
                AuditOutcome::Deny,
                user_id,
                job_id,
                Some("daily_job_cap"),
                serde_json::json!({ "daily_cap": daily_cap, "today": counts.today }),
            )
            .await;
            return SubmissionDecision {
                ok: false,
                status_code: 429,
                detail: format!("daily job cap exceeded (limit={daily_cap})"),
                effective_mode: mode,
                effective_device: device,
                reasons,
                counts,
            };
        }

        if !role.is_admin() && max_queued > 0 && counts.queued >= max_queued {
            reasons.push("user_queued_cap".to_string());
            self.emit_audit(
                "policy.job_rejected",
                AuditOutcome::Deny,
                user_id,
                job_id,
                Some("user_queued_cap"),
                serde_json::json!({ "running": counts.running, "queued": counts.queued, "max_running": max_running, "max_queued": max_queued }),
            )
            .await;
            return SubmissionDecision {
                ok: false,
                status_code: 429,
                detail: format!("too many queued jobs (queued={}, limit={max_queued})", counts.queued),
                effective_mode: mode,
                effective_device: device,
                reasons,
                counts,
            };
        }

        self.emit_audit(
            "policy.job_accepted",
            AuditOutcome::Allow,
            user_id,
            job_id,
            None,
            serde_json::json!({
                "running": counts.running, "queued": counts.queued,
                "effective_mode": mode, "effective_device": device, "reasons": reasons,
            }),
        )
        .await;

        SubmissionDecision {
            ok: true,
            status_code: 200,
            detail: "ok".to_string(),
            effective_mode: mode,
            effective_device: device,
            reasons,
            counts,
        }
    }

    /// Dispatch-time safety net, re-checked right before a lease is
    /// handed out. Uses the same [`resolve_limits_for_user`] as
    /// submission so the two can never disagree.
    pub async fn evaluate_dispatch(
        &self,
        user_id: &str,
        role: Role,
        requested_mode: &str,
        running: i64,
        global_high_running: i64,
        quota: Option<&QuotaRecord>,
    ) -> DispatchDecision {
        let mode = requested_mode.trim().to_lowercase();
        let mode = if mode.is_empty() { "medium".to_string() } else { mode };

        if mode == "high" && self.config.high_mode_admin_only && !role.is_admin() {
            self.emit_audit(
                "policy.dispatch_deferred",
                AuditOutcome::Deny,
                user_id,
                None,
                Some("high_mode_admin_only"),
                serde_json::json!({ "requested_mode": requested_mode }),
            )
            .await;
            return DispatchDecision {
                ok: false,
                reasons: vec!["high_mode_admin_only".to_string()],
                retry_after_s: Some(60.0),
            };
        }

        if require_concurrent_jobs(&self.config, role, running, quota).is_err() {
            let (max_running, _) = resolve_limits_for_user(&self.config, role, quota);
            self.emit_audit(
                "policy.dispatch_deferred",
                AuditOutcome::Deny,
                user_id,
                None,
                Some("user_running_cap"),
                serde_json::json!({ "running": running, "max_running": max_running }),
            )
            .await;
            return DispatchDecision {
                ok: false,
                reasons: vec!["user_running_cap".to_string()],
                retry_after_s: Some(5.0),
            };
        }

        let max_high_global = self.config.max_high_running_global as i64;
        if mode == "high" && max_high_global > 0 && global_high_running >= max_high_global {
            self.emit_audit(
                "policy.dispatch_deferred",
                AuditOutcome::Deny,
                user_id,
                None,
                Some("global_high_running_cap"),
                serde_json::json!({ "global_high_running": global_high_running, "max_high_global": max_high_global }),
            )
            .await;
            return DispatchDecision {
                ok: false,
                reasons: vec!["global_high_running_cap".to_string()],
                retry_after_s: Some(10.0),
            };
        }

        self.emit_audit(
            "policy.dispatch_allowed",
            AuditOutcome::Allow,
            user_id,
            None,
            None,
            serde_json::json!({ "running": running, "global_high_running": global_high_running, "mode": mode }),
        )
        .await;
        DispatchDecision { ok: true, reasons: Vec::new(), retry_after_s: None }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reeldub_core::config::{QueueBackendKind, RemoteAccessMode};
    use std::path::PathBuf;
    use std::time::Duration;
    use tokio::sync::Mutex;

    #[derive(Default)]
    struct FakeAuditStore {
        records: Mutex<Vec<AuditRecord>>,
    }

    #[async_trait]
    impl AuditStore for FakeAuditStore {
        async fn append(&self, record: &AuditRecord) -> reeldub_core::RdResult<()> {
            self.records.lock().await.push(record.clone());
            Ok(())
        }

        async fn list_for_job(&self, _job_id: &str) -> reeldub_core::RdResult<Vec<AuditRecord>> {
            Ok(Vec::new())
        }
    }

    fn test_config() -> RdConfig {
        RdConfig {
            host: "127.0.0.1".to_string(),
            port: 8080,
            output_dir: PathBuf::from("/tmp/out"),
            input_dir: PathBuf::from("/tmp/in"),
            log_dir: PathBuf::from("/tmp/log"),
            state_dir: PathBuf::from("/tmp/state"),
            voice_store_root: PathBuf::from("/tmp/voices"),
            remote_access_mode: RemoteAccessMode::Off,
            allow_legacy_token_login: false,
            cookie_secure: true,
            jobs_db_path: PathBuf::from("/tmp/state/jobs.db"),
            auth_db_path: PathBuf::from("/tmp/state/auth.db"),
            jwt_secret: "test-secret-test-secret".to_string(),
            jwt_issuer: "reeldub".to_string(),
            jwt_audience: "reeldub-api".to_string(),
            access_token_ttl: Duration::from_secs(900),
            refresh_token_ttl: Duration::from_secs(1_209_600),
            session_cookie_ttl: Duration::from_secs(86_400),
            max_upload_bytes: 1 << 30,
            max_storage_bytes_per_user: 1 << 30,
            jobs_per_day_per_user: 3,
            max_concurrent_jobs_per_user: 1,
            max_queued_jobs_per_user: 2,
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

    fn engine() -> PolicyEngine {
        PolicyEngine::new(
            Arc::new(test_config()),
            Arc::new(FakeAuditStore::default()),
            Arc::new(NoGpuProbe),
        )
    }

    #[test]
    fn resolve_limits_applies_quota_override() {
        let config = test_config();
        let quota = QuotaRecord {
            user_id: "u1".to_string(),
            max_upload_bytes: None,
            max_storage_bytes: None,
            jobs_per_day: None,
            max_concurrent_jobs: Some(5),
            max_queued_jobs: Some(9),
            max_processing_minutes_per_day: None,
        };
        let (running, queued) = resolve_limits_for_user(&config, Role::Editor, Some(&quota));
        assert_eq!((running, queued), (5, 9));

        let (running, queued) = resolve_limits_for_user(&config, Role::Editor, None);
        assert_eq!((running, queued), (1, 2));
    }

    #[test]
    fn admin_without_quota_override_is_unbounded_by_role_defaults() {
        let config = test_config();
        let (running, queued) = resolve_limits_for_user(&config, Role::Admin, None);
        assert_eq!((running, queued), (1, 2));
    }

    #[tokio::test]
    async fn high_mode_is_rejected_for_non_admin() {
        let decision = engine()
            .evaluate_submission(
                "u1",
                Role::Editor,
                "high",
                "cpu",
                UserJobCounts::default(),
                None,
                None,
            )
            .await;
        assert!(!decision.ok);
        assert_eq!(decision.status_code, 403);
        assert!(decision.reasons.contains(&"high_mode_admin_only".to_string()));
    }

    #[tokio::test]
    async fn cuda_request_downgrades_when_gpu_unavailable() {
        let decision = engine()
            .evaluate_submission(
                "u1",
                Role::Editor,
                "high",
                "cuda",
                UserJobCounts::default(),
                None,
                None,
            )
            .await;
        assert!(!decision.ok);
        assert_eq!(decision.status_code, 403);
        assert_eq!(decision.effective_device, "cpu");
    }

    #[tokio::test]
    async fn queued_cap_rejects_once_exceeded() {
        let counts = UserJobCounts { running: 0, queued: 2, today: 0 };
        let decision = engine()
            .evaluate_submission("u1", Role::Editor, "medium", "cpu", counts, None, None)
            .await;
        assert!(!decision.ok);
        assert_eq!(decision.status_code, 429);
        assert!(decision.reasons.contains(&"user_queued_cap".to_string()));
    }

    #[tokio::test]
    async fn dispatch_applies_retry_after_tiers() {
        let e = engine();
        let d = e.evaluate_dispatch("u1", Role::Editor, "high", 0, 0, None).await;
        assert_eq!(d.retry_after_s, Some(60.0));

        let d = e.evaluate_dispatch("u1", Role::Editor, "medium", 1, 0, None).await;
        assert_eq!(d.retry_after_s, Some(5.0));

        let d = e.evaluate_dispatch("u1", Role::Admin, "high", 0, 1, None).await;
        assert_eq!(d.retry_after_s, Some(10.0));
    }
}
