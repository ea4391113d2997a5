//! Job lifecycle: create, list, fetch, cancel, admin reprioritize/kill/
//! requeue, log tail, per-job timeline, and artifact enumeration.

use std::path::PathBuf;
use std::time::Duration;

use axum::extract::{Path, Query, State};
use axum::response::sse::{Event, Sse};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Utc;
use rand::Rng;
use reeldub_auth::{is_visible, rbac};
use reeldub_core::{ids, RdError};
use reeldub_queue::JobPriority;
use reeldub_store::models::{AuditOutcome, AuditRecord, Job, JobDevice, JobFilter, JobMode, JobOrder, JobPatch, JobState, Role, Visibility};
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::error::RdWebResult;
use crate::extract::{AuthenticatedIdentity, ALLOW_SHARED_READ};
use crate::state::AppState;

const DISPATCH_PHASE: &str = "dispatch";

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/jobs", post(create_job).get(list_jobs))
        .route("/jobs/{id}", get(get_job))
        .route("/jobs/{id}/cancel", post(cancel_job))
        .route("/jobs/{id}/priority", post(set_priority))
        .route("/jobs/{id}/kill", post(kill_job))
        .route("/jobs/{id}/requeue", post(requeue_job))
        .route("/jobs/{id}/logs/tail", get(logs_tail))
        .route("/jobs/{id}/logs/stream", get(logs_stream))
        .route("/jobs/{id}/timeline", get(timeline))
        .route("/jobs/{id}/files", get(files))
}

/// The caller-facing projection of a [`Job`]. Drops `work_dir`/`log_path`,
/// which are server-internal filesystem locations, not API-visible state.
#[derive(Serialize)]
struct JobView {
    id: String,
    owner_id: String,
    video_path: String,
    duration_s: Option<f64>,
    mode: &'static str,
    device: &'static str,
    src_lang: String,
    tgt_lang: String,
    series_title: String,
    series_slug: String,
    season_number: i64,
    episode_number: i64,
    visibility: &'static str,
    created_at: chrono::DateTime<Utc>,
    updated_at: chrono::DateTime<Utc>,
    state: &'static str,
    progress: f64,
    message: String,
    error: Option<String>,
    output_mkv: Option<String>,
    output_srt: Option<String>,
    runtime: serde_json::Value,
}

impl From<Job> for JobView {
    fn from(j: Job) -> Self {
        Self {
            id: j.id,
            owner_id: j.owner_id,
            video_path: j.video_path,
            duration_s: j.duration_s,
            mode: j.mode.as_str(),
            device: j.device.as_str(),
            src_lang: j.src_lang,
            tgt_lang: j.tgt_lang,
            series_title: j.series_title,
            series_slug: j.series_slug,
            season_number: j.season_number,
            episode_number: j.episode_number,
            visibility: j.visibility.as_str(),
            created_at: j.created_at,
            updated_at: j.updated_at,
            state: j.state.as_str(),
            progress: j.progress,
            message: j.message,
            error: j.error,
            output_mkv: j.output_mkv,
            output_srt: j.output_srt,
            runtime: j.runtime,
        }
    }
}

/// Applies the ready-queue backpressure rule to a newly-admitted job's
/// mode, ahead of persisting it. Degrades `high`→`medium`→`low` as the
/// ready queue grows past `backpressure_q_max`; once already at `low`,
/// there's nowhere further to degrade to, so instead returns a dispatch
/// defer delay (seconds) the caller sleeps before committing the job to
/// the queue. Logs and audits the decision whenever it changes anything.
async fn apply_backpressure(state: &AppState, owner_id: &str, mode: JobMode) -> RdWebResult<(JobMode, f64)> {
    let qlen = state.queue.global_counters().await?.queued;
    let max = state.config.backpressure_q_max as i64;
    if qlen <= max {
        return Ok((mode, 0.0));
    }

    let (to_mode, defer_s) = match mode.degrade() {
        Some(degraded) => (degraded, 0.0),
        None => {
            let jitter = rand::thread_rng().gen_range(0.0..0.75);
            let delay = (0.5 + (qlen - max) as f64 * 0.75 + jitter).min(30.0);
            (mode, delay)
        }
    };

    tracing::warn!(
        from_mode = mode.as_str(),
        to_mode = to_mode.as_str(),
        qlen,
        defer_s,
        "backpressure_degrade"
    );
    let record = AuditRecord {
        id: ids::short_id(20),
        ts: Utc::now(),
        actor_user_id: Some(owner_id.to_string()),
        action: "backpressure_degrade".to_string(),
        outcome: AuditOutcome::Degrade,
        reason: None,
        job_id: None,
        detail: json!({ "from_mode": mode.as_str(), "to_mode": to_mode.as_str(), "qlen": qlen, "backpressure_q_max": max, "defer_s": defer_s }),
    };
    if let Err(e) = state.store.audit.append(&record).await {
        tracing::warn!(error = %e, "backpressure audit append failed");
    }

    Ok((to_mode, defer_s))
}

async fn visible_job_or_404(state: &AppState, identity: &AuthenticatedIdentity, job_id: &str) -> RdWebResult<Job> {
    let job = state.store.jobs.get(job_id).await?.ok_or_else(|| RdError::not_found("job not found"))?;
    if !is_visible(&identity.0, &job.owner_id, job.visibility, ALLOW_SHARED_READ) {
        return Err(RdError::forbidden("job is not visible to this caller").into());
    }
    Ok(job)
}

#[derive(Deserialize)]
struct CreateJobRequest {
    video_path: String,
    duration_s: Option<f64>,
    #[serde(default = "default_mode")]
    mode: String,
    #[serde(default = "default_device")]
    device: String,
    src_lang: String,
    tgt_lang: String,
    series_title: String,
    season_number: i64,
    episode_number: i64,
    #[serde(default)]
    visibility: Option<String>,
}

fn default_mode() -> String {
    "medium".to_string()
}

fn default_device() -> String {
    "auto".to_string()
}

async fn create_job(State(state): State<AppState>, identity: AuthenticatedIdentity, Json(body): Json<CreateJobRequest>) -> RdWebResult<Json<JobView>> {
    let identity = identity.0;
    rbac::require_scope(&identity, rbac::SCOPE_SUBMIT_JOB)?;

    let owner_id = identity.user.id.clone();
    let role = identity.user.role;
    let quota = state.store.quotas.get(&owner_id).await?;

    // Atomically reserves today's slot in the queue backend so a burst of
    // concurrent submissions from the same user can't all read the same
    // stale daily count and all pass the cap; released below on rejection
    // or persist failure, left in place on success.
    let today_key = Utc::now().date_naive().to_string();
    let (daily_reservation, today_after) = state.queue.reserve_daily_jobs(&owner_id, &today_key).await?;

    let counts = reeldub_policy::UserJobCounts {
        running: state.store.jobs.count_active(&owner_id).await?,
        queued: state.store.jobs.count_queued(&owner_id).await?,
        today: today_after - 1,
    };

    let decision = state.policy.evaluate_submission(&owner_id, role, &body.mode, &body.device, counts, quota.as_ref(), None).await;
    if !decision.ok {
        state.queue.release_daily_jobs(daily_reservation).await?;
        let kind = if decision.status_code == 403 { reeldub_core::ErrorKind::Forbidden } else { reeldub_core::ErrorKind::Quota };
        let mut err = RdError::new(kind, decision.detail);
        if let Some(reason) = decision.reasons.first() {
            err = err.with_reason(reason.clone());
        }
        return Err(err.into());
    }

    let mode = JobMode::parse(&decision.effective_mode).unwrap_or(JobMode::Medium);
    let device = JobDevice::parse(&decision.effective_device).unwrap_or(JobDevice::Auto);
    let visibility = body
        .visibility
        .as_deref()
        .and_then(Visibility::parse)
        .unwrap_or(Visibility::Private);
    let series_slug = reeldub_core::slug::slugify(&body.series_title);

    let (mode, backpressure_defer_s) = apply_backpressure(&state, &owner_id, mode).await?;

    let token = state.queue.reserve_submit(&owner_id, DISPATCH_PHASE).await?;

    let job_id = ids::new_job_id();
    let now = Utc::now();
    let work_dir = state.config.output_dir.join(&job_id).join("work");
    let log_path = state.config.output_dir.join(&job_id).join("logs").join("job.log");
    if let Err(e) = tokio::fs::create_dir_all(&work_dir).await {
        state.queue.release(token).await?;
        state.queue.release_daily_jobs(daily_reservation).await?;
        return Err(RdError::internal("creating job work directory").with_source(e.into()).into());
    }
    if let Some(parent) = log_path.parent() {
        if let Err(e) = tokio::fs::create_dir_all(parent).await {
            state.queue.release(token).await?;
            state.queue.release_daily_jobs(daily_reservation).await?;
            return Err(RdError::internal("creating job log directory").with_source(e.into()).into());
        }
    }

    let job = Job {
        id: job_id.clone(),
        owner_id: owner_id.clone(),
        video_path: body.video_path,
        duration_s: body.duration_s,
        mode,
        device,
        src_lang: body.src_lang,
        tgt_lang: body.tgt_lang,
        series_title: body.series_title,
        series_slug,
        season_number: body.season_number,
        episode_number: body.episode_number,
        visibility,
        created_at: now,
        updated_at: now,
        state: JobState::Queued,
        progress: 0.0,
        message: "queued".to_string(),
        error: None,
        output_mkv: None,
        output_srt: None,
        work_dir: work_dir.to_string_lossy().into_owned(),
        log_path: log_path.to_string_lossy().into_owned(),
        storage_bytes: 0,
        runtime: json!({ "policy_reasons": decision.reasons }),
    };

    if let Err(e) = state.store.jobs.put(&job).await {
        state.queue.release(token).await?;
        state.queue.release_daily_jobs(daily_reservation).await?;
        return Err(e.into());
    }
    if backpressure_defer_s > 0.0 {
        tokio::time::sleep(Duration::from_secs_f64(backpressure_defer_s)).await;
    }
    state.queue.commit(token, &job.id, JobPriority::from_mode(mode.as_str()), DISPATCH_PHASE).await?;

    Ok(Json(job.into()))
}

#[derive(Deserialize)]
struct ListQuery {
    state: Option<String>,
    series_slug: Option<String>,
    limit: Option<i64>,
    offset: Option<i64>,
}

async fn list_jobs(State(state): State<AppState>, identity: AuthenticatedIdentity, Query(q): Query<ListQuery>) -> RdWebResult<Json<Vec<JobView>>> {
    let filter = JobFilter {
        owner_id: None,
        states: q.state.as_deref().and_then(JobState::parse).map(|s| vec![s]),
        series_slug: q.series_slug,
        visibility: None,
    };
    let jobs = state.store.jobs.list(&filter, JobOrder::UpdatedDesc, q.limit.unwrap_or(200), q.offset.unwrap_or(0)).await?;
    let visible = jobs
        .into_iter()
        .filter(|j| is_visible(&identity.0, &j.owner_id, j.visibility, ALLOW_SHARED_READ))
        .map(JobView::from)
        .collect();
    Ok(Json(visible))
}

async fn get_job(State(state): State<AppState>, identity: AuthenticatedIdentity, Path(job_id): Path<String>) -> RdWebResult<Json<JobView>> {
    let job = visible_job_or_404(&state, &identity, &job_id).await?;
    Ok(Json(job.into()))
}

async fn cancel_job(State(state): State<AppState>, identity: AuthenticatedIdentity, Path(job_id): Path<String>) -> RdWebResult<Json<serde_json::Value>> {
    let job = state.store.jobs.get(&job_id).await?.ok_or_else(|| RdError::not_found("job not found"))?;
    rbac::require_owner_or_admin(&identity.0, &job.owner_id)?;
    if job.state.is_terminal() {
        return Err(RdError::conflict("job is already in a terminal state").into());
    }
    state.scheduler.cancel(&job_id).await?;
    Ok(Json(json!({ "state": "canceling" })))
}

#[derive(Deserialize)]
struct PriorityRequest {
    priority: String,
}

async fn set_priority(
    State(state): State<AppState>,
    identity: AuthenticatedIdentity,
    Path(job_id): Path<String>,
    Json(body): Json<PriorityRequest>,
) -> RdWebResult<Json<serde_json::Value>> {
    rbac::require_role_at_least(&identity.0, Role::Admin)?;
    let priority = match body.priority.as_str() {
        "low" => JobPriority::Low,
        "normal" => JobPriority::Normal,
        "high" => JobPriority::High,
        _ => return Err(RdError::validation("priority must be low, normal, or high").into()),
    };
    state.queue.set_priority(&job_id, priority).await?;
    Ok(Json(json!({ "priority": priority.name() })))
}

async fn kill_job(State(state): State<AppState>, identity: AuthenticatedIdentity, Path(job_id): Path<String>) -> RdWebResult<Json<serde_json::Value>> {
    rbac::require_role_at_least(&identity.0, Role::Admin)?;
    let job = state.store.jobs.get(&job_id).await?.ok_or_else(|| RdError::not_found("job not found"))?;
    if job.state.is_terminal() {
        return Err(RdError::conflict("job is already in a terminal state").into());
    }
    state.scheduler.cancel(&job_id).await?;
    // Hard kill does not wait for cooperative teardown: force the
    // terminal transition now, leaving any unkilled subprocess as an
    // orphan for the runner to mop up on next startup.
    let refreshed = state.store.jobs.get(&job_id).await?.ok_or_else(|| RdError::not_found("job not found"))?;
    if !refreshed.state.is_terminal() {
        state.store.jobs.update(&job_id, JobPatch { state: Some(JobState::Canceled), ..Default::default() }).await?;
    }
    Ok(Json(json!({ "state": "CANCELED" })))
}

async fn requeue_job(State(state): State<AppState>, identity: AuthenticatedIdentity, Path(job_id): Path<String>) -> RdWebResult<Json<JobView>> {
    rbac::require_role_at_least(&identity.0, Role::Admin)?;
    let job = state.store.jobs.get(&job_id).await?.ok_or_else(|| RdError::not_found("job not found"))?;
    if !job.state.is_terminal() {
        return Err(RdError::conflict("requeue is only valid from a terminal state").into());
    }

    let mut runtime = job.runtime.clone();
    let requeued_from = json!({ "state": job.state.as_str(), "at": Utc::now() });
    match runtime.as_object_mut() {
        Some(obj) => {
            obj.insert("requeued_from".to_string(), requeued_from);
        }
        None => runtime = json!({ "requeued_from": requeued_from }),
    }

    let patch = JobPatch {
        state: Some(JobState::Queued),
        progress: Some(0.0),
        error: Some(None),
        runtime: Some(runtime),
        is_admin_requeue: true,
        ..Default::default()
    };
    let requeued = state.store.jobs.update(&job_id, patch).await?;

    let token = state.queue.reserve_submit(&requeued.owner_id, DISPATCH_PHASE).await?;
    state.queue.commit(token, &requeued.id, JobPriority::from_mode(requeued.mode.as_str()), DISPATCH_PHASE).await?;

    Ok(Json(requeued.into()))
}

#[derive(Deserialize)]
struct TailQuery {
    n: Option<usize>,
}

async fn logs_tail(
    State(state): State<AppState>,
    identity: AuthenticatedIdentity,
    Path(job_id): Path<String>,
    Query(q): Query<TailQuery>,
) -> RdWebResult<Json<Vec<String>>> {
    let job = visible_job_or_404(&state, &identity, &job_id).await?;
    let lines = reeldub_events::tail_lines(std::path::Path::new(&job.log_path), q.n.unwrap_or(200)).await?;
    Ok(Json(lines))
}

async fn logs_stream(
    State(state): State<AppState>,
    identity: AuthenticatedIdentity,
    Path(job_id): Path<String>,
) -> RdWebResult<Sse<impl futures_core::Stream<Item = Result<Event, axum::Error>>>> {
    let job = visible_job_or_404(&state, &identity, &job_id).await?;
    let log_path = PathBuf::from(&job.log_path);
    let stream = reeldub_events::stream_log(state.store.jobs.clone(), job_id, log_path, std::time::Duration::from_millis(750));
    let events = tokio_stream::StreamExt::map(stream, |line| match line {
        Ok(text) => Ok(Event::default().data(text)),
        Err(e) => Err(axum::Error::new(e)),
    });
    Ok(Sse::new(events))
}

async fn timeline(State(state): State<AppState>, identity: AuthenticatedIdentity, Path(job_id): Path<String>) -> RdWebResult<Json<Vec<AuditRecord>>> {
    visible_job_or_404(&state, &identity, &job_id).await?;
    let records = state.store.audit.list_for_job(&job_id).await?;
    Ok(Json(records))
}

#[derive(Serialize)]
struct ArtifactEntry {
    path: String,
    size_bytes: u64,
}

async fn files(State(state): State<AppState>, identity: AuthenticatedIdentity, Path(job_id): Path<String>) -> RdWebResult<Json<Vec<ArtifactEntry>>> {
    let job = visible_job_or_404(&state, &identity, &job_id).await?;
    let root = PathBuf::from(&job.work_dir).parent().map(|p| p.to_path_buf()).unwrap_or_else(|| PathBuf::from(&job.work_dir));
    Ok(Json(walk_artifacts(&root).await?))
}

/// Iteratively walks `root` (no async recursion) and returns every
/// regular file under it with a root-relative path.
async fn walk_artifacts(root: &std::path::Path) -> RdWebResult<Vec<ArtifactEntry>> {
    let mut out = Vec::new();
    let mut stack = vec![root.to_path_buf()];
    while let Some(dir) = stack.pop() {
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(e) => e,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
            Err(e) => return Err(RdError::internal("reading job artifact directory").with_source(e.into()).into()),
        };
        while let Some(entry) = entries.next_entry().await.map_err(|e| RdError::internal("reading job artifact directory").with_source(e.into()))? {
            let path = entry.path();
            let metadata = entry.metadata().await.map_err(|e| RdError::internal("reading job artifact metadata").with_source(e.into()))?;
            if metadata.is_dir() {
                stack.push(path);
            } else {
                let relative = path.strip_prefix(root).unwrap_or(&path).to_string_lossy().into_owned();
                out.push(ArtifactEntry { path: relative, size_bytes: metadata.len() });
            }
        }
    }
    Ok(out)
}
