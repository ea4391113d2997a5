//! Admin-only queue visibility and per-user quota overrides.

use axum::extract::{Path, State};
use axum::routing::{get, put};
use axum::{Json, Router};
use reeldub_auth::rbac::require_role_at_least;
use reeldub_queue::GlobalCounters;
use reeldub_store::models::{QuotaRecord, Role};
use serde::Deserialize;

use crate::error::RdWebResult;
use crate::extract::AuthenticatedIdentity;
use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/admin/queue", get(queue_overview))
        .route("/admin/users/{id}/quotas", put(put_quotas))
}

async fn queue_overview(State(state): State<AppState>, identity: AuthenticatedIdentity) -> RdWebResult<Json<GlobalCounters>> {
    require_role_at_least(&identity.0, Role::Admin)?;
    let counters = state.queue.global_counters().await?;
    Ok(Json(counters))
}

#[derive(Deserialize)]
struct QuotaUpdateRequest {
    max_upload_bytes: Option<i64>,
    max_storage_bytes: Option<i64>,
    jobs_per_day: Option<i64>,
    max_concurrent_jobs: Option<i64>,
    max_queued_jobs: Option<i64>,
    max_processing_minutes_per_day: Option<i64>,
}

async fn put_quotas(
    State(state): State<AppState>,
    identity: AuthenticatedIdentity,
    Path(user_id): Path<String>,
    Json(body): Json<QuotaUpdateRequest>,
) -> RdWebResult<Json<QuotaRecord>> {
    require_role_at_least(&identity.0, Role::Admin)?;
    let record = QuotaRecord {
        user_id,
        max_upload_bytes: body.max_upload_bytes,
        max_storage_bytes: body.max_storage_bytes,
        jobs_per_day: body.jobs_per_day,
        max_concurrent_jobs: body.max_concurrent_jobs,
        max_queued_jobs: body.max_queued_jobs,
        max_processing_minutes_per_day: body.max_processing_minutes_per_day,
    };
    state.store.quotas.upsert(&record).await?;
    Ok(Json(record))
}
