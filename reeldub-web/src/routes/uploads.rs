//! The three-endpoint resumable upload protocol plus a progress-read
//! endpoint, backed by [`reeldub_upload::UploadCoordinator`].

use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::HeaderMap;
use axum::routing::{get, post};
use axum::{Json, Router};
use reeldub_core::RdError;
use serde::{Deserialize, Serialize};

use crate::error::RdWebResult;
use crate::extract::AuthenticatedIdentity;
use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/uploads/init", post(init))
        .route("/uploads/{id}/chunk", post(chunk))
        .route("/uploads/{id}/complete", post(complete))
        .route("/uploads/{id}", get(get_session))
}

const MIN_CHUNK_BYTES: i64 = 256 * 1024;
const MAX_CHUNK_BYTES: i64 = 4 * 1024 * 1024;
const DEFAULT_CHUNK_BYTES: i64 = 1024 * 1024;

/// Picks a server-chosen chunk size: the default unless the file is
/// small enough that one chunk would comfortably cover it, clamped to
/// the `[256KiB, 4MiB]` range the protocol promises.
fn choose_chunk_bytes(total_bytes: i64) -> i64 {
    DEFAULT_CHUNK_BYTES.clamp(MIN_CHUNK_BYTES, MAX_CHUNK_BYTES).min(total_bytes.max(MIN_CHUNK_BYTES))
}

fn require_uploader(identity: &AuthenticatedIdentity) -> RdWebResult<()> {
    if identity.0.at_least_operator() {
        Ok(())
    } else {
        Err(RdError::forbidden("uploads require operator role or above").into())
    }
}

#[derive(Deserialize)]
struct InitRequest {
    filename: String,
    total_bytes: i64,
    #[allow(dead_code)]
    mime: Option<String>,
}

#[derive(Serialize)]
struct InitResponse {
    upload_id: String,
    chunk_bytes: i64,
}

async fn init(State(state): State<AppState>, identity: AuthenticatedIdentity, Json(body): Json<InitRequest>) -> RdWebResult<Json<InitResponse>> {
    require_uploader(&identity)?;
    let chunk_bytes = choose_chunk_bytes(body.total_bytes);
    let session = state.uploads.init(&identity.0.user.id, &body.filename, body.total_bytes, chunk_bytes).await?;
    Ok(Json(InitResponse { upload_id: session.upload_id, chunk_bytes: session.chunk_bytes }))
}

#[derive(Deserialize)]
struct ChunkQuery {
    index: i64,
    offset: i64,
}

#[derive(Serialize)]
struct SessionView {
    upload_id: String,
    total_bytes: i64,
    chunk_bytes: i64,
    received_bytes: i64,
    finalized: bool,
    video_path: Option<String>,
}

impl From<reeldub_store::models::UploadSession> for SessionView {
    fn from(s: reeldub_store::models::UploadSession) -> Self {
        Self {
            upload_id: s.upload_id,
            total_bytes: s.total_bytes,
            chunk_bytes: s.chunk_bytes,
            received_bytes: s.received_bytes,
            finalized: s.finalized,
            video_path: s.video_path,
        }
    }
}

async fn chunk(
    State(state): State<AppState>,
    identity: AuthenticatedIdentity,
    Path(upload_id): Path<String>,
    Query(q): Query<ChunkQuery>,
    headers: HeaderMap,
    body: Bytes,
) -> RdWebResult<Json<SessionView>> {
    require_uploader(&identity)?;
    let expected_sha256 = headers
        .get("x-chunk-sha256")
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| RdError::validation("missing X-Chunk-Sha256 header"))?;
    let session = state
        .uploads
        .chunk(&upload_id, &identity.0.user.id, q.index, q.offset, &body, expected_sha256)
        .await?;
    Ok(Json(session.into()))
}

#[derive(Deserialize)]
struct CompleteRequest {
    final_sha256: Option<String>,
}

#[derive(Serialize)]
struct CompleteResponse {
    video_path: String,
}

async fn complete(
    State(state): State<AppState>,
    identity: AuthenticatedIdentity,
    Path(upload_id): Path<String>,
    Json(body): Json<CompleteRequest>,
) -> RdWebResult<Json<CompleteResponse>> {
    require_uploader(&identity)?;
    let video_path = state.uploads.complete(&upload_id, &identity.0.user.id, body.final_sha256.as_deref()).await?;
    Ok(Json(CompleteResponse { video_path }))
}

async fn get_session(State(state): State<AppState>, identity: AuthenticatedIdentity, Path(upload_id): Path<String>) -> RdWebResult<Json<SessionView>> {
    let session = state.uploads.get(&upload_id, &identity.0.user.id).await?;
    Ok(Json(session.into()))
}
