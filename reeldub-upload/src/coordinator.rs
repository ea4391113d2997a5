//! Drives the three-endpoint resumable upload protocol: init, chunk,
//! complete. Each accepted chunk is appended to a sidecar file under
//! `input_dir/.incoming/`; `complete` renames that sidecar into the
//! canonical input path and marks the session finalized.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{Duration as ChronoDuration, Utc};
use reeldub_core::ids::new_upload_id;
use reeldub_core::{RdConfig, RdError, RdResult};
use reeldub_store::models::UploadSession;
use reeldub_store::{JobStore, QuotaStore, UploadStore};
use sha2::{Digest, Sha256};
use tokio::fs::OpenOptions;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::quota::{require_upload_bytes, require_upload_progress, resolve_upload_limits};

/// Small allowance above the server-chosen chunk size so a client whose
/// read buffer rounds up slightly doesn't get a spurious rejection.
const CHUNK_SLACK_BYTES: i64 = 16 * 1024;

pub struct UploadCoordinator {
    uploads: Arc<dyn UploadStore>,
    quotas: Arc<dyn QuotaStore>,
    jobs: Arc<dyn JobStore>,
    config: Arc<RdConfig>,
}

impl UploadCoordinator {
    pub fn new(uploads: Arc<dyn UploadStore>, quotas: Arc<dyn QuotaStore>, jobs: Arc<dyn JobStore>, config: Arc<RdConfig>) -> Self {
        Self { uploads, quotas, jobs, config }
    }

    fn incoming_dir(&self) -> PathBuf {
        self.config.input_dir.join(".incoming")
    }

    fn sidecar_path(&self, upload_id: &str) -> PathBuf {
        self.incoming_dir().join(format!("{upload_id}.part"))
    }

    pub async fn init(&self, owner_id: &str, filename: &str, total_bytes: i64, chunk_bytes: i64) -> RdResult<UploadSession> {
        if total_bytes <= 0 {
            return Err(RdError::validation("total_bytes must be positive").into());
        }
        let limits = resolve_upload_limits(&self.config, self.quotas.as_ref(), owner_id).await?;
        let current_storage = self.jobs.user_storage_bytes(owner_id).await?;
        require_upload_bytes(total_bytes as u64, current_storage.max(0) as u64, &limits)?;

        let upload_id = new_upload_id();
        let now = Utc::now();
        let session = UploadSession {
            upload_id: upload_id.clone(),
            owner_id: owner_id.to_string(),
            filename: filename.to_string(),
            total_bytes,
            chunk_bytes,
            received_bytes: 0,
            sha256_partial: None,
            chunks_received: Vec::new(),
            finalized: false,
            video_path: None,
            created_at: now,
            expires_at: now + ChronoDuration::from_std(self.config.upload_session_ttl).unwrap_or_else(|_| ChronoDuration::days(1)),
        };

        tokio::fs::create_dir_all(self.incoming_dir())
            .await
            .map_err(|e| RdError::internal("creating incoming upload directory").with_source(e.into()))?;
        tokio::fs::File::create(self.sidecar_path(&upload_id))
            .await
            .map_err(|e| RdError::internal("creating upload sidecar file").with_source(e.into()))?;

        self.uploads.create(&session).await?;
        tracing::info!(upload_id, owner_id, total_bytes, "upload session started");
        Ok(session)
    }

    pub async fn chunk(&self, upload_id: &str, owner_id: &str, index: i64, offset: i64, body: &[u8], expected_sha256_hex: &str) -> RdResult<UploadSession> {
        let session = self.get(upload_id, owner_id).await?;
        if session.finalized {
            return Err(RdError::conflict("upload already finalized").into());
        }
        if session.chunks_received.contains(&index) {
            return Ok(session);
        }
        if offset != session.received_bytes {
            return Err(RdError::validation("chunk offset does not match received bytes").with_reason("offset_mismatch").into());
        }
        if body.len() as i64 > session.chunk_bytes + CHUNK_SLACK_BYTES {
            return Err(RdError::validation("chunk exceeds the negotiated chunk size").with_reason("chunk_too_large").into());
        }
        if !hex_sha256(body).eq_ignore_ascii_case(expected_sha256_hex) {
            return Err(RdError::validation("chunk content does not match its declared hash").with_reason("chunk_hash_mismatch").into());
        }

        append_to_sidecar(&self.sidecar_path(upload_id), body).await?;
        let updated = self.uploads.record_chunk(upload_id, index, body.len() as i64).await?;

        let limits = resolve_upload_limits(&self.config, self.quotas.as_ref(), owner_id).await?;
        let current_storage = self.jobs.user_storage_bytes(owner_id).await?;
        if let Err(e) = require_upload_progress(updated.received_bytes as u64, current_storage.max(0) as u64, &limits) {
            tracing::warn!(upload_id, owner_id, "upload exceeded storage quota mid-transfer, discarding session");
            let _ = tokio::fs::remove_file(self.sidecar_path(upload_id)).await;
            self.uploads.delete(upload_id).await?;
            return Err(e);
        }
        Ok(updated)
    }

    pub async fn complete(&self, upload_id: &str, owner_id: &str, final_sha256_hex: Option<&str>) -> RdResult<String> {
        let session = self.get(upload_id, owner_id).await?;
        if session.finalized {
            return session.video_path.ok_or_else(|| RdError::internal("finalized upload missing video_path").into());
        }
        if session.received_bytes != session.total_bytes {
            return Err(RdError::validation("upload is incomplete").into());
        }

        let sidecar = self.sidecar_path(upload_id);
        if let Some(expected) = final_sha256_hex {
            let actual = hash_file(&sidecar).await?;
            if !actual.eq_ignore_ascii_case(expected) {
                return Err(RdError::validation("assembled file does not match the declared final hash").into());
            }
        }

        tokio::fs::create_dir_all(&self.config.input_dir)
            .await
            .map_err(|e| RdError::internal("creating input directory").with_source(e.into()))?;
        let canonical = self.config.input_dir.join(canonical_filename(upload_id, &session.filename));
        tokio::fs::rename(&sidecar, &canonical)
            .await
            .map_err(|e| RdError::internal("moving assembled upload into place").with_source(e.into()))?;

        let video_path = canonical.to_string_lossy().into_owned();
        self.uploads.finalize(upload_id, &video_path).await?;
        tracing::info!(upload_id, owner_id, video_path = %video_path, "upload finalized");
        Ok(video_path)
    }

    pub async fn get(&self, upload_id: &str, owner_id: &str) -> RdResult<UploadSession> {
        let session = self.uploads.get(upload_id).await?.ok_or_else(|| RdError::not_found("upload session not found"))?;
        if session.owner_id != owner_id {
            return Err(RdError::forbidden("not the owner of this upload").into());
        }
        Ok(session)
    }
}

fn hex_sha256(body: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(body);
    format!("{:x}", hasher.finalize())
}

async fn hash_file(path: &Path) -> RdResult<String> {
    let mut file = tokio::fs::File::open(path).await.map_err(|e| RdError::internal("reading assembled upload").with_source(e.into()))?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf).await.map_err(|e| RdError::internal("reading assembled upload").with_source(e.into()))?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}

async fn append_to_sidecar(path: &Path, body: &[u8]) -> RdResult<()> {
    let mut file = OpenOptions::new()
        .append(true)
        .open(path)
        .await
        .map_err(|e| RdError::internal("opening upload sidecar file").with_source(e.into()))?;
    file.write_all(body).await.map_err(|e| RdError::internal("writing upload chunk").with_source(e.into()))?;
    Ok(())
}

/// Maps an upload onto a filesystem-safe name: the opaque upload id
/// (already URL-safe) prefixed, plus an extension carried over from the
/// client's filename, stripped of anything that isn't alphanumeric,
/// `.`, `_`, or `-`.
fn canonical_filename(upload_id: &str, client_filename: &str) -> String {
    let ext = Path::new(client_filename).extension().and_then(|e| e.to_str()).unwrap_or("bin");
    let safe_ext: String = ext.chars().filter(|c| c.is_ascii_alphanumeric()).collect();
    format!("{upload_id}.{}", if safe_ext.is_empty() { "bin".to_string() } else { safe_ext })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonical_filename_keeps_extension_and_strips_unsafe_characters() {
        assert_eq!(canonical_filename("up_abc123", "my movie.mkv"), "up_abc123.mkv");
        assert_eq!(canonical_filename("up_abc123", "no_extension"), "up_abc123.bin");
        assert_eq!(canonical_filename("up_abc123", "weird.m;kv"), "up_abc123.mkv");
    }

    #[test]
    fn sha256_hex_matches_a_known_vector() {
        assert_eq!(hex_sha256(b""), "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855");
    }
}
