//! reeldub-checkpoint: crash-safe per-stage checkpoint persistence.
//!
//! A dubbing job's checkpoint is a single JSON file under its work
//! directory recording, per stage, whether the stage ran, was skipped
//! because its artifacts were already valid, or is in progress, plus an
//! append-only event log. Every write lands via a temp-file-then-rename
//! so a crash mid-write never corrupts the file the next run reads.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use reeldub_core::{RdError, RdResult};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

const CHECKPOINT_FILE: &str = "checkpoint.json";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    Started,
    Done,
    Skipped,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageRecord {
    pub status: StageStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    /// sha256 of each artifact this stage produced, keyed by path. Used
    /// to re-validate that a `Skipped` stage's output hasn't been
    /// tampered with or deleted since the checkpoint was written.
    pub artifact_hashes: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointEvent {
    pub ts: DateTime<Utc>,
    pub stage: String,
    pub message: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Checkpoint {
    pub job_id: String,
    pub stages: BTreeMap<String, StageRecord>,
    pub events: Vec<CheckpointEvent>,
}

impl Checkpoint {
    pub fn new(job_id: impl Into<String>) -> Self {
        Self {
            job_id: job_id.into(),
            stages: BTreeMap::new(),
            events: Vec::new(),
        }
    }

    pub fn stage_is_done(&self, stage: &str) -> bool {
        matches!(
            self.stages.get(stage).map(|s| s.status),
            Some(StageStatus::Done) | Some(StageStatus::Skipped)
        )
    }
}

fn checkpoint_path(work_dir: &Path) -> PathBuf {
    work_dir.join(CHECKPOINT_FILE)
}

/// Reads the checkpoint for a job, if one has been written yet.
pub async fn read(work_dir: &Path) -> RdResult<Option<Checkpoint>> {
    let path = checkpoint_path(work_dir);
    match tokio::fs::read(&path).await {
        Ok(bytes) => {
            let checkpoint = serde_json::from_slice(&bytes)
                .map_err(|e| RdError::internal("corrupt checkpoint file").with_source(e.into()))?;
            Ok(Some(checkpoint))
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(RdError::persist_failed("reading checkpoint file").with_source(e.into()).into()),
    }
}

/// Atomically writes `checkpoint` via a temp file in the same directory
/// followed by a rename, so readers never observe a partial write.
async fn write(work_dir: &Path, checkpoint: &Checkpoint) -> RdResult<()> {
    tokio::fs::create_dir_all(work_dir)
        .await
        .map_err(|e| RdError::persist_failed("creating job work directory").with_source(e.into()))?;
    let tmp_path = work_dir.join(format!("{CHECKPOINT_FILE}.tmp"));
    let body = serde_json::to_vec_pretty(checkpoint)
        .map_err(|e| RdError::internal("encoding checkpoint").with_source(e.into()))?;
    tokio::fs::write(&tmp_path, &body)
        .await
        .map_err(|e| RdError::persist_failed("writing checkpoint temp file").with_source(e.into()))?;
    tokio::fs::rename(&tmp_path, checkpoint_path(work_dir))
        .await
        .map_err(|e| RdError::persist_failed("renaming checkpoint temp file").with_source(e.into()))?;
    Ok(())
}

async fn hash_file(path: &Path) -> RdResult<String> {
    let bytes = tokio::fs::read(path)
        .await
        .map_err(|e| RdError::persist_failed("hashing artifact").with_source(e.into()))?;
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    Ok(format!("{:x}", hasher.finalize()))
}

/// Records that `stage` has started, overwriting any prior record for
/// the same stage (a restart always re-marks the stage as in-flight).
pub async fn record_stage_started(work_dir: &Path, job_id: &str, stage: &str) -> RdResult<()> {
    let mut checkpoint = read(work_dir).await?.unwrap_or_else(|| Checkpoint::new(job_id));
    checkpoint.stages.insert(
        stage.to_string(),
        StageRecord {
            status: StageStatus::Started,
            started_at: Utc::now(),
            finished_at: None,
            artifact_hashes: BTreeMap::new(),
        },
    );
    checkpoint.events.push(CheckpointEvent {
        ts: Utc::now(),
        stage: stage.to_string(),
        message: "started".to_string(),
    });
    write(work_dir, &checkpoint).await
}

/// Records `stage` as done, hashing every path in `artifacts` so a
/// future run can revalidate them before trusting `Skipped`.
pub async fn record_stage_done(work_dir: &Path, job_id: &str, stage: &str, artifacts: &[PathBuf]) -> RdResult<()> {
    let mut checkpoint = read(work_dir).await?.unwrap_or_else(|| Checkpoint::new(job_id));
    let mut artifact_hashes = BTreeMap::new();
    for artifact in artifacts {
        let hash = hash_file(artifact).await?;
        artifact_hashes.insert(artifact.display().to_string(), hash);
    }
    checkpoint.stages.insert(
        stage.to_string(),
        StageRecord {
            status: StageStatus::Done,
            started_at: checkpoint
                .stages
                .get(stage)
                .map(|s| s.started_at)
                .unwrap_or_else(Utc::now),
            finished_at: Some(Utc::now()),
            artifact_hashes,
        },
    );
    checkpoint.events.push(CheckpointEvent {
        ts: Utc::now(),
        stage: stage.to_string(),
        message: "done".to_string(),
    });
    write(work_dir, &checkpoint).await
}

/// Records `stage` as skipped because `artifacts_valid` already found
/// its prior output intact.
pub async fn record_stage_skipped(work_dir: &Path, job_id: &str, stage: &str) -> RdResult<()> {
    let mut checkpoint = read(work_dir).await?.unwrap_or_else(|| Checkpoint::new(job_id));
    if let Some(existing) = checkpoint.stages.get_mut(stage) {
        existing.status = StageStatus::Skipped;
        existing.finished_at = Some(Utc::now());
    } else {
        checkpoint.stages.insert(
            stage.to_string(),
            StageRecord {
                status: StageStatus::Skipped,
                started_at: Utc::now(),
                finished_at: Some(Utc::now()),
                artifact_hashes: BTreeMap::new(),
            },
        );
    }
    checkpoint.events.push(CheckpointEvent {
        ts: Utc::now(),
        stage: stage.to_string(),
        message: "skipped".to_string(),
    });
    write(work_dir, &checkpoint).await
}

/// True if `stage`'s recorded artifacts still exist on disk with the
/// same content hash — the condition under which a restart can skip
/// re-running the stage.
pub async fn artifacts_valid(work_dir: &Path, stage: &str) -> RdResult<bool> {
    let Some(checkpoint) = read(work_dir).await? else {
        return Ok(false);
    };
    let Some(record) = checkpoint.stages.get(stage) else {
        return Ok(false);
    };
    if !matches!(record.status, StageStatus::Done | StageStatus::Skipped) {
        return Ok(false);
    }
    for (path, expected_hash) in &record.artifact_hashes {
        let path = PathBuf::from(path);
        if !path.exists() {
            return Ok(false);
        }
        let actual_hash = hash_file(&path).await?;
        if &actual_hash != expected_hash {
            return Ok(false);
        }
    }
    Ok(true)
}

/// Resets progress on the checkpoint itself — used by the admin requeue
/// path so a re-run doesn't spuriously skip stages based on stale state.
pub async fn clear(work_dir: &Path, job_id: &str) -> RdResult<()> {
    write(work_dir, &Checkpoint::new(job_id)).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn round_trips_stage_status() {
        let dir = tempfile::tempdir().unwrap();
        record_stage_started(dir.path(), "job-1", "audio").await.unwrap();
        let checkpoint = read(dir.path()).await.unwrap().unwrap();
        assert!(!checkpoint.stage_is_done("audio"));

        record_stage_done(dir.path(), "job-1", "audio", &[]).await.unwrap();
        let checkpoint = read(dir.path()).await.unwrap().unwrap();
        assert!(checkpoint.stage_is_done("audio"));
    }

    #[tokio::test]
    async fn artifact_hash_mismatch_invalidates_skip() {
        let dir = tempfile::tempdir().unwrap();
        let artifact = dir.path().join("out.wav");
        tokio::fs::write(&artifact, b"v1").await.unwrap();
        record_stage_done(dir.path(), "job-1", "audio", &[artifact.clone()]).await.unwrap();
        assert!(artifacts_valid(dir.path(), "audio").await.unwrap());

        tokio::fs::write(&artifact, b"v2-tampered").await.unwrap();
        assert!(!artifacts_valid(dir.path(), "audio").await.unwrap());
    }

    #[tokio::test]
    async fn clear_resets_all_stages() {
        let dir = tempfile::tempdir().unwrap();
        record_stage_done(dir.path(), "job-1", "audio", &[]).await.unwrap();
        clear(dir.path(), "job-1").await.unwrap();
        let checkpoint = read(dir.path()).await.unwrap().unwrap();
        assert!(!checkpoint.stage_is_done("audio"));
    }
}
