use std::path::PathBuf;
use std::sync::Arc;

use reeldub_store::models::JobPatch;
use reeldub_store::JobStore;
use tokio_util::sync::CancellationToken;

use crate::phase::{Phase, PhasePermit, PhaseSemaphores};

/// Reports progress back to the job store. Failures are logged and
/// swallowed — a stalled progress write must never abort a running job.
#[derive(Clone)]
pub struct ProgressReporter {
    store: Arc<dyn JobStore>,
    job_id: String,
}

impl ProgressReporter {
    pub fn new(store: Arc<dyn JobStore>, job_id: impl Into<String>) -> Self {
        Self { store, job_id: job_id.into() }
    }

    pub async fn report(&self, progress: f64, message: Option<&str>) {
        let patch = JobPatch {
            progress: Some(progress.clamp(0.0, 1.0)),
            message: message.map(|s| s.to_string()),
            ..Default::default()
        };
        if let Err(e) = self.store.update(&self.job_id, patch).await {
            tracing::warn!(job_id = %self.job_id, error = %e, "progress update dropped");
        }
    }
}

/// Everything the stage runner needs for one job's run: where to read
/// and write its files, how to report progress, how to notice a
/// cancellation request, and how to acquire phase capacity.
pub struct JobRunContext {
    pub job_id: String,
    pub owner_id: String,
    pub work_dir: PathBuf,
    pub cancel: CancellationToken,
    pub progress: ProgressReporter,
    phases: Arc<PhaseSemaphores>,
}

impl JobRunContext {
    pub fn new(
        job_id: impl Into<String>,
        owner_id: impl Into<String>,
        work_dir: PathBuf,
        cancel: CancellationToken,
        progress: ProgressReporter,
        phases: Arc<PhaseSemaphores>,
    ) -> Self {
        Self {
            job_id: job_id.into(),
            owner_id: owner_id.into(),
            work_dir,
            cancel,
            progress,
            phases,
        }
    }

    /// Acquires the named phase's capacity for the duration of the
    /// returned guard. The runner wraps each ML-intensive section with
    /// this; phase ordering is the runner's business, not the
    /// scheduler's.
    pub async fn with_phase(&self, phase: Phase) -> PhasePermit {
        self.phases.acquire(phase).await
    }

    pub fn is_canceled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Reads this job's checkpoint, if one has been written to its work
    /// directory yet. The runner uses this to decide which stages a
    /// restart can skip.
    pub async fn checkpoint(&self) -> reeldub_core::RdResult<Option<reeldub_checkpoint::Checkpoint>> {
        reeldub_checkpoint::read(&self.work_dir).await
    }

    /// Wipes the checkpoint clean — used when a job is being rerun from
    /// scratch (an admin requeue) rather than resumed.
    pub async fn clear_checkpoint(&self) -> reeldub_core::RdResult<()> {
        reeldub_checkpoint::clear(&self.work_dir, &self.job_id).await
    }
}
