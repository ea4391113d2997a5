use async_trait::async_trait;

use crate::context::JobRunContext;

#[derive(Debug, Clone)]
pub enum StageOutcome {
    Done { output_mkv: Option<String>, output_srt: Option<String> },
    Failed(String),
    Canceled,
}

/// The actual dubbing pipeline, external to the scheduler. The
/// scheduler only knows how to drain the queue and enforce
/// concurrency; it hands each leased job to a `StageRunner` and waits
/// for a [`StageOutcome`].
#[async_trait]
pub trait StageRunner: Send + Sync {
    async fn run(&self, ctx: JobRunContext) -> StageOutcome;
}
