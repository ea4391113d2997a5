//! The dubbing pipeline itself — transcription, translation, TTS, mux —
//! is external to this substrate, the same way `reeldub-policy`'s
//! `NoGpuProbe` is an honest placeholder for hardware detection this
//! binary doesn't implement. `UnimplementedRunner` is that same kind of
//! placeholder for the stage work the scheduler hands off: it reports a
//! clean, typed failure for every job it's given rather than panicking
//! or hanging, so a build wired up without a real pipeline still drains
//! its queue predictably.

use async_trait::async_trait;
use reeldub_scheduler::{JobRunContext, StageOutcome, StageRunner};

pub struct UnimplementedRunner;

#[async_trait]
impl StageRunner for UnimplementedRunner {
    async fn run(&self, ctx: JobRunContext) -> StageOutcome {
        tracing::warn!(job_id = %ctx.job_id, "no stage runner configured for this build");
        StageOutcome::Failed("stage runner not configured in this build".to_string())
    }
}
