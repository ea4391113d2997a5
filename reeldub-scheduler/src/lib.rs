//! reeldub-scheduler: drains the dispatch queue into the stage runner
//! under global and per-phase concurrency limits, with cooperative
//! cancellation and startup re-admission of persisted queued jobs.

pub mod context;
pub mod phase;
pub mod runner;
pub mod scheduler;

pub use context::{JobRunContext, ProgressReporter};
pub use phase::{Phase, PhasePermit, PhaseSemaphores};
pub use runner::{StageOutcome, StageRunner};
pub use scheduler::Scheduler;
