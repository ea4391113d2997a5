use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// The ML-intensive sections of the dubbing pipeline. Ownership of
/// *which* phases a job runs through, and in what order, belongs to the
/// stage runner; the scheduler only owns the capacity of each.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    Audio,
    Transcribe,
    Tts,
    Mux,
}

impl Phase {
    pub fn name(&self) -> &'static str {
        match self {
            Phase::Audio => "audio",
            Phase::Transcribe => "transcribe",
            Phase::Tts => "tts",
            Phase::Mux => "mux",
        }
    }
}

/// A held slot in one phase's semaphore. Dropping it frees the slot.
pub struct PhasePermit {
    _permit: OwnedSemaphorePermit,
}

/// Per-phase concurrency limits, configured once at scheduler
/// construction from [`reeldub_core::RdConfig`].
pub struct PhaseSemaphores {
    semaphores: HashMap<Phase, Arc<Semaphore>>,
}

impl PhaseSemaphores {
    pub fn new(audio: usize, transcribe: usize, tts: usize, mux: usize) -> Self {
        let mut semaphores = HashMap::new();
        semaphores.insert(Phase::Audio, Arc::new(Semaphore::new(audio.max(1))));
        semaphores.insert(Phase::Transcribe, Arc::new(Semaphore::new(transcribe.max(1))));
        semaphores.insert(Phase::Tts, Arc::new(Semaphore::new(tts.max(1))));
        semaphores.insert(Phase::Mux, Arc::new(Semaphore::new(mux.max(1))));
        Self { semaphores }
    }

    /// Acquires one slot in `phase`, waiting until a slot frees up if
    /// the phase is saturated. Called by the stage runner around each
    /// ML-intensive section.
    pub async fn acquire(&self, phase: Phase) -> PhasePermit {
        let sem = self.semaphores.get(&phase).expect("all phases registered at construction");
        let permit = sem.clone().acquire_owned().await.expect("phase semaphore never closed");
        PhasePermit { _permit: permit }
    }

    pub fn available(&self, phase: Phase) -> usize {
        self.semaphores.get(&phase).map(|s| s.available_permits()).unwrap_or(0)
    }
}
