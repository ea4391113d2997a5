pub mod distributed;
pub mod memory;

use std::pin::Pin;

use async_trait::async_trait;
use futures_core::Stream;

use crate::error::QueueResult;
use crate::types::{DailyJobReservation, GlobalCounters, JobPriority, LeaseToken, LeasedEntry, QueueEvent, UserCounters};

pub type BoxStream<T> = Pin<Box<dyn Stream<Item = T> + Send>>;

/// A provisional admission slot. Reserved before a job row is durably
/// created, so a burst of concurrent submissions can't all pass the
/// capacity check and then all land — the reservation itself is the
/// capacity unit.
#[derive(Debug, Clone)]
pub struct ReservationToken {
    pub id: String,
    pub owner_id: String,
}

#[derive(Debug, Clone)]
pub enum JobOutcome {
    Completed,
    Failed(String),
}

/// Backend-agnostic queue operations. `MemoryBackend` implements this for
/// a single-process deployment; `DistributedBackend` implements it over
/// an `ExternalKv` (Redis-backed) store for multi-process deployments.
#[async_trait]
pub trait QueueBackend: Send + Sync {
    /// Reserves a queue slot for `owner_id` ahead of durable job creation.
    /// Returns `QueueError::Backpressure` if the phase or the owner's
    /// per-user queue cap is already saturated.
    async fn reserve_submit(&self, owner_id: &str, phase: &str) -> QueueResult<ReservationToken>;

    /// Converts a reservation into a live queue entry once the caller has
    /// durably persisted the job row.
    async fn commit(&self, token: ReservationToken, job_id: &str, priority: JobPriority, phase: &str) -> QueueResult<()>;

    /// Releases a reservation without enqueuing — used when job
    /// persistence fails after a successful reserve.
    async fn release(&self, token: ReservationToken) -> QueueResult<()>;

    /// Pops the highest-priority eligible entry for `phase`, if any.
    async fn dequeue(&self, phase: &str) -> QueueResult<Option<LeasedEntry>>;

    /// Called by the scheduler immediately before invoking the stage
    /// runner, so counters reflect in-flight work even before the first
    /// checkpoint write.
    async fn before_job_run(&self, job_id: &str) -> QueueResult<()>;

    /// Returns a job that was leased out by `dequeue` to the back of its
    /// phase queue, `delay_s` seconds from now, without touching the
    /// owner's reservation count. Used by the scheduler when a
    /// dispatch-time policy check rejects a leased job — the lease is
    /// given up and the job becomes dispatchable again after the delay.
    async fn requeue(&self, job_id: &str, lease_token: LeaseToken, priority: JobPriority, delay_s: f64) -> QueueResult<()>;

    /// Called by the scheduler once a leased job's run has concluded.
    async fn on_job_done(&self, job_id: &str, lease_token: LeaseToken, outcome: JobOutcome) -> QueueResult<()>;

    async fn cancel(&self, job_id: &str) -> QueueResult<bool>;

    async fn set_priority(&self, job_id: &str, priority: JobPriority) -> QueueResult<()>;

    async fn counters(&self, owner_id: &str) -> QueueResult<UserCounters>;

    async fn global_counters(&self) -> QueueResult<GlobalCounters>;

    /// Atomically increments `owner_id`'s job counter for `day` (a
    /// `YYYY-MM-DD` key) and returns a reservation plus the counter value
    /// *after* the increment. Callers compare `count - 1` (the count
    /// before this reservation) against the daily cap, then either leave
    /// the reservation in place (job persisted) or `release_daily_jobs`
    /// it (policy rejected the submission, or persistence failed).
    async fn reserve_daily_jobs(&self, owner_id: &str, day: &str) -> QueueResult<(DailyJobReservation, i64)>;

    /// Decrements the counter a prior `reserve_daily_jobs` incremented.
    async fn release_daily_jobs(&self, reservation: DailyJobReservation) -> QueueResult<()>;

    fn event_stream(&self) -> BoxStream<QueueEvent>;
}
