//! reeldub-queue: priority dispatch queue in front of the job scheduler.
//!
//! Backed by either an in-process `MemoryBackend` or a Redis-backed
//! `DistributedBackend`, selected at bootstrap via `QUEUE_BACKEND`. Both
//! implement the same `QueueBackend` trait, so the scheduler never knows
//! which one it's talking to.

pub mod backend;
pub mod error;
pub mod types;

pub use backend::{distributed::ExternalKv, memory::MemoryBackend, BoxStream, JobOutcome, QueueBackend, ReservationToken};
pub use error::{QueueError, QueueResult};
pub use types::{DailyJobReservation, GlobalCounters, JobPriority, LeaseToken, LeasedEntry, QueueEntry, QueueEvent, UserCounters};
