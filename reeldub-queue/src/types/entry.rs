use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::priority::JobPriority;

/// A lease handed to whoever dequeues an entry. Prevents a second
/// concurrent dispatch of the same job while one worker already holds it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaseToken(pub String);

impl LeaseToken {
    pub fn new() -> Self {
        Self(reeldub_core::ids::short_id(24))
    }
}

impl Default for LeaseToken {
    fn default() -> Self {
        Self::new()
    }
}

/// One queued entry. The queue itself only tracks enough to order and
/// dispatch work; job detail lives in the store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueEntry {
    pub job_id: String,
    pub owner_id: String,
    pub priority: JobPriority,
    pub phase: String,
    pub enqueued_at: DateTime<Utc>,
}

/// A dequeued entry, leased to the caller until `lease_until`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeasedEntry {
    pub entry: QueueEntry,
    pub lease_token: LeaseToken,
    pub lease_until: DateTime<Utc>,
}

/// An atomically-reserved slot against a user's per-day job counter,
/// held by the queue backend so a burst of concurrent submissions can't
/// all read the same stale count and all pass the daily cap. Released
/// (decrementing the counter back) if policy rejects the submission or
/// the job row fails to persist; otherwise left in place.
#[derive(Debug, Clone)]
pub struct DailyJobReservation {
    pub owner_id: String,
    pub day: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserCounters {
    pub queued: i64,
    pub running: i64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GlobalCounters {
    pub queued: i64,
    pub running: i64,
    pub by_phase_running: std::collections::HashMap<String, i64>,
}

/// Observability events mirrored to SSE/WebSocket subscribers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum QueueEvent {
    Submitted { job_id: String, at: DateTime<Utc> },
    Leased { job_id: String, phase: String, at: DateTime<Utc> },
    Completed { job_id: String, at: DateTime<Utc> },
    Failed { job_id: String, error: String, at: DateTime<Utc> },
    Canceled { job_id: String, at: DateTime<Utc> },
    PriorityChanged { job_id: String, priority: JobPriority, at: DateTime<Utc> },
    Requeued { job_id: String, delay_s: f64, at: DateTime<Utc> },
}
