//! Single-process queue backend: an in-memory priority ordering plus a
//! broadcast event stream. Capacity limits are deliberately coarse here —
//! the policy engine enforces the user-facing quota; this backend only
//! enforces the phase-level concurrency cap that keeps dispatch from
//! starving.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::RwLock;
use tokio::sync::broadcast;
use tokio_stream::{wrappers::BroadcastStream, StreamExt};

use crate::backend::{BoxStream, JobOutcome, QueueBackend, ReservationToken};
use crate::error::{QueueError, QueueResult};
use crate::types::{DailyJobReservation, GlobalCounters, JobPriority, LeaseToken, LeasedEntry, QueueEntry, QueueEvent, UserCounters};

const MAX_QUEUED_PER_PHASE: usize = 500;

struct Inner {
    /// phase -> ordered entries (priority-then-FIFO order maintained on insert)
    queues: HashMap<String, VecDeque<QueueEntry>>,
    /// job_id -> (lease_token, owner_id, phase) for entries currently leased out
    leased: HashMap<String, (LeaseToken, String, String)>,
    /// owner_id -> count of reserved-or-queued-or-leased entries
    owner_counts: HashMap<String, i64>,
    running: i64,
    by_phase_running: HashMap<String, i64>,
    /// (owner_id, day) -> jobs submitted that day, for the atomic daily cap.
    daily_counts: HashMap<(String, String), i64>,
}

pub struct MemoryBackend {
    inner: Arc<RwLock<Inner>>,
    events: broadcast::Sender<QueueEvent>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(1024);
        Self {
            inner: Arc::new(RwLock::new(Inner {
                queues: HashMap::new(),
                leased: HashMap::new(),
                owner_counts: HashMap::new(),
                running: 0,
                by_phase_running: HashMap::new(),
                daily_counts: HashMap::new(),
            })),
            events,
        }
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl QueueBackend for MemoryBackend {
    async fn reserve_submit(&self, owner_id: &str, phase: &str) -> QueueResult<ReservationToken> {
        let mut inner = self.inner.write();
        let depth = inner.queues.get(phase).map(|q| q.len()).unwrap_or(0);
        if depth >= MAX_QUEUED_PER_PHASE {
            return Err(QueueError::Backpressure(phase.to_string()));
        }
        *inner.owner_counts.entry(owner_id.to_string()).or_insert(0) += 1;
        Ok(ReservationToken {
            id: reeldub_core::ids::short_id(16),
            owner_id: owner_id.to_string(),
        })
    }

    async fn commit(&self, token: ReservationToken, job_id: &str, priority: JobPriority, phase: &str) -> QueueResult<()> {
        let now = Utc::now();
        let entry = QueueEntry {
            job_id: job_id.to_string(),
            owner_id: token.owner_id.clone(),
            priority,
            phase: phase.to_string(),
            enqueued_at: now,
        };
        let mut inner = self.inner.write();
        let queue = inner.queues.entry(phase.to_string()).or_default();
        let insert_pos = queue
            .iter()
            .position(|existing| {
                (existing.priority, std::cmp::Reverse(existing.enqueued_at))
                    < (entry.priority, std::cmp::Reverse(entry.enqueued_at))
            })
            .unwrap_or(queue.len());
        queue.insert(insert_pos, entry);
        let _ = self.events.send(QueueEvent::Submitted {
            job_id: job_id.to_string(),
            at: now,
        });
        Ok(())
    }

    async fn release(&self, token: ReservationToken) -> QueueResult<()> {
        let mut inner = self.inner.write();
        if let Some(count) = inner.owner_counts.get_mut(&token.owner_id) {
            *count = (*count - 1).max(0);
        }
        Ok(())
    }

    async fn dequeue(&self, phase: &str) -> QueueResult<Option<LeasedEntry>> {
        let now = Utc::now();
        let mut inner = self.inner.write();
        let Some(queue) = inner.queues.get_mut(phase) else {
            return Ok(None);
        };
        let Some(entry) = queue.pop_front() else {
            return Ok(None);
        };
        let lease_token = LeaseToken::new();
        let lease_until = now + chrono::Duration::seconds(300);
        inner
            .leased
            .insert(entry.job_id.clone(), (lease_token.clone(), entry.owner_id.clone(), phase.to_string()));
        let _ = self.events.send(QueueEvent::Leased {
            job_id: entry.job_id.clone(),
            phase: phase.to_string(),
            at: now,
        });
        Ok(Some(LeasedEntry {
            entry,
            lease_token,
            lease_until,
        }))
    }

    async fn before_job_run(&self, job_id: &str) -> QueueResult<()> {
        let mut inner = self.inner.write();
        let phase = inner.leased.get(job_id).map(|(_, _, p)| p.clone());
        inner.running += 1;
        if let Some(phase) = phase {
            *inner.by_phase_running.entry(phase).or_insert(0) += 1;
        }
        Ok(())
    }

    async fn requeue(&self, job_id: &str, lease_token: LeaseToken, priority: JobPriority, delay_s: f64) -> QueueResult<()> {
        let entry = {
            let mut inner = self.inner.write();
            let Some((held_token, owner_id, phase)) = inner.leased.remove(job_id) else {
                return Err(QueueError::JobNotFound(job_id.to_string()));
            };
            if held_token != lease_token {
                inner.leased.insert(job_id.to_string(), (held_token, owner_id, phase));
                return Err(QueueError::InvalidLeaseToken);
            }
            QueueEntry {
                job_id: job_id.to_string(),
                owner_id,
                priority,
                phase,
                enqueued_at: Utc::now(),
            }
        };

        let inner = self.inner.clone();
        let events = self.events.clone();
        let job_id = job_id.to_string();
        tokio::spawn(async move {
            if delay_s > 0.0 {
                tokio::time::sleep(std::time::Duration::from_secs_f64(delay_s)).await;
            }
            let at = Utc::now();
            let mut guard = inner.write();
            let queue = guard.queues.entry(entry.phase.clone()).or_default();
            let insert_pos = queue
                .iter()
                .position(|existing| {
                    (existing.priority, std::cmp::Reverse(existing.enqueued_at)) < (entry.priority, std::cmp::Reverse(entry.enqueued_at))
                })
                .unwrap_or(queue.len());
            queue.insert(insert_pos, entry);
            drop(guard);
            let _ = events.send(QueueEvent::Requeued { job_id, delay_s, at });
        });
        Ok(())
    }

    async fn on_job_done(&self, job_id: &str, lease_token: LeaseToken, outcome: JobOutcome) -> QueueResult<()> {
        let now = Utc::now();
        let mut inner = self.inner.write();
        let Some((held_token, owner_id, phase)) = inner.leased.remove(job_id) else {
            return Err(QueueError::JobNotFound(job_id.to_string()));
        };
        if held_token != lease_token {
            // put it back; caller presented a stale token
            inner.leased.insert(job_id.to_string(), (held_token, owner_id, phase));
            return Err(QueueError::InvalidLeaseToken);
        }
        inner.running = (inner.running - 1).max(0);
        if let Some(c) = inner.by_phase_running.get_mut(&phase) {
            *c = (*c - 1).max(0);
        }
        if let Some(c) = inner.owner_counts.get_mut(&owner_id) {
            *c = (*c - 1).max(0);
        }
        let event = match outcome {
            JobOutcome::Completed => QueueEvent::Completed {
                job_id: job_id.to_string(),
                at: now,
            },
            JobOutcome::Failed(error) => QueueEvent::Failed {
                job_id: job_id.to_string(),
                error,
                at: now,
            },
        };
        let _ = self.events.send(event);
        Ok(())
    }

    async fn cancel(&self, job_id: &str) -> QueueResult<bool> {
        let now = Utc::now();
        let mut inner = self.inner.write();
        let mut found = false;
        for queue in inner.queues.values_mut() {
            if let Some(pos) = queue.iter().position(|e| e.job_id == job_id) {
                queue.remove(pos);
                found = true;
                break;
            }
        }
        if !found && inner.leased.contains_key(job_id) {
            inner.leased.remove(job_id);
            found = true;
        }
        if found {
            let _ = self.events.send(QueueEvent::Canceled {
                job_id: job_id.to_string(),
                at: now,
            });
        }
        Ok(found)
    }

    async fn set_priority(&self, job_id: &str, priority: JobPriority) -> QueueResult<()> {
        let mut inner = self.inner.write();
        let mut moved = None;
        for queue in inner.queues.values_mut() {
            if let Some(pos) = queue.iter().position(|e| e.job_id == job_id) {
                let mut entry = queue.remove(pos).unwrap();
                entry.priority = priority;
                moved = Some((entry, pos));
                break;
            }
        }
        let Some((entry, _)) = moved else {
            return Err(QueueError::JobNotFound(job_id.to_string()));
        };
        let phase = entry.phase.clone();
        let queue = inner.queues.entry(phase).or_default();
        let insert_pos = queue
            .iter()
            .position(|existing| {
                (existing.priority, std::cmp::Reverse(existing.enqueued_at))
                    < (entry.priority, std::cmp::Reverse(entry.enqueued_at))
            })
            .unwrap_or(queue.len());
        queue.insert(insert_pos, entry);
        let _ = self.events.send(QueueEvent::PriorityChanged {
            job_id: job_id.to_string(),
            priority,
            at: Utc::now(),
        });
        Ok(())
    }

    async fn counters(&self, owner_id: &str) -> QueueResult<UserCounters> {
        let inner = self.inner.read();
        let queued = inner
            .queues
            .values()
            .flat_map(|q| q.iter())
            .filter(|e| e.owner_id == owner_id)
            .count() as i64;
        let running = inner
            .leased
            .values()
            .filter(|(_, owner, _)| owner == owner_id)
            .count() as i64;
        Ok(UserCounters { queued, running })
    }

    async fn global_counters(&self) -> QueueResult<GlobalCounters> {
        let inner = self.inner.read();
        let queued = inner.queues.values().map(|q| q.len() as i64).sum();
        Ok(GlobalCounters {
            queued,
            running: inner.running,
            by_phase_running: inner.by_phase_running.clone(),
        })
    }

    async fn reserve_daily_jobs(&self, owner_id: &str, day: &str) -> QueueResult<(DailyJobReservation, i64)> {
        let mut inner = self.inner.write();
        let count = inner.daily_counts.entry((owner_id.to_string(), day.to_string())).or_insert(0);
        *count += 1;
        let after = *count;
        Ok((DailyJobReservation { owner_id: owner_id.to_string(), day: day.to_string() }, after))
    }

    async fn release_daily_jobs(&self, reservation: DailyJobReservation) -> QueueResult<()> {
        let mut inner = self.inner.write();
        if let Some(count) = inner.daily_counts.get_mut(&(reservation.owner_id, reservation.day)) {
            *count = (*count - 1).max(0);
        }
        Ok(())
    }

    fn event_stream(&self) -> BoxStream<QueueEvent> {
        let rx = self.events.subscribe();
        Box::pin(BroadcastStream::new(rx).filter_map(|r| r.ok()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn priority_orders_ahead_of_fifo() {
        let backend = MemoryBackend::new();
        let low = backend.reserve_submit("u1", "tts").await.unwrap();
        backend.commit(low, "job-low", JobPriority::Low, "tts").await.unwrap();
        let high = backend.reserve_submit("u1", "tts").await.unwrap();
        backend.commit(high, "job-high", JobPriority::High, "tts").await.unwrap();

        let first = backend.dequeue("tts").await.unwrap().unwrap();
        assert_eq!(first.entry.job_id, "job-high");
    }

    #[tokio::test]
    async fn cancel_removes_from_queue() {
        let backend = MemoryBackend::new();
        let token = backend.reserve_submit("u1", "tts").await.unwrap();
        backend.commit(token, "job-1", JobPriority::Normal, "tts").await.unwrap();
        assert!(backend.cancel("job-1").await.unwrap());
        assert!(backend.dequeue("tts").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn stale_lease_token_is_rejected() {
        let backend = MemoryBackend::new();
        let token = backend.reserve_submit("u1", "tts").await.unwrap();
        backend.commit(token, "job-1", JobPriority::Normal, "tts").await.unwrap();
        let leased = backend.dequeue("tts").await.unwrap().unwrap();
        backend.before_job_run("job-1").await.unwrap();
        let bogus = LeaseToken::new();
        let result = backend.on_job_done("job-1", bogus, JobOutcome::Completed).await;
        assert!(matches!(result, Err(QueueError::InvalidLeaseToken)));
        backend
            .on_job_done("job-1", leased.lease_token, JobOutcome::Completed)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn daily_reservation_increments_and_releases() {
        let backend = MemoryBackend::new();
        let (r1, after1) = backend.reserve_daily_jobs("u1", "2026-07-31").await.unwrap();
        assert_eq!(after1, 1);
        let (r2, after2) = backend.reserve_daily_jobs("u1", "2026-07-31").await.unwrap();
        assert_eq!(after2, 2);

        backend.release_daily_jobs(r1).await.unwrap();
        let (_, after3) = backend.reserve_daily_jobs("u1", "2026-07-31").await.unwrap();
        assert_eq!(after3, 2);

        // a different day starts its own counter
        let (_, other_day) = backend.reserve_daily_jobs("u1", "2026-08-01").await.unwrap();
        assert_eq!(other_day, 1);

        let _ = r2;
    }

    #[tokio::test]
    async fn requeue_reinserts_after_delay_at_given_priority() {
        let backend = MemoryBackend::new();
        let token = backend.reserve_submit("u1", "tts").await.unwrap();
        backend.commit(token, "job-1", JobPriority::Low, "tts").await.unwrap();
        let leased = backend.dequeue("tts").await.unwrap().unwrap();

        backend.requeue("job-1", leased.lease_token, JobPriority::High, 0.0).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;

        let requeued = backend.dequeue("tts").await.unwrap().unwrap();
        assert_eq!(requeued.entry.job_id, "job-1");
        assert_eq!(requeued.entry.priority, JobPriority::High);
    }
}
