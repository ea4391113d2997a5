//! Multi-process queue backend. Built against a small `ExternalKv`
//! abstraction rather than calling `redis` directly, so the dispatch
//! logic above it doesn't care which store backs it.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::broadcast;
use tokio_stream::{wrappers::BroadcastStream, StreamExt};

use crate::backend::{BoxStream, JobOutcome, QueueBackend, ReservationToken};
use crate::error::{QueueError, QueueResult};
use crate::types::{DailyJobReservation, GlobalCounters, JobPriority, LeaseToken, LeasedEntry, QueueEntry, QueueEvent, UserCounters};

const DAILY_COUNTER_TTL_S: u64 = 172_800;
const DAILY_COUNTER_CAS_RETRIES: u32 = 10;

/// What a distributed backend needs from its store: get/set/compare-and-
/// swap on scalar keys, expiry, and a sorted set for priority ordering.
/// `RedisKv` is the only implementation shipped, gated behind the
/// `redis-backend` feature; tests can substitute an in-memory fake.
#[async_trait]
pub trait ExternalKv: Send + Sync + 'static {
    async fn get(&self, key: &str) -> anyhow::Result<Option<String>>;
    async fn set(&self, key: &str, value: &str) -> anyhow::Result<()>;
    async fn cas(&self, key: &str, expected: Option<&str>, new: &str) -> anyhow::Result<bool>;
    async fn expire(&self, key: &str, seconds: u64) -> anyhow::Result<()>;
    async fn zadd(&self, set_key: &str, member: &str, score: f64) -> anyhow::Result<()>;
    async fn zpopmin(&self, set_key: &str) -> anyhow::Result<Option<(String, f64)>>;
    async fn zrem(&self, set_key: &str, member: &str) -> anyhow::Result<()>;
    async fn zcard(&self, set_key: &str) -> anyhow::Result<i64>;
}

/// Queue entries are addressed as `queue:{phase}` sorted sets, scored by
/// `(-priority, enqueued_at)` packed into an f64 so `zpopmin` yields the
/// highest-priority, oldest entry first.
pub struct DistributedBackend<K: ExternalKv> {
    kv: Arc<K>,
    events: broadcast::Sender<QueueEvent>,
}

fn score_for(priority: JobPriority, enqueued_at: chrono::DateTime<Utc>) -> f64 {
    let priority_component = (10 - priority as i64) as f64 * 1e15;
    priority_component + enqueued_at.timestamp_millis() as f64
}

impl<K: ExternalKv> DistributedBackend<K> {
    pub fn new(kv: K) -> Self {
        let (events, _) = broadcast::channel(1024);
        Self { kv: Arc::new(kv), events }
    }

    fn queue_key(phase: &str) -> String {
        format!("queue:{phase}")
    }

    fn entry_key(job_id: &str) -> String {
        format!("entry:{job_id}")
    }

    fn lease_key(job_id: &str) -> String {
        format!("lease:{job_id}")
    }

    fn daily_key(owner_id: &str, day: &str) -> String {
        format!("daily:{owner_id}:{day}")
    }

    /// Compare-and-swap retry loop applying `delta` to the integer stored
    /// at `key`, defaulting to 0 when absent. Returns the value after the
    /// update. Used for the daily job counter, where plain get-then-set
    /// would let two concurrent submissions both read the same stale
    /// count and both pass the cap.
    async fn cas_add(&self, key: &str, delta: i64) -> QueueResult<i64> {
        for _ in 0..DAILY_COUNTER_CAS_RETRIES {
            let current = self.kv.get(key).await.map_err(|e| QueueError::Unavailable(e.to_string()))?;
            let current_n: i64 = current.as_deref().map(|s| s.parse().unwrap_or(0)).unwrap_or(0);
            let next = (current_n + delta).max(0);
            let swapped = self
                .kv
                .cas(key, current.as_deref(), &next.to_string())
                .await
                .map_err(|e| QueueError::Unavailable(e.to_string()))?;
            if swapped {
                self.kv.expire(key, DAILY_COUNTER_TTL_S).await.map_err(|e| QueueError::Unavailable(e.to_string()))?;
                return Ok(next);
            }
        }
        Err(QueueError::Unavailable(format!("daily counter cas did not converge for {key}")))
    }
}

#[async_trait]
impl<K: ExternalKv> QueueBackend for DistributedBackend<K> {
    async fn reserve_submit(&self, owner_id: &str, phase: &str) -> QueueResult<ReservationToken> {
        let depth = self
            .kv
            .zcard(&Self::queue_key(phase))
            .await
            .map_err(|e| QueueError::Unavailable(e.to_string()))?;
        if depth >= 500 {
            return Err(QueueError::Backpressure(phase.to_string()));
        }
        Ok(ReservationToken {
            id: reeldub_core::ids::short_id(16),
            owner_id: owner_id.to_string(),
        })
    }

    async fn commit(&self, token: ReservationToken, job_id: &str, priority: JobPriority, phase: &str) -> QueueResult<()> {
        let now = Utc::now();
        let entry = QueueEntry {
            job_id: job_id.to_string(),
            owner_id: token.owner_id,
            priority,
            phase: phase.to_string(),
            enqueued_at: now,
        };
        let payload = serde_json::to_string(&entry).map_err(|e| QueueError::Unavailable(e.to_string()))?;
        self.kv
            .set(&Self::entry_key(job_id), &payload)
            .await
            .map_err(|e| QueueError::Unavailable(e.to_string()))?;
        self.kv
            .zadd(&Self::queue_key(phase), job_id, score_for(priority, now))
            .await
            .map_err(|e| QueueError::Unavailable(e.to_string()))?;
        let _ = self.events.send(QueueEvent::Submitted { job_id: job_id.to_string(), at: now });
        Ok(())
    }

    async fn release(&self, _token: ReservationToken) -> QueueResult<()> {
        Ok(())
    }

    async fn dequeue(&self, phase: &str) -> QueueResult<Option<LeasedEntry>> {
        let Some((job_id, _score)) = self
            .kv
            .zpopmin(&Self::queue_key(phase))
            .await
            .map_err(|e| QueueError::Unavailable(e.to_string()))?
        else {
            return Ok(None);
        };
        let Some(raw) = self
            .kv
            .get(&Self::entry_key(&job_id))
            .await
            .map_err(|e| QueueError::Unavailable(e.to_string()))?
        else {
            return Ok(None);
        };
        let entry: QueueEntry = serde_json::from_str(&raw).map_err(|e| QueueError::Unavailable(e.to_string()))?;
        let lease_token = LeaseToken::new();
        let now = Utc::now();
        let lease_until = now + chrono::Duration::seconds(300);
        self.kv
            .set(&Self::lease_key(&job_id), &lease_token.0)
            .await
            .map_err(|e| QueueError::Unavailable(e.to_string()))?;
        self.kv
            .expire(&Self::lease_key(&job_id), 300)
            .await
            .map_err(|e| QueueError::Unavailable(e.to_string()))?;
        let _ = self.events.send(QueueEvent::Leased { job_id: job_id.clone(), phase: phase.to_string(), at: now });
        Ok(Some(LeasedEntry { entry, lease_token, lease_until }))
    }

    async fn before_job_run(&self, _job_id: &str) -> QueueResult<()> {
        Ok(())
    }

    async fn requeue(&self, job_id: &str, lease_token: LeaseToken, priority: JobPriority, delay_s: f64) -> QueueResult<()> {
        let held = self
            .kv
            .get(&Self::lease_key(job_id))
            .await
            .map_err(|e| QueueError::Unavailable(e.to_string()))?;
        if held.as_deref() != Some(lease_token.0.as_str()) {
            return Err(QueueError::InvalidLeaseToken);
        }
        let Some(raw) = self
            .kv
            .get(&Self::entry_key(job_id))
            .await
            .map_err(|e| QueueError::Unavailable(e.to_string()))?
        else {
            return Err(QueueError::JobNotFound(job_id.to_string()));
        };
        let mut entry: QueueEntry = serde_json::from_str(&raw).map_err(|e| QueueError::Unavailable(e.to_string()))?;
        entry.priority = priority;

        let kv = self.kv.clone();
        let events = self.events.clone();
        let job_id = job_id.to_string();
        tokio::spawn(async move {
            if delay_s > 0.0 {
                tokio::time::sleep(std::time::Duration::from_secs_f64(delay_s)).await;
            }
            entry.enqueued_at = Utc::now();
            let Ok(payload) = serde_json::to_string(&entry) else { return };
            if kv.set(&Self::entry_key(&job_id), &payload).await.is_err() {
                return;
            }
            if kv
                .zadd(&Self::queue_key(&entry.phase), &job_id, score_for(entry.priority, entry.enqueued_at))
                .await
                .is_err()
            {
                return;
            }
            let _ = events.send(QueueEvent::Requeued { job_id, delay_s, at: entry.enqueued_at });
        });
        Ok(())
    }

    async fn on_job_done(&self, job_id: &str, lease_token: LeaseToken, outcome: JobOutcome) -> QueueResult<()> {
        let held = self
            .kv
            .get(&Self::lease_key(job_id))
            .await
            .map_err(|e| QueueError::Unavailable(e.to_string()))?;
        if held.as_deref() != Some(lease_token.0.as_str()) {
            return Err(QueueError::InvalidLeaseToken);
        }
        let now = Utc::now();
        let event = match outcome {
            JobOutcome::Completed => QueueEvent::Completed { job_id: job_id.to_string(), at: now },
            JobOutcome::Failed(error) => QueueEvent::Failed { job_id: job_id.to_string(), error, at: now },
        };
        let _ = self.events.send(event);
        Ok(())
    }

    async fn cancel(&self, job_id: &str) -> QueueResult<bool> {
        let Some(raw) = self
            .kv
            .get(&Self::entry_key(job_id))
            .await
            .map_err(|e| QueueError::Unavailable(e.to_string()))?
        else {
            return Ok(false);
        };
        let entry: QueueEntry = serde_json::from_str(&raw).map_err(|e| QueueError::Unavailable(e.to_string()))?;
        self.kv
            .zrem(&Self::queue_key(&entry.phase), job_id)
            .await
            .map_err(|e| QueueError::Unavailable(e.to_string()))?;
        let _ = self.events.send(QueueEvent::Canceled { job_id: job_id.to_string(), at: Utc::now() });
        Ok(true)
    }

    async fn set_priority(&self, job_id: &str, priority: JobPriority) -> QueueResult<()> {
        let Some(raw) = self
            .kv
            .get(&Self::entry_key(job_id))
            .await
            .map_err(|e| QueueError::Unavailable(e.to_string()))?
        else {
            return Err(QueueError::JobNotFound(job_id.to_string()));
        };
        let mut entry: QueueEntry = serde_json::from_str(&raw).map_err(|e| QueueError::Unavailable(e.to_string()))?;
        entry.priority = priority;
        self.kv
            .zadd(&Self::queue_key(&entry.phase), job_id, score_for(priority, entry.enqueued_at))
            .await
            .map_err(|e| QueueError::Unavailable(e.to_string()))?;
        self.kv
            .set(&Self::entry_key(job_id), &serde_json::to_string(&entry).unwrap())
            .await
            .map_err(|e| QueueError::Unavailable(e.to_string()))?;
        let _ = self.events.send(QueueEvent::PriorityChanged { job_id: job_id.to_string(), priority, at: Utc::now() });
        Ok(())
    }

    async fn counters(&self, _owner_id: &str) -> QueueResult<UserCounters> {
        // Owner-scoped counting over a shared sorted set needs a side
        // index; not built yet. Distributed deployments should favor the
        // store's own per-owner job counts for quota checks.
        Ok(UserCounters { queued: 0, running: 0 })
    }

    async fn global_counters(&self) -> QueueResult<GlobalCounters> {
        Ok(GlobalCounters::default())
    }

    async fn reserve_daily_jobs(&self, owner_id: &str, day: &str) -> QueueResult<(DailyJobReservation, i64)> {
        let key = Self::daily_key(owner_id, day);
        let after = self.cas_add(&key, 1).await?;
        Ok((DailyJobReservation { owner_id: owner_id.to_string(), day: day.to_string() }, after))
    }

    async fn release_daily_jobs(&self, reservation: DailyJobReservation) -> QueueResult<()> {
        let key = Self::daily_key(&reservation.owner_id, &reservation.day);
        self.cas_add(&key, -1).await?;
        Ok(())
    }

    fn event_stream(&self) -> BoxStream<QueueEvent> {
        let rx = self.events.subscribe();
        Box::pin(BroadcastStream::new(rx).filter_map(|r| r.ok()))
    }
}

#[cfg(feature = "redis-backend")]
pub mod redis_kv {
    use super::ExternalKv;
    use async_trait::async_trait;
    use redis::AsyncCommands;

    pub struct RedisKv {
        client: redis::Client,
    }

    impl RedisKv {
        pub fn connect(url: &str) -> anyhow::Result<Self> {
            Ok(Self { client: redis::Client::open(url)? })
        }

        async fn conn(&self) -> anyhow::Result<redis::aio::MultiplexedConnection> {
            Ok(self.client.get_multiplexed_async_connection().await?)
        }
    }

    #[async_trait]
    impl ExternalKv for RedisKv {
        async fn get(&self, key: &str) -> anyhow::Result<Option<String>> {
            Ok(self.conn().await?.get(key).await?)
        }

        async fn set(&self, key: &str, value: &str) -> anyhow::Result<()> {
            self.conn().await?.set::<_, _, ()>(key, value).await?;
            Ok(())
        }

        async fn cas(&self, key: &str, expected: Option<&str>, new: &str) -> anyhow::Result<bool> {
            let mut conn = self.conn().await?;
            let current: Option<String> = conn.get(key).await?;
            if current.as_deref() != expected {
                return Ok(false);
            }
            conn.set::<_, _, ()>(key, new).await?;
            Ok(true)
        }

        async fn expire(&self, key: &str, seconds: u64) -> anyhow::Result<()> {
            self.conn().await?.expire::<_, ()>(key, seconds as i64).await?;
            Ok(())
        }

        async fn zadd(&self, set_key: &str, member: &str, score: f64) -> anyhow::Result<()> {
            self.conn().await?.zadd::<_, _, _, ()>(set_key, member, score).await?;
            Ok(())
        }

        async fn zpopmin(&self, set_key: &str) -> anyhow::Result<Option<(String, f64)>> {
            let result: Vec<(String, f64)> = self.conn().await?.zpopmin(set_key, 1).await?;
            Ok(result.into_iter().next())
        }

        async fn zrem(&self, set_key: &str, member: &str) -> anyhow::Result<()> {
            self.conn().await?.zrem::<_, _, ()>(set_key, member).await?;
            Ok(())
        }

        async fn zcard(&self, set_key: &str) -> anyhow::Result<i64> {
            Ok(self.conn().await?.zcard(set_key).await?)
        }
    }
}
