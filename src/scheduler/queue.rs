//! Job queues with leased, at-least-once delivery.
//!
//! # Queue Structure
//!
//! The Redis queue uses five keys under the queue name:
//!
//! - `{queue_name}`: ready list, pushed left and popped right
//! - `{queue_name}:processing`: deliveries handed to a worker
//! - `{queue_name}:leases`: sorted set of in-flight deliveries scored by lease expiry (ms)
//! - `{queue_name}:delayed`: sorted set of retries scored by ready time (ms)
//! - `{queue_name}:dead_letter`: jobs that exhausted their attempts
//!
//! # Reliability
//!
//! Jobs are atomically moved from the ready list to the processing list when
//! dequeued. A delivery that is not acked before its lease expires is moved
//! back to the ready list by [`JobQueue::recover_expired`], so a crashed
//! worker never loses a job. Duplicate deliveries are possible; the store
//! claim decides which one runs.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use super::job::Job;

/// Default time a delivery may stay unacknowledged.
pub const DEFAULT_DELIVERY_LEASE: Duration = Duration::from_secs(600);

/// Errors that can occur during queue operations.
#[derive(Debug, Error)]
pub enum QueueError {
    /// Failed to connect to Redis.
    #[error("Redis connection failed: {0}")]
    ConnectionFailed(String),

    /// Redis operation failed.
    #[error("Redis operation failed: {0}")]
    RedisError(#[from] redis::RedisError),

    /// Failed to serialize job data.
    #[error("Serialization failed: {0}")]
    SerializationFailed(#[from] serde_json::Error),

    /// Job not found in the queue.
    #[error("Job {0} not found")]
    JobNotFound(Uuid),
}

/// One hand-off of a job to a worker.
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    pub job: Job,
    /// Opaque handle used to ack this delivery.
    pub receipt: String,
}

/// A job that exhausted its attempts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetterEntry {
    pub job: Job,
    pub error: String,
    pub moved_at: DateTime<Utc>,
}

/// Statistics about queue state.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    /// Name of the queue.
    pub queue_name: String,
    /// Number of jobs waiting to be processed.
    pub pending_jobs: usize,
    /// Number of jobs currently being processed.
    pub processing_jobs: usize,
    /// Retries waiting for their backoff to elapse.
    pub delayed_jobs: usize,
    /// Number of jobs in the dead letter queue.
    pub dead_letter_jobs: usize,
}

impl QueueStats {
    /// Returns the total number of jobs in all queues.
    pub fn total_jobs(&self) -> usize {
        self.pending_jobs + self.processing_jobs + self.delayed_jobs + self.dead_letter_jobs
    }
}

/// Durable job queue.
#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Makes a job available for immediate delivery.
    async fn enqueue(&self, job: &Job) -> Result<(), QueueError>;

    /// Makes a job available once `delay` has elapsed.
    async fn schedule(&self, job: &Job, delay: Duration) -> Result<(), QueueError>;

    /// Waits up to `timeout` for the next job and leases it to the caller.
    async fn dequeue(&self, timeout: Duration) -> Result<Option<Delivery>, QueueError>;

    /// Releases a delivery for good.
    async fn ack(&self, delivery: &Delivery) -> Result<(), QueueError>;

    /// Records a job in the dead letter queue. Does not ack.
    async fn dead_letter(&self, job: &Job, error: &str) -> Result<(), QueueError>;

    /// Returns deliveries whose lease expired to the ready list.
    async fn recover_expired(&self) -> Result<usize, QueueError>;

    /// Moves delayed jobs whose time has come to the ready list.
    async fn promote_due(&self) -> Result<usize, QueueError>;

    async fn stats(&self) -> Result<QueueStats, QueueError>;

    /// Most recent dead letter entries first.
    async fn peek_dead_letter(&self, limit: usize) -> Result<Vec<DeadLetterEntry>, QueueError>;

    /// Removes a job's dead letter entry. Returns whether one was found.
    async fn remove_dead_letter(&self, job_id: Uuid) -> Result<bool, QueueError>;
}

/// Wire format of a queued job. The delivery id keeps otherwise identical
/// payloads distinct in the processing list and lease set.
#[derive(Debug, Serialize, Deserialize)]
struct Envelope {
    delivery_id: Uuid,
    job: Job,
}

pub(crate) fn seal(job: &Job) -> Result<String, QueueError> {
    Ok(serde_json::to_string(&Envelope {
        delivery_id: Uuid::new_v4(),
        job: job.clone(),
    })?)
}

pub(crate) fn open(payload: String) -> Result<Delivery, QueueError> {
    let envelope: Envelope = serde_json::from_str(&payload)?;
    Ok(Delivery {
        job: envelope.job,
        receipt: payload,
    })
}

fn millis_after(now: DateTime<Utc>, delay: Duration) -> i64 {
    let delay = i64::try_from(delay.as_millis()).unwrap_or(i64::MAX);
    now.timestamp_millis().saturating_add(delay)
}

const PROMOTE_DUE: &str = r#"
local due = redis.call('ZRANGEBYSCORE', KEYS[1], '-inf', ARGV[1], 'LIMIT', 0, tonumber(ARGV[2]))
for _, payload in ipairs(due) do
    redis.call('ZREM', KEYS[1], payload)
    redis.call('LPUSH', KEYS[2], payload)
end
return #due
"#;

const RECOVER_EXPIRED: &str = r#"
local expired = redis.call('ZRANGEBYSCORE', KEYS[1], '-inf', ARGV[1])
local moved = 0
for _, payload in ipairs(expired) do
    redis.call('ZREM', KEYS[1], payload)
    if redis.call('LREM', KEYS[2], 1, payload) > 0 then
        redis.call('RPUSH', KEYS[3], payload)
        moved = moved + 1
    end
end
return moved
"#;

/// Upper bound on delayed jobs promoted per call.
const PROMOTE_BATCH: usize = 100;

/// Redis-backed job queue.
pub struct RedisJobQueue {
    /// Redis connection manager (handles reconnection automatically).
    redis: ConnectionManager,
    queue_name: String,
    processing_queue: String,
    lease_set: String,
    delayed_set: String,
    dead_letter_queue: String,
    lease: Duration,
}

impl RedisJobQueue {
    /// Connects to Redis and creates a new job queue.
    ///
    /// # Arguments
    ///
    /// * `redis_url` - Redis connection URL (e.g., "redis://localhost:6379")
    /// * `queue_name` - Name of the queue (used as prefix for Redis keys)
    pub async fn connect(redis_url: &str, queue_name: &str) -> Result<Self, QueueError> {
        let client = redis::Client::open(redis_url)
            .map_err(|e| QueueError::ConnectionFailed(e.to_string()))?;

        let redis = ConnectionManager::new(client)
            .await
            .map_err(|e| QueueError::ConnectionFailed(e.to_string()))?;

        Ok(Self::from_connection(redis, queue_name))
    }

    /// Creates a queue from an existing ConnectionManager.
    pub fn from_connection(redis: ConnectionManager, queue_name: &str) -> Self {
        Self {
            redis,
            queue_name: queue_name.to_string(),
            processing_queue: format!("{}:processing", queue_name),
            lease_set: format!("{}:leases", queue_name),
            delayed_set: format!("{}:delayed", queue_name),
            dead_letter_queue: format!("{}:dead_letter", queue_name),
            lease: DEFAULT_DELIVERY_LEASE,
        }
    }

    /// Sets how long a delivery may stay unacknowledged.
    pub fn with_lease(mut self, lease: Duration) -> Self {
        self.lease = lease;
        self
    }

    pub fn queue_name(&self) -> &str {
        &self.queue_name
    }
}

#[async_trait]
impl JobQueue for RedisJobQueue {
    async fn enqueue(&self, job: &Job) -> Result<(), QueueError> {
        let payload = seal(job)?;
        let mut conn = self.redis.clone();
        conn.lpush::<_, _, ()>(&self.queue_name, payload).await?;
        Ok(())
    }

    async fn schedule(&self, job: &Job, delay: Duration) -> Result<(), QueueError> {
        if delay.is_zero() {
            return self.enqueue(job).await;
        }
        let payload = seal(job)?;
        let ready_at = millis_after(Utc::now(), delay);
        let mut conn = self.redis.clone();
        conn.zadd::<_, _, _, ()>(&self.delayed_set, payload, ready_at)
            .await?;
        Ok(())
    }

    /// Uses BRPOPLPUSH to atomically move the job from the ready list to
    /// the processing list, then records its lease.
    async fn dequeue(&self, timeout: Duration) -> Result<Option<Delivery>, QueueError> {
        self.promote_due().await?;

        let mut conn = self.redis.clone();
        let timeout_secs = timeout.as_secs().max(1) as usize;

        let payload: Option<String> = redis::cmd("BRPOPLPUSH")
            .arg(&self.queue_name)
            .arg(&self.processing_queue)
            .arg(timeout_secs)
            .query_async(&mut conn)
            .await?;

        let Some(payload) = payload else {
            return Ok(None);
        };
        let expires_at = millis_after(Utc::now(), self.lease);
        conn.zadd::<_, _, _, ()>(&self.lease_set, &payload, expires_at)
            .await?;

        open(payload).map(Some)
    }

    async fn ack(&self, delivery: &Delivery) -> Result<(), QueueError> {
        let mut conn = self.redis.clone();
        let mut pipe = redis::pipe();
        pipe.atomic()
            .lrem(&self.processing_queue, 1, &delivery.receipt)
            .zrem(&self.lease_set, &delivery.receipt);
        pipe.query_async::<_, ()>(&mut conn).await?;
        Ok(())
    }

    async fn dead_letter(&self, job: &Job, error: &str) -> Result<(), QueueError> {
        let entry = DeadLetterEntry {
            job: job.clone(),
            error: error.to_string(),
            moved_at: Utc::now(),
        };
        let serialized = serde_json::to_string(&entry)?;
        let mut conn = self.redis.clone();
        conn.lpush::<_, _, ()>(&self.dead_letter_queue, serialized)
            .await?;
        Ok(())
    }

    async fn recover_expired(&self) -> Result<usize, QueueError> {
        let mut conn = self.redis.clone();
        let now = Utc::now();

        // A worker that died between the pop and the lease write leaves a
        // processing entry without a lease. Give it one so it expires too.
        let in_flight: Vec<String> = conn.lrange(&self.processing_queue, 0, -1).await?;
        if !in_flight.is_empty() {
            let expires_at = millis_after(now, self.lease);
            let mut pipe = redis::pipe();
            for payload in &in_flight {
                pipe.cmd("ZADD")
                    .arg(&self.lease_set)
                    .arg("NX")
                    .arg(expires_at)
                    .arg(payload)
                    .ignore();
            }
            pipe.query_async::<_, ()>(&mut conn).await?;
        }

        let script = redis::Script::new(RECOVER_EXPIRED);
        let moved: usize = script
            .key(&self.lease_set)
            .key(&self.processing_queue)
            .key(&self.queue_name)
            .arg(now.timestamp_millis())
            .invoke_async(&mut conn)
            .await?;
        Ok(moved)
    }

    async fn promote_due(&self) -> Result<usize, QueueError> {
        let mut conn = self.redis.clone();
        let script = redis::Script::new(PROMOTE_DUE);
        let moved: usize = script
            .key(&self.delayed_set)
            .key(&self.queue_name)
            .arg(Utc::now().timestamp_millis())
            .arg(PROMOTE_BATCH)
            .invoke_async(&mut conn)
            .await?;
        Ok(moved)
    }

    async fn stats(&self) -> Result<QueueStats, QueueError> {
        let mut conn = self.redis.clone();
        let mut pipe = redis::pipe();
        pipe.llen(&self.queue_name)
            .llen(&self.processing_queue)
            .zcard(&self.delayed_set)
            .llen(&self.dead_letter_queue);
        let (pending_jobs, processing_jobs, delayed_jobs, dead_letter_jobs): (
            usize,
            usize,
            usize,
            usize,
        ) = pipe.query_async(&mut conn).await?;

        Ok(QueueStats {
            queue_name: self.queue_name.clone(),
            pending_jobs,
            processing_jobs,
            delayed_jobs,
            dead_letter_jobs,
        })
    }

    async fn peek_dead_letter(&self, limit: usize) -> Result<Vec<DeadLetterEntry>, QueueError> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let mut conn = self.redis.clone();
        let data: Vec<String> = conn
            .lrange(&self.dead_letter_queue, 0, limit as isize - 1)
            .await?;

        let entries: Result<Vec<DeadLetterEntry>, _> =
            data.iter().map(|s| serde_json::from_str(s)).collect();
        Ok(entries?)
    }

    async fn remove_dead_letter(&self, job_id: Uuid) -> Result<bool, QueueError> {
        let mut conn = self.redis.clone();
        let data: Vec<String> = conn.lrange(&self.dead_letter_queue, 0, -1).await?;

        for raw in data {
            match serde_json::from_str::<DeadLetterEntry>(&raw) {
                Ok(entry) if entry.job.id == job_id => {
                    let removed: usize = conn.lrem(&self.dead_letter_queue, 1, &raw).await?;
                    return Ok(removed > 0);
                }
                _ => {}
            }
        }
        Ok(false)
    }
}
