//! In-process [`JobQueue`] for tests and single-node runs.
//!
//! Mirrors the Redis queue: a ready list, leased in-flight deliveries, a
//! delayed set and a dead letter list. Times use `tokio::time::Instant`, so
//! a paused test clock drives backoff and lease expiry.

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::Notify;
use tokio::time::Instant;
use uuid::Uuid;

use super::job::Job;
use super::queue::{
    open, seal, DeadLetterEntry, Delivery, JobQueue, QueueError, QueueStats,
    DEFAULT_DELIVERY_LEASE,
};

#[derive(Debug, Default)]
struct State {
    ready: VecDeque<String>,
    in_flight: HashMap<String, Instant>,
    delayed: Vec<(Instant, String)>,
    dead_letter: VecDeque<DeadLetterEntry>,
}

impl State {
    fn promote_due(&mut self, now: Instant) -> usize {
        let (due, pending): (Vec<_>, Vec<_>) =
            self.delayed.drain(..).partition(|(ready_at, _)| *ready_at <= now);
        self.delayed = pending;
        let count = due.len();
        self.ready.extend(due.into_iter().map(|(_, payload)| payload));
        count
    }

    fn next_due(&self) -> Option<Instant> {
        self.delayed.iter().map(|(ready_at, _)| *ready_at).min()
    }
}

/// Job queue held in process memory.
#[derive(Debug)]
pub struct InMemoryJobQueue {
    name: String,
    state: Mutex<State>,
    notify: Notify,
    lease: Duration,
}

impl Default for InMemoryJobQueue {
    fn default() -> Self {
        Self::new("reviews")
    }
}

impl InMemoryJobQueue {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state: Mutex::new(State::default()),
            notify: Notify::new(),
            lease: DEFAULT_DELIVERY_LEASE,
        }
    }

    pub fn with_lease(mut self, lease: Duration) -> Self {
        self.lease = lease;
        self
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn push_ready(&self, payload: String) {
        self.lock().ready.push_back(payload);
        self.notify.notify_one();
    }

    /// Pops the next ready delivery without waiting.
    fn try_pop(&self) -> Result<Option<Delivery>, QueueError> {
        let now = Instant::now();
        let mut state = self.lock();
        state.promote_due(now);
        let Some(payload) = state.ready.pop_front() else {
            return Ok(None);
        };
        state.in_flight.insert(payload.clone(), now + self.lease);
        drop(state);
        open(payload).map(Some)
    }
}

#[async_trait]
impl JobQueue for InMemoryJobQueue {
    async fn enqueue(&self, job: &Job) -> Result<(), QueueError> {
        self.push_ready(seal(job)?);
        Ok(())
    }

    async fn schedule(&self, job: &Job, delay: Duration) -> Result<(), QueueError> {
        let payload = seal(job)?;
        if delay.is_zero() {
            self.push_ready(payload);
        } else {
            self.lock().delayed.push((Instant::now() + delay, payload));
            self.notify.notify_one();
        }
        Ok(())
    }

    async fn dequeue(&self, timeout: Duration) -> Result<Option<Delivery>, QueueError> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(delivery) = self.try_pop()? {
                return Ok(Some(delivery));
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            let wake_at = self
                .lock()
                .next_due()
                .map_or(deadline, |due| due.min(deadline));
            let _ = tokio::time::timeout_at(wake_at, self.notify.notified()).await;
        }
    }

    async fn ack(&self, delivery: &Delivery) -> Result<(), QueueError> {
        self.lock().in_flight.remove(&delivery.receipt);
        Ok(())
    }

    async fn dead_letter(&self, job: &Job, error: &str) -> Result<(), QueueError> {
        self.lock().dead_letter.push_front(DeadLetterEntry {
            job: job.clone(),
            error: error.to_string(),
            moved_at: Utc::now(),
        });
        Ok(())
    }

    async fn recover_expired(&self) -> Result<usize, QueueError> {
        let now = Instant::now();
        let mut state = self.lock();
        let expired: Vec<String> = state
            .in_flight
            .iter()
            .filter(|(_, expires_at)| **expires_at <= now)
            .map(|(payload, _)| payload.clone())
            .collect();
        for payload in &expired {
            state.in_flight.remove(payload);
            state.ready.push_front(payload.clone());
        }
        drop(state);
        if !expired.is_empty() {
            self.notify.notify_waiters();
        }
        Ok(expired.len())
    }

    async fn promote_due(&self) -> Result<usize, QueueError> {
        let promoted = self.lock().promote_due(Instant::now());
        if promoted > 0 {
            self.notify.notify_waiters();
        }
        Ok(promoted)
    }

    async fn stats(&self) -> Result<QueueStats, QueueError> {
        let state = self.lock();
        Ok(QueueStats {
            queue_name: self.name.clone(),
            pending_jobs: state.ready.len(),
            processing_jobs: state.in_flight.len(),
            delayed_jobs: state.delayed.len(),
            dead_letter_jobs: state.dead_letter.len(),
        })
    }

    async fn peek_dead_letter(&self, limit: usize) -> Result<Vec<DeadLetterEntry>, QueueError> {
        Ok(self.lock().dead_letter.iter().take(limit).cloned().collect())
    }

    async fn remove_dead_letter(&self, job_id: Uuid) -> Result<bool, QueueError> {
        let mut state = self.lock();
        match state.dead_letter.iter().position(|e| e.job.id == job_id) {
            Some(idx) => {
                state.dead_letter.remove(idx);
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_fifo_delivery_and_ack() {
        let queue = InMemoryJobQueue::new("test");
        let first = Job::new("acme/api", 1);
        let second = Job::new("acme/api", 2);
        queue.enqueue(&first).await.unwrap();
        queue.enqueue(&second).await.unwrap();

        let delivery = queue.dequeue(Duration::from_millis(10)).await.unwrap().unwrap();
        assert_eq!(delivery.job.id, first.id);
        assert_eq!(queue.stats().await.unwrap().processing_jobs, 1);

        queue.ack(&delivery).await.unwrap();
        let stats = queue.stats().await.unwrap();
        assert_eq!(stats.processing_jobs, 0);
        assert_eq!(stats.pending_jobs, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dequeue_times_out_when_empty() {
        let queue = InMemoryJobQueue::new("test");
        let started = Instant::now();
        assert!(queue.dequeue(Duration::from_secs(2)).await.unwrap().is_none());
        assert!(started.elapsed() >= Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_scheduled_job_waits_for_delay() {
        let queue = InMemoryJobQueue::new("test");
        let job = Job::new("acme/api", 3);
        queue.schedule(&job, Duration::from_secs(30)).await.unwrap();

        assert!(queue.dequeue(Duration::from_secs(5)).await.unwrap().is_none());
        assert_eq!(queue.stats().await.unwrap().delayed_jobs, 1);

        let started = Instant::now();
        let delivery = queue.dequeue(Duration::from_secs(60)).await.unwrap().unwrap();
        assert_eq!(delivery.job.id, job.id);
        assert!(started.elapsed() >= Duration::from_secs(25));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unacked_delivery_is_recovered_after_lease() {
        let queue = InMemoryJobQueue::new("test").with_lease(Duration::from_secs(10));
        let job = Job::new("acme/api", 4);
        queue.enqueue(&job).await.unwrap();

        let lost = queue.dequeue(Duration::from_secs(1)).await.unwrap().unwrap();
        assert_eq!(queue.recover_expired().await.unwrap(), 0);

        tokio::time::advance(Duration::from_secs(11)).await;
        assert_eq!(queue.recover_expired().await.unwrap(), 1);

        let redelivered = queue.dequeue(Duration::from_secs(1)).await.unwrap().unwrap();
        assert_eq!(redelivered.job.id, job.id);
        assert_eq!(redelivered.receipt, lost.receipt);
    }

    #[tokio::test]
    async fn test_dead_letter_peek_and_remove() {
        let queue = InMemoryJobQueue::new("test");
        let older = Job::new("acme/api", 5);
        let newer = Job::new("acme/api", 6);
        queue.dead_letter(&older, "first").await.unwrap();
        queue.dead_letter(&newer, "second").await.unwrap();

        let entries = queue.peek_dead_letter(10).await.unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].job.id, newer.id);
        assert_eq!(entries[0].error, "second");

        assert!(queue.remove_dead_letter(older.id).await.unwrap());
        assert!(!queue.remove_dead_letter(older.id).await.unwrap());
        assert_eq!(queue.stats().await.unwrap().dead_letter_jobs, 1);
    }
}
