//! Worker pool for processing review jobs from the queue.
//!
//! Each worker runs as an independent async task that pulls deliveries and
//! hands them to the [`JobLifecycleManager`]. A reaper task returns expired
//! deliveries to the queue, promotes due retries and re-enqueues stranded
//! jobs.
//!
//! # Features
//!
//! - Configurable number of workers
//! - Graceful shutdown with broadcast channel
//! - Lease recovery at start and on a fixed interval
//! - Pool statistics tracking

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::lifecycle::{JobLifecycleManager, ProcessOutcome};
use super::queue::{Delivery, QueueError};
use crate::metrics;

/// Errors that can occur in the worker pool.
#[derive(Debug, Error)]
pub enum PoolError {
    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    /// Pool is already running.
    #[error("Pool is already running")]
    AlreadyRunning,

    /// Pool is not running.
    #[error("Pool is not running")]
    NotRunning,

    /// Shutdown timed out.
    #[error("Shutdown timed out after {0:?}")]
    ShutdownTimeout(Duration),

    #[error("Invalid pool configuration: {0}")]
    InvalidConfig(String),
}

/// Configuration for the worker pool.
#[derive(Debug, Clone)]
pub struct WorkerPoolConfig {
    /// Number of worker tasks to spawn.
    pub num_workers: usize,
    /// How long one dequeue waits when the queue is empty.
    pub poll_interval: Duration,
    /// How often the reaper recovers expired deliveries.
    pub reap_interval: Duration,
    /// Timeout for graceful shutdown.
    pub shutdown_timeout: Duration,
    /// Prefix of worker ids, unique per process.
    pub worker_prefix: String,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        let process_tag = Uuid::new_v4().simple().to_string();
        Self {
            num_workers: 4,
            poll_interval: Duration::from_secs(1),
            reap_interval: Duration::from_secs(30),
            shutdown_timeout: Duration::from_secs(60),
            worker_prefix: format!("worker-{}", &process_tag[..8]),
        }
    }
}

impl WorkerPoolConfig {
    /// Creates a new configuration with the specified number of workers.
    pub fn new(num_workers: usize) -> Self {
        Self {
            num_workers,
            ..Default::default()
        }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_reap_interval(mut self, interval: Duration) -> Self {
        self.reap_interval = interval;
        self
    }

    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    pub fn with_worker_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.worker_prefix = prefix.into();
        self
    }

    pub fn validate(&self) -> Result<(), PoolError> {
        if self.num_workers == 0 {
            return Err(PoolError::InvalidConfig(
                "num_workers must be at least 1".to_string(),
            ));
        }
        if self.poll_interval.is_zero() || self.reap_interval.is_zero() {
            return Err(PoolError::InvalidConfig(
                "poll and reap intervals must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

/// Statistics about the worker pool.
#[derive(Debug, Clone, Default)]
pub struct PoolStats {
    /// Total number of workers in the pool.
    pub num_workers: usize,
    /// Number of workers currently processing jobs.
    pub active_workers: usize,
    pub jobs_completed: u64,
    pub jobs_retried: u64,
    pub jobs_dead_lettered: u64,
    /// Deliveries acked without running (claim conflicts, early retries).
    pub deliveries_skipped: u64,
    /// Deliveries left unacked after a store or queue error.
    pub errors: u64,
    /// Average duration of deliveries that ran the pipeline.
    pub average_job_duration: Duration,
}

impl PoolStats {
    /// Jobs that ran the pipeline to an outcome.
    pub fn total_processed(&self) -> u64 {
        self.jobs_completed + self.jobs_retried + self.jobs_dead_lettered
    }

    /// Percentage of processed attempts that completed the job.
    pub fn success_rate(&self) -> f64 {
        let total = self.total_processed();
        if total == 0 {
            return 0.0;
        }
        (self.jobs_completed as f64 / total as f64) * 100.0
    }
}

/// Shared state for tracking pool statistics.
#[derive(Default)]
struct SharedPoolStats {
    jobs_completed: AtomicU64,
    jobs_retried: AtomicU64,
    jobs_dead_lettered: AtomicU64,
    deliveries_skipped: AtomicU64,
    errors: AtomicU64,
    total_duration_ms: AtomicU64,
    active_workers: AtomicU64,
}

impl SharedPoolStats {
    fn record(&self, outcome: &ProcessOutcome, duration: Duration) {
        let counter = match outcome {
            ProcessOutcome::Completed { .. } => &self.jobs_completed,
            ProcessOutcome::Retrying { .. } => &self.jobs_retried,
            ProcessOutcome::DeadLettered { .. } => &self.jobs_dead_lettered,
            ProcessOutcome::Skipped { .. } => {
                self.deliveries_skipped.fetch_add(1, Ordering::SeqCst);
                return;
            }
        };
        counter.fetch_add(1, Ordering::SeqCst);
        self.total_duration_ms
            .fetch_add(duration.as_millis() as u64, Ordering::SeqCst);
    }

    fn record_error(&self) {
        self.errors.fetch_add(1, Ordering::SeqCst);
    }

    fn increment_active(&self) -> u64 {
        self.active_workers.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn decrement_active(&self) -> u64 {
        self.active_workers.fetch_sub(1, Ordering::SeqCst) - 1
    }

    fn to_pool_stats(&self, num_workers: usize) -> PoolStats {
        let completed = self.jobs_completed.load(Ordering::SeqCst);
        let retried = self.jobs_retried.load(Ordering::SeqCst);
        let dead_lettered = self.jobs_dead_lettered.load(Ordering::SeqCst);
        let total_duration_ms = self.total_duration_ms.load(Ordering::SeqCst);

        let total_jobs = completed + retried + dead_lettered;
        let average_duration = if total_jobs > 0 {
            Duration::from_millis(total_duration_ms / total_jobs)
        } else {
            Duration::ZERO
        };

        PoolStats {
            num_workers,
            active_workers: self.active_workers.load(Ordering::SeqCst) as usize,
            jobs_completed: completed,
            jobs_retried: retried,
            jobs_dead_lettered: dead_lettered,
            deliveries_skipped: self.deliveries_skipped.load(Ordering::SeqCst),
            errors: self.errors.load(Ordering::SeqCst),
            average_job_duration: average_duration,
        }
    }
}

/// Pool of workers sharing one lifecycle manager.
pub struct WorkerPool {
    config: WorkerPoolConfig,
    lifecycle: Arc<JobLifecycleManager>,
    shutdown_tx: broadcast::Sender<()>,
    worker_handles: Vec<JoinHandle<()>>,
    reaper_handle: Option<JoinHandle<()>>,
    stats: Arc<SharedPoolStats>,
    is_running: AtomicBool,
}

impl WorkerPool {
    pub fn new(config: WorkerPoolConfig, lifecycle: Arc<JobLifecycleManager>) -> Self {
        // Buffer size of 1 is sufficient since we only send once
        let (shutdown_tx, _) = broadcast::channel(1);

        Self {
            config,
            lifecycle,
            shutdown_tx,
            worker_handles: Vec::new(),
            reaper_handle: None,
            stats: Arc::new(SharedPoolStats::default()),
            is_running: AtomicBool::new(false),
        }
    }

    /// Starts all workers and the reaper.
    ///
    /// Deliveries left in flight by a previous run are recovered first.
    pub async fn start(&mut self) -> Result<(), PoolError> {
        if self.is_running.load(Ordering::SeqCst) {
            return Err(PoolError::AlreadyRunning);
        }
        self.config.validate()?;

        let queue = Arc::clone(self.lifecycle.queue());
        match queue.recover_expired().await {
            Ok(recovered) if recovered > 0 => {
                info!(recovered, "Recovered expired deliveries");
            }
            Ok(_) => {}
            Err(e) => {
                warn!(error = %e, "Failed to recover expired deliveries");
            }
        }

        for i in 0..self.config.num_workers {
            let worker = Worker {
                id: format!("{}-{}", self.config.worker_prefix, i),
                lifecycle: Arc::clone(&self.lifecycle),
                shutdown_rx: self.shutdown_tx.subscribe(),
                poll_interval: self.config.poll_interval,
                stats: Arc::clone(&self.stats),
            };
            self.worker_handles.push(tokio::spawn(worker.run()));
        }

        self.reaper_handle = Some(tokio::spawn(reap(
            Arc::clone(&self.lifecycle),
            self.config.reap_interval,
            self.shutdown_tx.subscribe(),
        )));

        self.is_running.store(true, Ordering::SeqCst);
        info!(num_workers = self.config.num_workers, "Worker pool started");

        Ok(())
    }

    /// Gracefully shuts down all workers.
    ///
    /// Workers finish their current job before stopping.
    pub async fn shutdown(&mut self) -> Result<(), PoolError> {
        if !self.is_running.load(Ordering::SeqCst) {
            return Err(PoolError::NotRunning);
        }

        info!("Initiating worker pool shutdown");

        // Ignore send error - workers may have already stopped
        let _ = self.shutdown_tx.send(());

        let reaper = self.reaper_handle.take();
        let shutdown_future = async {
            for handle in self.worker_handles.drain(..) {
                if let Err(e) = handle.await {
                    error!(error = %e, "Worker task panicked during shutdown");
                }
            }
            if let Some(reaper) = reaper {
                if let Err(e) = reaper.await {
                    error!(error = %e, "Reaper task panicked during shutdown");
                }
            }
        };

        let result = tokio::time::timeout(self.config.shutdown_timeout, shutdown_future).await;
        self.is_running.store(false, Ordering::SeqCst);
        match result {
            Ok(()) => {
                info!("Worker pool shutdown complete");
                Ok(())
            }
            Err(_) => Err(PoolError::ShutdownTimeout(self.config.shutdown_timeout)),
        }
    }

    /// Returns current pool statistics.
    pub fn stats(&self) -> PoolStats {
        self.stats.to_pool_stats(self.config.num_workers)
    }

    pub fn is_running(&self) -> bool {
        self.is_running.load(Ordering::SeqCst)
    }

    pub fn num_workers(&self) -> usize {
        self.config.num_workers
    }
}

/// Periodically returns expired deliveries, promotes due retries and
/// re-enqueues jobs that lost their queue entry.
async fn reap(
    lifecycle: Arc<JobLifecycleManager>,
    interval: Duration,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    let queue = lifecycle.queue();
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => break,
            _ = ticker.tick() => {}
        }

        match queue.recover_expired().await {
            Ok(0) => {}
            Ok(recovered) => info!(recovered, "Recovered expired deliveries"),
            Err(e) => warn!(error = %e, "Lease recovery failed"),
        }
        if let Err(e) = queue.promote_due().await {
            warn!(error = %e, "Promoting due retries failed");
        }
        match lifecycle.requeue_stranded().await {
            Ok(0) => {}
            Ok(requeued) => info!(requeued, "Re-enqueued stranded jobs"),
            Err(e) => warn!(error = %e, "Stranded job sweep failed"),
        }
        match queue.stats().await {
            Ok(stats) => metrics::set_queue_depth(&stats),
            Err(e) => debug!(error = %e, "Queue stats unavailable"),
        }
    }
}

/// A single worker that processes deliveries from the queue.
struct Worker {
    id: String,
    lifecycle: Arc<JobLifecycleManager>,
    shutdown_rx: broadcast::Receiver<()>,
    /// How long one dequeue waits.
    poll_interval: Duration,
    stats: Arc<SharedPoolStats>,
}

impl Worker {
    /// Main worker loop.
    ///
    /// Continuously polls for jobs and processes them until a shutdown
    /// signal is received.
    async fn run(mut self) {
        info!(worker_id = %self.id, "Worker started");

        loop {
            match self.shutdown_rx.try_recv() {
                Ok(()) | Err(broadcast::error::TryRecvError::Closed) => {
                    info!(worker_id = %self.id, "Worker received shutdown signal");
                    break;
                }
                Err(broadcast::error::TryRecvError::Lagged(_)) => {
                    // We missed some signals, but since it's shutdown, just check again
                    continue;
                }
                Err(broadcast::error::TryRecvError::Empty) => {}
            }

            match self.lifecycle.queue().dequeue(self.poll_interval).await {
                Ok(Some(delivery)) => {
                    self.process(delivery).await;
                }
                Ok(None) => {
                    debug!(worker_id = %self.id, "No jobs available");
                }
                Err(e) => {
                    error!(worker_id = %self.id, error = %e, "Failed to dequeue job");
                    tokio::time::sleep(self.poll_interval).await;
                }
            }
        }

        info!(worker_id = %self.id, "Worker stopped");
    }

    async fn process(&self, delivery: Delivery) {
        let job_id = delivery.job.id;
        let start_time = Instant::now();
        metrics::set_active_workers(self.stats.increment_active());

        let result = self.lifecycle.process(&self.id, &delivery).await;

        metrics::set_active_workers(self.stats.decrement_active());
        match result {
            Ok(outcome) => {
                debug!(
                    worker_id = %self.id,
                    job_id = %job_id,
                    outcome = outcome.label(),
                    duration_ms = start_time.elapsed().as_millis() as u64,
                    "Delivery processed"
                );
                self.stats.record(&outcome, start_time.elapsed());
            }
            Err(e) => {
                // Left unacked: the queue redelivers after the lease.
                self.stats.record_error();
                error!(
                    worker_id = %self.id,
                    job_id = %job_id,
                    error = %e,
                    "Failed to process delivery"
                );
            }
        }
    }
}
