//! Job scheduling: queue, lifecycle and worker pool.
//!
//! - **JobQueue**: leased, at-least-once delivery with delayed retries and a
//!   dead letter list (Redis or in-memory)
//! - **JobLifecycleManager**: claims a delivered job, runs the pipeline,
//!   persists the outcome, retries with backoff or dead-letters
//! - **WorkerPool**: N workers pulling from the queue plus a lease reaper
//!
//! # Architecture
//!
//! ```text
//!                      ┌──────────────┐
//!                      │   Ingress    │
//!                      │ (submit/CLI) │
//!                      └──────┬───────┘
//!                             │
//!                      ┌──────▼───────┐        ┌──────────┐
//!                      │    Queue     │◀──────▶│  Reaper  │
//!                      └──────┬───────┘        └──────────┘
//!                             │
//!         ┌───────────────────┼───────────────────┐
//!         ▼                   ▼                   ▼
//!    ┌─────────┐         ┌─────────┐         ┌─────────┐
//!    │ Worker 1│         │ Worker 2│         │ Worker N│
//!    └────┬────┘         └────┬────┘         └────┬────┘
//!         └──────────── JobLifecycleManager ──────┘
//!                     (store, pipeline, GitHub)
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use review_forge::scheduler::{Job, JobLifecycleManager, WorkerPool, WorkerPoolConfig};
//!
//! let lifecycle = Arc::new(JobLifecycleManager::new(store, queue, runner, github.clone(), github));
//! lifecycle.submit(Job::new("acme/api", 42)).await?;
//!
//! let mut pool = WorkerPool::new(WorkerPoolConfig::new(4), lifecycle);
//! pool.start().await?;
//! // ...
//! pool.shutdown().await?;
//! ```
//!
//! # Reliability Features
//!
//! - **Exclusive claims**: the store claim is a compare-and-set, so a job runs on one worker at a time
//! - **Crash recovery**: unacked deliveries return to the queue when their lease expires
//! - **Persisted retries**: a retry is a status change plus a delayed delivery, never a timer in a worker
//! - **Graceful shutdown**: workers finish current jobs before stopping

pub mod backoff;
pub mod job;
pub mod lifecycle;
pub mod memory_queue;
pub mod queue;
pub mod worker_pool;

// Re-export main types for convenience
pub use backoff::{BackoffPolicy, DEFAULT_BACKOFF_BASE, DEFAULT_BACKOFF_MAX};
pub use job::{DiffRef, Job, JobStatus, DEFAULT_MAX_ATTEMPTS};
pub use lifecycle::{
    DeliveredReview, JobLifecycleManager, LifecycleError, ProcessOutcome, SkipReason,
    DEFAULT_CLAIM_LEASE, DEFAULT_JOB_TIMEOUT, DEFAULT_STRANDED_AFTER,
};
pub use memory_queue::InMemoryJobQueue;
pub use queue::{
    DeadLetterEntry, Delivery, JobQueue, QueueError, QueueStats, RedisJobQueue,
    DEFAULT_DELIVERY_LEASE,
};
pub use worker_pool::{PoolError, PoolStats, WorkerPool, WorkerPoolConfig};
