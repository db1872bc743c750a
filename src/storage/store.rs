//! The persistent store contract.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use uuid::Uuid;

use super::migrations::MigrationError;
use crate::pipeline::{AggregatedReview, StageResult};
use crate::scheduler::{Job, JobStatus};

/// Errors that can occur during store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Connection to the database failed.
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Query execution failed.
    #[error("Query failed: {0}")]
    QueryFailed(#[from] sqlx::Error),

    /// Serialization/deserialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Migration error: {0}")]
    Migration(#[from] MigrationError),

    #[error("Job {0} already exists")]
    DuplicateJob(Uuid),

    #[error("Job {0} not found")]
    NotFound(Uuid),

    #[error("Illegal status transition {from} -> {to}")]
    InvalidTransition { from: JobStatus, to: JobStatus },

    /// A stored row could not be mapped back to a domain value.
    #[error("Corrupt record: {0}")]
    Corrupt(String),
}

/// Result of trying to claim a job for processing.
#[derive(Debug, Clone, PartialEq)]
pub enum ClaimOutcome {
    /// The caller now owns the job; `attempts` has been incremented.
    Claimed(Job),
    /// The job is owned by a live claim or is in a state that cannot be claimed.
    Conflict { status: JobStatus },
    /// The job is queued for a retry whose backoff has not elapsed.
    NotYetDue { not_before: DateTime<Utc> },
    /// The job's claim went stale but it has no attempts left. It keeps
    /// its status (`processing` or `retrying`) and must be dead-lettered by
    /// the caller.
    Exhausted(Job),
    NotFound,
}

/// Durable storage of jobs, stage results and reviews.
///
/// Status changes are compare-and-set on `(status, attempts)` so a worker
/// whose claim was taken over cannot overwrite the new owner's progress.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Inserts a new job. Fails with `DuplicateJob` if the id exists.
    async fn create_job(&self, job: &Job) -> Result<(), StoreError>;

    async fn get_job(&self, job_id: Uuid) -> Result<Option<Job>, StoreError>;

    /// Atomically claims a job that is `queued` (and due), or `processing`
    /// with an expired lease, or `retrying` unchanged for longer than `lease`
    /// (its worker died before scheduling the retry). A successful claim
    /// sets `processing`, increments `attempts` and records `worker_id` with
    /// a lease of `lease`.
    async fn claim(
        &self,
        job_id: Uuid,
        worker_id: &str,
        lease: Duration,
    ) -> Result<ClaimOutcome, StoreError>;

    /// Moves a job from `from` to `to` if it is still at `from` with
    /// `attempt` attempts. Returns false when the precondition no longer
    /// holds. Leaving `processing` releases the claim. `error` is stored as
    /// `last_error` when given.
    async fn update_status(
        &self,
        job_id: Uuid,
        from: JobStatus,
        to: JobStatus,
        attempt: u32,
        error: Option<&str>,
    ) -> Result<bool, StoreError>;

    /// Moves a `retrying` job back to `queued`, eligible from `not_before`.
    async fn schedule_retry(
        &self,
        job_id: Uuid,
        attempt: u32,
        not_before: DateTime<Utc>,
    ) -> Result<bool, StoreError>;

    async fn append_stage_result(&self, result: &StageResult) -> Result<(), StoreError>;

    /// Every stage result of a job, oldest first.
    async fn stage_results(&self, job_id: Uuid) -> Result<Vec<StageResult>, StoreError>;

    /// Stores the review unless one already exists for the job.
    /// Returns true when this call inserted it.
    async fn save_aggregated_review(&self, review: &AggregatedReview) -> Result<bool, StoreError>;

    async fn get_aggregated_review(
        &self,
        job_id: Uuid,
    ) -> Result<Option<AggregatedReview>, StoreError>;

    /// Records the posted comment. Returns false if it was already recorded.
    async fn mark_comment_posted(&self, job_id: Uuid, comment_id: u64) -> Result<bool, StoreError>;

    /// Puts a `dead_lettered` job back to `queued` with `extra_attempts`
    /// more attempts. Returns the updated job, or `None` if the job is not
    /// dead-lettered.
    async fn reset_for_replay(
        &self,
        job_id: Uuid,
        extra_attempts: u32,
    ) -> Result<Option<Job>, StoreError>;

    async fn count_by_status(&self) -> Result<HashMap<JobStatus, u64>, StoreError>;

    /// Returns up to `limit` `queued` jobs untouched since `cutoff` whose
    /// retry time, if any, is also before `cutoff`, and stamps their
    /// `updated_at` so the next sweep passes over them for another period.
    async fn take_stranded(
        &self,
        cutoff: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Job>, StoreError>;
}

/// Rejects transitions that are not lifecycle edges.
pub(crate) fn check_transition(from: JobStatus, to: JobStatus) -> Result<(), StoreError> {
    if from.can_transition_to(to) {
        Ok(())
    } else {
        Err(StoreError::InvalidTransition { from, to })
    }
}

/// `now - age`, saturating at the earliest representable time.
pub(crate) fn older_than(now: DateTime<Utc>, age: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(age)
        .ok()
        .and_then(|age| now.checked_sub_signed(age))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

/// `now + duration`, saturating at the latest representable time.
pub(crate) fn expiry_after(now: DateTime<Utc>, lease: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(lease)
        .ok()
        .and_then(|lease| now.checked_add_signed(lease))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}
