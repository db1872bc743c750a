//! Job lifecycle: claim, run, persist, retry, dead-letter.
//!
//! [`JobLifecycleManager::process`] drives one delivery from the queue to a
//! persisted outcome. Every status change goes through the store before the
//! next side effect, and the delivery is acked only once the outcome is
//! durable. An error returned from `process` leaves the delivery unacked so
//! the queue redelivers it after its lease.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use thiserror::Error;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::backoff::BackoffPolicy;
use super::job::{DiffRef, Job, JobStatus, DEFAULT_MAX_ATTEMPTS};
use super::queue::{Delivery, JobQueue, QueueError};
use crate::github::{split_repository, CommentSink, DiffSource, GitHubError};
use crate::metrics;
use crate::pipeline::{AggregatedReview, FailureKind, PipelineOutcome, PipelineRunner};
use crate::storage::store::{expiry_after, older_than};
use crate::storage::{ClaimOutcome, JobStore, StoreError};

/// Default lease on a claimed job. Must outlive the job timeout.
pub const DEFAULT_CLAIM_LEASE: Duration = Duration::from_secs(600);

/// Default bound on one attempt: diff fetch, pipeline and comment.
pub const DEFAULT_JOB_TIMEOUT: Duration = Duration::from_secs(300);

/// Default age after which an untouched `queued` job is enqueued again.
pub const DEFAULT_STRANDED_AFTER: Duration = Duration::from_secs(600);

/// Jobs re-enqueued per sweep.
const STRANDED_BATCH: usize = 100;

/// Errors that stop the lifecycle from reaching a durable outcome.
#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("Comment delivery failed: {0}")]
    Delivery(#[from] GitHubError),

    #[error("Job {0} already exists")]
    DuplicateJob(Uuid),

    #[error("Invalid job: {0}")]
    InvalidJob(String),

    /// Another worker owns the job. Not a failure; the delivery is skipped.
    #[error("Job {job_id} is owned elsewhere ({status})")]
    ClaimConflict { job_id: Uuid, status: JobStatus },

    #[error("Job {0} is not dead-lettered")]
    NotDeadLettered(Uuid),
}

/// Why a delivery was acknowledged without running the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// Another worker holds a live claim; the delivery was re-scheduled.
    ClaimConflict,
    /// The job already reached a final state.
    AlreadyTerminal(JobStatus),
    /// A retry delivered before its backoff elapsed; re-scheduled.
    NotYetDue,
    NotFound,
    /// The claim expired and another worker took over while this one ran.
    LostClaim,
}

/// Result of processing one delivery.
#[derive(Debug, Clone, PartialEq)]
pub enum ProcessOutcome {
    Completed {
        job_id: Uuid,
        attempt: u32,
        degraded: bool,
    },
    Retrying {
        job_id: Uuid,
        attempt: u32,
        delay: Duration,
    },
    DeadLettered {
        job_id: Uuid,
        attempt: u32,
        error: String,
    },
    Skipped {
        job_id: Uuid,
        reason: SkipReason,
    },
}

impl ProcessOutcome {
    /// Label used for metrics and logs.
    pub fn label(&self) -> &'static str {
        match self {
            ProcessOutcome::Completed { .. } => "completed",
            ProcessOutcome::Retrying { .. } => "retrying",
            ProcessOutcome::DeadLettered { .. } => "dead_lettered",
            ProcessOutcome::Skipped { .. } => "skipped",
        }
    }
}

/// Where the posted comment ended up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeliveredReview {
    pub comment_id: u64,
    /// False when an earlier delivery already posted it.
    pub posted_now: bool,
}

/// A failed attempt, before the retry decision.
#[derive(Debug, Clone)]
struct AttemptFailure {
    kind: FailureKind,
    message: String,
}

impl AttemptFailure {
    fn transient(message: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::Transient,
            message: message.into(),
        }
    }
}

/// Drives jobs through their lifecycle.
pub struct JobLifecycleManager {
    store: Arc<dyn JobStore>,
    queue: Arc<dyn JobQueue>,
    runner: Arc<PipelineRunner>,
    diff_source: Arc<dyn DiffSource>,
    comment_sink: Arc<dyn CommentSink>,
    backoff: BackoffPolicy,
    claim_lease: Duration,
    job_timeout: Duration,
    replay_attempts: u32,
    stranded_after: Duration,
}

impl JobLifecycleManager {
    pub fn new(
        store: Arc<dyn JobStore>,
        queue: Arc<dyn JobQueue>,
        runner: Arc<PipelineRunner>,
        diff_source: Arc<dyn DiffSource>,
        comment_sink: Arc<dyn CommentSink>,
    ) -> Self {
        Self {
            store,
            queue,
            runner,
            diff_source,
            comment_sink,
            backoff: BackoffPolicy::default(),
            claim_lease: DEFAULT_CLAIM_LEASE,
            job_timeout: DEFAULT_JOB_TIMEOUT,
            replay_attempts: DEFAULT_MAX_ATTEMPTS,
            stranded_after: DEFAULT_STRANDED_AFTER,
        }
    }

    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_claim_lease(mut self, lease: Duration) -> Self {
        self.claim_lease = lease;
        self
    }

    pub fn with_job_timeout(mut self, timeout: Duration) -> Self {
        self.job_timeout = timeout;
        self
    }

    /// Attempts granted to a job by `replay_dead_letter`.
    pub fn with_replay_attempts(mut self, attempts: u32) -> Self {
        self.replay_attempts = attempts;
        self
    }

    /// Age at which `requeue_stranded` treats a `queued` job as having lost
    /// its queue entry.
    pub fn with_stranded_after(mut self, age: Duration) -> Self {
        self.stranded_after = age;
        self
    }

    pub fn store(&self) -> &Arc<dyn JobStore> {
        &self.store
    }

    pub fn queue(&self) -> &Arc<dyn JobQueue> {
        &self.queue
    }

    /// Accepts a new job: persists it as `queued`, then enqueues it.
    pub async fn submit(&self, job: Job) -> Result<Job, LifecycleError> {
        if job.status != JobStatus::Queued || job.attempts != 0 {
            return Err(LifecycleError::InvalidJob(format!(
                "new jobs must be queued with no attempts (got {} with {})",
                job.status, job.attempts
            )));
        }
        if job.max_attempts == 0 {
            return Err(LifecycleError::InvalidJob(
                "max_attempts must be at least 1".to_string(),
            ));
        }
        split_repository(&job.repository)
            .map_err(|e| LifecycleError::InvalidJob(e.to_string()))?;

        match self.store.create_job(&job).await {
            Ok(()) => {}
            Err(StoreError::DuplicateJob(id)) => return Err(LifecycleError::DuplicateJob(id)),
            Err(e) => return Err(e.into()),
        }
        self.queue.enqueue(&job).await?;
        metrics::record_job_submitted();

        info!(
            job_id = %job.id,
            repository = %job.repository,
            pr_number = job.pr_number,
            "Job submitted"
        );
        Ok(job)
    }

    /// Processes one delivery to a durable outcome and acks it.
    pub async fn process(
        &self,
        worker_id: &str,
        delivery: &Delivery,
    ) -> Result<ProcessOutcome, LifecycleError> {
        let job_id = delivery.job.id;
        let job = match self.claim(worker_id, delivery).await {
            Ok(Claim::Owned(job)) => job,
            Ok(Claim::Settled(outcome)) => {
                self.queue.ack(delivery).await?;
                return Ok(outcome);
            }
            Err(LifecycleError::ClaimConflict { status, .. }) => {
                debug!(worker_id, job_id = %job_id, status = %status, "Job owned elsewhere");
                let reason = if status.is_terminal() {
                    SkipReason::AlreadyTerminal(status)
                } else {
                    // The owner may die; look again once its lease could have expired.
                    self.queue.schedule(&delivery.job, self.claim_lease).await?;
                    SkipReason::ClaimConflict
                };
                self.queue.ack(delivery).await?;
                return Ok(ProcessOutcome::Skipped { job_id, reason });
            }
            Err(e) => return Err(e),
        };

        let started = Instant::now();
        info!(
            worker_id,
            job_id = %job.id,
            attempt = job.attempts,
            max_attempts = job.max_attempts,
            repository = %job.repository,
            pr_number = job.pr_number,
            "Processing job"
        );

        let result = match tokio::time::timeout(self.job_timeout, self.run_attempt(&job)).await {
            Ok(result) => result,
            Err(_) => Err(AttemptFailure::transient(format!(
                "job timed out after {:?}",
                self.job_timeout
            ))),
        };

        let outcome = match result {
            Ok(degraded) => self.complete(&job, degraded).await?,
            Err(failure) => self.fail(&job, failure).await?,
        };

        if !matches!(outcome, ProcessOutcome::Skipped { .. }) {
            metrics::record_job(outcome.label(), started.elapsed());
        }
        self.queue.ack(delivery).await?;
        Ok(outcome)
    }

    async fn claim(&self, worker_id: &str, delivery: &Delivery) -> Result<Claim, LifecycleError> {
        let job_id = delivery.job.id;
        match self
            .store
            .claim(job_id, worker_id, self.claim_lease)
            .await?
        {
            ClaimOutcome::Claimed(job) => Ok(Claim::Owned(job)),
            ClaimOutcome::Conflict { status } => {
                Err(LifecycleError::ClaimConflict { job_id, status })
            }
            ClaimOutcome::NotYetDue { not_before } => {
                let delay = (not_before - Utc::now()).to_std().unwrap_or(Duration::ZERO);
                debug!(job_id = %job_id, delay_secs = delay.as_secs(), "Retry delivered early");
                self.queue.schedule(&delivery.job, delay).await?;
                Ok(Claim::Settled(ProcessOutcome::Skipped {
                    job_id,
                    reason: SkipReason::NotYetDue,
                }))
            }
            ClaimOutcome::Exhausted(job) => {
                let error = "claim lease expired with no attempts left".to_string();
                warn!(job_id = %job_id, attempts = job.attempts, "Dead-lettering abandoned job");
                if !self.dead_letter(&job, &error).await? {
                    return Ok(Claim::Settled(self.lost_claim(&job)));
                }
                metrics::record_job("dead_lettered", Duration::ZERO);
                Ok(Claim::Settled(ProcessOutcome::DeadLettered {
                    job_id,
                    attempt: job.attempts,
                    error,
                }))
            }
            ClaimOutcome::NotFound => {
                warn!(job_id = %job_id, "Delivered job is not in the store");
                Ok(Claim::Settled(ProcessOutcome::Skipped {
                    job_id,
                    reason: SkipReason::NotFound,
                }))
            }
        }
    }

    /// One attempt. Returns whether the delivered review is degraded.
    async fn run_attempt(&self, job: &Job) -> Result<bool, AttemptFailure> {
        // An earlier attempt may have saved the review but failed to post it.
        if let Some(review) = self
            .store
            .get_aggregated_review(job.id)
            .await
            .map_err(|e| AttemptFailure::transient(e.to_string()))?
        {
            info!(job_id = %job.id, saved_by = review.attempt, "Reusing saved review");
            let degraded = review.is_degraded();
            self.deliver_review(job, review)
                .await
                .map_err(AttemptFailure::from_delivery)?;
            return Ok(degraded);
        }

        let diff = self.load_diff(job).await?;
        let outcome = self.runner.run(&job.context(), &diff).await;
        for result in outcome.results() {
            self.store
                .append_stage_result(result)
                .await
                .map_err(|e| AttemptFailure::transient(e.to_string()))?;
        }

        match outcome {
            PipelineOutcome::Completed { review, .. } => {
                let degraded = review.is_degraded();
                self.deliver_review(job, review)
                    .await
                    .map_err(AttemptFailure::from_delivery)?;
                Ok(degraded)
            }
            PipelineOutcome::Failed { failure, .. } => Err(AttemptFailure {
                kind: failure.kind,
                message: failure.to_string(),
            }),
        }
    }

    async fn load_diff(&self, job: &Job) -> Result<String, AttemptFailure> {
        match &job.diff {
            DiffRef::Inline(text) => Ok(text.clone()),
            DiffRef::Remote => {
                if let Some(installation_id) = job.installation_id {
                    debug!(job_id = %job.id, installation_id, "Fetching diff");
                }
                self.diff_source
                    .fetch_diff(&job.repository, job.pr_number, job.installation_id)
                    .await
                    .map_err(|e| AttemptFailure::transient(format!("diff fetch failed: {}", e)))
            }
        }
    }

    /// Saves the review once and posts it once.
    ///
    /// Safe to call repeatedly for the same job: a review already marked
    /// posted is not posted again, and the comment sink skips bodies whose
    /// marker is already on the pull request.
    pub async fn deliver_review(
        &self,
        job: &Job,
        review: AggregatedReview,
    ) -> Result<DeliveredReview, LifecycleError> {
        let review = match self.store.get_aggregated_review(job.id).await? {
            Some(existing) => {
                if let (true, Some(comment_id)) = (existing.comment_posted, existing.comment_id) {
                    debug!(job_id = %job.id, comment_id, "Review already posted");
                    return Ok(DeliveredReview {
                        comment_id,
                        posted_now: false,
                    });
                }
                existing
            }
            None => {
                if self.store.save_aggregated_review(&review).await? {
                    review
                } else {
                    // Lost an insert race; post what the winner saved.
                    self.store
                        .get_aggregated_review(job.id)
                        .await?
                        .unwrap_or(review)
                }
            }
        };

        let posted = self
            .comment_sink
            .post_comment(&job.repository, job.pr_number, &review.body, &review.marker())
            .await?;
        self.store.mark_comment_posted(job.id, posted.id).await?;

        info!(
            job_id = %job.id,
            comment_id = posted.id,
            already_present = posted.already_present,
            degraded = review.is_degraded(),
            "Review delivered"
        );
        Ok(DeliveredReview {
            comment_id: posted.id,
            posted_now: !posted.already_present,
        })
    }

    async fn complete(&self, job: &Job, degraded: bool) -> Result<ProcessOutcome, LifecycleError> {
        let moved = self
            .store
            .update_status(job.id, JobStatus::Processing, JobStatus::Completed, job.attempts, None)
            .await?;
        if !moved {
            return Ok(self.lost_claim(job));
        }

        info!(job_id = %job.id, attempt = job.attempts, degraded, "Job completed");
        Ok(ProcessOutcome::Completed {
            job_id: job.id,
            attempt: job.attempts,
            degraded,
        })
    }

    async fn fail(
        &self,
        job: &Job,
        failure: AttemptFailure,
    ) -> Result<ProcessOutcome, LifecycleError> {
        let attempt = job.attempts;

        if !job.should_retry() {
            error!(
                job_id = %job.id,
                attempt,
                kind = %failure.kind,
                error = %failure.message,
                "Job failed, moving to dead letter queue"
            );
            if !self.dead_letter(job, &failure.message).await? {
                return Ok(self.lost_claim(job));
            }
            return Ok(ProcessOutcome::DeadLettered {
                job_id: job.id,
                attempt,
                error: failure.message,
            });
        }

        let moved = self
            .store
            .update_status(
                job.id,
                JobStatus::Processing,
                JobStatus::Retrying,
                attempt,
                Some(&failure.message),
            )
            .await?;
        if !moved {
            return Ok(self.lost_claim(job));
        }

        let delay = self.backoff.delay(attempt);
        let not_before = expiry_after(Utc::now(), delay);
        if !self.store.schedule_retry(job.id, attempt, not_before).await? {
            return Ok(self.lost_claim(job));
        }

        let mut next = job.clone();
        next.status = JobStatus::Queued;
        next.not_before = Some(not_before);
        next.last_error = Some(failure.message.clone());
        self.queue.schedule(&next, delay).await?;

        warn!(
            job_id = %job.id,
            attempt,
            remaining_attempts = job.remaining_attempts(),
            kind = %failure.kind,
            error = %failure.message,
            delay_secs = delay.as_secs(),
            "Job failed, retry scheduled"
        );
        Ok(ProcessOutcome::Retrying {
            job_id: job.id,
            attempt,
            delay,
        })
    }

    /// Persists `dead_lettered`, then records the dead letter entry.
    /// Returns false when the claim was lost.
    async fn dead_letter(&self, job: &Job, error: &str) -> Result<bool, LifecycleError> {
        let moved = self
            .store
            .update_status(
                job.id,
                job.status,
                JobStatus::DeadLettered,
                job.attempts,
                Some(error),
            )
            .await?;
        if !moved {
            return Ok(false);
        }

        let mut dead = job.clone();
        dead.status = JobStatus::DeadLettered;
        dead.last_error = Some(error.to_string());
        self.queue.dead_letter(&dead, error).await?;
        Ok(true)
    }

    fn lost_claim(&self, job: &Job) -> ProcessOutcome {
        warn!(
            job_id = %job.id,
            attempt = job.attempts,
            "Claim lost to another worker, discarding attempt"
        );
        ProcessOutcome::Skipped {
            job_id: job.id,
            reason: SkipReason::LostClaim,
        }
    }

    /// Operator action: puts a dead-lettered job back in the queue with a
    /// fresh attempt budget.
    pub async fn replay_dead_letter(&self, job_id: Uuid) -> Result<Job, LifecycleError> {
        let extra_attempts = self.replay_attempts.max(1);
        let job = self
            .store
            .reset_for_replay(job_id, extra_attempts)
            .await?
            .ok_or(LifecycleError::NotDeadLettered(job_id))?;

        if !self.queue.remove_dead_letter(job_id).await? {
            debug!(job_id = %job_id, "No dead letter entry to remove");
        }
        self.queue.enqueue(&job).await?;

        info!(
            job_id = %job_id,
            attempts = job.attempts,
            max_attempts = job.max_attempts,
            "Dead-lettered job replayed"
        );
        Ok(job)
    }

    /// Enqueues again every `queued` job left untouched for
    /// `stranded_after`.
    ///
    /// `submit` and `replay_dead_letter` persist the job before enqueueing
    /// it; when the enqueue fails the job has no delivery and only this
    /// sweep brings it back. A job that was merely waiting gets a second
    /// delivery, which the claim turns into a skip.
    pub async fn requeue_stranded(&self) -> Result<usize, LifecycleError> {
        let cutoff = older_than(Utc::now(), self.stranded_after);
        let stranded = self.store.take_stranded(cutoff, STRANDED_BATCH).await?;
        for job in &stranded {
            self.queue.enqueue(job).await?;
            warn!(
                job_id = %job.id,
                attempts = job.attempts,
                updated_at = %job.updated_at,
                "Re-enqueued stranded job"
            );
        }
        Ok(stranded.len())
    }
}

/// What a claim attempt left for `process` to do.
enum Claim {
    Owned(Job),
    /// The delivery was handled without running the pipeline.
    Settled(ProcessOutcome),
}

impl AttemptFailure {
    fn from_delivery(error: LifecycleError) -> Self {
        let kind = match &error {
            LifecycleError::Delivery(e) if !e.is_transient() => FailureKind::Permanent,
            _ => FailureKind::Transient,
        };
        Self {
            kind,
            message: format!("review delivery failed: {}", error),
        }
    }
}
