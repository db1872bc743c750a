//! In-process [`JobStore`] for tests and single-node development.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use super::store::{
    check_transition, expiry_after, older_than, ClaimOutcome, JobStore, StoreError,
};
use crate::pipeline::{AggregatedReview, StageResult};
use crate::scheduler::{Job, JobStatus};

#[derive(Debug, Clone)]
struct Lease {
    worker_id: String,
    expires_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct State {
    jobs: HashMap<Uuid, Job>,
    leases: HashMap<Uuid, Lease>,
    results: HashMap<Uuid, Vec<StageResult>>,
    reviews: HashMap<Uuid, AggregatedReview>,
}

/// Job store backed by a single mutex-guarded map.
///
/// Every operation takes the lock once, so the compare-and-set semantics
/// match the SQL store.
#[derive(Debug, Default)]
pub struct InMemoryJobStore {
    state: Mutex<State>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Worker currently holding the claim on a job, if any.
    pub fn claimed_by(&self, job_id: Uuid) -> Option<String> {
        self.lock().leases.get(&job_id).map(|l| l.worker_id.clone())
    }

    /// Forces the lease of a claimed job to expire, as if its worker died.
    pub fn expire_lease(&self, job_id: Uuid) {
        if let Some(lease) = self.lock().leases.get_mut(&job_id) {
            lease.expires_at = Utc::now() - chrono::Duration::seconds(1);
        }
    }

    pub fn job_count(&self) -> usize {
        self.lock().jobs.len()
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn create_job(&self, job: &Job) -> Result<(), StoreError> {
        let mut state = self.lock();
        if state.jobs.contains_key(&job.id) {
            return Err(StoreError::DuplicateJob(job.id));
        }
        state.jobs.insert(job.id, job.clone());
        Ok(())
    }

    async fn get_job(&self, job_id: Uuid) -> Result<Option<Job>, StoreError> {
        Ok(self.lock().jobs.get(&job_id).cloned())
    }

    async fn claim(
        &self,
        job_id: Uuid,
        worker_id: &str,
        lease: Duration,
    ) -> Result<ClaimOutcome, StoreError> {
        let now = Utc::now();
        let mut state = self.lock();
        let lease_expired = state
            .leases
            .get(&job_id)
            .is_none_or(|l| l.expires_at <= now);

        let Some(job) = state.jobs.get_mut(&job_id) else {
            return Ok(ClaimOutcome::NotFound);
        };

        let claimable = match job.status {
            JobStatus::Queued => match job.not_before {
                Some(not_before) if not_before > now => {
                    return Ok(ClaimOutcome::NotYetDue { not_before });
                }
                _ => true,
            },
            JobStatus::Processing => lease_expired,
            JobStatus::Retrying => job.updated_at <= older_than(now, lease),
            _ => false,
        };
        if !claimable {
            return Ok(ClaimOutcome::Conflict { status: job.status });
        }
        if !job.should_retry() {
            return Ok(match job.status {
                JobStatus::Processing | JobStatus::Retrying => ClaimOutcome::Exhausted(job.clone()),
                status => ClaimOutcome::Conflict { status },
            });
        }

        job.status = JobStatus::Processing;
        job.attempts += 1;
        job.not_before = None;
        job.updated_at = now;
        let claimed = job.clone();

        state.leases.insert(
            job_id,
            Lease {
                worker_id: worker_id.to_string(),
                expires_at: expiry_after(now, lease),
            },
        );
        Ok(ClaimOutcome::Claimed(claimed))
    }

    async fn update_status(
        &self,
        job_id: Uuid,
        from: JobStatus,
        to: JobStatus,
        attempt: u32,
        error: Option<&str>,
    ) -> Result<bool, StoreError> {
        check_transition(from, to)?;
        let mut state = self.lock();
        let Some(job) = state.jobs.get_mut(&job_id) else {
            return Err(StoreError::NotFound(job_id));
        };
        if job.status != from || job.attempts != attempt {
            return Ok(false);
        }

        job.status = to;
        job.updated_at = Utc::now();
        if let Some(error) = error {
            job.last_error = Some(error.to_string());
        }
        if to != JobStatus::Processing {
            state.leases.remove(&job_id);
        }
        Ok(true)
    }

    async fn schedule_retry(
        &self,
        job_id: Uuid,
        attempt: u32,
        not_before: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let mut state = self.lock();
        let Some(job) = state.jobs.get_mut(&job_id) else {
            return Err(StoreError::NotFound(job_id));
        };
        if job.status != JobStatus::Retrying || job.attempts != attempt {
            return Ok(false);
        }
        job.status = JobStatus::Queued;
        job.not_before = Some(not_before);
        job.updated_at = Utc::now();
        Ok(true)
    }

    async fn append_stage_result(&self, result: &StageResult) -> Result<(), StoreError> {
        self.lock()
            .results
            .entry(result.job_id)
            .or_default()
            .push(result.clone());
        Ok(())
    }

    async fn stage_results(&self, job_id: Uuid) -> Result<Vec<StageResult>, StoreError> {
        Ok(self.lock().results.get(&job_id).cloned().unwrap_or_default())
    }

    async fn save_aggregated_review(&self, review: &AggregatedReview) -> Result<bool, StoreError> {
        let mut state = self.lock();
        if state.reviews.contains_key(&review.job_id) {
            return Ok(false);
        }
        state.reviews.insert(review.job_id, review.clone());
        Ok(true)
    }

    async fn get_aggregated_review(
        &self,
        job_id: Uuid,
    ) -> Result<Option<AggregatedReview>, StoreError> {
        Ok(self.lock().reviews.get(&job_id).cloned())
    }

    async fn mark_comment_posted(&self, job_id: Uuid, comment_id: u64) -> Result<bool, StoreError> {
        let mut state = self.lock();
        match state.reviews.get_mut(&job_id) {
            Some(review) if !review.comment_posted => {
                review.comment_posted = true;
                review.comment_id = Some(comment_id);
                Ok(true)
            }
            Some(_) => Ok(false),
            None => Err(StoreError::NotFound(job_id)),
        }
    }

    async fn reset_for_replay(
        &self,
        job_id: Uuid,
        extra_attempts: u32,
    ) -> Result<Option<Job>, StoreError> {
        let mut state = self.lock();
        let Some(job) = state.jobs.get_mut(&job_id) else {
            return Ok(None);
        };
        if job.status != JobStatus::DeadLettered {
            return Ok(None);
        }
        job.status = JobStatus::Queued;
        job.max_attempts = job.attempts.saturating_add(extra_attempts);
        job.last_error = None;
        job.not_before = None;
        job.updated_at = Utc::now();
        let job = job.clone();
        state.leases.remove(&job_id);
        Ok(Some(job))
    }

    async fn count_by_status(&self) -> Result<HashMap<JobStatus, u64>, StoreError> {
        let mut counts = HashMap::new();
        for job in self.lock().jobs.values() {
            *counts.entry(job.status).or_insert(0) += 1;
        }
        Ok(counts)
    }

    async fn take_stranded(
        &self,
        cutoff: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Job>, StoreError> {
        let now = Utc::now();
        let mut state = self.lock();
        let mut stranded: Vec<&mut Job> = state
            .jobs
            .values_mut()
            .filter(|job| {
                job.status == JobStatus::Queued
                    && job.updated_at <= cutoff
                    && job.not_before.is_none_or(|t| t <= cutoff)
            })
            .collect();
        stranded.sort_by_key(|job| job.updated_at);

        Ok(stranded
            .into_iter()
            .take(limit)
            .map(|job| {
                job.updated_at = now;
                job.clone()
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::{StageError, StageName};

    const LEASE: Duration = Duration::from_secs(60);

    async fn stored_job(store: &InMemoryJobStore, max_attempts: u32) -> Job {
        let job = Job::new("acme/api", 7).with_max_attempts(max_attempts);
        store.create_job(&job).await.unwrap();
        job
    }

    #[tokio::test]
    async fn test_duplicate_job_rejected() {
        let store = InMemoryJobStore::new();
        let job = stored_job(&store, 3).await;
        assert!(matches!(
            store.create_job(&job).await,
            Err(StoreError::DuplicateJob(id)) if id == job.id
        ));
    }

    #[tokio::test]
    async fn test_claim_increments_attempts_and_blocks_second_worker() {
        let store = InMemoryJobStore::new();
        let job = stored_job(&store, 3).await;

        let first = store.claim(job.id, "w1", LEASE).await.unwrap();
        let ClaimOutcome::Claimed(claimed) = first else {
            panic!("expected claim, got {:?}", first);
        };
        assert_eq!(claimed.attempts, 1);
        assert_eq!(claimed.status, JobStatus::Processing);
        assert_eq!(store.claimed_by(job.id).as_deref(), Some("w1"));

        let second = store.claim(job.id, "w2", LEASE).await.unwrap();
        assert_eq!(
            second,
            ClaimOutcome::Conflict {
                status: JobStatus::Processing
            }
        );
    }

    #[tokio::test]
    async fn test_expired_lease_can_be_reclaimed() {
        let store = InMemoryJobStore::new();
        let job = stored_job(&store, 3).await;
        store.claim(job.id, "w1", LEASE).await.unwrap();
        store.expire_lease(job.id);

        let outcome = store.claim(job.id, "w2", LEASE).await.unwrap();
        let ClaimOutcome::Claimed(claimed) = outcome else {
            panic!("expected reclaim, got {:?}", outcome);
        };
        assert_eq!(claimed.attempts, 2);
        assert_eq!(store.claimed_by(job.id).as_deref(), Some("w2"));

        // The first worker's stale update is refused.
        let stale = store
            .update_status(job.id, JobStatus::Processing, JobStatus::Completed, 1, None)
            .await
            .unwrap();
        assert!(!stale);
    }

    #[tokio::test]
    async fn test_expired_lease_without_budget_is_exhausted() {
        let store = InMemoryJobStore::new();
        let job = stored_job(&store, 1).await;
        store.claim(job.id, "w1", LEASE).await.unwrap();
        store.expire_lease(job.id);

        let outcome = store.claim(job.id, "w2", LEASE).await.unwrap();
        assert!(matches!(outcome, ClaimOutcome::Exhausted(ref j) if j.attempts == 1));
    }

    #[tokio::test]
    async fn test_stale_retrying_job_can_be_reclaimed() {
        let store = InMemoryJobStore::new();
        let job = stored_job(&store, 3).await;
        store.claim(job.id, "w1", LEASE).await.unwrap();
        // w1 dies between persisting `retrying` and scheduling the retry.
        assert!(store
            .update_status(job.id, JobStatus::Processing, JobStatus::Retrying, 1, Some("boom"))
            .await
            .unwrap());

        let fresh = store.claim(job.id, "w2", LEASE).await.unwrap();
        assert_eq!(fresh, ClaimOutcome::Conflict { status: JobStatus::Retrying });

        let outcome = store.claim(job.id, "w2", Duration::ZERO).await.unwrap();
        let ClaimOutcome::Claimed(claimed) = outcome else {
            panic!("expected reclaim, got {:?}", outcome);
        };
        assert_eq!(claimed.status, JobStatus::Processing);
        assert_eq!(claimed.attempts, 2);
        assert_eq!(store.claimed_by(job.id).as_deref(), Some("w2"));
    }

    #[tokio::test]
    async fn test_stale_retrying_job_without_budget_is_exhausted() {
        let store = InMemoryJobStore::new();
        let job = stored_job(&store, 1).await;
        store.claim(job.id, "w1", LEASE).await.unwrap();
        store
            .update_status(job.id, JobStatus::Processing, JobStatus::Retrying, 1, None)
            .await
            .unwrap();

        let outcome = store.claim(job.id, "w2", Duration::ZERO).await.unwrap();
        assert!(matches!(
            outcome,
            ClaimOutcome::Exhausted(ref j) if j.status == JobStatus::Retrying && j.attempts == 1
        ));
    }

    #[tokio::test]
    async fn test_take_stranded_returns_old_queued_jobs_once() {
        let store = InMemoryJobStore::new();
        let before = Utc::now() - chrono::Duration::seconds(1);
        let waiting = stored_job(&store, 3).await;
        let running = stored_job(&store, 3).await;
        store.claim(running.id, "w1", LEASE).await.unwrap();

        assert!(store.take_stranded(before, 10).await.unwrap().is_empty());

        let cutoff = Utc::now();
        tokio::time::sleep(Duration::from_millis(5)).await;
        let stranded = store.take_stranded(cutoff, 10).await.unwrap();
        assert_eq!(stranded.len(), 1);
        assert_eq!(stranded[0].id, waiting.id);
        assert_eq!(stranded[0].status, JobStatus::Queued);

        // Stamped: the same sweep does not return it again.
        assert!(store.take_stranded(cutoff, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_retry_not_due_until_backoff_elapses() {
        let store = InMemoryJobStore::new();
        let job = stored_job(&store, 3).await;
        store.claim(job.id, "w1", LEASE).await.unwrap();
        assert!(store
            .update_status(job.id, JobStatus::Processing, JobStatus::Retrying, 1, Some("timeout"))
            .await
            .unwrap());

        let not_before = Utc::now() + chrono::Duration::seconds(30);
        assert!(store.schedule_retry(job.id, 1, not_before).await.unwrap());

        let outcome = store.claim(job.id, "w1", LEASE).await.unwrap();
        assert_eq!(outcome, ClaimOutcome::NotYetDue { not_before });

        let stored = store.get_job(job.id).await.unwrap().unwrap();
        assert_eq!(stored.last_error.as_deref(), Some("timeout"));
        assert_eq!(stored.attempts, 1);
    }

    #[tokio::test]
    async fn test_illegal_transition_rejected() {
        let store = InMemoryJobStore::new();
        let job = stored_job(&store, 3).await;
        let result = store
            .update_status(job.id, JobStatus::Queued, JobStatus::Completed, 0, None)
            .await;
        assert!(matches!(result, Err(StoreError::InvalidTransition { .. })));
    }

    #[tokio::test]
    async fn test_review_saved_once_and_comment_marked_once() {
        let store = InMemoryJobStore::new();
        let job = stored_job(&store, 3).await;
        let results = vec![StageResult::failure(
            job.id,
            1,
            StageName::Stylist,
            StageError::permanent("bad request"),
            5,
            "gpt-4o-mini",
        )];
        let review = AggregatedReview::assemble(job.id, 1, "Looks fine.", &results);

        assert!(store.save_aggregated_review(&review).await.unwrap());
        assert!(!store.save_aggregated_review(&review).await.unwrap());

        assert!(store.mark_comment_posted(job.id, 42).await.unwrap());
        assert!(!store.mark_comment_posted(job.id, 43).await.unwrap());
        let stored = store.get_aggregated_review(job.id).await.unwrap().unwrap();
        assert_eq!(stored.comment_id, Some(42));
        assert_eq!(stored.unavailable, vec![StageName::Stylist]);
    }

    #[tokio::test]
    async fn test_replay_restores_budget() {
        let store = InMemoryJobStore::new();
        let job = stored_job(&store, 1).await;
        store.claim(job.id, "w1", LEASE).await.unwrap();
        store
            .update_status(job.id, JobStatus::Processing, JobStatus::DeadLettered, 1, Some("boom"))
            .await
            .unwrap();

        let replayed = store.reset_for_replay(job.id, 2).await.unwrap().unwrap();
        assert_eq!(replayed.status, JobStatus::Queued);
        assert_eq!(replayed.attempts, 1);
        assert_eq!(replayed.max_attempts, 3);
        assert!(replayed.last_error.is_none());

        // Only dead-lettered jobs can be replayed.
        assert!(store.reset_for_replay(job.id, 2).await.unwrap().is_none());

        let counts = store.count_by_status().await.unwrap();
        assert_eq!(counts.get(&JobStatus::Queued), Some(&1));
    }
}
