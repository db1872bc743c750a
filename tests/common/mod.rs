//! Fakes shared by the integration tests.
//!
//! Every stage of the test plan is charged to one `fake` service and uses
//! its own stage name as the model, so a scripted generator can tell the
//! stages apart by `request.model`.

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use review_forge::github::{CommentSink, DiffSource, GitHubError, PostedComment};
use review_forge::llm::{GenerationRequest, GenerationResponse, TextGenerator, Usage};
use review_forge::pipeline::{
    AggregatedReview, CapabilityRegistry, PipelineRunner, StageExecutor, StageName, StagePlan,
    StageResult,
};
use review_forge::ratelimit::{BudgetConfig, RateLimiter};
use review_forge::scheduler::{
    BackoffPolicy, DeadLetterEntry, Delivery, InMemoryJobQueue, Job, JobLifecycleManager,
    JobQueue, JobStatus, ProcessOutcome, QueueError, QueueStats, DEFAULT_STRANDED_AFTER,
};
use review_forge::storage::{ClaimOutcome, InMemoryJobStore, JobStore, StoreError};
use uuid::Uuid;
use review_forge::LlmError;

pub const SERVICE: &str = "fake";

pub const SAMPLE_DIFF: &str = "\
diff --git a/src/auth.rs b/src/auth.rs
index 3b18e51..a4c2f9d 100644
--- a/src/auth.rs
+++ b/src/auth.rs
@@ -10,6 +10,12 @@ pub fn login(user: &str, password: &str) -> Result<Session, AuthError> {
     let record = users::find(user)?;
-    if record.password == password {
+    let query = format!(\"SELECT * FROM users WHERE name = '{}'\", user);
+    let row = db::query(&query)?;
+    if row.password == password {
         return Ok(Session::new(record.id));
     }
     Err(AuthError::InvalidCredentials)
 }
diff --git a/Cargo.lock b/Cargo.lock
index 1111111..2222222 100644
--- a/Cargo.lock
+++ b/Cargo.lock
@@ -1 +1 @@
-checksum = \"abc\"
+checksum = \"def\"
";

pub const LOCKFILE_DIFF: &str = "\
diff --git a/Cargo.lock b/Cargo.lock
index 1111111..2222222 100644
--- a/Cargo.lock
+++ b/Cargo.lock
@@ -1 +1 @@
-checksum = \"abc\"
+checksum = \"def\"
diff --git a/web/package-lock.json b/web/package-lock.json
index 3333333..4444444 100644
--- a/web/package-lock.json
+++ b/web/package-lock.json
@@ -1 +1 @@
-  \"version\": \"1.0.0\"
+  \"version\": \"1.0.1\"
";

/// What the generator does for one call.
pub enum Step {
    Reply(String),
    Fail(fn() -> LlmError),
    /// Never returns; the stage timeout fires.
    Hang,
    /// Replies with the default text after a delay.
    Delay(Duration),
}

pub fn server_error() -> LlmError {
    LlmError::ApiError {
        code: 503,
        message: "overloaded".to_string(),
    }
}

pub fn bad_request() -> LlmError {
    LlmError::ApiError {
        code: 400,
        message: "invalid request".to_string(),
    }
}

/// Text generator replaying per-stage scripts. Stages without a script left
/// reply `"<stage> findings"`.
#[derive(Default)]
pub struct ScriptedGenerator {
    scripts: Mutex<HashMap<String, VecDeque<Step>>>,
    calls: Mutex<Vec<String>>,
}

impl ScriptedGenerator {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Queues `steps` for the next calls of `stage`.
    pub fn script(&self, stage: StageName, steps: impl IntoIterator<Item = Step>) {
        self.scripts
            .lock()
            .unwrap()
            .entry(stage.as_str().to_string())
            .or_default()
            .extend(steps);
    }

    /// Models called so far, in call order.
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn calls_for(&self, stage: StageName) -> usize {
        self.calls()
            .iter()
            .filter(|model| model.as_str() == stage.as_str())
            .count()
    }
}

#[async_trait]
impl TextGenerator for ScriptedGenerator {
    fn service_name(&self) -> &str {
        SERVICE
    }

    async fn generate(&self, request: GenerationRequest) -> Result<GenerationResponse, LlmError> {
        let model = request.model.clone();
        self.calls.lock().unwrap().push(model.clone());
        let step = self
            .scripts
            .lock()
            .unwrap()
            .get_mut(&model)
            .and_then(VecDeque::pop_front);

        let default_text = format!("{} findings", model);
        let text = match step {
            None => default_text,
            Some(Step::Reply(text)) => text,
            Some(Step::Fail(make)) => return Err(make()),
            Some(Step::Hang) => {
                std::future::pending::<()>().await;
                unreachable!()
            }
            Some(Step::Delay(delay)) => {
                tokio::time::sleep(delay).await;
                default_text
            }
        };
        Ok(GenerationResponse::text(model, text, Usage::new(400, 100)))
    }
}

/// Default plan with every stage on the fake service.
pub fn test_plan() -> StagePlan {
    StageName::ALL
        .into_iter()
        .fold(StagePlan::default_plan(), |plan, stage| {
            plan.with_service(stage, SERVICE).with_model(stage, stage.as_str())
        })
}

pub fn limiter() -> Arc<RateLimiter> {
    let limiter = RateLimiter::new();
    limiter
        .register(SERVICE, BudgetConfig::new(1000, 1000.0))
        .unwrap();
    Arc::new(limiter)
}

pub fn runner(generator: Arc<ScriptedGenerator>, stage_timeout: Duration) -> PipelineRunner {
    let executor = StageExecutor::new(limiter()).with_stage_timeout(stage_timeout);
    let capabilities = CapabilityRegistry::new().with(generator as Arc<dyn TextGenerator>);
    PipelineRunner::new(executor, test_plan(), capabilities)
}

/// Diff source returning a fixed diff after `failures` transient errors.
pub struct StaticDiffSource {
    diff: String,
    failures_left: AtomicU32,
    fetches: AtomicU32,
}

impl StaticDiffSource {
    pub fn new(diff: &str) -> Arc<Self> {
        Self::failing(diff, 0)
    }

    pub fn failing(diff: &str, failures: u32) -> Arc<Self> {
        Arc::new(Self {
            diff: diff.to_string(),
            failures_left: AtomicU32::new(failures),
            fetches: AtomicU32::new(0),
        })
    }

    pub fn fetches(&self) -> u32 {
        self.fetches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DiffSource for StaticDiffSource {
    async fn fetch_diff(
        &self,
        _repository: &str,
        _pr_number: u64,
        _installation_id: Option<u64>,
    ) -> Result<String, GitHubError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        let failed = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if failed {
            return Err(GitHubError::Status {
                status: 502,
                body: "Bad Gateway".to_string(),
            });
        }
        Ok(self.diff.clone())
    }
}

#[derive(Debug, Clone)]
pub struct PostedBody {
    pub id: u64,
    pub repository: String,
    pub pr_number: u64,
    pub body: String,
}

/// Comment sink that keeps comments in memory and honours the marker.
///
/// `lose_acks` makes the next N posts succeed server-side but report a
/// transient error, as a dropped response would.
#[derive(Default)]
pub struct RecordingSink {
    comments: Mutex<Vec<PostedBody>>,
    lose_acks: AtomicU32,
}

impl RecordingSink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn losing_acks(count: u32) -> Arc<Self> {
        let sink = Self::default();
        sink.lose_acks.store(count, Ordering::SeqCst);
        Arc::new(sink)
    }

    pub fn comments(&self) -> Vec<PostedBody> {
        self.comments.lock().unwrap().clone()
    }
}

#[async_trait]
impl CommentSink for RecordingSink {
    async fn post_comment(
        &self,
        repository: &str,
        pr_number: u64,
        body: &str,
        marker: &str,
    ) -> Result<PostedComment, GitHubError> {
        let mut comments = self.comments.lock().unwrap();
        if let Some(existing) = comments.iter().find(|c| c.body.contains(marker)) {
            return Ok(PostedComment {
                id: existing.id,
                already_present: true,
            });
        }

        let id = 1000 + comments.len() as u64;
        comments.push(PostedBody {
            id,
            repository: repository.to_string(),
            pr_number,
            body: body.to_string(),
        });
        drop(comments);

        let lost = self
            .lose_acks
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if lost {
            return Err(GitHubError::Request("connection reset".to_string()));
        }
        Ok(PostedComment {
            id,
            already_present: false,
        })
    }
}

/// Store and queue operations that can be made to fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Fault {
    Enqueue,
    Schedule,
    QueueDeadLetter,
    UpdateStatus,
    ScheduleRetry,
}

/// Failures armed per operation; each armed failure fires once.
#[derive(Default)]
pub struct Faults {
    armed: Mutex<HashMap<Fault, u32>>,
}

impl Faults {
    /// Makes the next `times` calls of `fault` fail.
    pub fn arm(&self, fault: Fault, times: u32) {
        *self.armed.lock().unwrap().entry(fault).or_default() += times;
    }

    fn trip(&self, fault: Fault) -> bool {
        match self.armed.lock().unwrap().get_mut(&fault) {
            Some(left) if *left > 0 => {
                *left -= 1;
                true
            }
            _ => false,
        }
    }

    fn queue(&self, fault: Fault) -> Result<(), QueueError> {
        if self.trip(fault) {
            return Err(QueueError::ConnectionFailed(format!("{:?} failed", fault)));
        }
        Ok(())
    }

    fn store(&self, fault: Fault) -> Result<(), StoreError> {
        if self.trip(fault) {
            return Err(StoreError::ConnectionFailed(format!("{:?} failed", fault)));
        }
        Ok(())
    }
}

/// In-memory queue that fails the operations armed in `faults`.
pub struct FaultyQueue {
    inner: Arc<InMemoryJobQueue>,
    faults: Arc<Faults>,
}

#[async_trait]
impl JobQueue for FaultyQueue {
    async fn enqueue(&self, job: &Job) -> Result<(), QueueError> {
        self.faults.queue(Fault::Enqueue)?;
        self.inner.enqueue(job).await
    }

    async fn schedule(&self, job: &Job, delay: Duration) -> Result<(), QueueError> {
        self.faults.queue(Fault::Schedule)?;
        self.inner.schedule(job, delay).await
    }

    async fn dequeue(&self, timeout: Duration) -> Result<Option<Delivery>, QueueError> {
        self.inner.dequeue(timeout).await
    }

    async fn ack(&self, delivery: &Delivery) -> Result<(), QueueError> {
        self.inner.ack(delivery).await
    }

    async fn dead_letter(&self, job: &Job, error: &str) -> Result<(), QueueError> {
        self.faults.queue(Fault::QueueDeadLetter)?;
        self.inner.dead_letter(job, error).await
    }

    async fn recover_expired(&self) -> Result<usize, QueueError> {
        self.inner.recover_expired().await
    }

    async fn promote_due(&self) -> Result<usize, QueueError> {
        self.inner.promote_due().await
    }

    async fn stats(&self) -> Result<QueueStats, QueueError> {
        self.inner.stats().await
    }

    async fn peek_dead_letter(&self, limit: usize) -> Result<Vec<DeadLetterEntry>, QueueError> {
        self.inner.peek_dead_letter(limit).await
    }

    async fn remove_dead_letter(&self, job_id: Uuid) -> Result<bool, QueueError> {
        self.inner.remove_dead_letter(job_id).await
    }
}

/// In-memory store that fails the operations armed in `faults`.
pub struct FaultyStore {
    inner: Arc<InMemoryJobStore>,
    faults: Arc<Faults>,
}

#[async_trait]
impl JobStore for FaultyStore {
    async fn create_job(&self, job: &Job) -> Result<(), StoreError> {
        self.inner.create_job(job).await
    }

    async fn get_job(&self, job_id: Uuid) -> Result<Option<Job>, StoreError> {
        self.inner.get_job(job_id).await
    }

    async fn claim(
        &self,
        job_id: Uuid,
        worker_id: &str,
        lease: Duration,
    ) -> Result<ClaimOutcome, StoreError> {
        self.inner.claim(job_id, worker_id, lease).await
    }

    async fn update_status(
        &self,
        job_id: Uuid,
        from: JobStatus,
        to: JobStatus,
        attempt: u32,
        error: Option<&str>,
    ) -> Result<bool, StoreError> {
        self.faults.store(Fault::UpdateStatus)?;
        self.inner.update_status(job_id, from, to, attempt, error).await
    }

    async fn schedule_retry(
        &self,
        job_id: Uuid,
        attempt: u32,
        not_before: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        self.faults.store(Fault::ScheduleRetry)?;
        self.inner.schedule_retry(job_id, attempt, not_before).await
    }

    async fn append_stage_result(&self, result: &StageResult) -> Result<(), StoreError> {
        self.inner.append_stage_result(result).await
    }

    async fn stage_results(&self, job_id: Uuid) -> Result<Vec<StageResult>, StoreError> {
        self.inner.stage_results(job_id).await
    }

    async fn save_aggregated_review(&self, review: &AggregatedReview) -> Result<bool, StoreError> {
        self.inner.save_aggregated_review(review).await
    }

    async fn get_aggregated_review(
        &self,
        job_id: Uuid,
    ) -> Result<Option<AggregatedReview>, StoreError> {
        self.inner.get_aggregated_review(job_id).await
    }

    async fn mark_comment_posted(&self, job_id: Uuid, comment_id: u64) -> Result<bool, StoreError> {
        self.inner.mark_comment_posted(job_id, comment_id).await
    }

    async fn reset_for_replay(
        &self,
        job_id: Uuid,
        extra_attempts: u32,
    ) -> Result<Option<Job>, StoreError> {
        self.inner.reset_for_replay(job_id, extra_attempts).await
    }

    async fn count_by_status(&self) -> Result<HashMap<JobStatus, u64>, StoreError> {
        self.inner.count_by_status().await
    }

    async fn take_stranded(
        &self,
        cutoff: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Job>, StoreError> {
        self.inner.take_stranded(cutoff, limit).await
    }
}

/// Lifecycle manager over in-memory store and queue with millisecond backoff.
///
/// The manager reaches `store` and `queue` through wrappers that fail the
/// operations armed in `faults`; tests use `store` and `queue` directly.
pub struct Harness {
    pub store: Arc<InMemoryJobStore>,
    pub queue: Arc<InMemoryJobQueue>,
    pub generator: Arc<ScriptedGenerator>,
    pub diff_source: Arc<StaticDiffSource>,
    pub sink: Arc<RecordingSink>,
    pub lifecycle: Arc<JobLifecycleManager>,
    pub faults: Arc<Faults>,
}

pub struct HarnessBuilder {
    generator: Arc<ScriptedGenerator>,
    diff_source: Arc<StaticDiffSource>,
    sink: Arc<RecordingSink>,
    stage_timeout: Duration,
    job_timeout: Duration,
    claim_lease: Duration,
    stranded_after: Duration,
    replay_attempts: u32,
}

impl Harness {
    pub fn builder() -> HarnessBuilder {
        HarnessBuilder {
            generator: ScriptedGenerator::new(),
            diff_source: StaticDiffSource::new(SAMPLE_DIFF),
            sink: RecordingSink::new(),
            stage_timeout: Duration::from_secs(5),
            job_timeout: Duration::from_secs(20),
            claim_lease: Duration::from_secs(30),
            stranded_after: DEFAULT_STRANDED_AFTER,
            replay_attempts: 2,
        }
    }

    pub fn new() -> Self {
        Self::builder().build()
    }

    /// Dequeues the next delivery, waiting up to two seconds.
    pub async fn next_delivery(&self) -> Option<Delivery> {
        self.queue.dequeue(Duration::from_secs(2)).await.unwrap()
    }

    /// Dequeues and processes the next delivery as `worker_id`.
    pub async fn process_next(&self, worker_id: &str) -> Option<ProcessOutcome> {
        let delivery = self.next_delivery().await?;
        Some(self.lifecycle.process(worker_id, &delivery).await.unwrap())
    }
}

impl HarnessBuilder {
    pub fn generator(mut self, generator: Arc<ScriptedGenerator>) -> Self {
        self.generator = generator;
        self
    }

    pub fn diff_source(mut self, diff_source: Arc<StaticDiffSource>) -> Self {
        self.diff_source = diff_source;
        self
    }

    pub fn sink(mut self, sink: Arc<RecordingSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn stage_timeout(mut self, timeout: Duration) -> Self {
        self.stage_timeout = timeout;
        self
    }

    pub fn claim_lease(mut self, lease: Duration) -> Self {
        self.claim_lease = lease;
        self
    }

    pub fn stranded_after(mut self, age: Duration) -> Self {
        self.stranded_after = age;
        self
    }

    pub fn replay_attempts(mut self, attempts: u32) -> Self {
        self.replay_attempts = attempts;
        self
    }

    pub fn build(self) -> Harness {
        let store = Arc::new(InMemoryJobStore::new());
        let queue = Arc::new(InMemoryJobQueue::new("test-reviews"));
        let faults = Arc::new(Faults::default());
        let runner = Arc::new(runner(Arc::clone(&self.generator), self.stage_timeout));

        let lifecycle = JobLifecycleManager::new(
            Arc::new(FaultyStore {
                inner: Arc::clone(&store),
                faults: Arc::clone(&faults),
            }),
            Arc::new(FaultyQueue {
                inner: Arc::clone(&queue),
                faults: Arc::clone(&faults),
            }),
            runner,
            Arc::clone(&self.diff_source) as Arc<dyn DiffSource>,
            Arc::clone(&self.sink) as Arc<dyn CommentSink>,
        )
        .with_backoff(BackoffPolicy::new(
            Duration::from_millis(10),
            Duration::from_millis(40),
        ))
        .with_claim_lease(self.claim_lease)
        .with_job_timeout(self.job_timeout)
        .with_stranded_after(self.stranded_after)
        .with_replay_attempts(self.replay_attempts);

        Harness {
            store,
            queue,
            generator: self.generator,
            diff_source: self.diff_source,
            sink: self.sink,
            lifecycle: Arc::new(lifecycle),
            faults,
        }
    }
}
