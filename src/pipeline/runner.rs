//! Pipeline runner: Scout, then the analyses concurrently, then Synthesizer.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use futures::future::join_all;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::executor::StageExecutor;
use super::plan::{StageDescriptor, StagePlan};
use super::prompts::PromptInput;
use super::report::{render_analyses, AggregatedReview, NO_CHANGES_NOTE};
use super::stage::{FailureKind, StageError, StageName, StageResult};
use crate::diff::{DiffLimits, FilteredDiff, NoiseFilter};
use crate::llm::TextGenerator;

/// Identity of the job attempt a pipeline run belongs to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobContext {
    pub job_id: Uuid,
    pub attempt: u32,
    pub repository: String,
    pub pr_number: u64,
    pub title: Option<String>,
}

/// Text generators keyed by service name.
#[derive(Clone, Default)]
pub struct CapabilityRegistry {
    generators: HashMap<String, Arc<dyn TextGenerator>>,
}

impl CapabilityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a generator under its own service name.
    pub fn register(&mut self, generator: Arc<dyn TextGenerator>) {
        self.generators
            .insert(generator.service_name().to_string(), generator);
    }

    pub fn with(mut self, generator: Arc<dyn TextGenerator>) -> Self {
        self.register(generator);
        self
    }

    pub fn get(&self, service: &str) -> Option<&Arc<dyn TextGenerator>> {
        self.generators.get(service)
    }

    pub fn services(&self) -> impl Iterator<Item = &str> {
        self.generators.keys().map(String::as_str)
    }
}

impl fmt::Debug for CapabilityRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CapabilityRegistry")
            .field("services", &self.generators.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Why a pipeline run produced no review.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineFailure {
    pub stage: StageName,
    pub kind: FailureKind,
    pub message: String,
}

impl fmt::Display for PipelineFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} failure: {}", self.stage, self.kind, self.message)
    }
}

/// Result of one pipeline run. Both variants carry every stage result
/// produced, for audit.
#[derive(Debug, Clone)]
pub enum PipelineOutcome {
    Completed {
        review: AggregatedReview,
        results: Vec<StageResult>,
    },
    Failed {
        failure: PipelineFailure,
        results: Vec<StageResult>,
    },
}

impl PipelineOutcome {
    pub fn results(&self) -> &[StageResult] {
        match self {
            PipelineOutcome::Completed { results, .. }
            | PipelineOutcome::Failed { results, .. } => results,
        }
    }

    pub fn is_completed(&self) -> bool {
        matches!(self, PipelineOutcome::Completed { .. })
    }
}

/// Runs the five-stage review plan for one job attempt.
pub struct PipelineRunner {
    executor: StageExecutor,
    plan: StagePlan,
    capabilities: CapabilityRegistry,
    noise_filter: NoiseFilter,
    diff_limits: DiffLimits,
}

impl PipelineRunner {
    pub fn new(executor: StageExecutor, plan: StagePlan, capabilities: CapabilityRegistry) -> Self {
        Self {
            executor,
            plan,
            capabilities,
            noise_filter: NoiseFilter::new(),
            diff_limits: DiffLimits::default(),
        }
    }

    pub fn with_diff_limits(mut self, diff_limits: DiffLimits) -> Self {
        self.diff_limits = diff_limits;
        self
    }

    pub fn with_noise_filter(mut self, noise_filter: NoiseFilter) -> Self {
        self.noise_filter = noise_filter;
        self
    }

    pub fn plan(&self) -> &StagePlan {
        &self.plan
    }

    /// Runs the pipeline on a raw diff.
    pub async fn run(&self, job: &JobContext, raw_diff: &str) -> PipelineOutcome {
        let mut results = Vec::with_capacity(StageName::ALL.len());
        let mut filtered = self.noise_filter.process(raw_diff, &self.diff_limits);

        let mut input = PromptInput {
            repository: job.repository.clone(),
            pr_number: job.pr_number,
            title: job.title.clone().unwrap_or_default(),
            language: filtered.language.clone(),
            files: filtered.summary(),
            diff: filtered.text.clone(),
            analyses: String::new(),
        };

        // Scout
        let scout = if filtered.is_empty() {
            info!(
                job_id = %job.job_id,
                dropped = filtered.dropped_files.len(),
                "No reviewable changes after filtering"
            );
            StageResult::local(
                job.job_id,
                job.attempt,
                StageName::Scout,
                format!(
                    "No reviewable changes; {} file(s) filtered as noise.",
                    filtered.dropped_files.len()
                ),
            )
        } else {
            self.execute(job, StageName::Scout, &input).await
        };

        if !scout.is_success() {
            let failure = failure_of(&scout);
            results.push(scout);
            return PipelineOutcome::Failed { failure, results };
        }
        if !filtered.is_empty() {
            filtered.text = scout.output.clone();
            input.diff = filtered.text.clone();
        }
        results.push(scout);

        // Guardian, Architect, Stylist
        let analyses = self.run_analyses(job, &filtered, &input).await;
        results.extend(analyses);

        // Synthesizer
        input.analyses = render_analyses(&results);
        if filtered.is_empty() {
            input.files = "(no reviewable files)".to_string();
        }
        let synthesis = self.execute(job, StageName::Synthesizer, &input).await;
        if !synthesis.is_success() {
            let failure = failure_of(&synthesis);
            results.push(synthesis);
            return PipelineOutcome::Failed { failure, results };
        }

        let summary = synthesis.output.clone();
        results.push(synthesis);
        let review = AggregatedReview::assemble(job.job_id, job.attempt, &summary, &results);

        if review.is_degraded() {
            warn!(
                job_id = %job.job_id,
                unavailable = ?review.unavailable,
                "Review completed without some analyses"
            );
        }
        PipelineOutcome::Completed { review, results }
    }

    async fn run_analyses(
        &self,
        job: &JobContext,
        filtered: &FilteredDiff,
        input: &PromptInput,
    ) -> Vec<StageResult> {
        if filtered.is_empty() {
            debug!(job_id = %job.job_id, "Skipping remote analyses for empty diff");
            return StageName::ANALYSES
                .iter()
                .map(|stage| StageResult::local(job.job_id, job.attempt, *stage, NO_CHANGES_NOTE))
                .collect();
        }

        join_all(
            StageName::ANALYSES
                .iter()
                .map(|stage| self.execute(job, *stage, input)),
        )
        .await
    }

    /// Looks up the descriptor and capability for `stage` and runs it.
    async fn execute(
        &self,
        job: &JobContext,
        stage: StageName,
        input: &PromptInput,
    ) -> StageResult {
        let Some(descriptor) = self.plan.get(stage) else {
            return StageResult::failure(
                job.job_id,
                job.attempt,
                stage,
                StageError::permanent(format!("no descriptor for stage '{}'", stage)),
                0,
                "",
            );
        };
        match self.capabilities.get(&descriptor.service) {
            Some(capability) => {
                self.executor
                    .run_stage(job, descriptor, input, capability.as_ref())
                    .await
            }
            None => missing_capability(job, descriptor),
        }
    }
}

fn missing_capability(job: &JobContext, descriptor: &StageDescriptor) -> StageResult {
    warn!(
        job_id = %job.job_id,
        stage = %descriptor.name,
        service = %descriptor.service,
        "No text generator registered for service"
    );
    StageResult::failure(
        job.job_id,
        job.attempt,
        descriptor.name,
        StageError::permanent(format!(
            "no text generator registered for service '{}'",
            descriptor.service
        )),
        0,
        descriptor.model.clone(),
    )
}

fn failure_of(result: &StageResult) -> PipelineFailure {
    let (kind, message) = match &result.error {
        Some(error) => (error.kind, error.message.clone()),
        None => (FailureKind::Permanent, "stage failed without an error".to_string()),
    };
    PipelineFailure {
        stage: result.stage,
        kind,
        message,
    }
}
