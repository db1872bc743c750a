//! Generic stage executor.
//!
//! One executor runs every stage: it charges the stage's service budget,
//! renders the descriptor's prompts, calls the text generator under the
//! stage timeout and turns whatever happens into a [`StageResult`].

use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, warn};

use super::plan::StageDescriptor;
use super::prompts::{render, PromptInput};
use super::runner::JobContext;
use super::stage::{StageError, StageResult};
use crate::llm::{estimate_cost_usd, GenerationRequest, Message, TextGenerator};
use crate::metrics;
use crate::ratelimit::RateLimiter;

/// Default upper bound on a single text-generation call.
pub const DEFAULT_STAGE_TIMEOUT: Duration = Duration::from_secs(60);

/// Runs stage descriptors against text generators.
pub struct StageExecutor {
    limiter: Arc<RateLimiter>,
    stage_timeout: Duration,
}

impl StageExecutor {
    pub fn new(limiter: Arc<RateLimiter>) -> Self {
        Self {
            limiter,
            stage_timeout: DEFAULT_STAGE_TIMEOUT,
        }
    }

    pub fn with_stage_timeout(mut self, stage_timeout: Duration) -> Self {
        self.stage_timeout = stage_timeout;
        self
    }

    pub fn stage_timeout(&self) -> Duration {
        self.stage_timeout
    }

    pub fn limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }

    /// Runs one stage. Never fails: every error is folded into a failure
    /// result with its classification.
    pub async fn run_stage(
        &self,
        job: &JobContext,
        descriptor: &StageDescriptor,
        input: &PromptInput,
        capability: &dyn TextGenerator,
    ) -> StageResult {
        let stage = descriptor.name;
        let service = capability.service_name().to_string();
        let started = Instant::now();

        if let Err(e) = self.limiter.acquire(&service, 1).await {
            warn!(
                job_id = %job.job_id,
                stage = %stage,
                service = %service,
                error = %e,
                "Stage cannot be admitted by rate limiter"
            );
            let result = StageResult::failure(
                job.job_id,
                job.attempt,
                stage,
                StageError::permanent(e.to_string()),
                elapsed_ms(started),
                descriptor.model.clone(),
            );
            record(&result, &service);
            return result;
        }

        let mut request = GenerationRequest::new(
            descriptor.model.clone(),
            vec![
                Message::system(render(&descriptor.system_prompt, input)),
                Message::user(render(&descriptor.prompt_template, input)),
            ],
        );
        request.temperature = descriptor.temperature;
        request.max_tokens = descriptor.max_tokens;

        let outcome = tokio::time::timeout(self.stage_timeout, capability.generate(request)).await;
        let latency_ms = elapsed_ms(started);

        let result = match outcome {
            Err(_) => StageResult::failure(
                job.job_id,
                job.attempt,
                stage,
                StageError::transient(format!(
                    "stage timed out after {}s",
                    self.stage_timeout.as_secs_f64()
                )),
                latency_ms,
                descriptor.model.clone(),
            ),
            Ok(Err(e)) => {
                let error = if e.is_transient() {
                    StageError::transient(e.to_string())
                } else {
                    StageError::permanent(e.to_string())
                };
                StageResult::failure(
                    job.job_id,
                    job.attempt,
                    stage,
                    error,
                    latency_ms,
                    descriptor.model.clone(),
                )
            }
            Ok(Ok(response)) => {
                let text = response.first_content().unwrap_or_default().trim().to_string();
                let model = if response.model.is_empty() {
                    descriptor.model.clone()
                } else {
                    response.model.clone()
                };
                if text.is_empty() {
                    StageResult::failure(
                        job.job_id,
                        job.attempt,
                        stage,
                        StageError::permanent("malformed response: empty completion"),
                        latency_ms,
                        model,
                    )
                } else {
                    let cost = estimate_cost_usd(&model, &response.usage);
                    StageResult::success(
                        job.job_id,
                        job.attempt,
                        stage,
                        text,
                        latency_ms,
                        response.usage,
                        model,
                        cost,
                    )
                }
            }
        };

        match &result.error {
            None => debug!(
                job_id = %job.job_id,
                attempt = job.attempt,
                stage = %stage,
                latency_ms = result.latency_ms,
                tokens = result.usage.total_tokens,
                "Stage completed"
            ),
            Some(error) => warn!(
                job_id = %job.job_id,
                attempt = job.attempt,
                stage = %stage,
                kind = %error.kind,
                error = %error.message,
                "Stage failed"
            ),
        }
        record(&result, &service);
        result
    }
}

fn elapsed_ms(started: Instant) -> u64 {
    started.elapsed().as_millis() as u64
}

fn record(result: &StageResult, service: &str) {
    let stage = result.stage.as_str();
    let outcome = match result.failure_kind() {
        None => "success",
        Some(kind) => match kind {
            super::stage::FailureKind::Transient => "transient_failure",
            super::stage::FailureKind::Permanent => "permanent_failure",
        },
    };
    metrics::record_stage(stage, service, outcome, result.latency_ms as f64 / 1000.0);
    if result.is_success() {
        metrics::record_stage_usage(stage, &result.model, &result.usage, result.cost_usd);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::LlmError;
    use crate::llm::{GenerationResponse, Usage};
    use crate::pipeline::stage::{FailureKind, StageName};
    use crate::ratelimit::BudgetConfig;
    use async_trait::async_trait;
    use std::sync::Mutex;
    use uuid::Uuid;

    enum Reply {
        Text(&'static str),
        Error(fn() -> LlmError),
        Hang,
    }

    struct Scripted {
        reply: Reply,
        requests: Mutex<Vec<GenerationRequest>>,
    }

    impl Scripted {
        fn new(reply: Reply) -> Self {
            Self {
                reply,
                requests: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl TextGenerator for Scripted {
        fn service_name(&self) -> &str {
            "openai"
        }

        async fn generate(
            &self,
            request: GenerationRequest,
        ) -> Result<GenerationResponse, LlmError> {
            self.requests.lock().unwrap().push(request);
            match &self.reply {
                Reply::Text(text) => Ok(GenerationResponse::text(
                    "gpt-4o",
                    *text,
                    Usage::new(800, 200),
                )),
                Reply::Error(make) => Err(make()),
                Reply::Hang => {
                    std::future::pending::<()>().await;
                    unreachable!()
                }
            }
        }
    }

    fn executor(capacity: u32) -> StageExecutor {
        let limiter = RateLimiter::new();
        limiter
            .register("openai", BudgetConfig::new(capacity, 1.0))
            .unwrap();
        StageExecutor::new(Arc::new(limiter)).with_stage_timeout(Duration::from_secs(5))
    }

    fn job() -> JobContext {
        JobContext {
            job_id: Uuid::new_v4(),
            attempt: 1,
            repository: "acme/api".to_string(),
            pr_number: 7,
            title: None,
        }
    }

    fn descriptor() -> StageDescriptor {
        StageDescriptor::new(StageName::Architect, "openai", "gpt-4o").with_max_tokens(100)
    }

    #[tokio::test]
    async fn test_success_records_usage_and_cost() {
        let executor = executor(5);
        let capability = Scripted::new(Reply::Text("  Looks fine.  "));
        let input = PromptInput {
            repository: "acme/api".to_string(),
            diff: "+fn main() {}".to_string(),
            ..Default::default()
        };

        let result = executor.run_stage(&job(), &descriptor(), &input, &capability).await;

        assert!(result.is_success());
        assert_eq!(result.output, "Looks fine.");
        assert_eq!(result.usage.total_tokens, 1000);
        assert!((result.cost_usd - 0.005).abs() < 1e-9);
        assert_eq!(executor.limiter().available("openai"), Ok(4));

        let requests = capability.requests.lock().unwrap();
        assert_eq!(requests[0].max_tokens, Some(100));
        assert!(requests[0].user_content().contains("+fn main() {}"));
    }

    #[tokio::test]
    async fn test_empty_completion_is_permanent() {
        let executor = executor(5);
        let capability = Scripted::new(Reply::Text("   "));
        let result = executor
            .run_stage(&job(), &descriptor(), &PromptInput::default(), &capability)
            .await;
        assert_eq!(result.failure_kind(), Some(FailureKind::Permanent));
    }

    #[tokio::test]
    async fn test_error_classification() {
        let executor = executor(5);

        let capability = Scripted::new(Reply::Error(|| LlmError::ApiError {
            code: 503,
            message: "overloaded".to_string(),
        }));
        let result = executor
            .run_stage(&job(), &descriptor(), &PromptInput::default(), &capability)
            .await;
        assert_eq!(result.failure_kind(), Some(FailureKind::Transient));

        let capability = Scripted::new(Reply::Error(|| {
            LlmError::ParseError("no choices".to_string())
        }));
        let result = executor
            .run_stage(&job(), &descriptor(), &PromptInput::default(), &capability)
            .await;
        assert_eq!(result.failure_kind(), Some(FailureKind::Permanent));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_is_transient() {
        let executor = executor(5);
        let capability = Scripted::new(Reply::Hang);
        let result = executor
            .run_stage(&job(), &descriptor(), &PromptInput::default(), &capability)
            .await;

        assert_eq!(result.failure_kind(), Some(FailureKind::Transient));
        assert!(result.latency_ms >= 5_000);
    }

    #[tokio::test]
    async fn test_unknown_service_is_permanent_without_call() {
        let executor = StageExecutor::new(Arc::new(RateLimiter::new()));
        let capability = Scripted::new(Reply::Text("never"));
        let result = executor
            .run_stage(&job(), &descriptor(), &PromptInput::default(), &capability)
            .await;

        assert_eq!(result.failure_kind(), Some(FailureKind::Permanent));
        assert!(capability.requests.lock().unwrap().is_empty());
    }
}
