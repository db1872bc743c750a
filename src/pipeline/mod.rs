//! Multi-stage review pipeline.
//!
//! # Architecture
//!
//! Stages are data, not code. Each [`StageDescriptor`] names the service it
//! is charged to, the model, prompts and dependencies, and one
//! [`StageExecutor`] runs them all.
//!
//! # Pipeline Flow
//!
//! 1. **Scout**: the raw diff is parsed and stripped of noise. An empty
//!    result short-circuits every remote analysis; otherwise the Scout model
//!    reduces the diff further. A Scout failure ends the run.
//! 2. **Guardian, Architect, Stylist** run concurrently on the Scout output.
//!    A failed analysis is kept as a failure result and marked unavailable.
//! 3. **Synthesizer** merges the analyses into one markdown review. A
//!    Synthesizer failure ends the run.
//!
//! The runner never retries; retry decisions belong to the job lifecycle.
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use review_forge::pipeline::{CapabilityRegistry, JobContext, PipelineRunner, StageExecutor, StagePlan};
//!
//! let executor = StageExecutor::new(limiter.clone());
//! let capabilities = CapabilityRegistry::new().with(openai).with(anthropic);
//! let runner = PipelineRunner::new(executor, StagePlan::default_plan(), capabilities);
//!
//! match runner.run(&job_context, &raw_diff).await {
//!     PipelineOutcome::Completed { review, .. } => println!("{}", review.body),
//!     PipelineOutcome::Failed { failure, .. } => eprintln!("{}", failure),
//! }
//! ```

pub mod executor;
pub mod plan;
pub mod prompts;
pub mod report;
pub mod runner;
pub mod stage;

pub use executor::{StageExecutor, DEFAULT_STAGE_TIMEOUT};
pub use plan::{PlanError, StageDescriptor, StagePlan};
pub use prompts::{render, PromptInput};
pub use report::{idempotency_marker, render_analyses, AggregatedReview, NO_CHANGES_NOTE};
pub use runner::{CapabilityRegistry, JobContext, PipelineFailure, PipelineOutcome, PipelineRunner};
pub use stage::{FailureKind, StageError, StageName, StageResult, StageStatus, TokenUsage};
