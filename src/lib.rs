//! review-forge: multi-stage LLM review of pull requests.
//!
//! Review jobs arrive on a durable queue. Workers claim them, fetch the
//! diff, run the Scout, Guardian, Architect, Stylist and Synthesizer stages
//! against it and post a single review comment. Failed attempts are retried
//! with backoff and end in a dead letter queue once their attempts run out.

pub mod cli;
pub mod config;
pub mod diff;
pub mod error;
pub mod github;
pub mod llm;
pub mod metrics;
pub mod pipeline;
pub mod ratelimit;
pub mod scheduler;
pub mod storage;

pub use config::{ConfigError, OrchestratorConfig};
pub use error::LlmError;
pub use github::GitHubError;
pub use pipeline::PipelineRunner;
pub use ratelimit::{RateLimitError, RateLimiter};
pub use scheduler::{JobLifecycleManager, LifecycleError, WorkerPool};
pub use storage::StoreError;
