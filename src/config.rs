//! Orchestrator configuration.
//!
//! Every setting has a default and can be overridden through environment
//! variables prefixed with `REVIEW_FORGE_`. Connection strings and API keys
//! use their conventional unprefixed names.

use std::collections::BTreeMap;
use std::time::Duration;

use thiserror::Error;

use crate::diff::DiffLimits;
use crate::github::GITHUB_API_BASE;
use crate::llm::{ANTHROPIC_API_BASE, OPENAI_API_BASE};
use crate::pipeline::{StageName, StagePlan, DEFAULT_STAGE_TIMEOUT};
use crate::ratelimit::{BudgetConfig, ANTHROPIC_SERVICE, GITHUB_SERVICE, OPENAI_SERVICE};
use crate::scheduler::{
    BackoffPolicy, WorkerPoolConfig, DEFAULT_BACKOFF_BASE, DEFAULT_BACKOFF_MAX,
    DEFAULT_CLAIM_LEASE, DEFAULT_DELIVERY_LEASE, DEFAULT_JOB_TIMEOUT, DEFAULT_MAX_ATTEMPTS,
    DEFAULT_STRANDED_AFTER,
};

const ENV_PREFIX: &str = "REVIEW_FORGE_";

/// Errors that can occur while loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A required environment variable is missing.
    #[error("Missing environment variable: {0}")]
    MissingEnvVar(String),

    /// An environment variable has an invalid value.
    #[error("Invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    /// Configuration validation failed.
    #[error("Configuration validation failed: {0}")]
    ValidationFailed(String),
}

/// Configuration of a review-forge process.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    // Connections
    /// PostgreSQL connection URL.
    pub database_url: String,
    /// Redis connection URL.
    pub redis_url: String,
    /// Name of the review queue (Redis key prefix).
    pub queue_name: String,

    // Credentials
    pub github_token: Option<String>,
    pub openai_api_key: Option<String>,
    pub anthropic_api_key: Option<String>,

    // Backends
    pub github_api_base: String,
    pub openai_api_base: String,
    pub anthropic_api_base: String,

    // Workers
    /// Number of worker tasks.
    pub num_workers: usize,
    /// How long a worker blocks on an empty queue.
    pub poll_interval: Duration,
    /// How often expired deliveries are recovered.
    pub reap_interval: Duration,
    /// Grace period for in-flight jobs on shutdown.
    pub shutdown_timeout: Duration,

    // Job lifecycle
    /// Budget for one whole attempt: diff fetch, pipeline and comment.
    pub job_timeout: Duration,
    /// Budget for one stage call.
    pub stage_timeout: Duration,
    /// How long a claimed job stays owned by its worker.
    pub claim_lease: Duration,
    /// How long a dequeued message stays invisible before redelivery.
    pub delivery_lease: Duration,
    /// Age at which a `queued` job with no activity is enqueued again.
    pub stranded_after: Duration,
    /// Attempts granted to newly submitted jobs.
    pub max_attempts: u32,
    /// Extra attempts granted by a dead-letter replay.
    pub replay_attempts: u32,
    pub backoff_base: Duration,
    pub backoff_max: Duration,

    // Rate limits
    /// Token bucket per external service.
    pub rate_budgets: BTreeMap<String, BudgetConfig>,

    // Pipeline
    /// Model overrides per stage, on top of the default plan.
    pub stage_models: BTreeMap<StageName, String>,
    pub diff_limits: DiffLimits,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        let rate_budgets = [
            (GITHUB_SERVICE, BudgetConfig::per_minute(30)),
            (OPENAI_SERVICE, BudgetConfig::per_minute(60)),
            (ANTHROPIC_SERVICE, BudgetConfig::per_minute(50)),
        ]
        .into_iter()
        .map(|(service, budget)| (service.to_string(), budget))
        .collect();

        Self {
            database_url: "postgres://localhost/review_forge".to_string(),
            redis_url: "redis://127.0.0.1:6379".to_string(),
            queue_name: "reviews".to_string(),

            github_token: None,
            openai_api_key: None,
            anthropic_api_key: None,

            github_api_base: GITHUB_API_BASE.to_string(),
            openai_api_base: OPENAI_API_BASE.to_string(),
            anthropic_api_base: ANTHROPIC_API_BASE.to_string(),

            num_workers: 4,
            poll_interval: Duration::from_secs(1),
            reap_interval: Duration::from_secs(30),
            shutdown_timeout: Duration::from_secs(60),

            job_timeout: DEFAULT_JOB_TIMEOUT,
            stage_timeout: DEFAULT_STAGE_TIMEOUT,
            claim_lease: DEFAULT_CLAIM_LEASE,
            delivery_lease: DEFAULT_DELIVERY_LEASE,
            stranded_after: DEFAULT_STRANDED_AFTER,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            replay_attempts: DEFAULT_MAX_ATTEMPTS,
            backoff_base: DEFAULT_BACKOFF_BASE,
            backoff_max: DEFAULT_BACKOFF_MAX,

            rate_budgets,

            stage_models: BTreeMap::new(),
            diff_limits: DiffLimits::default(),
        }
    }
}

impl OrchestratorConfig {
    /// Creates a new configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates configuration from environment variables.
    ///
    /// # Environment Variables
    ///
    /// - `DATABASE_URL`: PostgreSQL connection URL (required)
    /// - `REDIS_URL`: Redis connection URL (default: redis://127.0.0.1:6379)
    /// - `GITHUB_TOKEN`, `OPENAI_API_KEY`, `ANTHROPIC_API_KEY`: credentials
    /// - `REVIEW_FORGE_QUEUE_NAME`: queue name (default: reviews)
    /// - `REVIEW_FORGE_WORKERS`: worker count (default: 4)
    /// - `REVIEW_FORGE_POLL_INTERVAL_MS`: dequeue wait (default: 1000)
    /// - `REVIEW_FORGE_REAP_INTERVAL_SECS`: lease reaper period (default: 30)
    /// - `REVIEW_FORGE_SHUTDOWN_TIMEOUT_SECS`: shutdown grace (default: 60)
    /// - `REVIEW_FORGE_JOB_TIMEOUT_SECS`: per-attempt budget (default: 300)
    /// - `REVIEW_FORGE_STAGE_TIMEOUT_SECS`: per-stage budget (default: 60)
    /// - `REVIEW_FORGE_CLAIM_LEASE_SECS`: claim lease (default: 600)
    /// - `REVIEW_FORGE_DELIVERY_LEASE_SECS`: delivery lease (default: 600)
    /// - `REVIEW_FORGE_STRANDED_AFTER_SECS`: re-enqueue idle queued jobs (default: 600)
    /// - `REVIEW_FORGE_MAX_ATTEMPTS`: attempts per job (default: 3)
    /// - `REVIEW_FORGE_REPLAY_ATTEMPTS`: attempts granted on replay (default: 3)
    /// - `REVIEW_FORGE_BACKOFF_BASE_SECS` / `REVIEW_FORGE_BACKOFF_MAX_SECS`
    /// - `REVIEW_FORGE_GITHUB_RPM`, `REVIEW_FORGE_OPENAI_RPM`,
    ///   `REVIEW_FORGE_ANTHROPIC_RPM`: requests per minute per service
    /// - `REVIEW_FORGE_<STAGE>_MODEL`: model override, e.g. `REVIEW_FORGE_SCOUT_MODEL`
    /// - `REVIEW_FORGE_GITHUB_API_BASE`, `REVIEW_FORGE_OPENAI_API_BASE`,
    ///   `REVIEW_FORGE_ANTHROPIC_API_BASE`: backend URLs
    /// - `REVIEW_FORGE_MAX_DIFF_CHARS` / `REVIEW_FORGE_MAX_FILE_CHARS`: diff limits
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if required variables are missing or have invalid values.
    pub fn from_env() -> Result<Self, ConfigError> {
        let config = Self::from_lookup(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Builds a configuration from any key lookup. `from_env` without the
    /// final validation.
    pub(crate) fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();
        let prefixed = |name: &str| lookup(&format!("{}{}", ENV_PREFIX, name));

        // Connections - DATABASE_URL is required
        config.database_url = lookup("DATABASE_URL")
            .ok_or_else(|| ConfigError::MissingEnvVar("DATABASE_URL".to_string()))?;

        if let Some(val) = lookup("REDIS_URL") {
            config.redis_url = val;
        }

        if let Some(val) = prefixed("QUEUE_NAME") {
            config.queue_name = val;
        }

        config.github_token = lookup("GITHUB_TOKEN");
        config.openai_api_key = lookup("OPENAI_API_KEY");
        config.anthropic_api_key = lookup("ANTHROPIC_API_KEY");

        if let Some(val) = prefixed("GITHUB_API_BASE") {
            config.github_api_base = val;
        }
        if let Some(val) = prefixed("OPENAI_API_BASE") {
            config.openai_api_base = val;
        }
        if let Some(val) = prefixed("ANTHROPIC_API_BASE") {
            config.anthropic_api_base = val;
        }

        // Workers
        if let Some(val) = prefixed("WORKERS") {
            config.num_workers = parse_env_value(&val, "REVIEW_FORGE_WORKERS")?;
        }

        if let Some(val) = prefixed("POLL_INTERVAL_MS") {
            let millis: u64 = parse_env_value(&val, "REVIEW_FORGE_POLL_INTERVAL_MS")?;
            config.poll_interval = Duration::from_millis(millis);
        }

        for (name, slot) in [
            ("REAP_INTERVAL_SECS", &mut config.reap_interval),
            ("SHUTDOWN_TIMEOUT_SECS", &mut config.shutdown_timeout),
            ("JOB_TIMEOUT_SECS", &mut config.job_timeout),
            ("STAGE_TIMEOUT_SECS", &mut config.stage_timeout),
            ("CLAIM_LEASE_SECS", &mut config.claim_lease),
            ("DELIVERY_LEASE_SECS", &mut config.delivery_lease),
            ("STRANDED_AFTER_SECS", &mut config.stranded_after),
            ("BACKOFF_BASE_SECS", &mut config.backoff_base),
            ("BACKOFF_MAX_SECS", &mut config.backoff_max),
        ] {
            if let Some(val) = prefixed(name) {
                let secs: u64 = parse_env_value(&val, &format!("{}{}", ENV_PREFIX, name))?;
                *slot = Duration::from_secs(secs);
            }
        }

        // Job lifecycle
        if let Some(val) = prefixed("MAX_ATTEMPTS") {
            config.max_attempts = parse_env_value(&val, "REVIEW_FORGE_MAX_ATTEMPTS")?;
        }

        if let Some(val) = prefixed("REPLAY_ATTEMPTS") {
            config.replay_attempts = parse_env_value(&val, "REVIEW_FORGE_REPLAY_ATTEMPTS")?;
        }

        // Rate limits
        for service in [GITHUB_SERVICE, OPENAI_SERVICE, ANTHROPIC_SERVICE] {
            let name = format!("{}_RPM", service.to_uppercase());
            if let Some(val) = prefixed(&name) {
                let rpm: u32 = parse_env_value(&val, &format!("{}{}", ENV_PREFIX, name))?;
                config
                    .rate_budgets
                    .insert(service.to_string(), BudgetConfig::per_minute(rpm));
            }
        }

        // Pipeline
        for stage in StageName::ALL {
            let name = format!("{}_MODEL", stage.as_str().to_uppercase());
            if let Some(val) = prefixed(&name) {
                config.stage_models.insert(stage, val);
            }
        }

        if let Some(val) = prefixed("MAX_DIFF_CHARS") {
            config.diff_limits.max_diff_chars =
                parse_env_value(&val, "REVIEW_FORGE_MAX_DIFF_CHARS")?;
        }

        if let Some(val) = prefixed("MAX_FILE_CHARS") {
            config.diff_limits.max_file_chars =
                parse_env_value(&val, "REVIEW_FORGE_MAX_FILE_CHARS")?;
        }

        Ok(config)
    }

    /// Validates the configuration values.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationFailed` if any values are invalid.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.database_url.is_empty() {
            return Err(ConfigError::ValidationFailed(
                "database_url cannot be empty".to_string(),
            ));
        }

        if self.queue_name.trim().is_empty() {
            return Err(ConfigError::ValidationFailed(
                "queue_name cannot be empty".to_string(),
            ));
        }

        if self.num_workers == 0 {
            return Err(ConfigError::ValidationFailed(
                "num_workers must be greater than 0".to_string(),
            ));
        }

        for (name, value) in [
            ("poll_interval", self.poll_interval),
            ("reap_interval", self.reap_interval),
            ("job_timeout", self.job_timeout),
            ("stage_timeout", self.stage_timeout),
            ("backoff_base", self.backoff_base),
            ("stranded_after", self.stranded_after),
        ] {
            if value.is_zero() {
                return Err(ConfigError::ValidationFailed(format!(
                    "{} must be greater than 0",
                    name
                )));
            }
        }

        if self.claim_lease <= self.job_timeout {
            return Err(ConfigError::ValidationFailed(
                "claim_lease must exceed job_timeout".to_string(),
            ));
        }

        if self.delivery_lease < self.claim_lease {
            return Err(ConfigError::ValidationFailed(
                "delivery_lease cannot be shorter than claim_lease".to_string(),
            ));
        }

        if self.backoff_max < self.backoff_base {
            return Err(ConfigError::ValidationFailed(
                "backoff_max cannot be shorter than backoff_base".to_string(),
            ));
        }

        if self.max_attempts == 0 {
            return Err(ConfigError::ValidationFailed(
                "max_attempts must be greater than 0".to_string(),
            ));
        }

        if self.replay_attempts == 0 {
            return Err(ConfigError::ValidationFailed(
                "replay_attempts must be greater than 0".to_string(),
            ));
        }

        for (service, budget) in &self.rate_budgets {
            if !budget.is_valid() {
                return Err(ConfigError::ValidationFailed(format!(
                    "rate budget for '{}' needs capacity and at least one token per day",
                    service
                )));
            }
        }

        let plan = self.stage_plan();
        for service in plan.services() {
            if !self.rate_budgets.contains_key(service) {
                return Err(ConfigError::ValidationFailed(format!(
                    "no rate budget configured for service '{}'",
                    service
                )));
            }
        }
        plan.validate()
            .map_err(|e| ConfigError::ValidationFailed(e.to_string()))?;

        if self.diff_limits.max_diff_chars == 0 || self.diff_limits.max_file_chars == 0 {
            return Err(ConfigError::ValidationFailed(
                "diff limits must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }

    /// Stage plan with the configured model overrides applied.
    pub fn stage_plan(&self) -> StagePlan {
        StagePlan::from_models(&self.stage_models)
    }

    pub fn backoff(&self) -> BackoffPolicy {
        BackoffPolicy::new(self.backoff_base, self.backoff_max)
    }

    pub fn worker_pool_config(&self) -> WorkerPoolConfig {
        WorkerPoolConfig::new(self.num_workers)
            .with_poll_interval(self.poll_interval)
            .with_reap_interval(self.reap_interval)
            .with_shutdown_timeout(self.shutdown_timeout)
    }

    /// Builder method to set database URL.
    pub fn with_database_url(mut self, url: impl Into<String>) -> Self {
        self.database_url = url.into();
        self
    }

    /// Builder method to set Redis URL.
    pub fn with_redis_url(mut self, url: impl Into<String>) -> Self {
        self.redis_url = url.into();
        self
    }

    pub fn with_queue_name(mut self, name: impl Into<String>) -> Self {
        self.queue_name = name.into();
        self
    }

    /// Builder method to set the number of workers.
    pub fn with_num_workers(mut self, workers: usize) -> Self {
        self.num_workers = workers;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Builder method to set the per-attempt timeout.
    pub fn with_job_timeout(mut self, timeout: Duration) -> Self {
        self.job_timeout = timeout;
        self
    }

    /// Builder method to set the per-stage timeout.
    pub fn with_stage_timeout(mut self, timeout: Duration) -> Self {
        self.stage_timeout = timeout;
        self
    }

    pub fn with_claim_lease(mut self, lease: Duration) -> Self {
        self.claim_lease = lease;
        self
    }

    pub fn with_delivery_lease(mut self, lease: Duration) -> Self {
        self.delivery_lease = lease;
        self
    }

    pub fn with_stranded_after(mut self, age: Duration) -> Self {
        self.stranded_after = age;
        self
    }

    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    /// Builder method to set attempts per job.
    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts;
        self
    }

    pub fn with_backoff(mut self, base: Duration, max: Duration) -> Self {
        self.backoff_base = base;
        self.backoff_max = max;
        self
    }

    /// Builder method to set (or replace) the budget of one service.
    pub fn with_rate_budget(mut self, service: impl Into<String>, budget: BudgetConfig) -> Self {
        self.rate_budgets.insert(service.into(), budget);
        self
    }

    /// Builder method to override the model of one stage.
    pub fn with_stage_model(mut self, stage: StageName, model: impl Into<String>) -> Self {
        self.stage_models.insert(stage, model.into());
        self
    }

    pub fn with_diff_limits(mut self, limits: DiffLimits) -> Self {
        self.diff_limits = limits;
        self
    }
}

/// Parse an environment variable value into a type.
fn parse_env_value<T: std::str::FromStr>(value: &str, key: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        message: format!("could not parse '{}'", value),
    })
}
