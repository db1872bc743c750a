//! Per-service admission control for external API calls.
//!
//! Every call to GitHub or to a text-generation backend first debits a token
//! from that service's bucket. Buckets refill continuously and are computed
//! lazily on each call, so there is no background timer.
//!
//! A single [`RateLimiter`] is shared (behind an `Arc`) by every worker and
//! every pipeline stage in the process. Each debit is a read-modify-write of
//! one bucket under a mutex, which makes it atomic with respect to concurrent
//! callers. Waiting happens outside the lock.
//!
//! Admission is not FIFO. Under contention a late caller can be admitted
//! before an earlier one that is still sleeping; that only delays a stage,
//! it never drops one.
//!
//! # Example
//!
//! ```rust,ignore
//! use review_forge::ratelimit::{BudgetConfig, RateLimiter};
//!
//! let limiter = RateLimiter::new();
//! limiter.register("github", BudgetConfig::per_minute(30))?;
//! limiter.acquire("github", 1).await?;
//! ```

mod bucket;

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use thiserror::Error;
use tokio::time::Instant;
use tracing::debug;

pub use bucket::BudgetConfig;
use bucket::TokenBucket;

use crate::config::OrchestratorConfig;

/// Service name used for source-control API calls.
pub const GITHUB_SERVICE: &str = "github";
/// Service name of the OpenAI text-generation backend.
pub const OPENAI_SERVICE: &str = "openai";
/// Service name of the Anthropic text-generation backend.
pub const ANTHROPIC_SERVICE: &str = "anthropic";

/// Errors raised by the rate limiter.
///
/// These are configuration errors; exhausting a budget is never an error,
/// callers simply wait.
#[derive(Debug, Error, PartialEq)]
pub enum RateLimitError {
    /// No budget has been registered for the service.
    #[error("No rate limit budget configured for service '{0}'")]
    UnknownService(String),

    /// The request could never be admitted.
    #[error("Cost {cost} exceeds capacity {capacity} of service '{service}'")]
    CostExceedsCapacity {
        service: String,
        cost: u32,
        capacity: u32,
    },

    /// Capacity is zero, or the refill rate is not finite or below one
    /// token per day.
    #[error("Invalid budget for service '{service}': capacity {capacity}, refill {refill_per_sec}/s")]
    InvalidBudget {
        service: String,
        capacity: u32,
        refill_per_sec: f64,
    },
}

/// Process-wide token-bucket rate limiter keyed by service name.
#[derive(Debug, Default)]
pub struct RateLimiter {
    buckets: Mutex<HashMap<String, TokenBucket>>,
}

impl RateLimiter {
    /// Creates a limiter with no budgets.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a limiter from `(service, budget)` pairs.
    pub fn from_budgets<I, S>(budgets: I) -> Result<Self, RateLimitError>
    where
        I: IntoIterator<Item = (S, BudgetConfig)>,
        S: Into<String>,
    {
        let limiter = Self::new();
        for (service, budget) in budgets {
            limiter.register(service, budget)?;
        }
        Ok(limiter)
    }

    /// Creates a limiter holding every budget in `config.rate_budgets`.
    pub fn from_config(config: &OrchestratorConfig) -> Result<Self, RateLimitError> {
        Self::from_budgets(
            config
                .rate_budgets
                .iter()
                .map(|(service, budget)| (service.clone(), *budget)),
        )
    }

    /// Builder form of [`register`](Self::register).
    pub fn with_budget(
        self,
        service: impl Into<String>,
        budget: BudgetConfig,
    ) -> Result<Self, RateLimitError> {
        self.register(service, budget)?;
        Ok(self)
    }

    /// Registers (or replaces) the budget of a service. The bucket starts full.
    pub fn register(
        &self,
        service: impl Into<String>,
        budget: BudgetConfig,
    ) -> Result<(), RateLimitError> {
        let service = service.into();
        if !budget.is_valid() {
            return Err(RateLimitError::InvalidBudget {
                service,
                capacity: budget.capacity,
                refill_per_sec: budget.refill_per_sec,
            });
        }
        self.lock()
            .insert(service, TokenBucket::new(budget, Instant::now()));
        Ok(())
    }

    /// Returns the budget configured for a service.
    pub fn budget(&self, service: &str) -> Option<BudgetConfig> {
        self.lock().get(service).map(TokenBucket::config)
    }

    /// Waits until `cost` tokens are available for `service`, then debits them.
    ///
    /// # Errors
    ///
    /// Returns `UnknownService` if the service has no budget and
    /// `CostExceedsCapacity` if `cost` could never be satisfied.
    pub async fn acquire(&self, service: &str, cost: u32) -> Result<(), RateLimitError> {
        let mut waited = false;
        loop {
            let wait = match self.take(service, cost)? {
                Ok(()) => return Ok(()),
                Err(wait) => wait,
            };

            if !waited {
                crate::metrics::record_rate_limit_wait(service);
                waited = true;
            }
            debug!(
                service = service,
                cost = cost,
                wait_ms = wait.as_millis() as u64,
                "Rate limit budget exhausted, waiting for refill"
            );
            tokio::time::sleep(wait).await;
        }
    }

    /// Debits `cost` tokens if they are available right now.
    ///
    /// Returns `Ok(false)` instead of waiting, for callers that prefer to
    /// defer work.
    pub fn try_acquire(&self, service: &str, cost: u32) -> Result<bool, RateLimitError> {
        Ok(self.take(service, cost)?.is_ok())
    }

    /// Whole tokens currently available for a service.
    pub fn available(&self, service: &str) -> Result<u32, RateLimitError> {
        let mut buckets = self.lock();
        let bucket = buckets
            .get_mut(service)
            .ok_or_else(|| RateLimitError::UnknownService(service.to_string()))?;
        Ok(bucket.available(Instant::now()))
    }

    /// Single atomic refill-and-debit. The outer result carries configuration
    /// errors, the inner one the wait needed when the bucket is short.
    fn take(
        &self,
        service: &str,
        cost: u32,
    ) -> Result<Result<(), std::time::Duration>, RateLimitError> {
        let mut buckets = self.lock();
        let bucket = buckets
            .get_mut(service)
            .ok_or_else(|| RateLimitError::UnknownService(service.to_string()))?;

        let capacity = bucket.config().capacity;
        if cost > capacity {
            return Err(RateLimitError::CostExceedsCapacity {
                service: service.to_string(),
                cost,
                capacity,
            });
        }

        Ok(bucket.try_take(cost, Instant::now()))
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, TokenBucket>> {
        self.buckets.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
