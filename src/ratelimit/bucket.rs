//! Token bucket state for a single external service.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

/// Shortest wait handed back to a caller whose request cannot be admitted yet.
const MIN_WAIT: Duration = Duration::from_millis(1);

/// Slowest accepted refill: one token per day.
pub const MIN_REFILL_PER_SEC: f64 = 1.0 / 86_400.0;

/// Capacity and refill rate of one service's budget.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BudgetConfig {
    /// Maximum number of tokens the bucket can hold (burst size).
    pub capacity: u32,
    /// Tokens added per second.
    pub refill_per_sec: f64,
}

impl BudgetConfig {
    /// Creates a budget with an explicit capacity and refill rate.
    pub fn new(capacity: u32, refill_per_sec: f64) -> Self {
        Self {
            capacity,
            refill_per_sec,
        }
    }

    /// Creates a budget allowing `requests` calls per minute, all of which
    /// may be spent in a single burst.
    pub fn per_minute(requests: u32) -> Self {
        Self {
            capacity: requests,
            refill_per_sec: f64::from(requests) / 60.0,
        }
    }

    /// Time needed to refill an empty bucket.
    pub fn refill_period(&self) -> Duration {
        saturating_secs(f64::from(self.capacity) / self.refill_per_sec)
    }

    pub(crate) fn is_valid(&self) -> bool {
        self.capacity > 0
            && self.refill_per_sec.is_finite()
            && self.refill_per_sec >= MIN_REFILL_PER_SEC
    }
}

/// Seconds to `Duration`, clamped instead of panicking on overflow.
fn saturating_secs(secs: f64) -> Duration {
    Duration::try_from_secs_f64(secs).unwrap_or(if secs > 0.0 {
        Duration::MAX
    } else {
        Duration::ZERO
    })
}

/// Lazily refilled token bucket.
///
/// Tokens are kept as `f64` so fractional refill between calls is never lost.
#[derive(Debug)]
pub(crate) struct TokenBucket {
    config: BudgetConfig,
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    /// Creates a full bucket.
    pub(crate) fn new(config: BudgetConfig, now: Instant) -> Self {
        Self {
            config,
            tokens: f64::from(config.capacity),
            last_refill: now,
        }
    }

    pub(crate) fn config(&self) -> BudgetConfig {
        self.config
    }

    fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill);
        if elapsed.is_zero() {
            return;
        }
        let capacity = f64::from(self.config.capacity);
        let refilled = self.tokens + elapsed.as_secs_f64() * self.config.refill_per_sec;
        self.tokens = refilled.min(capacity);
        self.last_refill = now;
    }

    /// Debits `cost` tokens, or returns how long the caller should wait
    /// before the debit could succeed.
    pub(crate) fn try_take(&mut self, cost: u32, now: Instant) -> Result<(), Duration> {
        self.refill(now);
        let cost = f64::from(cost);
        if self.tokens >= cost {
            self.tokens -= cost;
            return Ok(());
        }
        let deficit = cost - self.tokens;
        let wait = saturating_secs(deficit / self.config.refill_per_sec);
        Err(wait.max(MIN_WAIT))
    }

    /// Whole tokens currently available.
    pub(crate) fn available(&mut self, now: Instant) -> u32 {
        self.refill(now);
        self.tokens.floor() as u32
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_per_minute_budget() {
        let budget = BudgetConfig::per_minute(30);
        assert_eq!(budget.capacity, 30);
        assert!((budget.refill_per_sec - 0.5).abs() < f64::EPSILON);
        assert_eq!(budget.refill_period(), Duration::from_secs(60));
    }

    #[test]
    fn test_invalid_budgets() {
        assert!(!BudgetConfig::new(0, 1.0).is_valid());
        assert!(!BudgetConfig::new(10, 0.0).is_valid());
        assert!(!BudgetConfig::new(10, f64::NAN).is_valid());
        assert!(BudgetConfig::new(10, 0.1).is_valid());
        assert!(BudgetConfig::new(1, MIN_REFILL_PER_SEC).is_valid());
        assert!(!BudgetConfig::new(10, 1e-300).is_valid());
    }

    #[test]
    fn test_extreme_rates_do_not_overflow() {
        let slow = BudgetConfig::new(u32::MAX, 1e-300);
        assert_eq!(slow.refill_period(), Duration::MAX);

        let now = Instant::now();
        let mut bucket = TokenBucket::new(slow, now);
        assert!(bucket.try_take(u32::MAX, now).is_ok());
        let wait = bucket.try_take(1, now).expect_err("bucket should be empty");
        assert_eq!(wait, Duration::MAX);
    }

    #[test]
    fn test_bucket_starts_full_and_drains() {
        let now = Instant::now();
        let mut bucket = TokenBucket::new(BudgetConfig::new(3, 1.0), now);

        assert!(bucket.try_take(1, now).is_ok());
        assert!(bucket.try_take(2, now).is_ok());
        let wait = bucket.try_take(1, now).expect_err("bucket should be empty");
        assert_eq!(wait, Duration::from_secs(1));
    }

    #[test]
    fn test_bucket_refill_is_capped() {
        let now = Instant::now();
        let mut bucket = TokenBucket::new(BudgetConfig::new(5, 10.0), now);
        assert!(bucket.try_take(5, now).is_ok());

        let later = now + Duration::from_secs(3600);
        assert_eq!(bucket.available(later), 5);
    }

    #[test]
    fn test_bucket_never_grants_partial_tokens() {
        let now = Instant::now();
        let mut bucket = TokenBucket::new(BudgetConfig::new(4, 2.0), now);
        assert!(bucket.try_take(3, now).is_ok());

        // One token left, asking for two must fail without debiting.
        let wait = bucket.try_take(2, now).expect_err("only one token available");
        assert_eq!(wait, Duration::from_millis(500));
        assert_eq!(bucket.available(now), 1);
    }
}
