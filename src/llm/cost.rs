//! Cost estimation for text-generation calls.
//!
//! Prices are blended per-1K-token rates applied to total tokens. They are
//! estimates for reporting, not billing.

use super::client::Usage;

/// Rate applied to models missing from the table, in USD per 1K tokens.
pub const DEFAULT_PRICE_PER_1K: f64 = 0.001;

/// Known model prefixes and their blended USD price per 1K tokens.
/// Longer prefixes come first so `gpt-4o-mini` does not match `gpt-4o`.
const PRICES_PER_1K: &[(&str, f64)] = &[
    ("gpt-4o-mini", 0.000_15),
    ("gpt-4o", 0.005),
    ("gpt-4.1-mini", 0.000_4),
    ("gpt-4.1", 0.002),
    ("claude-3-5-haiku", 0.000_8),
    ("claude-3-5-sonnet", 0.003),
    ("claude-sonnet-4", 0.003),
];

/// Blended price per 1K tokens for a model.
///
/// Provider prefixes such as `openai/` or `anthropic/` are ignored.
pub fn price_per_1k(model: &str) -> f64 {
    let name = model.rsplit('/').next().unwrap_or(model);
    PRICES_PER_1K
        .iter()
        .find(|(prefix, _)| name.starts_with(prefix))
        .map(|(_, price)| *price)
        .unwrap_or(DEFAULT_PRICE_PER_1K)
}

/// Estimated USD cost of one call.
pub fn estimate_cost_usd(model: &str, usage: &Usage) -> f64 {
    f64::from(usage.total_tokens) / 1000.0 * price_per_1k(model)
}
