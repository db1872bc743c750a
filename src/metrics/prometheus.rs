//! Prometheus metrics registration and export.
//!
//! This module defines all Prometheus metrics used by review-forge and
//! provides functions for initializing, registering, and exporting them.

use prometheus::{
    Counter, CounterVec, Encoder, Gauge, GaugeVec, HistogramOpts, HistogramVec, Opts, Registry,
    TextEncoder,
};
use std::sync::OnceLock;

/// Global Prometheus registry for all review-forge metrics.
pub static REGISTRY: OnceLock<Registry> = OnceLock::new();

/// Jobs accepted by `submit`.
pub static JOBS_SUBMITTED: OnceLock<Counter> = OnceLock::new();

/// Processed attempts, labeled by outcome (completed, retrying, dead_lettered).
pub static JOBS_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Attempt duration in seconds, labeled by outcome.
pub static JOB_DURATION: OnceLock<HistogramVec> = OnceLock::new();

/// Stage executions, labeled by stage, service and outcome.
pub static STAGE_REQUESTS_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Stage latency in seconds, labeled by stage.
pub static STAGE_LATENCY: OnceLock<HistogramVec> = OnceLock::new();

/// Tokens used, labeled by stage, model and type (prompt/completion).
pub static STAGE_TOKENS_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Estimated spend in USD, labeled by model.
pub static LLM_COST_USD: OnceLock<CounterVec> = OnceLock::new();

/// Times a caller had to wait for rate budget, labeled by service.
pub static RATE_LIMIT_WAITS: OnceLock<CounterVec> = OnceLock::new();

/// Number of workers currently processing a delivery.
pub static ACTIVE_WORKERS: OnceLock<Gauge> = OnceLock::new();

/// Jobs in the queue, labeled by queue name and state.
pub static QUEUE_DEPTH: OnceLock<GaugeVec> = OnceLock::new();

/// Initialize all metrics and register them with the registry.
///
/// Call once at startup. Recording functions are no-ops until this runs.
///
/// # Errors
///
/// Returns a `prometheus::Error` if metric registration fails, typically due to
/// duplicate metric names or invalid metric configurations.
pub fn init_metrics() -> Result<(), prometheus::Error> {
    let registry = Registry::new();

    // Job metrics
    let jobs_submitted = Counter::new("review_forge_jobs_submitted_total", "Jobs submitted")?;

    let jobs_total = CounterVec::new(
        Opts::new("review_forge_jobs_total", "Processed job attempts by outcome"),
        &["outcome"],
    )?;

    let job_duration = HistogramVec::new(
        HistogramOpts::new(
            "review_forge_job_duration_seconds",
            "Job attempt duration in seconds",
        )
        .buckets(vec![1.0, 5.0, 15.0, 30.0, 60.0, 120.0, 300.0]),
        &["outcome"],
    )?;

    // Stage metrics
    let stage_requests_total = CounterVec::new(
        Opts::new("review_forge_stage_requests_total", "Stage executions"),
        &["stage", "service", "outcome"],
    )?;

    let stage_latency = HistogramVec::new(
        HistogramOpts::new(
            "review_forge_stage_latency_seconds",
            "Stage latency in seconds",
        )
        .buckets(vec![0.5, 1.0, 2.0, 5.0, 10.0, 30.0, 60.0]),
        &["stage"],
    )?;

    let stage_tokens_total = CounterVec::new(
        Opts::new("review_forge_stage_tokens_total", "Total tokens used"),
        &["stage", "model", "type"],
    )?;

    let llm_cost_usd = CounterVec::new(
        Opts::new("review_forge_llm_cost_usd_total", "Estimated LLM spend in USD"),
        &["model"],
    )?;

    let rate_limit_waits = CounterVec::new(
        Opts::new(
            "review_forge_rate_limit_waits_total",
            "Acquisitions that waited for budget",
        ),
        &["service"],
    )?;

    // Worker and queue metrics
    let active_workers = Gauge::new(
        "review_forge_active_workers",
        "Workers currently processing a job",
    )?;

    let queue_depth = GaugeVec::new(
        Opts::new("review_forge_queue_depth", "Number of jobs in queue"),
        &["queue_name", "state"],
    )?;

    registry.register(Box::new(jobs_submitted.clone()))?;
    registry.register(Box::new(jobs_total.clone()))?;
    registry.register(Box::new(job_duration.clone()))?;
    registry.register(Box::new(stage_requests_total.clone()))?;
    registry.register(Box::new(stage_latency.clone()))?;
    registry.register(Box::new(stage_tokens_total.clone()))?;
    registry.register(Box::new(llm_cost_usd.clone()))?;
    registry.register(Box::new(rate_limit_waits.clone()))?;
    registry.register(Box::new(active_workers.clone()))?;
    registry.register(Box::new(queue_depth.clone()))?;

    // If any of these fail, metrics were already initialized (idempotent)
    let _ = REGISTRY.set(registry);
    let _ = JOBS_SUBMITTED.set(jobs_submitted);
    let _ = JOBS_TOTAL.set(jobs_total);
    let _ = JOB_DURATION.set(job_duration);
    let _ = STAGE_REQUESTS_TOTAL.set(stage_requests_total);
    let _ = STAGE_LATENCY.set(stage_latency);
    let _ = STAGE_TOKENS_TOTAL.set(stage_tokens_total);
    let _ = LLM_COST_USD.set(llm_cost_usd);
    let _ = RATE_LIMIT_WAITS.set(rate_limit_waits);
    let _ = ACTIVE_WORKERS.set(active_workers);
    let _ = QUEUE_DEPTH.set(queue_depth);

    tracing::info!("Prometheus metrics initialized successfully");

    Ok(())
}

/// Export all registered metrics in Prometheus text format.
///
/// Returns an explanatory comment line if the registry has not been
/// initialized or encoding fails.
pub fn export_metrics() -> String {
    let Some(registry) = REGISTRY.get() else {
        return "# Metrics not initialized. Call init_metrics() first.\n".to_string();
    };

    let encoder = TextEncoder::new();
    let metric_families = registry.gather();

    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        return format!("# Error encoding metrics: {}\n", e);
    }

    String::from_utf8(buffer)
        .unwrap_or_else(|e| format!("# Error converting metrics to UTF-8: {}\n", e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_metrics() {
        let result = init_metrics();
        // First call should succeed or metrics already initialized
        assert!(result.is_ok() || REGISTRY.get().is_some());
    }

    #[test]
    fn test_metrics_after_init() {
        let _ = init_metrics();

        let metrics = export_metrics();
        assert!(!metrics.is_empty());
        if REGISTRY.get().is_some() {
            assert!(!metrics.starts_with("# Error"));
        }
    }
}
