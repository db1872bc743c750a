//! Recording helpers.
//!
//! Each function wraps the raw Prometheus metrics with consistent labels and
//! does nothing when `init_metrics()` has not run, so library code and tests
//! can record freely.

use std::time::Duration;

use super::prometheus::{
    ACTIVE_WORKERS, JOBS_SUBMITTED, JOBS_TOTAL, JOB_DURATION, LLM_COST_USD, QUEUE_DEPTH,
    RATE_LIMIT_WAITS, STAGE_LATENCY, STAGE_REQUESTS_TOTAL, STAGE_TOKENS_TOTAL,
};
use crate::llm::Usage;
use crate::scheduler::QueueStats;

pub fn record_job_submitted() {
    if let Some(submitted) = JOBS_SUBMITTED.get() {
        submitted.inc();
    }
}

/// Records one processed attempt.
pub fn record_job(outcome: &str, duration: Duration) {
    if let Some(jobs_total) = JOBS_TOTAL.get() {
        jobs_total.with_label_values(&[outcome]).inc();
    }
    if let Some(job_duration) = JOB_DURATION.get() {
        job_duration
            .with_label_values(&[outcome])
            .observe(duration.as_secs_f64());
    }

    tracing::trace!(outcome, duration_ms = duration.as_millis() as u64, "Recorded job metric");
}

/// Records one stage execution.
///
/// `outcome` is `success`, `transient_failure` or `permanent_failure`.
pub fn record_stage(stage: &str, service: &str, outcome: &str, latency_secs: f64) {
    if let Some(requests) = STAGE_REQUESTS_TOTAL.get() {
        requests.with_label_values(&[stage, service, outcome]).inc();
    }
    if let Some(latency) = STAGE_LATENCY.get() {
        latency.with_label_values(&[stage]).observe(latency_secs);
    }
}

pub fn record_stage_usage(stage: &str, model: &str, usage: &Usage, cost_usd: f64) {
    if let Some(tokens) = STAGE_TOKENS_TOTAL.get() {
        tokens
            .with_label_values(&[stage, model, "prompt"])
            .inc_by(f64::from(usage.prompt_tokens));
        tokens
            .with_label_values(&[stage, model, "completion"])
            .inc_by(f64::from(usage.completion_tokens));
    }
    if let Some(cost) = LLM_COST_USD.get() {
        if cost_usd > 0.0 {
            cost.with_label_values(&[model]).inc_by(cost_usd);
        }
    }
}

pub fn record_rate_limit_wait(service: &str) {
    if let Some(waits) = RATE_LIMIT_WAITS.get() {
        waits.with_label_values(&[service]).inc();
    }
}

pub fn set_active_workers(count: u64) {
    if let Some(active) = ACTIVE_WORKERS.get() {
        active.set(count as f64);
    }
}

pub fn set_queue_depth(stats: &QueueStats) {
    let Some(depth) = QUEUE_DEPTH.get() else {
        return;
    };
    let name = stats.queue_name.as_str();
    for (state, count) in [
        ("pending", stats.pending_jobs),
        ("processing", stats.processing_jobs),
        ("delayed", stats.delayed_jobs),
        ("dead_letter", stats.dead_letter_jobs),
    ] {
        depth.with_label_values(&[name, state]).set(count as f64);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::{export_metrics, init_metrics};

    #[test]
    fn test_recording_shows_up_in_export() {
        let _ = init_metrics();

        record_job_submitted();
        record_job("completed", Duration::from_secs(12));
        record_stage("guardian", "anthropic", "success", 1.5);
        record_stage_usage("guardian", "claude-3-5-sonnet", &Usage::new(100, 20), 0.002);
        record_rate_limit_wait("github");
        set_active_workers(2);
        set_queue_depth(&QueueStats {
            queue_name: "reviews".to_string(),
            pending_jobs: 3,
            ..Default::default()
        });

        let text = export_metrics();
        assert!(text.contains("review_forge_jobs_total"));
        assert!(text.contains("review_forge_stage_requests_total"));
        assert!(text.contains("review_forge_rate_limit_waits_total"));
        assert!(text.contains("queue_name=\"reviews\""));
    }
}
