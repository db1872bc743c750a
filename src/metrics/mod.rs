//! Prometheus-based monitoring.
//!
//! # Example
//!
//! ```ignore
//! use review_forge::metrics::{export_metrics, init_metrics, record_job};
//!
//! init_metrics().expect("Failed to initialize metrics");
//! record_job("completed", started.elapsed());
//!
//! // Prometheus text exposition
//! let metrics_text = export_metrics();
//! ```

pub mod collectors;
pub mod prometheus;

pub use collectors::{
    record_job, record_job_submitted, record_rate_limit_wait, record_stage, record_stage_usage,
    set_active_workers, set_queue_depth,
};
pub use prometheus::{export_metrics, init_metrics, REGISTRY};
