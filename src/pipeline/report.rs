//! Aggregated review assembly.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::stage::{StageName, StageResult};

/// Output used by analysis stages when the filtered diff is empty.
pub const NO_CHANGES_NOTE: &str = "No substantive changes to analyze.";

const UNAVAILABLE_NOTE: &str = "Analysis unavailable: this stage could not be completed.";

/// Hidden HTML comment identifying the job a posted review belongs to.
pub fn idempotency_marker(job_id: Uuid) -> String {
    format!("<!-- review-forge:job={} -->", job_id)
}

/// The single report produced for a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregatedReview {
    pub job_id: Uuid,
    /// Attempt that produced the review.
    pub attempt: u32,
    /// Markdown body, footer and marker included.
    pub body: String,
    /// Analysis stages that failed and are missing from the review.
    pub unavailable: Vec<StageName>,
    pub total_tokens: u64,
    pub total_cost_usd: f64,
    pub created_at: DateTime<Utc>,
    pub comment_id: Option<u64>,
    pub comment_posted: bool,
}

impl AggregatedReview {
    /// Builds the review from the Synthesizer text and every result of the attempt.
    pub fn assemble(job_id: Uuid, attempt: u32, synthesis: &str, results: &[StageResult]) -> Self {
        let unavailable: Vec<StageName> = results
            .iter()
            .filter(|r| r.stage.is_analysis() && !r.is_success())
            .map(|r| r.stage)
            .collect();
        let total_tokens: u64 = results.iter().map(|r| u64::from(r.usage.total_tokens)).sum();
        let total_cost_usd: f64 = results.iter().map(|r| r.cost_usd).sum();

        let mut body = synthesis.trim_end().to_string();
        body.push_str("\n\n---\n");
        if !unavailable.is_empty() {
            let names = unavailable
                .iter()
                .map(|s| format!("{} ({})", s.title(), s))
                .collect::<Vec<_>>()
                .join(", ");
            body.push_str(&format!("**Unavailable analyses:** {}\n\n", names));
        }
        body.push_str(&format!(
            "<sub>{} tokens, estimated cost ${:.4}</sub>\n{}",
            total_tokens,
            total_cost_usd,
            idempotency_marker(job_id)
        ));

        Self {
            job_id,
            attempt,
            body,
            unavailable,
            total_tokens,
            total_cost_usd,
            created_at: Utc::now(),
            comment_id: None,
            comment_posted: false,
        }
    }

    pub fn marker(&self) -> String {
        idempotency_marker(self.job_id)
    }

    pub fn is_degraded(&self) -> bool {
        !self.unavailable.is_empty()
    }
}

/// Renders the analysis results as Synthesizer input.
///
/// Failed analyses get an explicit unavailable marker instead of their output.
pub fn render_analyses(results: &[StageResult]) -> String {
    StageName::ANALYSES
        .iter()
        .map(|stage| {
            let text = results
                .iter()
                .find(|r| r.stage == *stage)
                .filter(|r| r.is_success())
                .map(|r| r.output.as_str())
                .unwrap_or(UNAVAILABLE_NOTE);
            format!("## {} ({})\n{}", stage.title(), stage, text)
        })
        .collect::<Vec<_>>()
        .join("\n\n")
}
