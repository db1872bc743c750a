//! Stage identities and per-stage results.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub use crate::llm::Usage as TokenUsage;

/// The five review stages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageName {
    Scout,
    Guardian,
    Architect,
    Stylist,
    Synthesizer,
}

impl StageName {
    /// All stages in execution order.
    pub const ALL: [StageName; 5] = [
        StageName::Scout,
        StageName::Guardian,
        StageName::Architect,
        StageName::Stylist,
        StageName::Synthesizer,
    ];

    /// The stages that run concurrently between Scout and Synthesizer.
    pub const ANALYSES: [StageName; 3] = [
        StageName::Guardian,
        StageName::Architect,
        StageName::Stylist,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            StageName::Scout => "scout",
            StageName::Guardian => "guardian",
            StageName::Architect => "architect",
            StageName::Stylist => "stylist",
            StageName::Synthesizer => "synthesizer",
        }
    }

    /// Heading used for the stage in review text.
    pub fn title(&self) -> &'static str {
        match self {
            StageName::Scout => "Change Overview",
            StageName::Guardian => "Security Review",
            StageName::Architect => "Architecture Review",
            StageName::Stylist => "Style Review",
            StageName::Synthesizer => "Summary",
        }
    }

    pub fn is_analysis(&self) -> bool {
        Self::ANALYSES.contains(self)
    }
}

impl fmt::Display for StageName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StageName {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        StageName::ALL
            .into_iter()
            .find(|stage| stage.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| format!("unknown stage '{}'", s))
    }
}

/// Whether a failure may go away on a later attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Network errors, timeouts, throttling, server errors.
    Transient,
    /// Malformed responses, client errors, misconfiguration.
    Permanent,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureKind::Transient => f.write_str("transient"),
            FailureKind::Permanent => f.write_str("permanent"),
        }
    }
}

/// Classified stage failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageError {
    pub kind: FailureKind,
    pub message: String,
}

impl StageError {
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::Transient,
            message: message.into(),
        }
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::Permanent,
            message: message.into(),
        }
    }
}

impl fmt::Display for StageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} failure: {}", self.kind, self.message)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    Success,
    Failure,
}

impl StageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            StageStatus::Success => "success",
            StageStatus::Failure => "failure",
        }
    }
}

/// Outcome of one stage execution for one job attempt.
///
/// Results are append-only; a retried job produces a new set keyed by
/// `attempt`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageResult {
    pub job_id: Uuid,
    pub attempt: u32,
    pub stage: StageName,
    pub status: StageStatus,
    /// Generated text. Empty on failure.
    pub output: String,
    pub error: Option<StageError>,
    pub latency_ms: u64,
    pub usage: TokenUsage,
    /// Model that produced the output; empty for locally computed results.
    pub model: String,
    pub cost_usd: f64,
    pub created_at: DateTime<Utc>,
}

impl StageResult {
    /// A successful remote stage execution.
    #[allow(clippy::too_many_arguments)]
    pub fn success(
        job_id: Uuid,
        attempt: u32,
        stage: StageName,
        output: String,
        latency_ms: u64,
        usage: TokenUsage,
        model: impl Into<String>,
        cost_usd: f64,
    ) -> Self {
        Self {
            job_id,
            attempt,
            stage,
            status: StageStatus::Success,
            output,
            error: None,
            latency_ms,
            usage,
            model: model.into(),
            cost_usd,
            created_at: Utc::now(),
        }
    }

    /// A success computed without any remote call.
    pub fn local(job_id: Uuid, attempt: u32, stage: StageName, output: impl Into<String>) -> Self {
        Self::success(
            job_id,
            attempt,
            stage,
            output.into(),
            0,
            TokenUsage::default(),
            "",
            0.0,
        )
    }

    pub fn failure(
        job_id: Uuid,
        attempt: u32,
        stage: StageName,
        error: StageError,
        latency_ms: u64,
        model: impl Into<String>,
    ) -> Self {
        Self {
            job_id,
            attempt,
            stage,
            status: StageStatus::Failure,
            output: String::new(),
            error: Some(error),
            latency_ms,
            usage: TokenUsage::default(),
            model: model.into(),
            cost_usd: 0.0,
            created_at: Utc::now(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == StageStatus::Success
    }

    pub fn failure_kind(&self) -> Option<FailureKind> {
        self.error.as_ref().map(|e| e.kind)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_name_serde_and_parse() {
        let json = serde_json::to_string(&StageName::Synthesizer).expect("serializable");
        assert_eq!(json, "\"synthesizer\"");
        assert_eq!("Guardian".parse::<StageName>(), Ok(StageName::Guardian));
        assert!("linter".parse::<StageName>().is_err());
        assert_eq!(StageName::Stylist.to_string(), "stylist");
    }

    #[test]
    fn test_analysis_set() {
        assert!(!StageName::Scout.is_analysis());
        assert!(StageName::Architect.is_analysis());
        assert!(!StageName::Synthesizer.is_analysis());
    }

    #[test]
    fn test_failure_result() {
        let id = Uuid::new_v4();
        let result = StageResult::failure(
            id,
            2,
            StageName::Guardian,
            StageError::transient("timed out"),
            60_000,
            "claude-3-5-sonnet",
        );
        assert!(!result.is_success());
        assert_eq!(result.failure_kind(), Some(FailureKind::Transient));
        assert!(result.output.is_empty());
        assert_eq!(result.attempt, 2);
    }

    #[test]
    fn test_local_result_has_no_cost() {
        let result = StageResult::local(Uuid::new_v4(), 1, StageName::Stylist, "nothing to do");
        assert!(result.is_success());
        assert_eq!(result.usage.total_tokens, 0);
        assert_eq!(result.cost_usd, 0.0);
        assert!(result.model.is_empty());
    }
}
