//! Review job definitions.
//!
//! - `Job`: one pull request to review, with its retry budget
//! - `JobStatus`: lifecycle state and the allowed transitions
//! - `DiffRef`: where the diff comes from

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::pipeline::JobContext;

/// Default maximum number of attempts for a job.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Lifecycle state of a job.
///
/// ```text
/// queued ──▶ processing ──▶ completed
///               │  ▲  │
///               │  └──┘ (claim lease expired)
///               ├──▶ retrying ──▶ queued
///               └──▶ dead_lettered
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Processing,
    Retrying,
    Completed,
    DeadLettered,
}

impl JobStatus {
    pub const ALL: [JobStatus; 5] = [
        JobStatus::Queued,
        JobStatus::Processing,
        JobStatus::Retrying,
        JobStatus::Completed,
        JobStatus::DeadLettered,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Processing => "processing",
            JobStatus::Retrying => "retrying",
            JobStatus::Completed => "completed",
            JobStatus::DeadLettered => "dead_lettered",
        }
    }

    /// `completed` and `dead_lettered` are final.
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::DeadLettered)
    }

    /// Whether `self -> next` is an edge of the lifecycle.
    ///
    /// `processing -> processing` is only legal when a worker re-claims a
    /// job whose previous claim lease expired. `retrying -> processing` and
    /// `retrying -> dead_lettered` recover a job whose worker died before
    /// scheduling its retry.
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        use JobStatus::*;
        matches!(
            (self, next),
            (Queued, Processing)
                | (Processing, Completed)
                | (Processing, Retrying)
                | (Processing, DeadLettered)
                | (Processing, Processing)
                | (Retrying, Queued)
                | (Retrying, Processing)
                | (Retrying, DeadLettered)
        )
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        JobStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| format!("unknown job status '{}'", s))
    }
}

/// Source of the diff to review.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "text", rename_all = "snake_case")]
pub enum DiffRef {
    /// Fetch from the source-control platform when the job runs.
    Remote,
    /// Diff supplied with the job.
    Inline(String),
}

/// A pull request review job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    /// `owner/name`.
    pub repository: String,
    pub pr_number: u64,
    pub diff: DiffRef,
    pub status: JobStatus,
    /// Attempts started so far. Never decreases.
    pub attempts: u32,
    pub max_attempts: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub installation_id: Option<u64>,
    #[serde(default)]
    pub head_sha: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub last_error: Option<String>,
    /// Earliest time a retry may start.
    #[serde(default)]
    pub not_before: Option<DateTime<Utc>>,
}

impl Job {
    /// Creates a queued job that fetches its diff remotely.
    pub fn new(repository: impl Into<String>, pr_number: u64) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            repository: repository.into(),
            pr_number,
            diff: DiffRef::Remote,
            status: JobStatus::Queued,
            attempts: 0,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            created_at: now,
            updated_at: now,
            installation_id: None,
            head_sha: None,
            title: None,
            last_error: None,
            not_before: None,
        }
    }

    pub fn with_inline_diff(mut self, diff: impl Into<String>) -> Self {
        self.diff = DiffRef::Inline(diff.into());
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn with_installation_id(mut self, installation_id: u64) -> Self {
        self.installation_id = Some(installation_id);
        self
    }

    pub fn with_head_sha(mut self, head_sha: impl Into<String>) -> Self {
        self.head_sha = Some(head_sha.into());
        self
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }

    /// Returns whether another attempt is allowed after a failure.
    pub fn should_retry(&self) -> bool {
        self.attempts < self.max_attempts
    }

    pub fn remaining_attempts(&self) -> u32 {
        self.max_attempts.saturating_sub(self.attempts)
    }

    /// Pipeline context for the current attempt.
    pub fn context(&self) -> JobContext {
        JobContext {
            job_id: self.id,
            attempt: self.attempts,
            repository: self.repository.clone(),
            pr_number: self.pr_number,
            title: self.title.clone(),
        }
    }

    pub fn age(&self) -> chrono::Duration {
        Utc::now() - self.created_at
    }
}
