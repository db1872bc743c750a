//! Source-control platform access.
//!
//! The lifecycle manager reads diffs through [`DiffSource`] and posts the
//! aggregated review through [`CommentSink`]. [`GitHubClient`] implements
//! both against the GitHub REST API.

mod client;

use async_trait::async_trait;
use thiserror::Error;

use crate::ratelimit::RateLimitError;

pub use client::{GitHubClient, GITHUB_API_BASE};

/// Errors from the source-control API.
#[derive(Debug, Error)]
pub enum GitHubError {
    #[error("GitHub request failed: {0}")]
    Request(String),

    #[error("GitHub returned HTTP {status}: {body}")]
    Status { status: u16, body: String },

    #[error("Failed to parse GitHub response: {0}")]
    Parse(String),

    #[error("Invalid repository '{0}', expected owner/name")]
    InvalidRepository(String),

    #[error(transparent)]
    RateLimit(#[from] RateLimitError),
}

impl GitHubError {
    /// Whether retrying the same call later may succeed.
    ///
    /// GitHub signals secondary rate limits with 403, so it counts as
    /// transient alongside 429 and server errors.
    pub fn is_transient(&self) -> bool {
        match self {
            GitHubError::Request(_) => true,
            GitHubError::Status { status, .. } => {
                matches!(*status, 403 | 408 | 429) || *status >= 500
            }
            GitHubError::Parse(_)
            | GitHubError::InvalidRepository(_)
            | GitHubError::RateLimit(_) => false,
        }
    }
}

/// Result of posting a review comment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PostedComment {
    /// Id of the comment carrying the marker.
    pub id: u64,
    /// True when a comment with the marker already existed and nothing was posted.
    pub already_present: bool,
}

/// Fetches the unified diff of a pull request.
#[async_trait]
pub trait DiffSource: Send + Sync {
    async fn fetch_diff(
        &self,
        repository: &str,
        pr_number: u64,
        installation_id: Option<u64>,
    ) -> Result<String, GitHubError>;
}

/// Posts a review comment on a pull request.
///
/// `marker` is a string unique to the job embedded in `body`. Implementations
/// must not post a second comment when one containing `marker` already exists.
#[async_trait]
pub trait CommentSink: Send + Sync {
    async fn post_comment(
        &self,
        repository: &str,
        pr_number: u64,
        body: &str,
        marker: &str,
    ) -> Result<PostedComment, GitHubError>;
}

/// Splits `owner/name`.
pub fn split_repository(repository: &str) -> Result<(&str, &str), GitHubError> {
    match repository.split_once('/') {
        Some((owner, name)) if !owner.is_empty() && !name.is_empty() && !name.contains('/') => {
            Ok((owner, name))
        }
        _ => Err(GitHubError::InvalidRepository(repository.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_repository() {
        assert_eq!(split_repository("rust-lang/rust").ok(), Some(("rust-lang", "rust")));
        assert!(split_repository("rust").is_err());
        assert!(split_repository("/rust").is_err());
        assert!(split_repository("a/b/c").is_err());
    }

    #[test]
    fn test_transient_statuses() {
        let status = |status| GitHubError::Status {
            status,
            body: String::new(),
        };
        assert!(status(502).is_transient());
        assert!(status(429).is_transient());
        assert!(status(403).is_transient());
        assert!(!status(404).is_transient());
        assert!(!status(422).is_transient());
        assert!(GitHubError::Request("reset".into()).is_transient());
        assert!(!GitHubError::InvalidRepository("x".into()).is_transient());
    }
}
