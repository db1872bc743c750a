//! GitHub REST client for diffs and review comments.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response};
use serde::Deserialize;
use tracing::{debug, info};

use super::{split_repository, CommentSink, DiffSource, GitHubError, PostedComment};
use crate::ratelimit::{RateLimiter, GITHUB_SERVICE};

/// Default GitHub REST API base.
pub const GITHUB_API_BASE: &str = "https://api.github.com";

const USER_AGENT: &str = "review-forge/0.1";
const COMMENTS_PER_PAGE: usize = 100;
const JSON_MEDIA_TYPE: &str = "application/vnd.github+json";
const DIFF_MEDIA_TYPE: &str = "application/vnd.github.v3.diff";

#[derive(Debug, Deserialize)]
struct IssueComment {
    id: u64,
    #[serde(default)]
    body: Option<String>,
}

/// GitHub REST API client.
///
/// Every HTTP call debits one token from the `github` budget when a rate
/// limiter is attached.
pub struct GitHubClient {
    client: Client,
    api_base: String,
    token: Option<String>,
    limiter: Option<Arc<RateLimiter>>,
}

impl GitHubClient {
    /// Creates a client with the default 30 second HTTP timeout.
    pub fn new(token: Option<String>) -> Self {
        Self {
            client: Client::builder()
                .timeout(Duration::from_secs(30))
                .build()
                .unwrap_or_else(|_| Client::new()),
            api_base: GITHUB_API_BASE.to_string(),
            token: token.filter(|t| !t.trim().is_empty()),
            limiter: None,
        }
    }

    /// Charges every request to the `github` budget of `limiter`.
    pub fn with_rate_limiter(mut self, limiter: Arc<RateLimiter>) -> Self {
        self.limiter = Some(limiter);
        self
    }

    /// Points the client at another API base (GitHub Enterprise, test servers).
    pub fn with_api_base(mut self, api_base: impl Into<String>) -> Self {
        self.api_base = api_base.into().trim_end_matches('/').to_string();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.client = Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_else(|_| Client::new());
        self
    }

    fn request(&self, method: reqwest::Method, path: &str, accept: &str) -> RequestBuilder {
        let mut request = self
            .client
            .request(method, format!("{}{}", self.api_base, path))
            .header("User-Agent", USER_AGENT)
            .header("Accept", accept)
            .header("X-GitHub-Api-Version", "2022-11-28");
        if let Some(ref token) = self.token {
            request = request.header("Authorization", format!("Bearer {token}"));
        }
        request
    }

    async fn send(&self, request: RequestBuilder) -> Result<Response, GitHubError> {
        if let Some(ref limiter) = self.limiter {
            limiter.acquire(GITHUB_SERVICE, 1).await?;
        }

        let response = request
            .send()
            .await
            .map_err(|e| GitHubError::Request(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(GitHubError::Status {
                status: status.as_u16(),
                body,
            });
        }
        Ok(response)
    }

    /// Finds an existing issue comment whose body contains `marker`.
    async fn find_marked_comment(
        &self,
        owner: &str,
        name: &str,
        pr_number: u64,
        marker: &str,
    ) -> Result<Option<u64>, GitHubError> {
        let mut page = 1;
        loop {
            let path = format!(
                "/repos/{owner}/{name}/issues/{pr_number}/comments?per_page={COMMENTS_PER_PAGE}&page={page}"
            );
            let comments: Vec<IssueComment> = self
                .send(self.request(reqwest::Method::GET, &path, JSON_MEDIA_TYPE))
                .await?
                .json()
                .await
                .map_err(|e| GitHubError::Parse(e.to_string()))?;

            if let Some(found) = comments
                .iter()
                .find(|c| c.body.as_deref().is_some_and(|b| b.contains(marker)))
            {
                return Ok(Some(found.id));
            }
            if comments.len() < COMMENTS_PER_PAGE {
                return Ok(None);
            }
            page += 1;
        }
    }
}

#[async_trait]
impl DiffSource for GitHubClient {
    async fn fetch_diff(
        &self,
        repository: &str,
        pr_number: u64,
        installation_id: Option<u64>,
    ) -> Result<String, GitHubError> {
        let (owner, name) = split_repository(repository)?;
        let path = format!("/repos/{owner}/{name}/pulls/{pr_number}");
        let request = self.request(reqwest::Method::GET, &path, DIFF_MEDIA_TYPE);

        let diff = self
            .send(request)
            .await?
            .text()
            .await
            .map_err(|e| GitHubError::Parse(e.to_string()))?;

        info!(
            repository = repository,
            pr_number = pr_number,
            installation_id = ?installation_id,
            diff_size = diff.len(),
            "Fetched PR diff"
        );
        Ok(diff)
    }
}

#[async_trait]
impl CommentSink for GitHubClient {
    async fn post_comment(
        &self,
        repository: &str,
        pr_number: u64,
        body: &str,
        marker: &str,
    ) -> Result<PostedComment, GitHubError> {
        let (owner, name) = split_repository(repository)?;

        if let Some(id) = self.find_marked_comment(owner, name, pr_number, marker).await? {
            debug!(
                repository = repository,
                pr_number = pr_number,
                comment_id = id,
                "Review comment already present, not posting again"
            );
            return Ok(PostedComment {
                id,
                already_present: true,
            });
        }

        let path = format!("/repos/{owner}/{name}/issues/{pr_number}/comments");
        let request = self
            .request(reqwest::Method::POST, &path, JSON_MEDIA_TYPE)
            .json(&serde_json::json!({ "body": body }));

        let created: IssueComment = self
            .send(request)
            .await?
            .json()
            .await
            .map_err(|e| GitHubError::Parse(e.to_string()))?;

        info!(
            repository = repository,
            pr_number = pr_number,
            comment_id = created.id,
            "Posted review comment"
        );
        Ok(PostedComment {
            id: created.id,
            already_present: false,
        })
    }
}
