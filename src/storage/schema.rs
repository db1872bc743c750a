//! Database schema constants.
//!
//! Every statement is idempotent so migrations can be re-run safely.

/// Review jobs and their claim lease.
pub const CREATE_REVIEW_JOBS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS review_jobs (
    id UUID PRIMARY KEY,
    repository VARCHAR(255) NOT NULL,
    pr_number BIGINT NOT NULL,
    diff JSONB NOT NULL,
    status VARCHAR(32) NOT NULL,
    attempts INTEGER NOT NULL DEFAULT 0,
    max_attempts INTEGER NOT NULL,
    installation_id BIGINT,
    head_sha VARCHAR(64),
    title TEXT,
    last_error TEXT,
    not_before TIMESTAMPTZ,
    claimed_by VARCHAR(255),
    lease_expires_at TIMESTAMPTZ,
    created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
)
"#;

/// Append-only stage results, one row per stage per attempt.
pub const CREATE_STAGE_RESULTS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS stage_results (
    id BIGSERIAL PRIMARY KEY,
    job_id UUID NOT NULL REFERENCES review_jobs(id) ON DELETE CASCADE,
    attempt INTEGER NOT NULL,
    stage VARCHAR(32) NOT NULL,
    status VARCHAR(16) NOT NULL,
    output TEXT NOT NULL,
    error_kind VARCHAR(16),
    error_message TEXT,
    latency_ms BIGINT NOT NULL,
    prompt_tokens INTEGER NOT NULL,
    completion_tokens INTEGER NOT NULL,
    total_tokens INTEGER NOT NULL,
    model VARCHAR(255) NOT NULL,
    cost_usd DOUBLE PRECISION NOT NULL,
    created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
)
"#;

/// At most one review per job.
pub const CREATE_AGGREGATED_REVIEWS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS aggregated_reviews (
    job_id UUID PRIMARY KEY REFERENCES review_jobs(id) ON DELETE CASCADE,
    attempt INTEGER NOT NULL,
    body TEXT NOT NULL,
    unavailable JSONB NOT NULL,
    total_tokens BIGINT NOT NULL,
    total_cost_usd DOUBLE PRECISION NOT NULL,
    comment_id BIGINT,
    comment_posted BOOLEAN NOT NULL DEFAULT FALSE,
    created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    posted_at TIMESTAMPTZ
)
"#;

pub const CREATE_REVIEW_JOBS_STATUS_INDEX: &str =
    "CREATE INDEX IF NOT EXISTS idx_review_jobs_status ON review_jobs(status)";

pub const CREATE_REVIEW_JOBS_REPOSITORY_INDEX: &str =
    "CREATE INDEX IF NOT EXISTS idx_review_jobs_repository ON review_jobs(repository, pr_number)";

pub const CREATE_STAGE_RESULTS_JOB_INDEX: &str =
    "CREATE INDEX IF NOT EXISTS idx_stage_results_job_id ON stage_results(job_id, attempt)";

/// Returns all schema creation statements in the correct order.
///
/// Each entry is a single statement; prepared statements cannot batch.
pub fn all_schema_statements() -> Vec<&'static str> {
    vec![
        CREATE_REVIEW_JOBS_TABLE,
        CREATE_STAGE_RESULTS_TABLE,
        CREATE_AGGREGATED_REVIEWS_TABLE,
        CREATE_REVIEW_JOBS_STATUS_INDEX,
        CREATE_REVIEW_JOBS_REPOSITORY_INDEX,
        CREATE_STAGE_RESULTS_JOB_INDEX,
    ]
}

/// Table names in the schema.
pub mod tables {
    pub const REVIEW_JOBS: &str = "review_jobs";
    pub const STAGE_RESULTS: &str = "stage_results";
    pub const AGGREGATED_REVIEWS: &str = "aggregated_reviews";
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_all_schema_statements_order() {
        let statements = all_schema_statements();
        assert_eq!(statements.len(), 6);
        // review_jobs must come first (other tables reference it)
        assert!(statements[0].contains(tables::REVIEW_JOBS));
        assert!(statements[1].contains(tables::STAGE_RESULTS));
        assert!(statements[2].contains(tables::AGGREGATED_REVIEWS));
        assert!(statements[3..].iter().all(|s| s.contains("CREATE INDEX")));
    }

    #[test]
    fn test_statements_are_idempotent_and_single() {
        for statement in all_schema_statements() {
            assert!(statement.contains("IF NOT EXISTS"));
            assert!(!statement.trim().trim_end_matches(';').contains(';'));
        }
    }
}
