//! Boundary to the issue-tracker / Git sync pipeline.
//!
//! The pipeline itself lives outside this crate. Work units run it inside a
//! container; the local fallback calls it in-process through [`SyncPipeline`].

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Knobs for the incremental engine
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IncrementalOptions {
    pub force: bool,
    pub dry_run: bool,
    pub include_new: bool,
    pub include_modified: bool,
}

/// Aggregate result of one pipeline run
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncOutcome {
    pub total_issues: u32,
    pub processed_issues: u32,
    pub successful_issues: u32,
    pub failed_issues: u32,
    #[serde(default)]
    pub created_files: Vec<String>,
    /// Per-issue error strings
    #[serde(default)]
    pub errors: Vec<String>,
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SyncPipeline: Send + Sync {
    async fn sync_issues(&self, issue_keys: Vec<String>, repository: String) -> anyhow::Result<SyncOutcome>;

    async fn sync_jql(&self, jql: String, repository: String) -> anyhow::Result<SyncOutcome>;

    async fn sync_issues_incremental(
        &self,
        issue_keys: Vec<String>,
        repository: String,
        options: IncrementalOptions,
    ) -> anyhow::Result<SyncOutcome>;

    async fn sync_jql_incremental(
        &self,
        jql: String,
        repository: String,
        options: IncrementalOptions,
    ) -> anyhow::Result<SyncOutcome>;
}
