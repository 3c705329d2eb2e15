//! Work-unit configuration and observed results

use super::errors::JobErrorKind;
use chrono::{DateTime, Utc};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Label and annotation keys stamped on every work unit
pub const LABEL_MANAGED_BY: &str = "app.kubernetes.io/managed-by";
pub const MANAGED_BY_VALUE: &str = "sync-controller";
pub const LABEL_JOB_ID: &str = "sync.platform/job-id";
pub const LABEL_JOB_KIND: &str = "sync.platform/job-kind";
pub const LABEL_PRIORITY: &str = "sync.platform/priority";
pub const LABEL_SYNC_REQUEST: &str = "sync.platform/sync-request";
pub const ANNOTATION_TOTAL_ISSUES: &str = "sync.platform/total-issues";

/// Progress annotations the sync worker writes onto its own Job
pub const ANNOTATION_PROCESSED_ISSUES: &str = "sync.platform/processed-issues";
pub const ANNOTATION_SUCCEEDED_ISSUES: &str = "sync.platform/succeeded-issues";
pub const ANNOTATION_FAILED_ISSUES: &str = "sync.platform/failed-issues";
pub const ANNOTATION_FILES: &str = "sync.platform/files";

/// Shape of a work unit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobKind {
    Single,
    Batch,
    Query,
}

impl JobKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            JobKind::Single => "single",
            JobKind::Batch => "batch",
            JobKind::Query => "query",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "single" => Some(JobKind::Single),
            "batch" => Some(JobKind::Batch),
            "query" | "jql" => Some(JobKind::Query),
            _ => None,
        }
    }
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<crate::crds::SyncType> for JobKind {
    fn from(sync_type: crate::crds::SyncType) -> Self {
        match sync_type {
            crate::crds::SyncType::Single => JobKind::Single,
            crate::crds::SyncType::Batch => JobKind::Batch,
            crate::crds::SyncType::Query => JobKind::Query,
        }
    }
}

/// Observed work-unit status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    Unknown,
}

impl JobStatus {
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Succeeded | JobStatus::Failed)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let status = match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Succeeded => "succeeded",
            JobStatus::Failed => "failed",
            JobStatus::Unknown => "unknown",
        };
        f.write_str(status)
    }
}

/// CPU/memory overrides, in Kubernetes quantity notation
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceOverrides {
    pub cpu_request: Option<String>,
    pub cpu_limit: Option<String>,
    pub memory_request: Option<String>,
    pub memory_limit: Option<String>,
}

/// Everything needed to launch one work unit. Immutable once submitted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobConfig {
    pub job_id: String,
    pub kind: JobKind,
    /// Issue keys for single/batch work units
    #[serde(default)]
    pub issue_keys: Vec<String>,
    /// JQL for query work units
    #[serde(default)]
    pub jql: Option<String>,
    pub repository: String,
    #[serde(default)]
    pub branch: Option<String>,
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default)]
    pub concurrency: Option<u32>,
    #[serde(default)]
    pub rate_limit: Option<f64>,
    #[serde(default)]
    pub parallelism: Option<i32>,
    #[serde(default)]
    pub completions: Option<i32>,
    #[serde(default)]
    pub timeout_seconds: Option<i64>,
    #[serde(default)]
    pub resources: Option<ResourceOverrides>,
    #[serde(default)]
    pub image: Option<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    #[serde(default)]
    pub dry_run: bool,
    #[serde(default)]
    pub force: bool,
    #[serde(default)]
    pub incremental: bool,
    #[serde(default)]
    pub safe_mode: bool,
    #[serde(default)]
    pub include_links: bool,
    /// Controller reference written onto the Job
    #[serde(default)]
    pub owner: Option<OwnerReference>,
}

impl JobConfig {
    /// Minimal configuration; everything else is filled in by the template
    pub fn new(job_id: impl Into<String>, kind: JobKind, repository: impl Into<String>) -> Self {
        Self {
            job_id: job_id.into(),
            kind,
            issue_keys: Vec::new(),
            jql: None,
            repository: repository.into(),
            branch: None,
            path: None,
            concurrency: None,
            rate_limit: None,
            parallelism: None,
            completions: None,
            timeout_seconds: None,
            resources: None,
            image: None,
            env: BTreeMap::new(),
            labels: BTreeMap::new(),
            dry_run: false,
            force: false,
            incremental: false,
            safe_mode: false,
            include_links: false,
            owner: None,
        }
    }

    /// What the work unit syncs, for display and validation
    #[must_use]
    pub fn target(&self) -> String {
        match self.kind {
            JobKind::Single | JobKind::Batch => self.issue_keys.join(","),
            JobKind::Query => self.jql.clone().unwrap_or_default(),
        }
    }
}

/// Observed outcome of a work unit, translated from cluster state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobReport {
    pub job_id: String,
    pub kind: Option<JobKind>,
    pub status: JobStatus,
    pub start_time: Option<DateTime<Utc>>,
    pub completion_time: Option<DateTime<Utc>>,
    pub duration_seconds: Option<i64>,
    pub total_issues: u32,
    pub processed_issues: u32,
    pub successful_issues: u32,
    pub failed_issues: u32,
    #[serde(default)]
    pub created_files: Vec<String>,
    #[serde(default)]
    pub errors: Vec<String>,
    pub message: Option<String>,
    /// Classification of a failed work unit
    #[serde(default)]
    pub failure_kind: Option<JobErrorKind>,
    /// Desired parallelism; zero after cancellation
    pub parallelism: Option<i32>,
    pub completions: Option<i32>,
    pub succeeded_pods: i32,
    pub active_pods: i32,
    /// Controller reference of the Job, if any
    #[serde(default)]
    pub owner: Option<OwnerReference>,
}

impl JobReport {
    /// Share of issues processed, clamped to 0..=100
    #[must_use]
    pub fn percentage(&self) -> u32 {
        if self.status == JobStatus::Succeeded {
            return 100;
        }
        if self.total_issues == 0 {
            return 0;
        }
        let pct = u64::from(self.processed_issues) * 100 / u64::from(self.total_issues);
        u32::try_from(pct.min(100)).unwrap_or(100)
    }
}

/// One event on a job watch
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobMonitor {
    pub job_id: String,
    pub status: JobStatus,
    /// succeeded / completions * 100
    pub progress: f64,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

/// Aggregate counts across every tracked work unit
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStatus {
    pub pending: usize,
    pub running: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub unknown: usize,
    pub total: usize,
}

impl QueueStatus {
    pub fn record(&mut self, status: JobStatus) {
        match status {
            JobStatus::Pending => self.pending += 1,
            JobStatus::Running => self.running += 1,
            JobStatus::Succeeded => self.succeeded += 1,
            JobStatus::Failed => self.failed += 1,
            JobStatus::Unknown => self.unknown += 1,
        }
        self.total += 1;
    }
}

/// Listing filter. Kind and status are independent predicates.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JobFilter {
    pub kind: Option<JobKind>,
    pub status: Option<JobStatus>,
    pub limit: Option<usize>,
}

impl JobFilter {
    #[must_use]
    pub fn matches(&self, report: &JobReport) -> bool {
        let kind_ok = self.kind.map_or(true, |kind| report.kind == Some(kind));
        let status_ok = self.status.map_or(true, |status| report.status == status);
        kind_ok && status_ok
    }
}
