//! `SyncRequest` Custom Resource Definition for issue-to-Git sync requests

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Annotation keys carrying request-only provenance. They ride along on the
/// resource metadata and never feed back into the spec.
pub const ANNOTATION_SAFE_MODE: &str = "sync.platform/safe-mode";
pub const ANNOTATION_ASYNC: &str = "sync.platform/async";
pub const ANNOTATION_SOURCE: &str = "sync.platform/source";
pub const ANNOTATION_ISSUE_COUNT: &str = "sync.platform/issue-count";

/// Condition types written by the control loop
pub const CONDITION_READY: &str = "Ready";
pub const CONDITION_PROCESSING: &str = "Processing";
pub const CONDITION_API_SERVER_READY: &str = "APIServerReady";
pub const CONDITION_FAILED: &str = "Failed";
pub const CONDITION_COMPLETED: &str = "Completed";

fn default_branch() -> String {
    "main".to_string()
}

fn default_path() -> String {
    "/".to_string()
}

fn default_timeout() -> String {
    "1800s".to_string()
}

fn default_requires_api_server() -> bool {
    true
}

/// Kind of sync a request performs
#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq, Hash, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum SyncType {
    /// One issue key
    Single,
    /// An explicit list of issue keys
    Batch,
    /// Every issue matched by a JQL query (or a whole project)
    Query,
}

impl fmt::Display for SyncType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyncType::Single => write!(f, "single"),
            SyncType::Batch => write!(f, "batch"),
            SyncType::Query => write!(f, "query"),
        }
    }
}

/// Scheduling priority, carried to the work unit as a label
#[derive(Deserialize, Serialize, Clone, Copy, Debug, Default, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
    Critical,
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Priority::Low => write!(f, "low"),
            Priority::Normal => write!(f, "normal"),
            Priority::High => write!(f, "high"),
            Priority::Critical => write!(f, "critical"),
        }
    }
}

/// What to sync
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SyncTarget {
    /// Issue keys for single and batch syncs
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub issue_keys: Vec<String>,

    /// JQL query for query syncs
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jql_query: Option<String>,

    /// Project key; a query sync without `jqlQuery` syncs the whole project
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_key: Option<String>,
}

/// Where synced content is written
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Destination {
    /// Git repository URL (HTTPS or SSH)
    pub repository: String,

    #[serde(default = "default_branch")]
    pub branch: String,

    /// Directory inside the repository
    #[serde(default = "default_path")]
    pub path: String,
}

/// Retry schedule for failed attempts
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub backoff_multiplier: f64,
    /// Delay before the first retry, e.g. "30s" or "100ms"
    pub initial_delay: String,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            backoff_multiplier: 2.0,
            initial_delay: "30s".to_string(),
        }
    }
}

/// Tuning knobs passed through to the sync worker
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SyncOptions {
    #[serde(default)]
    pub concurrency: Option<u32>,

    /// Requests per second against the issue tracker
    #[serde(default)]
    pub rate_limit: Option<f64>,

    #[serde(default)]
    pub parallelism: Option<u32>,

    #[serde(default)]
    pub incremental: bool,

    #[serde(default)]
    pub force: bool,

    #[serde(default)]
    pub dry_run: bool,

    #[serde(default)]
    pub include_links: bool,
}

/// `SyncRequest` CRD: a declarative request to sync issues into a repository
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, PartialEq, JsonSchema)]
#[kube(group = "sync.platform", version = "v1", kind = "SyncRequest")]
#[kube(namespaced)]
#[kube(status = "SyncRequestStatus")]
#[kube(shortname = "sr")]
#[kube(printcolumn = r#"{"name":"Type","type":"string","jsonPath":".spec.syncType"}"#)]
#[kube(printcolumn = r#"{"name":"Phase","type":"string","jsonPath":".status.phase"}"#)]
#[kube(printcolumn = r#"{"name":"Progress","type":"integer","jsonPath":".status.progress.percentage"}"#)]
#[kube(printcolumn = r#"{"name":"Retries","type":"integer","jsonPath":".status.retryCount"}"#)]
#[kube(printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#)]
#[serde(rename_all = "camelCase")]
pub struct SyncRequestSpec {
    pub sync_type: SyncType,

    pub target: SyncTarget,

    pub destination: Destination,

    #[serde(default)]
    pub priority: Priority,

    /// Overall deadline for the work unit, e.g. "1800s"
    #[serde(default = "default_timeout")]
    pub timeout: String,

    #[serde(default)]
    pub retry_policy: RetryPolicy,

    #[serde(default)]
    pub labels: BTreeMap<String, String>,

    #[serde(default)]
    pub options: SyncOptions,

    /// Whether processing waits for an `ApiServer` in the same namespace
    #[serde(default = "default_requires_api_server")]
    pub requires_api_server: bool,
}

impl SyncRequestSpec {
    /// Number of issues named explicitly by the target (0 for query syncs)
    #[must_use]
    pub fn issue_count(&self) -> usize {
        match self.sync_type {
            SyncType::Single | SyncType::Batch => self.target.issue_keys.len(),
            SyncType::Query => 0,
        }
    }
}

/// Lifecycle phase of a `SyncRequest`
#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq, JsonSchema)]
pub enum SyncPhase {
    Pending,
    Processing,
    Recovering,
    Completed,
    Failed,
}

impl fmt::Display for SyncPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let phase = match self {
            SyncPhase::Pending => "Pending",
            SyncPhase::Processing => "Processing",
            SyncPhase::Recovering => "Recovering",
            SyncPhase::Completed => "Completed",
            SyncPhase::Failed => "Failed",
        };
        f.write_str(phase)
    }
}

/// Progress counters for the current attempt
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SyncProgress {
    #[serde(default)]
    pub percentage: u32,
    #[serde(default)]
    pub total_issues: u32,
    #[serde(default)]
    pub processed_issues: u32,
    #[serde(default)]
    pub failed_issues: u32,
}

/// Most recent failure seen by the control loop
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct LastError {
    #[serde(rename = "type")]
    pub error_type: String,
    pub message: String,
    pub time: String,
}

/// Condition for the `SyncRequest`
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SyncCondition {
    /// Type of condition
    #[serde(rename = "type")]
    pub condition_type: String,

    /// Status of the condition (True, False, or Unknown)
    pub status: String,

    #[serde(default)]
    pub reason: Option<String>,

    #[serde(default)]
    pub message: Option<String>,

    /// Last time the condition transitioned (RFC3339 format)
    #[serde(default)]
    pub last_transition_time: Option<String>,
}

impl SyncCondition {
    #[must_use]
    pub fn new(condition_type: &str, status: bool, reason: &str, message: impl Into<String>) -> Self {
        Self {
            condition_type: condition_type.to_string(),
            status: if status { "True" } else { "False" }.to_string(),
            reason: Some(reason.to_string()),
            message: Some(message.into()),
            last_transition_time: None,
        }
    }

    #[must_use]
    pub fn is_true(&self) -> bool {
        self.status == "True"
    }
}

/// Status of the `SyncRequest`, owned by the control loop.
///
/// Optional fields serialize as `null` so that a merge patch clears them.
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SyncRequestStatus {
    #[serde(default)]
    pub phase: Option<SyncPhase>,

    #[serde(default)]
    pub progress: SyncProgress,

    #[serde(default)]
    pub conditions: Vec<SyncCondition>,

    #[serde(default)]
    pub last_error: Option<LastError>,

    /// Consecutive failed attempts in the current retry cycle
    #[serde(default)]
    pub retry_count: u32,

    /// Completion time of the last successful sync
    #[serde(default)]
    pub last_sync: Option<String>,

    /// Identifier of the work unit backing the current attempt
    #[serde(default)]
    pub job_id: Option<String>,

    /// When the pending retry becomes due (set only while a retry is scheduled)
    #[serde(default)]
    pub next_retry_time: Option<String>,

    /// Controller instance currently reconciling this resource
    #[serde(default)]
    pub claimed_by: Option<String>,

    #[serde(default)]
    pub claimed_at: Option<String>,

    #[serde(default)]
    pub start_time: Option<String>,

    #[serde(default)]
    pub completion_time: Option<String>,

    #[serde(default)]
    pub observed_generation: Option<i64>,
}

impl SyncRequestStatus {
    #[must_use]
    pub fn condition(&self, condition_type: &str) -> Option<&SyncCondition> {
        self.conditions
            .iter()
            .find(|c| c.condition_type == condition_type)
    }

    /// Insert or replace the condition of the same type. The transition time
    /// only moves when the status value actually changes.
    pub fn set_condition(&mut self, mut condition: SyncCondition, now: &str) {
        match self
            .conditions
            .iter_mut()
            .find(|c| c.condition_type == condition.condition_type)
        {
            Some(existing) => {
                condition.last_transition_time = if existing.status == condition.status {
                    existing
                        .last_transition_time
                        .clone()
                        .or_else(|| Some(now.to_string()))
                } else {
                    Some(now.to_string())
                };
                *existing = condition;
            }
            None => {
                condition.last_transition_time = Some(now.to_string());
                self.conditions.push(condition);
            }
        }
    }

    /// Terminal means no further reconciliation will change the phase
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        match self.phase {
            Some(SyncPhase::Completed) => true,
            Some(SyncPhase::Failed) => self.next_retry_time.is_none(),
            _ => false,
        }
    }
}
