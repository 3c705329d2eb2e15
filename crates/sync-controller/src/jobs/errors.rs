//! Failure taxonomy for work units.
//!
//! Every failure carries the job it belongs to, a message, the time it was
//! observed and a [`JobErrorKind`]. Retry decisions are made from the kind
//! alone, so the scheduler never retries internally.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Closed set of failure categories
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobErrorKind {
    Validation,
    Authentication,
    Connection,
    #[serde(rename = "cluster_api")]
    ClusterApi,
    Timeout,
    /// Quota or capacity exhaustion
    Resource,
    Template,
    /// Non-zero exit from the work unit
    Execution,
    Internal,
}

/// How urgently a failure needs attention
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Medium,
    High,
    Critical,
}

impl JobErrorKind {
    #[must_use]
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            JobErrorKind::Connection
                | JobErrorKind::Timeout
                | JobErrorKind::Resource
                | JobErrorKind::ClusterApi
        )
    }

    #[must_use]
    pub fn severity(self) -> Severity {
        match self {
            JobErrorKind::Validation
            | JobErrorKind::Authentication
            | JobErrorKind::Template
            | JobErrorKind::Internal => Severity::Critical,
            JobErrorKind::Timeout | JobErrorKind::Resource | JobErrorKind::Execution => {
                Severity::High
            }
            JobErrorKind::Connection | JobErrorKind::ClusterApi => Severity::Medium,
        }
    }

    /// Static remediation hints shown alongside the error
    #[must_use]
    pub fn suggestions(self) -> &'static [&'static str] {
        match self {
            JobErrorKind::Validation => &[
                "Check the request fields against the documented formats",
                "Issue keys look like PROJ-123; repositories must be HTTPS or SSH URLs",
            ],
            JobErrorKind::Authentication => &[
                "Verify the issue-tracker and Git credential secrets exist and are current",
                "Check the controller service account permissions",
            ],
            JobErrorKind::Connection => &[
                "Check network connectivity to the cluster API",
                "The request will be retried automatically",
            ],
            JobErrorKind::ClusterApi => &[
                "Check the cluster API server health",
                "The request will be retried automatically",
            ],
            JobErrorKind::Timeout => &[
                "Increase the request timeout",
                "Split large batches into smaller requests",
            ],
            JobErrorKind::Resource => &[
                "Check namespace resource quotas",
                "Lower parallelism or resource requests",
            ],
            JobErrorKind::Template => &[
                "Check the job template configuration",
                "Contact an operator; this failure is not retried",
            ],
            JobErrorKind::Execution => &[
                "Inspect the work unit logs",
                "Verify the target issues and repository are reachable from the cluster",
            ],
            JobErrorKind::Internal => &[
                "Contact an operator; this failure is not retried",
            ],
        }
    }
}

impl fmt::Display for JobErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self {
            JobErrorKind::Validation => "validation",
            JobErrorKind::Authentication => "authentication",
            JobErrorKind::Connection => "connection",
            JobErrorKind::ClusterApi => "cluster_api",
            JobErrorKind::Timeout => "timeout",
            JobErrorKind::Resource => "resource",
            JobErrorKind::Template => "template",
            JobErrorKind::Execution => "execution",
            JobErrorKind::Internal => "internal",
        };
        f.write_str(kind)
    }
}

/// A typed work-unit failure
#[derive(Error, Debug, Clone, PartialEq)]
#[error("{kind} error for job '{job_id}': {message}")]
pub struct JobError {
    pub kind: JobErrorKind,
    pub job_id: String,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

/// Stable user/log facing rendering of a [`JobError`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorSummary {
    pub kind: JobErrorKind,
    pub severity: Severity,
    pub message: String,
    pub retryable: bool,
    pub suggestions: Vec<String>,
}

/// Result alias for scheduler and orchestrator operations
pub type JobResult<T> = Result<T, JobError>;

impl JobError {
    pub fn new(kind: JobErrorKind, job_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind,
            job_id: job_id.into(),
            message: message.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn validation(job_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(JobErrorKind::Validation, job_id, message)
    }

    pub fn template(job_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(JobErrorKind::Template, job_id, message)
    }

    pub fn execution(job_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(JobErrorKind::Execution, job_id, message)
    }

    pub fn timeout(job_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(JobErrorKind::Timeout, job_id, message)
    }

    pub fn internal(job_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(JobErrorKind::Internal, job_id, message)
    }

    /// The caller named a work unit that does not exist; not retryable
    pub fn not_found(job_id: impl Into<String>) -> Self {
        let job_id = job_id.into();
        let message = format!("work unit '{job_id}' not found");
        Self::new(JobErrorKind::Validation, job_id, message)
    }

    #[must_use]
    pub fn at(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    #[must_use]
    pub fn is_retryable(&self) -> bool {
        self.kind.is_retryable()
    }

    #[must_use]
    pub fn severity(&self) -> Severity {
        self.kind.severity()
    }

    #[must_use]
    pub fn summary(&self) -> ErrorSummary {
        ErrorSummary {
            kind: self.kind,
            severity: self.severity(),
            message: self.message.clone(),
            retryable: self.is_retryable(),
            suggestions: self
                .kind
                .suggestions()
                .iter()
                .map(|s| (*s).to_string())
                .collect(),
        }
    }

    /// Classify a cluster API failure. Only the API server's message is kept,
    /// never object UIDs or request internals.
    pub fn from_kube(job_id: impl Into<String>, err: &kube::Error) -> Self {
        let job_id = job_id.into();
        match err {
            kube::Error::Api(response) => {
                let kind = classify_status(response.code, &response.reason, &response.message);
                Self::new(kind, job_id, response.message.clone())
            }
            kube::Error::HyperError(e) => {
                Self::new(JobErrorKind::Connection, job_id, format!("connection failed: {e}"))
            }
            kube::Error::Service(e) => {
                let message = e.to_string();
                let kind = if message.to_lowercase().contains("timed out") {
                    JobErrorKind::Timeout
                } else {
                    JobErrorKind::Connection
                };
                Self::new(kind, job_id, message)
            }
            kube::Error::Auth(e) => Self::new(JobErrorKind::Authentication, job_id, e.to_string()),
            kube::Error::SerdeError(e) => {
                Self::new(JobErrorKind::Internal, job_id, format!("malformed response: {e}"))
            }
            other => Self::new(JobErrorKind::ClusterApi, job_id, other.to_string()),
        }
    }
}

fn classify_status(code: u16, reason: &str, message: &str) -> JobErrorKind {
    let lowered = message.to_lowercase();
    match code {
        400 | 422 => JobErrorKind::Validation,
        401 => JobErrorKind::Authentication,
        403 if lowered.contains("exceeded quota") || lowered.contains("forbidden: quota") => {
            JobErrorKind::Resource
        }
        403 => JobErrorKind::Authentication,
        408 | 504 => JobErrorKind::Timeout,
        429 => JobErrorKind::Resource,
        _ if reason == "Timeout" => JobErrorKind::Timeout,
        _ => JobErrorKind::ClusterApi,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use kube::core::ErrorResponse;

    fn api_error(code: u16, reason: &str, message: &str) -> kube::Error {
        kube::Error::Api(ErrorResponse {
            status: "Failure".to_string(),
            message: message.to_string(),
            reason: reason.to_string(),
            code,
        })
    }

    #[test]
    fn test_retryable_kinds() {
        let retryable = [
            JobErrorKind::Connection,
            JobErrorKind::Timeout,
            JobErrorKind::Resource,
            JobErrorKind::ClusterApi,
        ];
        let terminal = [
            JobErrorKind::Validation,
            JobErrorKind::Authentication,
            JobErrorKind::Template,
            JobErrorKind::Execution,
            JobErrorKind::Internal,
        ];
        for kind in retryable {
            assert!(kind.is_retryable(), "{kind} should be retryable");
        }
        for kind in terminal {
            assert!(!kind.is_retryable(), "{kind} should not be retryable");
        }
    }

    #[test]
    fn test_severity_table() {
        assert_eq!(JobErrorKind::Validation.severity(), Severity::Critical);
        assert_eq!(JobErrorKind::Authentication.severity(), Severity::Critical);
        assert_eq!(JobErrorKind::Template.severity(), Severity::Critical);
        assert_eq!(JobErrorKind::Internal.severity(), Severity::Critical);
        assert_eq!(JobErrorKind::Timeout.severity(), Severity::High);
        assert_eq!(JobErrorKind::Resource.severity(), Severity::High);
        assert_eq!(JobErrorKind::Execution.severity(), Severity::High);
        assert_eq!(JobErrorKind::Connection.severity(), Severity::Medium);
        assert_eq!(JobErrorKind::ClusterApi.severity(), Severity::Medium);
    }

    #[test]
    fn test_summary_is_stable() {
        let err = JobError::timeout("sync-20250101-000000-abcd1234", "deadline exceeded");
        let summary = err.summary();
        assert_eq!(summary.kind, JobErrorKind::Timeout);
        assert_eq!(summary.severity, Severity::High);
        assert!(summary.retryable);
        assert_eq!(summary.message, "deadline exceeded");
        assert!(!summary.suggestions.is_empty());
        assert_eq!(summary, err.summary());

        let json = serde_json::to_value(&summary).unwrap();
        assert_eq!(json["kind"], "timeout");
        assert_eq!(json["severity"], "high");
    }

    #[test]
    fn test_every_kind_has_suggestions() {
        for kind in [
            JobErrorKind::Validation,
            JobErrorKind::Authentication,
            JobErrorKind::Connection,
            JobErrorKind::ClusterApi,
            JobErrorKind::Timeout,
            JobErrorKind::Resource,
            JobErrorKind::Template,
            JobErrorKind::Execution,
            JobErrorKind::Internal,
        ] {
            assert!(!kind.suggestions().is_empty());
        }
    }

    #[test]
    fn test_kube_error_classification() {
        let cases = [
            (api_error(422, "Invalid", "spec.template: Invalid value"), JobErrorKind::Validation),
            (api_error(401, "Unauthorized", "Unauthorized"), JobErrorKind::Authentication),
            (api_error(403, "Forbidden", "jobs is forbidden: User cannot create"), JobErrorKind::Authentication),
            (
                api_error(403, "Forbidden", "pods \"x\" is forbidden: exceeded quota: compute"),
                JobErrorKind::Resource,
            ),
            (api_error(429, "TooManyRequests", "slow down"), JobErrorKind::Resource),
            (api_error(504, "Timeout", "gateway timeout"), JobErrorKind::Timeout),
            (api_error(409, "Conflict", "object was modified"), JobErrorKind::ClusterApi),
            (api_error(500, "InternalError", "etcd unavailable"), JobErrorKind::ClusterApi),
        ];
        for (err, expected) in cases {
            let classified = JobError::from_kube("job-1", &err);
            assert_eq!(classified.kind, expected, "{err}");
            assert_eq!(classified.job_id, "job-1");
        }
    }

    #[test]
    fn test_missing_work_unit_is_not_retried() {
        let at = Utc.with_ymd_and_hms(2025, 3, 14, 9, 26, 53).unwrap();
        let err = JobError::not_found("sync-batch-404").at(at);
        assert_eq!(err.kind, JobErrorKind::Validation);
        assert!(!err.is_retryable());
        assert_eq!(err.timestamp, at);
        let summary = err.summary();
        assert!(!summary.retryable);
        assert!(!summary
            .suggestions
            .iter()
            .any(|s| s.contains("retried automatically")));
    }

    #[test]
    fn test_display_includes_kind_and_job() {
        let err = JobError::validation("job-abc", "repository is required");
        assert_eq!(
            err.to_string(),
            "validation error for job 'job-abc': repository is required"
        );
    }
}
