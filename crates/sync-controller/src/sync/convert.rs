//! Converts transport-layer sync intents into `SyncRequest` resources.
//!
//! Validation here is deliberately stricter than the transport layer: every
//! field that ends up on a work-unit command line is checked against an
//! allow-list before a resource is produced.

use crate::clock::{parse_duration, Clock, InvalidDuration};
use crate::crds::syncrequest::{
    ANNOTATION_ASYNC, ANNOTATION_ISSUE_COUNT, ANNOTATION_SAFE_MODE, ANNOTATION_SOURCE,
};
use crate::crds::{
    Destination, Priority, RetryPolicy, SyncOptions, SyncRequest, SyncRequestSpec, SyncTarget,
    SyncType,
};
use crate::jobs::{JobError, JobNaming};
use kube::api::ObjectMeta;
use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

pub const MAX_BATCH_SIZE: usize = 100;
pub const MAX_CONCURRENCY: u32 = 10;
pub const MAX_PARALLELISM: u32 = 10;
pub const MAX_QUERY_LENGTH: usize = 1000;
const MIN_ISSUE_KEY_LENGTH: usize = 4;
const MAX_ISSUE_KEY_LENGTH: usize = 50;
const MAX_REPOSITORY_LENGTH: usize = 512;
const DEFAULT_SOURCE: &str = "api";

lazy_static! {
    static ref ISSUE_KEY_RE: Regex = Regex::new(r"^[A-Z][A-Z0-9]*-[1-9][0-9]*$").unwrap();
    static ref PROJECT_KEY_RE: Regex = Regex::new(r"^[A-Z][A-Z0-9_]{0,49}$").unwrap();
    static ref HTTPS_REPO_RE: Regex = Regex::new(
        r"^https://[A-Za-z0-9]([A-Za-z0-9.-]*[A-Za-z0-9])?(:[0-9]{1,5})?(/[A-Za-z0-9_~-][A-Za-z0-9._~-]*)+/?$"
    )
    .unwrap();
    static ref SCP_REPO_RE: Regex = Regex::new(
        r"^[A-Za-z0-9_-]+@[A-Za-z0-9]([A-Za-z0-9.-]*[A-Za-z0-9])?:[A-Za-z0-9_~-][A-Za-z0-9._~-]*(/[A-Za-z0-9_~-][A-Za-z0-9._~-]*)*$"
    )
    .unwrap();
    static ref SSH_URL_REPO_RE: Regex = Regex::new(
        r"^ssh://([A-Za-z0-9_-]+@)?[A-Za-z0-9]([A-Za-z0-9.-]*[A-Za-z0-9])?(:[0-9]{1,5})?(/[A-Za-z0-9_~-][A-Za-z0-9._~-]*)+$"
    )
    .unwrap();
}

const FORBIDDEN_SCHEMES: [&str; 4] = ["file://", "javascript:", "data:", "ftp://"];
const FORBIDDEN_QUERY_CHARS: [char; 5] = [';', '\\', '<', '>', '"'];

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConversionError {
    #[error("invalid issue key '{0}': expected PROJECT-123 with 4-50 characters")]
    InvalidIssueKey(String),

    #[error("invalid project key '{0}'")]
    InvalidProjectKey(String),

    #[error("invalid repository '{repository}': {reason}")]
    InvalidRepository { repository: String, reason: String },

    #[error("invalid query: {0}")]
    InvalidQuery(String),

    #[error("{0} sync requires a target")]
    MissingTarget(SyncType),

    #[error("batch of {count} issues exceeds the maximum of {max}")]
    TooManyIssues { count: usize, max: usize },

    #[error("{field} must be at most {max}, got {value}")]
    LimitExceeded {
        field: &'static str,
        value: u32,
        max: u32,
    },

    #[error("invalid option: {0}")]
    InvalidOption(String),

    #[error(transparent)]
    InvalidDuration(#[from] InvalidDuration),

    #[error("inconsistent sync request: {0}")]
    Inconsistent(String),
}

impl From<ConversionError> for JobError {
    fn from(err: ConversionError) -> Self {
        JobError::validation("", err.to_string())
    }
}

/// Options as they arrive from the transport layer
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IntentOptions {
    #[serde(default)]
    pub concurrency: Option<u32>,
    #[serde(default)]
    pub rate_limit: Option<f64>,
    #[serde(default)]
    pub incremental: bool,
    #[serde(default)]
    pub force: bool,
    #[serde(default)]
    pub dry_run: bool,
    #[serde(default)]
    pub include_links: bool,
}

/// A sync request as the transport layer hands it over
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncIntent {
    pub kind: SyncType,
    /// Single issue key
    #[serde(default)]
    pub target: Option<String>,
    /// Batch issue keys
    #[serde(default)]
    pub targets: Vec<String>,
    #[serde(default)]
    pub query: Option<String>,
    #[serde(default)]
    pub project_key: Option<String>,
    pub repository: String,
    #[serde(default)]
    pub branch: Option<String>,
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default)]
    pub priority: Option<Priority>,
    #[serde(default)]
    pub timeout: Option<String>,
    #[serde(default)]
    pub retry_policy: Option<RetryPolicy>,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    #[serde(default)]
    pub options: IntentOptions,
    #[serde(default)]
    pub safe_mode: bool,
    #[serde(default, rename = "async")]
    pub async_mode: bool,
    #[serde(default)]
    pub parallelism: Option<u32>,
    #[serde(default)]
    pub source: Option<String>,
    #[serde(default)]
    pub requires_api_server: Option<bool>,
}

impl SyncIntent {
    pub fn new(kind: SyncType, repository: impl Into<String>) -> Self {
        Self {
            kind,
            target: None,
            targets: Vec::new(),
            query: None,
            project_key: None,
            repository: repository.into(),
            branch: None,
            path: None,
            priority: None,
            timeout: None,
            retry_policy: None,
            labels: BTreeMap::new(),
            options: IntentOptions::default(),
            safe_mode: false,
            async_mode: false,
            parallelism: None,
            source: None,
            requires_api_server: None,
        }
    }
}

/// Output of a conversion: the resource spec plus request-only provenance
#[derive(Debug, Clone, PartialEq)]
pub struct ConvertedRequest {
    pub name: String,
    pub spec: SyncRequestSpec,
    pub annotations: BTreeMap<String, String>,
}

impl ConvertedRequest {
    /// Build the resource object ready to be created in `namespace`
    #[must_use]
    pub fn to_resource(&self, namespace: &str) -> SyncRequest {
        let mut resource = SyncRequest::new(&self.name, self.spec.clone());
        resource.metadata = ObjectMeta {
            name: Some(self.name.clone()),
            namespace: Some(namespace.to_string()),
            annotations: Some(self.annotations.clone()),
            ..Default::default()
        };
        resource
    }
}

/// Whether a resource carries the safe-mode provenance flag
#[must_use]
pub fn safe_mode_of(resource: &SyncRequest) -> bool {
    resource
        .metadata
        .annotations
        .as_ref()
        .and_then(|a| a.get(ANNOTATION_SAFE_MODE))
        .is_some_and(|v| v == "true")
}

pub struct SyncRequestConverter {
    clock: Arc<dyn Clock>,
    default_retry: RetryPolicy,
}

impl SyncRequestConverter {
    #[must_use]
    pub fn new(clock: Arc<dyn Clock>, default_retry: RetryPolicy) -> Self {
        Self {
            clock,
            default_retry,
        }
    }

    pub fn convert(&self, intent: &SyncIntent) -> Result<ConvertedRequest, ConversionError> {
        validate_repository(&intent.repository)?;
        let target = build_target(intent)?;

        if let Some(concurrency) = intent.options.concurrency {
            check_limit("concurrency", concurrency, MAX_CONCURRENCY)?;
        }
        if let Some(parallelism) = intent.parallelism {
            check_limit("parallelism", parallelism, MAX_PARALLELISM)?;
        }
        if let Some(rate) = intent.options.rate_limit {
            if !rate.is_finite() || rate < 0.0 {
                return Err(ConversionError::InvalidOption(format!(
                    "rateLimit must be a non-negative number, got {rate}"
                )));
            }
        }
        if intent.options.incremental && intent.options.force {
            return Err(ConversionError::InvalidOption(
                "incremental and force are mutually exclusive".to_string(),
            ));
        }

        let timeout = intent
            .timeout
            .clone()
            .unwrap_or_else(|| "1800s".to_string());
        parse_duration(&timeout)?;

        let retry_policy = intent
            .retry_policy
            .clone()
            .unwrap_or_else(|| self.default_retry.clone());
        validate_retry_policy(&retry_policy)?;

        let issue_count = target.issue_keys.len();
        let spec = SyncRequestSpec {
            sync_type: intent.kind,
            target,
            destination: Destination {
                repository: intent.repository.trim().to_string(),
                branch: intent
                    .branch
                    .clone()
                    .filter(|b| !b.trim().is_empty())
                    .unwrap_or_else(|| "main".to_string()),
                path: intent
                    .path
                    .clone()
                    .filter(|p| !p.trim().is_empty())
                    .unwrap_or_else(|| "/".to_string()),
            },
            priority: intent.priority.unwrap_or_default(),
            timeout,
            retry_policy,
            labels: intent.labels.clone(),
            options: SyncOptions {
                concurrency: intent.options.concurrency,
                rate_limit: intent.options.rate_limit,
                parallelism: intent.parallelism,
                incremental: intent.options.incremental,
                force: intent.options.force,
                dry_run: intent.options.dry_run,
                include_links: intent.options.include_links,
            },
            requires_api_server: intent.requires_api_server.unwrap_or(true),
        };

        validate_conversion(&spec)?;

        let annotations = BTreeMap::from([
            (ANNOTATION_SAFE_MODE.to_string(), intent.safe_mode.to_string()),
            (ANNOTATION_ASYNC.to_string(), intent.async_mode.to_string()),
            (
                ANNOTATION_SOURCE.to_string(),
                intent
                    .source
                    .clone()
                    .unwrap_or_else(|| DEFAULT_SOURCE.to_string()),
            ),
            (ANNOTATION_ISSUE_COUNT.to_string(), issue_count.to_string()),
        ]);

        let name = JobNaming::generate(&format!("sync-{}", intent.kind), self.clock.now());
        debug!(name = %name, sync_type = %intent.kind, "Converted sync intent");

        Ok(ConvertedRequest {
            name,
            spec,
            annotations,
        })
    }
}

/// Final consistency check on a spec, independent of field-level validation.
/// The control loop runs it again before submitting work.
pub fn validate_conversion(spec: &SyncRequestSpec) -> Result<(), ConversionError> {
    validate_repository(&spec.destination.repository)?;

    let target = &spec.target;
    match spec.sync_type {
        SyncType::Single => {
            if target.issue_keys.len() != 1 {
                return Err(ConversionError::Inconsistent(format!(
                    "single sync needs exactly one issue key, found {}",
                    target.issue_keys.len()
                )));
            }
        }
        SyncType::Batch => {
            if target.issue_keys.is_empty() {
                return Err(ConversionError::MissingTarget(SyncType::Batch));
            }
            if target.issue_keys.len() > MAX_BATCH_SIZE {
                return Err(ConversionError::TooManyIssues {
                    count: target.issue_keys.len(),
                    max: MAX_BATCH_SIZE,
                });
            }
        }
        SyncType::Query => {
            let has_query = target.jql_query.as_deref().is_some_and(|q| !q.trim().is_empty());
            let has_project = target.project_key.as_deref().is_some_and(|p| !p.trim().is_empty());
            if !has_query && !has_project {
                return Err(ConversionError::MissingTarget(SyncType::Query));
            }
            if !target.issue_keys.is_empty() {
                return Err(ConversionError::Inconsistent(
                    "query sync cannot also list issue keys".to_string(),
                ));
            }
        }
    }

    for key in &target.issue_keys {
        validate_issue_key(key)?;
    }
    if let Some(query) = &target.jql_query {
        validate_query(query)?;
    }
    if let Some(project) = &target.project_key {
        if !PROJECT_KEY_RE.is_match(project) {
            return Err(ConversionError::InvalidProjectKey(project.clone()));
        }
    }
    if let Some(concurrency) = spec.options.concurrency {
        check_limit("concurrency", concurrency, MAX_CONCURRENCY)?;
    }
    if let Some(parallelism) = spec.options.parallelism {
        check_limit("parallelism", parallelism, MAX_PARALLELISM)?;
    }
    parse_duration(&spec.timeout)?;
    validate_retry_policy(&spec.retry_policy)?;
    Ok(())
}

pub fn validate_issue_key(key: &str) -> Result<(), ConversionError> {
    let len = key.len();
    if !(MIN_ISSUE_KEY_LENGTH..=MAX_ISSUE_KEY_LENGTH).contains(&len) || !ISSUE_KEY_RE.is_match(key) {
        return Err(ConversionError::InvalidIssueKey(key.to_string()));
    }
    Ok(())
}

pub fn validate_repository(repository: &str) -> Result<(), ConversionError> {
    let invalid = |reason: &str| ConversionError::InvalidRepository {
        repository: repository.to_string(),
        reason: reason.to_string(),
    };

    let trimmed = repository.trim();
    if trimmed.is_empty() {
        return Err(invalid("repository is required"));
    }
    if trimmed.len() > MAX_REPOSITORY_LENGTH {
        return Err(invalid("repository URL is too long"));
    }

    let lowered = trimmed.to_ascii_lowercase();
    if let Some(scheme) = FORBIDDEN_SCHEMES.iter().find(|s| lowered.starts_with(*s)) {
        return Err(invalid(&format!("scheme '{scheme}' is not allowed")));
    }
    if trimmed.contains("..") {
        return Err(invalid("path traversal is not allowed"));
    }

    if HTTPS_REPO_RE.is_match(trimmed)
        || SCP_REPO_RE.is_match(trimmed)
        || SSH_URL_REPO_RE.is_match(trimmed)
    {
        Ok(())
    } else {
        Err(invalid("must be an HTTPS or SSH Git URL"))
    }
}

pub fn validate_query(query: &str) -> Result<(), ConversionError> {
    let len = query.chars().count();
    if len == 0 || query.trim().is_empty() {
        return Err(ConversionError::InvalidQuery("query cannot be empty".to_string()));
    }
    if len > MAX_QUERY_LENGTH {
        return Err(ConversionError::InvalidQuery(format!(
            "query is {len} characters, maximum is {MAX_QUERY_LENGTH}"
        )));
    }
    if let Some(ch) = query
        .chars()
        .find(|c| FORBIDDEN_QUERY_CHARS.contains(c) || c.is_control())
    {
        return Err(ConversionError::InvalidQuery(format!(
            "character {ch:?} is not allowed"
        )));
    }
    Ok(())
}

fn validate_retry_policy(policy: &RetryPolicy) -> Result<(), ConversionError> {
    if !policy.backoff_multiplier.is_finite() || policy.backoff_multiplier < 1.0 {
        return Err(ConversionError::InvalidOption(format!(
            "backoffMultiplier must be at least 1.0, got {}",
            policy.backoff_multiplier
        )));
    }
    parse_duration(&policy.initial_delay)?;
    Ok(())
}

fn check_limit(field: &'static str, value: u32, max: u32) -> Result<(), ConversionError> {
    if value > max {
        return Err(ConversionError::LimitExceeded { field, value, max });
    }
    Ok(())
}

fn build_target(intent: &SyncIntent) -> Result<SyncTarget, ConversionError> {
    match intent.kind {
        SyncType::Single => {
            let key = intent
                .target
                .as_deref()
                .filter(|k| !k.trim().is_empty())
                .ok_or(ConversionError::MissingTarget(SyncType::Single))?;
            validate_issue_key(key)?;
            Ok(SyncTarget {
                issue_keys: vec![key.to_string()],
                ..Default::default()
            })
        }
        SyncType::Batch => {
            if intent.targets.is_empty() {
                return Err(ConversionError::MissingTarget(SyncType::Batch));
            }
            if intent.targets.len() > MAX_BATCH_SIZE {
                return Err(ConversionError::TooManyIssues {
                    count: intent.targets.len(),
                    max: MAX_BATCH_SIZE,
                });
            }
            let keys = intent
                .targets
                .iter()
                .map(|k| validate_issue_key(k).map(|()| k.clone()))
                .collect::<Result<Vec<_>, _>>()?;
            Ok(SyncTarget {
                issue_keys: keys,
                ..Default::default()
            })
        }
        SyncType::Query => {
            let query = intent.query.as_deref().filter(|q| !q.trim().is_empty());
            let project = intent.project_key.as_deref().filter(|p| !p.trim().is_empty());
            if query.is_none() && project.is_none() {
                return Err(ConversionError::MissingTarget(SyncType::Query));
            }
            if let Some(query) = query {
                validate_query(query)?;
            }
            if let Some(project) = project {
                if !PROJECT_KEY_RE.is_match(project) {
                    return Err(ConversionError::InvalidProjectKey(project.to_string()));
                }
            }
            Ok(SyncTarget {
                issue_keys: Vec::new(),
                jql_query: query.map(str::to_string),
                project_key: project.map(str::to_string),
            })
        }
    }
}
