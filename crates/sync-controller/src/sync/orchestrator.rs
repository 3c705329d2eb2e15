//! Maps sync intents onto work units.
//!
//! Requests are validated before anything reaches the scheduler. The same
//! requests can also run in-process through [`SyncPipeline`] when no cluster
//! is available.

use super::convert::safe_mode_of;
use super::pipeline::{IncrementalOptions, SyncOutcome, SyncPipeline};
use crate::clock::parse_duration;
use crate::crds::SyncRequest;
use crate::jobs::types::{LABEL_PRIORITY, LABEL_SYNC_REQUEST};
use crate::jobs::{JobConfig, JobError, JobKind, JobNaming, JobReport, JobResult, JobScheduler};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::{Resource, ResourceExt};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, instrument, warn};

const MAX_REQUEST_CONCURRENCY: u32 = 10;
const MAX_K8S_NAME_LENGTH: usize = 63;
const NAME_HASH_LENGTH: usize = 8;

/// Options shared by every request shape
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncRequestOptions {
    #[serde(default)]
    pub branch: Option<String>,
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default)]
    pub concurrency: Option<u32>,
    #[serde(default)]
    pub rate_limit: Option<f64>,
    #[serde(default)]
    pub parallelism: Option<u32>,
    #[serde(default)]
    pub timeout_seconds: Option<i64>,
    #[serde(default)]
    pub incremental: bool,
    #[serde(default)]
    pub force: bool,
    #[serde(default)]
    pub dry_run: bool,
    #[serde(default)]
    pub include_links: bool,
    #[serde(default)]
    pub safe_mode: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SingleIssueSyncRequest {
    pub issue_key: String,
    pub repository: String,
    #[serde(default)]
    pub options: SyncRequestOptions,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchSyncRequest {
    pub issue_keys: Vec<String>,
    pub repository: String,
    #[serde(default)]
    pub options: SyncRequestOptions,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JqlSyncRequest {
    pub jql: String,
    pub repository: String,
    #[serde(default)]
    pub options: SyncRequestOptions,
}

/// Any of the three request shapes
#[derive(Debug, Clone, PartialEq)]
pub enum SyncJobRequest {
    Single(SingleIssueSyncRequest),
    Batch(BatchSyncRequest),
    Jql(JqlSyncRequest),
}

impl SyncJobRequest {
    #[must_use]
    pub fn kind(&self) -> JobKind {
        match self {
            SyncJobRequest::Single(_) => JobKind::Single,
            SyncJobRequest::Batch(_) => JobKind::Batch,
            SyncJobRequest::Jql(_) => JobKind::Query,
        }
    }

    #[must_use]
    pub fn options(&self) -> &SyncRequestOptions {
        match self {
            SyncJobRequest::Single(r) => &r.options,
            SyncJobRequest::Batch(r) => &r.options,
            SyncJobRequest::Jql(r) => &r.options,
        }
    }

    #[must_use]
    pub fn repository(&self) -> &str {
        match self {
            SyncJobRequest::Single(r) => &r.repository,
            SyncJobRequest::Batch(r) => &r.repository,
            SyncJobRequest::Jql(r) => &r.repository,
        }
    }

    /// Kind-specific invariants, checked before the scheduler is involved
    pub fn validate(&self) -> JobResult<()> {
        let options = self.options();
        match self {
            SyncJobRequest::Single(r) if r.issue_key.trim().is_empty() => {
                return Err(JobError::validation("", "issue key is required"));
            }
            SyncJobRequest::Batch(r) if r.issue_keys.iter().all(|k| k.trim().is_empty()) => {
                return Err(JobError::validation("", "at least one issue key is required"));
            }
            SyncJobRequest::Jql(r) if r.jql.trim().is_empty() => {
                return Err(JobError::validation("", "JQL query is required"));
            }
            _ => {}
        }

        if self.repository().trim().is_empty() {
            return Err(JobError::validation("", "repository is required"));
        }
        if options.incremental && options.force {
            return Err(JobError::validation(
                "",
                "incremental and force cannot be used together",
            ));
        }
        if matches!(self, SyncJobRequest::Batch(_) | SyncJobRequest::Jql(_)) {
            if let Some(concurrency) = options.concurrency {
                if concurrency > MAX_REQUEST_CONCURRENCY {
                    return Err(JobError::validation(
                        "",
                        format!("concurrency must be between 0 and {MAX_REQUEST_CONCURRENCY}, got {concurrency}"),
                    ));
                }
            }
        }
        Ok(())
    }

    fn issue_keys(&self) -> Vec<String> {
        match self {
            SyncJobRequest::Single(r) => vec![r.issue_key.trim().to_string()],
            SyncJobRequest::Batch(r) => r
                .issue_keys
                .iter()
                .map(|k| k.trim())
                .filter(|k| !k.is_empty())
                .map(str::to_string)
                .collect(),
            SyncJobRequest::Jql(_) => Vec::new(),
        }
    }

    fn to_job_config(&self, job_id: String) -> JobConfig {
        let options = self.options();
        let mut config = JobConfig::new(job_id, self.kind(), self.repository().trim());
        config.issue_keys = self.issue_keys();
        if let SyncJobRequest::Jql(r) = self {
            config.jql = Some(r.jql.trim().to_string());
        }
        config.branch.clone_from(&options.branch);
        config.path.clone_from(&options.path);
        config.concurrency = options.concurrency;
        config.rate_limit = options.rate_limit;
        config.parallelism = options.parallelism.and_then(|p| i32::try_from(p).ok());
        config.timeout_seconds = options.timeout_seconds;
        config.incremental = options.incremental;
        config.force = options.force;
        config.dry_run = options.dry_run;
        config.include_links = options.include_links;
        config.safe_mode = options.safe_mode;
        config
    }
}

/// Work-unit id for one attempt of a resource. Stable across restarts so a
/// crashed reconciler finds the unit it already created.
///
/// Name normalization is lossy (`team.sync` and `team-sync` format alike,
/// long names are truncated), so a hash of the full resource name keeps ids
/// of different resources apart.
#[must_use]
pub fn attempt_job_id(resource_name: &str, attempt: u32) -> String {
    use sha1::{Digest, Sha1};

    let mut hasher = Sha1::new();
    hasher.update(resource_name.as_bytes());
    let digest = hex::encode(hasher.finalize());

    let suffix = format!("-{}-a{attempt}", &digest[..NAME_HASH_LENGTH]);
    let mut base = JobNaming::format_name(resource_name);
    base.truncate(MAX_K8S_NAME_LENGTH - suffix.len());
    let base = base.trim_end_matches('-');
    format!("{base}{suffix}")
}

/// Controller reference from a `SyncRequest` to the work units it creates
#[must_use]
pub fn owner_reference(resource: &SyncRequest) -> OwnerReference {
    OwnerReference {
        api_version: SyncRequest::api_version(&()).to_string(),
        kind: SyncRequest::kind(&()).to_string(),
        name: resource.name_any(),
        uid: resource.metadata.uid.clone().unwrap_or_default(),
        controller: Some(true),
        block_owner_deletion: Some(true),
    }
}

/// Whether an existing work unit was created for this resource
#[must_use]
pub fn is_owned_by(report: &JobReport, resource: &SyncRequest) -> bool {
    let Some(owner) = &report.owner else {
        return false;
    };
    let same_uid = match resource.metadata.uid.as_deref() {
        Some(uid) => owner.uid == uid,
        None => true,
    };
    owner.kind == SyncRequest::kind(&()) && owner.name == resource.name_any() && same_uid
}

pub struct SyncJobOrchestrator {
    scheduler: Arc<JobScheduler>,
    pipeline: Option<Arc<dyn SyncPipeline>>,
}

impl SyncJobOrchestrator {
    #[must_use]
    pub fn new(scheduler: Arc<JobScheduler>) -> Self {
        Self {
            scheduler,
            pipeline: None,
        }
    }

    /// Enable the in-process fallback
    #[must_use]
    pub fn with_pipeline(mut self, pipeline: Arc<dyn SyncPipeline>) -> Self {
        self.pipeline = Some(pipeline);
        self
    }

    #[must_use]
    pub fn scheduler(&self) -> &Arc<JobScheduler> {
        &self.scheduler
    }

    pub async fn submit_single(&self, request: SingleIssueSyncRequest) -> JobResult<JobReport> {
        self.submit(&SyncJobRequest::Single(request)).await
    }

    pub async fn submit_batch(&self, request: BatchSyncRequest) -> JobResult<JobReport> {
        self.submit(&SyncJobRequest::Batch(request)).await
    }

    pub async fn submit_jql(&self, request: JqlSyncRequest) -> JobResult<JobReport> {
        self.submit(&SyncJobRequest::Jql(request)).await
    }

    /// Validate, assign a fresh id and hand the request to the scheduler
    #[instrument(skip(self, request), fields(kind = %request.kind()))]
    pub async fn submit(&self, request: &SyncJobRequest) -> JobResult<JobReport> {
        request
            .validate()
            .map_err(|e| e.at(self.scheduler.clock().now()))?;
        let prefix = format!("sync-{}", request.kind());
        let job_id = JobNaming::generate(&prefix, self.scheduler.clock().now());
        let config = request.to_job_config(job_id);
        let report = self.scheduler.create_job(&config).await?;
        info!(job_id = %report.job_id, "Submitted sync work unit");
        Ok(report)
    }

    /// Submit the work unit for one attempt of a `SyncRequest`
    #[instrument(skip(self, resource), fields(name = %resource.name_any()))]
    pub async fn submit_resource(&self, resource: &SyncRequest, attempt: u32) -> JobResult<JobReport> {
        let name = resource.name_any();
        let spec = &resource.spec;
        let job_id = attempt_job_id(&name, attempt);

        let timeout = parse_duration(&spec.timeout).map_err(|e| {
            JobError::validation(job_id.as_str(), e.to_string()).at(self.scheduler.clock().now())
        })?;

        let mut config = JobConfig::new(job_id.as_str(), spec.sync_type.into(), spec.destination.repository.as_str());
        config.issue_keys.clone_from(&spec.target.issue_keys);
        config.jql = spec.target.jql_query.clone().or_else(|| {
            spec.target
                .project_key
                .as_ref()
                .map(|key| format!("project = {key}"))
        });
        config.branch = Some(spec.destination.branch.clone());
        config.path = Some(spec.destination.path.clone());
        config.concurrency = spec.options.concurrency;
        config.rate_limit = spec.options.rate_limit;
        config.parallelism = spec.options.parallelism.and_then(|p| i32::try_from(p).ok());
        config.timeout_seconds = i64::try_from(timeout.as_secs()).ok();
        config.incremental = spec.options.incremental;
        config.force = spec.options.force;
        config.dry_run = spec.options.dry_run;
        config.include_links = spec.options.include_links;
        config.safe_mode = safe_mode_of(resource);
        config.labels.clone_from(&spec.labels);
        config
            .labels
            .insert(LABEL_SYNC_REQUEST.to_string(), JobNaming::format_name(&name));
        config
            .labels
            .insert(LABEL_PRIORITY.to_string(), spec.priority.to_string());
        config.owner = Some(owner_reference(resource));

        self.scheduler.create_job(&config).await
    }

    /// Run a request in-process, bounded by `timeout`
    #[instrument(skip(self, request), fields(kind = %request.kind()))]
    pub async fn execute_local_sync(
        &self,
        request: &SyncJobRequest,
        timeout: Duration,
    ) -> JobResult<SyncOutcome> {
        let now = self.scheduler.clock().now();
        request.validate().map_err(|e| e.at(now))?;
        let pipeline = self
            .pipeline
            .as_ref()
            .ok_or_else(|| JobError::internal("", "no local sync pipeline configured").at(now))?;

        let options = request.options();
        let repository = request.repository().trim().to_string();
        let incremental = options.incremental || options.force || options.dry_run;
        let engine_options = IncrementalOptions {
            force: options.force,
            dry_run: options.dry_run,
            include_new: true,
            include_modified: true,
        };

        let run = async {
            match (request, incremental) {
                (SyncJobRequest::Jql(r), true) => {
                    pipeline
                        .sync_jql_incremental(r.jql.trim().to_string(), repository, engine_options)
                        .await
                }
                (SyncJobRequest::Jql(r), false) => {
                    pipeline.sync_jql(r.jql.trim().to_string(), repository).await
                }
                (_, true) => {
                    pipeline
                        .sync_issues_incremental(request.issue_keys(), repository, engine_options)
                        .await
                }
                (_, false) => pipeline.sync_issues(request.issue_keys(), repository).await,
            }
        };

        match tokio::time::timeout(timeout, run).await {
            Ok(Ok(outcome)) => {
                info!(
                    processed = outcome.processed_issues,
                    failed = outcome.failed_issues,
                    "Local sync finished"
                );
                Ok(outcome)
            }
            Ok(Err(e)) => Err(JobError::execution("", format!("local sync failed: {e:#}"))
                .at(self.scheduler.clock().now())),
            Err(_) => {
                warn!(timeout_ms = timeout.as_millis(), "Local sync timed out");
                Err(JobError::timeout(
                    "",
                    format!("local sync exceeded {}ms", timeout.as_millis()),
                )
                .at(self.scheduler.clock().now()))
            }
        }
    }
}
