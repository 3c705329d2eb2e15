//! Work-unit scheduler: renders templates into Jobs and reports their state.
//!
//! The scheduler keeps no state of its own. Every query reads the cluster
//! through [`JobBackend`], so any number of controller instances can share it.

use super::backend::JobBackend;
use super::errors::{JobError, JobErrorKind, JobResult};
use super::naming::JobNaming;
use super::templates::{JobTemplate, TemplateCatalog, WORKER_CONTAINER_NAME};
use super::types::{
    JobConfig, JobFilter, JobKind, JobMonitor, JobReport, JobStatus, QueueStatus,
    ANNOTATION_FAILED_ISSUES, ANNOTATION_FILES, ANNOTATION_PROCESSED_ISSUES,
    ANNOTATION_SUCCEEDED_ISSUES, ANNOTATION_TOTAL_ISSUES, LABEL_JOB_ID, LABEL_JOB_KIND,
    LABEL_MANAGED_BY, MANAGED_BY_VALUE,
};
use crate::clock::Clock;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use k8s_openapi::api::batch::v1::Job;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

const WATCH_BUFFER: usize = 16;

/// Cluster-wide settings applied to every rendered work unit
#[derive(Debug, Clone, PartialEq)]
pub struct SchedulerSettings {
    pub image: String,
    pub image_pull_policy: Option<String>,
    pub image_pull_secrets: Vec<String>,
    pub service_account_name: Option<String>,
    /// Secrets mounted into the worker as environment (`envFrom`)
    pub secret_env_from: Vec<String>,
    pub ttl_seconds_after_finished: Option<i32>,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            image: "ghcr.io/5dlabs/issue-sync:latest".to_string(),
            image_pull_policy: None,
            image_pull_secrets: Vec::new(),
            service_account_name: None,
            secret_env_from: Vec::new(),
            ttl_seconds_after_finished: Some(3600),
        }
    }
}

/// Live view of one work unit. Dropping it (or calling [`JobWatch::stop`])
/// ends the relay task.
pub struct JobWatch {
    receiver: mpsc::Receiver<JobMonitor>,
    cancel: CancellationToken,
}

impl JobWatch {
    /// Next observed state; `None` once the work unit is terminal or the
    /// watch was stopped
    pub async fn recv(&mut self) -> Option<JobMonitor> {
        self.receiver.recv().await
    }

    pub fn stop(&self) {
        self.cancel.cancel();
    }
}

impl Drop for JobWatch {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

pub struct JobScheduler {
    backend: Arc<dyn JobBackend>,
    catalog: TemplateCatalog,
    clock: Arc<dyn Clock>,
    settings: SchedulerSettings,
}

impl JobScheduler {
    #[must_use]
    pub fn new(
        backend: Arc<dyn JobBackend>,
        catalog: TemplateCatalog,
        clock: Arc<dyn Clock>,
        settings: SchedulerSettings,
    ) -> Self {
        Self {
            backend,
            catalog,
            clock,
            settings,
        }
    }

    #[must_use]
    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Errors carry the scheduler's notion of time
    fn stamp(&self, err: JobError) -> JobError {
        err.at(self.clock.now())
    }

    /// Validate, render and submit a work unit
    #[instrument(skip(self, config), fields(job_id = %config.job_id, kind = %config.kind))]
    pub async fn create_job(&self, config: &JobConfig) -> JobResult<JobReport> {
        Self::validate_config(config).map_err(|e| self.stamp(e))?;

        let template = self
            .catalog
            .get_template(config.kind)
            .map_err(|e| self.stamp(JobError::new(e.kind, config.job_id.as_str(), e.message)))?;
        let job = self.build_job(config, &template).map_err(|e| self.stamp(e))?;

        let created = self.backend.create_job(&job).await.map_err(|e| self.stamp(e))?;
        info!(
            target = %config.target(),
            repository = %config.repository,
            "Created sync work unit"
        );

        let mut report = report_from_job(&created);
        report.status = JobStatus::Pending;
        report.start_time = Some(self.clock.now());
        Ok(report)
    }

    /// `Ok(None)` when no work unit with this id exists
    pub async fn find_job(&self, job_id: &str) -> JobResult<Option<JobReport>> {
        let job = self.backend.get_job(job_id).await.map_err(|e| self.stamp(e))?;
        Ok(job.as_ref().map(report_from_job))
    }

    pub async fn get_job(&self, job_id: &str) -> JobResult<JobReport> {
        self.find_job(job_id)
            .await?
            .ok_or_else(|| self.stamp(JobError::not_found(job_id)))
    }

    /// Work units managed by this controller, newest first
    pub async fn list_jobs(&self, filter: &JobFilter) -> JobResult<Vec<JobReport>> {
        let jobs = self
            .backend
            .list_jobs(&managed_selector())
            .await
            .map_err(|e| self.stamp(e))?;
        let mut reports: Vec<JobReport> = jobs
            .iter()
            .map(report_from_job)
            .filter(|report| filter.matches(report))
            .collect();
        reports.sort_by(|a, b| b.start_time.cmp(&a.start_time));
        if let Some(limit) = filter.limit {
            reports.truncate(limit);
        }
        Ok(reports)
    }

    /// Stop a running work unit: no new pods are started and running pods
    /// are deleted. The Job object itself is kept for inspection.
    #[instrument(skip(self))]
    pub async fn cancel_job(&self, job_id: &str) -> JobResult<()> {
        if self.find_job(job_id).await?.is_none() {
            return Err(self.stamp(JobError::not_found(job_id)));
        }

        self.backend
            .set_parallelism(job_id, 0)
            .await
            .map_err(|e| self.stamp(e))?;

        let pods = self.backend.list_pods(job_id).await.map_err(|e| self.stamp(e))?;
        for pod in pods {
            let Some(pod_name) = pod.metadata.name else {
                continue;
            };
            if let Err(e) = self.backend.delete_pod(&pod_name).await {
                warn!(pod = %pod_name, error = %e, "Failed to delete pod of cancelled work unit");
            }
        }

        info!("Cancelled sync work unit");
        Ok(())
    }

    #[instrument(skip(self))]
    pub async fn delete_job(&self, job_id: &str) -> JobResult<()> {
        self.backend.delete_job(job_id).await.map_err(|e| self.stamp(e))?;
        debug!("Deleted sync work unit");
        Ok(())
    }

    /// Relay state changes of one work unit until it finishes or the watch is
    /// stopped
    pub async fn watch_job(&self, job_id: &str) -> JobResult<JobWatch> {
        if self.find_job(job_id).await?.is_none() {
            return Err(self.stamp(JobError::not_found(job_id)));
        }

        let (tx, receiver) = mpsc::channel(WATCH_BUFFER);
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let clock = Arc::clone(&self.clock);
        let mut stream = self.backend.watch_job(job_id);
        let job_id = job_id.to_string();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    () = token.cancelled() => break,
                    next = stream.next() => match next {
                        Some(Ok(job)) => {
                            let report = report_from_job(&job);
                            let terminal = report.status.is_terminal();
                            if tx.send(monitor_from_report(&report, clock.now())).await.is_err() {
                                break;
                            }
                            if terminal {
                                break;
                            }
                        }
                        Some(Err(e)) => warn!(job_id = %job_id, error = %e, "Job watch error"),
                        None => break,
                    },
                }
            }
            debug!(job_id = %job_id, "Job watch closed");
        });

        Ok(JobWatch { receiver, cancel })
    }

    /// Logs of the worker container in the first pod of the work unit
    pub async fn get_job_logs(&self, job_id: &str) -> JobResult<String> {
        let mut pods = self.backend.list_pods(job_id).await.map_err(|e| self.stamp(e))?;
        pods.sort_by(|a, b| {
            a.metadata
                .creation_timestamp
                .as_ref()
                .map(|t| t.0)
                .cmp(&b.metadata.creation_timestamp.as_ref().map(|t| t.0))
        });
        let pod_name = pods
            .into_iter()
            .find_map(|pod| pod.metadata.name)
            .ok_or_else(|| self.stamp(JobError::execution(job_id, "no pods found for work unit")))?;
        self.backend
            .pod_logs(&pod_name, WORKER_CONTAINER_NAME)
            .await
            .map_err(|e| self.stamp(e))
    }

    pub async fn get_queue_status(&self) -> JobResult<QueueStatus> {
        let jobs = self
            .backend
            .list_jobs(&managed_selector())
            .await
            .map_err(|e| self.stamp(e))?;
        let mut queue = QueueStatus::default();
        for job in &jobs {
            queue.record(report_from_job(job).status);
        }
        Ok(queue)
    }

    fn validate_config(config: &JobConfig) -> JobResult<()> {
        let id = config.job_id.as_str();
        JobNaming::validate(id).map_err(|e| JobError::validation(id, e.to_string()))?;

        if config.repository.trim().is_empty() {
            return Err(JobError::validation(id, "repository is required"));
        }

        match config.kind {
            JobKind::Single if config.issue_keys.len() != 1 => Err(JobError::validation(
                id,
                format!(
                    "single sync takes exactly one issue key, got {}",
                    config.issue_keys.len()
                ),
            )),
            JobKind::Batch if config.issue_keys.is_empty() => {
                Err(JobError::validation(id, "batch sync requires at least one issue key"))
            }
            JobKind::Query if config.jql.as_deref().map_or(true, |q| q.trim().is_empty()) => {
                Err(JobError::validation(id, "query sync requires a JQL query"))
            }
            _ => Ok(()),
        }
    }

    /// Overlay the request onto a template copy and produce the Job object
    pub(crate) fn build_job(&self, config: &JobConfig, template: &JobTemplate) -> JobResult<Job> {
        let id = config.job_id.as_str();
        TemplateCatalog::validate_template(template)
            .map_err(|e| JobError::new(e.kind, id, e.message))?;

        let mut labels = BTreeMap::new();
        labels.extend(config.labels.clone());
        labels.insert(LABEL_MANAGED_BY.to_string(), MANAGED_BY_VALUE.to_string());
        labels.insert(LABEL_JOB_ID.to_string(), id.to_string());
        labels.insert(LABEL_JOB_KIND.to_string(), config.kind.to_string());

        let mut annotations = BTreeMap::new();
        if config.kind != JobKind::Query {
            annotations.insert(
                ANNOTATION_TOTAL_ISSUES.to_string(),
                config.issue_keys.len().to_string(),
            );
        }

        let mut spec = serde_json::to_value(&template.spec)
            .map_err(|e| JobError::internal(id, format!("failed to render template: {e}")))?;

        if let Some(parallelism) = config.parallelism {
            spec["parallelism"] = json!(parallelism);
        }
        if let Some(completions) = config.completions {
            spec["completions"] = json!(completions);
        }
        spec["activeDeadlineSeconds"] =
            json!(config.timeout_seconds.unwrap_or(template.timeout_seconds));
        if let Some(ttl) = self.settings.ttl_seconds_after_finished {
            spec["ttlSecondsAfterFinished"] = json!(ttl);
        }

        let pod_labels = &mut spec["template"]["metadata"]["labels"];
        if !pod_labels.is_object() {
            *pod_labels = json!({});
        }
        for (key, value) in &labels {
            pod_labels[key.as_str()] = json!(value);
        }

        if let Some(sa) = &self.settings.service_account_name {
            spec["template"]["spec"]["serviceAccountName"] = json!(sa);
        }
        if !self.settings.image_pull_secrets.is_empty() {
            let secrets: Vec<Value> = self
                .settings
                .image_pull_secrets
                .iter()
                .map(|name| json!({ "name": name }))
                .collect();
            spec["template"]["spec"]["imagePullSecrets"] = json!(secrets);
        }

        let worker = &mut spec["template"]["spec"]["containers"][0];
        worker["args"] = json!(worker_args(config));
        if let Some(image) = &config.image {
            worker["image"] = json!(image);
        }
        if let Some(policy) = &self.settings.image_pull_policy {
            worker["imagePullPolicy"] = json!(policy);
        }
        if !config.env.is_empty() {
            let env: Vec<Value> = config
                .env
                .iter()
                .map(|(name, value)| json!({ "name": name, "value": value }))
                .collect();
            worker["env"] = json!(env);
        }
        if !self.settings.secret_env_from.is_empty() {
            let env_from: Vec<Value> = self
                .settings
                .secret_env_from
                .iter()
                .map(|secret| json!({ "secretRef": { "name": secret } }))
                .collect();
            worker["envFrom"] = json!(env_from);
        }
        if let Some(overrides) = &config.resources {
            let resources = &mut worker["resources"];
            let mut set = |section: &str, key: &str, value: &Option<String>| {
                if let Some(value) = value {
                    resources[section][key] = json!(value);
                }
            };
            set("requests", "cpu", &overrides.cpu_request);
            set("limits", "cpu", &overrides.cpu_limit);
            set("requests", "memory", &overrides.memory_request);
            set("limits", "memory", &overrides.memory_limit);
        }

        let mut job = json!({
            "apiVersion": "batch/v1",
            "kind": "Job",
            "metadata": {
                "name": id,
                "labels": labels,
                "annotations": annotations,
            },
            "spec": spec,
        });
        if let Some(owner) = &config.owner {
            job["metadata"]["ownerReferences"] = json!([owner]);
        }

        serde_json::from_value(job)
            .map_err(|e| JobError::internal(id, format!("rendered job is invalid: {e}")))
    }
}

fn managed_selector() -> String {
    format!("{LABEL_MANAGED_BY}={MANAGED_BY_VALUE}")
}

fn worker_args(config: &JobConfig) -> Vec<String> {
    let mut args = vec!["sync".to_string(), format!("--mode={}", config.kind)];

    match config.kind {
        JobKind::Single | JobKind::Batch => {
            args.push(format!("--issues={}", config.issue_keys.join(",")));
        }
        JobKind::Query => {
            args.push(format!("--jql={}", config.jql.as_deref().unwrap_or_default()));
        }
    }

    args.push(format!("--repo={}", config.repository));
    if let Some(branch) = &config.branch {
        args.push(format!("--branch={branch}"));
    }
    if let Some(path) = &config.path {
        args.push(format!("--path={path}"));
    }
    if let Some(concurrency) = config.concurrency {
        args.push(format!("--concurrency={concurrency}"));
    }
    if let Some(rate) = config.rate_limit {
        args.push(format!("--rate-limit={rate}"));
    }

    for (enabled, flag) in [
        (config.incremental, "--incremental"),
        (config.force, "--force"),
        (config.dry_run, "--dry-run"),
        (config.safe_mode, "--safe-mode"),
        (config.include_links, "--include-links"),
    ] {
        if enabled {
            args.push(flag.to_string());
        }
    }
    args
}

fn annotation_count(annotations: Option<&BTreeMap<String, String>>, key: &str) -> Option<u32> {
    annotations
        .and_then(|a| a.get(key))
        .and_then(|v| v.trim().parse().ok())
}

/// Translate observed cluster state into a [`JobReport`]
#[must_use]
pub fn report_from_job(job: &Job) -> JobReport {
    let metadata = &job.metadata;
    let annotations = metadata.annotations.as_ref();
    let kind = metadata
        .labels
        .as_ref()
        .and_then(|l| l.get(LABEL_JOB_KIND))
        .and_then(|k| JobKind::parse(k));

    let spec = job.spec.as_ref();
    let status = job.status.as_ref();
    let conditions = status.and_then(|s| s.conditions.as_deref()).unwrap_or_default();
    let condition_true =
        |ty: &str| conditions.iter().find(|c| c.type_ == ty && c.status == "True");

    let complete = condition_true("Complete");
    let failed = condition_true("Failed");
    let active = status.and_then(|s| s.active).unwrap_or(0);

    let job_status = if complete.is_some() {
        JobStatus::Succeeded
    } else if failed.is_some() {
        JobStatus::Failed
    } else if active > 0 {
        JobStatus::Running
    } else if status.is_none() {
        JobStatus::Unknown
    } else {
        JobStatus::Pending
    };

    let failure_kind = failed.map(|c| match c.reason.as_deref() {
        Some("DeadlineExceeded") => JobErrorKind::Timeout,
        _ => JobErrorKind::Execution,
    });

    let start_time: Option<DateTime<Utc>> = status
        .and_then(|s| s.start_time.as_ref())
        .or(metadata.creation_timestamp.as_ref())
        .map(|t| t.0);
    let completion_time: Option<DateTime<Utc>> = status
        .and_then(|s| s.completion_time.as_ref())
        .map(|t| t.0)
        .or_else(|| failed.and_then(|c| c.last_transition_time.as_ref()).map(|t| t.0));
    let duration_seconds = start_time
        .zip(completion_time)
        .map(|(start, end)| (end - start).num_seconds());

    let total_issues = annotation_count(annotations, ANNOTATION_TOTAL_ISSUES).unwrap_or(0);
    let mut processed_issues = annotation_count(annotations, ANNOTATION_PROCESSED_ISSUES);
    let mut successful_issues = annotation_count(annotations, ANNOTATION_SUCCEEDED_ISSUES);
    let failed_issues = annotation_count(annotations, ANNOTATION_FAILED_ISSUES).unwrap_or(0);

    // A finished worker that never reported counts as having done everything
    if job_status == JobStatus::Succeeded && processed_issues.is_none() {
        processed_issues = Some(total_issues);
        successful_issues = successful_issues.or(Some(total_issues.saturating_sub(failed_issues)));
    }

    let created_files = annotations
        .and_then(|a| a.get(ANNOTATION_FILES))
        .map(|files| {
            files
                .split(',')
                .map(str::trim)
                .filter(|f| !f.is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default();

    let errors = failed
        .and_then(|c| c.message.clone())
        .into_iter()
        .collect();
    let message = failed
        .or(complete)
        .or_else(|| conditions.last())
        .and_then(|c| c.message.clone().or_else(|| c.reason.clone()));

    JobReport {
        job_id: metadata.name.clone().unwrap_or_default(),
        kind,
        status: job_status,
        start_time,
        completion_time,
        duration_seconds,
        total_issues,
        processed_issues: processed_issues.unwrap_or(0),
        successful_issues: successful_issues.unwrap_or(0),
        failed_issues,
        created_files,
        errors,
        message,
        failure_kind,
        parallelism: spec.and_then(|s| s.parallelism),
        completions: spec.and_then(|s| s.completions),
        succeeded_pods: status.and_then(|s| s.succeeded).unwrap_or(0),
        active_pods: active,
        owner: metadata
            .owner_references
            .as_ref()
            .and_then(|refs| refs.iter().find(|r| r.controller == Some(true)))
            .cloned(),
    }
}

/// Build the watch event for a report; progress is pod completion share
#[must_use]
pub fn monitor_from_report(report: &JobReport, now: DateTime<Utc>) -> JobMonitor {
    let completions = report.completions.unwrap_or(1).max(1);
    let progress = (f64::from(report.succeeded_pods) / f64::from(completions) * 100.0).min(100.0);
    let message = report.message.clone().unwrap_or_else(|| match report.status {
        JobStatus::Pending => "waiting for pods".to_string(),
        JobStatus::Running => format!("{} pod(s) active", report.active_pods),
        JobStatus::Succeeded => "completed".to_string(),
        JobStatus::Failed => "failed".to_string(),
        JobStatus::Unknown => "no status reported yet".to_string(),
    });
    JobMonitor {
        job_id: report.job_id.clone(),
        status: report.status,
        progress,
        message,
        timestamp: now,
    }
}

/// Failure of a finished work unit, if it failed
#[must_use]
pub fn failure_from_report(report: &JobReport) -> Option<JobError> {
    if report.status != JobStatus::Failed {
        return None;
    }
    let kind = report.failure_kind.unwrap_or(JobErrorKind::Execution);
    let message = report
        .message
        .clone()
        .unwrap_or_else(|| "work unit failed".to_string());
    Some(JobError::new(kind, report.job_id.as_str(), message))
}
