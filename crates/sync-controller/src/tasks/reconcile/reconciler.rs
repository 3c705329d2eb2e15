//! The `SyncRequest` state machine.
//!
//! `None → Pending → Processing → Completed`, with `Processing → Failed` on a
//! failed attempt and, while retries remain, `Failed → Recovering →
//! Processing` once the backoff delay has passed. Every transition is one
//! guarded status write (see [`StatusWriter`]); the guard checks that this
//! instance still holds the claim and that the resource is still in the
//! phase the transition was computed from.

use super::retry::{retries_remaining, retry_delay};
use super::status::StatusWriter;
use super::store::SyncRequestStore;
use crate::clock::Clock;
use crate::crds::{
    LastError, SyncCondition, SyncPhase, SyncRequest, SyncRequestStatus, CONDITION_API_SERVER_READY,
    CONDITION_COMPLETED, CONDITION_FAILED, CONDITION_PROCESSING, CONDITION_READY,
};
use crate::jobs::{failure_from_report, JobError, JobErrorKind, JobReport, JobStatus};
use crate::sync::{attempt_job_id, is_owned_by, validate_conversion, SyncJobOrchestrator};
use crate::tasks::types::Result;
use chrono::{DateTime, SecondsFormat, Utc};
use kube::runtime::controller::Action;
use kube::ResourceExt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

/// Upper bound on transitions taken in one reconcile call
const MAX_STEPS: usize = 8;

/// Timing and identity of one control-loop instance
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconcileSettings {
    /// Written to `status.claimedBy`
    pub identity: String,
    pub poll_interval: Duration,
    pub dependency_requeue: Duration,
    pub error_requeue: Duration,
    pub claim_lease: Duration,
    pub status_update_attempts: u32,
}

impl Default for ReconcileSettings {
    fn default() -> Self {
        Self {
            identity: "sync-controller".to_string(),
            poll_interval: Duration::from_secs(10),
            dependency_requeue: Duration::from_secs(30),
            error_requeue: Duration::from_secs(60),
            claim_lease: Duration::from_secs(120),
            status_update_attempts: 5,
        }
    }
}

/// What the controller runtime should do after a reconcile
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileOutcome {
    Requeue(Duration),
    AwaitChange,
}

impl From<ReconcileOutcome> for Action {
    fn from(outcome: ReconcileOutcome) -> Self {
        match outcome {
            ReconcileOutcome::Requeue(delay) => Action::requeue(delay),
            ReconcileOutcome::AwaitChange => Action::await_change(),
        }
    }
}

enum Step {
    Continue,
    Done(ReconcileOutcome),
}

fn timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn parse_time(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .ok()
        .map(|t| t.with_timezone(&Utc))
}

fn chrono_duration(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or(chrono::Duration::MAX)
}

/// A report counts as complete once the worker succeeded or every issue has
/// been processed
fn is_complete(report: &JobReport) -> bool {
    report.status == JobStatus::Succeeded
        || (report.status != JobStatus::Failed
            && report.total_issues > 0
            && report.percentage() == 100)
}

pub struct SyncReconciler {
    store: Arc<dyn SyncRequestStore>,
    writer: StatusWriter,
    orchestrator: Arc<SyncJobOrchestrator>,
    clock: Arc<dyn Clock>,
    settings: ReconcileSettings,
}

impl SyncReconciler {
    #[must_use]
    pub fn new(
        store: Arc<dyn SyncRequestStore>,
        orchestrator: Arc<SyncJobOrchestrator>,
        settings: ReconcileSettings,
    ) -> Self {
        let clock = Arc::clone(orchestrator.scheduler().clock());
        let writer = StatusWriter::new(Arc::clone(&store), settings.status_update_attempts);
        Self {
            store,
            writer,
            orchestrator,
            clock,
            settings,
        }
    }

    #[must_use]
    pub fn settings(&self) -> &ReconcileSettings {
        &self.settings
    }

    /// Resources a restarted controller still has to drive
    pub async fn unfinished(&self) -> Result<Vec<SyncRequest>> {
        let resources = self.store.list().await?;
        Ok(resources
            .into_iter()
            .filter(|r| !r.status.as_ref().is_some_and(SyncRequestStatus::is_terminal))
            .collect())
    }

    /// Drive the named resource as far as it can go right now
    #[instrument(skip(self), fields(identity = %self.settings.identity))]
    pub async fn reconcile(&self, name: &str) -> Result<ReconcileOutcome> {
        for _ in 0..MAX_STEPS {
            let Some(resource) = self.store.get(name).await? else {
                debug!("SyncRequest no longer exists");
                return Ok(ReconcileOutcome::AwaitChange);
            };
            if let Step::Done(outcome) = self.step(resource).await? {
                return Ok(outcome);
            }
        }
        Ok(ReconcileOutcome::Requeue(self.settings.poll_interval))
    }

    /// Delete the work unit of a resource that is being removed
    #[instrument(skip(self, resource), fields(name = %resource.name_any()))]
    pub async fn cleanup(&self, resource: &SyncRequest) -> Result<()> {
        let Some(job_id) = resource.status.as_ref().and_then(|s| s.job_id.as_deref()) else {
            debug!("No work unit to clean up");
            return Ok(());
        };
        match self.orchestrator.scheduler().delete_job(job_id).await {
            Ok(()) => {
                info!(job_id, "Deleted work unit of removed SyncRequest");
                Ok(())
            }
            Err(e) if e.is_retryable() => Err(e.into()),
            Err(e) => {
                warn!(job_id, error = %e, "Could not delete work unit, leaving it to its TTL");
                Ok(())
            }
        }
    }

    async fn step(&self, resource: SyncRequest) -> Result<Step> {
        if resource.metadata.deletion_timestamp.is_some() {
            return Ok(Step::Done(ReconcileOutcome::AwaitChange));
        }
        let status = resource.status.clone().unwrap_or_default();
        if status.is_terminal() {
            return Ok(Step::Done(ReconcileOutcome::AwaitChange));
        }
        if !self.claim_is_fresh(&status) {
            return self.claim(resource).await;
        }

        match status.phase {
            None => self.initialize(resource).await,
            Some(SyncPhase::Pending) => self.check_dependencies(resource).await,
            Some(SyncPhase::Processing) => match status.job_id {
                None => self.start_attempt(resource).await,
                Some(job_id) => self.track_attempt(resource, &job_id).await,
            },
            Some(SyncPhase::Failed) => self.await_retry(resource).await,
            Some(SyncPhase::Recovering) => self.resume(resource).await,
            Some(SyncPhase::Completed) => Ok(Step::Done(ReconcileOutcome::AwaitChange)),
        }
    }

    fn owns(&self, status: &SyncRequestStatus) -> bool {
        status.claimed_by.as_deref() == Some(self.settings.identity.as_str())
    }

    fn claim_age(&self, status: &SyncRequestStatus) -> Option<chrono::Duration> {
        let claimed_at = parse_time(status.claimed_at.as_deref()?)?;
        Some(self.clock.now() - claimed_at)
    }

    /// Held by us and not yet due for renewal
    fn claim_is_fresh(&self, status: &SyncRequestStatus) -> bool {
        let renew_after = chrono_duration(self.settings.claim_lease / 2);
        self.owns(status) && self.claim_age(status).is_some_and(|age| age < renew_after)
    }

    /// Take, renew or take over the claim on a resource
    async fn claim(&self, resource: SyncRequest) -> Result<Step> {
        let identity = self.settings.identity.as_str();
        let lease = chrono_duration(self.settings.claim_lease);
        let claimed_at = timestamp(self.clock.now());

        let claimed = self
            .writer
            .apply(resource, |_, status| {
                if let Some(holder) = status.claimed_by.as_deref() {
                    let live = self.claim_age(status).is_some_and(|age| age < lease);
                    if holder != identity && live {
                        return false;
                    }
                    if holder != identity {
                        info!(previous = %holder, "Taking over expired claim");
                    }
                }
                status.claimed_by = Some(identity.to_string());
                status.claimed_at = Some(claimed_at.clone());
                true
            })
            .await?;

        if claimed.is_some() {
            Ok(Step::Continue)
        } else {
            debug!("SyncRequest is claimed by another instance");
            Ok(Step::Done(ReconcileOutcome::Requeue(self.settings.claim_lease)))
        }
    }

    async fn initialize(&self, resource: SyncRequest) -> Result<Step> {
        let now = timestamp(self.clock.now());
        let generation = resource.metadata.generation;
        let total = u32::try_from(resource.spec.issue_count()).unwrap_or(u32::MAX);

        let written = self
            .writer
            .apply(resource, |_, status| {
                if !self.owns(status) || status.phase.is_some() {
                    return false;
                }
                status.phase = Some(SyncPhase::Pending);
                status.start_time = Some(now.clone());
                status.observed_generation = generation;
                status.progress.total_issues = total;
                status.set_condition(
                    SyncCondition::new(CONDITION_READY, false, "Pending", "Sync request accepted"),
                    &now,
                );
                true
            })
            .await?;
        if written.is_some() {
            info!(total_issues = total, "SyncRequest accepted");
        }
        Ok(Step::Continue)
    }

    /// Dependency gate and validation, then hand over to processing
    async fn check_dependencies(&self, resource: SyncRequest) -> Result<Step> {
        let now = timestamp(self.clock.now());

        let mut api_server_ready = None;
        if resource.spec.requires_api_server {
            let server = self.store.find_api_server().await?;
            let (reason, message) = match &server {
                None => ("No APIServer found", "No APIServer found in namespace".to_string()),
                Some(s) if !s.is_ready() => (
                    "Waiting",
                    format!("Waiting for APIServer '{}' to become ready", s.name_any()),
                ),
                Some(s) => {
                    api_server_ready = Some(format!("APIServer '{}' is ready", s.name_any()));
                    ("Ready", String::new())
                }
            };

            if api_server_ready.is_none() {
                self.writer
                    .apply(resource, |_, status| {
                        if !self.owns(status) || status.phase != Some(SyncPhase::Pending) {
                            return false;
                        }
                        status.set_condition(
                            SyncCondition::new(CONDITION_API_SERVER_READY, false, reason, message.clone()),
                            &now,
                        );
                        true
                    })
                    .await?;
                info!(reason, "Waiting on APIServer dependency");
                return Ok(Step::Done(ReconcileOutcome::Requeue(
                    self.settings.dependency_requeue,
                )));
            }
        }

        if let Err(e) = validate_conversion(&resource.spec) {
            warn!(error = %e, "SyncRequest failed validation");
            let error = JobError::from(e).at(self.clock.now());
            let written = self
                .writer
                .apply(resource, |_, status| {
                    if !self.owns(status) || status.phase != Some(SyncPhase::Pending) {
                        return false;
                    }
                    mark_failed(status, &error, "ValidationFailed", &now);
                    true
                })
                .await?;
            return Ok(match written {
                Some(_) => Step::Done(ReconcileOutcome::AwaitChange),
                None => Step::Continue,
            });
        }

        self.writer
            .apply(resource, |_, status| {
                if !self.owns(status) || status.phase != Some(SyncPhase::Pending) {
                    return false;
                }
                if let Some(message) = &api_server_ready {
                    status.set_condition(
                        SyncCondition::new(CONDITION_API_SERVER_READY, true, "Ready", message.clone()),
                        &now,
                    );
                }
                status.phase = Some(SyncPhase::Processing);
                status.set_condition(
                    SyncCondition::new(CONDITION_PROCESSING, true, "Submitting", "Submitting work unit"),
                    &now,
                );
                true
            })
            .await?;
        Ok(Step::Continue)
    }

    /// Submit (or adopt) the work unit for the current attempt
    async fn start_attempt(&self, resource: SyncRequest) -> Result<Step> {
        let status = resource.status.clone().unwrap_or_default();
        let attempt = status.retry_count;
        let job_id = attempt_job_id(&resource.name_any(), attempt);
        let scheduler = self.orchestrator.scheduler();

        let report = match scheduler.find_job(&job_id).await {
            Ok(Some(existing)) => {
                if !is_owned_by(&existing, &resource) {
                    let err = self.foreign_work_unit(&job_id, &existing);
                    return self.fail_attempt(resource, err).await;
                }
                info!(job_id = %job_id, "Adopting existing work unit");
                existing
            }
            Ok(None) => match self.orchestrator.submit_resource(&resource, attempt).await {
                Ok(report) => {
                    info!(job_id = %job_id, attempt, "Submitted work unit");
                    report
                }
                Err(e) => match scheduler.find_job(&job_id).await {
                    // Another instance created it between our read and create
                    Ok(Some(existing)) if is_owned_by(&existing, &resource) => existing,
                    Ok(Some(existing)) => {
                        let err = self.foreign_work_unit(&job_id, &existing);
                        return self.fail_attempt(resource, err).await;
                    }
                    _ => return self.fail_attempt(resource, e).await,
                },
            },
            Err(e) if e.is_retryable() => {
                warn!(job_id = %job_id, error = %e, "Could not look up work unit");
                return Ok(Step::Done(ReconcileOutcome::Requeue(self.settings.poll_interval)));
            }
            Err(e) => return self.fail_attempt(resource, e).await,
        };

        let now = timestamp(self.clock.now());
        let written = self
            .writer
            .apply(resource, |_, status| {
                if !self.owns(status)
                    || status.phase != Some(SyncPhase::Processing)
                    || status.job_id.is_some()
                {
                    return false;
                }
                status.job_id = Some(report.job_id.clone());
                if report.total_issues > 0 {
                    status.progress.total_issues = report.total_issues;
                }
                status.set_condition(
                    SyncCondition::new(
                        CONDITION_PROCESSING,
                        true,
                        "JobSubmitted",
                        format!("Work unit {} submitted", report.job_id),
                    ),
                    &now,
                );
                true
            })
            .await?;

        Ok(match written {
            Some(_) => Step::Done(ReconcileOutcome::Requeue(self.settings.poll_interval)),
            None => Step::Continue,
        })
    }

    /// The attempt's id is taken by a Job this resource does not own. The
    /// attempt fails; a retry moves on to the next attempt id.
    fn foreign_work_unit(&self, job_id: &str, existing: &JobReport) -> JobError {
        let owner = existing
            .owner
            .as_ref()
            .map_or_else(|| "no owner".to_string(), |o| format!("{} '{}'", o.kind, o.name));
        warn!(job_id, %owner, "Work unit id is taken by another owner");
        JobError::execution(job_id, format!("work unit {job_id} belongs to {owner}"))
            .at(self.clock.now())
    }

    /// Fold the observed work-unit state into the resource status
    async fn track_attempt(&self, resource: SyncRequest, job_id: &str) -> Result<Step> {
        let report = match self.orchestrator.scheduler().find_job(job_id).await {
            Ok(Some(report)) => report,
            Ok(None) => {
                let err = JobError::execution(job_id, "work unit disappeared before finishing")
                    .at(self.clock.now());
                return self.fail_attempt(resource, err).await;
            }
            Err(e) if e.is_retryable() => {
                warn!(job_id, error = %e, "Could not read work unit");
                return Ok(Step::Done(ReconcileOutcome::Requeue(self.settings.poll_interval)));
            }
            Err(e) => return self.fail_attempt(resource, e).await,
        };

        if is_complete(&report) {
            return self.complete(resource, &report).await;
        }
        if let Some(err) = failure_from_report(&report) {
            return self.fail_attempt(resource, err).await;
        }

        let now = timestamp(self.clock.now());
        let message = if report.total_issues > 0 {
            format!("{}/{} issues processed", report.processed_issues, report.total_issues)
        } else {
            format!("{} issues processed", report.processed_issues)
        };
        let written = self
            .writer
            .apply(resource, |_, status| {
                if !self.owns(status)
                    || status.phase != Some(SyncPhase::Processing)
                    || status.job_id.as_deref() != Some(job_id)
                {
                    return false;
                }
                apply_progress(status, &report);
                status.set_condition(
                    SyncCondition::new(CONDITION_PROCESSING, true, "JobRunning", message.clone()),
                    &now,
                );
                true
            })
            .await?;

        Ok(match written {
            Some(_) => Step::Done(ReconcileOutcome::Requeue(self.settings.poll_interval)),
            None => Step::Continue,
        })
    }

    async fn complete(&self, resource: SyncRequest, report: &JobReport) -> Result<Step> {
        let now = timestamp(self.clock.now());
        let written = self
            .writer
            .apply(resource, |_, status| {
                if !self.owns(status)
                    || status.phase != Some(SyncPhase::Processing)
                    || status.job_id.as_deref() != Some(report.job_id.as_str())
                {
                    return false;
                }
                apply_progress(status, report);
                status.progress.percentage = 100;
                status.phase = Some(SyncPhase::Completed);
                status.retry_count = 0;
                status.last_error = None;
                status.next_retry_time = None;
                status.last_sync = Some(now.clone());
                status.completion_time = Some(now.clone());
                status.set_condition(
                    SyncCondition::new(CONDITION_PROCESSING, false, "Completed", "Work unit finished"),
                    &now,
                );
                status.set_condition(
                    SyncCondition::new(
                        CONDITION_COMPLETED,
                        true,
                        "SyncSucceeded",
                        format!("{} issues synced", report.successful_issues),
                    ),
                    &now,
                );
                status.set_condition(
                    SyncCondition::new(CONDITION_READY, true, "Completed", "Sync completed"),
                    &now,
                );
                true
            })
            .await?;

        Ok(match written {
            Some(_) => {
                info!(
                    job_id = %report.job_id,
                    processed = report.processed_issues,
                    failed = report.failed_issues,
                    "SyncRequest completed"
                );
                Step::Done(ReconcileOutcome::AwaitChange)
            }
            None => Step::Continue,
        })
    }

    /// Record a failed attempt and either schedule the next one or stop
    async fn fail_attempt(&self, resource: SyncRequest, err: JobError) -> Result<Step> {
        let status = resource.status.clone().unwrap_or_default();
        let expected_job = status.job_id.clone();
        let failures = status.retry_count.saturating_add(1);
        let policy = &resource.spec.retry_policy;

        let retryable = err.is_retryable() || err.kind == JobErrorKind::Execution;
        let delay = if retryable && retries_remaining(policy, failures) {
            match retry_delay(policy, failures) {
                Ok(delay) => Some(delay),
                Err(e) => {
                    warn!(error = %e, "Unusable retry delay, not retrying");
                    None
                }
            }
        } else {
            None
        };

        let now_at = self.clock.now();
        let now = timestamp(now_at);
        let reason = if retryable { "RetriesExhausted" } else { "NonRetryableError" };

        let written = self
            .writer
            .apply(resource, |_, status| {
                if !self.owns(status)
                    || status.phase != Some(SyncPhase::Processing)
                    || status.job_id != expected_job
                {
                    return false;
                }
                status.retry_count = failures;
                status.set_condition(
                    SyncCondition::new(CONDITION_PROCESSING, false, "JobFailed", err.message.clone()),
                    &now,
                );
                match delay {
                    Some(delay) => {
                        status.phase = Some(SyncPhase::Failed);
                        status.last_error = Some(last_error(&err, &now));
                        status.next_retry_time = Some(timestamp(now_at + chrono_duration(delay)));
                        status.set_condition(
                            SyncCondition::new(
                                CONDITION_READY,
                                false,
                                "RetryScheduled",
                                format!("Attempt {failures} failed, retrying in {delay:?}"),
                            ),
                            &now,
                        );
                    }
                    None => mark_failed(status, &err, reason, &now),
                }
                true
            })
            .await?;

        Ok(match (written, delay) {
            (None, _) => Step::Continue,
            (Some(_), Some(delay)) => {
                warn!(kind = %err.kind, failures, ?delay, error = %err.message, "Attempt failed, retry scheduled");
                Step::Done(ReconcileOutcome::Requeue(delay))
            }
            (Some(_), None) => {
                warn!(kind = %err.kind, failures, error = %err.message, "SyncRequest failed");
                Step::Done(ReconcileOutcome::AwaitChange)
            }
        })
    }

    /// Wait out the backoff, then move to `Recovering`
    async fn await_retry(&self, resource: SyncRequest) -> Result<Step> {
        let status = resource.status.clone().unwrap_or_default();
        let now_at = self.clock.now();
        let due = status
            .next_retry_time
            .as_deref()
            .and_then(parse_time)
            .unwrap_or(now_at);
        if due > now_at {
            let remaining = (due - now_at).to_std().unwrap_or(self.settings.poll_interval);
            return Ok(Step::Done(ReconcileOutcome::Requeue(remaining)));
        }

        if let Some(job_id) = status.job_id.as_deref() {
            if let Err(e) = self.orchestrator.scheduler().delete_job(job_id).await {
                warn!(job_id, error = %e, "Could not delete work unit of failed attempt");
            }
        }

        let expected_retry = status.next_retry_time.clone();
        let now = timestamp(now_at);
        self.writer
            .apply(resource, |_, status| {
                if !self.owns(status)
                    || status.phase != Some(SyncPhase::Failed)
                    || status.next_retry_time != expected_retry
                {
                    return false;
                }
                let message = format!("Starting attempt {}", status.retry_count + 1);
                status.phase = Some(SyncPhase::Recovering);
                status.last_error = None;
                status.job_id = None;
                status.next_retry_time = None;
                status.set_condition(
                    SyncCondition::new(CONDITION_READY, false, "Recovering", message),
                    &now,
                );
                true
            })
            .await?;
        Ok(Step::Continue)
    }

    async fn resume(&self, resource: SyncRequest) -> Result<Step> {
        let now = timestamp(self.clock.now());
        self.writer
            .apply(resource, |_, status| {
                if !self.owns(status) || status.phase != Some(SyncPhase::Recovering) {
                    return false;
                }
                status.phase = Some(SyncPhase::Processing);
                status.progress.processed_issues = 0;
                status.progress.failed_issues = 0;
                status.progress.percentage = 0;
                status.set_condition(
                    SyncCondition::new(CONDITION_PROCESSING, true, "Retrying", "Submitting work unit"),
                    &now,
                );
                true
            })
            .await?;
        Ok(Step::Continue)
    }
}

fn apply_progress(status: &mut SyncRequestStatus, report: &JobReport) {
    if report.total_issues > 0 {
        status.progress.total_issues = report.total_issues;
    }
    status.progress.processed_issues = report.processed_issues;
    status.progress.failed_issues = report.failed_issues;
    status.progress.percentage = report.percentage();
}

fn last_error(err: &JobError, now: &str) -> LastError {
    LastError {
        error_type: err.kind.to_string(),
        message: err.message.clone(),
        time: now.to_string(),
    }
}

/// Terminal failure
fn mark_failed(status: &mut SyncRequestStatus, err: &JobError, reason: &str, now: &str) {
    status.phase = Some(SyncPhase::Failed);
    status.last_error = Some(last_error(err, now));
    status.next_retry_time = None;
    status.completion_time = Some(now.to_string());
    status.set_condition(
        SyncCondition::new(CONDITION_FAILED, true, reason, err.message.clone()),
        now,
    );
    status.set_condition(
        SyncCondition::new(CONDITION_READY, false, "Failed", err.message.clone()),
        now,
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::crds::SyncType;
    use crate::jobs::{JobScheduler, SchedulerSettings, TemplateCatalog};
    use crate::testing::{fixed_now, sync_request, MemoryJobBackend, MemorySyncStore, ScriptedOutcome};

    const POLL: Duration = Duration::from_secs(10);

    struct Harness {
        backend: Arc<MemoryJobBackend>,
        store: Arc<MemorySyncStore>,
        clock: Arc<ManualClock>,
        orchestrator: Arc<SyncJobOrchestrator>,
    }

    impl Harness {
        fn new() -> Self {
            let backend = Arc::new(MemoryJobBackend::new());
            let clock = Arc::new(ManualClock::new(fixed_now()));
            let scheduler = JobScheduler::new(
                backend.clone(),
                TemplateCatalog::new("ghcr.io/5dlabs/issue-sync:test"),
                clock.clone(),
                SchedulerSettings::default(),
            );
            Self {
                backend,
                store: Arc::new(MemorySyncStore::new()),
                clock,
                orchestrator: Arc::new(SyncJobOrchestrator::new(Arc::new(scheduler))),
            }
        }

        fn reconciler(&self, identity: &str) -> SyncReconciler {
            SyncReconciler::new(
                self.store.clone(),
                self.orchestrator.clone(),
                ReconcileSettings {
                    identity: identity.to_string(),
                    poll_interval: POLL,
                    dependency_requeue: Duration::from_secs(30),
                    claim_lease: Duration::from_secs(120),
                    ..Default::default()
                },
            )
        }
    }

    fn without_api_server(name: &str) -> SyncRequest {
        let mut resource = sync_request(name);
        resource.spec.requires_api_server = false;
        resource
    }

    #[tokio::test]
    async fn test_retries_then_fails_after_four_attempts() {
        let harness = Harness::new();
        let mut resource = without_api_server("flaky");
        resource.spec.retry_policy.max_retries = 3;
        resource.spec.retry_policy.backoff_multiplier = 2.0;
        resource.spec.retry_policy.initial_delay = "100ms".to_string();
        harness.store.insert(resource);
        harness.backend.script(vec![ScriptedOutcome::Fail("BackoffLimitExceeded".to_string()); 4]);
        let reconciler = harness.reconciler("controller-0");

        let mut delays = Vec::new();
        for _ in 0..20 {
            let outcome = reconciler.reconcile("flaky").await.unwrap();
            let status = harness.store.status("flaky").unwrap();
            if status.is_terminal() {
                break;
            }
            if let ReconcileOutcome::Requeue(delay) = outcome {
                if status.phase == Some(SyncPhase::Failed) {
                    delays.push(delay);
                    harness.clock.advance(delay);
                }
            }
        }

        let status = harness.store.status("flaky").unwrap();
        assert_eq!(status.phase, Some(SyncPhase::Failed));
        assert!(status.next_retry_time.is_none());
        assert_eq!(status.retry_count, 4);
        assert_eq!(harness.backend.created_count(), 4);
        assert_eq!(
            delays,
            vec![
                Duration::from_millis(100),
                Duration::from_millis(200),
                Duration::from_millis(400)
            ]
        );
        let failed = status.condition(CONDITION_FAILED).unwrap();
        assert!(failed.is_true());
        assert_eq!(failed.reason.as_deref(), Some("RetriesExhausted"));
        assert_eq!(status.last_error.as_ref().unwrap().error_type, "execution");

        // Terminal resources are left alone
        assert_eq!(
            reconciler.reconcile("flaky").await.unwrap(),
            ReconcileOutcome::AwaitChange
        );
        assert_eq!(harness.backend.created_count(), 4);
    }

    #[tokio::test]
    async fn test_recovers_after_transient_failure() {
        let harness = Harness::new();
        let mut resource = without_api_server("recovers");
        resource.spec.retry_policy.initial_delay = "1s".to_string();
        harness.store.insert(resource);
        harness.backend.script(vec![
            ScriptedOutcome::Fail("BackoffLimitExceeded".to_string()),
            ScriptedOutcome::Succeed,
        ]);
        let reconciler = harness.reconciler("controller-0");

        reconciler.reconcile("recovers").await.unwrap();
        let outcome = reconciler.reconcile("recovers").await.unwrap();
        assert_eq!(outcome, ReconcileOutcome::Requeue(Duration::from_secs(1)));
        let status = harness.store.status("recovers").unwrap();
        assert_eq!(status.phase, Some(SyncPhase::Failed));
        assert_eq!(status.retry_count, 1);
        assert!(status.last_error.is_some());

        // Not due yet
        let early = reconciler.reconcile("recovers").await.unwrap();
        assert_eq!(early, ReconcileOutcome::Requeue(Duration::from_secs(1)));

        harness.clock.advance(Duration::from_secs(1));
        reconciler.reconcile("recovers").await.unwrap();
        reconciler.reconcile("recovers").await.unwrap();

        let status = harness.store.status("recovers").unwrap();
        assert_eq!(status.phase, Some(SyncPhase::Completed));
        assert_eq!(status.job_id, Some(attempt_job_id("recovers", 1)));
        assert_eq!(status.retry_count, 0);
        assert!(status.last_error.is_none());
        // The failed attempt's work unit was removed on recovery
        assert!(harness.backend.job(&attempt_job_id("recovers", 0)).is_none());
    }

    #[tokio::test]
    async fn test_batch_progress_reaches_completed() {
        let harness = Harness::new();
        let mut resource = without_api_server("batch-five");
        resource.spec.sync_type = SyncType::Batch;
        resource.spec.target.issue_keys = (1..=5).map(|n| format!("PROJ-{n}")).collect();
        harness.store.insert(resource);
        let reconciler = harness.reconciler("controller-0");

        let outcome = reconciler.reconcile("batch-five").await.unwrap();
        assert_eq!(outcome, ReconcileOutcome::Requeue(POLL));
        let job_id = harness.store.status("batch-five").unwrap().job_id.unwrap();
        assert_eq!(job_id, attempt_job_id("batch-five", 0));

        harness.backend.set_running(&job_id, 2);
        harness.backend.set_progress(&job_id, 2, 2, 0);
        reconciler.reconcile("batch-five").await.unwrap();
        let status = harness.store.status("batch-five").unwrap();
        assert_eq!(status.phase, Some(SyncPhase::Processing));
        assert_eq!(status.progress.percentage, 40);
        assert_eq!(
            status.condition(CONDITION_PROCESSING).unwrap().message.as_deref(),
            Some("2/5 issues processed")
        );

        harness.backend.set_progress(&job_id, 5, 5, 0);
        let outcome = reconciler.reconcile("batch-five").await.unwrap();
        assert_eq!(outcome, ReconcileOutcome::AwaitChange);
        let status = harness.store.status("batch-five").unwrap();
        assert_eq!(status.phase, Some(SyncPhase::Completed));
        assert_eq!(status.progress.percentage, 100);
        assert_eq!(status.progress.processed_issues, 5);
        assert!(status.last_sync.is_some());
        assert!(status.condition(CONDITION_READY).unwrap().is_true());
    }

    #[tokio::test]
    async fn test_dependency_gate_holds_in_pending() {
        let harness = Harness::new();
        harness.store.insert(sync_request("gated"));
        let reconciler = harness.reconciler("controller-0");

        let outcome = reconciler.reconcile("gated").await.unwrap();
        assert_eq!(outcome, ReconcileOutcome::Requeue(Duration::from_secs(30)));
        let status = harness.store.status("gated").unwrap();
        assert_eq!(status.phase, Some(SyncPhase::Pending));
        let gate = status.condition(CONDITION_API_SERVER_READY).unwrap();
        assert!(!gate.is_true());
        assert_eq!(gate.reason.as_deref(), Some("No APIServer found"));

        harness.store.add_api_server("sync-api", false);
        reconciler.reconcile("gated").await.unwrap();
        let status = harness.store.status("gated").unwrap();
        assert_eq!(status.phase, Some(SyncPhase::Pending));
        assert_eq!(
            status.condition(CONDITION_API_SERVER_READY).unwrap().reason.as_deref(),
            Some("Waiting")
        );
        assert_eq!(harness.backend.created_count(), 0);

        harness.store.set_api_server_ready("sync-api", true);
        reconciler.reconcile("gated").await.unwrap();
        let status = harness.store.status("gated").unwrap();
        assert_eq!(status.phase, Some(SyncPhase::Processing));
        assert!(status.condition(CONDITION_API_SERVER_READY).unwrap().is_true());
        assert_eq!(harness.backend.created_count(), 1);
    }

    #[tokio::test]
    async fn test_invalid_spec_fails_without_retry() {
        let harness = Harness::new();
        let mut resource = without_api_server("bad-repo");
        resource.spec.destination.repository = "file:///etc/passwd".to_string();
        harness.store.insert(resource);
        let reconciler = harness.reconciler("controller-0");

        let outcome = reconciler.reconcile("bad-repo").await.unwrap();
        assert_eq!(outcome, ReconcileOutcome::AwaitChange);
        let status = harness.store.status("bad-repo").unwrap();
        assert!(status.is_terminal());
        assert_eq!(status.phase, Some(SyncPhase::Failed));
        assert_eq!(status.last_error.as_ref().unwrap().error_type, "validation");
        assert_eq!(
            status.condition(CONDITION_FAILED).unwrap().reason.as_deref(),
            Some("ValidationFailed")
        );
        assert_eq!(harness.backend.created_count(), 0);
    }

    #[tokio::test]
    async fn test_only_one_instance_wins_the_claim() {
        let harness = Harness::new();
        harness.store.insert(without_api_server("contended"));
        let first = harness.reconciler("controller-0");
        let second = harness.reconciler("controller-1");

        let (a, b) = tokio::join!(first.reconcile("contended"), second.reconcile("contended"));
        let outcomes = [a.unwrap(), b.unwrap()];
        let lost = outcomes
            .iter()
            .filter(|o| **o == ReconcileOutcome::Requeue(Duration::from_secs(120)))
            .count();
        assert_eq!(lost, 1);
        assert_eq!(harness.backend.created_count(), 1);

        let status = harness.store.status("contended").unwrap();
        assert!(matches!(
            status.claimed_by.as_deref(),
            Some("controller-0" | "controller-1")
        ));
        assert!(status.job_id.is_some());
    }

    #[tokio::test]
    async fn test_claim_from_stale_snapshot_keeps_single_holder() {
        let harness = Harness::new();
        let stale = harness.store.insert(without_api_server("contended"));
        let first = harness.reconciler("controller-0");
        let second = harness.reconciler("controller-1");

        // Both instances read the resource before either claimed it
        let won = first.claim(stale.clone()).await.unwrap();
        let lost = second.claim(stale).await.unwrap();

        assert!(matches!(won, Step::Continue));
        assert!(matches!(
            lost,
            Step::Done(ReconcileOutcome::Requeue(d)) if d == Duration::from_secs(120)
        ));
        // The second write hit the first one's resourceVersion
        assert_eq!(harness.store.conflicts(), 1);
        let status = harness.store.status("contended").unwrap();
        assert_eq!(status.claimed_by.as_deref(), Some("controller-0"));
        assert_eq!(status.claimed_at, Some(timestamp(fixed_now())));
    }

    #[tokio::test]
    async fn test_names_that_normalize_alike_get_separate_work_units() {
        let harness = Harness::new();
        let dotted = without_api_server("team.sync");
        let mut dashed = without_api_server("team-sync");
        dashed.spec.target.issue_keys = vec!["OTHER-9".to_string()];
        harness.store.insert(dotted);
        harness.store.insert(dashed);
        let reconciler = harness.reconciler("controller-0");

        reconciler.reconcile("team.sync").await.unwrap();
        reconciler.reconcile("team-sync").await.unwrap();

        let dotted_job = harness.store.status("team.sync").unwrap().job_id.unwrap();
        let dashed_job = harness.store.status("team-sync").unwrap().job_id.unwrap();
        assert_ne!(dotted_job, dashed_job);
        assert_eq!(harness.backend.created_count(), 2);

        let args = |job_id: &str| {
            let job = harness.backend.job(job_id).unwrap();
            job.spec.unwrap().template.spec.unwrap().containers[0]
                .args
                .clone()
                .unwrap()
        };
        assert!(args(&dotted_job).contains(&"--issues=PROJ-1".to_string()));
        assert!(args(&dashed_job).contains(&"--issues=OTHER-9".to_string()));
    }

    #[tokio::test]
    async fn test_foreign_work_unit_is_not_adopted() {
        let harness = Harness::new();

        // A previous resource of the same name left its work unit behind
        let mut previous = without_api_server("squatted");
        previous.metadata.uid = Some("sr-previous".to_string());
        previous.spec.target.issue_keys = vec!["OLD-1".to_string()];
        harness
            .orchestrator
            .submit_resource(&previous, 0)
            .await
            .unwrap();

        let mut resource = without_api_server("squatted");
        resource.spec.retry_policy.initial_delay = "1s".to_string();
        harness.store.insert(resource);
        let reconciler = harness.reconciler("controller-0");

        let outcome = reconciler.reconcile("squatted").await.unwrap();
        assert_eq!(outcome, ReconcileOutcome::Requeue(Duration::from_secs(1)));
        let status = harness.store.status("squatted").unwrap();
        assert_eq!(status.phase, Some(SyncPhase::Failed));
        assert!(status.job_id.is_none());
        let error = status.last_error.as_ref().unwrap();
        assert!(error.message.contains("belongs to SyncRequest 'squatted'"));
        assert_eq!(error.time, timestamp(fixed_now()));

        harness.clock.advance(Duration::from_secs(1));
        reconciler.reconcile("squatted").await.unwrap();

        let status = harness.store.status("squatted").unwrap();
        assert_eq!(status.phase, Some(SyncPhase::Processing));
        assert_eq!(status.job_id, Some(attempt_job_id("squatted", 1)));
        let own = harness.backend.job(&attempt_job_id("squatted", 1)).unwrap();
        let owner = &own.metadata.owner_references.unwrap()[0];
        assert_eq!(owner.uid, "sr-squatted");
        // The other resource's work unit is left untouched
        assert!(harness.backend.job(&attempt_job_id("squatted", 0)).is_some());
        assert_eq!(harness.backend.created_count(), 2);
    }

    #[tokio::test]
    async fn test_expired_claim_is_taken_over_and_work_adopted() {
        let harness = Harness::new();
        let mut resource = without_api_server("orphaned");
        resource.status = Some(SyncRequestStatus {
            phase: Some(SyncPhase::Processing),
            claimed_by: Some("controller-dead".to_string()),
            claimed_at: Some(timestamp(fixed_now())),
            ..Default::default()
        });
        let resource = harness.store.insert(resource);

        // The dead instance created the work unit but never recorded it
        harness
            .orchestrator
            .submit_resource(&resource, 0)
            .await
            .unwrap();
        assert_eq!(harness.backend.created_count(), 1);

        let survivor = harness.reconciler("controller-1");
        let outcome = survivor.reconcile("orphaned").await.unwrap();
        assert_eq!(outcome, ReconcileOutcome::Requeue(Duration::from_secs(120)));

        harness.clock.advance(Duration::from_secs(121));
        let outcome = survivor.reconcile("orphaned").await.unwrap();
        assert_eq!(outcome, ReconcileOutcome::Requeue(POLL));
        let status = harness.store.status("orphaned").unwrap();
        assert_eq!(status.claimed_by.as_deref(), Some("controller-1"));
        assert_eq!(status.job_id, Some(attempt_job_id("orphaned", 0)));
        assert_eq!(harness.backend.created_count(), 1);

        assert_eq!(survivor.unfinished().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_deletion_is_tolerated() {
        let harness = Harness::new();
        harness.store.insert(without_api_server("short-lived"));
        harness.store.insert(without_api_server("bystander"));
        let reconciler = harness.reconciler("controller-0");

        reconciler.reconcile("short-lived").await.unwrap();
        reconciler.reconcile("bystander").await.unwrap();
        let resource = harness.store.get_resource("short-lived").unwrap();

        reconciler.cleanup(&resource).await.unwrap();
        harness.store.delete("short-lived");
        assert!(harness.backend.job(&attempt_job_id("short-lived", 0)).is_none());

        assert_eq!(
            reconciler.reconcile("short-lived").await.unwrap(),
            ReconcileOutcome::AwaitChange
        );
        // Cleaning up twice is harmless
        reconciler.cleanup(&resource).await.unwrap();

        let bystander = harness.store.status("bystander").unwrap();
        assert_eq!(bystander.phase, Some(SyncPhase::Processing));
        assert_eq!(bystander.job_id, Some(attempt_job_id("bystander", 0)));
        assert!(harness.backend.job(&attempt_job_id("bystander", 0)).is_some());
    }

    #[tokio::test]
    async fn test_vanished_work_unit_counts_as_failed_attempt() {
        let harness = Harness::new();
        harness.store.insert(without_api_server("vanishing"));
        let reconciler = harness.reconciler("controller-0");

        reconciler.reconcile("vanishing").await.unwrap();
        harness.backend.remove_job(&attempt_job_id("vanishing", 0));

        let outcome = reconciler.reconcile("vanishing").await.unwrap();
        assert_eq!(outcome, ReconcileOutcome::Requeue(Duration::from_secs(30)));
        let status = harness.store.status("vanishing").unwrap();
        assert_eq!(status.phase, Some(SyncPhase::Failed));
        assert!(status.last_error.as_ref().unwrap().message.contains("disappeared"));
    }

    #[test]
    fn test_outcome_into_action() {
        assert_eq!(
            Action::from(ReconcileOutcome::Requeue(POLL)),
            Action::requeue(POLL)
        );
        assert_eq!(Action::from(ReconcileOutcome::AwaitChange), Action::await_change());
    }
}
