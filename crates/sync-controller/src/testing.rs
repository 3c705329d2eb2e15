//! In-memory cluster used by the unit tests.

use crate::crds::{ApiServer, ApiServerSpec, ApiServerStatus, SyncRequest, SyncRequestSpec, SyncRequestStatus};
use crate::jobs::{JobBackend, JobError, JobErrorKind, JobResult};
use crate::tasks::reconcile::SyncRequestStore;
use crate::tasks::types::{Error, Result};
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use futures::stream::{self, BoxStream};
use futures::StreamExt;
use k8s_openapi::api::batch::v1::{Job, JobCondition, JobStatus as K8sJobStatus};
use k8s_openapi::api::core::v1::Pod;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, Time};
use kube::ResourceExt;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};
use tokio::sync::broadcast;

use crate::jobs::types::{
    ANNOTATION_FAILED_ISSUES, ANNOTATION_PROCESSED_ISSUES, ANNOTATION_SUCCEEDED_ISSUES,
};

pub fn fixed_now() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 3, 14, 9, 26, 53).unwrap()
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

/// State a created work unit starts in
#[derive(Debug, Clone, PartialEq)]
pub enum ScriptedOutcome {
    Succeed,
    Fail(String),
    Running,
    CreateError(JobErrorKind),
}

struct MemoryPod {
    job: String,
    name: String,
    logs: String,
}

#[derive(Default)]
struct BackendState {
    jobs: BTreeMap<String, Job>,
    pods: Vec<MemoryPod>,
    created: usize,
    script: VecDeque<ScriptedOutcome>,
}

pub struct MemoryJobBackend {
    state: Mutex<BackendState>,
    events: broadcast::Sender<Job>,
}

impl MemoryJobBackend {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            state: Mutex::new(BackendState::default()),
            events,
        }
    }

    /// Outcomes applied, in order, to the next created work units
    pub fn script(&self, outcomes: Vec<ScriptedOutcome>) {
        lock(&self.state).script.extend(outcomes);
    }

    pub fn job(&self, name: &str) -> Option<Job> {
        lock(&self.state).jobs.get(name).cloned()
    }

    pub fn created_count(&self) -> usize {
        lock(&self.state).created
    }

    pub fn pods_of(&self, job: &str) -> Vec<String> {
        lock(&self.state)
            .pods
            .iter()
            .filter(|p| p.job == job)
            .map(|p| p.name.clone())
            .collect()
    }

    pub fn add_pod(&self, job: &str, pod: &str, logs: &str) {
        lock(&self.state).pods.push(MemoryPod {
            job: job.to_string(),
            name: pod.to_string(),
            logs: logs.to_string(),
        });
    }

    pub fn remove_job(&self, name: &str) {
        let mut state = lock(&self.state);
        state.jobs.remove(name);
        state.pods.retain(|p| p.job != name);
    }

    pub fn set_running(&self, name: &str, active: i32) {
        self.update(name, |job| {
            let status = job.status.get_or_insert_with(K8sJobStatus::default);
            status.active = Some(active);
            status.start_time.get_or_insert(Time(fixed_now()));
        });
    }

    pub fn set_progress(&self, name: &str, processed: u32, succeeded: u32, failed: u32) {
        self.update(name, |job| {
            let annotations = job.metadata.annotations.get_or_insert_with(BTreeMap::new);
            annotations.insert(ANNOTATION_PROCESSED_ISSUES.to_string(), processed.to_string());
            annotations.insert(ANNOTATION_SUCCEEDED_ISSUES.to_string(), succeeded.to_string());
            annotations.insert(ANNOTATION_FAILED_ISSUES.to_string(), failed.to_string());
        });
    }

    pub fn complete(&self, name: &str) {
        self.update(name, mark_complete);
    }

    pub fn fail(&self, name: &str, reason: &str) {
        self.update(name, |job| mark_failed(job, reason));
    }

    fn update(&self, name: &str, change: impl FnOnce(&mut Job)) {
        let updated = {
            let mut state = lock(&self.state);
            let Some(job) = state.jobs.get_mut(name) else {
                return;
            };
            change(job);
            job.clone()
        };
        let _ = self.events.send(updated);
    }
}

fn mark_complete(job: &mut Job) {
    let completions = job.spec.as_ref().and_then(|s| s.completions).unwrap_or(1);
    let status = job.status.get_or_insert_with(K8sJobStatus::default);
    status.active = Some(0);
    status.succeeded = Some(completions);
    status.completion_time = Some(Time(fixed_now()));
    status.conditions.get_or_insert_with(Vec::new).push(JobCondition {
        type_: "Complete".to_string(),
        status: "True".to_string(),
        last_transition_time: Some(Time(fixed_now())),
        ..Default::default()
    });
}

fn mark_failed(job: &mut Job, reason: &str) {
    let status = job.status.get_or_insert_with(K8sJobStatus::default);
    status.active = Some(0);
    status.failed = Some(1);
    status.conditions.get_or_insert_with(Vec::new).push(JobCondition {
        type_: "Failed".to_string(),
        status: "True".to_string(),
        reason: Some(reason.to_string()),
        message: Some(format!("Job failed: {reason}")),
        last_transition_time: Some(Time(fixed_now())),
        ..Default::default()
    });
}

fn matches_selector(job: &Job, selector: &str) -> bool {
    let labels = job.labels();
    selector
        .split(',')
        .filter(|term| !term.is_empty())
        .all(|term| match term.split_once('=') {
            Some((key, value)) => labels.get(key).map(String::as_str) == Some(value),
            None => labels.contains_key(term),
        })
}

#[async_trait]
impl JobBackend for MemoryJobBackend {
    async fn create_job(&self, job: &Job) -> JobResult<Job> {
        let name = job.name_any();
        let created = {
            let mut state = lock(&self.state);
            if state.jobs.contains_key(&name) {
                return Err(JobError::validation(
                    name.as_str(),
                    format!("work unit '{name}' already exists"),
                ));
            }
            let outcome = state.script.pop_front();
            if let Some(ScriptedOutcome::CreateError(kind)) = outcome {
                return Err(JobError::new(kind, name.as_str(), "scripted create failure"));
            }

            let mut stored = job.clone();
            stored.metadata.creation_timestamp = Some(Time(fixed_now()));
            stored.metadata.uid = Some(format!("uid-{name}"));
            stored.status = Some(K8sJobStatus::default());
            match outcome {
                Some(ScriptedOutcome::Succeed) => mark_complete(&mut stored),
                Some(ScriptedOutcome::Fail(reason)) => mark_failed(&mut stored, &reason),
                Some(ScriptedOutcome::Running) => {
                    if let Some(status) = stored.status.as_mut() {
                        status.active = Some(1);
                    }
                }
                Some(ScriptedOutcome::CreateError(_)) | None => {}
            }

            state.created += 1;
            state.jobs.insert(name, stored.clone());
            stored
        };
        let _ = self.events.send(created.clone());
        Ok(created)
    }

    async fn get_job(&self, name: &str) -> JobResult<Option<Job>> {
        Ok(self.job(name))
    }

    async fn list_jobs(&self, label_selector: &str) -> JobResult<Vec<Job>> {
        Ok(lock(&self.state)
            .jobs
            .values()
            .filter(|job| matches_selector(job, label_selector))
            .cloned()
            .collect())
    }

    async fn delete_job(&self, name: &str) -> JobResult<()> {
        self.remove_job(name);
        Ok(())
    }

    async fn set_parallelism(&self, name: &str, parallelism: i32) -> JobResult<Job> {
        self.update(name, |job| {
            if let Some(spec) = job.spec.as_mut() {
                spec.parallelism = Some(parallelism);
            }
        });
        self.job(name).ok_or_else(|| JobError::not_found(name))
    }

    async fn list_pods(&self, job_name: &str) -> JobResult<Vec<Pod>> {
        let state = lock(&self.state);
        let pods = state
            .pods
            .iter()
            .filter(|p| p.job == job_name)
            .enumerate()
            .map(|(index, p)| Pod {
                metadata: ObjectMeta {
                    name: Some(p.name.clone()),
                    labels: Some(BTreeMap::from([("job-name".to_string(), p.job.clone())])),
                    creation_timestamp: Some(Time(
                        fixed_now() + chrono::Duration::seconds(i64::try_from(index).unwrap_or(0)),
                    )),
                    ..Default::default()
                },
                ..Default::default()
            })
            .collect();
        Ok(pods)
    }

    async fn delete_pod(&self, name: &str) -> JobResult<()> {
        lock(&self.state).pods.retain(|p| p.name != name);
        Ok(())
    }

    async fn pod_logs(&self, pod_name: &str, _container: &str) -> JobResult<String> {
        lock(&self.state)
            .pods
            .iter()
            .find(|p| p.name == pod_name)
            .map(|p| p.logs.clone())
            .ok_or_else(|| JobError::new(JobErrorKind::ClusterApi, pod_name, "pod not found"))
    }

    fn watch_job(&self, name: &str) -> BoxStream<'static, JobResult<Job>> {
        // Subscribe before reading the snapshot so no update falls in between
        let receiver = self.events.subscribe();
        let initial = self.job(name);
        let name = name.to_string();

        let updates = stream::unfold((receiver, name), |(mut receiver, name)| async move {
            loop {
                match receiver.recv().await {
                    Ok(job) if job.name_any() == name => return Some((Ok(job), (receiver, name))),
                    Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        });

        stream::iter(initial.map(Ok)).chain(updates).boxed()
    }
}

/// Store with resourceVersion-checked status writes
#[derive(Default)]
struct StoreState {
    resources: BTreeMap<String, SyncRequest>,
    version: u64,
    conflicts: usize,
    forced_conflicts: HashMap<String, usize>,
    api_servers: Vec<ApiServer>,
}

pub struct MemorySyncStore {
    state: Mutex<StoreState>,
}

impl MemorySyncStore {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(StoreState::default()),
        }
    }

    /// Store a resource as if it had just been created or replaced
    pub fn insert(&self, mut resource: SyncRequest) -> SyncRequest {
        let mut state = lock(&self.state);
        state.version += 1;
        resource.metadata.resource_version = Some(state.version.to_string());
        resource.metadata.namespace.get_or_insert_with(|| "sync".to_string());
        resource.metadata.generation.get_or_insert(1);
        let uid = format!("sr-{}", resource.name_any());
        resource.metadata.uid.get_or_insert(uid);
        state.resources.insert(resource.name_any(), resource.clone());
        resource
    }

    pub fn get_resource(&self, name: &str) -> Option<SyncRequest> {
        lock(&self.state).resources.get(name).cloned()
    }

    pub fn status(&self, name: &str) -> Option<SyncRequestStatus> {
        self.get_resource(name).and_then(|r| r.status)
    }

    pub fn delete(&self, name: &str) {
        lock(&self.state).resources.remove(name);
    }

    pub fn conflicts(&self) -> usize {
        lock(&self.state).conflicts
    }

    /// Reject the next `count` status writes to `name` as conflicts
    pub fn force_conflicts(&self, name: &str, count: usize) {
        lock(&self.state)
            .forced_conflicts
            .insert(name.to_string(), count);
    }

    pub fn add_api_server(&self, name: &str, ready: bool) {
        let mut server = ApiServer::new(
            name,
            ApiServerSpec {
                endpoint: Some(format!("http://{name}:8080")),
                replicas: Some(1),
            },
        );
        server.status = Some(ApiServerStatus {
            ready: Some(ready),
            ..Default::default()
        });
        lock(&self.state).api_servers.push(server);
    }

    pub fn set_api_server_ready(&self, name: &str, ready: bool) {
        let mut state = lock(&self.state);
        if let Some(server) = state.api_servers.iter_mut().find(|s| s.name_any() == name) {
            server.status.get_or_insert_with(ApiServerStatus::default).ready = Some(ready);
        }
    }
}

#[async_trait]
impl SyncRequestStore for MemorySyncStore {
    async fn get(&self, name: &str) -> Result<Option<SyncRequest>> {
        Ok(self.get_resource(name))
    }

    async fn list(&self) -> Result<Vec<SyncRequest>> {
        Ok(lock(&self.state).resources.values().cloned().collect())
    }

    async fn replace_status(
        &self,
        current: &SyncRequest,
        status: &SyncRequestStatus,
    ) -> Result<SyncRequest> {
        let name = current.name_any();
        let mut state = lock(&self.state);
        let state = &mut *state;

        if !state.resources.contains_key(&name) {
            return Err(Error::NotFound(name));
        }
        if let Some(remaining) = state.forced_conflicts.get_mut(&name) {
            if *remaining > 0 {
                *remaining -= 1;
                state.conflicts += 1;
                return Err(Error::Conflict(name));
            }
        }

        let next_version = state.version + 1;
        let Some(stored) = state.resources.get_mut(&name) else {
            return Err(Error::NotFound(name));
        };
        if stored.metadata.resource_version != current.metadata.resource_version {
            state.conflicts += 1;
            return Err(Error::Conflict(name));
        }

        stored.status = Some(status.clone());
        stored.metadata.resource_version = Some(next_version.to_string());
        let updated = stored.clone();
        state.version = next_version;
        Ok(updated)
    }

    async fn find_api_server(&self) -> Result<Option<ApiServer>> {
        let state = lock(&self.state);
        Ok(state
            .api_servers
            .iter()
            .find(|s| s.is_ready())
            .or_else(|| state.api_servers.first())
            .cloned())
    }
}

/// Single-issue request against a public HTTPS repository
pub fn sync_request(name: &str) -> SyncRequest {
    let spec: SyncRequestSpec = serde_json::from_value(serde_json::json!({
        "syncType": "single",
        "target": { "issueKeys": ["PROJ-1"] },
        "destination": { "repository": "https://github.com/acme/issues.git" }
    }))
    .unwrap();
    let mut resource = SyncRequest::new(name, spec);
    resource.metadata.namespace = Some("sync".to_string());
    resource
}
