//! Cluster access for work units.
//!
//! The scheduler only talks to the cluster through [`JobBackend`], so tests can
//! swap in an in-memory implementation.

use super::errors::{JobError, JobErrorKind, JobResult};
use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::{StreamExt, TryStreamExt};
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::Pod;
use kube::api::{Api, DeleteParams, ListParams, LogParams, Patch, PatchParams, PostParams, PropagationPolicy};
use kube::runtime::{watcher, WatchStreamExt};
use kube::Client;
use serde_json::json;
use tracing::debug;

/// Operations the scheduler needs from the cluster. Errors are already
/// classified into [`JobError`].
#[async_trait]
pub trait JobBackend: Send + Sync {
    async fn create_job(&self, job: &Job) -> JobResult<Job>;

    /// `Ok(None)` when the work unit does not exist
    async fn get_job(&self, name: &str) -> JobResult<Option<Job>>;

    async fn list_jobs(&self, label_selector: &str) -> JobResult<Vec<Job>>;

    /// Delete with background propagation. Deleting a missing job succeeds.
    async fn delete_job(&self, name: &str) -> JobResult<()>;

    async fn set_parallelism(&self, name: &str, parallelism: i32) -> JobResult<Job>;

    /// Pods created for the named work unit
    async fn list_pods(&self, job_name: &str) -> JobResult<Vec<Pod>>;

    async fn delete_pod(&self, name: &str) -> JobResult<()>;

    async fn pod_logs(&self, pod_name: &str, container: &str) -> JobResult<String>;

    /// Stream of observed states for one work unit
    fn watch_job(&self, name: &str) -> BoxStream<'static, JobResult<Job>>;
}

/// [`JobBackend`] backed by the Kubernetes API in a single namespace
#[derive(Clone)]
pub struct KubeJobBackend {
    jobs: Api<Job>,
    pods: Api<Pod>,
}

impl KubeJobBackend {
    #[must_use]
    pub fn new(client: Client, namespace: &str) -> Self {
        Self {
            jobs: Api::namespaced(client.clone(), namespace),
            pods: Api::namespaced(client, namespace),
        }
    }
}

fn is_not_found(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(response) if response.code == 404)
}

#[async_trait]
impl JobBackend for KubeJobBackend {
    async fn create_job(&self, job: &Job) -> JobResult<Job> {
        let name = job.metadata.name.clone().unwrap_or_default();
        self.jobs
            .create(&PostParams::default(), job)
            .await
            .map_err(|e| match &e {
                kube::Error::Api(response) if response.code == 409 => JobError::new(
                    JobErrorKind::Validation,
                    name.as_str(),
                    format!("work unit '{name}' already exists"),
                ),
                _ => JobError::from_kube(name.as_str(), &e),
            })
    }

    async fn get_job(&self, name: &str) -> JobResult<Option<Job>> {
        self.jobs
            .get_opt(name)
            .await
            .map_err(|e| JobError::from_kube(name, &e))
    }

    async fn list_jobs(&self, label_selector: &str) -> JobResult<Vec<Job>> {
        let params = ListParams::default().labels(label_selector);
        let list = self
            .jobs
            .list(&params)
            .await
            .map_err(|e| JobError::from_kube("", &e))?;
        Ok(list.items)
    }

    async fn delete_job(&self, name: &str) -> JobResult<()> {
        let params = DeleteParams {
            propagation_policy: Some(PropagationPolicy::Background),
            ..Default::default()
        };
        match self.jobs.delete(name, &params).await {
            Ok(_) => Ok(()),
            Err(e) if is_not_found(&e) => {
                debug!(job = %name, "Job already gone");
                Ok(())
            }
            Err(e) => Err(JobError::from_kube(name, &e)),
        }
    }

    async fn set_parallelism(&self, name: &str, parallelism: i32) -> JobResult<Job> {
        let patch = json!({ "spec": { "parallelism": parallelism } });
        self.jobs
            .patch(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .map_err(|e| JobError::from_kube(name, &e))
    }

    async fn list_pods(&self, job_name: &str) -> JobResult<Vec<Pod>> {
        let params = ListParams::default().labels(&format!("job-name={job_name}"));
        let list = self
            .pods
            .list(&params)
            .await
            .map_err(|e| JobError::from_kube(job_name, &e))?;
        Ok(list.items)
    }

    async fn delete_pod(&self, name: &str) -> JobResult<()> {
        match self.pods.delete(name, &DeleteParams::default()).await {
            Ok(_) => Ok(()),
            Err(e) if is_not_found(&e) => Ok(()),
            Err(e) => Err(JobError::from_kube(name, &e)),
        }
    }

    async fn pod_logs(&self, pod_name: &str, container: &str) -> JobResult<String> {
        let params = LogParams {
            container: Some(container.to_string()),
            ..Default::default()
        };
        self.pods
            .logs(pod_name, &params)
            .await
            .map_err(|e| JobError::from_kube(pod_name, &e))
    }

    fn watch_job(&self, name: &str) -> BoxStream<'static, JobResult<Job>> {
        let job_id = name.to_string();
        let config = watcher::Config::default().fields(&format!("metadata.name={name}"));
        watcher(self.jobs.clone(), config)
            .default_backoff()
            .applied_objects()
            .map_err(move |e| JobError::new(JobErrorKind::ClusterApi, job_id.as_str(), e.to_string()))
            .boxed()
    }
}
