//! Per-kind default work-unit shapes.
//!
//! Templates are plain `JobSpec`s plus the kind and default deadline. The
//! catalog hands out clones, so a caller can overlay request-specific values
//! without touching the shared defaults.

use super::errors::{JobError, JobResult};
use super::types::{JobKind, LABEL_JOB_KIND, LABEL_MANAGED_BY, MANAGED_BY_VALUE};
use k8s_openapi::api::batch::v1::JobSpec;
use k8s_openapi::api::core::v1::{Container, PodSpec, PodTemplateSpec, ResourceRequirements};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use std::collections::{BTreeMap, HashMap};
use tracing::debug;

/// Name of the container that runs the sync pipeline
pub const WORKER_CONTAINER_NAME: &str = "sync-worker";

const SINGLE_TIMEOUT_SECONDS: i64 = 600;
const BATCH_TIMEOUT_SECONDS: i64 = 1800;
const DEFAULT_BACKOFF_LIMIT: i32 = 3;

/// A default work-unit shape for one [`JobKind`]
#[derive(Debug, Clone, PartialEq)]
pub struct JobTemplate {
    pub kind: JobKind,
    pub timeout_seconds: i64,
    pub spec: JobSpec,
}

impl JobTemplate {
    /// The worker container, if the template has one
    #[must_use]
    pub fn worker(&self) -> Option<&Container> {
        self.spec
            .template
            .spec
            .as_ref()
            .and_then(|pod| pod.containers.first())
    }

    pub fn worker_mut(&mut self) -> Option<&mut Container> {
        self.spec
            .template
            .spec
            .as_mut()
            .and_then(|pod| pod.containers.first_mut())
    }
}

/// Read-mostly catalog of templates keyed by kind
#[derive(Debug, Clone)]
pub struct TemplateCatalog {
    templates: HashMap<JobKind, JobTemplate>,
}

impl TemplateCatalog {
    /// Catalog with the built-in `single`, `batch` and `query` templates
    #[must_use]
    pub fn new(image: &str) -> Self {
        let single = JobTemplate {
            kind: JobKind::Single,
            timeout_seconds: SINGLE_TIMEOUT_SECONDS,
            spec: build_spec(
                JobKind::Single,
                image,
                1,
                1,
                resources("100m", "500m", "128Mi", "512Mi"),
                "Never",
            ),
        };

        let batch = JobTemplate {
            kind: JobKind::Batch,
            timeout_seconds: BATCH_TIMEOUT_SECONDS,
            spec: build_spec(
                JobKind::Batch,
                image,
                2,
                1,
                resources("200m", "1000m", "256Mi", "1Gi"),
                "OnFailure",
            ),
        };

        // Query work units share the batch shape under their own kind label
        let mut query = batch.clone();
        query.kind = JobKind::Query;
        set_kind_label(&mut query.spec, JobKind::Query);

        let templates = [single, batch, query]
            .into_iter()
            .map(|t| (t.kind, t))
            .collect();

        Self { templates }
    }

    /// Deep copy of the template for `kind`
    pub fn get_template(&self, kind: JobKind) -> JobResult<JobTemplate> {
        self.templates.get(&kind).cloned().ok_or_else(|| {
            JobError::template("", format!("no template registered for job kind '{kind}'"))
        })
    }

    /// Replace the template for its kind after validating it
    pub fn register(&mut self, template: JobTemplate) -> JobResult<()> {
        Self::validate_template(&template)?;
        debug!(kind = %template.kind, "Registered job template");
        self.templates.insert(template.kind, template);
        Ok(())
    }

    pub fn validate_template(template: &JobTemplate) -> JobResult<()> {
        let kind = template.kind;
        let pod = template.spec.template.spec.as_ref().ok_or_else(|| {
            JobError::template("", format!("template '{kind}' has no pod spec"))
        })?;

        let worker = pod.containers.first().ok_or_else(|| {
            JobError::template("", format!("template '{kind}' has no worker container"))
        })?;

        if worker.name.trim().is_empty() {
            return Err(JobError::template(
                "",
                format!("template '{kind}' worker container has no name"),
            ));
        }

        if worker.image.as_deref().map_or(true, |image| image.trim().is_empty()) {
            return Err(JobError::template(
                "",
                format!("template '{kind}' worker container has no image"),
            ));
        }

        match pod.restart_policy.as_deref() {
            Some("Never" | "OnFailure") => Ok(()),
            other => Err(JobError::template(
                "",
                format!(
                    "template '{kind}' restart policy must be Never or OnFailure, got {}",
                    other.unwrap_or("none")
                ),
            )),
        }
    }
}

fn resources(cpu_request: &str, cpu_limit: &str, mem_request: &str, mem_limit: &str) -> ResourceRequirements {
    let pair = |cpu: &str, memory: &str| {
        BTreeMap::from([
            ("cpu".to_string(), Quantity(cpu.to_string())),
            ("memory".to_string(), Quantity(memory.to_string())),
        ])
    };
    ResourceRequirements {
        requests: Some(pair(cpu_request, mem_request)),
        limits: Some(pair(cpu_limit, mem_limit)),
        ..Default::default()
    }
}

fn build_spec(
    kind: JobKind,
    image: &str,
    parallelism: i32,
    completions: i32,
    resources: ResourceRequirements,
    restart_policy: &str,
) -> JobSpec {
    let timeout = match kind {
        JobKind::Single => SINGLE_TIMEOUT_SECONDS,
        JobKind::Batch | JobKind::Query => BATCH_TIMEOUT_SECONDS,
    };

    let mut spec = JobSpec {
        parallelism: Some(parallelism),
        completions: Some(completions),
        backoff_limit: Some(DEFAULT_BACKOFF_LIMIT),
        active_deadline_seconds: Some(timeout),
        template: PodTemplateSpec {
            metadata: Some(ObjectMeta::default()),
            spec: Some(PodSpec {
                restart_policy: Some(restart_policy.to_string()),
                containers: vec![Container {
                    name: WORKER_CONTAINER_NAME.to_string(),
                    image: Some(image.to_string()),
                    resources: Some(resources),
                    ..Default::default()
                }],
                ..Default::default()
            }),
        },
        ..Default::default()
    };
    set_kind_label(&mut spec, kind);
    spec
}

fn set_kind_label(spec: &mut JobSpec, kind: JobKind) {
    let metadata = spec.template.metadata.get_or_insert_with(ObjectMeta::default);
    let labels = metadata.labels.get_or_insert_with(BTreeMap::new);
    labels.insert(LABEL_MANAGED_BY.to_string(), MANAGED_BY_VALUE.to_string());
    labels.insert(LABEL_JOB_KIND.to_string(), kind.to_string());
}
