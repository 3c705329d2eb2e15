//! Work-unit scheduling: error taxonomy, identifiers, templates and the
//! scheduler that turns a [`JobConfig`] into a Kubernetes Job.

pub mod backend;
pub mod errors;
pub mod naming;
pub mod scheduler;
pub mod templates;
pub mod types;

pub use backend::{JobBackend, KubeJobBackend};
pub use errors::{ErrorSummary, JobError, JobErrorKind, JobResult, Severity};
pub use naming::{JobNaming, NamingError};
pub use scheduler::{
    failure_from_report, monitor_from_report, report_from_job, JobScheduler, JobWatch,
    SchedulerSettings,
};
pub use templates::{JobTemplate, TemplateCatalog};
pub use types::{
    JobConfig, JobFilter, JobKind, JobMonitor, JobReport, JobStatus, QueueStatus,
    ResourceOverrides,
};
