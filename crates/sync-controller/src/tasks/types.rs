use super::config::ControllerConfig;
use super::reconcile::SyncReconciler;
use crate::jobs::JobError;
use crate::sync::ConversionError;
use kube::Client;
use std::sync::Arc;
use thiserror::Error;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Kubernetes API error: {0}")]
    KubeError(#[from] kube::Error),

    #[error(transparent)]
    Job(#[from] JobError),

    #[error(transparent)]
    Conversion(#[from] ConversionError),

    /// The write was based on a stale resourceVersion
    #[error("status update conflict on SyncRequest '{0}'")]
    Conflict(String),

    #[error("status update for SyncRequest '{name}' still conflicting after {attempts} attempts")]
    ConflictRetriesExhausted { name: String, attempts: u32 },

    #[error("SyncRequest '{0}' not found")]
    NotFound(String),

    #[error("Missing object key")]
    MissingObjectKey,

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),
}

impl Error {
    /// Whether requeueing the reconcile can make progress
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::KubeError(_) | Error::Conflict(_) | Error::ConflictRetriesExhausted { .. } => true,
            Error::Job(e) => e.is_retryable(),
            Error::Conversion(_)
            | Error::NotFound(_)
            | Error::MissingObjectKey
            | Error::ConfigError(_)
            | Error::SerializationError(_) => false,
        }
    }
}

// Finalizer names
pub const SYNC_FINALIZER_NAME: &str = "syncrequests.sync.platform/finalizer";

/// Shared state handed to every reconciliation
pub struct Context {
    pub client: Client,
    pub namespace: String,
    pub config: Arc<ControllerConfig>,
    pub reconciler: Arc<SyncReconciler>,
}
