//! Sync Controller Configuration
//!
//! Loaded from the mounted config file; every section has defaults so a
//! partial file is enough.

use super::reconcile::ReconcileSettings;
use crate::clock::{parse_duration, Clock};
use crate::crds::RetryPolicy;
use crate::jobs::SchedulerSettings;
use crate::sync::SyncRequestConverter;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Default location of the mounted configuration file
pub const DEFAULT_CONFIG_PATH: &str = "/config/config.yaml";

/// Main controller configuration structure
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ControllerConfig {
    /// Work-unit configuration
    #[serde(default)]
    pub job: JobSettings,

    /// Credential secrets injected into work units
    #[serde(default)]
    pub secrets: SecretsConfig,

    /// Control loop timing
    #[serde(default)]
    pub reconcile: ReconcileConfig,

    /// Retry policy stamped onto converted requests that omit one
    #[serde(default)]
    pub retry: RetryPolicy,
}

/// Container image configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ImageConfig {
    /// Image repository (e.g., "ghcr.io/5dlabs/issue-sync")
    pub repository: String,

    /// Image tag (e.g., "latest", "v1.4.0")
    pub tag: String,
}

impl ImageConfig {
    /// Returns `true` when both repository and tag are populated
    #[must_use]
    pub fn is_configured(&self) -> bool {
        !self.repository.trim().is_empty() && !self.tag.trim().is_empty()
    }

    #[must_use]
    pub fn reference(&self) -> String {
        format!("{}:{}", self.repository.trim(), self.tag.trim())
    }
}

impl Default for ImageConfig {
    fn default() -> Self {
        Self {
            repository: "ghcr.io/5dlabs/issue-sync".to_string(),
            tag: "latest".to_string(),
        }
    }
}

/// Work-unit configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct JobSettings {
    /// Sync worker image
    #[serde(default)]
    pub image: ImageConfig,

    #[serde(default, rename = "imagePullPolicy")]
    pub image_pull_policy: Option<String>,

    /// Image pull secrets for private registries
    #[serde(default, rename = "imagePullSecrets")]
    pub image_pull_secrets: Vec<String>,

    /// ServiceAccount the sync worker runs as
    #[serde(default, rename = "serviceAccountName")]
    pub service_account_name: Option<String>,

    /// How long finished work units are kept
    #[serde(
        default = "default_ttl_seconds",
        rename = "ttlSecondsAfterFinished"
    )]
    pub ttl_seconds_after_finished: Option<i32>,
}

fn default_ttl_seconds() -> Option<i32> {
    Some(3600)
}

impl Default for JobSettings {
    fn default() -> Self {
        Self {
            image: ImageConfig::default(),
            image_pull_policy: None,
            image_pull_secrets: Vec::new(),
            service_account_name: None,
            ttl_seconds_after_finished: default_ttl_seconds(),
        }
    }
}

/// Secrets configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SecretsConfig {
    /// Secret holding the issue-tracker credentials
    #[serde(default = "default_tracker_secret", rename = "issueTrackerSecretName")]
    pub issue_tracker_secret_name: String,

    /// Secret holding the Git credentials
    #[serde(default = "default_git_secret", rename = "gitSecretName")]
    pub git_secret_name: String,

    /// Extra secrets mounted as environment
    #[serde(default, rename = "additionalSecrets")]
    pub additional_secrets: Vec<String>,
}

fn default_tracker_secret() -> String {
    "issue-tracker-credentials".to_string()
}

fn default_git_secret() -> String {
    "git-credentials".to_string()
}

impl Default for SecretsConfig {
    fn default() -> Self {
        Self {
            issue_tracker_secret_name: default_tracker_secret(),
            git_secret_name: default_git_secret(),
            additional_secrets: Vec::new(),
        }
    }
}

/// Control loop timing, as duration strings
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ReconcileConfig {
    /// How often running work units are polled
    #[serde(default = "default_poll_interval", rename = "pollInterval")]
    pub poll_interval: String,

    /// Requeue delay while waiting for the ApiServer
    #[serde(default = "default_dependency_requeue", rename = "dependencyRequeue")]
    pub dependency_requeue: String,

    /// Requeue delay after an unexpected reconcile error
    #[serde(default = "default_error_requeue", rename = "errorRequeue")]
    pub error_requeue: String,

    /// A claim older than this may be taken over by another instance
    #[serde(default = "default_claim_lease", rename = "claimLease")]
    pub claim_lease: String,

    /// Attempts for one status write under conflicts
    #[serde(default = "default_status_attempts", rename = "statusUpdateAttempts")]
    pub status_update_attempts: u32,
}

fn default_poll_interval() -> String {
    "10s".to_string()
}

fn default_dependency_requeue() -> String {
    "30s".to_string()
}

fn default_error_requeue() -> String {
    "60s".to_string()
}

fn default_claim_lease() -> String {
    "2m".to_string()
}

fn default_status_attempts() -> u32 {
    5
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            poll_interval: default_poll_interval(),
            dependency_requeue: default_dependency_requeue(),
            error_requeue: default_error_requeue(),
            claim_lease: default_claim_lease(),
            status_update_attempts: default_status_attempts(),
        }
    }
}

impl ControllerConfig {
    /// Validate that the configuration is usable
    pub fn validate(&self) -> Result<(), anyhow::Error> {
        if !self.job.image.is_configured() {
            return Err(anyhow::anyhow!(
                "Sync worker image is not configured. Provide job.image.repository and job.image.tag."
            ));
        }

        for (field, value) in [
            ("reconcile.pollInterval", &self.reconcile.poll_interval),
            ("reconcile.dependencyRequeue", &self.reconcile.dependency_requeue),
            ("reconcile.errorRequeue", &self.reconcile.error_requeue),
            ("reconcile.claimLease", &self.reconcile.claim_lease),
            ("retry.initialDelay", &self.retry.initial_delay),
        ] {
            parse_duration(value).map_err(|e| anyhow::anyhow!("{field}: {e}"))?;
        }

        if self.reconcile.status_update_attempts == 0 {
            return Err(anyhow::anyhow!(
                "reconcile.statusUpdateAttempts must be at least 1"
            ));
        }
        if !self.retry.backoff_multiplier.is_finite() || self.retry.backoff_multiplier < 1.0 {
            return Err(anyhow::anyhow!(
                "retry.backoffMultiplier must be at least 1.0"
            ));
        }
        Ok(())
    }

    /// Load configuration from mounted `ConfigMap` file
    pub fn from_mounted_file(config_path: &str) -> Result<Self, anyhow::Error> {
        let config_str = std::fs::read_to_string(config_path)
            .map_err(|e| anyhow::anyhow!("Failed to read config file {config_path}: {e}"))?;

        serde_yaml::from_str(&config_str)
            .map_err(|e| anyhow::anyhow!("Failed to parse config YAML: {e}"))
    }

    /// Settings for the work-unit scheduler
    #[must_use]
    pub fn scheduler_settings(&self) -> SchedulerSettings {
        let mut secret_env_from = vec![
            self.secrets.issue_tracker_secret_name.clone(),
            self.secrets.git_secret_name.clone(),
        ];
        secret_env_from.extend(self.secrets.additional_secrets.iter().cloned());
        secret_env_from.retain(|s| !s.trim().is_empty());

        SchedulerSettings {
            image: self.job.image.reference(),
            image_pull_policy: self.job.image_pull_policy.clone(),
            image_pull_secrets: self.job.image_pull_secrets.clone(),
            service_account_name: self.job.service_account_name.clone(),
            secret_env_from,
            ttl_seconds_after_finished: self.job.ttl_seconds_after_finished,
        }
    }

    /// Converter for intents arriving through the transport layer
    #[must_use]
    pub fn converter(&self, clock: Arc<dyn Clock>) -> SyncRequestConverter {
        SyncRequestConverter::new(clock, self.retry.clone())
    }

    /// Settings for the control loop; call [`Self::validate`] first
    pub fn reconcile_settings(&self, identity: &str) -> Result<ReconcileSettings, anyhow::Error> {
        let reconcile = &self.reconcile;
        Ok(ReconcileSettings {
            identity: identity.to_string(),
            poll_interval: parse_duration(&reconcile.poll_interval)?,
            dependency_requeue: parse_duration(&reconcile.dependency_requeue)?,
            error_requeue: parse_duration(&reconcile.error_requeue)?,
            claim_lease: parse_duration(&reconcile.claim_lease)?,
            status_update_attempts: reconcile.status_update_attempts,
        })
    }
}
