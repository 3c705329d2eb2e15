//! `ApiServer` Custom Resource Definition
//!
//! The API endpoint a `SyncRequest` waits for before it can proceed. It is
//! reconciled by a separate controller; this crate only reads it.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Phase value the owning controller writes once the endpoint is serving
pub const API_SERVER_READY_PHASE: &str = "Ready";

/// `ApiServer` CRD describing the sync API endpoint deployed in a namespace
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, JsonSchema)]
#[kube(group = "sync.platform", version = "v1", kind = "ApiServer")]
#[kube(namespaced)]
#[kube(status = "ApiServerStatus")]
#[kube(printcolumn = r#"{"name":"Phase","type":"string","jsonPath":".status.phase"}"#)]
#[kube(printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#)]
#[serde(rename_all = "camelCase")]
pub struct ApiServerSpec {
    /// Service endpoint exposed by the API server
    #[serde(default)]
    pub endpoint: Option<String>,

    /// Desired replica count
    #[serde(default)]
    pub replicas: Option<i32>,
}

/// Status of the `ApiServer`, written by its own controller
#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ApiServerStatus {
    #[serde(default)]
    pub phase: Option<String>,

    #[serde(default)]
    pub ready: Option<bool>,

    #[serde(default)]
    pub message: Option<String>,
}

impl ApiServer {
    /// An endpoint counts as ready when its controller reports either the
    /// `ready` flag or the `Ready` phase.
    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.status.as_ref().is_some_and(|status| {
            status.ready == Some(true) || status.phase.as_deref() == Some(API_SERVER_READY_PHASE)
        })
    }
}
