//! Persistence of `SyncRequest` status with optimistic concurrency.

use crate::crds::{ApiServer, SyncRequest, SyncRequestStatus};
use crate::tasks::types::{Error, Result};
use async_trait::async_trait;
use kube::api::{ListParams, Patch, PatchParams};
use kube::{Api, Client, ResourceExt};
use serde_json::json;
use tracing::debug;

/// Read and write access to `SyncRequest` resources
#[async_trait]
pub trait SyncRequestStore: Send + Sync {
    /// `Ok(None)` once the resource is gone
    async fn get(&self, name: &str) -> Result<Option<SyncRequest>>;

    async fn list(&self) -> Result<Vec<SyncRequest>>;

    /// Replace the status of `current`. Fails with [`Error::Conflict`] when
    /// the stored resource moved past `current`'s resourceVersion and with
    /// [`Error::NotFound`] when it no longer exists.
    async fn replace_status(
        &self,
        current: &SyncRequest,
        status: &SyncRequestStatus,
    ) -> Result<SyncRequest>;

    /// The `ApiServer` of the namespace, preferring a ready one
    async fn find_api_server(&self) -> Result<Option<ApiServer>>;
}

/// [`SyncRequestStore`] backed by the Kubernetes API
#[derive(Clone)]
pub struct KubeSyncRequestStore {
    requests: Api<SyncRequest>,
    api_servers: Api<ApiServer>,
}

impl KubeSyncRequestStore {
    #[must_use]
    pub fn new(client: Client, namespace: &str) -> Self {
        Self {
            requests: Api::namespaced(client.clone(), namespace),
            api_servers: Api::namespaced(client, namespace),
        }
    }
}

#[async_trait]
impl SyncRequestStore for KubeSyncRequestStore {
    async fn get(&self, name: &str) -> Result<Option<SyncRequest>> {
        Ok(self.requests.get_opt(name).await?)
    }

    async fn list(&self) -> Result<Vec<SyncRequest>> {
        Ok(self.requests.list(&ListParams::default()).await?.items)
    }

    async fn replace_status(
        &self,
        current: &SyncRequest,
        status: &SyncRequestStatus,
    ) -> Result<SyncRequest> {
        let name = current.name_any();
        // The resourceVersion in the body turns the merge into a conditional write
        let patch = json!({
            "metadata": { "resourceVersion": current.resource_version() },
            "status": status,
        });

        match self
            .requests
            .patch_status(&name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
        {
            Ok(updated) => Ok(updated),
            Err(kube::Error::Api(response)) if response.code == 409 => {
                debug!(sync_request = %name, "Status write lost a resourceVersion race");
                Err(Error::Conflict(name))
            }
            Err(kube::Error::Api(response)) if response.code == 404 => Err(Error::NotFound(name)),
            Err(e) => Err(e.into()),
        }
    }

    async fn find_api_server(&self) -> Result<Option<ApiServer>> {
        let servers = self.api_servers.list(&ListParams::default()).await?.items;
        let ready = servers.iter().position(ApiServer::is_ready);
        Ok(match ready {
            Some(index) => servers.into_iter().nth(index),
            None => servers.into_iter().next(),
        })
    }
}
