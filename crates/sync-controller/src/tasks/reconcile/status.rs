//! Read-modify-write of `SyncRequest` status under optimistic concurrency.

use super::store::SyncRequestStore;
use crate::crds::{SyncRequest, SyncRequestStatus};
use crate::tasks::types::{Error, Result};
use kube::ResourceExt;
use std::sync::Arc;
use tracing::debug;

/// Applies status transitions, re-reading and re-applying on conflict.
///
/// A transition receives the latest stored resource and a copy of its status
/// and returns `false` when it no longer applies (the resource moved on, or
/// another instance holds it). Nothing is written in that case.
pub struct StatusWriter {
    store: Arc<dyn SyncRequestStore>,
    max_attempts: u32,
}

impl StatusWriter {
    #[must_use]
    pub fn new(store: Arc<dyn SyncRequestStore>, max_attempts: u32) -> Self {
        Self {
            store,
            max_attempts: max_attempts.max(1),
        }
    }

    /// `Ok(Some(updated))` when the transition was written, `Ok(None)` when it
    /// no longer applied or the resource is gone.
    pub async fn apply<F>(&self, current: SyncRequest, mut transition: F) -> Result<Option<SyncRequest>>
    where
        F: FnMut(&SyncRequest, &mut SyncRequestStatus) -> bool + Send,
    {
        let name = current.name_any();
        let mut snapshot = current;

        for attempt in 1..=self.max_attempts {
            let mut status = snapshot.status.clone().unwrap_or_default();
            if !transition(&snapshot, &mut status) {
                return Ok(None);
            }
            if snapshot.status.as_ref() == Some(&status) {
                return Ok(Some(snapshot));
            }

            match self.store.replace_status(&snapshot, &status).await {
                Ok(updated) => return Ok(Some(updated)),
                Err(Error::Conflict(_)) => {
                    debug!(sync_request = %name, attempt, "Status conflict, re-reading");
                    match self.store.get(&name).await? {
                        Some(latest) => snapshot = latest,
                        None => return Ok(None),
                    }
                }
                Err(Error::NotFound(_)) => return Ok(None),
                Err(e) => return Err(e),
            }
        }

        Err(Error::ConflictRetriesExhausted {
            name,
            attempts: self.max_attempts,
        })
    }
}
