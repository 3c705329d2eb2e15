use crate::clock::SystemClock;
use crate::crds::SyncRequest;
use crate::jobs::{JobScheduler, KubeJobBackend, TemplateCatalog};
use crate::sync::SyncJobOrchestrator;
use futures::StreamExt;
use k8s_openapi::api::batch::v1::Job;
use kube::runtime::controller::{Action, Controller};
use kube::runtime::finalizer::{finalizer, Event as FinalizerEvent};
use kube::runtime::watcher::Config;
use kube::{Api, Client, ResourceExt};
use std::sync::Arc;
use tracing::{debug, error, info, instrument, warn, Instrument};

pub mod config;
pub mod reconcile;
pub mod types;

// Re-export commonly used items
pub use config::ControllerConfig;
pub use reconcile::{ReconcileOutcome, ReconcileSettings, SyncReconciler};
pub use types::{Context, Error, Result, SYNC_FINALIZER_NAME};

/// Main entry point for the `SyncRequest` controller
#[instrument(skip(client, config), fields(namespace = %namespace, identity = %identity))]
pub async fn run_sync_controller(
    client: Client,
    namespace: String,
    config: Arc<ControllerConfig>,
    identity: String,
) -> Result<()> {
    info!("Starting SyncRequest controller in namespace: {}", namespace);

    config
        .validate()
        .map_err(|e| Error::ConfigError(e.to_string()))?;
    let settings = config
        .reconcile_settings(&identity)
        .map_err(|e| Error::ConfigError(e.to_string()))?;

    let scheduler_settings = config.scheduler_settings();
    let catalog = TemplateCatalog::new(&scheduler_settings.image);
    let scheduler = JobScheduler::new(
        Arc::new(KubeJobBackend::new(client.clone(), &namespace)),
        catalog,
        Arc::new(SystemClock),
        scheduler_settings,
    );
    let orchestrator = Arc::new(SyncJobOrchestrator::new(Arc::new(scheduler)));
    let store = Arc::new(reconcile::KubeSyncRequestStore::new(client.clone(), &namespace));
    let reconciler = Arc::new(SyncReconciler::new(store, orchestrator, settings));

    // Startup visibility: resources left unfinished by a previous run
    match reconciler.unfinished().await {
        Ok(unfinished) => {
            info!(
                "Controller startup: found {} unfinished SyncRequest(s) in namespace {}",
                unfinished.len(),
                namespace
            );
            for resource in unfinished {
                let status = resource.status.clone().unwrap_or_default();
                info!(
                    "Existing SyncRequest: name={}, phase={}, jobId={}, claimedBy={}",
                    resource.name_any(),
                    status.phase.map_or_else(|| "(new)".to_string(), |p| p.to_string()),
                    status.job_id.as_deref().unwrap_or("(none)"),
                    status.claimed_by.as_deref().unwrap_or("(none)"),
                );
            }
        }
        Err(e) => error!("Failed to list SyncRequests at startup: {}", e),
    }

    let context = Arc::new(Context {
        client: client.clone(),
        namespace: namespace.clone(),
        config,
        reconciler,
    });

    let requests: Api<SyncRequest> = Api::namespaced(client.clone(), &namespace);
    let jobs: Api<Job> = Api::namespaced(client, &namespace);
    let watcher_config = Config::default().any_semantic();

    Controller::new(requests, watcher_config.clone())
        .owns(jobs, watcher_config)
        .run(reconcile_sync_request, error_policy, context)
        .for_each(|reconciliation_result| {
            let span = tracing::info_span!("sync_reconciliation_result");
            async move {
                match reconciliation_result {
                    Ok((object, action)) => {
                        debug!(resource = %object.name, ?action, "SyncRequest reconciliation successful");
                    }
                    Err(reconciliation_err) => {
                        warn!(error = ?reconciliation_err, "SyncRequest reconciliation error");
                    }
                }
            }
            .instrument(span)
        })
        .await;

    info!("SyncRequest controller shutting down");
    Ok(())
}

#[instrument(skip(ctx), fields(sync_request = %sync_request.name_any(), namespace = %ctx.namespace))]
async fn reconcile_sync_request(sync_request: Arc<SyncRequest>, ctx: Arc<Context>) -> Result<Action> {
    let requests: Api<SyncRequest> = Api::namespaced(ctx.client.clone(), &ctx.namespace);

    finalizer(&requests, SYNC_FINALIZER_NAME, sync_request, |event| async {
        match event {
            FinalizerEvent::Apply(resource) => apply_sync_request(&resource, &ctx).await,
            FinalizerEvent::Cleanup(resource) => cleanup_sync_request(&resource, &ctx).await,
        }
    })
    .await
    .map_err(|e| match e {
        kube::runtime::finalizer::Error::ApplyFailed(err)
        | kube::runtime::finalizer::Error::CleanupFailed(err) => err,
        kube::runtime::finalizer::Error::AddFinalizer(e)
        | kube::runtime::finalizer::Error::RemoveFinalizer(e) => Error::KubeError(e),
        kube::runtime::finalizer::Error::UnnamedObject => Error::MissingObjectKey,
        kube::runtime::finalizer::Error::InvalidFinalizer => {
            Error::ConfigError("Invalid finalizer name".to_string())
        }
    })
}

async fn apply_sync_request(sync_request: &SyncRequest, ctx: &Context) -> Result<Action> {
    let outcome = ctx.reconciler.reconcile(&sync_request.name_any()).await?;
    Ok(Action::from(outcome))
}

async fn cleanup_sync_request(sync_request: &SyncRequest, ctx: &Context) -> Result<Action> {
    ctx.reconciler.cleanup(sync_request).await?;
    info!("SyncRequest cleanup finished");
    Ok(Action::await_change())
}

/// Transient failures are requeued; anything else waits for the resource to change
fn error_policy(sync_request: Arc<SyncRequest>, err: &Error, ctx: Arc<Context>) -> Action {
    if err.is_retryable() {
        let delay = ctx.reconciler.settings().error_requeue;
        warn!(
            error = %err,
            sync_request = %sync_request.name_any(),
            ?delay,
            "SyncRequest reconciliation failed, requeueing"
        );
        Action::requeue(delay)
    } else {
        error!(
            error = %err,
            sync_request = %sync_request.name_any(),
            "SyncRequest reconciliation failed"
        );
        Action::await_change()
    }
}
