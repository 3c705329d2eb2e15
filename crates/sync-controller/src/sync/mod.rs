//! Sync intents: transport conversion, orchestration and the pipeline boundary.

pub mod convert;
pub mod orchestrator;
pub mod pipeline;

pub use convert::{
    validate_conversion, ConversionError, ConvertedRequest, IntentOptions, SyncIntent,
    SyncRequestConverter,
};
pub use orchestrator::{
    attempt_job_id, is_owned_by, owner_reference, BatchSyncRequest, JqlSyncRequest,
    SingleIssueSyncRequest, SyncJobOrchestrator, SyncJobRequest, SyncRequestOptions,
};
pub use pipeline::{IncrementalOptions, SyncOutcome, SyncPipeline};
