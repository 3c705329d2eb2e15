pub mod reconciler;
pub mod retry;
pub mod status;
pub mod store;

pub use reconciler::{ReconcileOutcome, ReconcileSettings, SyncReconciler};
pub use retry::{retries_remaining, retry_delay, MAX_RETRY_DELAY};
pub use status::StatusWriter;
pub use store::{KubeSyncRequestStore, SyncRequestStore};
