//! Periodic cleanup of finished jobs.
//!
//! Keeps the `keep` most recently finished jobs and deletes older terminal
//! ones (their rows cascade). Pending and processing jobs are never
//! touched, so the sweep runs independently of the dispatcher.

use std::sync::Arc;
use std::time::Duration;

use bulkedit_pipeline::JobStore;
use tokio_util::sync::CancellationToken;

/// Run the retention loop until `cancel` is triggered.
///
/// The first sweep runs immediately, then every `interval`.
pub async fn run(store: Arc<dyn JobStore>, keep: i64, interval: Duration, cancel: CancellationToken) {
    tracing::info!(keep, interval_secs = interval.as_secs(), "Job retention started");

    let mut ticker = tokio::time::interval(interval);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                tracing::info!("Job retention stopping");
                break;
            }
            _ = ticker.tick() => {
                match store.purge_terminal_beyond(keep).await {
                    Ok(0) => tracing::debug!("Job retention: nothing to purge"),
                    Ok(deleted) => tracing::info!(deleted, "Job retention: purged finished jobs"),
                    Err(e) => tracing::error!(error = %e, "Job retention: sweep failed"),
                }
            }
        }
    }
}
