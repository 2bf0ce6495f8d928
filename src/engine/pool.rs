//! Concurrent dedup-and-persist pool for search results.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::store::{ResultRecord, ResultStore, StoreError};

use super::status::RunStatus;

/// Pushes a round of search records through a pool of store workers.
///
/// Records flow through a bounded channel to `workers` tasks, each of
/// which attempts an insert-if-absent against the store. Duplicates are
/// counted on `status` and dropped. Returns the number of records that
/// were actually new.
///
/// Cancellation stops the workers between records; whatever was already
/// inserted stays in the store.
///
/// # Errors
///
/// Returns the first [`StoreError`] any worker hit. Remaining workers
/// are still drained before the error is surfaced.
pub(crate) async fn run_dedup_pool(
    records: Vec<ResultRecord>,
    store: &ResultStore,
    status: &Arc<RunStatus>,
    workers: usize,
    cancel: &CancellationToken,
) -> Result<usize, StoreError> {
    if records.is_empty() {
        return Ok(0);
    }

    let workers = workers.max(1);
    debug!(records = records.len(), workers, "dedup pool starting");

    let (tx, rx) = async_channel::bounded::<ResultRecord>(workers);

    // Feeder owns the sender; the channel closes once every record has
    // been handed out (or every worker is gone).
    let feeder = tokio::spawn(async move {
        for record in records {
            if tx.send(record).await.is_err() {
                break;
            }
        }
    });

    let mut handles = Vec::with_capacity(workers);
    for _ in 0..workers {
        let rx = rx.clone();
        let store = store.clone();
        let status = Arc::clone(status);
        let cancel = cancel.clone();
        handles.push(tokio::spawn(async move {
            let mut inserted = 0usize;
            loop {
                if cancel.is_cancelled() {
                    break;
                }
                tokio::select! {
                    () = cancel.cancelled() => break,
                    record = rx.recv() => match record {
                        Ok(record) => match store.insert_if_absent(&record).await {
                            Ok(true) => inserted += 1,
                            Ok(false) => status.record_duplicate(),
                            Err(error) => return Err(error),
                        },
                        // Channel drained and feeder gone.
                        Err(_) => break,
                    },
                }
            }
            Ok(inserted)
        }));
    }
    drop(rx);

    let mut total_inserted = 0usize;
    let mut first_error = None;
    for handle in handles {
        match handle.await {
            Ok(Ok(inserted)) => total_inserted += inserted,
            Ok(Err(error)) => {
                if first_error.is_none() {
                    first_error = Some(error);
                }
            }
            Err(error) => warn!(%error, "dedup worker panicked"),
        }
    }
    if let Err(error) = feeder.await {
        warn!(%error, "dedup feeder panicked");
    }

    if let Some(error) = first_error {
        return Err(error);
    }
    debug!(inserted = total_inserted, "dedup pool finished");
    Ok(total_inserted)
}
