//! Artifact bundle handling: download, type gate, extraction, and
//! reconciliation of extracted files against the result store.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::archive::{self, ArchiveError, INVENTORY_FILE_NAME};
use crate::fsutil;
use crate::search::{SearchClient, SearchError};
use crate::store::{ResultStore, StoreError};

use super::status::RunStatus;

/// How often the in-flight byte counter is sampled during a download.
const BYTE_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Errors raised while fetching and reconciling a bundle.
#[derive(Debug, Error)]
pub enum FetchError {
    /// The bundle export request failed.
    #[error("bundle download failed: {0}")]
    Download(#[from] SearchError),

    /// The downloaded file is not a zip archive.
    #[error("downloaded bundle {path} is not a zip archive (detected {detected})")]
    InvalidBundleType {
        /// The rejected bundle file.
        path: PathBuf,
        /// The content type sniffed from its first bytes.
        detected: String,
    },

    /// The bundle could not be extracted.
    #[error("bundle extraction failed: {0}")]
    Extract(#[from] ArchiveError),

    /// The result store rejected an update.
    #[error("result store rejected bundle updates: {0}")]
    Store(#[from] StoreError),

    /// File system error while staging bundle contents.
    #[error("IO error at {path}: {source}")]
    Io {
        /// The path where the error occurred.
        path: PathBuf,
        /// The underlying IO error.
        #[source]
        source: std::io::Error,
    },

    /// A spawned task could not be joined.
    #[error("background task failed: {0}")]
    Task(String),

    /// The run was cancelled while the bundle was being fetched.
    #[error("bundle fetch cancelled")]
    Cancelled,
}

impl FetchError {
    fn io(path: &Path, source: std::io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Downloads the bundle for a search session and reconciles its
/// contents into the workspace.
///
/// The bundle lands in a per-session download directory, is gated on a
/// zip content sniff, extracted, and its files moved to the workspace
/// root. Extracted artifacts are matched back to store records by file
/// stem; the bundle's own inventory side file is merged into the store
/// and preserved under a randomized name.
///
/// Cancellation aborts an in-flight transfer and returns
/// [`FetchError::Cancelled`]; partial files are left for the workspace
/// cleanup.
pub(crate) async fn fetch_round_artifacts(
    client: &SearchClient,
    store: &ResultStore,
    status: &Arc<RunStatus>,
    workspace: &Path,
    session_id: &str,
    limit: usize,
    cancel: &CancellationToken,
) -> Result<(), FetchError> {
    if cancel.is_cancelled() {
        return Err(FetchError::Cancelled);
    }

    let dl_dir = workspace.join(format!("dl_{}", fsutil::safe_file_name(session_id)));
    tokio::fs::create_dir_all(&dl_dir)
        .await
        .map_err(|e| FetchError::io(&dl_dir, e))?;

    let bundle_path = dl_dir.join(format!("{}.zip", fsutil::safe_file_name_rnd(session_id)));

    let bytes =
        download_with_byte_polling(client, status, session_id, limit, &bundle_path, cancel).await?;
    debug!(bytes, bundle = %bundle_path.display(), "bundle downloaded");

    let detected = fsutil::detect_content_type(&bundle_path)
        .map_err(|e| FetchError::io(&bundle_path, e))?;
    if detected != fsutil::ZIP_CONTENT_TYPE {
        return Err(FetchError::InvalidBundleType {
            path: bundle_path,
            detected: detected.to_string(),
        });
    }

    let stem = fsutil::file_stem_lossy(&bundle_path);
    let extract_dir = workspace.join(if stem.is_empty() {
        "temp".to_string()
    } else {
        stem
    });

    let archive_path = bundle_path.clone();
    let dest = extract_dir.clone();
    let extracted = tokio::task::spawn_blocking(move || archive::unpack_zip(&archive_path, &dest))
        .await
        .map_err(|e| FetchError::Task(e.to_string()))??;
    debug!(entries = extracted.len(), "bundle unpacked");

    if let Err(error) = tokio::fs::remove_dir_all(&dl_dir).await {
        warn!(path = %dl_dir.display(), %error, "failed to remove download directory");
    }

    merge_bundle_inventory(store, &extract_dir).await?;
    reconcile_artifacts(store, status, workspace, &extract_dir, session_id).await?;

    if let Err(error) = tokio::fs::remove_dir_all(&extract_dir).await {
        warn!(path = %extract_dir.display(), %error, "failed to remove extraction directory");
    }

    Ok(())
}

/// Runs the bundle download while a sampling task mirrors the transfer
/// counter into the run status.
///
/// Whatever was transferred is folded into the run totals before a
/// download error or cancellation is surfaced, so partial transfers
/// still show up in the final numbers.
async fn download_with_byte_polling(
    client: &SearchClient,
    status: &Arc<RunStatus>,
    session_id: &str,
    limit: usize,
    bundle_path: &Path,
    cancel: &CancellationToken,
) -> Result<u64, FetchError> {
    let downloading = Arc::new(AtomicBool::new(true));

    let mut download = {
        let client = client.clone();
        let session = session_id.to_string();
        let path = bundle_path.to_path_buf();
        let downloading = Arc::clone(&downloading);
        tokio::spawn(async move {
            let result = client.download_bundle(&session, limit, &path).await;
            // The provider drops the session either way.
            client.terminate(&session).await;
            downloading.store(false, Ordering::SeqCst);
            result
        })
    };

    let poller = {
        let counter = client.transfer_counter();
        let status = Arc::clone(status);
        let downloading = Arc::clone(&downloading);
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(BYTE_POLL_INTERVAL).await;
                if !downloading.load(Ordering::SeqCst) {
                    break;
                }
                status.set_in_flight(counter.total());
            }
        })
    };

    let joined = tokio::select! {
        () = cancel.cancelled() => {
            download.abort();
            poller.abort();
            let _ = download.await;
            let _ = poller.await;
            status.set_in_flight(0);
            status.add_transferred(client.transfer_counter().total());
            return Err(FetchError::Cancelled);
        }
        joined = &mut download => joined,
    };

    let result = joined.map_err(|e| FetchError::Task(e.to_string()))?;
    if let Err(error) = poller.await {
        warn!(%error, "byte poller panicked");
    }

    status.set_in_flight(0);
    status.add_transferred(client.transfer_counter().total());

    Ok(result?)
}

/// Merges the bundle's own inventory side file into the store, if one
/// was shipped. Parse failures are logged and skipped; the artifacts
/// themselves are still reconciled.
async fn merge_bundle_inventory(store: &ResultStore, extract_dir: &Path) -> Result<(), FetchError> {
    let inventory_path = extract_dir.join(INVENTORY_FILE_NAME);
    if tokio::fs::metadata(&inventory_path).await.is_err() {
        debug!("bundle carries no inventory side file");
        return Ok(());
    }

    match archive::parse_inventory(&inventory_path) {
        Ok(records) => {
            let merged = store.merge_records(&records).await?;
            debug!(rows = records.len(), merged, "bundle inventory merged");
        }
        Err(error) => {
            warn!(path = %inventory_path.display(), %error, "failed to parse bundle inventory");
        }
    }
    Ok(())
}

/// Moves extracted files into the workspace root and flags their store
/// records as downloaded.
///
/// The inventory side file is renamed with a random suffix so bundles
/// from different rounds cannot clobber each other. An artifact whose
/// stem matches no record is moved anyway and logged.
async fn reconcile_artifacts(
    store: &ResultStore,
    status: &Arc<RunStatus>,
    workspace: &Path,
    extract_dir: &Path,
    session_id: &str,
) -> Result<(), FetchError> {
    let mut entries = tokio::fs::read_dir(extract_dir)
        .await
        .map_err(|e| FetchError::io(extract_dir, e))?;

    while let Some(entry) = entries
        .next_entry()
        .await
        .map_err(|e| FetchError::io(extract_dir, e))?
    {
        let path = entry.path();
        let file_type = entry
            .file_type()
            .await
            .map_err(|e| FetchError::io(&path, e))?;
        if !file_type.is_file() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().into_owned();

        if name == INVENTORY_FILE_NAME {
            let dest = workspace.join(format!(
                "info_orig_{}.csv",
                fsutil::safe_file_name_rnd(session_id)
            ));
            fsutil::move_file(&path, &dest).map_err(|e| FetchError::io(&path, e))?;
            continue;
        }

        let system_id = fsutil::file_stem_lossy(&path).to_lowercase();
        if !store.mark_downloaded(&system_id, &name).await? {
            warn!(file = %name, "extracted artifact has no matching record");
        }

        let dest = workspace.join(&name);
        fsutil::move_file(&path, &dest).map_err(|e| FetchError::io(&path, e))?;
        status.record_downloaded();
    }

    Ok(())
}
