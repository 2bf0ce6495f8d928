//! Harvest engine: runs windowed search rounds against the provider,
//! pushes results through the dedup pool, fetches artifact bundles, and
//! packs everything into the final archive.
//!
//! A run walks the result space backwards in time. Each round searches
//! a window ending at the oldest date already stored (or now, for the
//! first round), inserts what is new, downloads that round's bundle,
//! and reconciles its files. Rounds stop once a round contributes
//! little enough that the space is considered exhausted.

mod fetcher;
mod pool;
mod progress;
mod status;

pub use fetcher::FetchError;
pub use status::{RunStatus, StatusSnapshot, Step};

use std::io::IsTerminal;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::archive::{self, ArchiveError, INVENTORY_FILE_NAME, InventoryError};
use crate::fsutil;
use crate::search::{
    DEFAULT_BASE_URL, SUPPORTED_SELECTORS, SearchClient, SearchClientOptions, SearchError,
    SearchPage, SearchRecord, SearchWindow, SortOrder,
};
use crate::store::{ResultRecord, ResultStore, StoreError};

/// Default number of results requested per round.
pub const DEFAULT_PAGE_LIMIT: usize = 1000;

/// Default size of the dedup worker pool.
pub const DEFAULT_WORKER_THREADS: usize = 3;

/// The pool never runs with fewer workers than this.
const MIN_WORKER_THREADS: usize = 2;

/// A round that fills less than this share of the page limit means the
/// provider has nothing substantially new left.
const EXHAUSTION_RATIO: f64 = 0.95;

const STORE_FILE_NAME: &str = "info.sqlite3";
const WORKSPACE_PREFIX: &str = "leakharvest_";

/// Errors a harvest run can end with.
#[derive(Debug, Error)]
pub enum HarvestError {
    /// The search term is not a selector the provider understands.
    #[error("unsupported search term: {term}")]
    InvalidSelector {
        /// The rejected term.
        term: String,
    },

    /// A provider search failed.
    #[error("search failed: {0}")]
    Search(#[from] SearchError),

    /// A bundle fetch or reconciliation failed.
    #[error("artifact fetch failed: {0}")]
    Fetch(#[from] FetchError),

    /// The result store failed.
    #[error("result store failure: {0}")]
    Store(#[from] StoreError),

    /// The inventory export failed.
    #[error("inventory export failed: {0}")]
    Inventory(#[from] InventoryError),

    /// The final archive could not be packed.
    #[error("artifact packing failed: {0}")]
    Archive(#[from] ArchiveError),

    /// The temporary workspace could not be created.
    #[error("workspace error at {path}: {source}")]
    Workspace {
        /// The directory involved.
        path: PathBuf,
        /// The underlying IO error.
        #[source]
        source: std::io::Error,
    },

    /// A spawned task could not be joined.
    #[error("background task failed: {0}")]
    Task(String),

    /// The run was cancelled before it finished.
    #[error("run cancelled")]
    Cancelled,
}

/// Settings for a harvest run.
#[derive(Debug, Clone)]
pub struct HarvesterConfig {
    /// The selector to search for.
    pub term: String,
    /// Provider API key.
    pub api_key: String,
    /// Where the final archive is written.
    pub output_zip: PathBuf,
    /// Provider base URL.
    pub base_url: String,
    /// Requested dedup pool size. Clamped to a minimum of two.
    pub threads: usize,
    /// Results requested per round.
    pub limit: usize,
    /// Tuning for the search client.
    pub search: SearchClientOptions,
}

impl HarvesterConfig {
    /// Creates a config with default provider, limit, and pool size.
    pub fn new(
        term: impl Into<String>,
        api_key: impl Into<String>,
        output_zip: impl Into<PathBuf>,
    ) -> Self {
        Self {
            term: term.into(),
            api_key: api_key.into(),
            output_zip: output_zip.into(),
            base_url: DEFAULT_BASE_URL.to_string(),
            threads: DEFAULT_WORKER_THREADS,
            limit: DEFAULT_PAGE_LIMIT,
            search: SearchClientOptions::default(),
        }
    }
}

/// What a finished run produced.
#[derive(Debug, Clone)]
pub struct RunSummary {
    /// Results the provider reported across all rounds.
    pub total_files: usize,
    /// Artifacts reconciled into the archive.
    pub downloaded: usize,
    /// Results rejected as duplicates.
    pub duplicated: usize,
    /// Bytes transferred from the provider.
    pub total_bytes: u64,
    /// Search rounds executed.
    pub rounds: usize,
    /// Files packed into the final archive.
    pub archived_files: usize,
    /// Path of the final archive, or `None` when nothing was found.
    pub output: Option<PathBuf>,
}

/// A single harvest run: one term, one workspace, one final archive.
#[derive(Debug)]
pub struct Harvester {
    config: HarvesterConfig,
    client: SearchClient,
    store: ResultStore,
    status: Arc<RunStatus>,
    workspace: PathBuf,
    workers: usize,
}

impl Harvester {
    /// Prepares a run: builds the search client, creates the temporary
    /// workspace, and opens the result store inside it.
    ///
    /// # Errors
    ///
    /// Returns [`HarvestError::Search`] for client construction issues,
    /// [`HarvestError::Workspace`] when no workspace can be created,
    /// and [`HarvestError::Store`] when the store cannot be opened.
    pub async fn new(config: HarvesterConfig) -> Result<Self, HarvestError> {
        let client =
            SearchClient::with_options(&config.base_url, &config.api_key, config.search.clone())?;

        let workspace =
            fsutil::temp_workspace(WORKSPACE_PREFIX).map_err(|e| HarvestError::Workspace {
                path: std::env::temp_dir(),
                source: e,
            })?;

        let store = match ResultStore::open(&workspace.join(STORE_FILE_NAME)).await {
            Ok(store) => store,
            Err(error) => {
                // Don't leak the workspace we just created.
                let _ = std::fs::remove_dir_all(&workspace);
                return Err(error.into());
            }
        };

        let workers = config.threads.max(MIN_WORKER_THREADS);
        let interactive = std::io::stderr().is_terminal();

        info!(
            term = %config.term,
            workspace = %workspace.display(),
            workers,
            limit = config.limit,
            "harvest run prepared"
        );

        Ok(Self {
            config,
            client,
            store,
            status: Arc::new(RunStatus::new(interactive)),
            workspace,
            workers,
        })
    }

    /// Shared status handle for observing the run from another task.
    #[must_use]
    pub fn status(&self) -> Arc<RunStatus> {
        Arc::clone(&self.status)
    }

    /// The temporary workspace this run stages files in.
    #[must_use]
    pub fn workspace(&self) -> &Path {
        &self.workspace
    }

    /// Runs the harvest to completion or cancellation.
    ///
    /// Rounds repeat until a round inserts too little to continue. The
    /// inventory is then written, the store closed, and the workspace
    /// packed into the output archive. The workspace is removed on
    /// every exit path, including errors and cancellation.
    ///
    /// # Errors
    ///
    /// Returns the first error the pipeline hit, or
    /// [`HarvestError::Cancelled`] when the token fired first.
    #[instrument(skip_all, fields(term = %self.config.term))]
    pub async fn run(self, cancel: CancellationToken) -> Result<RunSummary, HarvestError> {
        let Self {
            config,
            client,
            store,
            status,
            workspace,
            workers,
        } = self;

        let reporter = progress::spawn_progress_reporter(Arc::clone(&status), cancel.clone());

        let mut rounds = 0usize;
        let mut outcome: Result<(), HarvestError> = Ok(());

        loop {
            if cancel.is_cancelled() {
                outcome = Err(HarvestError::Cancelled);
                break;
            }
            match next_round(
                &client,
                &store,
                &status,
                &workspace,
                &config.term,
                config.limit,
                workers,
                &cancel,
            )
            .await
            {
                Ok(inserted) => {
                    rounds += 1;
                    // A cancel that lands between the round finishing and
                    // the exhaustion break must not reach the inventory
                    // and packing stages.
                    if cancel.is_cancelled() {
                        outcome = Err(HarvestError::Cancelled);
                        break;
                    }
                    if is_exhausted(inserted, config.limit) {
                        debug!(inserted, rounds, "result space exhausted");
                        break;
                    }
                }
                Err(error) => {
                    outcome = Err(error);
                    break;
                }
            }
        }

        let mut had_results = false;
        if outcome.is_ok() {
            match store.count().await {
                Ok(total) if total > 0 => {
                    had_results = true;
                    status.set_step(Step::Inventory);
                    let inventory_path = workspace.join(INVENTORY_FILE_NAME);
                    match archive::write_inventory(&store, &inventory_path).await {
                        Ok(rows) => debug!(rows, "inventory written"),
                        Err(error) => outcome = Err(error.into()),
                    }
                }
                Ok(_) => warn!(term = %config.term, "no results were found for this term"),
                Err(error) => outcome = Err(error.into()),
            }
        }

        // The store has to be closed before packing so the database file
        // is checkpointed and its WAL sidecars are gone.
        store.close().await;

        let mut archived_files = 0usize;
        let output = if outcome.is_ok() && had_results {
            status.set_step(Step::Compressing);
            let dir = workspace.clone();
            let dest = config.output_zip.clone();
            match tokio::task::spawn_blocking(move || archive::pack_dir(&dir, &dest)).await {
                Ok(Ok(count)) => {
                    archived_files = count;
                    Some(config.output_zip.clone())
                }
                Ok(Err(error)) => {
                    outcome = Err(error.into());
                    None
                }
                Err(error) => {
                    outcome = Err(HarvestError::Task(error.to_string()));
                    None
                }
            }
        } else {
            None
        };

        status.finish();
        if let Err(error) = reporter.await {
            warn!(%error, "progress reporter panicked");
        }

        if let Err(error) = tokio::fs::remove_dir_all(&workspace).await {
            warn!(path = %workspace.display(), %error, "failed to remove workspace");
        }

        outcome?;

        let snapshot = status.snapshot();
        Ok(RunSummary {
            total_files: snapshot.total_files,
            downloaded: snapshot.downloaded,
            duplicated: snapshot.duplicated,
            total_bytes: snapshot.total_bytes,
            rounds,
            archived_files,
            output,
        })
    }
}

/// Runs one search round: derive the window, search, dedup, fetch.
///
/// Returns the number of records the round actually added.
#[allow(clippy::too_many_arguments)]
async fn next_round(
    client: &SearchClient,
    store: &ResultStore,
    status: &Arc<RunStatus>,
    workspace: &Path,
    term: &str,
    limit: usize,
    workers: usize,
    cancel: &CancellationToken,
) -> Result<usize, HarvestError> {
    // The oldest stored date is the upper bound of the next window, so a
    // restartless walk backwards needs no cursor state of its own.
    let window = match store.oldest_date().await? {
        Some(oldest) => SearchWindow::ending_at(oldest),
        None => SearchWindow::ending_at(Utc::now()),
    };

    status.set_step(Step::Searching);
    info!(term, until = %window.to, "querying provider");

    // Racing the whole search future against the token cancels it at
    // whatever await point it is at, result polls included.
    let searched = tokio::select! {
        () = cancel.cancelled() => return Err(HarvestError::Cancelled),
        result = client.search(term, &window, SortOrder::DateDesc, limit) => result,
    };
    let page = match searched {
        Ok(page) => page,
        Err(error) if error.is_invalid_selector() => {
            error!(term, "the provider does not support this search term");
            warn!("supported selector types:\n{SUPPORTED_SELECTORS}");
            return Err(HarvestError::InvalidSelector {
                term: term.to_string(),
            });
        }
        Err(error) => return Err(error.into()),
    };

    let SearchPage {
        session_id,
        records,
    } = page;
    status.add_discovered(records.len());
    info!(results = records.len(), "provider round received");

    if records.is_empty() {
        client.terminate(&session_id).await;
        return Ok(0);
    }

    let records: Vec<ResultRecord> = records.into_iter().map(SearchRecord::into_record).collect();
    let inserted = pool::run_dedup_pool(records, store, status, workers, cancel).await?;

    if cancel.is_cancelled() {
        return Err(HarvestError::Cancelled);
    }

    status.set_step(Step::Downloading);
    match fetcher::fetch_round_artifacts(client, store, status, workspace, &session_id, limit, cancel)
        .await
    {
        Ok(()) => {}
        Err(FetchError::Cancelled) => return Err(HarvestError::Cancelled),
        Err(error) => return Err(error.into()),
    }

    Ok(inserted)
}

/// Whether a round's contribution means the result space is exhausted.
///
/// A round counts as the last one when it added nothing, or when it
/// filled no more than [`EXHAUSTION_RATIO`] of the page limit. Only a
/// nearly-full round hints at more rows behind the window.
fn is_exhausted(inserted: usize, limit: usize) -> bool {
    #[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    let threshold = (limit as f64 * EXHAUSTION_RATIO) as usize;
    inserted == 0 || inserted <= threshold
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_is_exhausted_at_default_limit() {
        assert!(is_exhausted(0, 1000));
        assert!(is_exhausted(1, 1000));
        assert!(is_exhausted(950, 1000));
        assert!(!is_exhausted(951, 1000));
        assert!(!is_exhausted(1000, 1000));
    }

    #[test]
    fn test_is_exhausted_at_small_limits() {
        assert!(is_exhausted(9, 10));
        assert!(!is_exhausted(10, 10));
        assert!(is_exhausted(0, 1));
        assert!(!is_exhausted(1, 1));
    }

    #[test]
    fn test_config_defaults() {
        let config = HarvesterConfig::new("leak@example.com", "key", "out.zip");
        assert_eq!(config.base_url, DEFAULT_BASE_URL);
        assert_eq!(config.threads, DEFAULT_WORKER_THREADS);
        assert_eq!(config.limit, DEFAULT_PAGE_LIMIT);
        assert_eq!(config.output_zip, PathBuf::from("out.zip"));
    }

    #[tokio::test]
    async fn test_harvester_new_creates_workspace_with_store() {
        let config = HarvesterConfig::new("leak@example.com", "key", "out.zip");
        let harvester = Harvester::new(config).await.unwrap();

        let workspace = harvester.workspace().to_path_buf();
        assert!(workspace.exists());
        assert!(workspace.join(STORE_FILE_NAME).exists());
        assert!(harvester.status().running());

        drop(harvester);
        std::fs::remove_dir_all(&workspace).unwrap();
    }

    #[tokio::test]
    async fn test_harvester_new_rejects_bad_base_url() {
        let mut config = HarvesterConfig::new("term", "key", "out.zip");
        config.base_url = "not a url".to_string();

        let error = Harvester::new(config).await.unwrap_err();
        assert!(matches!(error, HarvestError::Search(_)));
    }

    #[tokio::test]
    async fn test_worker_count_is_clamped_to_minimum() {
        let mut config = HarvesterConfig::new("term", "key", "out.zip");
        config.threads = 1;

        let harvester = Harvester::new(config).await.unwrap();
        assert_eq!(harvester.workers, MIN_WORKER_THREADS);

        let workspace = harvester.workspace().to_path_buf();
        drop(harvester);
        std::fs::remove_dir_all(&workspace).unwrap();
    }
}
