//! Shared run status: counters the pipeline updates and the progress
//! reporter reads.

use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU64, AtomicUsize, Ordering};

use tokio::sync::Notify;

/// Pipeline phase a run is currently in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Step {
    /// No work has started yet.
    Idle = 0,
    /// Querying the provider for a result window.
    Searching = 1,
    /// Downloading and extracting an artifact bundle.
    Downloading = 2,
    /// Writing the inventory CSV.
    Inventory = 3,
    /// Packing the final artifact.
    Compressing = 4,
}

impl Step {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Searching,
            2 => Self::Downloading,
            3 => Self::Inventory,
            4 => Self::Compressing,
            _ => Self::Idle,
        }
    }

    /// Short label used in progress output.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Searching => "searching",
            Self::Downloading => "downloading",
            Self::Inventory => "inventory",
            Self::Compressing => "compressing",
        }
    }
}

impl std::fmt::Display for Step {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Live counters for a harvest run.
///
/// Owned by the engine and shared with the progress reporter through an
/// `Arc`. All fields are atomics, so both sides touch it without locks.
#[derive(Debug)]
pub struct RunStatus {
    total_files: AtomicUsize,
    downloaded: AtomicUsize,
    duplicated: AtomicUsize,
    total_bytes: AtomicU64,
    in_flight_bytes: AtomicU64,
    step: AtomicU8,
    running: AtomicBool,
    interactive: bool,
    done: Notify,
}

/// Point-in-time copy of [`RunStatus`].
#[derive(Debug, Clone, Copy)]
pub struct StatusSnapshot {
    /// Results the provider has reported across all rounds.
    pub total_files: usize,
    /// Artifacts reconciled into the workspace.
    pub downloaded: usize,
    /// Results rejected as already known.
    pub duplicated: usize,
    /// Bytes transferred by completed bundle downloads.
    pub total_bytes: u64,
    /// Bytes transferred so far by the download in progress.
    pub in_flight_bytes: u64,
    /// Current pipeline phase.
    pub step: Step,
    /// Whether the run is still active.
    pub running: bool,
}

impl RunStatus {
    /// Creates a status for a fresh run. `interactive` selects the
    /// spinner UI over plain log lines.
    #[must_use]
    pub fn new(interactive: bool) -> Self {
        Self {
            total_files: AtomicUsize::new(0),
            downloaded: AtomicUsize::new(0),
            duplicated: AtomicUsize::new(0),
            total_bytes: AtomicU64::new(0),
            in_flight_bytes: AtomicU64::new(0),
            step: AtomicU8::new(Step::Idle as u8),
            running: AtomicBool::new(true),
            interactive,
            done: Notify::new(),
        }
    }

    /// Whether progress should be rendered as a spinner.
    #[must_use]
    pub fn interactive(&self) -> bool {
        self.interactive
    }

    /// Whether the run is still active.
    #[must_use]
    pub fn running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Current pipeline phase.
    #[must_use]
    pub fn step(&self) -> Step {
        Step::from_u8(self.step.load(Ordering::SeqCst))
    }

    pub(crate) fn set_step(&self, step: Step) {
        self.step.store(step as u8, Ordering::SeqCst);
    }

    pub(crate) fn add_discovered(&self, count: usize) {
        self.total_files.fetch_add(count, Ordering::SeqCst);
    }

    pub(crate) fn record_downloaded(&self) {
        self.downloaded.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn record_duplicate(&self) {
        self.duplicated.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn add_transferred(&self, bytes: u64) {
        self.total_bytes.fetch_add(bytes, Ordering::SeqCst);
    }

    pub(crate) fn set_in_flight(&self, bytes: u64) {
        self.in_flight_bytes.store(bytes, Ordering::SeqCst);
    }

    /// Marks the run finished and wakes the progress reporter.
    pub(crate) fn finish(&self) {
        self.running.store(false, Ordering::SeqCst);
        // notify_one stores a permit, so a reporter that checks `running`
        // and only then awaits does not miss the wakeup.
        self.done.notify_one();
    }

    /// Resolves once [`finish`](Self::finish) has been called.
    pub(crate) async fn finished(&self) {
        self.done.notified().await;
    }

    /// Takes a consistent-enough copy for rendering or summaries.
    #[must_use]
    pub fn snapshot(&self) -> StatusSnapshot {
        StatusSnapshot {
            total_files: self.total_files.load(Ordering::SeqCst),
            downloaded: self.downloaded.load(Ordering::SeqCst),
            duplicated: self.duplicated.load(Ordering::SeqCst),
            total_bytes: self.total_bytes.load(Ordering::SeqCst),
            in_flight_bytes: self.in_flight_bytes.load(Ordering::SeqCst),
            step: self.step(),
            running: self.running(),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_new_status_is_idle_and_running() {
        let status = RunStatus::new(false);
        let snapshot = status.snapshot();

        assert_eq!(snapshot.step, Step::Idle);
        assert!(snapshot.running);
        assert_eq!(snapshot.total_files, 0);
        assert_eq!(snapshot.downloaded, 0);
        assert_eq!(snapshot.duplicated, 0);
        assert_eq!(snapshot.total_bytes, 0);
        assert!(!status.interactive());
    }

    #[test]
    fn test_counters_accumulate() {
        let status = RunStatus::new(true);
        status.add_discovered(100);
        status.add_discovered(50);
        status.record_downloaded();
        status.record_downloaded();
        status.record_duplicate();
        status.add_transferred(1_000);
        status.add_transferred(500);
        status.set_in_flight(42);
        status.set_step(Step::Downloading);

        let snapshot = status.snapshot();
        assert_eq!(snapshot.total_files, 150);
        assert_eq!(snapshot.downloaded, 2);
        assert_eq!(snapshot.duplicated, 1);
        assert_eq!(snapshot.total_bytes, 1_500);
        assert_eq!(snapshot.in_flight_bytes, 42);
        assert_eq!(snapshot.step, Step::Downloading);
    }

    #[test]
    fn test_step_labels() {
        assert_eq!(Step::Idle.to_string(), "idle");
        assert_eq!(Step::Searching.to_string(), "searching");
        assert_eq!(Step::Downloading.to_string(), "downloading");
        assert_eq!(Step::Inventory.to_string(), "inventory");
        assert_eq!(Step::Compressing.to_string(), "compressing");
    }

    #[test]
    fn test_step_roundtrips_through_atomic() {
        let status = RunStatus::new(false);
        for step in [
            Step::Searching,
            Step::Downloading,
            Step::Inventory,
            Step::Compressing,
            Step::Idle,
        ] {
            status.set_step(step);
            assert_eq!(status.step(), step);
        }
    }

    #[tokio::test]
    async fn test_finish_wakes_waiter_even_when_already_done() {
        let status = RunStatus::new(false);

        // Finish before anyone waits; the stored permit must still
        // resolve a later wait.
        status.finish();
        assert!(!status.running());
        status.finished().await;
    }

    #[tokio::test]
    async fn test_finished_resolves_on_finish() {
        let status = std::sync::Arc::new(RunStatus::new(false));
        let waiter = {
            let status = std::sync::Arc::clone(&status);
            tokio::spawn(async move { status.finished().await })
        };

        tokio::task::yield_now().await;
        status.finish();
        waiter.await.unwrap();
    }
}
