//! Progress reporting for harvest runs.
//!
//! Interactive runs get a spinner line that refreshes four times a
//! second; non-interactive runs get a structured log line every ten
//! seconds so service logs stay readable.

use std::sync::Arc;
use std::time::Duration;

use indicatif::{ProgressBar, ProgressStyle};
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::fsutil;

use super::status::{RunStatus, StatusSnapshot};

const INTERACTIVE_TICK: Duration = Duration::from_millis(250);
const QUIET_TICK: Duration = Duration::from_secs(10);

/// Spawns the reporter task for a run.
///
/// The task renders until [`RunStatus::finish`] is called or the token
/// is cancelled, then clears its spinner and exits. The caller awaits
/// the returned handle to make sure the terminal is left clean.
pub(crate) fn spawn_progress_reporter(
    status: Arc<RunStatus>,
    cancel: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let spinner = if status.interactive() {
            let spinner = ProgressBar::new_spinner();
            spinner.set_style(
                ProgressStyle::with_template("{spinner} {msg}")
                    .unwrap_or_else(|_| ProgressStyle::default_spinner()),
            );
            spinner.enable_steady_tick(Duration::from_millis(100));
            Some(spinner)
        } else {
            None
        };
        let tick = if status.interactive() {
            INTERACTIVE_TICK
        } else {
            QUIET_TICK
        };

        loop {
            if !status.running() {
                break;
            }
            let snapshot = status.snapshot();
            if let Some(spinner) = &spinner {
                spinner.set_message(render_line(&snapshot));
            } else {
                info!(
                    step = %snapshot.step,
                    registered = snapshot.total_files,
                    downloaded = snapshot.downloaded,
                    duplicated = snapshot.duplicated,
                    transferred = %fsutil::format_bytes(
                        snapshot.total_bytes.saturating_add(snapshot.in_flight_bytes)
                    ),
                    "harvest progress"
                );
            }

            tokio::select! {
                () = cancel.cancelled() => break,
                () = status.finished() => {}
                () = tokio::time::sleep(tick) => {}
            }
        }

        if let Some(spinner) = spinner {
            spinner.finish_and_clear();
        }
    })
}

/// One status line for the spinner.
pub(crate) fn render_line(snapshot: &StatusSnapshot) -> String {
    format!(
        "{}, reg.: {}, downloaded: {}, dup.: {}, bytes: {}",
        snapshot.step,
        snapshot.total_files,
        snapshot.downloaded,
        snapshot.duplicated,
        fsutil::format_bytes(snapshot.total_bytes.saturating_add(snapshot.in_flight_bytes)),
    )
}
