//! CLI entry point for the leakharvest tool.

use anyhow::{Result, bail};
use clap::Parser;
use leakharvest_core::{Harvester, HarvesterConfig, fsutil};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

mod cli;

use cli::Args;

const API_KEY_ENV: &str = "LEAKHARVEST_API_KEY";

#[tokio::main]
async fn main() -> Result<()> {
    // Parse CLI arguments first (before tracing, so --help works without logs)
    let args = Args::parse();

    // Determine log level based on verbose/quiet flags
    // Priority: RUST_LOG env var > quiet flag > verbose flag > default (info)
    let default_level = if args.quiet {
        "error"
    } else {
        match args.verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    };

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level));

    tracing_subscriber::fmt().with_env_filter(filter).init();

    debug!(term = %args.term, output = %args.output.display(), "CLI arguments parsed");

    let Some(api_key) = args
        .api_key
        .clone()
        .or_else(|| std::env::var(API_KEY_ENV).ok())
        .filter(|key| !key.is_empty())
    else {
        bail!("no API key provided; pass --api-key or set {API_KEY_ENV}");
    };

    let mut config = HarvesterConfig::new(&args.term, api_key, &args.output);
    config.base_url = args.api_url.clone();
    config.threads = usize::from(args.threads);
    config.limit = args.limit as usize;
    config.search.proxy_url = args.proxy.clone();

    // Ctrl-C cancels the run; the engine still cleans up its workspace.
    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("interrupt received, finishing up");
                cancel.cancel();
            }
        });
    }

    let harvester = Harvester::new(config).await?;
    let status = harvester.status();

    match harvester.run(cancel).await {
        Ok(summary) => {
            match &summary.output {
                Some(path) => info!(
                    archive = %path.display(),
                    results = summary.total_files,
                    downloaded = summary.downloaded,
                    duplicated = summary.duplicated,
                    rounds = summary.rounds,
                    archived_files = summary.archived_files,
                    transferred = %fsutil::format_bytes(summary.total_bytes),
                    "harvest complete"
                ),
                None => info!(term = %args.term, "harvest finished without results; no archive written"),
            }
            Ok(())
        }
        Err(e) => {
            let snapshot = status.snapshot();
            error!(
                error = %e,
                results = snapshot.total_files,
                downloaded = snapshot.downloaded,
                "harvest failed"
            );
            Err(e.into())
        }
    }
}
