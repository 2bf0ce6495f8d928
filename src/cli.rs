//! CLI argument definitions using clap derive macros.

use std::path::PathBuf;

use clap::Parser;

use leakharvest_core::{DEFAULT_BASE_URL, DEFAULT_PAGE_LIMIT, DEFAULT_WORKER_THREADS};

/// Harvest leak and intelligence search results into a single archive.
///
/// Leakharvest walks the provider's result space for a selector (email,
/// domain, IP, ...) backwards in time, downloads every artifact bundle,
/// and packs results plus inventory into one reviewable zip.
#[derive(Parser, Debug)]
#[command(name = "leakharvest")]
#[command(author, version, about)]
pub struct Args {
    /// Selector to search for (email, domain, URL, IP, CIDR, phone, ...)
    pub term: String,

    /// Path of the final zip archive
    #[arg(short, long, default_value = "leakharvest.zip")]
    pub output: PathBuf,

    /// Provider API key (falls back to the LEAKHARVEST_API_KEY env var)
    #[arg(long)]
    pub api_key: Option<String>,

    /// Provider API base URL
    #[arg(long, default_value = DEFAULT_BASE_URL)]
    pub api_url: String,

    /// Dedup worker threads (1-100; values below 2 are raised to 2)
    #[arg(short = 't', long, default_value_t = DEFAULT_WORKER_THREADS as u8, value_parser = clap::value_parser!(u8).range(1..=100))]
    pub threads: u8,

    /// Results requested per search round (1-10000)
    #[arg(short = 'l', long, default_value_t = DEFAULT_PAGE_LIMIT as u32, value_parser = clap::value_parser!(u32).range(1..=10000))]
    pub limit: u32,

    /// Proxy URL for all provider traffic (http, https, or socks5)
    #[arg(long)]
    pub proxy: Option<String>,

    /// Increase output verbosity (-v for debug, -vv for trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Suppress non-error output
    #[arg(short, long)]
    pub quiet: bool,
}
