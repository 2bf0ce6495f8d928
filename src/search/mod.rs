//! Windowed search against the intelligence exchange provider.
//!
//! The provider exposes a three-step search protocol: dispatch a query and
//! receive a session id, poll the session for result records, then fetch
//! the session's artifacts as a zip bundle. [`SearchClient`] wraps all
//! three plus best-effort session termination.
//!
//! Searches are bounded by a [`SearchWindow`]; the harvest engine walks
//! backwards in time by shrinking the window's upper bound between rounds.

mod client;
mod error;

pub use client::{DEFAULT_BASE_URL, SearchClient, SearchClientOptions, TransferCounter};
pub use error::SearchError;

use chrono::{DateTime, Utc};
use serde::Deserialize;

use crate::store::{ResultRecord, parse_provider_date};

/// Selector guidance shown when the provider rejects a search term.
pub const SUPPORTED_SELECTORS: &str = "\
Selector types supported:
  * Email address
  * Domain, including wildcards like *.example.com
  * URL
  * IPv4 and IPv6
  * CIDRv4 and CIDRv6
  * Phone number
  * Bitcoin address
  * MAC address
  * IPFS hash
  * UUID
  * Simhash
  * Credit card number
  * IBAN";

/// Result ordering requested from the provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SortOrder {
    /// No particular order.
    None,
    /// Least relevant first.
    ScoreAsc,
    /// Most relevant first.
    ScoreDesc,
    /// Oldest first.
    DateAsc,
    /// Newest first. This is what windowed harvesting relies on.
    #[default]
    DateDesc,
}

impl SortOrder {
    /// Wire value understood by the provider.
    pub(crate) fn as_param(self) -> u8 {
        match self {
            Self::None => 0,
            Self::ScoreAsc => 1,
            Self::ScoreDesc => 2,
            Self::DateAsc => 3,
            Self::DateDesc => 4,
        }
    }
}

/// Inclusive date range a search is constrained to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SearchWindow {
    /// Lower bound of the window.
    pub from: DateTime<Utc>,
    /// Upper bound of the window.
    pub to: DateTime<Utc>,
}

impl SearchWindow {
    /// A window from the Unix epoch up to `to`.
    #[must_use]
    pub fn ending_at(to: DateTime<Utc>) -> Self {
        Self {
            from: DateTime::UNIX_EPOCH,
            to,
        }
    }
}

/// A single record as returned by the provider's result endpoint.
#[derive(Debug, Clone, Deserialize)]
pub struct SearchRecord {
    /// Provider-wide unique record id.
    #[serde(rename = "systemid", default)]
    pub system_id: String,
    /// Human-readable record name.
    #[serde(default)]
    pub name: String,
    /// Bucket the record was found in.
    #[serde(default)]
    pub bucket: String,
    /// Human-readable media class.
    #[serde(default)]
    pub media: String,
    /// Content type of the payload.
    #[serde(rename = "type", default)]
    pub kind: String,
    /// Payload size in bytes.
    #[serde(default)]
    pub size: i64,
    /// Record timestamp in the provider's `YYYY-MM-DD HH:MM:SS` format.
    #[serde(default)]
    pub date: String,
}

impl SearchRecord {
    /// Converts the wire record into a storable [`ResultRecord`].
    ///
    /// The system id is lowercased so it matches artifact file stems, and
    /// a malformed date falls back to the current time.
    #[must_use]
    pub fn into_record(self) -> ResultRecord {
        let mut record = ResultRecord::new(
            self.system_id.to_lowercase(),
            parse_provider_date(&self.date),
        );
        record.name = self.name;
        record.bucket = self.bucket;
        record.media = self.media;
        record.kind = self.kind;
        record.size = self.size;
        record
    }
}

/// One round's worth of search results plus the session that produced them.
#[derive(Debug, Clone)]
pub struct SearchPage {
    /// Provider session id; needed for the bundle download and termination.
    pub session_id: String,
    /// Records collected for this round, capped at the page limit.
    pub records: Vec<SearchRecord>,
}
