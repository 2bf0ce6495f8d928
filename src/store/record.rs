//! Result record type shared by the search, store, and archive layers.

use std::fmt;

use chrono::{DateTime, NaiveDateTime, Timelike, Utc};
use sqlx::FromRow;

/// Timestamp format used by the provider in search responses and
/// inventory side files.
pub(crate) const PROVIDER_DATE_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// A single deduplicated search result.
///
/// One row per provider record; `system_id` is the dedup key. The
/// `simhash`, `tags`, `relations`, and `near_text` fields belong to a
/// later parsing stage and are always written empty by the harvester.
#[derive(Debug, Clone, FromRow)]
pub struct ResultRecord {
    /// Local row id (0 until persisted).
    pub id: i64,
    /// Provider-wide unique record id, stored lowercase.
    pub system_id: String,
    /// Human-readable record name, often a leak or paste title.
    pub name: String,
    /// Provider bucket the record was found in.
    pub bucket: String,
    /// Media class, e.g. `Paste document`.
    pub media: String,
    /// Content type reported by the provider.
    pub kind: String,
    /// Payload size in bytes as reported by the provider.
    pub size: i64,
    /// Timestamp the record was indexed by the provider.
    pub date: DateTime<Utc>,
    /// Artifact file name once the record's payload landed on disk.
    pub filename: Option<String>,
    /// Whether the record's artifact was downloaded this run.
    pub downloaded: bool,
    /// Similarity hash, reserved for the parsing stage.
    pub simhash: i64,
    /// Extracted tags as a JSON array string, reserved for the parsing stage.
    pub tags: Option<String>,
    /// Related selectors as a JSON array string, reserved for the parsing stage.
    pub relations: Option<String>,
    /// Matched text excerpt, reserved for the parsing stage.
    pub near_text: String,
    /// When the row was inserted.
    pub created_at: String,
}

impl ResultRecord {
    /// Creates a record with the given identity and empty everything else.
    #[must_use]
    pub fn new(system_id: impl Into<String>, date: DateTime<Utc>) -> Self {
        Self {
            id: 0,
            system_id: system_id.into(),
            name: String::new(),
            bucket: String::new(),
            media: String::new(),
            kind: String::new(),
            size: 0,
            date,
            filename: None,
            downloaded: false,
            simhash: 0,
            tags: None,
            relations: None,
            near_text: String::new(),
            created_at: String::new(),
        }
    }

    /// Parses tags from the stored JSON array string.
    ///
    /// Returns an empty vector when tags are absent or invalid JSON.
    #[must_use]
    pub fn parse_tags(&self) -> Vec<String> {
        parse_json_list(self.tags.as_deref())
    }

    /// Parses related selectors from the stored JSON array string.
    ///
    /// Returns an empty vector when relations are absent or invalid JSON.
    #[must_use]
    pub fn parse_relations(&self) -> Vec<String> {
        parse_json_list(self.relations.as_deref())
    }

    /// Serializes a string list to a JSON array string for storage.
    ///
    /// Returns `None` for an empty list.
    #[must_use]
    pub fn serialize_list(values: &[String]) -> Option<String> {
        if values.is_empty() {
            return None;
        }
        serde_json::to_string(values).ok()
    }
}

impl fmt::Display for ResultRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "ResultRecord {{ system_id: {}, name: {}, date: {} }}",
            self.system_id,
            self.name,
            format_provider_date(&self.date)
        )
    }
}

fn parse_json_list(value: Option<&str>) -> Vec<String> {
    let Some(json) = value else {
        return Vec::new();
    };
    serde_json::from_str(json).unwrap_or_default()
}

/// Parses a provider timestamp leniently.
///
/// Tries the provider's `YYYY-MM-DD HH:MM:SS` format first, then RFC 3339,
/// and falls back to the current time so a malformed date never loses a
/// record.
#[must_use]
pub(crate) fn parse_provider_date(value: &str) -> DateTime<Utc> {
    if let Ok(naive) = NaiveDateTime::parse_from_str(value, PROVIDER_DATE_FORMAT) {
        return naive.and_utc();
    }
    if let Ok(parsed) = DateTime::parse_from_rfc3339(value) {
        return parsed.with_timezone(&Utc);
    }
    let now = Utc::now();
    now.with_nanosecond(0).unwrap_or(now)
}

/// Renders a timestamp in the provider's `YYYY-MM-DD HH:MM:SS` format.
#[must_use]
pub(crate) fn format_provider_date(date: &DateTime<Utc>) -> String {
    date.format(PROVIDER_DATE_FORMAT).to_string()
}
