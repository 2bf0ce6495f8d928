//! Error types for the provider search client.

use std::path::PathBuf;

use thiserror::Error;

/// Errors that can occur while talking to the search provider.
#[derive(Debug, Error)]
pub enum SearchError {
    /// The provider rejected the search term as not being a valid selector.
    #[error("invalid search selector: {term:?}")]
    InvalidSelector {
        /// The rejected term.
        term: String,
    },

    /// Network-level error (DNS resolution, connection refused, TLS errors, etc.)
    #[error("network error calling {url}: {source}")]
    Network {
        /// The endpoint that failed.
        url: String,
        /// The underlying network error.
        #[source]
        source: reqwest::Error,
    },

    /// Request timed out before completion.
    #[error("timeout calling {url}")]
    Timeout {
        /// The endpoint that timed out.
        url: String,
    },

    /// The provider answered with a non-success HTTP status.
    #[error("provider returned HTTP {status} for {url}")]
    Api {
        /// The endpoint that returned the status.
        url: String,
        /// The HTTP status code.
        status: u16,
    },

    /// The provider answered with something the client cannot interpret.
    #[error("unexpected provider response from {url}: {reason}")]
    Protocol {
        /// The endpoint that produced the response.
        url: String,
        /// What was wrong with it.
        reason: String,
    },

    /// The configured provider base URL is not a valid URL.
    #[error("invalid provider base URL: {url}")]
    InvalidBaseUrl {
        /// The offending URL string.
        url: String,
    },

    /// The configured proxy URL was rejected.
    #[error("invalid proxy URL {url}: {source}")]
    InvalidProxy {
        /// The offending proxy URL.
        url: String,
        /// The underlying error.
        #[source]
        source: reqwest::Error,
    },

    /// File system error while writing a downloaded bundle.
    #[error("IO error writing to {path}: {source}")]
    Io {
        /// The file path where the error occurred.
        path: PathBuf,
        /// The underlying IO error.
        #[source]
        source: std::io::Error,
    },
}

impl SearchError {
    /// Creates an invalid-selector error.
    pub fn invalid_selector(term: impl Into<String>) -> Self {
        Self::InvalidSelector { term: term.into() }
    }

    /// Creates a network error from a reqwest error.
    pub fn network(url: impl Into<String>, source: reqwest::Error) -> Self {
        Self::Network {
            url: url.into(),
            source,
        }
    }

    /// Creates a timeout error.
    pub fn timeout(url: impl Into<String>) -> Self {
        Self::Timeout { url: url.into() }
    }

    /// Creates an API status error.
    pub fn api(url: impl Into<String>, status: u16) -> Self {
        Self::Api {
            url: url.into(),
            status,
        }
    }

    /// Creates a protocol error.
    pub fn protocol(url: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Protocol {
            url: url.into(),
            reason: reason.into(),
        }
    }

    /// Creates an IO error with path context.
    pub fn io(path: PathBuf, source: std::io::Error) -> Self {
        Self::Io { path, source }
    }

    /// Whether this error means the search term itself was rejected.
    ///
    /// Callers use this to print selector guidance instead of retrying.
    #[must_use]
    pub fn is_invalid_selector(&self) -> bool {
        matches!(self, Self::InvalidSelector { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_selector_display_includes_term() {
        let error = SearchError::invalid_selector("??");
        assert_eq!(error.to_string(), "invalid search selector: \"??\"");
        assert!(error.is_invalid_selector());
    }

    #[test]
    fn test_api_error_display() {
        let error = SearchError::api("https://api.example.com/search", 402);
        assert_eq!(
            error.to_string(),
            "provider returned HTTP 402 for https://api.example.com/search"
        );
        assert!(!error.is_invalid_selector());
    }

    #[test]
    fn test_timeout_display() {
        let error = SearchError::timeout("https://api.example.com/result");
        assert_eq!(
            error.to_string(),
            "timeout calling https://api.example.com/result"
        );
    }

    #[test]
    fn test_protocol_display() {
        let error = SearchError::protocol("https://api.example.com/search", "no search id");
        assert!(error.to_string().contains("no search id"));
    }

    #[test]
    fn test_io_preserves_source() {
        let source = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied");
        let error = SearchError::io(PathBuf::from("/tmp/bundle.zip"), source);
        assert!(error.to_string().contains("/tmp/bundle.zip"));
        assert!(std::error::Error::source(&error).is_some());
    }
}
