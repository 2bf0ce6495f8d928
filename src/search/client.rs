//! HTTP client for the provider's search protocol.
//!
//! Dispatch, result polling, bundle export, and session termination live
//! here. The client is cheap to clone and shares one connection pool plus
//! one [`TransferCounter`] across clones.

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use futures_util::StreamExt;
use reqwest::{Client, ClientBuilder, Proxy};
use serde::{Deserialize, Serialize};
use tokio::fs::File;
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::time::{Instant, sleep};
use tracing::{debug, instrument};
use url::Url;

use super::error::SearchError;
use super::{SearchPage, SearchRecord, SearchWindow, SortOrder};
use crate::store::PROVIDER_DATE_FORMAT;

/// Default provider API endpoint.
pub const DEFAULT_BASE_URL: &str = "https://2.intelx.io";

/// Connection timeout in seconds.
const CONNECT_TIMEOUT_SECS: u64 = 30;

/// Read timeout in seconds. Bundle exports can be large.
const READ_TIMEOUT_SECS: u64 = 300;

/// Header carrying the API key.
const API_KEY_HEADER: &str = "x-key";

// Status codes of the result-poll endpoint.
const RESULT_MORE_AVAILABLE: i64 = 0;
const RESULT_FINISHED: i64 = 1;
const RESULT_SESSION_UNKNOWN: i64 = 2;
const RESULT_PENDING: i64 = 3;

// Status codes of the dispatch endpoint.
const DISPATCH_OK: i64 = 0;
const DISPATCH_INVALID_TERM: i64 = 1;

/// Tuning knobs for [`SearchClient`].
#[derive(Debug, Clone)]
pub struct SearchClientOptions {
    /// Optional HTTP(S) proxy applied to all provider traffic.
    pub proxy_url: Option<String>,
    /// Wait between dispatching a search and the first result poll, so
    /// the provider has time to sort.
    pub sort_settle: Duration,
    /// Delay between result polls while the session is still working.
    pub poll_interval: Duration,
    /// Overall deadline for collecting one page of results.
    pub result_deadline: Duration,
}

impl Default for SearchClientOptions {
    fn default() -> Self {
        Self {
            proxy_url: None,
            sort_settle: Duration::from_secs(2),
            poll_interval: Duration::from_secs(1),
            result_deadline: Duration::from_secs(90),
        }
    }
}

/// Shared counter of bytes streamed by the most recent bundle download.
///
/// The progress reporter polls this while a download is in flight; the
/// counter is reset at the start of every bundle download.
#[derive(Debug, Clone, Default)]
pub struct TransferCounter(Arc<AtomicU64>);

impl TransferCounter {
    /// Bytes transferred so far.
    #[must_use]
    pub fn total(&self) -> u64 {
        self.0.load(Ordering::SeqCst)
    }

    fn add(&self, bytes: u64) {
        self.0.fetch_add(bytes, Ordering::SeqCst);
    }

    fn reset(&self) {
        self.0.store(0, Ordering::SeqCst);
    }
}

/// Client for the provider's search, export, and terminate endpoints.
#[derive(Debug, Clone)]
pub struct SearchClient {
    client: Client,
    base_url: String,
    api_key: String,
    counter: TransferCounter,
    options: SearchClientOptions,
}

#[derive(Debug, Serialize)]
struct SearchRequest<'a> {
    term: &'a str,
    buckets: Vec<String>,
    lookuplevel: i64,
    maxresults: usize,
    timeout: i64,
    datefrom: String,
    dateto: String,
    sort: u8,
    media: i64,
    terminate: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct SearchDispatch {
    #[serde(default)]
    id: String,
    #[serde(default, rename = "softselectorwarning")]
    soft_selector_warning: bool,
    #[serde(default)]
    status: i64,
}

#[derive(Debug, Deserialize)]
struct ResultBatch {
    #[serde(default)]
    status: i64,
    #[serde(default)]
    records: Vec<SearchRecord>,
}

impl SearchClient {
    /// Creates a client with default options.
    ///
    /// # Errors
    ///
    /// Returns [`SearchError::InvalidBaseUrl`] when the base URL does not
    /// parse, or a network error when the HTTP client cannot be built.
    pub fn new(base_url: &str, api_key: &str) -> Result<Self, SearchError> {
        Self::with_options(base_url, api_key, SearchClientOptions::default())
    }

    /// Creates a client with explicit options.
    ///
    /// # Errors
    ///
    /// Returns [`SearchError::InvalidBaseUrl`] when the base URL does not
    /// parse, [`SearchError::InvalidProxy`] when the proxy URL is rejected,
    /// or a network error when the HTTP client cannot be built.
    pub fn with_options(
        base_url: &str,
        api_key: &str,
        options: SearchClientOptions,
    ) -> Result<Self, SearchError> {
        Url::parse(base_url).map_err(|_| SearchError::InvalidBaseUrl {
            url: base_url.to_string(),
        })?;

        let mut builder = ClientBuilder::new()
            .connect_timeout(Duration::from_secs(CONNECT_TIMEOUT_SECS))
            .read_timeout(Duration::from_secs(READ_TIMEOUT_SECS))
            .gzip(true);

        if let Some(proxy_url) = options.proxy_url.as_deref() {
            let proxy = Proxy::all(proxy_url).map_err(|e| SearchError::InvalidProxy {
                url: proxy_url.to_string(),
                source: e,
            })?;
            builder = builder.proxy(proxy);
        }

        let client = builder
            .build()
            .map_err(|e| SearchError::network(base_url, e))?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            counter: TransferCounter::default(),
            options,
        })
    }

    /// Returns a handle to the shared transfer counter.
    #[must_use]
    pub fn transfer_counter(&self) -> TransferCounter {
        self.counter.clone()
    }

    /// Runs a windowed search and collects up to `limit` records.
    ///
    /// Dispatches the query, waits for the provider to sort, then polls
    /// the result endpoint until the session reports completion, the page
    /// limit is reached, or the result deadline passes.
    ///
    /// # Errors
    ///
    /// Returns [`SearchError::InvalidSelector`] when the provider rejects
    /// the term, and network, API status, or protocol errors otherwise.
    #[instrument(skip(self, window), fields(term = %term))]
    pub async fn search(
        &self,
        term: &str,
        window: &SearchWindow,
        sort: SortOrder,
        limit: usize,
    ) -> Result<SearchPage, SearchError> {
        let url = format!("{}/intelligent/search", self.base_url);
        let request = SearchRequest {
            term,
            buckets: Vec::new(),
            lookuplevel: 0,
            maxresults: limit,
            timeout: 0,
            datefrom: window.from.format(PROVIDER_DATE_FORMAT).to_string(),
            dateto: window.to.format(PROVIDER_DATE_FORMAT).to_string(),
            sort: sort.as_param(),
            media: 0,
            terminate: Vec::new(),
        };

        let response = self
            .client
            .post(&url)
            .header(API_KEY_HEADER, &self.api_key)
            .json(&request)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    SearchError::timeout(&url)
                } else {
                    SearchError::network(&url, e)
                }
            })?;

        let status = response.status();
        if status.as_u16() == 400 {
            // The provider answers 400 when the term is not a selector it
            // understands.
            return Err(SearchError::invalid_selector(term));
        }
        if !status.is_success() {
            return Err(SearchError::api(&url, status.as_u16()));
        }

        let dispatch: SearchDispatch = response
            .json()
            .await
            .map_err(|e| SearchError::protocol(&url, e.to_string()))?;

        if dispatch.soft_selector_warning || dispatch.status == DISPATCH_INVALID_TERM {
            return Err(SearchError::invalid_selector(term));
        }
        if dispatch.status != DISPATCH_OK {
            return Err(SearchError::protocol(
                &url,
                format!("search refused with dispatch status {}", dispatch.status),
            ));
        }
        if dispatch.id.is_empty() {
            return Err(SearchError::protocol(&url, "response carried no search id"));
        }
        debug!(session_id = %dispatch.id, "search dispatched");

        sleep(self.options.sort_settle).await;

        let records = self.collect_results(&dispatch.id, limit).await?;
        Ok(SearchPage {
            session_id: dispatch.id,
            records,
        })
    }

    async fn collect_results(
        &self,
        session_id: &str,
        limit: usize,
    ) -> Result<Vec<SearchRecord>, SearchError> {
        let url = format!("{}/intelligent/search/result", self.base_url);
        let limit_param = limit.to_string();
        let deadline = Instant::now() + self.options.result_deadline;
        let mut records: Vec<SearchRecord> = Vec::new();

        loop {
            let response = self
                .client
                .get(&url)
                .header(API_KEY_HEADER, &self.api_key)
                .query(&[("id", session_id), ("limit", limit_param.as_str())])
                .send()
                .await
                .map_err(|e| {
                    if e.is_timeout() {
                        SearchError::timeout(&url)
                    } else {
                        SearchError::network(&url, e)
                    }
                })?;

            if !response.status().is_success() {
                return Err(SearchError::api(&url, response.status().as_u16()));
            }

            let batch: ResultBatch = response
                .json()
                .await
                .map_err(|e| SearchError::protocol(&url, e.to_string()))?;

            let received = batch.records.len();
            records.extend(batch.records);
            debug!(received, collected = records.len(), status = batch.status, "result poll");

            match batch.status {
                RESULT_FINISHED => break,
                RESULT_SESSION_UNKNOWN => {
                    return Err(SearchError::protocol(
                        &url,
                        format!("unknown search session {session_id}"),
                    ));
                }
                RESULT_MORE_AVAILABLE | RESULT_PENDING => {
                    if records.len() >= limit {
                        break;
                    }
                    if Instant::now() >= deadline {
                        debug!(collected = records.len(), "result deadline reached");
                        break;
                    }
                    sleep(self.options.poll_interval).await;
                }
                other => {
                    return Err(SearchError::protocol(
                        &url,
                        format!("unknown result status {other}"),
                    ));
                }
            }
        }

        records.truncate(limit);
        Ok(records)
    }

    /// Streams the session's artifact bundle to `dest`, returning the
    /// number of bytes written.
    ///
    /// The shared transfer counter is reset first and then advanced chunk
    /// by chunk, so a concurrent observer sees live progress.
    ///
    /// # Errors
    ///
    /// Returns network, API status, or IO errors. The content of the
    /// bundle is not inspected here; callers verify it is a zip.
    #[instrument(skip(self, dest), fields(session_id = %session_id, dest = %dest.display()))]
    pub async fn download_bundle(
        &self,
        session_id: &str,
        limit: usize,
        dest: &Path,
    ) -> Result<u64, SearchError> {
        let url = format!("{}/intelligent/search/export", self.base_url);
        self.counter.reset();

        let limit_param = limit.to_string();
        let response = self
            .client
            .get(&url)
            .header(API_KEY_HEADER, &self.api_key)
            // f=1 selects the zip bundle export
            .query(&[
                ("id", session_id),
                ("limit", limit_param.as_str()),
                ("f", "1"),
            ])
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    SearchError::timeout(&url)
                } else {
                    SearchError::network(&url, e)
                }
            })?;

        if !response.status().is_success() {
            return Err(SearchError::api(&url, response.status().as_u16()));
        }

        let file = File::create(dest)
            .await
            .map_err(|e| SearchError::io(dest.to_path_buf(), e))?;
        let mut writer = BufWriter::new(file);
        let mut stream = response.bytes_stream();
        let mut bytes_written: u64 = 0;

        while let Some(chunk_result) = stream.next().await {
            let chunk = chunk_result.map_err(|e| SearchError::network(&url, e))?;
            writer
                .write_all(&chunk)
                .await
                .map_err(|e| SearchError::io(dest.to_path_buf(), e))?;
            bytes_written += chunk.len() as u64;
            self.counter.add(chunk.len() as u64);
        }

        writer
            .flush()
            .await
            .map_err(|e| SearchError::io(dest.to_path_buf(), e))?;

        debug!(bytes = bytes_written, "bundle download complete");
        Ok(bytes_written)
    }

    /// Tells the provider the session is no longer needed.
    ///
    /// Best effort: failures are logged and swallowed, a session the
    /// provider eventually expires on its own is not worth failing a run.
    #[instrument(skip(self), fields(session_id = %session_id))]
    pub async fn terminate(&self, session_id: &str) {
        let url = format!("{}/intelligent/search/terminate", self.base_url);
        match self
            .client
            .get(&url)
            .header(API_KEY_HEADER, &self.api_key)
            .query(&[("id", session_id)])
            .send()
            .await
        {
            Ok(response) => debug!(status = %response.status(), "search session terminated"),
            Err(error) => debug!(%error, "failed to terminate search session"),
        }
    }
}
