//! Search API client producing normalized ranking pages.
//!
//! [`RankFetcher`] is the seam the rate limiter drives. [`SerpClient`] is the
//! production implementation against a SerpApi-compatible JSON endpoint.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode, Url};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::url::domain_of;

const DEFAULT_BASE_URL: &str = "https://serpapi.com/";

/// Environment variable holding the search API key.
pub const API_KEY_ENV: &str = "RANKCARD_SERP_API_KEY";

/// Failure classes for a single ranking lookup.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FetchError {
    /// HTTP 429. `retry_after_secs` is the server's `Retry-After` hint, if any.
    #[error("rate limited by search API (retry after {retry_after_secs:?}s)")]
    RateLimited { retry_after_secs: Option<u64> },

    /// Timeout, connection failure or 5xx.
    #[error("transient network error: {0}")]
    TransientNetwork(String),

    /// Malformed request, bad credentials, invalid keyword, undecodable body.
    #[error("request rejected: {0}")]
    TerminalRequest(String),
}

impl FetchError {
    pub fn is_retryable(&self) -> bool {
        !matches!(self, FetchError::TerminalRequest(_))
    }
}

/// One organic result in the combined ordering for a keyword.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResultEntry {
    pub url: String,
    pub domain: String,
    /// Absolute 1-based rank as reported for this page.
    pub position: u32,
}

/// One fetched page of results for one keyword.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RankingPage {
    pub keyword: String,
    pub page: u32,
    pub entries: Vec<ResultEntry>,
}

/// Issues one ranking lookup for a `(keyword, page)` pair.
#[async_trait]
pub trait RankFetcher: Send + Sync {
    async fn fetch(&self, keyword: &str, page: u32) -> Result<RankingPage, FetchError>;
}

/// Client for a SerpApi-compatible search endpoint.
pub struct SerpClient {
    client: Client,
    api_key: String,
    base_url: Url,
    engine: String,
    results_per_page: u32,
}

#[derive(Debug, Deserialize)]
struct SearchResponse {
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    organic_results: Vec<OrganicResult>,
}

#[derive(Debug, Deserialize)]
struct OrganicResult {
    #[serde(default)]
    link: Option<String>,
}

impl SerpClient {
    pub fn new(
        api_key: &str,
        engine: &str,
        results_per_page: u32,
        timeout_secs: u64,
    ) -> Result<Self, FetchError> {
        Self::with_base_url(api_key, engine, results_per_page, timeout_secs, DEFAULT_BASE_URL)
    }

    /// Creates a client with a custom base URL (for testing with wiremock).
    pub fn with_base_url(
        api_key: &str,
        engine: &str,
        results_per_page: u32,
        timeout_secs: u64,
        base_url: &str,
    ) -> Result<Self, FetchError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .connect_timeout(Duration::from_secs(10))
            .user_agent("rankcard/0.1 (rank-tracking)")
            .build()
            .map_err(|e| FetchError::TerminalRequest(format!("cannot build HTTP client: {e}")))?;

        let normalised = format!("{}/", base_url.trim_end_matches('/'));
        let base_url = Url::parse(&normalised).map_err(|e| {
            FetchError::TerminalRequest(format!("invalid base URL '{base_url}': {e}"))
        })?;

        Ok(Self {
            client,
            api_key: api_key.to_owned(),
            base_url,
            engine: engine.to_owned(),
            results_per_page: results_per_page.max(1),
        })
    }

    fn search_url(&self, keyword: &str, page: u32) -> Result<Url, FetchError> {
        let mut url = self
            .base_url
            .join("search")
            .map_err(|e| FetchError::TerminalRequest(e.to_string()))?;
        let start = page.saturating_sub(1) * self.results_per_page;
        url.query_pairs_mut()
            .append_pair("engine", &self.engine)
            .append_pair("q", keyword)
            .append_pair("start", &start.to_string())
            .append_pair("num", &self.results_per_page.to_string())
            .append_pair("output", "json")
            .append_pair("api_key", &self.api_key);
        Ok(url)
    }
}

#[async_trait]
impl RankFetcher for SerpClient {
    async fn fetch(&self, keyword: &str, page: u32) -> Result<RankingPage, FetchError> {
        if keyword.trim().is_empty() {
            return Err(FetchError::TerminalRequest("empty keyword".into()));
        }
        if page == 0 {
            return Err(FetchError::TerminalRequest("pages are 1-based".into()));
        }

        let url = self.search_url(keyword, page)?;
        let response = self.client.get(url).send().await.map_err(classify_transport)?;

        let status = response.status();
        if !status.is_success() {
            let retry_after = response
                .headers()
                .get(reqwest::header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.trim().parse::<u64>().ok());
            let body = response.text().await.unwrap_or_default();
            return Err(classify_status(status, retry_after, &body));
        }

        let body: SearchResponse = response
            .json()
            .await
            .map_err(|e| FetchError::TerminalRequest(format!("undecodable response for '{keyword}': {e}")))?;

        if let Some(message) = body.error {
            if message.to_lowercase().contains("rate limit") {
                return Err(FetchError::RateLimited { retry_after_secs: None });
            }
            return Err(FetchError::TerminalRequest(message));
        }

        Ok(normalize_page(keyword, page, self.results_per_page, body.organic_results))
    }
}

fn normalize_page(
    keyword: &str,
    page: u32,
    results_per_page: u32,
    results: Vec<OrganicResult>,
) -> RankingPage {
    let offset = page.saturating_sub(1) * results_per_page;
    let entries = results
        .into_iter()
        .filter_map(|r| {
            let link = r.link?;
            let domain = domain_of(&link)?;
            Some((link, domain))
        })
        .enumerate()
        .map(|(i, (url, domain))| ResultEntry {
            url,
            domain,
            position: offset + i as u32 + 1,
        })
        .collect();
    RankingPage {
        keyword: keyword.to_string(),
        page,
        entries,
    }
}

fn classify_transport(e: reqwest::Error) -> FetchError {
    if e.is_timeout() || e.is_connect() || e.is_request() {
        FetchError::TransientNetwork(e.to_string())
    } else {
        FetchError::TerminalRequest(e.to_string())
    }
}

fn classify_status(status: StatusCode, retry_after: Option<u64>, body: &str) -> FetchError {
    let snippet: String = body.chars().take(200).collect();
    match status {
        StatusCode::TOO_MANY_REQUESTS => FetchError::RateLimited {
            retry_after_secs: retry_after,
        },
        StatusCode::REQUEST_TIMEOUT => FetchError::TransientNetwork(format!("HTTP {status}")),
        s if s.is_server_error() => FetchError::TransientNetwork(format!("HTTP {s}: {snippet}")),
        s => FetchError::TerminalRequest(format!("HTTP {s}: {snippet}")),
    }
}
