pub mod collector;
pub mod fetcher;
pub mod rate_limit;

use std::sync::atomic::{AtomicBool, Ordering};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use rusqlite::Connection;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::storage::repository;

/// Tunables for a collection pass. Loaded from `app_config`, with defaults
/// matching the search provider's sustained-rate budget.
#[derive(Debug, Clone)]
pub struct CollectorSettings {
    pub site_domain: String,
    pub serp_base_url: String,
    pub serp_engine: String,
    pub results_per_page: u32,
    pub pages_per_keyword: u32,
    /// Minimum spacing between any two external calls, success or not.
    pub call_delay: Duration,
    /// Extra pause between keywords on top of `call_delay`.
    pub keyword_delay: Duration,
    /// Pause after a keyword fails terminally, instead of `keyword_delay`.
    pub error_delay: Duration,
    pub backoff_base: Duration,
    pub max_backoff: Duration,
    pub max_jitter: Duration,
    pub max_retries: u32,
    /// Consecutive rate-limit responses that open a keyword's breaker.
    pub breaker_threshold: u32,
    pub request_timeout_secs: u64,
    /// A `running` batch row older than this belongs to a dead process.
    pub batch_stale_secs: u64,
}

impl Default for CollectorSettings {
    fn default() -> Self {
        Self {
            site_domain: String::new(),
            serp_base_url: "https://serpapi.com/".into(),
            serp_engine: "google".into(),
            results_per_page: 10,
            pages_per_keyword: 2,
            call_delay: Duration::from_millis(4_000),
            keyword_delay: Duration::from_millis(8_000),
            error_delay: Duration::from_millis(15_000),
            backoff_base: Duration::from_millis(5_000),
            max_backoff: Duration::from_millis(60_000),
            max_jitter: Duration::from_millis(2_000),
            max_retries: 5,
            breaker_threshold: 3,
            request_timeout_secs: 30,
            batch_stale_secs: 86_400,
        }
    }
}

impl CollectorSettings {
    /// Read settings from `app_config`, falling back to defaults for unset keys.
    pub fn load(conn: &Connection) -> Result<Self> {
        let mut s = Self::default();
        if let Some(v) = repository::get_config(conn, "site_domain")? {
            s.site_domain = v;
        }
        if let Some(v) = repository::get_config(conn, "serp_base_url")? {
            s.serp_base_url = v;
        }
        if let Some(v) = repository::get_config(conn, "serp_engine")? {
            s.serp_engine = v;
        }
        s.results_per_page = config_num(conn, "results_per_page", s.results_per_page)?;
        s.pages_per_keyword = config_num(conn, "pages_per_keyword", s.pages_per_keyword)?;
        s.call_delay = config_ms(conn, "call_delay_ms", s.call_delay)?;
        s.keyword_delay = config_ms(conn, "keyword_delay_ms", s.keyword_delay)?;
        s.error_delay = config_ms(conn, "error_delay_ms", s.error_delay)?;
        s.backoff_base = config_ms(conn, "backoff_base_ms", s.backoff_base)?;
        s.max_backoff = config_ms(conn, "max_backoff_ms", s.max_backoff)?;
        s.max_jitter = config_ms(conn, "max_jitter_ms", s.max_jitter)?;
        s.max_retries = config_num(conn, "max_retries", s.max_retries)?;
        s.breaker_threshold = config_num(conn, "breaker_threshold", s.breaker_threshold)?;
        s.request_timeout_secs =
            config_num(conn, "request_timeout_secs", s.request_timeout_secs)?;
        s.batch_stale_secs = config_num(conn, "batch_stale_secs", s.batch_stale_secs)?;
        s.validate()?;
        Ok(s)
    }

    pub fn validate(&self) -> Result<()> {
        if self.site_domain.trim().is_empty() {
            return Err(Error::Config(
                "site_domain is not set. Run: rankcard config set site_domain <domain>".into(),
            ));
        }
        if self.pages_per_keyword == 0 || self.results_per_page == 0 {
            return Err(Error::Config(
                "pages_per_keyword and results_per_page must be at least 1".into(),
            ));
        }
        if self.breaker_threshold == 0 {
            return Err(Error::Config("breaker_threshold must be at least 1".into()));
        }
        if self.request_timeout_secs == 0 {
            return Err(Error::Config("request_timeout_secs must be at least 1".into()));
        }
        Ok(())
    }

    /// Settings with every delay zeroed (for tests).
    pub fn without_delays(site_domain: &str) -> Self {
        Self {
            site_domain: site_domain.to_string(),
            call_delay: Duration::ZERO,
            keyword_delay: Duration::ZERO,
            error_delay: Duration::ZERO,
            backoff_base: Duration::ZERO,
            max_backoff: Duration::ZERO,
            max_jitter: Duration::ZERO,
            ..Self::default()
        }
    }
}

fn config_num<T: FromStr>(conn: &Connection, key: &str, default: T) -> Result<T> {
    match repository::get_config(conn, key)? {
        Some(v) => v
            .trim()
            .parse()
            .map_err(|_| Error::Config(format!("{key} must be a non-negative integer, got '{v}'"))),
        None => Ok(default),
    }
}

fn config_ms(conn: &Connection, key: &str, default: Duration) -> Result<Duration> {
    match repository::get_config(conn, key)? {
        Some(v) => v
            .trim()
            .parse::<u64>()
            .map(Duration::from_millis)
            .map_err(|_| Error::Config(format!("{key} must be milliseconds, got '{v}'"))),
        None => Ok(default),
    }
}

/// How a single keyword ended in a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeywordOutcome {
    Succeeded,
    Failed,
    CircuitBroken,
    Skipped,
}

/// Per-keyword line in a batch summary.
#[derive(Debug, Clone, Serialize)]
pub struct KeywordResult {
    pub keyword_id: i64,
    pub phrase: String,
    pub outcome: KeywordOutcome,
    pub pages_fetched: u32,
    pub position: Option<u32>,
    pub detail: Option<String>,
}

/// Summary of one collection pass.
#[derive(Debug, Clone, Default, Serialize)]
pub struct BatchRunStats {
    pub run_id: Option<i64>,
    pub submitted: u32,
    pub processed: u32,
    pub succeeded: u32,
    pub failed: u32,
    pub circuit_broken: u32,
    pub skipped: u32,
    /// Keyword ids whose breaker opened during the run.
    pub tripped_keywords: Vec<i64>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub results: Vec<KeywordResult>,
}

impl BatchRunStats {
    pub fn new(run_id: Option<i64>, submitted: u32) -> Self {
        Self {
            run_id,
            submitted,
            ..Self::default()
        }
    }

    pub fn record(&mut self, result: KeywordResult) {
        match result.outcome {
            KeywordOutcome::Succeeded => self.succeeded += 1,
            KeywordOutcome::Failed => self.failed += 1,
            KeywordOutcome::CircuitBroken => {
                self.circuit_broken += 1;
                self.tripped_keywords.push(result.keyword_id);
            }
            KeywordOutcome::Skipped => self.skipped += 1,
        }
        if result.outcome != KeywordOutcome::Skipped {
            self.processed += 1;
        }
        self.results.push(result);
    }

    pub fn circuit_tripped(&self, keyword_id: i64) -> bool {
        self.tripped_keywords.contains(&keyword_id)
    }

    /// Every submitted keyword is accounted for exactly once.
    pub fn is_balanced(&self) -> bool {
        self.succeeded + self.failed + self.circuit_broken + self.skipped == self.submitted
    }
}

/// Operational view of the current or most recent batch.
#[derive(Debug, Clone, Serialize)]
pub struct BatchStatus {
    pub running: bool,
    pub status: String,
    pub started_at: Option<String>,
    pub completed_at: Option<String>,
    pub stats: BatchRunStats,
    pub error: Option<String>,
}

/// Progress callbacks for a collection pass.
pub trait CollectProgress: Send + Sync {
    fn on_keyword_start(&self, _phrase: &str, _index: usize, _total: usize) {}
    fn on_page_fetched(&self, _phrase: &str, _page: u32, _results: usize) {}
    fn on_keyword_complete(&self, _result: &KeywordResult) {}
}

pub struct NoopProgress;

impl CollectProgress for NoopProgress {}

/// Cooperative stop signal, checked between keywords.
#[derive(Debug, Clone, Default)]
pub struct StopHandle(Arc<AtomicBool>);

impl StopHandle {
    pub fn stop(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_stopped(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    pub(crate) fn reset(&self) {
        self.0.store(false, Ordering::SeqCst);
    }
}
