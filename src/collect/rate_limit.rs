//! Pacing, backoff and per-keyword circuit breaking around a [`RankFetcher`].
//!
//! All state here is owned by one batch run. Nothing is process-global, so two
//! runs (or two shards of one run) never share breaker counters.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;

use super::fetcher::{FetchError, RankFetcher, RankingPage};
use super::CollectorSettings;

/// Exponential backoff with bounded jitter.
#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub max: Duration,
    pub max_jitter: Duration,
    pub max_retries: u32,
}

impl BackoffPolicy {
    pub fn from_settings(settings: &CollectorSettings) -> Self {
        Self {
            base: settings.backoff_base,
            max: settings.max_backoff,
            max_jitter: settings.max_jitter,
            max_retries: settings.max_retries,
        }
    }

    /// `base * 2^attempt + jitter`, capped at `max`.
    pub fn delay(&self, attempt: u32, jitter: Duration) -> Duration {
        let factor = 1u32 << attempt.min(20);
        let exponential = self.base.saturating_mul(factor);
        exponential.saturating_add(jitter).min(self.max)
    }

    fn random_jitter(&self) -> Duration {
        if self.max_jitter.is_zero() {
            return Duration::ZERO;
        }
        self.max_jitter.mul_f64(rand::random::<f64>())
    }
}

/// Breaker state for one keyword's pages within one run.
#[derive(Debug, Clone)]
pub struct KeywordCircuit {
    consecutive_rate_limits: u32,
    threshold: u32,
    open: bool,
}

impl KeywordCircuit {
    pub fn new(threshold: u32) -> Self {
        Self {
            consecutive_rate_limits: 0,
            threshold: threshold.max(1),
            open: false,
        }
    }

    /// Count a rate-limit response. Returns true when this one opens the breaker.
    pub fn record_rate_limit(&mut self) -> bool {
        self.consecutive_rate_limits += 1;
        if !self.open && self.consecutive_rate_limits >= self.threshold {
            self.open = true;
            return true;
        }
        false
    }

    pub fn record_success(&mut self) {
        self.consecutive_rate_limits = 0;
    }

    pub fn is_open(&self) -> bool {
        self.open
    }

    pub fn consecutive_rate_limits(&self) -> u32 {
        self.consecutive_rate_limits
    }
}

/// Result of one paced, retried page lookup.
#[derive(Debug)]
pub enum PageFetch {
    Fetched(RankingPage),
    /// Breaker is (or just went) open; fetch nothing more for this keyword.
    CircuitOpen,
    Failed(FetchError),
}

/// Wraps a fetcher with call spacing, retries and breaker bookkeeping.
pub struct RateLimiter {
    fetcher: Arc<dyn RankFetcher>,
    policy: BackoffPolicy,
    call_delay: Duration,
    last_call: Option<Instant>,
    calls: u64,
}

impl RateLimiter {
    pub fn new(fetcher: Arc<dyn RankFetcher>, settings: &CollectorSettings) -> Self {
        Self {
            fetcher,
            policy: BackoffPolicy::from_settings(settings),
            call_delay: settings.call_delay,
            last_call: None,
            calls: 0,
        }
    }

    /// External calls issued so far (including retries).
    pub fn calls(&self) -> u64 {
        self.calls
    }

    /// Fetch one page, retrying transient failures.
    ///
    /// Rate-limit responses feed `circuit`; once it opens no further attempt
    /// is made. Terminal errors return immediately without retry.
    pub async fn fetch(
        &mut self,
        keyword: &str,
        page: u32,
        circuit: &mut KeywordCircuit,
    ) -> PageFetch {
        if circuit.is_open() {
            return PageFetch::CircuitOpen;
        }

        let mut attempt: u32 = 0;
        loop {
            self.pace().await;
            let result = self.fetcher.fetch(keyword, page).await;
            self.last_call = Some(Instant::now());
            self.calls += 1;

            let err = match result {
                Ok(ranking) => {
                    circuit.record_success();
                    return PageFetch::Fetched(ranking);
                }
                Err(e) => e,
            };

            if !err.is_retryable() {
                log::error!("Terminal error for '{keyword}' page {page}: {err}");
                return PageFetch::Failed(err);
            }

            let mut floor = Duration::ZERO;
            if let FetchError::RateLimited { retry_after_secs } = &err {
                if circuit.record_rate_limit() {
                    log::warn!(
                        "Circuit opened for '{keyword}' at page {page} after {} consecutive rate limits",
                        circuit.consecutive_rate_limits()
                    );
                    return PageFetch::CircuitOpen;
                }
                floor = Duration::from_secs(retry_after_secs.unwrap_or(0));
            }

            if attempt >= self.policy.max_retries {
                log::error!(
                    "Giving up on '{keyword}' page {page} after {} attempts: {err}",
                    attempt + 1
                );
                return PageFetch::Failed(err);
            }

            let wait = self
                .policy
                .delay(attempt, self.policy.random_jitter())
                .max(floor);
            log::warn!(
                "{err} for '{keyword}' page {page}. Waiting {}ms before retry {}/{}",
                wait.as_millis(),
                attempt + 1,
                self.policy.max_retries
            );
            tokio::time::sleep(wait).await;
            attempt += 1;
        }
    }

    /// Sleep `extra`, then restart the call spacing so the next call still
    /// waits a full `call_delay` after the pause.
    pub async fn pause(&mut self, extra: Duration) {
        if extra.is_zero() {
            return;
        }
        tokio::time::sleep(extra).await;
        if self.last_call.is_some() {
            self.last_call = Some(Instant::now());
        }
    }

    /// Enforce the minimum spacing since the previous external call.
    async fn pace(&self) {
        if let Some(last) = self.last_call {
            let elapsed = last.elapsed();
            if elapsed < self.call_delay {
                let wait = self.call_delay - elapsed;
                log::debug!("Pacing: waiting {}ms before next call", wait.as_millis());
                tokio::time::sleep(wait).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    use async_trait::async_trait;

    /// Replays scripted responses in order; repeats the last one when exhausted.
    struct ScriptedFetcher {
        script: Mutex<VecDeque<Result<(), FetchError>>>,
        calls: Mutex<Vec<u32>>,
    }

    impl ScriptedFetcher {
        fn new(script: Vec<Result<(), FetchError>>) -> Arc<Self> {
            Arc::new(Self {
                script: Mutex::new(script.into()),
                calls: Mutex::new(Vec::new()),
            })
        }

        fn call_count(&self) -> usize {
            self.calls.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl RankFetcher for ScriptedFetcher {
        async fn fetch(&self, keyword: &str, page: u32) -> Result<RankingPage, FetchError> {
            self.calls.lock().unwrap().push(page);
            let mut script = self.script.lock().unwrap();
            let next = if script.len() > 1 {
                script.pop_front().unwrap()
            } else {
                script.front().cloned().unwrap_or(Ok(()))
            };
            next.map(|_| RankingPage {
                keyword: keyword.to_string(),
                page,
                entries: Vec::new(),
            })
        }
    }

    fn rate_limited() -> Result<(), FetchError> {
        Err(FetchError::RateLimited {
            retry_after_secs: None,
        })
    }

    fn settings() -> CollectorSettings {
        CollectorSettings::without_delays("example.com")
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let policy = BackoffPolicy {
            base: Duration::from_secs(5),
            max: Duration::from_secs(60),
            max_jitter: Duration::from_secs(2),
            max_retries: 5,
        };
        assert_eq!(policy.delay(0, Duration::ZERO), Duration::from_secs(5));
        assert_eq!(policy.delay(1, Duration::ZERO), Duration::from_secs(10));
        assert_eq!(policy.delay(2, Duration::from_secs(1)), Duration::from_secs(21));
        assert_eq!(policy.delay(4, Duration::ZERO), Duration::from_secs(60));
        assert_eq!(policy.delay(30, Duration::from_secs(2)), Duration::from_secs(60));
    }

    #[test]
    fn test_jitter_is_bounded() {
        let policy = BackoffPolicy {
            base: Duration::ZERO,
            max: Duration::from_secs(60),
            max_jitter: Duration::from_secs(2),
            max_retries: 1,
        };
        for _ in 0..100 {
            assert!(policy.random_jitter() <= Duration::from_secs(2));
        }
    }

    #[test]
    fn test_circuit_opens_at_threshold_and_resets_on_success() {
        let mut circuit = KeywordCircuit::new(3);
        assert!(!circuit.record_rate_limit());
        assert!(!circuit.record_rate_limit());
        circuit.record_success();
        assert_eq!(circuit.consecutive_rate_limits(), 0);
        assert!(!circuit.record_rate_limit());
        assert!(!circuit.record_rate_limit());
        assert!(circuit.record_rate_limit());
        assert!(circuit.is_open());
        // Stays open, reports the trip only once.
        assert!(!circuit.record_rate_limit());
    }

    #[tokio::test]
    async fn test_success_fetches_once() {
        let fetcher = ScriptedFetcher::new(vec![Ok(())]);
        let mut limiter = RateLimiter::new(fetcher.clone(), &settings());
        let mut circuit = KeywordCircuit::new(3);

        let result = limiter.fetch("kw", 1, &mut circuit).await;
        assert!(matches!(result, PageFetch::Fetched(_)));
        assert_eq!(fetcher.call_count(), 1);
    }

    #[tokio::test]
    async fn test_rate_limit_retried_then_succeeds_and_resets_counter() {
        let fetcher = ScriptedFetcher::new(vec![rate_limited(), rate_limited(), Ok(())]);
        let mut limiter = RateLimiter::new(fetcher.clone(), &settings());
        let mut circuit = KeywordCircuit::new(3);

        let result = limiter.fetch("kw", 1, &mut circuit).await;
        assert!(matches!(result, PageFetch::Fetched(_)));
        assert_eq!(fetcher.call_count(), 3);
        assert_eq!(circuit.consecutive_rate_limits(), 0);
        assert!(!circuit.is_open());
    }

    #[tokio::test]
    async fn test_three_consecutive_rate_limits_open_circuit() {
        let fetcher = ScriptedFetcher::new(vec![rate_limited()]);
        let mut limiter = RateLimiter::new(fetcher.clone(), &settings());
        let mut circuit = KeywordCircuit::new(3);

        let result = limiter.fetch("kw", 1, &mut circuit).await;
        assert!(matches!(result, PageFetch::CircuitOpen));
        assert_eq!(fetcher.call_count(), 3);

        // Open breaker short-circuits without another external call.
        let again = limiter.fetch("kw", 2, &mut circuit).await;
        assert!(matches!(again, PageFetch::CircuitOpen));
        assert_eq!(fetcher.call_count(), 3);
    }

    #[tokio::test]
    async fn test_rate_limits_count_across_pages() {
        // Page 1: two 429s then success resets. Page 2: three 429s trip.
        let fetcher = ScriptedFetcher::new(vec![
            rate_limited(),
            Ok(()),
            rate_limited(),
            rate_limited(),
            rate_limited(),
        ]);
        let mut limiter = RateLimiter::new(fetcher.clone(), &settings());
        let mut circuit = KeywordCircuit::new(3);

        assert!(matches!(
            limiter.fetch("kw", 1, &mut circuit).await,
            PageFetch::Fetched(_)
        ));
        assert!(matches!(
            limiter.fetch("kw", 2, &mut circuit).await,
            PageFetch::CircuitOpen
        ));
        assert_eq!(fetcher.call_count(), 5);
    }

    #[tokio::test]
    async fn test_terminal_error_not_retried_and_does_not_trip() {
        let fetcher =
            ScriptedFetcher::new(vec![Err(FetchError::TerminalRequest("bad key".into()))]);
        let mut limiter = RateLimiter::new(fetcher.clone(), &settings());
        let mut circuit = KeywordCircuit::new(3);

        let result = limiter.fetch("kw", 1, &mut circuit).await;
        assert!(matches!(
            result,
            PageFetch::Failed(FetchError::TerminalRequest(_))
        ));
        assert_eq!(fetcher.call_count(), 1);
        assert!(!circuit.is_open());
    }

    #[tokio::test]
    async fn test_transient_errors_exhaust_retry_ceiling() {
        let fetcher =
            ScriptedFetcher::new(vec![Err(FetchError::TransientNetwork("timeout".into()))]);
        let mut s = settings();
        s.max_retries = 2;
        let mut limiter = RateLimiter::new(fetcher.clone(), &s);
        let mut circuit = KeywordCircuit::new(3);

        let result = limiter.fetch("kw", 1, &mut circuit).await;
        assert!(matches!(
            result,
            PageFetch::Failed(FetchError::TransientNetwork(_))
        ));
        // First try plus two retries.
        assert_eq!(fetcher.call_count(), 3);
        assert!(!circuit.is_open());
    }

    #[tokio::test(start_paused = true)]
    async fn test_call_spacing_applies_after_success() {
        let fetcher = ScriptedFetcher::new(vec![Ok(())]);
        let mut s = settings();
        s.call_delay = Duration::from_secs(4);
        let mut limiter = RateLimiter::new(fetcher.clone(), &s);
        let mut circuit = KeywordCircuit::new(3);

        let start = Instant::now();
        limiter.fetch("kw", 1, &mut circuit).await;
        limiter.fetch("kw", 2, &mut circuit).await;
        assert!(start.elapsed() >= Duration::from_secs(4));
        assert_eq!(limiter.calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_pause_adds_to_call_spacing() {
        let fetcher = ScriptedFetcher::new(vec![Ok(())]);
        let mut s = settings();
        s.call_delay = Duration::from_secs(4);
        let mut limiter = RateLimiter::new(fetcher.clone(), &s);
        let mut circuit = KeywordCircuit::new(3);

        let start = Instant::now();
        limiter.fetch("kw", 1, &mut circuit).await;
        limiter.pause(Duration::from_secs(8)).await;
        limiter.fetch("next", 1, &mut circuit).await;
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_secs(12), "elapsed {elapsed:?}");
        assert!(elapsed < Duration::from_secs(13), "elapsed {elapsed:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn test_pause_before_first_call_does_not_add_spacing() {
        let fetcher = ScriptedFetcher::new(vec![Ok(())]);
        let mut s = settings();
        s.call_delay = Duration::from_secs(4);
        let mut limiter = RateLimiter::new(fetcher.clone(), &s);
        let mut circuit = KeywordCircuit::new(3);

        let start = Instant::now();
        limiter.pause(Duration::from_secs(2)).await;
        limiter.fetch("kw", 1, &mut circuit).await;
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_secs(2));
        assert!(elapsed < Duration::from_secs(3), "elapsed {elapsed:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_sleeps_between_rate_limited_attempts() {
        let fetcher = ScriptedFetcher::new(vec![rate_limited(), Ok(())]);
        let mut s = settings();
        s.backoff_base = Duration::from_secs(5);
        s.max_backoff = Duration::from_secs(60);
        let mut limiter = RateLimiter::new(fetcher.clone(), &s);
        let mut circuit = KeywordCircuit::new(3);

        let start = Instant::now();
        let result = limiter.fetch("kw", 1, &mut circuit).await;
        assert!(matches!(result, PageFetch::Fetched(_)));
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_secs(5));
        assert!(elapsed < Duration::from_secs(6));
    }
}
