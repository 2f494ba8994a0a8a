use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use chrono::{NaiveDate, Utc};
use tokio::task::JoinHandle;

use crate::collect::fetcher::{RankFetcher, ResultEntry};
use crate::collect::rate_limit::{KeywordCircuit, PageFetch, RateLimiter};
use crate::collect::{
    BatchRunStats, BatchStatus, CollectProgress, CollectorSettings, KeywordOutcome, KeywordResult,
    NoopProgress, StopHandle,
};
use crate::date_util::today_utc;
use crate::error::{Error, Result};
use crate::storage::repository::{self, NewSnapshot, TrackedKeyword};
use crate::storage::Database;
use crate::url::is_own_site;

struct LiveBatch {
    started_at: String,
    stats: BatchRunStats,
}

/// Sequential collection worker. One running batch at a time per database.
pub struct BatchCollector {
    db: Database,
    fetcher: Arc<dyn RankFetcher>,
    settings: CollectorSettings,
    running: tokio::sync::Mutex<()>,
    live: Mutex<Option<LiveBatch>>,
    stop: StopHandle,
}

impl BatchCollector {
    pub fn new(db: Database, fetcher: Arc<dyn RankFetcher>, settings: CollectorSettings) -> Self {
        Self {
            db,
            fetcher,
            settings,
            running: tokio::sync::Mutex::new(()),
            live: Mutex::new(None),
            stop: StopHandle::default(),
        }
    }

    pub fn settings(&self) -> &CollectorSettings {
        &self.settings
    }

    /// Handle for stopping the current batch between keywords.
    pub fn stop_handle(&self) -> StopHandle {
        self.stop.clone()
    }

    pub fn is_running(&self) -> bool {
        self.running.try_lock().is_err()
    }

    /// Run one batch over the currently active keywords.
    pub async fn run_active(&self, progress: &dyn CollectProgress) -> Result<BatchRunStats> {
        let keywords = self
            .db
            .reader()
            .call(|conn| repository::list_keywords(conn, true))
            .await?;
        self.run_batch(&keywords, progress).await
    }

    /// Run a batch on a background task.
    pub fn spawn(self: Arc<Self>, keywords: Vec<TrackedKeyword>) -> JoinHandle<Result<BatchRunStats>> {
        tokio::spawn(async move { self.run_batch(&keywords, &NoopProgress).await })
    }

    /// Collect every submitted keyword in order.
    ///
    /// Per-keyword failures are recorded in the returned stats. Only storage
    /// errors are returned as `Err`, after marking the run failed.
    pub async fn run_batch(
        &self,
        keywords: &[TrackedKeyword],
        progress: &dyn CollectProgress,
    ) -> Result<BatchRunStats> {
        let _guard = self.running.try_lock().map_err(|_| Error::BatchInProgress)?;

        let submitted = keywords.len() as u32;
        let stale_after = self.settings.batch_stale_secs;
        let claimed = self
            .db
            .writer()
            .call(move |conn| repository::claim_batch_run(conn, submitted, stale_after))
            .await?;
        let Some(run_id) = claimed else {
            log::warn!("Another batch is already running against this database");
            self.stop.reset();
            return Err(Error::BatchInProgress);
        };
        log::info!("Batch {run_id}: collecting {submitted} keyword(s)");

        let mut stats = BatchRunStats::new(Some(run_id), submitted);
        self.publish(&stats, true);

        let result = self.collect_all(run_id, keywords, progress, &mut stats).await;

        let (status, error) = match &result {
            Ok(true) => ("cancelled", None),
            Ok(false) => ("completed", None),
            Err(e) => ("failed", Some(e.to_string())),
        };
        let record = stats.clone();
        let finished = self
            .db
            .writer()
            .call(move |conn| {
                repository::finish_batch_run(conn, run_id, status, &record, error.as_deref())
            })
            .await;
        self.clear_live();
        self.stop.reset();

        match (result, finished) {
            (Err(e), finish) => {
                if let Err(fe) = finish {
                    log::warn!("Batch {run_id}: could not record failure: {fe}");
                }
                log::error!("Batch {run_id} aborted: {e}");
                Err(e)
            }
            (Ok(_), Err(fe)) => Err(fe.into()),
            (Ok(_), Ok(())) => {
                log::info!(
                    "Batch {run_id} {status}: {} succeeded, {} failed, {} circuit-broken, {} skipped",
                    stats.succeeded,
                    stats.failed,
                    stats.circuit_broken,
                    stats.skipped
                );
                Ok(stats)
            }
        }
    }

    /// Returns `Ok(true)` when stopped early.
    async fn collect_all(
        &self,
        run_id: i64,
        keywords: &[TrackedKeyword],
        progress: &dyn CollectProgress,
        stats: &mut BatchRunStats,
    ) -> Result<bool> {
        let mut limiter = RateLimiter::new(self.fetcher.clone(), &self.settings);
        let mut seen = HashSet::new();
        let mut previous: Option<KeywordOutcome> = None;
        let total = keywords.len();

        for (index, keyword) in keywords.iter().enumerate() {
            if self.stop.is_stopped() {
                self.skip_remaining(&keywords[index..], stats);
                return Ok(true);
            }

            if !keyword.is_active {
                log::debug!("Skipping inactive keyword '{}'", keyword.phrase);
                stats.record(skipped(keyword, "inactive"));
                continue;
            }
            if !seen.insert(keyword.id) {
                log::debug!("Skipping duplicate keyword '{}'", keyword.phrase);
                stats.record(skipped(keyword, "duplicate in batch"));
                continue;
            }

            if let Some(prev) = previous {
                let pause = if prev == KeywordOutcome::Failed {
                    self.settings.error_delay
                } else {
                    self.settings.keyword_delay
                };
                if !pause.is_zero() {
                    log::debug!("Waiting {}ms before '{}'", pause.as_millis(), keyword.phrase);
                }
                limiter.pause(pause).await;
                if self.stop.is_stopped() {
                    self.skip_remaining(&keywords[index..], stats);
                    return Ok(true);
                }
            }

            progress.on_keyword_start(&keyword.phrase, index, total);
            let result = self
                .collect_keyword(&mut limiter, run_id, keyword, progress)
                .await?;
            previous = Some(result.outcome);
            progress.on_keyword_complete(&result);
            stats.record(result);
            self.publish(stats, false);
        }

        log::debug!("Batch {run_id}: {} external call(s)", limiter.calls());
        Ok(false)
    }

    async fn collect_keyword(
        &self,
        limiter: &mut RateLimiter,
        run_id: i64,
        keyword: &TrackedKeyword,
        progress: &dyn CollectProgress,
    ) -> Result<KeywordResult> {
        let mut circuit = KeywordCircuit::new(self.settings.breaker_threshold);
        let mut entries: Vec<ResultEntry> = Vec::new();
        let mut pages_fetched = 0;

        for page in 1..=self.settings.pages_per_keyword {
            match limiter.fetch(&keyword.phrase, page, &mut circuit).await {
                PageFetch::Fetched(ranking) => {
                    pages_fetched += 1;
                    progress.on_page_fetched(&keyword.phrase, page, ranking.entries.len());
                    entries.extend(ranking.entries);
                }
                PageFetch::CircuitOpen => {
                    log::warn!(
                        "Keyword '{}' circuit-broken at page {page}; remaining pages skipped",
                        keyword.phrase
                    );
                    return Ok(KeywordResult {
                        keyword_id: keyword.id,
                        phrase: keyword.phrase.clone(),
                        outcome: KeywordOutcome::CircuitBroken,
                        pages_fetched,
                        position: None,
                        detail: Some(format!("circuit opened at page {page}")),
                    });
                }
                PageFetch::Failed(err) => {
                    log::error!("Keyword '{}' failed at page {page}: {err}", keyword.phrase);
                    return Ok(KeywordResult {
                        keyword_id: keyword.id,
                        phrase: keyword.phrase.clone(),
                        outcome: KeywordOutcome::Failed,
                        pages_fetched,
                        position: None,
                        detail: Some(err.to_string()),
                    });
                }
            }
        }

        let snapshot = build_snapshot(
            keyword.id,
            run_id,
            today_utc(),
            &self.settings.site_domain,
            &entries,
            pages_fetched,
        );
        let position = snapshot.position;
        self.db
            .writer()
            .call(move |conn| repository::insert_snapshot(conn, &snapshot))
            .await?;
        log::info!("Keyword '{}': position {position}", keyword.phrase);

        Ok(KeywordResult {
            keyword_id: keyword.id,
            phrase: keyword.phrase.clone(),
            outcome: KeywordOutcome::Succeeded,
            pages_fetched,
            position: Some(position),
            detail: None,
        })
    }

    fn skip_remaining(&self, rest: &[TrackedKeyword], stats: &mut BatchRunStats) {
        log::info!("Batch stopped; skipping {} remaining keyword(s)", rest.len());
        for keyword in rest {
            stats.record(skipped(keyword, "batch stopped"));
        }
    }

    fn publish(&self, stats: &BatchRunStats, starting: bool) {
        if let Ok(mut live) = self.live.lock() {
            let started_at = match live.as_ref() {
                Some(batch) if !starting => batch.started_at.clone(),
                _ => Utc::now().format("%Y-%m-%d %H:%M:%S").to_string(),
            };
            *live = Some(LiveBatch {
                started_at,
                stats: stats.clone(),
            });
        }
    }

    fn clear_live(&self) {
        if let Ok(mut live) = self.live.lock() {
            *live = None;
        }
    }

    /// Live stats of the running batch, else the last persisted run.
    pub async fn status(&self) -> Result<Option<BatchStatus>> {
        let live = self.live.lock().ok().and_then(|live| {
            live.as_ref().map(|batch| BatchStatus {
                running: true,
                status: "running".into(),
                started_at: Some(batch.started_at.clone()),
                completed_at: None,
                stats: batch.stats.clone(),
                error: None,
            })
        });
        match live {
            Some(status) => Ok(Some(status)),
            None => persisted_status(&self.db).await,
        }
    }
}

/// Most recent batch recorded in the database.
pub async fn persisted_status(db: &Database) -> Result<Option<BatchStatus>> {
    let record = db
        .reader()
        .call(|conn| repository::latest_batch_run(conn))
        .await?;
    Ok(record.map(|r| BatchStatus {
        running: r.status == "running",
        status: r.status,
        started_at: Some(r.started_at),
        completed_at: r.completed_at,
        stats: r.stats,
        error: r.error_message,
    }))
}

fn skipped(keyword: &TrackedKeyword, reason: &str) -> KeywordResult {
    KeywordResult {
        keyword_id: keyword.id,
        phrase: keyword.phrase.clone(),
        outcome: KeywordOutcome::Skipped,
        pages_fetched: 0,
        position: None,
        detail: Some(reason.to_string()),
    }
}

/// Fold all fetched pages into one snapshot.
///
/// Positions are 1-based indices into the combined ordering. `position` is
/// the first entry on the tracked site (0 if absent); competitors keep the
/// first occurrence of every other domain.
pub fn build_snapshot(
    keyword_id: i64,
    run_id: i64,
    date: NaiveDate,
    site_domain: &str,
    entries: &[ResultEntry],
    pages_fetched: u32,
) -> NewSnapshot {
    let mut position = 0;
    let mut seen = HashSet::new();
    let mut competitors = Vec::new();

    for (i, entry) in entries.iter().enumerate() {
        let rank = i as u32 + 1;
        if is_own_site(&entry.domain, site_domain) {
            if position == 0 {
                position = rank;
            }
            continue;
        }
        if seen.insert(entry.domain.as_str()) {
            competitors.push(ResultEntry {
                url: entry.url.clone(),
                domain: entry.domain.clone(),
                position: rank,
            });
        }
    }

    NewSnapshot {
        keyword_id,
        date,
        position,
        competitors,
        pages_fetched,
        run_id,
    }
}
