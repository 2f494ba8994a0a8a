pub mod collect;
pub mod date_util;
pub mod error;
pub mod insights;
pub mod query;
pub mod report;
pub mod storage;
pub mod url;

use std::sync::Arc;

use chrono::NaiveDate;

pub use collect::collector::BatchCollector;
pub use collect::fetcher::{FetchError, RankFetcher, SerpClient};
pub use collect::{
    BatchRunStats, BatchStatus, CollectProgress, CollectorSettings, KeywordOutcome, KeywordResult,
    NoopProgress, StopHandle,
};
pub use error::{Error, Result};
pub use insights::cache::{InsightCache, InsightOptions};
pub use insights::{
    AnalysisType, InsightGenerator, InsightRecord, InsightSession, InsightStatus,
};
pub use query::history::KeywordHistory;
pub use query::period::ReportPeriod;
pub use report::{Grade, ReportCard};
pub use storage::Database;

// Re-export repository types needed by the binary crate, but not the module itself
pub use storage::repository::{ManagedCompetitor, TrackedKeyword};

use storage::repository;

/// Main entry point for rank tracking, report cards and insights.
///
/// The collector and insight generator are optional so that read-only
/// commands work without search or LLM credentials.
pub struct RankCard {
    db: Database,
    collector: Option<Arc<BatchCollector>>,
    cache: InsightCache,
    generator: Option<Box<dyn InsightGenerator>>,
}

impl RankCard {
    pub async fn new(db: Database) -> Result<Self> {
        let cache = InsightCache::from_config(db.clone()).await?;
        Ok(Self {
            db,
            collector: None,
            cache,
            generator: None,
        })
    }

    pub fn with_collector(mut self, collector: Arc<BatchCollector>) -> Self {
        self.collector = Some(collector);
        self
    }

    pub fn with_generator(mut self, generator: Box<dyn InsightGenerator>) -> Self {
        self.generator = Some(generator);
        self
    }

    /// Access the database (for direct queries in the CLI).
    pub fn db(&self) -> &Database {
        &self.db
    }

    pub fn collector(&self) -> Option<&Arc<BatchCollector>> {
        self.collector.as_ref()
    }

    // ── Collection ─────────────────────────────────────────────────

    /// Collector settings from `app_config`, validated.
    pub async fn collector_settings(&self) -> Result<CollectorSettings> {
        self.db
            .reader()
            .call(|conn| Ok::<_, rusqlite::Error>(CollectorSettings::load(conn)))
            .await?
    }

    /// Run one batch over the active keywords.
    pub async fn run_batch(&self, progress: &dyn CollectProgress) -> Result<BatchRunStats> {
        let collector = self.collector.as_ref().ok_or_else(|| {
            Error::Config("no rank fetcher configured for this instance".into())
        })?;
        collector.run_active(progress).await
    }

    /// Release batch rows left `running` by a process that died mid-run.
    pub async fn abandon_running_batches(&self) -> Result<usize> {
        let count = self
            .db
            .writer()
            .call(|conn| storage::repository::abandon_running_batches(conn, None))
            .await?;
        if count > 0 {
            log::warn!("Abandoned {count} running batch record(s)");
        }
        Ok(count)
    }

    /// Live stats of a running batch, else the last recorded run.
    pub async fn batch_status(&self) -> Result<Option<BatchStatus>> {
        match &self.collector {
            Some(collector) => collector.status().await,
            None => collect::collector::persisted_status(&self.db).await,
        }
    }

    // ── Reports ────────────────────────────────────────────────────

    pub async fn report_card(&self, period: ReportPeriod) -> Result<ReportCard> {
        self.report_card_as_of(period, date_util::today_utc()).await
    }

    pub async fn report_card_as_of(
        &self,
        period: ReportPeriod,
        as_of: NaiveDate,
    ) -> Result<ReportCard> {
        report::load_report_card(&self.db, period, as_of).await
    }

    pub async fn keyword_history(
        &self,
        keyword_id: i64,
        period: ReportPeriod,
    ) -> Result<KeywordHistory> {
        query::history::keyword_history(&self.db, keyword_id, period, date_util::today_utc())
            .await
    }

    // ── Insights ───────────────────────────────────────────────────

    /// Cached or freshly generated insights for `report`.
    pub async fn insights(
        &self,
        report: &ReportCard,
        options: &InsightOptions,
    ) -> Result<InsightSession> {
        let generator = self.generator.as_deref().ok_or_else(|| {
            Error::AnalysisUnavailable("no insight generator configured".into())
        })?;
        self.cache.get_or_generate(generator, report, options).await
    }

    /// Active session for `report`, without generating.
    pub async fn cached_insights(
        &self,
        report: &ReportCard,
        analysis_type: AnalysisType,
    ) -> Result<Option<InsightSession>> {
        self.cache.find_active(report, analysis_type).await
    }

    pub async fn insight_session(&self, session_id: i64) -> Result<InsightSession> {
        insights::get_session(&self.db, session_id).await
    }

    pub async fn update_insight(
        &self,
        insight_id: i64,
        status: InsightStatus,
        notes: Option<String>,
        actor: Option<String>,
    ) -> Result<InsightRecord> {
        insights::update_insight_status(&self.db, insight_id, status, notes, actor).await
    }

    // ── Keyword commands ───────────────────────────────────────────

    pub async fn keyword_add(&self, phrase: &str) -> Result<i64> {
        let phrase = phrase.trim().to_string();
        if phrase.is_empty() {
            return Err(Error::InvalidInput("keyword phrase is empty".into()));
        }
        self.db
            .writer()
            .call(move |conn| {
                if let Some(existing) = repository::find_active_keyword(conn, &phrase)? {
                    return Ok::<_, rusqlite::Error>(Err(Error::InvalidInput(format!(
                        "'{}' is already tracked as keyword {}",
                        existing.phrase, existing.id
                    ))));
                }
                Ok(Ok(repository::insert_keyword(conn, &phrase)?))
            })
            .await?
    }

    pub async fn keyword_list(&self, include_inactive: bool) -> Result<Vec<TrackedKeyword>> {
        self.db
            .reader()
            .call(move |conn| repository::list_keywords(conn, !include_inactive))
            .await
            .map_err(|e| Error::Database(e.to_string()))
    }

    pub async fn keyword_deactivate(&self, keyword_id: i64) -> Result<bool> {
        self.db
            .writer()
            .call(move |conn| repository::set_keyword_active(conn, keyword_id, false))
            .await
            .map_err(|e| Error::Database(e.to_string()))
    }

    // ── Competitor commands ────────────────────────────────────────

    pub async fn competitor_add(&self, name: &str, url: &str) -> Result<i64> {
        let name = name.trim().to_string();
        let url = url.trim().to_string();
        if name.is_empty() || url::normalize_url(&url).is_empty() {
            return Err(Error::InvalidInput(
                "competitor needs a name and a URL or domain".into(),
            ));
        }
        self.db
            .writer()
            .call(move |conn| repository::insert_competitor(conn, &name, &url))
            .await
            .map_err(|e| Error::Database(e.to_string()))
    }

    pub async fn competitor_list(&self, include_inactive: bool) -> Result<Vec<ManagedCompetitor>> {
        self.db
            .reader()
            .call(move |conn| repository::list_competitors(conn, !include_inactive))
            .await
            .map_err(|e| Error::Database(e.to_string()))
    }

    pub async fn competitor_deactivate(&self, competitor_id: i64) -> Result<bool> {
        self.db
            .writer()
            .call(move |conn| repository::set_competitor_active(conn, competitor_id, false))
            .await
            .map_err(|e| Error::Database(e.to_string()))
    }

    // ── Config commands ────────────────────────────────────────────

    pub async fn config_get(&self, key: &str) -> Result<Option<String>> {
        self.db
            .reader()
            .call({
                let key = key.to_string();
                move |conn| repository::get_config(conn, &key)
            })
            .await
            .map_err(|e| Error::Database(e.to_string()))
    }

    pub async fn config_set(&self, key: &str, value: &str) -> Result<()> {
        self.db
            .writer()
            .call({
                let key = key.to_string();
                let value = value.to_string();
                move |conn| repository::set_config(conn, &key, &value)
            })
            .await
            .map_err(|e| Error::Database(e.to_string()))
    }

    pub async fn config_list(&self) -> Result<Vec<(String, String)>> {
        self.db
            .reader()
            .call(|conn| repository::list_config(conn))
            .await
            .map_err(|e| Error::Database(e.to_string()))
    }
}
