use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use sha2::{Digest, Sha256};

use crate::error::{Error, Result};
use crate::insights::types::{AnalysisType, InsightRequest, InsightSession};
use crate::insights::InsightGenerator;
use crate::report::ReportCard;
use crate::storage::repository::{self, NewSession};
use crate::storage::Database;

pub const DEFAULT_TIMEOUT_SECS: u64 = 60;

/// Options for one insight request.
#[derive(Debug, Clone, Default)]
pub struct InsightOptions {
    pub analysis_type: AnalysisType,
    /// Passed to the generator; not part of the cache key.
    pub focus_areas: Vec<String>,
    pub force_regenerate: bool,
}

/// Content-addressed store of generated insight sessions.
///
/// At most one session is active per (content hash, analysis type). Requests
/// for the same key are serialized so a burst of identical requests triggers
/// a single generation.
pub struct InsightCache {
    db: Database,
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    timeout: Duration,
}

impl InsightCache {
    pub fn new(db: Database, timeout: Duration) -> Self {
        Self {
            db,
            locks: Mutex::new(HashMap::new()),
            timeout,
        }
    }

    /// Build with `insight_timeout_secs` from `app_config`.
    pub async fn from_config(db: Database) -> Result<Self> {
        let raw = db
            .reader()
            .call(|conn| repository::get_config(conn, "insight_timeout_secs"))
            .await?;
        let secs = match raw {
            Some(v) => v.trim().parse::<u64>().ok().filter(|s| *s > 0).ok_or_else(|| {
                Error::Config(format!("insight_timeout_secs must be a positive integer, got '{v}'"))
            })?,
            None => DEFAULT_TIMEOUT_SECS,
        };
        Ok(Self::new(db, Duration::from_secs(secs)))
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Active session for this card and type, if one exists.
    pub async fn find_active(
        &self,
        report: &ReportCard,
        analysis_type: AnalysisType,
    ) -> Result<Option<InsightSession>> {
        let hash = content_hash(report)?;
        self.db
            .reader()
            .call(move |conn| {
                match repository::find_active_session_id(conn, &hash, analysis_type)? {
                    Some(id) => repository::get_session(conn, id),
                    None => Ok(None),
                }
            })
            .await
            .map_err(Into::into)
    }

    /// Return the active session for this card, generating one on a miss or
    /// when `force_regenerate` is set. A failed generation persists nothing.
    pub async fn get_or_generate(
        &self,
        generator: &dyn InsightGenerator,
        report: &ReportCard,
        options: &InsightOptions,
    ) -> Result<InsightSession> {
        if report.is_empty() {
            return Err(Error::InvalidInput(
                "report card has no tracked keywords to analyse".into(),
            ));
        }

        let analysis_type = options.analysis_type;
        let hash = content_hash(report)?;
        let lock = self.lock_for(&format!("{hash}:{analysis_type}"));
        let _guard = lock.lock().await;

        if !options.force_regenerate {
            let key = hash.clone();
            let hit = self
                .db
                .writer()
                .call(move |conn| {
                    match repository::find_active_session_id(conn, &key, analysis_type)? {
                        Some(id) => repository::get_session(conn, id),
                        None => Ok(None),
                    }
                })
                .await?;
            if let Some(session) = hit {
                log::debug!(
                    "Insight cache hit for {analysis_type} ({}), session {}",
                    &hash[..12],
                    session.id
                );
                return Ok(session);
            }
        }

        log::info!(
            "Generating {analysis_type} insights ({}){}",
            &hash[..12],
            if options.force_regenerate { " [forced]" } else { "" }
        );

        let request = InsightRequest {
            report_card: report.clone(),
            analysis_type,
            focus_areas: options.focus_areas.clone(),
        };
        let started = Instant::now();
        let generated = match tokio::time::timeout(self.timeout, generator.generate(&request)).await {
            Ok(result) => result?,
            Err(_) => {
                return Err(Error::AnalysisUnavailable(format!(
                    "generation timed out after {}s",
                    self.timeout.as_secs()
                )))
            }
        };
        let elapsed_ms = started.elapsed().as_millis() as u64;

        let card = report.clone();
        let session = self
            .db
            .writer()
            .call(move |conn| {
                let tx = conn.transaction()?;
                let superseded = repository::supersede_active_sessions(&tx, analysis_type)?;
                let session_id = repository::insert_session(
                    &tx,
                    &NewSession {
                        source_data_hash: &hash,
                        analysis_type,
                        report_card: &card,
                        executive_summary: &generated.executive_summary,
                        model: &generated.model,
                        prompt_version: &generated.prompt_version,
                        elapsed_ms,
                    },
                )?;
                let mut ids = Vec::with_capacity(generated.insights.len());
                for insight in &generated.insights {
                    ids.push(repository::insert_insight(&tx, session_id, insight)?);
                }
                repository::set_session_insight_ids(&tx, session_id, &ids)?;
                let session = repository::get_session(&tx, session_id)?;
                tx.commit()?;
                Ok::<_, rusqlite::Error>((session, superseded))
            })
            .await?;

        match session {
            (Some(session), superseded) => {
                log::info!(
                    "Stored insight session {} with {} insights in {elapsed_ms}ms ({superseded} superseded)",
                    session.id,
                    session.insights.len()
                );
                Ok(session)
            }
            (None, _) => Err(Error::Other("insight session vanished after insert".into())),
        }
    }

    fn lock_for(&self, key: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        locks.retain(|_, lock| Arc::strong_count(lock) > 1);
        locks
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }
}

/// SHA-256 of the card's canonical JSON, ignoring `generated_at`.
pub fn content_hash(report: &ReportCard) -> Result<String> {
    let mut card = report.clone();
    card.generated_at = None;
    let json = serde_json::to_vec(&card)?;
    Ok(format!("{:x}", Sha256::digest(&json)))
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;

    use super::*;
    use crate::insights::types::{GeneratedInsight, GeneratedInsights, InsightPriority, SessionStatus};
    use crate::query::period::ReportPeriod;
    use crate::report::{CompetitorOpportunity, Grade};

    enum Mode {
        Ok,
        RateLimited,
        Hang,
    }

    struct FakeGenerator {
        mode: Mode,
        delay: Duration,
        calls: AtomicUsize,
    }

    impl FakeGenerator {
        fn new(mode: Mode) -> Self {
            Self {
                mode,
                delay: Duration::ZERO,
                calls: AtomicUsize::new(0),
            }
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait(?Send)]
    impl InsightGenerator for FakeGenerator {
        async fn generate(&self, request: &InsightRequest) -> Result<GeneratedInsights> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            match self.mode {
                Mode::Ok => Ok(GeneratedInsights {
                    executive_summary: format!(
                        "Run {n}: score {}",
                        request.report_card.overall_score
                    ),
                    insights: vec![
                        GeneratedInsight {
                            insight_type: "opportunity".into(),
                            priority: InsightPriority::High,
                            title: "Push rust crates".into(),
                            message: "Two places from the top three.".into(),
                            affected_keywords: vec!["rust crates".into()],
                            action_items: vec!["Expand the guide".into()],
                            confidence: 0.8,
                            category: "content".into(),
                        },
                        GeneratedInsight {
                            insight_type: "warning".into(),
                            priority: InsightPriority::Low,
                            title: "Watch sqlite wal".into(),
                            message: "Slipping.".into(),
                            affected_keywords: vec![],
                            action_items: vec![],
                            confidence: 0.4,
                            category: "trends".into(),
                        },
                    ],
                    model: "fake/model".into(),
                    prompt_version: "test-v1".into(),
                }),
                Mode::RateLimited => Err(Error::AnalysisRateLimited("HTTP 429".into())),
                Mode::Hang => {
                    tokio::time::sleep(Duration::from_secs(3600)).await;
                    Err(Error::Llm("unreachable".into()))
                }
            }
        }
    }

    fn card(score: u32) -> ReportCard {
        let mut card = ReportCard::empty(ReportPeriod::Last30Days);
        card.total_keywords = 3;
        card.ranked_keywords = 2;
        card.overall_score = score;
        card.grade = Grade::from_score(score);
        card
    }

    async fn session_count(db: &Database) -> i64 {
        db.reader()
            .call(|conn| {
                conn.query_row("SELECT COUNT(*) FROM insight_sessions", [], |row| row.get(0))
            })
            .await
            .unwrap()
    }

    async fn cache() -> (Database, InsightCache) {
        let db = Database::open_memory().await.unwrap();
        let cache = InsightCache::new(db.clone(), Duration::from_secs(60));
        (db, cache)
    }

    #[test]
    fn test_content_hash_ignores_generated_at() {
        let a = card(72);
        let mut b = card(72);
        b.generated_at = Some("2026-10-19T08:00:00+00:00".into());
        assert_eq!(content_hash(&a).unwrap(), content_hash(&b).unwrap());
        assert_eq!(content_hash(&a).unwrap().len(), 64);

        assert_ne!(content_hash(&a).unwrap(), content_hash(&card(73)).unwrap());
    }

    #[test]
    fn test_content_hash_changes_with_any_scoring_field() {
        let base = content_hash(&card(72)).unwrap();

        let mut breakdown = card(72);
        breakdown.breakdown.top3 += 1;
        breakdown.breakdown.not_found = breakdown.breakdown.not_found.saturating_sub(1);

        let mut opportunity = card(72);
        opportunity.opportunities.push(CompetitorOpportunity {
            keyword_id: 1,
            keyword: "rust crates".into(),
            competitor: "rival.io".into(),
            competitor_position: 2,
            our_position: 5,
            gap: 3,
        });
        let with_opportunity = content_hash(&opportunity).unwrap();
        opportunity.opportunities[0].gap = 4;

        let mut period = card(72);
        period.period = ReportPeriod::Last7Days;

        let hashes = [
            content_hash(&breakdown).unwrap(),
            with_opportunity.clone(),
            content_hash(&opportunity).unwrap(),
            content_hash(&period).unwrap(),
        ];
        for hash in &hashes {
            assert_ne!(hash, &base);
        }
        assert_ne!(hashes[1], hashes[2]);
    }

    #[tokio::test]
    async fn test_second_request_is_cache_hit() {
        let (_db, cache) = cache().await;
        let generator = FakeGenerator::new(Mode::Ok);
        let options = InsightOptions::default();

        let first = cache.get_or_generate(&generator, &card(72), &options).await.unwrap();
        let mut restamped = card(72);
        restamped.generated_at = Some("later".into());
        let second = cache.get_or_generate(&generator, &restamped, &options).await.unwrap();

        assert_eq!(generator.calls(), 1);
        assert_eq!(first.id, second.id);
        assert_eq!(first.status, SessionStatus::Active);
        assert_eq!(first.insights.len(), 2);
        assert_eq!(
            first.insight_ids,
            first.insights.iter().map(|i| i.id).collect::<Vec<_>>()
        );
        assert_eq!(first.metadata.model, "fake/model");
    }

    #[tokio::test]
    async fn test_force_regenerate_supersedes_previous() {
        let (db, cache) = cache().await;
        let generator = FakeGenerator::new(Mode::Ok);

        let first = cache
            .get_or_generate(&generator, &card(72), &InsightOptions::default())
            .await
            .unwrap();
        let forced = InsightOptions {
            force_regenerate: true,
            ..InsightOptions::default()
        };
        let second = cache.get_or_generate(&generator, &card(72), &forced).await.unwrap();

        assert_eq!(generator.calls(), 2);
        assert_ne!(first.id, second.id);
        assert_eq!(second.executive_summary, "Run 2: score 72");

        let old = crate::insights::get_session(&db, first.id).await.unwrap();
        assert_eq!(old.status, SessionStatus::Superseded);
        assert!(old.superseded_at.is_some());

        let active = cache
            .find_active(&card(72), AnalysisType::Comprehensive)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(active.id, second.id);
    }

    #[tokio::test]
    async fn test_changed_data_supersedes_same_type_only() {
        let (db, cache) = cache().await;
        let generator = FakeGenerator::new(Mode::Ok);
        let trends = InsightOptions {
            analysis_type: AnalysisType::Trends,
            ..InsightOptions::default()
        };

        let old = cache
            .get_or_generate(&generator, &card(72), &InsightOptions::default())
            .await
            .unwrap();
        let trend = cache.get_or_generate(&generator, &card(72), &trends).await.unwrap();
        let new = cache
            .get_or_generate(&generator, &card(80), &InsightOptions::default())
            .await
            .unwrap();

        assert_eq!(generator.calls(), 3);
        let old = crate::insights::get_session(&db, old.id).await.unwrap();
        let trend = crate::insights::get_session(&db, trend.id).await.unwrap();
        assert_eq!(old.status, SessionStatus::Superseded);
        assert_eq!(trend.status, SessionStatus::Active);
        assert_eq!(new.status, SessionStatus::Active);
    }

    #[tokio::test]
    async fn test_concurrent_requests_generate_once() {
        let (_db, cache) = cache().await;
        let mut generator = FakeGenerator::new(Mode::Ok);
        generator.delay = Duration::from_millis(50);
        let options = InsightOptions::default();
        let report = card(72);

        let (a, b) = tokio::join!(
            cache.get_or_generate(&generator, &report, &options),
            cache.get_or_generate(&generator, &report, &options),
        );

        assert_eq!(generator.calls(), 1);
        assert_eq!(a.unwrap().id, b.unwrap().id);
    }

    #[tokio::test]
    async fn test_rate_limited_generation_persists_nothing() {
        let (db, cache) = cache().await;
        let generator = FakeGenerator::new(Mode::RateLimited);

        let err = cache
            .get_or_generate(&generator, &card(72), &InsightOptions::default())
            .await
            .unwrap_err();

        assert!(matches!(err, Error::AnalysisRateLimited(_)));
        assert!(err.is_retryable());
        assert_eq!(session_count(&db).await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_is_unavailable() {
        let (db, cache) = cache().await;
        let generator = FakeGenerator::new(Mode::Hang);

        let err = cache
            .get_or_generate(&generator, &card(72), &InsightOptions::default())
            .await
            .unwrap_err();

        assert!(matches!(err, Error::AnalysisUnavailable(_)));
        assert_eq!(session_count(&db).await, 0);
    }

    #[tokio::test]
    async fn test_empty_report_rejected() {
        let (_db, cache) = cache().await;
        let generator = FakeGenerator::new(Mode::Ok);

        let err = cache
            .get_or_generate(
                &generator,
                &ReportCard::empty(ReportPeriod::Last7Days),
                &InsightOptions::default(),
            )
            .await
            .unwrap_err();

        assert!(matches!(err, Error::InvalidInput(_)));
        assert_eq!(generator.calls(), 0);
    }

    #[tokio::test]
    async fn test_timeout_from_config() {
        let db = Database::open_memory().await.unwrap();
        assert_eq!(
            InsightCache::from_config(db.clone()).await.unwrap().timeout(),
            Duration::from_secs(DEFAULT_TIMEOUT_SECS)
        );

        db.writer()
            .call(|conn| repository::set_config(conn, "insight_timeout_secs", "15"))
            .await
            .unwrap();
        assert_eq!(
            InsightCache::from_config(db.clone()).await.unwrap().timeout(),
            Duration::from_secs(15)
        );

        db.writer()
            .call(|conn| repository::set_config(conn, "insight_timeout_secs", "soon"))
            .await
            .unwrap();
        assert!(matches!(
            InsightCache::from_config(db).await,
            Err(Error::Config(_))
        ));
    }
}
