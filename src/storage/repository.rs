use chrono::NaiveDate;
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row, TransactionBehavior};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::collect::fetcher::ResultEntry;
use crate::collect::BatchRunStats;
use crate::insights::types::{
    AnalysisType, GeneratedInsight, GenerationMetadata, InsightPriority, InsightRecord,
    InsightSession, InsightStatus, SessionStatus,
};
use crate::report::ReportCard;
use crate::url::normalize_url;

// ── Config ─────────────────────────────────────────────────────────

pub fn get_config(conn: &Connection, key: &str) -> Result<Option<String>, rusqlite::Error> {
    conn.query_row(
        "SELECT value FROM app_config WHERE key = ?1",
        params![key],
        |row| row.get(0),
    )
    .optional()
}

pub fn set_config(conn: &Connection, key: &str, value: &str) -> Result<(), rusqlite::Error> {
    conn.execute(
        "INSERT OR REPLACE INTO app_config (key, value, updated_at)
         VALUES (?1, ?2, datetime('now'))",
        params![key, value],
    )?;
    Ok(())
}

pub fn list_config(conn: &Connection) -> Result<Vec<(String, String)>, rusqlite::Error> {
    let mut stmt = conn.prepare("SELECT key, value FROM app_config ORDER BY key")?;
    let rows = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?;
    rows.collect()
}

// ── Tracked Keywords ───────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackedKeyword {
    pub id: i64,
    pub phrase: String,
    pub is_active: bool,
    pub created_at: String,
}

fn keyword_from_row(row: &Row<'_>) -> Result<TrackedKeyword, rusqlite::Error> {
    Ok(TrackedKeyword {
        id: row.get(0)?,
        phrase: row.get(1)?,
        is_active: row.get(2)?,
        created_at: row.get(3)?,
    })
}

pub fn insert_keyword(conn: &Connection, phrase: &str) -> Result<i64, rusqlite::Error> {
    conn.execute(
        "INSERT INTO tracked_keywords (phrase, is_active, created_at)
         VALUES (?1, 1, datetime('now'))",
        params![phrase.trim()],
    )?;
    Ok(conn.last_insert_rowid())
}

/// Case-insensitive lookup among active keywords.
pub fn find_active_keyword(
    conn: &Connection,
    phrase: &str,
) -> Result<Option<TrackedKeyword>, rusqlite::Error> {
    conn.query_row(
        "SELECT keyword_id, phrase, is_active, created_at FROM tracked_keywords
         WHERE is_active = 1 AND lower(phrase) = lower(?1)",
        params![phrase.trim()],
        keyword_from_row,
    )
    .optional()
}

pub fn get_keyword(conn: &Connection, keyword_id: i64) -> Result<Option<TrackedKeyword>, rusqlite::Error> {
    conn.query_row(
        "SELECT keyword_id, phrase, is_active, created_at FROM tracked_keywords
         WHERE keyword_id = ?1",
        params![keyword_id],
        keyword_from_row,
    )
    .optional()
}

pub fn list_keywords(
    conn: &Connection,
    active_only: bool,
) -> Result<Vec<TrackedKeyword>, rusqlite::Error> {
    let mut stmt = conn.prepare(
        "SELECT keyword_id, phrase, is_active, created_at FROM tracked_keywords
         WHERE (?1 = 0 OR is_active = 1) ORDER BY keyword_id",
    )?;
    let rows = stmt.query_map(params![active_only as i32], keyword_from_row)?;
    rows.collect()
}

pub fn set_keyword_active(
    conn: &Connection,
    keyword_id: i64,
    active: bool,
) -> Result<bool, rusqlite::Error> {
    let count = conn.execute(
        "UPDATE tracked_keywords SET is_active = ?2 WHERE keyword_id = ?1",
        params![keyword_id, active as i32],
    )?;
    Ok(count > 0)
}

// ── Competitors ────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManagedCompetitor {
    pub id: i64,
    pub name: String,
    pub url: String,
    /// Scheme and `www.` stripped, lowercased.
    pub normalized_domain: String,
    pub is_active: bool,
    pub created_at: String,
}

pub fn insert_competitor(conn: &Connection, name: &str, url: &str) -> Result<i64, rusqlite::Error> {
    conn.execute(
        "INSERT INTO competitors (name, url, normalized_domain, is_active, created_at)
         VALUES (?1, ?2, ?3, 1, datetime('now'))",
        params![name.trim(), url.trim(), normalize_url(url)],
    )?;
    Ok(conn.last_insert_rowid())
}

pub fn list_competitors(
    conn: &Connection,
    active_only: bool,
) -> Result<Vec<ManagedCompetitor>, rusqlite::Error> {
    let mut stmt = conn.prepare(
        "SELECT competitor_id, name, url, normalized_domain, is_active, created_at
         FROM competitors WHERE (?1 = 0 OR is_active = 1) ORDER BY competitor_id",
    )?;
    let rows = stmt.query_map(params![active_only as i32], |row| {
        Ok(ManagedCompetitor {
            id: row.get(0)?,
            name: row.get(1)?,
            url: row.get(2)?,
            normalized_domain: row.get(3)?,
            is_active: row.get(4)?,
            created_at: row.get(5)?,
        })
    })?;
    rows.collect()
}

pub fn set_competitor_active(
    conn: &Connection,
    competitor_id: i64,
    active: bool,
) -> Result<bool, rusqlite::Error> {
    let count = conn.execute(
        "UPDATE competitors SET is_active = ?2 WHERE competitor_id = ?1",
        params![competitor_id, active as i32],
    )?;
    Ok(count > 0)
}

// ── Batch Runs ─────────────────────────────────────────────────────

/// Audit row for one collection pass.
#[derive(Debug, Clone)]
pub struct BatchRunRecord {
    pub run_id: i64,
    pub status: String,
    pub started_at: String,
    pub completed_at: Option<String>,
    pub stats: BatchRunStats,
    pub error_message: Option<String>,
}

pub fn insert_batch_run(conn: &Connection, submitted: u32) -> Result<i64, rusqlite::Error> {
    conn.execute(
        "INSERT INTO batch_runs (status, started_at, keywords_submitted)
         VALUES ('running', datetime('now'), ?1)",
        params![submitted],
    )?;
    Ok(conn.last_insert_rowid())
}

/// Open a `running` row unless another run already holds one.
///
/// Runs left `running` for longer than `stale_after_secs` (a killed process)
/// are marked `abandoned` first. Returns `None` when a live run exists.
pub fn claim_batch_run(
    conn: &mut Connection,
    submitted: u32,
    stale_after_secs: u64,
) -> Result<Option<i64>, rusqlite::Error> {
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    let abandoned = abandon_running_batches(&tx, Some(stale_after_secs))?;
    if abandoned > 0 {
        log::warn!("Marked {abandoned} stale batch run(s) as abandoned");
    }
    let running: i64 = tx.query_row(
        "SELECT COUNT(*) FROM batch_runs WHERE status = 'running'",
        [],
        |row| row.get(0),
    )?;
    let claimed = if running > 0 {
        None
    } else {
        Some(insert_batch_run(&tx, submitted)?)
    };
    tx.commit()?;
    Ok(claimed)
}

/// Mark `running` rows as `abandoned`. With `older_than_secs`, only rows
/// started at least that long ago.
pub fn abandon_running_batches(
    conn: &Connection,
    older_than_secs: Option<u64>,
) -> Result<usize, rusqlite::Error> {
    let cutoff = older_than_secs.map(|secs| format!("-{secs} seconds"));
    conn.execute(
        "UPDATE batch_runs SET
            status = 'abandoned', completed_at = datetime('now'),
            error_message = COALESCE(error_message, 'abandoned while running')
         WHERE status = 'running'
           AND (?1 IS NULL OR started_at <= datetime('now', ?1))",
        params![cutoff],
    )
}

pub fn finish_batch_run(
    conn: &Connection,
    run_id: i64,
    status: &str,
    stats: &BatchRunStats,
    error_message: Option<&str>,
) -> Result<(), rusqlite::Error> {
    let tripped = to_json(&stats.tripped_keywords)?;
    conn.execute(
        "UPDATE batch_runs SET
            status = ?2, completed_at = datetime('now'),
            processed = ?3, succeeded = ?4, failed = ?5,
            circuit_broken = ?6, skipped = ?7,
            tripped_keywords = ?8, error_message = ?9
         WHERE run_id = ?1",
        params![
            run_id,
            status,
            stats.processed,
            stats.succeeded,
            stats.failed,
            stats.circuit_broken,
            stats.skipped,
            tripped,
            error_message,
        ],
    )?;
    Ok(())
}

pub fn latest_batch_run(conn: &Connection) -> Result<Option<BatchRunRecord>, rusqlite::Error> {
    conn.query_row(
        "SELECT run_id, status, started_at, completed_at, keywords_submitted,
                processed, succeeded, failed, circuit_broken, skipped,
                tripped_keywords, error_message
         FROM batch_runs ORDER BY run_id DESC LIMIT 1",
        [],
        |row| {
            let run_id: i64 = row.get(0)?;
            let stats = BatchRunStats {
                run_id: Some(run_id),
                submitted: row.get(4)?,
                processed: row.get(5)?,
                succeeded: row.get(6)?,
                failed: row.get(7)?,
                circuit_broken: row.get(8)?,
                skipped: row.get(9)?,
                tripped_keywords: from_json(10, row.get(10)?)?,
                results: Vec::new(),
            };
            Ok(BatchRunRecord {
                run_id,
                status: row.get(1)?,
                started_at: row.get(2)?,
                completed_at: row.get(3)?,
                stats,
                error_message: row.get(11)?,
            })
        },
    )
    .optional()
}

// ── Ranking Snapshots ──────────────────────────────────────────────

/// One immutable ranking observation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RankingSnapshot {
    pub id: i64,
    pub keyword_id: i64,
    pub date: NaiveDate,
    /// 0 = not found, else 1-based rank.
    pub position: u32,
    /// Other domains observed, in result order.
    pub competitors: Vec<ResultEntry>,
    pub pages_fetched: u32,
    pub run_id: i64,
    pub captured_at: String,
}

/// Snapshot fields supplied by the collector.
#[derive(Debug, Clone)]
pub struct NewSnapshot {
    pub keyword_id: i64,
    pub date: NaiveDate,
    pub position: u32,
    pub competitors: Vec<ResultEntry>,
    pub pages_fetched: u32,
    pub run_id: i64,
}

/// Append a snapshot. A second insert for the same (keyword, date, run) fails
/// on the unique constraint.
pub fn insert_snapshot(conn: &Connection, snapshot: &NewSnapshot) -> Result<i64, rusqlite::Error> {
    conn.execute(
        "INSERT INTO ranking_snapshots (
            keyword_id, snapshot_date, position, competitors, pages_fetched, run_id, captured_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, datetime('now'))",
        params![
            snapshot.keyword_id,
            date_key(snapshot.date),
            snapshot.position,
            to_json(&snapshot.competitors)?,
            snapshot.pages_fetched,
            snapshot.run_id,
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

const SNAPSHOT_COLUMNS: &str = "snapshot_id, keyword_id, snapshot_date, position, competitors,
     pages_fetched, run_id, captured_at";

fn snapshot_from_row(row: &Row<'_>) -> Result<RankingSnapshot, rusqlite::Error> {
    Ok(RankingSnapshot {
        id: row.get(0)?,
        keyword_id: row.get(1)?,
        date: parse_date(2, &row.get::<_, String>(2)?)?,
        position: row.get(3)?,
        competitors: from_json(4, row.get(4)?)?,
        pages_fetched: row.get(5)?,
        run_id: row.get(6)?,
        captured_at: row.get(7)?,
    })
}

/// Snapshots dated within `[start, end]`, ordered by keyword, date, id.
/// `None` leaves that side of the range open.
pub fn snapshots_between(
    conn: &Connection,
    start: Option<NaiveDate>,
    end: Option<NaiveDate>,
) -> Result<Vec<RankingSnapshot>, rusqlite::Error> {
    let sql = format!(
        "SELECT {SNAPSHOT_COLUMNS} FROM ranking_snapshots
         WHERE (?1 IS NULL OR snapshot_date >= ?1)
           AND (?2 IS NULL OR snapshot_date <= ?2)
         ORDER BY keyword_id, snapshot_date, snapshot_id"
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(
        params![start.map(date_key), end.map(date_key)],
        snapshot_from_row,
    )?;
    rows.collect()
}

pub fn keyword_snapshots(
    conn: &Connection,
    keyword_id: i64,
    start: Option<NaiveDate>,
    end: Option<NaiveDate>,
) -> Result<Vec<RankingSnapshot>, rusqlite::Error> {
    let sql = format!(
        "SELECT {SNAPSHOT_COLUMNS} FROM ranking_snapshots
         WHERE keyword_id = ?1
           AND (?2 IS NULL OR snapshot_date >= ?2)
           AND (?3 IS NULL OR snapshot_date <= ?3)
         ORDER BY snapshot_date, snapshot_id"
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(
        params![keyword_id, start.map(date_key), end.map(date_key)],
        snapshot_from_row,
    )?;
    rows.collect()
}

pub fn count_run_snapshots(conn: &Connection, run_id: i64) -> Result<u32, rusqlite::Error> {
    conn.query_row(
        "SELECT COUNT(*) FROM ranking_snapshots WHERE run_id = ?1",
        params![run_id],
        |row| row.get(0),
    )
}

// ── Insight Sessions ───────────────────────────────────────────────

/// Session fields supplied by the cache when persisting a generation.
#[derive(Debug, Clone)]
pub struct NewSession<'a> {
    pub source_data_hash: &'a str,
    pub analysis_type: AnalysisType,
    pub report_card: &'a ReportCard,
    pub executive_summary: &'a str,
    pub model: &'a str,
    pub prompt_version: &'a str,
    pub elapsed_ms: u64,
}

pub fn find_active_session_id(
    conn: &Connection,
    source_data_hash: &str,
    analysis_type: AnalysisType,
) -> Result<Option<i64>, rusqlite::Error> {
    conn.query_row(
        "SELECT session_id FROM insight_sessions
         WHERE source_data_hash = ?1 AND analysis_type = ?2 AND status = 'active'",
        params![source_data_hash, analysis_type.as_str()],
        |row| row.get(0),
    )
    .optional()
}

/// Mark every active session of this analysis type superseded.
pub fn supersede_active_sessions(
    conn: &Connection,
    analysis_type: AnalysisType,
) -> Result<usize, rusqlite::Error> {
    conn.execute(
        "UPDATE insight_sessions SET status = 'superseded', superseded_at = datetime('now')
         WHERE analysis_type = ?1 AND status = 'active'",
        params![analysis_type.as_str()],
    )
}

pub fn insert_session(conn: &Connection, session: &NewSession<'_>) -> Result<i64, rusqlite::Error> {
    conn.execute(
        "INSERT INTO insight_sessions (
            source_data_hash, analysis_type, report_card, executive_summary, status,
            model, prompt_version, elapsed_ms, generated_at
        ) VALUES (?1, ?2, ?3, ?4, 'active', ?5, ?6, ?7, datetime('now'))",
        params![
            session.source_data_hash,
            session.analysis_type.as_str(),
            to_json(session.report_card)?,
            session.executive_summary,
            session.model,
            session.prompt_version,
            session.elapsed_ms as i64,
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

pub fn set_session_insight_ids(
    conn: &Connection,
    session_id: i64,
    insight_ids: &[i64],
) -> Result<(), rusqlite::Error> {
    conn.execute(
        "UPDATE insight_sessions SET insight_ids = ?2 WHERE session_id = ?1",
        params![session_id, to_json(&insight_ids)?],
    )?;
    Ok(())
}

/// Load a session and its records.
pub fn get_session(
    conn: &Connection,
    session_id: i64,
) -> Result<Option<InsightSession>, rusqlite::Error> {
    let session = conn
        .query_row(
            "SELECT session_id, source_data_hash, analysis_type, report_card, executive_summary,
                    status, insight_ids, model, prompt_version, elapsed_ms, generated_at,
                    superseded_at
             FROM insight_sessions WHERE session_id = ?1",
            params![session_id],
            |row| {
                let analysis_type: String = row.get(2)?;
                let status: String = row.get(5)?;
                Ok(InsightSession {
                    id: row.get(0)?,
                    source_data_hash: row.get(1)?,
                    analysis_type: AnalysisType::parse(&analysis_type)
                        .map_err(|e| conversion_error(2, e))?,
                    report_card: from_json(3, row.get(3)?)?,
                    executive_summary: row.get(4)?,
                    status: SessionStatus::parse(&status).ok_or_else(|| {
                        conversion_error(5, format!("unknown session status '{status}'"))
                    })?,
                    insight_ids: from_json(6, row.get(6)?)?,
                    metadata: GenerationMetadata {
                        model: row.get(7)?,
                        prompt_version: row.get(8)?,
                        elapsed_ms: row.get::<_, i64>(9)?.max(0) as u64,
                    },
                    generated_at: row.get(10)?,
                    superseded_at: row.get(11)?,
                    insights: Vec::new(),
                })
            },
        )
        .optional()?;

    match session {
        Some(mut s) => {
            s.insights = list_session_insights(conn, s.id)?;
            Ok(Some(s))
        }
        None => Ok(None),
    }
}

// ── Insight Records ────────────────────────────────────────────────

pub fn insert_insight(
    conn: &Connection,
    session_id: i64,
    insight: &GeneratedInsight,
) -> Result<i64, rusqlite::Error> {
    conn.execute(
        "INSERT INTO insight_records (
            session_id, insight_type, priority, title, message,
            affected_keywords, action_items, confidence, category, status, created_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, 'new', datetime('now'))",
        params![
            session_id,
            insight.insight_type,
            insight.priority.as_str(),
            insight.title,
            insight.message,
            to_json(&insight.affected_keywords)?,
            to_json(&insight.action_items)?,
            insight.confidence,
            insight.category,
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

const INSIGHT_COLUMNS: &str = "insight_id, session_id, insight_type, priority, title, message,
     affected_keywords, action_items, confidence, category, status, notes,
     actioned_by, actioned_at, created_at";

fn insight_from_row(row: &Row<'_>) -> Result<InsightRecord, rusqlite::Error> {
    let priority: String = row.get(3)?;
    let status: String = row.get(10)?;
    Ok(InsightRecord {
        id: row.get(0)?,
        session_id: row.get(1)?,
        insight_type: row.get(2)?,
        priority: InsightPriority::normalize(&priority),
        title: row.get(4)?,
        message: row.get(5)?,
        affected_keywords: from_json(6, row.get(6)?)?,
        action_items: from_json(7, row.get(7)?)?,
        confidence: row.get(8)?,
        category: row.get(9)?,
        status: InsightStatus::parse(&status).map_err(|e| conversion_error(10, e))?,
        notes: row.get(11)?,
        actioned_by: row.get(12)?,
        actioned_at: row.get(13)?,
        created_at: row.get(14)?,
    })
}

pub fn list_session_insights(
    conn: &Connection,
    session_id: i64,
) -> Result<Vec<InsightRecord>, rusqlite::Error> {
    let sql = format!(
        "SELECT {INSIGHT_COLUMNS} FROM insight_records WHERE session_id = ?1 ORDER BY insight_id"
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(params![session_id], insight_from_row)?;
    rows.collect()
}

pub fn get_insight(conn: &Connection, insight_id: i64) -> Result<Option<InsightRecord>, rusqlite::Error> {
    let sql = format!("SELECT {INSIGHT_COLUMNS} FROM insight_records WHERE insight_id = ?1");
    conn.query_row(&sql, params![insight_id], insight_from_row)
        .optional()
}

/// Write a status change. Terminal states stamp the actor and time; notes
/// are only replaced when supplied.
pub fn update_insight_status(
    conn: &Connection,
    insight_id: i64,
    status: InsightStatus,
    notes: Option<&str>,
    actor: Option<&str>,
) -> Result<bool, rusqlite::Error> {
    let count = if status.is_terminal() {
        conn.execute(
            "UPDATE insight_records SET
                status = ?2, notes = COALESCE(?3, notes),
                actioned_by = ?4, actioned_at = datetime('now')
             WHERE insight_id = ?1",
            params![insight_id, status.as_str(), notes, actor],
        )?
    } else {
        conn.execute(
            "UPDATE insight_records SET status = ?2, notes = COALESCE(?3, notes)
             WHERE insight_id = ?1",
            params![insight_id, status.as_str(), notes],
        )?
    };
    Ok(count > 0)
}

// ── Helpers ────────────────────────────────────────────────────────

fn date_key(date: NaiveDate) -> String {
    date.format("%Y-%m-%d").to_string()
}

fn parse_date(idx: usize, raw: &str) -> Result<NaiveDate, rusqlite::Error> {
    NaiveDate::parse_from_str(raw, "%Y-%m-%d").map_err(|e| conversion_error(idx, e))
}

fn to_json<T: Serialize + ?Sized>(value: &T) -> Result<String, rusqlite::Error> {
    serde_json::to_string(value).map_err(|e| rusqlite::Error::ToSqlConversionFailure(Box::new(e)))
}

fn from_json<T: DeserializeOwned>(idx: usize, raw: String) -> Result<T, rusqlite::Error> {
    serde_json::from_str(&raw).map_err(|e| conversion_error(idx, e))
}

fn conversion_error<E>(idx: usize, e: E) -> rusqlite::Error
where
    E: Into<Box<dyn std::error::Error + Send + Sync + 'static>>,
{
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, e.into())
}
