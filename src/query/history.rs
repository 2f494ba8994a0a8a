use chrono::NaiveDate;
use serde::Serialize;

use crate::error::{Error, Result};
use crate::query::period::ReportPeriod;
use crate::storage::repository;
use crate::storage::Database;

/// One dated observation in a keyword's history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HistoryPoint {
    pub date: NaiveDate,
    /// 0 = not found.
    pub position: u32,
    pub run_id: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct KeywordHistory {
    pub keyword_id: i64,
    pub keyword: String,
    pub period: ReportPeriod,
    pub points: Vec<HistoryPoint>,
}

impl KeywordHistory {
    /// Best (lowest) ranked position in the window, if any.
    pub fn best_position(&self) -> Option<u32> {
        self.points.iter().map(|p| p.position).filter(|p| *p > 0).min()
    }
}

/// Date-ordered positions for one keyword within `period`, ending on `as_of`.
pub async fn keyword_history(
    db: &Database,
    keyword_id: i64,
    period: ReportPeriod,
    as_of: NaiveDate,
) -> Result<KeywordHistory> {
    let start = period.window_start(as_of);
    let (keyword, snapshots) = db
        .reader()
        .call(move |conn| {
            let keyword = repository::get_keyword(conn, keyword_id)?;
            let snapshots = repository::keyword_snapshots(conn, keyword_id, start, Some(as_of))?;
            Ok::<_, rusqlite::Error>((keyword, snapshots))
        })
        .await?;

    let keyword =
        keyword.ok_or_else(|| Error::NotFound(format!("keyword {keyword_id}")))?;

    Ok(KeywordHistory {
        keyword_id,
        keyword: keyword.phrase,
        period,
        points: snapshots
            .into_iter()
            .map(|s| HistoryPoint {
                date: s.date,
                position: s.position,
                run_id: s.run_id,
            })
            .collect(),
    })
}
