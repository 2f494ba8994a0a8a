pub mod agent;
pub mod cache;
pub mod types;

use async_trait::async_trait;

use crate::error::{Error, Result};
use crate::storage::repository;
use crate::storage::Database;

pub use types::*;

/// Produces narrative insights for a report card.
///
/// Implementations report provider throttling as
/// [`Error::AnalysisRateLimited`] and missing configuration or an unreachable
/// provider as [`Error::AnalysisUnavailable`]. They never return an empty
/// placeholder in place of an error.
#[async_trait(?Send)]
pub trait InsightGenerator {
    async fn generate(&self, request: &InsightRequest) -> Result<GeneratedInsights>;
}

/// Load a session with its insight records.
pub async fn get_session(db: &Database, session_id: i64) -> Result<InsightSession> {
    db.reader()
        .call(move |conn| repository::get_session(conn, session_id))
        .await?
        .ok_or_else(|| Error::NotFound(format!("insight session {session_id}")))
}

/// Move an insight through its workflow.
///
/// Terminal states (`completed`, `dismissed`) require an actor, which is
/// recorded together with the time of the change.
pub async fn update_insight_status(
    db: &Database,
    insight_id: i64,
    status: InsightStatus,
    notes: Option<String>,
    actor: Option<String>,
) -> Result<InsightRecord> {
    let actor = actor
        .map(|a| a.trim().to_string())
        .filter(|a| !a.is_empty());
    if status.is_terminal() && actor.is_none() {
        return Err(Error::InvalidInput(format!(
            "marking an insight {status} requires an actor"
        )));
    }

    let outcome = db
        .writer()
        .call(move |conn| {
            let Some(current) = repository::get_insight(conn, insight_id)? else {
                return Ok::<_, rusqlite::Error>(Err(Error::NotFound(format!(
                    "insight {insight_id}"
                ))));
            };
            if !current.status.can_transition_to(status) {
                return Ok(Err(Error::InvalidInput(format!(
                    "insight {insight_id} cannot move from {} to {status}",
                    current.status
                ))));
            }
            repository::update_insight_status(
                conn,
                insight_id,
                status,
                notes.as_deref(),
                actor.as_deref(),
            )?;
            let updated = repository::get_insight(conn, insight_id)?;
            Ok(updated.ok_or_else(|| Error::NotFound(format!("insight {insight_id}"))))
        })
        .await?;

    if let Ok(record) = &outcome {
        log::info!("Insight {} is now {}", record.id, record.status);
    }
    outcome
}
