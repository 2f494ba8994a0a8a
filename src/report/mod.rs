pub mod scoring;
pub mod types;

pub use types::*;

use std::collections::BTreeMap;

use chrono::{NaiveDate, Utc};

use crate::error::Result;
use crate::query::period::ReportPeriod;
use crate::storage::repository::{self, ManagedCompetitor, RankingSnapshot, TrackedKeyword};
use crate::storage::Database;
use crate::url::matches_competitor;

use scoring::*;

/// Per-keyword view assembled before scoring.
struct KeywordView<'a> {
    keyword: &'a TrackedKeyword,
    latest: Option<&'a RankingSnapshot>,
    history: Vec<u32>,
}

impl KeywordView<'_> {
    fn position(&self) -> u32 {
        self.latest.map(|s| s.position).unwrap_or(0)
    }
}

/// Build a report card from already-loaded data.
///
/// Pure: the same inputs always produce the same card. Inactive keywords and
/// competitors are ignored. `window` supplies each keyword's latest position
/// (most recent date, then highest id); `history` supplies the in-window
/// series used for consistency, growth and trend.
pub fn compute_report_card(
    keywords: &[TrackedKeyword],
    window: &[RankingSnapshot],
    history: &[RankingSnapshot],
    competitors: &[ManagedCompetitor],
    period: ReportPeriod,
) -> ReportCard {
    let mut active: BTreeMap<i64, &TrackedKeyword> = BTreeMap::new();
    for k in keywords.iter().filter(|k| k.is_active) {
        active.entry(k.id).or_insert(k);
    }
    if active.is_empty() {
        return ReportCard::empty(period);
    }

    let mut latest: BTreeMap<i64, &RankingSnapshot> = BTreeMap::new();
    for snap in window {
        let newer = match latest.get(&snap.keyword_id) {
            Some(cur) => (snap.date, snap.id) > (cur.date, cur.id),
            None => true,
        };
        if newer {
            latest.insert(snap.keyword_id, snap);
        }
    }

    let mut series: BTreeMap<i64, Vec<&RankingSnapshot>> = BTreeMap::new();
    for snap in history {
        series.entry(snap.keyword_id).or_default().push(snap);
    }

    let views: Vec<KeywordView<'_>> = active
        .values()
        .map(|&keyword| {
            let mut snaps = series.remove(&keyword.id).unwrap_or_default();
            snaps.sort_by_key(|s| (s.date, s.id));
            KeywordView {
                keyword,
                latest: latest.get(&keyword.id).copied(),
                history: snaps.iter().map(|s| s.position).collect(),
            }
        })
        .collect();

    let positions: Vec<u32> = views.iter().map(|v| v.position()).collect();
    let histories: Vec<Vec<u32>> = views.iter().map(|v| v.history.clone()).collect();

    let visibility = visibility_score(&positions);
    let avg = average_position(&positions);
    let position = position_score(avg);
    let consistency = consistency_score(&histories);
    let growth = growth_score(&histories);

    let rivals: Vec<&ManagedCompetitor> = competitors
        .iter()
        .filter(|c| c.is_active && !c.normalized_domain.is_empty())
        .collect();
    let mut pairs = Vec::new();
    let mut opportunities = Vec::new();
    for view in &views {
        let Some(snapshot) = view.latest else { continue };
        let ours = snapshot.position;
        for rival in &rivals {
            let Some(theirs) = snapshot
                .competitors
                .iter()
                .filter(|e| matches_competitor(&e.url, &rival.normalized_domain))
                .map(|e| e.position)
                .min()
            else {
                continue;
            };
            pairs.push((ours, theirs));
            if let Some(gap) = opportunity_gap(ours, theirs) {
                opportunities.push(CompetitorOpportunity {
                    keyword_id: view.keyword.id,
                    keyword: view.keyword.phrase.clone(),
                    competitor: rival.name.clone(),
                    competitor_position: theirs,
                    our_position: ours,
                    gap,
                });
            }
        }
    }
    let competitive = competitive_score(&pairs);

    let overall = overall_score(visibility, position, consistency, growth, competitive);

    let mut breakdown = KeywordBreakdown::default();
    for p in &positions {
        match p {
            1..=3 => breakdown.top3 += 1,
            4..=10 => breakdown.top10 += 1,
            11..=20 => breakdown.top20 += 1,
            _ => breakdown.not_found += 1,
        }
    }

    let mut trends = TrendSummary::default();
    let highlights: Vec<KeywordHighlight> = views
        .iter()
        .map(|v| {
            let trend = keyword_trend(&v.history);
            match trend {
                Trend::Improving => trends.improving += 1,
                Trend::Declining => trends.declining += 1,
                Trend::Stable => trends.stable += 1,
            }
            KeywordHighlight {
                keyword_id: v.keyword.id,
                keyword: v.keyword.phrase.clone(),
                position: v.position(),
                trend,
            }
        })
        .collect();

    let mut top_performers: Vec<KeywordHighlight> =
        highlights.iter().filter(|h| h.position > 0).cloned().collect();
    top_performers.sort_by_key(|h| (h.position, h.keyword_id));
    top_performers.truncate(HIGHLIGHT_LIMIT);

    // Unranked sorts as worst, then deepest rank first.
    let mut needs_attention: Vec<KeywordHighlight> = highlights
        .iter()
        .filter(|h| h.position == 0 || h.position > 20)
        .cloned()
        .collect();
    needs_attention.sort_by_key(|h| {
        let depth = if h.position == 0 { u32::MAX } else { h.position };
        (std::cmp::Reverse(depth), h.keyword_id)
    });
    needs_attention.truncate(HIGHLIGHT_LIMIT);

    ReportCard {
        period,
        grade: grade(overall, views.len()),
        overall_score: overall,
        total_keywords: views.len() as u32,
        ranked_keywords: positions.iter().filter(|p| **p > 0).count() as u32,
        metrics: MetricScores {
            visibility,
            average_position: format_average_position(avg),
            position_score: position,
            consistency,
            growth,
            competitive,
        },
        breakdown,
        top_performers,
        needs_attention,
        trends,
        opportunities: diversify_opportunities(opportunities),
        generated_at: None,
    }
}

/// Load keywords, competitors and in-window snapshots, then compute the card
/// as of `as_of` (inclusive). Stamps `generated_at`.
pub async fn load_report_card(
    db: &Database,
    period: ReportPeriod,
    as_of: NaiveDate,
) -> Result<ReportCard> {
    let start = period.window_start(as_of);
    let (keywords, competitors, snapshots) = db
        .reader()
        .call(move |conn| {
            let keywords = repository::list_keywords(conn, true)?;
            let competitors = repository::list_competitors(conn, true)?;
            let snapshots = repository::snapshots_between(conn, start, Some(as_of))?;
            Ok::<_, rusqlite::Error>((keywords, competitors, snapshots))
        })
        .await?;

    log::debug!(
        "Report {period}: {} keyword(s), {} competitor(s), {} snapshot(s)",
        keywords.len(),
        competitors.len(),
        snapshots.len()
    );

    let mut card = compute_report_card(&keywords, &snapshots, &snapshots, &competitors, period);
    card.generated_at = Some(Utc::now().to_rfc3339());
    Ok(card)
}
