//! Pure scoring functions behind the report card.
//!
//! Positions follow the snapshot convention: 0 means "not found", anything
//! else is a 1-based rank. Sub-scores are computed in `f64` and rounded once
//! to an integer before they are combined.

use crate::report::types::{CompetitorOpportunity, Grade, Trend};

/// Points lost per unit of position standard deviation.
pub const CONSISTENCY_STDDEV_WEIGHT: f64 = 10.0;
/// Points gained per rank climbed between first and last observation.
pub const GROWTH_POINTS_PER_RANK: f64 = 5.0;
/// Rank change needed before a keyword counts as improving or declining.
pub const TREND_THRESHOLD: i64 = 2;
/// Stand-in for our rank when computing the gap on an unranked keyword.
pub const UNRANKED_POSITION: u32 = 100;
/// Maximum opportunities returned after diversification.
pub const MAX_OPPORTUNITIES: usize = 10;
/// Length of the top-performer and needs-attention lists.
pub const HIGHLIGHT_LIMIT: usize = 5;

/// Overall score weights, in the order visibility, position, consistency,
/// growth, competitive.
const WEIGHTS: [f64; 5] = [0.30, 0.25, 0.20, 0.15, 0.10];

pub fn round_score(value: f64) -> u32 {
    value.round().clamp(0.0, 100.0) as u32
}

/// Share of keywords ranked anywhere, 0..=100.
pub fn visibility_score(positions: &[u32]) -> u32 {
    if positions.is_empty() {
        return 0;
    }
    let ranked = positions.iter().filter(|p| **p > 0).count();
    round_score(ranked as f64 * 100.0 / positions.len() as f64)
}

/// Mean of ranked positions; `None` when nothing ranks.
pub fn average_position(positions: &[u32]) -> Option<f64> {
    let ranked: Vec<f64> = positions.iter().filter(|p| **p > 0).map(|p| *p as f64).collect();
    if ranked.is_empty() {
        None
    } else {
        Some(ranked.iter().sum::<f64>() / ranked.len() as f64)
    }
}

pub fn format_average_position(avg: Option<f64>) -> String {
    match avg {
        Some(v) => format!("{v:.1}"),
        None => "N/A".to_string(),
    }
}

/// Piecewise score for the average position. `None` scores 0.
pub fn position_score(avg: Option<f64>) -> u32 {
    match avg {
        None => 0,
        Some(p) if p <= 3.0 => 100,
        Some(p) if p <= 5.0 => 90,
        Some(p) if p <= 10.0 => 75,
        Some(p) if p <= 15.0 => 60,
        Some(p) if p <= 20.0 => 45,
        Some(_) => 30,
    }
}

/// Population standard deviation.
pub fn std_dev(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
    variance.sqrt()
}

/// Per-keyword consistency from its in-window positions (date order).
/// Fewer than two ranked observations score 0.
pub fn keyword_consistency(history: &[u32]) -> f64 {
    let valid: Vec<f64> = history.iter().filter(|p| **p > 0).map(|p| *p as f64).collect();
    if valid.len() < 2 {
        return 0.0;
    }
    (100.0 - CONSISTENCY_STDDEV_WEIGHT * std_dev(&valid)).max(0.0)
}

/// Mean consistency over every keyword, including those scoring 0.
pub fn consistency_score(histories: &[Vec<u32>]) -> u32 {
    if histories.is_empty() {
        return 0;
    }
    let total: f64 = histories.iter().map(|h| keyword_consistency(h)).sum();
    round_score(total / histories.len() as f64)
}

/// First and last ranked positions of a date-ordered history.
fn first_last(history: &[u32]) -> Option<(u32, u32)> {
    let mut valid = history.iter().copied().filter(|p| *p > 0);
    let first = valid.next()?;
    let last = valid.last()?;
    Some((first, last))
}

/// Per-keyword growth, `None` with fewer than two ranked observations.
pub fn keyword_growth(history: &[u32]) -> Option<f64> {
    let (first, last) = first_last(history)?;
    let improvement = first as f64 - last as f64;
    Some((50.0 + GROWTH_POINTS_PER_RANK * improvement).clamp(0.0, 100.0))
}

/// Mean growth over qualifying keywords; 50 when none qualify.
pub fn growth_score(histories: &[Vec<u32>]) -> u32 {
    let scores: Vec<f64> = histories.iter().filter_map(|h| keyword_growth(h)).collect();
    if scores.is_empty() {
        return 50;
    }
    round_score(scores.iter().sum::<f64>() / scores.len() as f64)
}

/// Improving when the rank dropped by more than the threshold.
pub fn keyword_trend(history: &[u32]) -> Trend {
    match first_last(history) {
        Some((first, last)) => {
            let change = last as i64 - first as i64;
            if change < -TREND_THRESHOLD {
                Trend::Improving
            } else if change > TREND_THRESHOLD {
                Trend::Declining
            } else {
                Trend::Stable
            }
        }
        None => Trend::Stable,
    }
}

/// Share of matched (keyword, competitor) pairs we win. 0 with no pairs.
pub fn competitive_score(pairs: &[(u32, u32)]) -> u32 {
    if pairs.is_empty() {
        return 0;
    }
    let wins = pairs
        .iter()
        .filter(|(ours, theirs)| *ours > 0 && ours < theirs)
        .count();
    round_score(wins as f64 * 100.0 / pairs.len() as f64)
}

pub fn overall_score(
    visibility: u32,
    position: u32,
    consistency: u32,
    growth: u32,
    competitive: u32,
) -> u32 {
    let parts = [visibility, position, consistency, growth, competitive];
    let weighted: f64 = parts
        .iter()
        .zip(WEIGHTS.iter())
        .map(|(score, weight)| *score as f64 * weight)
        .sum();
    round_score(weighted)
}

pub fn grade(overall: u32, total_keywords: usize) -> Grade {
    if total_keywords == 0 {
        Grade::NotApplicable
    } else {
        Grade::from_score(overall)
    }
}

/// Ranks between us and a competitor that currently beats us.
/// `None` when the competitor does not outrank us.
pub fn opportunity_gap(ours: u32, theirs: u32) -> Option<u32> {
    if theirs == 0 {
        return None;
    }
    let effective = if ours == 0 { UNRANKED_POSITION } else { ours };
    (theirs < effective).then(|| effective - theirs)
}

/// Keep the smallest-gap opportunity per keyword, then the easiest
/// [`MAX_OPPORTUNITIES`] overall.
pub fn diversify_opportunities(
    mut opportunities: Vec<CompetitorOpportunity>,
) -> Vec<CompetitorOpportunity> {
    opportunities.sort_by(|a, b| {
        a.keyword_id
            .cmp(&b.keyword_id)
            .then(a.gap.cmp(&b.gap))
            .then(a.competitor_position.cmp(&b.competitor_position))
            .then(a.competitor.cmp(&b.competitor))
    });
    opportunities.dedup_by_key(|o| o.keyword_id);
    opportunities.sort_by(|a, b| {
        a.gap
            .cmp(&b.gap)
            .then(a.keyword.cmp(&b.keyword))
            .then(a.keyword_id.cmp(&b.keyword_id))
    });
    opportunities.truncate(MAX_OPPORTUNITIES);
    opportunities
}

#[cfg(test)]
mod tests {
    use super::*;

    fn opp(keyword_id: i64, competitor: &str, theirs: u32, ours: u32) -> CompetitorOpportunity {
        CompetitorOpportunity {
            keyword_id,
            keyword: format!("kw{keyword_id}"),
            competitor: competitor.to_string(),
            competitor_position: theirs,
            our_position: ours,
            gap: opportunity_gap(ours, theirs).unwrap(),
        }
    }

    #[test]
    fn test_visibility_and_average_scenario() {
        let positions = [2, 15, 0];
        assert_eq!(visibility_score(&positions), 67);
        let avg = average_position(&positions);
        assert_eq!(format_average_position(avg), "8.5");
        assert_eq!(position_score(avg), 75);
    }

    #[test]
    fn test_average_position_none_when_unranked() {
        let avg = average_position(&[0, 0]);
        assert_eq!(avg, None);
        assert_eq!(format_average_position(avg), "N/A");
        assert_eq!(position_score(avg), 0);
        assert_eq!(visibility_score(&[]), 0);
    }

    #[test]
    fn test_position_score_bands() {
        assert_eq!(position_score(Some(3.0)), 100);
        assert_eq!(position_score(Some(3.1)), 90);
        assert_eq!(position_score(Some(5.0)), 90);
        assert_eq!(position_score(Some(10.0)), 75);
        assert_eq!(position_score(Some(15.0)), 60);
        assert_eq!(position_score(Some(20.0)), 45);
        assert_eq!(position_score(Some(20.5)), 30);
    }

    #[test]
    fn test_flat_history_scores() {
        let history = vec![5, 5, 5, 5];
        assert_eq!(keyword_consistency(&history), 100.0);
        assert_eq!(keyword_growth(&history), Some(50.0));
        assert_eq!(keyword_trend(&history), Trend::Stable);
        assert_eq!(consistency_score(&[history.clone()]), 100);
        assert_eq!(growth_score(&[history]), 50);
    }

    #[test]
    fn test_consistency_ignores_unranked_and_needs_two_points() {
        assert_eq!(keyword_consistency(&[4]), 0.0);
        assert_eq!(keyword_consistency(&[0, 4, 0]), 0.0);
        // stddev of [2, 4] is 1 → 90
        assert_eq!(keyword_consistency(&[2, 0, 4]), 90.0);
        // Very noisy history floors at 0.
        assert_eq!(keyword_consistency(&[1, 40]), 0.0);
        // Mean includes keywords that scored 0.
        assert_eq!(consistency_score(&[vec![5, 5], vec![7]]), 50);
    }

    #[test]
    fn test_growth_direction_and_clamp() {
        assert_eq!(keyword_growth(&[10, 8, 4]), Some(80.0));
        assert_eq!(keyword_growth(&[4, 10]), Some(20.0));
        assert_eq!(keyword_growth(&[20, 1]), Some(100.0));
        assert_eq!(keyword_growth(&[1, 30]), Some(0.0));
        assert_eq!(keyword_growth(&[0, 3]), None);
        // Non-qualifying keywords are left out of the mean.
        assert_eq!(growth_score(&[vec![10, 8], vec![3]]), 60);
        assert_eq!(growth_score(&[vec![3], vec![]]), 50);
    }

    #[test]
    fn test_trend_threshold_is_exclusive() {
        assert_eq!(keyword_trend(&[10, 7]), Trend::Improving);
        assert_eq!(keyword_trend(&[10, 8]), Trend::Stable);
        assert_eq!(keyword_trend(&[10, 12]), Trend::Stable);
        assert_eq!(keyword_trend(&[10, 13]), Trend::Declining);
        assert_eq!(keyword_trend(&[0, 13]), Trend::Stable);
    }

    #[test]
    fn test_competitive_score() {
        assert_eq!(competitive_score(&[]), 0);
        // Win, loss, unranked loss.
        assert_eq!(competitive_score(&[(2, 5), (6, 3), (0, 4)]), 33);
        assert_eq!(competitive_score(&[(1, 2)]), 100);
    }

    #[test]
    fn test_overall_score_weights() {
        assert_eq!(overall_score(100, 100, 100, 100, 100), 100);
        assert_eq!(overall_score(0, 0, 0, 0, 0), 0);
        // 67*.3 + 75*.25 + 0*.2 + 50*.15 + 0*.1 = 20.1 + 18.75 + 7.5 = 46.35
        assert_eq!(overall_score(67, 75, 0, 50, 0), 46);
    }

    #[test]
    fn test_grade_boundaries() {
        assert_eq!(grade(90, 1), Grade::A);
        assert_eq!(grade(80, 1), Grade::B);
        assert_eq!(grade(70, 1), Grade::C);
        assert_eq!(grade(60, 1), Grade::D);
        assert_eq!(grade(59, 1), Grade::F);
        assert_eq!(grade(0, 0), Grade::NotApplicable);
    }

    #[test]
    fn test_opportunity_gap() {
        assert_eq!(opportunity_gap(8, 3), Some(5));
        assert_eq!(opportunity_gap(3, 8), None);
        assert_eq!(opportunity_gap(4, 4), None);
        assert_eq!(opportunity_gap(0, 6), Some(UNRANKED_POSITION - 6));
        assert_eq!(opportunity_gap(5, 0), None);
    }

    #[test]
    fn test_diversify_keeps_min_gap_per_keyword() {
        let opps = vec![
            opp(1, "a.com", 2, 9),
            opp(1, "b.com", 6, 9),
            opp(1, "c.com", 1, 9),
            opp(2, "a.com", 3, 5),
            opp(2, "b.com", 1, 5),
        ];

        let result = diversify_opportunities(opps);

        assert_eq!(result.len(), 2);
        assert_eq!(result[0].keyword_id, 2);
        assert_eq!(result[0].competitor, "a.com");
        assert_eq!(result[0].gap, 2);
        assert_eq!(result[1].keyword_id, 1);
        assert_eq!(result[1].competitor, "b.com");
        assert_eq!(result[1].gap, 3);
    }

    #[test]
    fn test_diversify_caps_at_ten() {
        let opps: Vec<_> = (1..=15).map(|id| opp(id, "a.com", 1, 1 + id as u32)).collect();
        let result = diversify_opportunities(opps);
        assert_eq!(result.len(), MAX_OPPORTUNITIES);
        assert_eq!(result[0].gap, 1);
        assert_eq!(result[9].gap, 10);
    }

    #[test]
    fn test_std_dev_population() {
        assert_eq!(std_dev(&[]), 0.0);
        assert_eq!(std_dev(&[2.0, 4.0, 4.0, 4.0, 5.0, 5.0, 7.0, 9.0]), 2.0);
    }
}
