use serde::{Deserialize, Serialize};

use crate::query::period::ReportPeriod;

/// Letter grade for the overall score.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Grade {
    A,
    B,
    C,
    D,
    F,
    #[serde(rename = "N/A")]
    NotApplicable,
}

impl Grade {
    /// Inclusive lower bounds: 90 A, 80 B, 70 C, 60 D.
    pub fn from_score(score: u32) -> Self {
        match score {
            90.. => Grade::A,
            80..=89 => Grade::B,
            70..=79 => Grade::C,
            60..=69 => Grade::D,
            _ => Grade::F,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Grade::A => "A",
            Grade::B => "B",
            Grade::C => "C",
            Grade::D => "D",
            Grade::F => "F",
            Grade::NotApplicable => "N/A",
        }
    }
}

impl std::fmt::Display for Grade {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Direction of a keyword's position over the window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Trend {
    Improving,
    Declining,
    Stable,
}

/// Sub-scores, each 0..=100 except `average_position`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricScores {
    pub visibility: u32,
    /// Mean rank of ranked keywords to one decimal, or `"N/A"`.
    pub average_position: String,
    pub position_score: u32,
    pub consistency: u32,
    pub growth: u32,
    pub competitive: u32,
}

/// Latest-position buckets. Every keyword lands in exactly one.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeywordBreakdown {
    pub top3: u32,
    pub top10: u32,
    pub top20: u32,
    pub not_found: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeywordHighlight {
    pub keyword_id: i64,
    pub keyword: String,
    /// 0 when not found.
    pub position: u32,
    pub trend: Trend,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrendSummary {
    pub improving: u32,
    pub declining: u32,
    pub stable: u32,
}

/// A keyword where a competitor currently outranks us.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompetitorOpportunity {
    pub keyword_id: i64,
    pub keyword: String,
    pub competitor: String,
    pub competitor_position: u32,
    /// 0 when we are not ranked.
    pub our_position: u32,
    /// Ranks to climb to draw level with the competitor.
    pub gap: u32,
}

/// Computed scorecard for one window.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportCard {
    pub period: ReportPeriod,
    pub grade: Grade,
    pub overall_score: u32,
    pub total_keywords: u32,
    pub ranked_keywords: u32,
    pub metrics: MetricScores,
    pub breakdown: KeywordBreakdown,
    pub top_performers: Vec<KeywordHighlight>,
    pub needs_attention: Vec<KeywordHighlight>,
    pub trends: TrendSummary,
    pub opportunities: Vec<CompetitorOpportunity>,
    /// Stamped by the loader, excluded from content hashing.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub generated_at: Option<String>,
}

impl ReportCard {
    /// Zero-value card for an empty keyword set.
    pub fn empty(period: ReportPeriod) -> Self {
        Self {
            period,
            grade: Grade::NotApplicable,
            overall_score: 0,
            total_keywords: 0,
            ranked_keywords: 0,
            metrics: MetricScores {
                average_position: "N/A".to_string(),
                ..MetricScores::default()
            },
            breakdown: KeywordBreakdown::default(),
            top_performers: Vec::new(),
            needs_attention: Vec::new(),
            trends: TrendSummary::default(),
            opportunities: Vec::new(),
            generated_at: None,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.total_keywords == 0
    }
}
