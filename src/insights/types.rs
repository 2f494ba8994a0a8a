use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::report::ReportCard;

/// Lens the generator is asked to apply.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnalysisType {
    #[default]
    Comprehensive,
    QuickWins,
    Competitive,
    Trends,
}

impl AnalysisType {
    pub fn parse(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().replace('-', "_").as_str() {
            "comprehensive" => Ok(AnalysisType::Comprehensive),
            "quick_wins" | "quickwins" => Ok(AnalysisType::QuickWins),
            "competitive" => Ok(AnalysisType::Competitive),
            "trends" => Ok(AnalysisType::Trends),
            _ => Err(Error::InvalidInput(format!(
                "unknown analysis type '{s}' (expected comprehensive, quick_wins, competitive or trends)"
            ))),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            AnalysisType::Comprehensive => "comprehensive",
            AnalysisType::QuickWins => "quick_wins",
            AnalysisType::Competitive => "competitive",
            AnalysisType::Trends => "trends",
        }
    }
}

impl std::fmt::Display for AnalysisType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Workflow state of one insight record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InsightStatus {
    New,
    InProgress,
    Completed,
    Dismissed,
}

impl InsightStatus {
    pub fn parse(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().replace('-', "_").as_str() {
            "new" => Ok(InsightStatus::New),
            "in_progress" => Ok(InsightStatus::InProgress),
            "completed" => Ok(InsightStatus::Completed),
            "dismissed" => Ok(InsightStatus::Dismissed),
            _ => Err(Error::InvalidInput(format!(
                "unknown insight status '{s}' (expected new, in_progress, completed or dismissed)"
            ))),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            InsightStatus::New => "new",
            InsightStatus::InProgress => "in_progress",
            InsightStatus::Completed => "completed",
            InsightStatus::Dismissed => "dismissed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, InsightStatus::Completed | InsightStatus::Dismissed)
    }

    /// `new → in_progress → completed`, or `new/in_progress → dismissed`.
    pub fn can_transition_to(&self, next: InsightStatus) -> bool {
        use InsightStatus::*;
        matches!(
            (*self, next),
            (New, InProgress) | (InProgress, Completed) | (New, Dismissed) | (InProgress, Dismissed)
        )
    }
}

impl std::fmt::Display for InsightStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InsightPriority {
    High,
    Medium,
    Low,
}

impl InsightPriority {
    /// Lenient parse of generator output; unknown values become `Medium`.
    pub fn normalize(s: &str) -> Self {
        match s.trim().to_lowercase().as_str() {
            "high" | "critical" | "urgent" => InsightPriority::High,
            "low" => InsightPriority::Low,
            _ => InsightPriority::Medium,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            InsightPriority::High => "high",
            InsightPriority::Medium => "medium",
            InsightPriority::Low => "low",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Active,
    Superseded,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Active => "active",
            SessionStatus::Superseded => "superseded",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "active" => Some(SessionStatus::Active),
            "superseded" => Some(SessionStatus::Superseded),
            _ => None,
        }
    }
}

/// Input to an [`InsightGenerator`](super::InsightGenerator).
#[derive(Debug, Clone, Serialize)]
pub struct InsightRequest {
    pub report_card: ReportCard,
    pub analysis_type: AnalysisType,
    pub focus_areas: Vec<String>,
}

/// One finding as returned by the generator, before persistence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeneratedInsight {
    pub insight_type: String,
    pub priority: InsightPriority,
    pub title: String,
    pub message: String,
    pub affected_keywords: Vec<String>,
    pub action_items: Vec<String>,
    /// 0.0..=1.0
    pub confidence: f64,
    pub category: String,
}

/// Generator output for one request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeneratedInsights {
    pub executive_summary: String,
    pub insights: Vec<GeneratedInsight>,
    pub model: String,
    pub prompt_version: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationMetadata {
    pub model: String,
    pub prompt_version: String,
    pub elapsed_ms: u64,
}

/// Persisted insight record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InsightRecord {
    pub id: i64,
    pub session_id: i64,
    pub insight_type: String,
    pub priority: InsightPriority,
    pub title: String,
    pub message: String,
    pub affected_keywords: Vec<String>,
    pub action_items: Vec<String>,
    pub confidence: f64,
    pub category: String,
    pub status: InsightStatus,
    pub notes: Option<String>,
    pub actioned_by: Option<String>,
    pub actioned_at: Option<String>,
    pub created_at: String,
}

/// Persisted analysis run with its records.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InsightSession {
    pub id: i64,
    pub source_data_hash: String,
    pub analysis_type: AnalysisType,
    pub report_card: ReportCard,
    pub executive_summary: String,
    pub status: SessionStatus,
    pub insight_ids: Vec<i64>,
    pub metadata: GenerationMetadata,
    pub generated_at: String,
    pub superseded_at: Option<String>,
    pub insights: Vec<InsightRecord>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_transitions() {
        use InsightStatus::*;
        assert!(New.can_transition_to(InProgress));
        assert!(InProgress.can_transition_to(Completed));
        assert!(New.can_transition_to(Dismissed));
        assert!(InProgress.can_transition_to(Dismissed));

        assert!(!New.can_transition_to(Completed));
        assert!(!New.can_transition_to(New));
        assert!(!Completed.can_transition_to(InProgress));
        assert!(!Dismissed.can_transition_to(New));
        assert!(!Completed.can_transition_to(Dismissed));
    }

    #[test]
    fn test_status_parse() {
        assert_eq!(InsightStatus::parse("in-progress").unwrap(), InsightStatus::InProgress);
        assert_eq!(InsightStatus::parse("Completed").unwrap(), InsightStatus::Completed);
        assert!(matches!(InsightStatus::parse("done"), Err(Error::InvalidInput(_))));
    }

    #[test]
    fn test_analysis_type_parse() {
        assert_eq!(AnalysisType::parse("quick-wins").unwrap(), AnalysisType::QuickWins);
        assert_eq!(AnalysisType::parse("TRENDS").unwrap(), AnalysisType::Trends);
        assert!(AnalysisType::parse("everything").is_err());
    }

    #[test]
    fn test_priority_normalize() {
        assert_eq!(InsightPriority::normalize("Critical"), InsightPriority::High);
        assert_eq!(InsightPriority::normalize("low"), InsightPriority::Low);
        assert_eq!(InsightPriority::normalize("whatever"), InsightPriority::Medium);
    }
}
