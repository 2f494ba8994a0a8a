use async_trait::async_trait;
use serde::Deserialize;

use crate::date_util::strip_code_fences;
use crate::error::{Error, Result};
use crate::insights::types::{
    AnalysisType, GeneratedInsight, GeneratedInsights, InsightPriority, InsightRequest,
};
use crate::insights::InsightGenerator;
use crate::storage::repository;
use crate::storage::Database;

pub const PROMPT_VERSION: &str = "insights-v1";

const CATEGORIES: &[&str] = &["content", "technical", "competitive", "keywords", "trends"];
const DEFAULT_CATEGORY: &str = "general";
const DEFAULT_CONFIDENCE: f64 = 0.5;

/// Insight generator backed by a mixtape agent.
pub struct MixtapeGenerator {
    agent: mixtape_core::Agent,
    model: String,
}

impl MixtapeGenerator {
    /// Build from `llm_provider` / `llm_model` in `app_config`.
    pub async fn from_config(db: &Database) -> Result<Self> {
        let (provider, model) = db
            .reader()
            .call(|conn| {
                let provider = repository::get_config(conn, "llm_provider")?;
                let model = repository::get_config(conn, "llm_model")?;
                Ok::<(Option<String>, Option<String>), rusqlite::Error>((provider, model))
            })
            .await?;

        let provider = provider.as_deref().unwrap_or("bedrock");
        let model_name = model.as_deref().unwrap_or("claude-sonnet-4-5");

        let agent = build_agent(provider, model_name).await?;
        Ok(Self {
            agent,
            model: format!("{provider}/{model_name}"),
        })
    }
}

async fn build_agent(provider: &str, model_name: &str) -> Result<mixtape_core::Agent> {
    // Each combination needs its own builder call since the model types are different.
    let built = match (provider, model_name) {
        ("bedrock", "claude-haiku-4-5" | "haiku") => {
            mixtape_core::Agent::builder()
                .bedrock(mixtape_core::ClaudeHaiku4_5)
                .build()
                .await
        }
        ("bedrock", _) => {
            mixtape_core::Agent::builder()
                .bedrock(mixtape_core::ClaudeSonnet4_5)
                .build()
                .await
        }
        ("anthropic", "claude-haiku-4-5" | "haiku") => {
            mixtape_core::Agent::builder()
                .anthropic_from_env(mixtape_core::ClaudeHaiku4_5)
                .build()
                .await
        }
        ("anthropic", _) => {
            mixtape_core::Agent::builder()
                .anthropic_from_env(mixtape_core::ClaudeSonnet4_5)
                .build()
                .await
        }
        (other, _) => {
            return Err(Error::AnalysisUnavailable(format!(
                "unknown llm_provider '{other}' (expected bedrock or anthropic)"
            )))
        }
    };
    built.map_err(|e| Error::AnalysisUnavailable(format!("cannot initialise {provider}: {e}")))
}

#[async_trait(?Send)]
impl InsightGenerator for MixtapeGenerator {
    async fn generate(&self, request: &InsightRequest) -> Result<GeneratedInsights> {
        let prompt = build_prompt(request)?;
        log::debug!(
            "Requesting {} analysis from {} ({} chars)",
            request.analysis_type,
            self.model,
            prompt.len()
        );
        let response = self
            .agent
            .run(&prompt)
            .await
            .map_err(|e| classify_llm_error(&e.to_string()))?;
        parse_response(response.text().trim(), &self.model)
    }
}

/// Map a provider error message to the caller-facing error kind.
pub fn classify_llm_error(msg: &str) -> Error {
    let lower = msg.to_lowercase();
    if msg.contains("429")
        || lower.contains("rate limit")
        || lower.contains("throttl")
        || lower.contains("too many requests")
    {
        Error::AnalysisRateLimited(msg.to_string())
    } else if lower.contains("credential")
        || lower.contains("unauthorized")
        || lower.contains("access denied")
        || lower.contains("api key")
        || lower.contains("connect")
        || lower.contains("dns")
    {
        Error::AnalysisUnavailable(msg.to_string())
    } else {
        Error::Llm(msg.to_string())
    }
}

fn focus_instructions(analysis_type: AnalysisType) -> &'static str {
    match analysis_type {
        AnalysisType::Comprehensive => {
            "Cover visibility, ranking quality, stability, growth and competitor gaps. \
             Return 4-8 insights."
        }
        AnalysisType::QuickWins => {
            "Only include changes that could move a keyword up within weeks: keywords ranked \
             4-20 and the smallest competitor gaps. Return 3-5 insights."
        }
        AnalysisType::Competitive => {
            "Focus on where competitors outrank the site and what they do differently. \
             Return 3-6 insights."
        }
        AnalysisType::Trends => {
            "Focus on improving and declining keywords and what the movement suggests. \
             Return 3-6 insights."
        }
    }
}

pub fn build_prompt(request: &InsightRequest) -> Result<String> {
    let report_json = serde_json::to_string_pretty(&request.report_card)?;
    let focus = if request.focus_areas.is_empty() {
        String::new()
    } else {
        format!("\nGive extra attention to: {}\n", request.focus_areas.join(", "))
    };
    let instructions = focus_instructions(request.analysis_type);
    let analysis_type = request.analysis_type;
    let categories = CATEGORIES.join(", ");

    Ok(format!(
        r#"You are an SEO analyst. Review this search ranking report card and produce a {analysis_type} analysis as JSON.

{instructions}
{focus}
Report card:
{report_json}

Positions are 1-based ranks; 0 means the site was not found. Scores are 0-100.

Respond with ONLY a JSON object (no markdown, no code fences):
{{
  "executive_summary": "2-3 sentences on overall search performance",
  "insights": [
    {{
      "type": "opportunity | warning | trend | achievement",
      "priority": "high | medium | low",
      "title": "Short headline",
      "message": "1-3 sentences explaining the finding",
      "affected_keywords": ["keyword phrases from the report"],
      "action_items": ["concrete next steps"],
      "confidence": 0.0,
      "category": "one of: {categories}"
    }}
  ]
}}"#
    ))
}

#[derive(Debug, Deserialize)]
struct RawResponse {
    #[serde(default)]
    executive_summary: String,
    #[serde(default)]
    insights: Vec<RawInsight>,
}

#[derive(Debug, Deserialize)]
struct RawInsight {
    #[serde(default, alias = "type")]
    insight_type: Option<String>,
    #[serde(default)]
    priority: Option<String>,
    #[serde(default)]
    title: String,
    #[serde(default, alias = "description")]
    message: String,
    #[serde(default)]
    affected_keywords: Vec<String>,
    #[serde(default)]
    action_items: Vec<String>,
    #[serde(default)]
    confidence: Option<f64>,
    #[serde(default)]
    category: Option<String>,
}

/// Parse the model's JSON reply into typed insights.
pub fn parse_response(text: &str, model: &str) -> Result<GeneratedInsights> {
    let json_str = strip_code_fences(text);
    let raw: RawResponse = serde_json::from_str(json_str)
        .map_err(|e| Error::Llm(format!("Failed to parse LLM response: {e}\nResponse: {text}")))?;

    if raw.executive_summary.trim().is_empty() {
        return Err(Error::Llm(format!(
            "LLM response has no executive summary\nResponse: {text}"
        )));
    }

    let insights = raw
        .insights
        .into_iter()
        .filter(|i| !i.title.trim().is_empty() || !i.message.trim().is_empty())
        .map(|i| GeneratedInsight {
            insight_type: i
                .insight_type
                .map(|t| t.trim().to_lowercase())
                .filter(|t| !t.is_empty())
                .unwrap_or_else(|| "observation".to_string()),
            priority: InsightPriority::normalize(i.priority.as_deref().unwrap_or("")),
            title: i.title.trim().to_string(),
            message: i.message.trim().to_string(),
            affected_keywords: i.affected_keywords,
            action_items: i.action_items,
            confidence: normalize_confidence(i.confidence),
            category: normalize_category(i.category.as_deref()),
        })
        .collect();

    Ok(GeneratedInsights {
        executive_summary: raw.executive_summary.trim().to_string(),
        insights,
        model: model.to_string(),
        prompt_version: PROMPT_VERSION.to_string(),
    })
}

fn normalize_confidence(value: Option<f64>) -> f64 {
    match value {
        Some(v) if v.is_finite() => v.clamp(0.0, 1.0),
        _ => DEFAULT_CONFIDENCE,
    }
}

fn normalize_category(value: Option<&str>) -> String {
    let lower = value.unwrap_or("").trim().to_lowercase();
    if CATEGORIES.contains(&lower.as_str()) {
        lower
    } else {
        DEFAULT_CATEGORY.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::period::ReportPeriod;
    use crate::report::ReportCard;

    #[test]
    fn test_parse_response_normalizes_fields() {
        let text = r#"```json
{
  "executive_summary": "  Visibility is solid. ",
  "insights": [
    {
      "type": "Opportunity",
      "priority": "URGENT",
      "title": "Close the gap on rust crates",
      "message": "Rival sits two places ahead.",
      "affected_keywords": ["rust crates"],
      "action_items": ["Refresh the guide"],
      "confidence": 1.7,
      "category": "Competitive"
    },
    {
      "title": "Watch sqlite wal",
      "description": "Slipping slowly.",
      "category": "mystery"
    },
    { "title": "", "message": "" }
  ]
}
```"#;

        let parsed = parse_response(text, "bedrock/claude-sonnet-4-5").unwrap();

        assert_eq!(parsed.executive_summary, "Visibility is solid.");
        assert_eq!(parsed.prompt_version, PROMPT_VERSION);
        assert_eq!(parsed.insights.len(), 2);

        let first = &parsed.insights[0];
        assert_eq!(first.insight_type, "opportunity");
        assert_eq!(first.priority, InsightPriority::High);
        assert_eq!(first.confidence, 1.0);
        assert_eq!(first.category, "competitive");

        let second = &parsed.insights[1];
        assert_eq!(second.insight_type, "observation");
        assert_eq!(second.priority, InsightPriority::Medium);
        assert_eq!(second.message, "Slipping slowly.");
        assert_eq!(second.confidence, DEFAULT_CONFIDENCE);
        assert_eq!(second.category, DEFAULT_CATEGORY);
    }

    #[test]
    fn test_parse_response_rejects_garbage() {
        assert!(matches!(
            parse_response("I think your SEO is great!", "m"),
            Err(Error::Llm(_))
        ));
        assert!(matches!(
            parse_response(r#"{"insights": []}"#, "m"),
            Err(Error::Llm(_))
        ));
    }

    #[test]
    fn test_classify_llm_error() {
        assert!(matches!(
            classify_llm_error("HTTP 429 Too Many Requests"),
            Error::AnalysisRateLimited(_)
        ));
        assert!(matches!(
            classify_llm_error("ThrottlingException: Rate exceeded"),
            Error::AnalysisRateLimited(_)
        ));
        assert!(matches!(
            classify_llm_error("no credentials found in environment"),
            Error::AnalysisUnavailable(_)
        ));
        assert!(matches!(
            classify_llm_error("model returned an empty message"),
            Error::Llm(_)
        ));
    }

    #[test]
    fn test_build_prompt_mentions_type_and_focus() {
        let request = InsightRequest {
            report_card: ReportCard::empty(ReportPeriod::Last30Days),
            analysis_type: AnalysisType::QuickWins,
            focus_areas: vec!["pricing pages".into(), "docs".into()],
        };
        let prompt = build_prompt(&request).unwrap();
        assert!(prompt.contains("quick_wins analysis"));
        assert!(prompt.contains("pricing pages, docs"));
        assert!(prompt.contains("\"overall_score\": 0"));
    }
}
