//! School recommendation generator.
//!
//! Flow: load responses → render context → LLM (JSON) → validate into typed
//! `SchoolRecommendation`s → result document.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{info, warn};

use crate::generation::generator::{GenerateError, Generator};
use crate::generation::prompts::{RECOMMENDATIONS_PROMPT_TEMPLATE, RECOMMENDATIONS_ROLE};
use crate::generation::responses::{render_context, ResponseSource};
use crate::llm_client::prompts::system_prompt;
use crate::llm_client::{complete_json, CompletionRequest, CompletionService};

const MAX_TOKENS: u32 = 8192;
const TEMPERATURE: f32 = 0.7;
/// Used when the model omits or garbles `fit_score`.
const DEFAULT_FIT_SCORE: u8 = 50;

// ────────────────────────────────────────────────────────────────────────────
// Data models
// ────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SchoolTier {
    Reach,
    Match,
    Safety,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum FitLevel {
    Great,
    #[default]
    Good,
    Fair,
    Minimal,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SchoolFit {
    #[serde(default)]
    pub academic: FitLevel,
    #[serde(default)]
    pub social_cultural: FitLevel,
    #[serde(default)]
    pub financial: FitLevel,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Opportunity {
    pub title: String,
    pub url: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SchoolRecommendation {
    #[serde(rename = "type")]
    pub tier: SchoolTier,
    pub name: String,
    pub location: Option<String>,
    pub fit_score: u8,
    pub fit: SchoolFit,
    pub overall_fit_rationale: Vec<String>,
    pub distinctive_opportunities: Vec<Opportunity>,
    pub potential_challenges: Vec<String>,
    pub why_school_essay_points: Vec<String>,
    pub how_to_stand_out: Vec<String>,
}

/// Model output as received; normalised into `SchoolRecommendation`.
#[derive(Debug, Deserialize)]
struct RawRecommendation {
    #[serde(rename = "type")]
    tier: SchoolTier,
    name: String,
    #[serde(default)]
    location: Option<String>,
    #[serde(default)]
    fit_score: Option<Value>,
    #[serde(default)]
    fit: SchoolFit,
    #[serde(default)]
    overall_fit_rationale: Vec<String>,
    #[serde(default)]
    distinctive_opportunities: Vec<Opportunity>,
    #[serde(default)]
    potential_challenges: Vec<String>,
    #[serde(default)]
    why_school_essay_points: Vec<String>,
    #[serde(default)]
    how_to_stand_out: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct RawRecommendations {
    #[serde(default)]
    recommendations: Vec<RawRecommendation>,
}

impl From<RawRecommendation> for SchoolRecommendation {
    fn from(raw: RawRecommendation) -> Self {
        Self {
            tier: raw.tier,
            name: raw.name.trim().to_string(),
            location: raw.location.filter(|l| !l.trim().is_empty()),
            fit_score: normalize_fit_score(raw.fit_score.as_ref()),
            fit: raw.fit,
            overall_fit_rationale: raw.overall_fit_rationale,
            distinctive_opportunities: raw
                .distinctive_opportunities
                .into_iter()
                .filter(|o| o.url.starts_with("http://") || o.url.starts_with("https://"))
                .collect(),
            potential_challenges: raw.potential_challenges,
            why_school_essay_points: raw.why_school_essay_points,
            how_to_stand_out: raw.how_to_stand_out,
        }
    }
}

/// Accepts `72`, `72.4` or `"72"`; clamps to 1..=100; anything else → default.
fn normalize_fit_score(value: Option<&Value>) -> u8 {
    let score = match value {
        Some(Value::Number(n)) => n.as_f64(),
        Some(Value::String(s)) => s.trim().parse::<f64>().ok(),
        _ => None,
    };
    match score {
        Some(s) if s.is_finite() => s.round().clamp(1.0, 100.0) as u8,
        _ => DEFAULT_FIT_SCORE,
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Generator
// ────────────────────────────────────────────────────────────────────────────

pub struct RecommendationGenerator {
    llm: Arc<dyn CompletionService>,
    responses: Arc<dyn ResponseSource>,
    model: String,
}

impl RecommendationGenerator {
    pub fn new(
        llm: Arc<dyn CompletionService>,
        responses: Arc<dyn ResponseSource>,
        model: impl Into<String>,
    ) -> Self {
        Self {
            llm,
            responses,
            model: model.into(),
        }
    }
}

#[async_trait]
impl Generator for RecommendationGenerator {
    async fn generate(&self, subject_id: &str) -> Result<Value, GenerateError> {
        let rows = self.responses.responses_for(subject_id).await?;
        let context = render_context(&rows).ok_or(GenerateError::NoResponses)?;
        info!(
            "Generating recommendations for {subject_id} from {} answers",
            rows.len()
        );

        let system = system_prompt(RECOMMENDATIONS_ROLE);
        let prompt = RECOMMENDATIONS_PROMPT_TEMPLATE.replace("{context}", &context);
        let raw: RawRecommendations = complete_json(
            self.llm.as_ref(),
            CompletionRequest {
                system: &system,
                prompt: &prompt,
                max_tokens: MAX_TOKENS,
                temperature: TEMPERATURE,
            },
        )
        .await?;

        let received = raw.recommendations.len();
        let recommendations: Vec<SchoolRecommendation> = raw
            .recommendations
            .into_iter()
            .map(SchoolRecommendation::from)
            .filter(|r| !r.name.is_empty())
            .collect();

        if recommendations.is_empty() {
            return Err(GenerateError::InvalidOutput(
                "model returned no usable recommendations".to_string(),
            ));
        }
        if recommendations.len() < received {
            warn!(
                "Dropped {} unnamed recommendations for {subject_id}",
                received - recommendations.len()
            );
        }

        let count = |tier: SchoolTier| recommendations.iter().filter(|r| r.tier == tier).count();
        let metadata = json!({
            "model": self.model,
            "context_source": "user_responses",
            "generated_at": Utc::now().to_rfc3339(),
            "counts": {
                "reach": count(SchoolTier::Reach),
                "match": count(SchoolTier::Match),
                "safety": count(SchoolTier::Safety),
            },
        });

        Ok(json!({
            "recommendations": recommendations,
            "generation_metadata": metadata,
        }))
    }
}
