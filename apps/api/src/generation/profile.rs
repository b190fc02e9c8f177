//! Student profile generator.
//!
//! A student with no answers yet gets a completed placeholder profile that
//! points them back to the questionnaire, not a failure.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{info, warn};

use crate::generation::generator::{GenerateError, Generator};
use crate::generation::prompts::{PROFILE_PROMPT_TEMPLATE, PROFILE_ROLE};
use crate::generation::responses::{render_context, ResponseSource};
use crate::llm_client::prompts::system_prompt;
use crate::llm_client::{complete_json, CompletionRequest, CompletionService};

const MAX_TOKENS: u32 = 8192;
const TEMPERATURE: f32 = 0.7;
const PROMPT_VERSION: &str = "v1";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SectionKind {
    Paragraph,
    List,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SectionContent {
    Text(String),
    Items(Vec<String>),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProfileSection {
    pub section_id: String,
    pub title: String,
    #[serde(rename = "type")]
    pub kind: SectionKind,
    pub content: SectionContent,
}

impl ProfileSection {
    /// Non-empty content whose shape agrees with the declared kind.
    fn is_usable(&self) -> bool {
        match (self.kind, &self.content) {
            (SectionKind::Paragraph, SectionContent::Text(text)) => !text.trim().is_empty(),
            (SectionKind::List, SectionContent::Items(items)) => {
                items.iter().any(|i| !i.trim().is_empty())
            }
            _ => false,
        }
    }
}

#[derive(Debug, Deserialize)]
struct RawProfile {
    #[serde(default)]
    student_profile: Vec<ProfileSection>,
}

fn placeholder_profile() -> Vec<ProfileSection> {
    vec![ProfileSection {
        section_id: "no_data".to_string(),
        title: "Complete Your Profile".to_string(),
        kind: SectionKind::Paragraph,
        content: SectionContent::Text(
            "No profile data available yet. Answer a few questionnaire sections and generate again."
                .to_string(),
        ),
    }]
}

/// Drops empty or mis-shaped sections and duplicate section ids (first wins).
fn clean_sections(sections: Vec<ProfileSection>) -> Vec<ProfileSection> {
    let mut seen = HashSet::new();
    sections
        .into_iter()
        .filter(|s| !s.section_id.trim().is_empty() && !s.title.trim().is_empty())
        .filter(ProfileSection::is_usable)
        .filter(|s| seen.insert(s.section_id.clone()))
        .collect()
}

pub struct ProfileGenerator {
    llm: Arc<dyn CompletionService>,
    responses: Arc<dyn ResponseSource>,
    model: String,
}

impl ProfileGenerator {
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

    fn document(&self, sections: Vec<ProfileSection>, context_source: &str) -> Value {
        json!({
            "student_profile": sections,
            "generation_metadata": {
                "model": self.model,
                "context_source": context_source,
                "prompt_version": PROMPT_VERSION,
                "generated_at": Utc::now().to_rfc3339(),
            },
        })
    }
}

#[async_trait]
impl Generator for ProfileGenerator {
    async fn generate(&self, subject_id: &str) -> Result<Value, GenerateError> {
        let rows = self.responses.responses_for(subject_id).await?;
        let Some(context) = render_context(&rows) else {
            info!("No responses for {subject_id}; returning placeholder profile");
            return Ok(self.document(placeholder_profile(), "none"));
        };

        let system = system_prompt(PROFILE_ROLE);
        let prompt = PROFILE_PROMPT_TEMPLATE.replace("{context}", &context);
        let raw: RawProfile = complete_json(
            self.llm.as_ref(),
            CompletionRequest {
                system: &system,
                prompt: &prompt,
                max_tokens: MAX_TOKENS,
                temperature: TEMPERATURE,
            },
        )
        .await?;

        let received = raw.student_profile.len();
        let sections = clean_sections(raw.student_profile);
        if sections.is_empty() {
            return Err(GenerateError::InvalidOutput(
                "model returned an empty profile".to_string(),
            ));
        }
        if sections.len() < received {
            warn!(
                "Dropped {} empty or duplicate profile sections for {subject_id}",
                received - sections.len()
            );
        }

        Ok(self.document(sections, "user_responses"))
    }
}
