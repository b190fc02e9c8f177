// Prompt constants for the recommendation and profile generators.

/// Role for school recommendations. Wrapped by `llm_client::prompts::system_prompt`.
pub const RECOMMENDATIONS_ROLE: &str =
    "You are an experienced college admissions counselor. \
    From a student's questionnaire answers you recommend colleges that fit them \
    academically, socially and financially, split into reach, match and safety schools.";

/// Recommendation prompt template. Replace `{context}` before sending.
pub const RECOMMENDATIONS_PROMPT_TEMPLATE: &str = r#"Recommend 9 colleges for the student below: 3 Reach, 3 Match and 3 Safety.

{context}

Return a JSON object with this EXACT schema:
{
  "recommendations": [
    {
      "type": "Reach",
      "name": "College Name",
      "location": "City, State",
      "fit_score": 72,
      "fit": {
        "academic": "Great",
        "social_cultural": "Good",
        "financial": "Fair"
      },
      "overall_fit_rationale": ["why this school fits"],
      "distinctive_opportunities": [
        {"title": "Program or opportunity name", "url": "https://official.edu/page"}
      ],
      "potential_challenges": ["a realistic concern"],
      "why_school_essay_points": ["a talking point for a why-us essay"],
      "how_to_stand_out": ["a concrete tip"]
    }
  ]
}

Rules:
- "type" is one of "Reach", "Match", "Safety".
- Each fit level is one of "Great", "Good", "Fair", "Minimal".
- "fit_score" is an integer from 1 to 100.
- Only use official school URLs you are confident exist; otherwise omit the opportunity."#;

/// Role for the student profile summary.
pub const PROFILE_ROLE: &str =
    "You are an expert college counselor writing a comprehensive profile of a student \
    for the student themselves: their academic strengths, growth areas, interests, \
    values and how they may fit different kinds of colleges.";

/// Profile prompt template. Replace `{context}` before sending.
pub const PROFILE_PROMPT_TEMPLATE: &str = r#"Write a profile of the student below.

{context}

Return a JSON object with this EXACT schema:
{
  "student_profile": [
    {
      "section_id": "academic_strengths",
      "title": "Academic Strengths",
      "type": "paragraph",
      "content": "..."
    },
    {
      "section_id": "growth_areas",
      "title": "Growth Areas",
      "type": "list",
      "content": ["...", "..."]
    }
  ]
}

Rules:
- "type" is either "paragraph" (content is a string) or "list" (content is an array of strings).
- Use short snake_case section ids, unique within the profile.
- Cover at least: academic strengths, growth areas, interests, values, college fit."#;
