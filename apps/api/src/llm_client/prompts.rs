// Cross-cutting prompt fragments. Each generator keeps its own prompts in
// generation/prompts.rs and appends these.

/// System prompt suffix that enforces JSON-only output.
pub const JSON_ONLY_INSTRUCTION: &str = "\
    You MUST respond with a single valid JSON object only. \
    Do NOT include any text outside the JSON object. \
    Do NOT use markdown code fences. \
    Do NOT include explanations or apologies.";

/// Keeps the model inside what the student actually told us.
pub const GROUNDING_INSTRUCTION: &str = "\
    Base every statement on the student information provided. \
    Do NOT invent grades, test scores, awards or activities the student did not mention. \
    If something important is missing, say so plainly instead of guessing.";

/// Joins a role description with the shared instructions into one system prompt.
pub fn system_prompt(role: &str) -> String {
    format!("{role}\n\n{GROUNDING_INSTRUCTION}\n\n{JSON_ONLY_INSTRUCTION}")
}
