//! Read-only view of a student's questionnaire answers.
//!
//! The response CRUD service owns the `responses` table; generators only read
//! it and render it into the context block sent to the model.

use std::collections::HashMap;

use async_trait::async_trait;
use sqlx::PgPool;

use crate::models::generation::ResponseRow;

#[async_trait]
pub trait ResponseSource: Send + Sync {
    async fn responses_for(&self, subject_id: &str) -> Result<Vec<ResponseRow>, sqlx::Error>;
}

pub struct PgResponseSource {
    pool: PgPool,
}

impl PgResponseSource {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ResponseSource for PgResponseSource {
    async fn responses_for(&self, subject_id: &str) -> Result<Vec<ResponseRow>, sqlx::Error> {
        sqlx::query_as::<_, ResponseRow>(
            r#"
            SELECT form_id, question_text, answer
            FROM responses
            WHERE user_id = $1
            ORDER BY created_at, form_id
            "#,
        )
        .bind(subject_id)
        .fetch_all(&self.pool)
        .await
    }
}

/// Fixed answers per subject. Used without a database and in tests.
#[derive(Default)]
pub struct StaticResponseSource {
    by_subject: HashMap<String, Vec<ResponseRow>>,
}

impl StaticResponseSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, subject_id: &str, rows: Vec<ResponseRow>) -> Self {
        self.by_subject.insert(subject_id.to_string(), rows);
        self
    }
}

#[async_trait]
impl ResponseSource for StaticResponseSource {
    async fn responses_for(&self, subject_id: &str) -> Result<Vec<ResponseRow>, sqlx::Error> {
        Ok(self.by_subject.get(subject_id).cloned().unwrap_or_default())
    }
}

/// Renders answers grouped by form, in first-seen form order.
/// Returns `None` when there is no non-blank answer at all.
pub fn render_context(rows: &[ResponseRow]) -> Option<String> {
    let mut forms: Vec<(&str, Vec<&ResponseRow>)> = Vec::new();
    for row in rows {
        if row.question_text.trim().is_empty() || row.answer.trim().is_empty() {
            continue;
        }
        match forms.iter_mut().find(|(form, _)| *form == row.form_id) {
            Some((_, answers)) => answers.push(row),
            None => forms.push((row.form_id.as_str(), vec![row])),
        }
    }

    if forms.is_empty() {
        return None;
    }

    let mut context = String::from("Student Profile Information:\n");
    for (form_id, answers) in forms {
        context.push_str(&format!("\n{}:\n", form_title(form_id)));
        for answer in answers {
            context.push_str(&format!(
                "- {}: {}\n",
                answer.question_text.trim(),
                answer.answer.trim()
            ));
        }
    }
    Some(context)
}

/// `college_preferences` → `College Preferences`.
fn form_title(form_id: &str) -> String {
    form_id
        .split(['_', ' '])
        .filter(|w| !w.is_empty())
        .map(|w| {
            let mut c = w.chars();
            match c.next() {
                None => String::new(),
                Some(f) => f.to_uppercase().to_string() + c.as_str(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
pub(crate) fn answer(form_id: &str, question: &str, answer: &str) -> ResponseRow {
    ResponseRow {
        form_id: form_id.to_string(),
        question_text: question.to_string(),
        answer: answer.to_string(),
    }
}
