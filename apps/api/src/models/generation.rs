use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::types::Json;
use sqlx::FromRow;
use uuid::Uuid;

use crate::generation::job::{GenerationJob, GenerationStatus, JobError, JobKind};

#[derive(Debug, Clone, FromRow)]
pub struct GenerationJobRow {
    pub subject_id: String,
    pub job_kind: String,
    pub generation_id: Uuid,
    pub status: GenerationStatus,
    pub result: Option<Value>,
    pub error: Option<Json<JobError>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TryFrom<GenerationJobRow> for GenerationJob {
    type Error = String;

    fn try_from(row: GenerationJobRow) -> Result<Self, Self::Error> {
        let job_kind = JobKind::parse(&row.job_kind)
            .ok_or_else(|| format!("unknown job_kind '{}' in generation_jobs", row.job_kind))?;
        Ok(GenerationJob {
            subject_id: row.subject_id,
            job_kind,
            generation_id: row.generation_id,
            status: row.status,
            result: row.result,
            error: row.error.map(|e| e.0),
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

/// One answered questionnaire item.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct ResponseRow {
    pub form_id: String,
    pub question_text: String,
    pub answer: String,
}
