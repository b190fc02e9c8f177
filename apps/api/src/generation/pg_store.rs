//! Postgres-backed `GenerationStore`.
//!
//! Both create-or-reuse and transition are single statements, so the database
//! row lock gives the same atomicity the in-memory backend gets from its mutex.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::types::Json;
use sqlx::PgPool;
use tracing::{debug, info};
use uuid::Uuid;

use crate::generation::job::{GenerationJob, GenerationStatus, JobError, JobKey, Transition};
use crate::generation::store::{stale_error, GenerationStore, StoreError};
use crate::models::generation::GenerationJobRow;

#[derive(Clone)]
pub struct PgGenerationStore {
    pool: PgPool,
}

impl PgGenerationStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn find_by_generation_id(
        &self,
        generation_id: Uuid,
    ) -> Result<Option<GenerationJob>, StoreError> {
        let row = sqlx::query_as::<_, GenerationJobRow>(
            "SELECT * FROM generation_jobs WHERE generation_id = $1",
        )
        .bind(generation_id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(into_job).transpose()
    }

    /// Inserts a fresh `pending` attempt, or overwrites a terminal row. `None`
    /// when the row for the key is in flight.
    async fn upsert_attempt(&self, key: &JobKey) -> Result<Option<GenerationJob>, StoreError> {
        let fresh = GenerationJob::new_attempt(key, Utc::now());
        let inserted = sqlx::query_as::<_, GenerationJobRow>(
            r#"
            INSERT INTO generation_jobs
                (subject_id, job_kind, generation_id, status, result, error, created_at, updated_at)
            VALUES ($1, $2, $3, 'pending', NULL, NULL, $4, $4)
            ON CONFLICT (subject_id, job_kind) DO UPDATE
                SET generation_id = EXCLUDED.generation_id,
                    status        = 'pending',
                    result        = NULL,
                    error         = NULL,
                    created_at    = EXCLUDED.created_at,
                    updated_at    = EXCLUDED.updated_at
                WHERE generation_jobs.status IN ('completed', 'failed')
            RETURNING *
            "#,
        )
        .bind(&key.subject_id)
        .bind(key.job_kind.as_str())
        .bind(fresh.generation_id)
        .bind(fresh.created_at)
        .fetch_optional(&self.pool)
        .await?;
        inserted.map(into_job).transpose()
    }
}

/// Upserts tried before a racing writer is reported as a storage error.
const CREATE_ATTEMPTS: usize = 2;

/// The upsert lost to another writer. Either the key is in flight now, or the
/// conflicting row finished (or vanished) between the two statements.
#[derive(Debug)]
enum Conflict {
    InProgress(GenerationJob),
    Retry,
}

fn after_conflict(current: Option<GenerationJob>) -> Conflict {
    match current {
        Some(existing) if !existing.status.is_terminal() => Conflict::InProgress(existing),
        _ => Conflict::Retry,
    }
}

fn into_job(row: GenerationJobRow) -> Result<GenerationJob, StoreError> {
    GenerationJob::try_from(row).map_err(StoreError::Backend)
}

fn status_names(statuses: &[GenerationStatus]) -> Vec<String> {
    statuses.iter().map(|s| s.as_str().to_string()).collect()
}

#[async_trait]
impl GenerationStore for PgGenerationStore {
    async fn get_status(&self, key: &JobKey) -> Result<Option<GenerationJob>, StoreError> {
        let row = sqlx::query_as::<_, GenerationJobRow>(
            "SELECT * FROM generation_jobs WHERE subject_id = $1 AND job_kind = $2",
        )
        .bind(&key.subject_id)
        .bind(key.job_kind.as_str())
        .fetch_optional(&self.pool)
        .await?;
        row.map(into_job).transpose()
    }

    async fn create_or_reuse(&self, key: &JobKey) -> Result<GenerationJob, StoreError> {
        for attempt in 1..=CREATE_ATTEMPTS {
            if let Some(job) = self.upsert_attempt(key).await? {
                return Ok(job);
            }
            match after_conflict(self.get_status(key).await?) {
                Conflict::InProgress(existing) => {
                    return Err(StoreError::AlreadyInProgress(Box::new(existing)));
                }
                Conflict::Retry => {
                    debug!("create_or_reuse for {key} raced with a concurrent writer (try {attempt})");
                }
            }
        }
        Err(StoreError::Backend(format!(
            "create_or_reuse for {key} kept racing with concurrent writers"
        )))
    }

    async fn transition(
        &self,
        generation_id: Uuid,
        transition: Transition,
    ) -> Result<GenerationJob, StoreError> {
        let to = transition.target();
        let (result, error): (Option<Value>, Option<Json<JobError>>) = match transition {
            Transition::Generating => (None, None),
            Transition::Completed(value) => (Some(value), None),
            Transition::Failed(error) => (None, Some(Json(error))),
        };

        let updated = sqlx::query_as::<_, GenerationJobRow>(
            r#"
            UPDATE generation_jobs
            SET status = $2, result = $3, error = $4, updated_at = now()
            WHERE generation_id = $1 AND status = ANY($5)
            RETURNING *
            "#,
        )
        .bind(generation_id)
        .bind(to)
        .bind(result)
        .bind(error)
        .bind(status_names(to.allowed_from()))
        .fetch_optional(&self.pool)
        .await?;

        if let Some(row) = updated {
            return into_job(row);
        }

        match self.find_by_generation_id(generation_id).await? {
            Some(current) => Err(StoreError::InvalidTransition {
                generation_id,
                from: current.status,
                to,
            }),
            None => Err(StoreError::StaleGenerationId(generation_id)),
        }
    }

    async fn fail_stale(&self, older_than: DateTime<Utc>) -> Result<Vec<GenerationJob>, StoreError> {
        let candidates = sqlx::query_as::<_, GenerationJobRow>(
            r#"
            SELECT * FROM generation_jobs
            WHERE status IN ('pending', 'generating') AND updated_at < $1
            "#,
        )
        .bind(older_than)
        .fetch_all(&self.pool)
        .await?;

        let now = Utc::now();
        let mut failed = Vec::with_capacity(candidates.len());
        for row in candidates {
            let job = into_job(row)?;
            let error = stale_error(&job, now);
            // Re-check the heartbeat so a job that progressed since the SELECT is left alone.
            let row = sqlx::query_as::<_, GenerationJobRow>(
                r#"
                UPDATE generation_jobs
                SET status = 'failed', result = NULL, error = $2, updated_at = now()
                WHERE generation_id = $1
                  AND status IN ('pending', 'generating')
                  AND updated_at < $3
                RETURNING *
                "#,
            )
            .bind(job.generation_id)
            .bind(Json(error))
            .bind(older_than)
            .fetch_optional(&self.pool)
            .await?;
            if let Some(row) = row {
                failed.push(into_job(row)?);
            }
        }

        if !failed.is_empty() {
            info!("Marked {} stale generation jobs as failed", failed.len());
        }
        Ok(failed)
    }

    fn backend(&self) -> &'static str {
        "postgres"
    }
}
