//! Generation store: one record per (subject, kind), no business logic.
//!
//! Concurrency is optimistic: every write after creation is a compare-and-swap
//! on `generation_id` plus the allowed-from status set, so a superseded attempt
//! can never clobber a fresher one.
//!
//! The worker holds an `Arc<dyn GenerationStore>`: Postgres in production,
//! `InMemoryGenerationStore` for tests and database-less runs.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::generation::job::{GenerationJob, GenerationStatus, JobError, JobKey, Transition};

#[derive(Debug, Error)]
pub enum StoreError {
    /// A non-terminal attempt already exists for the key. Carries that attempt.
    #[error("generation {} already in progress ({})", .0.generation_id, .0.status)]
    AlreadyInProgress(Box<GenerationJob>),

    #[error("generation {0} has been superseded")]
    StaleGenerationId(Uuid),

    #[error("generation {generation_id}: illegal transition {from} -> {to}")]
    InvalidTransition {
        generation_id: Uuid,
        from: GenerationStatus,
        to: GenerationStatus,
    },

    #[error("storage error: {0}")]
    Backend(String),
}

impl From<sqlx::Error> for StoreError {
    fn from(e: sqlx::Error) -> Self {
        StoreError::Backend(e.to_string())
    }
}

#[async_trait]
pub trait GenerationStore: Send + Sync {
    /// Current persisted record, if any. Never waits on generation.
    async fn get_status(&self, key: &JobKey) -> Result<Option<GenerationJob>, StoreError>;

    /// Creates a `pending` attempt, overwriting a terminal record for the key.
    /// Fails with `AlreadyInProgress` while the existing record is non-terminal.
    async fn create_or_reuse(&self, key: &JobKey) -> Result<GenerationJob, StoreError>;

    /// Moves the attempt `generation_id` forward. Rejected moves leave the record untouched.
    async fn transition(
        &self,
        generation_id: Uuid,
        transition: Transition,
    ) -> Result<GenerationJob, StoreError>;

    /// Fails every non-terminal record whose heartbeat predates `older_than`.
    async fn fail_stale(&self, older_than: DateTime<Utc>) -> Result<Vec<GenerationJob>, StoreError>;

    /// Short backend label for health output.
    fn backend(&self) -> &'static str;
}

/// Message stored on jobs failed by the sweeper.
pub fn stale_error(job: &GenerationJob, now: DateTime<Utc>) -> JobError {
    let idle = (now - job.updated_at).num_seconds().max(0);
    JobError::timeout(format!(
        "generation stalled in {} with no progress for {idle}s",
        job.status
    ))
}

// ────────────────────────────────────────────────────────────────────────────
// In-memory backend
// ────────────────────────────────────────────────────────────────────────────

/// Map-backed store. A single mutex serialises every operation, which is what
/// makes create-or-reuse and the generation-id CAS atomic.
#[derive(Debug, Default)]
pub struct InMemoryGenerationStore {
    jobs: Mutex<HashMap<JobKey, GenerationJob>>,
}

impl InMemoryGenerationStore {
    pub fn new() -> Self {
        Self::default()
    }

    #[cfg(test)]
    pub(crate) async fn set_heartbeat(&self, key: &JobKey, updated_at: DateTime<Utc>) {
        if let Some(job) = self.jobs.lock().await.get_mut(key) {
            job.updated_at = updated_at;
        }
    }

    #[cfg(test)]
    pub(crate) async fn non_terminal_count(&self, key: &JobKey) -> usize {
        self.jobs
            .lock()
            .await
            .values()
            .filter(|j| &j.key() == key && !j.status.is_terminal())
            .count()
    }
}

#[async_trait]
impl GenerationStore for InMemoryGenerationStore {
    async fn get_status(&self, key: &JobKey) -> Result<Option<GenerationJob>, StoreError> {
        Ok(self.jobs.lock().await.get(key).cloned())
    }

    async fn create_or_reuse(&self, key: &JobKey) -> Result<GenerationJob, StoreError> {
        let mut jobs = self.jobs.lock().await;
        if let Some(existing) = jobs.get(key) {
            if !existing.status.is_terminal() {
                return Err(StoreError::AlreadyInProgress(Box::new(existing.clone())));
            }
        }
        let job = GenerationJob::new_attempt(key, Utc::now());
        jobs.insert(key.clone(), job.clone());
        Ok(job)
    }

    async fn transition(
        &self,
        generation_id: Uuid,
        transition: Transition,
    ) -> Result<GenerationJob, StoreError> {
        let mut jobs = self.jobs.lock().await;
        let job = jobs
            .values_mut()
            .find(|j| j.generation_id == generation_id)
            .ok_or(StoreError::StaleGenerationId(generation_id))?;

        let to = transition.target();
        if !job.status.can_transition_to(to) {
            return Err(StoreError::InvalidTransition {
                generation_id,
                from: job.status,
                to,
            });
        }
        job.apply(transition, Utc::now());
        Ok(job.clone())
    }

    async fn fail_stale(&self, older_than: DateTime<Utc>) -> Result<Vec<GenerationJob>, StoreError> {
        let now = Utc::now();
        let mut jobs = self.jobs.lock().await;
        let mut failed = Vec::new();
        for job in jobs.values_mut() {
            if !job.status.is_terminal() && job.updated_at < older_than {
                let error = stale_error(job, now);
                job.apply(Transition::Failed(error), now);
                failed.push(job.clone());
            }
        }
        Ok(failed)
    }

    fn backend(&self) -> &'static str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::generation::job::{JobErrorKind, JobKind};
    use chrono::Duration;
    use serde_json::json;

    fn key() -> JobKey {
        JobKey::new("student-42", JobKind::Recommendations)
    }

    #[tokio::test]
    async fn test_get_status_on_unknown_key_is_none() {
        let store = InMemoryGenerationStore::new();
        assert!(store.get_status(&key()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_create_starts_pending_without_payload() {
        let store = InMemoryGenerationStore::new();
        let job = store.create_or_reuse(&key()).await.unwrap();
        assert_eq!(job.status, GenerationStatus::Pending);
        assert!(job.payload_consistent());

        let stored = store.get_status(&key()).await.unwrap().unwrap();
        assert_eq!(stored.generation_id, job.generation_id);
    }

    #[tokio::test]
    async fn test_create_while_in_flight_returns_existing_attempt() {
        let store = InMemoryGenerationStore::new();
        let first = store.create_or_reuse(&key()).await.unwrap();

        match store.create_or_reuse(&key()).await {
            Err(StoreError::AlreadyInProgress(existing)) => {
                assert_eq!(existing.generation_id, first.generation_id)
            }
            other => panic!("expected AlreadyInProgress, got {other:?}"),
        }

        store
            .transition(first.generation_id, Transition::Generating)
            .await
            .unwrap();
        assert!(matches!(
            store.create_or_reuse(&key()).await,
            Err(StoreError::AlreadyInProgress(_))
        ));
        assert_eq!(store.non_terminal_count(&key()).await, 1);
    }

    #[tokio::test]
    async fn test_terminal_record_is_reused_with_new_generation_id() {
        let store = InMemoryGenerationStore::new();
        let first = store.create_or_reuse(&key()).await.unwrap();
        store
            .transition(first.generation_id, Transition::Failed(JobError::generic("boom")))
            .await
            .unwrap();

        let second = store.create_or_reuse(&key()).await.unwrap();
        assert_ne!(second.generation_id, first.generation_id);
        assert_eq!(second.status, GenerationStatus::Pending);
        assert!(second.error.is_none());
    }

    #[tokio::test]
    async fn test_stale_generation_id_write_is_rejected_and_ignored() {
        let store = InMemoryGenerationStore::new();
        let old = store.create_or_reuse(&key()).await.unwrap();
        store
            .transition(old.generation_id, Transition::Failed(JobError::timeout("late")))
            .await
            .unwrap();
        let fresh = store.create_or_reuse(&key()).await.unwrap();

        let late = store
            .transition(old.generation_id, Transition::Completed(json!({"recommendations": []})))
            .await;
        assert!(matches!(late, Err(StoreError::StaleGenerationId(id)) if id == old.generation_id));

        let stored = store.get_status(&key()).await.unwrap().unwrap();
        assert_eq!(stored, fresh);
    }

    #[tokio::test]
    async fn test_backward_transition_is_rejected_and_ignored() {
        let store = InMemoryGenerationStore::new();
        let job = store.create_or_reuse(&key()).await.unwrap();
        store
            .transition(job.generation_id, Transition::Generating)
            .await
            .unwrap();
        let completed = store
            .transition(job.generation_id, Transition::Completed(json!({"ok": true})))
            .await
            .unwrap();

        let again = store
            .transition(job.generation_id, Transition::Failed(JobError::generic("late")))
            .await;
        assert!(matches!(
            again,
            Err(StoreError::InvalidTransition {
                from: GenerationStatus::Completed,
                to: GenerationStatus::Failed,
                ..
            })
        ));
        assert_eq!(store.get_status(&key()).await.unwrap().unwrap(), completed);
    }

    #[tokio::test]
    async fn test_pending_cannot_skip_to_completed() {
        let store = InMemoryGenerationStore::new();
        let job = store.create_or_reuse(&key()).await.unwrap();
        let skipped = store
            .transition(job.generation_id, Transition::Completed(json!({})))
            .await;
        assert!(matches!(skipped, Err(StoreError::InvalidTransition { .. })));
    }

    #[tokio::test]
    async fn test_fail_stale_only_touches_old_non_terminal_records() {
        let store = InMemoryGenerationStore::new();
        let stuck = key();
        let fresh = JobKey::new("student-7", JobKind::Profile);
        let done = JobKey::new("student-9", JobKind::Profile);

        store.create_or_reuse(&stuck).await.unwrap();
        store.create_or_reuse(&fresh).await.unwrap();
        let finished = store.create_or_reuse(&done).await.unwrap();
        store
            .transition(finished.generation_id, Transition::Generating)
            .await
            .unwrap();
        store
            .transition(finished.generation_id, Transition::Completed(json!({"student_profile": []})))
            .await
            .unwrap();

        let long_ago = Utc::now() - Duration::minutes(10);
        store.set_heartbeat(&stuck, long_ago).await;
        store.set_heartbeat(&done, long_ago).await;

        let failed = store
            .fail_stale(Utc::now() - Duration::minutes(3))
            .await
            .unwrap();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].key(), stuck);
        let error = failed[0].error.as_ref().unwrap();
        assert_eq!(error.kind, JobErrorKind::Timeout);

        let fresh_job = store.get_status(&fresh).await.unwrap().unwrap();
        assert_eq!(fresh_job.status, GenerationStatus::Pending);
        let done_job = store.get_status(&done).await.unwrap().unwrap();
        assert_eq!(done_job.status, GenerationStatus::Completed);
    }
}
