//! Generation job record and the closed status/error vocabularies shared by
//! the store, the worker, the HTTP surface and the polling client.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Longest subject identifier accepted on the HTTP surface.
pub const MAX_SUBJECT_ID_LEN: usize = 128;

// ────────────────────────────────────────────────────────────────────────────
// Job kind
// ────────────────────────────────────────────────────────────────────────────

/// Independent generation workflows. Each kind gets its own record per subject.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    Recommendations,
    Profile,
}

impl JobKind {
    pub const ALL: [JobKind; 2] = [JobKind::Recommendations, JobKind::Profile];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobKind::Recommendations => "recommendations",
            JobKind::Profile => "profile",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "recommendations" => Some(JobKind::Recommendations),
            "profile" => Some(JobKind::Profile),
            _ => None,
        }
    }
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identity of a generation record: one per (subject, kind).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobKey {
    pub subject_id: String,
    pub job_kind: JobKind,
}

impl JobKey {
    pub fn new(subject_id: impl Into<String>, job_kind: JobKind) -> Self {
        Self {
            subject_id: subject_id.into(),
            job_kind,
        }
    }

    /// Checks the subject id is usable as a path segment and storage key.
    pub fn validate(&self) -> Result<(), String> {
        let id = self.subject_id.as_str();
        if id.trim().is_empty() {
            return Err("subject id cannot be empty".to_string());
        }
        if id.chars().count() > MAX_SUBJECT_ID_LEN {
            return Err(format!(
                "subject id exceeds {MAX_SUBJECT_ID_LEN} characters"
            ));
        }
        if id.contains('/') || id.chars().any(char::is_control) {
            return Err("subject id contains invalid characters".to_string());
        }
        Ok(())
    }
}

impl fmt::Display for JobKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.job_kind, self.subject_id)
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Status
// ────────────────────────────────────────────────────────────────────────────

/// Persisted status of one attempt. Moves forward only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(type_name = "text", rename_all = "snake_case")]
pub enum GenerationStatus {
    Pending,
    Generating,
    Completed,
    Failed,
}

impl GenerationStatus {
    pub fn is_terminal(&self) -> bool {
        match self {
            GenerationStatus::Pending | GenerationStatus::Generating => false,
            GenerationStatus::Completed | GenerationStatus::Failed => true,
        }
    }

    /// Statuses a record must currently be in for a move to `self` to be legal.
    pub fn allowed_from(&self) -> &'static [GenerationStatus] {
        match self {
            GenerationStatus::Pending => &[],
            GenerationStatus::Generating => &[GenerationStatus::Pending],
            GenerationStatus::Completed => &[GenerationStatus::Generating],
            GenerationStatus::Failed => &[GenerationStatus::Pending, GenerationStatus::Generating],
        }
    }

    pub fn can_transition_to(&self, next: GenerationStatus) -> bool {
        next.allowed_from().contains(self)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            GenerationStatus::Pending => "pending",
            GenerationStatus::Generating => "generating",
            GenerationStatus::Completed => "completed",
            GenerationStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for GenerationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Status as seen on the wire. `NotFound` is never stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WireStatus {
    NotFound,
    Pending,
    Generating,
    Completed,
    Failed,
}

impl From<GenerationStatus> for WireStatus {
    fn from(status: GenerationStatus) -> Self {
        match status {
            GenerationStatus::Pending => WireStatus::Pending,
            GenerationStatus::Generating => WireStatus::Generating,
            GenerationStatus::Completed => WireStatus::Completed,
            GenerationStatus::Failed => WireStatus::Failed,
        }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Failure description
// ────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobErrorKind {
    /// Watchdog or sweeper forced the job to fail.
    Timeout,
    /// The generation collaborator raised an error.
    Generic,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobError {
    pub kind: JobErrorKind,
    pub message: String,
}

impl JobError {
    pub fn timeout(message: impl Into<String>) -> Self {
        Self {
            kind: JobErrorKind::Timeout,
            message: message.into(),
        }
    }

    pub fn generic(message: impl Into<String>) -> Self {
        Self {
            kind: JobErrorKind::Generic,
            message: message.into(),
        }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Record + transitions
// ────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationJob {
    pub subject_id: String,
    pub job_kind: JobKind,
    pub generation_id: Uuid,
    pub status: GenerationStatus,
    pub result: Option<Value>,
    pub error: Option<JobError>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl GenerationJob {
    /// A fresh attempt in `pending` with a newly minted generation id.
    pub fn new_attempt(key: &JobKey, now: DateTime<Utc>) -> Self {
        Self {
            subject_id: key.subject_id.clone(),
            job_kind: key.job_kind,
            generation_id: Uuid::new_v4(),
            status: GenerationStatus::Pending,
            result: None,
            error: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn key(&self) -> JobKey {
        JobKey::new(self.subject_id.clone(), self.job_kind)
    }

    /// `result` present iff completed, `error` present iff failed.
    pub fn payload_consistent(&self) -> bool {
        let result_ok = self.result.is_some() == (self.status == GenerationStatus::Completed);
        let error_ok = self.error.is_some() == (self.status == GenerationStatus::Failed);
        result_ok && error_ok
    }

    /// Applies a transition in place. Callers have already checked legality.
    pub fn apply(&mut self, transition: Transition, now: DateTime<Utc>) {
        self.status = transition.target();
        match transition {
            Transition::Generating => {
                self.result = None;
                self.error = None;
            }
            Transition::Completed(result) => {
                self.result = Some(result);
                self.error = None;
            }
            Transition::Failed(error) => {
                self.result = None;
                self.error = Some(error);
            }
        }
        self.updated_at = now;
    }
}

/// A forward move of one attempt, carrying its payload or error.
#[derive(Debug, Clone, PartialEq)]
pub enum Transition {
    Generating,
    Completed(Value),
    Failed(JobError),
}

impl Transition {
    pub fn target(&self) -> GenerationStatus {
        match self {
            Transition::Generating => GenerationStatus::Generating,
            Transition::Completed(_) => GenerationStatus::Completed,
            Transition::Failed(_) => GenerationStatus::Failed,
        }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Wire bodies shared by handlers and the HTTP client
// ────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartResponse {
    pub generation_id: Uuid,
    pub status: WireStatus,
    /// True when an in-flight attempt already existed and the caller joined it.
    pub joined: bool,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusResponse {
    pub status: WireStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub generation_id: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<JobError>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

impl StatusResponse {
    pub fn not_found() -> Self {
        Self {
            status: WireStatus::NotFound,
            generation_id: None,
            error: None,
            updated_at: None,
        }
    }
}

impl From<&GenerationJob> for StatusResponse {
    fn from(job: &GenerationJob) -> Self {
        Self {
            status: job.status.into(),
            generation_id: Some(job.generation_id),
            error: job.error.clone(),
            updated_at: Some(job.updated_at),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResultResponse {
    pub generation_id: Uuid,
    pub job_kind: JobKind,
    pub result: Value,
    pub updated_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_status_transitions_only_move_forward() {
        use GenerationStatus::*;
        assert!(Pending.can_transition_to(Generating));
        assert!(Pending.can_transition_to(Failed));
        assert!(Generating.can_transition_to(Completed));
        assert!(Generating.can_transition_to(Failed));

        assert!(!Pending.can_transition_to(Completed));
        assert!(!Generating.can_transition_to(Pending));
        assert!(!Generating.can_transition_to(Generating));
        for terminal in [Completed, Failed] {
            for next in [Pending, Generating, Completed, Failed] {
                assert!(!terminal.can_transition_to(next));
            }
        }
    }

    #[test]
    fn test_apply_keeps_payload_consistent() {
        let key = JobKey::new("student-1", JobKind::Profile);
        let now = Utc::now();
        let mut job = GenerationJob::new_attempt(&key, now);
        assert!(job.payload_consistent());

        job.apply(Transition::Generating, now);
        assert!(job.payload_consistent());

        let mut completed = job.clone();
        completed.apply(Transition::Completed(json!({"student_profile": []})), now);
        assert_eq!(completed.status, GenerationStatus::Completed);
        assert!(completed.payload_consistent());

        job.apply(Transition::Failed(JobError::timeout("too slow")), now);
        assert_eq!(job.status, GenerationStatus::Failed);
        assert!(job.result.is_none());
        assert!(job.payload_consistent());
    }

    #[test]
    fn test_wire_status_round_trips_as_snake_case() {
        let json = serde_json::to_string(&WireStatus::NotFound).unwrap();
        assert_eq!(json, "\"not_found\"");
        let unknown: Result<WireStatus, _> = serde_json::from_str("\"queued\"");
        assert!(unknown.is_err(), "unknown status strings must be rejected");
    }

    #[test]
    fn test_job_error_serializes_kind_tag() {
        let value = serde_json::to_value(JobError::timeout("watchdog")).unwrap();
        assert_eq!(value["kind"], "timeout");
        assert_eq!(value["message"], "watchdog");
    }

    #[test]
    fn test_subject_id_validation() {
        assert!(JobKey::new("abc123", JobKind::Profile).validate().is_ok());
        assert!(JobKey::new("  ", JobKind::Profile).validate().is_err());
        assert!(JobKey::new("a/b", JobKind::Profile).validate().is_err());
        let long = "x".repeat(MAX_SUBJECT_ID_LEN + 1);
        assert!(JobKey::new(long, JobKind::Profile).validate().is_err());
    }

    #[test]
    fn test_subject_id_limit_counts_characters() {
        let cjk = "学".repeat(50);
        assert!(cjk.len() > MAX_SUBJECT_ID_LEN);
        assert!(JobKey::new(cjk, JobKind::Profile).validate().is_ok());

        let at_limit = "é".repeat(MAX_SUBJECT_ID_LEN);
        assert!(JobKey::new(at_limit, JobKind::Profile).validate().is_ok());
        let over = "é".repeat(MAX_SUBJECT_ID_LEN + 1);
        assert!(JobKey::new(over, JobKind::Profile).validate().is_err());
    }

    #[test]
    fn test_status_response_omits_absent_fields() {
        let value = serde_json::to_value(StatusResponse::not_found()).unwrap();
        assert_eq!(value, json!({"status": "not_found"}));
    }

    #[test]
    fn test_job_kind_parse() {
        for kind in JobKind::ALL {
            assert_eq!(JobKind::parse(kind.as_str()), Some(kind));
        }
        assert_eq!(JobKind::parse("essay"), None);
    }
}
