//! Generator seam: the collaborator that does the actual content generation.
//!
//! The worker only sees `Arc<dyn Generator>` per job kind; it never knows
//! whether a payload came from the model, a placeholder or a test script.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

use crate::generation::job::JobKind;
use crate::llm_client::LlmError;

#[derive(Debug, Error)]
pub enum GenerateError {
    #[error("no questionnaire responses found for this student")]
    NoResponses,

    #[error("failed to load responses: {0}")]
    Responses(#[from] sqlx::Error),

    #[error("language model call failed: {0}")]
    Llm(#[from] LlmError),

    #[error("model output rejected: {0}")]
    InvalidOutput(String),
}

#[async_trait]
pub trait Generator: Send + Sync {
    /// Produces the result document for one subject.
    async fn generate(&self, subject_id: &str) -> Result<Value, GenerateError>;
}

/// One generator per job kind.
#[derive(Clone, Default)]
pub struct GeneratorRegistry {
    generators: HashMap<JobKind, Arc<dyn Generator>>,
}

impl GeneratorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(mut self, kind: JobKind, generator: Arc<dyn Generator>) -> Self {
        self.generators.insert(kind, generator);
        self
    }

    pub fn get(&self, kind: JobKind) -> Option<Arc<dyn Generator>> {
        self.generators.get(&kind).cloned()
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use super::*;

    /// Scripted generator behaviours for orchestration tests.
    pub enum Script {
        /// Sleeps, then returns the value.
        After(Duration, Value),
        /// Sleeps, then fails.
        FailAfter(Duration, String),
        /// Never returns.
        Hang,
        Panic,
    }

    pub struct ScriptedGenerator {
        script: Script,
        pub calls: AtomicUsize,
    }

    impl ScriptedGenerator {
        pub fn new(script: Script) -> Arc<Self> {
            Arc::new(Self {
                script,
                calls: AtomicUsize::new(0),
            })
        }

        pub fn call_count(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Generator for ScriptedGenerator {
        async fn generate(&self, _subject_id: &str) -> Result<Value, GenerateError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match &self.script {
                Script::After(delay, value) => {
                    tokio::time::sleep(*delay).await;
                    Ok(value.clone())
                }
                Script::FailAfter(delay, message) => {
                    tokio::time::sleep(*delay).await;
                    Err(GenerateError::InvalidOutput(message.clone()))
                }
                Script::Hang => std::future::pending().await,
                Script::Panic => panic!("scripted generator panic"),
            }
        }
    }
}
