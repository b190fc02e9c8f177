//! Generation worker: drives `pending → generating → completed | failed`.
//!
//! Every attempt runs on its own tokio task. The generator itself runs in a
//! nested task bounded by the watchdog, so a hang, a panic or an error all
//! end in a `failed` transition and nothing escapes the attempt.
//!
//! The sweeper is the second half of the deadlock policy: it fails records
//! whose heartbeat went quiet because the process running them died.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::Value;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::generation::generator::GeneratorRegistry;
use crate::generation::job::{GenerationJob, JobError, JobKey, Transition};
use crate::generation::store::{GenerationStore, StoreError};

#[derive(Debug, Clone, Copy)]
pub struct WorkerSettings {
    /// Hard ceiling on one attempt's `generating` phase.
    pub watchdog: Duration,
    /// Extra slack before the sweeper treats a silent record as orphaned.
    pub grace: Duration,
    pub sweep_interval: Duration,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            watchdog: Duration::from_secs(180),
            grace: Duration::from_secs(30),
            sweep_interval: Duration::from_secs(30),
        }
    }
}

/// Result of a start request.
#[derive(Debug, Clone)]
pub struct StartOutcome {
    pub job: GenerationJob,
    /// An attempt was already in flight; nothing new was spawned.
    pub joined: bool,
}

#[derive(Clone)]
pub struct GenerationWorker {
    store: Arc<dyn GenerationStore>,
    generators: GeneratorRegistry,
    settings: WorkerSettings,
}

impl GenerationWorker {
    pub fn new(
        store: Arc<dyn GenerationStore>,
        generators: GeneratorRegistry,
        settings: WorkerSettings,
    ) -> Self {
        Self {
            store,
            generators,
            settings,
        }
    }

    pub fn store(&self) -> &Arc<dyn GenerationStore> {
        &self.store
    }

    /// Creates a new attempt and spawns it, or joins the one already in flight.
    /// Returns as soon as the record exists.
    pub async fn start(&self, key: &JobKey) -> Result<StartOutcome, StoreError> {
        match self.store.create_or_reuse(key).await {
            Ok(job) => {
                info!("Starting generation {} for {key}", job.generation_id);
                self.spawn_attempt(job.clone());
                Ok(StartOutcome { job, joined: false })
            }
            Err(StoreError::AlreadyInProgress(existing)) => {
                info!(
                    "Generation {} already {} for {key}; joining",
                    existing.generation_id, existing.status
                );
                Ok(StartOutcome {
                    job: *existing,
                    joined: true,
                })
            }
            Err(e) => Err(e),
        }
    }

    fn spawn_attempt(&self, job: GenerationJob) {
        let worker = self.clone();
        tokio::spawn(async move { worker.run_attempt(job).await });
    }

    async fn run_attempt(self, job: GenerationJob) {
        let key = job.key();
        let generation_id = job.generation_id;

        if let Err(e) = self
            .store
            .transition(generation_id, Transition::Generating)
            .await
        {
            log_rejected_write(&key, e);
            return;
        }

        let outcome = self.execute(&key).await;

        match self.store.transition(generation_id, outcome).await {
            Ok(job) => info!(
                "Generation {generation_id} for {key} finished: {}",
                job.status
            ),
            Err(e) => log_rejected_write(&key, e),
        }
    }

    /// Runs the generator under the watchdog and maps every outcome to a terminal transition.
    async fn execute(&self, key: &JobKey) -> Transition {
        let Some(generator) = self.generators.get(key.job_kind) else {
            error!("No generator registered for job kind {}", key.job_kind);
            return Transition::Failed(JobError::generic(format!(
                "no generator available for {}",
                key.job_kind
            )));
        };

        let subject_id = key.subject_id.clone();
        let mut task = tokio::spawn(async move { generator.generate(&subject_id).await });

        match tokio::time::timeout(self.settings.watchdog, &mut task).await {
            Ok(Ok(Ok(Value::Null))) => {
                warn!("Generator returned an empty document for {key}");
                Transition::Failed(JobError::generic("generation produced no result"))
            }
            Ok(Ok(Ok(result))) => Transition::Completed(result),
            Ok(Ok(Err(e))) => {
                warn!("Generation failed for {key}: {e}");
                Transition::Failed(JobError::generic(e.to_string()))
            }
            Ok(Err(join_error)) => {
                error!("Generation task for {key} aborted: {join_error}");
                Transition::Failed(JobError::generic(if join_error.is_panic() {
                    "generation task panicked"
                } else {
                    "generation task was cancelled"
                }))
            }
            Err(_) => {
                task.abort();
                let secs = self.settings.watchdog.as_secs();
                warn!("Generation for {key} hit the {secs}s watchdog");
                Transition::Failed(JobError::timeout(format!(
                    "generation exceeded the {secs}s time budget"
                )))
            }
        }
    }

    /// Fails every non-terminal record idle for longer than watchdog + grace.
    pub async fn sweep_once(&self) -> usize {
        let idle = self.settings.watchdog + self.settings.grace;
        let cutoff = Utc::now() - chrono::Duration::seconds(idle.as_secs() as i64);
        match self.store.fail_stale(cutoff).await {
            Ok(jobs) => {
                for job in &jobs {
                    warn!(
                        "Swept stalled generation {} for {}",
                        job.generation_id,
                        job.key()
                    );
                }
                jobs.len()
            }
            Err(e) => {
                error!("Stale generation sweep failed: {e}");
                0
            }
        }
    }

    /// Periodic sweep until `shutdown` is cancelled.
    pub fn spawn_sweeper(&self, shutdown: CancellationToken) -> JoinHandle<()> {
        let worker = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(worker.settings.sweep_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        worker.sweep_once().await;
                    }
                }
            }
            info!("Generation sweeper stopped");
        })
    }
}

fn log_rejected_write(key: &JobKey, error: StoreError) {
    match &error {
        StoreError::StaleGenerationId(id) => {
            warn!("Discarding write from superseded generation {id} for {key}")
        }
        StoreError::InvalidTransition { .. } => {
            warn!("Discarding out-of-order write for {key}: {error}")
        }
        _ => error!("Failed to record generation state for {key}: {error}"),
    }
}
