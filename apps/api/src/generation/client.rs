//! Generation client: start, resume and watch generations from the
//! requesting side.
//!
//! All UI state is derived from status responses (`GenerationView`); nothing
//! here remembers "is generating" on its own. A reload simply calls `load`
//! again and rediscovers any in-flight attempt.
//!
//! Poll loops are keyed by (subject, kind) in a registry so a key never has
//! two loops. A loop ends on a terminal status, when its poll budget runs out,
//! on `stop`/`stop_all`, or when the last client clone is dropped.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use reqwest::{Client, Url};
use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::watch;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::generation::job::{
    GenerationStatus, JobError, JobErrorKind, JobKey, ResultResponse, StartResponse,
    StatusResponse, WireStatus,
};
use crate::generation::store::StoreError;
use crate::generation::worker::GenerationWorker;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("server returned {status} {code}: {message}")]
    Api {
        status: u16,
        code: String,
        message: String,
    },

    #[error("invalid server address: {0}")]
    InvalidBaseUrl(String),

    #[error("malformed response: {0}")]
    Protocol(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// The three calls the client needs from the generation service.
#[async_trait]
pub trait GenerationApi: Send + Sync + 'static {
    async fn status(&self, key: &JobKey) -> Result<StatusResponse, ClientError>;
    async fn start(&self, key: &JobKey) -> Result<StartResponse, ClientError>;
    async fn result(&self, key: &JobKey) -> Result<ResultResponse, ClientError>;
}

// ────────────────────────────────────────────────────────────────────────────
// HTTP transport
// ────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct ErrorEnvelope {
    error: ErrorBody,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    code: String,
    message: String,
}

/// Talks to `/generate/{kind}/{subject}` on a running API server.
#[derive(Clone)]
pub struct HttpGenerationApi {
    client: Client,
    base_url: Url,
}

impl HttpGenerationApi {
    pub fn new(base_url: &str, request_timeout: Duration) -> Result<Self, ClientError> {
        let base_url =
            Url::parse(base_url).map_err(|e| ClientError::InvalidBaseUrl(e.to_string()))?;
        if base_url.cannot_be_a_base() {
            return Err(ClientError::InvalidBaseUrl(base_url.to_string()));
        }
        Ok(Self {
            client: Client::builder().timeout(request_timeout).build()?,
            base_url,
        })
    }

    /// Builds the endpoint URL; path segments are percent-encoded.
    fn endpoint(&self, key: &JobKey, tail: Option<&str>) -> Result<Url, ClientError> {
        let mut url = self.base_url.clone();
        {
            let mut segments = url
                .path_segments_mut()
                .map_err(|_| ClientError::InvalidBaseUrl(self.base_url.to_string()))?;
            segments
                .pop_if_empty()
                .extend(["generate", key.job_kind.as_str(), key.subject_id.as_str()]);
            if let Some(tail) = tail {
                segments.push(tail);
            }
        }
        Ok(url)
    }

    async fn decode<T: serde::de::DeserializeOwned>(
        response: reqwest::Response,
    ) -> Result<T, ClientError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response.json::<T>().await?);
        }
        let body = response.text().await.unwrap_or_default();
        Err(match serde_json::from_str::<ErrorEnvelope>(&body) {
            Ok(envelope) => ClientError::Api {
                status: status.as_u16(),
                code: envelope.error.code,
                message: envelope.error.message,
            },
            Err(_) => ClientError::Api {
                status: status.as_u16(),
                code: status
                    .canonical_reason()
                    .unwrap_or("UNKNOWN")
                    .to_string(),
                message: body,
            },
        })
    }
}

#[async_trait]
impl GenerationApi for HttpGenerationApi {
    async fn status(&self, key: &JobKey) -> Result<StatusResponse, ClientError> {
        let url = self.endpoint(key, Some("status"))?;
        Self::decode(self.client.get(url).send().await?).await
    }

    async fn start(&self, key: &JobKey) -> Result<StartResponse, ClientError> {
        let url = self.endpoint(key, None)?;
        Self::decode(self.client.post(url).send().await?).await
    }

    async fn result(&self, key: &JobKey) -> Result<ResultResponse, ClientError> {
        let url = self.endpoint(key, Some("result"))?;
        Self::decode(self.client.get(url).send().await?).await
    }
}

// ────────────────────────────────────────────────────────────────────────────
// In-process transport
// ────────────────────────────────────────────────────────────────────────────

/// Drives a worker in the same process; same contract as the HTTP surface.
#[derive(Clone)]
pub struct LocalGenerationApi {
    worker: GenerationWorker,
}

impl LocalGenerationApi {
    pub fn new(worker: GenerationWorker) -> Self {
        Self { worker }
    }
}

#[async_trait]
impl GenerationApi for LocalGenerationApi {
    async fn status(&self, key: &JobKey) -> Result<StatusResponse, ClientError> {
        Ok(match self.worker.store().get_status(key).await? {
            Some(job) => StatusResponse::from(&job),
            None => StatusResponse::not_found(),
        })
    }

    async fn start(&self, key: &JobKey) -> Result<StartResponse, ClientError> {
        let outcome = self.worker.start(key).await?;
        Ok(StartResponse {
            generation_id: outcome.job.generation_id,
            status: outcome.job.status.into(),
            joined: outcome.joined,
            updated_at: outcome.job.updated_at,
        })
    }

    async fn result(&self, key: &JobKey) -> Result<ResultResponse, ClientError> {
        let job = self.worker.store().get_status(key).await?;
        match job {
            Some(job) => match (job.status, job.result) {
                (GenerationStatus::Completed, Some(result)) => Ok(ResultResponse {
                    generation_id: job.generation_id,
                    job_kind: job.job_kind,
                    result,
                    updated_at: job.updated_at,
                }),
                (status, _) => Err(ClientError::Api {
                    status: 409,
                    code: "CONFLICT".to_string(),
                    message: format!("generation is {status}"),
                }),
            },
            None => Err(ClientError::Api {
                status: 404,
                code: "NOT_FOUND".to_string(),
                message: format!("no generation for {key}"),
            }),
        }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Derived view state
// ────────────────────────────────────────────────────────────────────────────

/// What the user should see, derived purely from the server's record.
#[derive(Debug, Clone, PartialEq)]
pub enum GenerationView {
    /// Nothing generated yet: offer "start".
    NotStarted,
    InFlight {
        generation_id: Uuid,
        status: GenerationStatus,
    },
    Completed {
        generation_id: Uuid,
        result: Value,
    },
    Failed {
        generation_id: Uuid,
        error: JobError,
    },
    /// The client stopped watching; the job itself may still finish.
    StillWorking { generation_id: Uuid },
}

impl GenerationView {
    /// No further polling will change this view.
    pub fn is_settled(&self) -> bool {
        match self {
            GenerationView::InFlight { .. } => false,
            GenerationView::NotStarted
            | GenerationView::Completed { .. }
            | GenerationView::Failed { .. }
            | GenerationView::StillWorking { .. } => true,
        }
    }

    /// Whether a start/regenerate affordance should be offered.
    pub fn can_start(&self) -> bool {
        match self {
            GenerationView::NotStarted
            | GenerationView::Completed { .. }
            | GenerationView::Failed { .. } => true,
            GenerationView::InFlight { .. } | GenerationView::StillWorking { .. } => false,
        }
    }

    pub fn generation_id(&self) -> Option<Uuid> {
        match self {
            GenerationView::NotStarted => None,
            GenerationView::InFlight { generation_id, .. }
            | GenerationView::Completed { generation_id, .. }
            | GenerationView::Failed { generation_id, .. }
            | GenerationView::StillWorking { generation_id } => Some(*generation_id),
        }
    }

    pub fn message(&self) -> &'static str {
        match self {
            GenerationView::NotStarted => "Nothing generated yet. Start when you're ready.",
            GenerationView::InFlight {
                status: GenerationStatus::Pending,
                ..
            } => "Queued. Generation will begin shortly.",
            GenerationView::InFlight { .. } => "Generating. This usually takes a minute or two.",
            GenerationView::Completed { .. } => "Ready.",
            GenerationView::Failed { error, .. } => match error.kind {
                JobErrorKind::Timeout => "This took too long and was stopped. Please try again.",
                JobErrorKind::Generic => {
                    "Something went wrong while generating. Please try again."
                }
            },
            GenerationView::StillWorking { .. } => {
                "Still working on it. This is taking longer than usual; refresh to check again."
            }
        }
    }
}

fn in_flight_status(status: WireStatus) -> GenerationStatus {
    match status {
        WireStatus::Generating => GenerationStatus::Generating,
        WireStatus::NotFound
        | WireStatus::Pending
        | WireStatus::Completed
        | WireStatus::Failed => GenerationStatus::Pending,
    }
}

/// One status check, fetching the result when the job has completed.
async fn observe<A: GenerationApi + ?Sized>(
    api: &A,
    key: &JobKey,
) -> Result<GenerationView, ClientError> {
    let status = api.status(key).await?;
    let generation_id = || {
        status
            .generation_id
            .ok_or_else(|| ClientError::Protocol(format!("{:?} status without generationId", status.status)))
    };

    Ok(match status.status {
        WireStatus::NotFound => GenerationView::NotStarted,
        WireStatus::Pending | WireStatus::Generating => GenerationView::InFlight {
            generation_id: generation_id()?,
            status: in_flight_status(status.status),
        },
        WireStatus::Completed => {
            let result = api.result(key).await?;
            GenerationView::Completed {
                generation_id: result.generation_id,
                result: result.result,
            }
        }
        WireStatus::Failed => GenerationView::Failed {
            generation_id: generation_id()?,
            error: status
                .error
                .clone()
                .unwrap_or_else(|| JobError::generic("generation failed")),
        },
    })
}

// ────────────────────────────────────────────────────────────────────────────
// Poll loops
// ────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy)]
pub struct PollSettings {
    pub interval: Duration,
    /// Client-side ceiling; advisory only, the job may still complete later.
    pub budget: Duration,
}

impl Default for PollSettings {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5),
            budget: Duration::from_secs(300),
        }
    }
}

struct PollEntry {
    id: u64,
    view: Arc<watch::Sender<GenerationView>>,
    cancel: CancellationToken,
}

impl PollEntry {
    fn handle(&self) -> PollHandle {
        PollHandle {
            view: self.view.subscribe(),
            cancel: self.cancel.clone(),
        }
    }

    fn finished(&self) -> bool {
        self.cancel.is_cancelled() || self.view.borrow().is_settled()
    }
}

#[derive(Default)]
struct Registry {
    loops: DashMap<JobKey, PollEntry>,
    next_id: AtomicU64,
}

impl Drop for Registry {
    fn drop(&mut self) {
        for entry in self.loops.iter() {
            entry.cancel.cancel();
        }
    }
}

/// Observer of one key's poll loop. Dropping it does not stop the loop.
pub struct PollHandle {
    view: watch::Receiver<GenerationView>,
    cancel: CancellationToken,
}

impl PollHandle {
    /// Latest published view.
    pub fn view(&self) -> GenerationView {
        self.view.borrow().clone()
    }

    /// Waits for the loop to settle. If the loop is stopped first, returns the
    /// last in-flight view.
    pub async fn outcome(&mut self) -> GenerationView {
        loop {
            {
                let view = self.view.borrow_and_update();
                if view.is_settled() {
                    return view.clone();
                }
            }
            if self.view.changed().await.is_err() {
                return self.view.borrow().clone();
            }
        }
    }

    /// Waits for the next published view; `None` once the loop has ended.
    pub async fn next_view(&mut self) -> Option<GenerationView> {
        self.view.changed().await.ok()?;
        Some(self.view.borrow_and_update().clone())
    }

    /// Stops the shared loop for this key.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }
}

/// Result of `load`: the current view, plus a handle when a loop was (re)joined.
pub struct Loaded {
    pub view: GenerationView,
    pub poll: Option<PollHandle>,
}

pub struct GenerationClient<A: GenerationApi> {
    api: Arc<A>,
    settings: PollSettings,
    registry: Arc<Registry>,
}

impl<A: GenerationApi> Clone for GenerationClient<A> {
    fn clone(&self) -> Self {
        Self {
            api: self.api.clone(),
            settings: self.settings,
            registry: self.registry.clone(),
        }
    }
}

impl<A: GenerationApi> GenerationClient<A> {
    pub fn new(api: A, settings: PollSettings) -> Self {
        Self {
            api: Arc::new(api),
            settings,
            registry: Arc::new(Registry::default()),
        }
    }

    /// Page-load entry point. Resumes watching when something is in flight.
    pub async fn load(&self, key: &JobKey) -> Result<Loaded, ClientError> {
        let view = observe(self.api.as_ref(), key).await?;
        let poll = match &view {
            GenerationView::InFlight { .. } => Some(self.ensure_loop(key, view.clone())),
            GenerationView::NotStarted
            | GenerationView::Completed { .. }
            | GenerationView::Failed { .. }
            | GenerationView::StillWorking { .. } => None,
        };
        Ok(Loaded { view, poll })
    }

    /// Starts a generation, or joins the one already running, and watches it.
    pub async fn start(&self, key: &JobKey) -> Result<PollHandle, ClientError> {
        let started = self.api.start(key).await?;
        if started.joined {
            info!("Joined in-flight generation {} for {key}", started.generation_id);
        }
        let initial = GenerationView::InFlight {
            generation_id: started.generation_id,
            status: in_flight_status(started.status),
        };
        Ok(self.ensure_loop(key, initial))
    }

    /// Handle to the running loop for `key`, if any.
    pub fn subscribe(&self, key: &JobKey) -> Option<PollHandle> {
        self.registry
            .loops
            .get(key)
            .filter(|entry| !entry.finished())
            .map(|entry| entry.handle())
    }

    /// Stops watching `key` (navigation away).
    pub fn stop(&self, key: &JobKey) {
        if let Some((_, entry)) = self.registry.loops.remove(key) {
            entry.cancel.cancel();
        }
    }

    pub fn stop_all(&self) {
        self.registry.loops.retain(|_, entry| {
            entry.cancel.cancel();
            false
        });
    }

    pub fn active_loops(&self) -> usize {
        self.registry
            .loops
            .iter()
            .filter(|entry| !entry.finished())
            .count()
    }

    fn ensure_loop(&self, key: &JobKey, initial: GenerationView) -> PollHandle {
        match self.registry.loops.entry(key.clone()) {
            Entry::Occupied(entry) if !entry.get().finished() => {
                let running = entry.get();
                let watching = running.view.borrow().generation_id();
                if initial.generation_id().is_some() && initial.generation_id() != watching {
                    // A newer attempt replaced the one this loop was following.
                    debug!("Poll loop for {key} switching to a new attempt");
                    running.view.send_replace(initial);
                } else {
                    debug!("Reusing poll loop for {key}");
                }
                running.handle()
            }
            Entry::Occupied(mut entry) => {
                let fresh = self.spawn_loop(key, initial);
                let handle = fresh.handle();
                entry.insert(fresh);
                handle
            }
            Entry::Vacant(slot) => {
                let fresh = self.spawn_loop(key, initial);
                let handle = fresh.handle();
                slot.insert(fresh);
                handle
            }
        }
    }

    fn spawn_loop(&self, key: &JobKey, initial: GenerationView) -> PollEntry {
        let id = self.registry.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, _) = watch::channel(initial);
        let entry = PollEntry {
            id,
            view: Arc::new(tx),
            cancel: CancellationToken::new(),
        };
        tokio::spawn(poll_loop(
            self.api.clone(),
            key.clone(),
            self.settings,
            entry.view.clone(),
            entry.cancel.clone(),
            Arc::downgrade(&self.registry),
            id,
        ));
        entry
    }
}

async fn poll_loop<A: GenerationApi>(
    api: Arc<A>,
    key: JobKey,
    settings: PollSettings,
    view: Arc<watch::Sender<GenerationView>>,
    cancel: CancellationToken,
    registry: Weak<Registry>,
    id: u64,
) {
    let deadline = tokio::time::sleep_until(Instant::now() + settings.budget);
    tokio::pin!(deadline);
    let mut ticker = tokio::time::interval(settings.interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut watching = view.borrow().generation_id();

    let settled = loop {
        // Each attempt gets the full budget, however late it joined the loop.
        let published = view.borrow().generation_id();
        if published.is_some() && published != watching {
            debug!("Poll loop for {key} now follows {published:?}; budget restarted");
            deadline.as_mut().reset(Instant::now() + settings.budget);
            watching = published;
        }

        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                debug!("Poll loop for {key} stopped");
                break None;
            }
            _ = ticker.tick() => match observe(api.as_ref(), &key).await {
                Ok(next) if next.is_settled() => break Some(next),
                Ok(next) => {
                    view.send_if_modified(|current| {
                        let modified = *current != next;
                        *current = next;
                        modified
                    });
                }
                Err(e) => warn!("Status check for {key} failed, will retry: {e}"),
            },
            _ = &mut deadline => {
                let last = view.borrow().clone();
                if last.generation_id().is_some() && last.generation_id() != watching {
                    continue;
                }
                warn!(
                    "Stopped polling {key} after {}s without a final status",
                    settings.budget.as_secs()
                );
                break last
                    .generation_id()
                    .map(|generation_id| GenerationView::StillWorking { generation_id });
            }
        }
    };

    if let Some(final_view) = settled {
        view.send_replace(final_view);
        cancel.cancel();
    }
    if let Some(registry) = registry.upgrade() {
        registry.loops.remove_if(&key, |_, entry| entry.id == id);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use super::*;
    use crate::generation::generator::testing::{Script, ScriptedGenerator};
    use crate::generation::generator::GeneratorRegistry;
    use crate::generation::job::JobKind;
    use crate::generation::store::InMemoryGenerationStore;
    use crate::generation::worker::WorkerSettings;
    use serde_json::json;

    const WATCHDOG: Duration = Duration::from_secs(180);

    fn key() -> JobKey {
        JobKey::new("student-5", JobKind::Profile)
    }

    fn worker(script: Script) -> (GenerationWorker, Arc<ScriptedGenerator>) {
        let generator = ScriptedGenerator::new(script);
        let worker = GenerationWorker::new(
            Arc::new(InMemoryGenerationStore::new()),
            GeneratorRegistry::new().register(JobKind::Profile, generator.clone()),
            WorkerSettings {
                watchdog: WATCHDOG,
                ..WorkerSettings::default()
            },
        );
        (worker, generator)
    }

    /// Counts status calls and fails the first `failures` of them.
    struct CountingApi {
        inner: LocalGenerationApi,
        status_calls: Arc<AtomicUsize>,
        failures: usize,
    }

    #[async_trait]
    impl GenerationApi for CountingApi {
        async fn status(&self, key: &JobKey) -> Result<StatusResponse, ClientError> {
            let n = self.status_calls.fetch_add(1, Ordering::SeqCst);
            if n < self.failures {
                return Err(ClientError::Protocol("connection reset".into()));
            }
            self.inner.status(key).await
        }

        async fn start(&self, key: &JobKey) -> Result<StartResponse, ClientError> {
            self.inner.start(key).await
        }

        async fn result(&self, key: &JobKey) -> Result<ResultResponse, ClientError> {
            self.inner.result(key).await
        }
    }

    fn counting_client(
        worker: GenerationWorker,
        failures: usize,
    ) -> (GenerationClient<CountingApi>, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        let api = CountingApi {
            inner: LocalGenerationApi::new(worker),
            status_calls: calls.clone(),
            failures,
        };
        (GenerationClient::new(api, PollSettings::default()), calls)
    }

    fn client(worker: GenerationWorker, settings: PollSettings) -> GenerationClient<LocalGenerationApi> {
        GenerationClient::new(LocalGenerationApi::new(worker), settings)
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_then_poll_observes_completion() {
        let payload = json!({"student_profile": [{"section_id": "a"}]});
        let (worker, _) = worker(Script::After(Duration::from_secs(40), payload.clone()));
        let client = client(worker, PollSettings::default());

        let mut handle = client.start(&key()).await.unwrap();
        assert!(matches!(handle.view(), GenerationView::InFlight { .. }));

        tokio::time::sleep(Duration::from_secs(6)).await;
        assert!(matches!(
            handle.view(),
            GenerationView::InFlight {
                status: GenerationStatus::Generating,
                ..
            }
        ));

        match handle.outcome().await {
            GenerationView::Completed { result, .. } => assert_eq!(result, payload),
            other => panic!("expected completion, got {other:?}"),
        }
        assert_eq!(client.active_loops(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_watchdog_failure_is_reported_as_timeout() {
        let (worker, _) = worker(Script::Hang);
        let client = client(worker, PollSettings::default());

        let outcome = client.start(&key()).await.unwrap().outcome().await;
        match &outcome {
            GenerationView::Failed { error, .. } => assert_eq!(error.kind, JobErrorKind::Timeout),
            other => panic!("expected timeout failure, got {other:?}"),
        }
        assert!(outcome.message().contains("too long"));
        assert!(outcome.can_start());
    }

    #[tokio::test(start_paused = true)]
    async fn test_generic_failure_is_not_retried() {
        let (worker, generator) =
            worker(Script::FailAfter(Duration::from_secs(3), "upstream outage".into()));
        let client = client(worker, PollSettings::default());

        let outcome = client.start(&key()).await.unwrap().outcome().await;
        match &outcome {
            GenerationView::Failed { error, .. } => assert_eq!(error.kind, JobErrorKind::Generic),
            other => panic!("expected failure, got {other:?}"),
        }
        assert!(outcome.message().contains("went wrong"));

        tokio::time::sleep(Duration::from_secs(600)).await;
        assert_eq!(generator.call_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_poll_budget_gives_up_without_failing_the_job() {
        let payload = json!({"student_profile": []});
        let (worker, _) = worker(Script::After(Duration::from_secs(150), payload.clone()));
        let client = client(
            worker,
            PollSettings {
                interval: Duration::from_secs(5),
                budget: Duration::from_secs(60),
            },
        );

        let mut handle = client.start(&key()).await.unwrap();
        let outcome = handle.outcome().await;
        assert!(matches!(outcome, GenerationView::StillWorking { .. }));
        assert!(outcome.message().contains("refresh"));
        assert!(!outcome.can_start());
        assert_eq!(client.active_loops(), 0);

        // Manual refresh later still sees the job finish.
        tokio::time::sleep(Duration::from_secs(100)).await;
        let loaded = client.load(&key()).await.unwrap();
        assert!(loaded.poll.is_none());
        assert_eq!(
            loaded.view,
            GenerationView::Completed {
                generation_id: outcome.generation_id().unwrap(),
                result: payload,
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_double_start_shares_one_loop_and_one_job() {
        let (worker, generator) =
            worker(Script::After(Duration::from_secs(20), json!({"student_profile": []})));
        let client = client(worker, PollSettings::default());

        let mut first = client.start(&key()).await.unwrap();
        let mut second = client.start(&key()).await.unwrap();
        assert_eq!(client.active_loops(), 1);
        assert_eq!(first.view().generation_id(), second.view().generation_id());

        let a = first.outcome().await;
        let b = second.outcome().await;
        assert_eq!(a, b);
        assert!(matches!(a, GenerationView::Completed { .. }));
        assert_eq!(generator.call_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_load_resumes_job_started_elsewhere() {
        let (worker, _) =
            worker(Script::After(Duration::from_secs(30), json!({"student_profile": []})));
        // Another tab started it.
        let started = worker.start(&key()).await.unwrap();

        let client = client(worker, PollSettings::default());
        let loaded = client.load(&key()).await.unwrap();
        assert!(matches!(loaded.view, GenerationView::InFlight { .. }));
        assert!(!loaded.view.can_start());

        let mut poll = loaded.poll.expect("in-flight job should be watched");
        let outcome = poll.outcome().await;
        assert_eq!(outcome.generation_id(), Some(started.job.generation_id));
        assert!(matches!(outcome, GenerationView::Completed { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_load_with_no_job_offers_start() {
        let (worker, _) = worker(Script::Hang);
        let client = client(worker, PollSettings::default());
        let loaded = client.load(&key()).await.unwrap();
        assert_eq!(loaded.view, GenerationView::NotStarted);
        assert!(loaded.poll.is_none());
        assert!(loaded.view.can_start());
        assert_eq!(client.active_loops(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_ends_polling() {
        let (worker, _) = worker(Script::Hang);
        let (client, calls) = counting_client(worker, 0);

        let mut handle = client.start(&key()).await.unwrap();
        tokio::time::sleep(Duration::from_secs(12)).await;
        client.stop(&key());

        let outcome = handle.outcome().await;
        assert!(matches!(outcome, GenerationView::InFlight { .. }));
        assert!(client.subscribe(&key()).is_none());

        let seen = calls.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(calls.load(Ordering::SeqCst), seen);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropping_client_stops_its_loops() {
        let (worker, _) = worker(Script::Hang);
        let (client, calls) = counting_client(worker, 0);

        let handle = client.start(&key()).await.unwrap();
        tokio::time::sleep(Duration::from_secs(11)).await;
        drop(client);
        tokio::task::yield_now().await;

        let seen = calls.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(calls.load(Ordering::SeqCst), seen);
        drop(handle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_status_errors_are_retried() {
        let (worker, _) =
            worker(Script::After(Duration::from_secs(8), json!({"student_profile": []})));
        let (client, calls) = counting_client(worker, 3);

        let outcome = client.start(&key()).await.unwrap().outcome().await;
        assert!(matches!(outcome, GenerationView::Completed { .. }));
        assert!(calls.load(Ordering::SeqCst) > 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_restart_before_next_tick_gets_full_poll_budget() {
        let payload = json!({"student_profile": []});
        let (worker, generator) = worker(Script::After(Duration::from_secs(172), payload.clone()));
        let client = client(worker, PollSettings::default());
        let begin = Instant::now();

        let mut first = client.start(&key()).await.unwrap();
        let original = first.view().generation_id();
        // The first attempt finishes at t=172s; the loop's next tick is t=175s.
        tokio::time::sleep(Duration::from_secs(173)).await;
        let mut second = client.start(&key()).await.unwrap();
        let restarted = second.view().generation_id();
        assert!(restarted.is_some());
        assert_ne!(restarted, original);
        assert_eq!(client.active_loops(), 1);

        let outcome = second.outcome().await;
        match &outcome {
            GenerationView::Completed { result, .. } => assert_eq!(result, &payload),
            other => panic!("expected completion, got {other:?}"),
        }
        assert_eq!(outcome.generation_id(), restarted);
        assert!(begin.elapsed() >= Duration::from_secs(345));
        assert_eq!(generator.call_count(), 2);

        // Handles are per key: the earlier one follows the key to the same end.
        assert_eq!(first.outcome().await, outcome);
    }

    #[tokio::test(start_paused = true)]
    async fn test_regenerate_after_completion_starts_fresh_loop() {
        let (worker, generator) =
            worker(Script::After(Duration::from_secs(5), json!({"student_profile": []})));
        let client = client(worker, PollSettings::default());

        let first = client.start(&key()).await.unwrap().outcome().await;
        let second = client.start(&key()).await.unwrap().outcome().await;
        assert!(matches!(second, GenerationView::Completed { .. }));
        assert_ne!(first.generation_id(), second.generation_id());
        assert_eq!(generator.call_count(), 2);
    }

    #[test]
    fn test_http_endpoint_encodes_subject() {
        let api = HttpGenerationApi::new("http://localhost:8080/", Duration::from_secs(5)).unwrap();
        let key = JobKey::new("user 7?x", JobKind::Recommendations);
        assert_eq!(
            api.endpoint(&key, Some("status")).unwrap().as_str(),
            "http://localhost:8080/generate/recommendations/user%207%3Fx/status"
        );
        assert_eq!(
            api.endpoint(&key, None).unwrap().as_str(),
            "http://localhost:8080/generate/recommendations/user%207%3Fx"
        );
    }

    #[test]
    fn test_http_api_rejects_unusable_base_url() {
        assert!(matches!(
            HttpGenerationApi::new("not a url", Duration::from_secs(5)),
            Err(ClientError::InvalidBaseUrl(_))
        ));
    }
}
