use crate::generation::worker::GenerationWorker;

/// Shared application state injected into all route handlers via Axum extractors.
#[derive(Clone)]
pub struct AppState {
    /// Owns the job store and generator registry.
    pub worker: GenerationWorker,
}
