pub mod health;

use axum::{
    routing::{get, post},
    Router,
};

use crate::generation::handlers;
use crate::state::AppState;

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health::health_handler))
        // Generation jobs
        .route(
            "/generate/:job_kind/:subject_id",
            post(handlers::handle_start),
        )
        .route(
            "/generate/:job_kind/:subject_id/status",
            get(handlers::handle_status),
        )
        .route(
            "/generate/:job_kind/:subject_id/result",
            get(handlers::handle_result),
        )
        .with_state(state)
}
