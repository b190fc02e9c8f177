use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use tokio_util::sync::CancellationToken;
use tower::ServiceBuilder;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use guidance_api::config::Config;
use guidance_api::db::{create_pool, run_migrations};
use guidance_api::generation::generator::GeneratorRegistry;
use guidance_api::generation::job::JobKind;
use guidance_api::generation::pg_store::PgGenerationStore;
use guidance_api::generation::profile::ProfileGenerator;
use guidance_api::generation::recommendations::RecommendationGenerator;
use guidance_api::generation::responses::{PgResponseSource, ResponseSource, StaticResponseSource};
use guidance_api::generation::store::{GenerationStore, InMemoryGenerationStore};
use guidance_api::generation::worker::GenerationWorker;
use guidance_api::llm_client::{CompletionService, LlmClient};
use guidance_api::routes::build_router;
use guidance_api::state::AppState;

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration first (fails on missing required env vars)
    let config = Config::from_env()?;

    // Initialize structured logging
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new(format!(
                "{}={}",
                env!("CARGO_CRATE_NAME"),
                &config.rust_log
            ))
        }))
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting Guidance API v{}", env!("CARGO_PKG_VERSION"));
    config.log_warnings();

    // Job store and questionnaire answers: Postgres when configured, in-memory otherwise
    let (store, responses): (Arc<dyn GenerationStore>, Arc<dyn ResponseSource>) =
        match &config.database_url {
            Some(url) => {
                let db = create_pool(url).await?;
                run_migrations(&db).await?;
                (
                    Arc::new(PgGenerationStore::new(db.clone())),
                    Arc::new(PgResponseSource::new(db)),
                )
            }
            None => {
                warn!("DATABASE_URL not set; jobs are kept in memory and no answers are available");
                (
                    Arc::new(InMemoryGenerationStore::new()),
                    Arc::new(StaticResponseSource::new()),
                )
            }
        };

    // Initialize LLM client
    let llm = LlmClient::new(config.anthropic_api_key.clone(), config.llm_model.clone())?;
    info!("LLM client initialized (model: {})", llm.model());
    let llm: Arc<dyn CompletionService> = Arc::new(llm);

    let generators = GeneratorRegistry::new()
        .register(
            JobKind::Recommendations,
            Arc::new(RecommendationGenerator::new(
                llm.clone(),
                responses.clone(),
                config.llm_model.clone(),
            )),
        )
        .register(
            JobKind::Profile,
            Arc::new(ProfileGenerator::new(llm, responses, config.llm_model.clone())),
        );

    let worker = GenerationWorker::new(store, generators, config.worker);
    info!(
        "Generation worker ready (store: {}, watchdog: {}s, grace: {}s)",
        worker.store().backend(),
        config.worker.watchdog.as_secs(),
        config.worker.grace.as_secs()
    );

    let shutdown = CancellationToken::new();
    let sweeper = worker.spawn_sweeper(shutdown.clone());

    // Build app state
    let state = AppState { worker };

    // Build router
    let app = build_router(state).layer(
        ServiceBuilder::new()
            .layer(TraceLayer::new_for_http())
            .layer(CorsLayer::permissive()), // TODO: restrict origins once the dashboard host is fixed
    );

    let addr: SocketAddr = format!("0.0.0.0:{}", config.port).parse()?;
    info!("Listening on {addr}");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    shutdown.cancel();
    sweeper.await?;
    info!("Shutdown complete");

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Failed to listen for shutdown signal: {e}");
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}
