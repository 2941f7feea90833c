use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use bulkedit_api::config::{DatabaseConfig, EngineConfig, ServerConfig};
use bulkedit_api::engine::{HubProgressSink, JobDispatcher};
use bulkedit_api::router::build_app_router;
use bulkedit_api::state::AppState;
use bulkedit_api::{background, ws};
use bulkedit_pipeline::{
    HttpRecordUpdater, JobStore, MappingResolver, PgJobStore, ProgressSink, RateLimiter,
    UpdatePipeline,
};

/// Upper bound on waiting for background tasks after the server stops.
const TASK_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();

    // --- Tracing ---
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "bulkedit_api=debug,bulkedit_pipeline=debug,tower_http=debug".into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // --- Configuration ---
    let config = ServerConfig::from_env().expect("Invalid server configuration");
    let db_config = DatabaseConfig::from_env().expect("Invalid database configuration");
    let engine_config = EngineConfig::from_env().expect("Invalid engine configuration");
    tracing::info!(
        host = %config.host,
        port = config.port,
        rate_limit_per_minute = engine_config.rate_limit_per_minute,
        "Loaded configuration",
    );

    // --- Database ---
    let pool = bulkedit_db::create_pool(&db_config.url, db_config.max_connections)
        .await
        .expect("Failed to connect to database");
    tracing::info!(max_connections = db_config.max_connections, "Database connection pool created");

    bulkedit_db::health_check(&pool)
        .await
        .expect("Database health check failed");

    bulkedit_db::run_migrations(&pool)
        .await
        .expect("Failed to run database migrations");
    tracing::info!("Database migrations applied");

    // --- Progress hub ---
    let hub = ws::ProgressHub::start(config.ws_queue_capacity);

    // --- Update pipeline ---
    let store = Arc::new(PgJobStore::new(pool.clone()));
    let limiter = Arc::new(
        RateLimiter::new(engine_config.rate_limit_per_minute).expect("Invalid rate limit"),
    );
    let updater = HttpRecordUpdater::new(
        &engine_config.downstream_base_url,
        engine_config.downstream_token.clone(),
        engine_config.downstream_timeout,
    )
    .expect("Failed to build downstream client");
    let progress: Arc<dyn ProgressSink> = Arc::new(HubProgressSink::new(Arc::clone(&hub)));

    let pipeline = Arc::new(UpdatePipeline::new(
        store.clone(),
        store.clone(),
        Arc::new(MappingResolver),
        Arc::new(updater),
        limiter,
        Arc::clone(&progress),
        engine_config.pipeline.clone(),
    ));

    // --- Dispatcher ---
    let job_store: Arc<dyn JobStore> = store;
    let dispatcher = Arc::new(JobDispatcher::new(
        Arc::clone(&job_store),
        pipeline,
        progress,
        engine_config.poll_interval,
    ));

    dispatcher
        .resume_pending_jobs()
        .await
        .expect("Failed to re-queue interrupted jobs");

    let shutdown = CancellationToken::new();
    let dispatcher_handle = dispatcher.start(shutdown.clone());

    // --- Retention ---
    let retention_handle = tokio::spawn(background::job_retention::run(
        Arc::clone(&job_store),
        engine_config.retention_count,
        engine_config.retention_interval,
        shutdown.clone(),
    ));

    // --- App state ---
    let state = AppState {
        pool,
        config: Arc::new(config.clone()),
        hub: Arc::clone(&hub),
        dispatcher,
    };
    let app = build_app_router(state, &config);

    // --- Start server ---
    let addr = SocketAddr::new(
        config.host.parse().expect("Invalid HOST address"),
        config.port,
    );
    tracing::info!(%addr, "Starting server");

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .expect("Failed to bind to address");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(shutdown.clone(), Arc::clone(&hub)))
        .await
        .expect("Server error");

    // --- Post-shutdown cleanup ---
    tracing::info!("Server stopped accepting connections, cleaning up");

    if let Some(handle) = dispatcher_handle {
        if tokio::time::timeout(TASK_SHUTDOWN_TIMEOUT, handle).await.is_err() {
            tracing::warn!("Dispatcher did not stop in time; its job will resume on next start");
        }
    }
    let _ = tokio::time::timeout(TASK_SHUTDOWN_TIMEOUT, retention_handle).await;

    tracing::info!("Graceful shutdown complete");
}

/// Wait for SIGINT or SIGTERM, then stop background work and close every
/// WebSocket so the server can drain.
async fn shutdown_signal(shutdown: CancellationToken, hub: Arc<ws::ProgressHub>) {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl-C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("Received SIGINT (Ctrl-C), starting graceful shutdown");
        }
        () = terminate => {
            tracing::info!("Received SIGTERM, starting graceful shutdown");
        }
    }

    shutdown.cancel();
    hub.shutdown_all().await;
}
