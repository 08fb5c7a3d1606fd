// Worker entry point: one process = one registered worker driving one
// browser session at a time.

use std::sync::Arc;

use anyhow::{Context, Result};
use ghosthands_core::dispatch::{ActiveJobs, DispatcherConfig, NotifyDispatcher, QueueDispatcher};
use ghosthands_core::kernel::WorkerKernel;
use ghosthands_core::registry::HandlerRegistry;
use ghosthands_core::testing::NoopBrowserFactory;
use ghosthands_core::worker::{router, AppState, RuntimeConfig, WorkerRegistry, WorkerRuntime};
use ghosthands_core::{Config, DispatcherMode};
use sqlx::postgres::PgPoolOptions;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,ghosthands_core=debug,sqlx=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting GhostHands worker");

    let config = Config::from_env().context("Failed to load configuration")?;
    tracing::info!(worker_id = %config.worker_id, "Configuration loaded");

    tracing::info!("Connecting to database...");
    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(&config.database_url)
        .await
        .context("Failed to connect to database")?;
    tracing::info!("Database connected");

    tracing::info!("Running database migrations...");
    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .context("Failed to run migrations")?;
    tracing::info!("Migrations complete");

    // Task handlers are linked in by the deployment build; the
    // orchestration core ships none of its own.
    let handlers = Arc::new(build_handler_registry());
    if handlers.registered_types().is_empty() {
        tracing::warn!("no task handlers registered; claimed jobs will fail validation");
    }

    // Browser sessions come from the automation layer; the no-op factory
    // keeps the orchestration shell runnable without it.
    let kernel = WorkerKernel::build(
        &config,
        pool.clone(),
        handlers,
        Arc::new(NoopBrowserFactory),
    )
    .await
    .context("Failed to build worker kernel")?;

    let active = Arc::new(ActiveJobs::new());
    let runtime = Arc::new(WorkerRuntime::new(
        kernel.store.clone(),
        WorkerRegistry::new(pool.clone()),
        active.clone(),
        kernel.rate_store.clone(),
        RuntimeConfig {
            worker_id: config.worker_id.clone(),
            stuck_job_threshold: std::time::Duration::from_secs(config.stuck_job_threshold_secs),
            drain_grace: std::time::Duration::from_secs(config.drain_grace_secs),
            lifecycle_hook_url: config.lifecycle_hook_url.clone(),
            deployment: None,
        },
    ));

    // A worker without a registry row must not accept jobs.
    runtime.register().await.context("worker registration failed")?;

    if let Err(e) = runtime.startup_recovery().await {
        tracing::warn!(error = %e, "startup recovery sweep failed");
    }
    let _scheduler = runtime
        .start_maintenance()
        .await
        .context("failed to start maintenance scheduler")?;
    let _heartbeat = runtime.spawn_heartbeat();

    let shutdown = runtime.shutdown_token();
    let force_abort = runtime.force_abort_token();

    match config.dispatcher {
        DispatcherMode::Notify => {
            let dispatcher = NotifyDispatcher::new(
                kernel.store.clone(),
                kernel.executor.clone(),
                DispatcherConfig::with_worker_id(config.worker_id.clone()),
                active.clone(),
            );
            let pool = pool.clone();
            let shutdown = shutdown.clone();
            let force_abort = force_abort.clone();
            tokio::spawn(async move {
                if let Err(e) = dispatcher.run(pool, shutdown, force_abort).await {
                    tracing::error!(error = %e, "dispatcher exited with error");
                }
            });
        }
        DispatcherMode::Queue => {
            let client = kernel
                .nats
                .clone()
                .context("queue dispatcher requires NATS_URL")?;
            let job_types: Vec<String> = kernel
                .handlers
                .registered_types()
                .into_iter()
                .map(str::to_string)
                .collect();
            let dispatcher = QueueDispatcher::new(
                kernel.store.clone(),
                kernel.executor.clone(),
                client,
                job_types,
                config.worker_id.clone(),
                1,
                active.clone(),
            );
            let shutdown = shutdown.clone();
            let force_abort = force_abort.clone();
            tokio::spawn(async move {
                if let Err(e) = dispatcher.run(shutdown, force_abort).await {
                    tracing::error!(error = %e, "queue consumer exited with error");
                }
            });
        }
    }

    // Worker HTTP surface.
    let app = router(AppState {
        runtime: runtime.clone(),
        ingress: kernel.ingress.clone(),
    });
    let addr = format!("0.0.0.0:{}", config.port);
    tracing::info!("Worker status endpoint on {addr}");
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .context("Failed to bind to address")?;
    let server_abort = force_abort.clone();
    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app)
            .with_graceful_shutdown(async move { server_abort.cancelled().await })
            .await
        {
            tracing::error!(error = %e, "status server error");
        }
    });

    runtime.run_until_shutdown().await
}

/// Deployment seam: register concrete task handlers here.
fn build_handler_registry() -> HandlerRegistry {
    HandlerRegistry::new()
}
