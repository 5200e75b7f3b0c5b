//! bucketd — local control-plane daemon for remote object storage
//!
//! Construction order follows the dependency direction: store → hub →
//! manager → upload service → HTTP surface. Background tasks (worker pool,
//! retention sweeper, session sweeper) share one shutdown token.

use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use bucketd_api::AppState;
use bucketd_core::config::AppConfig;
use bucketd_core::events::EventHub;
use bucketd_core::db;
use bucketd_engine::Engine;
use bucketd_jobs::{retention, JobManager};
use bucketd_uploads::UploadService;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = AppConfig::from_env();
    config.ensure_layout()?;
    info!("Data root: {}", config.data_root.display());

    let pool = db::init_pool(&config.db_path).await?;
    let hub = Arc::new(EventHub::new(config.event_backlog, config.subscriber_buffer));
    let engine = Engine::new(
        &config.engine_binary,
        &config.engine_min_version,
        config.engine_tmp_root(),
    )?;

    // Surface engine problems at startup; requests re-check and classify.
    match engine.verify_version().await {
        Ok(version) => info!("Transfer engine: {} {}", config.engine_binary, version),
        Err(e) => warn!("Transfer engine check failed: {}", e),
    }

    let manager = JobManager::new(pool.clone(), hub.clone(), engine.clone(), config.clone());
    let uploads = UploadService::new(
        pool.clone(),
        hub.clone(),
        manager.clone(),
        engine.clone(),
        config.clone(),
    );

    let shutdown = CancellationToken::new();

    {
        let manager = manager.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move { manager.run(shutdown).await });
    }
    tokio::spawn(retention::run_sweeper(
        pool.clone(),
        hub.clone(),
        config.clone(),
        shutdown.clone(),
    ));
    tokio::spawn(uploads.clone().run_session_sweeper(shutdown.clone()));

    let state = Arc::new(AppState {
        pool,
        upload_gate: Arc::new(Semaphore::new(config.upload_max_concurrent_requests)),
        config: config.clone(),
        hub,
        manager,
        uploads,
        engine,
    });
    let router = bucketd_api::build_router(state);

    let listener = tokio::net::TcpListener::bind(&config.listen).await?;
    info!("Listening on http://{}", config.listen);

    let serve_shutdown = shutdown.clone();
    axum::serve(listener, router)
        .with_graceful_shutdown(async move {
            if tokio::signal::ctrl_c().await.is_err() {
                error!("Failed to listen for shutdown signal");
            }
            info!("Shutting down");
            serve_shutdown.cancel();
        })
        .await?;

    shutdown.cancel();
    Ok(())
}
