pub mod admission;
pub mod api;
pub mod config;
pub mod error;
pub mod format;
pub mod inspect;
pub mod lifecycle;
pub mod rate_limit;
pub mod registry;
pub mod stream;
pub mod sweeper;
pub mod worker;

use std::{net::SocketAddr, sync::Arc};

use tokio::net::TcpListener;
use tracing::info;

use crate::{
    api::{AppState, build_router},
    config::Config,
    error::ApiError,
    lifecycle::DownloadManager,
    sweeper::{purge_orphaned_jobs, spawn_sweeper},
    worker::YtDlpWorker,
};

pub async fn run(config: Config) -> Result<(), ApiError> {
    tokio::fs::create_dir_all(&config.temp_root)
        .await
        .map_err(|error| {
            ApiError::internal(format!(
                "Could not create temp directory {}: {error}",
                config.temp_root.display()
            ))
        })?;
    purge_orphaned_jobs(&config.temp_root).await;

    let worker = Arc::new(YtDlpWorker::new(
        config.worker_binary.clone(),
        config.worker_timeout,
    ));
    let manager = DownloadManager::new(&config, worker);
    let _sweeper = spawn_sweeper(manager.registry().clone(), config.sweep_interval);

    let state = AppState::new(&config, manager);
    let app = build_router(state, &config.allowed_origins)?;

    let listener = TcpListener::bind(&config.bind_addr).await.map_err(|error| {
        ApiError::internal(format!("Could not bind {}: {error}", config.bind_addr))
    })?;

    info!(
        addr = %config.bind_addr,
        ttl_seconds = config.token_ttl.as_secs(),
        max_jobs = config.max_prepare_concurrency,
        "downloader backend listening"
    );

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await
    .map_err(|error| ApiError::internal(format!("HTTP server error: {error}")))
}
