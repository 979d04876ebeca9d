mod collector;
mod config;
mod engine;
mod error;
mod handlers;
mod routes;
mod script;
mod staging;


use anyhow::Context;
use config::ServerConfig;
use engine::WorkerEngine;
use segment_common::layout;
use segment_common::types::Job;
use segment_common::worker::{WorkerDescriptor, WorkerInvocation};
use staging::StagingArea;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::signal;
use tracing::{error, info, warn};

pub struct AppState {
    pub staging: StagingArea,
    pub engine: WorkerEngine,
    pub descriptor: WorkerDescriptor,
    /// Absolute host path of the materialized task script
    pub script_path: PathBuf,
    pub uploads_dir: PathBuf,
}

impl AppState {
    /// `work_root` must be absolute; it becomes the source of the bind mounts.
    pub fn new(
        work_root: PathBuf,
        engine: WorkerEngine,
        descriptor: WorkerDescriptor,
        script_path: PathBuf,
    ) -> Self {
        Self {
            uploads_dir: layout::uploads_dir(&work_root),
            staging: StagingArea::new(work_root),
            engine,
            descriptor,
            script_path,
        }
    }

    pub fn invocation_for(&self, job: &Job) -> WorkerInvocation {
        WorkerInvocation {
            case_id: job.case_id(),
            host_input_root: job.input_root.clone(),
            host_output_root: job.output_root.clone(),
            host_script: self.script_path.clone(),
            descriptor: self.descriptor.clone(),
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing subscriber
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .with_line_number(true)
        .init();

    info!("Segmentation API booting...");

    let config = ServerConfig::from_env()?;

    let descriptor = WorkerDescriptor::load(&config.worker_config).map_err(|e| {
        error!("Failed to load worker configuration: {:#}", e);
        error!("Make sure {} exists", config.worker_config.display());
        e
    })?;

    info!(
        name = %descriptor.name,
        version = %descriptor.version,
        backend = %descriptor.backend,
        image = %descriptor.image,
        timeout_secs = descriptor.timeout_secs,
        "Worker configured"
    );

    std::fs::create_dir_all(&config.work_root)
        .with_context(|| format!("Failed to create work root {}", config.work_root.display()))?;
    let work_root = config
        .work_root
        .canonicalize()
        .with_context(|| format!("Failed to resolve work root {}", config.work_root.display()))?;

    // Startup-time state: without the script no request can be served.
    let script_path = script::materialize(&work_root.join(&descriptor.script_path), script::TASK_SCRIPT)?;

    let engine = WorkerEngine::for_backend(descriptor.backend)?;

    let state = Arc::new(AppState::new(work_root.clone(), engine, descriptor, script_path));
    let app = routes::app(state, &config.static_dir, config.max_upload_bytes);

    let listener = TcpListener::bind(&config.bind_addr)
        .await
        .with_context(|| format!("Failed to bind to {}", config.bind_addr))?;

    info!(
        addr = %config.bind_addr,
        work_root = %work_root.display(),
        static_dir = %config.static_dir.display(),
        "HTTP server listening"
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    info!("Segmentation API shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = signal::ctrl_c().await {
        error!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    warn!("Received shutdown signal, finishing in-flight requests...");
}
