//! plfm-vt Image Controller
//!
//! Runs on each host and exposes the node's container image store over a
//! small HTTP API:
//!
//! - `POST /pull-image`: pull an image (background)
//! - `POST /prune-images`: remove old, unused images (background)
//!
//! Pruning can also run on a cron schedule.

use std::sync::Arc;

use anyhow::{Context, Result};
use plfm_image_controller::{
    api,
    config::Config,
    disk::StatvfsProbe,
    jobs::{JobQueue, JobWorker},
    lifecycle::LifecycleController,
    runtime::CrictlGateway,
    scheduler::PruneScheduler,
    state::AppState,
};
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = Config::from_env()?;

    // Initialize tracing (prefer RUST_LOG, fallback to GHOST_LOG_LEVEL)
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| config.log_level.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting plfm-vt image controller");
    info!(
        listen_addr = %config.listen_addr,
        allowed_network = %config.allowed_network,
        in_container = config.in_container,
        host_root = %config.host_root.display(),
        min_free_bytes = config.min_free_bytes,
        pull_timeout_secs = config.pull_timeout.as_secs(),
        "Configuration loaded"
    );

    for fallback in &config.fallbacks {
        warn!(
            key = %fallback.key,
            value = %fallback.value,
            default = %fallback.default,
            "Invalid configuration value, using default"
        );
    }

    if let Some(e) = &config.allowed_network_error {
        error!(error = %e, "Invalid allowed network, all requests will be denied");
    } else if config.allowed_network.network().is_none() {
        warn!("No allowed network configured, all requests will be denied");
    }

    // Create shutdown channel for graceful shutdown
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let gateway = Arc::new(CrictlGateway::new(
        config.host_root.clone(),
        config.in_container,
    ));
    let controller = Arc::new(LifecycleController::new(
        gateway,
        Arc::new(StatvfsProbe),
        config.lifecycle_settings(),
    ));

    // Start the job worker
    let (jobs, job_rx) = JobQueue::channel();
    let worker = JobWorker::new(job_rx, Arc::clone(&controller));
    let worker_handle = tokio::spawn({
        let shutdown_rx = shutdown_rx.clone();
        async move { worker.run(shutdown_rx).await }
    });

    // Start the prune scheduler, if configured
    let mut prune_schedule = None;
    let scheduler_handle = match &config.prune.cron_expression {
        None => {
            info!("No prune schedule configured, pruning on demand only");
            None
        }
        Some(expression) => match PruneScheduler::new(
            expression,
            config.prune.age_threshold_days,
            Arc::clone(&controller),
        ) {
            Ok(scheduler) => {
                prune_schedule = Some(expression.clone());
                Some(tokio::spawn({
                    let shutdown_rx = shutdown_rx.clone();
                    async move { scheduler.run(shutdown_rx).await }
                }))
            }
            Err(e) => {
                error!(error = %e, "Invalid prune schedule, pruning on demand only");
                None
            }
        },
    };

    // Build and run the server
    let state = AppState::new(config.allowed_network, jobs, prune_schedule);
    let app = api::create_router(state);

    let listener = tokio::net::TcpListener::bind(&config.listen_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.listen_addr))?;
    info!(addr = %config.listen_addr, "Listening for connections");

    let mut server_handle = tokio::spawn(api::serve(listener, app, shutdown_rx));

    // Wait for shutdown signal
    let server_exited = tokio::select! {
        _ = shutdown_signal() => {
            info!("Received shutdown signal");
            false
        }
        result = &mut server_handle => {
            log_server_exit(result);
            true
        }
    };

    // Signal shutdown to the server and all workers
    let _ = shutdown_tx.send(true);

    if !server_exited {
        info!("Draining HTTP connections...");
        log_server_exit(server_handle.await);
    }

    // In-flight pulls and prunes are allowed to finish
    info!("Waiting for background work to finish...");

    if let Err(e) = worker_handle.await {
        warn!(error = %e, "Job worker task panicked");
    }

    if let Some(handle) = scheduler_handle {
        if let Err(e) = handle.await {
            warn!(error = %e, "Prune scheduler task panicked");
        }
    }

    info!("Image controller shutdown complete");
    Ok(())
}

fn log_server_exit(result: Result<std::io::Result<()>, tokio::task::JoinError>) {
    match result {
        Ok(Ok(())) => info!("Server exited normally"),
        Ok(Err(e)) => error!(error = %e, "Server error"),
        Err(e) => error!(error = %e, "Server task panicked"),
    }
}

/// Resolve on Ctrl+C or SIGTERM.
async fn shutdown_signal() {
    let terminate = async {
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            if let Err(e) = result {
                error!(error = %e, "Failed to listen for Ctrl+C");
                std::future::pending::<()>().await;
            }
        }
        _ = terminate => {}
    }
}
