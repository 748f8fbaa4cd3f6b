mod dispatcher;
mod docker;
mod executor;
mod languages;
mod scratch;

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::watch;
use tracing::{error, info, warn};

use rce_common::config::WorkerConfig;

use crate::dispatcher::Dispatcher;
use crate::docker::SandboxRuntime;
use crate::executor::Executor;
use crate::languages::LanguageRegistry;
use crate::scratch::ScratchManager;

const SERVICE_NAME: &str = "rce-worker";

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .with_thread_ids(true)
        .with_line_number(true)
        .init();

    let config = WorkerConfig::from_env();
    info!(
        service = SERVICE_NAME,
        version = env!("CARGO_PKG_VERSION"),
        "execution worker booting"
    );

    let registry = match &config.languages_file {
        Some(path) => LanguageRegistry::from_file(path)
            .with_context(|| format!("failed to load language config from {}", path.display()))?,
        None => LanguageRegistry::builtin(),
    };
    info!(languages = ?registry.supported(), "supported languages");

    let runtime = SandboxRuntime::connect(config.sandbox_runtime_socket.as_deref())?;
    runtime.verify().await?;

    let scratch = ScratchManager::new(&config.scratch_host_path);
    scratch.ensure_root().with_context(|| {
        format!(
            "failed to create scratch root {}",
            config.scratch_host_path.display()
        )
    })?;

    info!(url = %config.queue_url, "connecting to work queue");
    let queue_client =
        redis::Client::open(config.queue_url.as_str()).context("invalid QUEUE_URL")?;
    let queue_conn = redis::aio::ConnectionManager::new(queue_client)
        .await
        .context("failed to connect to work queue")?;

    info!(url = %config.record_store_url, "connecting to record store");
    let store_client =
        redis::Client::open(config.record_store_url.as_str()).context("invalid RECORD_STORE_URL")?;
    let store_conn = redis::aio::ConnectionManager::new(store_client)
        .await
        .context("failed to connect to record store")?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let executor = Arc::new(Executor::new(
        runtime,
        scratch,
        registry,
        config.scratch_volume_name.clone(),
    ));
    let dispatcher = Dispatcher::new(queue_conn, store_conn, executor, shutdown_rx);

    let mut dispatcher_task = tokio::spawn(dispatcher.run());

    tokio::select! {
        result = &mut dispatcher_task => {
            result.context("dispatcher task failed")??;
        }
        _ = shutdown_signal() => {
            warn!("termination signal received, finishing current job");
            let _ = shutdown_tx.send(true);
            match tokio::time::timeout(config.shutdown_grace, &mut dispatcher_task).await {
                Ok(result) => result.context("dispatcher task failed")??,
                Err(_) => {
                    // Beyond the grace window the container runtime's own
                    // lifecycle completes any pending removals.
                    warn!(
                        grace_ms = config.shutdown_grace.as_millis() as u64,
                        "grace window elapsed with work still in flight"
                    );
                    dispatcher_task.abort();
                }
            }
        }
    }

    info!("worker shutdown complete");
    Ok(())
}

/// Resolves on SIGINT or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    match signal(SignalKind::terminate()) {
        Ok(mut sigterm) => {
            tokio::select! {
                _ = ctrl_c => {}
                _ = sigterm.recv() => {}
            }
        }
        Err(e) => {
            error!(error = %e, "failed to install SIGTERM handler");
            let _ = ctrl_c.await;
        }
    }
}
