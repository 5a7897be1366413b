//! Gateway daemon for convertd
//!
//! Serves the HTTP API, keeps the sweeper and memory monitor running in the
//! background and supervises the conversion worker when one is configured.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use tokio::net::TcpListener;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::convert::build_converter;
use crate::session::{Clock, SessionRegistry, Sweeper, SystemClock};
use crate::store::{ArtifactStore, LocalArtifactStore};
use crate::supervisor::ProcessSupervisor;

pub mod category;
pub mod download;
pub mod http;

pub use category::{ConversionReceipt, ToolCategory};
pub use download::{Download, DownloadGateway, SessionStatus};
pub use http::{AppState, router};

/// Room for multipart boundaries and part headers above the upload limit
const MULTIPART_OVERHEAD_BYTES: u64 = 64 * 1024;

/// Timeout for each step of the shutdown sequence
const SHUTDOWN_STEP_TIMEOUT: Duration = Duration::from_secs(5);

const MEMORY_CHECK_INTERVAL_SECS: u64 = 60;

/// Builds one category per configured entry, each with its own registry.
pub fn build_state(
    config: &Config,
    store: Arc<dyn ArtifactStore>,
    clock: Arc<dyn Clock>,
    supervisor: Option<Arc<ProcessSupervisor>>,
) -> Result<AppState> {
    let mut categories = BTreeMap::new();

    for category_config in &config.categories {
        let converter = build_converter(&category_config.converter, supervisor.as_ref())
            .with_context(|| format!("Failed to build converter for '{}'", category_config.name))?;
        let registry = Arc::new(SessionRegistry::new(
            category_config.name.clone(),
            Duration::from_secs(category_config.ttl_secs),
            Arc::clone(&clock),
        ));

        debug!(
            category = %category_config.name,
            ttl_secs = category_config.ttl_secs,
            mode = ?category_config.mode,
            converter = %converter.name(),
            "Category registered"
        );

        categories.insert(
            category_config.name.clone(),
            Arc::new(ToolCategory::new(
                category_config.clone(),
                registry,
                converter,
                Arc::clone(&store),
            )),
        );
    }

    let max_body_bytes =
        usize::try_from(config.max_upload_bytes.saturating_add(MULTIPART_OVERHEAD_BYTES))
            .unwrap_or(usize::MAX);

    Ok(AppState {
        categories: Arc::new(categories),
        downloads: Arc::new(DownloadGateway::new(
            store,
            Duration::from_millis(config.download_cleanup_delay_ms),
        )),
        supervisor,
        max_body_bytes,
        started_at: Utc::now(),
    })
}

/// Registries of every category, for the sweeper
pub fn registries(state: &AppState) -> Vec<Arc<SessionRegistry>> {
    state
        .categories
        .values()
        .map(|category| Arc::clone(category.registry()))
        .collect()
}

/// Runs the gateway daemon until SIGTERM/SIGINT.
///
/// Startup:
/// 1. Prepares the artifact directories and removes leftovers of a previous run
/// 2. Starts the worker supervisor if a worker is configured
/// 3. Starts the expiry sweeper and the memory monitor
/// 4. Serves HTTP on `bind_addr`
///
/// Shutdown stops accepting requests, stops the background tasks and the
/// worker, then deletes the artifacts of every remaining session.
pub async fn run_gateway(config: &Config) -> Result<()> {
    info!(
        version = env!("CARGO_PKG_VERSION"),
        "Starting convertd gateway daemon"
    );

    let artifact_dir = config.artifact_dir();
    let store = Arc::new(LocalArtifactStore::new(artifact_dir.clone()));
    store
        .initialize()
        .await
        .context("Failed to initialize artifact store")?;
    store
        .remove_stale()
        .await
        .context("Failed to remove stale artifacts")?;
    info!(path = %artifact_dir.display(), "Artifact store ready");

    let supervisor = match &config.worker {
        Some(worker) => {
            let supervisor = Arc::new(
                ProcessSupervisor::new(worker.clone())
                    .context("Failed to create worker supervisor")?,
            );
            supervisor.start();
            Some(supervisor)
        }
        None => {
            debug!("No conversion worker configured");
            None
        }
    };

    let state = build_state(
        config,
        store.clone(),
        Arc::new(SystemClock),
        supervisor.clone(),
    )?;
    info!(categories = state.categories.len(), "Categories initialized");

    let sweeper = Sweeper::new(registries(&state), store);
    let (sweep_handle, sweep_shutdown) =
        sweeper.start_sweep_task(Duration::from_secs(config.sweep_interval_secs));
    info!(
        interval_secs = config.sweep_interval_secs,
        "Expiry sweeper started"
    );

    // Create shutdown channel for coordination
    let (shutdown_tx, mut shutdown_rx) = tokio::sync::mpsc::channel::<()>(1);
    tokio::spawn(wait_for_signal(shutdown_tx));

    let listener = TcpListener::bind(&config.bind_addr)
        .await
        .with_context(|| format!("Failed to bind {}", config.bind_addr))?;
    info!(addr = %config.bind_addr, "Gateway listening");

    let (server_shutdown_tx, server_shutdown_rx) = tokio::sync::oneshot::channel::<()>();
    let app = router(state);
    let mut server_handle = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async {
                let _ = server_shutdown_rx.await;
            })
            .await
    });

    let (memory_handle, memory_shutdown) = start_memory_monitor(config.memory_warning_mb);

    info!("Gateway daemon is running. Press Ctrl+C to stop.");

    let mut server_running = true;
    tokio::select! {
        _ = shutdown_rx.recv() => {
            info!("Shutdown signal received, starting graceful shutdown...");
        }
        result = &mut server_handle => {
            server_running = false;
            match result {
                Ok(Ok(())) => warn!("HTTP server stopped unexpectedly"),
                Ok(Err(e)) => error!("HTTP server failed: {}", e),
                Err(e) => error!("HTTP server task panicked: {}", e),
            }
        }
    }

    // Graceful shutdown sequence
    info!("Starting graceful shutdown sequence...");

    if server_running {
        let _ = server_shutdown_tx.send(());
        match tokio::time::timeout(SHUTDOWN_STEP_TIMEOUT, server_handle).await {
            Ok(Ok(Ok(()))) => info!("HTTP server stopped"),
            Ok(Ok(Err(e))) => error!("HTTP server failed during shutdown: {}", e),
            Ok(Err(e)) => error!("HTTP server task panicked: {}", e),
            Err(_) => error!("HTTP server did not stop within 5s timeout"),
        }
    }

    let _ = sweep_shutdown.send(()).await;
    match tokio::time::timeout(SHUTDOWN_STEP_TIMEOUT, sweep_handle).await {
        Ok(Ok(())) => info!("Sweeper task completed gracefully"),
        Ok(Err(e)) => error!("Sweeper task panicked: {}", e),
        Err(_) => error!("Sweeper task did not complete within 5s timeout"),
    }

    let _ = memory_shutdown.send(()).await;
    if tokio::time::timeout(SHUTDOWN_STEP_TIMEOUT, memory_handle)
        .await
        .is_err()
    {
        warn!("Memory monitor did not stop within 5s timeout");
    }

    if let Some(supervisor) = supervisor {
        info!("Stopping conversion worker...");
        supervisor.shutdown().await;
    }

    // Sessions do not survive a restart, so nothing on disk should either
    let purged = sweeper.purge_all().await;
    info!(
        sessions = purged.sessions_reclaimed,
        artifacts = purged.artifacts_deleted,
        "Purged remaining sessions"
    );

    info!("Gateway daemon stopped gracefully");
    Ok(())
}

async fn wait_for_signal(shutdown_tx: tokio::sync::mpsc::Sender<()>) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        let (mut sigterm, mut sigint) =
            match (signal(SignalKind::terminate()), signal(SignalKind::interrupt())) {
                (Ok(sigterm), Ok(sigint)) => (sigterm, sigint),
                (Err(e), _) | (_, Err(e)) => {
                    error!("Failed to set up signal handlers: {}", e);
                    return;
                }
            };

        tokio::select! {
            _ = sigterm.recv() => {
                info!("Received SIGTERM, initiating graceful shutdown...");
            }
            _ = sigint.recv() => {
                info!("Received SIGINT, initiating graceful shutdown...");
            }
        }
    }
    #[cfg(not(unix))]
    {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Received Ctrl+C, initiating graceful shutdown...");
            }
            Err(e) => {
                error!("Failed to listen for shutdown signal: {}", e);
                return;
            }
        }
    }
    let _ = shutdown_tx.send(()).await;
}

/// Logs the resident memory of this process every minute and warns above
/// `threshold_mb`.
fn start_memory_monitor(
    threshold_mb: u64,
) -> (tokio::task::JoinHandle<()>, tokio::sync::mpsc::Sender<()>) {
    let (shutdown_tx, mut shutdown_rx) = tokio::sync::mpsc::channel::<()>(1);

    let handle = tokio::spawn(async move {
        use sysinfo::{System, get_current_pid};

        let current_pid = match get_current_pid() {
            Ok(pid) => pid,
            Err(e) => {
                error!(
                    "Failed to get current PID for memory monitoring: {}. Memory monitoring disabled.",
                    e
                );
                return;
            }
        };
        let mut system = System::new_all();
        let mut interval = tokio::time::interval(Duration::from_secs(MEMORY_CHECK_INTERVAL_SECS));

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    system.refresh_all();
                    if let Some(process) = system.process(current_pid) {
                        let memory_mb = process.memory() / (1024 * 1024);
                        if memory_mb > threshold_mb {
                            warn!(memory_mb = memory_mb, threshold_mb = threshold_mb, "Memory usage exceeds threshold");
                        } else {
                            debug!(memory_mb = memory_mb, "Current memory usage");
                        }
                    }
                }
                _ = shutdown_rx.recv() => {
                    debug!("Memory monitoring task received shutdown signal");
                    break;
                }
            }
        }
    });

    (handle, shutdown_tx)
}
