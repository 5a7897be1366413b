//! Supervision of the external conversion worker
//!
//! The worker is a long-running child process that serves HTTP on a loopback
//! port. The supervisor spawns it, watches its output for the ready marker,
//! restarts it after a fixed delay when it exits and stops it on shutdown.
//!
//! States: `Starting -> Ready -> Crashed -> Starting ...`, and
//! `ShuttingDown -> Stopped` once shutdown is requested.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Serialize;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::WorkerConfig;
use crate::utils::{ConvertdError, Result};

pub mod proxy;

pub use proxy::{ProxiedDownload, ProxiedResponse, ProxyBody};

/// How long `shutdown` waits for the supervise loop beyond the worker's stop
/// grace period before aborting it
const SHUTDOWN_SLACK_SECS: u64 = 2;

/// Log target for lines the worker prints
const WORKER_LOG_TARGET: &str = "convertd::worker";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerState {
    Starting,
    Ready,
    Crashed,
    ShuttingDown,
    Stopped,
}

pub struct ProcessSupervisor {
    config: WorkerConfig,
    client: reqwest::Client,
    state_tx: Arc<watch::Sender<WorkerState>>,
    /// Bumped on every spawn so output of a dead child cannot mark its
    /// successor ready
    generation: Arc<AtomicU64>,
    restarts: AtomicU32,
    shutdown_tx: Mutex<Option<mpsc::Sender<()>>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl ProcessSupervisor {
    pub fn new(config: WorkerConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .build()
            .map_err(|e| ConvertdError::config(format!("failed to build HTTP client: {}", e)))?;
        let (state_tx, _) = watch::channel(WorkerState::Stopped);

        Ok(Self {
            config,
            client,
            state_tx: Arc::new(state_tx),
            generation: Arc::new(AtomicU64::new(0)),
            restarts: AtomicU32::new(0),
            shutdown_tx: Mutex::new(None),
            task: Mutex::new(None),
        })
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    pub fn state(&self) -> WorkerState {
        *self.state_tx.borrow()
    }

    pub fn is_ready(&self) -> bool {
        self.state() == WorkerState::Ready
    }

    /// Number of times the worker was restarted after exiting
    pub fn restarts(&self) -> u32 {
        self.restarts.load(Ordering::SeqCst)
    }

    pub fn subscribe(&self) -> watch::Receiver<WorkerState> {
        self.state_tx.subscribe()
    }

    /// Waits until the worker reaches `target`. Returns `false` on timeout.
    pub async fn wait_for_state(&self, target: WorkerState, timeout: Duration) -> bool {
        let mut rx = self.subscribe();
        matches!(
            tokio::time::timeout(timeout, rx.wait_for(|state| *state == target)).await,
            Ok(Ok(_))
        )
    }

    /// Fails with `WorkerUnavailable` unless the worker is ready
    pub fn ensure_ready(&self) -> Result<()> {
        match self.state() {
            WorkerState::Ready => Ok(()),
            WorkerState::Crashed => Err(ConvertdError::worker_unavailable(
                "conversion worker is restarting",
            )),
            WorkerState::Starting => Err(ConvertdError::worker_unavailable(
                "conversion worker is not ready",
            )),
            WorkerState::ShuttingDown | WorkerState::Stopped => Err(
                ConvertdError::worker_unavailable("conversion worker is stopped"),
            ),
        }
    }

    /// Spawns the supervise loop. Calling it twice is a no-op.
    pub fn start(self: &Arc<Self>) {
        let mut task = self.task.lock().unwrap_or_else(|e| e.into_inner());
        if task.is_some() {
            warn!("Worker supervisor already started");
            return;
        }

        self.state_tx.send_replace(WorkerState::Starting);
        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>(1);
        *self
            .shutdown_tx
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = Some(shutdown_tx);
        *task = Some(tokio::spawn(Arc::clone(self).supervise(shutdown_rx)));

        info!(
            program = %self.config.program,
            port = self.config.port,
            "Worker supervisor started"
        );
    }

    /// Stops the worker and the supervise loop. The worker is never respawned
    /// afterwards.
    pub async fn shutdown(&self) {
        let shutdown_tx = self
            .shutdown_tx
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        let handle = self.task.lock().unwrap_or_else(|e| e.into_inner()).take();

        if let (Some(shutdown_tx), Some(handle)) = (shutdown_tx, handle) {
            let _ = shutdown_tx.send(()).await;
            let abort = handle.abort_handle();
            let timeout =
                Duration::from_secs(self.config.stop_grace_secs.saturating_add(SHUTDOWN_SLACK_SECS));
            match tokio::time::timeout(timeout, handle).await {
                Ok(_) => info!("Worker supervisor stopped"),
                Err(_) => {
                    // Dropping the task drops the child, which kills it
                    warn!("Worker supervisor did not stop in time, aborting");
                    abort.abort();
                }
            }
        }

        self.state_tx.send_replace(WorkerState::Stopped);
    }

    async fn supervise(self: Arc<Self>, mut shutdown_rx: mpsc::Receiver<()>) {
        let respawn_delay = Duration::from_secs(self.config.respawn_delay_secs);

        loop {
            // Bump first so a late marker from the previous child is ignored
            let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
            self.state_tx.send_replace(WorkerState::Starting);

            let exit_code = match self.spawn_worker(generation) {
                Ok(mut child) => {
                    info!(
                        pid = ?child.id(),
                        program = %self.config.program,
                        "Worker process spawned"
                    );
                    tokio::select! {
                        status = child.wait() => match status {
                            Ok(status) => status.code(),
                            Err(e) => {
                                error!(error = %e, "Failed to wait for worker process");
                                None
                            }
                        },
                        _ = shutdown_rx.recv() => {
                            self.stop_child(&mut child).await;
                            return;
                        }
                    }
                }
                Err(e) => {
                    error!(
                        program = %self.config.program,
                        error = %e,
                        "Failed to spawn worker process"
                    );
                    None
                }
            };

            self.state_tx.send_replace(WorkerState::Crashed);
            let crash = ConvertdError::worker_crashed(exit_code);
            error!(exit_code = ?exit_code, error = %crash, "worker_crashed");

            let restarts = self.restarts.fetch_add(1, Ordering::SeqCst) + 1;
            if let Some(max) = self.config.max_restarts {
                if restarts > max {
                    error!(
                        max_restarts = max,
                        "Worker exceeded its restart limit, giving up"
                    );
                    self.state_tx.send_replace(WorkerState::Stopped);
                    return;
                }
            }

            info!(
                delay_secs = respawn_delay.as_secs(),
                attempt = restarts,
                "Restarting worker after delay"
            );
            tokio::select! {
                _ = tokio::time::sleep(respawn_delay) => {}
                _ = shutdown_rx.recv() => {
                    self.state_tx.send_replace(WorkerState::Stopped);
                    return;
                }
            }
        }
    }

    fn spawn_worker(&self, generation: u64) -> std::io::Result<Child> {
        let mut cmd = Command::new(&self.config.program);
        cmd.args(&self.config.args)
            .envs(&self.config.env)
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn()?;
        if let Some(stdout) = child.stdout.take() {
            self.watch_output(stdout, generation, false);
        }
        // Some servers announce readiness on stderr
        if let Some(stderr) = child.stderr.take() {
            self.watch_output(stderr, generation, true);
        }
        Ok(child)
    }

    fn watch_output<R>(&self, reader: R, generation: u64, is_stderr: bool)
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let state_tx = Arc::clone(&self.state_tx);
        let current_generation = Arc::clone(&self.generation);
        let marker = self.config.ready_marker.clone();

        tokio::spawn(async move {
            let mut lines = BufReader::new(reader).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if is_stderr {
                    warn!(target: WORKER_LOG_TARGET, "{}", line);
                } else {
                    info!(target: WORKER_LOG_TARGET, "{}", line);
                }

                if !line.contains(&marker) {
                    continue;
                }
                // Checked under the watch lock, so a marker from a dead child
                // cannot slip in after its successor published Starting
                let became_ready = state_tx.send_if_modified(|state| {
                    if *state == WorkerState::Starting
                        && current_generation.load(Ordering::SeqCst) == generation
                    {
                        *state = WorkerState::Ready;
                        true
                    } else {
                        false
                    }
                });
                if became_ready {
                    info!("Worker is ready");
                }
            }
            debug!(is_stderr = is_stderr, "Worker output closed");
        });
    }

    /// Asks the worker to exit with SIGTERM, killing it once the grace period
    /// runs out
    async fn stop_child(&self, child: &mut Child) {
        self.state_tx.send_replace(WorkerState::ShuttingDown);
        info!(pid = ?child.id(), "Stopping worker process");

        if terminate(child) {
            let grace = Duration::from_secs(self.config.stop_grace_secs);
            match tokio::time::timeout(grace, child.wait()).await {
                Ok(Ok(status)) => {
                    info!(exit_code = ?status.code(), "Worker process exited");
                    self.state_tx.send_replace(WorkerState::Stopped);
                    return;
                }
                Ok(Err(e)) => warn!(error = %e, "Failed to wait for worker process"),
                Err(_) => warn!(
                    grace_secs = self.config.stop_grace_secs,
                    "Worker ignored SIGTERM, killing it"
                ),
            }
        }

        if let Err(e) = child.kill().await {
            warn!(error = %e, "Failed to kill worker process");
        }
        self.state_tx.send_replace(WorkerState::Stopped);
    }

    fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.config.request_timeout_secs)
    }
}

/// Sends SIGTERM to the child. Returns `false` when no signal could be sent and
/// the caller should kill it outright.
#[cfg(unix)]
fn terminate(child: &Child) -> bool {
    let Some(pid) = child.id().and_then(|pid| libc::pid_t::try_from(pid).ok()) else {
        return false;
    };

    // SAFETY: pid belongs to a child we have not reaped yet
    let sent = unsafe { libc::kill(pid, libc::SIGTERM) } == 0;
    if !sent {
        warn!(
            pid = pid,
            error = %std::io::Error::last_os_error(),
            "Failed to send SIGTERM to worker"
        );
    }
    sent
}

#[cfg(not(unix))]
fn terminate(_child: &Child) -> bool {
    false
}
