//! Daemon startup and main loops
//!
//! Wires configuration, the job runner, the processing queue, watch mode and
//! metrics together for the batch and watch entry points.

use crate::concurrency::{derive_plan, ConcurrencyPlan};
use crate::config::{Config, ConfigError};
use crate::encode::runner::{GstJobRunner, JobRunner};
use crate::jobs::current_timestamp_ms;
use crate::metrics::{collect_system_metrics, new_shared_metrics, SharedMetrics};
use crate::metrics_server::run_metrics_server;
use crate::progress::ProgressEvent;
use crate::queue::{ProcessingQueue, QueueError, QueueOptions, QueueSummary};
use crate::request::{EncodeSettings, UnsupportedRatio};
use crate::scan::scan_inputs;
use crate::startup::{run_startup_checks, StartupError};
use crate::watch::{run_watch_loop, InputWatcher, WatchError};
use serde::Serialize;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Interval of the metrics refresh task.
const METRICS_REFRESH: Duration = Duration::from_millis(500);

/// Error type for daemon operations
#[derive(Debug, Error)]
pub enum DaemonError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Configuration error: {0}")]
    Ratio(#[from] UnsupportedRatio),

    #[error("Startup check failed: {0}")]
    Startup(#[from] StartupError),

    #[error("Input directory {0} does not exist")]
    MissingInput(PathBuf),

    #[error("Watch error: {0}")]
    Watch(#[from] WatchError),
}

/// Terminal counts of a batch run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BatchSummary {
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
}

impl BatchSummary {
    pub fn is_success(&self) -> bool {
        self.failed == 0 && self.cancelled == 0
    }
}

impl From<QueueSummary> for BatchSummary {
    fn from(summary: QueueSummary) -> Self {
        Self {
            completed: summary.completed,
            failed: summary.failed,
            cancelled: summary.cancelled,
        }
    }
}

/// Daemon state containing all runtime components
pub struct Daemon {
    pub config: Config,
    pub concurrency_plan: ConcurrencyPlan,
    pub metrics: SharedMetrics,
    queue: ProcessingQueue,
    progress: Mutex<Option<broadcast::Receiver<ProgressEvent>>>,
    shutdown: CancellationToken,
}

impl Daemon {
    /// Run startup checks, then build the daemon.
    pub fn new(config: Config) -> Result<Self, DaemonError> {
        run_startup_checks(&config)?;
        Self::new_without_checks(config)
    }

    /// Build the daemon around the gst-launch runner without probing the
    /// system for GStreamer.
    pub fn new_without_checks(config: Config) -> Result<Self, DaemonError> {
        let runner = GstJobRunner::new(config.tools.clone());
        let progress = runner.subscribe();
        Self::with_runner(config, Arc::new(runner), Some(progress))
    }

    /// Build the daemon around any [`JobRunner`].
    pub fn with_runner(
        config: Config,
        runner: Arc<dyn JobRunner>,
        progress: Option<broadcast::Receiver<ProgressEvent>>,
    ) -> Result<Self, DaemonError> {
        config.validate()?;
        let settings = EncodeSettings::from_config(&config)?;
        let concurrency_plan = derive_plan(&config);

        let options = QueueOptions {
            max_concurrency: concurrency_plan.max_concurrent_jobs as usize,
            max_retries: config.queue.max_retries,
            retry_backoff: Duration::from_secs(config.queue.retry_backoff_secs),
            input_root: config.paths.input_dir.clone(),
            output_root: config.paths.output_dir.clone(),
            processed_dir: config.paths.processed_dir.clone(),
            failed_dir: config.paths.failed_dir.clone(),
            settings,
        };

        info!(
            backend = %config.encode.backend,
            cores = concurrency_plan.total_cores,
            max_jobs = concurrency_plan.max_concurrent_jobs,
            "daemon configured"
        );

        Ok(Self {
            queue: ProcessingQueue::new(options, runner),
            concurrency_plan,
            metrics: new_shared_metrics(),
            progress: Mutex::new(progress),
            shutdown: CancellationToken::new(),
            config,
        })
    }

    pub fn queue(&self) -> &ProcessingQueue {
        &self.queue
    }

    pub fn metrics(&self) -> SharedMetrics {
        self.metrics.clone()
    }

    /// Token that stops the current run; cancelling it cancels every job.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Cancel every pending and running job.
    pub fn cancel_all(&self) {
        self.queue.cancel_all();
    }

    /// Scan the input directory once, process everything found and return
    /// the terminal counts.
    pub async fn run_batch(&self) -> Result<BatchSummary, DaemonError> {
        let input_dir = self.input_dir()?;
        let background = self.start_background();

        let queue = self.queue.clone();
        let shutdown = self.shutdown.clone();
        let canceller = tokio::spawn(async move {
            shutdown.cancelled().await;
            queue.cancel_all();
        });

        self.enqueue_existing(&input_dir).await;
        self.queue.wait_for_completion().await;

        canceller.abort();
        self.refresh_metrics().await;
        stop(background);

        let summary = BatchSummary::from(self.queue.summary());
        info!(
            completed = summary.completed,
            failed = summary.failed,
            cancelled = summary.cancelled,
            "batch finished"
        );
        Ok(summary)
    }

    /// Process existing files, then follow the input directory until
    /// `shutdown` resolves or the shutdown token is cancelled.
    pub async fn run_watch<F>(&self, shutdown: F) -> Result<BatchSummary, DaemonError>
    where
        F: Future<Output = ()> + Send,
    {
        let input_dir = self.input_dir()?;
        let watcher = InputWatcher::start(&input_dir, self.skip_roots())?;
        let background = self.start_background();

        self.enqueue_existing(&input_dir).await;

        let watch_stop = self.shutdown.child_token();
        let watch_loop = tokio::spawn(run_watch_loop(
            watcher,
            self.queue.clone(),
            Duration::from_secs(self.config.watch.stability_secs),
            watch_stop.clone(),
        ));

        tokio::select! {
            _ = shutdown => info!("shutdown requested"),
            _ = self.shutdown.cancelled() => info!("shutdown requested"),
        }

        watch_stop.cancel();
        if let Err(e) = watch_loop.await {
            warn!(error = %e, "watch loop task failed");
        }
        self.queue.cancel_all();
        self.queue.shutdown().await;

        self.refresh_metrics().await;
        stop(background);
        Ok(BatchSummary::from(self.queue.summary()))
    }

    fn input_dir(&self) -> Result<PathBuf, DaemonError> {
        let dir = &self.config.paths.input_dir;
        std::fs::canonicalize(dir).map_err(|_| DaemonError::MissingInput(dir.clone()))
    }

    /// Output, processed and failed directories, in the same canonical form as
    /// the input root so nested ones are never picked up as sources.
    fn skip_roots(&self) -> Vec<PathBuf> {
        let paths = &self.config.paths;
        std::iter::once(&paths.output_dir)
            .chain(paths.processed_dir.as_ref())
            .chain(paths.failed_dir.as_ref())
            .map(|dir| resolve_dir(dir))
            .collect()
    }

    async fn enqueue_existing(&self, input_dir: &Path) {
        let candidates = scan_inputs(input_dir, &self.skip_roots());
        info!(count = candidates.len(), dir = %input_dir.display(), "scanned input directory");

        for candidate in candidates {
            if self.shutdown.is_cancelled() {
                break;
            }
            match self.queue.enqueue(&candidate.path).await {
                Ok(_) => {}
                Err(QueueError::ShuttingDown) => break,
                Err(e) => warn!(error = %e, "cannot queue input"),
            }
        }
    }

    async fn refresh_metrics(&self) {
        refresh(&self.metrics, &self.queue).await;
    }

    /// Spawn the metrics refresh, progress folding and (when enabled)
    /// status server tasks.
    fn start_background(&self) -> Vec<JoinHandle<()>> {
        let mut tasks = Vec::new();

        let metrics = self.metrics.clone();
        let queue = self.queue.clone();
        tasks.push(tokio::spawn(async move {
            loop {
                let system = collect_system_metrics();
                metrics.write().await.system = system;
                refresh(&metrics, &queue).await;
                tokio::time::sleep(METRICS_REFRESH).await;
            }
        }));

        let progress = self
            .progress
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .take();
        if let Some(mut events) = progress {
            let metrics = self.metrics.clone();
            tasks.push(tokio::spawn(async move {
                loop {
                    match events.recv().await {
                        Ok(event) => metrics.write().await.apply_progress(&event),
                        Err(RecvError::Lagged(skipped)) => debug!(skipped, "progress events dropped"),
                        Err(RecvError::Closed) => break,
                    }
                }
            }));
        }

        if self.config.metrics.enabled {
            let metrics = self.metrics.clone();
            let bind = self.config.metrics.bind.clone();
            tasks.push(tokio::spawn(async move {
                if let Err(e) = run_metrics_server(metrics, &bind).await {
                    error!("Metrics server error: {}", e);
                }
            }));
        }

        tasks
    }
}

/// Canonicalize `dir`, which may not exist yet: the deepest existing ancestor
/// is resolved and the remaining components appended.
fn resolve_dir(dir: &Path) -> PathBuf {
    let absolute = if dir.is_absolute() {
        dir.to_path_buf()
    } else {
        match std::env::current_dir() {
            Ok(cwd) => cwd.join(dir),
            Err(_) => return dir.to_path_buf(),
        }
    };

    let mut existing = absolute.as_path();
    let mut missing = Vec::new();
    loop {
        if let Ok(base) = std::fs::canonicalize(existing) {
            return missing.iter().rev().fold(base, |acc, part| acc.join(part));
        }
        match (existing.parent(), existing.file_name()) {
            (Some(parent), Some(name)) => {
                missing.push(name.to_os_string());
                existing = parent;
            }
            _ => return absolute,
        }
    }
}

async fn refresh(metrics: &SharedMetrics, queue: &ProcessingQueue) {
    let jobs = queue.jobs();
    let summary = queue.summary();
    let mut snapshot = metrics.write().await;
    snapshot.refresh_jobs(&jobs, summary);
    snapshot.timestamp_unix_ms = current_timestamp_ms();
}

fn stop(tasks: Vec<JoinHandle<()>>) {
    for task in tasks {
        task.abort();
    }
}
