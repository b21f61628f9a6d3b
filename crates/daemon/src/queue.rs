//! Processing queue: bounded concurrency, retries, dedupe, relocation.
//!
//! All bookkeeping sits behind one mutex that is never held across an
//! await, so `enqueue`, `tick` and job completion cannot interleave
//! half-way.

use crate::encode::runner::{JobRunner, RunError};
use crate::jobs::{current_timestamp_ms, job_exists_for_path, Job, JobStatus, JobSummary};
use crate::relocate::{mirrored_dir, relocate};
use crate::request::{EncodeSettings, TranscodeRequest};
use serde::Serialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};

/// Poll interval of [`ProcessingQueue::wait_for_completion`].
pub const COMPLETION_POLL: Duration = Duration::from_millis(250);

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("queue is shutting down")]
    ShuttingDown,

    #[error("cannot read {path}: {source}")]
    Stat {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("{0} is not a file")]
    NotAFile(PathBuf),

    #[error("{} has a name that is not valid UTF-8; rename it to transcode", .0.display())]
    NonUtf8Path(PathBuf),
}

/// Static queue configuration.
#[derive(Debug, Clone)]
pub struct QueueOptions {
    pub max_concurrency: usize,
    pub max_retries: u32,
    pub retry_backoff: Duration,
    /// Root that relative subdirectories are computed against
    pub input_root: PathBuf,
    pub output_root: PathBuf,
    pub processed_dir: Option<PathBuf>,
    pub failed_dir: Option<PathBuf>,
    pub settings: EncodeSettings,
}

/// Counts of jobs by status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueSummary {
    pub pending: usize,
    pub processing: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
}

impl QueueSummary {
    pub fn is_idle(&self) -> bool {
        self.pending == 0 && self.processing == 0
    }
}

#[derive(Default)]
struct QueueState {
    jobs: Vec<Job>,
    /// Jobs owned by a runner, including their relocation step
    active: usize,
    tokens: HashMap<String, CancellationToken>,
}

struct Inner {
    options: QueueOptions,
    runner: Arc<dyn JobRunner>,
    state: Mutex<QueueState>,
    accepting: AtomicBool,
    root_token: CancellationToken,
    changed: Notify,
}

/// Handle to the queue; cheap to clone.
#[derive(Clone)]
pub struct ProcessingQueue {
    inner: Arc<Inner>,
}

struct StartedJob {
    id: String,
    request: TranscodeRequest,
    attempt: u32,
    token: CancellationToken,
}

enum Outcome {
    Completed,
    Cancelled,
    Retry,
    Failed,
    /// Terminal failure caused by the host setup; the source is not moved.
    FailedInPlace,
}

impl ProcessingQueue {
    pub fn new(mut options: QueueOptions, runner: Arc<dyn JobRunner>) -> Self {
        options.max_concurrency = options.max_concurrency.max(1);
        options.input_root =
            std::fs::canonicalize(&options.input_root).unwrap_or(options.input_root);

        Self {
            inner: Arc::new(Inner {
                options,
                runner,
                state: Mutex::new(QueueState::default()),
                accepting: AtomicBool::new(true),
                root_token: CancellationToken::new(),
                changed: Notify::new(),
            }),
        }
    }

    pub fn options(&self) -> &QueueOptions {
        &self.inner.options
    }

    fn state(&self) -> MutexGuard<'_, QueueState> {
        // a panic while holding the lock leaves the bookkeeping usable
        self.inner
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Add `path` as a pending job and try to start work.
    ///
    /// Returns the new job id, or `None` when the same absolute path is
    /// already pending or processing.
    pub async fn enqueue(&self, path: &Path) -> Result<Option<String>, QueueError> {
        if !self.inner.accepting.load(Ordering::SeqCst) {
            return Err(QueueError::ShuttingDown);
        }

        let stat_err = |source| QueueError::Stat {
            path: path.to_path_buf(),
            source,
        };
        let path = tokio::fs::canonicalize(path).await.map_err(stat_err)?;
        let metadata = tokio::fs::metadata(&path).await.map_err(stat_err)?;
        if !metadata.is_file() {
            return Err(QueueError::NotAFile(path));
        }
        // the engine takes paths as text; a lossy name would never open
        if path.to_str().is_none() {
            return Err(QueueError::NonUtf8Path(path));
        }

        let options = &self.inner.options;
        let output_dir = mirrored_dir(&path, &options.input_root, &options.output_root);
        let request = TranscodeRequest::new(path.clone(), output_dir, options.settings.clone());

        let id = {
            let mut state = self.state();
            if job_exists_for_path(&state.jobs, &path) {
                debug!(path = %path.display(), "already queued");
                return Ok(None);
            }
            let job = Job::new(request, metadata.len());
            let id = job.id.clone();
            state.jobs.push(job);
            id
        };

        info!(job_id = %id, path = %path.display(), size_bytes = metadata.len(), "enqueued");
        self.tick();
        Ok(Some(id))
    }

    /// Start pending jobs while slots are free.
    pub fn tick(&self) {
        if !self.inner.accepting.load(Ordering::SeqCst) {
            return;
        }

        let now = current_timestamp_ms();
        let mut started = Vec::new();
        {
            let mut guard = self.state();
            let state = &mut *guard;
            while state.active < self.inner.options.max_concurrency {
                let Some(job) = state.jobs.iter_mut().find(|j| j.is_ready(now)) else {
                    break;
                };
                job.start_attempt();
                let token = self.inner.root_token.child_token();
                started.push(StartedJob {
                    id: job.id.clone(),
                    request: job.request.clone(),
                    attempt: job.attempt_count,
                    token: token.clone(),
                });
                state.tokens.insert(job.id.clone(), token);
                state.active += 1;
            }
        }

        for job in started {
            let span = info_span!(
                "job",
                job_id = %job.id,
                input = %job.request.input_path().display(),
                attempt = job.attempt
            );
            let queue = self.clone();
            tokio::spawn(async move { queue.execute(job).await }.instrument(span));
        }
    }

    async fn execute(self, job: StartedJob) {
        info!("starting attempt");
        let result = self.inner.runner.run(&job.request, job.token).await;
        let options = &self.inner.options;

        let outcome = {
            let mut state = self.state();
            let Some(record) = state.jobs.iter_mut().find(|j| j.id == job.id) else {
                return;
            };
            match &result {
                Ok(report) => {
                    info!(
                        chunks = report.chunks.len(),
                        output_bytes = report.output_bytes,
                        "completed"
                    );
                    Outcome::Completed
                }
                Err(RunError::Cancelled) => {
                    info!("cancelled");
                    Outcome::Cancelled
                }
                Err(e) => {
                    let mut message = e.to_string();
                    if let Some(hint) = e.remediation() {
                        message = format!("{} ({})", message, hint);
                    }
                    let backoff_ms = options.retry_backoff.as_millis() as i64;
                    match record.record_failure(&message, e.retryable(), options.max_retries, backoff_ms) {
                        JobStatus::Pending => {
                            warn!(
                                error = %message,
                                attempts = record.attempt_count,
                                max_retries = options.max_retries,
                                "attempt failed, will retry"
                            );
                            Outcome::Retry
                        }
                        _ if e.is_environment() => {
                            warn!(error = %message, "failed, leaving source in place");
                            Outcome::FailedInPlace
                        }
                        _ => {
                            warn!(error = %message, attempts = record.attempt_count, "failed");
                            Outcome::Failed
                        }
                    }
                }
            }
        };

        let destination = match outcome {
            Outcome::Completed => options.processed_dir.clone(),
            Outcome::Failed => options.failed_dir.clone(),
            Outcome::Cancelled | Outcome::Retry | Outcome::FailedInPlace => None,
        };
        if let Some(target_root) = destination {
            self.relocate_source(job.request.input_path(), &target_root).await;
        }

        {
            let mut state = self.state();
            if let Some(record) = state.jobs.iter_mut().find(|j| j.id == job.id) {
                match outcome {
                    Outcome::Completed => record.set_status(JobStatus::Completed),
                    Outcome::Cancelled => record.set_status(JobStatus::Cancelled),
                    Outcome::Retry | Outcome::Failed | Outcome::FailedInPlace => {}
                }
            }
            state.tokens.remove(&job.id);
            state.active = state.active.saturating_sub(1);
        }

        if matches!(outcome, Outcome::Retry) && !options.retry_backoff.is_zero() {
            let queue = self.clone();
            let delay = options.retry_backoff;
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                queue.tick();
            });
        }

        self.inner.changed.notify_waiters();
        self.tick();
    }

    async fn relocate_source(&self, source: &Path, target_root: &Path) {
        let source = source.to_path_buf();
        let input_root = self.inner.options.input_root.clone();
        let target_root = target_root.to_path_buf();

        let moved = tokio::task::spawn_blocking(move || relocate(&source, &input_root, &target_root)).await;
        match moved {
            Ok(Ok(destination)) => info!(to = %destination.display(), "moved source"),
            Ok(Err(e)) => warn!(error = %e, "failed to move source"),
            Err(e) => warn!(error = %e, "relocation task failed"),
        }
    }

    /// Cancel the job for `path`, whether pending or processing.
    ///
    /// Returns false if no active job matches.
    pub fn cancel(&self, path: &Path) -> bool {
        let path = std::fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf());
        let mut guard = self.state();
        let state = &mut *guard;

        let Some(job) = state
            .jobs
            .iter_mut()
            .find(|j| j.input_path() == path && j.is_active())
        else {
            return false;
        };

        match job.status {
            JobStatus::Pending => {
                job.set_status(JobStatus::Cancelled);
                self.inner.changed.notify_waiters();
            }
            _ => {
                if let Some(token) = state.tokens.get(&job.id) {
                    token.cancel();
                }
            }
        }
        true
    }

    /// Cancel every pending and processing job.
    pub fn cancel_all(&self) {
        let mut state = self.state();
        for job in state.jobs.iter_mut().filter(|j| j.status == JobStatus::Pending) {
            job.set_status(JobStatus::Cancelled);
        }
        for token in state.tokens.values() {
            token.cancel();
        }
        self.inner.changed.notify_waiters();
    }

    /// Snapshot of every job the queue has seen.
    pub fn jobs(&self) -> Vec<JobSummary> {
        self.state().jobs.iter().map(JobSummary::from).collect()
    }

    pub fn summary(&self) -> QueueSummary {
        let state = self.state();
        let mut summary = QueueSummary::default();
        for job in &state.jobs {
            match job.status {
                JobStatus::Pending => summary.pending += 1,
                JobStatus::Processing => summary.processing += 1,
                JobStatus::Completed => summary.completed += 1,
                JobStatus::Failed => summary.failed += 1,
                JobStatus::Cancelled => summary.cancelled += 1,
            }
        }
        summary
    }

    fn active_count(&self) -> usize {
        self.state().active
    }

    fn is_idle(&self) -> bool {
        let state = self.state();
        state.active == 0 && !state.jobs.iter().any(|j| j.is_active())
    }

    /// Wait until no job is pending or processing.
    pub async fn wait_for_completion(&self) {
        loop {
            let changed = self.inner.changed.notified();
            if self.is_idle() {
                return;
            }
            tokio::select! {
                _ = changed => {}
                _ = tokio::time::sleep(COMPLETION_POLL) => {}
            }
        }
    }

    /// Stop accepting new jobs and starts, then wait for running jobs.
    pub async fn shutdown(&self) {
        self.inner.accepting.store(false, Ordering::SeqCst);
        info!(active = self.active_count(), "queue shutting down");
        loop {
            let changed = self.inner.changed.notified();
            if self.active_count() == 0 {
                return;
            }
            tokio::select! {
                _ = changed => {}
                _ = tokio::time::sleep(COMPLETION_POLL) => {}
            }
        }
    }

    pub fn is_accepting(&self) -> bool {
        self.inner.accepting.load(Ordering::SeqCst)
    }
}
