//! Queue-scoped job records.
//!
//! A job wraps one [`TranscodeRequest`] with its lifecycle state. Terminal
//! jobs stay in the queue's history for reporting.

use crate::request::TranscodeRequest;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};
use uuid::Uuid;

/// Lifecycle state of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Waiting for a concurrency slot.
    #[default]
    Pending,
    /// A runner owns the job.
    Processing,
    /// Engine exited cleanly.
    Completed,
    /// Gave up after the retry limit or a non-retryable error.
    Failed,
    /// Stopped on request; never retried.
    Cancelled,
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobStatus::Pending => write!(f, "pending"),
            JobStatus::Processing => write!(f, "processing"),
            JobStatus::Completed => write!(f, "completed"),
            JobStatus::Failed => write!(f, "failed"),
            JobStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// A transcode request plus its queue bookkeeping.
#[derive(Debug, Clone)]
pub struct Job {
    /// Unique job identifier (UUID).
    pub id: String,
    pub request: TranscodeRequest,
    /// Source size at enqueue time.
    pub size_bytes: u64,
    pub status: JobStatus,
    /// Number of times a runner has been started for this job.
    pub attempt_count: u32,
    pub last_error: Option<String>,
    /// Unix timestamp (milliseconds) when the job was created.
    pub created_at: i64,
    /// Unix timestamp (milliseconds) of the last status change.
    pub updated_at: i64,
    /// Earliest time (ms) a retry may start.
    pub ready_at: i64,
}

impl Job {
    pub fn new(request: TranscodeRequest, size_bytes: u64) -> Self {
        let now = current_timestamp_ms();
        Self {
            id: Uuid::new_v4().to_string(),
            request,
            size_bytes,
            status: JobStatus::Pending,
            attempt_count: 0,
            last_error: None,
            created_at: now,
            updated_at: now,
            ready_at: now,
        }
    }

    pub fn input_path(&self) -> &Path {
        self.request.input_path()
    }

    pub fn touch(&mut self) {
        self.updated_at = current_timestamp_ms();
    }

    pub fn set_status(&mut self, status: JobStatus) {
        self.status = status;
        self.touch();
    }

    /// Claim the job for a runner.
    pub fn start_attempt(&mut self) {
        self.attempt_count += 1;
        self.set_status(JobStatus::Processing);
    }

    /// Record a failed attempt; back to pending if attempts remain.
    ///
    /// Returns the resulting status.
    pub fn record_failure(&mut self, reason: &str, retryable: bool, max_retries: u32, backoff_ms: i64) -> JobStatus {
        self.last_error = Some(reason.to_string());
        if retryable && self.attempt_count < max_retries {
            self.ready_at = current_timestamp_ms() + backoff_ms;
            self.set_status(JobStatus::Pending);
        } else {
            self.set_status(JobStatus::Failed);
        }
        self.status
    }

    /// Check if the job is in a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self.status,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }

    /// Check if the job is active (pending or processing).
    pub fn is_active(&self) -> bool {
        matches!(self.status, JobStatus::Pending | JobStatus::Processing)
    }

    /// Whether a pending job may start now.
    pub fn is_ready(&self, now_ms: i64) -> bool {
        self.status == JobStatus::Pending && self.ready_at <= now_ms
    }
}

/// Serializable view of a job for reporting.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JobSummary {
    pub id: String,
    pub input_path: PathBuf,
    pub status: JobStatus,
    pub attempt_count: u32,
    pub last_error: Option<String>,
    pub size_bytes: u64,
}

impl From<&Job> for JobSummary {
    fn from(job: &Job) -> Self {
        Self {
            id: job.id.clone(),
            input_path: job.input_path().to_path_buf(),
            status: job.status,
            attempt_count: job.attempt_count,
            last_error: job.last_error.clone(),
            size_bytes: job.size_bytes,
        }
    }
}

/// Get current timestamp in milliseconds since Unix epoch.
pub fn current_timestamp_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// Checks if an active (pending or processing) job exists for `path`.
pub fn job_exists_for_path(jobs: &[Job], path: &Path) -> bool {
    jobs.iter()
        .any(|job| job.input_path() == path && job.is_active())
}
