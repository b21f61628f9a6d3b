//! Metrics snapshot served by the status endpoint
//!
//! Job records come from the queue; progress fields are folded in from the
//! runner's progress events.

use crate::jobs::{JobStatus, JobSummary};
use crate::progress::{ProgressEvent, ProgressSnapshot};
use crate::queue::QueueSummary;
use crate::rate_control::RateControlMode;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::RwLock;

/// Per-job metrics
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct JobMetrics {
    pub id: String,
    pub input_path: String,
    pub status: String,
    pub attempts: u32,
    pub last_error: Option<String>,
    pub size_in_bytes_before: u64,
    pub file_percent: u8,
    pub position_secs: f64,
    pub total_duration_secs: f64,
    pub duration_is_estimated: bool,
    pub rate_control_mode: Option<RateControlMode>,
    pub current_chunk: u32,
    pub total_chunks: u32,
    pub completed_chunks: u32,
    pub chunk_percent: u8,
    pub speed: Option<f64>,
    pub est_remaining_secs: Option<u64>,
    pub output_bytes_written: u64,
    pub output_throughput_bps: Option<f64>,
}

impl JobMetrics {
    fn apply_progress(&mut self, mode: RateControlMode, progress: &ProgressSnapshot) {
        self.rate_control_mode = Some(mode);
        self.file_percent = progress.file_percent;
        self.position_secs = progress.position_secs;
        self.total_duration_secs = progress.total_duration_secs;
        self.duration_is_estimated = progress.duration_is_estimated;
        self.current_chunk = progress.current_chunk;
        self.total_chunks = progress.total_chunks;
        self.completed_chunks = progress.completed_chunks;
        self.chunk_percent = progress.chunk_percent;
        self.speed = progress.smoothed_speed;
        self.est_remaining_secs = progress.smoothed_eta_secs;
        self.output_bytes_written = progress.output_bytes_written;
        self.output_throughput_bps = progress.output_throughput_bps;
    }
}

/// System-level metrics for resource monitoring
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct SystemMetrics {
    pub cpu_usage_percent: f32,
    pub mem_usage_percent: f32,
    pub load_avg_1: f32,
    pub load_avg_5: f32,
    pub load_avg_15: f32,
}

/// Complete metrics snapshot including jobs, system, and aggregate stats
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct MetricsSnapshot {
    pub timestamp_unix_ms: i64,
    pub jobs: Vec<JobMetrics>,
    pub system: SystemMetrics,
    pub queue_len: usize,
    pub running_jobs: usize,
    pub completed_jobs: usize,
    pub failed_jobs: usize,
    pub cancelled_jobs: usize,
    pub total_bytes_written: u64,
}

impl MetricsSnapshot {
    /// Replace the job list with the queue's view, keeping progress already
    /// folded in for jobs that are still known.
    pub fn refresh_jobs(&mut self, jobs: &[JobSummary], summary: QueueSummary) {
        let previous = std::mem::take(&mut self.jobs);

        self.jobs = jobs
            .iter()
            .map(|job| {
                let input_path = job.input_path.to_string_lossy().into_owned();
                let mut metrics = previous
                    .iter()
                    .find(|m| m.id == job.id)
                    .cloned()
                    .unwrap_or_default();
                metrics.id = job.id.clone();
                metrics.input_path = input_path;
                metrics.status = job.status.to_string();
                metrics.attempts = job.attempt_count;
                metrics.last_error = job.last_error.clone();
                metrics.size_in_bytes_before = job.size_bytes;
                if job.status == JobStatus::Completed {
                    metrics.file_percent = 100;
                }
                metrics
            })
            .collect();

        self.queue_len = summary.pending;
        self.running_jobs = summary.processing;
        self.completed_jobs = summary.completed;
        self.failed_jobs = summary.failed;
        self.cancelled_jobs = summary.cancelled;
        self.total_bytes_written = self.jobs.iter().map(|j| j.output_bytes_written).sum();
    }

    /// Fold a progress event into the matching processing job.
    pub fn apply_progress(&mut self, event: &ProgressEvent) {
        let path = event.input_path.to_string_lossy();
        if let Some(job) = self
            .jobs
            .iter_mut()
            .find(|j| j.input_path == path && j.status == JobStatus::Processing.to_string())
        {
            job.apply_progress(event.mode, &event.snapshot);
        }
        self.total_bytes_written = self.jobs.iter().map(|j| j.output_bytes_written).sum();
    }
}

/// Shared metrics state for concurrent access across daemon components
pub type SharedMetrics = Arc<RwLock<MetricsSnapshot>>;

/// Creates a new SharedMetrics instance with default values
pub fn new_shared_metrics() -> SharedMetrics {
    Arc::new(RwLock::new(MetricsSnapshot::default()))
}

/// Collects current system metrics using sysinfo
pub fn collect_system_metrics() -> SystemMetrics {
    use sysinfo::System;

    let mut sys = System::new();
    sys.refresh_cpu_usage();
    sys.refresh_memory();

    let cpu_usage = sys.global_cpu_usage();
    let total_memory = sys.total_memory();
    let used_memory = sys.used_memory();
    let mem_usage = if total_memory > 0 {
        (used_memory as f64 / total_memory as f64 * 100.0) as f32
    } else {
        0.0
    };

    let load_avg = System::load_average();

    SystemMetrics {
        cpu_usage_percent: cpu_usage,
        mem_usage_percent: mem_usage,
        load_avg_1: load_avg.one as f32,
        load_avg_5: load_avg.five as f32,
        load_avg_15: load_avg.fifteen as f32,
    }
}
