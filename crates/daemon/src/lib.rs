//! splitcode
//!
//! Batch and watch transcoding service that splits every source video into
//! fixed-duration chunks through a `gst-launch-1.0` pipeline, with rate
//! control planned from a target compression ratio.

pub mod concurrency;
pub mod daemon;
pub mod encode;
pub mod jobs;
pub mod metrics;
pub mod metrics_server;
pub mod progress;
pub mod queue;
pub mod rate_control;
pub mod relocate;
pub mod request;
pub mod resolve;
pub mod scan;
pub mod stability;
pub mod startup;
pub mod watch;

pub use splitcode_config as config;
pub use splitcode_config::Config;
pub use concurrency::{derive_plan, ConcurrencyPlan};
pub use daemon::{BatchSummary, Daemon, DaemonError};
pub use encode::{GstJobRunner, JobReport, JobRunner, RunError};
pub use jobs::{Job, JobStatus, JobSummary};
pub use metrics::{
    collect_system_metrics, new_shared_metrics, JobMetrics, MetricsSnapshot, SharedMetrics,
    SystemMetrics,
};
pub use metrics_server::{create_metrics_router, run_metrics_server, ServerError};
pub use progress::{ProgressEvent, ProgressSnapshot, ProgressTracker};
pub use queue::{ProcessingQueue, QueueError, QueueOptions, QueueSummary};
pub use rate_control::{plan, PlanError, RateControlMode, RateControlPlan};
pub use request::{CompressionRatio, EncodeSettings, TranscodeRequest};
pub use resolve::{resolve, DurationEstimate};
pub use startup::{run_startup_checks, StartupError};
