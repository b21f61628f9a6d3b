//! Job runner: one gst-launch subprocess per file.
//!
//! Resolve → plan → build → spawn, then stream engine output into a
//! [`ProgressTracker`] until the process exits or the job is cancelled.

use crate::config::ToolsConfig;
use crate::encode::pipeline::{self, PipelineSpec};
use crate::progress::{
    classify_line, indicates_backend_unavailable, scan_chunks, OutputLine, ProgressEvent,
    ProgressTracker,
};
use crate::rate_control::{self, PlanError, RateControlMode};
use crate::request::TranscodeRequest;
use crate::resolve::{self, DurationEstimate};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::io::ErrorKind;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Time allowed between the soft terminate and the hard kill.
pub const TERMINATE_GRACE: Duration = Duration::from_secs(2);

/// Interval of the snapshot timer and output-directory poll.
pub const TICK_INTERVAL: Duration = Duration::from_secs(1);

/// Engine error lines kept for the failure message.
const ERROR_TAIL_LINES: usize = 20;

const EVENT_CAPACITY: usize = 256;

/// Windows NTSTATUS codes that mean the engine crashed.
const CRASH_EXIT_CODES: &[u32] = &[
    0xC000_0005, // access violation
    0xC000_001D, // illegal instruction
    0xC000_0094, // integer divide by zero
    0xC000_00FD, // stack overflow
    0xC000_0409, // stack buffer overrun
];

/// Why a job did not complete.
#[derive(Debug, Error)]
pub enum RunError {
    #[error("invalid request: {0}")]
    Plan(#[from] PlanError),

    #[error("cannot create output directory {path}: {source}")]
    OutputDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("pipeline engine '{program}' not found")]
    ExecutableNotFound { program: String },

    #[error("failed to start '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("encoder '{element}' is unavailable: {detail}")]
    BackendUnavailable { element: String, detail: String },

    #[error("pipeline engine crashed ({reason}): {detail}")]
    Crashed { reason: String, detail: String },

    #[error("pipeline engine exited with code {code}: {detail}")]
    Exited { code: i32, detail: String },

    #[error("I/O error while waiting for the engine: {0}")]
    Wait(#[source] std::io::Error),

    #[error("cancelled")]
    Cancelled,
}

impl RunError {
    /// Runtime failures are worth another attempt; environment and request
    /// problems are not.
    pub fn retryable(&self) -> bool {
        matches!(
            self,
            RunError::Crashed { .. } | RunError::Exited { .. } | RunError::Wait(_)
        )
    }

    /// Problems with the host setup or configuration rather than the source
    /// file. Such failures leave the source where it is.
    pub fn is_environment(&self) -> bool {
        matches!(
            self,
            RunError::Plan(_)
                | RunError::ExecutableNotFound { .. }
                | RunError::Spawn { .. }
                | RunError::BackendUnavailable { .. }
                | RunError::OutputDir { .. }
        )
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, RunError::Cancelled)
    }

    /// Actionable hint for the user, where one exists.
    pub fn remediation(&self) -> Option<String> {
        match self {
            RunError::Plan(PlanError::MissingCompressionRatio) => Some(
                "set encode.compression_ratio (or --ratio) to one of 1, 2, 3, 4, 5, 10, 20".to_string(),
            ),
            RunError::ExecutableNotFound { program } => Some(format!(
                "install GStreamer 1.x and make sure '{}' is on PATH, or set tools.gst_launch",
                program
            )),
            RunError::BackendUnavailable { element, .. } => Some(format!(
                "install the GStreamer plugin providing '{}' (check with gst-inspect-1.0 {}) or choose another backend",
                element, element
            )),
            RunError::Crashed { .. } => Some(
                "the engine crashed; check GPU drivers and GStreamer plugin versions".to_string(),
            ),
            _ => None,
        }
    }
}

/// Summary of a completed job.
#[derive(Debug, Clone, PartialEq)]
pub struct JobReport {
    pub estimate: DurationEstimate,
    pub mode: RateControlMode,
    pub target_bitrate_kbps: Option<u32>,
    pub chunks: Vec<PathBuf>,
    pub input_bytes: u64,
    pub output_bytes: u64,
}

impl JobReport {
    /// Achieved input/output size ratio.
    pub fn achieved_ratio(&self) -> Option<f64> {
        if self.output_bytes == 0 || self.input_bytes == 0 {
            None
        } else {
            Some(self.input_bytes as f64 / self.output_bytes as f64)
        }
    }
}

/// Runs one transcode to completion.
#[async_trait]
pub trait JobRunner: Send + Sync + 'static {
    async fn run(
        &self,
        request: &TranscodeRequest,
        cancel: CancellationToken,
    ) -> Result<JobReport, RunError>;
}

/// [`JobRunner`] driving `gst-launch-1.0`.
pub struct GstJobRunner {
    tools: ToolsConfig,
    events: broadcast::Sender<ProgressEvent>,
    grace: Duration,
}

impl GstJobRunner {
    pub fn new(tools: ToolsConfig) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            tools,
            events,
            grace: TERMINATE_GRACE,
        }
    }

    pub fn with_grace(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }

    /// Receive progress events from every job this runner executes.
    pub fn subscribe(&self) -> broadcast::Receiver<ProgressEvent> {
        self.events.subscribe()
    }

    fn publish(
        &self,
        request: &TranscodeRequest,
        mode: RateControlMode,
        tracker: &ProgressTracker,
    ) {
        // no subscribers is fine
        let _ = self.events.send(ProgressEvent {
            input_path: request.input_path().to_path_buf(),
            mode,
            snapshot: tracker.snapshot().clone(),
        });
    }

    fn spawn(&self, spec: &PipelineSpec) -> Result<Child, RunError> {
        let program = &self.tools.gst_launch;
        Command::new(program)
            .args(&spec.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| match e.kind() {
                ErrorKind::NotFound => RunError::ExecutableNotFound {
                    program: program.clone(),
                },
                _ => RunError::Spawn {
                    program: program.clone(),
                    source: e,
                },
            })
    }

    /// Feed one engine output line to the tracker; returns whether the
    /// snapshot changed.
    fn handle_line(
        line: &str,
        tracker: &mut ProgressTracker,
        errors: &mut VecDeque<String>,
        started: Instant,
    ) -> bool {
        match classify_line(line) {
            OutputLine::Progress {
                position_secs,
                duration_secs,
            } => {
                tracker.on_position_update(position_secs, duration_secs, started.elapsed());
                true
            }
            OutputLine::Error(text) => {
                warn!(line = %text, "engine");
                if errors.len() == ERROR_TAIL_LINES {
                    errors.pop_front();
                }
                errors.push_back(text);
                false
            }
            OutputLine::Status => {
                debug!(line = line.trim(), "engine");
                false
            }
            OutputLine::Empty => false,
        }
    }
}

#[async_trait]
impl JobRunner for GstJobRunner {
    async fn run(
        &self,
        request: &TranscodeRequest,
        cancel: CancellationToken,
    ) -> Result<JobReport, RunError> {
        // discovery can take minutes on large files
        let estimate = tokio::select! {
            _ = cancel.cancelled() => return Err(RunError::Cancelled),
            estimate = resolve::resolve(request.input_path(), &self.tools) => estimate,
        };
        let plan = rate_control::plan(request, &estimate)?;
        let spec = pipeline::build(request, &plan);

        if cancel.is_cancelled() {
            return Err(RunError::Cancelled);
        }

        tokio::fs::create_dir_all(request.output_dir())
            .await
            .map_err(|source| RunError::OutputDir {
                path: request.output_dir().to_path_buf(),
                source,
            })?;

        info!(
            mode = plan.mode().as_str(),
            target_kbps = ?plan.target_bitrate_kbps(),
            estimated = estimate.is_estimated,
            "starting {} {}",
            self.tools.gst_launch,
            spec.args.join(" ")
        );

        let mut child = self.spawn(&spec)?;
        let mut stdout = child.stdout.take().map(BufReader::new);
        let mut stderr = child.stderr.take().map(BufReader::new);

        let started = Instant::now();
        let mut tracker = ProgressTracker::new(&estimate, request.chunk_duration());
        let mut errors: VecDeque<String> = VecDeque::new();
        let mut ticker = tokio::time::interval(TICK_INTERVAL);
        let base_name = request.base_name();

        let status = loop {
            tokio::select! {
                line = next_line(&mut stdout), if stdout.is_some() => match line {
                    Some(line) => {
                        if Self::handle_line(&line, &mut tracker, &mut errors, started) {
                            self.publish(request, plan.mode(), &tracker);
                        }
                    }
                    None => stdout = None,
                },
                line = next_line(&mut stderr), if stderr.is_some() => match line {
                    Some(line) => {
                        if Self::handle_line(&line, &mut tracker, &mut errors, started) {
                            self.publish(request, plan.mode(), &tracker);
                        }
                    }
                    None => stderr = None,
                },
                _ = ticker.tick() => {
                    let scan = scan_chunks(request.output_dir(), &base_name, request.container()).await;
                    tracker.on_output_scan(&scan, started.elapsed());
                    let snap = tracker.on_tick(started.elapsed());
                    debug!(
                        percent = snap.file_percent,
                        chunk = snap.current_chunk,
                        chunks = snap.total_chunks,
                        speed = ?snap.smoothed_speed,
                        eta_secs = ?snap.smoothed_eta_secs,
                        "progress"
                    );
                    self.publish(request, plan.mode(), &tracker);
                }
                _ = cancel.cancelled() => break None,
                status = child.wait() => break Some(status),
            }
        };

        let status = match status {
            Some(status) => status.map_err(RunError::Wait)?,
            None => {
                info!("cancellation requested, stopping engine");
                terminate(&mut child, self.grace).await;
                return Err(RunError::Cancelled);
            }
        };

        // Drain whatever the engine wrote before exiting.
        while let Some(line) = next_line(&mut stdout).await {
            Self::handle_line(&line, &mut tracker, &mut errors, started);
        }
        while let Some(line) = next_line(&mut stderr).await {
            Self::handle_line(&line, &mut tracker, &mut errors, started);
        }

        let errors: Vec<String> = errors.into_iter().collect();
        classify_exit(status, &errors, request.backend().element())?;

        let scan = scan_chunks(request.output_dir(), &base_name, request.container()).await;
        tracker.on_output_scan(&scan, started.elapsed());
        tracker.complete();
        self.publish(request, plan.mode(), &tracker);

        let input_bytes = tokio::fs::metadata(request.input_path())
            .await
            .map(|m| m.len())
            .unwrap_or(0);
        let report = JobReport {
            estimate,
            mode: plan.mode(),
            target_bitrate_kbps: plan.target_bitrate_kbps(),
            chunks: scan.chunks,
            input_bytes,
            output_bytes: scan.total_bytes,
        };

        info!(
            chunks = report.chunks.len(),
            input_bytes = report.input_bytes,
            output_bytes = report.output_bytes,
            target_ratio = ?request.compression_ratio().map(|r| r.get()),
            actual_ratio = ?report.achieved_ratio().map(|r| (r * 100.0).round() / 100.0),
            elapsed_secs = started.elapsed().as_secs(),
            "encode finished"
        );

        Ok(report)
    }
}

/// Next output line, decoded lossily. `None` only at end of stream.
///
/// Engine output can carry file names or tags in any encoding, so bytes that
/// are not UTF-8 must not end the read loop.
async fn next_line<R>(reader: &mut Option<BufReader<R>>) -> Option<String>
where
    R: tokio::io::AsyncRead + Unpin,
{
    let reader = reader.as_mut()?;
    let mut buf = Vec::new();
    match reader.read_until(b'\n', &mut buf).await {
        Ok(0) => None,
        Ok(_) => {
            let line = String::from_utf8_lossy(&buf);
            Some(line.trim_end_matches(['\n', '\r']).to_string())
        }
        Err(e) => {
            debug!("engine output unreadable: {}", e);
            None
        }
    }
}

/// Map an engine exit status (plus its error text) to an outcome.
pub fn classify_exit(status: ExitStatus, errors: &[String], element: &str) -> Result<(), RunError> {
    if status.success() {
        return Ok(());
    }

    let detail = errors.last().cloned().unwrap_or_default();

    if let Some(line) = errors.iter().find(|e| indicates_backend_unavailable(e)) {
        return Err(RunError::BackendUnavailable {
            element: element.to_string(),
            detail: line.clone(),
        });
    }

    if let Some(signal) = terminating_signal(&status) {
        return Err(RunError::Crashed {
            reason: format!("signal {}", signal),
            detail,
        });
    }

    match status.code() {
        Some(code) if CRASH_EXIT_CODES.contains(&(code as u32)) => Err(RunError::Crashed {
            reason: format!("exit code {:#010X}", code as u32),
            detail,
        }),
        Some(code) => Err(RunError::Exited { code, detail }),
        None => Err(RunError::Crashed {
            reason: "terminated without exit code".to_string(),
            detail,
        }),
    }
}

/// Ask the engine to stop, then kill it if it has not exited within `grace`.
///
/// `gst-launch -e` turns SIGINT into end-of-stream, so the chunk being
/// written is finalized.
pub async fn terminate(child: &mut Child, grace: Duration) {
    interrupt(child);

    match tokio::time::timeout(grace, child.wait()).await {
        Ok(_) => debug!("engine stopped"),
        Err(_) => {
            warn!(grace_secs = grace.as_secs_f64(), "engine ignored interrupt, killing");
            if let Err(e) = child.kill().await {
                warn!(error = %e, "failed to kill engine");
            }
        }
    }
}

#[cfg(unix)]
fn terminating_signal(status: &ExitStatus) -> Option<i32> {
    use std::os::unix::process::ExitStatusExt;
    status.signal()
}

#[cfg(not(unix))]
fn terminating_signal(_status: &ExitStatus) -> Option<i32> {
    None
}

#[cfg(unix)]
fn interrupt(child: &Child) {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    if let Some(pid) = child.id() {
        if let Err(e) = kill(Pid::from_raw(pid as i32), Signal::SIGINT) {
            debug!(error = %e, "SIGINT failed");
        }
    }
}

// No console interrupt for a detached child here; the hard kill follows.
#[cfg(not(unix))]
fn interrupt(_child: &Child) {}
