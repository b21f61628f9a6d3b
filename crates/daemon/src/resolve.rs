//! Duration and bitrate resolution for source files.
//!
//! Runs a metadata discovery tool (gst-discoverer, then ffprobe) with a timeout
//! scaled to the file size, and cross-checks the reported duration against the
//! file size. Implausible metadata is replaced by a size-based estimate and the
//! result is flagged so nothing downstream trusts it again.

use crate::config::ToolsConfig;
use crate::encode::pipeline::file_uri;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;
use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, warn};

const GIB: u64 = 1024 * 1024 * 1024;

/// Files above this size with a sub-minute duration have corrupt metadata.
pub const LARGE_FILE_BYTES: u64 = 10 * GIB;

/// Shortest duration considered plausible for a large file.
pub const MIN_PLAUSIBLE_DURATION_SECS: f64 = 60.0;

/// Conservative bitrate assumed when the duration has to be derived from size.
pub const ASSUMED_BITRATE_KBPS: f64 = 20_000.0;

/// Bitrates above this point at a corrupt duration rather than a real stream.
pub const MAX_PLAUSIBLE_BITRATE_KBPS: f64 = 500_000.0;

/// Resolved playable duration of a source file.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DurationEstimate {
    pub duration_secs: f64,
    /// Metadata was judged implausible (or absent) and replaced from file size
    pub is_estimated: bool,
    pub source_bitrate_kbps: Option<f64>,
}

impl DurationEstimate {
    /// Nothing known about the file at all.
    pub fn unknown() -> Self {
        Self {
            duration_secs: 0.0,
            is_estimated: false,
            source_bitrate_kbps: None,
        }
    }
}

#[derive(Debug, Error)]
enum DiscoveryError {
    #[error("{tool} timed out after {timeout:?}")]
    Timeout { tool: String, timeout: Duration },

    #[error("{tool} exited with status {status}")]
    Failed { tool: String, status: String },

    #[error("{0} output carried no duration")]
    NoDuration(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Discovery timeout for a file of the given size.
///
/// Large files with trailing index structures need more scan time.
pub fn discovery_timeout(file_size: u64) -> Duration {
    if file_size < GIB {
        Duration::from_secs(30)
    } else if file_size < 10 * GIB {
        Duration::from_secs(60)
    } else {
        Duration::from_secs(120)
    }
}

/// Duration derived purely from file size at the assumed bitrate.
pub fn size_based_duration(file_size: u64) -> f64 {
    (file_size as f64 * 8.0) / (ASSUMED_BITRATE_KBPS * 1000.0)
}

fn bitrate_kbps(file_size: u64, duration_secs: f64) -> f64 {
    (file_size as f64 * 8.0) / duration_secs / 1000.0
}

fn estimated_from_size(file_size: u64) -> DurationEstimate {
    let duration_secs = size_based_duration(file_size);
    DurationEstimate {
        duration_secs,
        is_estimated: true,
        source_bitrate_kbps: Some(bitrate_kbps(file_size, duration_secs)),
    }
}

/// Combine file size and discovered duration into a [`DurationEstimate`].
///
/// `file_size` of `None` (or zero) means the size could not be read; the
/// bitrate is then left absent. `discovered` of `None` means every discovery
/// tool failed.
pub fn assess(file_size: Option<u64>, discovered: Option<f64>) -> DurationEstimate {
    let file_size = file_size.filter(|&s| s > 0);
    let discovered = discovered.filter(|d| d.is_finite() && *d > 0.0);

    match (file_size, discovered) {
        (None, None) => DurationEstimate::unknown(),
        (None, Some(duration_secs)) => DurationEstimate {
            duration_secs,
            is_estimated: false,
            source_bitrate_kbps: None,
        },
        (Some(size), None) => {
            warn!(size, "no duration from discovery, estimating from file size");
            estimated_from_size(size)
        }
        (Some(size), Some(duration_secs)) => {
            if size > LARGE_FILE_BYTES && duration_secs < MIN_PLAUSIBLE_DURATION_SECS {
                warn!(
                    size,
                    reported_secs = duration_secs,
                    "duration too short for file size, metadata looks corrupt"
                );
                return estimated_from_size(size);
            }

            let kbps = bitrate_kbps(size, duration_secs);
            if kbps > MAX_PLAUSIBLE_BITRATE_KBPS {
                warn!(
                    size,
                    reported_secs = duration_secs,
                    bitrate_kbps = kbps,
                    "implausible source bitrate, re-estimating duration"
                );
                return estimated_from_size(size);
            }

            DurationEstimate {
                duration_secs,
                is_estimated: false,
                source_bitrate_kbps: Some(kbps),
            }
        }
    }
}

static DURATION_CLOCK: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"Duration:\s*(\d+):(\d{1,2}):(\d{1,2}(?:\.\d+)?)").expect("valid regex")
});

static DURATION_JSON_NS: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#""duration"\s*:\s*(\d+)"#).expect("valid regex"));

/// Extract a duration in seconds from discovery tool text.
///
/// Understands the `Duration: H:MM:SS.fraction` line and JSON fragments with
/// a `"duration"` field in nanoseconds.
pub fn parse_discovery_output(text: &str) -> Option<f64> {
    if let Some(caps) = DURATION_CLOCK.captures(text) {
        let hours: f64 = caps[1].parse().ok()?;
        let minutes: f64 = caps[2].parse().ok()?;
        let seconds: f64 = caps[3].parse().ok()?;
        return Some(hours * 3600.0 + minutes * 60.0 + seconds);
    }

    let caps = DURATION_JSON_NS.captures(text)?;
    let nanos: u64 = caps[1].parse().ok()?;
    Some(nanos as f64 / 1_000_000_000.0)
}

/// Raw ffprobe JSON structures for parsing.
mod ffprobe_json {
    use serde::Deserialize;

    #[derive(Debug, Deserialize)]
    pub struct FfprobeOutput {
        pub format: Option<Format>,
    }

    #[derive(Debug, Deserialize)]
    pub struct Format {
        pub duration: Option<String>,
    }
}

/// Parse `ffprobe -print_format json -show_format` output into seconds.
pub fn parse_ffprobe_output(json_str: &str) -> Option<f64> {
    let parsed: ffprobe_json::FfprobeOutput = serde_json::from_str(json_str).ok()?;
    parsed.format?.duration?.parse::<f64>().ok()
}

async fn run_tool(
    program: &str,
    args: &[String],
    timeout: Duration,
) -> Result<String, DiscoveryError> {
    let child = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .output();

    let output = tokio::time::timeout(timeout, child)
        .await
        .map_err(|_| DiscoveryError::Timeout {
            tool: program.to_string(),
            timeout,
        })??;

    if !output.status.success() {
        return Err(DiscoveryError::Failed {
            tool: program.to_string(),
            status: output.status.to_string(),
        });
    }

    let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
    text.push('\n');
    text.push_str(&String::from_utf8_lossy(&output.stderr));
    Ok(text)
}

async fn discover(path: &Path, tools: &ToolsConfig, timeout: Duration) -> Option<f64> {
    let primary = run_tool(
        &tools.gst_discoverer,
        &[file_uri(path)],
        timeout,
    )
    .await
    .and_then(|text| {
        parse_discovery_output(&text)
            .ok_or_else(|| DiscoveryError::NoDuration(tools.gst_discoverer.clone()))
    });

    match primary {
        Ok(secs) => return Some(secs),
        Err(e) => debug!(error = %e, "primary discovery failed, trying secondary"),
    }

    let secondary = run_tool(
        &tools.ffprobe,
        &[
            "-v".to_string(),
            "quiet".to_string(),
            "-print_format".to_string(),
            "json".to_string(),
            "-show_format".to_string(),
            path.to_string_lossy().into_owned(),
        ],
        timeout,
    )
    .await
    .and_then(|text| {
        parse_ffprobe_output(text.trim())
            .ok_or_else(|| DiscoveryError::NoDuration(tools.ffprobe.clone()))
    });

    match secondary {
        Ok(secs) => Some(secs),
        Err(e) => {
            debug!(error = %e, "secondary discovery failed");
            None
        }
    }
}

/// Resolve the playable duration and bitrate of `path`.
///
/// Never fails: discovery problems degrade to a size-based estimate, and an
/// unreadable file yields [`DurationEstimate::unknown`].
pub async fn resolve(path: &Path, tools: &ToolsConfig) -> DurationEstimate {
    let file_size = match tokio::fs::metadata(path).await {
        Ok(m) => Some(m.len()),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "cannot read file size");
            None
        }
    };

    let timeout = discovery_timeout(file_size.unwrap_or(0));
    let discovered = discover(path, tools, timeout).await;
    let estimate = assess(file_size, discovered);

    debug!(
        path = %path.display(),
        duration_secs = estimate.duration_secs,
        is_estimated = estimate.is_estimated,
        bitrate_kbps = ?estimate.source_bitrate_kbps,
        "resolved duration"
    );
    estimate
}
