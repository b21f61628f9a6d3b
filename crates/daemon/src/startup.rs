//! Startup checks
//!
//! Preflight checks run before the daemon starts:
//! - gst-launch availability and version
//! - encoder element availability for the configured backend

use crate::config::{Backend, Config};
use std::process::Command;
use thiserror::Error;
use tracing::info;

/// Oldest GStreamer release whose splitmuxsink accepts `muxer-properties`.
pub const MIN_GST_VERSION: (u32, u32) = (1, 18);

/// Error types for startup checks
#[derive(Debug, Error)]
pub enum StartupError {
    #[error("GStreamer not available: {0}")]
    EngineUnavailable(String),

    #[error("GStreamer version requirement not met: {0}")]
    EngineVersion(String),

    #[error("Encoder '{element}' for backend {backend} not available: {detail}")]
    BackendUnavailable {
        backend: Backend,
        element: &'static str,
        detail: String,
    },
}

/// Parse `gst-launch-1.0 --version` output into (major, minor, patch).
///
/// Prefers the `GStreamer X.Y.Z` line and falls back to the tool's own
/// `version X.Y.Z` line.
pub fn parse_gst_version(version_output: &str) -> Option<(u32, u32, u32)> {
    let from_line = |line: &str, marker: &str| -> Option<(u32, u32, u32)> {
        let rest = line.split(marker).nth(1)?.trim();
        let token = rest.split_whitespace().next()?;
        let mut parts = token
            .split(|c: char| c == '.' || c == '-')
            .map(|p| p.parse::<u32>());
        let major = parts.next()?.ok()?;
        let minor = parts.next()?.ok()?;
        let patch = parts.next().and_then(|p| p.ok()).unwrap_or(0);
        Some((major, minor, patch))
    };

    version_output
        .lines()
        .find_map(|line| from_line(line, "GStreamer "))
        .or_else(|| version_output.lines().find_map(|line| from_line(line, "version ")))
}

/// Check that gst-launch runs and is recent enough; returns its version.
pub fn check_engine_available(program: &str) -> Result<(u32, u32, u32), StartupError> {
    let output = Command::new(program)
        .arg("--version")
        .output()
        .map_err(|e| {
            StartupError::EngineUnavailable(format!(
                "{} --version failed; install GStreamer 1.x and add it to PATH. Error: {}",
                program, e
            ))
        })?;

    if !output.status.success() {
        return Err(StartupError::EngineUnavailable(format!(
            "{} --version exited with {}",
            program, output.status
        )));
    }

    let text = String::from_utf8_lossy(&output.stdout);
    let version = parse_gst_version(&text).ok_or_else(|| {
        StartupError::EngineVersion(format!(
            "Could not parse version from output: {}",
            text.lines().next().unwrap_or("(empty)")
        ))
    })?;

    if (version.0, version.1) < MIN_GST_VERSION {
        return Err(StartupError::EngineVersion(format!(
            "GStreamer {}.{}+ required, got: {}.{}.{}",
            MIN_GST_VERSION.0, MIN_GST_VERSION.1, version.0, version.1, version.2
        )));
    }

    Ok(version)
}

/// Check that the encoder element for `backend` is installed.
pub fn check_backend_available(inspect_program: &str, backend: Backend) -> Result<(), StartupError> {
    let element = backend.element();
    let output = Command::new(inspect_program)
        .arg(element)
        .output()
        .map_err(|e| StartupError::BackendUnavailable {
            backend,
            element,
            detail: format!("{} could not be run: {}", inspect_program, e),
        })?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(StartupError::BackendUnavailable {
            backend,
            element,
            detail: stderr
                .lines()
                .find(|l| !l.trim().is_empty())
                .unwrap_or("no such element")
                .to_string(),
        });
    }

    Ok(())
}

/// Run all startup checks in order
pub fn run_startup_checks(cfg: &Config) -> Result<(), StartupError> {
    let (major, minor, patch) = check_engine_available(&cfg.tools.gst_launch)?;
    info!("GStreamer {}.{}.{}", major, minor, patch);
    check_backend_available(&cfg.tools.gst_inspect, cfg.encode.backend)?;
    info!(backend = %cfg.encode.backend, element = cfg.encode.backend.element(), "encoder available");
    Ok(())
}
