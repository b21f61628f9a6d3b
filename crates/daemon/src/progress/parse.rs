//! Classification of gst-launch output lines.

use once_cell::sync::Lazy;
use regex::Regex;

/// One classified line of engine output.
#[derive(Debug, Clone, PartialEq)]
pub enum OutputLine {
    /// Progress-probe report: input position and (possibly zero) duration
    Progress { position_secs: f64, duration_secs: f64 },
    /// Known state-change or informational text
    Status,
    /// Anything else non-empty is kept as potential error text
    Error(String),
    Empty,
}

/// Substrings of output lines that are routine engine status.
pub const BENIGN_MARKERS: &[&str] = &[
    "Setting pipeline to PAUSED",
    "Setting pipeline to PLAYING",
    "Setting pipeline to READY",
    "Setting pipeline to NULL",
    "Pipeline is PREROLLING",
    "Pipeline is PREROLLED",
    "Pipeline is live",
    "Prerolled, waiting for",
    "Redistribute latency",
    "New clock:",
    "Got context from element",
    "Got message #",
    "Got EOS from element",
    "EOS received",
    "EOS on shutdown enabled",
    "Waiting for EOS",
    "Execution ended after",
    "Freeing pipeline",
    "handling interrupt",
    "Interrupt: Stopping pipeline",
    "Progress: (",
    "Setting latency",
    "Use Windows high-resolution clock",
];

/// Substrings that identify an encoder element that could not be created.
pub const BACKEND_UNAVAILABLE_MARKERS: &[&str] = &[
    "no element \"",
    "could not create element",
    "Could not initialize",
    "Failed to open encoder",
    "No device available",
    "Device not found",
    "not supported by the device",
];

// progressreport0 (00:01:05): 65 / 7200 seconds ( 0.9 %)
static PROGRESS_LINE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^\s*\S+\s+\(\s*\d+:\d{2}:\d{2}\s*\):\s*(\d+(?:\.\d+)?)\s*/\s*(\d+(?:\.\d+)?)\s+seconds")
        .expect("valid regex")
});

/// Classify a single line of engine output.
pub fn classify_line(line: &str) -> OutputLine {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return OutputLine::Empty;
    }

    if let Some(caps) = PROGRESS_LINE.captures(trimmed) {
        let position = caps[1].parse::<f64>();
        let duration = caps[2].parse::<f64>();
        if let (Ok(position_secs), Ok(duration_secs)) = (position, duration) {
            return OutputLine::Progress {
                position_secs,
                duration_secs,
            };
        }
    }

    if BENIGN_MARKERS.iter().any(|m| trimmed.contains(m)) {
        return OutputLine::Status;
    }

    OutputLine::Error(trimmed.to_string())
}

/// Whether error text says the encoder backend is missing or unusable.
pub fn indicates_backend_unavailable(text: &str) -> bool {
    BACKEND_UNAVAILABLE_MARKERS.iter().any(|m| text.contains(m))
}

#[cfg(test)]
mod tests {
    use super::*;

    const SUCCESSFUL_RUN: &str = include_str!("../../fixtures/gst_launch_success.txt");
    const MISSING_ENCODER: &str = include_str!("../../fixtures/gst_launch_missing_encoder.txt");
    const DECODE_FAILURE: &str = include_str!("../../fixtures/gst_launch_decode_error.txt");

    fn progress_of(text: &str) -> Vec<(f64, f64)> {
        text.lines()
            .filter_map(|l| match classify_line(l) {
                OutputLine::Progress {
                    position_secs,
                    duration_secs,
                } => Some((position_secs, duration_secs)),
                _ => None,
            })
            .collect()
    }

    fn errors_of(text: &str) -> Vec<String> {
        text.lines()
            .filter_map(|l| match classify_line(l) {
                OutputLine::Error(e) => Some(e),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_progress_line() {
        assert_eq!(
            classify_line("progressreport0 (00:01:05): 65 / 7200 seconds ( 0.9 %)"),
            OutputLine::Progress {
                position_secs: 65.0,
                duration_secs: 7200.0
            }
        );
    }

    #[test]
    fn test_progress_line_without_duration() {
        assert_eq!(
            classify_line("progressreport0 (00:00:03): 3 / 0 seconds"),
            OutputLine::Progress {
                position_secs: 3.0,
                duration_secs: 0.0
            }
        );
    }

    #[test]
    fn test_status_and_empty_lines() {
        assert_eq!(classify_line("Setting pipeline to PAUSED ..."), OutputLine::Status);
        assert_eq!(classify_line("   "), OutputLine::Empty);
    }

    #[test]
    fn test_successful_run_fixture() {
        let progress = progress_of(SUCCESSFUL_RUN);
        assert_eq!(progress.len(), 5);
        assert_eq!(progress[0], (1.0, 7200.0));
        assert_eq!(progress[4], (5.0, 7200.0));
        assert!(errors_of(SUCCESSFUL_RUN).is_empty(), "{:?}", errors_of(SUCCESSFUL_RUN));
    }

    #[test]
    fn test_missing_encoder_fixture() {
        let errors = errors_of(MISSING_ENCODER);
        assert!(!errors.is_empty());
        assert!(errors.iter().any(|e| indicates_backend_unavailable(e)));
        assert!(progress_of(MISSING_ENCODER).is_empty());
    }

    #[test]
    fn test_decode_failure_fixture() {
        let errors = errors_of(DECODE_FAILURE);
        assert!(errors.iter().any(|e| e.contains("Internal data stream error")));
        assert!(!errors.iter().any(|e| indicates_backend_unavailable(e)));
        assert_eq!(progress_of(DECODE_FAILURE).len(), 2);
    }
}
