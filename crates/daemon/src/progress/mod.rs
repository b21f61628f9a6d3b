//! Progress tracking for one running encode.
//!
//! The progress probe's input position is the primary signal. Output chunk
//! files on disk only advance the chunk counter and feed the secondary
//! throughput figure.

pub mod chunks;
pub mod parse;
pub mod smoothing;

pub use chunks::{scan_chunks, ChunkScan, MAX_CHUNK_INDEX};
pub use parse::{classify_line, indicates_backend_unavailable, OutputLine};
pub use smoothing::SmoothingState;

use crate::rate_control::RateControlMode;
use crate::resolve::DurationEstimate;
use serde::Serialize;
use std::path::PathBuf;
use std::time::Duration;

/// File progress is held below this until the engine exits.
pub const MAX_RUNNING_PERCENT: u8 = 99;

/// Point-in-time view of a job's progress.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ProgressSnapshot {
    pub position_secs: f64,
    pub total_duration_secs: f64,
    /// Whether `total_duration_secs` is a size-based estimate
    pub duration_is_estimated: bool,
    pub file_percent: u8,
    pub current_chunk: u32,
    pub total_chunks: u32,
    /// Chunks fully written; every chunk before `current_chunk`
    pub completed_chunks: u32,
    pub chunk_percent: u8,
    pub smoothed_speed: Option<f64>,
    pub smoothed_eta_secs: Option<u64>,
    pub output_bytes_written: u64,
    pub output_throughput_bps: Option<f64>,
    pub elapsed_secs: f64,
}

/// Progress update published by a running job.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProgressEvent {
    pub input_path: PathBuf,
    pub mode: RateControlMode,
    pub snapshot: ProgressSnapshot,
}

fn total_chunks_for(duration_secs: f64, chunk_secs: f64) -> u32 {
    if duration_secs <= 0.0 || chunk_secs <= 0.0 {
        return 1;
    }
    ((duration_secs / chunk_secs).ceil() as u32).max(1)
}

/// Per-job progress state.
#[derive(Debug, Clone)]
pub struct ProgressTracker {
    chunk_secs: f64,
    snapshot: ProgressSnapshot,
    smoothing: SmoothingState,
    chunks_on_disk: u32,
    duration_adopted: bool,
}

impl ProgressTracker {
    pub fn new(estimate: &DurationEstimate, chunk_duration: Duration) -> Self {
        let chunk_secs = chunk_duration.as_secs_f64();
        let total_duration_secs = estimate.duration_secs.max(0.0);

        Self {
            chunk_secs,
            snapshot: ProgressSnapshot {
                total_duration_secs,
                duration_is_estimated: estimate.is_estimated,
                current_chunk: 1,
                total_chunks: total_chunks_for(total_duration_secs, chunk_secs),
                ..ProgressSnapshot::default()
            },
            smoothing: SmoothingState::default(),
            chunks_on_disk: 0,
            duration_adopted: false,
        }
    }

    pub fn snapshot(&self) -> &ProgressSnapshot {
        &self.snapshot
    }

    /// Handle one probe report.
    ///
    /// `reported_duration` is only honoured when the resolver had no duration
    /// at all, and then only the first time; an estimated duration is never
    /// replaced by the probe.
    pub fn on_position_update(
        &mut self,
        position_secs: f64,
        reported_duration: f64,
        elapsed: Duration,
    ) -> &ProgressSnapshot {
        let elapsed_secs = elapsed.as_secs_f64();
        self.snapshot.elapsed_secs = elapsed_secs;

        if !self.snapshot.duration_is_estimated
            && !self.duration_adopted
            && self.snapshot.total_duration_secs <= 0.0
            && reported_duration > 0.0
        {
            self.snapshot.total_duration_secs = reported_duration;
            self.snapshot.total_chunks = total_chunks_for(reported_duration, self.chunk_secs)
                .max(self.chunks_on_disk);
            self.duration_adopted = true;
        }

        // out-of-order reports never move progress backwards
        let position = position_secs.max(self.snapshot.position_secs);
        self.snapshot.position_secs = position;

        let duration = self.snapshot.total_duration_secs;
        if duration > 0.0 {
            let raw = (position / duration * 100.0).round().clamp(0.0, 100.0) as u8;
            let percent = raw.min(MAX_RUNNING_PERCENT);
            self.snapshot.file_percent = self.snapshot.file_percent.max(percent);
        }

        self.update_chunk_progress();

        self.snapshot.smoothed_speed =
            smoothing::update_speed(&mut self.smoothing, position, elapsed_secs);
        if duration > 0.0 {
            self.snapshot.smoothed_eta_secs = smoothing::update_eta(
                &mut self.smoothing,
                duration,
                position,
                elapsed_secs,
                self.snapshot.file_percent,
            );
        }

        &self.snapshot
    }

    /// Handle the result of polling the output directory.
    pub fn on_output_scan(&mut self, scan: &ChunkScan, elapsed: Duration) -> &ProgressSnapshot {
        let elapsed_secs = elapsed.as_secs_f64();
        self.snapshot.elapsed_secs = elapsed_secs;
        self.snapshot.output_bytes_written = scan.total_bytes;
        self.snapshot.output_throughput_bps =
            smoothing::update_throughput(&mut self.smoothing, scan.total_bytes, elapsed_secs);

        if scan.highest_index > self.chunks_on_disk {
            self.chunks_on_disk = scan.highest_index;
            self.snapshot.total_chunks = self.snapshot.total_chunks.max(scan.highest_index);
            self.update_chunk_progress();
        }

        &self.snapshot
    }

    /// Timer tick with no new probe data.
    pub fn on_tick(&mut self, elapsed: Duration) -> &ProgressSnapshot {
        self.snapshot.elapsed_secs = elapsed.as_secs_f64();
        &self.snapshot
    }

    /// Mark the encode finished; the only way to reach 100%.
    pub fn complete(&mut self) -> &ProgressSnapshot {
        self.snapshot.file_percent = 100;
        self.snapshot.chunk_percent = 100;
        self.snapshot.current_chunk = self.snapshot.total_chunks.max(self.chunks_on_disk).max(1);
        self.snapshot.total_chunks = self.snapshot.current_chunk;
        self.snapshot.completed_chunks = self.snapshot.total_chunks;
        if self.snapshot.total_duration_secs > 0.0 {
            self.snapshot.position_secs = self
                .snapshot
                .position_secs
                .max(self.snapshot.total_duration_secs);
        }
        self.snapshot.smoothed_eta_secs = Some(0);
        &self.snapshot
    }

    /// Time window `[start, end]` of chunk `index` (1-based).
    pub fn chunk_window(&self, index: u32) -> (f64, f64) {
        let start = f64::from(index.saturating_sub(1)) * self.chunk_secs;
        let mut end = f64::from(index) * self.chunk_secs;
        if self.snapshot.total_duration_secs > 0.0 {
            end = end.min(self.snapshot.total_duration_secs);
        }
        (start, end)
    }

    fn update_chunk_progress(&mut self) {
        let position = self.snapshot.position_secs;
        let total = self.snapshot.total_chunks.max(1);

        let by_position = if self.chunk_secs > 0.0 {
            ((position / self.chunk_secs).floor() as u32 + 1).min(total)
        } else {
            1
        };
        // a new file on disk means the previous chunk is finished
        let current = by_position.max(self.chunks_on_disk).max(1);

        if current > self.snapshot.current_chunk {
            self.snapshot.current_chunk = current;
            self.snapshot.completed_chunks = current - 1;
            self.snapshot.chunk_percent = 0;
        }

        let (start, end) = self.chunk_window(self.snapshot.current_chunk);
        if end > start {
            let within = ((position - start) / (end - start) * 100.0)
                .round()
                .clamp(0.0, f64::from(MAX_RUNNING_PERCENT)) as u8;
            self.snapshot.chunk_percent = self.snapshot.chunk_percent.max(within);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn trusted(duration_secs: f64) -> DurationEstimate {
        DurationEstimate {
            duration_secs,
            is_estimated: false,
            source_bitrate_kbps: Some(20_000.0),
        }
    }

    fn secs(s: u64) -> Duration {
        Duration::from_secs(s)
    }

    #[test]
    fn test_percent_clamped_below_completion() {
        let mut tracker = ProgressTracker::new(&trusted(100.0), secs(3600));
        tracker.on_position_update(50.0, 100.0, secs(5));
        assert_eq!(tracker.snapshot().file_percent, 50);

        tracker.on_position_update(100.0, 100.0, secs(10));
        assert_eq!(tracker.snapshot().file_percent, 99);

        tracker.complete();
        assert_eq!(tracker.snapshot().file_percent, 100);
    }

    #[test]
    fn test_out_of_order_positions_do_not_regress() {
        let mut tracker = ProgressTracker::new(&trusted(1000.0), secs(3600));
        tracker.on_position_update(300.0, 1000.0, secs(10));
        tracker.on_position_update(200.0, 1000.0, secs(11));
        assert_eq!(tracker.snapshot().position_secs, 300.0);
        assert_eq!(tracker.snapshot().file_percent, 30);
    }

    #[test]
    fn test_estimated_duration_not_overridden_by_probe() {
        let estimate = DurationEstimate {
            duration_secs: 6000.0,
            is_estimated: true,
            source_bitrate_kbps: None,
        };
        let mut tracker = ProgressTracker::new(&estimate, secs(3600));
        tracker.on_position_update(10.0, 30.0, secs(1));
        tracker.on_position_update(20.0, 30.0, secs(2));

        assert_eq!(tracker.snapshot().total_duration_secs, 6000.0);
        assert!(tracker.snapshot().duration_is_estimated);
        assert_eq!(tracker.snapshot().total_chunks, 2);
    }

    #[test]
    fn test_unknown_duration_adopted_once() {
        let mut tracker = ProgressTracker::new(&DurationEstimate::unknown(), secs(600));
        assert_eq!(tracker.snapshot().total_duration_secs, 0.0);

        tracker.on_position_update(1.0, 1800.0, secs(1));
        assert_eq!(tracker.snapshot().total_duration_secs, 1800.0);
        assert_eq!(tracker.snapshot().total_chunks, 3);

        tracker.on_position_update(2.0, 2400.0, secs(2));
        assert_eq!(tracker.snapshot().total_duration_secs, 1800.0);
    }

    #[test]
    fn test_trusted_duration_kept() {
        let mut tracker = ProgressTracker::new(&trusted(7200.0), secs(3600));
        tracker.on_position_update(10.0, 7000.0, secs(1));
        assert_eq!(tracker.snapshot().total_duration_secs, 7200.0);
    }

    #[test]
    fn test_two_hour_file_in_one_hour_chunks() {
        let mut tracker = ProgressTracker::new(&trusted(7200.0), secs(3600));
        assert_eq!(tracker.snapshot().total_chunks, 2);
        assert_eq!(tracker.chunk_window(2), (3600.0, 7200.0));

        tracker.on_position_update(1800.0, 7200.0, secs(600));
        assert_eq!(tracker.snapshot().current_chunk, 1);
        assert_eq!(tracker.snapshot().chunk_percent, 50);

        tracker.on_position_update(3600.0, 7200.0, secs(1200));
        assert_eq!(tracker.snapshot().current_chunk, 2);
        assert_eq!(tracker.snapshot().chunk_percent, 0);

        tracker.on_position_update(5400.0, 7200.0, secs(1800));
        assert_eq!(tracker.snapshot().current_chunk, 2);
        assert_eq!(tracker.snapshot().chunk_percent, 50);
        assert_eq!(tracker.snapshot().file_percent, 75);
    }

    #[test]
    fn test_last_chunk_window_is_clipped() {
        let tracker = ProgressTracker::new(&trusted(5400.0), secs(3600));
        assert_eq!(tracker.snapshot().total_chunks, 2);
        assert_eq!(tracker.chunk_window(2), (3600.0, 5400.0));
    }

    #[test]
    fn test_new_chunk_on_disk_advances_chunk() {
        let mut tracker = ProgressTracker::new(&trusted(7200.0), secs(3600));
        tracker.on_position_update(3500.0, 7200.0, secs(100));
        assert_eq!(tracker.snapshot().current_chunk, 1);

        let scan = ChunkScan {
            highest_index: 2,
            total_bytes: 4096,
            chunks: vec![],
        };
        tracker.on_output_scan(&scan, secs(101));
        assert_eq!(tracker.snapshot().current_chunk, 2);
        assert_eq!(tracker.snapshot().output_bytes_written, 4096);
    }

    #[test]
    fn test_finished_chunks_counted() {
        let mut tracker = ProgressTracker::new(&trusted(7200.0), secs(3600));
        tracker.on_position_update(1800.0, 7200.0, secs(600));
        assert_eq!(tracker.snapshot().completed_chunks, 0);

        let scan = ChunkScan {
            highest_index: 2,
            total_bytes: 8192,
            chunks: vec![],
        };
        tracker.on_output_scan(&scan, secs(601));
        assert_eq!(tracker.snapshot().current_chunk, 2);
        assert_eq!(tracker.snapshot().completed_chunks, 1);
        assert_eq!(tracker.snapshot().chunk_percent, 0);

        tracker.complete();
        assert_eq!(tracker.snapshot().completed_chunks, 2);
        assert_eq!(tracker.snapshot().chunk_percent, 100);
    }

    #[test]
    fn test_eta_appears_after_gates() {
        let mut tracker = ProgressTracker::new(&trusted(1000.0), secs(3600));
        // 2x realtime
        for t in 1..=9u64 {
            tracker.on_position_update(2.0 * t as f64, 1000.0, secs(t));
            assert_eq!(tracker.snapshot().smoothed_eta_secs, None);
        }
        for t in 15..=20u64 {
            tracker.on_position_update(2.0 * t as f64, 1000.0, secs(t));
        }
        let eta = tracker.snapshot().smoothed_eta_secs.unwrap();
        assert_eq!(eta % 5, 0);
        assert!(eta > 400 && eta < 500, "eta {}", eta);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        // File percent never decreases, whatever order positions arrive in.
        #[test]
        fn prop_percent_monotonic(
            duration in 1.0f64..100_000.0,
            fractions in prop::collection::vec(0.0f64..=1.0, 1..50),
        ) {
            let mut tracker = ProgressTracker::new(&trusted(duration), secs(3600));
            let mut last = 0u8;
            for (i, f) in fractions.iter().enumerate() {
                let snap = tracker.on_position_update(duration * f, duration, secs(i as u64 + 1));
                prop_assert!(snap.file_percent >= last);
                prop_assert!(snap.file_percent <= MAX_RUNNING_PERCENT);
                last = snap.file_percent;
            }
        }

        // Probe durations never replace an estimated duration.
        #[test]
        fn prop_estimate_authoritative(
            estimate in 60.0f64..100_000.0,
            reported in 0.0f64..100_000.0,
        ) {
            let est = DurationEstimate {
                duration_secs: estimate,
                is_estimated: true,
                source_bitrate_kbps: None,
            };
            let mut tracker = ProgressTracker::new(&est, secs(3600));
            tracker.on_position_update(1.0, reported, secs(1));
            prop_assert_eq!(tracker.snapshot().total_duration_secs, estimate);
        }
    }
}
