//! Speed, ETA and throughput smoothing.
//!
//! All accumulators live in [`SmoothingState`], one per job; the update
//! functions are pure apart from mutating that state.

/// Weight of the previous speed value in the exponential average.
pub const SPEED_PREVIOUS_WEIGHT: f64 = 0.9;

/// Weight of the previous throughput value in the exponential average.
pub const THROUGHPUT_PREVIOUS_WEIGHT: f64 = 0.7;

/// Weight of the previous ETA when the new estimate is lower.
pub const ETA_DECREASE_PREVIOUS_WEIGHT: f64 = 0.95;

/// Weight of the previous ETA when the new estimate is sufficiently higher.
pub const ETA_INCREASE_PREVIOUS_WEIGHT: f64 = 0.9;

/// Relative rise a raw ETA must exceed before the smoothed ETA moves up.
pub const ETA_INCREASE_THRESHOLD: f64 = 0.10;

/// No ETA before this much wall-clock time has passed.
pub const ETA_MIN_ELAPSED_SECS: f64 = 10.0;

/// No ETA before the file is this far along.
pub const ETA_MIN_PERCENT: u8 = 3;

/// Displayed ETA granularity.
pub const ETA_DISPLAY_STEP_SECS: u64 = 5;

/// Consecutive stable samples required before an ETA is displayed.
pub const ETA_STABLE_SAMPLES: u32 = 2;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SmoothingState {
    /// Smoothed speed multiplier (input seconds per wall-clock second)
    pub speed: Option<f64>,
    /// Smoothed, unrounded ETA in seconds
    pub eta_secs: Option<f64>,
    /// ETA currently shown, rounded to [`ETA_DISPLAY_STEP_SECS`]
    pub displayed_eta_secs: Option<u64>,
    /// Smoothed output growth in bytes per second
    pub throughput_bps: Option<f64>,
    last_rounded_eta: Option<u64>,
    stable_samples: u32,
    last_output: Option<(u64, f64)>,
}

fn ema(previous: Option<f64>, sample: f64, previous_weight: f64) -> f64 {
    match previous {
        Some(prev) => prev * previous_weight + sample * (1.0 - previous_weight),
        None => sample,
    }
}

/// Round seconds to the nearest display step.
pub fn round_eta(secs: f64) -> u64 {
    let step = ETA_DISPLAY_STEP_SECS as f64;
    ((secs.max(0.0) / step).round() * step) as u64
}

/// Apply the asymmetric ETA blend to one raw estimate.
///
/// Lower estimates pull the value down slowly; higher estimates are ignored
/// unless they exceed the current value by more than
/// [`ETA_INCREASE_THRESHOLD`].
pub fn smooth_eta(previous: Option<f64>, raw: f64) -> f64 {
    let Some(prev) = previous else {
        return raw;
    };

    if raw < prev {
        prev * ETA_DECREASE_PREVIOUS_WEIGHT + raw * (1.0 - ETA_DECREASE_PREVIOUS_WEIGHT)
    } else if raw > prev * (1.0 + ETA_INCREASE_THRESHOLD) {
        prev * ETA_INCREASE_PREVIOUS_WEIGHT + raw * (1.0 - ETA_INCREASE_PREVIOUS_WEIGHT)
    } else {
        prev
    }
}

/// Fold a new speed sample (`position / elapsed`) into the state.
pub fn update_speed(state: &mut SmoothingState, position_secs: f64, elapsed_secs: f64) -> Option<f64> {
    if elapsed_secs > 0.0 && position_secs >= 0.0 {
        let sample = position_secs / elapsed_secs;
        state.speed = Some(ema(state.speed, sample, SPEED_PREVIOUS_WEIGHT));
    }
    state.speed
}

/// Fold a new ETA sample into the state and return the displayed ETA.
///
/// Nothing is computed until both the elapsed-time and progress gates pass.
pub fn update_eta(
    state: &mut SmoothingState,
    duration_secs: f64,
    position_secs: f64,
    elapsed_secs: f64,
    file_percent: u8,
) -> Option<u64> {
    if elapsed_secs < ETA_MIN_ELAPSED_SECS || file_percent < ETA_MIN_PERCENT {
        return state.displayed_eta_secs;
    }
    let speed = match state.speed {
        Some(s) if s > 0.0 => s,
        _ => return state.displayed_eta_secs,
    };

    let raw = (duration_secs - position_secs).max(0.0) / speed;
    let smoothed = smooth_eta(state.eta_secs, raw);
    state.eta_secs = Some(smoothed);

    let rounded = round_eta(smoothed);
    let stable = state
        .last_rounded_eta
        .map(|prev| prev.abs_diff(rounded) <= ETA_DISPLAY_STEP_SECS)
        .unwrap_or(false);

    state.stable_samples = if stable { state.stable_samples + 1 } else { 0 };
    state.last_rounded_eta = Some(rounded);

    if state.stable_samples >= ETA_STABLE_SAMPLES {
        state.displayed_eta_secs = Some(rounded);
    }
    state.displayed_eta_secs
}

/// Fold the current total output size into the throughput average.
pub fn update_throughput(state: &mut SmoothingState, total_bytes: u64, elapsed_secs: f64) -> Option<f64> {
    if let Some((prev_bytes, prev_elapsed)) = state.last_output {
        let dt = elapsed_secs - prev_elapsed;
        if dt > 0.0 && total_bytes >= prev_bytes {
            let sample = (total_bytes - prev_bytes) as f64 / dt;
            state.throughput_bps = Some(ema(state.throughput_bps, sample, THROUGHPUT_PREVIOUS_WEIGHT));
        }
    }
    state.last_output = Some((total_bytes, elapsed_secs));
    state.throughput_bps
}
