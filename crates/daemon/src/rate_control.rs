//! Rate-control planning.
//!
//! Turns a compression ratio into encoder properties. A trusted duration
//! selects the bitrate regime (target = source bitrate / ratio); an estimated
//! duration selects the quality regime, since size targeting would be built
//! on the same corrupt metadata.

use crate::config::Backend;
use crate::request::TranscodeRequest;
use crate::resolve::{DurationEstimate, ASSUMED_BITRATE_KBPS};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

/// Hard ceiling of the VideoToolbox encoder.
pub const VTENC_MAX_BITRATE_KBPS: u32 = 100_000;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PlanError {
    #[error("no compression ratio configured; set encode.compression_ratio")]
    MissingCompressionRatio,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RateControlMode {
    Bitrate,
    Quality,
}

impl RateControlMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            RateControlMode::Bitrate => "bitrate",
            RateControlMode::Quality => "quality",
        }
    }
}

/// Quality value in the scale of the backend family.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum QualityValue {
    /// Quantizer-like scale where lower means better
    Level(u32),
    /// Normalized 0..=1 scale where higher means better
    Normalized(f32),
}

/// Exactly one regime's parameters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RateControl {
    Bitrate { target_kbps: u32 },
    Quality { value: QualityValue },
}

/// Concrete encoder parameters for one request.
#[derive(Debug, Clone, PartialEq)]
pub struct RateControlPlan {
    pub control: RateControl,
    /// Ordered encoder element properties
    pub backend_args: Vec<(String, String)>,
}

impl RateControlPlan {
    pub fn mode(&self) -> RateControlMode {
        match self.control {
            RateControl::Bitrate { .. } => RateControlMode::Bitrate,
            RateControl::Quality { .. } => RateControlMode::Quality,
        }
    }

    pub fn target_bitrate_kbps(&self) -> Option<u32> {
        match self.control {
            RateControl::Bitrate { target_kbps } => Some(target_kbps),
            RateControl::Quality { .. } => None,
        }
    }
}

/// Ratio buckets of the quality regime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QualityTier {
    NearLossless,
    High,
    Good,
    Balanced,
    Compact,
    Maximum,
}

impl QualityTier {
    pub fn for_ratio(ratio: u32) -> Self {
        match ratio {
            0..=1 => QualityTier::NearLossless,
            2 => QualityTier::High,
            3..=4 => QualityTier::Good,
            5 => QualityTier::Balanced,
            6..=10 => QualityTier::Compact,
            _ => QualityTier::Maximum,
        }
    }

    fn index(self) -> usize {
        self as usize
    }
}

/// Quality scale families shared by several backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QualityFamily {
    /// Constant QP (lower is better)
    Qp,
    /// x264 constant quality quantizer (lower is better)
    Crf,
    /// Normalized 0..1 quality (higher is better)
    Normalized,
    /// Intel intelligent constant quality (lower is better)
    Icq,
}

const QP_TABLE: [u32; 6] = [18, 22, 26, 28, 32, 36];
const CRF_TABLE: [u32; 6] = [16, 20, 23, 26, 30, 35];
const ICQ_TABLE: [u32; 6] = [18, 22, 25, 28, 32, 38];
const NORMALIZED_TABLE: [f32; 6] = [0.95, 0.85, 0.75, 0.65, 0.50, 0.35];

impl QualityFamily {
    pub fn of(backend: Backend) -> Self {
        match backend {
            Backend::X264 => QualityFamily::Crf,
            Backend::Nvenc | Backend::Va => QualityFamily::Qp,
            Backend::Qsv => QualityFamily::Icq,
            Backend::Vtenc => QualityFamily::Normalized,
        }
    }

    pub fn value(self, tier: QualityTier) -> QualityValue {
        let i = tier.index();
        match self {
            QualityFamily::Qp => QualityValue::Level(QP_TABLE[i]),
            QualityFamily::Crf => QualityValue::Level(CRF_TABLE[i]),
            QualityFamily::Icq => QualityValue::Level(ICQ_TABLE[i]),
            QualityFamily::Normalized => QualityValue::Normalized(NORMALIZED_TABLE[i]),
        }
    }
}

/// Bitrate target for the trusted-duration regime.
pub fn target_bitrate_kbps(source_bitrate_kbps: Option<f64>, ratio: u32) -> u32 {
    let source = source_bitrate_kbps.unwrap_or(ASSUMED_BITRATE_KBPS);
    (source / f64::from(ratio.max(1))).round().max(1.0) as u32
}

fn kv(key: &str, value: impl ToString) -> (String, String) {
    (key.to_string(), value.to_string())
}

fn level(value: QualityValue) -> u32 {
    match value {
        QualityValue::Level(v) => v,
        QualityValue::Normalized(q) => ((1.0 - q) * 51.0).round() as u32,
    }
}

/// Per-backend property shapes for both regimes.
trait BackendStrategy {
    fn bitrate_args(&self, target_kbps: u32) -> Vec<(String, String)>;
    fn quality_args(&self, value: QualityValue) -> Vec<(String, String)>;
    /// Property receiving the speed preset, if the encoder has one
    fn preset_key(&self) -> Option<&'static str>;
    fn max_bitrate_kbps(&self) -> Option<u32> {
        None
    }
}

struct X264;
struct Nvenc;
struct Qsv;
struct Va;
struct Vtenc;

impl BackendStrategy for X264 {
    fn bitrate_args(&self, target_kbps: u32) -> Vec<(String, String)> {
        vec![
            kv("pass", "cbr"),
            kv("bitrate", target_kbps),
            kv("vbv-buf-capacity", 2000),
        ]
    }

    fn quality_args(&self, value: QualityValue) -> Vec<(String, String)> {
        vec![kv("pass", "qual"), kv("quantizer", level(value))]
    }

    fn preset_key(&self) -> Option<&'static str> {
        Some("speed-preset")
    }
}

impl BackendStrategy for Nvenc {
    fn bitrate_args(&self, target_kbps: u32) -> Vec<(String, String)> {
        vec![
            kv("rc-mode", "vbr"),
            kv("bitrate", target_kbps),
            kv("max-bitrate", target_kbps.saturating_mul(3) / 2),
            kv("vbv-buffer-size", target_kbps.saturating_mul(2)),
        ]
    }

    fn quality_args(&self, value: QualityValue) -> Vec<(String, String)> {
        let qp = level(value);
        vec![
            kv("rc-mode", "cqp"),
            kv("qp-i", qp),
            kv("qp-p", qp),
            kv("qp-b", qp),
        ]
    }

    fn preset_key(&self) -> Option<&'static str> {
        Some("preset")
    }
}

impl BackendStrategy for Qsv {
    fn bitrate_args(&self, target_kbps: u32) -> Vec<(String, String)> {
        vec![
            kv("rate-control", "vbr"),
            kv("bitrate", target_kbps),
            kv("max-bitrate", target_kbps.saturating_mul(3) / 2),
        ]
    }

    fn quality_args(&self, value: QualityValue) -> Vec<(String, String)> {
        vec![kv("rate-control", "icq"), kv("icq-quality", level(value))]
    }

    fn preset_key(&self) -> Option<&'static str> {
        Some("target-usage")
    }
}

impl BackendStrategy for Va {
    fn bitrate_args(&self, target_kbps: u32) -> Vec<(String, String)> {
        vec![
            kv("rate-control", "vbr"),
            kv("bitrate", target_kbps),
            kv("cpb-size", target_kbps.saturating_mul(2)),
        ]
    }

    fn quality_args(&self, value: QualityValue) -> Vec<(String, String)> {
        let qp = level(value);
        vec![
            kv("rate-control", "cqp"),
            kv("qpi", qp),
            kv("qpp", qp),
            kv("qpb", qp),
        ]
    }

    fn preset_key(&self) -> Option<&'static str> {
        Some("target-usage")
    }
}

impl BackendStrategy for Vtenc {
    fn bitrate_args(&self, target_kbps: u32) -> Vec<(String, String)> {
        vec![kv("bitrate", target_kbps)]
    }

    fn quality_args(&self, value: QualityValue) -> Vec<(String, String)> {
        let q = match value {
            QualityValue::Normalized(q) => q,
            QualityValue::Level(l) => 1.0 - (l as f32 / 51.0),
        };
        vec![kv("quality", format!("{:.2}", q))]
    }

    fn preset_key(&self) -> Option<&'static str> {
        None
    }

    fn max_bitrate_kbps(&self) -> Option<u32> {
        Some(VTENC_MAX_BITRATE_KBPS)
    }
}

fn strategy(backend: Backend) -> &'static dyn BackendStrategy {
    match backend {
        Backend::X264 => &X264,
        Backend::Nvenc => &Nvenc,
        Backend::Qsv => &Qsv,
        Backend::Va => &Va,
        Backend::Vtenc => &Vtenc,
    }
}

/// Compute the rate-control plan for one request.
pub fn plan(
    request: &TranscodeRequest,
    estimate: &DurationEstimate,
) -> Result<RateControlPlan, PlanError> {
    let ratio = request
        .compression_ratio()
        .ok_or(PlanError::MissingCompressionRatio)?
        .get();
    let backend = request.backend();
    let strategy = strategy(backend);

    let (control, mut backend_args) = if estimate.is_estimated {
        let value = QualityFamily::of(backend).value(QualityTier::for_ratio(ratio));
        (RateControl::Quality { value }, strategy.quality_args(value))
    } else {
        let mut target_kbps = target_bitrate_kbps(estimate.source_bitrate_kbps, ratio);
        if let Some(ceiling) = strategy.max_bitrate_kbps() {
            if target_kbps > ceiling {
                warn!(
                    backend = %backend,
                    requested_kbps = target_kbps,
                    ceiling_kbps = ceiling,
                    "target bitrate above encoder ceiling, clamping"
                );
                target_kbps = ceiling;
            }
        }
        (
            RateControl::Bitrate { target_kbps },
            strategy.bitrate_args(target_kbps),
        )
    };

    if let Some(preset) = request.speed_preset() {
        match strategy.preset_key() {
            Some(key) => backend_args.push(kv(key, preset)),
            None => warn!(backend = %backend, preset, "backend has no speed preset, ignoring"),
        }
    }

    Ok(RateControlPlan {
        control,
        backend_args,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Container, SUPPORTED_RATIOS};
    use crate::request::{CompressionRatio, EncodeSettings};
    use proptest::prelude::*;
    use std::path::PathBuf;
    use std::time::Duration;

    fn request(backend: Backend, ratio: Option<u32>, preset: Option<&str>) -> TranscodeRequest {
        TranscodeRequest::new(
            PathBuf::from("/in/movie.mkv"),
            PathBuf::from("/out"),
            EncodeSettings {
                chunk_duration: Duration::from_secs(3600),
                container: Container::Mkv,
                backend,
                compression_ratio: ratio.map(|r| CompressionRatio::try_from(r).unwrap()),
                speed_preset: preset.map(String::from),
            },
        )
    }

    fn trusted(kbps: f64) -> DurationEstimate {
        DurationEstimate {
            duration_secs: 3600.0,
            is_estimated: false,
            source_bitrate_kbps: Some(kbps),
        }
    }

    fn estimated() -> DurationEstimate {
        DurationEstimate {
            duration_secs: 6000.0,
            is_estimated: true,
            source_bitrate_kbps: Some(ASSUMED_BITRATE_KBPS),
        }
    }

    fn arg<'a>(plan: &'a RateControlPlan, key: &str) -> Option<&'a str> {
        plan.backend_args
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    #[test]
    fn test_bitrate_regime_halves_source() {
        let plan = plan(&request(Backend::X264, Some(2), None), &trusted(20_000.0)).unwrap();
        assert_eq!(plan.mode(), RateControlMode::Bitrate);
        assert_eq!(plan.target_bitrate_kbps(), Some(10_000));
        assert_eq!(arg(&plan, "bitrate"), Some("10000"));
        assert_eq!(arg(&plan, "pass"), Some("cbr"));
    }

    #[test]
    fn test_bitrate_regime_exact_for_all_ratios() {
        for &ratio in SUPPORTED_RATIOS {
            for source in [20_000.0, 8_500.0, 111_111.11, 3_333.0] {
                let plan = plan(&request(Backend::Nvenc, Some(ratio), None), &trusted(source))
                    .unwrap();
                let expected = (source / ratio as f64).round() as u32;
                assert_eq!(plan.target_bitrate_kbps(), Some(expected));
            }
        }
    }

    #[test]
    fn test_missing_source_bitrate_uses_assumed() {
        let estimate = DurationEstimate {
            duration_secs: 600.0,
            is_estimated: false,
            source_bitrate_kbps: None,
        };
        let plan = plan(&request(Backend::Qsv, Some(4), None), &estimate).unwrap();
        assert_eq!(plan.target_bitrate_kbps(), Some(5_000));
    }

    #[test]
    fn test_estimated_duration_selects_quality() {
        for backend in Backend::ALL {
            let plan = plan(&request(backend, Some(2), None), &estimated()).unwrap();
            assert_eq!(plan.mode(), RateControlMode::Quality);
            assert_eq!(plan.target_bitrate_kbps(), None);
            assert!(arg(&plan, "bitrate").is_none(), "{:?} leaked a bitrate", backend);
        }
    }

    #[test]
    fn test_quality_tables_per_family() {
        let x264 = plan(&request(Backend::X264, Some(1), None), &estimated()).unwrap();
        assert_eq!(arg(&x264, "quantizer"), Some("16"));

        let nvenc = plan(&request(Backend::Nvenc, Some(10), None), &estimated()).unwrap();
        assert_eq!(arg(&nvenc, "rc-mode"), Some("cqp"));
        assert_eq!(arg(&nvenc, "qp-i"), Some("32"));

        let qsv = plan(&request(Backend::Qsv, Some(20), None), &estimated()).unwrap();
        assert_eq!(arg(&qsv, "icq-quality"), Some("38"));

        let vt = plan(&request(Backend::Vtenc, Some(3), None), &estimated()).unwrap();
        assert_eq!(arg(&vt, "quality"), Some("0.75"));
    }

    #[test]
    fn test_quality_tiers() {
        assert_eq!(QualityTier::for_ratio(1), QualityTier::NearLossless);
        assert_eq!(QualityTier::for_ratio(2), QualityTier::High);
        assert_eq!(QualityTier::for_ratio(3), QualityTier::Good);
        assert_eq!(QualityTier::for_ratio(4), QualityTier::Good);
        assert_eq!(QualityTier::for_ratio(5), QualityTier::Balanced);
        assert_eq!(QualityTier::for_ratio(10), QualityTier::Compact);
        assert_eq!(QualityTier::for_ratio(20), QualityTier::Maximum);
    }

    #[test]
    fn test_vtenc_bitrate_ceiling() {
        let plan = plan(&request(Backend::Vtenc, Some(1), None), &trusted(400_000.0)).unwrap();
        assert_eq!(plan.target_bitrate_kbps(), Some(VTENC_MAX_BITRATE_KBPS));
        assert_eq!(arg(&plan, "bitrate"), Some("100000"));
    }

    #[test]
    fn test_missing_ratio_is_plan_error() {
        let result = plan(&request(Backend::X264, None, None), &trusted(20_000.0));
        assert_eq!(result, Err(PlanError::MissingCompressionRatio));
    }

    #[test]
    fn test_speed_preset_appended() {
        let plan = plan(
            &request(Backend::X264, Some(4), Some("veryfast")),
            &trusted(20_000.0),
        )
        .unwrap();
        assert_eq!(plan.backend_args.last(), Some(&kv("speed-preset", "veryfast")));

        let vt = plan_without_preset_key();
        assert!(vt.backend_args.iter().all(|(k, _)| k != "preset"));
    }

    fn plan_without_preset_key() -> RateControlPlan {
        plan(&request(Backend::Vtenc, Some(4), Some("fast")), &trusted(20_000.0)).unwrap()
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        #[test]
        fn prop_regime_follows_estimate_flag(
            backend in prop::sample::select(Backend::ALL.to_vec()),
            ratio in prop::sample::select(SUPPORTED_RATIOS.to_vec()),
            kbps in 100.0f64..400_000.0,
            is_estimated in proptest::bool::ANY,
        ) {
            let estimate = DurationEstimate {
                duration_secs: 1000.0,
                is_estimated,
                source_bitrate_kbps: Some(kbps),
            };
            let plan = plan(&request(backend, Some(ratio), None), &estimate).unwrap();
            if is_estimated {
                prop_assert_eq!(plan.mode(), RateControlMode::Quality);
            } else {
                prop_assert_eq!(plan.mode(), RateControlMode::Bitrate);
            }
            prop_assert!(!plan.backend_args.is_empty());
        }
    }
}
