//! Per-file transcoding intent.

use crate::config::{Backend, Config, Container, SUPPORTED_RATIOS};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
#[error("compression ratio {0} is not one of {supported:?}", supported = SUPPORTED_RATIOS)]
pub struct UnsupportedRatio(pub u32);

/// Target input/output size ratio, restricted to the supported set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "u32", into = "u32")]
pub struct CompressionRatio(u32);

impl CompressionRatio {
    pub fn get(self) -> u32 {
        self.0
    }
}

impl TryFrom<u32> for CompressionRatio {
    type Error = UnsupportedRatio;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        if SUPPORTED_RATIOS.contains(&value) {
            Ok(Self(value))
        } else {
            Err(UnsupportedRatio(value))
        }
    }
}

impl From<CompressionRatio> for u32 {
    fn from(ratio: CompressionRatio) -> u32 {
        ratio.0
    }
}

/// Encoding settings shared by every request the queue creates.
#[derive(Debug, Clone, PartialEq)]
pub struct EncodeSettings {
    pub chunk_duration: Duration,
    pub container: Container,
    pub backend: Backend,
    /// Required for planning; a missing ratio fails the job without retry
    pub compression_ratio: Option<CompressionRatio>,
    pub speed_preset: Option<String>,
}

impl EncodeSettings {
    pub fn from_config(config: &Config) -> Result<Self, UnsupportedRatio> {
        let compression_ratio = config
            .encode
            .compression_ratio
            .map(CompressionRatio::try_from)
            .transpose()?;

        Ok(Self {
            chunk_duration: Duration::from_secs(
                u64::from(config.encode.chunk_duration_minutes) * 60,
            ),
            container: config.encode.container,
            backend: config.encode.backend,
            compression_ratio,
            speed_preset: config.encode.speed_preset.clone(),
        })
    }
}

/// Immutable per-file transcoding request.
#[derive(Debug, Clone, PartialEq)]
pub struct TranscodeRequest {
    input_path: PathBuf,
    output_dir: PathBuf,
    settings: EncodeSettings,
}

impl TranscodeRequest {
    pub fn new(input_path: PathBuf, output_dir: PathBuf, settings: EncodeSettings) -> Self {
        Self {
            input_path,
            output_dir,
            settings,
        }
    }

    pub fn input_path(&self) -> &Path {
        &self.input_path
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    pub fn chunk_duration(&self) -> Duration {
        self.settings.chunk_duration
    }

    pub fn container(&self) -> Container {
        self.settings.container
    }

    pub fn backend(&self) -> Backend {
        self.settings.backend
    }

    pub fn compression_ratio(&self) -> Option<CompressionRatio> {
        self.settings.compression_ratio
    }

    pub fn speed_preset(&self) -> Option<&str> {
        self.settings.speed_preset.as_deref()
    }

    /// File stem used to name the output chunks.
    pub fn base_name(&self) -> String {
        self.input_path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "output".to_string())
    }
}
