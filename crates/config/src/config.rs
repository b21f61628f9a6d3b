//! Core configuration structures and loading logic

use serde::{Deserialize, Serialize};
use std::env;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use thiserror::Error;

/// Compression ratios accepted by the rate-control planner.
pub const SUPPORTED_RATIOS: &[u32] = &[1, 2, 3, 4, 5, 10, 20];

/// Error type for configuration operations
#[derive(Debug, Error)]
pub enum ConfigError {
    /// IO error reading config file
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    /// TOML parsing error
    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    /// Semantically invalid value
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Encoding backend, one per encoder element family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    /// Software H.264 via x264enc
    #[default]
    X264,
    /// NVIDIA NVENC via nvh264enc
    Nvenc,
    /// Intel Quick Sync via qsvh264enc
    Qsv,
    /// VA-API via vah264enc
    Va,
    /// Apple VideoToolbox via vtenc_h264
    Vtenc,
}

impl Backend {
    pub const ALL: [Backend; 5] = [
        Backend::X264,
        Backend::Nvenc,
        Backend::Qsv,
        Backend::Va,
        Backend::Vtenc,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Backend::X264 => "x264",
            Backend::Nvenc => "nvenc",
            Backend::Qsv => "qsv",
            Backend::Va => "va",
            Backend::Vtenc => "vtenc",
        }
    }

    /// GStreamer element name of the encoder.
    pub fn element(&self) -> &'static str {
        match self {
            Backend::X264 => "x264enc",
            Backend::Nvenc => "nvh264enc",
            Backend::Qsv => "qsvh264enc",
            Backend::Va => "vah264enc",
            Backend::Vtenc => "vtenc_h264",
        }
    }

    pub fn is_hardware(&self) -> bool {
        !matches!(self, Backend::X264)
    }
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Backend {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Backend::ALL
            .into_iter()
            .find(|b| b.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| ConfigError::Invalid(format!("unknown backend '{}'", s)))
    }
}

/// Output container of the chunk files.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Container {
    #[default]
    Mkv,
    Mp4,
    Ts,
}

impl Container {
    pub const ALL: [Container; 3] = [Container::Mkv, Container::Mp4, Container::Ts];

    /// File extension without the leading dot.
    pub fn extension(&self) -> &'static str {
        match self {
            Container::Mkv => "mkv",
            Container::Mp4 => "mp4",
            Container::Ts => "ts",
        }
    }

    /// GStreamer muxer element used inside the chunk sink.
    pub fn muxer(&self) -> &'static str {
        match self {
            Container::Mkv => "matroskamux",
            Container::Mp4 => "mp4mux",
            Container::Ts => "mpegtsmux",
        }
    }
}

impl fmt::Display for Container {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.extension())
    }
}

impl FromStr for Container {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Container::ALL
            .into_iter()
            .find(|c| c.extension().eq_ignore_ascii_case(s.trim().trim_start_matches('.')))
            .ok_or_else(|| ConfigError::Invalid(format!("unknown container '{}'", s)))
    }
}

/// Directory layout
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct PathsConfig {
    /// Directory scanned (and optionally watched) for source files
    #[serde(default)]
    pub input_dir: PathBuf,
    /// Root directory for encoded chunks
    #[serde(default)]
    pub output_dir: PathBuf,
    /// Where completed sources are moved (kept in place if None)
    pub processed_dir: Option<PathBuf>,
    /// Where sources are moved after terminal failure (kept in place if None)
    pub failed_dir: Option<PathBuf>,
}

/// Encoding intent shared by every job
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EncodeConfig {
    #[serde(default)]
    pub backend: Backend,
    #[serde(default)]
    pub container: Container,
    /// Target input/output size ratio; required before any job can be planned
    pub compression_ratio: Option<u32>,
    #[serde(default = "default_chunk_duration_minutes")]
    pub chunk_duration_minutes: u32,
    /// Backend-specific speed/quality preset passed through to the encoder
    pub speed_preset: Option<String>,
}

fn default_chunk_duration_minutes() -> u32 {
    60
}

impl Default for EncodeConfig {
    fn default() -> Self {
        Self {
            backend: Backend::default(),
            container: Container::default(),
            compression_ratio: None,
            chunk_duration_minutes: default_chunk_duration_minutes(),
            speed_preset: None,
        }
    }
}

/// Processing queue configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QueueConfig {
    /// Maximum concurrent jobs (0 = auto-derive)
    #[serde(default)]
    pub max_concurrent_jobs: u32,
    /// Attempts per job before it is marked failed
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Delay before a failed attempt becomes eligible again (0 = immediate)
    #[serde(default)]
    pub retry_backoff_secs: u64,
}

fn default_max_retries() -> u32 {
    3
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_concurrent_jobs: 0,
            max_retries: default_max_retries(),
            retry_backoff_secs: 0,
        }
    }
}

/// Directory-watch configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WatchConfig {
    #[serde(default)]
    pub enabled: bool,
    /// Seconds a file size must stay unchanged before it is enqueued
    #[serde(default = "default_stability_secs")]
    pub stability_secs: u64,
}

fn default_stability_secs() -> u64 {
    5
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            stability_secs: default_stability_secs(),
        }
    }
}

/// External executables
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolsConfig {
    #[serde(default = "default_gst_launch")]
    pub gst_launch: String,
    #[serde(default = "default_gst_discoverer")]
    pub gst_discoverer: String,
    #[serde(default = "default_gst_inspect")]
    pub gst_inspect: String,
    /// Secondary duration discovery tool
    #[serde(default = "default_ffprobe")]
    pub ffprobe: String,
}

fn default_gst_launch() -> String {
    "gst-launch-1.0".to_string()
}

fn default_gst_discoverer() -> String {
    "gst-discoverer-1.0".to_string()
}

fn default_gst_inspect() -> String {
    "gst-inspect-1.0".to_string()
}

fn default_ffprobe() -> String {
    "ffprobe".to_string()
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            gst_launch: default_gst_launch(),
            gst_discoverer: default_gst_discoverer(),
            gst_inspect: default_gst_inspect(),
            ffprobe: default_ffprobe(),
        }
    }
}

/// CPU-related configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct CpuConfig {
    /// Number of logical cores (auto-detected if None)
    pub logical_cores: Option<u32>,
}

/// Status endpoint configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MetricsConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_metrics_bind")]
    pub bind: String,
}

fn default_metrics_bind() -> String {
    "127.0.0.1:7878".to_string()
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            bind: default_metrics_bind(),
        }
    }
}

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct Config {
    #[serde(default)]
    pub paths: PathsConfig,
    #[serde(default)]
    pub encode: EncodeConfig,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub watch: WatchConfig,
    #[serde(default)]
    pub tools: ToolsConfig,
    #[serde(default)]
    pub cpu: CpuConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
}

impl Config {
    /// Load configuration from a TOML file
    ///
    /// Parses the config.toml file and handles missing optional fields with defaults.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)?;
        Self::parse_toml(&content)
    }

    /// Parse configuration from a TOML string
    pub fn parse_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;
        Ok(config)
    }

    /// Apply environment variable overrides to the configuration
    ///
    /// Recognised variables:
    /// - SPLITCODE_INPUT_DIR / SPLITCODE_OUTPUT_DIR
    /// - SPLITCODE_PROCESSED_DIR / SPLITCODE_FAILED_DIR
    /// - SPLITCODE_BACKEND / SPLITCODE_CONTAINER
    /// - SPLITCODE_COMPRESSION_RATIO / SPLITCODE_CHUNK_MINUTES
    /// - SPLITCODE_MAX_CONCURRENT_JOBS / SPLITCODE_MAX_RETRIES
    /// - SPLITCODE_WATCH
    ///
    /// Unparseable values are ignored and the existing value is kept.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(val) = env::var("SPLITCODE_INPUT_DIR") {
            self.paths.input_dir = PathBuf::from(val);
        }
        if let Ok(val) = env::var("SPLITCODE_OUTPUT_DIR") {
            self.paths.output_dir = PathBuf::from(val);
        }
        if let Ok(val) = env::var("SPLITCODE_PROCESSED_DIR") {
            self.paths.processed_dir = Some(PathBuf::from(val));
        }
        if let Ok(val) = env::var("SPLITCODE_FAILED_DIR") {
            self.paths.failed_dir = Some(PathBuf::from(val));
        }

        if let Ok(backend) = env_parse::<Backend>("SPLITCODE_BACKEND") {
            self.encode.backend = backend;
        }
        if let Ok(container) = env_parse::<Container>("SPLITCODE_CONTAINER") {
            self.encode.container = container;
        }
        if let Ok(ratio) = env_parse::<u32>("SPLITCODE_COMPRESSION_RATIO") {
            self.encode.compression_ratio = Some(ratio);
        }
        if let Ok(minutes) = env_parse::<u32>("SPLITCODE_CHUNK_MINUTES") {
            self.encode.chunk_duration_minutes = minutes;
        }

        if let Ok(jobs) = env_parse::<u32>("SPLITCODE_MAX_CONCURRENT_JOBS") {
            self.queue.max_concurrent_jobs = jobs;
        }
        if let Ok(retries) = env_parse::<u32>("SPLITCODE_MAX_RETRIES") {
            self.queue.max_retries = retries;
        }

        if let Ok(val) = env::var("SPLITCODE_WATCH") {
            // Accept "true", "1", "yes" as true; "false", "0", "no" as false
            match val.to_lowercase().as_str() {
                "true" | "1" | "yes" => self.watch.enabled = true,
                "false" | "0" | "no" => self.watch.enabled = false,
                _ => {}
            }
        }
    }

    /// Check cross-field constraints that serde cannot express.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if let Some(ratio) = self.encode.compression_ratio {
            if !SUPPORTED_RATIOS.contains(&ratio) {
                return Err(ConfigError::Invalid(format!(
                    "compression_ratio {} is not one of {:?}",
                    ratio, SUPPORTED_RATIOS
                )));
            }
        }
        if self.encode.chunk_duration_minutes == 0 {
            return Err(ConfigError::Invalid(
                "chunk_duration_minutes must be at least 1".to_string(),
            ));
        }
        if self.queue.max_retries == 0 {
            return Err(ConfigError::Invalid(
                "max_retries must be at least 1".to_string(),
            ));
        }
        // chunks written into a watched directory would be picked up as sources
        if self.watch.enabled
            && !self.paths.input_dir.as_os_str().is_empty()
            && self.paths.output_dir == self.paths.input_dir
        {
            return Err(ConfigError::Invalid(
                "output_dir must differ from input_dir in watch mode".to_string(),
            ));
        }
        Ok(())
    }

    /// Load configuration from file, apply environment overrides and validate
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let mut config = Self::load_from_file(path)?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }
}

fn env_parse<T: FromStr>(key: &str) -> Result<T, ()> {
    env::var(key)
        .map_err(|_| ())
        .and_then(|v| v.trim().parse::<T>().map_err(|_| ()))
}
