//! CLI entry point for splitcode
//!
//! Parses command line arguments, sets up logging and runs a batch or watch
//! session.

use clap::Parser;
use splitcode::config::{Backend, Container};
use splitcode::{Config, Daemon};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// splitcode - split and transcode videos through GStreamer
#[derive(Parser, Debug)]
#[command(name = "splitcode")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the configuration file (config.toml)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Directory scanned for source videos
    #[arg(short, long)]
    input: Option<PathBuf>,

    /// Directory chunks are written to
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Move sources here after a successful transcode
    #[arg(long)]
    processed_dir: Option<PathBuf>,

    /// Move sources here after a permanent failure
    #[arg(long)]
    failed_dir: Option<PathBuf>,

    /// Target input/output size ratio (1, 2, 3, 4, 5, 10 or 20)
    #[arg(short, long)]
    ratio: Option<u32>,

    /// Encoding backend (x264, nvenc, qsv, va, vtenc)
    #[arg(short, long)]
    backend: Option<Backend>,

    /// Output container (mkv, mp4, ts)
    #[arg(long)]
    container: Option<Container>,

    /// Chunk duration in minutes
    #[arg(long)]
    chunk_minutes: Option<u32>,

    /// Encoder speed preset
    #[arg(long)]
    preset: Option<String>,

    /// Keep watching the input directory after the initial scan
    #[arg(short, long)]
    watch: bool,

    /// Maximum concurrent jobs (0 derives from the CPU)
    #[arg(short, long)]
    jobs: Option<u32>,

    /// Attempts per file before it is marked failed
    #[arg(long)]
    retries: Option<u32>,

    /// Serve the status endpoint on this address (e.g. 127.0.0.1:7878)
    #[arg(long)]
    metrics: Option<String>,

    /// Skip startup checks (gst-launch, encoder element). For testing only.
    #[arg(long, default_value = "false")]
    skip_checks: bool,

    /// Emit logs as JSON lines
    #[arg(long)]
    log_json: bool,
}

impl Args {
    fn apply(&self, config: &mut Config) {
        if let Some(dir) = &self.input {
            config.paths.input_dir = dir.clone();
        }
        if let Some(dir) = &self.output {
            config.paths.output_dir = dir.clone();
        }
        if let Some(dir) = &self.processed_dir {
            config.paths.processed_dir = Some(dir.clone());
        }
        if let Some(dir) = &self.failed_dir {
            config.paths.failed_dir = Some(dir.clone());
        }
        if let Some(ratio) = self.ratio {
            config.encode.compression_ratio = Some(ratio);
        }
        if let Some(backend) = self.backend {
            config.encode.backend = backend;
        }
        if let Some(container) = self.container {
            config.encode.container = container;
        }
        if let Some(minutes) = self.chunk_minutes {
            config.encode.chunk_duration_minutes = minutes;
        }
        if let Some(preset) = &self.preset {
            config.encode.speed_preset = Some(preset.clone());
        }
        if self.watch {
            config.watch.enabled = true;
        }
        if let Some(jobs) = self.jobs {
            config.queue.max_concurrent_jobs = jobs;
        }
        if let Some(retries) = self.retries {
            config.queue.max_retries = retries;
        }
        if let Some(bind) = &self.metrics {
            config.metrics.enabled = true;
            config.metrics.bind = bind.clone();
        }
    }
}

fn init_logging(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn load_config(args: &Args) -> Result<Config, splitcode::config::ConfigError> {
    let mut config = match &args.config {
        Some(path) => Config::load(path)?,
        None => {
            let mut config = Config::default();
            config.apply_env_overrides();
            config
        }
    };
    args.apply(&mut config);
    config.validate()?;
    Ok(config)
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    init_logging(args.log_json);

    let config = match load_config(&args) {
        Ok(config) => config,
        Err(e) => {
            error!("{}", e);
            return ExitCode::FAILURE;
        }
    };

    let daemon_result = if args.skip_checks {
        warn!("Skipping startup checks (--skip-checks enabled)");
        Daemon::new_without_checks(config)
    } else {
        Daemon::new(config)
    };

    let daemon = match daemon_result {
        Ok(daemon) => daemon,
        Err(e) => {
            error!("Failed to initialize: {}", e);
            return ExitCode::FAILURE;
        }
    };

    info!(
        input = %daemon.config.paths.input_dir.display(),
        output = %daemon.config.paths.output_dir.display(),
        max_jobs = daemon.concurrency_plan.max_concurrent_jobs,
        watch = daemon.config.watch.enabled,
        "splitcode starting"
    );

    let result = if daemon.config.watch.enabled {
        daemon
            .run_watch(async {
                if let Err(e) = tokio::signal::ctrl_c().await {
                    error!("Cannot listen for Ctrl-C: {}", e);
                    std::future::pending::<()>().await;
                }
            })
            .await
    } else {
        let token = daemon.shutdown_token();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Ctrl-C received, cancelling jobs");
                token.cancel();
            }
        });
        daemon.run_batch().await
    };

    match result {
        Ok(summary) => {
            info!(
                completed = summary.completed,
                failed = summary.failed,
                cancelled = summary.cancelled,
                "done"
            );
            if summary.is_success() {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            }
        }
        Err(e) => {
            error!("{}", e);
            ExitCode::FAILURE
        }
    }
}
