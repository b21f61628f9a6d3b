//! Encoding: pipeline construction and the subprocess runner.

pub mod pipeline;
pub mod runner;

pub use pipeline::{build, chunk_file_name, file_uri, pipeline_path, PipelineSpec};
pub use runner::{classify_exit, terminate, GstJobRunner, JobReport, JobRunner, RunError};
