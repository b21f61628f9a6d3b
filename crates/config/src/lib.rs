//! Configuration module for splitcode
//!
//! Handles loading configuration from TOML files, environment variable overrides
//! and validation of the encoding intent.

pub mod config;

pub use config::*;
