//! Concurrency planning
//!
//! Derives how many engine subprocesses may run at once from the CPU core
//! count, the encoding backend and configuration.

use crate::config::{Backend, Config};

/// Core count at which the software encoder gets a second job.
const SOFTWARE_SECOND_JOB_CORES: u32 = 16;

/// Parallel sessions assumed safe for hardware encoders.
const HARDWARE_JOBS: u32 = 2;

/// Concurrency plan derived from configuration and system resources
#[derive(Debug, Clone, PartialEq)]
pub struct ConcurrencyPlan {
    /// Total logical CPU cores available
    pub total_cores: u32,
    /// Maximum number of concurrent encoding jobs
    pub max_concurrent_jobs: u32,
}

impl ConcurrencyPlan {
    /// Derive a concurrency plan from configuration
    ///
    /// Uses the following rules:
    /// - Detects CPU cores via num_cpus if not specified in config
    /// - An explicit non-zero `queue.max_concurrent_jobs` wins
    /// - x264 gets 1 job below 16 cores and 2 at 16+
    /// - Hardware backends get 2 jobs; the encode runs on the device
    pub fn derive(cfg: &Config) -> Self {
        let total_cores = cfg
            .cpu
            .logical_cores
            .unwrap_or_else(|| num_cpus::get() as u32);

        let max_concurrent_jobs = if cfg.queue.max_concurrent_jobs > 0 {
            cfg.queue.max_concurrent_jobs
        } else {
            derive_max_jobs(cfg.encode.backend, total_cores)
        };

        Self {
            total_cores,
            max_concurrent_jobs,
        }
    }
}

fn derive_max_jobs(backend: Backend, cores: u32) -> u32 {
    if backend.is_hardware() {
        HARDWARE_JOBS
    } else if cores >= SOFTWARE_SECOND_JOB_CORES {
        2
    } else {
        1
    }
}

/// Public function to derive a concurrency plan from configuration
pub fn derive_plan(cfg: &Config) -> ConcurrencyPlan {
    ConcurrencyPlan::derive(cfg)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CpuConfig;
    use proptest::prelude::*;

    fn config(backend: Backend, cores: u32, explicit: u32) -> Config {
        let mut cfg = Config {
            cpu: CpuConfig {
                logical_cores: Some(cores),
            },
            ..Default::default()
        };
        cfg.encode.backend = backend;
        cfg.queue.max_concurrent_jobs = explicit;
        cfg
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        #[test]
        fn prop_concurrency_derivation(
            cores in 1u32..256,
            backend in prop::sample::select(Backend::ALL.to_vec()),
        ) {
            let plan = derive_plan(&config(backend, cores, 0));

            prop_assert_eq!(plan.total_cores, cores);
            let expected = if backend.is_hardware() {
                2
            } else if cores >= 16 {
                2
            } else {
                1
            };
            prop_assert_eq!(plan.max_concurrent_jobs, expected);
        }

        #[test]
        fn prop_explicit_override(
            cores in 1u32..256,
            explicit in 1u32..16,
            backend in prop::sample::select(Backend::ALL.to_vec()),
        ) {
            let plan = derive_plan(&config(backend, cores, explicit));
            prop_assert_eq!(plan.max_concurrent_jobs, explicit);
        }
    }

    #[test]
    fn test_software_boundary() {
        assert_eq!(derive_plan(&config(Backend::X264, 15, 0)).max_concurrent_jobs, 1);
        assert_eq!(derive_plan(&config(Backend::X264, 16, 0)).max_concurrent_jobs, 2);
    }

    #[test]
    fn test_autodetect_cores() {
        let mut cfg = Config::default();
        cfg.cpu.logical_cores = None;
        let plan = derive_plan(&cfg);
        assert!(plan.total_cores >= 1);
        assert!(plan.max_concurrent_jobs >= 1);
    }
}
