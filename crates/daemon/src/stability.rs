//! Write-stability checks for newly discovered files.
//!
//! A file still being copied into the watch directory must not be handed to
//! the engine. It is considered stable once its size stops changing across
//! one check interval.

use std::path::Path;
use std::time::Duration;
use tokio::time::sleep;

/// Upper bound on re-checks before giving up on a file that keeps growing.
pub const MAX_STABILITY_CHECKS: u32 = 720;

/// Result of a stability check on a file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StabilityResult {
    /// File size remained unchanged during the stability window.
    Stable,
    /// File size changed during the stability window.
    Unstable {
        /// Size when first checked.
        initial_size: u64,
        /// Size after waiting.
        current_size: u64,
    },
}

/// Check if a file is stable by comparing its size before and after a wait period.
///
/// # Arguments
/// * `path` - Path to the file to check
/// * `initial_size` - The file size when first discovered
/// * `wait` - How long to wait before re-checking
pub async fn check_stability(
    path: &Path,
    initial_size: u64,
    wait: Duration,
) -> Result<StabilityResult, std::io::Error> {
    sleep(wait).await;
    let current_size = tokio::fs::metadata(path).await?.len();
    Ok(compare_sizes(initial_size, current_size))
}

/// Re-stat `path` every `interval` until two consecutive sizes match.
///
/// Returns the stable size, or an error if the file disappears or never
/// settles within [`MAX_STABILITY_CHECKS`] intervals.
pub async fn wait_until_stable(path: &Path, interval: Duration) -> Result<u64, std::io::Error> {
    let mut size = tokio::fs::metadata(path).await?.len();

    for _ in 0..MAX_STABILITY_CHECKS {
        match check_stability(path, size, interval).await? {
            StabilityResult::Stable => return Ok(size),
            StabilityResult::Unstable { current_size, .. } => size = current_size,
        }
    }

    Err(std::io::Error::new(
        std::io::ErrorKind::TimedOut,
        format!("{} is still being written", path.display()),
    ))
}

/// Compare two file sizes and return the appropriate StabilityResult.
#[inline]
pub fn compare_sizes(initial_size: u64, current_size: u64) -> StabilityResult {
    if initial_size == current_size {
        StabilityResult::Stable
    } else {
        StabilityResult::Unstable {
            initial_size,
            current_size,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use tempfile::TempDir;

    proptest! {
        #[test]
        fn prop_stability_size_comparison(initial_size: u64, current_size: u64) {
            let result = compare_sizes(initial_size, current_size);

            if initial_size == current_size {
                prop_assert_eq!(result, StabilityResult::Stable);
            } else {
                prop_assert_eq!(result, StabilityResult::Unstable { initial_size, current_size });
            }
        }
    }

    #[tokio::test]
    async fn test_wait_until_stable_for_idle_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("a.mkv");
        std::fs::write(&path, vec![0u8; 10]).unwrap();

        let size = wait_until_stable(&path, Duration::from_millis(10)).await.unwrap();
        assert_eq!(size, 10);
    }

    #[tokio::test]
    async fn test_wait_until_stable_follows_growth() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("a.mkv");
        std::fs::write(&path, vec![0u8; 10]).unwrap();

        let writer_path = path.clone();
        let writer = tokio::spawn(async move {
            sleep(Duration::from_millis(30)).await;
            std::fs::write(&writer_path, vec![0u8; 20]).unwrap();
        });

        let size = wait_until_stable(&path, Duration::from_millis(100)).await.unwrap();
        writer.await.unwrap();
        assert_eq!(size, 20);
    }

    #[tokio::test]
    async fn test_wait_until_stable_missing_file() {
        let dir = TempDir::new().unwrap();
        let result = wait_until_stable(&dir.path().join("gone.mkv"), Duration::from_millis(10)).await;
        assert!(result.is_err());
    }
}
