//! Scanner for discovering source videos in the input directory.
//!
//! The same path filter decides which watch-mode events are worth a look.

use std::path::{Path, PathBuf};
use std::time::SystemTime;
use walkdir::WalkDir;

/// Video file extensions accepted as sources (case-insensitive matching).
pub const VIDEO_EXTENSIONS: &[&str] = &[
    "mkv", "mp4", "avi", "mov", "m4v", "ts", "m2ts", "webm", "wmv", "flv", "mpg", "mpeg",
];

/// Directory names that never contain sources.
pub const EXCLUDED_DIRS: &[&str] = &["target", "node_modules", "build", "dist", ".git", ".svn", ".hg"];

/// Suffixes of partial or temporary downloads.
pub const PARTIAL_SUFFIXES: &[&str] = &[".part", ".crdownload", ".tmp", ".download"];

/// A candidate video file discovered during scanning.
#[derive(Debug, Clone)]
pub struct ScanCandidate {
    /// Full path to the video file.
    pub path: PathBuf,
    /// File size in bytes at discovery time.
    pub size_bytes: u64,
    /// Last modified time of the file.
    pub modified_time: SystemTime,
}

/// Checks if a file has a video extension (case-insensitive).
pub fn is_video_file(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| {
            let ext_lower = ext.to_lowercase();
            VIDEO_EXTENSIONS.contains(&ext_lower.as_str())
        })
        .unwrap_or(false)
}

/// Whether a file name looks like an unfinished download.
pub fn is_partial_download(path: &Path) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .map(|name| {
            let lower = name.to_lowercase();
            PARTIAL_SUFFIXES.iter().any(|s| lower.ends_with(s))
        })
        .unwrap_or(false)
}

fn is_excluded_dir_name(name: &str) -> bool {
    name.starts_with('.') || EXCLUDED_DIRS.contains(&name)
}

/// Whether any directory between `root` and `path` is excluded.
pub fn in_excluded_dir(path: &Path, root: &Path) -> bool {
    let relative = path.strip_prefix(root).unwrap_or(path);
    let Some(parent) = relative.parent() else {
        return false;
    };
    parent
        .components()
        .filter_map(|c| c.as_os_str().to_str())
        .any(is_excluded_dir_name)
}

/// Whether `path` is inside one of `skip_roots`.
///
/// A skip root that is `root` itself, or contains it, is ignored; only
/// directories nested under the input tree are cut out.
pub fn in_skipped_root(path: &Path, root: &Path, skip_roots: &[PathBuf]) -> bool {
    skip_roots
        .iter()
        .filter(|skip| !root.starts_with(skip))
        .any(|skip| path.starts_with(skip))
}

/// Full source filter: video extension, not partial, not under an excluded
/// directory and not under one of `skip_roots` (our own output, processed and
/// failed directories).
pub fn is_candidate(path: &Path, root: &Path, skip_roots: &[PathBuf]) -> bool {
    is_video_file(path)
        && !is_partial_download(path)
        && !in_excluded_dir(path, root)
        && !in_skipped_root(path, root, skip_roots)
}

/// Recursively scans `root` for source videos.
///
/// Hidden, build-artefact and version-control directories are not entered.
/// Directories under `skip_roots` are not entered either.
/// Results are sorted by path for a stable processing order.
pub fn scan_inputs(root: &Path, skip_roots: &[PathBuf]) -> Vec<ScanCandidate> {
    if !root.exists() {
        return Vec::new();
    }

    let walker = WalkDir::new(root).into_iter().filter_entry(|entry| {
        if entry.file_type().is_dir() && entry.depth() > 0 {
            if in_skipped_root(entry.path(), root, skip_roots) {
                return false;
            }
            if let Some(name) = entry.file_name().to_str() {
                return !is_excluded_dir_name(name);
            }
        }
        true
    });

    let mut candidates: Vec<ScanCandidate> = walker
        .filter_map(|e| e.ok())
        .filter(|entry| entry.file_type().is_file())
        .filter(|entry| is_video_file(entry.path()) && !is_partial_download(entry.path()))
        .filter_map(|entry| {
            let metadata = entry.metadata().ok()?;
            Some(ScanCandidate {
                path: entry.path().to_path_buf(),
                size_bytes: metadata.len(),
                modified_time: metadata.modified().unwrap_or(SystemTime::UNIX_EPOCH),
            })
        })
        .collect();

    candidates.sort_by(|a, b| a.path.cmp(&b.path));
    candidates
}
