//! Moving finished source files into the processed/failed trees.
//!
//! Relative subdirectories under the input root are mirrored under the
//! target root, so `in/shows/a.mkv` lands at `processed/shows/a.mkv`.

use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Errors that can occur while relocating a file.
#[derive(Debug, Error)]
pub enum RelocateError {
    #[error("Failed to create directory {path}: {source}")]
    CreateDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to move {from} to {to}: {source}")]
    Move {
        from: PathBuf,
        to: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Directory under `target_root` mirroring the parent of `source`
/// relative to `input_root`.
///
/// Sources outside `input_root` map straight to `target_root`.
pub fn mirrored_dir(source: &Path, input_root: &Path, target_root: &Path) -> PathBuf {
    let relative_parent = source
        .strip_prefix(input_root)
        .ok()
        .and_then(|rel| rel.parent())
        .filter(|p| !p.as_os_str().is_empty());

    match relative_parent {
        Some(rel) => target_root.join(rel),
        None => target_root.to_path_buf(),
    }
}

/// First free path for `file_name` in `dir`: `name.ext`, then `name.1.ext`, ...
pub fn unique_destination(dir: &Path, file_name: &Path) -> PathBuf {
    let candidate = dir.join(file_name);
    if !candidate.exists() {
        return candidate;
    }

    let stem = file_name
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let ext = file_name
        .extension()
        .map(|e| format!(".{}", e.to_string_lossy()))
        .unwrap_or_default();

    (1u32..)
        .map(|n| dir.join(format!("{}.{}{}", stem, n, ext)))
        .find(|p| !p.exists())
        .unwrap_or(candidate)
}

/// Move `source` into `target_root`, mirroring its subdirectory.
///
/// Tries `rename` first and falls back to copy + delete when the target is
/// on another filesystem. Returns the new location.
pub fn relocate(source: &Path, input_root: &Path, target_root: &Path) -> Result<PathBuf, RelocateError> {
    let dir = mirrored_dir(source, input_root, target_root);
    fs::create_dir_all(&dir).map_err(|e| RelocateError::CreateDir {
        path: dir.clone(),
        source: e,
    })?;

    let file_name = source.file_name().map(PathBuf::from).unwrap_or_default();
    let destination = unique_destination(&dir, &file_name);

    let move_err = |e: std::io::Error| RelocateError::Move {
        from: source.to_path_buf(),
        to: destination.clone(),
        source: e,
    };

    if fs::rename(source, &destination).is_err() {
        fs::copy(source, &destination).map_err(move_err)?;
        if let Err(e) = fs::remove_file(source) {
            // keep exactly one copy
            let _ = fs::remove_file(&destination);
            return Err(move_err(e));
        }
    }

    Ok(destination)
}
