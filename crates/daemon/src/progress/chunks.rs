//! Polling the output directory for sequentially numbered chunk files.

use crate::config::Container;
use crate::encode::pipeline::chunk_file_name;
use std::path::{Path, PathBuf};

/// Highest chunk index probed before giving up.
pub const MAX_CHUNK_INDEX: u32 = 99;

/// Result of one pass over the output directory.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChunkScan {
    /// Highest consecutive index present, 0 if none
    pub highest_index: u32,
    /// Combined size of every chunk found
    pub total_bytes: u64,
    pub chunks: Vec<PathBuf>,
}

/// Scan `output_dir` for `<base>_01.<ext>`, `<base>_02.<ext>`, ... stopping at
/// the first gap.
pub async fn scan_chunks(output_dir: &Path, base_name: &str, container: Container) -> ChunkScan {
    let mut scan = ChunkScan::default();

    for index in 1..=MAX_CHUNK_INDEX {
        let path = output_dir.join(chunk_file_name(base_name, index, container));
        match tokio::fs::metadata(&path).await {
            Ok(meta) if meta.is_file() => {
                scan.highest_index = index;
                scan.total_bytes += meta.len();
                scan.chunks.push(path);
            }
            _ => break,
        }
    }

    scan
}
