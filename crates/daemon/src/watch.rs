//! Watch mode: feed new files in the input directory into the queue.

use crate::queue::{ProcessingQueue, QueueError};
use crate::scan::is_candidate;
use crate::stability::wait_until_stable;
use notify::{Config, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[derive(Debug, Error)]
pub enum WatchError {
    #[error("Failed to create watcher: {0}")]
    Create(#[source] notify::Error),

    #[error("Failed to watch {path}: {source}")]
    Watch {
        path: PathBuf,
        #[source]
        source: notify::Error,
    },
}

/// Paths in `event` that may be new source files under `root`.
pub fn candidate_paths(event: &Event, root: &Path, skip_roots: &[PathBuf]) -> Vec<PathBuf> {
    match event.kind {
        EventKind::Create(_) | EventKind::Modify(_) => event
            .paths
            .iter()
            .filter(|p| is_candidate(p, root, skip_roots))
            .cloned()
            .collect(),
        _ => Vec::new(),
    }
}

/// Recursive watcher on the input directory.
pub struct InputWatcher {
    // dropping the watcher stops the event feed
    _watcher: RecommendedWatcher,
    events: mpsc::UnboundedReceiver<PathBuf>,
}

impl InputWatcher {
    /// Watch `root` recursively; events under `skip_roots` are dropped.
    pub fn start(root: &Path, skip_roots: Vec<PathBuf>) -> Result<Self, WatchError> {
        let (tx, events) = mpsc::unbounded_channel();
        let filter_root = root.to_path_buf();

        let mut watcher = RecommendedWatcher::new(
            move |res: Result<Event, notify::Error>| match res {
                Ok(event) => {
                    for path in candidate_paths(&event, &filter_root, &skip_roots) {
                        if tx.send(path).is_err() {
                            return;
                        }
                    }
                }
                Err(e) => error!("Watch error: {:?}", e),
            },
            Config::default(),
        )
        .map_err(WatchError::Create)?;

        watcher
            .watch(root, RecursiveMode::Recursive)
            .map_err(|source| WatchError::Watch {
                path: root.to_path_buf(),
                source,
            })?;
        info!("Watching path: {}", root.display());

        Ok(Self {
            _watcher: watcher,
            events,
        })
    }

    /// Next candidate path, or `None` once the watcher is gone.
    pub async fn next_candidate(&mut self) -> Option<PathBuf> {
        self.events.recv().await
    }
}

/// Forward watcher events into `queue` until `shutdown` fires.
///
/// Each path waits for write stability first; repeated events for a path
/// already being checked are dropped.
pub async fn run_watch_loop(
    mut watcher: InputWatcher,
    queue: ProcessingQueue,
    stability: Duration,
    shutdown: CancellationToken,
) {
    let settling: Arc<Mutex<HashSet<PathBuf>>> = Arc::new(Mutex::new(HashSet::new()));

    loop {
        let path = tokio::select! {
            _ = shutdown.cancelled() => break,
            next = watcher.next_candidate() => match next {
                Some(path) => path,
                None => break,
            },
        };

        {
            let mut set = settling.lock().unwrap_or_else(|p| p.into_inner());
            if !set.insert(path.clone()) {
                continue;
            }
        }
        debug!(path = %path.display(), "new file, waiting for stability");

        let queue = queue.clone();
        let settling = settling.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            let stable = tokio::select! {
                _ = shutdown.cancelled() => None,
                result = wait_until_stable(&path, stability) => Some(result),
            };

            match stable {
                Some(Ok(size)) => match queue.enqueue(&path).await {
                    Ok(Some(id)) => debug!(job_id = %id, size_bytes = size, "queued from watch"),
                    Ok(None) => {}
                    Err(QueueError::ShuttingDown) => {}
                    Err(e) => warn!(error = %e, "cannot queue watched file"),
                },
                Some(Err(e)) => debug!(path = %path.display(), error = %e, "file never settled"),
                None => {}
            }

            settling.lock().unwrap_or_else(|p| p.into_inner()).remove(&path);
        });
    }

    info!("watch loop stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use notify::event::{CreateKind, ModifyKind, RemoveKind};
    use tempfile::TempDir;

    fn event(kind: EventKind, paths: &[&str]) -> Event {
        let mut event = Event::new(kind);
        for p in paths {
            event = event.add_path(PathBuf::from(p));
        }
        event
    }

    #[test]
    fn test_candidate_paths_filters() {
        let root = Path::new("/in");
        let created = event(
            EventKind::Create(CreateKind::File),
            &["/in/a.mkv", "/in/a.srt", "/in/.git/b.mkv", "/in/c.mp4.part"],
        );
        assert_eq!(candidate_paths(&created, root, &[]), vec![PathBuf::from("/in/a.mkv")]);

        let modified = event(EventKind::Modify(ModifyKind::Any), &["/in/shows/d.ts"]);
        assert_eq!(
            candidate_paths(&modified, root, &[]),
            vec![PathBuf::from("/in/shows/d.ts")]
        );
    }

    #[test]
    fn test_own_output_not_reported() {
        let skip = vec![PathBuf::from("/in/out"), PathBuf::from("/in/processed")];
        let created = event(
            EventKind::Create(CreateKind::File),
            &["/in/out/movie_01.mkv", "/in/processed/movie.mkv", "/in/next.mkv"],
        );
        assert_eq!(
            candidate_paths(&created, Path::new("/in"), &skip),
            vec![PathBuf::from("/in/next.mkv")]
        );
    }

    #[test]
    fn test_removals_ignored() {
        let removed = event(EventKind::Remove(RemoveKind::File), &["/in/a.mkv"]);
        assert!(candidate_paths(&removed, Path::new("/in"), &[]).is_empty());
    }

    #[tokio::test]
    async fn test_watcher_reports_new_file() {
        let dir = TempDir::new().unwrap();
        let root = std::fs::canonicalize(dir.path()).unwrap();
        let mut watcher = InputWatcher::start(&root, Vec::new()).unwrap();

        std::fs::write(root.join("new.mkv"), b"video").unwrap();
        std::fs::write(root.join("ignored.txt"), b"text").unwrap();

        let path = tokio::time::timeout(Duration::from_secs(5), watcher.next_candidate())
            .await
            .expect("no watch event")
            .unwrap();
        assert_eq!(path.file_name().unwrap(), "new.mkv");
    }
}
