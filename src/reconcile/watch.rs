use anyhow::{Context, Result};
use notify::{RecommendedWatcher, RecursiveMode};
use notify_debouncer_mini::{new_debouncer, DebounceEventResult, DebouncedEventKind, Debouncer};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::config::ScannerConfig;

/// A live, non-recursive watch on one folder. Dropping it stops the watch
/// and closes the channel it feeds.
pub struct FolderWatcher {
    _debouncer: Debouncer<RecommendedWatcher>,
    folder: PathBuf,
    live: Arc<AtomicUsize>,
}

impl FolderWatcher {
    /// Forward the names of image files that changed directly inside
    /// `folder`, each once it has been quiet for `debounce`. A file that
    /// keeps changing does not hold back the others. Nothing is sent for
    /// the folder's existing contents.
    pub fn start(
        folder: &Path,
        scanner: ScannerConfig,
        debounce: Duration,
        changes: mpsc::UnboundedSender<String>,
        live: Arc<AtomicUsize>,
    ) -> Result<Self> {
        let root = folder.to_path_buf();
        let mut debouncer = new_debouncer(debounce, move |result: DebounceEventResult| {
            let events = match result {
                Ok(events) => events,
                Err(e) => {
                    warn!("Watch error on {}: {}", root.display(), e);
                    return;
                }
            };
            for event in events {
                // Still being written
                if !matches!(event.kind, DebouncedEventKind::Any) {
                    continue;
                }
                if event.path.parent() != Some(root.as_path()) {
                    continue;
                }
                let Some(name) = event.path.file_name().map(|n| n.to_string_lossy().to_string()) else {
                    continue;
                };
                if name.starts_with('.') || !scanner.is_image(&event.path) {
                    continue;
                }
                debug!("Settled change for {}", name);
                let _ = changes.send(name);
            }
        })
        .context("Failed to create filesystem watcher")?;

        debouncer
            .watcher()
            .watch(folder, RecursiveMode::NonRecursive)
            .with_context(|| format!("Failed to watch {}", folder.display()))?;

        live.fetch_add(1, Ordering::SeqCst);
        info!("Watching {}", folder.display());
        Ok(Self {
            _debouncer: debouncer,
            folder: folder.to_path_buf(),
            live,
        })
    }
}

impl Drop for FolderWatcher {
    fn drop(&mut self) {
        self.live.fetch_sub(1, Ordering::SeqCst);
        info!("Stopped watching {}", self.folder.display());
    }
}
