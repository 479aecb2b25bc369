//! One selected folder: diff against the snapshot, then follow the watch.

use anyhow::Result;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info};

use super::discovery::{self, discover_images, system_time_millis};
use super::events::{EventBus, LibraryEvent};
use super::pipeline::Pipeline;
use crate::config::ScannerConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    #[default]
    Idle,
    Loading,
    Diffing,
    Watching,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineStatus {
    pub session: u64,
    pub state: SessionState,
    pub project_id: Option<String>,
}

/// Shared status cell. Updates carrying an older session number than the
/// current one are ignored.
#[derive(Clone)]
pub(crate) struct StatusCell {
    tx: Arc<watch::Sender<EngineStatus>>,
}

impl StatusCell {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(EngineStatus::default());
        Self { tx: Arc::new(tx) }
    }

    pub fn get(&self) -> EngineStatus {
        self.tx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<EngineStatus> {
        self.tx.subscribe()
    }

    pub fn set(&self, session: u64, state: SessionState, project_id: Option<&str>) {
        self.tx.send_if_modified(|status| {
            if session < status.session {
                return false;
            }
            status.session = session;
            status.state = state;
            status.project_id = project_id.map(str::to_string);
            true
        });
    }
}

pub(crate) struct Session {
    pub number: u64,
    pub pipeline: Pipeline,
    pub bus: EventBus,
    pub status: StatusCell,
    pub scanner: ScannerConfig,
    pub batch_size: usize,
    pub cancelled: Arc<AtomicBool>,
}

impl Session {
    fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    fn set_state(&self, state: SessionState) {
        self.status.set(self.number, state, Some(self.pipeline.project_id()));
    }

    fn publish(&self, event: LibraryEvent) {
        if !self.bus.publish(self.number, event) {
            debug!("Dropped event from superseded session {}", self.number);
        }
    }

    /// Runs until the session is cancelled or its watcher goes away.
    /// `known` is the cached snapshot: file name -> mtime.
    pub async fn run(self, mut known: HashMap<String, i64>, changes: mpsc::UnboundedReceiver<String>) {
        self.set_state(SessionState::Diffing);
        if let Err(e) = self.reconcile_folder(&mut known).await {
            error!(
                "Initial diff of project {} failed: {:#}",
                self.pipeline.project_id(),
                e
            );
        }
        if self.is_cancelled() {
            return;
        }

        self.set_state(SessionState::Watching);
        self.follow(&mut known, changes).await;
        debug!("Session {} ended", self.number);
    }

    async fn reconcile_folder(&self, known: &mut HashMap<String, i64>) -> Result<()> {
        let root = self.pipeline.store().source_root().to_path_buf();
        let scanner = self.scanner.clone();
        let on_disk = tokio::task::spawn_blocking(move || discover_images(&root, &scanner)).await??;

        let diff = discovery::diff(known, &on_disk);
        info!(
            "Project {}: {} new, {} modified, {} vanished",
            self.pipeline.project_id(),
            diff.new_files.len(),
            diff.modified_files.len(),
            diff.vanished.len()
        );

        let names: Vec<String> = diff.to_process().map(|f| f.file_name.clone()).collect();
        for batch in names.chunks(self.batch_size.max(1)) {
            if self.is_cancelled() {
                return Ok(());
            }
            for (name, processed) in self.pipeline.process_batch(batch).await {
                known.insert(name, processed.modified_at);
                self.publish(LibraryEvent::Added {
                    record: processed.record,
                });
            }
        }

        if !diff.vanished.is_empty() && !self.is_cancelled() {
            for name in self.pipeline.remove(diff.vanished).await? {
                known.remove(&name);
                self.publish(LibraryEvent::Removed {
                    name,
                    project_id: self.pipeline.project_id().to_string(),
                });
            }
        }
        Ok(())
    }

    async fn follow(&self, known: &mut HashMap<String, i64>, mut changes: mpsc::UnboundedReceiver<String>) {
        while let Some(name) = changes.recv().await {
            if self.is_cancelled() {
                break;
            }
            self.handle_change(known, name).await;
        }
    }

    async fn handle_change(&self, known: &mut HashMap<String, i64>, name: String) {
        let path = self.pipeline.store().source_path(&name);
        match tokio::fs::metadata(&path).await {
            Ok(meta) if meta.is_file() => {
                let mtime = meta.modified().map(system_time_millis).unwrap_or(0);
                if known.get(&name) == Some(&mtime) {
                    debug!("{} already processed at this mtime", name);
                    return;
                }
                let processed = self.pipeline.process(&name).await;
                known.insert(name, processed.modified_at);
                self.publish(LibraryEvent::Added {
                    record: processed.record,
                });
            }
            _ => {
                if known.remove(&name).is_none() {
                    return;
                }
                // Degraded entries never had a row but were still listed, so
                // an empty removal still notifies.
                match self.pipeline.remove(vec![name.clone()]).await {
                    Ok(_) => self.publish(LibraryEvent::Removed {
                        name,
                        project_id: self.pipeline.project_id().to_string(),
                    }),
                    Err(e) => error!("Failed to drop {} from the cache: {:#}", path.display(), e),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_ignores_older_sessions() {
        let cell = StatusCell::new();
        cell.set(2, SessionState::Diffing, Some("b"));
        cell.set(1, SessionState::Watching, Some("a"));

        let status = cell.get();
        assert_eq!(status.session, 2);
        assert_eq!(status.state, SessionState::Diffing);
        assert_eq!(status.project_id.as_deref(), Some("b"));

        cell.set(3, SessionState::Idle, None);
        assert_eq!(cell.get().state, SessionState::Idle);
        assert!(cell.get().project_id.is_none());
    }
}
