//! Reconciliation engine: keeps the cache and the derivative stores in step
//! with the selected folder.
//!
//! Selecting a folder answers immediately from the cache, then a background
//! session diffs the folder against that snapshot and keeps following it
//! through a filesystem watch. Only one folder is followed at a time.

mod discovery;
mod display;
mod events;
mod pipeline;
mod registry;
mod session;
mod watch;

use anyhow::{Context, Result};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tracing::{error, info, warn};

pub use discovery::{diff, discover_images, DiscoveredFile, FolderDiff};
pub use display::{DisplayRecord, UrlBuilder};
pub use events::{EventBus, LibraryEvent, Subscription};
pub use pipeline::{Pipeline, Processed};
pub use registry::ProjectRegistry;
pub use session::{EngineStatus, SessionState};

use crate::config::Config;
use crate::db::{project_id_for_path, Database, Project};
use crate::error::FolioError;
use crate::sidecar::{SidecarStore, SweepReport};
use session::{Session, StatusCell};
use watch::FolderWatcher;

/// Outcome of registering a folder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FolderSelection {
    Added(Project),
    AlreadyRegistered(Project),
}

impl FolderSelection {
    pub fn project(&self) -> &Project {
        match self {
            FolderSelection::Added(project) | FolderSelection::AlreadyRegistered(project) => project,
        }
    }
}

struct ActiveSession {
    project_id: String,
    cancelled: Arc<AtomicBool>,
    _watcher: FolderWatcher,
}

impl ActiveSession {
    fn cancel(self) {
        self.cancelled.store(true, Ordering::SeqCst);
        info!("Closing project {}", self.project_id);
    }
}

async fn blocking<T, F>(f: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f).await?
}

fn canonical_folder(path: &Path) -> Result<PathBuf> {
    if !path.is_dir() {
        return Err(FolioError::NotADirectory(path.to_path_buf()).into());
    }
    path.canonicalize()
        .with_context(|| format!("Failed to resolve {}", path.display()))
}

pub struct Engine {
    db: Arc<Database>,
    registry: ProjectRegistry,
    bus: EventBus,
    urls: UrlBuilder,
    config: Config,
    status: StatusCell,
    live_watches: Arc<AtomicUsize>,
    active: Mutex<Option<ActiveSession>>,
}

impl Engine {
    /// `server_base_url` is where the derivative server listens, e.g.
    /// `http://127.0.0.1:8765`.
    pub fn new(db: Arc<Database>, registry: ProjectRegistry, config: Config, server_base_url: &str) -> Self {
        Self {
            db,
            registry,
            bus: EventBus::new(),
            urls: UrlBuilder::new(server_base_url),
            config,
            status: StatusCell::new(),
            live_watches: Arc::new(AtomicUsize::new(0)),
            active: Mutex::new(None),
        }
    }

    pub fn database(&self) -> &Arc<Database> {
        &self.db
    }

    pub fn registry(&self) -> &ProjectRegistry {
        &self.registry
    }

    pub fn subscribe(&self) -> Subscription {
        self.bus.subscribe()
    }

    pub fn state(&self) -> EngineStatus {
        self.status.get()
    }

    pub fn state_changes(&self) -> tokio::sync::watch::Receiver<EngineStatus> {
        self.status.subscribe()
    }

    /// Filesystem watches currently open. Never more than one.
    pub fn active_watches(&self) -> usize {
        self.live_watches.load(Ordering::SeqCst)
    }

    /// Register a folder without opening it.
    pub async fn add_folder(&self, path: &Path) -> Result<FolderSelection> {
        let root = canonical_folder(path)?;
        let root_str = root.to_string_lossy().to_string();

        let db = self.db.clone();
        let lookup = root_str.clone();
        if let Some(existing) = blocking(move || db.find_project_by_path(&lookup)).await? {
            warn!("Folder {} is already registered as {}", root.display(), existing.id);
            return Ok(FolderSelection::AlreadyRegistered(existing));
        }

        let project = self.register_folder(&root).await?;
        info!("Added project {} for {}", project.id, root.display());
        Ok(FolderSelection::Added(project))
    }

    /// Select a folder: registers it if needed, returns the cached records
    /// at once and starts reconciling in the background.
    pub async fn open_folder(&self, path: &Path) -> Result<Vec<DisplayRecord>> {
        let root = canonical_folder(path)?;
        let project = self.register_folder(&root).await?;
        self.start_session(project).await
    }

    pub async fn open_project(&self, project_id: &str) -> Result<Vec<DisplayRecord>> {
        let db = self.db.clone();
        let id = project_id.to_string();
        let project = blocking(move || {
            let project = db.get_project(&id)?;
            if project.is_some() {
                db.touch_project(&id)?;
            }
            Ok(project)
        })
        .await?
        .ok_or_else(|| FolioError::ProjectNotFound(project_id.to_string()))?;
        self.start_session(project).await
    }

    /// Stop following the selected folder.
    pub async fn close(&self) {
        let mut active = self.active.lock().await;
        if let Some(previous) = active.take() {
            previous.cancel();
        }
        let session = self.bus.begin_session();
        self.status.set(session, SessionState::Idle, None);
    }

    pub async fn shutdown(&self) {
        self.close().await;
        info!("Reconciliation engine stopped");
    }

    async fn register_folder(&self, root: &Path) -> Result<Project> {
        let id = project_id_for_path(root);
        let name = root
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| root.to_string_lossy().to_string());
        let root_str = root.to_string_lossy().to_string();
        let db = self.db.clone();
        blocking(move || db.upsert_project(&id, &name, &root_str)).await
    }

    async fn store_for(&self, project: &Project) -> Result<Arc<SidecarStore>> {
        if let Some(store) = self.registry.get(&project.id) {
            return Ok(store);
        }
        let root = PathBuf::from(&project.root_path);
        let config = self.config.derivatives.clone();
        let store = blocking(move || Ok(SidecarStore::open(&root, &config)?)).await?;
        Ok(self.registry.register(&project.id, store))
    }

    async fn start_session(&self, project: Project) -> Result<Vec<DisplayRecord>> {
        let mut active = self.active.lock().await;
        if let Some(previous) = active.take() {
            previous.cancel();
        }
        let number = self.bus.begin_session();
        self.status.set(number, SessionState::Loading, Some(&project.id));

        match self.prepare_session(number, &project).await {
            Ok((records, next)) => {
                *active = Some(next);
                Ok(records)
            }
            Err(e) => {
                error!("Cannot open project {}: {:#}", project.id, e);
                self.status.set(number, SessionState::Idle, None);
                Err(e)
            }
        }
    }

    async fn prepare_session(&self, number: u64, project: &Project) -> Result<(Vec<DisplayRecord>, ActiveSession)> {
        let store = self.store_for(project).await?;
        let (records, snapshot) = self.load_cached(project, store.clone()).await?;

        // Watch before the diff lists the folder so nothing added in between
        // is missed; the session skips names it already processed.
        let (tx, rx) = mpsc::unbounded_channel();
        let watcher = FolderWatcher::start(
            store.source_root(),
            self.config.scanner.clone(),
            Duration::from_millis(self.config.reconcile.watch_debounce_ms),
            tx,
            self.live_watches.clone(),
        )?;

        let cancelled = Arc::new(AtomicBool::new(false));
        let session = Session {
            number,
            pipeline: Pipeline::new(self.db.clone(), store, &project.id, self.urls.clone()),
            bus: self.bus.clone(),
            status: self.status.clone(),
            scanner: self.config.scanner.clone(),
            batch_size: self.config.reconcile.batch_size,
            cancelled: cancelled.clone(),
        };
        tokio::spawn(session.run(snapshot, rx));

        info!("Opened project {} with {} cached images", project.id, records.len());
        Ok((
            records,
            ActiveSession {
                project_id: project.id.clone(),
                cancelled,
                _watcher: watcher,
            },
        ))
    }

    /// Cached rows as display records plus the name -> mtime snapshot the
    /// diff runs against. Ratings and tags missing from the cache are filled
    /// in from the sidecar metadata and written back.
    async fn load_cached(
        &self,
        project: &Project,
        store: Arc<SidecarStore>,
    ) -> Result<(Vec<DisplayRecord>, HashMap<String, i64>)> {
        let db = self.db.clone();
        let urls = self.urls.clone();
        let project_id = project.id.clone();
        blocking(move || {
            let rows = db.get_images_by_project(&project_id)?;
            let mut tags = db.get_tags_by_project(&project_id)?;
            let mut records = Vec::with_capacity(rows.len());
            let mut snapshot = HashMap::with_capacity(rows.len());

            for mut row in rows {
                let mut row_tags = tags.remove(&row.id).unwrap_or_default();
                if row.rating == 0 || row_tags.is_empty() {
                    if let Ok(Some(side)) = store.read_metadata(&row.file_name) {
                        if row.rating == 0 {
                            if let Some(rating) = side.rating.filter(|r| *r > 0) {
                                db.set_rating(&row.id, rating)?;
                                row.rating = rating.min(5);
                            }
                        }
                        if row_tags.is_empty() && !side.tags.is_empty() {
                            db.set_tags(&row.id, &side.tags)?;
                            row_tags = db.get_tags(&row.id)?;
                        }
                    }
                }
                snapshot.insert(row.file_name.clone(), row.modified_at);
                records.push(urls.display(&row, row_tags));
            }
            Ok((records, snapshot))
        })
        .await
    }

    pub async fn list_projects(&self) -> Result<Vec<Project>> {
        let db = self.db.clone();
        blocking(move || db.list_projects()).await
    }

    /// Forget a project. Its rows go with it; derivatives on disk stay until
    /// purged explicitly.
    pub async fn remove_project(&self, project_id: &str) -> Result<bool> {
        {
            let mut active = self.active.lock().await;
            if active.as_ref().is_some_and(|a| a.project_id == project_id) {
                if let Some(previous) = active.take() {
                    previous.cancel();
                }
                let session = self.bus.begin_session();
                self.status.set(session, SessionState::Idle, None);
            }
        }
        self.registry.unregister(project_id);
        let db = self.db.clone();
        let id = project_id.to_string();
        blocking(move || db.remove_project(&id)).await
    }

    async fn image_store(&self, image_id: &str) -> Result<Option<(String, Arc<SidecarStore>)>> {
        let db = self.db.clone();
        let id = image_id.to_string();
        let found = blocking(move || {
            let Some(image) = db.get_image(&id)? else {
                return Ok(None);
            };
            Ok(db.get_project(&image.project_id)?.map(|p| (image.file_name, p)))
        })
        .await?;
        match found {
            Some((file_name, project)) => Ok(Some((file_name, self.store_for(&project).await?))),
            None => Ok(None),
        }
    }

    /// Set a rating (0-5) in the cache and mirror it into the sidecar.
    pub async fn set_rating(&self, image_id: &str, rating: u8) -> Result<bool> {
        let Some((file_name, store)) = self.image_store(image_id).await? else {
            return Ok(false);
        };
        let rating = rating.min(5);
        let db = self.db.clone();
        let id = image_id.to_string();
        blocking(move || {
            let updated = db.set_rating(&id, rating)?;
            if let Err(e) = store.update_metadata(&file_name, |m| m.rating = Some(rating)) {
                warn!("Failed to mirror rating for {}: {:#}", file_name, e);
            }
            Ok(updated)
        })
        .await
    }

    /// Replace an image's tags in the cache and mirror them into the sidecar.
    pub async fn set_tags(&self, image_id: &str, tags: Vec<String>) -> Result<bool> {
        let Some((file_name, store)) = self.image_store(image_id).await? else {
            return Ok(false);
        };
        let db = self.db.clone();
        let id = image_id.to_string();
        blocking(move || {
            let updated = db.set_tags(&id, &tags)?;
            let stored = db.get_tags(&id)?;
            if let Err(e) = store.update_metadata(&file_name, |m| m.tags = stored) {
                warn!("Failed to mirror tags for {}: {:#}", file_name, e);
            }
            Ok(updated)
        })
        .await
    }

    pub async fn search(&self, query: &str, project_id: Option<&str>, limit: usize) -> Result<Vec<DisplayRecord>> {
        let db = self.db.clone();
        let urls = self.urls.clone();
        let query = query.to_string();
        let project_id = project_id.map(str::to_string);
        blocking(move || {
            let hits = db.search_images(&query, project_id.as_deref(), limit)?;
            let mut records = Vec::with_capacity(hits.len());
            for image in &hits {
                records.push(urls.display(image, db.get_tags(&image.id)?));
            }
            Ok(records)
        })
        .await
    }

    /// Delete derivatives whose source file is gone from the project folder.
    pub async fn sweep_orphans(&self, project_id: &str) -> Result<SweepReport> {
        let db = self.db.clone();
        let id = project_id.to_string();
        let project = blocking(move || db.get_project(&id))
            .await?
            .ok_or_else(|| FolioError::ProjectNotFound(project_id.to_string()))?;
        let store = self.store_for(&project).await?;
        let scanner = self.config.scanner.clone();
        blocking(move || {
            let existing: HashSet<String> = discover_images(store.source_root(), &scanner)?
                .into_iter()
                .map(|f| f.file_name)
                .collect();
            store.sweep_orphans(&existing)
        })
        .await
    }

    /// Drop stale, unannotated rows per the retention setting.
    pub async fn cleanup_orphaned(&self) -> Result<usize> {
        let db = self.db.clone();
        let days = self.config.retention.orphan_days;
        blocking(move || db.cleanup_orphaned(days)).await
    }
}
