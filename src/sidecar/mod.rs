//! Per-project derivative store.
//!
//! Every watched folder owns a hidden sidecar tree inside itself:
//!
//! ```text
//! <folder>/.folio/
//!     thumbnails/   <name>.thumb.jpg
//!     previews/     <name>.standard.jpg, <name>.full.jpg
//!     metadata/     <name>.json
//! ```
//!
//! Paths are a pure function of the folder and the source file name, so a
//! store can be rebuilt from those two facts alone.

mod generate;
mod metadata;
mod sweep;
mod tier;

use anyhow::{Context, Result};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::SystemTime;
use tracing::{debug, info};

pub use generate::{Dimensions, GenerationStatus, Rendition};
pub use metadata::SidecarMetadata;
pub use sweep::SweepReport;
pub use tier::Tier;

use crate::config::DerivativeConfig;
use crate::error::FolioError;

const THUMBNAILS_DIR: &str = "thumbnails";
const PREVIEWS_DIR: &str = "previews";
const METADATA_DIR: &str = "metadata";
/// Spotlight skips directories containing this marker.
const NEVER_INDEX_MARKER: &str = ".metadata_never_index";
const TEMP_EXTENSION: &str = "tmp";

#[derive(Debug, Clone)]
pub struct SidecarStore {
    source_root: PathBuf,
    root: PathBuf,
    config: DerivativeConfig,
}

impl SidecarStore {
    /// Open the store for a folder, creating the sidecar tree on first use.
    pub fn open(source_root: &Path, config: &DerivativeConfig) -> Result<Self, FolioError> {
        if !source_root.is_dir() {
            return Err(FolioError::NotADirectory(source_root.to_path_buf()));
        }
        let store = Self {
            source_root: source_root.to_path_buf(),
            root: source_root.join(&config.sidecar_dir),
            config: config.clone(),
        };
        store.ensure_dirs()?;
        Ok(store)
    }

    fn ensure_dirs(&self) -> Result<(), FolioError> {
        let created = !self.root.exists();
        for dir in [self.thumbnails_dir(), self.previews_dir(), self.metadata_dir()] {
            fs::create_dir_all(&dir).map_err(|source| FolioError::SidecarUnavailable {
                path: dir.clone(),
                source,
            })?;
        }
        let marker = self.root.join(NEVER_INDEX_MARKER);
        if !marker.exists() {
            fs::write(&marker, b"").map_err(|source| FolioError::SidecarUnavailable {
                path: marker.clone(),
                source,
            })?;
        }
        if created {
            info!("Created sidecar directory {}", self.root.display());
        }
        Ok(())
    }

    pub fn source_root(&self) -> &Path {
        &self.source_root
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn config(&self) -> &DerivativeConfig {
        &self.config
    }

    pub fn thumbnails_dir(&self) -> PathBuf {
        self.root.join(THUMBNAILS_DIR)
    }

    pub fn previews_dir(&self) -> PathBuf {
        self.root.join(PREVIEWS_DIR)
    }

    pub fn metadata_dir(&self) -> PathBuf {
        self.root.join(METADATA_DIR)
    }

    pub fn source_path(&self, file_name: &str) -> PathBuf {
        self.source_root.join(file_name)
    }

    pub fn derivative_path(&self, tier: Tier, file_name: &str) -> PathBuf {
        let dir = match tier {
            Tier::Thumbnail => self.thumbnails_dir(),
            Tier::Standard | Tier::Full => self.previews_dir(),
        };
        dir.join(tier.file_name(file_name))
    }

    /// Path of the derivative if it exists on disk right now.
    pub fn existing_derivative(&self, tier: Tier, file_name: &str) -> Option<PathBuf> {
        let path = self.derivative_path(tier, file_name);
        path.is_file().then_some(path)
    }

    /// Remove the whole sidecar tree. The next `open` recreates it empty.
    pub fn purge(&self) -> Result<()> {
        if self.root.exists() {
            fs::remove_dir_all(&self.root)
                .with_context(|| format!("Failed to purge {}", self.root.display()))?;
            info!("Purged sidecar directory {}", self.root.display());
        }
        Ok(())
    }
}

/// Write `bytes` to `target` through a uniquely named temp file in the same
/// directory followed by a rename, so readers never see partial files.
pub(crate) fn write_atomic(target: &Path, bytes: &[u8]) -> Result<()> {
    static COUNTER: AtomicU64 = AtomicU64::new(0);

    let dir = target
        .parent()
        .with_context(|| format!("No parent directory for {}", target.display()))?;
    let name = target
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    let seq = COUNTER.fetch_add(1, Ordering::Relaxed);
    let temp = dir.join(format!(".{}.{}.{}.{}", name, std::process::id(), seq, TEMP_EXTENSION));

    fs::write(&temp, bytes).with_context(|| format!("Failed to write {}", temp.display()))?;
    if let Err(e) = fs::rename(&temp, target) {
        let _ = fs::remove_file(&temp);
        return Err(e).with_context(|| format!("Failed to move into place {}", target.display()));
    }
    debug!("Wrote {} ({} bytes)", target.display(), bytes.len());
    Ok(())
}

pub(crate) fn modified_time(path: &Path) -> Result<SystemTime> {
    let meta = fs::metadata(path).with_context(|| format!("Failed to stat {}", path.display()))?;
    Ok(meta.modified()?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_creates_hidden_tree() {
        let dir = tempfile::tempdir().unwrap();
        let store = SidecarStore::open(dir.path(), &DerivativeConfig::default()).unwrap();

        assert!(store.root().ends_with(".folio"));
        assert!(store.thumbnails_dir().is_dir());
        assert!(store.previews_dir().is_dir());
        assert!(store.metadata_dir().is_dir());
        assert!(store.root().join(NEVER_INDEX_MARKER).exists());
    }

    #[test]
    fn test_open_rejects_missing_folder() {
        let dir = tempfile::tempdir().unwrap();
        let err = SidecarStore::open(&dir.path().join("nope"), &DerivativeConfig::default()).unwrap_err();
        assert!(matches!(err, FolioError::NotADirectory(_)));
    }

    #[test]
    fn test_derivative_paths_are_deterministic() {
        let dir = tempfile::tempdir().unwrap();
        let store = SidecarStore::open(dir.path(), &DerivativeConfig::default()).unwrap();

        assert_eq!(
            store.derivative_path(Tier::Thumbnail, "a.jpg"),
            dir.path().join(".folio/thumbnails/a.jpg.thumb.jpg")
        );
        assert_eq!(
            store.derivative_path(Tier::Full, "a.jpg"),
            dir.path().join(".folio/previews/a.jpg.full.jpg")
        );
        assert!(store.existing_derivative(Tier::Standard, "a.jpg").is_none());
    }

    #[test]
    fn test_write_atomic_leaves_no_temp_files() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("out.bin");

        write_atomic(&target, b"first").unwrap();
        write_atomic(&target, b"second").unwrap();

        assert_eq!(fs::read(&target).unwrap(), b"second");
        let entries: Vec<_> = fs::read_dir(dir.path()).unwrap().collect();
        assert_eq!(entries.len(), 1);
    }

    #[test]
    fn test_purge_removes_tree() {
        let dir = tempfile::tempdir().unwrap();
        let store = SidecarStore::open(dir.path(), &DerivativeConfig::default()).unwrap();
        store.purge().unwrap();
        assert!(!store.root().exists());
        // Purging twice is fine
        store.purge().unwrap();
    }
}
