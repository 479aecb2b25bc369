use anyhow::{Context, Result};
use serde::Serialize;
use std::collections::HashSet;
use std::fs;
use std::path::Path;
use std::time::{Duration, SystemTime};
use tracing::{debug, info, warn};

use super::{modified_time, SidecarStore, Tier, TEMP_EXTENSION};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub removed: usize,
    pub kept: usize,
}

/// Derivative or metadata file name -> inferred source file name.
fn inferred_source(file_name: &str) -> Option<String> {
    if let Some((source, _)) = Tier::parse_file_name(file_name) {
        return Some(source);
    }
    file_name
        .strip_suffix(".json")
        .filter(|source| !source.is_empty())
        .map(str::to_string)
}

/// Temp files younger than this may belong to a write still in flight.
const TEMP_GRACE: Duration = Duration::from_secs(10 * 60);

fn is_abandoned(temp: &Path) -> bool {
    modified_time(temp)
        .ok()
        .and_then(|mtime| SystemTime::now().duration_since(mtime).ok())
        .is_some_and(|age| age >= TEMP_GRACE)
}

impl SidecarStore {
    /// Delete derivatives and metadata sidecars whose source file name is not
    /// in `existing`, plus temp files left behind by interrupted writes.
    /// Files that do not look like ours are left alone.
    pub fn sweep_orphans(&self, existing: &HashSet<String>) -> Result<SweepReport> {
        let mut report = SweepReport::default();
        for dir in [self.thumbnails_dir(), self.previews_dir(), self.metadata_dir()] {
            self.sweep_dir(&dir, existing, &mut report)?;
        }
        info!(
            "Orphan sweep of {}: removed {}, kept {}",
            self.root().display(),
            report.removed,
            report.kept
        );
        Ok(report)
    }

    fn sweep_dir(&self, dir: &Path, existing: &HashSet<String>, report: &mut SweepReport) -> Result<()> {
        let entries = match fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e).with_context(|| format!("Failed to list {}", dir.display())),
        };

        for entry in entries.flatten() {
            let path = entry.path();
            if !path.is_file() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().to_string();

            let orphan = if name.starts_with('.') {
                name.ends_with(&format!(".{}", TEMP_EXTENSION)) && is_abandoned(&path)
            } else {
                match inferred_source(&name) {
                    Some(source) => !existing.contains(&source),
                    None => false,
                }
            };

            if !orphan {
                report.kept += 1;
                continue;
            }
            match fs::remove_file(&path) {
                Ok(()) => {
                    debug!("Swept {}", path.display());
                    report.removed += 1;
                }
                Err(e) => warn!("Failed to sweep {}: {}", path.display(), e),
            }
        }
        Ok(())
    }
}
