//! Folder enumeration and the diff against the cached snapshot.

use anyhow::Result;
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};
use walkdir::WalkDir;

use crate::config::ScannerConfig;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredFile {
    pub file_name: String,
    pub modified_at: i64,
    pub size_bytes: u64,
}

pub fn system_time_millis(time: SystemTime) -> i64 {
    match time.duration_since(UNIX_EPOCH) {
        Ok(d) => d.as_millis() as i64,
        Err(e) => -(e.duration().as_millis() as i64),
    }
}

/// Image files directly inside `directory`. Dotfiles (and with them the
/// sidecar tree) and subdirectories are skipped.
pub fn discover_images(directory: &Path, scanner: &ScannerConfig) -> Result<Vec<DiscoveredFile>> {
    let mut images = Vec::new();

    for entry in WalkDir::new(directory)
        .min_depth(1)
        .max_depth(1)
        .follow_links(false)
        .into_iter()
        .filter_map(|e| e.ok())
    {
        let name = entry.file_name().to_string_lossy().to_string();
        if name.starts_with('.') || !entry.file_type().is_file() {
            continue;
        }
        if !scanner.is_image(entry.path()) {
            continue;
        }
        // Files vanishing mid-listing are picked up by the next cycle.
        let Ok(meta) = entry.metadata() else {
            continue;
        };
        images.push(DiscoveredFile {
            file_name: name,
            modified_at: meta.modified().map(system_time_millis).unwrap_or(0),
            size_bytes: meta.len(),
        });
    }

    images.sort_by(|a, b| a.file_name.cmp(&b.file_name));
    Ok(images)
}

/// Difference between what is on disk and what the cache knew.
#[derive(Debug, Clone, Default)]
pub struct FolderDiff {
    /// On disk, not cached.
    pub new_files: Vec<DiscoveredFile>,
    /// Cached, but the file on disk has a newer mtime.
    pub modified_files: Vec<DiscoveredFile>,
    /// Cached, no longer on disk.
    pub vanished: Vec<String>,
}

impl FolderDiff {
    pub fn has_changes(&self) -> bool {
        !self.new_files.is_empty() || !self.modified_files.is_empty() || !self.vanished.is_empty()
    }

    /// Files that have to go through the pipeline.
    pub fn to_process(&self) -> impl Iterator<Item = &DiscoveredFile> {
        self.new_files.iter().chain(self.modified_files.iter())
    }
}

/// `cached` maps file name to the mtime stored at last processing.
pub fn diff(cached: &HashMap<String, i64>, on_disk: &[DiscoveredFile]) -> FolderDiff {
    let mut result = FolderDiff::default();
    let mut present = HashSet::with_capacity(on_disk.len());

    for file in on_disk {
        present.insert(file.file_name.as_str());
        match cached.get(&file.file_name) {
            None => result.new_files.push(file.clone()),
            Some(&stored) if file.modified_at > stored => result.modified_files.push(file.clone()),
            Some(_) => {}
        }
    }

    result.vanished = cached
        .keys()
        .filter(|name| !present.contains(name.as_str()))
        .cloned()
        .collect();
    result.vanished.sort();
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::{self, File};
    use tempfile::tempdir;

    fn file(name: &str, modified_at: i64) -> DiscoveredFile {
        DiscoveredFile {
            file_name: name.to_string(),
            modified_at,
            size_bytes: 1,
        }
    }

    #[test]
    fn test_discover_images_is_flat_and_skips_dotfiles() {
        let dir = tempdir().unwrap();

        File::create(dir.path().join("photo1.jpg")).unwrap();
        File::create(dir.path().join("photo2.PNG")).unwrap();
        File::create(dir.path().join("document.txt")).unwrap();
        File::create(dir.path().join(".hidden.jpg")).unwrap();
        fs::create_dir(dir.path().join("subdir")).unwrap();
        File::create(dir.path().join("subdir/photo3.jpeg")).unwrap();
        fs::create_dir(dir.path().join(".folio")).unwrap();
        File::create(dir.path().join(".folio/x.jpg")).unwrap();

        let images = discover_images(dir.path(), &ScannerConfig::default()).unwrap();
        let names: Vec<&str> = images.iter().map(|f| f.file_name.as_str()).collect();

        assert_eq!(names, vec!["photo1.jpg", "photo2.PNG"]);
        assert!(images.iter().all(|f| f.modified_at > 0));
    }

    #[test]
    fn test_diff_classifies_files() {
        let cached: HashMap<String, i64> = [
            ("same.jpg".to_string(), 100),
            ("edited.jpg".to_string(), 100),
            ("gone.jpg".to_string(), 100),
        ]
        .into_iter()
        .collect();
        let on_disk = vec![file("same.jpg", 100), file("edited.jpg", 200), file("fresh.jpg", 50)];

        let result = diff(&cached, &on_disk);

        assert_eq!(result.new_files, vec![file("fresh.jpg", 50)]);
        assert_eq!(result.modified_files, vec![file("edited.jpg", 200)]);
        assert_eq!(result.vanished, vec!["gone.jpg".to_string()]);
        assert_eq!(result.to_process().count(), 2);
        assert!(result.has_changes());
    }

    #[test]
    fn test_diff_older_mtime_is_not_modified() {
        let cached: HashMap<String, i64> = [("a.jpg".to_string(), 500)].into_iter().collect();
        let result = diff(&cached, &[file("a.jpg", 400)]);
        assert!(!result.has_changes());
    }
}
