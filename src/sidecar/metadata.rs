//! Human-readable per-image JSON sidecars holding user metadata.
//!
//! These duplicate rating and tags from the metadata cache so the values
//! survive a lost or rebuilt database.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;
use tracing::warn;

use super::{write_atomic, SidecarStore};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SidecarMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rating: Option<u8>,

    #[serde(default)]
    pub tags: Vec<String>,
}

impl SidecarStore {
    pub fn metadata_path(&self, file_name: &str) -> PathBuf {
        self.metadata_dir().join(format!("{}.json", file_name))
    }

    /// Read the sidecar for a file. Missing files are `None`; unparsable
    /// files are logged and treated as missing.
    pub fn read_metadata(&self, file_name: &str) -> Result<Option<SidecarMetadata>> {
        let path = self.metadata_path(file_name);
        let content = match fs::read_to_string(&path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(e).with_context(|| format!("Failed to read {}", path.display()))
            }
        };
        match serde_json::from_str(&content) {
            Ok(meta) => Ok(Some(meta)),
            Err(e) => {
                warn!("Ignoring malformed sidecar {}: {}", path.display(), e);
                Ok(None)
            }
        }
    }

    pub fn write_metadata(&self, file_name: &str, meta: &SidecarMetadata) -> Result<()> {
        let json = serde_json::to_vec_pretty(meta)?;
        write_atomic(&self.metadata_path(file_name), &json)
    }

    /// Read-modify-write of the sidecar for one file.
    pub fn update_metadata<F>(&self, file_name: &str, update: F) -> Result<SidecarMetadata>
    where
        F: FnOnce(&mut SidecarMetadata),
    {
        let mut meta = self.read_metadata(file_name)?.unwrap_or_default();
        update(&mut meta);
        self.write_metadata(file_name, &meta)?;
        Ok(meta)
    }
}
