use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::{Component, Path};

use crate::db::ImageRecord;
use crate::server::http::encode_segment;
use crate::sidecar::Tier;

/// What the UI layer renders for one image.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DisplayRecord {
    pub id: String,
    pub name: String,
    pub path: String,
    pub thumbnail_url: String,
    pub standard_preview_url: String,
    pub full_preview_url: String,
    /// Always servable: the full tier (which falls back to standard), or the
    /// original file for degraded records.
    pub url: String,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub rating: u8,
    pub tags: Vec<String>,
    pub date: String,
}

/// Builds derivative URLs from project id and file name alone.
#[derive(Debug, Clone)]
pub struct UrlBuilder {
    base: String,
}

impl UrlBuilder {
    pub fn new(base: impl Into<String>) -> Self {
        Self {
            base: base.into().trim_end_matches('/').to_string(),
        }
    }

    pub fn derivative_url(&self, tier: Tier, project_id: &str, file_name: &str) -> String {
        format!(
            "{}/{}/{}/{}",
            self.base,
            tier.route(),
            encode_segment(project_id),
            encode_segment(file_name)
        )
    }

    pub fn display(&self, record: &ImageRecord, tags: Vec<String>) -> DisplayRecord {
        let full = self.derivative_url(Tier::Full, &record.project_id, &record.file_name);
        DisplayRecord {
            id: record.id.clone(),
            name: record.file_name.clone(),
            path: record.file_path.clone(),
            thumbnail_url: self.derivative_url(Tier::Thumbnail, &record.project_id, &record.file_name),
            standard_preview_url: self.derivative_url(Tier::Standard, &record.project_id, &record.file_name),
            full_preview_url: full.clone(),
            url: full,
            width: record.width,
            height: record.height,
            rating: record.rating,
            tags,
            date: format_millis(record.modified_at),
        }
    }

    /// Fallback record pointing straight at the original file, used when the
    /// pipeline failed part way.
    pub fn degraded(&self, project_id: &str, source: &Path, modified_at: i64) -> DisplayRecord {
        let name = source
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        let path = source.to_string_lossy().to_string();
        DisplayRecord {
            id: path.clone(),
            thumbnail_url: self.derivative_url(Tier::Thumbnail, project_id, &name),
            standard_preview_url: self.derivative_url(Tier::Standard, project_id, &name),
            full_preview_url: self.derivative_url(Tier::Full, project_id, &name),
            url: file_url(source),
            name,
            path,
            width: None,
            height: None,
            rating: 0,
            tags: Vec::new(),
            date: format_millis(modified_at),
        }
    }
}

/// `file://` URL with every path segment percent-encoded.
fn file_url(source: &Path) -> String {
    let segments: Vec<String> = source
        .components()
        .filter_map(|c| match c {
            Component::Normal(part) => Some(encode_segment(&part.to_string_lossy())),
            _ => None,
        })
        .collect();
    format!("file:///{}", segments.join("/"))
}

fn format_millis(millis: i64) -> String {
    DateTime::<Utc>::from_timestamp_millis(millis)
        .unwrap_or_default()
        .to_rfc3339()
}
