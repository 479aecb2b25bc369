//! Per-file processing shared by the initial diff and the live watch.
//!
//! Order within one file: thumbnail, dimensions, sidecar metadata merge,
//! cache upsert, then previews scheduled in the background. The initial diff
//! prepares a whole batch first and commits it in one transaction; the watch
//! commits file by file. Any failure before the upsert completes yields a
//! degraded record that points at the original file.

use anyhow::Result;
use std::fs;
use std::sync::Arc;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, warn};

use super::discovery::system_time_millis;
use super::display::{DisplayRecord, UrlBuilder};
use crate::db::{Database, ImageRecord};
use crate::sidecar::{SidecarMetadata, SidecarStore, Tier};

/// Result of pushing one file through the pipeline.
#[derive(Debug, Clone)]
pub struct Processed {
    pub record: DisplayRecord,
    /// Source mtime observed when processing started.
    pub modified_at: i64,
    pub degraded: bool,
}

/// A file with its thumbnail written, waiting for the cache upsert.
struct Prepared {
    file_name: String,
    record: ImageRecord,
    sidecar: Option<SidecarMetadata>,
}

#[derive(Clone)]
pub struct Pipeline {
    db: Arc<Database>,
    store: Arc<SidecarStore>,
    project_id: String,
    urls: UrlBuilder,
}

impl Pipeline {
    pub fn new(db: Arc<Database>, store: Arc<SidecarStore>, project_id: &str, urls: UrlBuilder) -> Self {
        Self {
            db,
            store,
            project_id: project_id.to_string(),
            urls,
        }
    }

    pub fn store(&self) -> &SidecarStore {
        &self.store
    }

    pub fn project_id(&self) -> &str {
        &self.project_id
    }

    /// Never fails: errors are logged and turned into a degraded record.
    pub async fn process(&self, file_name: &str) -> Processed {
        let committed = match self.prepare(file_name).await {
            Ok(prepared) => self.commit(vec![prepared], false).await,
            Err(e) => Err(e),
        };
        match committed.map(|mut processed| processed.pop()) {
            Ok(Some(processed)) => processed,
            Ok(None) => self.degraded(file_name, &anyhow::anyhow!("nothing committed")),
            Err(e) => self.degraded(file_name, &e),
        }
    }

    /// Process several files concurrently and commit the successful ones
    /// in a single transaction. Results come back in completion order.
    pub async fn process_batch(&self, file_names: &[String]) -> Vec<(String, Processed)> {
        let mut tasks = JoinSet::new();
        for name in file_names {
            let pipeline = self.clone();
            let name = name.clone();
            tasks.spawn(async move {
                let prepared = pipeline.prepare(&name).await;
                (name, prepared)
            });
        }

        let mut results = Vec::with_capacity(file_names.len());
        let mut prepared = Vec::with_capacity(file_names.len());
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((_, Ok(ready))) => prepared.push(ready),
                Ok((name, Err(e))) => {
                    let processed = self.degraded(&name, &e);
                    results.push((name, processed));
                }
                Err(e) => warn!("Pipeline task failed: {}", e),
            }
        }

        let names: Vec<String> = prepared.iter().map(|p| p.file_name.clone()).collect();
        match self.commit(prepared, true).await {
            Ok(committed) => results.extend(names.into_iter().zip(committed)),
            Err(e) => {
                for name in names {
                    let processed = self.degraded(&name, &e);
                    results.push((name, processed));
                }
            }
        }
        results
    }

    fn degraded(&self, file_name: &str, e: &anyhow::Error) -> Processed {
        let source = self.store.source_path(file_name);
        warn!("Processing {} failed, falling back to original: {:#}", source.display(), e);
        let modified_at = fs::metadata(&source)
            .and_then(|m| m.modified())
            .map(system_time_millis)
            .unwrap_or(0);
        Processed {
            record: self.urls.degraded(&self.project_id, &source, modified_at),
            modified_at,
            degraded: true,
        }
    }

    /// Thumbnail, dimensions and sidecar metadata. Nothing touches the cache.
    async fn prepare(&self, file_name: &str) -> Result<Prepared> {
        let store = self.store.clone();
        let name = file_name.to_string();
        let (source_meta, rendition, sidecar) = tokio::task::spawn_blocking(move || -> Result<_> {
            let source_meta = fs::metadata(store.source_path(&name))?;
            let rendition = store.generate(Tier::Thumbnail, &name)?;
            let sidecar = store.read_metadata(&name)?;
            Ok((source_meta, rendition, sidecar))
        })
        .await??;

        let modified_at = system_time_millis(source_meta.modified()?);
        let source_path = self.store.source_path(file_name).to_string_lossy().to_string();
        let record = ImageRecord {
            id: source_path.clone(),
            project_id: self.project_id.clone(),
            file_path: source_path,
            file_name: file_name.to_string(),
            file_size_bytes: source_meta.len(),
            width: Some(rendition.source.width),
            height: Some(rendition.source.height),
            created_at: source_meta.created().map(system_time_millis).unwrap_or(modified_at),
            modified_at,
            rating: 0,
        };
        Ok(Prepared {
            file_name: file_name.to_string(),
            record,
            sidecar,
        })
    }

    /// Merge sidecar ratings and tags, upsert, then queue the larger tiers.
    /// Output order follows `prepared`.
    async fn commit(&self, prepared: Vec<Prepared>, batched: bool) -> Result<Vec<Processed>> {
        if prepared.is_empty() {
            return Ok(Vec::new());
        }
        let db = self.db.clone();
        let committed = tokio::task::spawn_blocking(move || -> Result<Vec<_>> {
            let mut records = Vec::with_capacity(prepared.len());
            let mut sidecars = Vec::with_capacity(prepared.len());
            for Prepared { mut record, sidecar, .. } in prepared {
                let existing = db.get_image(&record.id)?;
                // The cache wins; the sidecar fills in what the cache lacks.
                record.rating = existing
                    .map(|e| e.rating)
                    .filter(|r| *r > 0)
                    .or(sidecar.as_ref().and_then(|m| m.rating))
                    .unwrap_or(0);
                records.push(record);
                sidecars.push(sidecar);
            }

            if batched {
                db.upsert_images_batch(&records)?;
            } else {
                for record in &records {
                    db.upsert_image(record)?;
                }
            }

            let mut committed = Vec::with_capacity(records.len());
            for (record, sidecar) in records.into_iter().zip(sidecars) {
                let mut tags = db.get_tags(&record.id)?;
                if let Some(side) = sidecar.filter(|m| !m.tags.is_empty()) {
                    if tags.is_empty() {
                        db.set_tags(&record.id, &side.tags)?;
                        tags = db.get_tags(&record.id)?;
                    }
                }
                let modified_at = record.modified_at;
                let stored = db.get_image(&record.id)?.unwrap_or(record);
                committed.push((stored, tags, modified_at));
            }
            Ok(committed)
        })
        .await??;

        Ok(committed
            .into_iter()
            .map(|(stored, tags, modified_at)| {
                self.schedule_previews(&stored.file_name);
                Processed {
                    record: self.urls.display(&stored, tags),
                    modified_at,
                    degraded: false,
                }
            })
            .collect())
    }

    /// Standard and full tiers, off the discovery path. The task only holds
    /// folder paths and the file name, so it can outlive the session.
    pub fn schedule_previews(&self, file_name: &str) -> JoinHandle<()> {
        let store = SidecarStore::clone(&self.store);
        let name = file_name.to_string();
        tokio::task::spawn_blocking(move || {
            for tier in [Tier::Standard, Tier::Full] {
                match store.generate(tier, &name) {
                    Ok(rendition) => debug!("{:?} for {}: {:?}", tier, name, rendition.status),
                    Err(e) => {
                        warn!("Background {:?} for {} failed: {:#}", tier, name, e);
                        break;
                    }
                }
            }
        })
    }

    /// Drop cache rows for files that left the folder. Returns the names
    /// that actually had a row.
    pub async fn remove(&self, file_names: Vec<String>) -> Result<Vec<String>> {
        let db = self.db.clone();
        let project_id = self.project_id.clone();
        tokio::task::spawn_blocking(move || -> Result<Vec<String>> {
            let mut removed = Vec::with_capacity(file_names.len());
            for name in file_names {
                if db.delete_images(&project_id, std::slice::from_ref(&name))? > 0 {
                    removed.push(name);
                }
            }
            Ok(removed)
        })
        .await?
    }
}
