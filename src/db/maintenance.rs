//! Self-tuning and retention for the metadata cache.

use anyhow::Result;
use rusqlite::{params, Connection};
use std::sync::atomic::Ordering;
use tracing::{debug, error, info, warn};

use super::{now_millis, Database};

const DAY_MILLIS: i64 = 24 * 60 * 60 * 1000;

/// Ask the FTS index to merge its segments.
fn optimize_fts(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute("INSERT INTO images_fts(images_fts) VALUES ('optimize')", [])?;
    Ok(())
}

fn checkpoint(conn: &Connection) -> rusqlite::Result<()> {
    // Returns (busy, log frames, checkpointed frames); only success matters.
    conn.query_row("PRAGMA wal_checkpoint(TRUNCATE)", [], |_| Ok(()))
}

impl Database {
    /// Count writes and refresh planner statistics every
    /// `analyze_every_writes` of them.
    pub(crate) fn record_writes(&self, count: u32) {
        let every = self.maintenance.analyze_every_writes.max(1);
        let before = self.writes.fetch_add(count, Ordering::Relaxed);
        if before / every == (before + count) / every {
            return;
        }
        match self.conn().and_then(|conn| Ok(conn.execute_batch("ANALYZE;")?)) {
            Ok(()) => debug!("Refreshed query planner statistics after {} writes", before + count),
            Err(e) => warn!("Statistics refresh failed: {}", e),
        }
    }

    pub(crate) fn startup_maintenance(&self) -> Result<()> {
        let conn = self.conn()?;
        conn.execute_batch("PRAGMA optimize;")?;
        optimize_fts(&conn)?;
        checkpoint(&conn)?;
        debug!("Startup optimize and checkpoint complete");
        Ok(())
    }

    /// Graceful shutdown: optimize, checkpoint the WAL, and compact the file
    /// when too much of it is free pages.
    pub fn close(&self) -> Result<()> {
        let conn = self.conn()?;
        conn.execute_batch("PRAGMA optimize;")?;
        optimize_fts(&conn)?;
        checkpoint(&conn)?;

        let free: i64 = conn.query_row("PRAGMA freelist_count", [], |row| row.get(0))?;
        let total: i64 = conn.query_row("PRAGMA page_count", [], |row| row.get(0))?;
        if total > 0 && free as f64 / total as f64 > self.maintenance.vacuum_free_ratio {
            info!("Compacting metadata cache ({} of {} pages free)", free, total);
            conn.execute_batch("VACUUM;")?;
            checkpoint(&conn)?;
        }
        info!("Metadata cache closed");
        Ok(())
    }

    /// Drop noise rows: unrated, untagged and not modified for `older_than_days`.
    pub fn cleanup_orphaned(&self, older_than_days: u32) -> Result<usize> {
        let cutoff = now_millis() - older_than_days as i64 * DAY_MILLIS;
        let removed = self.conn()?.execute(
            r#"
            DELETE FROM images
            WHERE rating = 0
              AND tag_text = ''
              AND NOT EXISTS (SELECT 1 FROM image_tags t WHERE t.image_id = images.id)
              AND modified_at < ?1
            "#,
            params![cutoff],
        )
        .inspect_err(|e| error!("Retention cleanup failed: {}", e))?;
        self.record_writes(1);
        info!("Retention cleanup removed {} rows", removed);
        Ok(removed)
    }

    #[cfg(test)]
    pub(crate) fn writes_recorded(&self) -> u32 {
        self.writes.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MaintenanceConfig;
    use crate::db::ImageRecord;

    fn image(name: &str, modified_at: i64, rating: u8) -> ImageRecord {
        ImageRecord {
            id: format!("/p/{}", name),
            project_id: "p".to_string(),
            file_path: format!("/p/{}", name),
            file_name: name.to_string(),
            file_size_bytes: 1,
            width: None,
            height: None,
            created_at: 0,
            modified_at,
            rating,
        }
    }

    #[test]
    fn test_cleanup_orphaned_retention_policy() {
        let db = Database::open_in_memory().unwrap();
        db.upsert_project("p", "P", "/p").unwrap();

        let old = now_millis() - 31 * DAY_MILLIS;
        db.upsert_images_batch(&[
            image("noise.jpg", old, 0),
            image("rated.jpg", old, 2),
            image("tagged.jpg", old, 0),
            image("recent.jpg", now_millis(), 0),
        ])
        .unwrap();
        db.set_tags("/p/tagged.jpg", &["keep".to_string()]).unwrap();

        assert_eq!(db.cleanup_orphaned(30).unwrap(), 1);
        let names: Vec<String> = db
            .get_images_by_project("p")
            .unwrap()
            .into_iter()
            .map(|r| r.file_name)
            .collect();
        assert_eq!(names.len(), 3);
        assert!(!names.contains(&"noise.jpg".to_string()));
    }

    #[test]
    fn test_write_counter_crosses_analyze_threshold() {
        let db = Database::open_in_memory().unwrap();
        db.upsert_project("p", "P", "/p").unwrap();

        let records: Vec<ImageRecord> = (0..150).map(|i| image(&format!("{}.jpg", i), 1, 0)).collect();
        db.upsert_images_batch(&records).unwrap();
        assert_eq!(db.writes_recorded(), 151);

        let stats: i64 = db
            .conn()
            .unwrap()
            .query_row("SELECT COUNT(*) FROM sqlite_master WHERE name = 'sqlite_stat1'", [], |row| row.get(0))
            .unwrap();
        assert_eq!(stats, 1);
    }

    #[test]
    fn test_close_vacuums_fragmented_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("folio.db");
        let config = MaintenanceConfig {
            analyze_every_writes: 100,
            vacuum_free_ratio: 0.1,
        };
        let db = Database::open(&path, config).unwrap();
        db.upsert_project("p", "P", "/p").unwrap();
        let records: Vec<ImageRecord> = (0..500).map(|i| image(&format!("{:04}.jpg", i), 1, 0)).collect();
        db.upsert_images_batch(&records).unwrap();
        db.remove_project("p").unwrap();

        db.close().unwrap();
        let free: i64 = db
            .conn()
            .unwrap()
            .query_row("PRAGMA freelist_count", [], |row| row.get(0))
            .unwrap();
        assert_eq!(free, 0);
    }
}
