use anyhow::Result;
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::{debug, error};

use super::Database;

/// One known source image.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageRecord {
    /// Absolute source path.
    pub id: String,
    pub project_id: String,
    pub file_path: String,
    pub file_name: String,
    pub file_size_bytes: u64,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub created_at: i64,
    /// Source mtime (unix millis) at the last successful processing.
    pub modified_at: i64,
    pub rating: u8,
}

pub(crate) const IMAGE_COLUMNS: &str = "id, project_id, file_path, file_name, file_size_bytes, \
     width, height, created_at, modified_at, rating";

pub(crate) fn row_to_image(row: &Row<'_>) -> rusqlite::Result<ImageRecord> {
    Ok(ImageRecord {
        id: row.get(0)?,
        project_id: row.get(1)?,
        file_path: row.get(2)?,
        file_name: row.get(3)?,
        file_size_bytes: row.get::<_, i64>(4)?.max(0) as u64,
        width: row.get(5)?,
        height: row.get(6)?,
        created_at: row.get(7)?,
        modified_at: row.get(8)?,
        rating: row.get::<_, i64>(9)?.clamp(0, 5) as u8,
    })
}

/// Insert, or overwrite only when the incoming mtime is strictly newer.
/// Returns whether a row was written.
fn upsert_on(conn: &Connection, record: &ImageRecord) -> rusqlite::Result<bool> {
    let changed = conn.execute(
        r#"
        INSERT INTO images (
            id, project_id, file_path, file_name, file_size_bytes,
            width, height, created_at, modified_at, rating
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
        ON CONFLICT(id) DO UPDATE SET
            file_path = excluded.file_path,
            file_size_bytes = excluded.file_size_bytes,
            width = excluded.width,
            height = excluded.height,
            modified_at = excluded.modified_at,
            rating = excluded.rating
        WHERE excluded.modified_at > images.modified_at
        "#,
        params![
            record.id,
            record.project_id,
            record.file_path,
            record.file_name,
            record.file_size_bytes as i64,
            record.width,
            record.height,
            record.created_at,
            record.modified_at,
            record.rating.min(5),
        ],
    )?;
    Ok(changed > 0)
}

/// Delete rows by file name in one transaction. Nothing is removed unless
/// every statement succeeds.
fn delete_on(conn: &mut Connection, project_id: &str, file_names: &[String]) -> rusqlite::Result<usize> {
    let tx = conn.transaction()?;
    let mut removed = 0;
    {
        let mut stmt = tx.prepare("DELETE FROM images WHERE project_id = ?1 AND file_name = ?2")?;
        for name in file_names {
            removed += stmt.execute(params![project_id, name])?;
        }
    }
    tx.commit()?;
    Ok(removed)
}

fn tag_on(conn: &mut Connection, id: &str, tags: &[String]) -> rusqlite::Result<bool> {
    let tx = conn.transaction()?;
    let updated = tx.execute(
        "UPDATE images SET tag_text = ?1 WHERE id = ?2",
        params![tags.join(" "), id],
    )?;
    if updated > 0 {
        tx.execute("DELETE FROM image_tags WHERE image_id = ?1", [id])?;
        let mut stmt = tx.prepare("INSERT INTO image_tags (image_id, tag) VALUES (?1, ?2)")?;
        for tag in tags {
            stmt.execute(params![id, tag])?;
        }
    }
    tx.commit()?;
    Ok(updated > 0)
}

impl Database {
    pub fn upsert_image(&self, record: &ImageRecord) -> Result<bool> {
        let written = upsert_on(&*self.conn()?, record)
            .inspect_err(|e| error!("Failed to upsert image {}: {}", record.id, e))?;
        self.record_writes(1);
        Ok(written)
    }

    /// Same semantics as `upsert_image`, in one transaction. Returns the
    /// number of rows actually written.
    pub fn upsert_images_batch(&self, records: &[ImageRecord]) -> Result<usize> {
        if records.is_empty() {
            return Ok(0);
        }
        let written = {
            let mut conn = self.conn()?;
            let tx = conn.transaction()?;
            let mut written = 0;
            for record in records {
                if upsert_on(&tx, record)
                    .inspect_err(|e| error!("Batch upsert failed at {}: {}", record.id, e))?
                {
                    written += 1;
                }
            }
            tx.commit()?;
            written
        };
        debug!("Batch upsert wrote {}/{} rows", written, records.len());
        self.record_writes(records.len() as u32);
        Ok(written)
    }

    pub fn get_image(&self, id: &str) -> Result<Option<ImageRecord>> {
        let conn = self.conn()?;
        let record = conn
            .query_row(
                &format!("SELECT {} FROM images WHERE id = ?1", IMAGE_COLUMNS),
                [id],
                row_to_image,
            )
            .optional()?;
        Ok(record)
    }

    /// All images of a project, most recently modified first.
    pub fn get_images_by_project(&self, project_id: &str) -> Result<Vec<ImageRecord>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM images WHERE project_id = ?1 ORDER BY modified_at DESC, file_name",
            IMAGE_COLUMNS
        ))?;
        let records = stmt
            .query_map([project_id], row_to_image)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(records)
    }

    pub fn delete_image(&self, id: &str) -> Result<bool> {
        let removed = self
            .conn()?
            .execute("DELETE FROM images WHERE id = ?1", [id])
            .inspect_err(|e| error!("Failed to delete image {}: {}", id, e))?;
        self.record_writes(1);
        Ok(removed > 0)
    }

    /// Delete the named files of a project in one transaction.
    pub fn delete_images(&self, project_id: &str, file_names: &[String]) -> Result<usize> {
        if file_names.is_empty() {
            return Ok(0);
        }
        let removed = delete_on(&mut *self.conn()?, project_id, file_names)
            .inspect_err(|e| error!("Failed to delete images of {}: {}", project_id, e))?;
        self.record_writes(file_names.len() as u32);
        Ok(removed)
    }

    pub fn set_rating(&self, id: &str, rating: u8) -> Result<bool> {
        let updated = self
            .conn()?
            .execute(
                "UPDATE images SET rating = ?1 WHERE id = ?2",
                params![rating.min(5), id],
            )
            .inspect_err(|e| error!("Failed to rate image {}: {}", id, e))?;
        self.record_writes(1);
        Ok(updated > 0)
    }

    /// Replace the tag set of an image and refresh its searchable tag text.
    pub fn set_tags(&self, id: &str, tags: &[String]) -> Result<bool> {
        let mut tags: Vec<String> = tags
            .iter()
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty())
            .collect();
        tags.sort();
        tags.dedup();

        let updated = tag_on(&mut *self.conn()?, id, &tags)
            .inspect_err(|e| error!("Failed to tag image {}: {}", id, e))?;
        self.record_writes(1);
        Ok(updated)
    }

    pub fn get_tags(&self, id: &str) -> Result<Vec<String>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare("SELECT tag FROM image_tags WHERE image_id = ?1 ORDER BY tag")?;
        let tags = stmt
            .query_map([id], |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<String>>>()?;
        Ok(tags)
    }

    /// Tags for every image of a project, keyed by image id.
    pub fn get_tags_by_project(&self, project_id: &str) -> Result<HashMap<String, Vec<String>>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            r#"
            SELECT t.image_id, t.tag
            FROM image_tags t
            JOIN images i ON i.id = t.image_id
            WHERE i.project_id = ?1
            ORDER BY t.image_id, t.tag
            "#,
        )?;
        let mut map: HashMap<String, Vec<String>> = HashMap::new();
        let rows = stmt.query_map([project_id], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?;
        for row in rows {
            let (image_id, tag) = row?;
            map.entry(image_id).or_default().push(tag);
        }
        Ok(map)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn db_with_project() -> Database {
        let db = Database::open_in_memory().unwrap();
        db.upsert_project("p1", "Photos", "/photos").unwrap();
        db
    }

    fn record(name: &str, modified_at: i64, rating: u8) -> ImageRecord {
        ImageRecord {
            id: format!("/photos/{}", name),
            project_id: "p1".to_string(),
            file_path: format!("/photos/{}", name),
            file_name: name.to_string(),
            file_size_bytes: 1024,
            width: Some(800),
            height: Some(600),
            created_at: 1_000,
            modified_at,
            rating,
        }
    }

    #[test]
    fn test_stale_rescan_keeps_rating() {
        let db = db_with_project();
        let t0 = 1_000;
        let t1 = 2_000;

        assert!(db.upsert_image(&record("photo.jpg", t1, 5)).unwrap());
        assert!(!db.upsert_image(&record("photo.jpg", t0, 0)).unwrap());

        let stored = db.get_image("/photos/photo.jpg").unwrap().unwrap();
        assert_eq!(stored.rating, 5);
        assert_eq!(stored.modified_at, t1);
    }

    #[test]
    fn test_equal_mtime_is_not_applied() {
        let db = db_with_project();
        db.upsert_image(&record("a.jpg", 1_000, 3)).unwrap();

        let mut same = record("a.jpg", 1_000, 0);
        same.width = Some(1);
        assert!(!db.upsert_image(&same).unwrap());

        let stored = db.get_image("/photos/a.jpg").unwrap().unwrap();
        assert_eq!(stored.rating, 3);
        assert_eq!(stored.width, Some(800));
    }

    #[test]
    fn test_newer_mtime_overwrites_fields() {
        let db = db_with_project();
        db.upsert_image(&record("a.jpg", 1_000, 3)).unwrap();

        let mut newer = record("a.jpg", 5_000, 4);
        newer.width = Some(1600);
        assert!(db.upsert_image(&newer).unwrap());

        let stored = db.get_image("/photos/a.jpg").unwrap().unwrap();
        assert_eq!(stored.rating, 4);
        assert_eq!(stored.width, Some(1600));
        assert_eq!(stored.created_at, 1_000);
    }

    #[test]
    fn test_batch_upsert_and_ordering() {
        let db = db_with_project();
        let records = vec![
            record("old.jpg", 1_000, 0),
            record("new.jpg", 3_000, 0),
            record("mid.jpg", 2_000, 0),
        ];
        assert_eq!(db.upsert_images_batch(&records).unwrap(), 3);
        // Replaying the same batch writes nothing
        assert_eq!(db.upsert_images_batch(&records).unwrap(), 0);

        let names: Vec<String> = db
            .get_images_by_project("p1")
            .unwrap()
            .into_iter()
            .map(|r| r.file_name)
            .collect();
        assert_eq!(names, vec!["new.jpg", "mid.jpg", "old.jpg"]);
    }

    #[test]
    fn test_one_row_per_project_and_name() {
        let db = db_with_project();
        db.upsert_image(&record("a.jpg", 1_000, 0)).unwrap();
        db.upsert_image(&record("a.jpg", 2_000, 0)).unwrap();
        assert_eq!(db.get_images_by_project("p1").unwrap().len(), 1);
    }

    #[test]
    fn test_delete_images_by_name() {
        let db = db_with_project();
        db.upsert_images_batch(&[record("a.jpg", 1, 0), record("b.jpg", 1, 0), record("c.jpg", 1, 0)])
            .unwrap();

        let removed = db
            .delete_images("p1", &["a.jpg".to_string(), "missing.jpg".to_string()])
            .unwrap();
        assert_eq!(removed, 1);
        assert!(db.delete_image("/photos/b.jpg").unwrap());
        assert_eq!(db.get_images_by_project("p1").unwrap().len(), 1);
    }

    #[test]
    fn test_set_rating_and_tags() {
        let db = db_with_project();
        db.upsert_image(&record("a.jpg", 1, 0)).unwrap();

        assert!(db.set_rating("/photos/a.jpg", 9).unwrap());
        assert_eq!(db.get_image("/photos/a.jpg").unwrap().unwrap().rating, 5);

        let tags = vec!["sunset".to_string(), " beach ".to_string(), "sunset".to_string()];
        assert!(db.set_tags("/photos/a.jpg", &tags).unwrap());
        assert_eq!(db.get_tags("/photos/a.jpg").unwrap(), vec!["beach", "sunset"]);

        let by_project = db.get_tags_by_project("p1").unwrap();
        assert_eq!(by_project["/photos/a.jpg"].len(), 2);

        assert!(!db.set_tags("/photos/none.jpg", &tags).unwrap());
    }

    #[test]
    fn test_failed_tagging_rolls_back_tag_text() {
        let db = db_with_project();
        db.upsert_image(&record("a.jpg", 1, 0)).unwrap();
        db.set_tags("/photos/a.jpg", &["beach".to_string()]).unwrap();
        db.conn().unwrap().execute_batch("DROP TABLE image_tags").unwrap();

        assert!(db.set_tags("/photos/a.jpg", &["sunset".to_string()]).is_err());
        let tag_text: String = db
            .conn()
            .unwrap()
            .query_row("SELECT tag_text FROM images WHERE id = '/photos/a.jpg'", [], |row| row.get(0))
            .unwrap();
        assert_eq!(tag_text, "beach");
    }
}
