use anyhow::Result;
use rusqlite::{params, OptionalExtension, Row};
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::path::Path;
use tracing::{error, info};

use super::{now_millis, Database};

/// A watched folder.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Project {
    pub id: String,
    pub name: String,
    pub root_path: String,
    pub created_at: i64,
    pub last_opened: i64,
}

/// Stable, URL-safe project id for a folder: the sanitized folder name plus
/// a short digest of the full path, so re-adding a folder yields the same id
/// and two folders with the same name do not collide.
pub fn project_id_for_path(path: &Path) -> String {
    let full = path.to_string_lossy();
    let digest = Sha256::digest(full.as_bytes());
    let short: String = digest.iter().take(6).map(|b| format!("{:02x}", b)).collect();

    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    let mut slug = String::with_capacity(name.len());
    for c in name.chars() {
        if c.is_ascii_alphanumeric() {
            slug.push(c.to_ascii_lowercase());
        } else if !slug.ends_with('-') {
            slug.push('-');
        }
    }
    let slug = slug.trim_matches('-');

    if slug.is_empty() {
        short
    } else {
        format!("{}-{}", slug, short)
    }
}

const PROJECT_COLUMNS: &str = "id, name, root_path, created_at, last_opened";

fn row_to_project(row: &Row<'_>) -> rusqlite::Result<Project> {
    Ok(Project {
        id: row.get(0)?,
        name: row.get(1)?,
        root_path: row.get(2)?,
        created_at: row.get(3)?,
        last_opened: row.get(4)?,
    })
}

impl Database {
    /// Insert or refresh a project. `created_at` survives repeated calls;
    /// `last_opened` is bumped every time.
    pub fn upsert_project(&self, id: &str, name: &str, root_path: &str) -> Result<Project> {
        let now = now_millis();
        let project = {
            let conn = self.conn()?;
            conn.execute(
                r#"
                INSERT INTO projects (id, name, root_path, created_at, last_opened)
                VALUES (?1, ?2, ?3, ?4, ?4)
                ON CONFLICT(id) DO UPDATE SET
                    name = excluded.name,
                    root_path = excluded.root_path,
                    last_opened = excluded.last_opened
                "#,
                params![id, name, root_path, now],
            )
            .inspect_err(|e| error!("Failed to upsert project {}: {}", id, e))?;

            conn.query_row(
                &format!("SELECT {} FROM projects WHERE id = ?1", PROJECT_COLUMNS),
                [id],
                row_to_project,
            )?
        };
        self.record_writes(1);
        Ok(project)
    }

    pub fn get_project(&self, id: &str) -> Result<Option<Project>> {
        let conn = self.conn()?;
        let project = conn
            .query_row(
                &format!("SELECT {} FROM projects WHERE id = ?1", PROJECT_COLUMNS),
                [id],
                row_to_project,
            )
            .optional()?;
        Ok(project)
    }

    pub fn find_project_by_path(&self, root_path: &str) -> Result<Option<Project>> {
        let conn = self.conn()?;
        let project = conn
            .query_row(
                &format!("SELECT {} FROM projects WHERE root_path = ?1", PROJECT_COLUMNS),
                [root_path],
                row_to_project,
            )
            .optional()?;
        Ok(project)
    }

    /// All projects, most recently opened first.
    pub fn list_projects(&self) -> Result<Vec<Project>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM projects ORDER BY last_opened DESC",
            PROJECT_COLUMNS
        ))?;
        let projects = stmt
            .query_map([], row_to_project)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(projects)
    }

    pub fn touch_project(&self, id: &str) -> Result<()> {
        self.conn()?
            .execute(
                "UPDATE projects SET last_opened = ?1 WHERE id = ?2",
                params![now_millis(), id],
            )
            .inspect_err(|e| error!("Failed to touch project {}: {}", id, e))?;
        self.record_writes(1);
        Ok(())
    }

    /// Remove a project and, through the foreign keys, its images and tags.
    /// Derivative files on disk are untouched.
    pub fn remove_project(&self, id: &str) -> Result<bool> {
        let removed = self
            .conn()?
            .execute("DELETE FROM projects WHERE id = ?1", [id])
            .inspect_err(|e| error!("Failed to remove project {}: {}", id, e))?;
        self.record_writes(1);
        if removed > 0 {
            info!("Removed project {}", id);
        }
        Ok(removed > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::ImageRecord;
    use std::path::PathBuf;

    #[test]
    fn test_project_id_is_deterministic_and_url_safe() {
        let a = project_id_for_path(&PathBuf::from("/home/me/My Photos 2024"));
        let b = project_id_for_path(&PathBuf::from("/home/me/My Photos 2024"));
        let other = project_id_for_path(&PathBuf::from("/mnt/backup/My Photos 2024"));

        assert_eq!(a, b);
        assert_ne!(a, other);
        assert!(a.starts_with("my-photos-2024-"));
        assert!(a.chars().all(|c| c.is_ascii_alphanumeric() || c == '-'));
    }

    #[test]
    fn test_project_id_for_root() {
        let id = project_id_for_path(&PathBuf::from("/"));
        assert_eq!(id.len(), 12);
    }

    #[test]
    fn test_upsert_project_preserves_created_at() {
        let db = Database::open_in_memory().unwrap();

        let first = db.upsert_project("p1", "Photos", "/photos").unwrap();
        std::thread::sleep(std::time::Duration::from_millis(5));
        let second = db.upsert_project("p1", "Photos", "/photos").unwrap();

        assert_eq!(first.created_at, second.created_at);
        assert!(second.last_opened > first.last_opened);
        assert_eq!(db.list_projects().unwrap().len(), 1);
    }

    #[test]
    fn test_remove_project_cascades_images() {
        let db = Database::open_in_memory().unwrap();
        db.upsert_project("p1", "Photos", "/photos").unwrap();
        db.upsert_image(&ImageRecord {
            id: "/photos/a.jpg".into(),
            project_id: "p1".into(),
            file_path: "/photos/a.jpg".into(),
            file_name: "a.jpg".into(),
            file_size_bytes: 10,
            width: Some(8),
            height: Some(8),
            created_at: 1,
            modified_at: 1,
            rating: 0,
        })
        .unwrap();

        assert!(db.remove_project("p1").unwrap());
        assert!(db.get_images_by_project("p1").unwrap().is_empty());
        assert!(db.get_project("p1").unwrap().is_none());
        assert!(!db.remove_project("p1").unwrap());
    }
}
