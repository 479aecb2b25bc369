use anyhow::Result;
use rusqlite::params;

use super::images::{row_to_image, IMAGE_COLUMNS};
use super::{Database, ImageRecord};

/// Turn free text into an FTS5 query: every whitespace-separated term is
/// quoted (so punctuation is literal) and prefix-matched, terms are ANDed.
fn fts_query(query: &str) -> Option<String> {
    let terms: Vec<String> = query
        .split_whitespace()
        .map(|term| term.replace('"', ""))
        .filter(|term| term.chars().any(char::is_alphanumeric))
        .map(|term| format!("\"{}\"*", term))
        .collect();
    if terms.is_empty() {
        None
    } else {
        Some(terms.join(" "))
    }
}

impl Database {
    /// Full-text search over file names and tags, best match first,
    /// optionally scoped to one project.
    pub fn search_images(
        &self,
        query: &str,
        project_id: Option<&str>,
        limit: usize,
    ) -> Result<Vec<ImageRecord>> {
        let Some(match_expr) = fts_query(query) else {
            return Ok(Vec::new());
        };

        let columns = IMAGE_COLUMNS
            .split(", ")
            .map(|c| format!("i.{}", c.trim()))
            .collect::<Vec<_>>()
            .join(", ");

        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            r#"
            SELECT {}
            FROM images i
            JOIN (
                SELECT rowid, bm25(images_fts) AS score
                FROM images_fts
                WHERE images_fts MATCH ?1
            ) m ON m.rowid = i.seq
            WHERE ?2 IS NULL OR i.project_id = ?2
            ORDER BY m.score, i.modified_at DESC
            LIMIT ?3
            "#,
            columns
        ))?;
        let results = stmt
            .query_map(params![match_expr, project_id, limit as i64], row_to_image)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(results)
    }
}
