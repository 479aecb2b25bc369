pub const SCHEMA: &str = r#"
-- Projects: one row per watched folder
CREATE TABLE IF NOT EXISTS projects (
    id TEXT PRIMARY KEY,
    name TEXT NOT NULL,
    root_path TEXT NOT NULL UNIQUE,
    created_at INTEGER NOT NULL,   -- unix millis, set once
    last_opened INTEGER NOT NULL   -- unix millis
);

-- Images: one row per (project, file name)
CREATE TABLE IF NOT EXISTS images (
    seq INTEGER PRIMARY KEY AUTOINCREMENT,  -- integer rowid for the FTS index
    id TEXT NOT NULL UNIQUE,                -- absolute source path
    project_id TEXT NOT NULL,
    file_path TEXT NOT NULL,
    file_name TEXT NOT NULL,
    file_size_bytes INTEGER NOT NULL DEFAULT 0,
    width INTEGER,
    height INTEGER,
    created_at INTEGER NOT NULL,   -- unix millis
    modified_at INTEGER NOT NULL,  -- source mtime at last processing, unix millis
    rating INTEGER NOT NULL DEFAULT 0,
    tag_text TEXT NOT NULL DEFAULT '',  -- space separated copy of image_tags for FTS
    UNIQUE (project_id, file_name),
    FOREIGN KEY (project_id) REFERENCES projects(id) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_images_project_modified ON images(project_id, modified_at DESC);

-- User tags
CREATE TABLE IF NOT EXISTS image_tags (
    image_id TEXT NOT NULL,
    tag TEXT NOT NULL,
    PRIMARY KEY (image_id, tag),
    FOREIGN KEY (image_id) REFERENCES images(id) ON DELETE CASCADE
);

-- Full-text index over file names and tags, mirrored from images by triggers
CREATE VIRTUAL TABLE IF NOT EXISTS images_fts USING fts5(
    file_name,
    tag_text,
    content='images',
    content_rowid='seq'
);

CREATE TRIGGER IF NOT EXISTS images_fts_insert AFTER INSERT ON images BEGIN
    INSERT INTO images_fts(rowid, file_name, tag_text)
    VALUES (NEW.seq, NEW.file_name, NEW.tag_text);
END;

CREATE TRIGGER IF NOT EXISTS images_fts_delete AFTER DELETE ON images BEGIN
    INSERT INTO images_fts(images_fts, rowid, file_name, tag_text)
    VALUES ('delete', OLD.seq, OLD.file_name, OLD.tag_text);
END;

CREATE TRIGGER IF NOT EXISTS images_fts_update AFTER UPDATE OF file_name, tag_text ON images BEGIN
    INSERT INTO images_fts(images_fts, rowid, file_name, tag_text)
    VALUES ('delete', OLD.seq, OLD.file_name, OLD.tag_text);
    INSERT INTO images_fts(rowid, file_name, tag_text)
    VALUES (NEW.seq, NEW.file_name, NEW.tag_text);
END;
"#;

/// Connection-level settings applied on every open.
pub const PRAGMAS: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA synchronous = NORMAL;
PRAGMA foreign_keys = ON;
PRAGMA busy_timeout = 5000;
"#;
