//! Metadata cache: projects, images, tags and the full-text index over them.
//!
//! One SQLite file per installation, opened by a single process. All access
//! goes through one connection behind a mutex; callers on the async side run
//! these methods inside `spawn_blocking`.

mod images;
mod maintenance;
mod projects;
mod schema;
mod search;

use anyhow::{anyhow, Context, Result};
use rusqlite::Connection;
use std::path::Path;
use std::sync::atomic::AtomicU32;
use std::sync::{Mutex, MutexGuard};
use tracing::info;

pub use images::ImageRecord;
pub use projects::{project_id_for_path, Project};
pub use schema::{PRAGMAS, SCHEMA};

use crate::config::MaintenanceConfig;

pub struct Database {
    conn: Mutex<Connection>,
    /// Writes since the last statistics refresh.
    writes: AtomicU32,
    maintenance: MaintenanceConfig,
}

impl Database {
    /// Open (creating if needed) the database file and run startup maintenance.
    pub fn open(path: &Path, maintenance: MaintenanceConfig) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open database {}", path.display()))?;
        let db = Self::from_connection(conn, maintenance)?;
        db.startup_maintenance()?;
        info!("Metadata cache opened at {}", path.display());
        Ok(db)
    }

    /// In-memory database, used by tests and throwaway tooling.
    pub fn open_in_memory() -> Result<Self> {
        Self::from_connection(Connection::open_in_memory()?, MaintenanceConfig::default())
    }

    fn from_connection(conn: Connection, maintenance: MaintenanceConfig) -> Result<Self> {
        conn.execute_batch(PRAGMAS)?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
            writes: AtomicU32::new(0),
            maintenance,
        })
    }

    pub(crate) fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| anyhow!("Metadata cache connection lock poisoned"))
    }
}

pub(crate) fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
