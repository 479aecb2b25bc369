//! Folio: a cache-first photo library engine.
//!
//! A folder of images is mirrored into a SQLite cache and a hidden sidecar
//! tree of derivatives inside the folder. Selecting a folder returns cached
//! records at once; a background session reconciles the folder and keeps
//! following it, and a local HTTP server hands out the derivatives.

pub mod config;
pub mod db;
pub mod error;
pub mod logging;
pub mod reconcile;
pub mod server;
pub mod sidecar;

pub use config::Config;
pub use db::Database;
pub use error::FolioError;
pub use reconcile::{DisplayRecord, Engine, LibraryEvent, ProjectRegistry};
pub use server::{Server, ServerHandle};
pub use sidecar::{SidecarStore, Tier};
