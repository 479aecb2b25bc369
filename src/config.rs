use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,

    #[serde(default)]
    pub scanner: ScannerConfig,

    #[serde(default)]
    pub derivatives: DerivativeConfig,

    #[serde(default)]
    pub reconcile: ReconcileConfig,

    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub retention: RetentionConfig,

    #[serde(default)]
    pub maintenance: MaintenanceConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScannerConfig {
    #[serde(default = "default_image_extensions")]
    pub image_extensions: Vec<String>,
}

impl ScannerConfig {
    /// Case-insensitive extension check used by discovery and the watcher.
    pub fn is_image(&self, path: &Path) -> bool {
        path.extension()
            .map(|ext| ext.to_string_lossy().to_lowercase())
            .map(|ext| self.image_extensions.iter().any(|e| e.to_lowercase() == ext))
            .unwrap_or(false)
    }
}

fn default_image_extensions() -> Vec<String> {
    ["jpg", "jpeg", "png", "gif", "webp", "bmp", "tif", "tiff"]
        .iter()
        .map(|e| e.to_string())
        .collect()
}

impl Default for ScannerConfig {
    fn default() -> Self {
        Self {
            image_extensions: default_image_extensions(),
        }
    }
}

/// Sizes and encoder qualities for the three derivative tiers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DerivativeConfig {
    /// Name of the sidecar root created inside every watched folder.
    #[serde(default = "default_sidecar_dir")]
    pub sidecar_dir: String,

    #[serde(default = "default_thumbnail_size")]
    pub thumbnail_size: u32,

    #[serde(default = "default_thumbnail_quality")]
    pub thumbnail_quality: u8,

    #[serde(default = "default_preview_max_edge")]
    pub preview_max_edge: u32,

    #[serde(default = "default_preview_quality")]
    pub preview_quality: u8,

    /// Used when the source already fits inside `preview_max_edge`.
    #[serde(default = "default_preview_quality_small")]
    pub preview_quality_small: u8,

    #[serde(default = "default_full_quality")]
    pub full_quality: u8,
}

fn default_sidecar_dir() -> String {
    ".folio".to_string()
}

fn default_thumbnail_size() -> u32 {
    256
}

fn default_thumbnail_quality() -> u8 {
    80
}

fn default_preview_max_edge() -> u32 {
    1600
}

fn default_preview_quality() -> u8 {
    85
}

fn default_preview_quality_small() -> u8 {
    92
}

fn default_full_quality() -> u8 {
    95
}

impl Default for DerivativeConfig {
    fn default() -> Self {
        Self {
            sidecar_dir: default_sidecar_dir(),
            thumbnail_size: default_thumbnail_size(),
            thumbnail_quality: default_thumbnail_quality(),
            preview_max_edge: default_preview_max_edge(),
            preview_quality: default_preview_quality(),
            preview_quality_small: default_preview_quality_small(),
            full_quality: default_full_quality(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconcileConfig {
    /// Number of new files decoded concurrently during the initial diff.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// How long a watched file must stay unchanged before it is processed.
    #[serde(default = "default_watch_debounce_ms")]
    pub watch_debounce_ms: u64,
}

fn default_batch_size() -> usize {
    10
}

fn default_watch_debounce_ms() -> u64 {
    300
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            watch_debounce_ms: default_watch_debounce_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,

    /// First port tried; the server walks upward until a bind succeeds.
    #[serde(default = "default_start_port")]
    pub start_port: u16,

    #[serde(default = "default_port_attempts")]
    pub port_attempts: u16,

    /// A client that has not sent a complete request head by then gets a 400.
    #[serde(default = "default_head_timeout_ms")]
    pub head_timeout_ms: u64,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_start_port() -> u16 {
    8765
}

fn default_port_attempts() -> u16 {
    100
}

fn default_head_timeout_ms() -> u64 {
    5000
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            start_port: default_start_port(),
            port_attempts: default_port_attempts(),
            head_timeout_ms: default_head_timeout_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetentionConfig {
    /// Unrated, untagged rows older than this are dropped by `cleanup_orphaned`.
    #[serde(default = "default_orphan_days")]
    pub orphan_days: u32,
}

fn default_orphan_days() -> u32 {
    30
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            orphan_days: default_orphan_days(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MaintenanceConfig {
    #[serde(default = "default_analyze_every_writes")]
    pub analyze_every_writes: u32,

    /// Fraction of free pages at shutdown above which a VACUUM runs.
    #[serde(default = "default_vacuum_free_ratio")]
    pub vacuum_free_ratio: f64,
}

fn default_analyze_every_writes() -> u32 {
    100
}

fn default_vacuum_free_ratio() -> f64 {
    0.25
}

impl Default for MaintenanceConfig {
    fn default() -> Self {
        Self {
            analyze_every_writes: default_analyze_every_writes(),
            vacuum_free_ratio: default_vacuum_free_ratio(),
        }
    }
}

fn default_db_path() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("folio")
        .join("folio.db")
}

impl Default for Config {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            scanner: ScannerConfig::default(),
            derivatives: DerivativeConfig::default(),
            reconcile: ReconcileConfig::default(),
            server: ServerConfig::default(),
            retention: RetentionConfig::default(),
            maintenance: MaintenanceConfig::default(),
        }
    }
}

impl Config {
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_path())
    }

    /// Load from an explicit path, writing defaults there if nothing exists yet.
    pub fn load_from(path: &Path) -> Result<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config {}", path.display()))?;
            let config: Config = toml::from_str(&content)
                .with_context(|| format!("Invalid config {}", path.display()))?;
            Ok(config)
        } else {
            let config = Config::default();
            config.save_to(path)?;
            Ok(config)
        }
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;

        Ok(())
    }

    pub fn config_dir() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("folio")
    }

    fn config_path() -> PathBuf {
        if let Ok(path) = std::env::var("FOLIO_CONFIG") {
            return PathBuf::from(path);
        }
        Self::config_dir().join("config.toml")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_config_fills_defaults() {
        let config: Config = toml::from_str(
            r#"
            [server]
            start_port = 9000
            "#,
        )
        .unwrap();

        assert_eq!(config.server.start_port, 9000);
        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.reconcile.batch_size, 10);
        assert_eq!(config.derivatives.thumbnail_size, 256);
        assert_eq!(config.derivatives.preview_max_edge, 1600);
        assert_eq!(config.retention.orphan_days, 30);
    }

    #[test]
    fn test_load_from_writes_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/config.toml");

        let config = Config::load_from(&path).unwrap();
        assert!(path.exists());
        assert_eq!(config.derivatives.sidecar_dir, ".folio");

        let reloaded = Config::load_from(&path).unwrap();
        assert_eq!(reloaded.maintenance.analyze_every_writes, 100);
    }

    #[test]
    fn test_is_image_case_insensitive() {
        let scanner = ScannerConfig::default();
        assert!(scanner.is_image(Path::new("/a/IMG_001.JPG")));
        assert!(scanner.is_image(Path::new("b.webp")));
        assert!(!scanner.is_image(Path::new("notes.txt")));
        assert!(!scanner.is_image(Path::new("no_extension")));
    }
}
