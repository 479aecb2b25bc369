use std::path::PathBuf;

/// Domain failures callers branch on. Everything else travels as
/// `anyhow::Error` with context attached.
#[derive(Debug, thiserror::Error)]
pub enum FolioError {
    #[error("project not registered: {0}")]
    ProjectNotFound(String),

    #[error("not a directory: {}", .0.display())]
    NotADirectory(PathBuf),

    #[error("cannot prepare sidecar directory {}: {source}", .path.display())]
    SidecarUnavailable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to decode {}: {message}", .path.display())]
    Decode { path: PathBuf, message: String },

    #[error("not found: {0}")]
    NotFound(String),
}
