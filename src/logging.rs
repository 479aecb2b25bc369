//! Diagnostics for the folio binary and anything embedding the engine.
//!
//! Stdout belongs to the JSON event lines the binary prints, so diagnostics
//! never go there: they are sent to the systemd journal when one is
//! reachable, and to `folio.log.<date>` under the log directory otherwise.

use anyhow::Result;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const FILTER_ENV: &str = "FOLIO_LOG";

/// Keeps the file writer's background thread alive until exit.
static FILE_GUARD: OnceLock<WorkerGuard> = OnceLock::new();

/// Where diagnostics ended up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Sink {
    Journal,
    File(PathBuf),
}

/// `FOLIO_LOG` takes any `EnvFilter` directive, e.g. `folio::reconcile=debug,info`.
fn filter() -> EnvFilter {
    EnvFilter::try_from_env(FILTER_ENV).unwrap_or_else(|_| EnvFilter::new("info"))
}

fn default_log_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("folio")
        .join("logs")
}

/// Install the global subscriber. Fails if one is already installed.
/// `log_dir` is only used when the journal is unavailable.
pub fn init(log_dir: Option<PathBuf>) -> Result<Sink> {
    #[cfg(target_os = "linux")]
    {
        if let Ok(journal) = tracing_journald::layer() {
            tracing_subscriber::registry().with(filter()).with(journal).try_init()?;
            tracing::debug!("Diagnostics go to the systemd journal");
            return Ok(Sink::Journal);
        }
    }

    let dir = log_dir.unwrap_or_else(default_log_dir);
    init_file(&dir)?;
    Ok(Sink::File(dir))
}

fn init_file(dir: &Path) -> Result<()> {
    std::fs::create_dir_all(dir)?;
    let (writer, guard) = tracing_appender::non_blocking(tracing_appender::rolling::daily(dir, "folio.log"));
    let _ = FILE_GUARD.set(guard);

    tracing_subscriber::registry()
        .with(filter())
        .with(fmt::layer().with_writer(writer).with_ansi(false))
        .try_init()?;
    tracing::debug!("Diagnostics go to {}", dir.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_log_dir_is_per_app() {
        assert!(default_log_dir().ends_with("folio/logs"));
    }
}
