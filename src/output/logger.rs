//! Diagnostic logging to a per-run log file.

use anyhow::{Context, Result};
use chrono::Utc;
use std::env;
use std::fs::File;
use std::path::PathBuf;
use std::sync::Mutex;
use tracing_subscriber::EnvFilter;

/// Environment variable holding the log filter, e.g. `planloop=debug`.
pub const LOG_ENV: &str = "PLANLOOP_LOG";

/// Install the tracing subscriber writing to a fresh log file.
///
/// Returns the log file path.
pub fn init() -> Result<PathBuf> {
    let log_path = setup_log_file()?;
    let file = File::create(&log_path)
        .with_context(|| format!("Failed to create log file {}", log_path.display()))?;

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(Mutex::new(file))
        .with_ansi(false)
        .try_init()
        .map_err(|e| anyhow::anyhow!("Failed to install logger: {e}"))?;

    Ok(log_path)
}

/// Set up the log directory and return the log file path.
pub fn setup_log_file() -> Result<PathBuf> {
    let log_dir = log_directory();
    std::fs::create_dir_all(&log_dir)
        .with_context(|| format!("Failed to create log directory {}", log_dir.display()))?;

    let timestamp = Utc::now().format("%Y%m%d-%H%M%S").to_string();
    Ok(log_dir.join(format!("{}.log", timestamp)))
}

/// `$TMPDIR/planloop/logs/<project>`.
pub fn log_directory() -> PathBuf {
    let base_dir = env::var("TMPDIR")
        .or_else(|_| env::var("XDG_RUNTIME_DIR"))
        .unwrap_or_else(|_| "/tmp".to_string());

    let project_name = env::current_dir()
        .ok()
        .and_then(|p| p.file_name().map(|n| n.to_string_lossy().to_string()))
        .unwrap_or_else(|| "unknown".to_string());

    PathBuf::from(base_dir)
        .join("planloop")
        .join("logs")
        .join(project_name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_directory_is_namespaced() {
        let dir = log_directory();
        let parts: Vec<_> = dir.components().rev().skip(1).take(2).collect();
        assert_eq!(parts[0].as_os_str(), "logs");
        assert_eq!(parts[1].as_os_str(), "planloop");
    }

    #[test]
    fn log_file_name_is_a_timestamp() {
        let path = setup_log_file().unwrap();
        let name = path.file_name().unwrap().to_string_lossy().to_string();
        assert!(name.ends_with(".log"));
        assert_eq!(name.len(), "20260101-000000.log".len());
    }
}
