//! Log directory resolution.

use std::path::PathBuf;

const APP_NAME: &str = "framebus";

fn project_dirs() -> Option<directories::ProjectDirs> {
    directories::ProjectDirs::from("", "", APP_NAME)
}

/// Returns the directory for log files.
///
/// `$XDG_STATE_HOME/framebus/logs` or `~/.local/state/framebus/logs`. Falls
/// back to the temp directory when no home directory can be determined.
pub fn log_dir() -> PathBuf {
    match project_dirs() {
        Some(base) => base
            .state_dir()
            .map(|d| d.to_path_buf())
            .unwrap_or_else(|| base.data_local_dir().join("state"))
            .join("logs"),
        None => std::env::temp_dir().join(APP_NAME).join("logs"),
    }
}

/// Ensures the log directory exists, creating it if necessary.
pub fn ensure_log_dir() -> Result<(), std::io::Error> {
    std::fs::create_dir_all(log_dir())
}

/// File name prefix of the producer's log in [`log_dir`].
///
/// The daily rolling appender appends the date (e.g.
/// `framebus-service.log.2026-03-01`).
pub const SERVICE_LOG_NAME: &str = "framebus-service.log";
