//! Persistent storage
//!
//! This module handles settings persistence and the append-only performance log.

use std::path::PathBuf;
use thiserror::Error;

pub mod perf_log;
pub mod settings;

pub use perf_log::{PerfLog, RecordSink};
pub use settings::{load_settings, save_settings, LogFailurePolicy, PipelineSettings};

/// Storage-related errors
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Failed to access data directory: {0}")]
    DataDirError(String),
    #[error("File I/O failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to serialize/deserialize JSON: {0}")]
    JsonError(#[from] serde_json::Error),
    #[error("Failed to read/write CSV: {0}")]
    CsvError(#[from] csv::Error),
    #[error("Refusing to write an empty record")]
    EmptyRecord,
}

/// Get the application data directory
///
/// Returns the platform-specific application data directory:
/// - Windows: `C:\Users\{user}\AppData\Roaming\infer-telemetry\infer-telemetry\data`
/// - macOS: `/Users/{user}/Library/Application Support/org.infer-telemetry.infer-telemetry`
/// - Linux: `/home/{user}/.local/share/infer-telemetry`
pub fn get_data_dir() -> Result<PathBuf, StorageError> {
    directories::ProjectDirs::from("org", "infer-telemetry", "infer-telemetry")
        .map(|dirs| dirs.data_dir().to_path_buf())
        .ok_or_else(|| StorageError::DataDirError("Could not determine data directory".to_string()))
}

/// Default location of the performance log
///
/// `{data_dir}/logs/perf_log.csv`, or `./logs/perf_log.csv` when no data
/// directory can be resolved.
pub fn default_log_path() -> PathBuf {
    get_data_dir()
        .map(|d| d.join("logs"))
        .unwrap_or_else(|_| PathBuf::from("./logs"))
        .join("perf_log.csv")
}
