//! Append-only performance log
//!
//! One CSV row per served request. The header is taken from the first record
//! ever written to a file and every later row is laid out in that order,
//! whatever keys the later record carries. Rows are never rewritten.

use std::collections::HashSet;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use crate::storage::StorageError;
use crate::types::record::LogRecord;

/// Destination for per-request log records
pub trait RecordSink: Send + Sync {
    /// Persist exactly one record. Must not return before the row is durable.
    fn append(&self, record: &LogRecord) -> Result<(), StorageError>;
}

/// CSV log file opened on first use and kept open for the process lifetime
pub struct PerfLog {
    path: PathBuf,
    state: Mutex<Option<OpenLog>>,
}

struct OpenLog {
    writer: csv::Writer<File>,
    header: Vec<String>,
}

impl PerfLog {
    /// Create a logger for `path`. Nothing touches the disk until the first append.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            state: Mutex::new(None),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Column order in use, once the file has been opened
    pub fn header(&self) -> Option<Vec<String>> {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(|log| log.header.clone())
    }

    /// Open the file, writing a header from `first` if it has none yet
    fn open(&self, first: &LogRecord) -> Result<OpenLog, StorageError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let mut file = OpenOptions::new()
            .read(true)
            .append(true)
            .create(true)
            .open(&self.path)?;

        let header = if file.metadata()?.len() == 0 {
            let header: Vec<String> = first.keys().map(str::to_string).collect();
            let mut writer = csv::Writer::from_writer(&file);
            writer.write_record(&header)?;
            writer.flush()?;
            drop(writer);
            file.sync_data()?;
            tracing::info!("Created performance log at {}", self.path.display());
            header
        } else {
            if !ends_with_newline(&mut file)? {
                tracing::warn!(
                    "Performance log {} ends mid-row, terminating it",
                    self.path.display()
                );
                file.write_all(b"\n")?;
            }
            let header = read_header(&self.path)?;
            tracing::debug!(
                "Appending to existing performance log {} ({} columns)",
                self.path.display(),
                header.len()
            );
            header
        };

        Ok(OpenLog {
            writer: csv::Writer::from_writer(file),
            header,
        })
    }
}

impl RecordSink for PerfLog {
    fn append(&self, record: &LogRecord) -> Result<(), StorageError> {
        if record.is_empty() {
            return Err(StorageError::EmptyRecord);
        }

        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);

        let mut log = match state.take() {
            Some(log) => log,
            None => self.open(record)?,
        };

        let row = layout_row(&log.header, record);
        write_row(&mut log.writer, &row)?;

        // A failed write drops the handle; the next call reopens the file
        // and terminates any partial row first.
        *state = Some(log);
        Ok(())
    }
}

/// Lay `record` out in `header` order, padding missing columns with empty fields
fn layout_row(header: &[String], record: &LogRecord) -> Vec<String> {
    let known: HashSet<&str> = header.iter().map(String::as_str).collect();
    let dropped: Vec<&str> = record.keys().filter(|k| !known.contains(k)).collect();
    if !dropped.is_empty() {
        tracing::warn!(
            "Dropping column(s) not present in the log header: {}",
            dropped.join(", ")
        );
    }

    header
        .iter()
        .map(|column| {
            record
                .get(column)
                .map(|value| value.to_string())
                .unwrap_or_default()
        })
        .collect()
}

fn write_row(writer: &mut csv::Writer<File>, row: &[String]) -> Result<(), StorageError> {
    writer.write_record(row)?;
    writer.flush()?;
    writer.get_ref().sync_data()?;
    Ok(())
}

fn read_header(path: &Path) -> Result<Vec<String>, StorageError> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_path(path)?;

    let mut first = csv::StringRecord::new();
    reader.read_record(&mut first)?;
    Ok(first.iter().map(str::to_string).collect())
}

fn ends_with_newline(file: &mut File) -> Result<bool, StorageError> {
    file.seek(SeekFrom::End(-1))?;
    let mut last = [0u8; 1];
    file.read_exact(&mut last)?;
    Ok(last[0] == b'\n')
}
