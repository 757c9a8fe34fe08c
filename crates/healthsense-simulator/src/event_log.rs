//! Durable per-publish CSV log.
//!
//! One row per publish attempt:
//!
//! ```text
//! timestamp,device_id,publish_latency_ms,success
//! 2025-03-01T12:30:05Z,watch-0001,4,1
//! ```

use crate::error::{Result, SimError};
use chrono::{DateTime, Utc};
use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

/// Header row written once at file creation.
pub const LOG_HEADER: &str = "timestamp,device_id,publish_latency_ms,success";

/// BufWriter capacity for the log file
const BUFFER_CAPACITY: usize = 64 * 1024;

/// Destination of the durable log.
pub trait LogSink: Write + Send {
    /// Makes everything written so far durable.
    fn sync(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

impl LogSink for File {
    fn sync(&mut self) -> std::io::Result<()> {
        self.sync_all()
    }
}

/// Buffered writer for the durable log.
pub struct EventLogWriter {
    path: PathBuf,
    out: BufWriter<Box<dyn LogSink>>,
}

impl EventLogWriter {
    /// Creates (or truncates) the log file and writes the header.
    pub fn create(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let log_create = |source| SimError::LogCreate {
            path: path.clone(),
            source,
        };

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(log_create)?;
        }

        let file = File::create(&path).map_err(log_create)?;
        Self::with_sink(path.clone(), Box::new(file), BUFFER_CAPACITY).map_err(log_create)
    }

    /// Wraps an already opened sink and writes the header. `path` only
    /// labels the log.
    pub fn with_sink(
        path: impl Into<PathBuf>,
        sink: Box<dyn LogSink>,
        buffer_capacity: usize,
    ) -> std::io::Result<Self> {
        let mut out = BufWriter::with_capacity(buffer_capacity, sink);
        writeln!(out, "{}", LOG_HEADER)?;
        out.flush()?;

        Ok(Self {
            path: path.into(),
            out,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Appends a pre-formatted row (see [`format_row`]).
    pub fn write_row(&mut self, row: &str) -> std::io::Result<()> {
        self.out.write_all(row.as_bytes())
    }

    pub fn flush(&mut self) -> std::io::Result<()> {
        self.out.flush()
    }

    /// Flushes buffered rows, syncs and closes the sink.
    pub fn close(mut self) -> std::io::Result<()> {
        self.out.flush()?;
        self.out.get_mut().sync()
    }
}

/// Formats a log row, newline included.
pub fn format_row(
    timestamp: DateTime<Utc>,
    device_id: &str,
    latency_ms: u64,
    success: bool,
) -> String {
    format!(
        "{},{},{},{}\n",
        timestamp.format("%Y-%m-%dT%H:%M:%SZ"),
        device_id,
        latency_ms,
        if success { 1 } else { 0 }
    )
}

/// A parsed log row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogRow {
    pub timestamp: DateTime<Utc>,
    pub device_id: String,
    pub latency_ms: u64,
    pub success: bool,
}

impl LogRow {
    /// Parses a data row; returns `None` for anything malformed.
    pub fn parse(line: &str) -> Option<Self> {
        let mut parts = line.trim_end().split(',');
        let timestamp = DateTime::parse_from_rfc3339(parts.next()?)
            .ok()?
            .with_timezone(&Utc);
        let device_id = parts.next()?.to_string();
        let latency_ms = parts.next()?.parse().ok()?;
        let success = match parts.next()? {
            "1" => true,
            "0" => false,
            _ => return None,
        };
        if parts.next().is_some() || device_id.is_empty() {
            return None;
        }

        Some(Self {
            timestamp,
            device_id,
            latency_ms,
            success,
        })
    }
}

/// Contents of a log file.
#[derive(Debug, Default)]
pub struct LogContents {
    pub rows: Vec<LogRow>,
    /// Data lines that could not be parsed
    pub malformed: usize,
}

/// Reads a complete log file, validating the header.
pub fn read_log(path: impl AsRef<Path>) -> Result<LogContents> {
    let path = path.as_ref();
    let reader = BufReader::new(File::open(path)?);
    let mut lines = reader.lines();

    let header = match lines.next() {
        Some(header) => header?,
        None => {
            return Err(SimError::LogFormat {
                path: path.to_path_buf(),
                reason: "empty file".to_string(),
            })
        }
    };
    if header.trim_end() != LOG_HEADER {
        return Err(SimError::LogFormat {
            path: path.to_path_buf(),
            reason: "unexpected header".to_string(),
        });
    }

    let mut contents = LogContents::default();
    for line in lines {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        match LogRow::parse(&line) {
            Some(row) => contents.rows.push(row),
            None => contents.malformed += 1,
        }
    }

    Ok(contents)
}
