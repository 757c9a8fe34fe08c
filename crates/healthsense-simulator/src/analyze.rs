//! Offline analysis of durable metrics logs.

use crate::aggregator::Percentiles;
use crate::error::Result;
use crate::event_log::{read_log, LogRow};
use crate::report::format_number;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Summary of one metrics log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogSummary {
    pub file: PathBuf,
    pub rows: u64,
    pub successes: u64,
    pub malformed_rows: u64,
    pub devices: usize,
    pub success_rate_pct: f64,
    pub avg_latency_ms: f64,
    pub p50_latency_ms: u64,
    pub p95_latency_ms: u64,
    pub p99_latency_ms: u64,
    pub first_event: Option<DateTime<Utc>>,
    pub last_event: Option<DateTime<Utc>>,
    /// Rows per second over the logged time span
    pub throughput: f64,
}

impl LogSummary {
    /// Summarizes parsed rows. Latency statistics only cover successful
    /// publishes, matching the live snapshot.
    pub fn from_rows(file: impl Into<PathBuf>, rows: &[LogRow], malformed: usize) -> Self {
        let mut latencies: Vec<u64> = rows
            .iter()
            .filter(|r| r.success)
            .map(|r| r.latency_ms)
            .collect();
        latencies.sort_unstable();
        let percentiles = Percentiles::from_sorted(&latencies);

        let successes = latencies.len() as u64;
        let total = rows.len() as u64;
        let avg_latency_ms = if successes > 0 {
            latencies.iter().sum::<u64>() as f64 / successes as f64
        } else {
            0.0
        };
        let success_rate_pct = if total > 0 {
            successes as f64 * 100.0 / total as f64
        } else {
            0.0
        };

        let first_event = rows.iter().map(|r| r.timestamp).min();
        let last_event = rows.iter().map(|r| r.timestamp).max();
        // Timestamps have second precision; a run inside one second spans 1s
        let span_secs = match (first_event, last_event) {
            (Some(first), Some(last)) => (last - first).num_seconds().max(1) as f64,
            _ => 1.0,
        };

        let mut devices: Vec<&str> = rows.iter().map(|r| r.device_id.as_str()).collect();
        devices.sort_unstable();
        devices.dedup();

        Self {
            file: file.into(),
            rows: total,
            successes,
            malformed_rows: malformed as u64,
            devices: devices.len(),
            success_rate_pct,
            avg_latency_ms,
            p50_latency_ms: percentiles.p50,
            p95_latency_ms: percentiles.p95,
            p99_latency_ms: percentiles.p99,
            first_event,
            last_event,
            throughput: total as f64 / span_secs,
        }
    }
}

/// Reads and summarizes a single log.
pub fn analyze_file(path: impl AsRef<Path>) -> Result<LogSummary> {
    let path = path.as_ref();
    let contents = read_log(path)?;
    Ok(LogSummary::from_rows(path, &contents.rows, contents.malformed))
}

/// Summarizes several logs, ordered by row count.
pub fn analyze_files<P: AsRef<Path>>(paths: &[P]) -> Result<Vec<LogSummary>> {
    let mut summaries = paths
        .iter()
        .map(analyze_file)
        .collect::<Result<Vec<_>>>()?;
    summaries.sort_by_key(|s| s.rows);
    Ok(summaries)
}

/// Renders summaries as a fixed-width table.
pub fn render_table(summaries: &[LogSummary]) -> String {
    let separator = "=".repeat(100);
    let mut out = String::new();

    out.push_str(&format!("{}\nLOAD TEST SUMMARY\n{}\n", separator, separator));
    out.push_str(&format!(
        "{:<28} {:>7} {:>10} {:>9} {:>9} {:>7} {:>7} {:>7} {:>10}\n",
        "file", "devices", "messages", "success%", "avg_ms", "p50", "p95", "p99", "msg/s"
    ));
    for s in summaries {
        out.push_str(&format!(
            "{:<28} {:>7} {:>10} {:>9.2} {:>9.2} {:>7} {:>7} {:>7} {:>10.2}\n",
            display_name(&s.file),
            s.devices,
            format_number(s.rows),
            s.success_rate_pct,
            s.avg_latency_ms,
            s.p50_latency_ms,
            s.p95_latency_ms,
            s.p99_latency_ms,
            s.throughput
        ));
    }
    out.push_str(&separator);
    out.push('\n');
    out
}

/// Renders summaries as a markdown table.
pub fn render_markdown(summaries: &[LogSummary]) -> String {
    let mut md = String::from("# Load Test Summary\n\n");
    md.push_str("| File | Devices | Messages | Success | Avg | p50 | p95 | p99 | Throughput |\n");
    md.push_str("|------|---------|----------|---------|-----|-----|-----|-----|------------|\n");
    for s in summaries {
        md.push_str(&format!(
            "| {} | {} | {} | {:.2}% | {:.2}ms | {}ms | {}ms | {}ms | {:.2} msg/s |\n",
            display_name(&s.file),
            s.devices,
            format_number(s.rows),
            s.success_rate_pct,
            s.avg_latency_ms,
            s.p50_latency_ms,
            s.p95_latency_ms,
            s.p99_latency_ms,
            s.throughput
        ));
    }

    let malformed: u64 = summaries.iter().map(|s| s.malformed_rows).sum();
    if malformed > 0 {
        md.push_str(&format!("\n{} malformed rows skipped\n", malformed));
    }
    md
}

fn display_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}
