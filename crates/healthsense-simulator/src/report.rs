//! Terminal report generation.

use crate::aggregator::MetricsSnapshot;
use crate::config::{PercentileMode, SimulatorConfig};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Why the run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StopReason {
    /// Configured duration elapsed
    Deadline,
    /// Signal or stop request
    External,
}

impl std::fmt::Display for StopReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StopReason::Deadline => write!(f, "duration reached"),
            StopReason::External => write!(f, "stop requested"),
        }
    }
}

/// Final report of a simulation run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    // Configuration
    pub tenant_id: String,
    pub device_count: usize,
    pub interval_ms: u64,
    pub duration_secs: Option<u64>,
    pub transport: String,
    pub percentile_mode: PercentileMode,
    pub metrics_file: PathBuf,

    // Shutdown
    pub stop_reason: StopReason,
    pub devices_stopped: usize,
    pub device_panics: usize,

    // Terminal snapshot
    pub metrics: MetricsSnapshot,
}

impl RunReport {
    pub fn new(
        config: &SimulatorConfig,
        stop_reason: StopReason,
        devices_stopped: usize,
        device_panics: usize,
        metrics: MetricsSnapshot,
    ) -> Self {
        Self {
            tenant_id: config.tenant_id.clone(),
            device_count: config.device_count,
            interval_ms: config.interval.as_millis() as u64,
            duration_secs: config.duration.map(|d| d.as_secs()),
            transport: config.transport.to_string(),
            percentile_mode: config.percentiles,
            metrics_file: config.metrics_file.clone(),
            stop_reason,
            devices_stopped,
            device_panics,
            metrics,
        }
    }

    /// Generates a markdown report.
    pub fn to_markdown(&self) -> String {
        let m = &self.metrics;
        let mut md = String::new();

        md.push_str("# Telemetry Simulator Report\n\n");

        md.push_str("## Configuration\n\n");
        md.push_str("| Setting | Value |\n");
        md.push_str("|---------|-------|\n");
        md.push_str(&format!("| Tenant | {} |\n", self.tenant_id));
        md.push_str(&format!("| Devices | {} |\n", format_number(self.device_count as u64)));
        md.push_str(&format!("| Interval | {}ms |\n", self.interval_ms));
        match self.duration_secs {
            Some(secs) => md.push_str(&format!("| Duration | {}s |\n", secs)),
            None => md.push_str("| Duration | until stopped |\n"),
        }
        md.push_str(&format!("| Transport | {} |\n", self.transport));
        md.push_str(&format!("| Percentiles | {} |\n", self.percentile_mode));
        md.push_str(&format!("| Metrics Log | {} |\n", self.metrics_file.display()));
        md.push('\n');

        md.push_str("## Publishing\n\n");
        md.push_str("| Metric | Value |\n");
        md.push_str("|--------|-------|\n");
        md.push_str(&format!("| Published | {} |\n", format_number(m.total_published)));
        md.push_str(&format!("| Errors | {} |\n", format_number(m.total_errors)));
        md.push_str(&format!("| Success Rate | {:.2}% |\n", m.success_rate_pct()));
        md.push_str(&format!("| Throughput | {:.2} msg/s |\n", m.messages_per_sec));
        md.push_str(&format!("| Elapsed | {:.2}s |\n", m.elapsed_secs));
        md.push('\n');

        md.push_str("### Publish Latency\n\n");
        md.push_str("| Statistic | Latency |\n");
        md.push_str("|-----------|---------|\n");
        if m.total_published > 0 {
            md.push_str(&format!("| avg | {:.2}ms |\n", m.avg_latency_ms));
            md.push_str(&format!("| p50 | {}ms |\n", m.p50_latency_ms));
            md.push_str(&format!("| p95 | {}ms |\n", m.p95_latency_ms));
            md.push_str(&format!("| p99 | {}ms |\n", m.p99_latency_ms));
        } else {
            md.push_str("| N/A | No successful publishes |\n");
        }
        md.push('\n');

        md.push_str("## Summary\n\n");
        md.push_str(&format!(
            "Stopped: {} ({} of {} devices drained",
            self.stop_reason, self.devices_stopped, self.device_count
        ));
        if self.device_panics > 0 {
            md.push_str(&format!(", {} panicked", self.device_panics));
        }
        md.push_str(")\n\n");

        if m.total_errors > 0 || m.log_write_failures > 0 {
            md.push_str("**Errors detected during run**\n");
        } else {
            md.push_str("**Run completed without errors**\n");
        }

        md
    }

    /// Generates a JSON report.
    pub fn to_json(&self) -> String {
        serde_json::to_string_pretty(self).unwrap_or_else(|_| "{}".to_string())
    }

    /// Prints the terminal report to stdout.
    pub fn print_summary(&self) {
        let m = &self.metrics;
        let separator = "=".repeat(60);

        println!("\n{}", separator);
        println!("SIMULATOR METRICS");
        println!("{}", separator);
        println!("Total Published:     {} messages", format_number(m.total_published));
        println!("Total Errors:        {}", format_number(m.total_errors));
        println!("Throughput:          {:.2} msg/sec", m.messages_per_sec);
        println!("Avg Latency:         {:.0} ms", m.avg_latency_ms);
        println!("P50 Latency:         {} ms", m.p50_latency_ms);
        println!("P95 Latency:         {} ms", m.p95_latency_ms);
        println!("P99 Latency:         {} ms", m.p99_latency_ms);
        println!("Elapsed Time:        {:.2} sec", m.elapsed_secs);
        if m.log_write_failures > 0 {
            println!("Log Write Failures:  {}", m.log_write_failures);
        }
        println!("{}", separator);
    }
}

/// Formats a number with thousand separators.
pub(crate) fn format_number(n: u64) -> String {
    let s = n.to_string();
    let mut result = String::new();
    for (i, c) in s.chars().rev().enumerate() {
        if i > 0 && i % 3 == 0 {
            result.push(',');
        }
        result.push(c);
    }
    result.chars().rev().collect()
}
