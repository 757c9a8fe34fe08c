//! Thread-safe publish metrics aggregation.
//!
//! A single [`MetricsAggregator`] is shared (via `Arc`) by every device
//! publisher and the reporter. All mutable state sits behind one mutex:
//! - `record_event` does constant work under the lock (row formatting happens
//!   before it is taken)
//! - `snapshot` only copies the latency samples under the lock and sorts the
//!   copy after releasing it, so the append-ordered collection is never
//!   reordered and repeated snapshots agree
//! - `finalize` flushes and closes the durable log exactly once

use crate::config::PercentileMode;
use crate::error::{Result, SimError};
use crate::event_log::{format_row, EventLogWriter};
use crate::telemetry::now_secs;
use hdrhistogram::Histogram;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Largest latency tracked exactly by the histogram mode (one hour).
const HISTOGRAM_MAX_MS: u64 = 3_600_000;

/// Point-in-time view of the aggregate metrics.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub total_published: u64,
    pub total_errors: u64,
    pub messages_per_sec: f64,
    pub avg_latency_ms: f64,
    pub p50_latency_ms: u64,
    pub p95_latency_ms: u64,
    pub p99_latency_ms: u64,
    pub elapsed_secs: f64,
    /// Durable log rows that could not be written
    pub log_write_failures: u64,
}

impl MetricsSnapshot {
    /// Publish attempts seen so far.
    pub fn total_attempts(&self) -> u64 {
        self.total_published + self.total_errors
    }

    /// Percentage of attempts that succeeded (0 when nothing was attempted).
    pub fn success_rate_pct(&self) -> f64 {
        match self.total_attempts() {
            0 => 0.0,
            n => self.total_published as f64 * 100.0 / n as f64,
        }
    }
}

/// p50/p95/p99 of a latency sample set.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Percentiles {
    pub p50: u64,
    pub p95: u64,
    pub p99: u64,
}

impl Percentiles {
    /// Computes percentiles of an ascending-sorted slice by nearest rank
    /// (`sorted[len * p / 100]`). All zero for an empty slice.
    pub fn from_sorted(sorted: &[u64]) -> Self {
        if sorted.is_empty() {
            return Self::default();
        }
        Self {
            p50: nearest_rank(sorted, 50),
            p95: nearest_rank(sorted, 95),
            p99: nearest_rank(sorted, 99),
        }
    }

    fn from_histogram(histogram: &Histogram<u64>) -> Self {
        if histogram.is_empty() {
            return Self::default();
        }
        Self {
            p50: histogram.value_at_quantile(0.50),
            p95: histogram.value_at_quantile(0.95),
            p99: histogram.value_at_quantile(0.99),
        }
    }
}

fn nearest_rank(sorted: &[u64], pct: usize) -> u64 {
    let idx = (sorted.len() * pct / 100).min(sorted.len() - 1);
    sorted[idx]
}

/// Successful-publish latency samples, in milliseconds.
enum LatencySamples {
    /// Every sample in arrival order
    Exact(Vec<u64>),
    /// Bounded-memory HDR histogram
    Histogram(Histogram<u64>),
}

impl LatencySamples {
    fn new(mode: PercentileMode) -> Result<Self> {
        match mode {
            PercentileMode::Exact => Ok(Self::Exact(Vec::with_capacity(10_000))),
            PercentileMode::Histogram => Histogram::new_with_bounds(1, HISTOGRAM_MAX_MS, 3)
                .map(Self::Histogram)
                .map_err(|e| SimError::Config(format!("latency histogram: {}", e))),
        }
    }

    fn record(&mut self, latency_ms: u64) {
        match self {
            Self::Exact(samples) => samples.push(latency_ms),
            Self::Histogram(histogram) => histogram.saturating_record(latency_ms),
        }
    }

    /// Captures what a snapshot needs while the lock is held.
    fn view(&self) -> SampleView {
        match self {
            Self::Exact(samples) => SampleView::Unsorted(samples.clone()),
            Self::Histogram(histogram) => SampleView::Ready(Percentiles::from_histogram(histogram)),
        }
    }
}

enum SampleView {
    Unsorted(Vec<u64>),
    Ready(Percentiles),
}

impl SampleView {
    fn percentiles(self) -> Percentiles {
        match self {
            SampleView::Unsorted(mut samples) => {
                samples.sort_unstable();
                Percentiles::from_sorted(&samples)
            }
            SampleView::Ready(p) => p,
        }
    }
}

struct AggregatorState {
    published: u64,
    errors: u64,
    total_latency_ms: u64,
    samples: LatencySamples,
    log: Option<EventLogWriter>,
    log_write_failures: u64,
    finished_at: Option<Instant>,
}

/// Shared metrics sink for all device publishers.
pub struct MetricsAggregator {
    started_at: Instant,
    log_path: PathBuf,
    mode: PercentileMode,
    state: Mutex<AggregatorState>,
}

impl MetricsAggregator {
    /// Creates the aggregator and its durable log. Failing to create the log
    /// is fatal for the run.
    pub fn create(log_path: impl AsRef<Path>, mode: PercentileMode) -> Result<Self> {
        Self::with_log(EventLogWriter::create(log_path.as_ref())?, mode)
    }

    /// Creates the aggregator around an already opened log.
    pub fn with_log(log: EventLogWriter, mode: PercentileMode) -> Result<Self> {
        let samples = LatencySamples::new(mode)?;

        Ok(Self {
            started_at: Instant::now(),
            log_path: log.path().to_path_buf(),
            mode,
            state: Mutex::new(AggregatorState {
                published: 0,
                errors: 0,
                total_latency_ms: 0,
                samples,
                log: Some(log),
                log_write_failures: 0,
                finished_at: None,
            }),
        })
    }

    pub fn log_path(&self) -> &Path {
        &self.log_path
    }

    pub fn percentile_mode(&self) -> PercentileMode {
        self.mode
    }

    /// Records the outcome of one publish attempt.
    pub fn record_event(&self, device_id: &str, latency: Duration, success: bool) {
        let latency_ms = latency.as_millis().min(u64::MAX as u128) as u64;
        let row = format_row(now_secs(), device_id, latency_ms, success);

        let write_result = {
            let mut state = self.state.lock();
            if success {
                state.published += 1;
                state.total_latency_ms = state.total_latency_ms.saturating_add(latency_ms);
                state.samples.record(latency_ms);
            } else {
                state.errors += 1;
            }

            match state.log.as_mut() {
                Some(log) => {
                    let res = log.write_row(&row);
                    if res.is_err() {
                        state.log_write_failures += 1;
                    }
                    Some(res)
                }
                None => None,
            }
        };

        match write_result {
            Some(Ok(())) => {}
            Some(Err(e)) => warn!("[{}] Failed to write metrics row: {}", device_id, e),
            None => warn!("[{}] Event recorded after metrics were finalized", device_id),
        }
    }

    /// Computes a snapshot against the current clock.
    pub fn snapshot(&self) -> MetricsSnapshot {
        self.snapshot_at(Instant::now())
    }

    /// Computes a snapshot as of `now`. Once finalized, the finalize instant
    /// is used instead, so later snapshots stay identical.
    pub fn snapshot_at(&self, now: Instant) -> MetricsSnapshot {
        let (published, errors, total_latency_ms, log_write_failures, end, view) = {
            let state = self.state.lock();
            (
                state.published,
                state.errors,
                state.total_latency_ms,
                state.log_write_failures,
                state.finished_at.unwrap_or(now),
                state.samples.view(),
            )
        };

        let percentiles = view.percentiles();
        let elapsed_secs = end.saturating_duration_since(self.started_at).as_secs_f64();

        let messages_per_sec = if elapsed_secs > 0.0 {
            published as f64 / elapsed_secs
        } else {
            0.0
        };
        let avg_latency_ms = if published > 0 {
            total_latency_ms as f64 / published as f64
        } else {
            0.0
        };

        MetricsSnapshot {
            total_published: published,
            total_errors: errors,
            messages_per_sec,
            avg_latency_ms,
            p50_latency_ms: percentiles.p50,
            p95_latency_ms: percentiles.p95,
            p99_latency_ms: percentiles.p99,
            elapsed_secs,
            log_write_failures,
        }
    }

    /// Flushes and closes the durable log and freezes the run clock.
    ///
    /// Must only be called once every publisher has stopped; a second call
    /// returns [`SimError::Finalized`].
    pub fn finalize(&self) -> Result<()> {
        let log = {
            let mut state = self.state.lock();
            let log = state.log.take().ok_or(SimError::Finalized)?;
            state.finished_at = Some(Instant::now());
            log
        };

        debug!("Closing metrics log {}", self.log_path.display());
        log.close()?;
        Ok(())
    }

    pub fn is_finalized(&self) -> bool {
        self.state.lock().log.is_none()
    }
}
