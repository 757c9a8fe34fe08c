//! Periodic progress reporting.

use crate::aggregator::{MetricsAggregator, MetricsSnapshot};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Formats the one-line progress summary.
pub fn progress_line(snapshot: &MetricsSnapshot) -> String {
    format!(
        "Throughput: {:.0} msg/s | Published: {} | Errors: {} | Avg Latency: {:.0}ms | P95: {}ms",
        snapshot.messages_per_sec,
        snapshot.total_published,
        snapshot.total_errors,
        snapshot.avg_latency_ms,
        snapshot.p95_latency_ms
    )
}

/// Logs a snapshot summary every `period` until cancelled.
/// Returns the number of cycles completed.
pub async fn run_reporter(
    aggregator: Arc<MetricsAggregator>,
    period: Duration,
    cancel: CancellationToken,
) -> u64 {
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut cycles = 0;

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let snapshot = aggregator.snapshot();
        info!("{}", progress_line(&snapshot));
        cycles += 1;
    }

    cycles
}
