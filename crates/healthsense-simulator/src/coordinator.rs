//! Run orchestration and graceful shutdown.
//!
//! The coordinator owns the single shutdown token shared by every device
//! task and the reporter, and keeps every device `JoinHandle`. Devices tick
//! on a schedule anchored at the run start. When the run duration elapses
//! each device finishes its last tick scheduled at or before the deadline
//! and exits on its own; an external stop cancels them at the next tick
//! boundary instead. Either way the order after that is fixed: await every
//! device, cancel and join the reporter, finalize the aggregator, take the
//! terminal snapshot. The aggregator is therefore never finalized while a
//! device can still record an event.

use crate::aggregator::MetricsAggregator;
use crate::config::SimulatorConfig;
use crate::device::{DevicePublisher, DeviceSettings, DeviceSummary};
use crate::error::Result;
use crate::fleet::generate_fleet;
use crate::report::{RunReport, StopReason};
use crate::reporter::run_reporter;
use crate::transport::Publisher;
use std::future::Future;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Requests shutdown of a running simulation from outside.
#[derive(Debug, Clone)]
pub struct StopHandle {
    token: CancellationToken,
}

impl StopHandle {
    pub fn stop(&self) {
        self.token.cancel();
    }

    pub fn is_stopped(&self) -> bool {
        self.token.is_cancelled()
    }
}

/// Spawns the fleet, waits for a stop trigger and drains it.
pub struct ShutdownCoordinator {
    config: SimulatorConfig,
    aggregator: Arc<MetricsAggregator>,
    publisher: Arc<dyn Publisher>,
    shutdown: CancellationToken,
}

impl ShutdownCoordinator {
    /// Validates the configuration and opens the durable log. Either failing
    /// aborts the run before any device starts.
    pub fn new(config: SimulatorConfig, publisher: Arc<dyn Publisher>) -> Result<Self> {
        config.validate()?;
        let aggregator = Arc::new(MetricsAggregator::create(
            &config.metrics_file,
            config.percentiles,
        )?);

        Ok(Self {
            config,
            aggregator,
            publisher,
            shutdown: CancellationToken::new(),
        })
    }

    pub fn aggregator(&self) -> Arc<MetricsAggregator> {
        Arc::clone(&self.aggregator)
    }

    pub fn stop_handle(&self) -> StopHandle {
        StopHandle {
            token: self.shutdown.clone(),
        }
    }

    /// Runs until the configured duration elapses, `external_stop` resolves,
    /// or a [`StopHandle`] is triggered; then drains and finalizes.
    pub async fn run<F>(self, external_stop: F) -> Result<RunReport>
    where
        F: Future<Output = ()>,
    {
        let config = &self.config;
        let fleet = generate_fleet(&config.tenant_id, config.device_count);
        let settings = DeviceSettings::from(config);

        info!(
            "Starting {} devices for tenant {} (interval {:?})",
            fleet.len(),
            config.tenant_id,
            config.interval
        );

        let start = Instant::now();
        let deadline = config.duration.map(|d| start + d);

        let mut devices = Vec::with_capacity(fleet.len());
        for device in fleet {
            let publisher = DevicePublisher::new(
                device,
                settings.clone(),
                Arc::clone(&self.publisher),
                Arc::clone(&self.aggregator),
            )
            .schedule(start, deadline);
            devices.push(tokio::spawn(publisher.run(self.shutdown.clone())));
        }

        let reporter = tokio::spawn(run_reporter(
            Arc::clone(&self.aggregator),
            config.report_interval,
            self.shutdown.child_token(),
        ));

        let deadline_reached = async move {
            match deadline {
                Some(at) => tokio::time::sleep_until(at).await,
                None => std::future::pending::<()>().await,
            }
        };
        tokio::pin!(external_stop);

        let stop_reason = tokio::select! {
            _ = deadline_reached => {
                info!("Test duration reached, shutting down...");
                StopReason::Deadline
            }
            _ = &mut external_stop => {
                info!("Stop requested, shutting down...");
                StopReason::External
            }
            _ = self.shutdown.cancelled() => {
                info!("Stop requested, shutting down...");
                StopReason::External
            }
        };

        let drain = await_devices(devices);
        tokio::pin!(drain);
        let (devices_stopped, device_panics) = match stop_reason {
            StopReason::External => {
                self.shutdown.cancel();
                drain.await
            }
            // Devices stop on their own after the deadline tick; a stop
            // request while they finish it still cancels them
            StopReason::Deadline => tokio::select! {
                counts = &mut drain => counts,
                _ = &mut external_stop => {
                    info!("Stop requested while draining");
                    self.shutdown.cancel();
                    drain.await
                }
            },
        };
        self.shutdown.cancel();
        info!("All {} devices stopped", devices_stopped + device_panics);

        match reporter.await {
            Ok(cycles) => debug!("Reporter stopped after {} cycles", cycles),
            Err(e) => warn!("Reporter task failed: {}", e),
        }

        self.aggregator.finalize()?;
        let metrics = self.aggregator.snapshot();
        info!(
            "Metrics written to {}",
            self.aggregator.log_path().display()
        );

        Ok(RunReport::new(
            &self.config,
            stop_reason,
            devices_stopped,
            device_panics,
            metrics,
        ))
    }
}

/// Awaits every device task, returning (stopped, panicked) counts.
async fn await_devices(devices: Vec<JoinHandle<DeviceSummary>>) -> (usize, usize) {
    let mut devices_stopped = 0;
    let mut device_panics = 0;
    for handle in devices {
        match handle.await {
            Ok(summary) => {
                debug!(
                    "[{}] stopped after {} attempts ({} failed)",
                    summary.device_id, summary.attempts, summary.failures
                );
                devices_stopped += 1;
            }
            Err(e) => {
                error!("Device task failed: {}", e);
                device_panics += 1;
            }
        }
    }
    (devices_stopped, device_panics)
}

/// Runs a complete simulation with the given publish capability.
pub async fn run_simulation<F>(
    config: SimulatorConfig,
    publisher: Arc<dyn Publisher>,
    external_stop: F,
) -> Result<RunReport>
where
    F: Future<Output = ()>,
{
    ShutdownCoordinator::new(config, publisher)?
        .run(external_stop)
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SimError;
    use crate::transport::DryRunPublisher;
    use std::time::Duration;
    use tempfile::TempDir;

    fn config(dir: &TempDir, devices: usize, duration_ms: Option<u64>) -> SimulatorConfig {
        SimulatorConfig {
            device_count: devices,
            interval: Duration::from_millis(100),
            duration: duration_ms.map(Duration::from_millis),
            metrics_file: dir.path().join("metrics.csv"),
            ..Default::default()
        }
    }

    fn dry_run(latency_ms: u64) -> Arc<dyn Publisher> {
        Arc::new(DryRunPublisher::new(Duration::from_millis(latency_ms), 0.0))
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_stops_run() {
        let dir = TempDir::new().unwrap();
        let report = run_simulation(config(&dir, 3, Some(1000)), dry_run(2), std::future::pending())
            .await
            .unwrap();

        assert_eq!(report.stop_reason, StopReason::Deadline);
        assert_eq!(report.devices_stopped, 3);
        assert_eq!(report.device_panics, 0);
        assert_eq!(report.metrics.total_attempts(), 30);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_during_deadline_tick() {
        let dir = TempDir::new().unwrap();
        let started = Instant::now();
        // Lands while the 500ms tick is still publishing
        let stop = tokio::time::sleep(Duration::from_millis(520));

        let report = run_simulation(config(&dir, 2, Some(500)), dry_run(50), stop)
            .await
            .unwrap();

        assert_eq!(report.stop_reason, StopReason::Deadline);
        assert_eq!(report.devices_stopped, 2);
        assert_eq!(report.metrics.total_published, 10);
        assert_eq!(started.elapsed(), Duration::from_millis(550));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_handle() {
        let dir = TempDir::new().unwrap();
        let coordinator = ShutdownCoordinator::new(config(&dir, 2, None), dry_run(1)).unwrap();
        let stop = coordinator.stop_handle();

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(350)).await;
            stop.stop();
        });

        let report = coordinator.run(std::future::pending()).await.unwrap();
        assert_eq!(report.stop_reason, StopReason::External);
        assert_eq!(report.metrics.total_published, 6);
    }

    #[tokio::test(start_paused = true)]
    async fn test_external_future_stops_run() {
        let dir = TempDir::new().unwrap();
        let stop = tokio::time::sleep(Duration::from_millis(250));

        let report = run_simulation(config(&dir, 4, Some(60_000)), dry_run(0), stop)
            .await
            .unwrap();
        assert_eq!(report.stop_reason, StopReason::External);
        assert_eq!(report.metrics.total_published, 8);
    }

    #[tokio::test]
    async fn test_invalid_config_rejected_before_log() {
        let dir = TempDir::new().unwrap();
        let res = ShutdownCoordinator::new(config(&dir, 0, Some(100)), dry_run(0));
        assert!(matches!(res, Err(SimError::Config(_))));
        assert!(!dir.path().join("metrics.csv").exists());
    }

    #[tokio::test(start_paused = true)]
    async fn test_aggregator_finalized_after_run() {
        let dir = TempDir::new().unwrap();
        let coordinator = ShutdownCoordinator::new(config(&dir, 1, Some(300)), dry_run(0)).unwrap();
        let aggregator = coordinator.aggregator();

        coordinator.run(std::future::pending()).await.unwrap();
        assert!(aggregator.is_finalized());
    }
}
