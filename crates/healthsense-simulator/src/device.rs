//! Per-device publish loop.

use crate::aggregator::MetricsAggregator;
use crate::config::SimulatorConfig;
use crate::fleet::Device;
use crate::telemetry::{now_secs, TelemetrySample};
use crate::transport::{PublishError, Publisher};
use crate::vitals::{VitalsGenerator, VitalsState};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Lifecycle of a device publisher. Never moves backwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum DeviceState {
    Idle,
    Running,
    /// Cancellation observed, loop winding down
    Stopping,
    Stopped,
}

/// Settings shared by every device of a run.
#[derive(Debug, Clone)]
pub struct DeviceSettings {
    pub interval: Duration,
    pub publish_timeout: Option<Duration>,
    pub fw_version: String,
    pub seed: Option<u64>,
}

impl From<&SimulatorConfig> for DeviceSettings {
    fn from(config: &SimulatorConfig) -> Self {
        Self {
            interval: config.interval,
            publish_timeout: config.publish_timeout,
            fw_version: config.fw_version.clone(),
            seed: config.seed,
        }
    }
}

/// What a device did before it stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceSummary {
    pub device_id: String,
    pub attempts: u64,
    pub failures: u64,
}

fn transition(state: &watch::Sender<DeviceState>, device_id: &str, next: DeviceState) {
    let prev = state.send_replace(next);
    debug_assert!(next > prev, "{:?} -> {:?}", prev, next);
    debug!("[{}] {:?} -> {:?}", device_id, prev, next);
}

/// Publishes telemetry for one simulated device until cancelled.
pub struct DevicePublisher {
    device: Device,
    settings: DeviceSettings,
    generator: VitalsGenerator,
    publisher: Arc<dyn Publisher>,
    aggregator: Arc<MetricsAggregator>,
    state: Arc<watch::Sender<DeviceState>>,
    /// Tick schedule origin; defaults to the moment `run` starts
    start: Option<Instant>,
    /// No tick scheduled after this instant runs
    deadline: Option<Instant>,
    attempts: u64,
    failures: u64,
}

impl DevicePublisher {
    pub fn new(
        device: Device,
        settings: DeviceSettings,
        publisher: Arc<dyn Publisher>,
        aggregator: Arc<MetricsAggregator>,
    ) -> Self {
        let generator = match settings.seed {
            Some(seed) => VitalsGenerator::new(device.seed(seed)),
            None => VitalsGenerator::from_entropy(),
        };

        Self {
            device,
            settings,
            generator,
            publisher,
            aggregator,
            state: Arc::new(watch::channel(DeviceState::Idle).0),
            start: None,
            deadline: None,
            attempts: 0,
            failures: 0,
        }
    }

    /// Aligns ticks to `start + k * interval` and stops the device after
    /// its last tick scheduled at or before `deadline`.
    pub fn schedule(mut self, start: Instant, deadline: Option<Instant>) -> Self {
        self.start = Some(start);
        self.deadline = deadline;
        self
    }

    pub fn device_id(&self) -> &str {
        &self.device.id
    }

    pub fn state(&self) -> DeviceState {
        *self.state.borrow()
    }

    /// Follows state transitions, including after `run` takes ownership.
    pub fn subscribe_state(&self) -> watch::Receiver<DeviceState> {
        self.state.subscribe()
    }

    /// Runs the tick loop. The first publish happens one interval after
    /// start; with a deadline the loop ends on its own after the last tick
    /// scheduled at or before it. A cancellation that arrives mid-tick
    /// moves the device to `Stopping` but never interrupts the publish; it
    /// completes (or times out) and is recorded before the loop exits.
    pub async fn run(mut self, cancel: CancellationToken) -> DeviceSummary {
        let state = Arc::clone(&self.state);
        let device_id = self.device.id.clone();
        transition(&state, &device_id, DeviceState::Running);

        let mut vitals = self.generator.baseline();
        let period = self.settings.interval;
        let start = self.start.unwrap_or_else(Instant::now);
        let deadline = self.deadline;
        let mut ticker = interval_at(start + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            let scheduled = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                at = ticker.tick() => at,
            };
            if deadline.is_some_and(|d| scheduled > d) {
                break;
            }

            let tick = self.tick(&mut vitals);
            tokio::pin!(tick);
            tokio::select! {
                biased;
                _ = &mut tick => {}
                _ = cancel.cancelled() => {
                    transition(&state, &device_id, DeviceState::Stopping);
                    tick.await;
                    break;
                }
            }

            if deadline.is_some_and(|d| scheduled + period > d) {
                break;
            }
        }

        if *state.borrow() < DeviceState::Stopping {
            transition(&state, &device_id, DeviceState::Stopping);
        }
        let summary = DeviceSummary {
            device_id: device_id.clone(),
            attempts: self.attempts,
            failures: self.failures,
        };
        transition(&state, &device_id, DeviceState::Stopped);
        summary
    }

    /// Synthesizes one sample, publishes it and records the outcome.
    /// Returns whether the publish succeeded.
    pub async fn tick(&mut self, vitals: &mut VitalsState) -> bool {
        let sample = self.next_sample(vitals);
        let topic = sample.topic();

        let start = Instant::now();
        let outcome = match sample.to_payload() {
            Ok(payload) => self.publish(&topic, payload).await,
            Err(e) => Err(PublishError::from(e)),
        };
        let latency = start.elapsed();

        self.attempts += 1;
        let success = outcome.is_ok();
        self.aggregator.record_event(&self.device.id, latency, success);

        if let Err(e) = outcome {
            self.failures += 1;
            warn!("[{}] Publish error: {}", self.device.id, e);
        }
        success
    }

    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), PublishError> {
        let publish = self.publisher.publish(topic, payload);
        match self.settings.publish_timeout {
            Some(limit) => match tokio::time::timeout(limit, publish).await {
                Ok(result) => result,
                Err(_) => Err(PublishError::Timeout(limit)),
            },
            None => publish.await,
        }
    }

    /// Draws the next reading and stamps it with device metadata.
    pub fn next_sample(&mut self, vitals: &mut VitalsState) -> TelemetrySample {
        let reading = self.generator.next_reading(vitals);
        TelemetrySample {
            tenant_id: self.device.tenant_id.clone(),
            device_id: self.device.id.clone(),
            timestamp: now_secs(),
            metrics: reading.vitals,
            battery_pct: reading.battery_pct,
            fw_version: self.settings.fw_version.clone(),
        }
    }
}
