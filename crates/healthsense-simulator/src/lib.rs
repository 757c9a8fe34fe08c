//! Wearable telemetry load simulator.
//!
//! This crate simulates a fleet of health wearables that publish vitals
//! telemetry to an MQTT broker at a fixed cadence, and measures how the
//! ingestion path holds up under load.
//!
//! # Components
//! - Device publishers: one task per device, publishing JSON samples to
//!   `tenants/{tenant}/devices/{device}/telemetry` at QoS 1
//! - Metrics aggregator: counters, latency percentiles and a durable
//!   per-event CSV log
//! - Reporter: periodic one-line progress summaries
//! - Shutdown coordinator: deadline or signal driven, drains every device
//!   before the final snapshot
//!
//! # Usage
//! ```bash
//! # 100 devices publishing every second for two minutes
//! healthsense-simulator run --devices 100 --interval-ms 1000 --duration-secs 120
//!
//! # Exercise the pipeline without a broker
//! healthsense-simulator run --dry-run --devices 1000 --duration-secs 30
//!
//! # Summarize logs from earlier runs
//! healthsense-simulator analyze test-10.csv test-100.csv
//! ```

pub mod aggregator;
pub mod analyze;
pub mod config;
pub mod coordinator;
pub mod device;
pub mod error;
pub mod event_log;
pub mod fleet;
pub mod report;
pub mod reporter;
pub mod telemetry;
pub mod transport;
pub mod vitals;

pub use aggregator::{MetricsAggregator, MetricsSnapshot};
pub use config::{PercentileMode, SimulatorConfig, SimulatorSettings, TransportConfig};
pub use coordinator::{run_simulation, ShutdownCoordinator, StopHandle};
pub use error::{Result, SimError};
pub use fleet::{generate_fleet, Device};
pub use report::{RunReport, StopReason};
pub use telemetry::TelemetrySample;
pub use transport::{DryRunPublisher, MqttPublisher, PublishError, Publisher};
