//! Telemetry sample and its wire representation.

use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};

/// One simulated wearable reading.
///
/// Serializes to the JSON payload published on the device topic:
///
/// ```json
/// { "tenant_id": "acme-clinic", "device_id": "watch-0001", "ts": "2025-01-01T00:00:00Z",
///   "metrics": { "hr_bpm": 72, "temp_c": 36.8, "spo2_pct": 97, "steps": 120 },
///   "battery_pct": 88, "fw_version": "1.3.2" }
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetrySample {
    pub tenant_id: String,
    pub device_id: String,
    /// UTC, truncated to whole seconds
    #[serde(rename = "ts")]
    pub timestamp: DateTime<Utc>,
    pub metrics: Vitals,
    pub battery_pct: u8,
    pub fw_version: String,
}

/// Vital signs carried by a sample.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Vitals {
    #[serde(rename = "hr_bpm")]
    pub heart_rate_bpm: i32,
    pub temp_c: f64,
    pub spo2_pct: i32,
    /// Cumulative step count since the device started
    pub steps: u64,
}

impl TelemetrySample {
    /// Returns the MQTT topic this sample is published on.
    pub fn topic(&self) -> String {
        telemetry_topic(&self.tenant_id, &self.device_id)
    }

    /// Serializes the sample into its JSON payload.
    pub fn to_payload(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }
}

/// Builds the topic for a tenant/device pair.
pub fn telemetry_topic(tenant_id: &str, device_id: &str) -> String {
    format!("tenants/{}/devices/{}/telemetry", tenant_id, device_id)
}

/// Current UTC time at second precision.
pub fn now_secs() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(0)
}
