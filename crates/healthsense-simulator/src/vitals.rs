//! Vital sign generators with baseline drift and anomaly injection.

use crate::telemetry::Vitals;
use rand::prelude::*;

/// Probability that a reading is replaced by the anomaly pattern.
pub const ANOMALY_PROBABILITY: f64 = 0.1;

/// Highest heart rate a non-anomalous reading can produce
/// (max baseline 99 bpm + 10 bpm jitter).
pub const NORMAL_HEART_RATE_MAX: i32 = 109;

/// Per-device baseline that drifts the generated readings.
///
/// Owned by exactly one device publisher; the step counter only moves forward.
#[derive(Debug, Clone)]
pub struct VitalsState {
    base_heart_rate: i32,
    base_temp_c: f64,
    base_spo2: i32,
    steps: u64,
}

impl VitalsState {
    /// Cumulative steps emitted so far.
    pub fn steps(&self) -> u64 {
        self.steps
    }

    pub fn base_heart_rate(&self) -> i32 {
        self.base_heart_rate
    }

    pub fn base_temp_c(&self) -> f64 {
        self.base_temp_c
    }

    pub fn base_spo2(&self) -> i32 {
        self.base_spo2
    }

    fn advance_steps(&mut self, steps: u64) {
        self.steps = self.steps.max(steps);
    }
}

/// One synthesized reading before it is stamped with device metadata.
#[derive(Debug, Clone, Copy)]
pub struct Reading {
    pub vitals: Vitals,
    pub battery_pct: u8,
    /// Whether the anomaly pattern overrode heart rate and temperature
    pub anomalous: bool,
}

/// Generates readings for a single device.
pub struct VitalsGenerator {
    rng: StdRng,
}

impl VitalsGenerator {
    pub fn new(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
        }
    }

    pub fn from_entropy() -> Self {
        Self {
            rng: StdRng::from_entropy(),
        }
    }

    /// Draws a fresh baseline: 70-99 bpm, 36.5-37.5 °C, 95-99% SpO2, zero steps.
    pub fn baseline(&mut self) -> VitalsState {
        VitalsState {
            base_heart_rate: 70 + self.rng.gen_range(0..30),
            base_temp_c: 36.5 + self.rng.gen::<f64>(),
            base_spo2: 95 + self.rng.gen_range(0..5),
            steps: 0,
        }
    }

    /// Produces the next reading and advances the device's step counter to it.
    pub fn next_reading(&mut self, state: &mut VitalsState) -> Reading {
        let mut heart_rate_bpm = state.base_heart_rate + self.rng.gen_range(-10..=10);
        let mut temp_c = state.base_temp_c + self.rng.gen_range(-0.2..0.2);
        let spo2_pct = state.base_spo2 + self.rng.gen_range(-1..=1);
        let steps = state.steps + self.rng.gen_range(0..50);
        let battery_pct = 100 - self.rng.gen_range(0..30u8);

        let anomalous = self.rng.gen_bool(ANOMALY_PROBABILITY);
        if anomalous {
            heart_rate_bpm = self.rng.gen_range(150..180);
            temp_c = 38.0 + self.rng.gen::<f64>();
        }

        state.advance_steps(steps);

        Reading {
            vitals: Vitals {
                heart_rate_bpm,
                temp_c,
                spo2_pct,
                steps,
            },
            battery_pct,
            anomalous,
        }
    }
}
