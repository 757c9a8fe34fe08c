use super::{PublishError, Publisher};
use async_trait::async_trait;
use parking_lot::Mutex;
use rand::prelude::*;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Broker-less publisher: every call resolves after a fixed latency and
/// fails with a configured probability.
pub struct DryRunPublisher {
    latency: Duration,
    failure_rate: f64,
    rng: Mutex<StdRng>,
    delivered: AtomicU64,
}

impl DryRunPublisher {
    pub fn new(latency: Duration, failure_rate: f64) -> Self {
        Self {
            latency,
            failure_rate: failure_rate.clamp(0.0, 1.0),
            rng: Mutex::new(StdRng::from_entropy()),
            delivered: AtomicU64::new(0),
        }
    }

    /// Payloads accepted so far.
    pub fn delivered(&self) -> u64 {
        self.delivered.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl Publisher for DryRunPublisher {
    async fn publish(&self, _topic: &str, _payload: Vec<u8>) -> Result<(), PublishError> {
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }

        let fail = self.rng.lock().gen_bool(self.failure_rate);
        if fail {
            return Err(PublishError::Injected);
        }

        self.delivered.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}
