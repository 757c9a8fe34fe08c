//! Publish capability used by device publishers.
//!
//! Devices only see the [`Publisher`] trait; the binary picks the MQTT
//! transport or the broker-less dry run.

mod dry_run;
mod mqtt;

pub use dry_run::DryRunPublisher;
pub use mqtt::{parse_broker_url, MqttPublisher};

use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PublishError {
    #[error("MQTT client error: {0}")]
    Client(#[from] rumqttc::ClientError),

    #[error("Connection lost before acknowledgment: {0}")]
    Connection(String),

    #[error("Acknowledgment channel closed")]
    AckDropped,

    #[error("Publish timed out after {0:?}")]
    Timeout(Duration),

    #[error("Payload serialization failed: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("Injected dry-run failure")]
    Injected,
}

/// Delivers one payload to a topic.
///
/// Resolves once the transport acknowledges the message (or reports an
/// error). Implementations must tolerate many concurrent callers.
#[async_trait]
pub trait Publisher: Send + Sync {
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), PublishError>;
}
