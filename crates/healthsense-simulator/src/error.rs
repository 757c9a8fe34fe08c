//! Error types for the simulator

use std::path::PathBuf;
use thiserror::Error;

/// Simulator errors
#[derive(Debug, Error)]
pub enum SimError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to create metrics log {path}: {source}")]
    LogCreate {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Broker connection failed: {0}")]
    Connect(String),

    #[error("Metrics aggregator already finalized")]
    Finalized,

    #[error("Malformed metrics log {path}: {reason}")]
    LogFormat { path: PathBuf, reason: String },
}

/// Result type for simulator operations
pub type Result<T> = std::result::Result<T, SimError>;
