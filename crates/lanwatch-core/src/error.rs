use thiserror::Error;

use crate::types::DeviceId;

/// A persisted or received event label outside the known label table.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Unknown event kind: {label:?}")]
pub struct UnknownEventKind {
    pub label: String,
}

/// Top-level error type for lanwatch.
#[derive(Error, Debug)]
pub enum LanwatchError {
    #[error(transparent)]
    UnknownEventKind(#[from] UnknownEventKind),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Device not found: {0}")]
    DeviceNotFound(DeviceId),

    #[error("Invalid observation: {0}")]
    InvalidObservation(String),

    #[error("Scan of {target} failed: {reason}")]
    ScanFailure { target: String, reason: String },

    #[error("Event queue exceeded capacity {capacity}: {dropped} event(s) dropped")]
    BackpressureOverflow { capacity: usize, dropped: u64 },

    #[error("Network already exists: {0}")]
    NetworkExists(String),

    #[error("Network not found: {0}")]
    NetworkNotFound(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, LanwatchError>;
