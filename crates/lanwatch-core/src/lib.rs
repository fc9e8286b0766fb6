//! lanwatch-core: Shared types, event model, configuration, and error handling.
//!
//! This crate provides the foundational types used across all lanwatch components:
//! - Device identity, presence state, and probe observations
//! - The closed event kind set and its versioned label table
//! - Persisted event log line encoding
//! - Configuration management
//! - Common error types

pub mod config;
pub mod error;
pub mod events;
pub mod types;

pub use config::PresenceConfig;
pub use error::{LanwatchError, Result, UnknownEventKind};
pub use events::{Event, EventId, EventKind, LogEntry};
pub use types::{DeviceId, DeviceRecord, DeviceState, Observation, ScanType};
