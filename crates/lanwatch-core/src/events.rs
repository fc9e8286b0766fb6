//! Event types for the lanwatch event log.
//!
//! Events are produced by the presence state machine, the scan coordinator
//! and the network catalog, then handed to the event sink for persistence and
//! notification. The persisted log is JSON lines; each line carries the exact
//! [`EventKind`] label so logs stay readable across releases.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use uuid::Uuid;

use crate::error::{Result, UnknownEventKind};
use crate::types::DeviceId;

/// Version of the label table below. Bump together with a log migration
/// whenever a label is added.
pub const LABEL_TABLE_VERSION: u32 = 1;

/// Version written into every persisted log line.
pub const LOG_FORMAT_VERSION: u32 = 1;

// ── Event kind ────────────────────────────────────────────────────

/// Closed set of event kinds.
///
/// Serialized as its label. Labels are persisted and must never be renamed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum EventKind {
    PingSweep,
    PortScanStarted,
    PortScanCompleted,
    DeviceOnline,
    DeviceIdle,
    DeviceOffline,
    LocalIpFound,
    LocalNetworkFound,
    NetworkCreated,
    NetworkUpdated,
    NetworkDeleted,
    ScanStarted,
    Warning,
    Alert,
}

impl EventKind {
    pub const ALL: [EventKind; 14] = [
        Self::PingSweep,
        Self::PortScanStarted,
        Self::PortScanCompleted,
        Self::DeviceOnline,
        Self::DeviceIdle,
        Self::DeviceOffline,
        Self::LocalIpFound,
        Self::LocalNetworkFound,
        Self::NetworkCreated,
        Self::NetworkUpdated,
        Self::NetworkDeleted,
        Self::ScanStarted,
        Self::Warning,
        Self::Alert,
    ];

    /// Display label and serialization tag (label table v1).
    pub fn label(self) -> &'static str {
        match self {
            Self::PingSweep => "Ping sweep",
            Self::PortScanStarted => "Port scan started",
            Self::PortScanCompleted => "Port scan completed",
            Self::DeviceOnline => "Device online",
            Self::DeviceIdle => "Device became idle",
            Self::DeviceOffline => "Device is now offline",
            Self::LocalIpFound => "Local IPv4 address found",
            Self::LocalNetworkFound => "Local network found",
            Self::NetworkCreated => "Network created",
            Self::NetworkUpdated => "Network updated",
            Self::NetworkDeleted => "Network deleted",
            Self::ScanStarted => "Scan started",
            Self::Warning => "Warning",
            Self::Alert => "Alert",
        }
    }

    pub fn from_label(label: &str) -> std::result::Result<Self, UnknownEventKind> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.label() == label)
            .ok_or_else(|| UnknownEventKind {
                label: label.to_string(),
            })
    }

    /// Kinds forwarded to the notification collaborator.
    pub fn is_notifiable(self) -> bool {
        matches!(self, Self::Warning | Self::Alert)
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl FromStr for EventKind {
    type Err = UnknownEventKind;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Self::from_label(s)
    }
}

impl Serialize for EventKind {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(self.label())
    }
}

impl<'de> Deserialize<'de> for EventKind {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let label = String::deserialize(deserializer)?;
        Self::from_label(&label).map_err(serde::de::Error::custom)
    }
}

// ── Event ─────────────────────────────────────────────────────────

/// Unique identifier for an event. Notification consumers dedupe on it.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(transparent)]
pub struct EventId(pub Uuid);

impl EventId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for EventId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A single entry of the event log. Built with the consuming `with_*`
/// methods and never mutated afterwards.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Event {
    id: EventId,
    kind: EventKind,
    #[serde(default)]
    device_id: Option<DeviceId>,
    timestamp: DateTime<Utc>,
    #[serde(default)]
    details: BTreeMap<String, String>,
}

impl Event {
    pub fn new(kind: EventKind) -> Self {
        Self {
            id: EventId::new(),
            kind,
            device_id: None,
            timestamp: Utc::now(),
            details: BTreeMap::new(),
        }
    }

    pub fn at(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn for_device(mut self, device_id: DeviceId) -> Self {
        self.device_id = Some(device_id);
        self
    }

    pub fn with_detail(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.details.insert(key.into(), value.to_string());
        self
    }

    pub fn id(&self) -> EventId {
        self.id
    }

    pub fn kind(&self) -> EventKind {
        self.kind
    }

    pub fn device_id(&self) -> Option<&DeviceId> {
        self.device_id.as_ref()
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub fn details(&self) -> &BTreeMap<String, String> {
        &self.details
    }

    pub fn detail(&self, key: &str) -> Option<&str> {
        self.details.get(key).map(String::as_str)
    }
}

// ── Persisted log lines ───────────────────────────────────────────

#[derive(Serialize)]
struct LogLine<'a> {
    v: u32,
    #[serde(flatten)]
    event: &'a Event,
}

/// One line of a persisted event log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogEntry {
    Known(Event),
    /// A line whose kind label is not in this build's table. Kept verbatim so
    /// it is written back unchanged.
    Unrecognized { label: String, raw: String },
}

impl LogEntry {
    /// Parse one log line. Malformed JSON is an error; an unknown label is not.
    pub fn parse(line: &str) -> Result<Self> {
        let value: serde_json::Value = serde_json::from_str(line)?;
        let label = value
            .get("kind")
            .and_then(serde_json::Value::as_str)
            .unwrap_or_default()
            .to_string();

        if let Err(unknown) = EventKind::from_label(&label) {
            tracing::debug!(label = %unknown.label, "Preserving log line with unknown event kind");
            return Ok(Self::Unrecognized {
                label,
                raw: line.to_string(),
            });
        }

        Ok(Self::Known(serde_json::from_value(value)?))
    }

    /// Encode as a single log line (no trailing newline).
    pub fn to_line(&self) -> Result<String> {
        match self {
            Self::Known(event) => encode_line(event),
            Self::Unrecognized { raw, .. } => Ok(raw.clone()),
        }
    }

    pub fn as_event(&self) -> Option<&Event> {
        match self {
            Self::Known(event) => Some(event),
            Self::Unrecognized { .. } => None,
        }
    }
}

/// Encode an event as a versioned log line.
pub fn encode_line(event: &Event) -> Result<String> {
    Ok(serde_json::to_string(&LogLine {
        v: LOG_FORMAT_VERSION,
        event,
    })?)
}
