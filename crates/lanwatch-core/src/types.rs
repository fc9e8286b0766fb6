//! Core domain types for device presence tracking.
//!
//! A device is keyed by a stable identity (normally its MAC address). Probe
//! results arrive as [`Observation`]s and accumulate into one [`DeviceRecord`]
//! per identity.

use std::fmt;
use std::net::IpAddr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ── Identity ──────────────────────────────────────────────────────

/// Stable key for a device: a MAC address or another persistent ID.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(transparent)]
pub struct DeviceId(pub String);

impl DeviceId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Identity from a hardware address, normalized to upper-case colon form.
    pub fn from_mac(mac: &str) -> Self {
        Self(mac.trim().replace('-', ":").to_uppercase())
    }

    /// Fallback identity for hosts whose MAC is not visible (routed hosts,
    /// unprivileged scans).
    pub fn from_ip(ip: IpAddr) -> Self {
        Self(format!("ip:{ip}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.trim().is_empty()
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ── Presence ──────────────────────────────────────────────────────

/// Presence state of a single device.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum DeviceState {
    #[default]
    Unknown,
    Online,
    Idle,
    Offline,
}

impl DeviceState {
    /// Whether `self -> next` is an edge of the presence state machine.
    pub fn can_transition_to(self, next: DeviceState) -> bool {
        matches!(
            (self, next),
            (Self::Unknown, Self::Online)
                | (Self::Online, Self::Idle)
                | (Self::Idle, Self::Offline)
                | (Self::Idle, Self::Online)
                | (Self::Offline, Self::Online)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Unknown => "unknown",
            Self::Online => "online",
            Self::Idle => "idle",
            Self::Offline => "offline",
        }
    }
}

impl fmt::Display for DeviceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which kind of scan pass produced an observation.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ScanType {
    PingSweep,
    PortScan,
}

impl ScanType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::PingSweep => "ping_sweep",
            Self::PortScan => "port_scan",
        }
    }
}

impl fmt::Display for ScanType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── Observation ───────────────────────────────────────────────────

/// One probe result for one device in one scan pass.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Observation {
    pub device_id: DeviceId,
    pub seen_at: DateTime<Utc>,
    pub responded: bool,
    pub scan_type: ScanType,
    /// Address the device answered on, when the prober knows it.
    #[serde(default)]
    pub address: Option<IpAddr>,
}

impl Observation {
    pub fn responded(device_id: DeviceId, seen_at: DateTime<Utc>, scan_type: ScanType) -> Self {
        Self {
            device_id,
            seen_at,
            responded: true,
            scan_type,
            address: None,
        }
    }

    pub fn missed(device_id: DeviceId, seen_at: DateTime<Utc>, scan_type: ScanType) -> Self {
        Self {
            device_id,
            seen_at,
            responded: false,
            scan_type,
            address: None,
        }
    }

    pub fn with_address(mut self, address: IpAddr) -> Self {
        self.address = Some(address);
        self
    }

    /// Tie-break order between two observations of the same device: the
    /// later one wins, and at equal timestamps a response beats a miss.
    pub fn supersedes(&self, other: &Observation) -> bool {
        (self.seen_at, self.responded) > (other.seen_at, other.responded)
    }
}

// ── Device record ─────────────────────────────────────────────────

/// Last-known presence state of one device.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DeviceRecord {
    pub id: DeviceId,
    pub address: Option<IpAddr>,
    pub first_seen: DateTime<Utc>,
    /// Time of the last positive response (first observation if none yet).
    pub last_seen: DateTime<Utc>,
    /// Timestamp of the most recently applied observation.
    pub last_observed: Option<DateTime<Utc>>,
    /// Whether the most recently applied observation was a response.
    pub last_responded: bool,
    pub state: DeviceState,
    pub consecutive_misses: u32,
}

impl DeviceRecord {
    pub fn new(id: DeviceId, first_seen: DateTime<Utc>) -> Self {
        Self {
            id,
            address: None,
            first_seen,
            last_seen: first_seen,
            last_observed: None,
            last_responded: false,
            state: DeviceState::Unknown,
            consecutive_misses: 0,
        }
    }

    /// An observation is stale when it is older than the last applied one, or
    /// carries the same timestamp without upgrading a miss to a response.
    pub fn is_stale(&self, obs: &Observation) -> bool {
        match self.last_observed {
            None => false,
            Some(last) => {
                obs.seen_at < last
                    || (obs.seen_at == last && (self.last_responded || !obs.responded))
            }
        }
    }

    /// Timestamp and miss-counter bookkeeping for an observation. Does not
    /// change `state`.
    pub fn record_observation(&mut self, obs: &Observation) {
        self.last_observed = Some(obs.seen_at);
        self.last_responded = obs.responded;
        if let Some(addr) = obs.address {
            self.address = Some(addr);
        }
        if obs.responded {
            self.last_seen = obs.seen_at;
            self.consecutive_misses = 0;
        } else {
            self.consecutive_misses = self.consecutive_misses.saturating_add(1);
        }
    }
}
