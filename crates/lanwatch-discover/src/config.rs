//! Configuration for the lanwatch scanner daemon.

use std::time::Duration;

use ipnet::IpNet;
use lanwatch_presence::Network;
use serde::Deserialize;

use crate::error::{DiscoverError, Result};

/// Top-level discover configuration.
///
/// Loaded from `lanwatch.toml` `[discover]` section or
/// `LANWATCH_DISCOVER__` environment variables.
#[derive(Debug, Clone, Deserialize)]
pub struct DiscoverConfig {
    /// Path to the nmap binary (default: "nmap").
    #[serde(default = "default_nmap_path")]
    pub nmap_path: String,

    /// Port scan profile if not specified per network.
    #[serde(default)]
    pub default_profile: ScanProfile,

    /// Networks to monitor.
    #[serde(default)]
    pub networks: Vec<NetworkSchedule>,

    /// Maximum concurrent nmap processes.
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent_scans: usize,

    /// A scan pass running longer than this is abandoned.
    #[serde(default = "default_scan_timeout")]
    pub scan_timeout_secs: u64,

    /// JSON-lines event log written by the dispatcher.
    #[serde(default = "default_event_log_path")]
    pub event_log_path: String,

    /// Delay between delivery attempts while the event store is unavailable.
    #[serde(default = "default_delivery_retry")]
    pub delivery_retry_ms: u64,

    /// Prefix length assumed for the local network when reporting it.
    #[serde(default = "default_local_prefix_len")]
    pub local_prefix_len: u8,
}

/// A network with its sweep schedule.
#[derive(Debug, Clone, Deserialize)]
pub struct NetworkSchedule {
    /// Unique name for this network.
    pub name: String,

    /// CIDR target (e.g., "192.168.1.0/24").
    pub cidr: String,

    /// Port scan profile override for this network.
    pub profile: Option<ScanProfile>,

    /// Sweep interval in seconds.
    #[serde(default = "default_interval")]
    pub interval_secs: u64,

    /// Follow every sweep with a port scan.
    #[serde(default)]
    pub port_scan: bool,

    /// Whether this network is enabled for scanning.
    #[serde(default = "default_true")]
    pub enabled: bool,
}

impl NetworkSchedule {
    /// Catalog entry for this schedule.
    pub fn to_network(&self) -> Result<Network> {
        let cidr: IpNet = self
            .cidr
            .parse()
            .map_err(|e| DiscoverError::Config(format!("network {}: {e}", self.name)))?;
        Ok(Network {
            name: self.name.clone(),
            cidr,
            scan_interval_secs: self.interval_secs,
            enabled: self.enabled,
        })
    }
}

/// Nmap flag sets for port scans. Sweeps always use `-sn`.
#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ScanProfile {
    /// Top 100 ports: `-F`
    Quick,
    /// SYN scan, top 1000 ports: `-sS --top-ports 1000`
    #[default]
    Standard,
    /// SYN scan of every port: `-sS -p-`
    Deep,
}

impl ScanProfile {
    /// Return the nmap flags for this profile.
    pub fn nmap_flags(&self) -> Vec<&'static str> {
        match self {
            Self::Quick => vec!["-F"],
            Self::Standard => vec!["-sS", "--top-ports", "1000"],
            Self::Deep => vec!["-sS", "-p-"],
        }
    }
}

impl std::str::FromStr for ScanProfile {
    type Err = DiscoverError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "quick" => Ok(Self::Quick),
            "standard" => Ok(Self::Standard),
            "deep" => Ok(Self::Deep),
            _ => Err(DiscoverError::Config(format!(
                "invalid profile: {s}. Choose: quick, standard, deep"
            ))),
        }
    }
}

impl DiscoverConfig {
    pub fn scan_timeout(&self) -> Duration {
        Duration::from_secs(self.scan_timeout_secs)
    }

    pub fn delivery_retry(&self) -> Duration {
        Duration::from_millis(self.delivery_retry_ms)
    }
}

fn default_nmap_path() -> String {
    "nmap".to_string()
}

fn default_max_concurrent() -> usize {
    4
}

fn default_scan_timeout() -> u64 {
    120
}

fn default_event_log_path() -> String {
    "./lanwatch-events.jsonl".to_string()
}

fn default_delivery_retry() -> u64 {
    1000
}

fn default_local_prefix_len() -> u8 {
    24
}

fn default_interval() -> u64 {
    300
}

fn default_true() -> bool {
    true
}

impl Default for DiscoverConfig {
    fn default() -> Self {
        Self {
            nmap_path: default_nmap_path(),
            default_profile: ScanProfile::default(),
            networks: Vec::new(),
            max_concurrent_scans: default_max_concurrent(),
            scan_timeout_secs: default_scan_timeout(),
            event_log_path: default_event_log_path(),
            delivery_retry_ms: default_delivery_retry(),
            local_prefix_len: default_local_prefix_len(),
        }
    }
}
