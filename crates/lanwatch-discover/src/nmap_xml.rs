//! Nmap XML output deserialization.
//!
//! Nmap's `-oX -` flag writes structured XML to stdout. Only the parts
//! presence tracking needs are modelled: host status, addresses and port
//! states. Everything else in the document is ignored.

use std::net::IpAddr;

use chrono::{DateTime, Utc};
use lanwatch_core::{DeviceId, Observation, ScanType};
use serde::Deserialize;

use crate::error::{DiscoverError, Result};

/// Root element: `<nmaprun>`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename = "nmaprun")]
pub struct NmapRun {
    #[serde(rename = "@args")]
    pub args: Option<String>,
    #[serde(rename = "host", default)]
    pub hosts: Vec<NmapHost>,
}

/// A single host from scan results.
#[derive(Debug, Clone, Deserialize)]
pub struct NmapHost {
    pub status: Option<HostStatus>,
    #[serde(rename = "address", default)]
    pub addresses: Vec<Address>,
    pub ports: Option<Ports>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HostStatus {
    #[serde(rename = "@state")]
    pub state: String,
    #[serde(rename = "@reason")]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Address {
    #[serde(rename = "@addr")]
    pub addr: String,
    #[serde(rename = "@addrtype")]
    pub addr_type: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Ports {
    #[serde(rename = "port", default)]
    pub ports: Vec<NmapPort>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NmapPort {
    #[serde(rename = "@protocol")]
    pub protocol: String,
    #[serde(rename = "@portid")]
    pub port_id: u16,
    pub state: PortState,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PortState {
    #[serde(rename = "@state")]
    pub state: String,
}

impl NmapRun {
    /// One observation per identifiable host, all stamped `seen_at`.
    pub fn observations(&self, scan_type: ScanType, seen_at: DateTime<Utc>) -> Vec<Observation> {
        self.hosts
            .iter()
            .filter_map(|h| h.observation(scan_type, seen_at))
            .collect()
    }

    /// Open ports across every host, sorted and deduplicated.
    pub fn open_ports(&self) -> Vec<u16> {
        let mut ports: Vec<u16> = self.hosts.iter().flat_map(NmapHost::open_ports).collect();
        ports.sort_unstable();
        ports.dedup();
        ports
    }
}

impl NmapHost {
    /// The host's IP address, IPv4 preferred.
    pub fn ip(&self) -> Option<IpAddr> {
        ["ipv4", "ipv6"].iter().find_map(|kind| {
            self.addresses
                .iter()
                .find(|a| a.addr_type == *kind)
                .and_then(|a| a.addr.parse().ok())
        })
    }

    /// Extract the MAC address, if present.
    pub fn mac(&self) -> Option<&str> {
        self.addresses
            .iter()
            .find(|a| a.addr_type == "mac")
            .map(|a| a.addr.as_str())
    }

    /// Check if the host is up.
    pub fn is_up(&self) -> bool {
        self.status.as_ref().is_some_and(|s| s.state == "up")
    }

    /// Stable identity: the MAC when nmap saw one (local segment), the IP
    /// address otherwise.
    pub fn device_id(&self) -> Option<DeviceId> {
        match self.mac() {
            Some(mac) => Some(DeviceId::from_mac(mac)),
            None => self.ip().map(DeviceId::from_ip),
        }
    }

    pub fn open_ports(&self) -> Vec<u16> {
        self.ports
            .iter()
            .flat_map(|p| &p.ports)
            .filter(|p| p.state.state == "open")
            .map(|p| p.port_id)
            .collect()
    }

    fn observation(&self, scan_type: ScanType, seen_at: DateTime<Utc>) -> Option<Observation> {
        let id = self.device_id()?;
        let observation = if self.is_up() {
            Observation::responded(id, seen_at, scan_type)
        } else {
            Observation::missed(id, seen_at, scan_type)
        };
        Some(match self.ip() {
            Some(ip) => observation.with_address(ip),
            None => observation,
        })
    }
}

/// Parse nmap XML bytes into a structured `NmapRun`.
pub fn parse_nmap_xml(xml: &[u8]) -> Result<NmapRun> {
    quick_xml::de::from_reader(xml).map_err(|e| DiscoverError::XmlParse(format!("{e}")))
}
