//! Network probing.
//!
//! [`Prober`] is the seam between scheduling and the tool doing the probing.
//! [`NmapScanner`] runs nmap as a child process via `tokio::process::Command`
//! and converts its XML output into observations.

use std::net::{IpAddr, Ipv4Addr, UdpSocket};
use std::time::Instant;

use async_trait::async_trait;
use chrono::Utc;
use ipnet::Ipv4Net;
use lanwatch_core::{Observation, ScanType};
use lanwatch_presence::PortScanReport;
use tokio::process::Command;

use crate::config::ScanProfile;
use crate::error::{DiscoverError, Result};
use crate::nmap_xml::{self, NmapRun};

/// Flags for a host-discovery-only sweep.
pub const PING_SWEEP_FLAGS: &[&str] = &["-sn"];

/// Something that can probe a target network.
#[async_trait]
pub trait Prober: Send + Sync {
    /// Discover responding hosts. Only responders need to be returned.
    async fn ping_sweep(&self, target: &str) -> Result<Vec<Observation>>;

    /// Probe ports on every host of `target`.
    async fn port_scan(&self, target: &str, profile: &ScanProfile) -> Result<PortScanReport>;

    /// The host's own IPv4 address and network, if it can be determined.
    fn local_interface(&self) -> Option<(Ipv4Addr, Ipv4Net)> {
        None
    }
}

/// Wrapper around the nmap binary.
pub struct NmapScanner {
    nmap_path: String,
    local_prefix_len: u8,
}

impl NmapScanner {
    pub fn new(nmap_path: &str, local_prefix_len: u8) -> Self {
        Self {
            nmap_path: nmap_path.to_string(),
            local_prefix_len,
        }
    }

    /// Verify nmap is installed and accessible.
    pub async fn verify_installation(&self) -> Result<String> {
        let output = Command::new(&self.nmap_path)
            .arg("--version")
            .output()
            .await
            .map_err(|_| DiscoverError::NmapNotFound {
                path: self.nmap_path.clone(),
            })?;

        String::from_utf8(output.stdout).map_err(|e| DiscoverError::XmlParse(e.to_string()))
    }

    /// Run nmap with `flags` against `target` and parse its XML output.
    ///
    /// The child is killed if this future is dropped, so a timed-out or
    /// cancelled pass does not leave nmap running.
    async fn run(&self, target: &str, flags: &[&str]) -> Result<NmapRun> {
        let start = Instant::now();
        tracing::debug!(target = %target, flags = ?flags, "Spawning nmap");

        let output = Command::new(&self.nmap_path)
            .args(flags)
            .arg("-oX")
            .arg("-")
            .arg("--noninteractive")
            .arg(target)
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| DiscoverError::NmapNotFound {
                path: format!("{}: {e}", self.nmap_path),
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).to_string();
            return Err(DiscoverError::NmapFailed {
                code: output.status.code().unwrap_or(-1),
                stderr,
            });
        }

        let run = nmap_xml::parse_nmap_xml(&output.stdout)?;
        tracing::debug!(
            target = %target,
            hosts = run.hosts.len(),
            duration_ms = start.elapsed().as_millis() as u64,
            "Nmap finished"
        );
        Ok(run)
    }
}

#[async_trait]
impl Prober for NmapScanner {
    async fn ping_sweep(&self, target: &str) -> Result<Vec<Observation>> {
        let run = self.run(target, PING_SWEEP_FLAGS).await?;
        Ok(sweep_responders(&run))
    }

    async fn port_scan(&self, target: &str, profile: &ScanProfile) -> Result<PortScanReport> {
        let run = self.run(target, &profile.nmap_flags()).await?;
        Ok(port_scan_report(&run))
    }

    fn local_interface(&self) -> Option<(Ipv4Addr, Ipv4Net)> {
        let ip = outbound_ipv4()?;
        let net = Ipv4Net::new(ip, self.local_prefix_len).ok()?.trunc();
        Some((ip, net))
    }
}

/// Responding hosts of a finished sweep.
///
/// Observations are stamped when the results are read. Nmap's own `start`
/// attribute has one-second resolution and would date a hit before a miss
/// recorded earlier in the same pass.
pub fn sweep_responders(run: &NmapRun) -> Vec<Observation> {
    run.observations(ScanType::PingSweep, Utc::now())
        .into_iter()
        .filter(|o| o.responded)
        .collect()
}

/// Hosts and open ports of a finished port scan, stamped like
/// [`sweep_responders`].
pub fn port_scan_report(run: &NmapRun) -> PortScanReport {
    PortScanReport {
        observations: run.observations(ScanType::PortScan, Utc::now()),
        open_ports: run.open_ports(),
    }
}

/// Address the OS would use for outbound traffic. Connecting a UDP socket
/// sends nothing; it only selects a route.
fn outbound_ipv4() -> Option<Ipv4Addr> {
    let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).ok()?;
    socket.connect((Ipv4Addr::new(192, 0, 2, 1), 9)).ok()?;
    match socket.local_addr().ok()?.ip() {
        IpAddr::V4(ip) if !ip.is_unspecified() && !ip.is_loopback() => Some(ip),
        _ => None,
    }
}
