//! Scan coordinator.
//!
//! Brackets every scan pass with lifecycle events and forwards the pass's
//! observations to the presence state machine. A pass is represented by a
//! [`ScanTicket`] that is consumed by exactly one `complete_*` or `fail` call,
//! so a failed pass can never leak partial observations.

use std::collections::HashSet;
use std::net::Ipv4Addr;
use std::sync::{Arc, Mutex, PoisonError};

use chrono::{DateTime, Utc};
use ipnet::{IpNet, Ipv4Net};
use lanwatch_core::{
    DeviceId, DeviceRecord, Event, EventKind, LanwatchError, Observation, ScanType,
};
use uuid::Uuid;

use crate::machine::{BatchReport, PresenceMachine};
use crate::sink::EventSink;

/// An in-progress scan pass.
#[derive(Debug)]
#[must_use = "a scan pass must be completed or failed"]
pub struct ScanTicket {
    scan_id: Uuid,
    scan_type: ScanType,
    target: String,
    started_at: DateTime<Utc>,
}

impl ScanTicket {
    pub fn scan_id(&self) -> Uuid {
        self.scan_id
    }

    pub fn scan_type(&self) -> ScanType {
        self.scan_type
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }
}

/// Result of a finished port scan.
#[derive(Debug, Clone, Default)]
pub struct PortScanReport {
    /// One observation per probed device.
    pub observations: Vec<Observation>,
    /// Open ports found across the target.
    pub open_ports: Vec<u16>,
}

pub struct ScanCoordinator {
    machine: Arc<PresenceMachine>,
    sink: Arc<EventSink>,
    local_interface: Mutex<Option<(Ipv4Addr, Ipv4Net)>>,
}

impl ScanCoordinator {
    pub fn new(machine: Arc<PresenceMachine>) -> Self {
        let sink = Arc::clone(machine.sink());
        Self {
            machine,
            sink,
            local_interface: Mutex::new(None),
        }
    }

    pub fn machine(&self) -> &Arc<PresenceMachine> {
        &self.machine
    }

    /// Start a ping sweep: emits `ScanStarted` then `PingSweep`.
    pub fn begin_sweep(&self, target: &str) -> ScanTicket {
        let ticket = self.ticket(ScanType::PingSweep, target);
        tracing::info!(scan_id = %ticket.scan_id, target = %target, "Ping sweep started");

        self.emit(&ticket, EventKind::ScanStarted);
        self.emit(&ticket, EventKind::PingSweep);
        ticket
    }

    /// Finish a ping sweep. Every registered device in scope of the target
    /// that is not among `responders` gets a miss stamped with the sweep's
    /// start time, so a response seen elsewhere during the sweep wins.
    pub fn complete_sweep(&self, ticket: ScanTicket, responders: Vec<Observation>) -> BatchReport {
        let answered: HashSet<DeviceId> = responders
            .iter()
            .filter(|o| o.responded)
            .map(|o| o.device_id.clone())
            .collect();
        let scope: Option<IpNet> = ticket.target.parse().ok();

        let misses: Vec<Observation> = self
            .machine
            .registry()
            .snapshot()
            .into_iter()
            .filter(|r| !answered.contains(&r.id) && in_scope(r, scope.as_ref()))
            .map(|r| Observation::missed(r.id, ticket.started_at, ScanType::PingSweep))
            .collect();

        let responded = answered.len();
        let missed = misses.len();
        let mut observations = responders;
        observations.extend(misses);
        let report = self.machine.ingest(observations);

        tracing::info!(
            scan_id = %ticket.scan_id,
            target = %ticket.target,
            responded,
            missed,
            transitions = report.events.len(),
            "Ping sweep complete"
        );
        report
    }

    /// Start a port scan: emits `PortScanStarted`.
    pub fn begin_port_scan(&self, target: &str) -> ScanTicket {
        let ticket = self.ticket(ScanType::PortScan, target);
        tracing::info!(scan_id = %ticket.scan_id, target = %target, "Port scan started");

        self.emit(&ticket, EventKind::PortScanStarted);
        ticket
    }

    /// Finish a port scan: emits `PortScanCompleted`, then forwards the
    /// per-device observations.
    pub fn complete_port_scan(&self, ticket: ScanTicket, result: PortScanReport) -> BatchReport {
        let duration_ms = (Utc::now() - ticket.started_at).num_milliseconds().max(0);
        let ports = result
            .open_ports
            .iter()
            .map(u16::to_string)
            .collect::<Vec<_>>()
            .join(",");

        self.sink.publish(
            Event::new(EventKind::PortScanCompleted)
                .with_detail("scan_id", ticket.scan_id)
                .with_detail("target", &ticket.target)
                .with_detail("open_ports", ports)
                .with_detail("hosts", result.observations.len())
                .with_detail("duration_ms", duration_ms),
        );

        let report = self.machine.ingest(result.observations);
        tracing::info!(
            scan_id = %ticket.scan_id,
            target = %ticket.target,
            open_ports = result.open_ports.len(),
            duration_ms,
            "Port scan complete"
        );
        report
    }

    /// Abandon a pass: emits a `Warning` with the failure reason. Nothing
    /// from the pass reaches the state machine.
    pub fn fail(&self, ticket: ScanTicket, reason: &str) {
        let failure = LanwatchError::ScanFailure {
            target: ticket.target.clone(),
            reason: reason.to_string(),
        };
        tracing::warn!(
            scan_id = %ticket.scan_id,
            scan_type = %ticket.scan_type,
            error = %failure,
            "Scan pass failed"
        );

        self.sink.publish(
            Event::new(EventKind::Warning)
                .with_detail("reason", failure)
                .with_detail("scan_id", ticket.scan_id)
                .with_detail("scan_type", ticket.scan_type)
                .with_detail("target", &ticket.target),
        );
    }

    /// Record the host's own address and network. Emits `LocalIpFound` and
    /// `LocalNetworkFound` only when the respective value changed.
    pub fn report_local_interface(&self, ip: Ipv4Addr, network: Ipv4Net) -> Vec<Event> {
        let previous = {
            let mut local = self
                .local_interface
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            local.replace((ip, network))
        };

        let mut emitted = Vec::new();
        if previous.map(|(p, _)| p) != Some(ip) {
            emitted.push(Event::new(EventKind::LocalIpFound).with_detail("address", ip));
        }
        if previous.map(|(_, n)| n) != Some(network) {
            emitted.push(Event::new(EventKind::LocalNetworkFound).with_detail("network", network));
        }

        for event in &emitted {
            tracing::info!(kind = %event.kind(), address = %ip, network = %network, "Local interface");
            self.sink.publish(event.clone());
        }
        emitted
    }

    fn ticket(&self, scan_type: ScanType, target: &str) -> ScanTicket {
        ScanTicket {
            scan_id: Uuid::new_v4(),
            scan_type,
            target: target.to_string(),
            started_at: Utc::now(),
        }
    }

    fn emit(&self, ticket: &ScanTicket, kind: EventKind) {
        self.sink.publish(
            Event::new(kind)
                .at(ticket.started_at)
                .with_detail("scan_id", ticket.scan_id)
                .with_detail("scan_type", ticket.scan_type)
                .with_detail("target", &ticket.target),
        );
    }
}

/// Devices with a known address are in scope when the target network
/// contains it. Without a parseable target network every device is in scope;
/// with one, devices of unknown address are not.
fn in_scope(record: &DeviceRecord, scope: Option<&IpNet>) -> bool {
    match (scope, record.address) {
        (None, _) => true,
        (Some(net), Some(addr)) => net.contains(&addr),
        (Some(_), None) => false,
    }
}
