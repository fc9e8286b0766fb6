//! lanwatch-presence: Device presence tracking for lanwatch.
//!
//! Turns probe observations into an ordered, deduplicated event log:
//! the scan coordinator brackets scan passes with lifecycle events, the
//! presence state machine classifies observations against the device
//! registry, and the event sink buffers everything for persistence and
//! notification.

pub mod coordinator;
pub mod machine;
pub mod networks;
pub mod registry;
pub mod sink;

pub use coordinator::{PortScanReport, ScanCoordinator, ScanTicket};
pub use machine::{BatchReport, Outcome, PresenceMachine};
pub use networks::{Network, NetworkCatalog};
pub use registry::DeviceRegistry;
pub use sink::{EventSink, EventStore, Notifier, PublishOutcome};

use std::sync::Arc;

use lanwatch_core::PresenceConfig;

/// Wire up registry, sink, state machine and coordinator from one config.
pub fn build(config: PresenceConfig) -> Arc<ScanCoordinator> {
    let sink = Arc::new(EventSink::new(config.event_queue_capacity));
    let registry = Arc::new(DeviceRegistry::new());
    let machine = Arc::new(PresenceMachine::new(config, registry, sink));
    Arc::new(ScanCoordinator::new(machine))
}
