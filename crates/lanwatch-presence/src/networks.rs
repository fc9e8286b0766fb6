//! Catalog of monitored networks.
//!
//! Administrative create/update/delete of the networks the scheduler sweeps.
//! Every change is recorded in the event log.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use ipnet::IpNet;
use lanwatch_core::{Event, EventKind, LanwatchError, Result};
use serde::{Deserialize, Serialize};

use crate::sink::EventSink;

/// A monitored network.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Network {
    pub name: String,
    pub cidr: IpNet,
    pub scan_interval_secs: u64,
    pub enabled: bool,
}

impl Network {
    fn changed_fields(&self, other: &Network) -> Vec<&'static str> {
        let mut changed = Vec::new();
        if self.cidr != other.cidr {
            changed.push("cidr");
        }
        if self.scan_interval_secs != other.scan_interval_secs {
            changed.push("scan_interval_secs");
        }
        if self.enabled != other.enabled {
            changed.push("enabled");
        }
        changed
    }
}

pub struct NetworkCatalog {
    networks: Mutex<BTreeMap<String, Network>>,
    sink: Arc<EventSink>,
}

impl NetworkCatalog {
    pub fn new(sink: Arc<EventSink>) -> Self {
        Self {
            networks: Mutex::new(BTreeMap::new()),
            sink,
        }
    }

    pub fn create(&self, network: Network) -> Result<()> {
        let mut networks = self.lock();
        if networks.contains_key(&network.name) {
            return Err(LanwatchError::NetworkExists(network.name));
        }

        tracing::info!(name = %network.name, cidr = %network.cidr, "Network created");
        self.sink.publish(
            Event::new(EventKind::NetworkCreated)
                .with_detail("name", &network.name)
                .with_detail("cidr", network.cidr)
                .with_detail("scan_interval_secs", network.scan_interval_secs)
                .with_detail("enabled", network.enabled),
        );
        networks.insert(network.name.clone(), network);
        Ok(())
    }

    /// Replace the network with the same name. Returns `false` (and emits
    /// nothing) when no field changed.
    pub fn update(&self, network: Network) -> Result<bool> {
        let mut networks = self.lock();
        let current = networks
            .get(&network.name)
            .ok_or_else(|| LanwatchError::NetworkNotFound(network.name.clone()))?;

        let changed = current.changed_fields(&network);
        if changed.is_empty() {
            return Ok(false);
        }

        tracing::info!(name = %network.name, changed = ?changed, "Network updated");
        self.sink.publish(
            Event::new(EventKind::NetworkUpdated)
                .with_detail("name", &network.name)
                .with_detail("changed", changed.join(","))
                .with_detail("cidr", network.cidr),
        );
        networks.insert(network.name.clone(), network);
        Ok(true)
    }

    pub fn delete(&self, name: &str) -> Result<Network> {
        let removed = self
            .lock()
            .remove(name)
            .ok_or_else(|| LanwatchError::NetworkNotFound(name.to_string()))?;

        tracing::info!(name = %name, "Network deleted");
        self.sink.publish(
            Event::new(EventKind::NetworkDeleted)
                .with_detail("name", name)
                .with_detail("cidr", removed.cidr),
        );
        Ok(removed)
    }

    pub fn get(&self, name: &str) -> Option<Network> {
        self.lock().get(name).cloned()
    }

    /// All networks, sorted by name.
    pub fn list(&self) -> Vec<Network> {
        self.lock().values().cloned().collect()
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<String, Network>> {
        self.networks.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
