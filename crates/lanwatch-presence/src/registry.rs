//! Device registry: authoritative in-memory map from identity to record.
//!
//! Records live in a `DashMap` arena, each behind its own mutex, so two
//! observations for the same device serialize while unrelated devices never
//! contend beyond a brief shard lookup.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use dashmap::DashMap;
use lanwatch_core::{DeviceId, DeviceRecord, LanwatchError, Observation, Result};

type Slot = Arc<Mutex<DeviceRecord>>;

#[derive(Default)]
pub struct DeviceRegistry {
    records: DashMap<DeviceId, Slot>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current copy of a device record.
    pub fn get(&self, id: &DeviceId) -> Result<DeviceRecord> {
        let slot = self
            .records
            .get(id)
            .map(|r| Arc::clone(r.value()))
            .ok_or_else(|| LanwatchError::DeviceNotFound(id.clone()))?;
        let record = lock(&slot).clone();
        Ok(record)
    }

    /// Create the record on first sight, otherwise apply observation
    /// bookkeeping in place. Never changes presence state.
    pub fn upsert(&self, obs: &Observation) -> DeviceRecord {
        self.update(obs, |record| record.record_observation(obs)).0
    }

    /// Run `f` with exclusive access to the record for `obs.device_id`,
    /// creating it first if needed. Returns a copy of the record after `f`.
    pub(crate) fn update<R>(
        &self,
        obs: &Observation,
        f: impl FnOnce(&mut DeviceRecord) -> R,
    ) -> (DeviceRecord, R) {
        let slot = self.slot(obs);
        let mut record = lock(&slot);
        let out = f(&mut *record);
        (record.clone(), out)
    }

    /// All records, ascending by identity.
    pub fn snapshot(&self) -> Vec<DeviceRecord> {
        let slots: Vec<Slot> = self.records.iter().map(|r| Arc::clone(r.value())).collect();
        let mut records: Vec<DeviceRecord> = slots.iter().map(|s| lock(s).clone()).collect();
        records.sort_by(|a, b| a.id.cmp(&b.id));
        records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    fn slot(&self, obs: &Observation) -> Slot {
        if let Some(slot) = self.records.get(&obs.device_id) {
            return Arc::clone(slot.value());
        }
        let slot = self
            .records
            .entry(obs.device_id.clone())
            .or_insert_with(|| {
                tracing::debug!(device_id = %obs.device_id, "New device registered");
                Arc::new(Mutex::new(DeviceRecord::new(
                    obs.device_id.clone(),
                    obs.seen_at,
                )))
            });
        Arc::clone(slot.value())
    }
}

/// A panic while a record was locked leaves the record itself consistent
/// (every mutation is a plain field store), so poisoning is ignored.
fn lock(slot: &Mutex<DeviceRecord>) -> MutexGuard<'_, DeviceRecord> {
    slot.lock().unwrap_or_else(PoisonError::into_inner)
}
