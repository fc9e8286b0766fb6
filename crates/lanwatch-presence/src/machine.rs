//! Presence state machine.
//!
//! Consumes observations, applies the idle/offline hysteresis thresholds and
//! emits one event per state change:
//!
//! ```text
//! Unknown ──hit──▶ Online ──miss×idle──▶ Idle ──miss×offline──▶ Offline
//!                    ▲                    │                        │
//!                    └────────hit─────────┴──────────hit───────────┘
//! ```
//!
//! Classification runs under the device's registry lock and publishes to the
//! sink before the lock is released, so a device's events reach the sink in
//! the order of the observations that caused them.

use std::collections::BTreeMap;
use std::sync::Arc;

use lanwatch_core::{
    DeviceId, DeviceRecord, DeviceState, Event, EventKind, LanwatchError, Observation,
    PresenceConfig, Result,
};

use crate::registry::DeviceRegistry;
use crate::sink::EventSink;

/// Result of classifying one observation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// Older than (or a duplicate of) what the record already reflects.
    Stale,
    /// Applied; bookkeeping only.
    Unchanged,
    /// Applied and caused a state change.
    Transitioned(Event),
}

/// Summary of one ingested batch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchReport {
    pub applied: usize,
    pub stale: usize,
    pub rejected: usize,
    /// Transition events, in the order they were published.
    pub events: Vec<Event>,
}

impl BatchReport {
    pub fn kinds(&self) -> Vec<EventKind> {
        self.events.iter().map(Event::kind).collect()
    }

    pub fn merge(&mut self, other: BatchReport) {
        self.applied += other.applied;
        self.stale += other.stale;
        self.rejected += other.rejected;
        self.events.extend(other.events);
    }
}

pub struct PresenceMachine {
    config: PresenceConfig,
    registry: Arc<DeviceRegistry>,
    sink: Arc<EventSink>,
}

impl PresenceMachine {
    pub fn new(config: PresenceConfig, registry: Arc<DeviceRegistry>, sink: Arc<EventSink>) -> Self {
        Self {
            config,
            registry,
            sink,
        }
    }

    pub fn config(&self) -> &PresenceConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<DeviceRegistry> {
        &self.registry
    }

    pub fn sink(&self) -> &Arc<EventSink> {
        &self.sink
    }

    /// Classify a single observation and publish the resulting event, if any.
    pub fn observe(&self, obs: &Observation) -> Result<Outcome> {
        if obs.device_id.is_empty() {
            return Err(LanwatchError::InvalidObservation(format!(
                "empty device id in {} observation at {}",
                obs.scan_type, obs.seen_at
            )));
        }

        let (_, outcome) = self.registry.update(obs, |record| {
            let outcome = classify(&self.config, record, obs);
            if let Outcome::Transitioned(event) = &outcome {
                tracing::info!(
                    device_id = %record.id,
                    state = %record.state,
                    misses = record.consecutive_misses,
                    "Device state changed"
                );
                self.sink.publish(event.clone());
            }
            outcome
        });
        Ok(outcome)
    }

    /// Classify a batch. Each device is evaluated once, using its winning
    /// observation (latest `seen_at`, responses first on ties). A rejected
    /// observation becomes a `Warning` and does not affect other devices.
    pub fn ingest(&self, batch: Vec<Observation>) -> BatchReport {
        let mut report = BatchReport::default();
        let mut winners: BTreeMap<DeviceId, Observation> = BTreeMap::new();

        for obs in batch {
            match winners.get(&obs.device_id) {
                Some(current) if !obs.supersedes(current) => {}
                _ => {
                    winners.insert(obs.device_id.clone(), obs);
                }
            }
        }

        for obs in winners.into_values() {
            match self.observe(&obs) {
                Ok(Outcome::Stale) => report.stale += 1,
                Ok(Outcome::Unchanged) => report.applied += 1,
                Ok(Outcome::Transitioned(event)) => {
                    report.applied += 1;
                    report.events.push(event);
                }
                Err(e) => {
                    tracing::warn!(error = %e, scan_type = %obs.scan_type, "Observation rejected");
                    report.rejected += 1;
                    self.sink.publish(
                        Event::new(EventKind::Warning)
                            .at(obs.seen_at)
                            .with_detail("reason", e)
                            .with_detail("scan_type", obs.scan_type),
                    );
                }
            }
        }

        report
    }
}

/// Apply `obs` to `record` and decide the transition, if any.
fn classify(config: &PresenceConfig, record: &mut DeviceRecord, obs: &Observation) -> Outcome {
    if record.is_stale(obs) {
        tracing::debug!(
            device_id = %record.id,
            seen_at = %obs.seen_at,
            "Ignoring stale observation"
        );
        return Outcome::Stale;
    }

    let previous = record.state;
    record.record_observation(obs);

    let next = if obs.responded {
        (previous != DeviceState::Online).then_some(DeviceState::Online)
    } else {
        match previous {
            DeviceState::Online if record.consecutive_misses >= config.idle_threshold => {
                Some(DeviceState::Idle)
            }
            DeviceState::Idle if record.consecutive_misses >= config.offline_threshold => {
                Some(DeviceState::Offline)
            }
            _ => None,
        }
    };

    let Some(next) = next else {
        return Outcome::Unchanged;
    };
    debug_assert!(previous.can_transition_to(next));
    record.state = next;

    let kind = match next {
        DeviceState::Online => EventKind::DeviceOnline,
        DeviceState::Idle => EventKind::DeviceIdle,
        DeviceState::Offline => EventKind::DeviceOffline,
        DeviceState::Unknown => return Outcome::Unchanged,
    };

    let mut event = Event::new(kind)
        .for_device(record.id.clone())
        .at(obs.seen_at)
        .with_detail("previous_state", previous)
        .with_detail("state", next)
        .with_detail("scan_type", obs.scan_type);
    if !obs.responded {
        event = event.with_detail("consecutive_misses", record.consecutive_misses);
    }
    if let Some(addr) = record.address {
        event = event.with_detail("address", addr);
    }
    Outcome::Transitioned(event)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, Utc};
    use lanwatch_core::ScanType;

    fn t(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000 + secs, 0).unwrap()
    }

    fn machine(config: PresenceConfig) -> PresenceMachine {
        PresenceMachine::new(
            config,
            Arc::new(DeviceRegistry::new()),
            Arc::new(EventSink::new(1024)),
        )
    }

    fn hit(id: &str, at: i64) -> Observation {
        Observation::responded(DeviceId::new(id), t(at), ScanType::PingSweep)
    }

    fn miss(id: &str, at: i64) -> Observation {
        Observation::missed(DeviceId::new(id), t(at), ScanType::PingSweep)
    }

    fn kind_of(outcome: Outcome) -> Option<EventKind> {
        match outcome {
            Outcome::Transitioned(e) => Some(e.kind()),
            _ => None,
        }
    }

    #[test]
    fn default_thresholds_timeline() {
        let m = machine(PresenceConfig::default());

        assert_eq!(kind_of(m.observe(&hit("d", 0)).unwrap()), Some(EventKind::DeviceOnline));
        assert_eq!(kind_of(m.observe(&miss("d", 1)).unwrap()), Some(EventKind::DeviceIdle));
        assert_eq!(kind_of(m.observe(&miss("d", 2)).unwrap()), None);
        assert_eq!(kind_of(m.observe(&miss("d", 3)).unwrap()), Some(EventKind::DeviceOffline));
        assert_eq!(kind_of(m.observe(&miss("d", 4)).unwrap()), None);
        assert_eq!(kind_of(m.observe(&miss("d", 5)).unwrap()), None);

        let rec = m.registry().get(&DeviceId::new("d")).unwrap();
        assert_eq!(rec.state, DeviceState::Offline);
        assert_eq!(rec.consecutive_misses, 5);
        assert_eq!(rec.last_seen, t(0));
    }

    #[test]
    fn never_seen_device_emits_nothing() {
        let m = machine(PresenceConfig::default());
        for i in 0..5 {
            assert_eq!(m.observe(&miss("ghost", i)).unwrap(), Outcome::Unchanged);
        }
        let rec = m.registry().get(&DeviceId::new("ghost")).unwrap();
        assert_eq!(rec.state, DeviceState::Unknown);
        assert!(m.sink().is_empty());
    }

    #[test]
    fn offline_device_comes_back_once() {
        let m = machine(PresenceConfig::default());
        m.observe(&hit("d", 0)).unwrap();
        for i in 1..=3 {
            m.observe(&miss("d", i)).unwrap();
        }

        assert_eq!(kind_of(m.observe(&hit("d", 10)).unwrap()), Some(EventKind::DeviceOnline));
        assert_eq!(m.observe(&hit("d", 11)).unwrap(), Outcome::Unchanged);
        assert_eq!(m.registry().get(&DeviceId::new("d")).unwrap().consecutive_misses, 0);
    }

    #[test]
    fn idle_device_recovers_before_offline() {
        let m = machine(PresenceConfig::default());
        m.observe(&hit("d", 0)).unwrap();
        m.observe(&miss("d", 1)).unwrap();
        assert_eq!(kind_of(m.observe(&hit("d", 2)).unwrap()), Some(EventKind::DeviceOnline));

        // Miss count restarts: one miss is idle again, not offline.
        assert_eq!(kind_of(m.observe(&miss("d", 3)).unwrap()), Some(EventKind::DeviceIdle));
    }

    #[test]
    fn custom_thresholds() {
        let m = machine(PresenceConfig {
            idle_threshold: 2,
            offline_threshold: 4,
            ..Default::default()
        });
        m.observe(&hit("d", 0)).unwrap();
        assert_eq!(kind_of(m.observe(&miss("d", 1)).unwrap()), None);
        assert_eq!(kind_of(m.observe(&miss("d", 2)).unwrap()), Some(EventKind::DeviceIdle));
        assert_eq!(kind_of(m.observe(&miss("d", 3)).unwrap()), None);
        assert_eq!(kind_of(m.observe(&miss("d", 4)).unwrap()), Some(EventKind::DeviceOffline));
    }

    #[test]
    fn one_transition_per_observation() {
        let m = machine(PresenceConfig {
            idle_threshold: 1,
            offline_threshold: 1,
            ..Default::default()
        });
        m.observe(&hit("d", 0)).unwrap();
        assert_eq!(kind_of(m.observe(&miss("d", 1)).unwrap()), Some(EventKind::DeviceIdle));
        assert_eq!(kind_of(m.observe(&miss("d", 2)).unwrap()), Some(EventKind::DeviceOffline));
    }

    #[test]
    fn out_of_order_observation_is_stale() {
        let m = machine(PresenceConfig::default());
        m.observe(&hit("d", 10)).unwrap();
        assert_eq!(m.observe(&miss("d", 5)).unwrap(), Outcome::Stale);
        assert_eq!(m.observe(&miss("d", 10)).unwrap(), Outcome::Stale);
        assert_eq!(m.registry().get(&DeviceId::new("d")).unwrap().state, DeviceState::Online);
    }

    #[test]
    fn batch_tie_break_prefers_response() {
        let m = machine(PresenceConfig::default());
        m.observe(&hit("d", 0)).unwrap();

        let report = m.ingest(vec![miss("d", 5), hit("d", 5)]);
        assert_eq!(report.applied, 1);
        assert!(report.events.is_empty());
        assert_eq!(m.registry().get(&DeviceId::new("d")).unwrap().state, DeviceState::Online);

        let report = m.ingest(vec![hit("d", 6), miss("d", 7)]);
        assert_eq!(report.kinds(), vec![EventKind::DeviceIdle]);
    }

    #[test]
    fn bad_observation_does_not_abort_batch() {
        let m = machine(PresenceConfig::default());
        let report = m.ingest(vec![hit("a", 0), hit("", 0), hit("b", 0)]);

        assert_eq!(report.rejected, 1);
        assert_eq!(report.applied, 2);
        assert_eq!(report.kinds(), vec![EventKind::DeviceOnline, EventKind::DeviceOnline]);

        let warnings: Vec<Event> = m
            .sink()
            .pending()
            .into_iter()
            .filter(|e| e.kind() == EventKind::Warning)
            .collect();
        assert_eq!(warnings.len(), 1);
        assert!(warnings[0].detail("reason").unwrap().contains("empty device id"));
    }

    #[test]
    fn transition_event_details() {
        let m = machine(PresenceConfig::default());
        let addr = "192.168.1.40".parse().unwrap();
        let Outcome::Transitioned(online) = m.observe(&hit("d", 0).with_address(addr)).unwrap()
        else {
            panic!("expected transition");
        };
        assert_eq!(online.device_id(), Some(&DeviceId::new("d")));
        assert_eq!(online.timestamp(), t(0));
        assert_eq!(online.detail("previous_state"), Some("unknown"));
        assert_eq!(online.detail("address"), Some("192.168.1.40"));

        let Outcome::Transitioned(idle) = m.observe(&miss("d", 1)).unwrap() else {
            panic!("expected transition");
        };
        assert_eq!(idle.detail("consecutive_misses"), Some("1"));
        assert_eq!(idle.detail("state"), Some("idle"));
    }
}
