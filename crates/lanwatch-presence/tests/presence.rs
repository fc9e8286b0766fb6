//! End-to-end presence scenarios: observations in, ordered events out.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use lanwatch_core::{DeviceId, Event, EventKind, Observation, PresenceConfig, ScanType};
use lanwatch_presence::{DeviceRegistry, EventSink, PresenceMachine, PublishOutcome};

fn t(secs: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(1_700_000_000 + secs, 0).unwrap()
}

fn machine_with_capacity(capacity: usize) -> Arc<PresenceMachine> {
    let config = PresenceConfig {
        event_queue_capacity: capacity,
        ..Default::default()
    };
    Arc::new(PresenceMachine::new(
        config,
        Arc::new(DeviceRegistry::new()),
        Arc::new(EventSink::new(capacity)),
    ))
}

fn obs(id: &str, at: i64, responded: bool) -> Observation {
    Observation {
        device_id: DeviceId::new(id),
        seen_at: t(at),
        responded,
        scan_type: ScanType::PingSweep,
        address: None,
    }
}

fn device_events(sink: &EventSink, id: &str) -> Vec<EventKind> {
    let id = DeviceId::new(id);
    sink.pending()
        .iter()
        .filter(|e| e.device_id() == Some(&id))
        .map(Event::kind)
        .collect()
}

#[test]
fn online_idle_offline_scenario() {
    let m = machine_with_capacity(64);
    for o in [obs("d", 0, true), obs("d", 1, false), obs("d", 2, false), obs("d", 3, false)] {
        m.ingest(vec![o]);
    }

    assert_eq!(
        device_events(m.sink(), "d"),
        vec![EventKind::DeviceOnline, EventKind::DeviceIdle, EventKind::DeviceOffline]
    );
}

#[test]
fn misses_reset_exactly_on_return_to_online() {
    let m = machine_with_capacity(64);
    let id = DeviceId::new("d");
    m.ingest(vec![obs("d", 0, true)]);
    for i in 1..=4 {
        m.ingest(vec![obs("d", i, false)]);
    }
    assert_eq!(m.registry().get(&id).unwrap().consecutive_misses, 4);

    let report = m.ingest(vec![obs("d", 5, true)]);
    assert_eq!(report.kinds(), vec![EventKind::DeviceOnline]);
    assert_eq!(m.registry().get(&id).unwrap().consecutive_misses, 0);
}

#[test]
fn no_consecutive_duplicate_transitions() {
    let m = machine_with_capacity(4096);
    // Irregular on/off pattern over many sweeps.
    let pattern = [true, false, false, true, false, false, false, false, true, true, false];
    for round in 0..20 {
        for (i, responded) in pattern.iter().enumerate() {
            let at = (round * pattern.len() + i) as i64;
            m.ingest(vec![obs("d", at, *responded)]);
        }
    }

    let events = device_events(m.sink(), "d");
    assert!(!events.is_empty());
    for pair in events.windows(2) {
        assert_ne!(pair[0], pair[1], "duplicate transition in {events:?}");
    }
}

#[test]
fn overflow_scenario_capacity_two() {
    let sink = EventSink::new(2);
    sink.publish(Event::new(EventKind::ScanStarted));
    sink.publish(Event::new(EventKind::PingSweep));
    let third = sink.publish(Event::new(EventKind::DeviceOnline));

    assert!(matches!(
        third,
        PublishOutcome::Overflowed {
            alert_raised: true,
            ..
        }
    ));
    let kinds: Vec<EventKind> = sink.pending().iter().map(Event::kind).collect();
    assert_eq!(
        kinds,
        vec![EventKind::PingSweep, EventKind::Alert, EventKind::DeviceOnline]
    );
}

#[test]
fn concurrent_ingestion_keeps_per_device_order() {
    let m = machine_with_capacity(100_000);
    let devices: Vec<String> = (0..16).map(|i| format!("dev-{i:02}")).collect();

    let handles: Vec<_> = devices
        .iter()
        .cloned()
        .map(|id| {
            let m = Arc::clone(&m);
            std::thread::spawn(move || {
                for round in 0..50i64 {
                    let base = round * 4;
                    m.ingest(vec![obs(&id, base, true)]);
                    for k in 1..=3 {
                        m.ingest(vec![obs(&id, base + k, false)]);
                    }
                }
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }

    let expected: Vec<EventKind> = (0..50)
        .flat_map(|_| {
            [
                EventKind::DeviceOnline,
                EventKind::DeviceIdle,
                EventKind::DeviceOffline,
            ]
        })
        .collect();

    for id in &devices {
        let events: Vec<Event> = m
            .sink()
            .pending()
            .into_iter()
            .filter(|e| e.device_id() == Some(&DeviceId::new(id.as_str())))
            .collect();
        assert_eq!(events.iter().map(Event::kind).collect::<Vec<_>>(), expected);
        assert!(events.windows(2).all(|w| w[0].timestamp() < w[1].timestamp()));
    }
}

#[test]
fn overlapping_batches_for_one_device_converge() {
    let m = machine_with_capacity(4096);
    m.ingest(vec![obs("d", 0, true)]);

    // Two passes race: one saw a miss, one saw a response at the same instant.
    let a = {
        let m = Arc::clone(&m);
        std::thread::spawn(move || m.ingest(vec![obs("d", 10, false)]))
    };
    let b = {
        let m = Arc::clone(&m);
        std::thread::spawn(move || m.ingest(vec![obs("d", 10, true)]))
    };
    a.join().unwrap();
    b.join().unwrap();

    // Whatever the interleaving, the response wins and the device is online.
    let rec = m.registry().get(&DeviceId::new("d")).unwrap();
    assert_eq!(rec.state, lanwatch_core::DeviceState::Online);
    assert_eq!(rec.consecutive_misses, 0);
}
