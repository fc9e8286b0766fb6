//! Event log sink.
//!
//! Events from the state machine and scan coordinator land in a bounded FIFO.
//! A dispatcher task drains it in order into the persistence collaborator and
//! forwards `Warning`/`Alert` events to the notification collaborator.
//!
//! `publish` never waits on downstream. When the queue holds `capacity`
//! non-alert events, the oldest event that is neither an `Alert` nor a
//! `Warning` is dropped. An incoming `Warning` may displace the oldest queued
//! `Warning`; any other incoming event is dropped itself when nothing of lower
//! priority is queued. The first drop of an overflow episode inserts one
//! `Alert` ahead of the incoming event, and that alert's drop count is kept
//! current while it is still queued. Alerts do not count against capacity.
//! An episode ends once every non-alert event has been drained, which queues a
//! `Warning` carrying the episode's final drop count.
//!
//! The event handed to the dispatcher is in flight: it is never evicted and no
//! longer counts against capacity, so whatever the dispatcher persists was
//! never reported as dropped.

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use lanwatch_core::{Event, EventId, EventKind, LanwatchError, Result};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

/// Persistence collaborator.
#[async_trait]
pub trait EventStore: Send + Sync {
    /// Durably append one event. Called in queue order.
    async fn append(&self, event: &Event) -> Result<()>;
}

/// Notification collaborator. Receives `Warning` and `Alert` events only,
/// at least once; implementations dedupe on [`Event::id`] if they need to.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, event: &Event) -> Result<()>;
}

/// What happened to a published event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PublishOutcome {
    Queued,
    /// An event was dropped to make room: an older queued one, or the
    /// published event itself.
    Overflowed {
        dropped: EventId,
        alert_raised: bool,
    },
}

struct Episode {
    alert_id: EventId,
    dropped: u64,
}

#[derive(Default)]
struct SinkState {
    queue: VecDeque<Event>,
    /// Queued non-alert events, not counting the one in flight.
    regular: usize,
    in_flight: Option<EventId>,
    episode: Option<Episode>,
    dropped_total: u64,
}

fn counts_against_capacity(event: &Event) -> bool {
    event.kind() != EventKind::Alert
}

impl SinkState {
    fn position(&self, id: EventId) -> Option<usize> {
        self.queue.iter().position(|e| e.id() == id)
    }

    /// Pick a queued event to make room for `incoming`, lowest priority
    /// first. `None` means `incoming` itself has to go.
    fn eviction_candidate(&self, incoming: EventKind) -> Option<usize> {
        let evictable = |e: &Event, kind: Option<EventKind>| {
            Some(e.id()) != self.in_flight
                && match kind {
                    Some(kind) => e.kind() == kind,
                    None => !matches!(e.kind(), EventKind::Alert | EventKind::Warning),
                }
        };

        self.queue
            .iter()
            .position(|e| evictable(e, None))
            .or_else(|| {
                (incoming == EventKind::Warning)
                    .then(|| self.queue.iter().position(|e| evictable(e, Some(EventKind::Warning))))
                    .flatten()
            })
    }

    /// Mark the event with `id` as handed to the dispatcher. Returns `None` if
    /// it is no longer queued.
    fn claim(&mut self, id: EventId) -> Option<Event> {
        if self.in_flight == Some(id) {
            return self.position(id).map(|pos| self.queue[pos].clone());
        }
        self.release();

        let event = self.queue[self.position(id)?].clone();
        if counts_against_capacity(&event) {
            self.regular -= 1;
        }
        self.in_flight = Some(id);
        Some(event)
    }

    /// Return the in-flight event, if any, to the ordinary queue.
    fn release(&mut self) {
        let Some(id) = self.in_flight.take() else {
            return;
        };
        if let Some(pos) = self.position(id) {
            if counts_against_capacity(&self.queue[pos]) {
                self.regular += 1;
            }
        }
    }
}

pub struct EventSink {
    capacity: usize,
    state: Mutex<SinkState>,
    ready: Notify,
}

impl EventSink {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            state: Mutex::new(SinkState::default()),
            ready: Notify::new(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Enqueue an event for delivery.
    pub fn publish(&self, event: Event) -> PublishOutcome {
        tracing::debug!(
            event_id = %event.id(),
            kind = %event.kind(),
            device_id = ?event.device_id(),
            "Event published"
        );

        let outcome = {
            let mut state = self.lock();
            if counts_against_capacity(&event) && state.regular >= self.capacity {
                self.overflow(&mut state, event)
            } else {
                if counts_against_capacity(&event) {
                    state.regular += 1;
                }
                state.queue.push_back(event);
                PublishOutcome::Queued
            }
        };

        self.ready.notify_one();
        outcome
    }

    fn overflow(&self, state: &mut SinkState, incoming: Event) -> PublishOutcome {
        let evicted = match state.eviction_candidate(incoming.kind()) {
            Some(pos) => state.queue.remove(pos),
            None => None,
        };
        let (dropped, keep_incoming) = match evicted {
            Some(evicted) => (evicted, true),
            None => (incoming.clone(), false),
        };

        state.dropped_total += 1;
        tracing::warn!(
            dropped_id = %dropped.id(),
            dropped_kind = %dropped.kind(),
            "Dropped event"
        );

        let alert_raised = match state.episode.as_mut() {
            Some(episode) => {
                episode.dropped += 1;
                let (alert_id, count) = (episode.alert_id, episode.dropped);
                if let Some(pos) = state.position(alert_id) {
                    let refreshed = self.summarize_drops(state.queue[pos].clone(), count);
                    state.queue[pos] = refreshed;
                }
                false
            }
            None => {
                let alert = self.summarize_drops(
                    Event::new(EventKind::Alert)
                        .with_detail("capacity", self.capacity)
                        .with_detail("first_dropped_kind", dropped.kind())
                        .with_detail("first_dropped_id", dropped.id()),
                    1,
                );
                tracing::error!(
                    capacity = self.capacity,
                    event_id = %alert.id(),
                    "Event queue overflow, dropping oldest events"
                );
                state.episode = Some(Episode {
                    alert_id: alert.id(),
                    dropped: 1,
                });
                state.queue.push_back(alert);
                true
            }
        };

        // The evicted event freed a slot for the incoming one.
        if keep_incoming {
            state.queue.push_back(incoming);
        }

        PublishOutcome::Overflowed {
            dropped: dropped.id(),
            alert_raised,
        }
    }

    /// Copy of everything currently queued, oldest first.
    pub fn pending(&self) -> Vec<Event> {
        self.lock().queue.iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().queue.is_empty()
    }

    /// Events dropped by the overflow policy since creation.
    pub fn dropped_total(&self) -> u64 {
        self.lock().dropped_total
    }

    /// Wait for the head of the queue and mark it in flight. The event stays
    /// queued until [`acknowledge`](Self::acknowledge)d.
    pub async fn next_ready(&self) -> Event {
        loop {
            let notified = self.ready.notified();
            let head = {
                let mut state = self.lock();
                let id = state.in_flight.or_else(|| state.queue.front().map(Event::id));
                id.and_then(|id| state.claim(id))
            };
            if let Some(event) = head {
                return event;
            }
            notified.await;
        }
    }

    /// Remove a delivered event. A no-op if it is no longer queued.
    pub fn acknowledge(&self, id: EventId) {
        let recovered = {
            let mut state = self.lock();
            let Some(pos) = state.position(id) else {
                return;
            };
            let Some(event) = state.queue.remove(pos) else {
                return;
            };
            if state.in_flight == Some(id) {
                state.in_flight = None;
            } else if counts_against_capacity(&event) {
                state.regular -= 1;
            }

            let drained = state.regular == 0 && state.in_flight.is_none();
            let finished = if drained { state.episode.take() } else { None };
            match finished {
                Some(episode) => {
                    tracing::info!(dropped = episode.dropped, "Event queue recovered from overflow");
                    let recovery =
                        self.summarize_drops(Event::new(EventKind::Warning), episode.dropped);
                    state.regular += 1;
                    state.queue.push_back(recovery);
                    true
                }
                None => false,
            }
        };

        if recovered {
            self.ready.notify_one();
        }
    }

    /// Deliver queued events until `cancel` fires, then make one final
    /// delivery attempt for whatever is still queued.
    pub async fn dispatch(
        &self,
        store: &dyn EventStore,
        notifier: &dyn Notifier,
        retry_delay: Duration,
        cancel: CancellationToken,
    ) {
        tracing::info!(capacity = self.capacity, "Event dispatcher started");

        loop {
            let event = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                event = self.next_ready() => event,
            };

            let mut persisted = false;
            loop {
                match self.deliver(&event, store, notifier, &mut persisted).await {
                    Ok(()) => {
                        self.acknowledge(event.id());
                        break;
                    }
                    Err(e) => {
                        tracing::warn!(
                            event_id = %event.id(),
                            error = %e,
                            retry_ms = retry_delay.as_millis() as u64,
                            "Event delivery failed, will retry"
                        );
                        tokio::select! {
                            _ = cancel.cancelled() => break,
                            _ = tokio::time::sleep(retry_delay) => {}
                        }
                    }
                }
            }
        }

        self.flush(store, notifier).await;
        tracing::info!(remaining = self.len(), "Event dispatcher stopped");
    }

    /// One delivery attempt per queued event, oldest first. Events that fail
    /// stay queued.
    pub async fn flush(&self, store: &dyn EventStore, notifier: &dyn Notifier) {
        for queued in self.pending() {
            let Some(event) = self.lock().claim(queued.id()) else {
                continue;
            };
            let mut persisted = false;
            match self.deliver(&event, store, notifier, &mut persisted).await {
                Ok(()) => self.acknowledge(event.id()),
                Err(e) => {
                    self.lock().release();
                    tracing::warn!(event_id = %event.id(), error = %e, "Event left undelivered");
                }
            }
        }
    }

    async fn deliver(
        &self,
        event: &Event,
        store: &dyn EventStore,
        notifier: &dyn Notifier,
        persisted: &mut bool,
    ) -> Result<()> {
        if !*persisted {
            store.append(event).await?;
            *persisted = true;
        }
        if event.kind().is_notifiable() {
            notifier.notify(event).await?;
        }
        Ok(())
    }

    fn summarize_drops(&self, event: Event, dropped: u64) -> Event {
        let reason = LanwatchError::BackpressureOverflow {
            capacity: self.capacity,
            dropped,
        };
        event
            .with_detail("reason", reason)
            .with_detail("dropped", dropped)
    }

    fn lock(&self) -> MutexGuard<'_, SinkState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Arc;

    #[derive(Default)]
    struct MemoryStore {
        events: Mutex<Vec<Event>>,
        fail: AtomicBool,
    }

    #[async_trait]
    impl EventStore for MemoryStore {
        async fn append(&self, event: &Event) -> Result<()> {
            if self.fail.load(Ordering::SeqCst) {
                return Err(LanwatchError::Io(std::io::Error::other("store offline")));
            }
            self.events.lock().unwrap().push(event.clone());
            Ok(())
        }
    }

    #[derive(Default)]
    struct CountingNotifier {
        seen: AtomicUsize,
    }

    #[async_trait]
    impl Notifier for CountingNotifier {
        async fn notify(&self, _event: &Event) -> Result<()> {
            self.seen.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn kinds(events: &[Event]) -> Vec<EventKind> {
        events.iter().map(Event::kind).collect()
    }

    #[test]
    fn overflow_raises_single_alert_and_drops_oldest() {
        let sink = EventSink::new(2);
        let first = Event::new(EventKind::DeviceOnline);
        let first_id = first.id();

        assert_eq!(sink.publish(first), PublishOutcome::Queued);
        assert_eq!(sink.publish(Event::new(EventKind::DeviceIdle)), PublishOutcome::Queued);
        let outcome = sink.publish(Event::new(EventKind::DeviceOffline));

        assert_eq!(
            outcome,
            PublishOutcome::Overflowed {
                dropped: first_id,
                alert_raised: true
            }
        );
        assert_eq!(
            kinds(&sink.pending()),
            vec![EventKind::DeviceIdle, EventKind::Alert, EventKind::DeviceOffline]
        );
        assert_eq!(sink.dropped_total(), 1);

        // Still overflowing: more drops, no second alert.
        let outcome = sink.publish(Event::new(EventKind::PingSweep));
        assert!(matches!(
            outcome,
            PublishOutcome::Overflowed {
                alert_raised: false,
                ..
            }
        ));
        let alerts = sink
            .pending()
            .iter()
            .filter(|e| e.kind() == EventKind::Alert)
            .count();
        assert_eq!(alerts, 1);
    }

    #[test]
    fn warnings_survive_overflow_before_regular_events() {
        let sink = EventSink::new(2);
        sink.publish(Event::new(EventKind::Warning));
        sink.publish(Event::new(EventKind::ScanStarted));
        sink.publish(Event::new(EventKind::PingSweep));

        assert_eq!(
            kinds(&sink.pending()),
            vec![EventKind::Warning, EventKind::Alert, EventKind::PingSweep]
        );
    }

    #[test]
    fn alert_reason_names_backpressure() {
        let sink = EventSink::new(1);
        sink.publish(Event::new(EventKind::DeviceOnline));
        sink.publish(Event::new(EventKind::DeviceIdle));

        let alert = sink
            .pending()
            .into_iter()
            .find(|e| e.kind() == EventKind::Alert)
            .unwrap();
        assert!(alert.detail("reason").unwrap().contains("capacity 1"));
        assert_eq!(alert.detail("first_dropped_kind"), Some("Device online"));
    }

    #[test]
    fn draining_ends_overflow_episode() {
        let sink = EventSink::new(1);
        sink.publish(Event::new(EventKind::DeviceOnline));
        sink.publish(Event::new(EventKind::DeviceIdle));

        for event in sink.pending() {
            sink.acknowledge(event.id());
        }
        let recovery = sink.pending();
        assert_eq!(kinds(&recovery), vec![EventKind::Warning]);
        assert_eq!(recovery[0].detail("dropped"), Some("1"));
        sink.acknowledge(recovery[0].id());
        assert!(sink.is_empty());

        sink.publish(Event::new(EventKind::DeviceOffline));
        let outcome = sink.publish(Event::new(EventKind::DeviceOnline));
        assert!(matches!(
            outcome,
            PublishOutcome::Overflowed {
                alert_raised: true,
                ..
            }
        ));
    }

    #[test]
    fn sustained_overflow_raises_one_alert() {
        let sink = EventSink::new(2);
        let mut alerts_raised = 0;
        let mut tally = |outcome: PublishOutcome| {
            if let PublishOutcome::Overflowed {
                alert_raised: true, ..
            } = outcome
            {
                alerts_raised += 1;
            }
        };

        tally(sink.publish(Event::new(EventKind::ScanStarted)));
        tally(sink.publish(Event::new(EventKind::PingSweep)));
        tally(sink.publish(Event::new(EventKind::DeviceOnline)));

        // The consumer keeps up with half the load: one delivery per two publishes.
        for _ in 0..10 {
            let pending = sink.pending();
            for alert in pending.iter().filter(|e| e.kind() == EventKind::Alert) {
                sink.acknowledge(alert.id());
            }
            if let Some(oldest) = pending.iter().find(|e| e.kind() != EventKind::Alert) {
                sink.acknowledge(oldest.id());
            }
            tally(sink.publish(Event::new(EventKind::DeviceIdle)));
            tally(sink.publish(Event::new(EventKind::DeviceOffline)));
        }

        assert_eq!(alerts_raised, 1);
        assert_eq!(sink.dropped_total(), 11);
        assert!(sink.pending().iter().all(|e| e.kind() != EventKind::Warning));
    }

    #[test]
    fn alert_tracks_episode_drop_count() {
        let sink = EventSink::new(1);
        sink.publish(Event::new(EventKind::DeviceOnline));
        sink.publish(Event::new(EventKind::DeviceIdle));
        sink.publish(Event::new(EventKind::DeviceOffline));
        sink.publish(Event::new(EventKind::PingSweep));

        let pending = sink.pending();
        assert_eq!(kinds(&pending), vec![EventKind::Alert, EventKind::PingSweep]);
        let alert = &pending[0];
        assert_eq!(alert.detail("dropped"), Some("3"));
        assert!(alert.detail("reason").unwrap().contains("3 event(s) dropped"));
        assert_eq!(alert.detail("first_dropped_kind"), Some("Device online"));

        for event in pending {
            sink.acknowledge(event.id());
        }
        let recovery = sink.pending();
        assert_eq!(kinds(&recovery), vec![EventKind::Warning]);
        assert_eq!(recovery[0].detail("dropped"), Some("3"));
        assert_eq!(sink.dropped_total(), 3);
    }

    #[test]
    fn full_queue_of_warnings_drops_incoming_routine_event() {
        let sink = EventSink::new(2);
        let first = Event::new(EventKind::Warning).with_detail("reason", "first");
        let first_id = first.id();
        sink.publish(first);
        sink.publish(Event::new(EventKind::Warning).with_detail("reason", "second"));

        let sweep = Event::new(EventKind::PingSweep);
        let sweep_id = sweep.id();
        assert_eq!(
            sink.publish(sweep),
            PublishOutcome::Overflowed {
                dropped: sweep_id,
                alert_raised: true
            }
        );
        assert_eq!(
            kinds(&sink.pending()),
            vec![EventKind::Warning, EventKind::Warning, EventKind::Alert]
        );

        // A newer warning displaces the oldest one.
        let outcome = sink.publish(Event::new(EventKind::Warning).with_detail("reason", "third"));
        assert_eq!(
            outcome,
            PublishOutcome::Overflowed {
                dropped: first_id,
                alert_raised: false
            }
        );
        let reasons: Vec<String> = sink
            .pending()
            .iter()
            .filter(|e| e.kind() == EventKind::Warning)
            .filter_map(|e| e.detail("reason").map(str::to_string))
            .collect();
        assert_eq!(reasons, vec!["second", "third"]);
    }

    #[tokio::test]
    async fn in_flight_event_is_never_evicted() {
        let sink = Arc::new(EventSink::new(1));
        let store = Arc::new(MemoryStore::default());
        store.fail.store(true, Ordering::SeqCst);
        let notifier = Arc::new(CountingNotifier::default());
        let cancel = CancellationToken::new();

        let task = {
            let (sink, store, notifier, cancel) =
                (sink.clone(), store.clone(), notifier.clone(), cancel.clone());
            tokio::spawn(async move {
                sink.dispatch(&*store, &*notifier, Duration::from_millis(5), cancel)
                    .await;
            })
        };

        let first = Event::new(EventKind::DeviceOnline);
        let first_id = first.id();
        sink.publish(first);
        tokio::time::sleep(Duration::from_millis(30)).await;

        // The dispatcher is retrying the first event, so the slot is free.
        let second = Event::new(EventKind::DeviceIdle);
        let second_id = second.id();
        assert_eq!(sink.publish(second), PublishOutcome::Queued);

        store.fail.store(false, Ordering::SeqCst);
        while !sink.is_empty() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        cancel.cancel();
        task.await.unwrap();

        let stored: Vec<EventId> = store.events.lock().unwrap().iter().map(Event::id).collect();
        assert_eq!(stored, vec![first_id, second_id]);
        assert_eq!(sink.dropped_total(), 0);
    }

    #[tokio::test]
    async fn claimed_head_survives_overflow() {
        let sink = EventSink::new(1);
        let head = Event::new(EventKind::DeviceOnline);
        let head_id = head.id();
        sink.publish(head);

        let claimed = sink.next_ready().await;
        assert_eq!(claimed.id(), head_id);

        sink.publish(Event::new(EventKind::DeviceIdle));
        let outcome = sink.publish(Event::new(EventKind::DeviceOffline));
        assert!(matches!(
            outcome,
            PublishOutcome::Overflowed {
                alert_raised: true,
                ..
            }
        ));
        assert_eq!(
            kinds(&sink.pending()),
            vec![EventKind::DeviceOnline, EventKind::Alert, EventKind::DeviceOffline]
        );
        assert_eq!(sink.next_ready().await.id(), head_id);
    }

    #[tokio::test]
    async fn dispatch_delivers_in_order_and_notifies_warnings() {
        let sink = Arc::new(EventSink::new(16));
        let store = Arc::new(MemoryStore::default());
        let notifier = Arc::new(CountingNotifier::default());
        let cancel = CancellationToken::new();

        sink.publish(Event::new(EventKind::ScanStarted));
        sink.publish(Event::new(EventKind::PingSweep));
        sink.publish(Event::new(EventKind::Warning).with_detail("reason", "nmap timed out"));

        let task = {
            let (sink, store, notifier, cancel) =
                (sink.clone(), store.clone(), notifier.clone(), cancel.clone());
            tokio::spawn(async move {
                sink.dispatch(&*store, &*notifier, Duration::from_millis(5), cancel)
                    .await;
            })
        };

        while !sink.is_empty() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        cancel.cancel();
        task.await.unwrap();

        let stored = store.events.lock().unwrap().clone();
        assert_eq!(
            kinds(&stored),
            vec![EventKind::ScanStarted, EventKind::PingSweep, EventKind::Warning]
        );
        assert_eq!(notifier.seen.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn events_queue_while_store_is_unavailable() {
        let sink = Arc::new(EventSink::new(16));
        let store = Arc::new(MemoryStore::default());
        store.fail.store(true, Ordering::SeqCst);
        let notifier = Arc::new(CountingNotifier::default());
        let cancel = CancellationToken::new();

        let task = {
            let (sink, store, notifier, cancel) =
                (sink.clone(), store.clone(), notifier.clone(), cancel.clone());
            tokio::spawn(async move {
                sink.dispatch(&*store, &*notifier, Duration::from_millis(5), cancel)
                    .await;
            })
        };

        sink.publish(Event::new(EventKind::DeviceOnline));
        sink.publish(Event::new(EventKind::DeviceIdle));
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(sink.len(), 2);

        store.fail.store(false, Ordering::SeqCst);
        while !sink.is_empty() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        cancel.cancel();
        task.await.unwrap();

        let stored = store.events.lock().unwrap().clone();
        assert_eq!(
            kinds(&stored),
            vec![EventKind::DeviceOnline, EventKind::DeviceIdle]
        );
    }
}
