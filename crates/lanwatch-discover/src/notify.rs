//! Operator notifications via the tracing log.

use std::collections::{HashSet, VecDeque};
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use lanwatch_core::{Event, EventId, EventKind, Result};
use lanwatch_presence::Notifier;

const REMEMBERED_IDS: usize = 1024;

/// Logs `Alert` events at error level and `Warning` events at warn level.
/// Redeliveries of a recently seen event are suppressed.
pub struct TracingNotifier {
    seen: Mutex<SeenIds>,
}

#[derive(Default)]
struct SeenIds {
    order: VecDeque<EventId>,
    ids: HashSet<EventId>,
}

impl SeenIds {
    /// Returns `false` if `id` was already recorded.
    fn insert(&mut self, id: EventId) -> bool {
        if !self.ids.insert(id) {
            return false;
        }
        self.order.push_back(id);
        if self.order.len() > REMEMBERED_IDS {
            if let Some(oldest) = self.order.pop_front() {
                self.ids.remove(&oldest);
            }
        }
        true
    }
}

impl TracingNotifier {
    pub fn new() -> Self {
        Self {
            seen: Mutex::new(SeenIds::default()),
        }
    }

    /// Record `event` and report whether it is new.
    fn first_delivery(&self, event: &Event) -> bool {
        self.seen
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(event.id())
    }
}

impl Default for TracingNotifier {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Notifier for TracingNotifier {
    async fn notify(&self, event: &Event) -> Result<()> {
        if !self.first_delivery(event) {
            tracing::debug!(event_id = %event.id(), "Duplicate notification suppressed");
            return Ok(());
        }

        let reason = event.detail("reason").unwrap_or_default();
        match event.kind() {
            EventKind::Alert => {
                tracing::error!(event_id = %event.id(), reason = %reason, details = ?event.details(), "ALERT");
            }
            kind => {
                tracing::warn!(event_id = %event.id(), kind = %kind, reason = %reason, "Warning");
            }
        }
        Ok(())
    }
}
