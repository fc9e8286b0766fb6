//! JSON-lines event log.
//!
//! One event per line, appended in dispatch order. Reading tolerates lines
//! written by a build with a larger label table: they come back as
//! [`LogEntry::Unrecognized`] and are never rewritten.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use lanwatch_core::events::encode_line;
use lanwatch_core::{Event, LogEntry, Result};
use lanwatch_presence::EventStore;
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

/// Append-only event store backed by a local file.
pub struct JsonlEventStore {
    path: PathBuf,
    write: Mutex<()>,
}

impl JsonlEventStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl EventStore for JsonlEventStore {
    async fn append(&self, event: &Event) -> Result<()> {
        let mut line = encode_line(event)?;
        line.push('\n');

        let _guard = self.write.lock().await;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(line.as_bytes()).await?;
        file.flush().await?;

        tracing::trace!(event_id = %event.id(), kind = %event.kind(), "Event persisted");
        Ok(())
    }
}

/// Read every entry of an event log. Blank lines are skipped; a malformed
/// line is an error.
pub async fn read_log(path: &Path) -> Result<Vec<LogEntry>> {
    let contents = fs::read_to_string(path).await?;
    contents
        .lines()
        .filter(|line| !line.trim().is_empty())
        .map(LogEntry::parse)
        .collect()
}

/// Count of log entries per label, unknown labels included.
pub fn summarize(entries: &[LogEntry]) -> BTreeMap<String, usize> {
    let mut counts = BTreeMap::new();
    for entry in entries {
        let label = match entry {
            LogEntry::Known(event) => event.kind().label().to_string(),
            LogEntry::Unrecognized { label, .. } => label.clone(),
        };
        *counts.entry(label).or_insert(0) += 1;
    }
    counts
}
