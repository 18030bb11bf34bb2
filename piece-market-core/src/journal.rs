//! Fire-and-forget event journal.
//!
//! Components register the event types they emit and record events through a
//! supplier closure, which only runs when the event type is enabled. Recording
//! never blocks: `FsJournal` hands entries to a background writer task.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

/// Errors that occur while opening or closing a journal.
#[derive(Debug, thiserror::Error)]
pub enum JournalError {
    #[error("Journal writer task failed: {reason}")]
    Writer { reason: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// A registered `(system, event)` pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventType {
    system: String,
    event: String,
    enabled: bool,
}

impl EventType {
    pub fn system(&self) -> &str {
        &self.system
    }

    pub fn event(&self) -> &str {
        &self.event
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }
}

/// One line of the journal file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JournalEntry {
    pub timestamp: DateTime<Utc>,
    pub system: String,
    pub event: String,
    pub data: serde_json::Value,
}

/// Sink for state-change events.
pub trait Journal: Send + Sync {
    /// Registers an event type, resolving whether it is enabled.
    fn register_event_type(&self, system: &str, event: &str) -> EventType;

    /// Records an event; `supplier` is only called for enabled types.
    fn record_event(&self, event_type: &EventType, supplier: &dyn Fn() -> serde_json::Value);
}

/// Journal that discards every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullJournal;

impl Journal for NullJournal {
    fn register_event_type(&self, system: &str, event: &str) -> EventType {
        EventType {
            system: system.to_string(),
            event: event.to_string(),
            enabled: false,
        }
    }

    fn record_event(&self, _event_type: &EventType, _supplier: &dyn Fn() -> serde_json::Value) {}
}

/// Journal appending newline-delimited JSON to a file.
pub struct FsJournal {
    path: PathBuf,
    disabled: HashSet<(String, String)>,
    sender: parking_lot::Mutex<Option<mpsc::UnboundedSender<JournalEntry>>>,
    writer: tokio::sync::Mutex<Option<JoinHandle<()>>>,
}

impl FsJournal {
    /// Creates `dir` and starts a writer on a fresh journal file.
    ///
    /// # Errors
    ///
    /// - `JournalError::Io` - If the directory or file cannot be created
    pub async fn open(dir: &Path, disabled_events: &[(String, String)]) -> Result<Self, JournalError> {
        fs::create_dir_all(dir).await?;

        let file_name = format!("journal-{}.ndjson", Utc::now().format("%Y-%m-%dT%H%M%S%.3f"));
        let path = dir.join(file_name);
        let file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;

        let (sender, receiver) = mpsc::unbounded_channel();
        let writer = tokio::spawn(run_writer(BufWriter::new(file), receiver));

        info!(path = %path.display(), "Journal opened");
        Ok(Self {
            path,
            disabled: disabled_events.iter().cloned().collect(),
            sender: parking_lot::Mutex::new(Some(sender)),
            writer: tokio::sync::Mutex::new(Some(writer)),
        })
    }

    /// File the journal writes to.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Stops accepting events and waits until queued ones are flushed.
    ///
    /// # Errors
    ///
    /// - `JournalError::Writer` - If the writer task panicked
    pub async fn close(&self) -> Result<(), JournalError> {
        drop(self.sender.lock().take());

        if let Some(writer) = self.writer.lock().await.take() {
            writer.await.map_err(|e| JournalError::Writer {
                reason: e.to_string(),
            })?;
        }
        info!(path = %self.path.display(), "Journal closed");
        Ok(())
    }
}

impl Journal for FsJournal {
    fn register_event_type(&self, system: &str, event: &str) -> EventType {
        let enabled = !self
            .disabled
            .contains(&(system.to_string(), event.to_string()));
        EventType {
            system: system.to_string(),
            event: event.to_string(),
            enabled,
        }
    }

    fn record_event(&self, event_type: &EventType, supplier: &dyn Fn() -> serde_json::Value) {
        if !event_type.enabled {
            return;
        }

        let entry = JournalEntry {
            timestamp: Utc::now(),
            system: event_type.system.clone(),
            event: event_type.event.clone(),
            data: supplier(),
        };

        let sender = self.sender.lock();
        match sender.as_ref() {
            Some(sender) if sender.send(entry).is_ok() => {}
            _ => debug!(
                system = %event_type.system,
                event = %event_type.event,
                "Journal closed, event dropped"
            ),
        }
    }
}

async fn run_writer(
    mut file: BufWriter<fs::File>,
    mut receiver: mpsc::UnboundedReceiver<JournalEntry>,
) {
    while let Some(entry) = receiver.recv().await {
        write_entry(&mut file, &entry).await;
        while let Ok(entry) = receiver.try_recv() {
            write_entry(&mut file, &entry).await;
        }
        if let Err(e) = file.flush().await {
            error!(error = %e, "Failed to flush journal");
        }
    }
}

async fn write_entry(file: &mut BufWriter<fs::File>, entry: &JournalEntry) {
    let mut line = match serde_json::to_vec(entry) {
        Ok(line) => line,
        Err(e) => {
            error!(error = %e, "Failed to encode journal entry");
            return;
        }
    };
    line.push(b'\n');
    if let Err(e) = file.write_all(&line).await {
        error!(error = %e, "Failed to write journal entry");
    }
}
