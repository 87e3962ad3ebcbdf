//! Audit trail for blocked actions.
//!
//! The engine pushes an [`EventRecord`] for every violation. The consumer
//! drains the bounded channel at its own pace: one `warn!` per event and,
//! when configured, one JSON line per event in an append-only file.

use std::io::Write;
use std::path::Path;
use std::sync::{Arc, Mutex};

use chrono::Utc;
use serde::Serialize;
use telos_engine::EventRecord;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// A single audit log line.
#[derive(Debug, Serialize)]
struct AuditEntry<'a> {
    timestamp: String,
    pid: u32,
    taint_level: u32,
    taint: &'static str,
    blocked: bool,
    comm: &'a str,
    action: &'a str,
}

/// Append-only JSON-lines writer.
pub struct AuditLogger {
    writer: Mutex<Box<dyn Write + Send>>,
}

impl AuditLogger {
    /// Append to the file at `path`, creating it if needed.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be opened for appending.
    pub fn new(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path.as_ref())?;
        Ok(Self {
            writer: Mutex::new(Box::new(file)),
        })
    }

    /// Write to an arbitrary sink (for testing).
    pub fn from_writer(writer: Box<dyn Write + Send>) -> Self {
        Self {
            writer: Mutex::new(writer),
        }
    }

    /// Append one entry for `event`.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization or the write fails.
    pub fn log_event(&self, event: &EventRecord) -> anyhow::Result<()> {
        let action = event
            .action_kind()
            .map(|a| a.label())
            .unwrap_or("unknown");
        let entry = AuditEntry {
            timestamp: Utc::now().to_rfc3339(),
            pid: event.pid,
            taint_level: event.taint_level,
            taint: event.taint().name(),
            blocked: event.is_blocked(),
            comm: event.comm_str(),
            action,
        };
        let line = serde_json::to_string(&entry)?;
        let mut writer = self
            .writer
            .lock()
            .map_err(|e| anyhow::anyhow!("audit lock poisoned: {e}"))?;
        writeln!(writer, "{line}")?;
        writer.flush()?;
        Ok(())
    }
}

/// Drain `events` until every sender is gone. Returns the number consumed.
pub async fn run_event_consumer(
    mut events: mpsc::Receiver<EventRecord>,
    logger: Option<Arc<AuditLogger>>,
) -> u64 {
    let mut consumed: u64 = 0;
    while let Some(event) = events.recv().await {
        consumed = consumed.saturating_add(1);
        let action = event.action_kind().map(|a| a.label()).unwrap_or("unknown");
        warn!(
            pid = event.pid,
            comm = event.comm_str(),
            taint = event.taint().name(),
            action,
            blocked = event.is_blocked(),
            "taint policy violation"
        );
        if let Some(logger) = &logger {
            if let Err(e) = logger.log_event(&event) {
                warn!(error = %e, "failed to write audit entry");
            }
        }
    }
    debug!(consumed, "event channel closed");
    consumed
}
