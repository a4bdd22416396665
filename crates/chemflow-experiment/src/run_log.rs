//! Run log: one record per dispatched command or background outcome.
//!
//! The log is the experiment record, separate from diagnostics. Each entry is
//! handed to a [`RunLogSink`] and mirrored as a `tracing` event under the
//! `chemflow::runlog` target.

use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;
use tokio::time::Instant;

/// One run-log record.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LogEntry {
    /// Seconds since the run started
    pub elapsed_s: f64,
    /// Component tag
    pub component: String,
    /// Action verb
    pub action: String,
    /// Parameters as written
    pub parameters: String,
    /// Human-readable outcome
    pub outcome: String,
    /// Notes (estimates, read-backs, ...)
    pub notes: String,
}

/// Destination for run-log entries.
pub trait RunLogSink: Send + Sync {
    /// Persist one entry.
    fn write(&self, entry: &LogEntry) -> anyhow::Result<()>;
}

/// Cloneable handle that timestamps entries against the run start.
#[derive(Clone)]
pub struct RunLogger {
    sink: Arc<dyn RunLogSink>,
    started: Instant,
}

impl RunLogger {
    /// Logger whose clock starts now.
    pub fn new(sink: Arc<dyn RunLogSink>) -> Self {
        Self {
            sink,
            started: Instant::now(),
        }
    }

    /// Seconds since the logger was created.
    pub fn elapsed_s(&self) -> f64 {
        self.started.elapsed().as_secs_f64()
    }

    /// Record an entry. Sink failures are reported and swallowed.
    pub fn log(
        &self,
        component: impl Into<String>,
        action: impl Into<String>,
        parameters: impl Into<String>,
        outcome: impl Into<String>,
        notes: impl Into<String>,
    ) {
        let entry = LogEntry {
            elapsed_s: self.elapsed_s(),
            component: component.into(),
            action: action.into(),
            parameters: parameters.into(),
            outcome: outcome.into(),
            notes: notes.into(),
        };
        tracing::info!(
            target: "chemflow::runlog",
            elapsed_s = entry.elapsed_s,
            component = %entry.component,
            action = %entry.action,
            parameters = %entry.parameters,
            notes = %entry.notes,
            "{}",
            entry.outcome
        );
        if let Err(e) = self.sink.write(&entry) {
            tracing::warn!(error = %e, "failed to write run log entry");
        }
    }
}

/// In-memory sink.
#[derive(Debug, Default)]
pub struct MemoryRunLog {
    entries: Mutex<Vec<LogEntry>>,
}

impl MemoryRunLog {
    /// Empty log.
    pub fn new() -> Self {
        Self::default()
    }

    /// Everything written so far.
    pub fn entries(&self) -> Vec<LogEntry> {
        self.entries.lock().clone()
    }

    /// Entries whose action is `action`.
    pub fn with_action(&self, action: &str) -> Vec<LogEntry> {
        self.entries
            .lock()
            .iter()
            .filter(|entry| entry.action == action)
            .cloned()
            .collect()
    }
}

impl RunLogSink for MemoryRunLog {
    fn write(&self, entry: &LogEntry) -> anyhow::Result<()> {
        self.entries.lock().push(entry.clone());
        Ok(())
    }
}
