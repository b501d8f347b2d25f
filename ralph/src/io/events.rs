//! Append-only JSONL event log (`.ralph/logs/events.jsonl`).

use std::path::PathBuf;

use serde::Serialize;
use serde_json::Value;
use tracing::warn;

use crate::io::files::append_jsonl;
use crate::io::run_state::now_rfc3339;

/// Receives lifecycle events from the control loop.
///
/// Emitting never fails the caller: sinks swallow and log their own errors.
pub trait EventSink {
    fn emit(&self, event: &str, message: &str, metadata: Value) {
        let _ = (event, message, metadata);
    }
}

/// Sink that drops every event.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopEvents;

impl EventSink for NoopEvents {}

#[derive(Debug, Serialize)]
struct EventRecord<'a> {
    timestamp: String,
    event: &'a str,
    message: &'a str,
    metadata: Value,
}

/// Sink that appends one JSON object per event.
#[derive(Debug, Clone)]
pub struct JsonlEvents {
    path: PathBuf,
}

impl JsonlEvents {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl EventSink for JsonlEvents {
    fn emit(&self, event: &str, message: &str, metadata: Value) {
        let record = EventRecord {
            timestamp: now_rfc3339(),
            event,
            message,
            metadata,
        };
        if let Err(err) = append_jsonl(&self.path, &record) {
            warn!(event, err = %err, "failed to append event");
        }
    }
}
