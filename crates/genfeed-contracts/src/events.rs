use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use chrono::{SecondsFormat, Utc};
use serde_json::{Map, Value};
use uuid::Uuid;

pub type EventPayload = Map<String, Value>;

/// Structured JSONL log of everything the feed does.
///
/// Every record gets `type`, `session_id` and `ts`; the caller payload is merged
/// last. Clones share the same sink.
#[derive(Debug, Clone)]
pub struct EventLog {
    inner: Arc<EventLogInner>,
}

#[derive(Debug)]
struct EventLogInner {
    session_id: String,
    sink: Mutex<EventSink>,
}

#[derive(Debug)]
enum EventSink {
    File(PathBuf),
    Memory(Vec<Value>),
    Off,
}

impl EventLog {
    pub fn to_file(path: impl Into<PathBuf>, session_id: Option<String>) -> Self {
        Self::with_sink(EventSink::File(path.into()), session_id)
    }

    pub fn in_memory() -> Self {
        Self::with_sink(EventSink::Memory(Vec::new()), None)
    }

    pub fn disabled() -> Self {
        Self::with_sink(EventSink::Off, None)
    }

    fn with_sink(sink: EventSink, session_id: Option<String>) -> Self {
        let session_id = session_id
            .filter(|value| !value.trim().is_empty())
            .unwrap_or_else(|| format!("session-{}", Uuid::new_v4()));
        Self {
            inner: Arc::new(EventLogInner {
                session_id,
                sink: Mutex::new(sink),
            }),
        }
    }

    pub fn session_id(&self) -> &str {
        &self.inner.session_id
    }

    pub fn path(&self) -> Option<PathBuf> {
        let sink = self.inner.sink.lock().ok()?;
        match &*sink {
            EventSink::File(path) => Some(path.clone()),
            _ => None,
        }
    }

    pub fn record(&self, event_type: &str, payload: EventPayload) -> anyhow::Result<Value> {
        let mut event = Map::new();
        event.insert("type".to_string(), Value::String(event_type.to_string()));
        event.insert(
            "session_id".to_string(),
            Value::String(self.inner.session_id.clone()),
        );
        event.insert("ts".to_string(), Value::String(now_utc_iso()));
        event.extend(payload);
        let event = Value::Object(event);

        let mut sink = self
            .inner
            .sink
            .lock()
            .map_err(|_| anyhow::anyhow!("event log lock poisoned"))?;
        match &mut *sink {
            EventSink::File(path) => append_line(path, &event)?,
            EventSink::Memory(rows) => rows.push(event.clone()),
            EventSink::Off => {}
        }
        Ok(event)
    }

    /// Records and swallows sink failures; logging must never fail a cache update.
    pub fn note(&self, event_type: &str, payload: EventPayload) {
        if let Err(err) = self.record(event_type, payload) {
            eprintln!("genfeed: event log write failed ({event_type}): {err:#}");
        }
    }

    /// Records held by an in-memory log; empty for the other sinks.
    pub fn recorded(&self) -> Vec<Value> {
        match self.inner.sink.lock() {
            Ok(sink) => match &*sink {
                EventSink::Memory(rows) => rows.clone(),
                _ => Vec::new(),
            },
            Err(_) => Vec::new(),
        }
    }

    pub fn recorded_types(&self) -> Vec<String> {
        self.recorded()
            .iter()
            .filter_map(|row| row.get("type").and_then(Value::as_str).map(str::to_string))
            .collect()
    }
}

fn append_line(path: &Path, event: &Value) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let line = serde_json::to_string(event)?;
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    file.write_all(line.as_bytes())?;
    file.write_all(b"\n")?;
    Ok(())
}

pub fn now_utc_iso() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, false)
}

#[cfg(test)]
mod tests {
    use std::fs;

    use chrono::DateTime;
    use serde_json::{json, Value};

    use super::*;

    #[test]
    fn file_log_writes_one_compact_line_per_record() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("logs").join("events.jsonl");
        let log = EventLog::to_file(&path, Some("watch-1".to_string()));

        let mut payload = EventPayload::new();
        payload.insert("request_id".to_string(), json!(7));
        let emitted = log.record("request_inserted", payload)?;
        log.record("poll_scheduled", EventPayload::new())?;

        let content = fs::read_to_string(&path)?;
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 2);
        let first: Value = serde_json::from_str(lines[0])?;
        assert_eq!(first, emitted);
        assert_eq!(first["type"], json!("request_inserted"));
        assert_eq!(first["session_id"], json!("watch-1"));
        assert_eq!(first["request_id"], json!(7));
        DateTime::parse_from_rfc3339(first["ts"].as_str().unwrap_or(""))?;
        Ok(())
    }

    #[test]
    fn payload_overrides_defaults() -> anyhow::Result<()> {
        let log = EventLog::in_memory();
        let mut payload = EventPayload::new();
        payload.insert("type".to_string(), json!("override"));
        let emitted = log.record("signal_applied", payload)?;
        assert_eq!(emitted["type"], json!("override"));
        Ok(())
    }

    #[test]
    fn memory_log_keeps_records_and_generates_session_id() -> anyhow::Result<()> {
        let log = EventLog::in_memory();
        log.note("signal_buffered", EventPayload::new());
        log.clone().note("signal_applied", EventPayload::new());

        assert!(log.session_id().starts_with("session-"));
        assert_eq!(
            log.recorded_types(),
            vec!["signal_buffered".to_string(), "signal_applied".to_string()]
        );
        assert!(log.path().is_none());
        Ok(())
    }

    #[test]
    fn disabled_log_records_nothing() -> anyhow::Result<()> {
        let log = EventLog::disabled();
        let emitted = log.record("page_fetched", EventPayload::new())?;
        assert_eq!(emitted["type"], json!("page_fetched"));
        assert!(log.recorded().is_empty());
        Ok(())
    }
}
