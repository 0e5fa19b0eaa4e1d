use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use chrono::{SecondsFormat, Utc};
use serde_json::{json, Map, Value};

use crate::error::{Stage, StageError};

pub type EventPayload = Map<String, Value>;

/// Append-only writer for the per-session `events.jsonl`.
///
/// - default fields are `type`, `session_id`, `ts`
/// - caller payload is merged last and can override defaults
/// - one compact JSON object per line
#[derive(Debug, Clone)]
pub struct EventWriter {
    inner: Arc<EventWriterInner>,
}

#[derive(Debug)]
struct EventWriterInner {
    path: PathBuf,
    session_id: String,
    lock: Mutex<()>,
}

impl EventWriter {
    pub fn new(path: impl Into<PathBuf>, session_id: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(EventWriterInner {
                path: path.into(),
                session_id: session_id.into(),
                lock: Mutex::new(()),
            }),
        }
    }

    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    pub fn session_id(&self) -> &str {
        &self.inner.session_id
    }

    pub fn emit(&self, event_type: &str, payload: EventPayload) -> anyhow::Result<Value> {
        let mut event = Map::new();
        event.insert("type".to_string(), Value::String(event_type.to_string()));
        event.insert(
            "session_id".to_string(),
            Value::String(self.inner.session_id.clone()),
        );
        event.insert("ts".to_string(), Value::String(now_utc_iso()));
        for (key, value) in payload {
            event.insert(key, value);
        }

        if let Some(parent) = self.inner.path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let line = serde_json::to_string(&event)?;
        let _guard = self
            .inner
            .lock
            .lock()
            .map_err(|_| anyhow::anyhow!("event writer lock poisoned"))?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.inner.path)?;
        file.write_all(line.as_bytes())?;
        file.write_all(b"\n")?;

        Ok(Value::Object(event))
    }

    pub fn stage_started(&self, stage: Stage) -> anyhow::Result<Value> {
        let mut payload = EventPayload::new();
        payload.insert("stage".to_string(), json!(stage.name()));
        self.emit("stage_started", payload)
    }

    pub fn stage_completed(&self, stage: Stage, elapsed_ms: f64) -> anyhow::Result<Value> {
        let mut payload = EventPayload::new();
        payload.insert("stage".to_string(), json!(stage.name()));
        payload.insert("status".to_string(), json!("succeeded"));
        payload.insert("elapsed_ms".to_string(), json!(elapsed_ms));
        self.emit("stage_completed", payload)
    }

    pub fn stage_failed(&self, error: &StageError, elapsed_ms: f64) -> anyhow::Result<Value> {
        let mut payload = EventPayload::new();
        payload.insert("stage".to_string(), json!(error.stage.name()));
        payload.insert("status".to_string(), json!("failed"));
        payload.insert("code".to_string(), json!(error.kind.code()));
        payload.insert("message".to_string(), json!(error.message));
        payload.insert("elapsed_ms".to_string(), json!(elapsed_ms));
        self.emit("stage_failed", payload)
    }
}

pub fn now_utc_iso() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, false)
}

#[cfg(test)]
mod tests {
    use std::fs;

    use chrono::DateTime;

    use crate::error::{ErrorKind, Stage, StageError};

    use super::*;

    #[test]
    fn pipeline_events_append_one_object_per_line() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("events.jsonl");
        let writer = EventWriter::new(&path, "session-123");

        let mut payload = EventPayload::new();
        payload.insert("flatlay".to_string(), json!("file:///tmp/flat.png"));
        let started = writer.emit("pipeline_started", payload)?;

        let mut payload = EventPayload::new();
        payload.insert("reason".to_string(), json!("reconciler unreachable"));
        let fallback = writer.emit("consolidation_fallback", payload)?;

        let content = fs::read_to_string(&path)?;
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0], serde_json::to_string(&started)?);
        assert_eq!(lines[1], serde_json::to_string(&fallback)?);

        let parsed: Value = serde_json::from_str(lines[1])?;
        assert_eq!(parsed["type"], json!("consolidation_fallback"));
        assert_eq!(parsed["session_id"], json!("session-123"));
        assert_eq!(parsed["reason"], json!("reconciler unreachable"));
        DateTime::parse_from_rfc3339(parsed["ts"].as_str().unwrap_or(""))?;
        Ok(())
    }

    #[test]
    fn stage_events_carry_stage_and_status() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("events.jsonl");
        let writer = EventWriter::new(&path, "session-123");

        writer.stage_started(Stage::Analysis)?;
        writer.stage_completed(Stage::Analysis, 412.5)?;
        let failure = StageError::new(Stage::Enrichment, ErrorKind::Timeout, "deadline exceeded");
        writer.stage_failed(&failure, 30_000.0)?;

        let content = fs::read_to_string(&path)?;
        let lines: Vec<Value> = content
            .lines()
            .map(serde_json::from_str)
            .collect::<Result<_, _>>()?;
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0]["type"], json!("stage_started"));
        assert_eq!(lines[0]["stage"], json!("analysis"));
        assert_eq!(lines[1]["status"], json!("succeeded"));
        assert_eq!(lines[1]["elapsed_ms"], json!(412.5));
        assert_eq!(lines[2]["stage"], json!("enrichment"));
        assert_eq!(lines[2]["code"], json!("TIMEOUT"));
        Ok(())
    }

    #[test]
    fn caller_payload_wins_over_default_fields() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("events.jsonl");
        let writer = EventWriter::new(&path, "session-123");

        let mut payload = EventPayload::new();
        payload.insert("ts".to_string(), json!("2026-01-01T00:00:00.000000+00:00"));
        let emitted = writer.emit("pipeline_started", payload)?;

        // The replayed timestamp replaces the default; the untouched
        // defaults stay.
        assert_eq!(emitted["ts"], json!("2026-01-01T00:00:00.000000+00:00"));
        assert_eq!(emitted["session_id"], json!("session-123"));
        assert_eq!(emitted["type"], json!("pipeline_started"));
        Ok(())
    }
}
