use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use serde_json::{Map, Value};

use crate::prompt::now_utc_iso;

pub type EventPayload = Map<String, Value>;

/// Append-only JSONL sink for engine events, one compact JSON object per
/// line. The sink is shared across sessions, so the session id travels
/// with each emit rather than living in the writer.
#[derive(Debug, Clone)]
pub struct EventWriter {
    inner: Arc<Sink>,
}

#[derive(Debug)]
struct Sink {
    path: PathBuf,
    guard: Mutex<()>,
}

impl EventWriter {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            inner: Arc::new(Sink {
                path: path.into(),
                guard: Mutex::new(()),
            }),
        }
    }

    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    pub fn emit(
        &self,
        event_type: &str,
        session_id: &str,
        payload: EventPayload,
    ) -> anyhow::Result<Value> {
        let event = envelope(event_type, session_id, payload);
        let line = serde_json::to_string(&event)?;
        self.append(&line)?;
        Ok(Value::Object(event))
    }

    fn append(&self, line: &str) -> anyhow::Result<()> {
        if let Some(parent) = self.inner.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let _held = self
            .inner
            .guard
            .lock()
            .map_err(|_| anyhow::anyhow!("event sink lock poisoned"))?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.inner.path)?;
        writeln!(file, "{line}")?;
        Ok(())
    }
}

/// Envelope keys `type`, `session_id` and `ts` fill in around the caller
/// payload; payload entries win on collision.
fn envelope(event_type: &str, session_id: &str, payload: EventPayload) -> Map<String, Value> {
    let mut event = payload;
    for (key, value) in [
        ("type", Value::String(event_type.to_string())),
        ("session_id", Value::String(session_id.to_string())),
        ("ts", Value::String(now_utc_iso())),
    ] {
        event.entry(key.to_string()).or_insert(value);
    }
    event
}
