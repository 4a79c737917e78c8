use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::Result;

use super::SessionState;
use crate::error::EngineError;

/// Storage collaborator behind `SessionMemory`. Any backend satisfies the
/// contract as long as `save`/`remove` are atomic per session id and a
/// reload reconstructs an identical `SessionState`.
pub trait SessionStore: Send + Sync {
    fn load(&self, session_id: &str) -> Result<Option<SessionState>>;
    fn save(&self, state: &SessionState) -> Result<()>;
    fn remove(&self, session_id: &str) -> Result<()>;
}

/// One `<session_id>.json` per session under a base directory.
#[derive(Debug, Clone)]
pub struct JsonSessionStore {
    dir: PathBuf,
}

impl JsonSessionStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn session_path(&self, session_id: &str) -> PathBuf {
        let safe: String = session_id
            .chars()
            .map(|ch| {
                if ch.is_ascii_alphanumeric() || ch == '-' || ch == '_' {
                    ch
                } else {
                    '_'
                }
            })
            .collect();
        self.dir.join(format!("{safe}.json"))
    }
}

impl SessionStore for JsonSessionStore {
    fn load(&self, session_id: &str) -> Result<Option<SessionState>> {
        let path = self.session_path(session_id);
        if !path.exists() {
            return Ok(None);
        }
        let raw = std::fs::read_to_string(&path)
            .map_err(|err| EngineError::Storage(format!("read {}: {err}", path.display())))?;
        let state = serde_json::from_str(&raw)
            .map_err(|err| EngineError::Storage(format!("parse {}: {err}", path.display())))?;
        Ok(Some(state))
    }

    fn save(&self, state: &SessionState) -> Result<()> {
        let path = self.session_path(&state.session_id);
        write_json_atomic(&path, state)
            .map_err(|err| EngineError::Storage(format!("write {}: {err}", path.display())))?;
        Ok(())
    }

    fn remove(&self, session_id: &str) -> Result<()> {
        let path = self.session_path(session_id);
        if path.exists() {
            std::fs::remove_file(&path)
                .map_err(|err| EngineError::Storage(format!("remove {}: {err}", path.display())))?;
        }
        Ok(())
    }
}

fn write_json_atomic(path: &Path, state: &SessionState) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, serde_json::to_string_pretty(state)?)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

/// In-memory store for tests and throwaway sessions.
#[derive(Debug, Default)]
pub struct MemorySessionStore {
    sessions: Mutex<HashMap<String, SessionState>>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SessionStore for MemorySessionStore {
    fn load(&self, session_id: &str) -> Result<Option<SessionState>> {
        let sessions = self
            .sessions
            .lock()
            .map_err(|_| EngineError::Storage("memory store lock poisoned".to_string()))?;
        Ok(sessions.get(session_id).cloned())
    }

    fn save(&self, state: &SessionState) -> Result<()> {
        let mut sessions = self
            .sessions
            .lock()
            .map_err(|_| EngineError::Storage("memory store lock poisoned".to_string()))?;
        sessions.insert(state.session_id.clone(), state.clone());
        Ok(())
    }

    fn remove(&self, session_id: &str) -> Result<()> {
        let mut sessions = self
            .sessions
            .lock()
            .map_err(|_| EngineError::Storage("memory store lock poisoned".to_string()))?;
        sessions.remove(session_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use crate::prompt::Turn;
    use crate::session::SessionState;

    use super::{JsonSessionStore, SessionStore};

    #[test]
    fn json_store_roundtrip_reconstructs_identical_state() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let store = JsonSessionStore::new(temp.path());

        let mut state = SessionState::new("sess-1");
        state.turns.push(Turn::user("draw a red balloon"));
        state.turns.push(Turn::agent("rendered v1", Some(1)));
        store.save(&state)?;

        let loaded = store.load("sess-1")?.expect("state present");
        assert_eq!(loaded, state);
        Ok(())
    }

    #[test]
    fn json_store_missing_session_is_none() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let store = JsonSessionStore::new(temp.path());
        assert!(store.load("nope")?.is_none());
        Ok(())
    }

    #[test]
    fn json_store_remove_is_idempotent() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let store = JsonSessionStore::new(temp.path());
        store.save(&SessionState::new("sess-1"))?;
        store.remove("sess-1")?;
        store.remove("sess-1")?;
        assert!(store.load("sess-1")?.is_none());
        Ok(())
    }

    #[test]
    fn json_store_sanitizes_session_ids() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let store = JsonSessionStore::new(temp.path());
        store.save(&SessionState::new("../weird id"))?;
        let loaded = store.load("../weird id")?.expect("state present");
        assert_eq!(loaded.session_id, "../weird id");
        Ok(())
    }
}
