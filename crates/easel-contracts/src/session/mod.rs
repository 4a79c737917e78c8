pub mod store;

use std::collections::HashMap;
use std::sync::Mutex;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use similar::TextDiff;

use crate::error::EngineError;
use crate::prompt::{now_utc_iso, PromptSpec, Turn};

use store::SessionStore;

/// Fresh session identifier for callers that do not bring their own.
pub fn generate_session_id() -> String {
    format!("sess-{}", uuid::Uuid::new_v4())
}

/// Per-conversation aggregate: bounded turn log plus the current prompt.
///
/// Only the turn log is bounded; the current prompt survives trimming
/// independently of history depth.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionState {
    pub schema_version: u64,
    pub session_id: String,
    pub created_at: String,
    pub turns: Vec<Turn>,
    pub current_prompt: Option<PromptSpec>,
    /// Unified diff of the rendered prompt against the prior version,
    /// recorded at commit time for inspection.
    pub last_prompt_diff: Option<Vec<String>>,
}

impl SessionState {
    pub fn new(session_id: impl Into<String>) -> Self {
        Self {
            schema_version: 1,
            session_id: session_id.into(),
            created_at: now_utc_iso(),
            turns: Vec::new(),
            current_prompt: None,
            last_prompt_diff: None,
        }
    }
}

/// Owns every `SessionState` and the trimming policy. All mutation goes
/// through `commit`/`mark_constraints_satisfied`/`clear`, each atomic with
/// respect to a session id.
pub struct SessionMemory {
    store: Box<dyn SessionStore>,
    max_history_depth: usize,
    sessions: Mutex<HashMap<String, SessionState>>,
}

impl SessionMemory {
    pub fn new(store: Box<dyn SessionStore>, max_history_depth: usize) -> Self {
        Self {
            store,
            max_history_depth: max_history_depth.max(1),
            sessions: Mutex::new(HashMap::new()),
        }
    }

    pub fn max_history_depth(&self) -> usize {
        self.max_history_depth
    }

    /// Current prompt (if any generation happened yet) plus the recent
    /// turn log, oldest first.
    pub fn get_context(&self, session_id: &str) -> Result<(Option<PromptSpec>, Vec<Turn>)> {
        let mut sessions = self.lock_sessions()?;
        let state = self.loaded_state(&mut sessions, session_id)?;
        Ok((state.current_prompt.clone(), state.turns.clone()))
    }

    pub fn snapshot(&self, session_id: &str) -> Result<SessionState> {
        let mut sessions = self.lock_sessions()?;
        Ok(self.loaded_state(&mut sessions, session_id)?.clone())
    }

    /// Appends the turn and, when a candidate prompt is present, commits it
    /// as the current prompt at `prior version + 1`. Failed merge attempts
    /// never reach this point, so version numbers stay gapless. The state
    /// is persisted before it is acknowledged; a storage failure leaves the
    /// in-memory state untouched.
    pub fn commit(
        &self,
        session_id: &str,
        turn: Turn,
        candidate: Option<PromptSpec>,
    ) -> Result<SessionState> {
        let mut sessions = self.lock_sessions()?;
        let mut next = self.loaded_state(&mut sessions, session_id)?.clone();

        let mut turn = turn;
        if let Some(candidate) = candidate {
            let version = next
                .current_prompt
                .as_ref()
                .map(|prompt| prompt.version + 1)
                .unwrap_or(1);
            let committed = candidate.with_version(version);
            next.last_prompt_diff = prompt_diff(
                next.current_prompt
                    .as_ref()
                    .map(|prompt| prompt.render_text()),
                &committed.render_text(),
            );
            next.current_prompt = Some(committed);
            turn.resulting_prompt_version = Some(version);
        }
        next.turns.push(turn);
        trim_turns(&mut next.turns, self.max_history_depth);

        self.store.save(&next)?;
        sessions.insert(session_id.to_string(), next.clone());
        Ok(next)
    }

    /// Replaces the current prompt with a copy whose named checklist
    /// entries are satisfied. The version is unchanged: flipping a
    /// satisfied flag is a critique outcome, not a merge.
    pub fn mark_constraints_satisfied(
        &self,
        session_id: &str,
        keys: &[String],
    ) -> Result<Option<PromptSpec>> {
        let mut sessions = self.lock_sessions()?;
        let mut next = self.loaded_state(&mut sessions, session_id)?.clone();
        let Some(current) = next.current_prompt.as_ref() else {
            return Ok(None);
        };
        let updated = current.with_constraints_satisfied(keys);
        next.current_prompt = Some(updated.clone());
        self.store.save(&next)?;
        sessions.insert(session_id.to_string(), next);
        Ok(Some(updated))
    }

    /// Resets the session to empty. Explicit only; trimming never calls
    /// this.
    pub fn clear(&self, session_id: &str) -> Result<()> {
        let mut sessions = self.lock_sessions()?;
        self.store.remove(session_id)?;
        sessions.remove(session_id);
        Ok(())
    }

    fn loaded_state<'a>(
        &self,
        sessions: &'a mut HashMap<String, SessionState>,
        session_id: &str,
    ) -> Result<&'a mut SessionState> {
        if !sessions.contains_key(session_id) {
            let state = self
                .store
                .load(session_id)?
                .unwrap_or_else(|| SessionState::new(session_id));
            sessions.insert(session_id.to_string(), state);
        }
        Ok(sessions
            .get_mut(session_id)
            .expect("state inserted above"))
    }

    fn lock_sessions(&self) -> Result<std::sync::MutexGuard<'_, HashMap<String, SessionState>>> {
        self.sessions
            .lock()
            .map_err(|_| EngineError::Storage("session memory lock poisoned".to_string()).into())
    }
}

fn trim_turns(turns: &mut Vec<Turn>, max_history_depth: usize) {
    if turns.len() > max_history_depth {
        let excess = turns.len() - max_history_depth;
        turns.drain(0..excess);
    }
}

fn prompt_diff(prev: Option<String>, curr: &str) -> Option<Vec<String>> {
    let prev = prev?;
    let diff = TextDiff::from_lines(prev.as_str(), curr);
    let rendered = diff.unified_diff().header("prev", "curr").to_string();
    Some(rendered.lines().map(str::to_string).collect())
}
