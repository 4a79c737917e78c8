//! Conversational prompt-state engine: routes user turns, merges them into
//! versioned prompt specs, renders through a pluggable backend and runs a
//! bounded critique-and-correct cycle over the result.

pub mod cache;
pub mod feedback;
pub mod merge;
pub mod providers;
pub mod router;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Result};
use indexmap::IndexMap;
use serde_json::{Map, Value};

use easel_contracts::config::EngineConfig;
use easel_contracts::error::EngineError;
use easel_contracts::events::{EventPayload, EventWriter};
use easel_contracts::prompt::{Constraint, FeedbackVerdict, PromptSpec, TargetModel, Turn};
use easel_contracts::session::store::JsonSessionStore;
use easel_contracts::session::SessionMemory;

use cache::{render_cache_key, RenderCache};
use feedback::{CancelFlag, FeedbackHooks, FeedbackLoop};
use merge::{MergeIntent, PromptMerger};
use router::{Intent, IntentRouter};

/// Structured text completion backend (prompt merging, intent
/// classification fallback, Q&A replies).
pub trait TextCompleter: Send + Sync {
    fn name(&self) -> &str;

    /// Returns a JSON payload for the given system instructions and
    /// request context. The caller owns schema validation.
    fn complete(&self, system_instructions: &str, context: &Value) -> Result<Value>;
}

/// Image generation backend.
pub trait ImageRenderer: Send + Sync {
    fn name(&self) -> &str;

    fn render(&self, spec: &PromptSpec) -> Result<RenderedImage>;
}

/// Vision backend that checks a rendered image against the constraint
/// checklist.
pub trait ImageCritic: Send + Sync {
    fn name(&self) -> &str;

    fn critique(
        &self,
        image: &[u8],
        checklist: &IndexMap<String, Constraint>,
        original_user_text: &str,
    ) -> Result<FeedbackVerdict>;
}

/// One rendered artifact: PNG bytes plus backend metadata (provider,
/// model, artifact_path once written to disk).
#[derive(Debug, Clone)]
pub struct RenderedImage {
    pub bytes: Vec<u8>,
    pub metadata: Map<String, Value>,
}

/// What one handled turn produced.
#[derive(Debug)]
pub enum TurnOutcome {
    /// Question turn: a text reply, no render, no prompt change.
    Answered { reply: String },
    /// Generation turn: the committed prompt, the delivered image and the
    /// final feedback verdict. `resolved = false` means the retry budget
    /// ran out; the image is still delivered.
    Generated {
        prompt: PromptSpec,
        image: RenderedImage,
        verdict: FeedbackVerdict,
        resolved: bool,
        corrective_rounds: u32,
    },
}

/// The provider triple behind one engine instance.
pub struct EngineProviders {
    pub completer: Arc<dyn TextCompleter>,
    pub renderer: Arc<dyn ImageRenderer>,
    pub critic: Arc<dyn ImageCritic>,
}

impl EngineProviders {
    /// Deterministic offline providers.
    pub fn dryrun() -> Self {
        Self {
            completer: Arc::new(providers::DryrunCompleter::new()),
            renderer: Arc::new(providers::DryrunRenderer::new()),
            critic: Arc::new(providers::DryrunCritic::new()),
        }
    }

    /// Live providers where API keys are present, dryrun stand-ins where
    /// they are not.
    pub fn from_env() -> Self {
        let completer: Arc<dyn TextCompleter> = match providers::GeminiCompleter::from_env() {
            Some(live) => Arc::new(live),
            None => Arc::new(providers::DryrunCompleter::new()),
        };
        let renderer: Arc<dyn ImageRenderer> = match providers::StabilityRenderer::from_env() {
            Some(live) => Arc::new(live),
            None => Arc::new(providers::DryrunRenderer::new()),
        };
        let critic: Arc<dyn ImageCritic> = match providers::GeminiCritic::from_env() {
            Some(live) => Arc::new(live),
            None => Arc::new(providers::DryrunCritic::new()),
        };
        Self {
            completer,
            renderer,
            critic,
        }
    }
}

const ANSWER_SYSTEM: &str = "You are a helpful image studio assistant. \
Answer the question in a few sentences without generating an image. \
Respond with JSON: {\"reply\": \"...\"}.";

const ANSWER_FALLBACK: &str =
    "Describe the scene you want and I will draw it; follow up with small \
edits and I will keep the rest of the scene stable.";

/// Orchestrates one session-scoped turn end to end: route, merge, commit,
/// render, critique, correct. Turns within one session are serialized;
/// different sessions run concurrently.
pub struct StudioEngine {
    memory: SessionMemory,
    router: IntentRouter,
    merger: PromptMerger,
    completer: Arc<dyn TextCompleter>,
    renderer: Arc<dyn ImageRenderer>,
    critic: Arc<dyn ImageCritic>,
    feedback_enabled: bool,
    max_retries: u32,
    target_model: TargetModel,
    events: EventWriter,
    cache: RenderCache,
    artifacts_dir: PathBuf,
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl StudioEngine {
    /// `root` receives sessions/, artifacts/, render_cache.json and
    /// events.jsonl.
    pub fn new(
        root: impl Into<PathBuf>,
        config: &EngineConfig,
        providers: EngineProviders,
        target_model: TargetModel,
    ) -> Self {
        let root = root.into();
        let memory = SessionMemory::new(
            Box::new(JsonSessionStore::new(root.join("sessions"))),
            config.max_history_depth,
        );
        Self {
            memory,
            router: IntentRouter::new(Some(providers.completer.clone())),
            merger: PromptMerger::new(providers.completer.clone(), target_model),
            completer: providers.completer,
            renderer: providers.renderer,
            critic: providers.critic,
            feedback_enabled: config.visual_feedback.enabled,
            max_retries: config.visual_feedback.max_retries,
            target_model,
            events: EventWriter::new(root.join("events.jsonl")),
            cache: RenderCache::new(root.join("render_cache.json")),
            artifacts_dir: root.join("artifacts"),
            locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn memory(&self) -> &SessionMemory {
        &self.memory
    }

    pub fn target_model(&self) -> TargetModel {
        self.target_model
    }

    pub fn feedback_enabled(&self) -> bool {
        self.feedback_enabled
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    pub fn set_feedback_enabled(&mut self, enabled: bool) {
        self.feedback_enabled = enabled;
    }

    pub fn set_max_retries(&mut self, retries: u32) {
        self.max_retries = retries;
    }

    /// Dialect for subsequent new scenes; the committed prompt of an
    /// existing session keeps its own target.
    pub fn set_target_model(&mut self, target_model: TargetModel) {
        self.target_model = target_model;
        self.merger = PromptMerger::new(self.completer.clone(), target_model);
    }

    pub fn handle_turn(
        &self,
        session_id: &str,
        user_text: &str,
        cancel: &CancelFlag,
    ) -> Result<TurnOutcome> {
        let lock = self.session_lock(session_id)?;
        let _guard = lock
            .lock()
            .map_err(|_| EngineError::Storage("session turn lock poisoned".to_string()))?;

        self.emit(
            session_id,
            "turn_started",
            payload(&[("user_chars", Value::from(user_text.chars().count()))]),
        );

        let (current, turns) = self.memory.get_context(session_id)?;
        let intent = self.router.classify(user_text, current.is_some());
        self.emit(
            session_id,
            "intent_classified",
            payload(&[("intent", Value::String(intent.as_str().to_string()))]),
        );

        match intent {
            Intent::Question => self.handle_question(session_id, user_text, &turns, &current),
            Intent::NewScene => {
                self.handle_generation(session_id, user_text, MergeIntent::NewScene, None, cancel)
            }
            Intent::Edit => self.handle_generation(
                session_id,
                user_text,
                MergeIntent::Edit,
                current.as_ref(),
                cancel,
            ),
        }
    }

    fn handle_question(
        &self,
        session_id: &str,
        user_text: &str,
        turns: &[Turn],
        current: &Option<PromptSpec>,
    ) -> Result<TurnOutcome> {
        let reply = self.answer(user_text, turns);
        self.memory.commit(session_id, Turn::user(user_text), None)?;
        self.memory
            .commit(session_id, Turn::agent(reply.clone(), None), None)?;
        self.emit(
            session_id,
            "turn_finished",
            payload(&[
                ("intent", Value::String("question".to_string())),
                (
                    "prompt_version",
                    current
                        .as_ref()
                        .map(|prompt| Value::from(prompt.version))
                        .unwrap_or(Value::Null),
                ),
            ]),
        );
        Ok(TurnOutcome::Answered { reply })
    }

    fn handle_generation(
        &self,
        session_id: &str,
        user_text: &str,
        intent: MergeIntent,
        current: Option<&PromptSpec>,
        cancel: &CancelFlag,
    ) -> Result<TurnOutcome> {
        // A cancelled turn must leave no partial commit behind; the prior
        // committed state is the rollback point.
        if cancel.is_cancelled() {
            return Err(anyhow!("turn cancelled; session state unchanged"));
        }
        let (_, turns) = self.memory.get_context(session_id)?;
        let candidate = self.merger.merge(current, intent, user_text, &turns)?;
        if cancel.is_cancelled() {
            return Err(anyhow!("turn cancelled during merge; candidate discarded"));
        }
        let state = self
            .memory
            .commit(session_id, Turn::user(user_text), Some(candidate))?;
        let committed = state
            .current_prompt
            .clone()
            .ok_or_else(|| anyhow!("commit returned no prompt"))?;
        self.emit(
            session_id,
            "prompt_committed",
            payload(&[
                ("version", Value::from(committed.version)),
                ("prompt", Value::String(committed.render_text())),
            ]),
        );

        if cancel.is_cancelled() {
            return Err(anyhow!(
                "turn cancelled before render; prompt v{} stays committed",
                committed.version
            ));
        }
        let image = self.render_with_cache(session_id, &committed)?;

        let loop_runner = FeedbackLoop::new(self.feedback_enabled, self.max_retries);
        let mut hooks = TurnHooks {
            engine: self,
            session_id,
            cancel,
        };
        let outcome = loop_runner.run(
            self.critic.as_ref(),
            &mut hooks,
            image,
            committed,
            user_text,
            cancel,
        )?;
        self.emit(
            session_id,
            "critique_completed",
            payload(&[
                ("pass", Value::Bool(outcome.verdict.pass)),
                (
                    "unmet_constraints",
                    Value::from(outcome.verdict.unmet_constraints.clone()),
                ),
                ("corrective_rounds", Value::from(outcome.corrective_rounds)),
            ]),
        );

        let summary = turn_summary(&outcome.prompt, &outcome.verdict, outcome.resolved);
        self.memory.commit(
            session_id,
            Turn::agent(summary, Some(outcome.prompt.version)),
            None,
        )?;
        self.emit(
            session_id,
            "turn_finished",
            payload(&[
                ("intent", Value::String(intent_label(intent).to_string())),
                ("prompt_version", Value::from(outcome.prompt.version)),
                ("resolved", Value::Bool(outcome.resolved)),
            ]),
        );

        Ok(TurnOutcome::Generated {
            prompt: outcome.prompt,
            image: outcome.image,
            verdict: outcome.verdict,
            resolved: outcome.resolved,
            corrective_rounds: outcome.corrective_rounds,
        })
    }

    /// Renders through the content-addressed artifact cache. Identical
    /// prompt text against the same backend and dialect reuses the cached
    /// artifact instead of calling the backend again.
    fn render_with_cache(&self, session_id: &str, prompt: &PromptSpec) -> Result<RenderedImage> {
        let key = render_cache_key(
            self.renderer.name(),
            prompt.target_model.as_str(),
            &prompt.render_text(),
        );

        if let Some(entry) = self.cache.get(&key) {
            if let Some(path) = entry.get("artifact_path").and_then(Value::as_str) {
                if let Ok(bytes) = std::fs::read(path) {
                    self.emit(
                        session_id,
                        "render_cached",
                        payload(&[
                            ("cache_key", Value::String(key.clone())),
                            ("artifact_path", Value::String(path.to_string())),
                        ]),
                    );
                    return Ok(RenderedImage {
                        bytes,
                        metadata: entry,
                    });
                }
            }
        }

        let rendered = self.renderer.render(prompt)?;
        std::fs::create_dir_all(&self.artifacts_dir)
            .map_err(|err| EngineError::Storage(format!("create artifacts dir: {err}")))?;
        let artifact_path = self.artifacts_dir.join(format!("{key}.png"));
        std::fs::write(&artifact_path, &rendered.bytes)
            .map_err(|err| EngineError::Storage(format!("write artifact: {err}")))?;

        let mut metadata = rendered.metadata;
        metadata.insert(
            "artifact_path".to_string(),
            Value::String(artifact_path.to_string_lossy().into_owned()),
        );
        metadata.insert("cache_key".to_string(), Value::String(key.clone()));
        self.cache.set(&key, metadata.clone())?;

        self.emit(
            session_id,
            "render_completed",
            payload(&[
                ("cache_key", Value::String(key)),
                (
                    "backend",
                    Value::String(self.renderer.name().to_string()),
                ),
                ("prompt_version", Value::from(prompt.version)),
            ]),
        );
        Ok(RenderedImage {
            bytes: rendered.bytes,
            metadata,
        })
    }

    fn answer(&self, user_text: &str, turns: &[Turn]) -> String {
        let history: Vec<Value> = turns
            .iter()
            .map(|turn| serde_json::json!({ "role": turn.role, "text": turn.text }))
            .collect();
        let context = serde_json::json!({
            "task": "answer",
            "user_text": user_text,
            "history": history,
        });
        self.completer
            .complete(ANSWER_SYSTEM, &context)
            .ok()
            .and_then(|payload| {
                payload
                    .get("reply")
                    .and_then(Value::as_str)
                    .map(str::to_string)
            })
            .unwrap_or_else(|| ANSWER_FALLBACK.to_string())
    }

    fn session_lock(&self, session_id: &str) -> Result<Arc<Mutex<()>>> {
        let mut locks = self
            .locks
            .lock()
            .map_err(|_| EngineError::Storage("session lock table poisoned".to_string()))?;
        Ok(locks.entry(session_id.to_string()).or_default().clone())
    }

    // Observability must never take a turn down with it.
    fn emit(&self, session_id: &str, event_type: &str, extra: EventPayload) {
        let _ = self.events.emit(event_type, session_id, extra);
    }
}

/// Feedback-loop side effects backed by the live engine: corrections go
/// through the merger and are committed, renders go through the cache.
struct TurnHooks<'a> {
    engine: &'a StudioEngine,
    session_id: &'a str,
    cancel: &'a CancelFlag,
}

impl FeedbackHooks for TurnHooks<'_> {
    fn apply_correction(&mut self, instruction: &str) -> Result<PromptSpec> {
        let (current, turns) = self.engine.memory.get_context(self.session_id)?;
        let current = current.ok_or_else(|| anyhow!("no committed prompt to correct"))?;
        let candidate =
            self.engine
                .merger
                .merge(Some(&current), MergeIntent::Edit, instruction, &turns)?;
        if self.cancel.is_cancelled() {
            return Err(anyhow!(
                "turn cancelled during correction; candidate discarded"
            ));
        }
        let state = self.engine.memory.commit(
            self.session_id,
            Turn::agent("corrective re-render", None),
            Some(candidate),
        )?;
        let committed = state
            .current_prompt
            .ok_or_else(|| anyhow!("correction commit returned no prompt"))?;
        self.engine.emit(
            self.session_id,
            "correction_applied",
            payload(&[("version", Value::from(committed.version))]),
        );
        Ok(committed)
    }

    fn render(&mut self, prompt: &PromptSpec) -> Result<RenderedImage> {
        self.engine.render_with_cache(self.session_id, prompt)
    }

    fn mark_satisfied(&mut self, keys: &[String]) -> Result<PromptSpec> {
        self.engine
            .memory
            .mark_constraints_satisfied(self.session_id, keys)?
            .ok_or_else(|| anyhow!("no committed prompt to mark"))
    }
}

fn intent_label(intent: MergeIntent) -> &'static str {
    match intent {
        MergeIntent::NewScene => "new_scene",
        MergeIntent::Edit => "edit",
    }
}

fn turn_summary(prompt: &PromptSpec, verdict: &FeedbackVerdict, resolved: bool) -> String {
    if resolved {
        format!("rendered prompt v{}", prompt.version)
    } else {
        format!(
            "rendered prompt v{} with unmet constraints [{}]: {}",
            prompt.version,
            verdict.unmet_constraints.join(", "),
            verdict.rationale,
        )
    }
}

fn payload(entries: &[(&str, Value)]) -> EventPayload {
    let mut map = EventPayload::new();
    for (key, value) in entries {
        map.insert((*key).to_string(), value.clone());
    }
    map
}
