use std::sync::Arc;

use anyhow::Result;
use indexmap::IndexMap;
use serde::Deserialize;
use serde_json::{json, Value};

use easel_contracts::error::EngineError;
use easel_contracts::prompt::{Constraint, PromptSpec, TargetModel, Turn};

use crate::TextCompleter;

/// Merge flavor. Question turns never reach this component.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeIntent {
    NewScene,
    Edit,
}

impl MergeIntent {
    fn as_str(&self) -> &'static str {
        match self {
            Self::NewScene => "new_scene",
            Self::Edit => "edit",
        }
    }
}

const MERGE_SYSTEM: &str = "You are an expert image prompt engineer with \
persistent memory. Turn the user instruction into a structured prompt. For \
an edit, keep every clause of the current prompt that the instruction does \
not touch and apply the smallest change set that satisfies it. Constraints \
are only concrete, visually checkable attributes (named objects, colors, \
counts); never vague qualifiers. Respond with JSON: {\"positive\": \
[clauses...], \"negative\": [clauses...], \"constraints\": {key: value}}.";

const MAX_PARSE_RETRIES: u32 = 2;

/// Qualifiers that cannot be visually verified and therefore never become
/// checklist entries, even when the model emits them.
const VAGUE_QUALIFIERS: &[&str] = &[
    "nice", "cool", "beautiful", "pretty", "good", "great", "awesome", "amazing", "epic",
    "interesting", "lovely", "stunning", "perfect",
];

/// Completion payload shape; anything that does not parse into this is a
/// merge-parse failure, not a best-effort extraction.
#[derive(Debug, Deserialize)]
struct MergeResponse {
    positive: Vec<String>,
    #[serde(default)]
    negative: Vec<String>,
    #[serde(default)]
    constraints: IndexMap<String, String>,
}

/// Produces the next `PromptSpec` candidate from the current one plus one
/// user instruction. Versions are assigned later, at commit; a failed merge
/// therefore never consumes a version number or touches committed state.
pub struct PromptMerger {
    completer: Arc<dyn TextCompleter>,
    default_target: TargetModel,
}

impl PromptMerger {
    pub fn new(completer: Arc<dyn TextCompleter>, default_target: TargetModel) -> Self {
        Self {
            completer,
            default_target,
        }
    }

    pub fn merge(
        &self,
        current: Option<&PromptSpec>,
        intent: MergeIntent,
        user_text: &str,
        history: &[Turn],
    ) -> Result<PromptSpec> {
        let context = self.merge_context(current, intent, user_text, history);
        let response = self.complete_validated(&context)?;

        let target = current
            .map(|spec| spec.target_model)
            .unwrap_or(self.default_target);
        let candidate = match (intent, current) {
            (MergeIntent::Edit, Some(prior)) => {
                merge_edit(prior, &response, user_text, target)
            }
            _ => merge_fresh(&response, target),
        };
        Ok(candidate)
    }

    fn merge_context(
        &self,
        current: Option<&PromptSpec>,
        intent: MergeIntent,
        user_text: &str,
        history: &[Turn],
    ) -> Value {
        let history: Vec<Value> = history
            .iter()
            .map(|turn| json!({ "role": turn.role, "text": turn.text }))
            .collect();
        json!({
            "task": "merge",
            "intent": intent.as_str(),
            "user_text": user_text,
            "current_prompt": current.map(|spec| json!({
                "positive": spec.positive_terms,
                "negative": spec.negative_terms,
                "constraints": spec.constraints_checklist.iter()
                    .map(|(key, entry)| (key.clone(), Value::String(entry.value.clone())))
                    .collect::<serde_json::Map<String, Value>>(),
            })),
            "history": history,
        })
    }

    fn complete_validated(&self, context: &Value) -> Result<MergeResponse> {
        let mut last_error = String::new();
        for _attempt in 0..=MAX_PARSE_RETRIES {
            let payload = match self.completer.complete(MERGE_SYSTEM, context) {
                Ok(payload) => payload,
                Err(err) => {
                    last_error = format!("completion call failed: {err:#}");
                    continue;
                }
            };
            match serde_json::from_value::<MergeResponse>(payload) {
                Ok(response) if !response.positive.is_empty() => return Ok(response),
                Ok(_) => last_error = "empty positive clause list".to_string(),
                Err(err) => last_error = err.to_string(),
            }
        }
        Err(EngineError::MergeParse(last_error).into())
    }
}

fn merge_fresh(response: &MergeResponse, target: TargetModel) -> PromptSpec {
    let positive = dedup_clauses(&response.positive);
    let negative = dedup_clauses(&response.negative);
    let mut checklist = IndexMap::new();
    for (key, value) in &response.constraints {
        if is_checkable(key, value) {
            checklist.insert(key.clone(), Constraint::unsatisfied(value.clone()));
        }
    }
    PromptSpec::candidate(positive, negative, checklist, target)
}

/// Edit merges preserve every untouched prior clause even when the model
/// silently drops one: a prior clause absent from the response is restored
/// unless the edit text actually mentions it.
fn merge_edit(
    prior: &PromptSpec,
    response: &MergeResponse,
    user_text: &str,
    target: TargetModel,
) -> PromptSpec {
    let fresh = merge_fresh(response, target);

    let mut positive: Vec<String> = Vec::new();
    for clause in &prior.positive_terms {
        if fresh.positive_terms.contains(clause) || !clause_mentioned(user_text, clause) {
            positive.push(clause.clone());
        }
    }
    for clause in &fresh.positive_terms {
        if !positive.contains(clause) {
            positive.push(clause.clone());
        }
    }

    let mut negative: Vec<String> = Vec::new();
    for clause in &prior.negative_terms {
        if fresh.negative_terms.contains(clause) || !clause_mentioned(user_text, clause) {
            negative.push(clause.clone());
        }
    }
    for clause in &fresh.negative_terms {
        if !negative.contains(clause) {
            negative.push(clause.clone());
        }
    }

    // Unaffected entries carry over with the satisfied flag reset: a new
    // render has not been checked against them yet.
    let mut checklist: IndexMap<String, Constraint> = IndexMap::new();
    for (key, entry) in &prior.constraints_checklist {
        checklist.insert(key.clone(), Constraint::unsatisfied(entry.value.clone()));
    }
    for (key, entry) in &fresh.constraints_checklist {
        checklist.insert(key.clone(), entry.clone());
    }

    PromptSpec::candidate(positive, negative, checklist, target)
}

fn dedup_clauses(clauses: &[String]) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for clause in clauses {
        let trimmed = clause.trim();
        if trimmed.is_empty() {
            continue;
        }
        if !out.iter().any(|existing| existing == trimmed) {
            out.push(trimmed.to_string());
        }
    }
    out
}

fn is_checkable(key: &str, value: &str) -> bool {
    let value = value.trim().to_ascii_lowercase();
    if value.is_empty() {
        return false;
    }
    let single_vague =
        value.split_whitespace().count() == 1 && VAGUE_QUALIFIERS.contains(&value.as_str());
    !single_vague && !VAGUE_QUALIFIERS.contains(&key.trim().to_ascii_lowercase().as_str())
}

const STOPWORDS: &[&str] = &[
    "the", "a", "an", "in", "on", "at", "of", "and", "or", "with", "without", "to", "into",
    "for", "it", "its", "this", "that", "make", "more", "less",
];

/// True when any significant word of the clause appears in the edit text.
pub(crate) fn clause_mentioned(user_text: &str, clause: &str) -> bool {
    let text = user_text.to_ascii_lowercase();
    let text_words: Vec<&str> = text
        .split(|ch: char| !ch.is_ascii_alphanumeric())
        .filter(|word| !word.is_empty())
        .collect();
    clause
        .to_ascii_lowercase()
        .split(|ch: char| !ch.is_ascii_alphanumeric())
        .filter(|word| word.len() > 2 && !STOPWORDS.contains(word))
        .any(|word| text_words.contains(&word))
}
