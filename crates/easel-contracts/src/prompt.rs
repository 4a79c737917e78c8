use chrono::{SecondsFormat, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

/// Prompt dialect of the rendering backend. Affects formatting only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetModel {
    Sdxl,
    GptImage,
    Flux,
}

impl TargetModel {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "sdxl" => Some(Self::Sdxl),
            "gpt-image" | "gpt_image" | "gptimage" => Some(Self::GptImage),
            "flux" => Some(Self::Flux),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Sdxl => "sdxl",
            Self::GptImage => "gpt-image",
            Self::Flux => "flux",
        }
    }
}

/// One checkable visual requirement, e.g. `balloon_color -> red`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Constraint {
    pub value: String,
    #[serde(default)]
    pub satisfied: bool,
}

impl Constraint {
    pub fn unsatisfied(value: impl Into<String>) -> Self {
        Self {
            value: value.into(),
            satisfied: false,
        }
    }
}

/// Structured representation of "what to draw".
///
/// A spec is immutable once created: edits produce a new instance so every
/// prior version stays inspectable. `version` is 0 on an uncommitted
/// candidate and is assigned by `SessionMemory::commit`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PromptSpec {
    pub positive_terms: Vec<String>,
    pub negative_terms: Vec<String>,
    pub constraints_checklist: IndexMap<String, Constraint>,
    pub target_model: TargetModel,
    pub version: u64,
}

impl PromptSpec {
    pub fn candidate(
        positive_terms: Vec<String>,
        negative_terms: Vec<String>,
        constraints_checklist: IndexMap<String, Constraint>,
        target_model: TargetModel,
    ) -> Self {
        Self {
            positive_terms,
            negative_terms,
            constraints_checklist,
            target_model,
            version: 0,
        }
    }

    pub fn with_version(&self, version: u64) -> Self {
        let mut next = self.clone();
        next.version = version;
        next
    }

    pub fn with_constraints_satisfied(&self, keys: &[String]) -> Self {
        let mut next = self.clone();
        for key in keys {
            if let Some(entry) = next.constraints_checklist.get_mut(key) {
                entry.satisfied = true;
            }
        }
        next
    }

    pub fn unmet_constraint_keys(&self) -> Vec<String> {
        self.constraints_checklist
            .iter()
            .filter(|(_, entry)| !entry.satisfied)
            .map(|(key, _)| key.clone())
            .collect()
    }

    /// Formats the clause lists for the target backend. Clause order is
    /// preserved in every dialect.
    pub fn render_text(&self) -> String {
        match self.target_model {
            TargetModel::Sdxl => {
                let positive = self.positive_terms.join(", ");
                if self.negative_terms.is_empty() {
                    positive
                } else {
                    format!("{} --no {}", positive, self.negative_terms.join(", "))
                }
            }
            TargetModel::GptImage => {
                let mut sentence = self.positive_terms.join("; ");
                if !sentence.is_empty() && !sentence.ends_with('.') {
                    sentence.push('.');
                }
                if !self.negative_terms.is_empty() {
                    sentence.push_str(&format!(" Avoid: {}.", self.negative_terms.join(", ")));
                }
                sentence
            }
            TargetModel::Flux => self.positive_terms.join(", "),
        }
    }

    pub fn positive_text(&self) -> String {
        self.positive_terms.join(", ")
    }

    pub fn negative_text(&self) -> String {
        self.negative_terms.join(", ")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Agent,
}

/// One half of an exchange. Immutable once appended to a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Turn {
    pub role: Role,
    pub text: String,
    pub ts: String,
    pub resulting_prompt_version: Option<u64>,
}

impl Turn {
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            text: text.into(),
            ts: now_utc_iso(),
            resulting_prompt_version: None,
        }
    }

    pub fn agent(text: impl Into<String>, resulting_prompt_version: Option<u64>) -> Self {
        Self {
            role: Role::Agent,
            text: text.into(),
            ts: now_utc_iso(),
            resulting_prompt_version,
        }
    }
}

/// Result of one critique pass. Ephemeral; never persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeedbackVerdict {
    pub pass: bool,
    pub unmet_constraints: Vec<String>,
    pub rationale: String,
}

impl FeedbackVerdict {
    pub fn passing(rationale: impl Into<String>) -> Self {
        Self {
            pass: true,
            unmet_constraints: Vec::new(),
            rationale: rationale.into(),
        }
    }

    pub fn failing(unmet_constraints: Vec<String>, rationale: impl Into<String>) -> Self {
        Self {
            pass: false,
            unmet_constraints,
            rationale: rationale.into(),
        }
    }

    pub fn disabled() -> Self {
        Self::passing("visual feedback disabled")
    }
}

pub fn now_utc_iso() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, false)
}
