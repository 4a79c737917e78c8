use std::sync::Arc;

use serde_json::{json, Value};

use crate::TextCompleter;

/// Classification of one incoming user turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Intent {
    NewScene,
    Edit,
    Question,
}

impl Intent {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NewScene => "new_scene",
            Self::Edit => "edit",
            Self::Question => "question",
        }
    }
}

const DRAW_VERBS: &[&str] = &[
    "draw", "paint", "render", "generate", "create", "make", "sketch", "show", "give", "depict",
    "illustrate", "add", "change", "remove", "replace", "turn", "swap", "recolor",
];

const INTERROGATIVES: &[&str] = &[
    "how", "what", "why", "when", "where", "which", "who", "is", "are", "do", "does", "can",
    "could", "should", "would",
];

const NEW_SCENE_SIGNALS: &[&str] = &["new", "different", "fresh", "unrelated"];

const CLASSIFY_SYSTEM: &str = "You route requests for an image studio. \
Classify the user text as exactly one of: new_scene (describes a scene to \
draw from scratch), edit (adjusts the current scene), question (requests no \
image at all). Respond with JSON: {\"intent\": \"...\"}.";

/// Classifies user turns. Deterministic rules run first; the classifier
/// collaborator is only consulted for text the rules cannot place, and its
/// answer is constrained so that Edit is impossible without a current
/// prompt. Pure with respect to session state; no side effects.
pub struct IntentRouter {
    classifier: Option<Arc<dyn TextCompleter>>,
}

impl IntentRouter {
    pub fn new(classifier: Option<Arc<dyn TextCompleter>>) -> Self {
        Self { classifier }
    }

    pub fn classify(&self, user_text: &str, has_current_prompt: bool) -> Intent {
        let text = user_text.trim().to_ascii_lowercase();
        if text.is_empty() {
            return Intent::Question;
        }

        let words: Vec<&str> = text
            .split(|ch: char| !ch.is_ascii_alphanumeric())
            .filter(|word| !word.is_empty())
            .collect();
        let has_draw_verb = words.iter().any(|word| DRAW_VERBS.contains(word));
        let question_shaped = text.ends_with('?')
            || words
                .first()
                .map(|word| INTERROGATIVES.contains(word))
                .unwrap_or(false);

        // Cost-control gate: question-shaped text with no generation verb
        // never reaches the merger or the renderer.
        if question_shaped && !has_draw_verb {
            return Intent::Question;
        }

        // Nothing to edit yet, so Edit is impossible by construction.
        if !has_current_prompt {
            return Intent::NewScene;
        }

        if words.iter().any(|word| NEW_SCENE_SIGNALS.contains(word))
            || text.contains("start over")
            || text.contains("from scratch")
        {
            return Intent::NewScene;
        }

        if has_draw_verb {
            // A clear instruction against an existing scene: continuity
            // bias resolves it as an edit without a model call.
            return Intent::Edit;
        }

        self.classify_fallback(&text, has_current_prompt)
            .unwrap_or(Intent::Edit)
    }

    fn classify_fallback(&self, text: &str, has_current_prompt: bool) -> Option<Intent> {
        let classifier = self.classifier.as_ref()?;
        let context = json!({
            "task": "classify",
            "user_text": text,
            "has_current_prompt": has_current_prompt,
        });
        let response = classifier.complete(CLASSIFY_SYSTEM, &context).ok()?;
        match response.get("intent").and_then(Value::as_str) {
            Some("question") => Some(Intent::Question),
            Some("new_scene") => Some(Intent::NewScene),
            Some("edit") if has_current_prompt => Some(Intent::Edit),
            // Anything else resolves through the tie-break, never surfaces.
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use anyhow::Result;
    use serde_json::{json, Value};

    use crate::TextCompleter;

    use super::{Intent, IntentRouter};

    struct FixedClassifier(&'static str);

    impl TextCompleter for FixedClassifier {
        fn name(&self) -> &str {
            "fixed"
        }

        fn complete(&self, _system_instructions: &str, _context: &Value) -> Result<Value> {
            Ok(json!({ "intent": self.0 }))
        }
    }

    #[test]
    fn never_edit_without_current_prompt() {
        let router = IntentRouter::new(None);
        let samples = [
            "change the cat to a dog",
            "make it red",
            "Draw a cyberpunk cat in the rain",
            "add a balloon",
            "something moody",
            "remove the hat",
        ];
        for sample in samples {
            assert_ne!(
                router.classify(sample, false),
                Intent::Edit,
                "sample: {sample}"
            );
        }
    }

    #[test]
    fn classifier_edit_answer_is_constrained_without_prompt() {
        let router = IntentRouter::new(Some(Arc::new(FixedClassifier("edit"))));
        assert_ne!(router.classify("something moody", false), Intent::Edit);
    }

    #[test]
    fn question_turns_are_gated() {
        let router = IntentRouter::new(None);
        assert_eq!(
            router.classify("how do I phrase good prompts?", true),
            Intent::Question
        );
        assert_eq!(
            router.classify("what styles work best for portraits?", false),
            Intent::Question
        );
    }

    #[test]
    fn question_mark_with_draw_verb_still_generates() {
        let router = IntentRouter::new(None);
        assert_eq!(
            router.classify("can you draw a red balloon?", false),
            Intent::NewScene
        );
    }

    #[test]
    fn first_scene_request_is_new_scene() {
        let router = IntentRouter::new(None);
        assert_eq!(
            router.classify("Draw a cyberpunk cat in the rain", false),
            Intent::NewScene
        );
    }

    #[test]
    fn ambiguous_text_with_prompt_biases_to_edit() {
        let router = IntentRouter::new(None);
        assert_eq!(router.classify("moodier, rainier", true), Intent::Edit);
        assert_eq!(router.classify("change the cat to a dog", true), Intent::Edit);
    }

    #[test]
    fn explicit_new_signal_breaks_continuity() {
        let router = IntentRouter::new(None);
        assert_eq!(
            router.classify("give me a completely different scene: a desert", true),
            Intent::NewScene
        );
        assert_eq!(router.classify("start over with a forest", true), Intent::NewScene);
    }

    #[test]
    fn classifier_fallback_is_used_for_unplaced_text() {
        let router = IntentRouter::new(Some(Arc::new(FixedClassifier("question"))));
        assert_eq!(router.classify("hmm not sure about this", true), Intent::Question);
    }
}
