use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::Result;

use easel_contracts::prompt::{FeedbackVerdict, PromptSpec};

use crate::{ImageCritic, RenderedImage};

/// Caller-supplied cancellation signal, checked before every render and
/// critique call.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// States of one critique-and-correct cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    Rendered,
    Critiqued,
    Correcting,
    Satisfied,
    Exhausted,
}

/// Terminal result of the loop. `resolved = false` is a valid outcome
/// carrying the last rendered image and its verdict, never an error.
#[derive(Debug)]
pub struct FeedbackOutcome {
    pub image: RenderedImage,
    pub prompt: PromptSpec,
    pub verdict: FeedbackVerdict,
    pub resolved: bool,
    pub corrective_rounds: u32,
}

/// Side effects the loop drives but does not own. The orchestrator backs
/// these with the merger, the renderer and session memory; tests back them
/// with scripted stand-ins so the state machine is exercised without any
/// network call.
pub trait FeedbackHooks {
    /// Routes a corrective instruction through the merger as an edit and
    /// commits the result. Returns the newly committed spec.
    fn apply_correction(&mut self, instruction: &str) -> Result<PromptSpec>;

    fn render(&mut self, prompt: &PromptSpec) -> Result<RenderedImage>;

    /// Marks checklist entries satisfied on the committed spec.
    fn mark_satisfied(&mut self, keys: &[String]) -> Result<PromptSpec>;
}

pub struct FeedbackLoop {
    enabled: bool,
    max_retries: u32,
}

impl FeedbackLoop {
    pub fn new(enabled: bool, max_retries: u32) -> Self {
        Self {
            enabled,
            max_retries,
        }
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    /// Runs the cycle to a terminal state, starting from a freshly rendered
    /// image. Performs at most `max_retries` corrective re-renders.
    pub fn run(
        &self,
        critic: &dyn ImageCritic,
        hooks: &mut dyn FeedbackHooks,
        first_image: RenderedImage,
        committed: PromptSpec,
        user_text: &str,
        cancel: &CancelFlag,
    ) -> Result<FeedbackOutcome> {
        let mut image = first_image;
        let mut prompt = committed;
        let mut verdict = FeedbackVerdict::disabled();
        let mut rounds: u32 = 0;

        if !self.enabled {
            let keys = prompt.unmet_constraint_keys();
            prompt = hooks.mark_satisfied(&keys)?;
            return Ok(FeedbackOutcome {
                image,
                prompt,
                verdict,
                resolved: true,
                corrective_rounds: 0,
            });
        }

        let mut state = LoopState::Rendered;
        loop {
            state = match state {
                LoopState::Rendered => {
                    if cancel.is_cancelled() {
                        verdict =
                            FeedbackVerdict::failing(Vec::new(), "cancelled before inspection");
                        LoopState::Exhausted
                    } else {
                        verdict = match critic.critique(
                            &image.bytes,
                            &prompt.constraints_checklist,
                            user_text,
                        ) {
                            Ok(verdict) => verdict,
                            // An unavailable critic must not block delivery
                            // of an already rendered image.
                            Err(err) => {
                                FeedbackVerdict::passing(format!("inspection unavailable: {err:#}"))
                            }
                        };
                        LoopState::Critiqued
                    }
                }
                LoopState::Critiqued => {
                    if verdict.pass || verdict.unmet_constraints.is_empty() {
                        LoopState::Satisfied
                    } else if rounds < self.max_retries {
                        LoopState::Correcting
                    } else {
                        LoopState::Exhausted
                    }
                }
                LoopState::Correcting => {
                    // Cancellation during the critique call lands here;
                    // bail out before any correction is committed.
                    if cancel.is_cancelled() {
                        LoopState::Exhausted
                    } else {
                        rounds += 1;
                        let instruction = correction_instruction(&prompt, &verdict);
                        prompt = hooks.apply_correction(&instruction)?;
                        if cancel.is_cancelled() {
                            LoopState::Exhausted
                        } else {
                            match hooks.render(&prompt) {
                                Ok(next) => {
                                    image = next;
                                    LoopState::Rendered
                                }
                                // Corrective render failed: the previous
                                // image is still the best available result.
                                Err(_) => LoopState::Exhausted,
                            }
                        }
                    }
                }
                LoopState::Satisfied => {
                    let keys = prompt.unmet_constraint_keys();
                    prompt = hooks.mark_satisfied(&keys)?;
                    return Ok(FeedbackOutcome {
                        image,
                        prompt,
                        verdict,
                        resolved: true,
                        corrective_rounds: rounds,
                    });
                }
                LoopState::Exhausted => {
                    return Ok(FeedbackOutcome {
                        image,
                        prompt,
                        verdict,
                        resolved: false,
                        corrective_rounds: rounds,
                    });
                }
            };
        }
    }
}

/// Targeted reinforcement of exactly the unmet constraints, not a rewrite.
fn correction_instruction(prompt: &PromptSpec, verdict: &FeedbackVerdict) -> String {
    let pairs: Vec<String> = verdict
        .unmet_constraints
        .iter()
        .map(|key| {
            prompt
                .constraints_checklist
                .get(key)
                .map(|entry| format!("{key}={}", entry.value))
                .unwrap_or_else(|| key.clone())
        })
        .collect();
    format!(
        "The previous image failed visual inspection. Reason: {}. Keep the \
established scene and style, with strong emphasis on including: {}.",
        verdict.rationale,
        pairs.join(", "),
    )
}

#[cfg(test)]
mod tests {
    use anyhow::{bail, Result};
    use indexmap::IndexMap;
    use serde_json::Map;

    use easel_contracts::prompt::{
        Constraint, FeedbackVerdict, PromptSpec, TargetModel,
    };

    use crate::{ImageCritic, RenderedImage};

    use super::{correction_instruction, CancelFlag, FeedbackHooks, FeedbackLoop};

    fn spec() -> PromptSpec {
        let mut checklist = IndexMap::new();
        checklist.insert("subject".to_string(), Constraint::unsatisfied("cat"));
        checklist.insert("weather".to_string(), Constraint::unsatisfied("rain"));
        PromptSpec::candidate(
            vec!["cat".to_string(), "rain".to_string()],
            vec![],
            checklist,
            TargetModel::Sdxl,
        )
        .with_version(1)
    }

    fn image(tag: &str) -> RenderedImage {
        RenderedImage {
            bytes: tag.as_bytes().to_vec(),
            metadata: Map::new(),
        }
    }

    struct ScriptedCritic {
        verdicts: std::sync::Mutex<Vec<FeedbackVerdict>>,
    }

    impl ScriptedCritic {
        fn new(verdicts: Vec<FeedbackVerdict>) -> Self {
            Self {
                verdicts: std::sync::Mutex::new(verdicts),
            }
        }
    }

    impl ImageCritic for ScriptedCritic {
        fn name(&self) -> &str {
            "scripted"
        }

        fn critique(
            &self,
            _image: &[u8],
            _checklist: &IndexMap<String, Constraint>,
            _original_user_text: &str,
        ) -> Result<FeedbackVerdict> {
            let mut verdicts = self
                .verdicts
                .lock()
                .map_err(|_| anyhow::anyhow!("scripted critic lock poisoned"))?;
            if verdicts.is_empty() {
                bail!("no scripted verdict left");
            }
            Ok(verdicts.remove(0))
        }
    }

    #[derive(Default)]
    struct RecordingHooks {
        corrections: Vec<String>,
        renders: u32,
        version: u64,
        fail_render: bool,
    }

    impl RecordingHooks {
        fn with_version(version: u64) -> Self {
            Self {
                version,
                ..Self::default()
            }
        }
    }

    impl FeedbackHooks for RecordingHooks {
        fn apply_correction(&mut self, instruction: &str) -> Result<PromptSpec> {
            self.corrections.push(instruction.to_string());
            self.version += 1;
            Ok(spec().with_version(self.version))
        }

        fn render(&mut self, _prompt: &PromptSpec) -> Result<RenderedImage> {
            if self.fail_render {
                bail!("render backend down");
            }
            self.renders += 1;
            Ok(image(&format!("render-{}", self.renders)))
        }

        fn mark_satisfied(&mut self, keys: &[String]) -> Result<PromptSpec> {
            Ok(spec().with_constraints_satisfied(keys))
        }
    }

    fn failing_verdict() -> FeedbackVerdict {
        FeedbackVerdict::failing(vec!["weather".to_string()], "no rain visible")
    }

    #[test]
    fn disabled_loop_terminates_satisfied_immediately() -> Result<()> {
        let critic = ScriptedCritic::new(vec![failing_verdict()]);
        let mut hooks = RecordingHooks::with_version(1);
        let outcome = FeedbackLoop::new(false, 3).run(
            &critic,
            &mut hooks,
            image("first"),
            spec(),
            "a cat in the rain",
            &CancelFlag::new(),
        )?;
        assert!(outcome.resolved);
        assert_eq!(outcome.corrective_rounds, 0);
        assert_eq!(hooks.renders, 0);
        assert!(hooks.corrections.is_empty());
        assert!(outcome.verdict.pass);
        Ok(())
    }

    #[test]
    fn passing_verdict_marks_constraints_satisfied() -> Result<()> {
        let critic = ScriptedCritic::new(vec![FeedbackVerdict::passing("looks right")]);
        let mut hooks = RecordingHooks::with_version(1);
        let outcome = FeedbackLoop::new(true, 2).run(
            &critic,
            &mut hooks,
            image("first"),
            spec(),
            "a cat in the rain",
            &CancelFlag::new(),
        )?;
        assert!(outcome.resolved);
        assert!(outcome.prompt.constraints_checklist["weather"].satisfied);
        assert!(outcome.prompt.constraints_checklist["subject"].satisfied);
        assert_eq!(outcome.corrective_rounds, 0);
        Ok(())
    }

    #[test]
    fn persistent_failure_stops_after_retry_budget() -> Result<()> {
        let critic = ScriptedCritic::new(vec![
            failing_verdict(),
            failing_verdict(),
            failing_verdict(),
        ]);
        let mut hooks = RecordingHooks::with_version(1);
        let outcome = FeedbackLoop::new(true, 2).run(
            &critic,
            &mut hooks,
            image("first"),
            spec(),
            "a cat in the rain",
            &CancelFlag::new(),
        )?;
        assert!(!outcome.resolved);
        assert_eq!(outcome.corrective_rounds, 2);
        assert_eq!(hooks.renders, 2);
        assert_eq!(outcome.image.bytes, b"render-2".to_vec());
        assert!(!outcome.verdict.pass);
        Ok(())
    }

    #[test]
    fn recovery_after_one_correction() -> Result<()> {
        let critic = ScriptedCritic::new(vec![
            failing_verdict(),
            FeedbackVerdict::passing("rain present now"),
        ]);
        let mut hooks = RecordingHooks::with_version(1);
        let outcome = FeedbackLoop::new(true, 2).run(
            &critic,
            &mut hooks,
            image("first"),
            spec(),
            "a cat in the rain",
            &CancelFlag::new(),
        )?;
        assert!(outcome.resolved);
        assert_eq!(outcome.corrective_rounds, 1);
        assert_eq!(hooks.corrections.len(), 1);
        assert!(hooks.corrections[0].contains("weather=rain"));
        Ok(())
    }

    #[test]
    fn zero_budget_returns_exhausted_without_correction() -> Result<()> {
        let critic = ScriptedCritic::new(vec![failing_verdict()]);
        let mut hooks = RecordingHooks::with_version(1);
        let outcome = FeedbackLoop::new(true, 0).run(
            &critic,
            &mut hooks,
            image("first"),
            spec(),
            "a cat in the rain",
            &CancelFlag::new(),
        )?;
        assert!(!outcome.resolved);
        assert_eq!(outcome.corrective_rounds, 0);
        assert!(hooks.corrections.is_empty());
        assert_eq!(outcome.image.bytes, b"first".to_vec());
        Ok(())
    }

    #[test]
    fn cancellation_aborts_with_last_good_image() -> Result<()> {
        let critic = ScriptedCritic::new(vec![failing_verdict()]);
        let mut hooks = RecordingHooks::with_version(1);
        let cancel = CancelFlag::new();
        cancel.cancel();
        let outcome = FeedbackLoop::new(true, 2).run(
            &critic,
            &mut hooks,
            image("first"),
            spec(),
            "a cat in the rain",
            &cancel,
        )?;
        assert!(!outcome.resolved);
        assert_eq!(outcome.image.bytes, b"first".to_vec());
        assert_eq!(hooks.renders, 0);
        Ok(())
    }

    struct CancellingCritic {
        cancel: CancelFlag,
    }

    impl ImageCritic for CancellingCritic {
        fn name(&self) -> &str {
            "cancelling"
        }

        fn critique(
            &self,
            _image: &[u8],
            _checklist: &IndexMap<String, Constraint>,
            _original_user_text: &str,
        ) -> Result<FeedbackVerdict> {
            self.cancel.cancel();
            Ok(failing_verdict())
        }
    }

    #[test]
    fn cancellation_during_critique_commits_no_correction() -> Result<()> {
        let cancel = CancelFlag::new();
        let critic = CancellingCritic {
            cancel: cancel.clone(),
        };
        let mut hooks = RecordingHooks::with_version(1);
        let outcome = FeedbackLoop::new(true, 2).run(
            &critic,
            &mut hooks,
            image("first"),
            spec(),
            "a cat in the rain",
            &cancel,
        )?;
        assert!(!outcome.resolved);
        assert_eq!(outcome.corrective_rounds, 0);
        assert!(hooks.corrections.is_empty());
        assert_eq!(hooks.renders, 0);
        assert_eq!(outcome.image.bytes, b"first".to_vec());
        Ok(())
    }

    #[test]
    fn corrective_render_failure_keeps_previous_image() -> Result<()> {
        let critic = ScriptedCritic::new(vec![failing_verdict()]);
        let mut hooks = RecordingHooks::with_version(1);
        hooks.fail_render = true;
        let outcome = FeedbackLoop::new(true, 2).run(
            &critic,
            &mut hooks,
            image("first"),
            spec(),
            "a cat in the rain",
            &CancelFlag::new(),
        )?;
        assert!(!outcome.resolved);
        assert_eq!(outcome.corrective_rounds, 1);
        assert_eq!(outcome.image.bytes, b"first".to_vec());
        Ok(())
    }

    #[test]
    fn critic_failure_passes_with_caveat() -> Result<()> {
        struct BrokenCritic;
        impl ImageCritic for BrokenCritic {
            fn name(&self) -> &str {
                "broken"
            }
            fn critique(
                &self,
                _image: &[u8],
                _checklist: &IndexMap<String, Constraint>,
                _original_user_text: &str,
            ) -> Result<FeedbackVerdict> {
                bail!("vlm offline")
            }
        }
        let mut hooks = RecordingHooks::with_version(1);
        let outcome = FeedbackLoop::new(true, 2).run(
            &BrokenCritic,
            &mut hooks,
            image("first"),
            spec(),
            "a cat in the rain",
            &CancelFlag::new(),
        )?;
        assert!(outcome.resolved);
        assert!(outcome.verdict.rationale.contains("inspection unavailable"));
        Ok(())
    }

    #[test]
    fn correction_instruction_names_only_unmet_pairs() {
        let instruction = correction_instruction(&spec(), &failing_verdict());
        assert!(instruction.contains("weather=rain"));
        assert!(!instruction.contains("subject=cat"));
        assert!(instruction.contains("no rain visible"));
    }
}
