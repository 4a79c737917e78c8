use thiserror::Error;

/// Typed failures that cross component boundaries.
///
/// Anything retryable is retried silently inside the component that owns
/// it; only exhausted retries surface one of these. Routing ambiguity and
/// an exhausted feedback budget are terminal outcomes, not errors, so they
/// have no variant here.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("session storage failed ({0}); the last committed state is preserved")]
    Storage(String),
    #[error("completion output did not match the prompt schema: {0}")]
    MergeParse(String),
    #[error("render backend failed ({0}); the committed prompt is preserved")]
    Render(String),
}
