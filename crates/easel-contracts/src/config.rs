use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Configuration values consumed by the core. Loading beyond "read a JSON
/// file" is the caller's concern.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub max_history_depth: usize,
    pub visual_feedback: VisualFeedback,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VisualFeedback {
    pub enabled: bool,
    pub max_retries: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_history_depth: 10,
            visual_feedback: VisualFeedback::default(),
        }
    }
}

impl Default for VisualFeedback {
    fn default() -> Self {
        Self {
            enabled: true,
            max_retries: 1,
        }
    }
}

impl EngineConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("read config {}", path.display()))?;
        let mut config: Self = serde_json::from_str(&raw)
            .with_context(|| format!("parse config {}", path.display()))?;
        config.max_history_depth = config.max_history_depth.max(1);
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::EngineConfig;

    #[test]
    fn defaults_match_contract() {
        let config = EngineConfig::default();
        assert_eq!(config.max_history_depth, 10);
        assert!(config.visual_feedback.enabled);
        assert_eq!(config.visual_feedback.max_retries, 1);
    }

    #[test]
    fn load_accepts_partial_config() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("config.json");
        std::fs::write(&path, r#"{"visual_feedback": {"max_retries": 3}}"#)?;
        let config = EngineConfig::load(&path)?;
        assert_eq!(config.max_history_depth, 10);
        assert_eq!(config.visual_feedback.max_retries, 3);
        assert!(config.visual_feedback.enabled);
        Ok(())
    }

    #[test]
    fn load_clamps_history_depth() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("config.json");
        std::fs::write(&path, r#"{"max_history_depth": 0}"#)?;
        let config = EngineConfig::load(&path)?;
        assert_eq!(config.max_history_depth, 1);
        Ok(())
    }
}
