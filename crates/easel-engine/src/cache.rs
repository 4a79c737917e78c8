use std::path::{Path, PathBuf};

use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

/// Stable cache key for a render request. Identical prompt text, dialect
/// and backend always hash to the same key.
pub fn render_cache_key(backend: &str, dialect: &str, prompt_text: &str) -> String {
    let payload = serde_json::json!({
        "backend": backend,
        "dialect": dialect,
        "prompt": prompt_text,
    });
    let serialized = serde_json::to_string(&payload).unwrap_or_default();
    let mut hasher = Sha256::new();
    hasher.update(serialized.as_bytes());
    hex::encode(hasher.finalize())
}

/// JSON-file map from render cache key to artifact metadata. Read-through:
/// every lookup refreshes from disk so concurrent engine processes sharing
/// an artifacts directory see each other's entries.
#[derive(Debug, Clone)]
pub struct RenderCache {
    path: PathBuf,
}

impl RenderCache {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn get(&self, key: &str) -> Option<Map<String, Value>> {
        let payload = read_json_object(&self.path)?;
        payload.get(key).and_then(Value::as_object).cloned()
    }

    pub fn set(&self, key: &str, value: Map<String, Value>) -> anyhow::Result<()> {
        let mut payload = read_json_object(&self.path).unwrap_or_default();
        payload.insert(key.to_string(), Value::Object(value));
        write_json_object(&self.path, &payload)
    }
}

fn read_json_object(path: &Path) -> Option<Map<String, Value>> {
    let raw = std::fs::read_to_string(path).ok()?;
    let parsed: Value = serde_json::from_str(&raw).ok()?;
    parsed.as_object().cloned()
}

fn write_json_object(path: &Path, payload: &Map<String, Value>) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(
        path,
        serde_json::to_string_pretty(&Value::Object(payload.clone()))?,
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use serde_json::{json, Map, Value};

    use super::{render_cache_key, RenderCache};

    fn obj(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap_or_default()
    }

    #[test]
    fn cache_roundtrip() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let cache = RenderCache::new(temp.path().join("render_cache.json"));
        cache.set("key", obj(json!({"artifact_path": "/tmp/a.png"})))?;
        assert_eq!(
            cache.get("key"),
            Some(obj(json!({"artifact_path": "/tmp/a.png"})))
        );
        assert!(cache.get("other").is_none());
        Ok(())
    }

    #[test]
    fn cache_merges_entries_across_instances() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("render_cache.json");
        let cache_a = RenderCache::new(&path);
        let cache_b = RenderCache::new(&path);

        cache_a.set("a", obj(json!({"value": 1})))?;
        cache_b.set("b", obj(json!({"value": 2})))?;

        assert_eq!(cache_a.get("b"), Some(obj(json!({"value": 2}))));
        assert_eq!(cache_b.get("a"), Some(obj(json!({"value": 1}))));
        Ok(())
    }

    #[test]
    fn cache_key_is_stable_and_input_sensitive() {
        let a = render_cache_key("dryrun", "sdxl", "a cat");
        let b = render_cache_key("dryrun", "sdxl", "a cat");
        let c = render_cache_key("dryrun", "sdxl", "a dog");
        let d = render_cache_key("stability", "sdxl", "a cat");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_ne!(a, d);
    }
}
