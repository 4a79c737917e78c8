use std::env;
use std::io::Cursor;

use anyhow::{bail, Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use image::{ImageFormat, Rgb, RgbImage};
use indexmap::IndexMap;
use reqwest::blocking::{Client as HttpClient, Response as HttpResponse};
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE};
use serde_json::{json, Map, Value};
use sha2::{Digest, Sha256};

use easel_contracts::error::EngineError;
use easel_contracts::prompt::{Constraint, FeedbackVerdict, PromptSpec};

use crate::{ImageCritic, ImageRenderer, RenderedImage, TextCompleter};

// ---------------------------------------------------------------------------
// Dryrun providers: deterministic, offline, used by tests and `--dryrun`.
// ---------------------------------------------------------------------------

const WEATHER_WORDS: &[(&str, &str)] = &[
    ("rain", "rain"),
    ("raining", "rain"),
    ("rainy", "rain"),
    ("snow", "snow"),
    ("snowing", "snow"),
    ("fog", "fog"),
    ("foggy", "fog"),
    ("storm", "storm"),
    ("stormy", "storm"),
    ("sunset", "sunset"),
    ("sunrise", "sunrise"),
];

const COLOR_WORDS: &[&str] = &[
    "red", "blue", "green", "yellow", "purple", "orange", "pink", "black", "white", "golden",
    "silver", "brown",
];

const COUNT_WORDS: &[(&str, u64)] = &[
    ("two", 2),
    ("three", 3),
    ("four", 4),
    ("five", 5),
    ("six", 6),
];

const LEADING_FILLER: &[&str] = &[
    "please", "draw", "paint", "render", "generate", "create", "make", "sketch", "show", "give",
    "depict", "me", "a", "an", "the", "picture", "image", "photo", "of", "you", "can", "could",
];

const SUBJECT_SEPARATORS: &[&str] = &[
    "in", "at", "on", "over", "under", "during", "against", "beside",
];

/// Offline completer that fabricates schema-conforming payloads from simple
/// lexical rules. Good enough to exercise routing, merging and the feedback
/// loop end to end without a network.
#[derive(Debug, Default)]
pub struct DryrunCompleter;

impl DryrunCompleter {
    pub fn new() -> Self {
        Self
    }

    fn scene_payload(user_text: &str) -> Value {
        let words = significant_tokens(user_text);
        let mut constraints = Map::new();
        let mut positive: Vec<String> = Vec::new();

        let subject = extract_subject(&words);
        if !subject.is_empty() {
            constraints.insert("subject".to_string(), Value::String(subject.clone()));
            positive.push(subject.clone());
        }

        for (raw, canonical) in WEATHER_WORDS {
            if words.iter().any(|word| word == raw) {
                constraints.insert(
                    "weather".to_string(),
                    Value::String((*canonical).to_string()),
                );
                positive.push((*canonical).to_string());
                break;
            }
        }

        for (idx, word) in words.iter().enumerate() {
            if COLOR_WORDS.contains(&word.as_str()) {
                if let Some(noun) = words
                    .get(idx + 1)
                    .filter(|next| next.len() > 2 && !COLOR_WORDS.contains(&next.as_str()))
                {
                    constraints.insert(format!("{noun}_color"), Value::String(word.clone()));
                }
            }
            if let Some((_, count)) = COUNT_WORDS.iter().find(|(name, _)| name == word) {
                // Color adjectives may sit between the count and its noun.
                let mut next = idx + 1;
                while words
                    .get(next)
                    .map(|candidate| COLOR_WORDS.contains(&candidate.as_str()))
                    .unwrap_or(false)
                {
                    next += 1;
                }
                if let Some(noun) = words.get(next) {
                    constraints.insert(format!("{noun}_count"), Value::from(*count));
                }
            }
        }

        positive.push("highly detailed".to_string());
        positive.push("sharp focus".to_string());

        json!({
            "positive": positive,
            "negative": ["blurry", "low quality"],
            "constraints": stringify_values(constraints),
        })
    }

    fn edit_payload(current: &Value, user_text: &str) -> Value {
        let positives: Vec<String> = string_list(current.get("positive"));
        let negatives: Vec<String> = string_list(current.get("negative"));
        let constraints: Map<String, Value> = current
            .get("constraints")
            .and_then(Value::as_object)
            .cloned()
            .unwrap_or_default();
        let text = user_text.to_ascii_lowercase();

        if text.contains("failed visual inspection") {
            return Self::correction_payload(&positives, &negatives, user_text);
        }

        if let Some((from, to)) = parse_substitution(&text) {
            let positive: Vec<String> = positives
                .iter()
                .map(|clause| clause.replace(&from, &to))
                .collect();
            let constraints: Map<String, Value> = constraints
                .iter()
                .map(|(key, value)| {
                    let updated = value
                        .as_str()
                        .map(|raw| Value::String(raw.replace(&from, &to)))
                        .unwrap_or_else(|| value.clone());
                    (key.clone(), updated)
                })
                .collect();
            return json!({
                "positive": positive,
                "negative": negatives,
                "constraints": constraints,
            });
        }

        if let Some(removed) = strip_prefix_phrase(&text, &["remove ", "without ", "no more "]) {
            let positive: Vec<String> = positives
                .iter()
                .filter(|clause| !clause.to_ascii_lowercase().contains(&removed))
                .cloned()
                .collect();
            let mut negative = negatives;
            if !negative.iter().any(|clause| clause == &removed) {
                negative.push(removed);
            }
            return json!({
                "positive": positive,
                "negative": negative,
                "constraints": constraints,
            });
        }

        let added = strip_prefix_phrase(&text, &["add ", "make it ", "make the scene "])
            .unwrap_or_else(|| text.trim().to_string());
        let mut positive = positives;
        if !positive.iter().any(|clause| clause == &added) {
            positive.push(added.clone());
        }
        let mut constraints = constraints;
        let tokens = significant_tokens(&added);
        for pair in tokens.windows(2) {
            if COLOR_WORDS.contains(&pair[0].as_str()) && pair[1].len() > 2 {
                constraints.insert(
                    format!("{}_color", pair[1]),
                    Value::String(pair[0].clone()),
                );
            }
        }
        json!({
            "positive": positive,
            "negative": negatives,
            "constraints": constraints,
        })
    }

    /// Corrective instructions carry `key=value` pairs after "including:";
    /// reinforce exactly those.
    fn correction_payload(positives: &[String], negatives: &[String], user_text: &str) -> Value {
        let mut positive: Vec<String> = positives.to_vec();
        let mut constraints = Map::new();
        if let Some(tail) = user_text.split("including:").nth(1) {
            for pair in tail.trim_end_matches('.').split(',') {
                let Some((key, value)) = pair.split_once('=') else {
                    continue;
                };
                let key = key.trim().to_string();
                let value = value.trim().to_string();
                let emphasis = format!("{value}, strong emphasis");
                if !positive.contains(&emphasis) {
                    positive.push(emphasis);
                }
                constraints.insert(key, Value::String(value));
            }
        }
        json!({
            "positive": positive,
            "negative": negatives,
            "constraints": constraints,
        })
    }
}

impl TextCompleter for DryrunCompleter {
    fn name(&self) -> &str {
        "dryrun"
    }

    fn complete(&self, _system_instructions: &str, context: &Value) -> Result<Value> {
        let task = context.get("task").and_then(Value::as_str).unwrap_or("");
        let user_text = context
            .get("user_text")
            .and_then(Value::as_str)
            .unwrap_or_default();
        match task {
            "merge" => {
                let current = context.get("current_prompt").filter(|value| !value.is_null());
                let intent = context.get("intent").and_then(Value::as_str);
                match (intent, current) {
                    (Some("edit"), Some(current)) => Ok(Self::edit_payload(current, user_text)),
                    _ => Ok(Self::scene_payload(user_text)),
                }
            }
            "classify" => {
                let has_prompt = context
                    .get("has_current_prompt")
                    .and_then(Value::as_bool)
                    .unwrap_or(false);
                let intent = if user_text.trim_end().ends_with('?') {
                    "question"
                } else if has_prompt {
                    "edit"
                } else {
                    "new_scene"
                };
                Ok(json!({ "intent": intent }))
            }
            "answer" => Ok(json!({
                "reply": "Describe the scene you want, then refine it one change at a time; \
the studio keeps the rest of the scene stable between edits.",
            })),
            other => bail!("dryrun completer: unknown task '{other}'"),
        }
    }
}

fn significant_tokens(text: &str) -> Vec<String> {
    text.to_ascii_lowercase()
        .split(|ch: char| !ch.is_ascii_alphanumeric())
        .filter(|word| !word.is_empty())
        .map(str::to_string)
        .collect()
}

fn extract_subject(words: &[String]) -> String {
    let mut started = false;
    let mut subject: Vec<&str> = Vec::new();
    for word in words {
        if !started {
            if LEADING_FILLER.contains(&word.as_str()) {
                continue;
            }
            started = true;
        }
        if SUBJECT_SEPARATORS.contains(&word.as_str()) || word == "the" || word == "a" {
            if SUBJECT_SEPARATORS.contains(&word.as_str()) {
                break;
            }
            continue;
        }
        subject.push(word);
    }
    subject.join(" ")
}

fn parse_substitution(text: &str) -> Option<(String, String)> {
    for verb in ["change", "turn", "swap", "replace"] {
        let Some(tail) = text.split(verb).nth(1) else {
            continue;
        };
        for connector in [" to ", " into ", " with "] {
            if let Some((lhs, rhs)) = tail.split_once(connector) {
                let from = strip_articles(lhs);
                let to = strip_articles(rhs.trim_end_matches(['.', '!']));
                if !from.is_empty() && !to.is_empty() {
                    return Some((from, to));
                }
            }
        }
    }
    None
}

fn strip_articles(raw: &str) -> String {
    raw.split_whitespace()
        .filter(|word| !matches!(*word, "a" | "an" | "the"))
        .collect::<Vec<&str>>()
        .join(" ")
}

fn strip_prefix_phrase(text: &str, prefixes: &[&str]) -> Option<String> {
    let trimmed = text.trim();
    for prefix in prefixes {
        if let Some(tail) = trimmed.strip_prefix(prefix) {
            let value = strip_articles(tail.trim_end_matches(['.', '!']));
            if !value.is_empty() {
                return Some(value);
            }
        }
    }
    None
}

fn string_list(value: Option<&Value>) -> Vec<String> {
    value
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

fn stringify_values(map: Map<String, Value>) -> Map<String, Value> {
    map.into_iter()
        .map(|(key, value)| {
            let value = match value {
                Value::String(_) => value,
                other => Value::String(other.to_string()),
            };
            (key, value)
        })
        .collect()
}

/// Writes a small solid-color image derived from the prompt hash, so
/// repeated runs with the same prompt produce identical artifacts.
#[derive(Debug, Default)]
pub struct DryrunRenderer;

impl DryrunRenderer {
    pub fn new() -> Self {
        Self
    }
}

impl ImageRenderer for DryrunRenderer {
    fn name(&self) -> &str {
        "dryrun"
    }

    fn render(&self, spec: &PromptSpec) -> Result<RenderedImage> {
        let prompt_text = spec.render_text();
        let digest = Sha256::digest(prompt_text.as_bytes());
        let pixel = Rgb([digest[0], digest[1], digest[2]]);
        let canvas = RgbImage::from_pixel(64, 64, pixel);

        let mut bytes: Vec<u8> = Vec::new();
        image::DynamicImage::ImageRgb8(canvas)
            .write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png)
            .context("encode dryrun artifact")?;

        let mut metadata = Map::new();
        metadata.insert("provider".to_string(), Value::String("dryrun".to_string()));
        metadata.insert(
            "model".to_string(),
            Value::String("dryrun-image-1".to_string()),
        );
        metadata.insert("width".to_string(), Value::from(64));
        metadata.insert("height".to_string(), Value::from(64));
        Ok(RenderedImage { bytes, metadata })
    }
}

/// Always passes; real inspection needs a vision model.
#[derive(Debug, Default)]
pub struct DryrunCritic;

impl DryrunCritic {
    pub fn new() -> Self {
        Self
    }
}

impl ImageCritic for DryrunCritic {
    fn name(&self) -> &str {
        "dryrun"
    }

    fn critique(
        &self,
        _image: &[u8],
        _checklist: &IndexMap<String, Constraint>,
        _original_user_text: &str,
    ) -> Result<FeedbackVerdict> {
        Ok(FeedbackVerdict::passing("dryrun critic: no inspection"))
    }
}

// ---------------------------------------------------------------------------
// Stability render backend.
// ---------------------------------------------------------------------------

pub struct StabilityRenderer {
    api_base: String,
    api_key: String,
    engine_id: String,
    width: u32,
    height: u32,
    steps: u32,
    cfg_scale: f64,
    http: HttpClient,
}

impl StabilityRenderer {
    pub fn new(api_key: impl Into<String>, engine_id: impl Into<String>) -> Self {
        Self {
            api_base: env::var("STABILITY_API_BASE")
                .ok()
                .filter(|value| !value.is_empty())
                .unwrap_or_else(|| "https://api.stability.ai".to_string()),
            api_key: api_key.into(),
            engine_id: engine_id.into(),
            width: 1024,
            height: 1024,
            steps: 30,
            cfg_scale: 7.0,
            http: HttpClient::new(),
        }
    }

    pub fn from_env() -> Option<Self> {
        let api_key = non_empty_env("STABILITY_API_KEY")?;
        let engine_id = non_empty_env("STABILITY_ENGINE_ID")
            .unwrap_or_else(|| "stable-diffusion-xl-1024-v1-0".to_string());
        Some(Self::new(api_key, engine_id))
    }

    fn request_body(&self, spec: &PromptSpec) -> Value {
        let mut text_prompts = vec![json!({
            "text": spec.positive_text(),
            "weight": 1,
        })];
        let negative = spec.negative_text();
        if !negative.is_empty() {
            text_prompts.push(json!({ "text": negative, "weight": -1 }));
        }
        json!({
            "steps": self.steps,
            "width": self.width,
            "height": self.height,
            "seed": 0,
            "cfg_scale": self.cfg_scale,
            "samples": 1,
            "text_prompts": text_prompts,
        })
    }
}

impl ImageRenderer for StabilityRenderer {
    fn name(&self) -> &str {
        "stability"
    }

    fn render(&self, spec: &PromptSpec) -> Result<RenderedImage> {
        let url = format!(
            "{}/v1/generation/{}/text-to-image",
            self.api_base, self.engine_id
        );
        let response = self
            .http
            .post(&url)
            .header(AUTHORIZATION, format!("Bearer {}", self.api_key))
            .header(CONTENT_TYPE, "application/json")
            .json(&self.request_body(spec))
            .send()
            .map_err(|err| EngineError::Render(format!("stability transport: {err}")))?;
        let payload = response_json_or_error("stability", response)?;

        let artifact = payload
            .get("artifacts")
            .and_then(Value::as_array)
            .and_then(|items| items.first())
            .ok_or_else(|| EngineError::Render("stability returned no artifacts".to_string()))?;
        let encoded = artifact
            .get("base64")
            .and_then(Value::as_str)
            .ok_or_else(|| EngineError::Render("stability artifact missing base64".to_string()))?;
        let bytes = BASE64
            .decode(encoded)
            .map_err(|err| EngineError::Render(format!("stability artifact decode: {err}")))?;

        let mut metadata = Map::new();
        metadata.insert(
            "provider".to_string(),
            Value::String("stability".to_string()),
        );
        metadata.insert("model".to_string(), Value::String(self.engine_id.clone()));
        metadata.insert("width".to_string(), Value::from(self.width));
        metadata.insert("height".to_string(), Value::from(self.height));
        if let Some(seed) = artifact.get("seed").and_then(Value::as_i64) {
            metadata.insert("seed".to_string(), Value::from(seed));
        }
        Ok(RenderedImage { bytes, metadata })
    }
}

// ---------------------------------------------------------------------------
// Gemini text and vision backends.
// ---------------------------------------------------------------------------

const GEMINI_DEFAULT_BASE: &str = "https://generativelanguage.googleapis.com/v1beta";

pub struct GeminiCompleter {
    api_base: String,
    api_key: String,
    model: String,
    temperature: f64,
    http: HttpClient,
}

impl GeminiCompleter {
    pub fn new(api_key: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            api_base: gemini_api_base(),
            api_key: api_key.into(),
            model: model.into(),
            temperature: 0.7,
            http: HttpClient::new(),
        }
    }

    pub fn from_env() -> Option<Self> {
        let api_key = non_empty_env("GEMINI_API_KEY")?;
        let model =
            non_empty_env("GEMINI_TEXT_MODEL").unwrap_or_else(|| "gemini-2.0-flash".to_string());
        Some(Self::new(api_key, model))
    }
}

impl TextCompleter for GeminiCompleter {
    fn name(&self) -> &str {
        "gemini"
    }

    fn complete(&self, system_instructions: &str, context: &Value) -> Result<Value> {
        let body = gemini_request_body(
            system_instructions,
            vec![json!({ "text": context.to_string() })],
            self.temperature,
        );
        let payload = gemini_generate(
            &self.http,
            &self.api_base,
            &self.api_key,
            &self.model,
            &body,
        )?;
        let text = gemini_text_part(&payload)?;
        serde_json::from_str(strip_code_fences(&text))
            .with_context(|| format!("gemini returned non-JSON payload: {}", truncate(&text, 160)))
    }
}

pub struct GeminiCritic {
    api_base: String,
    api_key: String,
    model: String,
    http: HttpClient,
}

const CRITIC_SYSTEM: &str = "You are an art quality auditor. Compare the \
image against the user request and the constraint checklist. Ignore minor \
style drift; flag missing objects, wrong colors and wrong counts. Respond \
with JSON: {\"passed\": bool, \"reason\": \"short explanation\", \
\"missing\": [constraint keys that are not satisfied]}.";

impl GeminiCritic {
    pub fn new(api_key: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            api_base: gemini_api_base(),
            api_key: api_key.into(),
            model: model.into(),
            http: HttpClient::new(),
        }
    }

    pub fn from_env() -> Option<Self> {
        let api_key = non_empty_env("GEMINI_API_KEY")?;
        let model =
            non_empty_env("GEMINI_VLM_MODEL").unwrap_or_else(|| "gemini-2.0-flash".to_string());
        Some(Self::new(api_key, model))
    }
}

impl ImageCritic for GeminiCritic {
    fn name(&self) -> &str {
        "gemini"
    }

    fn critique(
        &self,
        image: &[u8],
        checklist: &IndexMap<String, Constraint>,
        original_user_text: &str,
    ) -> Result<FeedbackVerdict> {
        let checklist_lines: Vec<String> = checklist
            .iter()
            .map(|(key, entry)| format!("{key}: {}", entry.value))
            .collect();
        let prompt = format!(
            "User request: '{original_user_text}'\nConstraint checklist:\n{}\nDoes the image satisfy every constraint?",
            checklist_lines.join("\n"),
        );
        let parts = vec![
            json!({
                "inline_data": {
                    "mime_type": "image/png",
                    "data": BASE64.encode(image),
                }
            }),
            json!({ "text": prompt }),
        ];
        let body = gemini_request_body(CRITIC_SYSTEM, parts, 0.1);
        let payload = gemini_generate(
            &self.http,
            &self.api_base,
            &self.api_key,
            &self.model,
            &body,
        )?;
        let text = gemini_text_part(&payload)?;
        let parsed: Value = serde_json::from_str(strip_code_fences(&text))
            .with_context(|| format!("critic returned non-JSON payload: {}", truncate(&text, 160)))?;
        Ok(parse_critic_verdict(&parsed, checklist))
    }
}

fn parse_critic_verdict(
    payload: &Value,
    checklist: &IndexMap<String, Constraint>,
) -> FeedbackVerdict {
    let passed = payload
        .get("passed")
        .and_then(Value::as_bool)
        .unwrap_or(true);
    let reason = payload
        .get("reason")
        .and_then(Value::as_str)
        .unwrap_or("no reason given")
        .to_string();
    // Only keys from the checklist count as unmet; anything else the model
    // invents is dropped.
    let missing: Vec<String> = payload
        .get("missing")
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(Value::as_str)
                .filter(|key| checklist.contains_key(*key))
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default();
    if passed || missing.is_empty() {
        FeedbackVerdict::passing(reason)
    } else {
        FeedbackVerdict::failing(missing, reason)
    }
}

fn gemini_api_base() -> String {
    env::var("GEMINI_API_BASE")
        .ok()
        .filter(|value| !value.is_empty())
        .unwrap_or_else(|| GEMINI_DEFAULT_BASE.to_string())
}

fn gemini_request_body(system_instructions: &str, parts: Vec<Value>, temperature: f64) -> Value {
    json!({
        "system_instruction": { "parts": [{ "text": system_instructions }] },
        "contents": [{ "role": "user", "parts": parts }],
        "generationConfig": {
            "response_mime_type": "application/json",
            "temperature": temperature,
        },
    })
}

fn gemini_generate(
    http: &HttpClient,
    api_base: &str,
    api_key: &str,
    model: &str,
    body: &Value,
) -> Result<Value> {
    let url = format!("{api_base}/models/{model}:generateContent?key={api_key}");
    let response = http
        .post(&url)
        .header(CONTENT_TYPE, "application/json")
        .json(body)
        .send()
        .with_context(|| format!("gemini transport failure for model {model}"))?;
    response_json_or_error("gemini", response)
}

fn gemini_text_part(payload: &Value) -> Result<String> {
    payload
        .get("candidates")
        .and_then(Value::as_array)
        .and_then(|items| items.first())
        .and_then(|candidate| candidate.pointer("/content/parts/0/text"))
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| anyhow::anyhow!("gemini response carried no text part"))
}

fn strip_code_fences(raw: &str) -> &str {
    let trimmed = raw.trim();
    let without_open = trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .unwrap_or(trimmed);
    without_open.strip_suffix("```").unwrap_or(without_open).trim()
}

fn response_json_or_error(provider: &str, response: HttpResponse) -> Result<Value> {
    let status = response.status();
    let text = response.text().unwrap_or_default();
    if !status.is_success() {
        bail!(
            "{provider} request failed with status {status}: {}",
            truncate(&text, 300)
        );
    }
    Ok(serde_json::from_str(&text)?)
}

fn truncate(value: &str, max_chars: usize) -> String {
    if value.chars().count() <= max_chars {
        return value.to_string();
    }
    let cut: String = value.chars().take(max_chars).collect();
    format!("{cut}…")
}

fn non_empty_env(key: &str) -> Option<String> {
    env::var(key).ok().filter(|value| !value.is_empty())
}

#[cfg(test)]
mod tests {
    use indexmap::IndexMap;
    use serde_json::json;

    use easel_contracts::prompt::{Constraint, PromptSpec, TargetModel};

    use crate::{ImageRenderer, TextCompleter};

    use super::{
        parse_critic_verdict, parse_substitution, strip_code_fences, DryrunCompleter,
        DryrunRenderer, StabilityRenderer,
    };

    #[test]
    fn dryrun_scene_extracts_subject_and_weather() -> anyhow::Result<()> {
        let completer = DryrunCompleter::new();
        let payload = completer.complete(
            "",
            &json!({
                "task": "merge",
                "intent": "new_scene",
                "user_text": "Draw a cyberpunk cat in the rain",
            }),
        )?;
        assert_eq!(payload["constraints"]["subject"], json!("cyberpunk cat"));
        assert_eq!(payload["constraints"]["weather"], json!("rain"));
        Ok(())
    }

    #[test]
    fn dryrun_scene_extracts_colors_and_counts() -> anyhow::Result<()> {
        let completer = DryrunCompleter::new();
        let payload = completer.complete(
            "",
            &json!({
                "task": "merge",
                "intent": "new_scene",
                "user_text": "three red balloons over a city",
            }),
        )?;
        assert_eq!(payload["constraints"]["balloons_color"], json!("red"));
        assert_eq!(payload["constraints"]["balloons_count"], json!("3"));
        Ok(())
    }

    #[test]
    fn dryrun_edit_substitutes_subject() -> anyhow::Result<()> {
        let completer = DryrunCompleter::new();
        let payload = completer.complete(
            "",
            &json!({
                "task": "merge",
                "intent": "edit",
                "user_text": "change the cat to a dog",
                "current_prompt": {
                    "positive": ["cyberpunk cat", "rain"],
                    "negative": ["blurry"],
                    "constraints": {"subject": "cyberpunk cat", "weather": "rain"},
                },
            }),
        )?;
        assert_eq!(payload["constraints"]["subject"], json!("cyberpunk dog"));
        assert_eq!(payload["constraints"]["weather"], json!("rain"));
        assert!(payload["positive"]
            .as_array()
            .expect("positive list")
            .contains(&json!("cyberpunk dog")));
        Ok(())
    }

    #[test]
    fn dryrun_edit_reinforces_correction_pairs() -> anyhow::Result<()> {
        let completer = DryrunCompleter::new();
        let payload = completer.complete(
            "",
            &json!({
                "task": "merge",
                "intent": "edit",
                "user_text": "The previous image failed visual inspection. Reason: no rain. \
Keep the established scene and style, with strong emphasis on including: weather=rain.",
                "current_prompt": {
                    "positive": ["cyberpunk cat"],
                    "negative": [],
                    "constraints": {"subject": "cyberpunk cat", "weather": "rain"},
                },
            }),
        )?;
        assert!(payload["positive"]
            .as_array()
            .expect("positive list")
            .contains(&json!("rain, strong emphasis")));
        assert_eq!(payload["constraints"]["weather"], json!("rain"));
        Ok(())
    }

    #[test]
    fn dryrun_renderer_is_deterministic_png() -> anyhow::Result<()> {
        let spec = PromptSpec::candidate(
            vec!["a red balloon".to_string()],
            vec![],
            IndexMap::new(),
            TargetModel::Sdxl,
        );
        let renderer = DryrunRenderer::new();
        let first = renderer.render(&spec)?;
        let second = renderer.render(&spec)?;
        assert_eq!(first.bytes, second.bytes);
        assert_eq!(&first.bytes[1..4], b"PNG");
        Ok(())
    }

    #[test]
    fn parse_substitution_handles_articles() {
        assert_eq!(
            parse_substitution("change the cat to a dog"),
            Some(("cat".to_string(), "dog".to_string()))
        );
        assert_eq!(
            parse_substitution("turn the balloon into a kite."),
            Some(("balloon".to_string(), "kite".to_string()))
        );
        assert_eq!(parse_substitution("more dramatic lighting"), None);
    }

    #[test]
    fn stability_body_carries_weighted_prompts() {
        let mut checklist = IndexMap::new();
        checklist.insert("subject".to_string(), Constraint::unsatisfied("cat"));
        let spec = PromptSpec::candidate(
            vec!["a cat".to_string()],
            vec!["blurry".to_string()],
            checklist,
            TargetModel::Sdxl,
        );
        let renderer = StabilityRenderer::new("key", "engine");
        let body = renderer.request_body(&spec);
        assert_eq!(body["text_prompts"][0]["text"], json!("a cat"));
        assert_eq!(body["text_prompts"][0]["weight"], json!(1));
        assert_eq!(body["text_prompts"][1]["text"], json!("blurry"));
        assert_eq!(body["text_prompts"][1]["weight"], json!(-1));
        assert_eq!(body["samples"], json!(1));
    }

    #[test]
    fn critic_verdict_ignores_invented_keys() {
        let mut checklist = IndexMap::new();
        checklist.insert("weather".to_string(), Constraint::unsatisfied("rain"));
        let verdict = parse_critic_verdict(
            &json!({"passed": false, "reason": "no rain", "missing": ["weather", "sharks"]}),
            &checklist,
        );
        assert!(!verdict.pass);
        assert_eq!(verdict.unmet_constraints, vec!["weather".to_string()]);
    }

    #[test]
    fn critic_verdict_without_checklist_keys_passes() {
        let checklist: IndexMap<String, Constraint> = IndexMap::new();
        let verdict = parse_critic_verdict(
            &json!({"passed": false, "reason": "vibes off", "missing": ["vibes"]}),
            &checklist,
        );
        assert!(verdict.pass);
    }

    #[test]
    fn code_fences_are_stripped() {
        assert_eq!(strip_code_fences("```json\n{\"a\":1}\n```"), "{\"a\":1}");
        assert_eq!(strip_code_fences("{\"a\":1}"), "{\"a\":1}");
    }
}
