//! Core data type definitions shared across gateways

use crate::error::{DeeprError, DeeprResult};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::OnceLock;
use std::time::Duration;

/// Which configured model serves a call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelProfile {
    /// Main reasoning model used for planning, extraction and reporting
    Primary,
    /// Lightweight model used for short activity notes
    Activity,
}

impl std::fmt::Display for ModelProfile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ModelProfile::Primary => write!(f, "primary"),
            ModelProfile::Activity => write!(f, "activity"),
        }
    }
}

/// What a completion call is for. Used for logging and by test doubles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallPurpose {
    Plan,
    Extract,
    Summarize,
    Reflect,
    Report,
    Activity,
    Repair,
}

impl std::fmt::Display for CallPurpose {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            CallPurpose::Plan => "plan",
            CallPurpose::Extract => "extract",
            CallPurpose::Summarize => "summarize",
            CallPurpose::Reflect => "reflect",
            CallPurpose::Report => "report",
            CallPurpose::Activity => "activity",
            CallPurpose::Repair => "repair",
        };
        write!(f, "{}", name)
    }
}

/// A single completion call as seen by a provider backend
#[derive(Debug, Clone)]
pub struct CompletionRequest {
    pub purpose: CallPurpose,
    pub profile: ModelProfile,
    pub system: Option<String>,
    pub prompt: String,
    pub timeout: Duration,
}

impl CompletionRequest {
    pub fn new(purpose: CallPurpose, profile: ModelProfile, prompt: impl Into<String>) -> Self {
        Self {
            purpose,
            profile,
            system: None,
            prompt: prompt.into(),
            timeout: Duration::from_secs(120),
        }
    }

    pub fn with_system(mut self, system: impl Into<String>) -> Self {
        self.system = Some(system.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// One hit returned by a search provider, in provider relevance order
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchHit {
    pub title: String,
    pub url: String,
    pub content: String,
    pub raw_content: Option<String>,
}

/// Content retrieved for a document reference
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FetchedDocument {
    pub reference: String,
    pub title: Option<String>,
    pub content: String,
}

/// Provider-neutral structured model output.
///
/// Different vendors wrap JSON differently (code fences, reasoning blocks,
/// leading prose). `parse` normalizes all of them to a single JSON value.
#[derive(Debug, Clone, PartialEq)]
pub struct StructuredOutput {
    value: Value,
}

fn think_block() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?s)<think>.*?</think>").expect("valid regex"))
}

fn code_fence() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?s)```(?:json|JSON)?\s*(.*?)```").expect("valid regex"))
}

impl StructuredOutput {
    pub fn new(value: Value) -> Self {
        Self { value }
    }

    /// Extract the first JSON object or array from raw model text
    pub fn parse(raw: &str) -> DeeprResult<Self> {
        let without_reasoning = think_block().replace_all(raw, "");
        let text = without_reasoning.trim();

        if let Ok(value) = serde_json::from_str::<Value>(text) {
            if value.is_object() || value.is_array() {
                return Ok(Self { value });
            }
        }

        for captures in code_fence().captures_iter(text) {
            if let Some(body) = captures.get(1) {
                if let Ok(value) = serde_json::from_str::<Value>(body.as_str().trim()) {
                    return Ok(Self { value });
                }
            }
        }

        // Fall back to the outermost bracketed span
        for (open, close) in [('{', '}'), ('[', ']')] {
            if let (Some(start), Some(end)) = (text.find(open), text.rfind(close)) {
                if start < end {
                    if let Ok(value) = serde_json::from_str::<Value>(&text[start..=end]) {
                        return Ok(Self { value });
                    }
                }
            }
        }

        Err(DeeprError::invalid_response(
            "no JSON value found in model output",
            Some(raw),
        ))
    }

    pub fn value(&self) -> &Value {
        &self.value
    }

    pub fn into_value(self) -> Value {
        self.value
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.value.get(key)
    }

    pub fn str_field(&self, key: &str) -> Option<&str> {
        self.value.get(key).and_then(Value::as_str)
    }

    pub fn bool_field(&self, key: &str) -> Option<bool> {
        self.value.get(key).and_then(Value::as_bool)
    }

    /// Array of strings under `key`; non-string entries are skipped
    pub fn string_list(&self, key: &str) -> Vec<String> {
        self.value
            .get(key)
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Deserialize into a typed structure
    pub fn decode<T: serde::de::DeserializeOwned>(&self) -> DeeprResult<T> {
        serde_json::from_value(self.value.clone()).map_err(|e| {
            DeeprError::invalid_response(
                format!("unexpected output shape: {}", e),
                Some(&self.value.to_string()),
            )
        })
    }
}
