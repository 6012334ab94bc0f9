//! Configuration management
//!
//! One immutable `DeeprConfig` is built at start-up (file, then environment
//! overlay) and handed to gateway and controller constructors.

use crate::error::{DeeprError, DeeprResult, ErrorContext};
use crate::logging::LoggingConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Value handed to self-hosted endpoints that ignore credentials
pub const PLACEHOLDER_CREDENTIAL: &str = "not-needed";

const SELF_HOSTED_PROVIDERS: &[&str] = &["ollama", "vllm", "local", "lmstudio"];

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DeeprConfig {
    pub llm: LlmSettings,
    pub search: SearchConfig,
    pub research: ResearchSettings,
    pub storage: StorageConfig,
    pub logging: LoggingConfig,
}

/// Model selection for both gateway profiles
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmSettings {
    pub primary: ModelConfig,
    pub activity: ModelConfig,
    /// Maximum in-flight completion calls across all sessions
    pub max_concurrent_requests: usize,
    /// Minimum spacing between calls in milliseconds
    pub min_request_interval_ms: u64,
    /// Attempts for retryable provider errors, including the first one
    pub max_attempts: usize,
    pub initial_backoff_ms: u64,
}

impl Default for LlmSettings {
    fn default() -> Self {
        Self {
            primary: ModelConfig::default(),
            activity: ModelConfig {
                model: "gpt-4o".to_string(),
                temperature: 0.3,
                timeout_ms: 30_000,
                ..ModelConfig::default()
            },
            max_concurrent_requests: 8,
            min_request_interval_ms: 0,
            max_attempts: 3,
            initial_backoff_ms: 1000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    pub provider: String,
    pub model: String,
    pub temperature: f32,
    pub base_endpoint: Option<String>,
    pub credential: Option<String>,
    pub max_tokens: Option<u32>,
    pub timeout_ms: u64,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            provider: "openai".to_string(),
            model: "o3-mini".to_string(),
            temperature: 0.7,
            base_endpoint: None,
            credential: None,
            max_tokens: None,
            timeout_ms: 120_000,
        }
    }
}

/// How a model endpoint is authenticated
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CredentialMode {
    Explicit,
    /// Self-hosted endpoint; a placeholder credential is supplied
    Placeholder,
    Missing,
}

impl ModelConfig {
    pub fn is_self_hosted(&self) -> bool {
        SELF_HOSTED_PROVIDERS.contains(&self.provider.as_str()) || self.base_endpoint.is_some()
    }

    pub fn credential_mode(&self) -> CredentialMode {
        match &self.credential {
            Some(c) if !c.trim().is_empty() => CredentialMode::Explicit,
            _ if self.is_self_hosted() => CredentialMode::Placeholder,
            _ => CredentialMode::Missing,
        }
    }

    /// Credential to send, falling back to the placeholder for self-hosted endpoints
    pub fn effective_credential(&self) -> Option<&str> {
        match self.credential_mode() {
            CredentialMode::Explicit => self.credential.as_deref(),
            CredentialMode::Placeholder => Some(PLACEHOLDER_CREDENTIAL),
            CredentialMode::Missing => None,
        }
    }
}

/// Search backend settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchConfig {
    pub provider: String,
    pub top_k: usize,
    pub include_raw_content: bool,
    pub base_endpoint: Option<String>,
    pub credential: Option<String>,
    /// Per-action deadline
    pub timeout_ms: u64,
    /// Actions dispatched at once within one loop
    pub max_concurrent_actions: usize,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            provider: "tavily".to_string(),
            top_k: 5,
            include_raw_content: false,
            base_endpoint: None,
            credential: None,
            timeout_ms: 30_000,
            max_concurrent_actions: 5,
        }
    }
}

/// Research loop policy knobs
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ResearchSettings {
    /// Loop ceiling used when a session does not request one
    pub default_max_loops: usize,
    /// Hard upper bound on any requested ceiling
    pub max_loops_limit: usize,
    /// Actions the planner may emit per loop
    pub max_actions_per_loop: usize,
    /// Additional planner attempts after a planning failure
    pub planner_retries: usize,
    /// Consecutive converging verdicts needed to stop
    pub convergence_streak: usize,
    /// Minimum loops before extra-effort sessions may converge
    pub extra_min_loops: usize,
    /// Minimum distinct sources before extra-effort sessions may converge
    pub extra_min_distinct_sources: usize,
    /// Consecutive zero-yield loops tolerated before failing
    pub zero_yield_tolerance: usize,
    /// Consecutive loop-local failures tolerated before failing
    pub loop_failure_tolerance: usize,
    /// Findings shown to the planner
    pub recent_findings_window: usize,
    /// Characters of source content passed to extraction
    pub max_source_chars: usize,
    /// Concurrent extraction calls per loop
    pub max_concurrent_extractions: usize,
    /// Generate per-loop activity notes with the activity profile
    pub enable_activity_notes: bool,
}

impl Default for ResearchSettings {
    fn default() -> Self {
        Self {
            default_max_loops: 10,
            max_loops_limit: 20,
            max_actions_per_loop: 5,
            planner_retries: 1,
            convergence_streak: 2,
            extra_min_loops: 3,
            extra_min_distinct_sources: 6,
            zero_yield_tolerance: 2,
            loop_failure_tolerance: 2,
            recent_findings_window: 12,
            max_source_chars: 6000,
            max_concurrent_extractions: 4,
            enable_activity_notes: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub data_dir: PathBuf,
    pub persist_sessions: bool,
}

impl Default for StorageConfig {
    fn default() -> Self {
        let data_dir = dirs::data_local_dir()
            .map(|d| d.join("deepr").join("sessions"))
            .unwrap_or_else(|| PathBuf::from(".deepr/sessions"));
        Self {
            data_dir,
            persist_sessions: false,
        }
    }
}

/// Models offered per provider
pub fn known_models(provider: &str) -> &'static [&'static str] {
    match provider {
        "openai" => &["o4-mini", "o4-mini-high", "o3-mini", "o3-mini-reasoning", "gpt-4o"],
        "anthropic" => &[
            "claude-sonnet-4",
            "claude-sonnet-4-thinking",
            "claude-3-7-sonnet",
            "claude-3-7-sonnet-thinking",
        ],
        "google" => &["gemini-2.5-pro", "gemini-1.5-pro-latest", "gemini-1.5-flash-latest"],
        "groq" => &[
            "deepseek-r1-distill-llama-70b",
            "llama-3.3-70b-versatile",
            "llama3-70b-8192",
        ],
        "sambanova" => &["DeepSeek-V3-0324"],
        _ => &[],
    }
}

/// Environment variable holding the credential of a hosted provider
pub fn credential_env_key(provider: &str) -> Option<&'static str> {
    match provider {
        "openai" => Some("OPENAI_API_KEY"),
        "anthropic" => Some("ANTHROPIC_API_KEY"),
        "google" => Some("GOOGLE_CLOUD_PROJECT"),
        "groq" => Some("GROQ_API_KEY"),
        "sambanova" => Some("SAMBNOVA_API_KEY"),
        "tavily" => Some("TAVILY_API_KEY"),
        _ => None,
    }
}

impl DeeprConfig {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> DeeprResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| DeeprError::Config {
            message: format!("Failed to read config file: {}", e),
            source: Some(Box::new(e)),
            context: ErrorContext::new("config")
                .with_operation("read_file")
                .with_suggestion("Check if the config file exists and is readable"),
        })?;

        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> DeeprResult<Self> {
        toml::from_str(content).map_err(|e| DeeprError::Config {
            message: format!("Failed to parse config: {}", e),
            source: Some(Box::new(e)),
            context: ErrorContext::new("config")
                .with_operation("parse_toml")
                .with_suggestion("Check TOML syntax in config file"),
        })
    }

    /// Save configuration to a TOML file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> DeeprResult<()> {
        let content = toml::to_string_pretty(self).map_err(|e| DeeprError::Config {
            message: format!("Failed to serialize config: {}", e),
            source: Some(Box::new(e)),
            context: ErrorContext::new("config").with_operation("serialize_toml"),
        })?;

        std::fs::write(path, content).map_err(|e| DeeprError::Config {
            message: format!("Failed to write config file: {}", e),
            source: Some(Box::new(e)),
            context: ErrorContext::new("config")
                .with_operation("write_file")
                .with_suggestion("Check if the directory exists and is writable"),
        })?;

        Ok(())
    }

    /// Overlay values from the process environment
    pub fn with_env_overrides(mut self) -> DeeprResult<Self> {
        self.apply_env_overrides(|key| std::env::var(key).ok())?;
        Ok(self)
    }

    /// Overlay values from an arbitrary variable lookup
    pub fn apply_env_overrides<F>(&mut self, lookup: F) -> DeeprResult<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(provider) = non_empty("LLM_PROVIDER") {
            self.llm.primary.provider = provider;
        }
        if let Some(model) = non_empty("LLM_MODEL") {
            self.llm.primary.model = model;
        }
        if let Some(provider) = non_empty("ACTIVITY_LLM_PROVIDER") {
            self.llm.activity.provider = provider;
        }
        if let Some(model) = non_empty("ACTIVITY_LLM_MODEL") {
            self.llm.activity.model = model;
        }
        if let Some(base) = non_empty("LLM_BASE_URL") {
            self.llm.primary.base_endpoint = Some(base);
        }
        if let Some(loops) = non_empty("MAX_WEB_RESEARCH_LOOPS") {
            self.research.default_max_loops =
                loops.trim().parse().map_err(|_| DeeprError::Config {
                    message: format!("MAX_WEB_RESEARCH_LOOPS is not a number: {}", loops),
                    source: None,
                    context: ErrorContext::new("config").with_operation("env_overrides"),
                })?;
        }

        for model in [&mut self.llm.primary, &mut self.llm.activity] {
            if model.credential.is_none() {
                if let Some(key) = credential_env_key(&model.provider) {
                    model.credential = non_empty(key);
                }
            }
        }
        if self.search.credential.is_none() {
            if let Some(key) = credential_env_key(&self.search.provider) {
                self.search.credential = non_empty(key);
            }
        }

        Ok(())
    }

    /// Validate configuration
    pub fn validate(&self) -> DeeprResult<()> {
        let invalid = |message: &str, suggestion: &str| DeeprError::Config {
            message: message.to_string(),
            source: None,
            context: ErrorContext::new("config")
                .with_operation("validate")
                .with_suggestion(suggestion),
        };

        for (name, model) in [("primary", &self.llm.primary), ("activity", &self.llm.activity)] {
            if model.model.trim().is_empty() {
                return Err(invalid(
                    &format!("llm.{} model must not be empty", name),
                    "Set llm.<profile>.model",
                ));
            }
            if !(0.0..=2.0).contains(&model.temperature) {
                return Err(invalid(
                    &format!("llm.{} temperature must be within 0.0..=2.0", name),
                    "Use a temperature between 0 and 2",
                ));
            }
            if model.timeout_ms == 0 {
                return Err(invalid(
                    &format!("llm.{} timeout_ms must be greater than 0", name),
                    "Set a positive timeout",
                ));
            }
        }

        if self.llm.max_concurrent_requests == 0 || self.llm.max_attempts == 0 {
            return Err(invalid(
                "llm.max_concurrent_requests and llm.max_attempts must be greater than 0",
                "Set both values to at least 1",
            ));
        }

        if self.search.top_k == 0 || self.search.max_concurrent_actions == 0 {
            return Err(invalid(
                "search.top_k and search.max_concurrent_actions must be greater than 0",
                "Set both values to at least 1",
            ));
        }

        let research = &self.research;
        if research.default_max_loops == 0 || research.max_loops_limit == 0 {
            return Err(invalid(
                "research loop ceilings must be greater than 0",
                "Set research.default_max_loops and research.max_loops_limit to at least 1",
            ));
        }
        if research.default_max_loops > research.max_loops_limit {
            return Err(invalid(
                "research.default_max_loops exceeds research.max_loops_limit",
                "Lower default_max_loops or raise max_loops_limit",
            ));
        }
        if research.max_actions_per_loop == 0 {
            return Err(invalid(
                "research.max_actions_per_loop must be greater than 0",
                "Allow at least one action per loop",
            ));
        }
        if research.convergence_streak == 0 || research.loop_failure_tolerance == 0 {
            return Err(invalid(
                "research.convergence_streak and research.loop_failure_tolerance must be greater than 0",
                "Set both values to at least 1",
            ));
        }

        Ok(())
    }

    /// Non-fatal problems worth reporting at start-up
    pub fn warnings(&self) -> Vec<String> {
        let mut warnings = Vec::new();

        for (name, model) in [("primary", &self.llm.primary), ("activity", &self.llm.activity)] {
            if model.credential_mode() == CredentialMode::Missing {
                let hint = credential_env_key(&model.provider)
                    .map(|k| format!(" (set {})", k))
                    .unwrap_or_default();
                warnings.push(format!(
                    "No credential for {} model provider '{}'{}",
                    name, model.provider, hint
                ));
            }
            let catalog = known_models(&model.provider);
            if !catalog.is_empty() && !catalog.contains(&model.model.as_str()) {
                warnings.push(format!(
                    "Model '{}' is not in the known catalog for '{}'",
                    model.model, model.provider
                ));
            }
        }

        if self.search.credential.is_none() && self.search.base_endpoint.is_none() {
            warnings.push(format!(
                "No credential for search provider '{}'; web search will not work",
                self.search.provider
            ));
        }

        warnings
    }
}
