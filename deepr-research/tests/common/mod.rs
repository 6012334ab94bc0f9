//! Common test utilities for research loop tests
//!
//! `ScriptedModel` answers completion calls from per-purpose queues and falls
//! back to deterministic defaults; `ScriptedSearch` serves canned hits and can
//! delay or fail individual queries.

#![allow(dead_code)]

use deepr_core::{
    async_trait, CallPurpose, CompletionRequest, DeeprError, DeeprResult, FetchedDocument,
    LanguageModel, LlmSettings, ModelConfig, ModelProfile, ResearchSettings, RetryConfig,
    SearchConfig, SearchHit, SearchProvider,
};
use deepr_research::{
    steering_channel, EffortMode, LlmGateway, ResearchController, ResearchReport, ResearchRun,
    Session, ToolGateway,
};
use serde_json::json;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Once};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

static INIT: Once = Once::new();

/// Initialize logging for tests
pub fn init_logging() {
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter("deepr_research=debug,warn")
            .with_test_writer()
            .try_init();
    });
}

/// A scripted answer to one completion call
#[derive(Debug, Clone)]
pub enum Reply {
    Text(String),
    /// Retryable provider fault
    ProviderError(String),
    /// Never answers within any test deadline
    Hang,
}

/// One completion call as observed by the scripted model
#[derive(Debug, Clone)]
pub struct RecordedCall {
    pub purpose: CallPurpose,
    pub profile: ModelProfile,
    pub model: String,
    pub prompt: String,
}

pub struct ScriptedModel {
    name: String,
    queues: Mutex<HashMap<CallPurpose, VecDeque<Reply>>>,
    defaults: Mutex<HashMap<CallPurpose, Reply>>,
    calls: Mutex<Vec<RecordedCall>>,
    generated_plans: AtomicUsize,
}

impl Default for ScriptedModel {
    fn default() -> Self {
        Self::named("scripted")
    }
}

impl ScriptedModel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn named(name: &str) -> Self {
        Self {
            name: name.to_string(),
            queues: Mutex::new(HashMap::new()),
            defaults: Mutex::new(HashMap::new()),
            calls: Mutex::new(Vec::new()),
            generated_plans: AtomicUsize::new(0),
        }
    }

    /// Queue a reply for the next call with `purpose`
    pub fn push(&self, purpose: CallPurpose, reply: Reply) -> &Self {
        self.queues
            .lock()
            .unwrap()
            .entry(purpose)
            .or_default()
            .push_back(reply);
        self
    }

    pub fn push_text(&self, purpose: CallPurpose, text: impl Into<String>) -> &Self {
        self.push(purpose, Reply::Text(text.into()))
    }

    /// Queue a plan that searches `queries`
    pub fn push_plan(&self, queries: &[&str]) -> &Self {
        self.push_text(CallPurpose::Plan, plan_json(queries))
    }

    pub fn push_verdict(&self, converged: bool) -> &Self {
        self.push_text(CallPurpose::Reflect, verdict_json(converged))
    }

    /// Reply used once the queue of `purpose` is empty
    pub fn set_default(&self, purpose: CallPurpose, reply: Reply) -> &Self {
        self.defaults.lock().unwrap().insert(purpose, reply);
        self
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn prompts(&self, purpose: CallPurpose) -> Vec<String> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|c| c.purpose == purpose)
            .map(|c| c.prompt.clone())
            .collect()
    }

    pub fn call_count(&self, purpose: CallPurpose) -> usize {
        self.prompts(purpose).len()
    }

    fn next_reply(&self, purpose: CallPurpose, prompt: &str) -> Reply {
        if let Some(reply) = self
            .queues
            .lock()
            .unwrap()
            .get_mut(&purpose)
            .and_then(VecDeque::pop_front)
        {
            return reply;
        }
        if let Some(reply) = self.defaults.lock().unwrap().get(&purpose) {
            return reply.clone();
        }

        let text = match purpose {
            CallPurpose::Plan => {
                let n = self.generated_plans.fetch_add(1, Ordering::SeqCst) + 1;
                plan_json(&[&format!("follow-up query {}", n)])
            }
            CallPurpose::Extract => extraction_json(&[source_text(prompt)], &[], &[]),
            CallPurpose::Summarize => "Running summary of the research so far.".to_string(),
            CallPurpose::Reflect => verdict_json(true),
            CallPurpose::Report => "Composed answer citing the evidence [1].".to_string(),
            CallPurpose::Activity => "Searched the web for new evidence.".to_string(),
            CallPurpose::Repair => "still no valid output".to_string(),
        };
        Reply::Text(text)
    }
}

#[async_trait]
impl LanguageModel for ScriptedModel {
    fn name(&self) -> &str {
        &self.name
    }

    async fn complete(
        &self,
        model: &ModelConfig,
        request: &CompletionRequest,
    ) -> DeeprResult<String> {
        self.calls.lock().unwrap().push(RecordedCall {
            purpose: request.purpose,
            profile: request.profile,
            model: model.model.clone(),
            prompt: request.prompt.clone(),
        });

        match self.next_reply(request.purpose, &request.prompt) {
            Reply::Text(text) => Ok(text),
            Reply::ProviderError(message) => Err(DeeprError::provider(&self.name, message, None)),
            Reply::Hang => {
                tokio::time::sleep(Duration::from_secs(600)).await;
                Err(DeeprError::provider(&self.name, "hung call returned", None))
            }
        }
    }
}

/// Search backend with canned results
#[derive(Default)]
pub struct ScriptedSearch {
    hits: Mutex<HashMap<String, Vec<SearchHit>>>,
    delays: Mutex<HashMap<String, Duration>>,
    failures: Mutex<HashSet<String>>,
    queries: Mutex<Vec<String>>,
}

impl ScriptedSearch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_hits(&self, query: &str, hits: Vec<SearchHit>) -> &Self {
        self.hits.lock().unwrap().insert(query.to_string(), hits);
        self
    }

    /// Answer `query` only after `delay`
    pub fn set_delay(&self, query: &str, delay: Duration) -> &Self {
        self.delays.lock().unwrap().insert(query.to_string(), delay);
        self
    }

    pub fn set_failure(&self, query: &str) -> &Self {
        self.failures.lock().unwrap().insert(query.to_string());
        self
    }

    /// Queries received so far, in arrival order
    pub fn queries(&self) -> Vec<String> {
        self.queries.lock().unwrap().clone()
    }

    pub fn has_searched(&self, query: &str) -> bool {
        self.queries.lock().unwrap().iter().any(|q| q == query)
    }

    /// Poll until `query` has been received
    pub async fn wait_for_query(&self, query: &str) {
        for _ in 0..1000 {
            if self.has_searched(query) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("query '{}' was never searched", query);
    }
}

#[async_trait]
impl SearchProvider for ScriptedSearch {
    fn name(&self) -> &str {
        "scripted-search"
    }

    async fn search(&self, query: &str, _top_k: usize) -> DeeprResult<Vec<SearchHit>> {
        self.queries.lock().unwrap().push(query.to_string());

        let delay = self.delays.lock().unwrap().get(query).copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.failures.lock().unwrap().contains(query) {
            return Err(DeeprError::provider(
                "scripted-search",
                format!("search failed for '{}'", query),
                None,
            ));
        }

        let canned = self.hits.lock().unwrap().get(query).cloned();
        Ok(canned.unwrap_or_else(|| default_hits(query)))
    }

    async fn fetch_document(&self, reference: &str) -> DeeprResult<FetchedDocument> {
        Ok(FetchedDocument {
            reference: reference.to_string(),
            title: Some(format!("Document {}", reference)),
            content: format!("Full text of {}", reference),
        })
    }
}

pub fn hit(url: &str, title: &str, content: &str) -> SearchHit {
    SearchHit {
        title: title.to_string(),
        url: url.to_string(),
        content: content.to_string(),
        raw_content: None,
    }
}

/// Two distinct hits derived from the query text
pub fn default_hits(query: &str) -> Vec<SearchHit> {
    let slug: String = query
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_lowercase() } else { '-' })
        .collect();
    (1..=2)
        .map(|i| {
            hit(
                &format!("https://source.test/{}/{}", slug, i),
                &format!("{} ({})", query, i),
                &format!("Evidence {} about {}.", i, query),
            )
        })
        .collect()
}

pub fn plan_json(queries: &[&str]) -> String {
    let actions: Vec<_> = queries
        .iter()
        .map(|q| json!({"type": "search", "query": q, "priority": 5}))
        .collect();
    json!({"actions": actions, "done": false, "reason": "scripted plan"}).to_string()
}

pub fn verdict_json(converged: bool) -> String {
    let rationale = if converged {
        "Evidence is sufficient."
    } else {
        "Gaps remain."
    };
    json!({
        "converged": converged,
        "unresolved": [],
        "rationale": rationale
    })
    .to_string()
}

pub fn extraction_json(findings: &[String], resolved: &[&str], new_questions: &[&str]) -> String {
    json!({
        "findings": findings,
        "resolved_questions": resolved,
        "new_questions": new_questions
    })
    .to_string()
}

/// The source text embedded in an extraction prompt
pub fn source_text(prompt: &str) -> String {
    let start = prompt.find("<source>").map(|i| i + "<source>".len());
    let end = prompt.find("</source>");
    match (start, end) {
        (Some(start), Some(end)) if start < end => prompt[start..end].trim().to_string(),
        _ => String::new(),
    }
}

/// Research settings tuned for fast tests
pub fn test_settings() -> ResearchSettings {
    ResearchSettings {
        default_max_loops: 5,
        ..ResearchSettings::default()
    }
}

pub fn test_search_config() -> SearchConfig {
    SearchConfig {
        timeout_ms: 2_000,
        ..SearchConfig::default()
    }
}

pub fn test_llm_settings() -> LlmSettings {
    LlmSettings {
        max_attempts: 2,
        initial_backoff_ms: 0,
        ..LlmSettings::default()
    }
}

/// Scripted backends plus the knobs used to build gateways over them
pub struct Harness {
    pub model: Arc<ScriptedModel>,
    pub search: Arc<ScriptedSearch>,
    pub settings: ResearchSettings,
    pub search_config: SearchConfig,
    pub llm_settings: LlmSettings,
}

impl Default for Harness {
    fn default() -> Self {
        init_logging();
        Self {
            model: Arc::new(ScriptedModel::new()),
            search: Arc::new(ScriptedSearch::new()),
            settings: test_settings(),
            search_config: test_search_config(),
            llm_settings: test_llm_settings(),
        }
    }
}

impl Harness {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn llm(&self) -> LlmGateway {
        LlmGateway::new(self.model.clone(), self.llm_settings.clone())
            .with_retry_config(RetryConfig::immediate(self.llm_settings.max_attempts))
    }

    pub fn tools(&self) -> ToolGateway {
        ToolGateway::new(self.search.clone(), self.search_config.clone())
    }

    pub fn controller(&self) -> ResearchController {
        ResearchController::new(self.llm(), self.tools(), self.settings.clone())
    }

    /// Run one session to completion without steering or cancellation
    pub async fn run(&self, query: &str, effort: EffortMode, max_loops: usize) -> ResearchReport {
        let (_steering, inbox) = steering_channel();
        let run = ResearchRun::new(
            Session::new(query, effort, max_loops),
            Vec::new(),
            inbox,
            CancellationToken::new(),
        );
        self.controller().run(run).await
    }
}
