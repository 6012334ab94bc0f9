//! Types for the research loop

use crate::ErrorClass;
use chrono::{DateTime, Utc};
use deepr_core::SearchHit;
use serde::{Deserialize, Serialize};

/// Policy controlling loop count and convergence strictness
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EffortMode {
    /// One loop, then report
    Quick,
    #[default]
    Standard,
    /// Minimum loop count and source diversity before convergence is accepted
    Extra,
}

impl std::fmt::Display for EffortMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EffortMode::Quick => write!(f, "quick"),
            EffortMode::Standard => write!(f, "standard"),
            EffortMode::Extra => write!(f, "extra"),
        }
    }
}

impl std::str::FromStr for EffortMode {
    type Err = crate::ResearchError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "quick" => Ok(EffortMode::Quick),
            "standard" => Ok(EffortMode::Standard),
            "extra" => Ok(EffortMode::Extra),
            other => Err(crate::ResearchError::validation(format!(
                "unknown effort mode '{}'",
                other
            ))),
        }
    }
}

/// Lifecycle status of a research session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Running,
    Converged,
    Cancelled,
    Failed,
}

impl SessionStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, SessionStatus::Running)
    }
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionStatus::Running => write!(f, "running"),
            SessionStatus::Converged => write!(f, "converged"),
            SessionStatus::Cancelled => write!(f, "cancelled"),
            SessionStatus::Failed => write!(f, "failed"),
        }
    }
}

/// The error that moved a session to `Failed`, or a loop-local failure
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureInfo {
    pub class: ErrorClass,
    pub message: String,
}

impl FailureInfo {
    pub fn from_error(error: &crate::ResearchError) -> Self {
        Self {
            class: error.class(),
            message: error.to_string(),
        }
    }
}

/// Session metadata and status
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    /// Unique session identifier
    pub id: String,
    /// Original research query
    pub query: String,
    pub effort_mode: EffortMode,
    /// Loop ceiling for this session
    pub max_loops: usize,
    /// Number of completed loops
    pub loop_index: usize,
    pub status: SessionStatus,
    pub created_at: DateTime<Utc>,
    pub finalized_at: Option<DateTime<Utc>>,
    /// Set when the session ended in `Failed`
    pub failure: Option<FailureInfo>,
}

impl Session {
    pub fn new(query: impl Into<String>, effort_mode: EffortMode, max_loops: usize) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            query: query.into(),
            effort_mode,
            max_loops,
            loop_index: 0,
            status: SessionStatus::Running,
            created_at: Utc::now(),
            finalized_at: None,
            failure: None,
        }
    }
}

/// Stable handle of a registered source (its deduplication key)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SourceRef(String);

impl SourceRef {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for SourceRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// How much of a source's content was retrieved
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FetchStatus {
    /// Only the search snippet is available
    Snippet,
    /// Full page or document content was retrieved
    Fetched,
    /// Supplied by the user with the request
    Uploaded,
}

/// A source seen by the research loop
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Source {
    pub reference: SourceRef,
    /// URL or document identifier as first seen
    pub identifier: String,
    pub title: String,
    pub fetch_status: FetchStatus,
    /// Loop in which the source was first registered
    pub first_seen_loop: usize,
}

/// Input to `KnowledgeState::add_source`
#[derive(Debug, Clone, PartialEq)]
pub struct SourceCandidate {
    pub identifier: String,
    pub title: String,
    pub fetch_status: FetchStatus,
}

impl SourceCandidate {
    pub fn from_hit(hit: &SearchHit) -> Self {
        Self {
            identifier: hit.url.clone(),
            title: hit.title.clone(),
            fetch_status: if hit.raw_content.is_some() {
                FetchStatus::Fetched
            } else {
                FetchStatus::Snippet
            },
        }
    }
}

/// An atomic piece of extracted knowledge attributed to a source
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Finding {
    pub content: String,
    pub source: SourceRef,
    /// Loop that produced this finding
    pub loop_index: usize,
    /// Hash of the normalized content
    pub content_hash: String,
}

/// Requested tool invocation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ActionKind {
    Search { query: String, top_k: usize },
    FetchDocument { reference: String },
    Auxiliary { tool: String, input: String },
}

impl std::fmt::Display for ActionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ActionKind::Search { query, .. } => write!(f, "search: {}", query),
            ActionKind::FetchDocument { reference } => write!(f, "fetch: {}", reference),
            ActionKind::Auxiliary { tool, input } => write!(f, "{}: {}", tool, input),
        }
    }
}

/// An action emitted by the planner for one loop
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Action {
    /// Position in the loop's batch
    pub id: usize,
    pub kind: ActionKind,
    pub rationale: Option<String>,
    /// 1-10, higher runs first when the batch is capped
    pub priority: u8,
}

/// Raw results of one successful action
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ToolResult {
    pub hits: Vec<SearchHit>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolErrorKind {
    Timeout,
    Provider,
    Unsupported,
    Failed,
}

/// Failure of a single action
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, thiserror::Error)]
#[error("{kind:?}: {message}")]
pub struct ToolError {
    pub kind: ToolErrorKind,
    pub message: String,
}

impl ToolError {
    pub fn new(kind: ToolErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

/// An action paired with its outcome
#[derive(Debug, Clone)]
pub struct ActionOutcome {
    pub action: Action,
    pub result: Result<ToolResult, ToolError>,
    pub elapsed_ms: u64,
}

impl ActionOutcome {
    pub fn result_count(&self) -> usize {
        self.result.as_ref().map(|r| r.hits.len()).unwrap_or(0)
    }
}

/// Audit entry for an executed action
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionLog {
    pub action: Action,
    pub result_count: usize,
    pub error: Option<ToolError>,
    pub elapsed_ms: u64,
}

impl From<&ActionOutcome> for ActionLog {
    fn from(outcome: &ActionOutcome) -> Self {
        Self {
            action: outcome.action.clone(),
            result_count: outcome.result_count(),
            error: outcome.result.as_ref().err().cloned(),
            elapsed_ms: outcome.elapsed_ms,
        }
    }
}

/// Operator guidance injected mid-run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SteeringMessage {
    /// Monotonic per-session sequence number
    pub seq: u64,
    pub text: String,
    pub submitted_at: DateTime<Utc>,
}

/// Gap analysis verdict for one loop
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GapVerdict {
    /// Further loops would not materially improve the answer
    pub converging: bool,
    /// Gaps still considered material
    pub unresolved: Vec<String>,
    pub rationale: String,
    /// Verdict imposed by policy rather than asked of the model
    pub forced: bool,
}

/// Gap analyzer state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnalyzerState {
    Active,
    Converging,
    Done,
    Cancelled,
    Failed,
}

impl AnalyzerState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            AnalyzerState::Done | AnalyzerState::Cancelled | AnalyzerState::Failed
        )
    }
}

/// Why a session stopped looping
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum TerminationReason {
    Converged,
    MaxLoops,
    NoFurtherActions { detail: String },
    Cancelled,
    Failed { failure: FailureInfo },
}

impl TerminationReason {
    pub fn status(&self) -> SessionStatus {
        match self {
            TerminationReason::Converged
            | TerminationReason::MaxLoops
            | TerminationReason::NoFurtherActions { .. } => SessionStatus::Converged,
            TerminationReason::Cancelled => SessionStatus::Cancelled,
            TerminationReason::Failed { .. } => SessionStatus::Failed,
        }
    }
}

/// Frozen record of one completed loop iteration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoopRecord {
    /// 1-based loop index
    pub loop_index: usize,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    /// Steering message consumed at the start of this loop
    pub steering: Option<SteeringMessage>,
    pub actions: Vec<ActionLog>,
    pub sources_added: Vec<Source>,
    pub findings_added: Vec<Finding>,
    pub questions_added: Vec<String>,
    pub questions_resolved: Vec<String>,
    pub verdict: Option<GapVerdict>,
    pub rationale: String,
    /// One-line note for progress displays
    pub activity: Option<String>,
    /// Running summary after this loop
    pub summary: Option<String>,
    /// Loop-local failure that did not end the session
    pub failure: Option<FailureInfo>,
}

impl LoopRecord {
    pub fn findings_count(&self) -> usize {
        self.findings_added.len()
    }
}

/// Final or partial research report
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResearchReport {
    pub session_id: String,
    pub query: String,
    pub status: SessionStatus,
    /// Complete Markdown document including the sources section
    pub markdown: String,
    /// All sources, numbered in citation order
    pub sources: Vec<Source>,
    pub findings: Vec<Finding>,
    pub loops: Vec<LoopRecord>,
    pub termination: TerminationReason,
    pub failure: Option<FailureInfo>,
    pub generated_at: DateTime<Utc>,
}

/// Live view of a running session
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResearchProgress {
    pub session_id: String,
    pub status: SessionStatus,
    /// Completed loops
    pub loop_index: usize,
    pub max_loops: usize,
    pub analyzer_state: AnalyzerState,
    pub current_findings: Vec<Finding>,
    pub source_count: usize,
    pub open_questions: Vec<String>,
    pub last_activity: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl ResearchProgress {
    pub fn starting(session: &Session) -> Self {
        Self {
            session_id: session.id.clone(),
            status: session.status,
            loop_index: session.loop_index,
            max_loops: session.max_loops,
            analyzer_state: AnalyzerState::Active,
            current_findings: Vec::new(),
            source_count: 0,
            open_questions: Vec::new(),
            last_activity: None,
            updated_at: Utc::now(),
        }
    }
}

/// Already-extracted document supplied with a research request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UploadedDocument {
    pub name: String,
    pub content: String,
}

impl UploadedDocument {
    pub fn identifier(&self) -> String {
        format!("upload://{}", self.name.trim())
    }
}
