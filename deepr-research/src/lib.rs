//! Deepr Research - the iterative deep-research controller
//!
//! Turns a natural-language query into a converged, cited report by looping
//! plan → act → synthesize → evaluate until the evidence is sufficient.
//!
//! ## Architecture
//!
//! - **Gateways** (`gateway`): uniform access to language models and tools
//! - **Research** (`research`): knowledge state, planner, synthesizer, gap
//!   analyzer, steering channel and the controller that drives them
//! - **Sessions** (`session`): the control surface used by API/UI layers and
//!   persistence of session records and loop records

pub mod gateway;
pub mod research;
pub mod session;

pub use gateway::{LlmGateway, ToolGateway};
pub use research::{
    steering_channel, Action, ActionKind, EffortMode, Finding, KnowledgeState, LoopRecord,
    ResearchController, ResearchProgress, ResearchReport, ResearchRun, Session, SessionStatus,
    Source, SourceRef, SteeringMessage, UploadedDocument,
};
pub use session::{FileSessionStore, SessionManager, SessionStore, StartRequest};

use deepr_core::DeeprError;
use serde::{Deserialize, Serialize};

/// Error classes reported with a failed session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    Provider,
    InvalidResponse,
    Planning,
    Tool,
    UnknownSource,
    Internal,
}

impl std::fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ErrorClass::Provider => "ProviderError",
            ErrorClass::InvalidResponse => "InvalidResponseError",
            ErrorClass::Planning => "PlanningError",
            ErrorClass::Tool => "ToolError",
            ErrorClass::UnknownSource => "UnknownSourceError",
            ErrorClass::Internal => "InternalError",
        };
        write!(f, "{}", name)
    }
}

/// Research-level error type
#[derive(Debug, thiserror::Error)]
pub enum ResearchError {
    #[error("Core error: {0}")]
    Core(#[from] DeeprError),

    #[error("Planning error: {message}")]
    Planning { message: String },

    #[error("Unknown source reference: {reference}")]
    UnknownSource { reference: String },

    #[error("Tool error: {message}")]
    Tool { message: String },

    #[error("Session error: {message}")]
    Session { message: String },

    #[error("Report not ready for session {session_id}")]
    NotReady { session_id: String },

    #[error("Not found: {message}")]
    NotFound { message: String },

    #[error("Validation error: {message}")]
    Validation { message: String },

    #[error("Research cancelled")]
    Cancelled,

    #[error("Storage error: {message}")]
    Storage { message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type ResearchResult<T> = Result<T, ResearchError>;

impl ResearchError {
    pub fn planning<S: Into<String>>(message: S) -> Self {
        Self::Planning {
            message: message.into(),
        }
    }

    pub fn session<S: Into<String>>(message: S) -> Self {
        Self::Session {
            message: message.into(),
        }
    }

    pub fn not_found<S: Into<String>>(message: S) -> Self {
        Self::NotFound {
            message: message.into(),
        }
    }

    pub fn validation<S: Into<String>>(message: S) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }

    pub fn storage<S: Into<String>>(message: S) -> Self {
        Self::Storage {
            message: message.into(),
        }
    }

    /// Invariant violations are never retried
    pub fn is_fatal(&self) -> bool {
        matches!(self, ResearchError::UnknownSource { .. })
    }

    pub fn is_cancelled(&self) -> bool {
        match self {
            ResearchError::Cancelled => true,
            ResearchError::Core(e) => e.is_cancelled(),
            _ => false,
        }
    }

    /// Position of this error in the research error taxonomy
    pub fn class(&self) -> ErrorClass {
        match self {
            ResearchError::Core(DeeprError::Provider { .. })
            | ResearchError::Core(DeeprError::Timeout { .. }) => ErrorClass::Provider,
            ResearchError::Core(DeeprError::InvalidResponse { .. }) => ErrorClass::InvalidResponse,
            ResearchError::Planning { .. } => ErrorClass::Planning,
            ResearchError::Tool { .. } => ErrorClass::Tool,
            ResearchError::UnknownSource { .. } => ErrorClass::UnknownSource,
            _ => ErrorClass::Internal,
        }
    }
}
