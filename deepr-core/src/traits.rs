//! Provider capability contracts
//!
//! Concrete LLM vendors, web-search APIs and document parsers live outside this
//! workspace. They plug in by implementing these traits.

use crate::config::ModelConfig;
use crate::error::DeeprResult;
use crate::types::*;
use async_trait::async_trait;

/// A completion backend for one or more models
#[async_trait]
pub trait LanguageModel: Send + Sync {
    /// Backend name used in logs
    fn name(&self) -> &str;

    /// Run one completion with the settings of the selected profile.
    ///
    /// Transport and rate-limit faults must be reported as
    /// `DeeprError::Provider` so the gateway can retry them.
    async fn complete(&self, model: &ModelConfig, request: &CompletionRequest)
        -> DeeprResult<String>;
}

/// Web search and document retrieval backend
#[async_trait]
pub trait SearchProvider: Send + Sync {
    fn name(&self) -> &str;

    /// Results in provider-defined relevance order
    async fn search(&self, query: &str, top_k: usize) -> DeeprResult<Vec<SearchHit>>;

    async fn fetch_document(&self, reference: &str) -> DeeprResult<FetchedDocument>;
}

/// Any other named tool the planner may call (database query, code search, ...)
#[async_trait]
pub trait AuxiliaryTool: Send + Sync {
    fn name(&self) -> &str;

    /// Short description shown to the planner
    fn description(&self) -> &str;

    async fn invoke(&self, input: &str) -> DeeprResult<Vec<SearchHit>>;
}
