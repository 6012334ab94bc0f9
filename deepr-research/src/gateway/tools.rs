//! Tool gateway: concurrent, per-action bounded execution of planner actions

use crate::research::types::{Action, ActionKind, ActionOutcome, ToolError, ToolErrorKind, ToolResult};
use deepr_core::{AuxiliaryTool, DeeprError, SearchConfig, SearchHit, SearchProvider};
use futures::stream::{self, StreamExt};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Uniform interface over web search, document retrieval and auxiliary tools
#[derive(Clone)]
pub struct ToolGateway {
    search: Arc<dyn SearchProvider>,
    /// Auxiliary tools by name
    tools: BTreeMap<String, Arc<dyn AuxiliaryTool>>,
    config: SearchConfig,
}

impl ToolGateway {
    pub fn new(search: Arc<dyn SearchProvider>, config: SearchConfig) -> Self {
        Self {
            search,
            tools: BTreeMap::new(),
            config,
        }
    }

    /// Register an auxiliary tool the planner may call by name
    pub fn with_tool(mut self, tool: Arc<dyn AuxiliaryTool>) -> Self {
        self.tools.insert(tool.name().to_string(), tool);
        self
    }

    /// `(name, description)` of every auxiliary tool, sorted by name
    pub fn tool_descriptions(&self) -> Vec<(String, String)> {
        self.tools
            .values()
            .map(|t| (t.name().to_string(), t.description().to_string()))
            .collect()
    }

    pub fn has_tool(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    pub fn default_top_k(&self) -> usize {
        self.config.top_k
    }

    fn action_timeout(&self) -> Duration {
        Duration::from_millis(self.config.timeout_ms)
    }

    /// Execute one action under the per-action deadline
    pub async fn execute(&self, action: &Action) -> Result<ToolResult, ToolError> {
        let deadline = self.action_timeout();
        match tokio::time::timeout(deadline, self.run(&action.kind)).await {
            Ok(Ok(hits)) => Ok(ToolResult { hits }),
            Ok(Err(error)) => Err(classify(error)),
            Err(_) => Err(ToolError::new(
                ToolErrorKind::Timeout,
                format!("{} timed out after {}ms", action.kind, deadline.as_millis()),
            )),
        }
    }

    /// Execute a batch concurrently. Outcomes are returned in action order and
    /// a failed action never affects its siblings.
    pub async fn execute_batch(&self, actions: &[Action]) -> Vec<ActionOutcome> {
        let limit = self.config.max_concurrent_actions.max(1);
        debug!(action_count = actions.len(), limit = limit, "Dispatching action batch");

        let outcomes: Vec<ActionOutcome> = stream::iter(actions.iter().cloned())
            .map(|action| async move {
                let started = Instant::now();
                let result = self.execute(&action).await;
                if let Err(error) = &result {
                    warn!(action = %action.kind, kind = ?error.kind, "Action failed: {}", error.message);
                }
                ActionOutcome {
                    action,
                    result,
                    elapsed_ms: started.elapsed().as_millis() as u64,
                }
            })
            .buffered(limit)
            .collect()
            .await;

        let failed = outcomes.iter().filter(|o| o.result.is_err()).count();
        debug!(
            action_count = outcomes.len(),
            failed = failed,
            "Action batch complete"
        );
        outcomes
    }

    async fn run(&self, kind: &ActionKind) -> Result<Vec<SearchHit>, DeeprError> {
        match kind {
            ActionKind::Search { query, top_k } => {
                let top_k = if *top_k == 0 { self.config.top_k } else { *top_k };
                let mut hits = self.search.search(query, top_k).await?;
                hits.truncate(top_k);
                if !self.config.include_raw_content {
                    for hit in &mut hits {
                        hit.raw_content = None;
                    }
                }
                Ok(hits)
            }
            ActionKind::FetchDocument { reference } => {
                let document = self.search.fetch_document(reference).await?;
                Ok(vec![SearchHit {
                    title: document.title.unwrap_or_else(|| reference.clone()),
                    url: document.reference,
                    raw_content: Some(document.content.clone()),
                    content: document.content,
                }])
            }
            ActionKind::Auxiliary { tool, input } => match self.tools.get(tool) {
                Some(tool) => tool.invoke(input).await,
                None => Err(DeeprError::Unsupported {
                    message: format!("unknown tool '{}'", tool),
                    context: deepr_core::ErrorContext::new("tool_gateway")
                        .with_operation("auxiliary"),
                }),
            },
        }
    }
}

fn classify(error: DeeprError) -> ToolError {
    let kind = match &error {
        DeeprError::Timeout { .. } => ToolErrorKind::Timeout,
        DeeprError::Provider { .. } => ToolErrorKind::Provider,
        DeeprError::Unsupported { .. } => ToolErrorKind::Unsupported,
        _ => ToolErrorKind::Failed,
    };
    ToolError::new(kind, error.to_string())
}
