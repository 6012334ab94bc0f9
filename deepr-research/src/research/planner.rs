//! Query planner: turns the knowledge state into the next batch of actions

use super::knowledge::KnowledgeState;
use super::prompts::{self, PlanningContext};
use super::types::{Action, ActionKind, EffortMode, SteeringMessage};
use crate::gateway::LlmGateway;
use crate::{ResearchError, ResearchResult};
use deepr_core::{CallPurpose, CompletionRequest, DeeprError, ModelProfile, ResearchSettings};
use serde::Deserialize;
use serde_json::Value;
use std::collections::HashSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const DEFAULT_PRIORITY: u8 = 5;
const MAX_TOP_K: usize = 20;

/// Result of one planning call
#[derive(Debug, Clone, PartialEq)]
pub enum PlanOutcome {
    Actions(Vec<Action>),
    /// The planner judged the query answered
    NoFurtherActions { reason: String },
}

/// Everything the planner looks at for one loop
pub struct PlanRequest<'a> {
    pub knowledge: &'a KnowledgeState,
    pub effort_mode: EffortMode,
    pub loop_index: usize,
    pub max_loops: usize,
    pub steering: Option<&'a SteeringMessage>,
    /// `(name, description)` of registered auxiliary tools
    pub tools: &'a [(String, String)],
    /// Identifiers of user-provided documents
    pub uploads: &'a [String],
    pub default_top_k: usize,
}

#[derive(Debug, Deserialize)]
struct RawPlan {
    #[serde(default)]
    actions: Vec<RawAction>,
    #[serde(default)]
    done: bool,
    #[serde(default)]
    reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawAction {
    #[serde(rename = "type", default)]
    kind: Option<String>,
    query: Option<String>,
    reference: Option<String>,
    tool: Option<String>,
    input: Option<String>,
    top_k: Option<usize>,
    priority: Option<Value>,
    rationale: Option<String>,
}

impl RawAction {
    fn priority(&self) -> u8 {
        let value = match &self.priority {
            Some(Value::Number(n)) => n.as_f64(),
            Some(Value::String(s)) => s.trim().parse::<f64>().ok(),
            _ => None,
        };
        value
            .map(|p| p.round().clamp(1.0, 10.0) as u8)
            .unwrap_or(DEFAULT_PRIORITY)
    }

    fn into_kind(self, request: &PlanRequest<'_>) -> Option<ActionKind> {
        let non_empty = |s: Option<String>| s.map(|s| s.trim().to_string()).filter(|s| !s.is_empty());
        let kind = self.kind.as_deref().map(str::to_ascii_lowercase);

        match kind.as_deref() {
            Some("search") | Some("web_search") | None => {
                let query = non_empty(self.query)?;
                let top_k = self
                    .top_k
                    .unwrap_or(request.default_top_k)
                    .clamp(1, MAX_TOP_K);
                Some(ActionKind::Search { query, top_k })
            }
            Some("fetch") | Some("fetch_document") => Some(ActionKind::FetchDocument {
                reference: non_empty(self.reference.or(self.query))?,
            }),
            Some("tool") | Some("auxiliary") => {
                let tool = non_empty(self.tool)?;
                if !request.tools.iter().any(|(name, _)| name == &tool) {
                    warn!(tool = %tool, "Planner requested an unknown tool, dropping action");
                    return None;
                }
                Some(ActionKind::Auxiliary {
                    tool,
                    input: non_empty(self.input.or(self.query)).unwrap_or_default(),
                })
            }
            Some(other) => {
                warn!(kind = other, "Planner emitted an unknown action type, dropping action");
                None
            }
        }
    }
}

/// Plans the actions of each research loop
#[derive(Clone)]
pub struct QueryPlanner {
    llm: LlmGateway,
    settings: ResearchSettings,
}

impl QueryPlanner {
    pub fn new(llm: LlmGateway, settings: ResearchSettings) -> Self {
        Self { llm, settings }
    }

    /// Produce this loop's actions.
    ///
    /// Unusable model output becomes `ResearchError::Planning`; provider
    /// faults and cancellation pass through unchanged.
    pub async fn plan(
        &self,
        request: &PlanRequest<'_>,
        cancel: &CancellationToken,
    ) -> ResearchResult<PlanOutcome> {
        let ctx = PlanningContext {
            knowledge: request.knowledge,
            effort_mode: request.effort_mode,
            loop_index: request.loop_index,
            max_loops: request.max_loops,
            max_actions: self.settings.max_actions_per_loop,
            recent_findings: self.settings.recent_findings_window,
            steering: request.steering,
            tools: request.tools,
            uploads: request.uploads,
            default_top_k: request.default_top_k,
        };
        let completion = CompletionRequest::new(
            CallPurpose::Plan,
            ModelProfile::Primary,
            prompts::create_planning_prompt(&ctx),
        )
        .with_system(prompts::PLANNER_SYSTEM_PROMPT);

        let output = match self.llm.complete_structured(completion, cancel).await {
            Ok(output) => output,
            Err(error @ DeeprError::InvalidResponse { .. }) => {
                return Err(ResearchError::planning(format!(
                    "planner output unusable: {}",
                    error
                )))
            }
            Err(error) => return Err(error.into()),
        };

        let raw: RawPlan = output
            .decode()
            .map_err(|e| ResearchError::planning(format!("planner output has wrong shape: {}", e)))?;

        self.select_actions(raw, request)
    }

    fn select_actions(
        &self,
        raw: RawPlan,
        request: &PlanRequest<'_>,
    ) -> ResearchResult<PlanOutcome> {
        let proposed = raw.actions.len();
        let done = raw.done;
        let reason = raw
            .reason
            .map(|r| r.trim().to_string())
            .filter(|r| !r.is_empty());

        let mut seen = HashSet::new();
        let mut skipped_repeats = 0;
        let mut candidates: Vec<(u8, String, ActionKind)> = Vec::new();

        for raw_action in raw.actions {
            let priority = raw_action.priority();
            let rationale = raw_action.rationale.clone().unwrap_or_default();
            let Some(kind) = raw_action.into_kind(request) else {
                continue;
            };

            if let ActionKind::Search { query, .. } = &kind {
                if request.knowledge.has_executed(query) {
                    skipped_repeats += 1;
                    continue;
                }
            }
            if !seen.insert(kind.to_string().to_lowercase()) {
                continue;
            }
            candidates.push((priority, rationale, kind));
        }

        // Stable: equal priorities keep the planner's order
        candidates.sort_by(|a, b| b.0.cmp(&a.0));
        candidates.truncate(self.settings.max_actions_per_loop);

        let actions: Vec<Action> = candidates
            .into_iter()
            .enumerate()
            .map(|(id, (priority, rationale, kind))| Action {
                id,
                kind,
                rationale: Some(rationale).filter(|r| !r.trim().is_empty()),
                priority,
            })
            .collect();

        if !actions.is_empty() {
            info!(
                loop_index = request.loop_index,
                proposed = proposed,
                action_count = actions.len(),
                steered = request.steering.is_some(),
                "Planned actions"
            );
            return Ok(PlanOutcome::Actions(actions));
        }

        if done {
            return Ok(PlanOutcome::NoFurtherActions {
                reason: reason.unwrap_or_else(|| "planner reported the query answered".to_string()),
            });
        }
        if skipped_repeats > 0 {
            debug!(skipped = skipped_repeats, "Every proposed query was already executed");
            return Ok(PlanOutcome::NoFurtherActions {
                reason: "every proposed query was already executed".to_string(),
            });
        }

        Err(ResearchError::planning(format!(
            "planner proposed no usable actions ({} proposed)",
            proposed
        )))
    }
}
