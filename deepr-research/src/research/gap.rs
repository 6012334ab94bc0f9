//! Gap analysis and the effort policy state machine
//!
//! `GapAnalyzer` produces one verdict per loop. `ConvergenceTracker` folds
//! verdicts, yields and loop failures into the analyzer state:
//! `Active -> Converging -> Done`, or `Failed`.

use super::knowledge::KnowledgeState;
use super::prompts;
use super::types::{AnalyzerState, EffortMode, FailureInfo, GapVerdict};
use crate::gateway::LlmGateway;
use crate::{ErrorClass, ResearchResult};
use deepr_core::{CallPurpose, CompletionRequest, ModelProfile, ResearchSettings};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Decides whether remaining gaps justify another loop
#[derive(Clone)]
pub struct GapAnalyzer {
    llm: LlmGateway,
    settings: ResearchSettings,
}

impl GapAnalyzer {
    pub fn new(llm: LlmGateway, settings: ResearchSettings) -> Self {
        Self { llm, settings }
    }

    pub async fn evaluate(
        &self,
        knowledge: &KnowledgeState,
        effort_mode: EffortMode,
        loop_index: usize,
        max_loops: usize,
        findings_added: usize,
        cancel: &CancellationToken,
    ) -> ResearchResult<GapVerdict> {
        if effort_mode == EffortMode::Quick {
            return Ok(GapVerdict {
                converging: true,
                unresolved: knowledge.open_questions().to_vec(),
                rationale: "Quick mode reports after the first loop".to_string(),
                forced: true,
            });
        }

        let request = CompletionRequest::new(
            CallPurpose::Reflect,
            ModelProfile::Primary,
            prompts::create_reflection_prompt(
                knowledge,
                effort_mode,
                loop_index,
                max_loops,
                findings_added,
            ),
        )
        .with_system(prompts::REFLECT_SYSTEM_PROMPT);

        let output = self.llm.complete_structured(request, cancel).await?;
        let mut verdict = GapVerdict {
            converging: output.bool_field("converged").unwrap_or(false),
            unresolved: output.string_list("unresolved"),
            rationale: output
                .str_field("rationale")
                .unwrap_or_default()
                .trim()
                .to_string(),
            forced: false,
        };

        if effort_mode == EffortMode::Extra && verdict.converging {
            let sources = knowledge.distinct_cited_sources();
            if loop_index < self.settings.extra_min_loops
                || sources < self.settings.extra_min_distinct_sources
            {
                verdict.converging = false;
                verdict.rationale = format!(
                    "{} Extra effort requires at least {} loops and {} distinct sources (have {} and {}).",
                    verdict.rationale,
                    self.settings.extra_min_loops,
                    self.settings.extra_min_distinct_sources,
                    loop_index,
                    sources
                )
                .trim()
                .to_string();
            }
        }

        debug!(
            loop_index = loop_index,
            converging = verdict.converging,
            unresolved = verdict.unresolved.len(),
            "Gap verdict"
        );
        Ok(verdict)
    }
}

/// Tracks consecutive verdicts, zero-yield loops and loop failures
#[derive(Debug, Clone)]
pub struct ConvergenceTracker {
    state: AnalyzerState,
    convergence_streak: usize,
    zero_yield_streak: usize,
    failure_streak: usize,
    required_streak: usize,
    zero_yield_tolerance: usize,
    failure_tolerance: usize,
    failure: Option<FailureInfo>,
}

impl ConvergenceTracker {
    pub fn new(settings: &ResearchSettings) -> Self {
        Self {
            state: AnalyzerState::Active,
            convergence_streak: 0,
            zero_yield_streak: 0,
            failure_streak: 0,
            required_streak: settings.convergence_streak.max(1),
            zero_yield_tolerance: settings.zero_yield_tolerance,
            failure_tolerance: settings.loop_failure_tolerance.max(1),
            failure: None,
        }
    }

    pub fn state(&self) -> AnalyzerState {
        self.state
    }

    /// The failure that moved the tracker to `Failed`
    pub fn failure(&self) -> Option<&FailureInfo> {
        self.failure.as_ref()
    }

    /// Record a completed loop with its verdict and the number of raw results
    /// the tool gateway delivered
    pub fn observe(&mut self, verdict: &GapVerdict, usable_results: usize) -> AnalyzerState {
        if self.state.is_terminal() {
            return self.state;
        }
        self.failure_streak = 0;

        if usable_results == 0 {
            self.zero_yield_streak += 1;
            if self.zero_yield_streak > self.zero_yield_tolerance {
                warn!(
                    streak = self.zero_yield_streak,
                    "Tool gateway returned no usable results for too many loops"
                );
                return self.fail(FailureInfo {
                    class: ErrorClass::Tool,
                    message: format!(
                        "no usable tool results for {} consecutive loops",
                        self.zero_yield_streak
                    ),
                });
            }
        } else {
            self.zero_yield_streak = 0;
        }

        self.state = if verdict.converging && verdict.forced {
            AnalyzerState::Done
        } else if verdict.converging {
            self.convergence_streak += 1;
            if self.convergence_streak >= self.required_streak {
                AnalyzerState::Done
            } else {
                AnalyzerState::Converging
            }
        } else {
            self.convergence_streak = 0;
            AnalyzerState::Active
        };

        if self.state == AnalyzerState::Done {
            info!("Research converged");
        }
        self.state
    }

    /// Record a loop-local failure (planning, extraction or gap analysis)
    pub fn record_failure(&mut self, failure: FailureInfo) -> AnalyzerState {
        if self.state.is_terminal() {
            return self.state;
        }
        self.failure_streak += 1;
        self.convergence_streak = 0;

        if self.failure_streak >= self.failure_tolerance {
            warn!(
                streak = self.failure_streak,
                class = %failure.class,
                "Loop failures exceeded tolerance"
            );
            return self.fail(failure);
        }
        self.state = AnalyzerState::Active;
        self.state
    }

    /// Record an error that ends the session immediately
    pub fn fail(&mut self, failure: FailureInfo) -> AnalyzerState {
        self.failure = Some(failure);
        self.state = AnalyzerState::Failed;
        self.state
    }
}
