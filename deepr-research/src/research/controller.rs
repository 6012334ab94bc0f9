//! Research controller: drives one session through the research loop
//!
//! Per loop, in order: observe cancellation, take at most one steering
//! message, plan, dispatch the actions, synthesize, ask the gap analyzer,
//! append the loop record, advance the loop index. Then loop or finalize.

use super::gap::{ConvergenceTracker, GapAnalyzer};
use super::history::AuditTrail;
use super::knowledge::{KnowledgeSnapshot, KnowledgeState};
use super::planner::{PlanOutcome, PlanRequest, QueryPlanner};
use super::prompts;
use super::report;
use super::steering::SteeringInbox;
use super::synthesizer::Synthesizer;
use super::types::*;
use crate::gateway::{LlmGateway, ToolGateway};
use crate::session::SessionStore;
use crate::{ErrorClass, ResearchError, ResearchResult};
use chrono::Utc;
use deepr_core::performance::measure_async;
use deepr_core::{CallPurpose, CompletionRequest, ModelProfile, ResearchSettings};
use std::sync::Arc;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};

/// Mutable state of one session while its loop runs
pub struct ResearchRun {
    pub session: Session,
    knowledge: KnowledgeState,
    trail: AuditTrail,
    uploads: Vec<UploadedDocument>,
    /// Uploads are merged by the first loop that reaches synthesis
    uploads_merged: bool,
    inbox: SteeringInbox,
    cancel: CancellationToken,
    progress: Option<watch::Sender<ResearchProgress>>,
    last_activity: Option<String>,
}

impl ResearchRun {
    pub fn new(
        session: Session,
        uploads: Vec<UploadedDocument>,
        inbox: SteeringInbox,
        cancel: CancellationToken,
    ) -> Self {
        let knowledge = KnowledgeState::new(session.query.clone());
        Self {
            session,
            knowledge,
            trail: AuditTrail::new(),
            uploads,
            uploads_merged: false,
            inbox,
            cancel,
            progress: None,
            last_activity: None,
        }
    }

    /// Continue a session from its persisted loop records
    pub fn resume(
        mut session: Session,
        records: Vec<LoopRecord>,
        uploads: Vec<UploadedDocument>,
        inbox: SteeringInbox,
        cancel: CancellationToken,
    ) -> ResearchResult<Self> {
        let knowledge = KnowledgeState::replay(session.query.clone(), &records)?;
        let trail = AuditTrail::from_records(records)?;
        let last_activity = trail.last().and_then(|r| r.activity.clone());
        let uploads_merged = uploads.iter().all(|upload| {
            let identifier = upload.identifier();
            knowledge.sources().iter().any(|s| s.identifier == identifier)
        });

        session.loop_index = trail.len();
        session.status = SessionStatus::Running;
        session.finalized_at = None;
        session.failure = None;

        Ok(Self {
            session,
            knowledge,
            trail,
            uploads,
            uploads_merged,
            inbox,
            cancel,
            progress: None,
            last_activity,
        })
    }

    /// Publish progress snapshots on this channel
    pub fn with_progress(mut self, progress: watch::Sender<ResearchProgress>) -> Self {
        self.progress = Some(progress);
        self
    }

    pub fn knowledge(&self) -> &KnowledgeState {
        &self.knowledge
    }

    pub fn loops(&self) -> &[LoopRecord] {
        self.trail.records()
    }

    /// Uploaded documents not yet merged into the knowledge state
    pub fn pending_uploads(&self) -> &[UploadedDocument] {
        if self.uploads_merged {
            &[]
        } else {
            &self.uploads
        }
    }

    fn publish(&self, analyzer_state: AnalyzerState) {
        if let Some(progress) = &self.progress {
            progress.send_replace(ResearchProgress {
                session_id: self.session.id.clone(),
                status: self.session.status,
                loop_index: self.session.loop_index,
                max_loops: self.session.max_loops,
                analyzer_state,
                current_findings: self.knowledge.findings().to_vec(),
                source_count: self.knowledge.source_count(),
                open_questions: self.knowledge.open_questions().to_vec(),
                last_activity: self.last_activity.clone(),
                updated_at: Utc::now(),
            });
        }
    }
}

/// Orchestrates planner, tool gateway, synthesizer and gap analyzer
pub struct ResearchController {
    llm: LlmGateway,
    tools: ToolGateway,
    planner: QueryPlanner,
    synthesizer: Synthesizer,
    analyzer: GapAnalyzer,
    settings: ResearchSettings,
    store: Option<Arc<dyn SessionStore>>,
}

impl ResearchController {
    pub fn new(llm: LlmGateway, tools: ToolGateway, settings: ResearchSettings) -> Self {
        Self {
            planner: QueryPlanner::new(llm.clone(), settings.clone()),
            synthesizer: Synthesizer::new(llm.clone(), settings.clone()),
            analyzer: GapAnalyzer::new(llm.clone(), settings.clone()),
            llm,
            tools,
            settings,
            store: None,
        }
    }

    /// Persist session and loop records through `store`
    pub fn with_store(mut self, store: Arc<dyn SessionStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn store(&self) -> Option<&Arc<dyn SessionStore>> {
        self.store.as_ref()
    }

    pub fn settings(&self) -> &ResearchSettings {
        &self.settings
    }

    /// Run a session to a terminal status and return its report
    pub async fn run(&self, mut run: ResearchRun) -> ResearchReport {
        let mut tracker = ConvergenceTracker::new(&self.settings);
        info!(
            session_id = %run.session.id,
            effort = %run.session.effort_mode,
            max_loops = run.session.max_loops,
            resumed_at = run.session.loop_index,
            "Starting research"
        );
        run.publish(tracker.state());

        let termination = loop {
            if run.cancel.is_cancelled() {
                info!(session_id = %run.session.id, "Cancellation observed at loop boundary");
                break TerminationReason::Cancelled;
            }
            if run.session.loop_index >= run.session.max_loops {
                info!(session_id = %run.session.id, "Loop ceiling reached");
                break TerminationReason::MaxLoops;
            }

            let loop_index = run.session.loop_index + 1;
            let span = info_span!(
                "research_loop",
                session_id = %run.session.id,
                loop_index = loop_index
            );
            let step = self
                .run_loop(&mut run, &mut tracker, loop_index)
                .instrument(span)
                .await;
            run.publish(tracker.state());

            if let Some(reason) = step {
                break reason;
            }
        };

        self.finalize(run, termination).await
    }

    async fn run_loop(
        &self,
        run: &mut ResearchRun,
        tracker: &mut ConvergenceTracker,
        loop_index: usize,
    ) -> Option<TerminationReason> {
        let started_at = Utc::now();
        let steering = run.inbox.take_active();
        if let Some(message) = &steering {
            info!(seq = message.seq, "Applying steering message");
        }

        let mut record = LoopRecord {
            loop_index,
            started_at,
            completed_at: started_at,
            steering: steering.clone(),
            actions: Vec::new(),
            sources_added: Vec::new(),
            findings_added: Vec::new(),
            questions_added: Vec::new(),
            questions_resolved: Vec::new(),
            verdict: None,
            rationale: String::new(),
            activity: None,
            summary: None,
            failure: None,
        };

        let actions = match self.plan_with_retry(run, loop_index, steering.as_ref()).await {
            Ok(PlanOutcome::Actions(actions)) => actions,
            Ok(PlanOutcome::NoFurtherActions { reason }) => {
                info!(reason = %reason, "Planner reports no further actions");
                return self.finish_without_actions(run, tracker, record, reason).await;
            }
            Err(e) if e.is_cancelled() => return Some(TerminationReason::Cancelled),
            Err(e) => {
                warn!(error = %e, "Planning failed");
                if !run.pending_uploads().is_empty() {
                    if let Err(stop) = self.merge_results(run, tracker, &[], &mut record).await {
                        return Some(stop);
                    }
                }
                if record.failure.is_none() {
                    record.rationale = "Planning failed; no actions were dispatched".to_string();
                    self.loop_failure(tracker, &mut record, &e);
                }
                return self.commit_loop(run, tracker, record).await;
            }
        };

        let outcomes = measure_async("action_batch", self.tools.execute_batch(&actions)).await;
        record.actions = outcomes.iter().map(ActionLog::from).collect();

        if run.cancel.is_cancelled() {
            info!(
                action_count = outcomes.len(),
                "Cancellation observed after dispatch, discarding results"
            );
            return Some(TerminationReason::Cancelled);
        }

        let usable_results = outcomes.iter().map(ActionOutcome::result_count).sum::<usize>()
            + run.pending_uploads().len();
        if let Err(reason) = self.merge_results(run, tracker, &outcomes, &mut record).await {
            return Some(reason);
        }

        if record.failure.is_none() {
            match self
                .analyzer
                .evaluate(
                    &run.knowledge,
                    run.session.effort_mode,
                    loop_index,
                    run.session.max_loops,
                    record.findings_added.len(),
                    &run.cancel,
                )
                .await
            {
                Ok(verdict) => {
                    record.rationale = verdict.rationale.clone();
                    tracker.observe(&verdict, usable_results);
                    record.verdict = Some(verdict);
                }
                Err(e) if e.is_cancelled() => {
                    // Findings are already merged; keep the loop and stop at the boundary
                    record.rationale = "Cancelled during gap analysis".to_string();
                }
                Err(e) => {
                    warn!(error = %e, "Gap analysis failed");
                    record.rationale = "Gap analysis failed".to_string();
                    self.loop_failure(tracker, &mut record, &e);
                }
            }
        }

        if self.settings.enable_activity_notes && !run.cancel.is_cancelled() {
            record.activity = self.activity_note(run, &record).await;
        }

        self.commit_loop(run, tracker, record).await
    }

    /// Fold tool outcomes and any pending uploads into the knowledge state
    async fn merge_results(
        &self,
        run: &mut ResearchRun,
        tracker: &mut ConvergenceTracker,
        outcomes: &[ActionOutcome],
        record: &mut LoopRecord,
    ) -> Result<(), TerminationReason> {
        let uploads: &[UploadedDocument] = if run.uploads_merged { &[] } else { &run.uploads };
        let result = self
            .synthesizer
            .synthesize(
                &mut run.knowledge,
                outcomes,
                uploads,
                record.loop_index,
                &run.cancel,
            )
            .await;

        match result {
            Ok(synthesis) => {
                debug!(
                    items = synthesis.items_considered,
                    extraction_failures = synthesis.extraction_failures,
                    "Synthesis merged"
                );
                run.uploads_merged = true;
                record.sources_added = synthesis.sources_added;
                record.findings_added = synthesis.findings_added;
                record.questions_added = synthesis.questions_added;
                record.questions_resolved = synthesis.questions_resolved;
                record.summary = synthesis.summary;
                Ok(())
            }
            Err(e) if e.is_cancelled() => Err(TerminationReason::Cancelled),
            Err(e) if e.is_fatal() => {
                error!(error = %e, "Invariant violation during synthesis");
                let failure = FailureInfo::from_error(&e);
                tracker.fail(failure.clone());
                Err(TerminationReason::Failed { failure })
            }
            Err(e) => {
                warn!(error = %e, "Synthesis failed");
                record.rationale = "Synthesis failed; no findings were merged".to_string();
                self.loop_failure(tracker, record, &e);
                Ok(())
            }
        }
    }

    /// The planner has nothing left to do. Uploads that were never read are
    /// merged in a final loop so the report can cite them.
    async fn finish_without_actions(
        &self,
        run: &mut ResearchRun,
        tracker: &mut ConvergenceTracker,
        mut record: LoopRecord,
        reason: String,
    ) -> Option<TerminationReason> {
        let done = TerminationReason::NoFurtherActions {
            detail: reason.clone(),
        };
        if run.pending_uploads().is_empty() {
            return Some(done);
        }

        info!(
            uploads = run.pending_uploads().len(),
            "Merging uploaded documents before finishing"
        );
        record.rationale = format!("No further actions ({}); read uploaded documents", reason);
        if let Err(stop) = self.merge_results(run, tracker, &[], &mut record).await {
            return Some(stop);
        }

        match self.commit_loop(run, tracker, record).await {
            Some(TerminationReason::Failed { failure }) => Some(TerminationReason::Failed { failure }),
            _ => Some(done),
        }
    }

    fn loop_failure(
        &self,
        tracker: &mut ConvergenceTracker,
        record: &mut LoopRecord,
        error: &ResearchError,
    ) {
        let failure = FailureInfo::from_error(error);
        tracker.record_failure(failure.clone());
        record.failure = Some(failure);
    }

    /// Append the finished loop and decide whether to stop
    async fn commit_loop(
        &self,
        run: &mut ResearchRun,
        tracker: &mut ConvergenceTracker,
        mut record: LoopRecord,
    ) -> Option<TerminationReason> {
        record.completed_at = Utc::now();
        if record.activity.is_some() {
            run.last_activity = record.activity.clone();
        }

        let loop_index = record.loop_index;
        info!(
            actions = record.actions.len(),
            findings_added = record.findings_count(),
            sources_added = record.sources_added.len(),
            converging = record.verdict.as_ref().map(|v| v.converging),
            "Loop complete"
        );

        if let Err(e) = run.trail.append(record) {
            error!(error = %e, "Failed to append loop record");
            let failure = FailureInfo::from_error(&e);
            tracker.fail(failure.clone());
            return Some(TerminationReason::Failed { failure });
        }
        run.session.loop_index = loop_index;

        if let Some(store) = &self.store {
            if let Some(record) = run.trail.last() {
                if let Err(e) = store.append_loop(&run.session.id, record).await {
                    error!(error = %e, "Failed to persist loop record");
                }
            }
            if let Err(e) = store.update_session(&run.session).await {
                error!(error = %e, "Failed to persist session");
            }
        }

        match tracker.state() {
            AnalyzerState::Done => Some(TerminationReason::Converged),
            AnalyzerState::Failed => Some(TerminationReason::Failed {
                failure: tracker.failure().cloned().unwrap_or(FailureInfo {
                    class: ErrorClass::Internal,
                    message: "research failed".to_string(),
                }),
            }),
            _ if run.session.effort_mode == EffortMode::Quick => {
                info!("Quick mode reports after its first loop");
                Some(TerminationReason::Converged)
            }
            _ => None,
        }
    }

    /// Planning errors are retried before they count as a loop failure
    async fn plan_with_retry(
        &self,
        run: &ResearchRun,
        loop_index: usize,
        steering: Option<&SteeringMessage>,
    ) -> ResearchResult<PlanOutcome> {
        let tools = self.tools.tool_descriptions();
        let uploads: Vec<String> = run
            .pending_uploads()
            .iter()
            .map(UploadedDocument::identifier)
            .collect();
        let request = PlanRequest {
            knowledge: &run.knowledge,
            effort_mode: run.session.effort_mode,
            loop_index,
            max_loops: run.session.max_loops,
            steering,
            tools: &tools,
            uploads: &uploads,
            default_top_k: self.tools.default_top_k(),
        };

        let mut attempt = 0;
        loop {
            match self.planner.plan(&request, &run.cancel).await {
                Err(ResearchError::Planning { message }) if attempt < self.settings.planner_retries => {
                    attempt += 1;
                    warn!(attempt = attempt, "Planning failed, retrying: {}", message);
                }
                other => return other,
            }
        }
    }

    async fn activity_note(&self, run: &ResearchRun, record: &LoopRecord) -> Option<String> {
        let request = CompletionRequest::new(
            CallPurpose::Activity,
            ModelProfile::Activity,
            prompts::create_activity_prompt(
                run.knowledge.query(),
                record.loop_index,
                &record.actions,
                record.findings_count(),
            ),
        )
        .with_system(prompts::ACTIVITY_SYSTEM_PROMPT);

        match self.llm.complete(request, &run.cancel).await {
            Ok(text) => text
                .lines()
                .map(str::trim)
                .find(|line| !line.is_empty())
                .map(str::to_string),
            Err(e) => {
                debug!(error = %e, "Activity note skipped");
                None
            }
        }
    }

    async fn compose_report(
        &self,
        snapshot: &KnowledgeSnapshot,
        loops: &[LoopRecord],
        cancel: &CancellationToken,
    ) -> String {
        let request = CompletionRequest::new(
            CallPurpose::Report,
            ModelProfile::Primary,
            prompts::create_report_prompt(snapshot, loops),
        )
        .with_system(prompts::REPORT_SYSTEM_PROMPT);

        match measure_async("compose_report", self.llm.complete(request, cancel)).await {
            Ok(text) if !text.trim().is_empty() => text,
            Ok(_) => {
                warn!("Report composition returned nothing, using findings");
                report::fallback_body(snapshot)
            }
            Err(e) => {
                warn!(error = %e, "Report composition failed, using findings");
                report::fallback_body(snapshot)
            }
        }
    }

    async fn finalize(&self, mut run: ResearchRun, termination: TerminationReason) -> ResearchReport {
        let status = termination.status();
        let failure = match &termination {
            TerminationReason::Failed { failure } => Some(failure.clone()),
            _ => None,
        };

        let snapshot = run.knowledge.snapshot();
        let body = match status {
            SessionStatus::Converged => {
                self.compose_report(&snapshot, run.trail.records(), &run.cancel)
                    .await
            }
            _ => report::fallback_body(&snapshot),
        };
        let line = report::status_line(status, run.trail.len(), failure.as_ref());
        let markdown = report::render_markdown(&snapshot, &body, &line);

        run.session.status = status;
        run.session.finalized_at = Some(Utc::now());
        run.session.failure = failure.clone();

        let report = ResearchReport {
            session_id: run.session.id.clone(),
            query: run.session.query.clone(),
            status,
            markdown,
            sources: snapshot.sources,
            findings: snapshot.findings,
            loops: run.trail.records().to_vec(),
            termination,
            failure,
            generated_at: Utc::now(),
        };

        if let Some(store) = &self.store {
            if let Err(e) = store.save_report(&report).await {
                error!(error = %e, "Failed to persist report");
            }
            if let Err(e) = store.update_session(&run.session).await {
                error!(error = %e, "Failed to persist session");
            }
        }

        let analyzer_state = match status {
            SessionStatus::Converged | SessionStatus::Running => AnalyzerState::Done,
            SessionStatus::Cancelled => AnalyzerState::Cancelled,
            SessionStatus::Failed => AnalyzerState::Failed,
        };
        run.publish(analyzer_state);

        info!(
            session_id = %run.session.id,
            status = %status,
            loops = report.loops.len(),
            sources = report.sources.len(),
            "Research finished"
        );
        report
    }
}
