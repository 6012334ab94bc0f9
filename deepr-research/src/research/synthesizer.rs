//! Synthesizer: folds tool results into the knowledge state
//!
//! Extraction calls for distinct sources run concurrently. The knowledge state
//! is only touched once every call has returned, so an aborted loop leaves
//! nothing half-applied.

use super::knowledge::{content_hash, dedup_key, KnowledgeState};
use super::prompts;
use super::types::*;
use crate::gateway::LlmGateway;
use crate::ResearchResult;
use deepr_core::{
    CallPurpose, CompletionRequest, DeeprError, DeeprResult, ModelProfile, ResearchSettings,
    StructuredOutput,
};
use futures::stream::{self, StreamExt};
use std::collections::HashSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Mutations applied to the knowledge state by one synthesis pass
#[derive(Debug, Clone, Default)]
pub struct SynthesisOutcome {
    pub sources_added: Vec<Source>,
    pub findings_added: Vec<Finding>,
    pub questions_added: Vec<String>,
    pub questions_resolved: Vec<String>,
    /// Running summary after this pass, when it was refreshed
    pub summary: Option<String>,
    /// Distinct source documents considered
    pub items_considered: usize,
    pub extraction_failures: usize,
}

/// One distinct piece of source content awaiting extraction
#[derive(Debug, Clone)]
struct PendingItem {
    candidate: SourceCandidate,
    content: String,
}

#[derive(Debug, Default)]
struct Extraction {
    findings: Vec<String>,
    resolved_questions: Vec<String>,
    new_questions: Vec<String>,
}

impl Extraction {
    fn from_output(output: &StructuredOutput) -> DeeprResult<Self> {
        if let Some(items) = output.value().as_array() {
            return Ok(Self {
                findings: items
                    .iter()
                    .filter_map(|v| v.as_str())
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .collect(),
                ..Self::default()
            });
        }
        if output.get("findings").is_none() {
            return Err(DeeprError::invalid_response(
                "extraction output has no findings field",
                Some(&output.value().to_string()),
            ));
        }
        Ok(Self {
            findings: output.string_list("findings"),
            resolved_questions: output.string_list("resolved_questions"),
            new_questions: output.string_list("new_questions"),
        })
    }
}

/// Merges new evidence into the knowledge state
#[derive(Clone)]
pub struct Synthesizer {
    llm: LlmGateway,
    settings: ResearchSettings,
}

impl Synthesizer {
    pub fn new(llm: LlmGateway, settings: ResearchSettings) -> Self {
        Self { llm, settings }
    }

    /// Fold the outcomes of one loop (and, in loop 1, the uploaded documents)
    /// into `knowledge`.
    ///
    /// Individual extraction failures only reduce the yield. The pass fails
    /// when every extraction failed, when cancellation is observed, or on an
    /// invariant violation.
    pub async fn synthesize(
        &self,
        knowledge: &mut KnowledgeState,
        outcomes: &[ActionOutcome],
        uploads: &[UploadedDocument],
        loop_index: usize,
        cancel: &CancellationToken,
    ) -> ResearchResult<SynthesisOutcome> {
        let items = collect_items(outcomes, uploads);
        debug!(
            loop_index = loop_index,
            items = items.len(),
            "Synthesizing tool results"
        );

        let query = knowledge.query().to_string();
        let open_questions = knowledge.open_questions().to_vec();
        let limit = self.settings.max_concurrent_extractions.max(1);

        let pending: Vec<_> = items
            .iter()
            .map(|item| self.extract(&query, &open_questions, item, cancel))
            .collect();
        let extractions: Vec<DeeprResult<Extraction>> = stream::iter(pending)
            .buffered(limit)
            .collect()
            .await;

        let mut outcome = SynthesisOutcome {
            items_considered: items.len(),
            ..SynthesisOutcome::default()
        };
        let mut first_error = None;
        let mut succeeded = Vec::new();

        for (item, extraction) in items.into_iter().zip(extractions) {
            match extraction {
                Ok(extraction) => succeeded.push((item, extraction)),
                Err(error) if error.is_cancelled() => return Err(error.into()),
                Err(error) => {
                    warn!(
                        source = %item.candidate.identifier,
                        error = %error,
                        "Extraction failed, skipping source"
                    );
                    outcome.extraction_failures += 1;
                    first_error.get_or_insert(error);
                }
            }
        }

        if succeeded.is_empty() {
            if let Some(error) = first_error {
                return Err(error.into());
            }
        }

        // Every model call has returned; apply the mutations.
        for (item, extraction) in succeeded {
            let known = knowledge.source_count();
            let reference = knowledge.add_source(item.candidate, loop_index);
            if knowledge.source_count() > known {
                if let Some(source) = knowledge.source(&reference) {
                    outcome.sources_added.push(source.clone());
                }
            }

            for text in &extraction.findings {
                if knowledge.add_finding(text, &reference, loop_index)? {
                    if let Some(finding) = knowledge.findings().last() {
                        outcome.findings_added.push(finding.clone());
                    }
                }
            }
            for question in &extraction.resolved_questions {
                if knowledge.mark_question_resolved(question) {
                    outcome.questions_resolved.push(question.trim().to_string());
                }
            }
            for question in &extraction.new_questions {
                if knowledge.add_question(question) {
                    outcome.questions_added.push(question.trim().to_string());
                }
            }
        }

        for executed in outcomes.iter().filter(|o| o.result.is_ok()) {
            if let ActionKind::Search { query, .. } = &executed.action.kind {
                knowledge.record_query(query);
            }
        }

        if !outcome.findings_added.is_empty() {
            outcome.summary = self
                .refresh_summary(knowledge, &outcome.findings_added, cancel)
                .await;
        }

        info!(
            loop_index = loop_index,
            sources_added = outcome.sources_added.len(),
            findings_added = outcome.findings_added.len(),
            questions_resolved = outcome.questions_resolved.len(),
            extraction_failures = outcome.extraction_failures,
            "Synthesis complete"
        );

        Ok(outcome)
    }

    async fn extract(
        &self,
        query: &str,
        open_questions: &[String],
        item: &PendingItem,
        cancel: &CancellationToken,
    ) -> DeeprResult<Extraction> {
        let content: String = item
            .content
            .chars()
            .take(self.settings.max_source_chars)
            .collect();
        let request = CompletionRequest::new(
            CallPurpose::Extract,
            ModelProfile::Primary,
            prompts::create_extraction_prompt(
                query,
                open_questions,
                &item.candidate.title,
                &item.candidate.identifier,
                &content,
            ),
        )
        .with_system(prompts::EXTRACT_SYSTEM_PROMPT);

        let output = self.llm.complete_structured(request, cancel).await?;
        Extraction::from_output(&output)
    }

    /// Merge new findings into the running summary. A failed refresh keeps the
    /// previous summary.
    async fn refresh_summary(
        &self,
        knowledge: &mut KnowledgeState,
        new_findings: &[Finding],
        cancel: &CancellationToken,
    ) -> Option<String> {
        let request = CompletionRequest::new(
            CallPurpose::Summarize,
            ModelProfile::Primary,
            prompts::create_summary_prompt(
                knowledge.query(),
                knowledge.running_summary(),
                new_findings,
            ),
        )
        .with_system(prompts::SUMMARY_SYSTEM_PROMPT);

        match self.llm.complete(request, cancel).await {
            Ok(text) if !text.trim().is_empty() => {
                let summary = text.trim().to_string();
                knowledge.set_running_summary(summary.clone());
                Some(summary)
            }
            Ok(_) => None,
            Err(error) => {
                warn!(error = %error, "Running summary refresh failed");
                None
            }
        }
    }
}

/// Distinct (source identity, content) pairs in outcome order, uploads first
fn collect_items(outcomes: &[ActionOutcome], uploads: &[UploadedDocument]) -> Vec<PendingItem> {
    let mut seen = HashSet::new();
    let mut items = Vec::new();

    let uploaded = uploads.iter().map(|doc| PendingItem {
        candidate: SourceCandidate {
            identifier: doc.identifier(),
            title: doc.name.clone(),
            fetch_status: FetchStatus::Uploaded,
        },
        content: doc.content.clone(),
    });

    let fetched = outcomes
        .iter()
        .filter_map(|o| o.result.as_ref().ok())
        .flat_map(|result| result.hits.iter())
        .map(|hit| PendingItem {
            candidate: SourceCandidate::from_hit(hit),
            content: hit.raw_content.clone().unwrap_or_else(|| hit.content.clone()),
        });

    for item in uploaded.chain(fetched) {
        if item.content.trim().is_empty() || item.candidate.identifier.trim().is_empty() {
            continue;
        }
        let key = (
            dedup_key(&item.candidate.identifier),
            content_hash(&item.content),
        );
        if seen.insert(key) {
            items.push(item);
        }
    }

    items
}
