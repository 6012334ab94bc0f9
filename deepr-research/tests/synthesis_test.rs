//! Synthesizer merging semantics

mod common;

use common::*;
use deepr_core::{CallPurpose, SearchHit};
use deepr_research::research::{
    Action, ActionKind, ActionOutcome, Synthesizer, ToolError, ToolErrorKind, ToolResult,
};
use deepr_research::{KnowledgeState, ResearchError, UploadedDocument};
use tokio_util::sync::CancellationToken;

fn outcome(query: &str, hits: Vec<SearchHit>) -> ActionOutcome {
    ActionOutcome {
        action: Action {
            id: 0,
            kind: ActionKind::Search {
                query: query.to_string(),
                top_k: 5,
            },
            rationale: None,
            priority: 5,
        },
        result: Ok(ToolResult { hits }),
        elapsed_ms: 1,
    }
}

fn synthesizer(harness: &Harness) -> Synthesizer {
    Synthesizer::new(harness.llm(), harness.settings.clone())
}

#[tokio::test]
async fn test_merging_the_same_results_twice_changes_nothing() {
    let harness = Harness::new();
    let synthesizer = synthesizer(&harness);
    let cancel = CancellationToken::new();
    let outcomes = vec![outcome("solar output", default_hits("solar output"))];
    let mut knowledge = KnowledgeState::new("solar output");

    let first = synthesizer
        .synthesize(&mut knowledge, &outcomes, &[], 1, &cancel)
        .await
        .unwrap();
    assert_eq!(first.sources_added.len(), 2);
    assert_eq!(first.findings_added.len(), 2);
    let snapshot = knowledge.snapshot();

    let second = synthesizer
        .synthesize(&mut knowledge, &outcomes, &[], 2, &cancel)
        .await
        .unwrap();
    assert!(second.sources_added.is_empty());
    assert!(second.findings_added.is_empty());

    let again = knowledge.snapshot();
    assert_eq!(again.sources, snapshot.sources);
    assert_eq!(again.findings, snapshot.findings);
    assert!(knowledge.has_executed("solar output"));
}

#[tokio::test]
async fn test_failed_actions_are_skipped() {
    let harness = Harness::new();
    let mut failed = outcome("broken", Vec::new());
    failed.result = Err(ToolError::new(ToolErrorKind::Provider, "503"));
    let outcomes = vec![failed, outcome("works", default_hits("works"))];
    let mut knowledge = KnowledgeState::new("q");

    let merged = synthesizer(&harness)
        .synthesize(&mut knowledge, &outcomes, &[], 1, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(merged.items_considered, 2);
    assert_eq!(merged.findings_added.len(), 2);
    assert!(!knowledge.has_executed("broken"));
    assert!(knowledge.has_executed("works"));
}

#[tokio::test]
async fn test_single_extraction_failure_reduces_yield() {
    let harness = Harness::new();
    harness
        .model
        .push_text(CallPurpose::Extract, "not json")
        .push_text(
            CallPurpose::Extract,
            extraction_json(&["Kept fact.".to_string()], &[], &[]),
        );
    let outcomes = vec![outcome("q", default_hits("q"))];
    let mut knowledge = KnowledgeState::new("q");

    let merged = synthesizer(&harness)
        .synthesize(&mut knowledge, &outcomes, &[], 1, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(merged.extraction_failures, 1);
    assert_eq!(merged.findings_added.len(), 1);
    assert_eq!(merged.sources_added.len(), 1);
}

#[tokio::test]
async fn test_all_extractions_failing_is_an_error() {
    let harness = Harness::new();
    harness
        .model
        .set_default(CallPurpose::Extract, Reply::Text("nothing useful".into()));
    let outcomes = vec![outcome("q", default_hits("q"))];
    let mut knowledge = KnowledgeState::new("q");

    let error = synthesizer(&harness)
        .synthesize(&mut knowledge, &outcomes, &[], 1, &CancellationToken::new())
        .await
        .unwrap_err();

    assert!(matches!(error, ResearchError::Core(_)));
    assert_eq!(knowledge.source_count(), 0);
    assert!(knowledge.findings().is_empty());
}

#[tokio::test]
async fn test_uploads_come_first_and_summary_is_refreshed() {
    let harness = Harness::new();
    let uploads = vec![UploadedDocument {
        name: "brief.md".to_string(),
        content: "The board met in March.".to_string(),
    }];
    let outcomes = vec![outcome("board", default_hits("board"))];
    let mut knowledge = KnowledgeState::new("board meetings");

    let merged = synthesizer(&harness)
        .synthesize(&mut knowledge, &outcomes, &uploads, 1, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(merged.sources_added[0].identifier, "upload://brief.md");
    assert_eq!(merged.findings_added[0].content, "The board met in March.");
    assert_eq!(
        knowledge.running_summary(),
        "Running summary of the research so far."
    );
    assert_eq!(harness.model.call_count(CallPurpose::Summarize), 1);
}

#[tokio::test]
async fn test_nothing_new_skips_summary_refresh() {
    let harness = Harness::new();
    let mut knowledge = KnowledgeState::new("q");

    let merged = synthesizer(&harness)
        .synthesize(&mut knowledge, &[], &[], 1, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(merged.items_considered, 0);
    assert!(merged.summary.is_none());
    assert_eq!(harness.model.call_count(CallPurpose::Summarize), 0);
}
