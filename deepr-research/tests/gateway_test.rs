//! Tool gateway and language model gateway behavior

mod common;

use common::*;
use deepr_core::{
    async_trait, AuxiliaryTool, CallPurpose, CompletionRequest, DeeprError, DeeprResult,
    ModelProfile, SearchHit,
};
use deepr_research::research::{ActionKind, ToolErrorKind};
use deepr_research::Action;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

fn search(id: usize, query: &str) -> Action {
    Action {
        id,
        kind: ActionKind::Search {
            query: query.to_string(),
            top_k: 0,
        },
        rationale: None,
        priority: 5,
    }
}

struct Calculator;

#[async_trait]
impl AuxiliaryTool for Calculator {
    fn name(&self) -> &str {
        "calculator"
    }

    fn description(&self) -> &str {
        "Evaluates arithmetic"
    }

    async fn invoke(&self, input: &str) -> DeeprResult<Vec<SearchHit>> {
        Ok(vec![hit("tool://calculator", "calculator", &format!("{} = 4", input))])
    }
}

#[tokio::test]
async fn test_batch_preserves_order_and_isolates_failures() {
    let harness = Harness::new();
    harness.search.set_failure("broken");
    harness.search.set_delay("slow", Duration::from_millis(50));

    let actions = vec![search(0, "slow"), search(1, "broken"), search(2, "fast")];
    let outcomes = harness.tools().execute_batch(&actions).await;

    assert_eq!(outcomes.len(), 3);
    assert_eq!(outcomes[0].action.id, 0);
    assert_eq!(outcomes[1].action.id, 1);
    assert_eq!(outcomes[2].action.id, 2);

    assert_eq!(outcomes[0].result_count(), 2);
    let error = outcomes[1].result.as_ref().unwrap_err();
    assert_eq!(error.kind, ToolErrorKind::Provider);
    assert_eq!(outcomes[2].result_count(), 2);
}

#[tokio::test]
async fn test_slow_action_times_out_alone() {
    let mut harness = Harness::new();
    harness.search_config.timeout_ms = 50;
    harness.search.set_delay("stuck", Duration::from_secs(30));

    let started = Instant::now();
    let outcomes = harness
        .tools()
        .execute_batch(&[search(0, "stuck"), search(1, "quick")])
        .await;

    assert!(started.elapsed() < Duration::from_secs(5));
    assert_eq!(
        outcomes[0].result.as_ref().unwrap_err().kind,
        ToolErrorKind::Timeout
    );
    assert!(outcomes[1].result.is_ok());
}

#[tokio::test]
async fn test_top_k_and_raw_content_handling() {
    let harness = Harness::new();
    let mut with_raw = hit("https://a.test/1", "A", "snippet");
    with_raw.raw_content = Some("full page".to_string());
    harness.search.set_hits(
        "many",
        vec![
            with_raw,
            hit("https://a.test/2", "B", "b"),
            hit("https://a.test/3", "C", "c"),
        ],
    );

    let action = Action {
        id: 0,
        kind: ActionKind::Search {
            query: "many".to_string(),
            top_k: 2,
        },
        rationale: None,
        priority: 5,
    };
    let result = harness.tools().execute(&action).await.unwrap();

    assert_eq!(result.hits.len(), 2);
    assert!(result.hits[0].raw_content.is_none());
}

#[tokio::test]
async fn test_fetch_and_auxiliary_tools() {
    let harness = Harness::new();
    let tools = harness.tools().with_tool(Arc::new(Calculator));
    assert!(tools.has_tool("calculator"));
    assert_eq!(
        tools.tool_descriptions(),
        vec![("calculator".to_string(), "Evaluates arithmetic".to_string())]
    );

    let fetch = Action {
        id: 0,
        kind: ActionKind::FetchDocument {
            reference: "https://docs.test/paper".to_string(),
        },
        rationale: None,
        priority: 5,
    };
    let fetched = tools.execute(&fetch).await.unwrap();
    assert_eq!(fetched.hits[0].url, "https://docs.test/paper");
    assert_eq!(
        fetched.hits[0].raw_content.as_deref(),
        Some("Full text of https://docs.test/paper")
    );

    let calc = Action {
        id: 1,
        kind: ActionKind::Auxiliary {
            tool: "calculator".to_string(),
            input: "2 + 2".to_string(),
        },
        rationale: None,
        priority: 5,
    };
    assert_eq!(tools.execute(&calc).await.unwrap().hits[0].content, "2 + 2 = 4");

    let unknown = Action {
        id: 2,
        kind: ActionKind::Auxiliary {
            tool: "sql".to_string(),
            input: "select 1".to_string(),
        },
        rationale: None,
        priority: 5,
    };
    assert_eq!(
        tools.execute(&unknown).await.unwrap_err().kind,
        ToolErrorKind::Unsupported
    );
}

#[tokio::test]
async fn test_llm_retries_provider_faults() {
    let harness = Harness::new();
    harness
        .model
        .push(CallPurpose::Summarize, Reply::ProviderError("rate limited".into()))
        .push_text(CallPurpose::Summarize, "recovered");

    let request = CompletionRequest::new(CallPurpose::Summarize, ModelProfile::Primary, "hi");
    let text = harness
        .llm()
        .complete(request, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(text, "recovered");
    assert_eq!(harness.model.call_count(CallPurpose::Summarize), 2);
}

#[tokio::test]
async fn test_llm_deadline_produces_timeout() {
    let mut harness = Harness::new();
    harness.llm_settings.primary.timeout_ms = 30;
    harness.model.set_default(CallPurpose::Summarize, Reply::Hang);

    let request = CompletionRequest::new(CallPurpose::Summarize, ModelProfile::Primary, "hi");
    let error = harness
        .llm()
        .complete(request, &CancellationToken::new())
        .await
        .unwrap_err();

    assert!(matches!(error, DeeprError::Timeout { .. }));
    assert_eq!(harness.model.call_count(CallPurpose::Summarize), 2);
}

#[tokio::test]
async fn test_llm_call_aborts_on_cancellation() {
    let harness = Harness::new();
    harness.model.set_default(CallPurpose::Report, Reply::Hang);
    let llm = harness.llm();
    let cancel = CancellationToken::new();

    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(20)).await;
        trigger.cancel();
    });

    let started = Instant::now();
    let request = CompletionRequest::new(CallPurpose::Report, ModelProfile::Primary, "hi");
    let error = llm.complete(request, &cancel).await.unwrap_err();

    assert!(error.is_cancelled());
    assert!(started.elapsed() < Duration::from_secs(5));
}

#[tokio::test]
async fn test_structured_output_repair() {
    let harness = Harness::new();
    harness
        .model
        .push_text(CallPurpose::Reflect, "I think we are done, converged = yes")
        .push_text(
            CallPurpose::Repair,
            "```json\n{\"converged\": true, \"unresolved\": []}\n```",
        );

    let request = CompletionRequest::new(CallPurpose::Reflect, ModelProfile::Primary, "judge");
    let output = harness
        .llm()
        .complete_structured(request, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(output.bool_field("converged"), Some(true));
    assert_eq!(harness.model.call_count(CallPurpose::Repair), 1);
}

#[tokio::test]
async fn test_unrepairable_output_is_invalid_response() {
    let harness = Harness::new();
    harness.model.push_text(CallPurpose::Reflect, "no json at all");

    let request = CompletionRequest::new(CallPurpose::Reflect, ModelProfile::Primary, "judge");
    let error = harness
        .llm()
        .complete_structured(request, &CancellationToken::new())
        .await
        .unwrap_err();

    assert!(matches!(error, DeeprError::InvalidResponse { .. }));
}

#[tokio::test]
async fn test_activity_profile_uses_its_own_backend() {
    let harness = Harness::new();
    let notes = Arc::new(ScriptedModel::named("notes"));
    let llm = harness.llm().with_activity_backend(notes.clone());

    let request = CompletionRequest::new(CallPurpose::Activity, ModelProfile::Activity, "note");
    let text = llm.complete(request, &CancellationToken::new()).await.unwrap();

    assert_eq!(text, "Searched the web for new evidence.");
    assert_eq!(notes.call_count(CallPurpose::Activity), 1);
    assert_eq!(harness.model.call_count(CallPurpose::Activity), 0);
    assert_eq!(notes.calls()[0].model, harness.llm_settings.activity.model);
}
