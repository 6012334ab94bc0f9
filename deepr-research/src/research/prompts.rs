//! Prompts used by the research loop
//!
//! Every structured call asks for a single JSON object; the gateway normalizes
//! fences and reasoning blocks before parsing.

use super::knowledge::{KnowledgeSnapshot, KnowledgeState};
use super::types::{ActionLog, EffortMode, Finding, LoopRecord, SteeringMessage};

/// System prompt for action planning
pub const PLANNER_SYSTEM_PROMPT: &str = r#"
You are a research planner directing an autonomous web research agent.

Given a research query and what has been learned so far, decide the next batch
of tool actions that would most efficiently close the remaining knowledge gaps.
Prefer specific, well-targeted search queries over broad ones. Never repeat a
query that was already executed.

If an OPERATOR DIRECTIVE is present it overrides your own prioritization: add
the actions it asks for, drop actions it rules out, and rank accordingly.

Respond with a single JSON object and nothing else.
"#;

/// System prompt for extracting findings from one source
pub const EXTRACT_SYSTEM_PROMPT: &str = r#"
You extract atomic, verifiable facts from a source document for a research report.

Each finding must be a single self-contained statement supported by the source
text. Do not speculate and do not include facts the source does not state.

Respond with a single JSON object and nothing else.
"#;

/// System prompt for the running summary
pub const SUMMARY_SYSTEM_PROMPT: &str = r#"
You maintain a concise running summary of an ongoing research task. Merge the
new findings into the existing summary, keep it factual, and keep it under 300 words.
"#;

/// System prompt for gap analysis
pub const REFLECT_SYSTEM_PROMPT: &str = r#"
You are a critical research reviewer. Decide whether the remaining open questions
are material to answering the query within its scope, or whether further research
would not meaningfully improve the answer.

Respond with a single JSON object and nothing else.
"#;

/// System prompt for the final report
pub const REPORT_SYSTEM_PROMPT: &str = r#"
You are a research writer. Compose a well-structured Markdown report that answers
the query using only the provided findings. Cite sources inline with their
bracketed numbers, for example [1] or [2][3]. Do not invent sources and do not
add a sources section; it is appended separately.
"#;

/// System prompt for activity notes
pub const ACTIVITY_SYSTEM_PROMPT: &str = r#"
You write one-line status updates for a research progress display. Reply with a
single short sentence in plain text, no quotes and no Markdown.
"#;

/// System prompt for repairing malformed structured output
pub const REPAIR_SYSTEM_PROMPT: &str = r#"
You convert malformed model output into valid JSON. Preserve the content and
intended structure. Respond with the JSON value only.
"#;

fn bullet_list(items: &[String], empty: &str) -> String {
    if items.is_empty() {
        return format!("- {}\n", empty);
    }
    items.iter().map(|i| format!("- {}\n", i)).collect()
}

fn findings_list(findings: &[Finding]) -> String {
    if findings.is_empty() {
        return "- (none yet)\n".to_string();
    }
    findings
        .iter()
        .map(|f| format!("- {} (source: {})\n", f.content, f.source))
        .collect()
}

/// Inputs for the planning prompt
pub struct PlanningContext<'a> {
    pub knowledge: &'a KnowledgeState,
    pub effort_mode: EffortMode,
    pub loop_index: usize,
    pub max_loops: usize,
    pub max_actions: usize,
    pub recent_findings: usize,
    pub steering: Option<&'a SteeringMessage>,
    pub tools: &'a [(String, String)],
    pub uploads: &'a [String],
    pub default_top_k: usize,
}

pub fn create_planning_prompt(ctx: &PlanningContext<'_>) -> String {
    let mut prompt = String::new();

    if let Some(steering) = ctx.steering {
        prompt.push_str(&format!(
            "OPERATOR DIRECTIVE (takes precedence over everything below):\n{}\n\n",
            steering.text.trim()
        ));
    }

    prompt.push_str(&format!(
        "Research query: {}\nEffort mode: {}\nLoop {} of at most {}\n\n",
        ctx.knowledge.query(),
        ctx.effort_mode,
        ctx.loop_index,
        ctx.max_loops
    ));

    let summary = ctx.knowledge.running_summary();
    if !summary.is_empty() {
        prompt.push_str(&format!("Current summary:\n{}\n\n", summary));
    }

    prompt.push_str("Open questions:\n");
    prompt.push_str(&bullet_list(ctx.knowledge.open_questions(), "(none recorded)"));
    prompt.push_str("\nRecent findings:\n");
    prompt.push_str(&findings_list(
        ctx.knowledge.recent_findings(ctx.recent_findings),
    ));

    let executed: Vec<String> = ctx
        .knowledge
        .executed_queries()
        .map(str::to_string)
        .collect();
    prompt.push_str("\nQueries already executed (do not repeat):\n");
    prompt.push_str(&bullet_list(&executed, "(none)"));

    if !ctx.uploads.is_empty() {
        prompt.push_str("\nUser-provided documents not read yet (they are read together with this loop's actions):\n");
        prompt.push_str(&bullet_list(ctx.uploads, ""));
    }

    prompt.push_str("\nAvailable actions:\n- search: web search with a query\n- fetch: retrieve the full content of a URL or document reference\n");
    for (name, description) in ctx.tools {
        prompt.push_str(&format!("- tool \"{}\": {}\n", name, description));
    }

    prompt.push_str(&format!(
        r#"
Return at most {max} actions as:
{{
  "actions": [
    {{"type": "search", "query": "...", "top_k": {top_k}, "priority": 1-10, "rationale": "..."}},
    {{"type": "fetch", "reference": "...", "priority": 1-10, "rationale": "..."}},
    {{"type": "tool", "tool": "<name>", "input": "...", "priority": 1-10, "rationale": "..."}}
  ],
  "done": false,
  "reason": "why these actions, or why no further actions are needed"
}}
Set "done" to true with an empty action list only if the knowledge gathered already answers the query."#,
        max = ctx.max_actions,
        top_k = ctx.default_top_k,
    ));

    prompt
}

pub fn create_extraction_prompt(
    query: &str,
    open_questions: &[String],
    title: &str,
    identifier: &str,
    content: &str,
) -> String {
    format!(
        r#"Research query: {query}

Open questions:
{questions}
Source: {title} ({identifier})
<source>
{content}
</source>

Return:
{{
  "findings": ["atomic fact relevant to the query", "..."],
  "resolved_questions": ["open question this source answers, copied verbatim"],
  "new_questions": ["important follow-up question raised by this source"]
}}
Use empty lists when nothing applies."#,
        query = query,
        questions = bullet_list(open_questions, "(none)"),
        title = title,
        identifier = identifier,
        content = content,
    )
}

pub fn create_summary_prompt(query: &str, previous: &str, new_findings: &[Finding]) -> String {
    let previous = if previous.is_empty() {
        "(no summary yet)"
    } else {
        previous
    };
    format!(
        "Research query: {}\n\nCurrent summary:\n{}\n\nNew findings:\n{}\nWrite the updated summary.",
        query,
        previous,
        findings_list(new_findings)
    )
}

pub fn create_reflection_prompt(
    knowledge: &KnowledgeState,
    effort_mode: EffortMode,
    loop_index: usize,
    max_loops: usize,
    findings_added: usize,
) -> String {
    format!(
        r#"Research query: {query}
Effort mode: {effort}
Completed loop {loop_index} of at most {max_loops}; this loop added {added} findings.
Total findings: {total}; distinct sources cited: {sources}

Current summary:
{summary}

Open questions:
{questions}
Return:
{{
  "converged": true or false,
  "unresolved": ["open questions that still materially affect the answer"],
  "rationale": "one or two sentences"
}}"#,
        query = knowledge.query(),
        effort = effort_mode,
        loop_index = loop_index,
        max_loops = max_loops,
        added = findings_added,
        total = knowledge.findings().len(),
        sources = knowledge.distinct_cited_sources(),
        summary = if knowledge.running_summary().is_empty() {
            "(none)"
        } else {
            knowledge.running_summary()
        },
        questions = bullet_list(knowledge.open_questions(), "(none)"),
    )
}

pub fn create_report_prompt(snapshot: &KnowledgeSnapshot, loops: &[LoopRecord]) -> String {
    let mut findings = String::new();
    for finding in &snapshot.findings {
        let number = snapshot.citation_number(&finding.source).unwrap_or(0);
        findings.push_str(&format!("- [{}] {}\n", number, finding.content));
    }
    if findings.is_empty() {
        findings.push_str("- (no findings)\n");
    }

    let mut sources = String::new();
    for (i, source) in snapshot.sources.iter().enumerate() {
        sources.push_str(&format!("[{}] {} - {}\n", i + 1, source.title, source.identifier));
    }

    let trail: String = loops
        .iter()
        .map(|l| {
            format!(
                "- Loop {}: {} actions, {} findings. {}\n",
                l.loop_index,
                l.actions.len(),
                l.findings_count(),
                l.rationale
            )
        })
        .collect();

    format!(
        "Research query: {}\n\nFindings (with source numbers):\n{}\nSources:\n{}\nResearch trail:\n{}\nOpen questions that remain:\n{}\nWrite the report.",
        snapshot.query,
        findings,
        sources,
        trail,
        bullet_list(&snapshot.open_questions, "(none)")
    )
}

pub fn create_activity_prompt(
    query: &str,
    loop_index: usize,
    actions: &[ActionLog],
    findings_added: usize,
) -> String {
    let actions: Vec<String> = actions.iter().map(|a| a.action.kind.to_string()).collect();
    format!(
        "Research query: {}\nLoop {} ran:\n{}Findings added: {}\nDescribe this step in one sentence.",
        query,
        loop_index,
        bullet_list(&actions, "(no actions)"),
        findings_added
    )
}

pub fn create_repair_prompt(raw: &str) -> String {
    format!(
        "The following output was supposed to be a single JSON value but could not be parsed:\n<output>\n{}\n</output>\nReturn it as valid JSON.",
        raw
    )
}
