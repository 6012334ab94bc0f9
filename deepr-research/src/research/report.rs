//! Markdown rendering of research reports

use super::knowledge::KnowledgeSnapshot;
use super::types::{FailureInfo, SessionStatus};

/// Body used when no composed report is available (cancelled, failed, or the
/// composing call itself failed)
pub fn fallback_body(snapshot: &KnowledgeSnapshot) -> String {
    let mut body = String::new();

    if !snapshot.running_summary.trim().is_empty() {
        body.push_str("## Summary\n\n");
        body.push_str(snapshot.running_summary.trim());
        body.push_str("\n\n");
    }

    body.push_str("## Findings\n\n");
    if snapshot.findings.is_empty() {
        body.push_str("No findings were gathered.\n");
    }
    for finding in &snapshot.findings {
        match snapshot.citation_number(&finding.source) {
            Some(number) => body.push_str(&format!("- {} [{}]\n", finding.content, number)),
            None => body.push_str(&format!("- {}\n", finding.content)),
        }
    }

    if !snapshot.open_questions.is_empty() {
        body.push_str("\n## Open Questions\n\n");
        for question in &snapshot.open_questions {
            body.push_str(&format!("- {}\n", question));
        }
    }

    body
}

/// Closing line describing how the session ended
pub fn status_line(status: SessionStatus, loops: usize, failure: Option<&FailureInfo>) -> String {
    let plural = if loops == 1 { "loop" } else { "loops" };
    match status {
        SessionStatus::Converged | SessionStatus::Running => format!(
            "Research complete! Conducted {} research {}.",
            loops, plural
        ),
        SessionStatus::Cancelled => format!(
            "Research cancelled after {} research {}. Partial results shown.",
            loops, plural
        ),
        SessionStatus::Failed => match failure {
            Some(failure) => format!(
                "Research failed after {} research {} ({}: {}). Partial results shown.",
                loops, plural, failure.class, failure.message
            ),
            None => format!(
                "Research failed after {} research {}. Partial results shown.",
                loops, plural
            ),
        },
    }
}

/// Assemble the full report document
pub fn render_markdown(snapshot: &KnowledgeSnapshot, body: &str, status_line: &str) -> String {
    let mut markdown = format!("# Research Report: {}\n\n", snapshot.query.trim());
    markdown.push_str(body.trim());
    markdown.push_str("\n\n## Sources\n\n");

    if snapshot.sources.is_empty() {
        markdown.push_str("No sources found.\n");
    }
    for (i, source) in snapshot.sources.iter().enumerate() {
        let title = if source.title.trim().is_empty() {
            source.identifier.as_str()
        } else {
            source.title.trim()
        };
        markdown.push_str(&format!("[{}] {} - {}\n", i + 1, title, source.identifier));
    }

    markdown.push_str("\n---\n\n");
    markdown.push_str(status_line);
    markdown.push('\n');
    markdown
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::research::types::{FetchStatus, Finding, Source, SourceRef};
    use crate::ErrorClass;

    fn snapshot() -> KnowledgeSnapshot {
        let reference = SourceRef::new("https://example.com/tesla");
        KnowledgeSnapshot {
            query: "Who is the CEO of Tesla?".to_string(),
            findings: vec![Finding {
                content: "Elon Musk is the CEO of Tesla.".to_string(),
                source: reference.clone(),
                loop_index: 1,
                content_hash: "h".to_string(),
            }],
            sources: vec![Source {
                reference,
                identifier: "https://example.com/tesla".to_string(),
                title: "Tesla leadership".to_string(),
                fetch_status: FetchStatus::Snippet,
                first_seen_loop: 1,
            }],
            open_questions: vec!["Since when?".to_string()],
            running_summary: String::new(),
        }
    }

    #[test]
    fn test_fallback_body_cites_sources() {
        let body = fallback_body(&snapshot());
        assert!(body.contains("- Elon Musk is the CEO of Tesla. [1]"));
        assert!(body.contains("## Open Questions"));
    }

    #[test]
    fn test_render_numbers_sources() {
        let markdown = render_markdown(&snapshot(), "Body [1]", "done");
        assert!(markdown.starts_with("# Research Report: Who is the CEO of Tesla?"));
        assert!(markdown.contains("## Sources\n\n[1] Tesla leadership - https://example.com/tesla\n"));
        assert!(markdown.trim_end().ends_with("done"));
    }

    #[test]
    fn test_status_lines() {
        assert_eq!(
            status_line(SessionStatus::Converged, 1, None),
            "Research complete! Conducted 1 research loop."
        );
        let failure = FailureInfo {
            class: ErrorClass::Planning,
            message: "no plan".to_string(),
        };
        assert!(status_line(SessionStatus::Failed, 2, Some(&failure)).contains("PlanningError"));
        assert!(status_line(SessionStatus::Cancelled, 2, None).starts_with("Research cancelled"));
    }
}
