//! Knowledge state of one research session
//!
//! Findings, sources and open questions accumulated across loops. Only the
//! controller's loop mutates it; other components receive `&mut` access for
//! the duration of a call.

use super::types::*;
use crate::{ResearchError, ResearchResult};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeSet, HashMap, HashSet};
use url::Url;

const TRACKING_PARAMS: &[&str] = &[
    "fbclid", "gclid", "yclid", "ref", "mc_cid", "mc_eid", "igshid", "_ga", "_hsenc", "_hsmi",
];

/// Normalized identity of a source identifier.
///
/// URLs are canonicalized: scheme variants http/https collapse, `www.` and
/// trailing slashes are dropped, fragments and tracking parameters are
/// removed, and the remaining query parameters are sorted. Anything that is
/// not a URL is only trimmed.
pub fn dedup_key(identifier: &str) -> String {
    let trimmed = identifier.trim();
    let url = match Url::parse(trimmed) {
        Ok(url) if url.has_host() => url,
        _ => return trimmed.to_string(),
    };

    let scheme = match url.scheme() {
        "http" | "https" => "https",
        other => other,
    };
    let host = url.host_str().unwrap_or_default().to_ascii_lowercase();
    let host = host.strip_prefix("www.").unwrap_or(&host);
    let port = url.port().map(|p| format!(":{}", p)).unwrap_or_default();
    let path = url.path().trim_end_matches('/');

    let mut params: Vec<(String, String)> = url
        .query_pairs()
        .filter(|(k, _)| {
            let key = k.to_ascii_lowercase();
            !key.starts_with("utm_") && !TRACKING_PARAMS.contains(&key.as_str())
        })
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();
    params.sort();

    let query = if params.is_empty() {
        String::new()
    } else {
        let joined: Vec<String> = params
            .iter()
            .map(|(k, v)| {
                if v.is_empty() {
                    k.clone()
                } else {
                    format!("{}={}", k, v)
                }
            })
            .collect();
        format!("?{}", joined.join("&"))
    };

    format!("{}://{}{}{}{}", scheme, host, port, path, query)
}

fn normalize_text(text: &str) -> String {
    text.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

/// SHA-256 of whitespace and case normalized text, hex encoded
pub fn content_hash(text: &str) -> String {
    format!("{:x}", Sha256::digest(normalize_text(text).as_bytes()))
}

/// Immutable view used for reporting and progress
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KnowledgeSnapshot {
    pub query: String,
    pub findings: Vec<Finding>,
    pub sources: Vec<Source>,
    pub open_questions: Vec<String>,
    pub running_summary: String,
}

impl KnowledgeSnapshot {
    pub fn source(&self, reference: &SourceRef) -> Option<&Source> {
        self.sources.iter().find(|s| &s.reference == reference)
    }

    /// 1-based citation number of a source
    pub fn citation_number(&self, reference: &SourceRef) -> Option<usize> {
        self.sources
            .iter()
            .position(|s| &s.reference == reference)
            .map(|i| i + 1)
    }
}

/// Accumulating record of one session's research
#[derive(Debug, Clone)]
pub struct KnowledgeState {
    query: String,
    findings: Vec<Finding>,
    /// Sources in registration order
    sources: Vec<Source>,
    /// Dedup key to index in `sources`
    source_index: HashMap<String, usize>,
    /// (content hash, source ref) of every finding
    finding_keys: HashSet<(String, SourceRef)>,
    open_questions: Vec<String>,
    executed_queries: BTreeSet<String>,
    running_summary: String,
}

impl KnowledgeState {
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            findings: Vec::new(),
            sources: Vec::new(),
            source_index: HashMap::new(),
            finding_keys: HashSet::new(),
            open_questions: Vec::new(),
            executed_queries: BTreeSet::new(),
            running_summary: String::new(),
        }
    }

    /// Rebuild the state of a session from its loop records
    pub fn replay(query: impl Into<String>, records: &[LoopRecord]) -> ResearchResult<Self> {
        let mut state = Self::new(query);

        for record in records {
            for source in &record.sources_added {
                state.add_source(
                    SourceCandidate {
                        identifier: source.identifier.clone(),
                        title: source.title.clone(),
                        fetch_status: source.fetch_status,
                    },
                    source.first_seen_loop,
                );
            }
            for finding in &record.findings_added {
                state.add_finding(&finding.content, &finding.source, finding.loop_index)?;
            }
            for question in &record.questions_resolved {
                state.mark_question_resolved(question);
            }
            for question in &record.questions_added {
                state.add_question(question);
            }
            for log in record.actions.iter().filter(|l| l.error.is_none()) {
                if let ActionKind::Search { query, .. } = &log.action.kind {
                    state.record_query(query);
                }
            }
            if let Some(summary) = &record.summary {
                state.set_running_summary(summary.clone());
            }
        }

        Ok(state)
    }

    pub fn query(&self) -> &str {
        &self.query
    }

    /// Register a source, returning the existing reference for a known identity
    pub fn add_source(&mut self, candidate: SourceCandidate, loop_index: usize) -> SourceRef {
        let key = dedup_key(&candidate.identifier);

        if let Some(&index) = self.source_index.get(&key) {
            let existing = &mut self.sources[index];
            if existing.fetch_status == FetchStatus::Snippet
                && candidate.fetch_status != FetchStatus::Snippet
            {
                existing.fetch_status = candidate.fetch_status;
            }
            if existing.title.trim().is_empty() && !candidate.title.trim().is_empty() {
                existing.title = candidate.title;
            }
            return existing.reference.clone();
        }

        let reference = SourceRef::new(key.clone());
        self.sources.push(Source {
            reference: reference.clone(),
            identifier: candidate.identifier.trim().to_string(),
            title: candidate.title,
            fetch_status: candidate.fetch_status,
            first_seen_loop: loop_index,
        });
        self.source_index.insert(key, self.sources.len() - 1);
        reference
    }

    pub fn contains_source(&self, reference: &SourceRef) -> bool {
        self.source_index.contains_key(reference.as_str())
    }

    pub fn source(&self, reference: &SourceRef) -> Option<&Source> {
        self.source_index
            .get(reference.as_str())
            .map(|&index| &self.sources[index])
    }

    /// Record a finding; returns `false` when the same content was already
    /// recorded for the same source
    pub fn add_finding(
        &mut self,
        text: &str,
        source: &SourceRef,
        loop_index: usize,
    ) -> ResearchResult<bool> {
        if !self.contains_source(source) {
            return Err(ResearchError::UnknownSource {
                reference: source.to_string(),
            });
        }

        let content = text.trim();
        if content.is_empty() {
            return Ok(false);
        }

        let hash = content_hash(content);
        if !self.finding_keys.insert((hash.clone(), source.clone())) {
            return Ok(false);
        }

        self.findings.push(Finding {
            content: content.to_string(),
            source: source.clone(),
            loop_index,
            content_hash: hash,
        });
        Ok(true)
    }

    /// Add an open question unless an equivalent one is already open
    pub fn add_question(&mut self, question: &str) -> bool {
        let question = question.trim();
        if question.is_empty() || self.position_of_question(question).is_some() {
            return false;
        }
        self.open_questions.push(question.to_string());
        true
    }

    /// Remove an open question; returns `false` if it was not open
    pub fn mark_question_resolved(&mut self, question: &str) -> bool {
        match self.position_of_question(question) {
            Some(index) => {
                self.open_questions.remove(index);
                true
            }
            None => false,
        }
    }

    fn position_of_question(&self, question: &str) -> Option<usize> {
        let wanted = normalize_text(question);
        self.open_questions
            .iter()
            .position(|q| normalize_text(q) == wanted)
    }

    pub fn record_query(&mut self, query: &str) {
        self.executed_queries.insert(normalize_text(query));
    }

    pub fn has_executed(&self, query: &str) -> bool {
        self.executed_queries.contains(&normalize_text(query))
    }

    pub fn executed_queries(&self) -> impl Iterator<Item = &str> {
        self.executed_queries.iter().map(String::as_str)
    }

    pub fn set_running_summary(&mut self, summary: String) {
        self.running_summary = summary;
    }

    pub fn running_summary(&self) -> &str {
        &self.running_summary
    }

    pub fn findings(&self) -> &[Finding] {
        &self.findings
    }

    /// The last `n` findings, oldest first
    pub fn recent_findings(&self, n: usize) -> &[Finding] {
        let start = self.findings.len().saturating_sub(n);
        &self.findings[start..]
    }

    pub fn sources(&self) -> &[Source] {
        &self.sources
    }

    pub fn open_questions(&self) -> &[String] {
        &self.open_questions
    }

    pub fn source_count(&self) -> usize {
        self.sources.len()
    }

    /// Distinct sources that back at least one finding
    pub fn distinct_cited_sources(&self) -> usize {
        self.findings
            .iter()
            .map(|f| &f.source)
            .collect::<HashSet<_>>()
            .len()
    }

    pub fn snapshot(&self) -> KnowledgeSnapshot {
        KnowledgeSnapshot {
            query: self.query.clone(),
            findings: self.findings.clone(),
            sources: self.sources.clone(),
            open_questions: self.open_questions.clone(),
            running_summary: self.running_summary.clone(),
        }
    }
}
