//! Append-only audit trail of loop records

use super::types::LoopRecord;
use crate::{ResearchError, ResearchResult};

/// Loop records of one session, strictly ordered by loop index
#[derive(Debug, Clone, Default)]
pub struct AuditTrail {
    records: Vec<LoopRecord>,
}

impl AuditTrail {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild from persisted records, validating their order
    pub fn from_records(records: Vec<LoopRecord>) -> ResearchResult<Self> {
        let mut trail = Self::new();
        for record in records {
            trail.append(record)?;
        }
        Ok(trail)
    }

    /// Append the record of the next loop. Records are never replaced.
    pub fn append(&mut self, record: LoopRecord) -> ResearchResult<&LoopRecord> {
        let expected = self.records.len() + 1;
        if record.loop_index != expected {
            return Err(ResearchError::session(format!(
                "loop record {} appended out of order (expected {})",
                record.loop_index, expected
            )));
        }
        self.records.push(record);
        Ok(&self.records[self.records.len() - 1])
    }

    pub fn records(&self) -> &[LoopRecord] {
        &self.records
    }

    pub fn last(&self) -> Option<&LoopRecord> {
        self.records.last()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn record(loop_index: usize) -> LoopRecord {
        LoopRecord {
            loop_index,
            started_at: Utc::now(),
            completed_at: Utc::now(),
            steering: None,
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
        }
    }

    #[test]
    fn test_records_must_be_contiguous() {
        let mut trail = AuditTrail::new();
        trail.append(record(1)).unwrap();
        assert!(trail.append(record(3)).is_err());
        assert!(trail.append(record(1)).is_err());
        trail.append(record(2)).unwrap();
        assert_eq!(trail.len(), 2);
    }

    #[test]
    fn test_from_records_rejects_gaps() {
        assert!(AuditTrail::from_records(vec![record(1), record(2)]).is_ok());
        assert!(AuditTrail::from_records(vec![record(2)]).is_err());
    }
}
