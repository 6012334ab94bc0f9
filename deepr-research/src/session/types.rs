//! Session control surface types

use crate::research::types::{EffortMode, UploadedDocument};
use serde::{Deserialize, Serialize};

/// Parameters of a new research session
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StartRequest {
    pub query: String,
    #[serde(default)]
    pub effort_mode: EffortMode,
    /// Loop ceiling; the configured default applies when absent
    #[serde(default)]
    pub max_loops: Option<usize>,
    /// Already-extracted documents merged in the first loop
    #[serde(default)]
    pub uploaded_documents: Vec<UploadedDocument>,
}

impl StartRequest {
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            ..Self::default()
        }
    }

    pub fn with_effort(mut self, effort_mode: EffortMode) -> Self {
        self.effort_mode = effort_mode;
        self
    }

    pub fn with_max_loops(mut self, max_loops: usize) -> Self {
        self.max_loops = Some(max_loops);
        self
    }

    pub fn with_document(mut self, name: impl Into<String>, content: impl Into<String>) -> Self {
        self.uploaded_documents.push(UploadedDocument {
            name: name.into(),
            content: content.into(),
        });
        self
    }
}
