//! Unified error handling for gateway and infrastructure failures
//!
//! Provides structured error types with context, retry hints, and recovery suggestions

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{error, warn};

pub type DeeprResult<T> = Result<T, DeeprError>;

/// Error context providing additional information for debugging and recovery
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorContext {
    /// Unique error ID for tracking
    pub error_id: String,
    /// Timestamp when error occurred
    pub timestamp: DateTime<Utc>,
    /// Component where error originated
    pub component: String,
    /// Operation being performed when error occurred
    pub operation: Option<String>,
    /// Additional metadata
    pub metadata: std::collections::HashMap<String, String>,
    /// Recovery suggestions
    pub recovery_suggestions: Vec<String>,
}

impl ErrorContext {
    pub fn new(component: &str) -> Self {
        Self {
            error_id: uuid::Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            component: component.to_string(),
            operation: None,
            metadata: std::collections::HashMap::new(),
            recovery_suggestions: Vec::new(),
        }
    }

    pub fn with_operation(mut self, operation: &str) -> Self {
        self.operation = Some(operation.to_string());
        self
    }

    pub fn with_metadata(mut self, key: &str, value: &str) -> Self {
        self.metadata.insert(key.to_string(), value.to_string());
        self
    }

    pub fn with_suggestion(mut self, suggestion: &str) -> Self {
        self.recovery_suggestions.push(suggestion.to_string());
        self
    }
}

/// Main error type for provider gateways and shared infrastructure
#[derive(Error, Debug)]
pub enum DeeprError {
    /// Transport or rate-limit fault from an external provider. Retryable.
    #[error("Provider error: {message}")]
    Provider {
        message: String,
        provider: Option<String>,
        retry_after_ms: Option<u64>,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
        context: ErrorContext,
    },

    /// Model output could not be turned into the expected structure.
    #[error("Invalid model response: {message}")]
    InvalidResponse {
        message: String,
        raw: Option<String>,
        context: ErrorContext,
    },

    #[error("Configuration error: {message}")]
    Config {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
        context: ErrorContext,
    },

    #[error("Storage error: {message}")]
    Storage {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
        context: ErrorContext,
    },

    #[error("Resource not found: {resource}")]
    NotFound {
        resource: String,
        context: ErrorContext,
    },

    #[error("Operation timeout: {operation}")]
    Timeout {
        operation: String,
        duration_ms: u64,
        context: ErrorContext,
    },

    #[error("Operation cancelled: {operation}")]
    Cancelled { operation: String },

    #[error("Unsupported operation: {message}")]
    Unsupported {
        message: String,
        context: ErrorContext,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Internal error: {message}")]
    Internal {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
        context: ErrorContext,
    },
}

impl DeeprError {
    /// Get the error context
    pub fn context(&self) -> Option<&ErrorContext> {
        match self {
            DeeprError::Provider { context, .. } => Some(context),
            DeeprError::InvalidResponse { context, .. } => Some(context),
            DeeprError::Config { context, .. } => Some(context),
            DeeprError::Storage { context, .. } => Some(context),
            DeeprError::NotFound { context, .. } => Some(context),
            DeeprError::Timeout { context, .. } => Some(context),
            DeeprError::Unsupported { context, .. } => Some(context),
            DeeprError::Internal { context, .. } => Some(context),
            _ => None,
        }
    }

    /// Check if error is recoverable by retrying the same call
    pub fn is_recoverable(&self) -> bool {
        matches!(self, DeeprError::Provider { .. } | DeeprError::Timeout { .. })
    }

    /// Provider supplied retry-after hint in milliseconds
    pub fn retry_delay_ms(&self) -> Option<u64> {
        match self {
            DeeprError::Provider { retry_after_ms, .. } => *retry_after_ms,
            _ => None,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, DeeprError::Cancelled { .. })
    }

    /// Build a provider error with an optional retry-after hint
    pub fn provider(
        provider: &str,
        message: impl Into<String>,
        retry_after_ms: Option<u64>,
    ) -> Self {
        DeeprError::Provider {
            message: message.into(),
            provider: Some(provider.to_string()),
            retry_after_ms,
            source: None,
            context: ErrorContext::new("provider").with_metadata("provider", provider),
        }
    }

    /// Build an invalid response error carrying the offending text
    pub fn invalid_response(message: impl Into<String>, raw: Option<&str>) -> Self {
        DeeprError::InvalidResponse {
            message: message.into(),
            raw: raw.map(|r| r.chars().take(2000).collect()),
            context: ErrorContext::new("llm_gateway").with_operation("parse_response"),
        }
    }

    pub fn cancelled(operation: &str) -> Self {
        DeeprError::Cancelled {
            operation: operation.to_string(),
        }
    }

    /// Log the error with appropriate level
    pub fn log(&self) {
        match self {
            DeeprError::Internal { .. } => {
                error!(
                    error_id = ?self.context().map(|c| &c.error_id),
                    error = %self,
                    "Internal error occurred"
                );
            }
            DeeprError::Config { .. } => {
                error!(
                    error_id = ?self.context().map(|c| &c.error_id),
                    error = %self,
                    "Configuration error"
                );
            }
            DeeprError::Provider { .. } | DeeprError::Timeout { .. } => {
                warn!(
                    error_id = ?self.context().map(|c| &c.error_id),
                    error = %self,
                    "Provider or timeout error (may be recoverable)"
                );
            }
            DeeprError::InvalidResponse { .. } | DeeprError::Cancelled { .. } => {
                warn!(
                    error_id = ?self.context().map(|c| &c.error_id),
                    error = %self,
                    "Call did not produce a usable result"
                );
            }
            _ => {
                error!(
                    error_id = ?self.context().map(|c| &c.error_id),
                    error = %self,
                    "Error occurred"
                );
            }
        }
    }
}

/// Convenience macros for creating errors with context
#[macro_export]
macro_rules! provider_error {
    ($msg:expr, $provider:expr) => {
        $crate::DeeprError::Provider {
            message: $msg.to_string(),
            provider: Some($provider.to_string()),
            retry_after_ms: None,
            source: None,
            context: $crate::ErrorContext::new("provider")
                .with_suggestion("Check provider availability and rate limits"),
        }
    };
    ($msg:expr, $provider:expr, $source:expr) => {
        $crate::DeeprError::Provider {
            message: $msg.to_string(),
            provider: Some($provider.to_string()),
            retry_after_ms: None,
            source: Some(Box::new($source)),
            context: $crate::ErrorContext::new("provider")
                .with_suggestion("Check provider availability and rate limits"),
        }
    };
}

#[macro_export]
macro_rules! invalid_response_error {
    ($msg:expr) => {
        $crate::DeeprError::InvalidResponse {
            message: $msg.to_string(),
            raw: None,
            context: $crate::ErrorContext::new("llm_gateway"),
        }
    };
    ($msg:expr, $raw:expr) => {
        $crate::DeeprError::InvalidResponse {
            message: $msg.to_string(),
            raw: Some($raw.to_string()),
            context: $crate::ErrorContext::new("llm_gateway"),
        }
    };
}

#[macro_export]
macro_rules! config_error {
    ($msg:expr, $component:expr) => {
        $crate::DeeprError::Config {
            message: $msg.to_string(),
            source: None,
            context: $crate::ErrorContext::new($component)
                .with_suggestion("Check your configuration file"),
        }
    };
}

#[macro_export]
macro_rules! not_found_error {
    ($resource:expr, $component:expr) => {
        $crate::DeeprError::NotFound {
            resource: $resource.to_string(),
            context: $crate::ErrorContext::new($component)
                .with_suggestion("Verify the identifier"),
        }
    };
}
