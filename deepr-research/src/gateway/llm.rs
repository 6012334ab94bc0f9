//! Language model gateway
//!
//! Selects the model of a profile, bounds every call with the profile's
//! deadline, retries provider faults with backoff and aborts as soon as the
//! owning session is cancelled.

use crate::research::prompts;
use deepr_core::{
    retry_async, with_timeout, CallPurpose, CompletionRequest, DeeprError, DeeprResult,
    LanguageModel, LlmSettings, ModelConfig, ModelProfile, RateLimiter, RetryConfig,
    StructuredOutput,
};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Completion access shared by every session
#[derive(Clone)]
pub struct LlmGateway {
    primary: Arc<dyn LanguageModel>,
    activity: Arc<dyn LanguageModel>,
    settings: LlmSettings,
    /// Shared by all sessions so the provider pool stays bounded
    limiter: RateLimiter,
    retry: RetryConfig,
}

impl LlmGateway {
    /// Gateway serving both profiles from the same backend
    pub fn new(backend: Arc<dyn LanguageModel>, settings: LlmSettings) -> Self {
        let limiter = RateLimiter::new(
            settings.max_concurrent_requests,
            settings.min_request_interval_ms,
        );
        let retry = RetryConfig {
            max_attempts: settings.max_attempts,
            initial_delay_ms: settings.initial_backoff_ms,
            ..RetryConfig::default()
        };
        Self {
            activity: Arc::clone(&backend),
            primary: backend,
            settings,
            limiter,
            retry,
        }
    }

    /// Serve the activity profile from a different backend
    pub fn with_activity_backend(mut self, backend: Arc<dyn LanguageModel>) -> Self {
        self.activity = backend;
        self
    }

    pub fn with_retry_config(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn model_config(&self, profile: ModelProfile) -> &ModelConfig {
        match profile {
            ModelProfile::Primary => &self.settings.primary,
            ModelProfile::Activity => &self.settings.activity,
        }
    }

    fn backend(&self, profile: ModelProfile) -> &Arc<dyn LanguageModel> {
        match profile {
            ModelProfile::Primary => &self.primary,
            ModelProfile::Activity => &self.activity,
        }
    }

    /// Run a free-text completion
    pub async fn complete(
        &self,
        request: CompletionRequest,
        cancel: &CancellationToken,
    ) -> DeeprResult<String> {
        let model = self.model_config(request.profile);
        let request = request.with_timeout(Duration::from_millis(model.timeout_ms));
        let backend = self.backend(request.profile);
        let operation = format!("llm_{}", request.purpose);

        debug!(
            purpose = %request.purpose,
            profile = %request.profile,
            backend = backend.name(),
            model = %model.model,
            "Invoking language model"
        );

        let call = retry_async(
            || {
                let request = &request;
                let operation = &operation;
                async move {
                    let _guard = self.limiter.acquire().await?;
                    let text =
                        with_timeout(backend.complete(model, request), request.timeout, operation)
                            .await??;
                    Ok(text)
                }
            },
            &self.retry,
            &operation,
        );

        tokio::select! {
            _ = cancel.cancelled() => Err(DeeprError::cancelled(&operation)),
            result = call => result,
        }
    }

    /// Run a completion whose output must be a JSON value.
    ///
    /// Malformed output gets one repair attempt before it is surfaced as
    /// `InvalidResponse`.
    pub async fn complete_structured(
        &self,
        request: CompletionRequest,
        cancel: &CancellationToken,
    ) -> DeeprResult<StructuredOutput> {
        let profile = request.profile;
        let purpose = request.purpose;
        let raw = self.complete(request, cancel).await?;

        let first_error = match StructuredOutput::parse(&raw) {
            Ok(output) => return Ok(output),
            Err(error) => error,
        };

        warn!(purpose = %purpose, "Malformed structured output, attempting repair");
        let repair = CompletionRequest::new(
            CallPurpose::Repair,
            profile,
            prompts::create_repair_prompt(&raw),
        )
        .with_system(prompts::REPAIR_SYSTEM_PROMPT);

        let repaired = self.complete(repair, cancel).await?;
        StructuredOutput::parse(&repaired).map_err(|_| first_error)
    }
}
