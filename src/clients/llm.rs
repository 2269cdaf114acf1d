// =============================================================================
// Advisory text client — optional LLM summaries with a hard deadline
// =============================================================================
//
// Summaries are never authoritative. Every call carries its own short
// deadline and every caller has a deterministic fallback, so a slow or
// absent model can never stall a tick.
// =============================================================================

use std::time::Duration;

use async_trait::async_trait;

use crate::errors::{CoreError, CoreResult};

/// Text-generation collaborator.
#[async_trait]
pub trait LlmClient: Send + Sync {
    /// Generate advisory text, failing once `deadline` elapses.
    async fn generate(&self, prompt: &str, deadline: Duration) -> CoreResult<String>;
}

/// The default when no model endpoint is configured: always fails fast so
/// callers take their deterministic fallback path.
#[derive(Debug, Default)]
pub struct DisabledLlm;

#[async_trait]
impl LlmClient for DisabledLlm {
    async fn generate(&self, _prompt: &str, _deadline: Duration) -> CoreResult<String> {
        Err(CoreError::Transient("llm client not configured".into()))
    }
}

/// Apply the deadline around any inner future-producing client call.
pub async fn generate_with_deadline(
    client: &dyn LlmClient,
    prompt: &str,
    deadline: Duration,
) -> CoreResult<String> {
    match tokio::time::timeout(deadline, client.generate(prompt, deadline)).await {
        Ok(result) => result,
        Err(_) => Err(CoreError::Timeout(format!(
            "llm call exceeded {} ms",
            deadline.as_millis()
        ))),
    }
}
