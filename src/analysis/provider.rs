//! Provider seam: one trait, two LLM backends.

use async_trait::async_trait;

use crate::error::AnalysisError;

/// The system instruction every backend pins its requests to.
pub const SYSTEM_INSTRUCTION: &str =
    "You are an email analysis assistant. Always respond with valid JSON only.";

/// A chat-completion backend that can answer a prompt with raw text.
///
/// Implementations return whatever the model produced; JSON extraction
/// and validation happen above this seam so the fallback chain is not
/// duplicated per backend.
#[async_trait]
pub trait Provider: Send + Sync {
    /// Short provider identifier, recorded on every processed message.
    fn name(&self) -> &str;

    /// Send one prompt and return the model's raw reply.
    async fn analyze(&self, prompt: &str) -> Result<String, AnalysisError>;

    /// Connectivity check: verify the backend answers and report which
    /// model did, in a human-readable message.
    async fn probe(&self) -> Result<String, AnalysisError>;
}
