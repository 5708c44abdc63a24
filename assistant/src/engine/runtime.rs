// Boundary to the native inference runtime
// The session only sees these two traits; production uses the llama-helper sidecar

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::mpsc::UnboundedSender;

use super::locator::ResolvedModelPath;

/// A loaded model that can generate text.
#[async_trait]
pub trait InferenceRuntime: Send + Sync {
    /// Generate the complete reply for a fully formatted prompt.
    async fn generate(&self, prompt: String) -> Result<String>;

    /// Generate a reply, pushing each decoded piece into `tokens` in
    /// generation order. Returns once generation has finished; the sender
    /// is dropped at that point.
    async fn generate_streaming(&self, prompt: String, tokens: UnboundedSender<String>)
        -> Result<()>;

    /// `false` once the runtime can no longer serve requests (e.g. the
    /// helper process died). The session then discards and reloads it.
    fn is_alive(&self) -> bool {
        true
    }
}

/// Builds a runtime bound to a resolved model file.
#[async_trait]
pub trait RuntimeLoader: Send + Sync {
    async fn load(&self, model: &ResolvedModelPath) -> Result<Arc<dyn InferenceRuntime>>;
}
