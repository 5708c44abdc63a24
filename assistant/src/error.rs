// Error types for the inference engine

use std::path::PathBuf;

use thiserror::Error;

/// Errors raised below the session boundary.
///
/// `InferenceSession` and `ConversationOrchestrator` never hand these to
/// their callers; they are logged and mapped to display texts or flags.
#[derive(Debug, Error)]
pub enum EngineError {
    /// No model candidate exists in any search location.
    #[error("No model file found (searched: {})", display_paths(.searched))]
    ModelNotFound { searched: Vec<PathBuf> },

    /// The llama-helper binary could not be located.
    #[error("llama-helper binary not found: {0}")]
    HelperNotFound(String),

    /// The runtime could not load the model.
    #[error("Failed to load model {path}: {message}")]
    RuntimeLoad { path: PathBuf, message: String },

    /// The runtime reported a generation failure.
    #[error("Generation failed: {0}")]
    Generation(String),

    /// An exchange with the runtime exceeded its time budget.
    #[error("Request timed out after {secs}s")]
    Timeout { secs: u64 },

    /// The runtime process went away.
    #[error("Runtime closed its output (process may have crashed)")]
    RuntimeClosed,
}

fn display_paths(paths: &[PathBuf]) -> String {
    paths
        .iter()
        .map(|p| p.display().to_string())
        .collect::<Vec<_>>()
        .join(", ")
}
