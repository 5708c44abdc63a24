// On-device inference engine
// Local model discovery, prompt framing, and the single-flight session around the llama-helper runtime

pub mod locator;
pub mod memory;
pub mod models;
pub mod prompt;
pub mod runtime;
pub mod sanitize;
pub mod session;
pub mod sidecar;

#[cfg(test)]
pub(crate) mod testing;

// Re-export commonly used types
pub use locator::{LocationKind, ModelLocator, ResolvedModelPath, SearchLocation};
pub use memory::{MemorySnapshot, MemoryWatchConfig, MemoryWatcher};
pub use models::{default_candidates, GenerationParams, ModelCandidate, SamplingParams};
pub use prompt::format_prompt;
pub use runtime::{InferenceRuntime, RuntimeLoader};
pub use sanitize::clean_output;
pub use session::{
    InferenceSession, LoadOutcome, SessionState, GENERATION_FAILED_MESSAGE,
    MODEL_UNAVAILABLE_MESSAGE,
};
pub use sidecar::{resolve_helper_binary, SidecarLoader, SidecarRuntime};
