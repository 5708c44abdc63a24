// Model candidates and generation parameters for the on-device assistant
// Add new quantizations to default_candidates() - most specific first

use serde::{Deserialize, Serialize};

// ============================================================================
// Model Candidates
// ============================================================================

/// A model file name the locator probes for, split into base name and extension
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelCandidate {
    /// File stem (e.g., "medgemma-4b-instruct.Q4_K_M")
    pub base_name: String,

    /// File extension without the dot (e.g., "gguf")
    pub extension: String,
}

impl ModelCandidate {
    pub fn new(base_name: impl Into<String>, extension: impl Into<String>) -> Self {
        Self {
            base_name: base_name.into(),
            extension: extension.into(),
        }
    }

    /// File name on disk: `<base_name>.<extension>`
    pub fn file_name(&self) -> String {
        format!("{}.{}", self.base_name, self.extension)
    }
}

/// Ranked candidates: the 4-bit quantization first, the generic build last
pub fn default_candidates() -> Vec<ModelCandidate> {
    vec![
        ModelCandidate::new("medgemma-4b-instruct.Q4_K_M", "gguf"),
        ModelCandidate::new("medgemma-4b-instruct", "gguf"),
    ]
}

// ============================================================================
// Generation Parameters
// ============================================================================

/// Sampling parameters for text generation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SamplingParams {
    /// Temperature - controls randomness (0.0 = deterministic, 1.0 = balanced)
    pub temperature: f32,

    /// Top-K sampling - limits vocabulary to top K tokens (0 = disabled)
    pub top_k: i32,

    /// Top-P (nucleus) sampling - cumulative probability threshold (1.0 = disabled)
    pub top_p: f32,

    /// Stop tokens - generation stops when any of these appear in output
    pub stop_tokens: Vec<String>,
}

impl Default for SamplingParams {
    fn default() -> Self {
        Self {
            temperature: 1.0,
            top_k: 64,
            top_p: 0.95,
            stop_tokens: vec![super::prompt::TURN_END.to_string()],
        }
    }
}

/// Per-request limits handed to the runtime
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerationParams {
    /// Upper bound on generated tokens per reply
    pub max_tokens: i32,

    /// Context window size in tokens
    pub context_size: u32,

    /// How long a single request may take before the runtime is considered hung
    pub timeout_secs: u64,

    pub sampling: SamplingParams,
}

impl Default for GenerationParams {
    fn default() -> Self {
        Self {
            max_tokens: DEFAULT_MAX_TOKENS,
            context_size: DEFAULT_CONTEXT_SIZE,
            timeout_secs: GENERATION_TIMEOUT_SECS,
            sampling: SamplingParams::default(),
        }
    }
}

// ============================================================================
// Configuration Constants
// ============================================================================

/// Default max tokens for a chat reply
pub const DEFAULT_MAX_TOKENS: i32 = 1024;

/// Default context window; 4k keeps the KV cache small on 6 GB devices
pub const DEFAULT_CONTEXT_SIZE: u32 = 4096;

/// Generation timeout (how long to wait for a response)
pub const GENERATION_TIMEOUT_SECS: u64 = 300; // 5 minutes

/// Idle time before a loaded model is released - can be overridden via LLAMA_IDLE_TIMEOUT env var
pub const DEFAULT_IDLE_TIMEOUT_SECS: u64 = 300; // 5 minutes
