// Assistant configuration: where to look for models, how to run them
// Defaults are usable as-is; from_env() applies environment overrides

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::chat::archive::DEFAULT_ARCHIVE_CAPACITY;
use crate::engine::memory::MemoryWatchConfig;
use crate::engine::models::{self, GenerationParams, ModelCandidate};

/// Overrides the llama-helper binary location
pub const HELPER_ENV_VAR: &str = "MYMED_LLAMA_HELPER";

/// Overrides the bundled (read-only) model directory
pub const BUNDLE_DIR_ENV_VAR: &str = "MYMED_BUNDLE_DIR";

/// Overrides the writable model directory
pub const DOCUMENTS_DIR_ENV_VAR: &str = "MYMED_DOCUMENTS_DIR";

/// Seconds of inactivity before a loaded model is released
pub const IDLE_TIMEOUT_ENV_VAR: &str = "LLAMA_IDLE_TIMEOUT";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AssistantConfig {
    /// Read-only resources shipped with the app; searched first
    pub bundled_dir: Option<PathBuf>,

    /// Writable per-app storage; searched second
    pub documents_dir: Option<PathBuf>,

    /// Ranked model files, most specific quantization first
    pub candidates: Vec<ModelCandidate>,

    pub generation: GenerationParams,

    /// Explicit llama-helper path; discovered automatically when unset
    pub helper_binary: Option<PathBuf>,

    /// Maximum number of archived conversations kept in memory
    pub archive_capacity: usize,

    pub memory: MemoryWatchConfig,
}

impl Default for AssistantConfig {
    fn default() -> Self {
        Self {
            bundled_dir: default_bundled_dir(),
            documents_dir: default_documents_dir(),
            candidates: models::default_candidates(),
            generation: GenerationParams::default(),
            helper_binary: None,
            archive_capacity: DEFAULT_ARCHIVE_CAPACITY,
            memory: MemoryWatchConfig::default(),
        }
    }
}

impl AssistantConfig {
    /// Defaults with environment overrides applied
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Some(dir) = env_path(BUNDLE_DIR_ENV_VAR) {
            config.bundled_dir = Some(dir);
        }
        if let Some(dir) = env_path(DOCUMENTS_DIR_ENV_VAR) {
            config.documents_dir = Some(dir);
        }
        if let Some(helper) = env_path(HELPER_ENV_VAR) {
            config.helper_binary = Some(helper);
        }
        if let Some(secs) = std::env::var(IDLE_TIMEOUT_ENV_VAR)
            .ok()
            .and_then(|s| s.parse::<u64>().ok())
        {
            config.memory.idle_unload_secs = Some(secs);
        }

        log::info!(
            "Assistant config: bundled={:?}, documents={:?}, idle unload={:?}s",
            config.bundled_dir,
            config.documents_dir,
            config.memory.idle_unload_secs
        );
        config
    }
}

fn env_path(var: &str) -> Option<PathBuf> {
    std::env::var(var)
        .ok()
        .filter(|value| !value.is_empty())
        .map(PathBuf::from)
}

/// RESOURCE_DIR when the host sets it, else `models/` next to the executable
fn default_bundled_dir() -> Option<PathBuf> {
    if let Some(dir) = env_path("RESOURCE_DIR") {
        return Some(dir.join("models"));
    }
    std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(|dir| dir.join("models")))
}

/// - macOS: ~/Library/Application Support/MyMed/models/
/// - Windows: %APPDATA%\MyMed\models\
/// - Linux: ~/.local/share/MyMed/models/
fn default_documents_dir() -> Option<PathBuf> {
    let mut path = dirs::data_dir().or_else(dirs::home_dir)?;
    path.push("MyMed");
    path.push("models");
    Some(path)
}
