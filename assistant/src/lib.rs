// On-device medical chat assistant
// Model discovery, single-flight inference through the llama-helper sidecar,
// and the conversation layer consumed by the UI.

pub mod chat;
pub mod config;
pub mod engine;
pub mod error;
pub mod host;

pub use chat::{ChatTurn, ChatUpdate, Conversation, ConversationOrchestrator, Role};
pub use config::AssistantConfig;
pub use engine::{InferenceSession, SessionState};
pub use error::EngineError;
pub use host::AssistantHost;
