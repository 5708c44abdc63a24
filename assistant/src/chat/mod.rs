// Conversation layer on top of the inference session
// Turns, the in-memory archive, and the orchestrator that drives generation

pub mod archive;
pub mod orchestrator;
pub mod types;

pub use archive::{ConversationArchive, DEFAULT_ARCHIVE_CAPACITY};
pub use orchestrator::{snapshot, ChatUpdate, ConversationOrchestrator};
pub use types::{ChatTurn, Conversation, Role, TITLE_MAX_CHARS, UNTITLED_CONVERSATION};
