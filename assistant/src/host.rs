// Production wiring: config -> locator + sidecar loader -> session -> chat + memory watcher

use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::chat::ConversationOrchestrator;
use crate::config::AssistantConfig;
use crate::engine::{InferenceSession, MemoryWatcher, ModelLocator, SidecarLoader};

/// Everything the UI layer needs, owned in one place
pub struct AssistantHost {
    session: Arc<InferenceSession>,
    chat: ConversationOrchestrator,
    watcher: Option<JoinHandle<()>>,
    cancel: CancellationToken,
}

impl AssistantHost {
    /// Must be called from within a Tokio runtime.
    /// The model itself is loaded lazily on the first request; a missing model
    /// or helper binary shows up as an unavailable model, not as a start error.
    pub fn start(config: AssistantConfig) -> Self {
        let locator = ModelLocator::from_config(&config);
        let loader = Arc::new(SidecarLoader::from_config(&config));
        let session = Arc::new(InferenceSession::new(locator, loader));

        if session.is_available() {
            log::info!("Model present, will load on first request");
        } else {
            log::warn!("No model installed yet; replies will report it as unavailable");
        }

        let chat = ConversationOrchestrator::new(session.clone(), config.archive_capacity);
        let cancel = CancellationToken::new();
        let watcher = MemoryWatcher::new(config.memory.clone()).spawn(session.clone(), cancel.clone());

        Self {
            session,
            chat,
            watcher: Some(watcher),
            cancel,
        }
    }

    pub fn session(&self) -> &Arc<InferenceSession> {
        &self.session
    }

    pub fn chat(&self) -> &ConversationOrchestrator {
        &self.chat
    }

    pub fn chat_mut(&mut self) -> &mut ConversationOrchestrator {
        &mut self.chat
    }

    /// Stop the watcher and release the chat surface
    pub async fn shutdown(mut self) {
        self.cancel.cancel();
        if let Some(watcher) = self.watcher.take() {
            if let Err(e) = watcher.await {
                log::error!("Memory watcher task failed: {}", e);
            }
        }
        log::info!("Assistant host shut down");
    }
}

impl Drop for AssistantHost {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
