// Conversation orchestrator: the chat surface consumed by the UI layer
// All chat state is owned here and mutated only through &mut self on the control task.
// Generation runs on one background worker fed in send order; its events are applied
// with next_update / poll_updates / wait_idle, so replies land in send order.

use std::sync::Arc;

use tokio::sync::mpsc::{self, error::TryRecvError, UnboundedReceiver, UnboundedSender};
use uuid::Uuid;

use super::archive::ConversationArchive;
use super::types::{ChatTurn, Conversation, Role};
use crate::engine::session::{InferenceSession, GENERATION_FAILED_MESSAGE};

struct GenerationJob {
    conversation_id: Uuid,
    text: String,
}

enum WorkerEvent {
    Token { conversation_id: Uuid, text: String },
    Finished { conversation_id: Uuid, reply: String },
}

/// What changed after applying one worker event
#[derive(Debug, Clone, PartialEq)]
pub enum ChatUpdate {
    /// Raw piece appended to the in-progress text
    Partial(String),
    /// Finished assistant turn appended to the active conversation
    Reply(ChatTurn),
    /// The reply belonged to a conversation that is no longer active
    Discarded,
}

pub struct ConversationOrchestrator {
    session: Arc<InferenceSession>,
    active: Conversation,
    archive: ConversationArchive,
    in_progress: String,
    pending: usize,
    jobs: UnboundedSender<GenerationJob>,
    events: UnboundedReceiver<WorkerEvent>,
}

impl ConversationOrchestrator {
    /// Must be called from within a Tokio runtime (spawns the generation worker).
    pub fn new(session: Arc<InferenceSession>, archive_capacity: usize) -> Self {
        let (jobs, job_rx) = mpsc::unbounded_channel();
        let (event_tx, events) = mpsc::unbounded_channel();
        tokio::spawn(run_generation_worker(session.clone(), job_rx, event_tx));

        Self {
            session,
            active: Conversation::new(),
            archive: ConversationArchive::new(archive_capacity),
            in_progress: String::new(),
            pending: 0,
            jobs,
            events,
        }
    }

    // ------------------------------------------------------------------
    // Read surface
    // ------------------------------------------------------------------

    /// Turns of the active conversation, in order
    pub fn messages(&self) -> &[ChatTurn] {
        &self.active.turns
    }

    pub fn active_conversation(&self) -> &Conversation {
        &self.active
    }

    pub fn is_busy(&self) -> bool {
        self.pending > 0
    }

    /// Raw streamed text of the reply currently being generated
    pub fn in_progress_text(&self) -> &str {
        &self.in_progress
    }

    pub fn is_model_available(&self) -> bool {
        self.session.is_available()
    }

    pub fn archive(&self) -> &ConversationArchive {
        &self.archive
    }

    pub fn search_archive(&self, query: &str) -> Vec<&Conversation> {
        self.archive.search(query)
    }

    // ------------------------------------------------------------------
    // Write surface
    // ------------------------------------------------------------------

    /// Append the user turn now and queue generation of the reply.
    /// Blank input is ignored.
    pub fn send(&mut self, text: &str) {
        let trimmed = text.trim();
        if trimmed.is_empty() {
            return;
        }

        self.active.turns.push(ChatTurn::user(trimmed));
        let job = GenerationJob {
            conversation_id: self.active.id,
            text: trimmed.to_string(),
        };

        if self.jobs.send(job).is_err() {
            // Worker is gone; the turn still needs an answer
            log::error!("Generation worker not running, replying with failure text");
            self.active.turns.push(ChatTurn::assistant(GENERATION_FAILED_MESSAGE));
            return;
        }
        self.pending += 1;
    }

    /// Archive the active conversation (if it has turns) and start an empty one
    pub fn start_new_conversation(&mut self) {
        let previous = std::mem::take(&mut self.active);
        self.in_progress.clear();
        if previous.is_empty() {
            return;
        }

        let title = previous.derive_title();
        log::info!("Archiving conversation '{}' ({} turns)", title, previous.turns.len());
        self.archive.push(Conversation { title, ..previous });
    }

    /// Replace the active conversation with a copy of an archived one.
    /// Returns `false` for an unknown id. The archive entry is not touched.
    pub fn load_conversation(&mut self, id: Uuid) -> bool {
        let Some(archived) = self.archive.get(id) else {
            log::warn!("No archived conversation with id {}", id);
            return false;
        };

        self.active = Conversation::with_turns(archived.turns.clone());
        self.in_progress.clear();
        true
    }

    // ------------------------------------------------------------------
    // Applying worker events on the control task
    // ------------------------------------------------------------------

    fn apply(&mut self, event: WorkerEvent) -> ChatUpdate {
        match event {
            WorkerEvent::Token { conversation_id, text } => {
                if conversation_id != self.active.id {
                    return ChatUpdate::Discarded;
                }
                self.in_progress.push_str(&text);
                ChatUpdate::Partial(text)
            }
            WorkerEvent::Finished { conversation_id, reply } => {
                self.pending = self.pending.saturating_sub(1);
                self.in_progress.clear();
                if conversation_id != self.active.id {
                    log::warn!("Discarding reply for inactive conversation {}", conversation_id);
                    return ChatUpdate::Discarded;
                }
                let turn = ChatTurn::assistant(reply);
                self.active.turns.push(turn.clone());
                ChatUpdate::Reply(turn)
            }
        }
    }

    /// The worker is gone; nothing still pending will ever be answered
    fn worker_lost(&mut self) {
        if self.pending > 0 {
            log::error!(
                "Generation worker stopped with {} request(s) pending, clearing busy state",
                self.pending
            );
        }
        self.pending = 0;
        self.in_progress.clear();
    }

    /// Wait for and apply the next worker event. `None` when nothing is pending.
    pub async fn next_update(&mut self) -> Option<ChatUpdate> {
        if self.pending == 0 {
            return None;
        }
        match self.events.recv().await {
            Some(event) => Some(self.apply(event)),
            None => {
                self.worker_lost();
                None
            }
        }
    }

    /// Apply every event that is already queued without waiting
    pub fn poll_updates(&mut self) -> Vec<ChatUpdate> {
        let mut updates = Vec::new();
        loop {
            match self.events.try_recv() {
                Ok(event) => updates.push(self.apply(event)),
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    self.worker_lost();
                    break;
                }
            }
        }
        updates
    }

    /// Apply events until every queued request has its reply
    pub async fn wait_idle(&mut self) {
        while self.next_update().await.is_some() {}
    }
}

/// Runs queued requests one at a time, relaying tokens then the final reply
async fn run_generation_worker(
    session: Arc<InferenceSession>,
    mut jobs: UnboundedReceiver<GenerationJob>,
    events: UnboundedSender<WorkerEvent>,
) {
    while let Some(job) = jobs.recv().await {
        let conversation_id = job.conversation_id;
        let (token_tx, mut token_rx) = mpsc::unbounded_channel::<String>();

        let generation = session.ask_streaming(&job.text, token_tx);
        tokio::pin!(generation);

        let reply = loop {
            tokio::select! {
                biased;
                Some(text) = token_rx.recv() => {
                    let _ = events.send(WorkerEvent::Token { conversation_id, text });
                }
                reply = &mut generation => break reply,
            }
        };
        // Pieces that arrived in the same wakeup as completion
        while let Ok(text) = token_rx.try_recv() {
            let _ = events.send(WorkerEvent::Token { conversation_id, text });
        }

        if events
            .send(WorkerEvent::Finished { conversation_id, reply })
            .is_err()
        {
            log::debug!("Orchestrator dropped, generation worker exiting");
            break;
        }
    }
}

/// Convenience for hosts that only need the role and text of each turn
pub fn snapshot(turns: &[ChatTurn]) -> Vec<(Role, String)> {
    turns
        .iter()
        .map(|turn| (turn.role(), turn.text().to_string()))
        .collect()
}
