// In-memory archive of finished conversations, newest first

use std::collections::VecDeque;

use uuid::Uuid;

use super::types::Conversation;

/// Oldest entries are evicted beyond this many conversations
pub const DEFAULT_ARCHIVE_CAPACITY: usize = 50;

#[derive(Debug, Clone)]
pub struct ConversationArchive {
    entries: VecDeque<Conversation>,
    capacity: usize,
}

impl ConversationArchive {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: VecDeque::new(),
            capacity: capacity.max(1),
        }
    }

    /// Store at the front. Entries are never modified afterwards.
    pub fn push(&mut self, conversation: Conversation) {
        self.entries.push_front(conversation);
        while self.entries.len() > self.capacity {
            if let Some(evicted) = self.entries.pop_back() {
                log::debug!("Archive full, evicting conversation '{}'", evicted.title);
            }
        }
    }

    pub fn get(&self, id: Uuid) -> Option<&Conversation> {
        self.entries.iter().find(|conversation| conversation.id == id)
    }

    /// Case-insensitive substring match on titles; a blank query returns everything.
    /// Spaces inside a non-blank query are significant.
    pub fn search(&self, query: &str) -> Vec<&Conversation> {
        if query.trim().is_empty() {
            return self.entries.iter().collect();
        }
        let needle = query.to_lowercase();
        self.entries
            .iter()
            .filter(|conversation| conversation.title.to_lowercase().contains(&needle))
            .collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Conversation> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for ConversationArchive {
    fn default() -> Self {
        Self::new(DEFAULT_ARCHIVE_CAPACITY)
    }
}
