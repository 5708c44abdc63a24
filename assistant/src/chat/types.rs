// Chat data model: turns and conversations

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Titles are cut to this many characters when a conversation is archived
pub const TITLE_MAX_CHARS: usize = 50;

/// Used when a conversation has no user turn to derive a title from
pub const UNTITLED_CONVERSATION: &str = "Unterhaltung";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Assistant,
}

/// One message. Immutable once created; only complete text is ever stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatTurn {
    id: Uuid,
    role: Role,
    text: String,
    created_at: DateTime<Utc>,
}

impl ChatTurn {
    pub fn new(role: Role, text: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            role,
            text: text.into(),
            created_at: Utc::now(),
        }
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self::new(Role::User, text)
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self::new(Role::Assistant, text)
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }
}

/// An ordered list of turns.
///
/// Role alternation is not enforced; see [`Conversation::has_consecutive_roles`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conversation {
    pub id: Uuid,
    pub title: String,
    pub turns: Vec<ChatTurn>,
    pub created_at: DateTime<Utc>,
}

impl Conversation {
    pub fn new() -> Self {
        Self {
            id: Uuid::new_v4(),
            title: String::new(),
            turns: Vec::new(),
            created_at: Utc::now(),
        }
    }

    /// Fresh conversation holding copies of `turns`
    pub fn with_turns(turns: Vec<ChatTurn>) -> Self {
        Self {
            turns,
            ..Self::new()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }

    /// Leading characters of the first user turn
    pub fn derive_title(&self) -> String {
        self.turns
            .iter()
            .find(|turn| turn.role() == Role::User)
            .map(|turn| turn.text().trim().chars().take(TITLE_MAX_CHARS).collect::<String>())
            .filter(|title| !title.is_empty())
            .unwrap_or_else(|| UNTITLED_CONVERSATION.to_string())
    }

    /// Two adjacent turns by the same role
    pub fn has_consecutive_roles(&self) -> bool {
        self.turns
            .windows(2)
            .any(|pair| pair[0].role() == pair[1].role())
    }
}

impl Default for Conversation {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_title_from_first_user_turn() {
        let conversation = Conversation::with_turns(vec![
            ChatTurn::assistant("Willkommen"),
            ChatTurn::user("Ich habe seit drei Tagen Kopfschmerzen und Fieber, was kann ich tun?"),
        ]);
        let title = conversation.derive_title();
        assert_eq!(title.chars().count(), TITLE_MAX_CHARS);
        assert!(title.starts_with("Ich habe seit drei Tagen"));
    }

    #[test]
    fn test_title_counts_characters_not_bytes() {
        let text = "ü".repeat(60);
        let conversation = Conversation::with_turns(vec![ChatTurn::user(text)]);
        assert_eq!(conversation.derive_title(), "ü".repeat(50));
    }

    #[test]
    fn test_title_without_user_turn() {
        let conversation = Conversation::with_turns(vec![ChatTurn::assistant("Hallo")]);
        assert_eq!(conversation.derive_title(), UNTITLED_CONVERSATION);
    }

    #[test]
    fn test_consecutive_roles_are_reported_not_rejected() {
        let mut conversation = Conversation::new();
        conversation.turns.push(ChatTurn::user("A"));
        conversation.turns.push(ChatTurn::assistant("B"));
        assert!(!conversation.has_consecutive_roles());

        conversation.turns.push(ChatTurn::assistant("C"));
        assert!(conversation.has_consecutive_roles());
        assert_eq!(conversation.turns.len(), 3);
    }

    #[test]
    fn test_turn_ids_are_unique() {
        let a = ChatTurn::user("x");
        let b = ChatTurn::user("x");
        assert_ne!(a.id(), b.id());
    }
}
