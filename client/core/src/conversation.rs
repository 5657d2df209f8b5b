//! Conversation Data Model
//!
//! Conversations own the finalized message log. While an answer is streaming,
//! the live assistant [`Message`] is owned exclusively by the stream session;
//! ownership transfers into the conversation log at finalize, and from then
//! on the message is immutable. Listing and export collaborators only ever
//! read the log.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

// ============================================================================
// Identifiers
// ============================================================================

/// Unique identifier for a conversation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConversationId(pub Uuid);

impl ConversationId {
    /// Create a new unique conversation ID.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConversationId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ConversationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Short form: first 8 chars of the UUID.
        write!(f, "{}", &self.0.to_string()[..8])
    }
}

/// Unique identifier for a message.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MessageId(pub Uuid);

impl MessageId {
    /// Create a new unique message ID.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for MessageId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", &self.0.to_string()[..8])
    }
}

// ============================================================================
// Messages
// ============================================================================

/// Who authored a message.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    /// The person typing.
    User,
    /// The model's answer.
    Assistant,
    /// Instructions injected by the client or backend.
    System,
}

/// One message in a conversation.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Message {
    /// Unique message ID.
    pub id: MessageId,
    /// Who sent this message.
    pub role: MessageRole,
    /// Message text. Grows while streaming; frozen at finalize.
    pub content: String,
    /// Whether streaming was interrupted before a terminal event.
    #[serde(default)]
    pub interrupted: bool,
    /// Retrieval sources attached at finalize time. Opaque to the client.
    #[serde(default)]
    pub sources: Vec<Value>,
    /// Artifacts attached at finalize time. Opaque to the client.
    #[serde(default)]
    pub artifacts: Vec<Value>,
    /// Server-side message id, when the backend reported one.
    #[serde(default)]
    pub server_message_id: Option<String>,
    /// When the message was created.
    pub created_at: DateTime<Utc>,
}

impl Message {
    /// Create a complete message.
    #[must_use]
    pub fn new(role: MessageRole, content: String) -> Self {
        Self {
            id: MessageId::new(),
            role,
            content,
            interrupted: false,
            sources: Vec::new(),
            artifacts: Vec::new(),
            server_message_id: None,
            created_at: Utc::now(),
        }
    }

    /// Create an empty assistant message for a stream session to fill.
    #[must_use]
    pub fn streaming_assistant() -> Self {
        Self::new(MessageRole::Assistant, String::new())
    }

    /// Whether any answer text has accumulated.
    #[must_use]
    pub fn has_content(&self) -> bool {
        !self.content.is_empty()
    }
}

// ============================================================================
// Conversations
// ============================================================================

/// A conversation: finalized message log plus listing metadata.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Conversation {
    /// Unique conversation ID.
    pub id: ConversationId,
    /// Human title, set once by the auto-title hook or the user.
    pub title: Option<String>,
    /// Finalized messages, oldest first.
    pub messages: Vec<Message>,
    /// Guard so the auto-title hook fires at most once per conversation.
    #[serde(default)]
    pub title_generated: bool,
    /// When the conversation was created.
    pub created_at: DateTime<Utc>,
    /// Last time a message was finalized into the log.
    pub updated_at: DateTime<Utc>,
}

impl Conversation {
    /// Create an empty conversation.
    #[must_use]
    pub fn new() -> Self {
        let now = Utc::now();
        Self {
            id: ConversationId::new(),
            title: None,
            messages: Vec::new(),
            title_generated: false,
            created_at: now,
            updated_at: now,
        }
    }

    /// Append a user message to the log.
    pub fn push_user_message(&mut self, content: String) -> MessageId {
        let message = Message::new(MessageRole::User, content);
        let id = message.id;
        self.messages.push(message);
        self.updated_at = Utc::now();
        id
    }

    /// Append a finalized message to the log (ownership transfer from the
    /// stream session).
    pub fn push_message(&mut self, message: Message) {
        self.messages.push(message);
        self.updated_at = Utc::now();
    }

    /// Get a message by ID.
    #[must_use]
    pub fn get_message(&self, id: MessageId) -> Option<&Message> {
        self.messages.iter().find(|m| m.id == id)
    }

    /// The first user/assistant exchange, used by the auto-title hook.
    #[must_use]
    pub fn first_exchange(&self) -> Option<(&str, &str)> {
        let user = self
            .messages
            .iter()
            .find(|m| m.role == MessageRole::User)?;
        let assistant = self
            .messages
            .iter()
            .find(|m| m.role == MessageRole::Assistant)?;
        Some((user.content.as_str(), assistant.content.as_str()))
    }

    /// Whether the auto-title hook should run after a successful finalize.
    #[must_use]
    pub fn wants_title(&self) -> bool {
        !self.title_generated && self.title.is_none()
    }

    /// Display title for listings.
    #[must_use]
    pub fn display_title(&self) -> String {
        if let Some(ref title) = self.title {
            return title.clone();
        }
        self.messages
            .iter()
            .find(|m| m.role == MessageRole::User)
            .map_or_else(
                || "New conversation".to_string(),
                |m| {
                    let mut t: String = m.content.chars().take(40).collect();
                    if m.content.chars().count() > 40 {
                        t.push('…');
                    }
                    t
                },
            )
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
    use pretty_assertions::assert_eq;

    #[test]
    fn test_push_user_message() {
        let mut conversation = Conversation::new();
        let id = conversation.push_user_message("Hello".to_string());
        assert_eq!(conversation.messages.len(), 1);
        let message = conversation.get_message(id).unwrap();
        assert_eq!(message.role, MessageRole::User);
        assert_eq!(message.content, "Hello");
        assert!(!message.interrupted);
    }

    #[test]
    fn test_first_exchange() {
        let mut conversation = Conversation::new();
        assert!(conversation.first_exchange().is_none());

        conversation.push_user_message("question".to_string());
        assert!(conversation.first_exchange().is_none());

        conversation.push_message(Message::new(MessageRole::Assistant, "answer".to_string()));
        assert_eq!(conversation.first_exchange(), Some(("question", "answer")));
    }

    #[test]
    fn test_wants_title_guard() {
        let mut conversation = Conversation::new();
        assert!(conversation.wants_title());

        conversation.title_generated = true;
        assert!(!conversation.wants_title());

        let mut titled = Conversation::new();
        titled.title = Some("Budget review".to_string());
        assert!(!titled.wants_title());
    }

    #[test]
    fn test_display_title_falls_back_to_first_user_message() {
        let mut conversation = Conversation::new();
        assert_eq!(conversation.display_title(), "New conversation");

        conversation.push_user_message("How do I rotate API keys safely?".to_string());
        assert!(conversation.display_title().starts_with("How do I rotate"));
    }

    #[test]
    fn test_role_wire_names() {
        assert_eq!(
            serde_json::to_string(&MessageRole::Assistant).unwrap(),
            "\"assistant\""
        );
        assert_eq!(serde_json::to_string(&MessageRole::User).unwrap(), "\"user\"");
    }
}
