//! Conversation Persistence Collaborator
//!
//! The core does not persist anything itself; it notifies a
//! [`ConversationStore`] exactly once per finalized session, and once per
//! generated title. The shell decides where conversations live (JSON file,
//! database, nothing at all).

use async_trait::async_trait;

use crate::conversation::{Conversation, ConversationId, Message};

/// External persistence for finished messages and titles.
#[async_trait]
pub trait ConversationStore: Send + Sync {
    /// Called exactly once per session with the final message state and a
    /// snapshot of the owning conversation.
    async fn on_finalized(
        &self,
        conversation: &Conversation,
        message: &Message,
    ) -> anyhow::Result<()>;

    /// Called when the auto-title hook produced a title.
    async fn on_title(&self, conversation: ConversationId, title: &str) -> anyhow::Result<()>;
}

/// Store that persists nothing.
#[derive(Debug, Default)]
pub struct NullStore;

#[async_trait]
impl ConversationStore for NullStore {
    async fn on_finalized(
        &self,
        _conversation: &Conversation,
        _message: &Message,
    ) -> anyhow::Result<()> {
        Ok(())
    }

    async fn on_title(&self, _conversation: ConversationId, _title: &str) -> anyhow::Result<()> {
        Ok(())
    }
}
