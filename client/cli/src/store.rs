//! JSON-file conversation store.
//!
//! Persists every conversation snapshot to one JSON document under the
//! platform data directory. Small and human-readable; the backend keeps its
//! own authoritative history server-side.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;
use parley_core::{Conversation, ConversationId, ConversationStore, Message};

/// Default store location: `<data dir>/parley/conversations.json`.
pub fn default_store_path() -> Option<PathBuf> {
    dirs::data_dir().map(|d| d.join("parley").join("conversations.json"))
}

/// Store that writes conversation snapshots to a JSON file.
pub struct JsonFileStore {
    path: PathBuf,
    conversations: Mutex<HashMap<ConversationId, Conversation>>,
}

impl JsonFileStore {
    /// Open (or create) a store at `path`, loading any existing snapshots.
    pub fn open(path: &Path) -> anyhow::Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conversations = if path.exists() {
            let raw = std::fs::read_to_string(path)?;
            let loaded: Vec<Conversation> = serde_json::from_str(&raw).unwrap_or_default();
            loaded.into_iter().map(|c| (c.id, c)).collect()
        } else {
            HashMap::new()
        };
        Ok(Self {
            path: path.to_path_buf(),
            conversations: Mutex::new(conversations),
        })
    }

    /// All stored conversations, most recently updated first.
    pub fn load_all(&self) -> Vec<Conversation> {
        let mut all: Vec<Conversation> = self
            .conversations
            .lock()
            .expect("store mutex poisoned")
            .values()
            .cloned()
            .collect();
        all.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        all
    }

    async fn save(&self) -> anyhow::Result<()> {
        let serialized = {
            let conversations = self.conversations.lock().expect("store mutex poisoned");
            let mut all: Vec<&Conversation> = conversations.values().collect();
            all.sort_by(|a, b| a.created_at.cmp(&b.created_at));
            serde_json::to_string_pretty(&all)?
        };
        tokio::fs::write(&self.path, serialized).await?;
        Ok(())
    }
}

#[async_trait]
impl ConversationStore for JsonFileStore {
    async fn on_finalized(
        &self,
        conversation: &Conversation,
        _message: &Message,
    ) -> anyhow::Result<()> {
        self.conversations
            .lock()
            .expect("store mutex poisoned")
            .insert(conversation.id, conversation.clone());
        self.save().await
    }

    async fn on_title(&self, conversation: ConversationId, title: &str) -> anyhow::Result<()> {
        {
            let mut conversations = self.conversations.lock().expect("store mutex poisoned");
            if let Some(stored) = conversations.get_mut(&conversation) {
                stored.title = Some(title.to_string());
                stored.title_generated = true;
            }
        }
        self.save().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parley_core::MessageRole;

    #[tokio::test]
    async fn test_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("conversations.json");

        let store = JsonFileStore::open(&path).unwrap();
        let mut conversation = Conversation::new();
        conversation.push_user_message("hello".to_string());
        let reply = Message::new(MessageRole::Assistant, "hi".to_string());
        store.on_finalized(&conversation, &reply).await.unwrap();

        let reopened = JsonFileStore::open(&path).unwrap();
        let all = reopened.load_all();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].id, conversation.id);
        assert_eq!(all[0].messages.len(), 1);
    }

    #[tokio::test]
    async fn test_title_update_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("conversations.json");

        let store = JsonFileStore::open(&path).unwrap();
        let conversation = Conversation::new();
        let id = conversation.id;
        let reply = Message::new(MessageRole::Assistant, "hi".to_string());
        store.on_finalized(&conversation, &reply).await.unwrap();
        store.on_title(id, "Key rotation").await.unwrap();

        let reopened = JsonFileStore::open(&path).unwrap();
        let all = reopened.load_all();
        assert_eq!(all[0].title.as_deref(), Some("Key rotation"));
    }
}
