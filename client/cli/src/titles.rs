//! Auto-title generation via the chat backend.
//!
//! One low-temperature single-shot call per conversation, kept off the send
//! path. Failures are silently tolerated; an untitled conversation falls
//! back to its first user message in listings.

use std::sync::Arc;

use async_trait::async_trait;
use parley_core::{ChatBackend, ChatRequest, ChatTurn, MessageRole, TitleGenerator};

/// Longest slice of the assistant reply included in the title prompt.
const ASSISTANT_EXCERPT_CHARS: usize = 700;

/// Title generator backed by the chat service's single-shot endpoint.
pub struct BackendTitles<B: ChatBackend> {
    backend: Arc<B>,
}

impl<B: ChatBackend> BackendTitles<B> {
    /// Create a generator sharing the client's backend.
    pub fn new(backend: Arc<B>) -> Self {
        Self { backend }
    }
}

#[async_trait]
impl<B: ChatBackend> TitleGenerator for BackendTitles<B> {
    async fn generate(
        &self,
        first_user: &str,
        first_assistant: &str,
    ) -> anyhow::Result<Option<String>> {
        if first_user.trim().is_empty() {
            return Ok(None);
        }
        let excerpt: String = first_assistant.chars().take(ASSISTANT_EXCERPT_CHARS).collect();
        let prompt = format!(
            "Write a short title (3-6 words) for this conversation.\n\
             Rules:\n\
             - No quotes.\n\
             - No trailing period.\n\
             - Natural capitalization.\n\n\
             User message:\n{first_user}\n\n\
             Assistant reply (excerpt):\n{excerpt}\n"
        );

        let request = ChatRequest::new(vec![
            ChatTurn::new(
                MessageRole::System,
                "You write short, good titles for conversations.",
            ),
            ChatTurn::new(MessageRole::User, prompt),
        ]);

        let response = self.backend.send_once(&request).await?;
        let reply = response.reply.trim().to_string();
        Ok(if reply.is_empty() { None } else { Some(reply) })
    }
}
