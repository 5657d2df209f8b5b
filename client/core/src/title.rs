//! Auto-Title Collaborator
//!
//! After a conversation's first successful exchange, the client asks a
//! [`TitleGenerator`] for a short human title, once per conversation. The
//! shell supplies the implementation (typically one low-temperature model
//! call); the core only cleans and caps whatever comes back.

use async_trait::async_trait;

/// Maximum title length in characters before capping.
const MAX_TITLE_CHARS: usize = 64;

/// Generates a short conversation title from the first exchange.
#[async_trait]
pub trait TitleGenerator: Send + Sync {
    /// Produce a raw title, or `None` to leave the conversation untitled.
    async fn generate(
        &self,
        first_user: &str,
        first_assistant: &str,
    ) -> anyhow::Result<Option<String>>;
}

/// Generator that never titles anything.
#[derive(Debug, Default)]
pub struct NullTitles;

#[async_trait]
impl TitleGenerator for NullTitles {
    async fn generate(
        &self,
        _first_user: &str,
        _first_assistant: &str,
    ) -> anyhow::Result<Option<String>> {
        Ok(None)
    }
}

/// Normalize a generated title: newlines become spaces, runs of whitespace
/// collapse, surrounding quotes are stripped, and long titles are capped
/// with an ellipsis.
#[must_use]
pub fn clean_title(raw: &str) -> String {
    let flattened = raw.replace("\r\n", " ").replace('\n', " ");
    let collapsed = flattened.split_whitespace().collect::<Vec<_>>().join(" ");
    let trimmed = collapsed
        .trim_matches(|c: char| c.is_whitespace() || matches!(c, '"' | '\'' | '“' | '”' | '‘' | '’'))
        .to_string();

    if trimmed.chars().count() > MAX_TITLE_CHARS {
        let capped: String = trimmed.chars().take(MAX_TITLE_CHARS - 1).collect();
        format!("{}…", capped.trim_end())
    } else {
        trimmed
    }
}
