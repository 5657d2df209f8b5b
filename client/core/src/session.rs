//! Stream Session
//!
//! The live state for one in-flight answer, from the moment a send is issued
//! until the answer is finalized. The session exclusively owns the assistant
//! [`Message`] being written; at finalize the message moves out to the
//! conversation log and the session becomes inert. Every operation after a
//! finalize is a no-op, so a late event can never mutate a finished answer.
//!
//! State machine:
//!
//! ```text
//! Armed --first delta--> Streaming --terminal/cancel--> Finalized{ok|error|interrupted}
//!   \------------------- terminal/cancel -------------/
//! ```

use std::time::{Duration, Instant};

use serde_json::Value;

use crate::conversation::{ConversationId, Message, MessageId};
use crate::delta::DeltaBuffer;
use crate::protocol::StatusPhase;
use crate::sink::SinkHost;

/// Text shown when a stream is cancelled before any content arrived.
pub const INTERRUPTED_PLACEHOLDER: &str = "Generation interrupted.";

// ============================================================================
// Session State
// ============================================================================

/// How a session ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FinalOutcome {
    /// A complete answer was produced (streamed or spliced from fallback).
    Ok,
    /// The answer was replaced by a user-facing error.
    Error,
    /// The stream was cut short; partial content preserved.
    Interrupted,
}

/// Lifecycle phase of a stream session.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionPhase {
    /// Created; no answer content has arrived yet.
    Armed,
    /// At least one delta has been received.
    Streaming,
    /// Terminal; no further mutation is possible.
    Finalized(FinalOutcome),
}

/// A finalized answer, moving out of the session.
#[derive(Clone, Debug)]
pub struct FinalizedMessage {
    /// The finished message, ready for the conversation log.
    pub message: Message,
    /// How the session ended.
    pub outcome: FinalOutcome,
}

// ============================================================================
// Stream Session
// ============================================================================

/// Live state for one in-flight answer.
#[derive(Debug)]
pub struct StreamSession {
    /// Conversation this answer belongs to.
    conversation_id: ConversationId,
    /// ID of the live message, kept valid after the message moves out.
    message_id: MessageId,
    /// The live message. `None` after finalize (moved out).
    message: Option<Message>,
    /// Lifecycle phase.
    phase: SessionPhase,
    /// Pending-render accumulator.
    buffer: DeltaBuffer,
    /// Current "thinking" sub-status label, when shown.
    thinking_label: Option<String>,
    /// Sources received during the stream, attached at finalize.
    pending_sources: Vec<Value>,
    /// Artifacts received during the stream, attached at finalize.
    pending_artifacts: Vec<Value>,
    /// Server-side message id, when reported.
    server_message_id: Option<String>,
}

impl StreamSession {
    /// Arm a new session for a conversation.
    #[must_use]
    pub fn new(conversation_id: ConversationId, flush_interval: Duration) -> Self {
        let message = Message::streaming_assistant();
        Self {
            conversation_id,
            message_id: message.id,
            message: Some(message),
            phase: SessionPhase::Armed,
            buffer: DeltaBuffer::new(flush_interval),
            thinking_label: None,
            pending_sources: Vec::new(),
            pending_artifacts: Vec::new(),
            server_message_id: None,
        }
    }

    /// The conversation this session answers.
    #[must_use]
    pub fn conversation_id(&self) -> ConversationId {
        self.conversation_id
    }

    /// ID of the live message. Stable across the whole session.
    #[must_use]
    pub fn message_id(&self) -> MessageId {
        self.message_id
    }

    /// Current lifecycle phase.
    #[must_use]
    pub fn phase(&self) -> SessionPhase {
        self.phase
    }

    /// Whether the session has reached a terminal state.
    #[must_use]
    pub fn is_finalized(&self) -> bool {
        matches!(self.phase, SessionPhase::Finalized(_))
    }

    /// Whether the first content delta has been observed.
    #[must_use]
    pub fn has_first_chunk(&self) -> bool {
        !matches!(self.phase, SessionPhase::Armed)
    }

    /// Whether any answer text exists, flushed or still buffered.
    #[must_use]
    pub fn has_content(&self) -> bool {
        self.buffer.has_pending()
            || self.message.as_ref().is_some_and(Message::has_content)
    }

    // ------------------------------------------------------------------
    // Event application
    // ------------------------------------------------------------------

    /// Apply an answer-text delta.
    pub fn apply_delta(&mut self, text: &str, host: &mut dyn SinkHost) {
        if self.is_finalized() || text.is_empty() {
            return;
        }
        if matches!(self.phase, SessionPhase::Armed) {
            self.phase = SessionPhase::Streaming;
            self.thinking_label = None;
            // First real content replaces the thinking placeholder.
            if let Some(sink) = host.resolve(self.message_id()) {
                sink.clear_status();
            }
            tracing::debug!(
                conversation = %self.conversation_id,
                message = %self.message_id(),
                "First content chunk received"
            );
        }
        self.buffer.append(text);
    }

    /// Apply a non-terminal status update ("thinking", "tool", "answer").
    pub fn set_status(
        &mut self,
        phase: StatusPhase,
        message: Option<&str>,
        host: &mut dyn SinkHost,
    ) {
        if self.is_finalized() || phase.is_terminal() {
            return;
        }
        let label = match phase {
            StatusPhase::Thinking => Some(message.unwrap_or("Thinking…").to_string()),
            StatusPhase::Tool => Some(message.unwrap_or("Consulting documents…").to_string()),
            _ => None,
        };
        match label {
            Some(label) => {
                if let Some(sink) = host.resolve(self.message_id()) {
                    sink.set_status(&label);
                }
                self.thinking_label = Some(label);
            }
            None => {
                // Answer phase: the indicator comes down, tokens are next.
                if self.thinking_label.take().is_some() {
                    if let Some(sink) = host.resolve(self.message_id()) {
                        sink.clear_status();
                    }
                }
            }
        }
    }

    /// Current thinking/tool label, when one is shown.
    #[must_use]
    pub fn thinking_label(&self) -> Option<&str> {
        self.thinking_label.as_deref()
    }

    /// Record sources to attach at finalize.
    pub fn add_sources(&mut self, items: Vec<Value>) {
        if !self.is_finalized() {
            self.pending_sources.extend(items);
        }
    }

    /// Record an artifact to attach at finalize.
    pub fn add_artifact(&mut self, item: Value) {
        if !self.is_finalized() {
            self.pending_artifacts.push(item);
        }
    }

    /// Record the server-side message id when the backend reports one.
    pub fn note_server_message_id(&mut self, id: Option<String>) {
        if self.is_finalized() {
            return;
        }
        if let Some(id) = id {
            self.server_message_id = Some(id);
        }
    }

    // ------------------------------------------------------------------
    // Rendering
    // ------------------------------------------------------------------

    /// Whether a render flush is due now.
    #[must_use]
    pub fn flush_due(&self) -> bool {
        self.buffer.flush_due()
    }

    /// When the next flush becomes due, if text is pending.
    #[must_use]
    pub fn next_flush_at(&self) -> Option<Instant> {
        self.buffer.next_flush_at()
    }

    /// Synchronously drain buffered text into the message and the sink.
    /// Idempotent when nothing is pending.
    pub fn flush_now(&mut self, host: &mut dyn SinkHost) {
        let Some(text) = self.buffer.take() else {
            return;
        };
        if let Some(message) = self.message.as_mut() {
            message.content.push_str(&text);
        }
        if let Some(sink) = host.resolve(self.message_id()) {
            sink.append(&text);
        }
    }

    // ------------------------------------------------------------------
    // Finalization
    // ------------------------------------------------------------------

    /// Finalize as a successful answer. Forces a flush first. Returns `None`
    /// if the session was already finalized.
    pub fn finalize_ok(&mut self, host: &mut dyn SinkHost) -> Option<FinalizedMessage> {
        if self.is_finalized() {
            return None;
        }
        self.flush_now(host);
        if let Some(sink) = host.resolve(self.message_id()) {
            sink.clear_status();
        }
        self.detach(FinalOutcome::Ok)
    }

    /// Finalize as a failure: the error text replaces any partial answer,
    /// on the message and on screen. The error is authoritative.
    pub fn finalize_error(
        &mut self,
        user_text: &str,
        host: &mut dyn SinkHost,
    ) -> Option<FinalizedMessage> {
        if self.is_finalized() {
            return None;
        }
        // Drop whatever was buffered; the error replaces partial content.
        let _ = self.buffer.take();
        if let Some(message) = self.message.as_mut() {
            message.content = user_text.to_string();
        }
        if let Some(sink) = host.resolve(self.message_id()) {
            sink.clear_status();
            sink.replace_all(user_text);
        }
        self.detach(FinalOutcome::Error)
    }

    /// Finalize as interrupted: partial content is preserved and flagged; a
    /// session cancelled before any content shows a placeholder instead of
    /// an empty answer.
    pub fn finalize_interrupted(&mut self, host: &mut dyn SinkHost) -> Option<FinalizedMessage> {
        if self.is_finalized() {
            return None;
        }
        self.flush_now(host);
        if let Some(sink) = host.resolve(self.message_id()) {
            sink.clear_status();
        }
        let empty = !self.has_content();
        if let Some(message) = self.message.as_mut() {
            message.interrupted = true;
            if empty {
                message.content = INTERRUPTED_PLACEHOLDER.to_string();
            }
        }
        if empty {
            if let Some(sink) = host.resolve(self.message_id()) {
                sink.replace_all(INTERRUPTED_PLACEHOLDER);
            }
        }
        self.detach(FinalOutcome::Interrupted)
    }

    /// Splice a fallback answer into the session and finalize as ok. The
    /// reply replaces any placeholder or partial text wholesale, so the user
    /// sees one continuous answer with nothing duplicated.
    pub fn splice_fallback(
        &mut self,
        reply: &str,
        sources: Vec<Value>,
        artifacts: Vec<Value>,
        host: &mut dyn SinkHost,
    ) -> Option<FinalizedMessage> {
        if self.is_finalized() {
            return None;
        }
        let _ = self.buffer.take();
        if let Some(message) = self.message.as_mut() {
            message.content = reply.to_string();
        }
        self.pending_sources.extend(sources);
        self.pending_artifacts.extend(artifacts);
        if let Some(sink) = host.resolve(self.message_id()) {
            sink.clear_status();
            sink.replace_all(reply);
        }
        self.phase = SessionPhase::Streaming;
        self.detach(FinalOutcome::Ok)
    }

    /// Move the message out, attaching accumulated metadata.
    fn detach(&mut self, outcome: FinalOutcome) -> Option<FinalizedMessage> {
        let mut message = self.message.take()?;
        message.sources = std::mem::take(&mut self.pending_sources);
        message.artifacts = std::mem::take(&mut self.pending_artifacts);
        message.server_message_id = self.server_message_id.take();
        self.phase = SessionPhase::Finalized(outcome);
        tracing::debug!(
            conversation = %self.conversation_id,
            message = %message.id,
            outcome = ?outcome,
            chars = message.content.len(),
            "Session finalized"
        );
        Some(FinalizedMessage { message, outcome })
    }
}

// ============================================================================
// Tests
// ============================================================================
