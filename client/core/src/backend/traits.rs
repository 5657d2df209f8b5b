//! Chat Backend Traits
//!
//! Trait definitions for the chat backend. The streaming core drives any
//! implementation of [`ChatBackend`]: the production HTTP transport, or a
//! scripted backend in tests. Implementations handle wire details; the core
//! handles sessions, rendering, and recovery.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::conversation::MessageRole;
use crate::protocol::ProtocolEvent;

// ============================================================================
// Requests
// ============================================================================

/// Answer style requested from the backend.
///
/// Wire names are those of the original service; unknown values are passed
/// through server-side normalization, so parsing is lenient.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ResponseMode {
    /// Clear and direct.
    #[default]
    Normal,
    /// Precise and detailed.
    Technical,
    /// Short, decision-oriented summary.
    Brief,
    /// Step-by-step, with examples.
    Didactic,
    /// Decisions and next steps first.
    Strategic,
}

impl ResponseMode {
    /// The wire name sent to the backend.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Normal => "normal",
            Self::Technical => "tecnico",
            Self::Brief => "resumido",
            Self::Didactic => "didatico",
            Self::Strategic => "estrategico",
        }
    }

    /// Parse a mode from user input or wire name.
    #[must_use]
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "normal" => Some(Self::Normal),
            "tecnico" | "technical" => Some(Self::Technical),
            "resumido" | "brief" => Some(Self::Brief),
            "didatico" | "didactic" => Some(Self::Didactic),
            "estrategico" | "strategic" => Some(Self::Strategic),
            _ => None,
        }
    }
}

impl std::fmt::Display for ResponseMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One turn of conversation history, as sent on the wire.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ChatTurn {
    /// Who authored the turn.
    pub role: MessageRole,
    /// Turn text.
    pub content: String,
}

impl ChatTurn {
    /// Create a turn.
    #[must_use]
    pub fn new(role: MessageRole, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }
}

/// A chat request: the full conversation context plus options. The same
/// payload shape feeds both the streaming endpoint and the single-shot
/// fallback, which is what lets recovery re-issue a send transparently.
#[derive(Clone, Debug, Default)]
pub struct ChatRequest {
    /// Conversation history, oldest first.
    pub messages: Vec<ChatTurn>,
    /// Requested answer style.
    pub mode: ResponseMode,
    /// Whether document-grounded retrieval is requested.
    pub use_documents: bool,
    /// Server-side conversation id for persistence, when known.
    pub session_id: Option<String>,
    /// Conversation title, when known.
    pub title: Option<String>,
    /// Stable user id for preference memory, when known.
    pub user_id: Option<String>,
}

impl ChatRequest {
    /// Create a request from conversation history.
    #[must_use]
    pub fn new(messages: Vec<ChatTurn>) -> Self {
        Self {
            messages,
            ..Default::default()
        }
    }

    /// Set the response mode.
    #[must_use]
    pub fn with_mode(mut self, mode: ResponseMode) -> Self {
        self.mode = mode;
        self
    }

    /// Request document-grounded retrieval.
    #[must_use]
    pub fn with_documents(mut self, use_documents: bool) -> Self {
        self.use_documents = use_documents;
        self
    }

    /// Set the server-side session id.
    #[must_use]
    pub fn with_session_id(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    /// Set the conversation title.
    #[must_use]
    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }
}

// ============================================================================
// Responses
// ============================================================================

/// Errors from the transport layer.
///
/// These are recoverable by design: the recovery controller turns them into
/// a fallback attempt, and only surfaces text to the user if that fails too.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// The request never reached the server.
    #[error("could not reach the server: {0}")]
    Connect(String),
    /// The server answered with a non-success status.
    #[error("server returned HTTP {status}")]
    Status {
        /// HTTP status code.
        status: u16,
    },
    /// The response stream broke mid-read.
    #[error("response stream failed: {0}")]
    Stream(String),
}

impl TransportError {
    /// Whether a retry with backoff is worthwhile.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Connect(_) | Self::Stream(_) => true,
            Self::Status { status } => matches!(status, 429 | 500 | 502 | 503 | 504),
        }
    }
}

/// One update delivered from an in-flight stream read.
#[derive(Debug)]
pub enum StreamUpdate {
    /// A parsed protocol event.
    Event(ProtocolEvent),
    /// The transport broke; no further events follow.
    Failed(TransportError),
}

/// Handle on an in-flight streaming response.
///
/// Receiving returns updates in arrival order; the channel closing without a
/// terminal event means the stream ended early. Dropping or aborting the
/// handle stops the underlying network read.
#[derive(Debug)]
pub struct StreamHandle {
    /// Update receiver fed by the reader task.
    rx: mpsc::Receiver<StreamUpdate>,
    /// The reader task, aborted on drop.
    task: JoinHandle<()>,
}

impl StreamHandle {
    /// Wrap a receiver and its reader task.
    #[must_use]
    pub fn new(rx: mpsc::Receiver<StreamUpdate>, task: JoinHandle<()>) -> Self {
        Self { rx, task }
    }

    /// Receive the next update, or `None` at end of stream.
    pub async fn recv(&mut self) -> Option<StreamUpdate> {
        self.rx.recv().await
    }

    /// Abort the underlying network read.
    pub fn abort(&self) {
        self.task.abort();
    }
}

impl Drop for StreamHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// A complete single-shot response (the fallback path).
#[derive(Clone, Debug, Default, Deserialize)]
pub struct SingleResponse {
    /// The full answer text.
    pub reply: String,
    /// Retrieval sources, when any.
    #[serde(default)]
    pub sources: Vec<Value>,
    /// Artifacts, when any.
    #[serde(default)]
    pub artifacts: Vec<Value>,
}

// ============================================================================
// Backend Trait
// ============================================================================

/// A chat backend the streaming core can drive.
#[async_trait]
pub trait ChatBackend: Send + Sync {
    /// Backend name for logs.
    fn name(&self) -> &str;

    /// Cheap reachability check. Used for error phrasing and endpoint
    /// re-resolution, never for correctness.
    async fn probe(&self) -> bool;

    /// Try to find a reachable endpoint when the active one has gone away,
    /// remembering it for subsequent sends. Returns whether any endpoint
    /// answers. The default has no alternates and just probes again.
    async fn resolve_endpoint(&self) -> bool {
        self.probe().await
    }

    /// Open a streaming exchange for the given request.
    async fn send_streaming(&self, request: &ChatRequest) -> Result<StreamHandle, TransportError>;

    /// Issue the same request as a single non-streaming exchange.
    async fn send_once(&self, request: &ChatRequest) -> Result<SingleResponse, TransportError>;
}
