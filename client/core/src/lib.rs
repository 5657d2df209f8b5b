//! Parley Core - Streaming Chat Client
//!
//! This crate is the headless core of a conversational assistant client. It
//! consumes a token-streamed reply from a chat backend over a long-lived HTTP
//! response, renders it incrementally through an abstract presentation sink,
//! and degrades gracefully when the stream misbehaves: stalls, mid-answer
//! drops, and middleware rejections all resolve into a complete answer or a
//! displayable error, never a stuck or blank interface.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                        Surfaces (CLI, …)                      │
//! │        PresentationSink (render)   ConversationStore (persist)│
//! └───────────────┬──────────────────────────────┬───────────────┘
//!                 │                              │
//! ┌───────────────┼──────────────────────────────┼───────────────┐
//! │               │         ChatClient           │               │
//! │  ┌────────────┴───┐  ┌──────────────┐  ┌─────┴────────────┐  │
//! │  │ StreamSession  │  │   Recovery   │  │   Conversations  │  │
//! │  │  + DeltaBuffer │  │  Controller  │  │   (message log)  │  │
//! │  └────────┬───────┘  └──────┬───────┘  └──────────────────┘  │
//! │           │                 │                                 │
//! │  ┌────────┴─────────────────┴───────┐                        │
//! │  │      FrameParser ◄── ChatBackend │  (HTTP / scripted)     │
//! │  └──────────────────────────────────┘                        │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Key Types
//!
//! - [`ChatClient`]: owns conversations and drives sends, one task per send
//! - [`FrameParser`]: raw stream chunks to typed [`ProtocolEvent`]s
//! - [`StreamSession`]: the live state machine for one in-flight answer
//! - [`RecoveryController`]: watchdog + single-shot fallback substitution
//! - [`PresentationSink`]: abstract render target, rebind-or-fail semantics
//! - [`ChatBackend`]: transport seam (HTTP in production, scripted in tests)
//!
//! # Module Overview
//!
//! - [`protocol`]: wire framing and event classification
//! - [`delta`]: render-rate decoupling buffer
//! - [`session`]: per-answer state machine and finalize semantics
//! - [`recovery`]: watchdog, fallback, and failure phrasing
//! - [`backend`]: transport trait and HTTP implementation
//! - [`client`]: caller layer, serialized sends, finalize side effects
//! - [`conversation`]: conversations and messages
//! - [`sink`]: presentation sink abstraction
//! - [`config`]: tunables (watchdog, flush cadence, retry)
//! - [`diagnostics`]: injected observer and explicit diagnostics log
//! - [`store`] / [`title`]: persistence and auto-title collaborators
//!
//! # No UI Dependencies
//!
//! This crate has **zero** dependencies on any terminal or GUI toolkit. Any
//! rendering target that can append text implements [`PresentationSink`].

#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod backend;
pub mod client;
pub mod config;
pub mod conversation;
pub mod delta;
pub mod diagnostics;
pub mod protocol;
pub mod recovery;
pub mod session;
pub mod sink;
pub mod store;
pub mod title;

// Re-exports for convenience
pub use backend::{
    ChatBackend, ChatRequest, ChatTurn, HttpBackend, ResponseMode, SingleResponse, StreamHandle,
    StreamUpdate, TransportError,
};
pub use client::{
    CancelToken, ChatClient, SendError, SendHandle, SendOptions, SendOutcome,
};
pub use config::{
    default_config_path, load_config, load_config_from_path, ClientConfig, ConfigError, RetryPolicy,
};
pub use conversation::{Conversation, ConversationId, Message, MessageId, MessageRole};
pub use delta::DeltaBuffer;
pub use diagnostics::{
    DiagnosticEntry, DiagnosticsLog, FallbackTrigger, NoopObserver, StreamObserver,
};
pub use protocol::{FrameParser, ProtocolEvent, StatusPhase};
pub use recovery::RecoveryController;
pub use session::{
    FinalOutcome, FinalizedMessage, SessionPhase, StreamSession, INTERRUPTED_PLACEHOLDER,
};
pub use sink::{NullSinkHost, PresentationSink, SinkHost};
pub use store::{ConversationStore, NullStore};
pub use title::{clean_title, NullTitles, TitleGenerator};
