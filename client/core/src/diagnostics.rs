//! Diagnostics and Observation
//!
//! The core never reaches into ambient globals for debugging. It reports
//! through an injected [`StreamObserver`]; the application shell decides what
//! to do with the reports. [`DiagnosticsLog`] is the stock observer: an
//! explicit, bounded, process-wide event log with defined initialization and
//! clearing operations, owned by the shell.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use crate::conversation::{ConversationId, MessageId};
use crate::protocol::ProtocolEvent;
use crate::session::FinalOutcome;

/// Why a fallback was attempted.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FallbackTrigger {
    /// No content arrived before the watchdog fired.
    Watchdog,
    /// The transport failed outside of user cancellation.
    TransportFailure,
    /// The stream terminated without ever producing content.
    EmptyStream,
}

impl std::fmt::Display for FallbackTrigger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Watchdog => "watchdog",
            Self::TransportFailure => "transport-failure",
            Self::EmptyStream => "empty-stream",
        };
        f.write_str(s)
    }
}

/// Observer of streaming lifecycle events. All methods default to no-ops so
/// implementations pick what they care about.
pub trait StreamObserver: Send + Sync {
    /// A send was issued and its session armed.
    fn on_send_started(&self, _conversation: ConversationId, _message: MessageId) {}

    /// A protocol event arrived, before it is applied.
    fn on_event(&self, _conversation: ConversationId, _event: &ProtocolEvent) {}

    /// A fallback attempt was triggered.
    fn on_fallback(&self, _conversation: ConversationId, _trigger: FallbackTrigger) {}

    /// A session finalized.
    fn on_finalized(&self, _conversation: ConversationId, _outcome: FinalOutcome) {}
}

/// Observer that ignores everything.
#[derive(Debug, Default)]
pub struct NoopObserver;

impl StreamObserver for NoopObserver {}

// ============================================================================
// Diagnostics Log
// ============================================================================

/// One recorded diagnostic event.
#[derive(Clone, Debug)]
pub struct DiagnosticEntry {
    /// When the event was recorded.
    pub at: DateTime<Utc>,
    /// Conversation the event belongs to, when applicable.
    pub conversation: Option<ConversationId>,
    /// Human-readable description.
    pub detail: String,
}

/// Bounded in-memory diagnostic event log.
///
/// Oldest entries are evicted once the capacity is reached. Thread-safe;
/// share it between the shell and the client via `Arc`.
#[derive(Debug)]
pub struct DiagnosticsLog {
    /// Recorded entries, oldest first.
    entries: Mutex<VecDeque<DiagnosticEntry>>,
    /// Maximum retained entries.
    capacity: usize,
}

impl DiagnosticsLog {
    /// Create a log retaining at most `capacity` entries.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: Mutex::new(VecDeque::with_capacity(capacity.min(256))),
            capacity: capacity.max(1),
        }
    }

    /// Record one event.
    pub fn record(&self, conversation: Option<ConversationId>, detail: impl Into<String>) {
        let mut entries = self.entries.lock();
        if entries.len() >= self.capacity {
            entries.pop_front();
        }
        entries.push_back(DiagnosticEntry {
            at: Utc::now(),
            conversation,
            detail: detail.into(),
        });
    }

    /// A copy of all retained entries, oldest first.
    #[must_use]
    pub fn snapshot(&self) -> Vec<DiagnosticEntry> {
        self.entries.lock().iter().cloned().collect()
    }

    /// Drop all retained entries.
    pub fn clear(&self) {
        self.entries.lock().clear();
    }

    /// Number of retained entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Whether the log is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

impl Default for DiagnosticsLog {
    fn default() -> Self {
        Self::new(256)
    }
}

impl StreamObserver for DiagnosticsLog {
    fn on_send_started(&self, conversation: ConversationId, message: MessageId) {
        self.record(Some(conversation), format!("send started (message {message})"));
    }

    fn on_event(&self, conversation: ConversationId, event: &ProtocolEvent) {
        // Deltas are too chatty to log one by one.
        if !matches!(event, ProtocolEvent::Delta { .. }) {
            self.record(Some(conversation), format!("event: {event:?}"));
        }
    }

    fn on_fallback(&self, conversation: ConversationId, trigger: FallbackTrigger) {
        self.record(Some(conversation), format!("fallback triggered: {trigger}"));
    }

    fn on_finalized(&self, conversation: ConversationId, outcome: FinalOutcome) {
        self.record(Some(conversation), format!("finalized: {outcome:?}"));
    }
}
