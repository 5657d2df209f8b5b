//! Recovery Controller
//!
//! Guarantees the user is never left staring at a stalled or blank answer.
//! Two triggers engage recovery: the watchdog (no content within the arming
//! window) and a transport failure that is not a user cancellation. An empty
//! terminal stream takes the same path. Recovery re-issues the full
//! conversation context as a single-shot request and splices the result into
//! the still-armed session, so the user sees one continuous answer.
//!
//! Recovery runs at most once per session: the first trigger sets
//! `fallback_engaged`, which suppresses the other trigger and the normal
//! "stream ended without a terminal event" cleanup.

use std::time::{Duration, Instant};

use crate::backend::traits::{ChatBackend, ChatRequest, TransportError};
use crate::diagnostics::FallbackTrigger;
use crate::session::{FinalizedMessage, StreamSession};
use crate::sink::SinkHost;

/// Error text when the fallback failed and the server did not answer a probe.
const UNREACHABLE_TEXT: &str =
    "The server is unreachable. Check that the backend is running, then try again.";

/// Per-send recovery state.
#[derive(Debug)]
pub struct RecoveryController {
    /// Time allowed from arming to first content.
    watchdog: Duration,
    /// When the session was armed.
    armed_at: Instant,
    /// Set once either trigger fires; suppresses the other path.
    fallback_engaged: bool,
}

impl RecoveryController {
    /// Arm the controller for a new session.
    #[must_use]
    pub fn new(watchdog: Duration) -> Self {
        Self {
            watchdog,
            armed_at: Instant::now(),
            fallback_engaged: false,
        }
    }

    /// Instant at which the watchdog fires if no content has arrived.
    #[must_use]
    pub fn watchdog_deadline(&self) -> Instant {
        self.armed_at + self.watchdog
    }

    /// Whether a fallback has already been attempted for this session.
    #[must_use]
    pub fn fallback_engaged(&self) -> bool {
        self.fallback_engaged
    }

    /// Abandon the broken stream and substitute a single-shot answer.
    ///
    /// On success the reply is spliced into the session and finalized `ok`;
    /// on failure the session finalizes `error` with text that distinguishes
    /// a bad request from an unreachable server. Runs at most once; a second
    /// invocation is a no-op returning `None`.
    pub async fn run_fallback<B: ChatBackend + ?Sized>(
        &mut self,
        backend: &B,
        request: &ChatRequest,
        session: &mut StreamSession,
        host: &mut dyn SinkHost,
        trigger: FallbackTrigger,
    ) -> Option<FinalizedMessage> {
        if self.fallback_engaged || session.is_finalized() {
            return None;
        }
        self.fallback_engaged = true;

        tracing::info!(
            conversation = %session.conversation_id(),
            trigger = %trigger,
            "Stream abandoned, attempting single-shot fallback"
        );

        // If the active endpoint went away, another known-good candidate may
        // still answer; remember whichever one does for subsequent sends.
        if !backend.probe().await {
            let _ = backend.resolve_endpoint().await;
        }

        match backend.send_once(request).await {
            Ok(response) => session.splice_fallback(
                &response.reply,
                response.sources,
                response.artifacts,
                host,
            ),
            Err(error) => {
                let reachable = backend.probe().await;
                tracing::warn!(
                    conversation = %session.conversation_id(),
                    error = %error,
                    reachable = reachable,
                    "Fallback request failed"
                );
                session.finalize_error(&fallback_failure_text(&error, reachable), host)
            }
        }
    }

    /// Cleanup when the read loop ends without a terminal event and recovery
    /// never acted: partial content finalizes `interrupted`, an empty stream
    /// finalizes `error`.
    pub fn finalize_dangling(
        &self,
        session: &mut StreamSession,
        host: &mut dyn SinkHost,
    ) -> Option<FinalizedMessage> {
        if self.fallback_engaged || session.is_finalized() {
            return None;
        }
        if session.has_content() {
            tracing::warn!(
                conversation = %session.conversation_id(),
                "Stream ended without terminal event; keeping partial answer"
            );
            session.finalize_interrupted(host)
        } else {
            session.finalize_error(
                "The stream ended before any answer arrived. Please try again.",
                host,
            )
        }
    }
}

/// User-facing text for a failed fallback, phrased by reachability.
#[must_use]
pub fn fallback_failure_text(error: &TransportError, reachable: bool) -> String {
    if !reachable {
        return UNREACHABLE_TEXT.to_string();
    }
    match error {
        TransportError::Status { status } => {
            format!("The server responded with HTTP {status}. Please try again.")
        }
        other => format!("The request failed ({other}), but the server appears to be up. Please try again."),
    }
}

// ============================================================================
// Tests
// ============================================================================
