//! Chat Client
//!
//! The caller layer that owns conversations and drives sends. Each send runs
//! as a single cooperative task: open the stream, feed parsed events into the
//! session, flush renders on a bounded cadence, and let the recovery
//! controller take over when the stream misbehaves. Exactly one send may be
//! in flight per conversation; a second send is rejected, not queued.
//!
//! Every send resolves inside the core: the externally visible outcomes are
//! only `ok`, `error`, and `interrupted`, each with displayable content.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::Notify;
use tokio::task::JoinHandle;

use crate::backend::traits::{ChatBackend, ChatRequest, ChatTurn, ResponseMode, StreamUpdate};
use crate::config::ClientConfig;
use crate::conversation::{Conversation, ConversationId, Message};
use crate::diagnostics::{FallbackTrigger, NoopObserver, StreamObserver};
use crate::protocol::{ProtocolEvent, StatusPhase};
use crate::recovery::RecoveryController;
use crate::session::{FinalOutcome, FinalizedMessage, StreamSession, INTERRUPTED_PLACEHOLDER};
use crate::sink::SinkHost;
use crate::store::{ConversationStore, NullStore};
use crate::title::{clean_title, NullTitles, TitleGenerator};

// ============================================================================
// Cancellation
// ============================================================================

/// Cancellation token for one send. Cancelling preserves partial content and
/// marks the message interrupted; it is the only way the user stops an
/// in-flight read.
#[derive(Clone, Debug, Default)]
pub struct CancelToken {
    inner: Arc<CancelInner>,
}

#[derive(Debug, Default)]
struct CancelInner {
    flag: AtomicBool,
    notify: Notify,
}

impl CancelToken {
    /// Create an uncancelled token.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation. Idempotent.
    pub fn cancel(&self) {
        self.inner.flag.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    /// Whether cancellation has been requested.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.inner.flag.load(Ordering::SeqCst)
    }

    /// Wait until cancellation is requested.
    pub async fn cancelled(&self) {
        loop {
            if self.is_cancelled() {
                return;
            }
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }
}

// ============================================================================
// Send API
// ============================================================================

/// Errors rejecting a send before anything is issued.
#[derive(Debug, thiserror::Error)]
pub enum SendError {
    /// A send is already in flight for this conversation.
    #[error("a send is already in flight for conversation {0}")]
    Busy(ConversationId),
    /// The conversation does not exist.
    #[error("unknown conversation {0}")]
    UnknownConversation(ConversationId),
}

/// Options for one send.
#[derive(Clone, Debug, Default)]
pub struct SendOptions {
    /// Requested answer style.
    pub mode: ResponseMode,
    /// Whether document-grounded retrieval is requested.
    pub use_documents: bool,
    /// Stable user id forwarded to the backend, when known.
    pub user_id: Option<String>,
}

/// The resolved result of one send.
#[derive(Clone, Debug)]
pub struct SendOutcome {
    /// Conversation the answer belongs to.
    pub conversation_id: ConversationId,
    /// The finalized assistant message.
    pub message: Message,
    /// How the session ended.
    pub outcome: FinalOutcome,
}

/// Handle on an in-flight send.
#[derive(Debug)]
pub struct SendHandle {
    cancel: CancelToken,
    task: JoinHandle<SendOutcome>,
}

impl SendHandle {
    /// Token that cancels this send.
    #[must_use]
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Request cancellation of this send.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Wait for the send to resolve.
    pub async fn join(self) -> anyhow::Result<SendOutcome> {
        self.task.await.map_err(Into::into)
    }
}

// ============================================================================
// Chat Client
// ============================================================================

/// The streaming chat client.
pub struct ChatClient<B: ChatBackend + 'static> {
    /// Network backend.
    backend: Arc<B>,
    /// Tuning knobs.
    config: ClientConfig,
    /// Conversations by id.
    conversations: Arc<DashMap<ConversationId, Conversation>>,
    /// Live sends by conversation (serialized sends invariant).
    live: Arc<DashMap<ConversationId, CancelToken>>,
    /// Persistence collaborator.
    store: Arc<dyn ConversationStore>,
    /// Auto-title collaborator.
    titles: Arc<dyn TitleGenerator>,
    /// Injected lifecycle observer.
    observer: Arc<dyn StreamObserver>,
}

impl<B: ChatBackend + 'static> ChatClient<B> {
    /// Create a client with no-op collaborators.
    #[must_use]
    pub fn new(backend: B, config: ClientConfig) -> Self {
        Self {
            backend: Arc::new(backend),
            config,
            conversations: Arc::new(DashMap::new()),
            live: Arc::new(DashMap::new()),
            store: Arc::new(NullStore),
            titles: Arc::new(NullTitles),
            observer: Arc::new(NoopObserver),
        }
    }

    /// Use a persistence collaborator.
    #[must_use]
    pub fn with_store(mut self, store: Arc<dyn ConversationStore>) -> Self {
        self.store = store;
        self
    }

    /// Use an auto-title collaborator.
    #[must_use]
    pub fn with_titles(mut self, titles: Arc<dyn TitleGenerator>) -> Self {
        self.titles = titles;
        self
    }

    /// Use a lifecycle observer.
    #[must_use]
    pub fn with_observer(mut self, observer: Arc<dyn StreamObserver>) -> Self {
        self.observer = observer;
        self
    }

    /// The backend in use.
    #[must_use]
    pub fn backend(&self) -> &Arc<B> {
        &self.backend
    }

    /// Create a new empty conversation.
    pub fn create_conversation(&self) -> ConversationId {
        let conversation = Conversation::new();
        let id = conversation.id;
        self.conversations.insert(id, conversation);
        id
    }

    /// Restore an existing conversation (e.g. loaded from the store).
    pub fn adopt_conversation(&self, conversation: Conversation) {
        self.conversations.insert(conversation.id, conversation);
    }

    /// Snapshot of one conversation.
    #[must_use]
    pub fn conversation(&self, id: ConversationId) -> Option<Conversation> {
        self.conversations.get(&id).map(|c| c.value().clone())
    }

    /// Conversations as `(id, title)`, most recently active first.
    #[must_use]
    pub fn list_conversations(&self) -> Vec<(ConversationId, String)> {
        let mut listing: Vec<_> = self
            .conversations
            .iter()
            .map(|entry| (entry.id, entry.display_title(), entry.updated_at))
            .collect();
        listing.sort_by(|a, b| b.2.cmp(&a.2));
        listing.into_iter().map(|(id, title, _)| (id, title)).collect()
    }

    /// Whether a send is in flight for this conversation.
    #[must_use]
    pub fn is_busy(&self, id: ConversationId) -> bool {
        self.live.contains_key(&id)
    }

    /// Cancel the in-flight send for a conversation, if any.
    pub fn cancel(&self, id: ConversationId) -> bool {
        match self.live.get(&id) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Issue a send: append the user message and start streaming the answer
    /// into `host`. Rejects with [`SendError::Busy`] while a send is live
    /// for the conversation.
    pub fn send(
        &self,
        conversation_id: ConversationId,
        text: impl Into<String>,
        options: SendOptions,
        host: Box<dyn SinkHost>,
    ) -> Result<SendHandle, SendError> {
        if !self.conversations.contains_key(&conversation_id) {
            return Err(SendError::UnknownConversation(conversation_id));
        }

        // Serialized sends: claim the conversation before touching anything.
        let cancel = CancelToken::new();
        match self.live.entry(conversation_id) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                return Err(SendError::Busy(conversation_id));
            }
            dashmap::mapref::entry::Entry::Vacant(vacant) => {
                vacant.insert(cancel.clone());
            }
        }

        let request = {
            let mut conversation = match self.conversations.get_mut(&conversation_id) {
                Some(conversation) => conversation,
                None => {
                    self.live.remove(&conversation_id);
                    return Err(SendError::UnknownConversation(conversation_id));
                }
            };
            conversation.push_user_message(text.into());

            let turns: Vec<ChatTurn> = conversation
                .messages
                .iter()
                .map(|m| ChatTurn::new(m.role, m.content.clone()))
                .collect();
            let mut request = ChatRequest::new(turns)
                .with_mode(options.mode)
                .with_documents(options.use_documents)
                .with_session_id(conversation.id.0.to_string());
            if let Some(ref title) = conversation.title {
                request = request.with_title(title.clone());
            }
            request.user_id = options.user_id.clone();
            request
        };

        let task = tokio::spawn(drive_send(
            Arc::clone(&self.backend),
            self.config.clone(),
            request,
            conversation_id,
            cancel.clone(),
            host,
            Arc::clone(&self.conversations),
            Arc::clone(&self.live),
            Arc::clone(&self.store),
            Arc::clone(&self.titles),
            Arc::clone(&self.observer),
        ));

        Ok(SendHandle { cancel, task })
    }
}

// ============================================================================
// Send Driver
// ============================================================================

/// Drive one send from request to finalize, then run the finalize side
/// effects. Never returns an error: every failure mode resolves into a
/// finalized outcome.
#[allow(clippy::too_many_arguments)]
async fn drive_send<B: ChatBackend + 'static>(
    backend: Arc<B>,
    config: ClientConfig,
    request: ChatRequest,
    conversation_id: ConversationId,
    cancel: CancelToken,
    mut host: Box<dyn SinkHost>,
    conversations: Arc<DashMap<ConversationId, Conversation>>,
    live: Arc<DashMap<ConversationId, CancelToken>>,
    store: Arc<dyn ConversationStore>,
    titles: Arc<dyn TitleGenerator>,
    observer: Arc<dyn StreamObserver>,
) -> SendOutcome {
    let mut session = StreamSession::new(conversation_id, config.flush_interval);
    let mut recovery = RecoveryController::new(config.watchdog);
    observer.on_send_started(conversation_id, session.message_id());

    let finalized = run_stream(
        backend.as_ref(),
        &request,
        &mut session,
        &mut recovery,
        &cancel,
        host.as_mut(),
        observer.as_ref(),
    )
    .await;

    // Every exit path above finalizes; degrade instead of panicking if one
    // ever does not.
    let finalized = finalized
        .or_else(|| session.finalize_interrupted(host.as_mut()))
        .unwrap_or_else(|| FinalizedMessage {
            message: Message::new(
                crate::conversation::MessageRole::Assistant,
                INTERRUPTED_PLACEHOLDER.to_string(),
            ),
            outcome: FinalOutcome::Interrupted,
        });

    let outcome = finalized.outcome;
    let message = finalized.message;

    // Ownership transfer: the finished message joins the conversation log,
    // which refreshes the listing.
    let snapshot = match conversations.get_mut(&conversation_id) {
        Some(mut conversation) => {
            conversation.push_message(message.clone());
            Some(conversation.value().clone())
        }
        None => None,
    };

    // Detach the live session; new sends are accepted again.
    live.remove(&conversation_id);
    observer.on_finalized(conversation_id, outcome);

    // Persist via the external collaborator, exactly once per session.
    if let Some(ref conversation) = snapshot {
        if let Err(error) = store.on_finalized(conversation, &message).await {
            tracing::warn!(
                conversation = %conversation_id,
                error = %error,
                "Persisting finalized message failed"
            );
        }
    }

    // Auto-title after the first successful exchange, off the send path.
    if outcome == FinalOutcome::Ok {
        tokio::spawn(generate_title(
            conversations,
            store,
            titles,
            conversation_id,
        ));
    }

    SendOutcome {
        conversation_id,
        message,
        outcome,
    }
}

/// Run the streaming read loop until the session finalizes.
async fn run_stream<B: ChatBackend + ?Sized>(
    backend: &B,
    request: &ChatRequest,
    session: &mut StreamSession,
    recovery: &mut RecoveryController,
    cancel: &CancelToken,
    host: &mut dyn SinkHost,
    observer: &dyn StreamObserver,
) -> Option<FinalizedMessage> {
    let conversation_id = session.conversation_id();

    // Open the stream. A cancel during connect abandons the request.
    let mut handle = tokio::select! {
        () = cancel.cancelled() => {
            return session.finalize_interrupted(host);
        }
        result = backend.send_streaming(request) => match result {
            Ok(handle) => handle,
            Err(error) => {
                tracing::warn!(
                    conversation = %conversation_id,
                    error = %error,
                    "Streaming request failed"
                );
                observer.on_fallback(conversation_id, FallbackTrigger::TransportFailure);
                return recovery
                    .run_fallback(backend, request, session, host, FallbackTrigger::TransportFailure)
                    .await;
            }
        }
    };

    let watchdog_deadline = tokio::time::Instant::from_std(recovery.watchdog_deadline());

    loop {
        let flush_at = session.next_flush_at();

        tokio::select! {
            () = cancel.cancelled() => {
                // User cancellation: stop the read, keep the partial answer.
                handle.abort();
                return session.finalize_interrupted(host);
            }
            () = tokio::time::sleep_until(watchdog_deadline), if !session.has_first_chunk() => {
                tracing::warn!(
                    conversation = %conversation_id,
                    "Watchdog fired before first content"
                );
                handle.abort();
                observer.on_fallback(conversation_id, FallbackTrigger::Watchdog);
                return recovery
                    .run_fallback(backend, request, session, host, FallbackTrigger::Watchdog)
                    .await;
            }
            () = flush_sleep(flush_at), if flush_at.is_some() => {
                session.flush_now(host);
            }
            update = handle.recv() => match update {
                Some(StreamUpdate::Event(event)) => {
                    observer.on_event(conversation_id, &event);
                    let finalized = apply_event(
                        event, backend, request, session, recovery, host, observer,
                    )
                    .await;
                    if finalized.is_some() {
                        return finalized;
                    }
                }
                Some(StreamUpdate::Failed(error)) => {
                    tracing::warn!(
                        conversation = %conversation_id,
                        error = %error,
                        "Transport failed mid-stream"
                    );
                    handle.abort();
                    observer.on_fallback(conversation_id, FallbackTrigger::TransportFailure);
                    return recovery
                        .run_fallback(backend, request, session, host, FallbackTrigger::TransportFailure)
                        .await;
                }
                None => {
                    // Read loop ended without a terminal event.
                    return recovery.finalize_dangling(session, host);
                }
            }
        }
    }
}

/// Apply one protocol event. Returns the finalized message when the event
/// was terminal for the session.
async fn apply_event<B: ChatBackend + ?Sized>(
    event: ProtocolEvent,
    backend: &B,
    request: &ChatRequest,
    session: &mut StreamSession,
    recovery: &mut RecoveryController,
    host: &mut dyn SinkHost,
    observer: &dyn StreamObserver,
) -> Option<FinalizedMessage> {
    match event {
        ProtocolEvent::Delta { text } => {
            session.apply_delta(&text, host);
            if session.flush_due() {
                session.flush_now(host);
            }
            None
        }
        ProtocolEvent::Status {
            phase,
            message,
            message_id,
        } => {
            session.note_server_message_id(message_id);
            match phase {
                StatusPhase::Done => {
                    complete_or_fallback(backend, request, session, recovery, host, observer).await
                }
                StatusPhase::Error => {
                    session.finalize_error(&server_error_text(message.as_deref()), host)
                }
                _ => {
                    session.set_status(phase, message.as_deref(), host);
                    None
                }
            }
        }
        ProtocolEvent::Sources { items } => {
            session.add_sources(items);
            None
        }
        ProtocolEvent::Artifact { item } => {
            session.add_artifact(item);
            None
        }
        ProtocolEvent::Error { message } => {
            // The server has reported definitive failure; no fallback.
            session.finalize_error(&server_error_text(Some(&message)), host)
        }
        ProtocolEvent::Done => {
            complete_or_fallback(backend, request, session, recovery, host, observer).await
        }
    }
}

/// Handle a terminal `done`: a stream that produced content finalizes `ok`;
/// an empty terminal stream is a recovery signal, not a success.
async fn complete_or_fallback<B: ChatBackend + ?Sized>(
    backend: &B,
    request: &ChatRequest,
    session: &mut StreamSession,
    recovery: &mut RecoveryController,
    host: &mut dyn SinkHost,
    observer: &dyn StreamObserver,
) -> Option<FinalizedMessage> {
    if session.has_content() {
        return session.finalize_ok(host);
    }
    observer.on_fallback(session.conversation_id(), FallbackTrigger::EmptyStream);
    recovery
        .run_fallback(backend, request, session, host, FallbackTrigger::EmptyStream)
        .await
}

/// User-facing text for a server-reported error.
fn server_error_text(message: Option<&str>) -> String {
    match message {
        Some(message) if !message.trim().is_empty() => {
            format!("The server reported an error: {}", message.trim())
        }
        _ => "The server reported an error.".to_string(),
    }
}

/// Sleep until a render flush is due; pending forever when nothing is.
async fn flush_sleep(at: Option<std::time::Instant>) {
    match at {
        Some(at) => tokio::time::sleep_until(tokio::time::Instant::from_std(at)).await,
        None => std::future::pending().await,
    }
}

/// Generate and record a conversation title, once per conversation.
async fn generate_title(
    conversations: Arc<DashMap<ConversationId, Conversation>>,
    store: Arc<dyn ConversationStore>,
    titles: Arc<dyn TitleGenerator>,
    conversation_id: ConversationId,
) {
    // Claim the guard flag before the async call so retries and re-renders
    // can never invoke the hook twice.
    let exchange = {
        let Some(mut conversation) = conversations.get_mut(&conversation_id) else {
            return;
        };
        if !conversation.wants_title() {
            return;
        }
        let Some((user, assistant)) = conversation
            .first_exchange()
            .map(|(u, a)| (u.to_string(), a.to_string()))
        else {
            return;
        };
        conversation.title_generated = true;
        (user, assistant)
    };

    match titles.generate(&exchange.0, &exchange.1).await {
        Ok(Some(raw)) => {
            let title = clean_title(&raw);
            if title.is_empty() {
                return;
            }
            if let Some(mut conversation) = conversations.get_mut(&conversation_id) {
                conversation.title = Some(title.clone());
            }
            if let Err(error) = store.on_title(conversation_id, &title).await {
                tracing::warn!(
                    conversation = %conversation_id,
                    error = %error,
                    "Persisting title failed"
                );
            }
        }
        Ok(None) => {}
        Err(error) => {
            tracing::warn!(
                conversation = %conversation_id,
                error = %error,
                "Title generation failed"
            );
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_cancel_token_wakes_waiters() {
        let token = CancelToken::new();
        let waiter = token.clone();
        let task = tokio::spawn(async move { waiter.cancelled().await });

        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        token.cancel();
        tokio::time::timeout(std::time::Duration::from_secs(1), task)
            .await
            .expect("waiter should wake")
            .unwrap();
        assert!(token.is_cancelled());
    }

    #[tokio::test]
    async fn test_cancel_before_wait_returns_immediately() {
        let token = CancelToken::new();
        token.cancel();
        tokio::time::timeout(std::time::Duration::from_millis(50), token.cancelled())
            .await
            .expect("already-cancelled token must not block");
    }

    #[test]
    fn test_server_error_text() {
        assert_eq!(
            server_error_text(Some("model overloaded")),
            "The server reported an error: model overloaded"
        );
        assert_eq!(server_error_text(None), "The server reported an error.");
        assert_eq!(server_error_text(Some("  ")), "The server reported an error.");
    }
}
