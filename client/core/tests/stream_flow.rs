//! End-to-end driver tests against a scripted backend.
//!
//! These exercise the full send path: session arming, event application,
//! watchdog, fallback substitution, cancellation, and finalize side effects.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use parley_core::{
    ChatBackend, ChatClient, ChatRequest, ClientConfig, ConversationStore, FinalOutcome, Message,
    PresentationSink, ProtocolEvent, RetryPolicy, SendError, SendOptions, SingleResponse,
    SinkHost, StatusPhase, StreamHandle, StreamUpdate, TitleGenerator, TransportError,
};

// ============================================================================
// Scripted backend
// ============================================================================

/// One scripted streaming exchange.
enum Script {
    /// Connect succeeds; steps play out in order, then the stream ends.
    Stream(Vec<Step>),
    /// The streaming request itself fails.
    ConnectError,
    /// Connect succeeds but nothing ever arrives.
    Stall,
}

enum Step {
    Event(ProtocolEvent),
    Fail(String),
    Delay(Duration),
}

struct MockBackend {
    scripts: Mutex<VecDeque<Script>>,
    fallback: Option<SingleResponse>,
    reachable: bool,
    stream_calls: AtomicUsize,
    once_calls: AtomicUsize,
}

impl MockBackend {
    fn new(scripts: Vec<Script>) -> Self {
        Self {
            scripts: Mutex::new(scripts.into_iter().collect()),
            fallback: None,
            reachable: true,
            stream_calls: AtomicUsize::new(0),
            once_calls: AtomicUsize::new(0),
        }
    }

    fn with_fallback(mut self, reply: &str) -> Self {
        self.fallback = Some(SingleResponse {
            reply: reply.to_string(),
            sources: Vec::new(),
            artifacts: Vec::new(),
        });
        self
    }

    fn unreachable(mut self) -> Self {
        self.reachable = false;
        self
    }
}

#[async_trait]
impl ChatBackend for MockBackend {
    fn name(&self) -> &str {
        "mock"
    }

    async fn probe(&self) -> bool {
        self.reachable
    }

    async fn send_streaming(&self, _request: &ChatRequest) -> Result<StreamHandle, TransportError> {
        self.stream_calls.fetch_add(1, Ordering::SeqCst);
        let script = self
            .scripts
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Script::Stall);

        match script {
            Script::ConnectError => Err(TransportError::Connect("connection refused".into())),
            Script::Stall => {
                let (_tx, rx) = tokio::sync::mpsc::channel(8);
                let task = tokio::spawn(async move {
                    // Hold the sender open so the stream never ends on its own.
                    let _tx = _tx;
                    tokio::time::sleep(Duration::from_secs(60)).await;
                });
                Ok(StreamHandle::new(rx, task))
            }
            Script::Stream(steps) => {
                let (tx, rx) = tokio::sync::mpsc::channel(8);
                let task = tokio::spawn(async move {
                    for step in steps {
                        match step {
                            Step::Event(event) => {
                                if tx.send(StreamUpdate::Event(event)).await.is_err() {
                                    return;
                                }
                            }
                            Step::Fail(reason) => {
                                let _ = tx
                                    .send(StreamUpdate::Failed(TransportError::Stream(reason)))
                                    .await;
                                return;
                            }
                            Step::Delay(duration) => tokio::time::sleep(duration).await,
                        }
                    }
                });
                Ok(StreamHandle::new(rx, task))
            }
        }
    }

    async fn send_once(&self, _request: &ChatRequest) -> Result<SingleResponse, TransportError> {
        self.once_calls.fetch_add(1, Ordering::SeqCst);
        self.fallback
            .clone()
            .ok_or(TransportError::Status { status: 500 })
    }
}

// ============================================================================
// Shared sink
// ============================================================================

#[derive(Debug, Default)]
struct SinkState {
    text: String,
    status: Option<String>,
    replacements: usize,
}

struct ArcSink {
    state: Arc<Mutex<SinkState>>,
}

impl PresentationSink for ArcSink {
    fn append(&mut self, text: &str) {
        self.state.lock().unwrap().text.push_str(text);
    }

    fn replace_all(&mut self, text: &str) {
        let mut state = self.state.lock().unwrap();
        state.text = text.to_string();
        state.replacements += 1;
    }

    fn set_status(&mut self, label: &str) {
        self.state.lock().unwrap().status = Some(label.to_string());
    }

    fn clear_status(&mut self) {
        self.state.lock().unwrap().status = None;
    }
}

struct ArcHost {
    sink: ArcSink,
}

impl SinkHost for ArcHost {
    fn resolve(&mut self, _message_id: parley_core::MessageId) -> Option<&mut dyn PresentationSink> {
        Some(&mut self.sink)
    }
}

fn shared_host() -> (Box<dyn SinkHost>, Arc<Mutex<SinkState>>) {
    let state = Arc::new(Mutex::new(SinkState::default()));
    let host = ArcHost {
        sink: ArcSink {
            state: Arc::clone(&state),
        },
    };
    (Box::new(host), state)
}

// ============================================================================
// Counting collaborators
// ============================================================================

#[derive(Default)]
struct CountingStore {
    finalized: AtomicUsize,
    titles: Mutex<Vec<String>>,
}

#[async_trait]
impl ConversationStore for CountingStore {
    async fn on_finalized(
        &self,
        _conversation: &parley_core::Conversation,
        _message: &Message,
    ) -> anyhow::Result<()> {
        self.finalized.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn on_title(
        &self,
        _conversation: parley_core::ConversationId,
        title: &str,
    ) -> anyhow::Result<()> {
        self.titles.lock().unwrap().push(title.to_string());
        Ok(())
    }
}

#[derive(Default)]
struct CountingTitles {
    calls: AtomicUsize,
}

#[async_trait]
impl TitleGenerator for CountingTitles {
    async fn generate(
        &self,
        _first_user: &str,
        _first_assistant: &str,
    ) -> anyhow::Result<Option<String>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(Some("  \"A  generated\ntitle\" ".to_string()))
    }
}

// ============================================================================
// Helpers
// ============================================================================

fn test_config() -> ClientConfig {
    ClientConfig {
        watchdog: Duration::from_millis(120),
        flush_interval: Duration::ZERO,
        retry: RetryPolicy {
            max_retries: 0,
            initial_backoff_ms: 1,
            backoff_multiplier: 1.0,
            use_jitter: false,
        },
        ..ClientConfig::default()
    }
}

fn delta(text: &str) -> Step {
    Step::Event(ProtocolEvent::Delta {
        text: text.to_string(),
    })
}

fn status(phase: StatusPhase) -> Step {
    Step::Event(ProtocolEvent::Status {
        phase,
        message: None,
        message_id: None,
    })
}

// ============================================================================
// Tests
// ============================================================================

#[tokio::test]
async fn streamed_answer_finalizes_ok() {
    let backend = MockBackend::new(vec![Script::Stream(vec![
        status(StatusPhase::Thinking),
        delta("Hello "),
        delta("world"),
        Step::Event(ProtocolEvent::Sources {
            items: vec![serde_json::json!({"filename": "a.pdf"})],
        }),
        Step::Event(ProtocolEvent::Status {
            phase: StatusPhase::Done,
            message: None,
            message_id: Some("srv-9".to_string()),
        }),
    ])]);
    let store = Arc::new(CountingStore::default());
    let client = ChatClient::new(backend, test_config()).with_store(Arc::clone(&store) as _);

    let conversation_id = client.create_conversation();
    let (host, sink) = shared_host();
    let outcome = client
        .send(conversation_id, "hi", SendOptions::default(), host)
        .unwrap()
        .join()
        .await
        .unwrap();

    assert_eq!(outcome.outcome, FinalOutcome::Ok);
    assert_eq!(outcome.message.content, "Hello world");
    assert_eq!(outcome.message.sources.len(), 1);
    assert_eq!(outcome.message.server_message_id.as_deref(), Some("srv-9"));
    assert!(!outcome.message.interrupted);
    assert_eq!(sink.lock().unwrap().text, "Hello world");
    assert!(sink.lock().unwrap().status.is_none());

    // Ownership transferred to the conversation log; persisted exactly once.
    let conversation = client.conversation(conversation_id).unwrap();
    assert_eq!(conversation.messages.len(), 2);
    assert_eq!(conversation.messages[1].content, "Hello world");
    assert_eq!(store.finalized.load(Ordering::SeqCst), 1);
    assert!(!client.is_busy(conversation_id));
}

#[tokio::test]
async fn empty_done_triggers_fallback() {
    let backend = MockBackend::new(vec![Script::Stream(vec![
        status(StatusPhase::Thinking),
        status(StatusPhase::Done),
    ])])
    .with_fallback("X");
    let client = ChatClient::new(backend, test_config());

    let conversation_id = client.create_conversation();
    let (host, sink) = shared_host();
    let outcome = client
        .send(conversation_id, "hi", SendOptions::default(), host)
        .unwrap()
        .join()
        .await
        .unwrap();

    assert_eq!(outcome.outcome, FinalOutcome::Ok);
    assert_eq!(outcome.message.content, "X");
    assert_eq!(sink.lock().unwrap().text, "X");
    assert_eq!(client.backend().once_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn done_sentinel_terminates_like_done_status() {
    let backend = MockBackend::new(vec![Script::Stream(vec![
        delta("answer"),
        Step::Event(ProtocolEvent::Done),
    ])]);
    let client = ChatClient::new(backend, test_config());

    let conversation_id = client.create_conversation();
    let (host, _sink) = shared_host();
    let outcome = client
        .send(conversation_id, "hi", SendOptions::default(), host)
        .unwrap()
        .join()
        .await
        .unwrap();

    assert_eq!(outcome.outcome, FinalOutcome::Ok);
    assert_eq!(outcome.message.content, "answer");
    assert_eq!(client.backend().once_calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn watchdog_fires_and_fallback_splices() {
    let backend = MockBackend::new(vec![Script::Stall]).with_fallback("recovered");
    let client = ChatClient::new(backend, test_config());

    let conversation_id = client.create_conversation();
    let (host, sink) = shared_host();
    let started = std::time::Instant::now();
    let outcome = client
        .send(conversation_id, "hi", SendOptions::default(), host)
        .unwrap()
        .join()
        .await
        .unwrap();

    assert_eq!(outcome.outcome, FinalOutcome::Ok);
    assert_eq!(outcome.message.content, "recovered");
    assert_eq!(sink.lock().unwrap().text, "recovered");
    // Fired on the watchdog, not on some longer timeout.
    assert!(started.elapsed() < Duration::from_secs(5));
    assert_eq!(client.backend().stream_calls.load(Ordering::SeqCst), 1);
    assert_eq!(client.backend().once_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn transport_failure_mid_stream_falls_back() {
    let backend = MockBackend::new(vec![Script::Stream(vec![
        delta("par"),
        Step::Fail("connection reset".to_string()),
    ])])
    .with_fallback("full answer");
    let client = ChatClient::new(backend, test_config());

    let conversation_id = client.create_conversation();
    let (host, sink) = shared_host();
    let outcome = client
        .send(conversation_id, "hi", SendOptions::default(), host)
        .unwrap()
        .join()
        .await
        .unwrap();

    assert_eq!(outcome.outcome, FinalOutcome::Ok);
    // The spliced answer replaces the partial text, with no duplication.
    assert_eq!(outcome.message.content, "full answer");
    assert_eq!(sink.lock().unwrap().text, "full answer");
}

#[tokio::test]
async fn connect_error_falls_back() {
    let backend = MockBackend::new(vec![Script::ConnectError]).with_fallback("still here");
    let client = ChatClient::new(backend, test_config());

    let conversation_id = client.create_conversation();
    let (host, _sink) = shared_host();
    let outcome = client
        .send(conversation_id, "hi", SendOptions::default(), host)
        .unwrap()
        .join()
        .await
        .unwrap();

    assert_eq!(outcome.outcome, FinalOutcome::Ok);
    assert_eq!(outcome.message.content, "still here");
}

#[tokio::test]
async fn protocol_error_is_authoritative_no_fallback() {
    let backend = MockBackend::new(vec![Script::Stream(vec![
        delta("partial"),
        Step::Event(ProtocolEvent::Error {
            message: "model unavailable".to_string(),
        }),
    ])])
    .with_fallback("should never be used");
    let client = ChatClient::new(backend, test_config());

    let conversation_id = client.create_conversation();
    let (host, sink) = shared_host();
    let outcome = client
        .send(conversation_id, "hi", SendOptions::default(), host)
        .unwrap()
        .join()
        .await
        .unwrap();

    assert_eq!(outcome.outcome, FinalOutcome::Error);
    assert!(outcome.message.content.contains("model unavailable"));
    // Partial content was discarded; the error is authoritative.
    assert!(!outcome.message.content.contains("partial"));
    assert_eq!(sink.lock().unwrap().text, outcome.message.content);
    assert_eq!(client.backend().once_calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn cancellation_preserves_partial_text() {
    let backend = MockBackend::new(vec![Script::Stream(vec![
        delta("Hello"),
        Step::Delay(Duration::from_secs(60)),
    ])]);
    let client = ChatClient::new(backend, test_config());

    let conversation_id = client.create_conversation();
    let (host, _sink) = shared_host();
    let handle = client
        .send(conversation_id, "hi", SendOptions::default(), host)
        .unwrap();

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(client.cancel(conversation_id));
    let outcome = handle.join().await.unwrap();

    assert_eq!(outcome.outcome, FinalOutcome::Interrupted);
    assert_eq!(outcome.message.content, "Hello");
    assert!(outcome.message.interrupted);
    // Cancellation never triggers the fallback path.
    assert_eq!(client.backend().once_calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn cancellation_before_content_shows_placeholder() {
    let backend = MockBackend::new(vec![Script::Stall]);
    let client = ChatClient::new(backend, test_config());

    let conversation_id = client.create_conversation();
    let (host, _sink) = shared_host();
    let handle = client
        .send(conversation_id, "hi", SendOptions::default(), host)
        .unwrap();

    tokio::time::sleep(Duration::from_millis(30)).await;
    handle.cancel();
    let outcome = handle.join().await.unwrap();

    assert_eq!(outcome.outcome, FinalOutcome::Interrupted);
    assert_eq!(outcome.message.content, parley_core::INTERRUPTED_PLACEHOLDER);
}

#[tokio::test]
async fn second_send_rejected_while_live() {
    let backend = MockBackend::new(vec![Script::Stall]);
    let client = ChatClient::new(backend, test_config());

    let conversation_id = client.create_conversation();
    let (host, _sink) = shared_host();
    let handle = client
        .send(conversation_id, "first", SendOptions::default(), host)
        .unwrap();

    let (second_host, _) = shared_host();
    let rejected = client.send(conversation_id, "second", SendOptions::default(), second_host);
    assert!(matches!(rejected, Err(SendError::Busy(id)) if id == conversation_id));

    handle.cancel();
    let _ = handle.join().await;
    assert!(!client.is_busy(conversation_id));
}

#[tokio::test]
async fn failed_fallback_reports_unreachable_server() {
    let backend = MockBackend::new(vec![Script::ConnectError]).unreachable();
    let client = ChatClient::new(backend, test_config());

    let conversation_id = client.create_conversation();
    let (host, sink) = shared_host();
    let outcome = client
        .send(conversation_id, "hi", SendOptions::default(), host)
        .unwrap()
        .join()
        .await
        .unwrap();

    assert_eq!(outcome.outcome, FinalOutcome::Error);
    assert!(outcome.message.content.contains("unreachable"));
    // The answer area is never left blank.
    assert!(!sink.lock().unwrap().text.is_empty());
}

#[tokio::test]
async fn stream_ending_without_terminal_keeps_partial_as_interrupted() {
    let backend = MockBackend::new(vec![Script::Stream(vec![delta("partial answer")])]);
    let client = ChatClient::new(backend, test_config());

    let conversation_id = client.create_conversation();
    let (host, _sink) = shared_host();
    let outcome = client
        .send(conversation_id, "hi", SendOptions::default(), host)
        .unwrap()
        .join()
        .await
        .unwrap();

    assert_eq!(outcome.outcome, FinalOutcome::Interrupted);
    assert_eq!(outcome.message.content, "partial answer");
    assert!(outcome.message.interrupted);
}

#[tokio::test]
async fn auto_title_runs_once_per_conversation() {
    let backend = MockBackend::new(vec![
        Script::Stream(vec![delta("first answer"), status(StatusPhase::Done)]),
        Script::Stream(vec![delta("second answer"), status(StatusPhase::Done)]),
    ]);
    let store = Arc::new(CountingStore::default());
    let titles = Arc::new(CountingTitles::default());
    let client = ChatClient::new(backend, test_config())
        .with_store(Arc::clone(&store) as _)
        .with_titles(Arc::clone(&titles) as _);

    let conversation_id = client.create_conversation();

    let (host, _sink) = shared_host();
    client
        .send(conversation_id, "one", SendOptions::default(), host)
        .unwrap()
        .join()
        .await
        .unwrap();

    // The hook runs off the send path.
    tokio::time::sleep(Duration::from_millis(100)).await;
    let conversation = client.conversation(conversation_id).unwrap();
    assert_eq!(conversation.title.as_deref(), Some("A generated title"));
    assert_eq!(titles.calls.load(Ordering::SeqCst), 1);
    assert_eq!(store.titles.lock().unwrap().len(), 1);

    let (host, _sink) = shared_host();
    client
        .send(conversation_id, "two", SendOptions::default(), host)
        .unwrap()
        .join()
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(titles.calls.load(Ordering::SeqCst), 1);
}
