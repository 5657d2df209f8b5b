//! HTTP Backend Implementation
//!
//! Talks to the chat service over HTTP:
//! - `POST {base}/chat/stream`: streamed answer, `text/event-stream` framing
//! - `POST {base}/chat`: single-shot answer (the fallback path)
//! - `GET  {base}/`: cheap reachability probe (the service root lists its
//!   routes)
//!
//! The backend holds an ordered list of candidate base URLs. When the active
//! endpoint stops answering, [`HttpBackend::resolve_endpoint`] probes the
//! candidates and remembers the first reachable one for subsequent sends.
//!
//! Transient connection failures are retried with jittered backoff before an
//! error is reported; the retry budget is deliberately small because the
//! recovery controller has its own, stronger fallback.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use serde_json::json;
use tokio::sync::mpsc;

use super::traits::{
    ChatBackend, ChatRequest, SingleResponse, StreamHandle, StreamUpdate, TransportError,
};
use crate::config::{ClientConfig, RetryPolicy};
use crate::protocol::FrameParser;

/// Base URL used when nothing is configured.
const DEFAULT_BASE_URL: &str = "http://127.0.0.1:8000";

/// HTTP chat backend.
#[derive(Debug)]
pub struct HttpBackend {
    /// Candidate base URLs, primary first.
    candidates: Vec<String>,
    /// Index of the endpoint currently in use.
    active: AtomicUsize,
    /// Shared HTTP client.
    http: reqwest::Client,
    /// Retry policy for transient failures.
    retry: RetryPolicy,
    /// Overall timeout for non-streaming requests.
    request_timeout: Duration,
    /// Timeout for the reachability probe.
    probe_timeout: Duration,
}

impl HttpBackend {
    /// Create a backend for a single base URL with default tuning.
    #[must_use]
    pub fn new(base_url: impl Into<String>) -> Self {
        let config = ClientConfig {
            backend_url: Some(base_url.into()),
            ..ClientConfig::default()
        };
        Self::from_config(&config)
    }

    /// Create a backend from client configuration.
    ///
    /// # Panics
    ///
    /// Panics if the HTTP client cannot be constructed, which only happens
    /// with a broken TLS environment.
    #[must_use]
    pub fn from_config(config: &ClientConfig) -> Self {
        let primary = config
            .backend_url
            .clone()
            .unwrap_or_else(|| DEFAULT_BASE_URL.to_string());
        let mut candidates = vec![primary.trim_end_matches('/').to_string()];
        for url in &config.backend_fallback_urls {
            let url = url.trim_end_matches('/').to_string();
            if !candidates.contains(&url) {
                candidates.push(url);
            }
        }

        // No overall timeout on the client itself: the streaming response
        // stays open for the whole answer. Non-streaming calls set their own.
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()
            .expect("Failed to create HTTP client");

        Self {
            candidates,
            active: AtomicUsize::new(0),
            http,
            retry: config.retry.clone(),
            request_timeout: config.request_timeout,
            probe_timeout: config.probe_timeout,
        }
    }

    /// The base URL currently in use.
    #[must_use]
    pub fn base_url(&self) -> String {
        let index = self.active.load(Ordering::Relaxed).min(self.candidates.len() - 1);
        self.candidates[index].clone()
    }

    /// Streaming endpoint URL.
    fn chat_stream_url(&self) -> String {
        format!("{}/chat/stream", self.base_url())
    }

    /// Single-shot endpoint URL.
    fn chat_url(&self) -> String {
        format!("{}/chat", self.base_url())
    }

    /// Probe a specific base URL.
    async fn probe_url(&self, base: &str) -> bool {
        self.http
            .get(format!("{base}/"))
            .timeout(self.probe_timeout)
            .send()
            .await
            .is_ok_and(|r| r.status().is_success())
    }

    /// Build the wire payload shared by both endpoints.
    fn payload(request: &ChatRequest) -> serde_json::Value {
        let mut body = json!({
            "messages": request.messages,
            "response_mode": request.mode.as_str(),
            "use_downloads": request.use_documents,
        });
        if let Some(ref session_id) = request.session_id {
            body["session_id"] = json!(session_id);
        }
        if let Some(ref title) = request.title {
            body["title"] = json!(title);
        }
        if let Some(ref user_id) = request.user_id {
            body["user_id"] = json!(user_id);
        }
        body
    }

    /// POST with retry for transient failures. Returns the successful
    /// response or the last error.
    async fn post_with_retry(
        &self,
        url: &str,
        body: &serde_json::Value,
        timeout: Option<Duration>,
    ) -> Result<reqwest::Response, TransportError> {
        let mut attempt = 0u32;
        loop {
            let mut builder = self.http.post(url).json(body);
            if let Some(timeout) = timeout {
                builder = builder.timeout(timeout);
            }
            let error = match builder.send().await {
                Ok(response) if response.status().is_success() => return Ok(response),
                Ok(response) => TransportError::Status {
                    status: response.status().as_u16(),
                },
                Err(e) => TransportError::Connect(e.to_string()),
            };

            if attempt >= self.retry.max_retries || !error.is_transient() {
                return Err(error);
            }
            let backoff = self.retry.backoff_for_attempt(attempt);
            tracing::debug!(
                url = %url,
                attempt = attempt,
                backoff_ms = backoff.as_millis() as u64,
                error = %error,
                "Transient request failure, retrying"
            );
            tokio::time::sleep(backoff).await;
            attempt += 1;
        }
    }
}

impl Default for HttpBackend {
    fn default() -> Self {
        Self::new(DEFAULT_BASE_URL)
    }
}

#[async_trait]
impl ChatBackend for HttpBackend {
    fn name(&self) -> &str {
        "http"
    }

    async fn probe(&self) -> bool {
        self.probe_url(&self.base_url()).await
    }

    async fn resolve_endpoint(&self) -> bool {
        // Keep the active endpoint while it answers; otherwise try the other
        // candidates in order and remember the first reachable one.
        if self.probe_url(&self.base_url()).await {
            return true;
        }
        for (index, candidate) in self.candidates.iter().enumerate() {
            if index == self.active.load(Ordering::Relaxed) {
                continue;
            }
            if self.probe_url(candidate).await {
                tracing::info!(endpoint = %candidate, "Switched to reachable endpoint");
                self.active.store(index, Ordering::Relaxed);
                return true;
            }
        }
        false
    }

    async fn send_streaming(&self, request: &ChatRequest) -> Result<StreamHandle, TransportError> {
        let url = self.chat_stream_url();
        let body = Self::payload(request);

        let response = self.post_with_retry(&url, &body, None).await?;
        let mut stream = response.bytes_stream();

        let (tx, rx) = mpsc::channel(64);
        let task = tokio::spawn(async move {
            let mut parser = FrameParser::new();

            while let Some(chunk) = stream.next().await {
                match chunk {
                    Ok(bytes) => {
                        for event in parser.push_bytes(&bytes) {
                            let terminal = event.is_terminal();
                            if tx.send(StreamUpdate::Event(event)).await.is_err() {
                                // Receiver gone; stop reading.
                                return;
                            }
                            if terminal {
                                // Nothing after a terminal event is processed.
                                return;
                            }
                        }
                    }
                    Err(e) => {
                        let _ = tx
                            .send(StreamUpdate::Failed(TransportError::Stream(e.to_string())))
                            .await;
                        return;
                    }
                }
            }

            // End of stream with unterminated buffered data: one final emit.
            for event in parser.finish() {
                let terminal = event.is_terminal();
                if tx.send(StreamUpdate::Event(event)).await.is_err() {
                    return;
                }
                if terminal {
                    return;
                }
            }
            // Channel closes on drop; the driver sees end-of-stream.
        });

        Ok(StreamHandle::new(rx, task))
    }

    async fn send_once(&self, request: &ChatRequest) -> Result<SingleResponse, TransportError> {
        let url = self.chat_url();
        let body = Self::payload(request);

        let response = self
            .post_with_retry(&url, &body, Some(self.request_timeout))
            .await?;
        response
            .json::<SingleResponse>()
            .await
            .map_err(|e| TransportError::Stream(format!("invalid response body: {e}")))
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::traits::{ChatTurn, ResponseMode};
    use crate::conversation::MessageRole;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_urls_from_base() {
        let backend = HttpBackend::new("http://example.com:8000/");
        assert_eq!(backend.base_url(), "http://example.com:8000");
        assert_eq!(
            backend.chat_stream_url(),
            "http://example.com:8000/chat/stream"
        );
        assert_eq!(backend.chat_url(), "http://example.com:8000/chat");
    }

    #[test]
    fn test_candidates_deduplicated() {
        let config = ClientConfig {
            backend_url: Some("http://a:8000".to_string()),
            backend_fallback_urls: vec![
                "http://a:8000/".to_string(),
                "http://b:8000".to_string(),
            ],
            ..ClientConfig::default()
        };
        let backend = HttpBackend::from_config(&config);
        assert_eq!(backend.candidates, vec!["http://a:8000", "http://b:8000"]);
    }

    #[test]
    fn test_payload_shape() {
        let request = ChatRequest::new(vec![
            ChatTurn::new(MessageRole::User, "hello"),
            ChatTurn::new(MessageRole::Assistant, "hi"),
        ])
        .with_mode(ResponseMode::Technical)
        .with_documents(true)
        .with_session_id("s-1");

        let body = HttpBackend::payload(&request);
        assert_eq!(body["response_mode"], "tecnico");
        assert_eq!(body["use_downloads"], true);
        assert_eq!(body["session_id"], "s-1");
        assert_eq!(body["messages"][0]["role"], "user");
        assert_eq!(body["messages"][0]["content"], "hello");
        assert_eq!(body["messages"][1]["role"], "assistant");
        // Absent options are omitted, not null.
        assert!(body.get("title").is_none());
        assert!(body.get("user_id").is_none());
    }

    #[test]
    fn test_default_base_url() {
        let backend = HttpBackend::default();
        assert_eq!(backend.base_url(), DEFAULT_BASE_URL);
    }
}
