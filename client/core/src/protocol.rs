//! Wire Protocol Parsing
//!
//! Turns the raw chunked text of a streamed chat response into typed
//! [`ProtocolEvent`]s. The backend speaks a text-event-stream style framing:
//!
//! ```text
//! event: delta
//! data: {"text":"Hello"}
//!
//! ```
//!
//! Chunks may split frames anywhere, including mid-line. The parser keeps a
//! rolling buffer so feeding the same logical stream in any chunking yields
//! the same event sequence. Several wire variants are tolerated beyond the
//! canonical framing: a `[DONE]` sentinel payload, frames whose event name
//! lives in a JSON `type`/`event` field instead of an `event:` line, bare
//! newline-delimited JSON or plain text lines, and a JSON prefix immediately
//! followed by raw delta text with no separator.
//!
//! The parser has no knowledge of sessions or rendering; malformed input
//! degrades to best-effort delta text, never to an error.

use serde_json::Value;

/// Literal payload recognized as a terminal shortcut for a `done` event.
const DONE_SENTINEL: &str = "[DONE]";

// ============================================================================
// Protocol Events
// ============================================================================

/// Phase carried by a `status` frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StatusPhase {
    /// The backend is preparing an answer (planning, retrieval setup).
    Thinking,
    /// The backend is running tools (retrieval, export).
    Tool,
    /// Answer tokens are about to stream.
    Answer,
    /// The stream completed.
    Done,
    /// The backend reported a definitive failure.
    Error,
}

impl StatusPhase {
    /// Parse a phase string from the wire. Unknown phases return `None`.
    #[must_use]
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "thinking" => Some(Self::Thinking),
            "tool" => Some(Self::Tool),
            "answer" => Some(Self::Answer),
            "done" => Some(Self::Done),
            "error" => Some(Self::Error),
            _ => None,
        }
    }

    /// Whether this phase terminates the stream.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Error)
    }
}

/// A typed event parsed from the response stream.
#[derive(Clone, Debug, PartialEq)]
pub enum ProtocolEvent {
    /// An incremental fragment of answer text.
    Delta {
        /// The text fragment, in arrival order.
        text: String,
    },
    /// A phase change reported by the backend.
    Status {
        /// The reported phase.
        phase: StatusPhase,
        /// Optional human-readable detail (error text, progress label).
        message: Option<String>,
        /// Server-side id of the message, when the backend assigns one.
        message_id: Option<String>,
    },
    /// Retrieval sources attached to the answer.
    Sources {
        /// Opaque source descriptors, passed through to the caller.
        items: Vec<Value>,
    },
    /// A produced artifact (export, attachment).
    Artifact {
        /// Opaque artifact descriptor.
        item: Value,
    },
    /// A definitive failure reported by the backend. Terminal.
    Error {
        /// Server-provided error text.
        message: String,
    },
    /// The stream completed. Terminal.
    Done,
}

impl ProtocolEvent {
    /// Whether no further events follow this one on a well-formed stream.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        match self {
            Self::Done | Self::Error { .. } => true,
            Self::Status { phase, .. } => phase.is_terminal(),
            _ => false,
        }
    }
}

// ============================================================================
// Frame Parser
// ============================================================================

/// Incremental parser from raw stream chunks to [`ProtocolEvent`]s.
///
/// Feed chunks with [`FrameParser::push`] as they arrive; call
/// [`FrameParser::finish`] once at end of stream to flush any unterminated
/// trailing frame.
#[derive(Debug, Default)]
pub struct FrameParser {
    /// Unconsumed text carried across chunk boundaries.
    buffer: String,
    /// `event:` field of the frame currently being assembled.
    event_name: Option<String>,
    /// `data:` lines of the frame currently being assembled.
    data_lines: Vec<String>,
}

impl FrameParser {
    /// Create an empty parser.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a raw byte chunk. Invalid UTF-8 is replaced, never fatal.
    pub fn push_bytes(&mut self, bytes: &[u8]) -> Vec<ProtocolEvent> {
        self.push(&String::from_utf8_lossy(bytes))
    }

    /// Feed a text chunk, returning every event completed by it.
    pub fn push(&mut self, chunk: &str) -> Vec<ProtocolEvent> {
        self.buffer.push_str(chunk);

        let mut events = Vec::new();
        while let Some(pos) = self.buffer.find('\n') {
            let line = self.buffer[..pos].trim_end_matches('\r').to_string();
            self.buffer.drain(..=pos);
            if let Some(event) = self.take_line(&line) {
                events.push(event);
            }
        }
        events
    }

    /// Flush at end of stream: an unterminated trailing line and any frame
    /// still being assembled get one final emit attempt.
    pub fn finish(&mut self) -> Vec<ProtocolEvent> {
        let mut events = Vec::new();

        if !self.buffer.is_empty() {
            let line = std::mem::take(&mut self.buffer);
            let line = line.trim_end_matches('\r').to_string();
            if let Some(event) = self.take_line(&line) {
                events.push(event);
            }
        }
        if let Some(event) = self.emit_frame() {
            events.push(event);
        }
        events
    }

    /// Process one complete line. Returns an event when the line completes a
    /// frame.
    fn take_line(&mut self, line: &str) -> Option<ProtocolEvent> {
        if line.is_empty() {
            // Blank line terminates the frame.
            return self.emit_frame();
        }
        if let Some(rest) = line.strip_prefix("event:") {
            self.event_name = Some(rest.trim().to_string());
            return None;
        }
        if let Some(rest) = line.strip_prefix("data:") {
            self.data_lines
                .push(rest.strip_prefix(' ').unwrap_or(rest).to_string());
            return None;
        }
        if line.starts_with(':') {
            // Comment line.
            return None;
        }

        // Unprefixed, non-blank line. Inside an open frame it is treated as a
        // data continuation; otherwise it is a whole frame on its own, which
        // covers bare NDJSON and plain-text framings.
        if self.event_name.is_some() || !self.data_lines.is_empty() {
            self.data_lines.push(line.to_string());
            return None;
        }
        classify(None, line)
    }

    /// Emit the frame assembled so far, if it carried any data.
    fn emit_frame(&mut self) -> Option<ProtocolEvent> {
        let name = self.event_name.take();
        if self.data_lines.is_empty() {
            return None;
        }
        let payload = self.data_lines.join("\n");
        self.data_lines.clear();
        classify(name.as_deref(), &payload)
    }
}

// ============================================================================
// Frame Classification
// ============================================================================

/// Classify one complete frame payload into an event.
///
/// `name` is the framing-level event name, when one was given. Returns `None`
/// when the frame carries nothing renderable (e.g. a structured object under
/// an unknown event name).
fn classify(name: Option<&str>, payload: &str) -> Option<ProtocolEvent> {
    if payload.trim() == DONE_SENTINEL {
        return Some(ProtocolEvent::Done);
    }

    let (json, rest) = match split_leading_json(payload) {
        Some((value, rest)) => (Some(value), rest),
        None => (None, ""),
    };
    // Raw text appended directly after a JSON prefix is delta text. A
    // whitespace-only remainder is noise, not a delta.
    let trailing = if rest.trim().is_empty() { "" } else { rest };

    // The explicit event name wins; wire variants that omit it carry the name
    // in a `type`/`event` field of the payload instead. `message` is the
    // framing default, not a meaningful name.
    let effective = match name {
        Some(n) if !n.is_empty() && n != "message" => Some(n.to_string()),
        _ => json.as_ref().and_then(|v| {
            v.get("type")
                .and_then(Value::as_str)
                .or_else(|| v.get("event").and_then(Value::as_str))
                .map(str::to_string)
        }),
    };

    match effective.as_deref() {
        Some("delta") => {
            let text = delta_text(json.as_ref(), trailing, payload);
            if text.is_empty() {
                None
            } else {
                Some(ProtocolEvent::Delta { text })
            }
        }
        Some("status") => Some(status_event(json.as_ref(), payload)),
        Some("sources" | "citations") => Some(ProtocolEvent::Sources {
            items: source_items(json),
        }),
        Some("artifact") => Some(ProtocolEvent::Artifact {
            item: json.unwrap_or_else(|| Value::String(payload.to_string())),
        }),
        Some("error") => Some(ProtocolEvent::Error {
            message: error_text(json.as_ref(), payload),
        }),
        Some("done") => Some(ProtocolEvent::Done),
        _ => fallback_delta(json.as_ref(), trailing, payload),
    }
}

/// Resolve the text of a `delta` frame. Trailing raw text takes priority over
/// any JSON field.
fn delta_text(json: Option<&Value>, trailing: &str, payload: &str) -> String {
    if !trailing.is_empty() {
        return trailing.to_string();
    }
    match json {
        Some(value) => text_field(value).unwrap_or_default(),
        None => payload.to_string(),
    }
}

/// Build a `Status` event from a frame payload.
fn status_event(json: Option<&Value>, payload: &str) -> ProtocolEvent {
    let phase = json
        .and_then(|v| v.get("phase"))
        .and_then(Value::as_str)
        .and_then(StatusPhase::parse)
        .or_else(|| StatusPhase::parse(payload))
        // Unknown phases never kill a stream; treat them as answer progress.
        .unwrap_or(StatusPhase::Answer);
    let message = json
        .and_then(|v| v.get("message"))
        .and_then(Value::as_str)
        .map(str::to_string);
    let message_id = json
        .and_then(|v| v.get("message_id"))
        .and_then(Value::as_str)
        .map(str::to_string);

    ProtocolEvent::Status {
        phase,
        message,
        message_id,
    }
}

/// Extract source items from a `sources`/`citations` payload.
fn source_items(json: Option<Value>) -> Vec<Value> {
    match json {
        Some(Value::Array(items)) => items,
        Some(Value::Object(mut map)) => match map.remove("items") {
            Some(Value::Array(items)) => items,
            Some(other) => vec![other],
            None => vec![Value::Object(map)],
        },
        Some(other) => vec![other],
        None => Vec::new(),
    }
}

/// Extract the error message from an `error` payload.
fn error_text(json: Option<&Value>, payload: &str) -> String {
    json.and_then(|v| {
        v.get("message")
            .or_else(|| v.get("error"))
            .or_else(|| v.get("detail"))
            .and_then(Value::as_str)
            .map(str::to_string)
    })
    .unwrap_or_else(|| payload.to_string())
}

/// Best-effort fallback for unrecognized or missing event names: plain text
/// still renders as a delta; a structured object with no text is dropped.
fn fallback_delta(json: Option<&Value>, trailing: &str, payload: &str) -> Option<ProtocolEvent> {
    if !trailing.is_empty() {
        return Some(ProtocolEvent::Delta {
            text: trailing.to_string(),
        });
    }
    match json {
        Some(value) => {
            let text = text_field(value)?;
            if text.is_empty() {
                None
            } else {
                Some(ProtocolEvent::Delta { text })
            }
        }
        None => {
            if payload.is_empty() {
                None
            } else {
                Some(ProtocolEvent::Delta {
                    text: payload.to_string(),
                })
            }
        }
    }
}

/// The conventional text-bearing fields of a JSON event payload.
fn text_field(value: &Value) -> Option<String> {
    value
        .get("text")
        .or_else(|| value.get("delta"))
        .or_else(|| value.get("content"))
        .and_then(Value::as_str)
        .map(str::to_string)
}

/// Split a leading JSON value (object or array) off the front of a payload.
///
/// Balance-scans character by character, honoring string escapes, so that
/// raw text appended after the JSON with no separator survives as the
/// remainder. Returns `None` when the payload does not start with JSON or
/// the balanced prefix fails to parse.
fn split_leading_json(payload: &str) -> Option<(Value, &str)> {
    let trimmed = payload.trim_start();
    let first = trimmed.chars().next()?;
    if first != '{' && first != '[' {
        return None;
    }

    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (i, c) in trimmed.char_indices() {
        if in_string {
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                in_string = false;
            }
            continue;
        }
        match c {
            '"' => in_string = true,
            '{' | '[' => depth += 1,
            '}' | ']' => {
                depth = depth.saturating_sub(1);
                if depth == 0 {
                    let end = i + c.len_utf8();
                    let value: Value = serde_json::from_str(&trimmed[..end]).ok()?;
                    return Some((value, &trimmed[end..]));
                }
            }
            _ => {}
        }
    }
    None
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn parse_all(chunks: &[&str]) -> Vec<ProtocolEvent> {
        let mut parser = FrameParser::new();
        let mut events = Vec::new();
        for chunk in chunks {
            events.extend(parser.push(chunk));
        }
        events.extend(parser.finish());
        events
    }

    #[test]
    fn test_basic_delta_frame() {
        let events = parse_all(&["event: delta\ndata: {\"text\":\"Hello\"}\n\n"]);
        assert_eq!(
            events,
            vec![ProtocolEvent::Delta {
                text: "Hello".to_string()
            }]
        );
    }

    #[test]
    fn test_chunking_invariance() {
        let wire = "event: status\ndata: {\"phase\":\"thinking\"}\n\nevent: delta\ndata: {\"text\":\"Hi there\"}\n\nevent: status\ndata: {\"phase\":\"done\",\"message_id\":\"m-1\"}\n\n";

        let whole = parse_all(&[wire]);

        // The same stream split at every byte boundary yields the same events.
        let singles: Vec<String> = wire.chars().map(String::from).collect();
        let refs: Vec<&str> = singles.iter().map(String::as_str).collect();
        let split = parse_all(&refs);

        assert_eq!(whole, split);
        assert_eq!(whole.len(), 3);
        assert!(whole[2].is_terminal());
    }

    #[test]
    fn test_multi_data_lines_joined() {
        let events = parse_all(&["event: delta\ndata: line one\ndata: line two\n\n"]);
        assert_eq!(
            events,
            vec![ProtocolEvent::Delta {
                text: "line one\nline two".to_string()
            }]
        );
    }

    #[test]
    fn test_done_sentinel() {
        let events = parse_all(&["data: [DONE]\n\n"]);
        assert_eq!(events, vec![ProtocolEvent::Done]);
    }

    #[test]
    fn test_leading_json_with_trailing_text() {
        let events = parse_all(&["data: {\"type\":\"delta\"}Hello world\n\n"]);
        assert_eq!(
            events,
            vec![ProtocolEvent::Delta {
                text: "Hello world".to_string()
            }]
        );
    }

    #[test]
    fn test_trailing_text_beats_json_field() {
        let events = parse_all(&["data: {\"type\":\"delta\",\"text\":\"ignored\"}kept\n\n"]);
        assert_eq!(
            events,
            vec![ProtocolEvent::Delta {
                text: "kept".to_string()
            }]
        );
    }

    #[test]
    fn test_json_with_escaped_braces_in_string() {
        let events = parse_all(&["data: {\"type\":\"delta\",\"text\":\"a \\\"{\\\" b\"}\n\n"]);
        assert_eq!(
            events,
            vec![ProtocolEvent::Delta {
                text: "a \"{\" b".to_string()
            }]
        );
    }

    #[test]
    fn test_bare_ndjson_line() {
        let events = parse_all(&["{\"type\":\"delta\",\"text\":\"x\"}\n"]);
        assert_eq!(
            events,
            vec![ProtocolEvent::Delta {
                text: "x".to_string()
            }]
        );
    }

    #[test]
    fn test_bare_plain_text_line() {
        let events = parse_all(&["just some words\n"]);
        assert_eq!(
            events,
            vec![ProtocolEvent::Delta {
                text: "just some words".to_string()
            }]
        );
    }

    #[test]
    fn test_unknown_event_with_structured_object_dropped() {
        let events = parse_all(&["event: telemetry\ndata: {\"latency_ms\":12}\n\n"]);
        assert!(events.is_empty());
    }

    #[test]
    fn test_unknown_event_with_plain_text_renders() {
        let events = parse_all(&["event: note\ndata: still visible\n\n"]);
        assert_eq!(
            events,
            vec![ProtocolEvent::Delta {
                text: "still visible".to_string()
            }]
        );
    }

    #[test]
    fn test_frame_with_no_data_emits_nothing() {
        let events = parse_all(&["event: delta\n\n"]);
        assert!(events.is_empty());
    }

    #[test]
    fn test_crlf_lines() {
        let events = parse_all(&["event: delta\r\ndata: {\"text\":\"hi\"}\r\n\r\n"]);
        assert_eq!(
            events,
            vec![ProtocolEvent::Delta {
                text: "hi".to_string()
            }]
        );
    }

    #[test]
    fn test_status_phases() {
        let events = parse_all(&[
            "event: status\ndata: {\"phase\":\"thinking\",\"ts\":\"t\"}\n\n",
            "event: status\ndata: {\"phase\":\"error\",\"message\":\"boom\"}\n\n",
        ]);
        assert_eq!(events.len(), 2);
        assert_eq!(
            events[0],
            ProtocolEvent::Status {
                phase: StatusPhase::Thinking,
                message: None,
                message_id: None
            }
        );
        assert_eq!(
            events[1],
            ProtocolEvent::Status {
                phase: StatusPhase::Error,
                message: Some("boom".to_string()),
                message_id: None
            }
        );
        assert!(events[1].is_terminal());
    }

    #[test]
    fn test_unknown_status_phase_is_not_terminal() {
        let events = parse_all(&["event: status\ndata: {\"phase\":\"retrying\"}\n\n"]);
        assert_eq!(events.len(), 1);
        assert!(!events[0].is_terminal());
    }

    #[test]
    fn test_sources_and_artifact() {
        let events = parse_all(&[
            "event: sources\ndata: {\"items\":[{\"filename\":\"a.pdf\"}]}\n\n",
            "event: artifact\ndata: {\"filename\":\"out.docx\"}\n\n",
        ]);
        match &events[0] {
            ProtocolEvent::Sources { items } => {
                assert_eq!(items.len(), 1);
                assert_eq!(items[0]["filename"], "a.pdf");
            }
            other => panic!("expected sources, got {other:?}"),
        }
        match &events[1] {
            ProtocolEvent::Artifact { item } => assert_eq!(item["filename"], "out.docx"),
            other => panic!("expected artifact, got {other:?}"),
        }
    }

    #[test]
    fn test_citations_alias() {
        let events = parse_all(&["event: citations\ndata: {\"items\":[]}\n\n"]);
        assert!(matches!(events[0], ProtocolEvent::Sources { .. }));
    }

    #[test]
    fn test_error_event() {
        let events = parse_all(&["event: error\ndata: {\"message\":\"model unavailable\"}\n\n"]);
        assert_eq!(
            events,
            vec![ProtocolEvent::Error {
                message: "model unavailable".to_string()
            }]
        );
    }

    #[test]
    fn test_unterminated_trailing_frame_flushes_on_finish() {
        let mut parser = FrameParser::new();
        assert!(parser.push("event: delta\ndata: tail text").is_empty());
        let events = parser.finish();
        assert_eq!(
            events,
            vec![ProtocolEvent::Delta {
                text: "tail text".to_string()
            }]
        );
    }

    #[test]
    fn test_comment_lines_ignored() {
        let events = parse_all(&[": keep-alive\n\nevent: delta\ndata: ok\n\n"]);
        assert_eq!(
            events,
            vec![ProtocolEvent::Delta {
                text: "ok".to_string()
            }]
        );
    }

    #[test]
    fn test_invalid_utf8_is_lossy_not_fatal() {
        let mut parser = FrameParser::new();
        let mut bytes = b"data: ok".to_vec();
        bytes.push(0xFF);
        bytes.extend_from_slice(b"\n\n");
        let events = parser.push_bytes(&bytes);
        assert_eq!(events.len(), 1);
    }
}
