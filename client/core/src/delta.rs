//! Delta Buffering
//!
//! Accumulates answer-text deltas between renders so that event arrival rate
//! is decoupled from render rate. Dozens of deltas inside one flush interval
//! collapse into a single drain, in arrival order, with nothing dropped.
//!
//! The buffer is deliberately passive: it never renders by itself. The send
//! driver asks [`DeltaBuffer::flush_due`] on its schedule and drains with
//! [`DeltaBuffer::take`]; finalization always drains synchronously first.

use std::time::{Duration, Instant};

/// Accumulator for pending answer text.
#[derive(Debug)]
pub struct DeltaBuffer {
    /// Text appended since the last drain.
    pending: String,
    /// Minimum time between drains.
    flush_interval: Duration,
    /// When the buffer was last drained. `None` until the first drain, which
    /// is always allowed immediately.
    last_flush: Option<Instant>,
}

impl DeltaBuffer {
    /// Create a buffer that allows at most one drain per `flush_interval`.
    #[must_use]
    pub fn new(flush_interval: Duration) -> Self {
        Self {
            pending: String::new(),
            flush_interval,
            last_flush: None,
        }
    }

    /// Append delta text. O(1) amortized; never triggers a render.
    pub fn append(&mut self, text: &str) {
        self.pending.push_str(text);
    }

    /// Whether any text is waiting to be drained.
    #[must_use]
    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    /// Whether a drain is allowed now: there is pending text and the flush
    /// interval has elapsed (the first drain is always allowed).
    #[must_use]
    pub fn flush_due(&self) -> bool {
        if self.pending.is_empty() {
            return false;
        }
        match self.last_flush {
            Some(last) => last.elapsed() >= self.flush_interval,
            None => true,
        }
    }

    /// The instant at which the next drain becomes due, when text is pending.
    #[must_use]
    pub fn next_flush_at(&self) -> Option<Instant> {
        if self.pending.is_empty() {
            return None;
        }
        Some(match self.last_flush {
            Some(last) => last + self.flush_interval,
            None => Instant::now(),
        })
    }

    /// Drain all pending text, in arrival order. Returns `None` when empty,
    /// so draining an empty buffer is free and idempotent.
    pub fn take(&mut self) -> Option<String> {
        if self.pending.is_empty() {
            return None;
        }
        self.last_flush = Some(Instant::now());
        Some(std::mem::take(&mut self.pending))
    }
}
