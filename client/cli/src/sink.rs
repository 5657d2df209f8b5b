//! Stdout presentation sink.
//!
//! Renders streamed answer text directly to the terminal. The transient
//! status indicator lives on the current line and is cleared before any
//! answer text lands on it.

use std::io::Write;

use parley_core::{MessageId, PresentationSink, SinkHost};

/// Sink that writes answer text to stdout as it streams.
#[derive(Debug, Default)]
pub struct StdoutSink {
    /// Whether a status line is currently displayed.
    status_shown: bool,
    /// Characters of answer text printed so far.
    printed: usize,
}

impl StdoutSink {
    fn clear_status_line(&mut self) {
        if self.status_shown {
            // Erase the status line in place.
            print!("\r\x1b[2K");
            self.status_shown = false;
        }
    }

    fn flush(&self) {
        let _ = std::io::stdout().flush();
    }
}

impl PresentationSink for StdoutSink {
    fn append(&mut self, text: &str) {
        self.clear_status_line();
        print!("{text}");
        self.printed += text.chars().count();
        self.flush();
    }

    fn replace_all(&mut self, text: &str) {
        self.clear_status_line();
        if self.printed > 0 {
            // Streamed text already on screen cannot be unprinted; start the
            // replacement answer on its own line.
            println!();
        }
        print!("{text}");
        self.printed = text.chars().count();
        self.flush();
    }

    fn set_status(&mut self, label: &str) {
        self.clear_status_line();
        print!("\r\x1b[2K  [{label}]");
        self.status_shown = true;
        self.flush();
    }

    fn clear_status(&mut self) {
        self.clear_status_line();
        self.flush();
    }
}

/// Host with a single stdout sink; the binding never goes away.
#[derive(Debug, Default)]
pub struct StdoutHost {
    sink: StdoutSink,
}

impl SinkHost for StdoutHost {
    fn resolve(&mut self, _message_id: MessageId) -> Option<&mut dyn PresentationSink> {
        Some(&mut self.sink)
    }
}
