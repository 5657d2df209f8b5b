//! Presentation Sink
//!
//! The abstract rendering target for streamed answer text. The core never
//! touches a concrete UI; it talks to a [`PresentationSink`] resolved through
//! a [`SinkHost`] immediately before every mutation. Hosts whose view can be
//! torn down and rebuilt mid-stream re-resolve the binding on each call and
//! return `None` while no target exists. The canonical message content keeps
//! accumulating regardless, so a rebuilt view can be repainted from it.

use crate::conversation::MessageId;

/// A rendering target for one streaming message.
pub trait PresentationSink {
    /// Append answer text after whatever is already rendered.
    fn append(&mut self, text: &str);

    /// Replace the entire rendered answer (fallback splice, error display).
    fn replace_all(&mut self, text: &str);

    /// Show a transient status indicator ("thinking…", "running tools…").
    fn set_status(&mut self, label: &str);

    /// Remove the transient status indicator.
    fn clear_status(&mut self);
}

/// Resolver from message to its current sink (rebind-or-fail).
///
/// Called before each mutation; implementations should locate the live view
/// for `message_id` fresh every time rather than caching a binding.
pub trait SinkHost: Send {
    /// Resolve the sink for a message, or `None` if the view is gone.
    fn resolve(&mut self, message_id: MessageId) -> Option<&mut dyn PresentationSink>;
}

/// A host with no view at all. Renders nothing; content still accumulates in
/// the message.
#[derive(Debug, Default)]
pub struct NullSinkHost;

impl SinkHost for NullSinkHost {
    fn resolve(&mut self, _message_id: MessageId) -> Option<&mut dyn PresentationSink> {
        None
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! Recording sink used by session and driver tests.

    use super::{PresentationSink, SinkHost};
    use crate::conversation::MessageId;

    /// Records every mutation for assertions.
    #[derive(Debug, Default)]
    pub struct RecordingSink {
        /// Rendered text so far.
        pub text: String,
        /// Currently shown status, if any.
        pub status: Option<String>,
        /// Count of `replace_all` calls.
        pub replacements: usize,
    }

    impl PresentationSink for RecordingSink {
        fn append(&mut self, text: &str) {
            self.text.push_str(text);
        }

        fn replace_all(&mut self, text: &str) {
            self.text = text.to_string();
            self.replacements += 1;
        }

        fn set_status(&mut self, label: &str) {
            self.status = Some(label.to_string());
        }

        fn clear_status(&mut self) {
            self.status = None;
        }
    }

    /// Host that always resolves to its single recording sink.
    #[derive(Debug, Default)]
    pub struct RecordingHost {
        /// The single sink.
        pub sink: RecordingSink,
    }

    impl SinkHost for RecordingHost {
        fn resolve(&mut self, _message_id: MessageId) -> Option<&mut dyn PresentationSink> {
            Some(&mut self.sink)
        }
    }
}
