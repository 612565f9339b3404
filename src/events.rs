//! Payloads carried from native threads to the runtime thread.

use std::fmt;

/// One transcription update on the result channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecognitionEvent {
    /// Best transcription so far; later events supersede it
    Partial { text: String },
    /// Settled transcription for the utterance
    Final { text: String },
}

impl RecognitionEvent {
    pub fn text(&self) -> &str {
        match self {
            RecognitionEvent::Partial { text } | RecognitionEvent::Final { text } => text,
        }
    }

    pub fn is_final(&self) -> bool {
        matches!(self, RecognitionEvent::Final { .. })
    }
}

/// Lifecycle signal raised by a native backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Signal {
    /// Audio is flowing and recognition has begun
    Started,
    /// The backend finished a requested stop
    Stopped,
    /// The backend ended the session on its own (final result or fatal error)
    Ended,
}

/// A queued payload tagged with the listen cycle that produced it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Stamped<T> {
    pub generation: u64,
    pub event: T,
}

/// Session lifecycle notification delivered to the status callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    /// The native service confirmed that it is listening
    Started,
    /// Listening ended, either on request or because the service ended it
    Stopped,
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionStatus::Started => f.write_str("started"),
            SessionStatus::Stopped => f.write_str("stopped"),
        }
    }
}
