//! Lifecycle and control events delivered to the application that owns a
//! connection. Events arrive in the causal order of the frames that produced
//! them.

use crate::media::error::StreamError;
use std::fmt;
use std::sync::Arc;

/// Default capacity of a connection's event channel.
pub const DEFAULT_EVENT_CAPACITY: usize = 100;

#[derive(Debug, Clone)]
pub enum StreamEvent {
    /// The telephony side opened the stream socket.
    Connected,
    /// Stream metadata arrived; stream id and call id are now bound.
    AudioStarted,
    /// The caller pressed a key.
    Dtmf { digit: String },
    /// The telephony side stopped the stream.
    AudioStopped,
    /// The stream ended cleanly.
    Disconnected,
    /// The stream ended abnormally.
    Error { cause: Arc<StreamError> },
}

/// Payload-free discriminant of a [`StreamEvent`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Connected,
    AudioStarted,
    Dtmf,
    AudioStopped,
    Disconnected,
    Error,
}

impl StreamEvent {
    pub fn error(cause: StreamError) -> Self {
        StreamEvent::Error {
            cause: Arc::new(cause),
        }
    }

    pub fn kind(&self) -> EventKind {
        match self {
            StreamEvent::Connected => EventKind::Connected,
            StreamEvent::AudioStarted => EventKind::AudioStarted,
            StreamEvent::Dtmf { .. } => EventKind::Dtmf,
            StreamEvent::AudioStopped => EventKind::AudioStopped,
            StreamEvent::Disconnected => EventKind::Disconnected,
            StreamEvent::Error { .. } => EventKind::Error,
        }
    }

    /// True for the events after which no further events follow.
    pub fn is_terminal(&self) -> bool {
        matches!(self, StreamEvent::Disconnected | StreamEvent::Error { .. })
    }
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Connected => "connected",
            EventKind::AudioStarted => "audio_started",
            EventKind::Dtmf => "dtmf",
            EventKind::AudioStopped => "audio_stopped",
            EventKind::Disconnected => "disconnected",
            EventKind::Error => "error",
        }
    }
}

impl fmt::Display for StreamEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StreamEvent::Dtmf { digit } => write!(f, "dtmf({})", digit),
            StreamEvent::Error { cause } => write!(f, "error({})", cause),
            other => f.write_str(other.kind().as_str()),
        }
    }
}
