//! Error types for the media streaming core.
//!
//! Per-frame problems (`CodecError`) are absorbed by the receive loop and never
//! reach the application. Connection-level failures surface as
//! [`StreamError`], either as the cause of an `Error` event or as the result
//! of a call made on a closed connection.

use std::time::Duration;
use thiserror::Error;
use tokio_tungstenite::tungstenite;

/// A single inbound frame could not be understood.
#[derive(Debug, Error)]
pub enum CodecError {
    /// Not JSON, unknown `event`, or a variant missing its nested object.
    #[error("malformed frame: {0}")]
    Malformed(#[from] serde_json::Error),

    /// The base64 audio payload of a media frame is invalid.
    #[error("invalid media payload: {0}")]
    Payload(#[from] base64::DecodeError),
}

#[derive(Debug, Error)]
pub enum StreamError {
    /// The connection (or one of its buffers) has already been closed.
    #[error("connection closed")]
    Closed,

    /// The provider has been shut down and accepts no new work.
    #[error("provider closed")]
    ProviderClosed,

    #[error("websocket transport error: {0}")]
    Transport(#[from] tungstenite::Error),

    /// The peer closed the socket with a status other than normal/going-away.
    #[error("abnormal close from peer (code {code}): {reason}")]
    AbnormalClose { code: u16, reason: String },

    #[error("no frame received within {0:?}")]
    ReadTimeout(Duration),

    #[error("socket write did not complete within {0:?}")]
    WriteTimeout(Duration),
}

impl StreamError {
    /// Whether this error describes a use-after-close condition.
    pub fn is_closed(&self) -> bool {
        matches!(self, StreamError::Closed | StreamError::ProviderClosed)
    }
}

pub type StreamResult<T> = Result<T, StreamError>;
