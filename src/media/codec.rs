//! # Media Stream Frame Codec
//!
//! Parses and serializes the JSON envelope spoken on a media stream socket.
//! Every frame is a JSON object with a string `event` discriminator and, for
//! most events, one nested object named after the event:
//!
//! ```json
//! {"event":"media","sequenceNumber":"3","media":{"track":"inbound","chunk":"1","timestamp":"5","payload":"fn5+"}}
//! ```
//!
//! ## Inbound events
//! `connected`, `start`, `media`, `dtmf`, `stop`, `mark`.
//!
//! ## Outbound events
//! `media` (audio towards the caller), `mark` and `clear` (playback
//! synchronization). Outbound frames are keyed by `streamSid`.
//!
//! The codec is stateless and never panics on bad input: anything that does
//! not match one of the inbound shapes comes back as a [`CodecError`].
//!
//! ## Rust Concepts Used:
//! - **`#[serde(tag = "event")]`**: internally tagged enums map the `event`
//!   field straight onto a variant
//! - **`#[serde(rename = ...)]`**: camelCase wire names, snake_case fields
//! - **`#[serde(default)]`**: optional fields decode to `None`/empty values

use crate::media::error::CodecError;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

/// μ-law encoding, 8-bit samples at 8kHz.
pub const AUDIO_ENCODING_MULAW: &str = "audio/x-mulaw";

/// Linear PCM encoding, 16-bit samples at 8kHz.
pub const AUDIO_ENCODING_PCM: &str = "audio/x-l16";

/// Sample rate used for telephony media streams.
pub const DEFAULT_SAMPLE_RATE: u32 = 8000;

/// One decoded inbound frame.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "event", rename_all = "lowercase")]
pub enum InboundFrame {
    /// First frame on a new socket, before any stream metadata. Only the
    /// event name matters; the informational fields are kept untyped.
    Connected {
        #[serde(default)]
        protocol: Option<Value>,
        #[serde(default)]
        version: Option<Value>,
    },

    /// Stream metadata; binds the connection to a stream and a call.
    Start {
        #[serde(rename = "streamSid", default)]
        stream_sid: Option<String>,
        start: StartFrame,
    },

    /// One chunk of caller audio.
    Media { media: MediaFrame },

    /// A keypad digit pressed by the caller.
    Dtmf { dtmf: DtmfFrame },

    /// The stream has ended.
    Stop {
        #[serde(default)]
        stop: Option<StopFrame>,
    },

    /// Acknowledges a mark previously sent by us.
    Mark { mark: MarkFrame },
}

impl InboundFrame {
    /// Wire name of the frame's event, for logging.
    pub fn event_name(&self) -> &'static str {
        match self {
            InboundFrame::Connected { .. } => "connected",
            InboundFrame::Start { .. } => "start",
            InboundFrame::Media { .. } => "media",
            InboundFrame::Dtmf { .. } => "dtmf",
            InboundFrame::Stop { .. } => "stop",
            InboundFrame::Mark { .. } => "mark",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StartFrame {
    pub stream_sid: String,
    pub account_sid: String,
    pub call_sid: String,
    pub tracks: Vec<String>,
    pub media_format: MediaFormat,
    pub custom_parameters: HashMap<String, String>,
}

/// Audio format announced in the start frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MediaFormat {
    pub encoding: String,
    pub sample_rate: u32,
    pub channels: u16,
}

impl Default for MediaFormat {
    fn default() -> Self {
        Self {
            encoding: AUDIO_ENCODING_MULAW.to_string(),
            sample_rate: DEFAULT_SAMPLE_RATE,
            channels: 1,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct MediaFrame {
    pub track: String,
    pub chunk: String,
    pub timestamp: String,
    /// Base64 encoded audio bytes.
    pub payload: String,
}

impl MediaFrame {
    /// Decode the base64 payload into raw audio bytes.
    pub fn decode_payload(&self) -> Result<Vec<u8>, CodecError> {
        Ok(BASE64.decode(self.payload.trim())?)
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct DtmfFrame {
    pub digit: String,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StopFrame {
    pub account_sid: String,
    pub call_sid: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarkFrame {
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OutboundMedia {
    /// Base64 encoded audio bytes.
    pub payload: String,
}

/// Frames written by the bridge towards the telephony side.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "lowercase")]
pub enum OutboundFrame {
    Media {
        #[serde(rename = "streamSid")]
        stream_sid: String,
        media: OutboundMedia,
    },
    Mark {
        #[serde(rename = "streamSid")]
        stream_sid: String,
        mark: MarkFrame,
    },
    Clear {
        #[serde(rename = "streamSid")]
        stream_sid: String,
    },
}

impl OutboundFrame {
    pub fn media(stream_sid: impl Into<String>, audio: &[u8]) -> Self {
        OutboundFrame::Media {
            stream_sid: stream_sid.into(),
            media: OutboundMedia {
                payload: BASE64.encode(audio),
            },
        }
    }

    pub fn mark(stream_sid: impl Into<String>, name: impl Into<String>) -> Self {
        OutboundFrame::Mark {
            stream_sid: stream_sid.into(),
            mark: MarkFrame { name: name.into() },
        }
    }

    pub fn clear(stream_sid: impl Into<String>) -> Self {
        OutboundFrame::Clear {
            stream_sid: stream_sid.into(),
        }
    }
}

/// Decode one inbound frame from the raw bytes of a text or binary message.
pub fn decode(bytes: &[u8]) -> Result<InboundFrame, CodecError> {
    Ok(serde_json::from_slice(bytes)?)
}

/// Serialize an outbound frame to the JSON text sent on the socket.
pub fn encode(frame: &OutboundFrame) -> String {
    // Every field is a plain string or struct of strings, which serde_json
    // always serializes.
    serde_json::to_string(frame).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_connected() {
        let frame = decode(br#"{"event":"connected","protocol":"Call","version":"1.0.0"}"#).unwrap();
        assert_eq!(
            frame,
            InboundFrame::Connected {
                protocol: Some(Value::from("Call")),
                version: Some(Value::from("1.0.0")),
            }
        );
    }

    #[test]
    fn test_decode_connected_with_unexpected_field_types() {
        let frame = decode(br#"{"event":"connected","protocol":7,"version":{"major":1}}"#).unwrap();
        assert!(matches!(frame, InboundFrame::Connected { .. }));

        let bare = decode(br#"{"event":"connected"}"#).unwrap();
        assert_eq!(bare, InboundFrame::Connected { protocol: None, version: None });
    }

    #[test]
    fn test_decode_start() {
        let raw = br#"{
            "event": "start",
            "sequenceNumber": "1",
            "start": {
                "accountSid": "AC123",
                "streamSid": "MZ456",
                "callSid": "CA789",
                "tracks": ["inbound"],
                "mediaFormat": {"encoding": "audio/x-mulaw", "sampleRate": 8000, "channels": 1},
                "customParameters": {"lang": "en"}
            },
            "streamSid": "MZ456"
        }"#;

        match decode(raw).unwrap() {
            InboundFrame::Start { stream_sid, start } => {
                assert_eq!(stream_sid.as_deref(), Some("MZ456"));
                assert_eq!(start.stream_sid, "MZ456");
                assert_eq!(start.call_sid, "CA789");
                assert_eq!(start.account_sid, "AC123");
                assert_eq!(start.tracks, vec!["inbound".to_string()]);
                assert_eq!(start.media_format.sample_rate, 8000);
                assert_eq!(start.custom_parameters.get("lang").map(String::as_str), Some("en"));
            }
            other => panic!("Wrong frame type: {:?}", other),
        }
    }

    #[test]
    fn test_decode_media_payload() {
        let raw = br#"{"event":"media","media":{"track":"inbound","chunk":"2","timestamp":"40","payload":"AQID"}}"#;
        match decode(raw).unwrap() {
            InboundFrame::Media { media } => {
                assert_eq!(media.track, "inbound");
                assert_eq!(media.decode_payload().unwrap(), vec![1, 2, 3]);
            }
            other => panic!("Wrong frame type: {:?}", other),
        }
    }

    #[test]
    fn test_invalid_media_payload_is_an_error() {
        let raw = br#"{"event":"media","media":{"payload":"not base64!!"}}"#;
        let InboundFrame::Media { media } = decode(raw).unwrap() else {
            panic!("expected media frame");
        };
        assert!(matches!(media.decode_payload(), Err(CodecError::Payload(_))));
    }

    #[test]
    fn test_decode_dtmf_stop_and_mark() {
        assert_eq!(
            decode(br#"{"event":"dtmf","dtmf":{"track":"inbound_track","digit":"5"}}"#).unwrap(),
            InboundFrame::Dtmf { dtmf: DtmfFrame { digit: "5".to_string() } }
        );
        match decode(br#"{"event":"stop","stop":{"accountSid":"AC1","callSid":"CA1"}}"#).unwrap() {
            InboundFrame::Stop { stop: Some(stop) } => assert_eq!(stop.call_sid, "CA1"),
            other => panic!("Wrong frame type: {:?}", other),
        }
        assert_eq!(
            decode(br#"{"event":"stop"}"#).unwrap(),
            InboundFrame::Stop { stop: None }
        );
        assert_eq!(
            decode(br#"{"event":"mark","mark":{"name":"greeting"}}"#).unwrap().event_name(),
            "mark"
        );
    }

    #[test]
    fn test_malformed_frames_are_rejected() {
        assert!(decode(b"not json").is_err());
        assert!(decode(b"").is_err());
        assert!(decode(br#"{"event":"bogus"}"#).is_err());
        assert!(decode(br#"{"no_event":true}"#).is_err());
        // start without its nested object
        assert!(decode(br#"{"event":"start","streamSid":"MZ1"}"#).is_err());
        assert!(decode(br#"{"event":"dtmf","dtmf":{}}"#).is_err());
    }

    #[test]
    fn test_encode_outbound_frames() {
        let media: Value = serde_json::from_str(&encode(&OutboundFrame::media("MZ1", &[1, 2, 3]))).unwrap();
        assert_eq!(media["event"], "media");
        assert_eq!(media["streamSid"], "MZ1");
        assert_eq!(media["media"]["payload"], "AQID");

        let mark: Value = serde_json::from_str(&encode(&OutboundFrame::mark("MZ1", "end-of-prompt"))).unwrap();
        assert_eq!(mark["event"], "mark");
        assert_eq!(mark["mark"]["name"], "end-of-prompt");

        let clear: Value = serde_json::from_str(&encode(&OutboundFrame::clear("MZ1"))).unwrap();
        assert_eq!(clear["event"], "clear");
        assert_eq!(clear["streamSid"], "MZ1");
        assert!(clear.get("media").is_none());
    }
}
