//! # Media Streaming Core
//!
//! Everything needed to terminate a telephony media stream socket:
//!
//! - **codec**: the JSON frame envelope (decode inbound, encode outbound)
//! - **buffer**: bounded audio queues with per-direction overflow policies
//! - **event**: lifecycle events delivered to the application
//! - **connection**: one live stream with its receive and send loops
//! - **provider**: accepts sockets, routes them to listeners, tracks them
//! - **socket**: splits an upgraded WebSocket into boxed halves
//!
//! The core knows nothing about HTTP or about what the application does
//! with the audio. The binary wires it to a TCP acceptor (`server`) and a
//! demo driver (`bridge`).

pub mod buffer;
pub mod codec;
pub mod connection;
pub mod error;
pub mod event;
pub mod provider;
pub mod socket;

pub use buffer::{Admission, InboundAudio, OutboundAudio};
pub use codec::{InboundFrame, MediaFormat, OutboundFrame};
pub use connection::{Connection, ConnectionConfig, ConnectionInfo, ConnectionState, StreamIdentity};
pub use error::{CodecError, StreamError, StreamResult};
pub use event::{EventKind, StreamEvent};
pub use provider::{ConnectionStream, Provider, ProviderConfig};
