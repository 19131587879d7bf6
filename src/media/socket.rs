//! Type-erased halves of an upgraded WebSocket.
//!
//! The provider accepts any `WebSocketStream<S>` (plain TCP, TLS, or an
//! in-memory duplex in tests) and immediately splits it, so connections only
//! ever see a boxed sink and a boxed stream of tungstenite messages.

use futures_util::stream::BoxStream;
use futures_util::{Sink, StreamExt};
use std::pin::Pin;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::WebSocketStream;

pub type FrameSink = Pin<Box<dyn Sink<Message, Error = tungstenite::Error> + Send>>;

pub type FrameStream = BoxStream<'static, Result<Message, tungstenite::Error>>;

/// Split an upgraded socket into its write and read halves.
pub fn split<S>(socket: WebSocketStream<S>) -> (FrameSink, FrameStream)
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (sink, stream) = socket.split();
    (Box::pin(sink), stream.boxed())
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use tokio::io::DuplexStream;
    use tokio_tungstenite::tungstenite::protocol::Role;

    /// A connected server/client pair speaking real WebSocket framing over an
    /// in-memory pipe.
    pub async fn socket_pair() -> (WebSocketStream<DuplexStream>, WebSocketStream<DuplexStream>) {
        let (server_io, client_io) = tokio::io::duplex(64 * 1024);
        let server = WebSocketStream::from_raw_socket(server_io, Role::Server, None).await;
        let client = WebSocketStream::from_raw_socket(client_io, Role::Client, None).await;
        (server, client)
    }
}
