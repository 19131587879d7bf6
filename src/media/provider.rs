//! # Media Stream Provider
//!
//! The provider is the entry point of the media layer. It turns upgraded
//! sockets into [`Connection`]s, hands them to whoever is listening on the
//! socket's path, and keeps a registry of live connections so the rest of
//! the application can find a stream again by its stream id.
//!
//! ## Registries
//! - **live connections**: every accepted connection, keyed by its local id,
//!   plus an index from stream id to local id once the stream has started.
//!   Both maps sit behind one lock so they never disagree.
//! - **listeners**: one bounded delivery channel per path. Registering a
//!   listener for a path that already has one replaces it; the old stream of
//!   connections ends.
//!
//! Connections hold only a weak reference back to the provider, so dropping
//! the provider never keeps connections alive and vice versa.
//!
//! ## Rust Concepts Used:
//! - **Generic `accept<S>`**: any `AsyncRead + AsyncWrite` transport (TCP in
//!   production, in-memory pipes in tests)
//! - **`ReceiverStream`**: exposes a listener's channel as a `Stream`
//! - **Trait objects**: the DTMF callback is an `Arc<dyn Fn ...>`

use crate::media::connection::{Connection, ConnectionConfig};
use crate::media::error::{StreamError, StreamResult};
use crate::media::socket;

use futures_util::future::join_all;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_stream::wrappers::ReceiverStream;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Protocol family name reported by [`Provider::name`].
pub const PROVIDER_NAME: &str = "twilio-media-streams";

/// Transport reported by [`Provider::protocol`].
pub const PROVIDER_PROTOCOL: &str = "websocket";

/// Connections a listener may have waiting before new ones are not delivered.
pub const DEFAULT_LISTENER_CAPACITY: usize = 10;

/// Connections delivered to one listener path.
pub type ConnectionStream = ReceiverStream<Arc<Connection>>;

/// Callback invoked for every DTMF digit on any connection.
pub type DtmfHandler = Arc<dyn Fn(&Arc<Connection>, &str) + Send + Sync>;

#[derive(Debug, Clone)]
pub struct ProviderConfig {
    pub connection: ConnectionConfig,
    pub listener_capacity: usize,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            connection: ConnectionConfig::default(),
            listener_capacity: DEFAULT_LISTENER_CAPACITY,
        }
    }
}

#[derive(Default)]
struct LiveConnections {
    by_id: HashMap<Uuid, Arc<Connection>>,
    by_stream: HashMap<String, Uuid>,
}

/// Registry of listeners and live connections.
///
/// ## Thread Safety:
/// Shared as `Arc<Provider>`. Listeners and live connections use separate
/// `parking_lot::RwLock`s, and neither lock is held across an `.await`.
pub struct Provider {
    config: ProviderConfig,
    // Both indexes of the live registry, under one lock
    live: RwLock<LiveConnections>,
    listeners: RwLock<HashMap<String, mpsc::Sender<Arc<Connection>>>>,
    dtmf_handler: RwLock<Option<DtmfHandler>>,
    closed: AtomicBool, // set once by close()
}

impl Provider {
    pub fn new(config: ProviderConfig) -> Arc<Self> {
        Arc::new(Self {
            config,
            live: RwLock::new(LiveConnections::default()),
            listeners: RwLock::new(HashMap::new()),
            dtmf_handler: RwLock::new(None),
            closed: AtomicBool::new(false),
        })
    }

    pub fn name(&self) -> &'static str {
        PROVIDER_NAME
    }

    pub fn protocol(&self) -> &'static str {
        PROVIDER_PROTOCOL
    }

    pub fn config(&self) -> &ProviderConfig {
        &self.config
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Register interest in connections accepted on `path`.
    ///
    /// Connections arriving while the listener's queue is full are not
    /// delivered to it (they stay reachable through [`Provider::lookup`]).
    pub fn listen(&self, path: &str) -> StreamResult<ConnectionStream> {
        if self.is_closed() {
            return Err(StreamError::ProviderClosed);
        }

        let (tx, rx) = mpsc::channel(self.config.listener_capacity.max(1));
        let replaced = self.listeners.write().insert(path.to_string(), tx).is_some();

        // close() may have cleared the listeners between the check and the insert.
        if self.is_closed() {
            self.listeners.write().remove(path);
            return Err(StreamError::ProviderClosed);
        }

        if replaced {
            debug!(path, "replaced existing listener");
        } else {
            info!(path, "listening for media streams");
        }
        Ok(ReceiverStream::new(rx))
    }

    /// Take ownership of an upgraded socket and start streaming on it.
    ///
    /// Returns immediately; reading and writing happen on the connection's
    /// own tasks.
    pub async fn accept<S>(
        self: &Arc<Self>,
        mut socket: WebSocketStream<S>,
        path: &str,
        remote_addr: Option<SocketAddr>,
    ) -> StreamResult<Arc<Connection>>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        if self.is_closed() {
            if let Err(err) = socket.close(None).await {
                debug!(error = %err, "failed to close rejected socket");
            }
            return Err(StreamError::ProviderClosed);
        }

        let (sink, stream) = socket::split(socket);
        let conn = Connection::new(
            sink,
            path,
            remote_addr,
            self.config.connection.clone(),
            Arc::downgrade(self),
        );

        // Registered before the loops run so a start frame always finds it.
        self.live.write().by_id.insert(conn.local_id(), conn.clone());
        conn.start(stream);

        if self.is_closed() {
            conn.close().await;
            return Err(StreamError::ProviderClosed);
        }

        info!(local_id = %conn.local_id(), path, remote_addr = ?remote_addr, "accepted media stream");
        self.deliver(path, &conn);
        Ok(conn)
    }

    fn deliver(&self, path: &str, conn: &Arc<Connection>) {
        let listeners = self.listeners.read();
        let Some(listener) = listeners.get(path) else {
            debug!(path, "no listener registered for path");
            return;
        };

        match listener.try_send(conn.clone()) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                warn!(path, local_id = %conn.local_id(), "listener queue full, connection not delivered");
            }
            Err(TrySendError::Closed(_)) => {
                debug!(path, "listener dropped its connection stream");
            }
        }
    }

    /// Install the DTMF callback, replacing any previous one.
    pub fn on_dtmf<F>(&self, handler: F)
    where
        F: Fn(&Arc<Connection>, &str) + Send + Sync + 'static,
    {
        *self.dtmf_handler.write() = Some(Arc::new(handler));
    }

    pub(crate) fn dispatch_dtmf(&self, conn: &Arc<Connection>, digit: &str) {
        let handler = self.dtmf_handler.read().clone();
        if let Some(handler) = handler {
            handler(conn, digit);
        }
    }

    /// Find a live connection by the stream id bound from its start frame.
    pub fn lookup(&self, stream_sid: &str) -> Option<Arc<Connection>> {
        let live = self.live.read();
        live.by_stream
            .get(stream_sid)
            .and_then(|local_id| live.by_id.get(local_id))
            .cloned()
    }

    /// Snapshot of every live connection, started or not.
    pub fn connections(&self) -> Vec<Arc<Connection>> {
        self.live.read().by_id.values().cloned().collect()
    }

    pub fn live_count(&self) -> usize {
        self.live.read().by_id.len()
    }

    pub(crate) fn register_stream(&self, stream_sid: &str, conn: &Arc<Connection>) {
        if stream_sid.is_empty() {
            return;
        }

        let mut live = self.live.write();
        // A connection closing concurrently deregisters after marking itself
        // closed, so checking here under the lock is enough.
        if conn.is_closed() || !live.by_id.contains_key(&conn.local_id()) {
            return;
        }
        if let Some(previous) = live.by_stream.insert(stream_sid.to_string(), conn.local_id()) {
            if previous != conn.local_id() {
                warn!(stream_sid, %previous, "stream id reused by a new connection");
            }
        }
    }

    pub(crate) fn deregister(&self, conn: &Connection) {
        let mut live = self.live.write();
        live.by_id.remove(&conn.local_id());
        if let Some(stream_sid) = conn.stream_sid() {
            if live.by_stream.get(&stream_sid) == Some(&conn.local_id()) {
                live.by_stream.remove(&stream_sid);
            }
        }
    }

    /// Close every live connection and end every listener stream. Later
    /// calls return `false` and do nothing.
    pub async fn close(&self) -> bool {
        if self.closed.swap(true, Ordering::SeqCst) {
            return false;
        }

        let connections: Vec<Arc<Connection>> = {
            let mut live = self.live.write();
            live.by_stream.clear();
            live.by_id.drain().map(|(_, conn)| conn).collect()
        };
        self.listeners.write().clear();

        info!(connections = connections.len(), "closing media stream provider");
        join_all(connections.iter().map(|conn| conn.close())).await;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::event::EventKind;
    use crate::media::socket::testing::socket_pair;
    use futures_util::{SinkExt, StreamExt};
    use serde_json::json;
    use std::time::Duration;
    use tokio_tungstenite::tungstenite::Message;

    const WAIT: Duration = Duration::from_secs(2);

    async fn start_stream(client: &mut WebSocketStream<tokio::io::DuplexStream>, stream_sid: &str) {
        let frame = json!({
            "event": "start",
            "start": {"streamSid": stream_sid, "callSid": "CA1", "tracks": ["inbound"]}
        });
        client.send(Message::Text(frame.to_string())).await.unwrap();
    }

    #[test]
    fn test_provider_identity() {
        let provider = Provider::new(ProviderConfig::default());
        assert_eq!(provider.name(), "twilio-media-streams");
        assert_eq!(provider.protocol(), "websocket");
        assert_eq!(provider.live_count(), 0);
    }

    #[tokio::test]
    async fn test_accept_without_listener_is_still_registered() {
        let provider = Provider::new(ProviderConfig::default());
        let (server, mut client) = socket_pair().await;

        let conn = provider.accept(server, "/nobody-listens", None).await.unwrap();
        assert_eq!(provider.live_count(), 1);
        assert!(provider.lookup("MZ-unlistened").is_none());

        start_stream(&mut client, "MZ-unlistened").await;
        let event = tokio::time::timeout(WAIT, conn.next_event()).await.unwrap();
        assert_eq!(event.map(|e| e.kind()), Some(EventKind::AudioStarted));

        let found = provider.lookup("MZ-unlistened").expect("stream should be registered");
        assert!(Arc::ptr_eq(&found, &conn));

        conn.close().await;
        assert!(provider.lookup("MZ-unlistened").is_none());
        assert_eq!(provider.live_count(), 0);
    }

    #[tokio::test]
    async fn test_listener_receives_connections_for_its_path() {
        let provider = Provider::new(ProviderConfig::default());
        let mut incoming = provider.listen("/media-stream").unwrap();

        let (server, _client) = socket_pair().await;
        let accepted = provider.accept(server, "/media-stream", None).await.unwrap();
        let (other, _other_client) = socket_pair().await;
        provider.accept(other, "/elsewhere", None).await.unwrap();

        let delivered = tokio::time::timeout(WAIT, incoming.next()).await.unwrap().unwrap();
        assert!(Arc::ptr_eq(&delivered, &accepted));
        assert_eq!(delivered.listener_path(), "/media-stream");

        // Nothing for the other path.
        assert!(tokio::time::timeout(Duration::from_millis(50), incoming.next()).await.is_err());
        provider.close().await;
    }

    #[tokio::test]
    async fn test_full_listener_skips_delivery() {
        let config = ProviderConfig {
            listener_capacity: 1,
            ..ProviderConfig::default()
        };
        let provider = Provider::new(config);
        let mut incoming = provider.listen("/media-stream").unwrap();

        let mut clients = Vec::new();
        for _ in 0..2 {
            let (server, client) = socket_pair().await;
            provider.accept(server, "/media-stream", None).await.unwrap();
            clients.push(client);
        }

        assert_eq!(provider.live_count(), 2);
        assert!(incoming.next().await.is_some());
        assert!(tokio::time::timeout(Duration::from_millis(50), incoming.next()).await.is_err());
        provider.close().await;
    }

    #[tokio::test]
    async fn test_listen_again_replaces_previous_listener() {
        let provider = Provider::new(ProviderConfig::default());
        let mut first = provider.listen("/media-stream").unwrap();
        let mut second = provider.listen("/media-stream").unwrap();

        assert!(tokio::time::timeout(WAIT, first.next()).await.unwrap().is_none());

        let (server, _client) = socket_pair().await;
        provider.accept(server, "/media-stream", None).await.unwrap();
        assert!(tokio::time::timeout(WAIT, second.next()).await.unwrap().is_some());
        provider.close().await;
    }

    #[tokio::test]
    async fn test_close_shuts_everything_down() {
        let provider = Provider::new(ProviderConfig::default());
        let mut incoming = provider.listen("/media-stream").unwrap();

        let (server, mut client) = socket_pair().await;
        let conn = provider.accept(server, "/media-stream", None).await.unwrap();
        start_stream(&mut client, "MZ-shutdown").await;
        tokio::time::timeout(WAIT, conn.next_event()).await.unwrap();

        assert!(provider.close().await);
        assert!(!provider.close().await);

        assert!(conn.is_closed());
        assert_eq!(provider.live_count(), 0);
        assert!(provider.lookup("MZ-shutdown").is_none());

        // The queued connection is still handed out, then the stream ends.
        assert!(incoming.next().await.is_some());
        assert!(incoming.next().await.is_none());

        assert!(matches!(provider.listen("/media-stream"), Err(StreamError::ProviderClosed)));
        let (late, _late_client) = socket_pair().await;
        assert!(matches!(
            provider.accept(late, "/media-stream", None).await,
            Err(StreamError::ProviderClosed)
        ));
    }

    #[tokio::test]
    async fn test_connections_snapshot() {
        let provider = Provider::new(ProviderConfig::default());
        let mut clients = Vec::new();
        for _ in 0..3 {
            let (server, client) = socket_pair().await;
            provider.accept(server, "/media-stream", None).await.unwrap();
            clients.push(client);
        }

        let snapshot = provider.connections();
        assert_eq!(snapshot.len(), 3);
        snapshot[0].close().await;
        assert_eq!(provider.connections().len(), 2);
        provider.close().await;
    }
}
