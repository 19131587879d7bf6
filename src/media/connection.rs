//! # Media Stream Connection
//!
//! One connection per call leg. A connection owns the socket, an inbound and
//! an outbound audio buffer and an event channel, and runs two tasks for its
//! whole lifetime:
//!
//! - the **receive loop** reads frames from the socket, binds the stream
//!   identity, feeds caller audio into the inbound buffer and emits events;
//! - the **send loop** drains the outbound buffer into `media` frames.
//!
//! ## Lifecycle
//! `Pending` (socket accepted) → `Active` (first `start` frame) →
//! `Draining` (`stop` frame, peer close or read failure) → `Closed`.
//!
//! Identity, lifecycle state and the event sender sit behind one lock shared
//! by both loops. Stream id and call id are written at most once.
//! [`Connection::close`] is the only cancellation primitive: it is idempotent,
//! safe to call from any task, and wakes both loops.
//!
//! ## Rust Concepts Used:
//! - **`Arc<Self>` receivers**: each spawned loop holds its own handle to the
//!   connection
//! - **`Weak<Provider>`**: back-reference to the registry without a cycle
//! - **`watch` channel**: one shutdown flag observed by both loops
//! - **`tokio::select!` with `biased`**: shutdown is always checked first

use crate::media::buffer::{Admission, InboundAudio, OutboundAudio, DEFAULT_CAPACITY};
use crate::media::codec::{self, InboundFrame, MediaFormat, OutboundFrame, StartFrame};
use crate::media::error::{StreamError, StreamResult};
use crate::media::event::{StreamEvent, DEFAULT_EVENT_CAPACITY};
use crate::media::provider::Provider;
use crate::media::socket::{FrameSink, FrameStream};

use chrono::{DateTime, Utc};
use futures_util::{SinkExt, StreamExt};
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::HashMap;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::{self, Message};
use tracing::{debug, info, info_span, trace, warn, Instrument};
use uuid::Uuid;

/// Per-connection tuning, derived from the `media` config section.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Chunks held by each audio buffer.
    pub buffer_capacity: usize,
    pub event_capacity: usize,
    /// Longest silence tolerated on the socket before the stream is failed.
    pub read_timeout: Option<Duration>,
    /// Upper bound for a single socket write (and the closing handshake).
    pub write_timeout: Option<Duration>,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            buffer_capacity: DEFAULT_CAPACITY,
            event_capacity: DEFAULT_EVENT_CAPACITY,
            read_timeout: None,
            write_timeout: Some(Duration::from_secs(10)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Pending,
    Active,
    Draining,
    Closed,
}

/// Stream metadata bound by the first `start` frame.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct StreamIdentity {
    pub stream_sid: Option<String>,
    pub call_sid: Option<String>,
    pub account_sid: Option<String>,
    pub tracks: Vec<String>,
    pub media_format: Option<MediaFormat>,
    pub custom_parameters: HashMap<String, String>,
}

/// Point-in-time view of a connection for diagnostics.
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionInfo {
    pub local_id: Uuid,
    pub state: ConnectionState,
    pub listener_path: String,
    pub remote_addr: Option<SocketAddr>,
    pub identity: StreamIdentity,
    pub created_at: DateTime<Utc>,
    pub inbound_queued: usize,
    pub inbound_dropped: u64,
    pub outbound_queued: usize,
    pub outbound_evicted: u64,
}

/// Everything both loops mutate, under one lock.
struct Shared {
    identity: StreamIdentity,
    state: ConnectionState,
    /// Taken on close; the event channel ends once in-flight sends finish.
    events: Option<mpsc::Sender<StreamEvent>>,
}

/// A single media stream socket.
///
/// ## Thread Safety:
/// Handed out as `Arc<Connection>`; every method takes `&self`. The socket
/// sink sits behind an async mutex because the send loop, `send_mark`,
/// `clear` and `close` all write to it.
pub struct Connection {
    local_id: Uuid,
    listener_path: String,
    remote_addr: Option<SocketAddr>,
    created_at: DateTime<Utc>,
    config: ConnectionConfig,
    shared: RwLock<Shared>,
    inbound: InboundAudio,
    outbound: OutboundAudio,
    events: Mutex<mpsc::Receiver<StreamEvent>>,
    sink: Mutex<FrameSink>,
    shutdown: watch::Sender<bool>,
    provider: Weak<Provider>,
}

/// How the receive loop ended.
enum Termination {
    /// `stop` frame; terminal events already emitted.
    Stopped,
    /// Normal closure by the peer.
    PeerClosed,
    Failed(StreamError),
    /// Our own close() got there first.
    Shutdown,
}

impl Connection {
    /// Build a connection around an already split socket. The loops are not
    /// running until [`Connection::start`].
    pub(crate) fn new(
        sink: FrameSink,
        listener_path: &str,
        remote_addr: Option<SocketAddr>,
        config: ConnectionConfig,
        provider: Weak<Provider>,
    ) -> Arc<Self> {
        let (events_tx, events_rx) = mpsc::channel(config.event_capacity.max(1));
        let (shutdown, _) = watch::channel(false);

        Arc::new(Self {
            local_id: Uuid::new_v4(),
            listener_path: listener_path.to_string(),
            remote_addr,
            created_at: Utc::now(),
            inbound: InboundAudio::new(config.buffer_capacity),
            outbound: OutboundAudio::new(config.buffer_capacity),
            config,
            shared: RwLock::new(Shared {
                identity: StreamIdentity::default(),
                state: ConnectionState::Pending,
                events: Some(events_tx),
            }),
            events: Mutex::new(events_rx),
            sink: Mutex::new(sink),
            shutdown,
            provider,
        })
    }

    /// Spawn the receive and send loops.
    pub(crate) fn start(self: &Arc<Self>, stream: FrameStream) {
        let span = info_span!("media_stream", local_id = %self.local_id, path = %self.listener_path);

        let receiver = self.clone();
        let shutdown = self.shutdown.subscribe();
        tokio::spawn(
            async move { receiver.receive_loop(stream, shutdown).await }.instrument(span.clone()),
        );

        let sender = self.clone();
        let shutdown = self.shutdown.subscribe();
        tokio::spawn(async move { sender.send_loop(shutdown).await }.instrument(span));
    }

    pub fn local_id(&self) -> Uuid {
        self.local_id
    }

    pub fn stream_sid(&self) -> Option<String> {
        self.shared.read().identity.stream_sid.clone()
    }

    pub fn call_sid(&self) -> Option<String> {
        self.shared.read().identity.call_sid.clone()
    }

    pub fn identity(&self) -> StreamIdentity {
        self.shared.read().identity.clone()
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.read().state
    }

    pub fn is_closed(&self) -> bool {
        self.state() == ConnectionState::Closed
    }

    pub fn listener_path(&self) -> &str {
        &self.listener_path
    }

    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.remote_addr
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn inbound(&self) -> &InboundAudio {
        &self.inbound
    }

    pub fn outbound(&self) -> &OutboundAudio {
        &self.outbound
    }

    pub fn info(&self) -> ConnectionInfo {
        let (identity, state) = {
            let shared = self.shared.read();
            (shared.identity.clone(), shared.state)
        };
        ConnectionInfo {
            local_id: self.local_id,
            state,
            listener_path: self.listener_path.clone(),
            remote_addr: self.remote_addr,
            identity,
            created_at: self.created_at,
            inbound_queued: self.inbound.len(),
            inbound_dropped: self.inbound.dropped(),
            outbound_queued: self.outbound.len(),
            outbound_evicted: self.outbound.evicted(),
        }
    }

    /// Queue audio for the caller. Evicts the oldest queued chunk when full.
    pub fn send_audio(&self, chunk: impl Into<Vec<u8>>) -> StreamResult<()> {
        if self.is_closed() {
            return Err(StreamError::Closed);
        }
        self.outbound.write(chunk.into())
    }

    /// Next chunk of caller audio; `None` once the connection has closed and
    /// the buffer is drained.
    pub async fn recv_audio(&self) -> Option<Vec<u8>> {
        self.inbound.read().await
    }

    /// Next lifecycle event; `None` once the connection has closed and all
    /// emitted events were consumed.
    pub async fn next_event(&self) -> Option<StreamEvent> {
        self.events.lock().await.recv().await
    }

    /// Ask the telephony side to report back when playback reaches this
    /// point of the outbound audio.
    pub async fn send_mark(&self, name: &str) -> StreamResult<()> {
        if self.is_closed() {
            return Err(StreamError::Closed);
        }
        let frame = OutboundFrame::mark(self.stream_sid().unwrap_or_default(), name);
        self.write_frame(&frame).await
    }

    /// Interrupt playback: drop audio still queued here and tell the
    /// telephony side to discard what it has buffered.
    pub async fn clear(&self) -> StreamResult<()> {
        if self.is_closed() {
            return Err(StreamError::Closed);
        }
        let discarded = self.outbound.discard_pending();
        trace!(discarded, "cleared pending outbound audio");
        let frame = OutboundFrame::clear(self.stream_sid().unwrap_or_default());
        self.write_frame(&frame).await
    }

    /// Tear the connection down. Returns `true` only for the call that
    /// actually performed the teardown; later and concurrent calls are no-ops.
    pub async fn close(&self) -> bool {
        // Only one caller gets past this check
        {
            let mut shared = self.shared.write();
            if shared.state == ConnectionState::Closed {
                return false;
            }
            shared.state = ConnectionState::Closed;
        }

        // Stop both loops, then wake anyone blocked on a buffer
        self.shutdown.send_replace(true);
        self.outbound.close();
        self.inbound.close();

        // Dropping the sender ends next_event() once queued events are read
        self.shared.write().events.take();
        self.close_socket().await;

        if let Some(provider) = self.provider.upgrade() {
            provider.deregister(self);
        }

        info!(
            local_id = %self.local_id,
            stream_sid = self.stream_sid().as_deref().unwrap_or(""),
            "media stream closed"
        );
        true
    }

    async fn close_socket(&self) {
        let mut sink = self.sink.lock().await;
        if let Err(err) = with_deadline(self.config.write_timeout, sink.close()).await {
            debug!(error = %err, "websocket close did not complete cleanly");
        }
    }

    async fn write_frame(&self, frame: &OutboundFrame) -> StreamResult<()> {
        let text = codec::encode(frame);
        let mut sink = self.sink.lock().await;
        with_deadline(self.config.write_timeout, sink.send(Message::Text(text))).await
    }

    async fn emit(&self, event: StreamEvent, shutdown: &mut watch::Receiver<bool>) {
        let Some(events) = self.shared.read().events.clone() else {
            return;
        };
        trace!(event = %event, "emitting event");
        tokio::select! {
            biased;
            sent = events.send(event) => {
                if sent.is_err() {
                    trace!("event receiver gone");
                }
            }
            _ = shutdown.wait_for(|stop| *stop) => {}
        }
    }

    fn set_state(&self, state: ConnectionState) {
        let mut shared = self.shared.write();
        if shared.state != ConnectionState::Closed {
            shared.state = state;
        }
    }

    /// Bind identity from the first start frame. Returns the stream id when
    /// this call did the binding, `None` for any later start frame.
    fn bind_identity(&self, envelope_sid: Option<String>, start: StartFrame) -> Option<String> {
        let mut shared = self.shared.write();
        if shared.state != ConnectionState::Pending {
            return None;
        }

        // Prefer the id inside the start object, fall back to the envelope
        let stream_sid = if start.stream_sid.is_empty() {
            envelope_sid.unwrap_or_default()
        } else {
            start.stream_sid
        };

        shared.identity = StreamIdentity {
            stream_sid: Some(stream_sid.clone()),
            call_sid: Some(start.call_sid),
            account_sid: Some(start.account_sid).filter(|sid| !sid.is_empty()),
            tracks: start.tracks,
            media_format: Some(start.media_format),
            custom_parameters: start.custom_parameters,
        };
        shared.state = ConnectionState::Active;
        Some(stream_sid)
    }

    async fn receive_loop(self: Arc<Self>, mut stream: FrameStream, mut shutdown: watch::Receiver<bool>) {
        debug!(remote_addr = ?self.remote_addr, "receive loop started");

        let termination = loop {
            let next = tokio::select! {
                biased;
                _ = shutdown.wait_for(|stop| *stop) => break Termination::Shutdown,
                next = read_next(&mut stream, self.config.read_timeout) => next,
            };

            let payload = match next {
                Ok(Some(Message::Text(text))) => text.into_bytes(),
                Ok(Some(Message::Binary(data))) => data,
                Ok(Some(Message::Close(frame))) => {
                    break match frame {
                        None => Termination::PeerClosed,
                        Some(frame) if matches!(frame.code, CloseCode::Normal | CloseCode::Away) => {
                            Termination::PeerClosed
                        }
                        Some(frame) => Termination::Failed(StreamError::AbnormalClose {
                            code: frame.code.into(),
                            reason: frame.reason.into_owned(),
                        }),
                    };
                }
                // Ping, pong and raw frames carry nothing for us.
                Ok(Some(_)) => continue,
                Ok(None) => break Termination::PeerClosed,
                Err(StreamError::Transport(
                    tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed,
                )) => break Termination::PeerClosed,
                Err(err) => break Termination::Failed(err),
            };

            if !self.handle_frame(&payload, &mut shutdown).await {
                break Termination::Stopped;
            }
        };

        match termination {
            Termination::Stopped | Termination::Shutdown => {}
            Termination::PeerClosed => {
                self.set_state(ConnectionState::Draining);
                debug!("peer closed the media stream");
                self.emit(StreamEvent::Disconnected, &mut shutdown).await;
            }
            Termination::Failed(err) => {
                self.set_state(ConnectionState::Draining);
                warn!(error = %err, "media stream failed");
                self.emit(StreamEvent::error(err), &mut shutdown).await;
            }
        }

        self.close().await;
    }

    /// Dispatch one inbound frame. Returns `false` when the stream is over.
    async fn handle_frame(self: &Arc<Self>, payload: &[u8], shutdown: &mut watch::Receiver<bool>) -> bool {
        let frame = match codec::decode(payload) {
            Ok(frame) => frame,
            Err(err) => {
                trace!(error = %err, "discarding undecodable frame");
                return true;
            }
        };

        match frame {
            InboundFrame::Connected { .. } => {
                self.emit(StreamEvent::Connected, shutdown).await;
            }
            InboundFrame::Start { stream_sid, start } => {
                let call_sid = start.call_sid.clone();
                match self.bind_identity(stream_sid, start) {
                    Some(stream_sid) => {
                        info!(stream_sid = %stream_sid, call_sid = %call_sid, "media stream started");
                        if let Some(provider) = self.provider.upgrade() {
                            provider.register_stream(&stream_sid, self);
                        }
                        self.emit(StreamEvent::AudioStarted, shutdown).await;
                    }
                    None => debug!("ignoring repeated start frame"),
                }
            }
            InboundFrame::Media { media } => {
                if media.payload.is_empty() {
                    return true;
                }
                match media.decode_payload() {
                    Ok(audio) => {
                        if self.inbound.push(audio) == Admission::Dropped {
                            trace!(chunk = %media.chunk, "inbound buffer full, dropped newest chunk");
                        }
                    }
                    Err(err) => trace!(error = %err, "discarding media chunk"),
                }
            }
            InboundFrame::Dtmf { dtmf } => {
                debug!(digit = %dtmf.digit, "dtmf received");
                self.emit(StreamEvent::Dtmf { digit: dtmf.digit.clone() }, shutdown).await;
                if let Some(provider) = self.provider.upgrade() {
                    provider.dispatch_dtmf(self, &dtmf.digit);
                }
            }
            InboundFrame::Stop { .. } => {
                self.set_state(ConnectionState::Draining);
                info!("media stream stopped by peer");
                self.emit(StreamEvent::AudioStopped, shutdown).await;
                self.emit(StreamEvent::Disconnected, shutdown).await;
                return false;
            }
            InboundFrame::Mark { mark } => {
                trace!(name = %mark.name, "mark acknowledged");
            }
        }
        true
    }

    async fn send_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        loop {
            let chunk = tokio::select! {
                biased;
                _ = shutdown.wait_for(|stop| *stop) => break,
                chunk = self.outbound.read() => chunk,
            };
            // None: buffer closed and drained
            let Some(chunk) = chunk else {
                break;
            };
            if self.is_closed() {
                break;
            }

            let frame = OutboundFrame::media(self.stream_sid().unwrap_or_default(), &chunk);
            if let Err(err) = self.write_frame(&frame).await {
                warn!(error = %err, "failed to write media frame, closing stream");
                self.close().await;
                break;
            }
        }
        debug!("send loop finished");
    }
}

async fn read_next(
    stream: &mut FrameStream,
    deadline: Option<Duration>,
) -> StreamResult<Option<Message>> {
    let next = match deadline {
        Some(limit) => tokio::time::timeout(limit, stream.next())
            .await
            .map_err(|_| StreamError::ReadTimeout(limit))?,
        None => stream.next().await,
    };
    next.transpose().map_err(StreamError::from)
}

async fn with_deadline<F>(deadline: Option<Duration>, op: F) -> StreamResult<()>
where
    F: Future<Output = Result<(), tungstenite::Error>>,
{
    match deadline {
        Some(limit) => tokio::time::timeout(limit, op)
            .await
            .map_err(|_| StreamError::WriteTimeout(limit))?
            .map_err(StreamError::from),
        None => op.await.map_err(StreamError::from),
    }
}
