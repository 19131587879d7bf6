//! # Bridge Driver
//!
//! The application side of the media layer. The bridge listens on the
//! configured media path, opens a [`CallSession`] for every connection the
//! provider hands over and drives it until the call ends:
//!
//! - lifecycle events update the session status
//! - caller audio is counted and, in echo mode, written straight back
//! - DTMF digits are recorded through the provider's DTMF callback
//!
//! Echo mode is read from the live configuration for every chunk, so
//! toggling it through the admin API affects calls already in progress.

use crate::config::AppConfig;
use crate::media::{Connection, ConnectionStream, Provider, StreamEvent, StreamResult};
use crate::session::{CallSession, SessionManager};
use crate::state::AppState;

use chrono::Duration as ChronoDuration;
use futures_util::StreamExt;
use parking_lot::RwLock;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn, Instrument};

#[derive(Clone)]
pub struct Bridge {
    provider: Arc<Provider>,
    sessions: Arc<SessionManager>,
    config: Arc<RwLock<AppConfig>>,
}

impl Bridge {
    pub fn new(state: &AppState) -> Self {
        Self {
            provider: state.provider.clone(),
            sessions: state.sessions.clone(),
            config: state.config.clone(),
        }
    }

    fn echo_enabled(&self) -> bool {
        self.config.read().media.echo
    }

    /// Record every DTMF digit on the session of the connection it came from.
    ///
    /// Digits can arrive before the driver task has picked the connection
    /// up, so the callback opens the session itself when needed.
    pub fn install_dtmf_recorder(&self) {
        let sessions = self.sessions.clone();
        self.provider.on_dtmf(move |conn: &Arc<Connection>, digit: &str| {
            match sessions.open_session(conn.local_id(), conn.listener_path(), conn.remote_addr()) {
                Ok(session) => session.record_dtmf(digit),
                Err(err) => debug!(local_id = %conn.local_id(), digit, error = %err, "dtmf not recorded"),
            }
        });
    }

    pub fn listen(&self, path: &str) -> StreamResult<ConnectionStream> {
        let incoming = self.provider.listen(path)?;
        info!(path, "bridge listening for media streams");
        Ok(incoming)
    }

    /// Drive every connection from `incoming` until shutdown or until the
    /// provider ends the stream.
    pub async fn serve(&self, mut incoming: ConnectionStream, mut shutdown: watch::Receiver<bool>) {
        loop {
            let next = tokio::select! {
                _ = shutdown.wait_for(|stop| *stop) => break,
                next = incoming.next() => next,
            };
            let Some(conn) = next else {
                break;
            };

            let span = tracing::info_span!("call", local_id = %conn.local_id());
            tokio::spawn(self.clone().drive(conn).instrument(span));
        }
        info!("bridge listener stopped");
    }

    pub async fn run_listener(&self, path: &str, shutdown: watch::Receiver<bool>) -> StreamResult<()> {
        let incoming = self.listen(path)?;
        self.serve(incoming, shutdown).await;
        Ok(())
    }

    async fn drive(self, conn: Arc<Connection>) {
        let session = match self
            .sessions
            .open_session(conn.local_id(), conn.listener_path(), conn.remote_addr())
        {
            Ok(session) => session,
            Err(err) => {
                warn!(error = %err, "refusing media stream");
                conn.close().await;
                return;
            }
        };

        tokio::join!(
            self.pump_audio(&conn, &session),
            self.watch_events(&conn, &session)
        );

        // Connection is gone; keep whatever outcome the events recorded.
        session.finish();
        let summary = session.summary();
        info!(
            stream_sid = summary.stream_sid.as_deref().unwrap_or(""),
            status = summary.status.as_str(),
            inbound_chunks = summary.inbound_chunks,
            outbound_chunks = summary.outbound_chunks,
            duration_seconds = summary.duration_seconds,
            "call finished"
        );
    }

    async fn pump_audio(&self, conn: &Connection, session: &CallSession) {
        let mut echoing = true;
        while let Some(chunk) = conn.recv_audio().await {
            session.record_inbound(chunk.len());
            if !echoing || !self.echo_enabled() {
                continue;
            }
            match conn.send_audio(chunk) {
                Ok(()) => session.record_outbound(),
                Err(err) => {
                    debug!(error = %err, "echo stopped");
                    echoing = false;
                }
            }
        }
    }

    async fn watch_events(&self, conn: &Connection, session: &CallSession) {
        while let Some(event) = conn.next_event().await {
            let terminal = event.is_terminal();
            match event {
                StreamEvent::Connected => debug!("telephony side connected"),
                StreamEvent::AudioStarted => {
                    session.mark_streaming(conn.stream_sid(), conn.call_sid());
                    info!(
                        stream_sid = conn.stream_sid().as_deref().unwrap_or(""),
                        call_sid = conn.call_sid().as_deref().unwrap_or(""),
                        "call streaming"
                    );
                }
                StreamEvent::Dtmf { digit } => debug!(digit = %digit, "caller pressed a key"),
                StreamEvent::AudioStopped => info!("call audio stopped"),
                StreamEvent::Disconnected => session.finish(),
                StreamEvent::Error { cause } => {
                    warn!(error = %cause, "call failed");
                    session.fail(cause.to_string());
                }
            }
            if terminal {
                break;
            }
        }
    }
}

/// Periodically drop sessions that ended more than `max_age` ago.
pub async fn reap_sessions(
    sessions: Arc<SessionManager>,
    every: Duration,
    max_age: ChronoDuration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(every);
    loop {
        tokio::select! {
            _ = shutdown.wait_for(|stop| *stop) => break,
            _ = ticker.tick() => {
                let removed = sessions.cleanup_finished(max_age);
                if removed > 0 {
                    debug!(removed, "removed finished call sessions");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::socket::testing::socket_pair;
    use crate::session::SessionStatus;
    use futures_util::SinkExt;
    use serde_json::{json, Value};
    use tokio_tungstenite::tungstenite::Message;

    async fn wait_until(mut done: impl FnMut() -> bool) {
        tokio::time::timeout(Duration::from_secs(2), async {
            while !done() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("condition not reached in time");
    }

    fn spawn_bridge(echo: bool) -> (AppState, watch::Sender<bool>) {
        let mut config = AppConfig::default();
        config.media.echo = echo;
        let state = AppState::from_config(config);
        let bridge = Bridge::new(&state);
        bridge.install_dtmf_recorder();

        let incoming = bridge.listen("/media-stream").unwrap();
        let (stop, shutdown) = watch::channel(false);
        tokio::spawn(async move { bridge.serve(incoming, shutdown).await });
        (state, stop)
    }

    #[tokio::test]
    async fn test_call_is_tracked_from_start_to_stop() {
        let (state, stop) = spawn_bridge(false);

        let (server, mut client) = socket_pair().await;
        let conn = state.provider.accept(server, "/media-stream", None).await.unwrap();

        let frames = [
            json!({"event": "connected"}),
            json!({"event": "start", "start": {"streamSid": "MZ-bridge", "callSid": "CA-bridge"}}),
            json!({"event": "media", "media": {"payload": "AQID"}}),
            json!({"event": "dtmf", "dtmf": {"digit": "9"}}),
            json!({"event": "stop"}),
        ];
        for frame in frames {
            client.send(Message::Text(frame.to_string())).await.unwrap();
        }

        wait_until(|| {
            state
                .sessions
                .get_session(&conn.local_id())
                .map(|s| s.status() == SessionStatus::Stopped)
                .unwrap_or(false)
        })
        .await;

        let session = state.sessions.get_session(&conn.local_id()).unwrap().summary();
        assert_eq!(session.stream_sid.as_deref(), Some("MZ-bridge"));
        assert_eq!(session.call_sid.as_deref(), Some("CA-bridge"));
        assert_eq!(session.digits, "9");
        assert_eq!(session.inbound_chunks, 1);
        assert_eq!(session.inbound_bytes, 3);
        assert_eq!(session.outbound_chunks, 0);

        stop.send_replace(true);
    }

    #[tokio::test]
    async fn test_echo_mode_sends_caller_audio_back() {
        let (state, stop) = spawn_bridge(true);

        let (server, mut client) = socket_pair().await;
        state.provider.accept(server, "/media-stream", None).await.unwrap();

        let start = json!({"event": "start", "start": {"streamSid": "MZ-echo", "callSid": "CA-echo"}});
        client.send(Message::Text(start.to_string())).await.unwrap();
        let media = json!({"event": "media", "media": {"payload": "AQID"}});
        client.send(Message::Text(media.to_string())).await.unwrap();

        let message = tokio::time::timeout(Duration::from_secs(2), client.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        let frame: Value = serde_json::from_str(message.to_text().unwrap()).unwrap();
        assert_eq!(frame["event"], "media");
        assert_eq!(frame["streamSid"], "MZ-echo");
        assert_eq!(frame["media"]["payload"], "AQID");

        stop.send_replace(true);
        state.provider.close().await;
    }

    #[tokio::test]
    async fn test_failed_call_records_cause() {
        let (state, stop) = spawn_bridge(false);

        let (server, client) = socket_pair().await;
        let conn = state.provider.accept(server, "/media-stream", None).await.unwrap();
        drop(client);

        wait_until(|| {
            state
                .sessions
                .get_session(&conn.local_id())
                .map(|s| s.status().is_finished())
                .unwrap_or(false)
        })
        .await;
        assert!(matches!(
            state.sessions.get_session(&conn.local_id()).unwrap().status(),
            SessionStatus::Failed(_)
        ));
        stop.send_replace(true);
    }

    #[tokio::test]
    async fn test_reaper_stops_on_shutdown() {
        let sessions = Arc::new(SessionManager::new(4));
        let (stop, shutdown) = watch::channel(false);
        let reaper = tokio::spawn(reap_sessions(
            sessions,
            Duration::from_millis(10),
            ChronoDuration::zero(),
            shutdown,
        ));
        stop.send_replace(true);
        tokio::time::timeout(Duration::from_secs(1), reaper).await.unwrap().unwrap();
    }
}
