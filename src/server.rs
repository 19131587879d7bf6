//! # Media Socket Server
//!
//! Accepts TCP connections from the telephony side, performs the WebSocket
//! upgrade and hands each upgraded socket to the [`Provider`]. The request
//! path of the upgrade becomes the connection's logical address, which the
//! provider uses to pick a listener.
//!
//! Upgrades are answered with `503 Service Unavailable` once the provider
//! already holds `max_streams` live connections.

use crate::config::MediaConfig;
use crate::media::Provider;

use anyhow::{Context, Result};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tracing::{debug, info, warn};

/// Upper bound for the HTTP upgrade of a freshly accepted socket.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

pub async fn bind(config: &MediaConfig) -> Result<TcpListener> {
    let addr = config.bind_addr();
    TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind media socket on {}", addr))
}

/// Accept and upgrade sockets until the shutdown signal fires.
pub async fn serve(
    listener: TcpListener,
    provider: Arc<Provider>,
    max_streams: usize,
    mut shutdown: watch::Receiver<bool>,
) {
    if let Ok(addr) = listener.local_addr() {
        info!(%addr, "media socket listening");
    }

    loop {
        let accept = tokio::select! {
            _ = shutdown.wait_for(|stop| *stop) => break,
            res = listener.accept() => res,
        };
        let (stream, peer) = match accept {
            Ok(accepted) => accepted,
            Err(err) => {
                warn!(error = %err, "failed to accept media socket");
                continue;
            }
        };

        let provider = provider.clone();
        tokio::spawn(async move {
            if let Err(err) = upgrade(stream, peer, provider, max_streams).await {
                debug!(%peer, error = %err, "media socket upgrade failed");
            }
        });
    }

    info!("media socket stopped accepting");
}

async fn upgrade(
    stream: TcpStream,
    peer: SocketAddr,
    provider: Arc<Provider>,
    max_streams: usize,
) -> Result<()> {
    stream.set_nodelay(true)?;

    let mut path = String::new();
    let live = provider.live_count();
    let callback = |request: &Request, response: Response| -> Result<Response, ErrorResponse> {
        path = request.uri().path().to_string();
        if live >= max_streams {
            warn!(%peer, live, max_streams, "refusing media stream, limit reached");
            let mut refusal = ErrorResponse::new(Some("too many concurrent streams".to_string()));
            *refusal.status_mut() = StatusCode::SERVICE_UNAVAILABLE;
            return Err(refusal);
        }
        Ok(response)
    };

    let socket = tokio::time::timeout(
        HANDSHAKE_TIMEOUT,
        tokio_tungstenite::accept_hdr_async(stream, callback),
    )
    .await
    .context("websocket handshake timed out")??;

    provider
        .accept(socket, &path, Some(peer))
        .await
        .context("provider refused media stream")?;
    Ok(())
}
