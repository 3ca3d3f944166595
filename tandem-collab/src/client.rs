//! WebSocket transport to a relay server.
//!
//! One supervisor task per connection:
//! ```text
//!            ┌──────────────────────────────────────────────┐
//!            ▼                                              │
//!   Connecting ──connect_async(url/project/file)──► Connected ──socket error──┐
//!        │ fail                                        │                      │
//!        ▼                                             │ disconnect()         │
//!   Disconnected ──sleep(backoff with jitter)──────────┼──────────────────────┘
//!                                                      ▼
//!                                                    closed
//! ```
//!
//! Frames queued while not connected are dropped; the session's resync
//! handshake on the next `Connected` recovers them from the document.
//!
//! Reference: Kleppmann, Designing Data-Intensive Applications, Chapter 8

use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use crate::protocol::ChannelId;
use crate::transport::{
    Backoff, BackoffConfig, Transport, TransportError, TransportEvent, TransportStatus,
};

/// Transport over a WebSocket to `{url}/{project_id}/{file_id}`.
pub struct WsTransport {
    url: String,
    backoff: BackoffConfig,
    ping_interval: Duration,
    status_tx: Arc<watch::Sender<TransportStatus>>,
    status_rx: watch::Receiver<TransportStatus>,
    outgoing: Option<mpsc::UnboundedSender<Vec<u8>>>,
}

impl WsTransport {
    /// `url` is the server base, e.g. `ws://127.0.0.1:9090`.
    pub fn new(url: impl Into<String>) -> Self {
        Self::with_config(url, BackoffConfig::default(), Duration::from_secs(15))
    }

    pub fn with_config(url: impl Into<String>, backoff: BackoffConfig, ping_interval: Duration) -> Self {
        let (status_tx, status_rx) = watch::channel(TransportStatus::Disconnected);
        Self {
            url: url.into().trim_end_matches('/').to_string(),
            backoff,
            ping_interval,
            status_tx: Arc::new(status_tx),
            status_rx,
            outgoing: None,
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

enum Phase {
    Reconnect,
    Shutdown,
}

struct Supervisor {
    url: String,
    backoff: Backoff,
    ping_interval: Duration,
    status: Arc<watch::Sender<TransportStatus>>,
    outgoing: mpsc::UnboundedReceiver<Vec<u8>>,
    events: mpsc::UnboundedSender<TransportEvent>,
}

impl Supervisor {
    fn set_status(&self, status: TransportStatus) -> bool {
        self.status.send_replace(status);
        self.events.send(TransportEvent::Status(status)).is_ok()
    }

    async fn run(mut self) {
        loop {
            if !self.set_status(TransportStatus::Connecting) {
                return;
            }

            let connect = tokio_tungstenite::connect_async(self.url.clone());
            tokio::pin!(connect);
            let result = loop {
                tokio::select! {
                    result = &mut connect => break result,
                    frame = self.outgoing.recv() => {
                        if frame.is_none() {
                            return;
                        }
                        log::trace!("Dropping frame queued while connecting");
                    }
                }
            };

            match result {
                Ok((ws, _)) => {
                    self.backoff.reset();
                    log::info!("Connected to {}", self.url);
                    if !self.set_status(TransportStatus::Connected) {
                        return;
                    }
                    if let Phase::Shutdown = self.pump(ws).await {
                        return;
                    }
                    log::info!("Connection to {} lost", self.url);
                }
                Err(e) => {
                    let err = TransportError::WebSocket(e.to_string());
                    log::warn!("Connect to {} failed: {err}", self.url);
                }
            }

            if !self.set_status(TransportStatus::Disconnected) {
                return;
            }

            let delay = self.backoff.next_delay();
            log::debug!("Reconnecting to {} in {delay:?} (attempt {})", self.url, self.backoff.attempt());
            let sleep = tokio::time::sleep(delay);
            tokio::pin!(sleep);
            loop {
                tokio::select! {
                    _ = &mut sleep => break,
                    frame = self.outgoing.recv() => {
                        if frame.is_none() {
                            return;
                        }
                    }
                }
            }
        }
    }

    async fn pump(&mut self, ws: WebSocketStream<MaybeTlsStream<TcpStream>>) -> Phase {
        let (mut sink, mut stream) = ws.split();
        let mut ping = tokio::time::interval(self.ping_interval);
        ping.tick().await;

        loop {
            tokio::select! {
                biased;

                frame = self.outgoing.recv() => match frame {
                    Some(bytes) => {
                        if let Err(e) = sink.send(Message::Binary(bytes.into())).await {
                            log::warn!("Send to {} failed: {e}", self.url);
                            return Phase::Reconnect;
                        }
                    }
                    None => {
                        let _ = sink.send(Message::Close(None)).await;
                        return Phase::Shutdown;
                    }
                },

                msg = stream.next() => match msg {
                    Some(Ok(Message::Binary(data))) => {
                        if self.events.send(TransportEvent::Frame(data.into())).is_err() {
                            let _ = sink.send(Message::Close(None)).await;
                            return Phase::Shutdown;
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        if sink.send(Message::Pong(data)).await.is_err() {
                            return Phase::Reconnect;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => return Phase::Reconnect,
                    Some(Err(e)) => {
                        log::warn!("WebSocket error from {}: {e}", self.url);
                        return Phase::Reconnect;
                    }
                    Some(Ok(_)) => {}
                },

                _ = ping.tick() => {
                    if sink.send(Message::Ping(Vec::new().into())).await.is_err() {
                        return Phase::Reconnect;
                    }
                }
            }
        }
    }
}

impl Transport for WsTransport {
    fn connect(&mut self, channel: &ChannelId) -> mpsc::UnboundedReceiver<TransportEvent> {
        self.disconnect();

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        self.outgoing = Some(out_tx);

        let supervisor = Supervisor {
            url: format!("{}/{}", self.url, channel.path()),
            backoff: Backoff::new(self.backoff.clone()),
            ping_interval: self.ping_interval,
            status: self.status_tx.clone(),
            outgoing: out_rx,
            events: events_tx,
        };
        tokio::spawn(supervisor.run());
        events_rx
    }

    fn send(&self, bytes: Vec<u8>) -> Result<(), TransportError> {
        if self.status() != TransportStatus::Connected {
            return Err(TransportError::NotConnected);
        }
        match &self.outgoing {
            Some(tx) => tx.send(bytes).map_err(|_| TransportError::ChannelClosed),
            None => Err(TransportError::NotConnected),
        }
    }

    fn disconnect(&mut self) {
        self.outgoing = None;
        self.status_tx.send_replace(TransportStatus::Disconnected);
    }

    fn status(&self) -> TransportStatus {
        *self.status_rx.borrow()
    }
}

impl Drop for WsTransport {
    fn drop(&mut self) {
        self.disconnect();
    }
}
