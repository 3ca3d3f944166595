//! Transport abstraction, reconnect backoff and the in-process hub.
//!
//! ```text
//!            send(bytes)                      UnboundedReceiver<TransportEvent>
//! Session ───────────────► Transport ───────► Status(Connecting|Connected|Disconnected)
//!                              │               Frame(bytes)
//!                              │               Lagged(n)
//!                    ┌─────────┴─────────┐
//!               MemoryTransport      WsTransport
//!               (MemoryHub rooms)    (relay server, reconnect loop)
//! ```
//!
//! A transport only promises best-effort delivery, ordered within one
//! connection. Duplicates, reordering across reconnects and gaps are
//! handled by the document and the resync handshake.

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tandem_core::ClientId;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, watch};
use uuid::Uuid;

use crate::broadcast::{BroadcastGroup, Delivery, PeerInfo, RoomManager};
use crate::protocol::ChannelId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportStatus {
    Connecting,
    Connected,
    Disconnected,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Status(TransportStatus),
    Frame(Vec<u8>),
    /// Frames were dropped for this subscriber; state must be resynced.
    Lagged(u64),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("not connected")]
    NotConnected,

    #[error("transport channel closed")]
    ChannelClosed,

    #[error("websocket error: {0}")]
    WebSocket(String),
}

/// A bidirectional channel for one `(project, file)` pair.
pub trait Transport: Send + 'static {
    /// Start connecting; events (status changes first) arrive on the
    /// returned receiver until `disconnect`.
    fn connect(&mut self, channel: &ChannelId) -> mpsc::UnboundedReceiver<TransportEvent>;

    /// Queue bytes for the peers on the channel.
    fn send(&self, bytes: Vec<u8>) -> Result<(), TransportError>;

    fn disconnect(&mut self);

    fn status(&self) -> TransportStatus;
}

// ───────────────────────────────────────────────────────────────────
// Backoff
// ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct BackoffConfig {
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
    /// Fraction of the delay randomly added or removed (0.0 to 1.0).
    pub jitter: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(10),
            multiplier: 2.0,
            jitter: 0.2,
        }
    }
}

/// Exponential backoff with jitter, reset after a successful connect.
#[derive(Debug, Clone)]
pub struct Backoff {
    config: BackoffConfig,
    attempt: u32,
}

impl Backoff {
    pub fn new(config: BackoffConfig) -> Self {
        Self { config, attempt: 0 }
    }

    /// Delay before the next attempt; advances the attempt counter.
    pub fn next_delay(&mut self) -> Duration {
        let exponent = self.attempt.min(32) as i32;
        self.attempt = self.attempt.saturating_add(1);

        let base = self.config.base_delay.as_secs_f64();
        let max = self.config.max_delay.as_secs_f64();
        let delay = (base * self.config.multiplier.powi(exponent)).min(max);

        let jitter = self.config.jitter.clamp(0.0, 1.0);
        let factor = if jitter > 0.0 {
            1.0 + rand::thread_rng().gen_range(-jitter..=jitter)
        } else {
            1.0
        };
        Duration::from_secs_f64((delay * factor).max(0.0))
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }
}

// ───────────────────────────────────────────────────────────────────
// In-process hub
// ───────────────────────────────────────────────────────────────────

/// Routes frames between transports in the same process.
#[derive(Clone)]
pub struct MemoryHub {
    rooms: Arc<RoomManager>,
}

impl MemoryHub {
    pub fn new() -> Self {
        Self::with_capacity(1024)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            rooms: Arc::new(RoomManager::new(capacity)),
        }
    }

    /// A new, not yet connected endpoint.
    pub fn transport(&self) -> MemoryTransport {
        let (link, _) = watch::channel(LinkState::Online);
        let (status_tx, status_rx) = watch::channel(TransportStatus::Disconnected);
        MemoryTransport {
            rooms: self.rooms.clone(),
            origin: Uuid::new_v4(),
            link: Arc::new(link),
            status_tx: Arc::new(status_tx),
            status_rx,
            outgoing: None,
        }
    }

    pub async fn room_count(&self) -> usize {
        self.rooms.room_count().await
    }
}

impl Default for MemoryHub {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LinkState {
    Online,
    Offline,
}

/// Remote control for a memory transport's simulated network link.
#[derive(Clone)]
pub struct LinkSwitch {
    link: Arc<watch::Sender<LinkState>>,
}

impl LinkSwitch {
    pub fn go_offline(&self) {
        self.link.send_replace(LinkState::Offline);
    }

    pub fn go_online(&self) {
        self.link.send_replace(LinkState::Online);
    }

    pub fn is_online(&self) -> bool {
        *self.link.borrow() == LinkState::Online
    }
}

/// Endpoint on a [`MemoryHub`].
pub struct MemoryTransport {
    rooms: Arc<RoomManager>,
    origin: ClientId,
    link: Arc<watch::Sender<LinkState>>,
    status_tx: Arc<watch::Sender<TransportStatus>>,
    status_rx: watch::Receiver<TransportStatus>,
    outgoing: Option<mpsc::UnboundedSender<Vec<u8>>>,
}

impl MemoryTransport {
    /// Handle for simulating network loss.
    pub fn link_switch(&self) -> LinkSwitch {
        LinkSwitch {
            link: self.link.clone(),
        }
    }
}

struct MemoryLink {
    rooms: Arc<RoomManager>,
    channel: ChannelId,
    origin: ClientId,
    link: watch::Receiver<LinkState>,
    status: Arc<watch::Sender<TransportStatus>>,
    outgoing: mpsc::UnboundedReceiver<Vec<u8>>,
    events: mpsc::UnboundedSender<TransportEvent>,
}

enum Phase {
    Reconnect,
    Shutdown,
}

impl MemoryLink {
    fn set_status(&self, status: TransportStatus) -> bool {
        self.status.send_replace(status);
        self.events.send(TransportEvent::Status(status)).is_ok()
    }

    async fn run(mut self) {
        loop {
            // Offline: drop outgoing frames until the link comes back.
            while *self.link.borrow_and_update() != LinkState::Online {
                tokio::select! {
                    changed = self.link.changed() => {
                        if changed.is_err() {
                            return;
                        }
                    }
                    frame = self.outgoing.recv() => {
                        if frame.is_none() {
                            return;
                        }
                    }
                }
            }

            if !self.set_status(TransportStatus::Connecting) {
                return;
            }
            let info = PeerInfo::new(self.origin, "memory");
            let Some((room, mut rx)) = self.rooms.join(&self.channel, info, usize::MAX).await else {
                return;
            };
            if !self.set_status(TransportStatus::Connected) {
                room.remove_peer(&self.origin).await;
                return;
            }
            log::debug!("Memory transport {} joined {}", self.origin, self.channel);

            let phase = self.pump(&room, &mut rx).await;

            room.remove_peer(&self.origin).await;
            drop(rx);
            self.rooms.remove_if_empty(&self.channel).await;

            match phase {
                Phase::Shutdown => return,
                Phase::Reconnect => {
                    log::debug!("Memory transport {} went offline", self.origin);
                    if !self.set_status(TransportStatus::Disconnected) {
                        return;
                    }
                }
            }
        }
    }

    async fn pump(
        &mut self,
        room: &BroadcastGroup,
        rx: &mut broadcast::Receiver<Arc<Delivery>>,
    ) -> Phase {
        loop {
            tokio::select! {
                // Queued frames drain before the link can shut down.
                biased;

                frame = self.outgoing.recv() => match frame {
                    Some(bytes) => {
                        room.broadcast(self.origin, bytes);
                    }
                    None => return Phase::Shutdown,
                },
                changed = self.link.changed() => {
                    if changed.is_err() {
                        return Phase::Shutdown;
                    }
                    if *self.link.borrow_and_update() != LinkState::Online {
                        return Phase::Reconnect;
                    }
                }
                delivery = rx.recv() => match delivery {
                    Ok(delivery) => {
                        if delivery.origin == self.origin {
                            continue;
                        }
                        if self.events.send(TransportEvent::Frame(delivery.bytes.clone())).is_err() {
                            return Phase::Shutdown;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        log::warn!("Memory transport {} lagged by {n} frames", self.origin);
                        if self.events.send(TransportEvent::Lagged(n)).is_err() {
                            return Phase::Shutdown;
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => return Phase::Shutdown,
                },
            }
        }
    }
}

impl Transport for MemoryTransport {
    fn connect(&mut self, channel: &ChannelId) -> mpsc::UnboundedReceiver<TransportEvent> {
        self.disconnect();

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        self.outgoing = Some(out_tx);

        let link = MemoryLink {
            rooms: self.rooms.clone(),
            channel: channel.clone(),
            origin: self.origin,
            link: self.link.subscribe(),
            status: self.status_tx.clone(),
            outgoing: out_rx,
            events: events_tx,
        };
        tokio::spawn(link.run());
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
        // Dropping the sender ends the link task, which leaves the room.
        self.outgoing = None;
        self.status_tx.send_replace(TransportStatus::Disconnected);
    }

    fn status(&self) -> TransportStatus {
        *self.status_rx.borrow()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::timeout;

    const WAIT: Duration = Duration::from_secs(2);

    async fn wait_for_status(
        rx: &mut mpsc::UnboundedReceiver<TransportEvent>,
        wanted: TransportStatus,
    ) {
        loop {
            match timeout(WAIT, rx.recv()).await.unwrap().unwrap() {
                TransportEvent::Status(status) if status == wanted => return,
                _ => continue,
            }
        }
    }

    async fn next_frame(rx: &mut mpsc::UnboundedReceiver<TransportEvent>) -> Vec<u8> {
        loop {
            match timeout(WAIT, rx.recv()).await.unwrap().unwrap() {
                TransportEvent::Frame(bytes) => return bytes,
                _ => continue,
            }
        }
    }

    // ── Backoff tests ────────────────────────────────────────────

    #[test]
    fn test_backoff_grows_and_caps() {
        let mut backoff = Backoff::new(BackoffConfig {
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(1000),
            multiplier: 2.0,
            jitter: 0.0,
        });
        let delays: Vec<u128> = (0..6).map(|_| backoff.next_delay().as_millis()).collect();
        assert_eq!(delays, vec![100, 200, 400, 800, 1000, 1000]);
        assert_eq!(backoff.attempt(), 6);

        backoff.reset();
        assert_eq!(backoff.next_delay().as_millis(), 100);
    }

    #[test]
    fn test_backoff_jitter_bounds() {
        let mut backoff = Backoff::new(BackoffConfig {
            base_delay: Duration::from_millis(1000),
            max_delay: Duration::from_secs(60),
            multiplier: 1.0,
            jitter: 0.25,
        });
        for _ in 0..100 {
            let delay = backoff.next_delay();
            assert!(delay >= Duration::from_millis(750), "{delay:?} below jitter floor");
            assert!(delay <= Duration::from_millis(1250), "{delay:?} above jitter ceiling");
        }
    }

    // ── Memory transport tests ───────────────────────────────────

    #[tokio::test]
    async fn test_memory_transport_exchange() {
        let hub = MemoryHub::new();
        let channel = ChannelId::new("p", "f");
        let mut a = hub.transport();
        let mut b = hub.transport();

        let mut rx_a = a.connect(&channel);
        let mut rx_b = b.connect(&channel);
        wait_for_status(&mut rx_a, TransportStatus::Connected).await;
        wait_for_status(&mut rx_b, TransportStatus::Connected).await;
        assert_eq!(a.status(), TransportStatus::Connected);

        a.send(vec![1, 2, 3]).unwrap();
        assert_eq!(next_frame(&mut rx_b).await, vec![1, 2, 3]);

        // No echo back to the sender.
        b.send(vec![9]).unwrap();
        assert_eq!(next_frame(&mut rx_a).await, vec![9]);
    }

    #[tokio::test]
    async fn test_channels_are_isolated() {
        let hub = MemoryHub::new();
        let mut a = hub.transport();
        let mut b = hub.transport();
        let mut c = hub.transport();

        let mut rx_a = a.connect(&ChannelId::new("p", "one"));
        let mut rx_b = b.connect(&ChannelId::new("p", "two"));
        let mut rx_c = c.connect(&ChannelId::new("p", "one"));
        wait_for_status(&mut rx_a, TransportStatus::Connected).await;
        wait_for_status(&mut rx_b, TransportStatus::Connected).await;
        wait_for_status(&mut rx_c, TransportStatus::Connected).await;

        a.send(vec![7]).unwrap();
        assert_eq!(next_frame(&mut rx_c).await, vec![7]);
        assert!(timeout(Duration::from_millis(100), next_frame_or_none(&mut rx_b)).await.is_err());
    }

    async fn next_frame_or_none(rx: &mut mpsc::UnboundedReceiver<TransportEvent>) -> Option<Vec<u8>> {
        loop {
            match rx.recv().await? {
                TransportEvent::Frame(bytes) => return Some(bytes),
                _ => continue,
            }
        }
    }

    #[tokio::test]
    async fn test_offline_and_back() {
        let hub = MemoryHub::new();
        let channel = ChannelId::new("p", "f");
        let mut a = hub.transport();
        let mut b = hub.transport();
        let switch = a.link_switch();

        let mut rx_a = a.connect(&channel);
        let mut rx_b = b.connect(&channel);
        wait_for_status(&mut rx_a, TransportStatus::Connected).await;
        wait_for_status(&mut rx_b, TransportStatus::Connected).await;

        switch.go_offline();
        wait_for_status(&mut rx_a, TransportStatus::Disconnected).await;
        assert_eq!(a.send(vec![1]), Err(TransportError::NotConnected));

        switch.go_online();
        wait_for_status(&mut rx_a, TransportStatus::Connected).await;
        a.send(vec![2]).unwrap();
        assert_eq!(next_frame(&mut rx_b).await, vec![2]);
    }

    #[tokio::test]
    async fn test_disconnect_leaves_room() {
        let hub = MemoryHub::new();
        let mut a = hub.transport();
        let mut rx = a.connect(&ChannelId::new("p", "f"));
        wait_for_status(&mut rx, TransportStatus::Connected).await;
        assert_eq!(hub.room_count().await, 1);

        a.disconnect();
        assert_eq!(a.status(), TransportStatus::Disconnected);
        timeout(WAIT, async {
            while hub.room_count().await != 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
    }
}
