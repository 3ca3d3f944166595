//! WebSocket relay with channel-based routing.
//!
//! Architecture:
//! ```text
//! Client A ──┐
//!             ├── Room (project/file) ── BroadcastGroup ──► Client A, B, C
//! Client B ──┘          │
//!                       └── TextDocument (server replica, outlives the room)
//! ```
//!
//! The relay is a peer like any other: it ingests every update into its own
//! replica, so it can answer `ResyncRequest` and `SnapshotRequest` even when
//! no other client is online. A connection is bound to the channel of the
//! first frame it sends.
//!
//! Reference: Kleppmann, Designing Data-Intensive Applications, Chapter 8

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::{SinkExt, StreamExt};
use tandem_core::{ClientId, DocumentConfig, Replica, TextDocument, UpdateLog};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, Mutex, RwLock};
use tokio::time::MissedTickBehavior;
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use crate::broadcast::{BroadcastGroup, Delivery, PeerInfo, RoomManager};
use crate::protocol::{ChannelId, ControlFrame, Frame, SyncMessage};

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Connections beyond this per channel are refused
    pub max_peers_per_room: usize,
    /// Broadcast channel capacity per room
    pub broadcast_capacity: usize,
    /// Causal buffer tuning for the per-channel replicas
    pub document: DocumentConfig,
    /// How often replicas drop ops stuck without their dependencies
    pub sweep_interval: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            max_peers_per_room: 100,
            broadcast_capacity: 256,
            document: DocumentConfig::default(),
            sweep_interval: Duration::from_secs(1),
        }
    }
}

/// Server statistics.
#[derive(Debug, Clone, Default)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_messages: u64,
    pub total_bytes: u64,
    pub rejected_frames: u64,
    pub active_rooms: usize,
}

/// Per-connection routing state, set by the first frame.
struct Binding {
    client_id: ClientId,
    channel: ChannelId,
    room: Arc<BroadcastGroup>,
    doc: Arc<Mutex<TextDocument>>,
    rx: broadcast::Receiver<Arc<Delivery>>,
    left: bool,
}

/// The relay server. Cheap to clone; clones share rooms and documents.
#[derive(Clone)]
pub struct RelayServer {
    config: ServerConfig,
    server_id: ClientId,
    rooms: Arc<RoomManager>,
    documents: Arc<RwLock<HashMap<ChannelId, Arc<Mutex<TextDocument>>>>>,
    stats: Arc<RwLock<ServerStats>>,
}

impl RelayServer {
    pub fn new(config: ServerConfig) -> Self {
        let rooms = Arc::new(RoomManager::new(config.broadcast_capacity));
        Self {
            config,
            server_id: Uuid::new_v4(),
            rooms,
            documents: Arc::new(RwLock::new(HashMap::new())),
            stats: Arc::new(RwLock::new(ServerStats::default())),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(ServerConfig::default())
    }

    /// Bind the configured address and serve forever.
    pub async fn run(&self) -> Result<(), BoxError> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        self.serve(listener).await
    }

    /// Serve connections from an already bound listener.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), BoxError> {
        log::info!("Relay listening on {}", listener.local_addr()?);
        let mut sweep = tokio::time::interval(self.config.sweep_interval);
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    let (stream, addr) = accepted?;
                    log::debug!("New TCP connection from {addr}");

                    let server = self.clone();
                    tokio::spawn(async move {
                        if let Err(e) = server.handle_connection(stream, addr).await {
                            log::error!("Connection error from {addr}: {e}");
                        }
                    });
                }
                _ = sweep.tick() => {
                    self.sweep_replicas(Instant::now()).await;
                }
            }
        }
    }

    /// Expire stuck buffered ops in every replica.
    ///
    /// A replica that lost ops asks its channel's peers for a resync.
    /// Returns the number of ops dropped.
    pub async fn sweep_replicas(&self, now: Instant) -> usize {
        let documents: Vec<(ChannelId, Arc<Mutex<TextDocument>>)> = self
            .documents
            .read()
            .await
            .iter()
            .map(|(channel, doc)| (channel.clone(), doc.clone()))
            .collect();

        let mut dropped = 0;
        for (channel, doc) in documents {
            let resync_from = {
                let mut doc = doc.lock().await;
                let expired = doc.expire_pending(now);
                if expired > 0 {
                    log::warn!("Replica for {channel} dropped {expired} operations without dependencies");
                    dropped += expired;
                }
                doc.take_resync_needed().then(|| doc.state_vector().clone())
            };
            let Some(state_vector) = resync_from else {
                continue;
            };
            let Some(room) = self.rooms.get(&channel).await else {
                continue;
            };
            let request = SyncMessage::control(
                self.server_id,
                channel.clone(),
                ControlFrame::ResyncRequest { state_vector },
            );
            match request.encode() {
                Ok(bytes) => {
                    log::info!("Replica for {channel} requesting resync from peers");
                    room.broadcast(self.server_id, bytes);
                }
                Err(e) => log::error!("Failed to encode resync request for {channel}: {e}"),
            }
        }
        dropped
    }

    async fn document(&self, channel: &ChannelId) -> Arc<Mutex<TextDocument>> {
        {
            let documents = self.documents.read().await;
            if let Some(doc) = documents.get(channel) {
                return doc.clone();
            }
        }
        let mut documents = self.documents.write().await;
        documents
            .entry(channel.clone())
            .or_insert_with(|| {
                log::info!("Creating server replica for {channel}");
                Arc::new(Mutex::new(TextDocument::with_config(
                    Replica::new(),
                    self.config.document.clone(),
                )))
            })
            .clone()
    }

    async fn join(&self, msg: &SyncMessage) -> Option<Binding> {
        let display_name = match &msg.frame {
            Frame::Control(ControlFrame::Join { display_name }) => display_name.clone(),
            _ => "anonymous".to_string(),
        };
        let info = PeerInfo::new(msg.sender, display_name.clone());
        let Some((room, rx)) = self
            .rooms
            .join(&msg.channel, info, self.config.max_peers_per_room)
            .await
        else {
            log::warn!("Room {} is full, refusing {}", msg.channel, msg.sender);
            return None;
        };
        log::info!("Peer {display_name} ({}) joined {}", msg.sender, msg.channel);

        let doc = self.document(&msg.channel).await;
        {
            let mut stats = self.stats.write().await;
            stats.active_rooms = self.rooms.room_count().await;
        }
        Some(Binding {
            client_id: msg.sender,
            channel: msg.channel.clone(),
            room,
            doc,
            rx,
            left: false,
        })
    }

    /// Apply what the relay needs to know and decide the direct reply.
    async fn route(&self, binding: &mut Binding, msg: &SyncMessage) -> (Option<SyncMessage>, bool) {
        let server_id = self.server_id;
        let channel = binding.channel.clone();
        let reply = |control| Some(SyncMessage::control(server_id, channel.clone(), control));

        match &msg.frame {
            Frame::Update(update) => {
                let mut doc = binding.doc.lock().await;
                UpdateLog::ingest(&mut doc, update.operations.clone());
                (None, true)
            }
            Frame::Control(ControlFrame::ResyncRequest { state_vector }) => {
                let response = {
                    let doc = binding.doc.lock().await;
                    let operations = UpdateLog::diff(&doc, doc.state_vector(), state_vector);
                    log::debug!(
                        "Resync for {} on {channel}: {} operations missing",
                        msg.sender,
                        operations.len()
                    );
                    ControlFrame::ResyncResponse {
                        to: msg.sender,
                        state_vector: doc.state_vector().clone(),
                        operations,
                    }
                };
                // Peers may hold operations the relay has not seen yet.
                (reply(response), true)
            }
            Frame::Control(ControlFrame::ResyncResponse { operations, .. }) => {
                let mut doc = binding.doc.lock().await;
                UpdateLog::ingest(&mut doc, operations.clone());
                (None, true)
            }
            Frame::Control(ControlFrame::SnapshotRequest) => {
                let snapshot = binding.doc.lock().await.snapshot();
                log::info!("Serving snapshot of {channel} to {}", msg.sender);
                (reply(ControlFrame::SnapshotResponse { to: msg.sender, snapshot }), false)
            }
            Frame::Control(ControlFrame::Ping) => (reply(ControlFrame::Pong), false),
            Frame::Control(ControlFrame::Pong) => (None, false),
            Frame::Control(ControlFrame::Leave) => {
                binding.left = true;
                (None, true)
            }
            Frame::Control(_) | Frame::Awareness(_) => (None, true),
        }
    }

    /// Handle a single WebSocket connection.
    async fn handle_connection(&self, stream: TcpStream, addr: SocketAddr) -> Result<(), BoxError> {
        let ws_stream = tokio_tungstenite::accept_async(stream).await?;
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();

        log::info!("WebSocket connection established from {addr}");
        {
            let mut stats = self.stats.write().await;
            stats.total_connections += 1;
            stats.active_connections += 1;
        }

        let mut binding: Option<Binding> = None;

        loop {
            tokio::select! {
                msg = ws_receiver.next() => match msg {
                    Some(Ok(Message::Binary(data))) => {
                        let bytes: Vec<u8> = data.into();
                        let msg = match SyncMessage::decode(&bytes) {
                            Ok(msg) => msg,
                            Err(e) => {
                                log::warn!("Dropping malformed frame from {addr}: {e}");
                                self.stats.write().await.rejected_frames += 1;
                                continue;
                            }
                        };
                        {
                            let mut stats = self.stats.write().await;
                            stats.total_messages += 1;
                            stats.total_bytes += bytes.len() as u64;
                        }

                        if binding.is_none() {
                            binding = self.join(&msg).await;
                            if binding.is_none() {
                                let _ = ws_sender.send(Message::Close(None)).await;
                                break;
                            }
                        }
                        let Some(bound) = binding.as_mut() else { break };
                        if msg.channel != bound.channel || msg.sender != bound.client_id {
                            log::warn!(
                                "Frame for {} from {} does not match connection ({} on {})",
                                msg.channel, msg.sender, bound.client_id, bound.channel
                            );
                            self.stats.write().await.rejected_frames += 1;
                            continue;
                        }

                        log::trace!("{} from {} on {}", msg.frame.label(), msg.sender, bound.channel);
                        let (reply, forward) = self.route(bound, &msg).await;
                        if let Some(reply) = reply {
                            let sent = match reply.encode() {
                                Ok(encoded) => ws_sender.send(Message::Binary(encoded.into())).await,
                                Err(e) => {
                                    log::error!("Failed to encode {} for {addr}: {e}", reply.frame.label());
                                    Ok(())
                                }
                            };
                            if let Err(e) = sent {
                                log::warn!("Send to {addr} failed: {e}");
                                break;
                            }
                        }
                        if forward {
                            bound.room.broadcast(bound.client_id, bytes);
                        }
                    }

                    Some(Ok(Message::Close(_))) | None => {
                        log::info!("Connection closed from {addr}");
                        break;
                    }

                    Some(Ok(Message::Ping(data))) => {
                        if ws_sender.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }

                    Some(Err(e)) => {
                        log::error!("WebSocket error from {addr}: {e}");
                        break;
                    }

                    Some(Ok(_)) => {}
                },

                delivery = async {
                    match binding.as_mut() {
                        Some(bound) => bound.rx.recv().await,
                        None => std::future::pending().await,
                    }
                } => match delivery {
                    Ok(delivery) => {
                        if binding.as_ref().is_some_and(|b| b.client_id == delivery.origin) {
                            continue;
                        }
                        if let Err(e) = ws_sender.send(Message::Binary(delivery.bytes.clone().into())).await {
                            log::warn!("Send to {addr} failed: {e}");
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        // Closing makes the client reconnect and resync.
                        log::warn!("Peer at {addr} lagged by {n} frames, closing");
                        let _ = ws_sender.send(Message::Close(None)).await;
                        break;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
            }
        }

        if let Some(bound) = binding {
            self.leave(bound).await;
        }
        self.stats.write().await.active_connections -= 1;
        Ok(())
    }

    async fn leave(&self, bound: Binding) {
        bound.room.remove_peer(&bound.client_id).await;
        if !bound.left {
            let leave = SyncMessage::control(bound.client_id, bound.channel.clone(), ControlFrame::Leave);
            match leave.encode() {
                Ok(bytes) => {
                    bound.room.broadcast(bound.client_id, bytes);
                }
                Err(e) => log::error!("Failed to encode leave for {}: {e}", bound.client_id),
            }
        }
        log::info!("Peer {} left {}", bound.client_id, bound.channel);

        drop(bound.rx);
        self.rooms.remove_if_empty(&bound.channel).await;
        let active_rooms = self.rooms.room_count().await;
        self.stats.write().await.active_rooms = active_rooms;
    }

    pub async fn stats(&self) -> ServerStats {
        self.stats.read().await.clone()
    }

    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    /// Sender id the relay stamps on its own replies.
    pub fn server_id(&self) -> ClientId {
        self.server_id
    }

    pub async fn room_count(&self) -> usize {
        self.rooms.room_count().await
    }

    /// Text of the relay's replica of `channel`, if it has one.
    pub async fn document_text(&self, channel: &ChannelId) -> Option<String> {
        let doc = self.documents.read().await.get(channel).cloned()?;
        let text = doc.lock().await.visible_text();
        Some(text)
    }
}
