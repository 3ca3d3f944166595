//! Awareness registry: who is here, where their cursor is.
//!
//! ## Architecture
//!
//! ```text
//! Local caret move
//!       │
//!       ▼
//! AwarenessRegistry::set_local()
//!       │  (throttled: one broadcast per 50ms, rest coalesced)
//!       ▼
//! AwarenessFrame ──► Transport ──► remote AwarenessRegistry::on_remote()
//!                                          │  (LWW by updated_at)
//!                                          ▼
//!                                   AwarenessEvent::Updated / Removed
//!                                          │
//!                                          ▼
//!                               EditorBinding decorations, FollowController
//! ```
//!
//! Presence is ephemeral: never persisted, never merged through the CRDT.
//!
//! ## Performance Targets
//!
//! | Metric | Target |
//! |--------|--------|
//! | Broadcasts under rapid cursor movement | ≤ 20/s |
//! | Heartbeat | every 15s |
//! | Peer expiry | 30s without a frame |

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tandem_core::ClientId;
use xxhash_rust::xxh3::xxh3_64;

use crate::protocol::{AwarenessState, Selection};

// ───────────────────────────────────────────────────────────────────
// Colors
// ───────────────────────────────────────────────────────────────────

/// RGBA color for cursor/selection rendering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CursorColor {
    pub r: u8,
    pub g: u8,
    pub b: u8,
    pub a: u8,
}

/// Default cursor palette: distinct hues, readable on light and dark themes.
pub const PALETTE: [CursorColor; 8] = [
    CursorColor::rgb(0xE5, 0x39, 0x35),
    CursorColor::rgb(0x1E, 0x88, 0xE5),
    CursorColor::rgb(0x43, 0xA0, 0x47),
    CursorColor::rgb(0xFB, 0x8C, 0x00),
    CursorColor::rgb(0x8E, 0x24, 0xAA),
    CursorColor::rgb(0x00, 0xAC, 0xC1),
    CursorColor::rgb(0xD8, 0x1B, 0x60),
    CursorColor::rgb(0x6D, 0x4C, 0x41),
];

impl CursorColor {
    pub const fn rgb(r: u8, g: u8, b: u8) -> Self {
        Self { r, g, b, a: 0xFF }
    }

    /// Stable color for a client from the default palette.
    pub fn for_client(client_id: &ClientId) -> Self {
        Self::from_palette(&PALETTE, client_id)
    }

    /// `palette[xxh3_64(client_id) mod palette.len()]`.
    ///
    /// Unseeded xxh3, so every peer computes the same color for the same client.
    pub fn from_palette(palette: &[CursorColor], client_id: &ClientId) -> Self {
        if palette.is_empty() {
            return Self::default();
        }
        let index = xxh3_64(client_id.as_bytes()) % palette.len() as u64;
        palette[index as usize]
    }

    /// Convert to [f32; 4] for renderers.
    pub fn to_array(&self) -> [f32; 4] {
        [
            self.r as f32 / 255.0,
            self.g as f32 / 255.0,
            self.b as f32 / 255.0,
            self.a as f32 / 255.0,
        ]
    }

    /// `#rrggbb`
    pub fn to_hex(&self) -> String {
        format!("#{:02x}{:02x}{:02x}", self.r, self.g, self.b)
    }
}

impl Default for CursorColor {
    fn default() -> Self {
        PALETTE[1]
    }
}

// ───────────────────────────────────────────────────────────────────
// Configuration & events
// ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct AwarenessConfig {
    /// Minimum gap between two local broadcasts.
    pub broadcast_interval: Duration,
    /// Re-broadcast an unchanged local state this often.
    pub heartbeat_interval: Duration,
    /// Drop a peer after this long without any frame from it.
    pub timeout: Duration,
    pub palette: Vec<CursorColor>,
}

impl Default for AwarenessConfig {
    fn default() -> Self {
        Self {
            broadcast_interval: Duration::from_millis(50),
            heartbeat_interval: Duration::from_secs(15),
            timeout: Duration::from_secs(30),
            palette: PALETTE.to_vec(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemovalReason {
    TimedOut,
    Left,
}

/// Change notification for decorations and follow mode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AwarenessEvent {
    Updated(AwarenessState),
    Removed {
        client_id: ClientId,
        reason: RemovalReason,
    },
}

impl AwarenessEvent {
    pub fn client_id(&self) -> ClientId {
        match self {
            AwarenessEvent::Updated(state) => state.client_id,
            AwarenessEvent::Removed { client_id, .. } => *client_id,
        }
    }
}

// ───────────────────────────────────────────────────────────────────
// Registry
// ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
struct RemotePeer {
    state: AwarenessState,
    last_seen: Instant,
}

/// Local presence plus every live remote peer for one channel.
pub struct AwarenessRegistry {
    local: AwarenessState,
    config: AwarenessConfig,
    peers: HashMap<ClientId, RemotePeer>,
    /// Last `updated_at` of removed peers, kept for one timeout so
    /// frames still in flight cannot bring them back.
    departed: HashMap<ClientId, (u64, Instant)>,
    last_broadcast: Option<Instant>,
    /// Local state changed since the last broadcast.
    dirty: bool,
}

impl AwarenessRegistry {
    pub fn new(client_id: ClientId, display_name: impl Into<String>, config: AwarenessConfig) -> Self {
        let color = CursorColor::from_palette(&config.palette, &client_id);
        Self {
            local: AwarenessState {
                client_id,
                cursor: 0,
                selection: None,
                color,
                display_name: display_name.into(),
                updated_at: 0,
            },
            config,
            peers: HashMap::new(),
            departed: HashMap::new(),
            last_broadcast: None,
            dirty: true,
        }
    }

    /// Update the local caret/selection; returns the state to broadcast
    /// unless throttled (a throttled change goes out on the next `poll`).
    pub fn set_local(
        &mut self,
        cursor: usize,
        selection: Option<Selection>,
        now: Instant,
    ) -> Option<AwarenessState> {
        self.local.cursor = cursor;
        self.local.selection = selection;
        self.dirty = true;
        if self.throttled(now) {
            return None;
        }
        Some(self.broadcast(now))
    }

    /// Pending throttled change or heartbeat, if one is due.
    pub fn poll(&mut self, now: Instant) -> Option<AwarenessState> {
        if self.dirty && !self.throttled(now) {
            return Some(self.broadcast(now));
        }
        let heartbeat_due = match self.last_broadcast {
            Some(last) => now.saturating_duration_since(last) >= self.config.heartbeat_interval,
            None => true,
        };
        if heartbeat_due {
            log::trace!("Awareness heartbeat for {}", self.local.client_id);
            return Some(self.broadcast(now));
        }
        None
    }

    /// Broadcast regardless of throttling (e.g. right after connecting).
    pub fn force_broadcast(&mut self, now: Instant) -> AwarenessState {
        self.broadcast(now)
    }

    /// Upsert a remote state, last-write-wins by `updated_at`.
    ///
    /// Stale frames are dropped. A heartbeat with unchanged content only
    /// refreshes the peer's expiry and produces no event.
    pub fn on_remote(&mut self, state: AwarenessState, now: Instant) -> Option<AwarenessEvent> {
        if state.client_id == self.local.client_id {
            return None;
        }

        match self.peers.get_mut(&state.client_id) {
            Some(peer) => {
                if state.updated_at <= peer.state.updated_at {
                    log::trace!(
                        "Dropping stale awareness from {} ({} <= {})",
                        state.client_id,
                        state.updated_at,
                        peer.state.updated_at
                    );
                    return None;
                }
                peer.last_seen = now;
                let changed = peer.state.cursor != state.cursor
                    || peer.state.selection != state.selection
                    || peer.state.display_name != state.display_name
                    || peer.state.color != state.color;
                peer.state = state.clone();
                changed.then_some(AwarenessEvent::Updated(state))
            }
            None => {
                if let Some(&(last_stamp, _)) = self.departed.get(&state.client_id) {
                    if state.updated_at <= last_stamp {
                        log::trace!(
                            "Dropping awareness from departed {} ({} <= {last_stamp})",
                            state.client_id,
                            state.updated_at
                        );
                        return None;
                    }
                    self.departed.remove(&state.client_id);
                }
                log::debug!("Awareness: {} ({}) appeared", state.display_name, state.client_id);
                self.peers.insert(
                    state.client_id,
                    RemotePeer {
                        state: state.clone(),
                        last_seen: now,
                    },
                );
                Some(AwarenessEvent::Updated(state))
            }
        }
    }

    /// Refresh a peer's expiry without changing its state.
    pub fn touch(&mut self, client_id: &ClientId, now: Instant) {
        if let Some(peer) = self.peers.get_mut(client_id) {
            peer.last_seen = now;
        }
    }

    /// Forget a peer. Its frames stamped at or before its last state are
    /// dropped until the tombstone expires.
    pub fn remove(
        &mut self,
        client_id: &ClientId,
        reason: RemovalReason,
        now: Instant,
    ) -> Option<AwarenessEvent> {
        let peer = self.peers.remove(client_id)?;
        log::debug!("Awareness: {} removed ({reason:?})", peer.state.client_id);
        self.departed.insert(*client_id, (peer.state.updated_at, now));
        Some(AwarenessEvent::Removed {
            client_id: *client_id,
            reason,
        })
    }

    /// Drop peers not heard from within the timeout.
    pub fn sweep(&mut self, now: Instant) -> Vec<AwarenessEvent> {
        let timeout = self.config.timeout;
        let stale: Vec<ClientId> = self
            .peers
            .iter()
            .filter(|(_, peer)| now.saturating_duration_since(peer.last_seen) >= timeout)
            .map(|(id, _)| *id)
            .collect();
        self.departed
            .retain(|_, (_, left_at)| now.saturating_duration_since(*left_at) < timeout);

        stale
            .into_iter()
            .filter_map(|id| self.remove(&id, RemovalReason::TimedOut, now))
            .collect()
    }

    /// Drop every remote peer (e.g. on dispose); returns their removal events.
    pub fn clear(&mut self) -> Vec<AwarenessEvent> {
        self.peers
            .drain()
            .map(|(client_id, _)| AwarenessEvent::Removed {
                client_id,
                reason: RemovalReason::Left,
            })
            .collect()
    }

    pub fn local(&self) -> &AwarenessState {
        &self.local
    }

    pub fn peer(&self, client_id: &ClientId) -> Option<&AwarenessState> {
        self.peers.get(client_id).map(|peer| &peer.state)
    }

    pub fn peers(&self) -> Vec<AwarenessState> {
        self.peers.values().map(|peer| peer.state.clone()).collect()
    }

    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    fn throttled(&self, now: Instant) -> bool {
        match self.last_broadcast {
            Some(last) => now.saturating_duration_since(last) < self.config.broadcast_interval,
            None => false,
        }
    }

    fn broadcast(&mut self, now: Instant) -> AwarenessState {
        self.local.updated_at = next_stamp(self.local.updated_at);
        self.last_broadcast = Some(now);
        self.dirty = false;
        self.local.clone()
    }
}

/// Wall-clock milliseconds, forced strictly past `previous`.
fn next_stamp(previous: u64) -> u64 {
    let wall = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0);
    wall.max(previous + 1)
}
