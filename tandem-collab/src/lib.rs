//! # tandem-collab — Real-time sync for shared text files
//!
//! Wires the `tandem-core` CRDT to editors and to the network.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐  EditEvent / patches  ┌──────────────┐   frames    ┌──────────────┐
//! │ EditorSurface│ ◄───────────────────► │   Session    │ ◄─────────► │  Transport   │
//! │ (host editor)│                       │ (apply loop) │             │ memory | ws  │
//! └──────────────┘                       └──────┬───────┘             └──────┬───────┘
//!                                               │                            │
//!                        TextDocument, UpdateLog, Awareness,          RelayServer
//!                        Follow (owned, never shared)                 (rooms + replica)
//! ```
//!
//! ## Modules
//!
//! - [`protocol`] — Versioned binary envelope (bincode, LZ4 for large bodies)
//! - [`awareness`] — Presence registry with throttling, heartbeat and expiry
//! - [`binding`] — Editor binding, cursor transform, in-memory surface
//! - [`follow`] — Follow-mode state machine
//! - [`broadcast`] — Per-channel fan-out rooms
//! - [`transport`] — Transport trait, backoff, in-process hub
//! - [`client`] — WebSocket transport with reconnect
//! - [`server`] — WebSocket relay
//! - [`session`] — The per-file apply loop and its handle
//!
//! ## Performance Targets
//!
//! | Metric | Target |
//! |--------|--------|
//! | Keystroke frame encode | <1μs |
//! | Broadcast 1K frames × 100 peers | <10ms |
//! | Awareness broadcasts under cursor drag | ≤20/s |

pub mod awareness;
pub mod binding;
pub mod broadcast;
pub mod client;
pub mod follow;
pub mod protocol;
pub mod server;
pub mod session;
pub mod transport;

// Re-exports for convenience
pub use awareness::{
    AwarenessConfig, AwarenessEvent, AwarenessRegistry, CursorColor, RemovalReason, PALETTE,
};
pub use binding::{
    coalesce, transform_offset, Decoration, EditEvent, EditorBinding, EditorSurface, MemorySurface,
    TextPatch,
};
pub use broadcast::{BroadcastGroup, BroadcastStats, PeerInfo, RoomManager};
pub use client::WsTransport;
pub use follow::{FollowController, FollowState};
pub use protocol::{
    AwarenessFrame, AwarenessState, ChannelId, ControlFrame, Envelope, Frame, ProtocolError,
    Selection, SyncMessage, PROTOCOL_VERSION,
};
pub use server::{RelayServer, ServerConfig, ServerStats};
pub use session::{open_session, Session, SessionConfig, SessionError};
pub use transport::{
    Backoff, BackoffConfig, LinkSwitch, MemoryHub, MemoryTransport, Transport, TransportError,
    TransportEvent, TransportStatus,
};
