//! Versioned binary wire protocol.
//!
//! Wire format (bincode-encoded `Envelope`):
//! ```text
//! ┌─────────┬──────┬───────┬───────────┬────────────────────┬──────────┐
//! │ version │ kind │ flags │ sender    │ channel            │ body     │
//! │ u16     │ u8   │ u8    │ 16 bytes  │ project + file ids │ variable │
//! └─────────┴──────┴───────┴───────────┴────────────────────┴──────────┘
//!                     │                                       │
//!                     └── bit 0: body is LZ4 ─────────────────┘
//! ```
//!
//! `kind` selects the body type (update, awareness, control). Bodies are
//! decoded with `decode_from_slice`, which ignores trailing bytes, so a
//! newer peer may append fields without breaking older ones.
//!
//! Performance target: encode < 1μs for a single-keystroke update.

use serde::{Deserialize, Serialize};
use std::fmt;
use tandem_core::{ClientId, Operation, Snapshot, StateVector, UpdateFrame};
use thiserror::Error;

use crate::awareness::CursorColor;

/// Current wire version.
pub const PROTOCOL_VERSION: u16 = 1;
/// Oldest version this build still understands.
pub const MIN_PROTOCOL_VERSION: u16 = 1;
/// Body is LZ4 block-compressed with its length prepended.
pub const FLAG_LZ4: u8 = 0b0000_0001;
/// Bodies at or above this size are compressed.
pub const COMPRESSION_THRESHOLD: usize = 1024;

const KIND_UPDATE: u8 = 1;
const KIND_AWARENESS: u8 = 2;
const KIND_CONTROL: u8 = 3;

/// One shared file: the unit of routing and of sessions.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ChannelId {
    pub project_id: String,
    pub file_id: String,
}

impl ChannelId {
    pub fn new(project_id: impl Into<String>, file_id: impl Into<String>) -> Self {
        Self {
            project_id: project_id.into(),
            file_id: file_id.into(),
        }
    }

    /// URL path segment: `project/file`.
    pub fn path(&self) -> String {
        format!("{}/{}", self.project_id, self.file_id)
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.project_id, self.file_id)
    }
}

/// Selection in visible-character offsets; `anchor == head` is a caret.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Selection {
    pub anchor: usize,
    pub head: usize,
}

impl Selection {
    pub fn new(anchor: usize, head: usize) -> Self {
        Self { anchor, head }
    }

    pub fn caret(offset: usize) -> Self {
        Self::new(offset, offset)
    }

    pub fn is_caret(&self) -> bool {
        self.anchor == self.head
    }

    pub fn start(&self) -> usize {
        self.anchor.min(self.head)
    }

    pub fn end(&self) -> usize {
        self.anchor.max(self.head)
    }
}

/// Ephemeral presence of one client. Last-write-wins by `updated_at`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AwarenessState {
    pub client_id: ClientId,
    /// Caret offset in visible characters.
    pub cursor: usize,
    pub selection: Option<Selection>,
    pub color: CursorColor,
    pub display_name: String,
    /// Sender-side milliseconds, strictly increasing per client.
    pub updated_at: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AwarenessFrame {
    pub state: AwarenessState,
}

/// Session control traffic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ControlFrame {
    Join {
        display_name: String,
    },
    Leave,
    /// "This is what I have"; peers answer with what is missing.
    ResyncRequest {
        state_vector: StateVector,
    },
    ResyncResponse {
        to: ClientId,
        state_vector: StateVector,
        operations: Vec<Operation>,
    },
    Ping,
    Pong,
    /// Digest of the visible text at `state_vector`.
    Checksum {
        state_vector: StateVector,
        digest: u64,
    },
    SnapshotRequest,
    SnapshotResponse {
        to: ClientId,
        snapshot: Snapshot,
    },
}

/// Decoded body of an envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Update(UpdateFrame),
    Awareness(AwarenessFrame),
    Control(ControlFrame),
}

impl Frame {
    fn kind(&self) -> u8 {
        match self {
            Frame::Update(_) => KIND_UPDATE,
            Frame::Awareness(_) => KIND_AWARENESS,
            Frame::Control(_) => KIND_CONTROL,
        }
    }

    /// Short label for logs.
    pub fn label(&self) -> &'static str {
        match self {
            Frame::Update(_) => "update",
            Frame::Awareness(_) => "awareness",
            Frame::Control(ControlFrame::Join { .. }) => "join",
            Frame::Control(ControlFrame::Leave) => "leave",
            Frame::Control(ControlFrame::ResyncRequest { .. }) => "resync-request",
            Frame::Control(ControlFrame::ResyncResponse { .. }) => "resync-response",
            Frame::Control(ControlFrame::Ping) => "ping",
            Frame::Control(ControlFrame::Pong) => "pong",
            Frame::Control(ControlFrame::Checksum { .. }) => "checksum",
            Frame::Control(ControlFrame::SnapshotRequest) => "snapshot-request",
            Frame::Control(ControlFrame::SnapshotResponse { .. }) => "snapshot-response",
        }
    }
}

/// Outer wire record. Stable across versions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    pub version: u16,
    pub kind: u8,
    pub flags: u8,
    pub sender: ClientId,
    pub channel: ChannelId,
    pub body: Vec<u8>,
}

impl Envelope {
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    /// Decode and version-check the outer record without touching the body.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (envelope, _): (Envelope, usize) =
            bincode::serde::decode_from_slice(bytes, bincode::config::standard())
                .map_err(|e| ProtocolError::Deserialization(e.to_string()))?;
        if envelope.version < MIN_PROTOCOL_VERSION {
            return Err(ProtocolError::UnsupportedVersion {
                version: envelope.version,
                min: MIN_PROTOCOL_VERSION,
            });
        }
        Ok(envelope)
    }

    fn body_bytes(&self) -> Result<Vec<u8>, ProtocolError> {
        if self.flags & FLAG_LZ4 != 0 {
            lz4_flex::decompress_size_prepended(&self.body)
                .map_err(|e| ProtocolError::Decompression(e.to_string()))
        } else {
            Ok(self.body.clone())
        }
    }

    /// Decode the body according to `kind`.
    pub fn frame(&self) -> Result<Frame, ProtocolError> {
        let raw = self.body_bytes()?;
        match self.kind {
            KIND_UPDATE => decode_body(&raw).map(Frame::Update),
            KIND_AWARENESS => decode_body(&raw).map(Frame::Awareness),
            KIND_CONTROL => decode_body(&raw).map(Frame::Control),
            other => Err(ProtocolError::UnknownKind(other)),
        }
    }
}

fn encode_body<T: Serialize>(value: &T) -> Result<Vec<u8>, ProtocolError> {
    bincode::serde::encode_to_vec(value, bincode::config::standard())
        .map_err(|e| ProtocolError::Serialization(e.to_string()))
}

fn decode_body<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> Result<T, ProtocolError> {
    let (value, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
        .map_err(|e| ProtocolError::Deserialization(e.to_string()))?;
    Ok(value)
}

/// Top-level protocol message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncMessage {
    pub sender: ClientId,
    pub channel: ChannelId,
    pub frame: Frame,
}

impl SyncMessage {
    pub fn new(sender: ClientId, channel: ChannelId, frame: Frame) -> Self {
        Self {
            sender,
            channel,
            frame,
        }
    }

    /// Create an update message.
    pub fn update(sender: ClientId, channel: ChannelId, update: UpdateFrame) -> Self {
        Self::new(sender, channel, Frame::Update(update))
    }

    /// Create an awareness message.
    pub fn awareness(sender: ClientId, channel: ChannelId, state: AwarenessState) -> Self {
        Self::new(sender, channel, Frame::Awareness(AwarenessFrame { state }))
    }

    /// Create a control message.
    pub fn control(sender: ClientId, channel: ChannelId, control: ControlFrame) -> Self {
        Self::new(sender, channel, Frame::Control(control))
    }

    /// Build the envelope, compressing large bodies.
    pub fn to_envelope(&self) -> Result<Envelope, ProtocolError> {
        let raw = match &self.frame {
            Frame::Update(update) => encode_body(update)?,
            Frame::Awareness(awareness) => encode_body(awareness)?,
            Frame::Control(control) => encode_body(control)?,
        };
        let (flags, body) = if raw.len() >= COMPRESSION_THRESHOLD {
            (FLAG_LZ4, lz4_flex::compress_prepend_size(&raw))
        } else {
            (0, raw)
        };
        Ok(Envelope {
            version: PROTOCOL_VERSION,
            kind: self.frame.kind(),
            flags,
            sender: self.sender,
            channel: self.channel.clone(),
            body,
        })
    }

    /// Serialize to binary wire format.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        self.to_envelope()?.encode()
    }

    /// Deserialize from binary wire format.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let envelope = Envelope::decode(bytes)?;
        let frame = envelope.frame()?;
        Ok(Self {
            sender: envelope.sender,
            channel: envelope.channel,
            frame,
        })
    }
}

/// Protocol errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("deserialization error: {0}")]
    Deserialization(String),

    #[error("unsupported protocol version {version} (minimum {min})")]
    UnsupportedVersion { version: u16, min: u16 },

    #[error("unknown frame kind {0}")]
    UnknownKind(u8),

    #[error("decompression failed: {0}")]
    Decompression(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use tandem_core::{PositionId, SiteId};
    use uuid::Uuid;

    fn channel() -> ChannelId {
        ChannelId::new("proj", "main.rs")
    }

    fn insert(clock: u64, value: char) -> Operation {
        Operation::Insert {
            id: PositionId::new(SiteId(1), clock),
            value,
            origin_left: clock.checked_sub(1).map(|c| PositionId::new(SiteId(1), c)),
            origin_right: None,
        }
    }

    #[test]
    fn test_update_roundtrip() {
        let sender = Uuid::new_v4();
        let update = UpdateFrame::new(
            vec![insert(0, 'a'), insert(1, 'b')],
            [(SiteId(1), 2)].into_iter().collect(),
        );
        let msg = SyncMessage::update(sender, channel(), update.clone());

        let decoded = SyncMessage::decode(&msg.encode().unwrap()).unwrap();
        assert_eq!(decoded.sender, sender);
        assert_eq!(decoded.channel, channel());
        assert_eq!(decoded.frame, Frame::Update(update));
    }

    #[test]
    fn test_control_roundtrip() {
        let sender = Uuid::new_v4();
        let to = Uuid::new_v4();
        let frames = vec![
            ControlFrame::Join { display_name: "Ada".into() },
            ControlFrame::Leave,
            ControlFrame::ResyncRequest { state_vector: StateVector::new() },
            ControlFrame::ResyncResponse {
                to,
                state_vector: [(SiteId(1), 1)].into_iter().collect(),
                operations: vec![insert(0, 'z')],
            },
            ControlFrame::Ping,
            ControlFrame::Pong,
            ControlFrame::Checksum { state_vector: StateVector::new(), digest: 42 },
            ControlFrame::SnapshotRequest,
            ControlFrame::SnapshotResponse { to, snapshot: Snapshot::default() },
        ];
        for control in frames {
            let msg = SyncMessage::control(sender, channel(), control.clone());
            let decoded = SyncMessage::decode(&msg.encode().unwrap()).unwrap();
            assert_eq!(decoded.frame, Frame::Control(control));
        }
    }

    #[test]
    fn test_awareness_roundtrip() {
        let client_id = Uuid::new_v4();
        let state = AwarenessState {
            client_id,
            cursor: 12,
            selection: Some(Selection::new(4, 12)),
            color: CursorColor::for_client(&client_id),
            display_name: "Grace".into(),
            updated_at: 1_700_000_000_000,
        };
        let msg = SyncMessage::awareness(client_id, channel(), state.clone());
        let decoded = SyncMessage::decode(&msg.encode().unwrap()).unwrap();
        assert_eq!(decoded.frame, Frame::Awareness(AwarenessFrame { state }));
    }

    #[test]
    fn test_small_body_uncompressed() {
        let msg = SyncMessage::control(Uuid::new_v4(), channel(), ControlFrame::Ping);
        let envelope = msg.to_envelope().unwrap();
        assert_eq!(envelope.flags & FLAG_LZ4, 0);
        assert_eq!(envelope.version, PROTOCOL_VERSION);
    }

    #[test]
    fn test_large_body_compressed() {
        let operations: Vec<Operation> = (0..2_000).map(|i| insert(i, 'x')).collect();
        let msg = SyncMessage::update(
            Uuid::new_v4(),
            channel(),
            UpdateFrame::new(operations, StateVector::new()),
        );
        let envelope = msg.to_envelope().unwrap();
        assert_ne!(envelope.flags & FLAG_LZ4, 0);

        let decoded = SyncMessage::decode(&envelope.encode().unwrap()).unwrap();
        match decoded.frame {
            Frame::Update(update) => assert_eq!(update.operations.len(), 2_000),
            other => panic!("unexpected frame {other:?}"),
        }
    }

    #[test]
    fn test_old_version_rejected() {
        let mut envelope = SyncMessage::control(Uuid::new_v4(), channel(), ControlFrame::Ping)
            .to_envelope()
            .unwrap();
        envelope.version = 0;
        let err = SyncMessage::decode(&envelope.encode().unwrap()).unwrap_err();
        assert_eq!(err, ProtocolError::UnsupportedVersion { version: 0, min: MIN_PROTOCOL_VERSION });
    }

    #[test]
    fn test_newer_version_trailing_fields_ignored() {
        let state_vector: StateVector = [(SiteId(3), 7)].into_iter().collect();
        let mut envelope = SyncMessage::control(
            Uuid::new_v4(),
            channel(),
            ControlFrame::ResyncRequest { state_vector: state_vector.clone() },
        )
        .to_envelope()
        .unwrap();
        envelope.version = PROTOCOL_VERSION + 1;
        envelope.body.extend_from_slice(&[9, 9, 9, 9]);

        let mut bytes = envelope.encode().unwrap();
        bytes.extend_from_slice(&[1, 2, 3]);

        let decoded = SyncMessage::decode(&bytes).unwrap();
        assert_eq!(
            decoded.frame,
            Frame::Control(ControlFrame::ResyncRequest { state_vector })
        );
    }

    #[test]
    fn test_unknown_kind() {
        let mut envelope = SyncMessage::control(Uuid::new_v4(), channel(), ControlFrame::Ping)
            .to_envelope()
            .unwrap();
        envelope.kind = 77;
        let err = SyncMessage::decode(&envelope.encode().unwrap()).unwrap_err();
        assert_eq!(err, ProtocolError::UnknownKind(77));
    }

    #[test]
    fn test_corrupt_compressed_body() {
        let mut envelope = SyncMessage::control(Uuid::new_v4(), channel(), ControlFrame::Ping)
            .to_envelope()
            .unwrap();
        envelope.flags |= FLAG_LZ4;
        envelope.body = vec![10, 0, 0, 0, 0xff];
        let err = envelope.frame().unwrap_err();
        assert!(matches!(err, ProtocolError::Decompression(_)));
    }

    #[test]
    fn test_decode_invalid_bytes() {
        let garbage = vec![0xFF, 0xFE, 0xFD];
        assert!(SyncMessage::decode(&garbage).is_err());
    }

    #[test]
    fn test_keystroke_frame_is_small() {
        let msg = SyncMessage::update(
            Uuid::new_v4(),
            channel(),
            UpdateFrame::new(vec![insert(5, 'k')], [(SiteId(1), 6)].into_iter().collect()),
        );
        let encoded = msg.encode().unwrap();
        assert!(encoded.len() < 96, "Encoded size {} too large for one keystroke", encoded.len());
    }

    #[test]
    fn test_channel_path() {
        assert_eq!(channel().path(), "proj/main.rs");
        assert_eq!(channel().to_string(), "proj/main.rs");
    }
}
