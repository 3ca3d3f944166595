use thiserror::Error;

/// Errors raised by the text engine.
///
/// Remote input never produces these: malformed remote operations are
/// buffered, expired and logged instead.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CoreError {
    #[error("offset {offset} is past the end of the document (len {len})")]
    OffsetOutOfBounds { offset: usize, len: usize },

    #[error("range of {length} at {offset} is past the end of the document (len {len})")]
    RangeOutOfBounds {
        offset: usize,
        length: usize,
        len: usize,
    },

    #[error("snapshot encoding failed: {0}")]
    SnapshotEncode(String),

    #[error("snapshot decoding failed: {0}")]
    SnapshotDecode(String),
}
