//! Full-history snapshots for hydrating a replica.
//!
//! A snapshot is the integrated operation log in causal order. Replaying it
//! into an empty document reproduces the exact item order, tombstones
//! included, so the hydrated replica keeps merging with live peers.
//!
//! Encoding: bincode (standard config) then LZ4 with the length prepended.

use serde::{Deserialize, Serialize};

use crate::error::CoreError;
use crate::id::StateVector;
use crate::op::Operation;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    pub operations: Vec<Operation>,
}

impl Snapshot {
    /// State vector covered by the snapshot.
    pub fn state_vector(&self) -> StateVector {
        let mut sv = StateVector::new();
        for op in &self.operations {
            sv.advance(&op.id());
        }
        sv
    }

    pub fn len(&self) -> usize {
        self.operations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }

    /// Compressed binary form.
    pub fn encode(&self) -> Result<Vec<u8>, CoreError> {
        let raw = bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| CoreError::SnapshotEncode(e.to_string()))?;
        Ok(lz4_flex::compress_prepend_size(&raw))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, CoreError> {
        let raw = lz4_flex::decompress_size_prepended(bytes)
            .map_err(|e| CoreError::SnapshotDecode(e.to_string()))?;
        let (snapshot, _): (Snapshot, usize) =
            bincode::serde::decode_from_slice(&raw, bincode::config::standard())
                .map_err(|e| CoreError::SnapshotDecode(e.to_string()))?;
        Ok(snapshot)
    }
}
