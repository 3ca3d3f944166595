//! Immutable CRDT operations.

use serde::{Deserialize, Serialize};

use crate::id::PositionId;

/// One replicated mutation, content-addressed by its own `id`.
///
/// Both variants consume a clock tick on the originating site so that
/// deletes are covered by state vectors and resync diffs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Operation {
    /// Insert one character between two neighbours as seen at insertion time.
    Insert {
        id: PositionId,
        value: char,
        origin_left: Option<PositionId>,
        origin_right: Option<PositionId>,
    },
    /// Tombstone the item inserted by `target`.
    Delete { id: PositionId, target: PositionId },
}

impl Operation {
    #[inline]
    pub fn id(&self) -> PositionId {
        match self {
            Operation::Insert { id, .. } | Operation::Delete { id, .. } => *id,
        }
    }

    /// Items that must already be integrated before this op can apply.
    pub fn dependencies(&self) -> impl Iterator<Item = PositionId> {
        let (first, second) = match self {
            Operation::Insert {
                origin_left,
                origin_right,
                ..
            } => (*origin_left, *origin_right),
            Operation::Delete { target, .. } => (Some(*target), None),
        };
        first.into_iter().chain(second)
    }

    pub fn is_insert(&self) -> bool {
        matches!(self, Operation::Insert { .. })
    }
}
