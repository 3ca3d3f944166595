//! Update log: batching local operations into frames, resync diffs and
//! exactly-once ingestion of remote operations.
//!
//! ```text
//! keystrokes ─► record_local ─► [batch] ──(batch_interval)──► flush ─► UpdateFrame
//!                                                                   (ops + SV delta)
//! reconnect  ─► diff(local_sv, remote_sv) ─► ops the peer is missing
//! UpdateFrame ─► ingest ─► doc.contains(id)? skip : doc.apply_remote(op)
//! ```
//!
//! Performance targets:
//! - flush of a 60-keystroke burst: one frame
//! - diff: O(missing ops), no scan of the full history

use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::doc::{AppliedEffect, TextDocument};
use crate::id::StateVector;
use crate::op::Operation;

/// Wire unit broadcast after a local batch or replayed during resync.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateFrame {
    pub operations: Vec<Operation>,
    /// Sender's state vector entries that advanced since its previous frame.
    pub state_vector_delta: StateVector,
}

impl UpdateFrame {
    pub fn new(operations: Vec<Operation>, state_vector_delta: StateVector) -> Self {
        Self {
            operations,
            state_vector_delta,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }
}

/// Debounces local operations into frames.
#[derive(Debug)]
pub struct UpdateLog {
    batch: Vec<Operation>,
    batch_started: Option<Instant>,
    batch_interval: Duration,
    last_flushed: StateVector,
}

impl UpdateLog {
    pub fn new(batch_interval: Duration) -> Self {
        Self {
            batch: Vec::new(),
            batch_started: None,
            batch_interval,
            last_flushed: StateVector::new(),
        }
    }

    /// Queue freshly generated local operations.
    pub fn record_local(&mut self, operations: Vec<Operation>, now: Instant) {
        if operations.is_empty() {
            return;
        }
        if self.batch.is_empty() {
            self.batch_started = Some(now);
        }
        self.batch.extend(operations);
    }

    /// Whether the oldest queued op has waited a full batch interval.
    pub fn is_due(&self, now: Instant) -> bool {
        match self.batch_started {
            Some(started) => now.saturating_duration_since(started) >= self.batch_interval,
            None => false,
        }
    }

    /// Drain the batch into one frame, or `None` when nothing is queued.
    pub fn flush(&mut self, doc: &TextDocument) -> Option<UpdateFrame> {
        if self.batch.is_empty() {
            return None;
        }
        let operations = std::mem::take(&mut self.batch);
        self.batch_started = None;
        log::trace!("Flushing {} local operations", operations.len());
        Some(self.frame_for(doc, operations))
    }

    /// Wrap `operations` in a frame tagged with the current SV delta.
    pub fn frame_for(&mut self, doc: &TextDocument, operations: Vec<Operation>) -> UpdateFrame {
        let current = doc.state_vector();
        let delta = current.delta_since(&self.last_flushed);
        self.last_flushed = current.clone();
        UpdateFrame::new(operations, delta)
    }

    /// Forget queued ops (a resync push already carries them).
    pub fn clear_batch(&mut self) {
        self.batch.clear();
        self.batch_started = None;
    }

    pub fn pending_len(&self) -> usize {
        self.batch.len()
    }

    /// Exactly the operations a peer at `remote_sv` lacks, bounded by `local_sv`.
    pub fn diff(doc: &TextDocument, local_sv: &StateVector, remote_sv: &StateVector) -> Vec<Operation> {
        doc.operations_between(remote_sv, local_sv)
    }

    /// Apply remote operations, skipping any already integrated.
    pub fn ingest(doc: &mut TextDocument, operations: Vec<Operation>) -> Vec<AppliedEffect> {
        let mut effects = Vec::with_capacity(operations.len());
        for op in operations {
            if doc.contains(&op.id()) {
                continue;
            }
            effects.extend(doc.apply_remote(op));
        }
        effects
    }
}
