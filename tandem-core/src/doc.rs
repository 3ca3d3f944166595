//! Replicated ordered text with deterministic concurrent-insert ordering.
//!
//! Storage layout:
//! ```text
//! items (arena, never shrinks)        index (BTreeMap<PositionId, slot>)
//! ┌────┬────┬────┬────┬────┐          ┌──────────┬──────┐
//! │ h  │ e  │ ✝x │ l  │ o  │ ◄─────── │ (A, 0)   │  0   │
//! └────┴────┴────┴────┴────┘          │ (A, 1)   │  1   │
//!   ▲ left/right links are slot         │ …        │      │
//!     indices in document order         └──────────┴──────┘
//! ```
//!
//! Tombstones (`✝`) stay linked so that origins referenced by in-flight
//! operations always resolve.
//!
//! Concurrent inserts are ordered with YATA (the Yjs integration rule):
//! items sharing an `origin_left` are ordered by site id, and items whose
//! origins fall inside the conflict window are kept after their origin.
//!
//! Reference: Nicolaescu et al., "Near Real-Time Peer-to-Peer Shared
//! Editing on Extensible Data Types" (GROUP 2016)

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::time::{Duration, Instant};

use crate::error::CoreError;
use crate::id::{PositionId, Replica, SiteId, StateVector};
use crate::op::Operation;
use crate::snapshot::Snapshot;
use xxhash_rust::xxh3::xxh3_64;

/// Tuning for the causal buffer.
#[derive(Debug, Clone)]
pub struct DocumentConfig {
    /// Maximum buffered remote ops before the oldest is dropped.
    pub pending_limit: usize,
    /// How long a buffered op may wait for its dependencies.
    pub pending_window: Duration,
}

impl Default for DocumentConfig {
    fn default() -> Self {
        Self {
            pending_limit: 10_000,
            pending_window: Duration::from_secs(10),
        }
    }
}

/// What applying one operation did to the visible text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppliedEffect {
    /// Visible text changed at `visible_offset`. `length` is positive for
    /// inserts and negative for deletes; `value` is the inserted character.
    Applied {
        visible_offset: usize,
        length: isize,
        value: Option<char>,
    },
    /// Already integrated, or deleting an existing tombstone.
    Noop,
    /// Waiting for causal dependencies.
    Buffered,
}

impl AppliedEffect {
    pub fn is_applied(&self) -> bool {
        matches!(self, AppliedEffect::Applied { .. })
    }
}

#[derive(Debug, Clone)]
struct Item {
    id: PositionId,
    value: char,
    deleted: bool,
    origin_left: Option<PositionId>,
    origin_right: Option<PositionId>,
    left: Option<usize>,
    right: Option<usize>,
}

#[derive(Debug, Clone)]
struct PendingOp {
    op: Operation,
    received_at: Instant,
    seq: u64,
    /// The id whose integration this op is waiting for.
    blocked_on: PositionId,
}

enum Readiness {
    Ready,
    Duplicate,
    Waiting(PositionId),
}

/// The Document CRDT Store for one file.
pub struct TextDocument {
    replica: Replica,
    config: DocumentConfig,
    items: Vec<Item>,
    index: BTreeMap<PositionId, usize>,
    head: Option<usize>,
    live_len: usize,
    state_vector: StateVector,
    /// Every integrated op, in application (hence causal) order.
    log: Vec<Operation>,
    /// Per site: positions into `log`, indexed by clock.
    history: BTreeMap<SiteId, Vec<usize>>,
    pending: HashMap<PositionId, PendingOp>,
    /// Buffered op ids keyed by the missing id they wait on.
    waiting_on: HashMap<PositionId, Vec<PositionId>>,
    /// Arrival order for eviction and expiry. May hold stale entries.
    arrival: VecDeque<(u64, PositionId)>,
    next_seq: u64,
    resync_needed: bool,
}

impl TextDocument {
    /// Empty document owned by `replica`.
    pub fn new(replica: Replica) -> Self {
        Self::with_config(replica, DocumentConfig::default())
    }

    pub fn with_config(replica: Replica, config: DocumentConfig) -> Self {
        Self {
            replica,
            config,
            items: Vec::new(),
            index: BTreeMap::new(),
            head: None,
            live_len: 0,
            state_vector: StateVector::new(),
            log: Vec::new(),
            history: BTreeMap::new(),
            pending: HashMap::new(),
            waiting_on: HashMap::new(),
            arrival: VecDeque::new(),
            next_seq: 0,
            resync_needed: false,
        }
    }

    /// Rehydrate by replaying a snapshot's history.
    pub fn from_snapshot(replica: Replica, config: DocumentConfig, snapshot: &Snapshot) -> Self {
        let mut doc = Self::with_config(replica, config);
        for op in &snapshot.operations {
            doc.apply_remote(op.clone());
        }
        if !doc.pending.is_empty() {
            log::warn!(
                "Snapshot left {} operations without their dependencies",
                doc.pending.len()
            );
        }
        doc
    }

    // ─── Local edits ────────────────────────────────────────────

    /// Insert `text` before the live character at `visible_offset`.
    pub fn local_insert(
        &mut self,
        visible_offset: usize,
        text: &str,
    ) -> Result<Vec<Operation>, CoreError> {
        if visible_offset > self.live_len {
            return Err(CoreError::OffsetOutOfBounds {
                offset: visible_offset,
                len: self.live_len,
            });
        }

        let mut left = self.live_slot_before(visible_offset);
        let mut ops = Vec::with_capacity(text.len());

        for value in text.chars() {
            let right = self.next_of(left);
            let op = Operation::Insert {
                id: self.next_local_id(),
                value,
                origin_left: left.map(|slot| self.items[slot].id),
                origin_right: right.map(|slot| self.items[slot].id),
            };
            self.integrate_op(&op);
            self.record(op.clone());
            left = self.index.get(&op.id()).copied();
            ops.push(op);
        }

        Ok(ops)
    }

    /// Tombstone `length` live characters starting at `visible_offset`.
    pub fn local_delete(
        &mut self,
        visible_offset: usize,
        length: usize,
    ) -> Result<Vec<Operation>, CoreError> {
        let in_bounds = visible_offset
            .checked_add(length)
            .is_some_and(|end| end <= self.live_len);
        if !in_bounds {
            return Err(CoreError::RangeOutOfBounds {
                offset: visible_offset,
                length,
                len: self.live_len,
            });
        }

        let targets = self.live_slots(visible_offset, length);
        let mut ops = Vec::with_capacity(targets.len());
        for slot in targets {
            let op = Operation::Delete {
                id: self.next_local_id(),
                target: self.items[slot].id,
            };
            self.integrate_op(&op);
            self.record(op.clone());
            ops.push(op);
        }

        Ok(ops)
    }

    // ─── Remote operations ──────────────────────────────────────

    /// Integrate a remote operation.
    ///
    /// The first effect describes `op` itself; any buffered operations it
    /// unblocked follow in the order they were applied.
    pub fn apply_remote(&mut self, op: Operation) -> Vec<AppliedEffect> {
        match self.readiness(&op) {
            Readiness::Duplicate => {
                log::trace!("Ignoring duplicate operation {}", op.id());
                vec![AppliedEffect::Noop]
            }
            Readiness::Waiting(missing) => {
                self.buffer(op, missing);
                vec![AppliedEffect::Buffered]
            }
            Readiness::Ready => {
                let id = op.id();
                let mut effects = vec![self.integrate_op(&op)];
                self.record(op);
                self.release_waiting(id, &mut effects);
                effects
            }
        }
    }

    /// Drop buffered ops older than the pending window.
    ///
    /// Returns the number dropped; a non-zero result flags a resync.
    pub fn expire_pending(&mut self, now: Instant) -> usize {
        let window = self.config.pending_window;
        let mut dropped = 0;
        while let Some(&(seq, id)) = self.arrival.front() {
            let Some(pending) = self.pending.get(&id).filter(|p| p.seq == seq) else {
                self.arrival.pop_front();
                continue;
            };
            if now.saturating_duration_since(pending.received_at) < window {
                break;
            }
            self.arrival.pop_front();
            self.unbuffer(&id);
            log::warn!("Dropping operation {id} after {window:?} without dependencies");
            dropped += 1;
        }
        if dropped > 0 {
            self.resync_needed = true;
        }
        dropped
    }

    /// Whether buffer overflow/expiry asked for a full resync (clears the flag).
    pub fn take_resync_needed(&mut self) -> bool {
        std::mem::take(&mut self.resync_needed)
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    // ─── Queries ────────────────────────────────────────────────

    /// Current content, skipping tombstones.
    pub fn visible_text(&self) -> String {
        let mut text = String::with_capacity(self.live_len);
        let mut cursor = self.head;
        while let Some(slot) = cursor {
            let item = &self.items[slot];
            if !item.deleted {
                text.push(item.value);
            }
            cursor = item.right;
        }
        text
    }

    /// Number of live characters.
    pub fn len(&self) -> usize {
        self.live_len
    }

    pub fn is_empty(&self) -> bool {
        self.live_len == 0
    }

    /// Items including tombstones.
    pub fn item_count(&self) -> usize {
        self.items.len()
    }

    pub fn state_vector(&self) -> &StateVector {
        &self.state_vector
    }

    /// Whether the operation `id` has been integrated.
    pub fn contains(&self, id: &PositionId) -> bool {
        self.state_vector.contains(id)
    }

    pub fn replica(&self) -> Replica {
        self.replica
    }

    pub fn site_id(&self) -> SiteId {
        self.replica.site_id
    }

    /// xxh3 digest of the visible text, stable across peers.
    pub fn checksum(&self) -> u64 {
        xxh3_64(self.visible_text().as_bytes())
    }

    /// Integrated ops with clocks in `[from[site], to[site])`, causal order.
    pub fn operations_between(&self, from: &StateVector, to: &StateVector) -> Vec<Operation> {
        let mut positions: Vec<usize> = Vec::new();
        for (site, entries) in &self.history {
            let start = from.get(*site) as usize;
            let end = (to.get(*site) as usize).min(entries.len());
            if start < end {
                positions.extend_from_slice(&entries[start..end]);
            }
        }
        positions.sort_unstable();
        positions.into_iter().map(|pos| self.log[pos].clone()).collect()
    }

    /// Everything integrated that `remote` has not seen.
    pub fn operations_since(&self, remote: &StateVector) -> Vec<Operation> {
        self.operations_between(remote, &self.state_vector)
    }

    /// Full history for hydration.
    pub fn snapshot(&self) -> Snapshot {
        Snapshot {
            operations: self.log.clone(),
        }
    }

    // ─── Internals ──────────────────────────────────────────────

    fn next_local_id(&self) -> PositionId {
        let site = self.replica.site_id;
        PositionId::new(site, self.state_vector.get(site))
    }

    fn record(&mut self, op: Operation) {
        let id = op.id();
        self.state_vector.advance(&id);
        self.history.entry(id.site).or_default().push(self.log.len());
        self.log.push(op);
    }

    fn readiness(&self, op: &Operation) -> Readiness {
        let id = op.id();
        if self.state_vector.contains(&id) {
            return Readiness::Duplicate;
        }
        // Not contained, so the clock is ahead of the next expected one.
        if id.clock != self.state_vector.get(id.site) {
            return Readiness::Waiting(PositionId::new(id.site, id.clock - 1));
        }
        match op.dependencies().find(|dep| !self.index.contains_key(dep)) {
            Some(missing) => Readiness::Waiting(missing),
            None => Readiness::Ready,
        }
    }

    fn buffer(&mut self, op: Operation, blocked_on: PositionId) {
        let id = op.id();
        if self.pending.contains_key(&id) {
            return;
        }
        if self.pending.len() >= self.config.pending_limit {
            if let Some(dropped) = self.evict_oldest() {
                log::warn!(
                    "Causal buffer full ({} ops), dropping {}",
                    self.config.pending_limit,
                    dropped.op.id()
                );
            }
            self.resync_needed = true;
        }
        log::debug!("Buffering operation {id} until {blocked_on} arrives");

        let seq = self.next_seq;
        self.next_seq += 1;
        self.waiting_on.entry(blocked_on).or_default().push(id);
        self.arrival.push_back((seq, id));
        self.pending.insert(
            id,
            PendingOp {
                op,
                received_at: Instant::now(),
                seq,
                blocked_on,
            },
        );

        if self.arrival.len() > 2 * self.pending.len() + 64 {
            let pending = &self.pending;
            self.arrival
                .retain(|(seq, id)| pending.get(id).is_some_and(|p| p.seq == *seq));
        }
    }

    fn evict_oldest(&mut self) -> Option<PendingOp> {
        while let Some((seq, id)) = self.arrival.pop_front() {
            if self.pending.get(&id).is_some_and(|p| p.seq == seq) {
                return self.unbuffer(&id);
            }
        }
        None
    }

    fn unbuffer(&mut self, id: &PositionId) -> Option<PendingOp> {
        let pending = self.pending.remove(id)?;
        let now_empty = match self.waiting_on.get_mut(&pending.blocked_on) {
            Some(waiters) => {
                waiters.retain(|waiter| waiter != id);
                waiters.is_empty()
            }
            None => false,
        };
        if now_empty {
            self.waiting_on.remove(&pending.blocked_on);
        }
        Some(pending)
    }

    /// Integrate buffered ops unblocked by `integrated`, transitively.
    fn release_waiting(&mut self, integrated: PositionId, effects: &mut Vec<AppliedEffect>) {
        let mut woken = vec![integrated];
        while let Some(id) = woken.pop() {
            let Some(waiters) = self.waiting_on.remove(&id) else {
                continue;
            };
            for waiter in waiters {
                let Some(pending) = self.pending.remove(&waiter) else {
                    continue;
                };
                match self.readiness(&pending.op) {
                    Readiness::Duplicate => {}
                    Readiness::Waiting(missing) => {
                        self.waiting_on.entry(missing).or_default().push(waiter);
                        self.pending.insert(
                            waiter,
                            PendingOp {
                                blocked_on: missing,
                                ..pending
                            },
                        );
                    }
                    Readiness::Ready => {
                        effects.push(self.integrate_op(&pending.op));
                        self.record(pending.op);
                        woken.push(waiter);
                    }
                }
            }
        }
    }

    /// Apply an op whose dependencies are present. Does not record it.
    fn integrate_op(&mut self, op: &Operation) -> AppliedEffect {
        match op {
            Operation::Insert {
                id,
                value,
                origin_left,
                origin_right,
            } => {
                let slot = self.integrate(*id, *value, *origin_left, *origin_right);
                self.live_len += 1;
                AppliedEffect::Applied {
                    visible_offset: self.visible_offset_of(slot),
                    length: 1,
                    value: Some(*value),
                }
            }
            Operation::Delete { target, .. } => {
                let Some(&slot) = self.index.get(target) else {
                    return AppliedEffect::Noop;
                };
                if self.items[slot].deleted {
                    return AppliedEffect::Noop;
                }
                let visible_offset = self.visible_offset_of(slot);
                self.items[slot].deleted = true;
                self.live_len -= 1;
                AppliedEffect::Applied {
                    visible_offset,
                    length: -1,
                    value: None,
                }
            }
        }
    }

    /// YATA placement: scan the gap between the origins and link the item.
    fn integrate(
        &mut self,
        id: PositionId,
        value: char,
        origin_left: Option<PositionId>,
        origin_right: Option<PositionId>,
    ) -> usize {
        let left_slot = origin_left.and_then(|o| self.index.get(&o).copied());
        let right_slot = origin_right.and_then(|o| self.index.get(&o).copied());

        let mut left = left_slot;
        let mut cursor = self.next_of(left_slot);
        let mut conflicting: HashSet<usize> = HashSet::new();
        let mut before_origin: HashSet<usize> = HashSet::new();

        while let Some(o) = cursor {
            if Some(o) == right_slot {
                break;
            }
            before_origin.insert(o);
            conflicting.insert(o);

            let other = &self.items[o];
            if other.origin_left == origin_left {
                // Same gap: lower site ids go first.
                if other.id.site < id.site {
                    left = Some(o);
                    conflicting.clear();
                } else if other.origin_right == origin_right {
                    break;
                }
            } else if let Some(other_left) = other
                .origin_left
                .and_then(|ol| self.index.get(&ol).copied())
                .filter(|slot| before_origin.contains(slot))
            {
                if !conflicting.contains(&other_left) {
                    left = Some(o);
                    conflicting.clear();
                }
            } else {
                break;
            }
            cursor = other.right;
        }

        let slot = self.items.len();
        let right = self.next_of(left);
        self.items.push(Item {
            id,
            value,
            deleted: false,
            origin_left,
            origin_right,
            left,
            right,
        });
        match left {
            Some(l) => self.items[l].right = Some(slot),
            None => self.head = Some(slot),
        }
        if let Some(r) = right {
            self.items[r].left = Some(slot);
        }
        self.index.insert(id, slot);
        slot
    }

    #[inline]
    fn next_of(&self, slot: Option<usize>) -> Option<usize> {
        match slot {
            Some(s) => self.items[s].right,
            None => self.head,
        }
    }

    /// Slot of the `offset`-th live item (1-based), `None` for the start.
    fn live_slot_before(&self, offset: usize) -> Option<usize> {
        if offset == 0 {
            return None;
        }
        let mut seen = 0;
        let mut cursor = self.head;
        while let Some(slot) = cursor {
            let item = &self.items[slot];
            if !item.deleted {
                seen += 1;
                if seen == offset {
                    return Some(slot);
                }
            }
            cursor = item.right;
        }
        None
    }

    /// Slots of live items in `[offset, offset + length)`.
    fn live_slots(&self, offset: usize, length: usize) -> Vec<usize> {
        let mut slots = Vec::with_capacity(length.min(self.live_len));
        let mut seen = 0;
        let mut cursor = self.head;
        while let Some(slot) = cursor {
            if slots.len() == length {
                break;
            }
            let item = &self.items[slot];
            if !item.deleted {
                if seen >= offset {
                    slots.push(slot);
                }
                seen += 1;
            }
            cursor = item.right;
        }
        slots
    }

    /// Live items strictly before `target`.
    fn visible_offset_of(&self, target: usize) -> usize {
        let mut offset = 0;
        let mut cursor = self.head;
        while let Some(slot) = cursor {
            if slot == target {
                break;
            }
            if !self.items[slot].deleted {
                offset += 1;
            }
            cursor = self.items[slot].right;
        }
        offset
    }
}

impl std::fmt::Debug for TextDocument {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TextDocument")
            .field("site", &self.replica.site_id)
            .field("len", &self.live_len)
            .field("items", &self.items.len())
            .field("pending", &self.pending.len())
            .finish()
    }
}
