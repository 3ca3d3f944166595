//! Replica identity, position identifiers and state vectors.
//!
//! Every operation gets a `PositionId = (site, clock)`. Clocks are
//! contiguous per site starting at 0, so "have I seen this op?" reduces to
//! `clock < state_vector[site]`.
//!
//! Reference: Shapiro et al., "Conflict-free Replicated Data Types", §3

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

/// Identity of a connected user/process (presence, routing).
pub type ClientId = Uuid;

/// Identity of one replica's operation stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SiteId(pub u64);

impl SiteId {
    /// Random site id drawn from a v4 UUID.
    pub fn random() -> Self {
        let (hi, lo) = Uuid::new_v4().as_u64_pair();
        Self(hi ^ lo)
    }
}

impl fmt::Display for SiteId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

/// `{client_id, site_id}` held by one connected process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Replica {
    pub client_id: ClientId,
    pub site_id: SiteId,
}

impl Replica {
    /// Fresh identity with random client and site ids.
    pub fn new() -> Self {
        Self {
            client_id: Uuid::new_v4(),
            site_id: SiteId::random(),
        }
    }

    /// Create with explicit ids (for testing)
    pub fn with_ids(client_id: ClientId, site_id: SiteId) -> Self {
        Self { client_id, site_id }
    }

    /// Same client, new operation stream.
    pub fn rotate_site(&self) -> Self {
        Self {
            client_id: self.client_id,
            site_id: SiteId::random(),
        }
    }
}

impl Default for Replica {
    fn default() -> Self {
        Self::new()
    }
}

/// Globally unique, totally ordered id of one operation.
///
/// Ordering is lexicographic on `(site, clock)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PositionId {
    pub site: SiteId,
    pub clock: u64,
}

impl PositionId {
    pub fn new(site: SiteId, clock: u64) -> Self {
        Self { site, clock }
    }
}

impl fmt::Display for PositionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.clock, self.site)
    }
}

/// Per-site next expected clock (= number of that site's ops integrated).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateVector(BTreeMap<SiteId, u64>);

impl StateVector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Next expected clock for `site` (0 if never seen).
    #[inline]
    pub fn get(&self, site: SiteId) -> u64 {
        self.0.get(&site).copied().unwrap_or(0)
    }

    /// Whether the op with this id has already been integrated.
    #[inline]
    pub fn contains(&self, id: &PositionId) -> bool {
        id.clock < self.get(id.site)
    }

    /// Record `id` as integrated. Only advances, never rewinds.
    pub fn advance(&mut self, id: &PositionId) {
        let next = id.clock + 1;
        let entry = self.0.entry(id.site).or_insert(0);
        if *entry < next {
            *entry = next;
        }
    }

    /// Set the clock for `site` (used when decoding deltas).
    pub fn set(&mut self, site: SiteId, clock: u64) {
        self.0.insert(site, clock);
    }

    /// Pointwise maximum.
    pub fn merge(&mut self, other: &StateVector) {
        for (site, clock) in &other.0 {
            let entry = self.0.entry(*site).or_insert(0);
            if *entry < *clock {
                *entry = *clock;
            }
        }
    }

    /// Entries that moved forward since `previous`.
    pub fn delta_since(&self, previous: &StateVector) -> StateVector {
        StateVector(
            self.0
                .iter()
                .filter(|(site, clock)| **clock > previous.get(**site))
                .map(|(site, clock)| (*site, *clock))
                .collect(),
        )
    }

    /// True when `self` has seen everything `other` has.
    pub fn dominates(&self, other: &StateVector) -> bool {
        other.0.iter().all(|(site, clock)| self.get(*site) >= *clock)
    }

    pub fn iter(&self) -> impl Iterator<Item = (SiteId, u64)> + '_ {
        self.0.iter().map(|(site, clock)| (*site, *clock))
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Total number of operations covered.
    pub fn total(&self) -> u64 {
        self.0.values().sum()
    }
}

impl FromIterator<(SiteId, u64)> for StateVector {
    fn from_iter<I: IntoIterator<Item = (SiteId, u64)>>(iter: I) -> Self {
        StateVector(iter.into_iter().collect())
    }
}
