//! # tandem-core — Replicated text engine for Tandem
//!
//! Conflict-free ordered-sequence CRDT for a single shared text document,
//! plus the update log that turns local edits into causally ordered frames.
//!
//! ## Architecture
//!
//! ```text
//! local edit ──► TextDocument::local_insert / local_delete
//!                      │  (Operations, one PositionId each)
//!                      ▼
//!                 UpdateLog::record_local ──► flush ──► UpdateFrame
//!
//! UpdateFrame ──► UpdateLog::ingest ──► TextDocument::apply_remote
//!                                              │
//!                                              ├── Applied { visible_offset, length }
//!                                              ├── Noop (duplicate)
//!                                              └── Buffered (causal gap)
//! ```
//!
//! ## Modules
//!
//! - [`id`] — replica identity, `PositionId`, `StateVector`
//! - [`op`] — immutable `Operation`s and their causal dependencies
//! - [`doc`] — the YATA-ordered `TextDocument` (arena + ordered index)
//! - [`update`] — `UpdateLog`: batching, state-vector deltas, resync diff
//! - [`snapshot`] — full-history snapshots for hydration
//!
//! ## Guarantees
//!
//! | Property | Mechanism |
//! |----------|-----------|
//! | Idempotence | `(site, clock)` checked against the `StateVector` |
//! | Causality | ops with missing origins / clock gaps are buffered |
//! | Convergence | YATA integration, identical tie-break on every replica |
//! | Tombstones | deleted items stay in the arena for the document lifetime |

pub mod doc;
pub mod error;
pub mod id;
pub mod op;
pub mod snapshot;
pub mod update;

pub use doc::{AppliedEffect, DocumentConfig, TextDocument};
pub use error::CoreError;
pub use id::{ClientId, PositionId, Replica, SiteId, StateVector};
pub use op::Operation;
pub use snapshot::Snapshot;
pub use update::{UpdateFrame, UpdateLog};
