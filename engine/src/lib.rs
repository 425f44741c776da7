//! # Weft Engine
//!
//! A replicated, observable document model for local-first applications.
//!
//! A [`Doc`] is one replica: a tree of shared map and array containers that
//! can be mutated locally and synchronized with other replicas by exchanging
//! compact binary update buffers. Replicas converge to the same state even
//! when they mutate concurrently and updates arrive out of order relative to
//! causal history.
//!
//! ## Design Principles
//!
//! - **No IO**: the engine has no knowledge of files, network, or platform;
//!   callers move opaque byte buffers between documents
//! - **Deterministic**: conflict resolution depends only on per-document
//!   priorities, never on wall clocks or arrival order
//! - **Synchronous**: every operation runs to completion on the caller's
//!   stack; observers fire inline, one notification per applied event
//! - **Testable**: pure logic, no mocks needed
//!
//! ## Core Concepts
//!
//! ### Shared types
//!
//! [`MapRef`] and [`ArrayRef`] are lightweight `Copy` handles over container
//! nodes owned by a document. Array elements carry a stable [`ElementId`]
//! assigned at insertion, so a recorded mutation still addresses the same
//! logical element after concurrent inserts and deletes shift positions.
//!
//! ### Transactions
//!
//! Every mutation becomes an [`Event`]. Mutations issued inside
//! [`Doc::transact`] batch into one update buffer; mutations issued outside
//! commit as single-event transactions. Each committed transaction advances
//! the document [`Clock`] by one and is dispatched to update subscribers.
//!
//! ### Rebase
//!
//! Each document keeps a bounded [`History`] of applied events, stamped with
//! the priority of the transaction that produced them. An incoming
//! transaction whose start clock lags the local clock is rebased against the
//! unseen history tail: events that lost a conflict become no-op tombstones,
//! and the survivors apply cleanly. Conflicts on the same slot resolve by
//! comparing [`Priority`] values, which is symmetric and order-independent,
//! so every replica picks the same winner.
//!
//! ## Quick Start
//!
//! ```rust
//! use weft_engine::{Doc, apply_update, encode_state_as_update};
//!
//! let mut alice = Doc::new();
//! let profile = alice.get_map("profile")?;
//! profile.set(&mut alice, "name", "Alice")?;
//!
//! let scores = alice.get_array("scores")?;
//! scores.push(&mut alice, vec![7.into()])?;
//!
//! // Bring a second replica up to date with a full-state snapshot.
//! let mut bob = Doc::new();
//! let snapshot = encode_state_as_update(&alice)?;
//! apply_update(&mut bob, &snapshot, None)?;
//!
//! assert_eq!(bob.to_value(), alice.to_value());
//! assert_eq!(bob.clock(), alice.clock());
//! # Ok::<(), weft_engine::Error>(())
//! ```
//!
//! Incremental updates flow through [`Doc::observe_update`]: every committed
//! transaction is handed to subscribers as a byte buffer that peers apply
//! with [`apply_update`].

pub mod codec;
pub mod doc;
pub mod error;
pub mod event;
pub mod history;
pub mod node;
pub mod path;
pub mod sync;
pub mod transaction;
pub mod value;

pub use codec::{decode_value, encode_value};
pub use doc::{ArrayRef, Doc, MapRef, Out, Subscription};
pub use error::{Error, Result};
pub use event::{ArrayChange, ChangeAction, EntryChange, Event, MapChange};
pub use history::{History, HistoryEntry};
pub use path::{KeyPath, PathKey, PathStep, StepKind};
pub use sync::{apply_update, encode_state_as_update, TAG_STATE_RESET, TAG_TRANSACTION};
pub use transaction::TransactionCache;
pub use value::{NumArray, NumKind, Value};

/// Count of transactions a document has applied.
pub type Clock = u32;

/// Per-document tie-break value for conflicting concurrent writes.
pub type Priority = u32;

/// Stable identity of an array element, assigned at insertion.
pub type ElementId = u64;
