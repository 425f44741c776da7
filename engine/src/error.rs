//! Error types for the Weft engine.

use crate::value::NumKind;
use crate::Clock;
use thiserror::Error;

/// All possible errors from the Weft engine.
///
/// Usage errors indicate a misuse of the local API and leave the document
/// untouched. Protocol errors indicate a malformed or out-of-sequence update
/// buffer; the update that produced one must be discarded.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Error {
    // Usage errors
    #[error("single-element operations only: got {0} elements")]
    SingleElementOnly(usize),

    #[error("key path does not resolve to a live slot: {0}")]
    UnresolvedPath(String),

    #[error("handle refers to a node that no longer exists")]
    StaleHandle,

    #[error("root '{name}' is a {found}, expected {expected}")]
    KindMismatch {
        name: String,
        expected: &'static str,
        found: &'static str,
    },

    #[error("index {index} out of bounds for array of length {len}")]
    IndexOutOfBounds { index: usize, len: usize },

    // Protocol errors
    #[error("unknown message tag: {0}")]
    UnknownMessageTag(u32),

    #[error("unknown event tag: {0}")]
    UnknownEventTag(u32),

    #[error("unknown addendum type code: {0}")]
    UnknownAddendumType(u32),

    #[error("addendum records not fully consumed: used {consumed} of {total}")]
    AddendumMismatch { consumed: usize, total: usize },

    #[error("addendum byte length {byte_len} does not divide evenly into {kind} elements")]
    AddendumLength { kind: NumKind, byte_len: usize },

    #[error("unexpected end of buffer at offset {offset}: needed {needed} more bytes")]
    EndOfBuffer { offset: usize, needed: usize },

    #[error("malformed shadow tree: {0}")]
    ShadowTree(String),

    #[error("malformed state tree: {0}")]
    MalformedState(String),

    #[error("transaction start clock {start_clock} is ahead of local clock {clock}")]
    SkippedHistory { start_clock: Clock, clock: Clock },

    #[error("history before clock {retained_from} has been trimmed; cannot rebase from {start_clock}")]
    HistoryTrimmed {
        start_clock: Clock,
        retained_from: Clock,
    },
}

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, Error>;
