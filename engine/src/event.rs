//! Events: one record per mutation, plus the change descriptors delivered to
//! observers.
//!
//! An [`Event`] is immutable after construction. It is applied to the tree
//! the moment it is created, batched into the active transaction, and later
//! replayed on other replicas from its wire record. A [`Event::Null`] is the
//! tombstone of a mutation that lost a conflict during rebase: a no-op that
//! still occupies its slot in the sequence so relative ordering and counts
//! are preserved.
//!
//! Wire record (length-prefixed by the enclosing transaction frame):
//!
//! ```text
//! [u32 methodTag][u32 keyPathLen][keyPath JSON UTF-8][pad4] + per-method fields
//! ```
//!
//! Map values, map keys, and push payloads travel as length-prefixed
//! sections; a push payload is the codec encoding of a one-element list.

use std::collections::{BTreeMap, BTreeSet};

use crate::codec::{self, ByteReader, ByteWriter};
use crate::error::{Error, Result};
use crate::path::{KeyPath, PathStep};
use crate::value::Value;
use crate::ElementId;

const TAG_MAP_SET: u32 = 1;
const TAG_MAP_DELETE: u32 = 2;
const TAG_ARRAY_PUSH: u32 = 3;
const TAG_ARRAY_DELETE: u32 = 4;
const TAG_NULL: u32 = 5;

/// One recorded mutation.
///
/// For map events `path` addresses the container and `key` names the slot.
/// For array events the final step of `path` carries the element's stable id.
/// Values are in state form: nested lists are `[id, value]` pairs, so the
/// element ids a replica assigned locally are the ids every other replica
/// materializes.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    MapSet {
        path: KeyPath,
        key: String,
        value: Value,
    },
    MapDelete {
        path: KeyPath,
        key: String,
    },
    ArrayPush {
        path: KeyPath,
        value: Value,
    },
    ArrayDelete {
        path: KeyPath,
    },
    /// Tombstone of a mutation that lost a conflict. Applies as a no-op.
    Null,
}

impl Event {
    /// Wire method tag.
    pub fn tag(&self) -> u32 {
        match self {
            Event::MapSet { .. } => TAG_MAP_SET,
            Event::MapDelete { .. } => TAG_MAP_DELETE,
            Event::ArrayPush { .. } => TAG_ARRAY_PUSH,
            Event::ArrayDelete { .. } => TAG_ARRAY_DELETE,
            Event::Null => TAG_NULL,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Event::Null)
    }

    /// Full path of the slot this event mutates, including the final step.
    ///
    /// This is the path rebase compares: two events conflict only through
    /// their target paths. `None` for null events.
    pub fn target_path(&self) -> Option<KeyPath> {
        match self {
            Event::MapSet { path, key, .. } | Event::MapDelete { path, key } => {
                Some(path.child(PathStep::map(key.clone())))
            }
            Event::ArrayPush { path, .. } | Event::ArrayDelete { path } => Some(path.clone()),
            Event::Null => None,
        }
    }

    /// Serialize to a self-contained record.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut w = ByteWriter::new();
        w.u32(self.tag());
        let path = match self {
            Event::Null => return Ok(w.into_bytes()),
            Event::MapSet { path, .. }
            | Event::MapDelete { path, .. }
            | Event::ArrayPush { path, .. }
            | Event::ArrayDelete { path } => path,
        };
        let path_json =
            serde_json::to_vec(path).map_err(|e| Error::MalformedState(e.to_string()))?;
        w.u32(path_json.len() as u32);
        w.bytes(&path_json);
        w.pad4();

        match self {
            Event::MapSet { key, value, .. } => {
                write_text(&mut w, key);
                write_payload(&mut w, value)?;
            }
            Event::MapDelete { key, .. } => {
                write_text(&mut w, key);
            }
            Event::ArrayPush { value, .. } => {
                write_payload(&mut w, &Value::List(vec![value.clone()]))?;
            }
            Event::ArrayDelete { .. } | Event::Null => {}
        }
        Ok(w.into_bytes())
    }

    /// Deserialize one record.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let mut r = ByteReader::new(bytes);
        let tag = r.u32()?;
        if tag == TAG_NULL {
            return Ok(Event::Null);
        }

        let path_len = r.u32()? as usize;
        let path_bytes = r.bytes(path_len)?;
        r.pad4()?;
        let path: KeyPath = serde_json::from_slice(path_bytes)
            .map_err(|e| Error::MalformedState(format!("event key path: {e}")))?;

        match tag {
            TAG_MAP_SET => {
                let key = read_text(&mut r)?;
                let value = read_payload(&mut r)?;
                Ok(Event::MapSet { path, key, value })
            }
            TAG_MAP_DELETE => {
                let key = read_text(&mut r)?;
                Ok(Event::MapDelete { path, key })
            }
            TAG_ARRAY_PUSH => {
                let payload = read_payload(&mut r)?;
                let Value::List(mut items) = payload else {
                    return Err(Error::MalformedState(
                        "push payload is not a one-element list".into(),
                    ));
                };
                if items.len() != 1 {
                    return Err(Error::MalformedState(format!(
                        "push payload has {} elements, expected 1",
                        items.len()
                    )));
                }
                let value = items.pop().unwrap_or(Value::Null);
                Ok(Event::ArrayPush { path, value })
            }
            TAG_ARRAY_DELETE => Ok(Event::ArrayDelete { path }),
            other => Err(Error::UnknownEventTag(other)),
        }
    }
}

fn write_text(w: &mut ByteWriter, text: &str) {
    w.u32(text.len() as u32);
    w.bytes(text.as_bytes());
    w.pad4();
}

fn read_text(r: &mut ByteReader<'_>) -> Result<String> {
    let len = r.u32()? as usize;
    let bytes = r.bytes(len)?;
    r.pad4()?;
    String::from_utf8(bytes.to_vec())
        .map_err(|e| Error::MalformedState(format!("invalid UTF-8 in key: {e}")))
}

fn write_payload(w: &mut ByteWriter, value: &Value) -> Result<()> {
    let encoded = codec::encode_value(value)?;
    w.u32(encoded.len() as u32);
    w.bytes(&encoded);
    w.pad4();
    Ok(())
}

fn read_payload(r: &mut ByteReader<'_>) -> Result<Value> {
    let len = r.u32()? as usize;
    let bytes = r.bytes(len)?;
    r.pad4()?;
    codec::decode_value(bytes)
}

/// What one applied event changed in a map, delivered to that map's
/// observers.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct MapChange {
    /// Keys that did not exist before this event.
    pub added: BTreeSet<String>,
    /// Keys removed by this event.
    pub deleted: BTreeSet<String>,
    /// Per-key change records.
    pub entries: BTreeMap<String, EntryChange>,
}

/// What one applied event changed in an array, keyed by stable element id.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ArrayChange {
    /// Element ids inserted by this event.
    pub added: BTreeSet<ElementId>,
    /// Element ids removed by this event.
    pub deleted: BTreeSet<ElementId>,
    /// Per-element change records.
    pub entries: BTreeMap<ElementId, EntryChange>,
}

/// One slot's change record.
#[derive(Debug, Clone, PartialEq)]
pub struct EntryChange {
    pub action: ChangeAction,
    /// Plain value after the change; `None` for deletes.
    pub value: Option<Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeAction {
    Add,
    Update,
    Delete,
}

/// Either kind of change descriptor, paired with the mutated container.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Change {
    Map(MapChange),
    Array(ArrayChange),
}
