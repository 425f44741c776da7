//! Binary codec for document values.
//!
//! A value tree is serialized in two parts: a JSON-shaped shadow tree carrying
//! every scalar and container, and an out-of-band addendum section carrying
//! the raw bytes of every embedded [`NumArray`]. Encoder and decoder walk the
//! tree in the same depth-first order, assigning each visited node a 1-based
//! visitation index; an addendum records the index at which its array was
//! lifted out, and the decoder splices it back in when its walk reaches that
//! index.
//!
//! Buffer layout, all `u32`s little-endian, each section zero-padded to
//! 4-byte alignment:
//!
//! ```text
//! [u32 shadowLen][shadow JSON UTF-8][pad4]
//! [u32 addendumCount]
//! { [u32 index][u32 typeCode][u32 byteLen][bytes][pad4] }*
//! ```

use serde_json::Value as JsonValue;

use crate::error::{Error, Result};
use crate::value::{NumArray, NumKind, Value};

/// Round `n` up to the next multiple of 4.
fn align4(n: usize) -> usize {
    (n + 3) & !3
}

/// Growable output buffer with 4-byte alignment helpers.
#[derive(Debug, Default)]
pub(crate) struct ByteWriter {
    buf: Vec<u8>,
}

impl ByteWriter {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn u32(&mut self, v: u32) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    pub(crate) fn bytes(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Zero-pad to the next 4-byte boundary.
    pub(crate) fn pad4(&mut self) {
        self.buf.resize(align4(self.buf.len()), 0);
    }

    pub(crate) fn into_bytes(self) -> Vec<u8> {
        self.buf
    }
}

/// Bounds-checked cursor over an input buffer.
#[derive(Debug)]
pub(crate) struct ByteReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> ByteReader<'a> {
    pub(crate) fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8]> {
        let available = self.buf.len() - self.pos;
        if available < len {
            return Err(Error::EndOfBuffer {
                offset: self.pos,
                needed: len - available,
            });
        }
        let slice = &self.buf[self.pos..self.pos + len];
        self.pos += len;
        Ok(slice)
    }

    pub(crate) fn u32(&mut self) -> Result<u32> {
        let bytes = self.take(4)?;
        Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    pub(crate) fn bytes(&mut self, len: usize) -> Result<&'a [u8]> {
        self.take(len)
    }

    /// Skip padding up to the next 4-byte boundary.
    pub(crate) fn pad4(&mut self) -> Result<()> {
        let aligned = align4(self.pos);
        if aligned > self.buf.len() {
            return Err(Error::EndOfBuffer {
                offset: self.pos,
                needed: aligned - self.buf.len(),
            });
        }
        self.pos = aligned;
        Ok(())
    }

    /// Everything after the cursor.
    pub(crate) fn rest(&mut self) -> &'a [u8] {
        let slice = &self.buf[self.pos..];
        self.pos = self.buf.len();
        slice
    }
}

/// Encode a value tree into one contiguous buffer.
///
/// Deterministic: the same value always produces the same bytes.
pub fn encode_value(value: &Value) -> Result<Vec<u8>> {
    let mut counter = 0u32;
    let mut addenda: Vec<(u32, &NumArray)> = Vec::new();
    let shadow = build_shadow(value, &mut counter, &mut addenda);
    let text = serde_json::to_vec(&shadow).map_err(|e| Error::ShadowTree(e.to_string()))?;

    let mut w = ByteWriter::new();
    w.u32(text.len() as u32);
    w.bytes(&text);
    w.pad4();
    w.u32(addenda.len() as u32);
    for (index, arr) in addenda {
        let bytes = arr.to_le_bytes();
        w.u32(index);
        w.u32(arr.kind().code());
        w.u32(bytes.len() as u32);
        w.bytes(&bytes);
        w.pad4();
    }
    Ok(w.into_bytes())
}

/// One pre-order step of the encode walk. Numeric arrays leave a `null`
/// placeholder in the shadow tree and are recorded against the current
/// visitation index.
fn build_shadow<'a>(
    value: &'a Value,
    counter: &mut u32,
    addenda: &mut Vec<(u32, &'a NumArray)>,
) -> JsonValue {
    *counter += 1;
    match value {
        Value::NumArray(arr) => {
            addenda.push((*counter, arr));
            JsonValue::Null
        }
        Value::List(items) => JsonValue::Array(
            items
                .iter()
                .map(|item| build_shadow(item, counter, addenda))
                .collect(),
        ),
        Value::Map(entries) => JsonValue::Object(
            entries
                .iter()
                .map(|(k, v)| (k.clone(), build_shadow(v, counter, addenda)))
                .collect(),
        ),
        Value::Null => JsonValue::Null,
        Value::Bool(b) => JsonValue::Bool(*b),
        Value::Int(i) => JsonValue::Number((*i).into()),
        Value::UInt(u) => JsonValue::Number((*u).into()),
        Value::Float(f) => serde_json::Number::from_f64(*f).map_or(JsonValue::Null, JsonValue::Number),
        Value::Str(s) => JsonValue::String(s.clone()),
    }
}

/// Decode a buffer produced by [`encode_value`].
///
/// Every addendum must bind to exactly one position of the shadow walk;
/// leftovers or an unknown type code fail the decode.
pub fn decode_value(bytes: &[u8]) -> Result<Value> {
    let mut r = ByteReader::new(bytes);

    let shadow_len = r.u32()? as usize;
    let text = r.bytes(shadow_len)?;
    r.pad4()?;
    let shadow: JsonValue =
        serde_json::from_slice(text).map_err(|e| Error::ShadowTree(e.to_string()))?;

    let count = r.u32()? as usize;
    let mut addenda: Vec<(u32, NumArray)> = Vec::with_capacity(count);
    for _ in 0..count {
        let index = r.u32()?;
        let code = r.u32()?;
        let byte_len = r.u32()? as usize;
        let kind = NumKind::try_from(code)?;
        let arr = NumArray::from_le_bytes(kind, r.bytes(byte_len)?)?;
        r.pad4()?;
        addenda.push((index, arr));
    }

    let mut counter = 0u32;
    let mut next = 0usize;
    let value = rebuild(&shadow, &mut counter, &addenda, &mut next)?;
    if next != addenda.len() {
        return Err(Error::AddendumMismatch {
            consumed: next,
            total: addenda.len(),
        });
    }
    Ok(value)
}

/// Mirror of [`build_shadow`]: same walk, same index assignment. When the
/// current index matches the next pending addendum, the recorded array is
/// substituted and the shadow placeholder is not descended into.
fn rebuild(
    shadow: &JsonValue,
    counter: &mut u32,
    addenda: &[(u32, NumArray)],
    next: &mut usize,
) -> Result<Value> {
    *counter += 1;
    if let Some((index, arr)) = addenda.get(*next) {
        if *index == *counter {
            *next += 1;
            return Ok(Value::NumArray(arr.clone()));
        }
    }
    Ok(match shadow {
        JsonValue::Null => Value::Null,
        JsonValue::Bool(b) => Value::Bool(*b),
        JsonValue::Number(n) => {
            if let Some(i) = n.as_i64() {
                Value::Int(i)
            } else if let Some(u) = n.as_u64() {
                Value::UInt(u)
            } else {
                Value::Float(n.as_f64().unwrap_or(0.0))
            }
        }
        JsonValue::String(s) => Value::Str(s.clone()),
        JsonValue::Array(items) => {
            let mut out = Vec::with_capacity(items.len());
            for item in items {
                out.push(rebuild(item, counter, addenda, next)?);
            }
            Value::List(out)
        }
        JsonValue::Object(entries) => {
            let mut out = indexmap::IndexMap::with_capacity(entries.len());
            for (k, v) in entries {
                out.insert(k.clone(), rebuild(v, counter, addenda, next)?);
            }
            Value::Map(out)
        }
    })
}
