//! Value model for document content.
//!
//! [`Value`] is the JSON-superset type stored in documents: the usual JSON
//! scalars and containers plus [`NumArray`], a homogeneous numeric array that
//! the codec carries out-of-band as raw little-endian bytes instead of JSON
//! text.

use indexmap::IndexMap;
use serde_json::Value as JsonValue;
use std::fmt;

use crate::error::{Error, Result};

/// A document value.
///
/// Numbers are canonical: any unsigned integer that fits `i64` is stored as
/// [`Value::Int`], so a value survives a JSON text round trip unchanged.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    UInt(u64),
    Float(f64),
    Str(String),
    List(Vec<Value>),
    Map(IndexMap<String, Value>),
    NumArray(NumArray),
}

impl Value {
    /// Short name of the variant, for error messages.
    pub fn kind_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::UInt(_) => "uint",
            Value::Float(_) => "float",
            Value::Str(_) => "string",
            Value::List(_) => "list",
            Value::Map(_) => "map",
            Value::NumArray(_) => "numeric array",
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            Value::UInt(u) => i64::try_from(*u).ok(),
            _ => None,
        }
    }

    /// Unsigned view of an integer value, accepting both integer variants.
    pub fn as_u64(&self) -> Option<u64> {
        match self {
            Value::Int(i) if *i >= 0 => Some(*i as u64),
            Value::UInt(u) => Some(*u),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int(i) => Some(*i as f64),
            Value::UInt(u) => Some(*u as f64),
            Value::Float(f) => Some(*f),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Value::List(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&IndexMap<String, Value>> {
        match self {
            Value::Map(entries) => Some(entries),
            _ => None,
        }
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<i32> for Value {
    fn from(i: i32) -> Self {
        Value::Int(i64::from(i))
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Int(i)
    }
}

impl From<u32> for Value {
    fn from(u: u32) -> Self {
        Value::Int(i64::from(u))
    }
}

impl From<u64> for Value {
    fn from(u: u64) -> Self {
        match i64::try_from(u) {
            Ok(i) => Value::Int(i),
            Err(_) => Value::UInt(u),
        }
    }
}

impl From<f64> for Value {
    fn from(f: f64) -> Self {
        Value::Float(f)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Str(s.to_owned())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Str(s)
    }
}

impl From<Vec<Value>> for Value {
    fn from(items: Vec<Value>) -> Self {
        Value::List(items)
    }
}

impl From<IndexMap<String, Value>> for Value {
    fn from(entries: IndexMap<String, Value>) -> Self {
        Value::Map(entries)
    }
}

impl From<NumArray> for Value {
    fn from(arr: NumArray) -> Self {
        Value::NumArray(arr)
    }
}

impl From<JsonValue> for Value {
    fn from(json: JsonValue) -> Self {
        match json {
            JsonValue::Null => Value::Null,
            JsonValue::Bool(b) => Value::Bool(b),
            JsonValue::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Value::Int(i)
                } else if let Some(u) = n.as_u64() {
                    Value::UInt(u)
                } else {
                    Value::Float(n.as_f64().unwrap_or(0.0))
                }
            }
            JsonValue::String(s) => Value::Str(s),
            JsonValue::Array(items) => Value::List(items.into_iter().map(Value::from).collect()),
            JsonValue::Object(entries) => Value::Map(
                entries
                    .into_iter()
                    .map(|(k, v)| (k, Value::from(v)))
                    .collect(),
            ),
        }
    }
}

/// Lossy in one case only: numeric arrays have no native JSON form and become
/// plain arrays of numbers. Non-finite floats become `null`, as in JSON text.
impl From<Value> for JsonValue {
    fn from(value: Value) -> Self {
        match value {
            Value::Null => JsonValue::Null,
            Value::Bool(b) => JsonValue::Bool(b),
            Value::Int(i) => JsonValue::Number(i.into()),
            Value::UInt(u) => JsonValue::Number(u.into()),
            Value::Float(f) => serde_json::Number::from_f64(f)
                .map_or(JsonValue::Null, JsonValue::Number),
            Value::Str(s) => JsonValue::String(s),
            Value::List(items) => JsonValue::Array(items.into_iter().map(JsonValue::from).collect()),
            Value::Map(entries) => JsonValue::Object(
                entries
                    .into_iter()
                    .map(|(k, v)| (k, JsonValue::from(v)))
                    .collect(),
            ),
            Value::NumArray(arr) => JsonValue::Array(arr.to_json_numbers()),
        }
    }
}

/// Element type of a [`NumArray`], with its fixed wire type code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum NumKind {
    U8 = 1,
    U16 = 2,
    U32 = 3,
    I8 = 4,
    I16 = 5,
    I32 = 6,
    F32 = 7,
    F64 = 8,
}

impl NumKind {
    /// Wire type code.
    pub fn code(self) -> u32 {
        self as u32
    }

    /// Size of one element in bytes.
    pub fn elem_size(self) -> usize {
        match self {
            NumKind::U8 | NumKind::I8 => 1,
            NumKind::U16 | NumKind::I16 => 2,
            NumKind::U32 | NumKind::I32 | NumKind::F32 => 4,
            NumKind::F64 => 8,
        }
    }
}

impl TryFrom<u32> for NumKind {
    type Error = Error;

    fn try_from(code: u32) -> Result<Self> {
        match code {
            1 => Ok(NumKind::U8),
            2 => Ok(NumKind::U16),
            3 => Ok(NumKind::U32),
            4 => Ok(NumKind::I8),
            5 => Ok(NumKind::I16),
            6 => Ok(NumKind::I32),
            7 => Ok(NumKind::F32),
            8 => Ok(NumKind::F64),
            other => Err(Error::UnknownAddendumType(other)),
        }
    }
}

impl fmt::Display for NumKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            NumKind::U8 => "u8",
            NumKind::U16 => "u16",
            NumKind::U32 => "u32",
            NumKind::I8 => "i8",
            NumKind::I16 => "i16",
            NumKind::I32 => "i32",
            NumKind::F32 => "f32",
            NumKind::F64 => "f64",
        };
        f.write_str(name)
    }
}

/// Homogeneous numeric array.
///
/// The codec lifts these out of the JSON shadow tree and transports them as
/// raw little-endian bytes, so round trips are bit-exact for every element,
/// floats included.
#[derive(Debug, Clone, PartialEq)]
pub enum NumArray {
    U8(Vec<u8>),
    U16(Vec<u16>),
    U32(Vec<u32>),
    I8(Vec<i8>),
    I16(Vec<i16>),
    I32(Vec<i32>),
    F32(Vec<f32>),
    F64(Vec<f64>),
}

macro_rules! num_array_from {
    ($elem:ty, $variant:ident) => {
        impl From<Vec<$elem>> for NumArray {
            fn from(items: Vec<$elem>) -> Self {
                NumArray::$variant(items)
            }
        }
    };
}

num_array_from!(u8, U8);
num_array_from!(u16, U16);
num_array_from!(u32, U32);
num_array_from!(i8, I8);
num_array_from!(i16, I16);
num_array_from!(i32, I32);
num_array_from!(f32, F32);
num_array_from!(f64, F64);

impl NumArray {
    pub fn kind(&self) -> NumKind {
        match self {
            NumArray::U8(_) => NumKind::U8,
            NumArray::U16(_) => NumKind::U16,
            NumArray::U32(_) => NumKind::U32,
            NumArray::I8(_) => NumKind::I8,
            NumArray::I16(_) => NumKind::I16,
            NumArray::I32(_) => NumKind::I32,
            NumArray::F32(_) => NumKind::F32,
            NumArray::F64(_) => NumKind::F64,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            NumArray::U8(items) => items.len(),
            NumArray::U16(items) => items.len(),
            NumArray::U32(items) => items.len(),
            NumArray::I8(items) => items.len(),
            NumArray::I16(items) => items.len(),
            NumArray::I32(items) => items.len(),
            NumArray::F32(items) => items.len(),
            NumArray::F64(items) => items.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Length of the raw byte representation.
    pub fn byte_len(&self) -> usize {
        self.len() * self.kind().elem_size()
    }

    /// Raw little-endian bytes, densely packed.
    pub fn to_le_bytes(&self) -> Vec<u8> {
        fn pack<T, const N: usize>(items: &[T], to_le: impl Fn(&T) -> [u8; N]) -> Vec<u8> {
            let mut bytes = Vec::with_capacity(items.len() * N);
            for item in items {
                bytes.extend_from_slice(&to_le(item));
            }
            bytes
        }

        match self {
            NumArray::U8(items) => items.clone(),
            NumArray::U16(items) => pack(items, |v| v.to_le_bytes()),
            NumArray::U32(items) => pack(items, |v| v.to_le_bytes()),
            NumArray::I8(items) => pack(items, |v| v.to_le_bytes()),
            NumArray::I16(items) => pack(items, |v| v.to_le_bytes()),
            NumArray::I32(items) => pack(items, |v| v.to_le_bytes()),
            NumArray::F32(items) => pack(items, |v| v.to_le_bytes()),
            NumArray::F64(items) => pack(items, |v| v.to_le_bytes()),
        }
    }

    /// Rebuild an array from raw little-endian bytes.
    ///
    /// The byte length must be a whole number of elements.
    pub fn from_le_bytes(kind: NumKind, bytes: &[u8]) -> Result<Self> {
        if bytes.len() % kind.elem_size() != 0 {
            return Err(Error::AddendumLength {
                kind,
                byte_len: bytes.len(),
            });
        }

        fn unpack<T, const N: usize>(bytes: &[u8], from_le: impl Fn([u8; N]) -> T) -> Vec<T> {
            bytes
                .chunks_exact(N)
                .map(|chunk| {
                    let mut buf = [0u8; N];
                    buf.copy_from_slice(chunk);
                    from_le(buf)
                })
                .collect()
        }

        Ok(match kind {
            NumKind::U8 => NumArray::U8(bytes.to_vec()),
            NumKind::U16 => NumArray::U16(unpack(bytes, u16::from_le_bytes)),
            NumKind::U32 => NumArray::U32(unpack(bytes, u32::from_le_bytes)),
            NumKind::I8 => NumArray::I8(unpack(bytes, i8::from_le_bytes)),
            NumKind::I16 => NumArray::I16(unpack(bytes, i16::from_le_bytes)),
            NumKind::I32 => NumArray::I32(unpack(bytes, i32::from_le_bytes)),
            NumKind::F32 => NumArray::F32(unpack(bytes, f32::from_le_bytes)),
            NumKind::F64 => NumArray::F64(unpack(bytes, f64::from_le_bytes)),
        })
    }

    fn to_json_numbers(&self) -> Vec<JsonValue> {
        fn ints<T: Copy + Into<i64>>(items: &[T]) -> Vec<JsonValue> {
            items
                .iter()
                .map(|v| {
                    let n: i64 = (*v).into();
                    JsonValue::Number(n.into())
                })
                .collect()
        }
        fn floats(items: impl Iterator<Item = f64>) -> Vec<JsonValue> {
            items
                .map(|v| serde_json::Number::from_f64(v).map_or(JsonValue::Null, JsonValue::Number))
                .collect()
        }

        match self {
            NumArray::U8(items) => ints(items),
            NumArray::U16(items) => ints(items),
            NumArray::U32(items) => ints(items),
            NumArray::I8(items) => ints(items),
            NumArray::I16(items) => ints(items),
            NumArray::I32(items) => ints(items),
            NumArray::F32(items) => floats(items.iter().map(|v| f64::from(*v))),
            NumArray::F64(items) => floats(items.iter().copied()),
        }
    }
}
