// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Self-describing value encoding.
//!
//! Every value starts with a one-byte tag. Scalars have fixed-size content,
//! strings and binaries carry a u32 LE length, containers carry a u32 LE
//! byte length followed by a u32 LE element count:
//!
//! ```text
//! +-----+----------------------------------------------+
//! | tag | content                                      |
//! +-----+----------------------------------------------+
//!  0x00   undefined                 (no content)
//!  0x01   null                      (no content)
//!  0x02   false / 0x03 true         (no content)
//!  0x04   int     i64 LE            (8 bytes)
//!  0x05   float   f64 LE            (8 bytes)
//!  0x06   string  len:u32 utf8[len]
//!  0x07   binary  len:u32 bytes[len]
//!  0x08   array   byte_len:u32 count:u32 value*
//!  0x09   object  byte_len:u32 count:u32 (key_len:u32 key value)*
//! ```
//!
//! `byte_len` of a container covers everything after the length field, so a
//! reader can skip or bound a container without parsing it.

use crate::error::ProtocolError;
use bytes::{BufMut, Bytes, BytesMut};
use serde::de::DeserializeOwned;
use serde::Serialize;

pub const TAG_UNDEFINED: u8 = 0x00;
pub const TAG_NULL: u8 = 0x01;
pub const TAG_FALSE: u8 = 0x02;
pub const TAG_TRUE: u8 = 0x03;
pub const TAG_INT: u8 = 0x04;
pub const TAG_FLOAT: u8 = 0x05;
pub const TAG_STRING: u8 = 0x06;
pub const TAG_BINARY: u8 = 0x07;
pub const TAG_ARRAY: u8 = 0x08;
pub const TAG_OBJECT: u8 = 0x09;

/// Size of a container header (tag + byte_len).
pub const CONTAINER_HEADER_SIZE: usize = 5;

/// Deepest container nesting the decoder accepts.
pub const MAX_DEPTH: usize = 64;

/// A structured argument value.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Value {
    #[default]
    Undefined,
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    Binary(Bytes),
    Array(Vec<Value>),
    /// Key order is preserved.
    Object(Vec<(String, Value)>),
}

impl Value {
    /// Build an object from key/value pairs.
    pub fn object<K, I>(entries: I) -> Self
    where
        K: Into<String>,
        I: IntoIterator<Item = (K, Value)>,
    {
        Self::Object(entries.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }

    /// Convert any serde-serializable value.
    ///
    /// Goes through `serde_json::Value`, so binary data ends up as an array
    /// of numbers; use [`Value::Binary`] directly for raw bytes.
    pub fn from_serialize<T: Serialize + ?Sized>(value: &T) -> Result<Self, serde_json::Error> {
        serde_json::to_value(value).map(Self::from)
    }

    /// Deserialize into a serde type.
    pub fn deserialize_into<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_value(self.to_json())
    }

    pub fn is_undefined(&self) -> bool {
        matches!(self, Self::Undefined)
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Float(f) => Some(*f),
            Self::Int(i) => Some(*i as f64),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&[Value]> {
        match self {
            Self::Array(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_binary(&self) -> Option<&Bytes> {
        match self {
            Self::Binary(b) => Some(b),
            _ => None,
        }
    }

    /// Look up an object member.
    pub fn get(&self, key: &str) -> Option<&Value> {
        match self {
            Self::Object(entries) => entries.iter().find(|(k, _)| k == key).map(|(_, v)| v),
            _ => None,
        }
    }

    /// Lossy conversion to JSON: `Undefined` becomes null, binary becomes
    /// an array of byte values, non-finite floats become null.
    pub fn to_json(&self) -> serde_json::Value {
        use serde_json::Value as Json;
        match self {
            Self::Undefined | Self::Null => Json::Null,
            Self::Bool(b) => Json::Bool(*b),
            Self::Int(i) => Json::from(*i),
            Self::Float(f) => serde_json::Number::from_f64(*f)
                .map(Json::Number)
                .unwrap_or(Json::Null),
            Self::String(s) => Json::String(s.clone()),
            Self::Binary(b) => Json::Array(b.iter().map(|byte| Json::from(*byte)).collect()),
            Self::Array(items) => Json::Array(items.iter().map(Self::to_json).collect()),
            Self::Object(entries) => Json::Object(
                entries
                    .iter()
                    .map(|(k, v)| (k.clone(), v.to_json()))
                    .collect(),
            ),
        }
    }

    /// Append the encoded form of this value to `buf`.
    pub fn encode(&self, buf: &mut BytesMut) {
        match self {
            Self::Undefined => buf.put_u8(TAG_UNDEFINED),
            Self::Null => buf.put_u8(TAG_NULL),
            Self::Bool(false) => buf.put_u8(TAG_FALSE),
            Self::Bool(true) => buf.put_u8(TAG_TRUE),
            Self::Int(i) => {
                buf.put_u8(TAG_INT);
                buf.put_i64_le(*i);
            }
            Self::Float(f) => {
                buf.put_u8(TAG_FLOAT);
                buf.put_f64_le(*f);
            }
            Self::String(s) => {
                buf.put_u8(TAG_STRING);
                put_len_prefixed(buf, s.as_bytes());
            }
            Self::Binary(b) => {
                buf.put_u8(TAG_BINARY);
                put_len_prefixed(buf, b);
            }
            Self::Array(items) => encode_array(buf, items),
            Self::Object(entries) => {
                let len_pos = begin_container(buf, TAG_OBJECT, entries.len());
                for (key, value) in entries {
                    put_len_prefixed(buf, key.as_bytes());
                    value.encode(buf);
                }
                end_container(buf, len_pos);
            }
        }
    }

    /// Encode into a fresh buffer.
    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::new();
        self.encode(&mut buf);
        buf.freeze()
    }

    /// Length of the encoded form, without encoding.
    pub fn encoded_len(&self) -> usize {
        match self {
            Self::Undefined | Self::Null | Self::Bool(_) => 1,
            Self::Int(_) | Self::Float(_) => 9,
            Self::String(s) => 5 + s.len(),
            Self::Binary(b) => 5 + b.len(),
            Self::Array(items) => array_encoded_len(items),
            Self::Object(entries) => {
                CONTAINER_HEADER_SIZE
                    + 4
                    + entries
                        .iter()
                        .map(|(k, v)| 4 + k.len() + v.encoded_len())
                        .sum::<usize>()
            }
        }
    }

    /// Decode exactly one value occupying all of `src`.
    pub fn decode(src: &Bytes) -> Result<Self, ProtocolError> {
        let mut cursor = Cursor::new(src);
        let value = cursor.read_value()?;
        if cursor.remaining() != 0 {
            return Err(ProtocolError::InvalidMessage(format!(
                "{} trailing bytes after value",
                cursor.remaining()
            )));
        }
        Ok(value)
    }
}

/// Encode a slice as an array value.
pub fn encode_array(buf: &mut BytesMut, items: &[Value]) {
    let len_pos = begin_container(buf, TAG_ARRAY, items.len());
    for item in items {
        item.encode(buf);
    }
    end_container(buf, len_pos);
}

/// Encoded length of a slice written by [`encode_array`].
pub fn array_encoded_len(items: &[Value]) -> usize {
    CONTAINER_HEADER_SIZE + 4 + items.iter().map(Value::encoded_len).sum::<usize>()
}

fn put_len_prefixed(buf: &mut BytesMut, data: &[u8]) {
    buf.put_u32_le(data.len() as u32);
    buf.put_slice(data);
}

/// Write tag, a placeholder byte_len and the count; returns where byte_len lives.
pub(crate) fn begin_container(buf: &mut BytesMut, tag: u8, count: usize) -> usize {
    buf.put_u8(tag);
    let len_pos = buf.len();
    buf.put_u32_le(0);
    buf.put_u32_le(count as u32);
    len_pos
}

pub(crate) fn end_container(buf: &mut BytesMut, len_pos: usize) {
    let byte_len = (buf.len() - len_pos - 4) as u32;
    buf[len_pos..len_pos + 4].copy_from_slice(&byte_len.to_le_bytes());
}

/// Read cursor over a shared buffer; binary values are sliced, not copied.
pub(crate) struct Cursor<'a> {
    src: &'a Bytes,
    pos: usize,
    depth: usize,
}

impl<'a> Cursor<'a> {
    pub(crate) fn new(src: &'a Bytes) -> Self {
        Self {
            src,
            pos: 0,
            depth: 0,
        }
    }

    pub(crate) fn position(&self) -> usize {
        self.pos
    }

    pub(crate) fn remaining(&self) -> usize {
        self.src.len() - self.pos
    }

    fn need(&self, n: usize) -> Result<(), ProtocolError> {
        if self.remaining() < n {
            return Err(ProtocolError::Truncated {
                needed: n,
                available: self.remaining(),
            });
        }
        Ok(())
    }

    pub(crate) fn read_u8(&mut self) -> Result<u8, ProtocolError> {
        self.need(1)?;
        let b = self.src[self.pos];
        self.pos += 1;
        Ok(b)
    }

    pub(crate) fn read_u32(&mut self) -> Result<u32, ProtocolError> {
        self.need(4)?;
        let mut raw = [0u8; 4];
        raw.copy_from_slice(&self.src[self.pos..self.pos + 4]);
        self.pos += 4;
        Ok(u32::from_le_bytes(raw))
    }

    fn read_8(&mut self) -> Result<[u8; 8], ProtocolError> {
        self.need(8)?;
        let mut raw = [0u8; 8];
        raw.copy_from_slice(&self.src[self.pos..self.pos + 8]);
        self.pos += 8;
        Ok(raw)
    }

    pub(crate) fn read_slice(&mut self, len: usize) -> Result<Bytes, ProtocolError> {
        self.need(len)?;
        let out = self.src.slice(self.pos..self.pos + len);
        self.pos += len;
        Ok(out)
    }

    fn read_string(&mut self) -> Result<String, ProtocolError> {
        let len = self.read_u32()? as usize;
        let raw = self.read_slice(len)?;
        String::from_utf8(raw.to_vec()).map_err(|_| ProtocolError::InvalidUtf8)
    }

    /// Skip over one encoded value and return its raw bytes.
    pub(crate) fn read_raw_value(&mut self) -> Result<Bytes, ProtocolError> {
        let start = self.pos;
        let tag = self.read_u8()?;
        match tag {
            TAG_UNDEFINED | TAG_NULL | TAG_FALSE | TAG_TRUE => {}
            TAG_INT | TAG_FLOAT => {
                self.read_8()?;
            }
            TAG_STRING | TAG_BINARY | TAG_ARRAY | TAG_OBJECT => {
                let len = self.read_u32()? as usize;
                self.read_slice(len)?;
            }
            other => return Err(ProtocolError::UnknownTag(other)),
        }
        Ok(self.src.slice(start..self.pos))
    }

    pub(crate) fn read_value(&mut self) -> Result<Value, ProtocolError> {
        let tag = self.read_u8()?;
        let value = match tag {
            TAG_UNDEFINED => Value::Undefined,
            TAG_NULL => Value::Null,
            TAG_FALSE => Value::Bool(false),
            TAG_TRUE => Value::Bool(true),
            TAG_INT => Value::Int(i64::from_le_bytes(self.read_8()?)),
            TAG_FLOAT => Value::Float(f64::from_le_bytes(self.read_8()?)),
            TAG_STRING => Value::String(self.read_string()?),
            TAG_BINARY => {
                let len = self.read_u32()? as usize;
                Value::Binary(self.read_slice(len)?)
            }
            TAG_ARRAY => {
                self.enter()?;
                let end = self.container_end()?;
                let count = self.read_u32()? as usize;
                let mut items = Vec::with_capacity(count.min(self.remaining()));
                for _ in 0..count {
                    items.push(self.read_value()?);
                }
                self.check_container_end(end)?;
                self.depth -= 1;
                Value::Array(items)
            }
            TAG_OBJECT => {
                self.enter()?;
                let end = self.container_end()?;
                let count = self.read_u32()? as usize;
                let mut entries = Vec::with_capacity(count.min(self.remaining()));
                for _ in 0..count {
                    let key = self.read_string()?;
                    let value = self.read_value()?;
                    entries.push((key, value));
                }
                self.check_container_end(end)?;
                self.depth -= 1;
                Value::Object(entries)
            }
            other => return Err(ProtocolError::UnknownTag(other)),
        };
        Ok(value)
    }

    fn enter(&mut self) -> Result<(), ProtocolError> {
        if self.depth >= MAX_DEPTH {
            return Err(ProtocolError::InvalidMessage(format!(
                "nesting too deep (max {})",
                MAX_DEPTH
            )));
        }
        self.depth += 1;
        Ok(())
    }

    fn container_end(&mut self) -> Result<usize, ProtocolError> {
        let byte_len = self.read_u32()? as usize;
        self.need(byte_len)?;
        Ok(self.pos + byte_len)
    }

    fn check_container_end(&self, end: usize) -> Result<(), ProtocolError> {
        if self.pos != end {
            return Err(ProtocolError::InvalidMessage(format!(
                "container length mismatch: declared end {}, parsed to {}",
                end, self.pos
            )));
        }
        Ok(())
    }
}

impl From<serde_json::Value> for Value {
    fn from(json: serde_json::Value) -> Self {
        use serde_json::Value as Json;
        match json {
            Json::Null => Self::Null,
            Json::Bool(b) => Self::Bool(b),
            Json::Number(n) => match n.as_i64() {
                Some(i) => Self::Int(i),
                None => Self::Float(n.as_f64().unwrap_or(f64::NAN)),
            },
            Json::String(s) => Self::String(s),
            Json::Array(items) => Self::Array(items.into_iter().map(Self::from).collect()),
            Json::Object(map) => Self::Object(map.into_iter().map(|(k, v)| (k, v.into())).collect()),
        }
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Self::Bool(b)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Self::Int(i)
    }
}

impl From<i32> for Value {
    fn from(i: i32) -> Self {
        Self::Int(i64::from(i))
    }
}

impl From<u32> for Value {
    fn from(i: u32) -> Self {
        Self::Int(i64::from(i))
    }
}

impl From<f64> for Value {
    fn from(f: f64) -> Self {
        Self::Float(f)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Self::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Self::String(s)
    }
}

impl From<Bytes> for Value {
    fn from(b: Bytes) -> Self {
        Self::Binary(b)
    }
}

impl From<Vec<u8>> for Value {
    fn from(b: Vec<u8>) -> Self {
        Self::Binary(Bytes::from(b))
    }
}

impl From<Vec<Value>> for Value {
    fn from(items: Vec<Value>) -> Self {
        Self::Array(items)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(opt: Option<T>) -> Self {
        opt.map(Into::into).unwrap_or(Self::Null)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(value: &Value) -> Value {
        Value::decode(&value.to_bytes()).unwrap()
    }

    #[test]
    fn test_scalar_encoding_layout() {
        assert_eq!(Value::Undefined.to_bytes().as_ref(), &[TAG_UNDEFINED]);
        assert_eq!(Value::Bool(true).to_bytes().as_ref(), &[TAG_TRUE]);

        let bytes = Value::Int(1).to_bytes();
        assert_eq!(bytes[0], TAG_INT);
        assert_eq!(&bytes[1..], &1i64.to_le_bytes());
    }

    #[test]
    fn test_int_and_float_stay_distinct() {
        assert_eq!(roundtrip(&Value::Int(2)), Value::Int(2));
        assert_eq!(roundtrip(&Value::Float(2.0)), Value::Float(2.0));
        assert_ne!(roundtrip(&Value::Float(2.0)), Value::Int(2));
        assert_eq!(roundtrip(&Value::Int(i64::MIN)), Value::Int(i64::MIN));
    }

    #[test]
    fn test_float_bits_preserved() {
        let v = Value::Float(-0.0);
        match roundtrip(&v) {
            Value::Float(f) => assert_eq!(f.to_bits(), (-0.0f64).to_bits()),
            other => panic!("Expected float, got {other:?}"),
        }
    }

    #[test]
    fn test_nested_object() {
        let v = Value::object([
            ("name", Value::from("sensor")),
            ("tags", Value::Array(vec!["a".into(), "b".into()])),
            (
                "inner",
                Value::object([("n", Value::Int(1)), ("none", Value::Undefined)]),
            ),
        ]);
        let back = roundtrip(&v);
        assert_eq!(back, v);
        assert_eq!(back.get("name").and_then(Value::as_str), Some("sensor"));
    }

    #[test]
    fn test_binary_is_sliced_from_source() {
        let payload = vec![0xde, 0xad, 0xbe, 0xef];
        let bytes = Value::from(payload.clone()).to_bytes();
        let back = Value::decode(&bytes).unwrap();
        assert_eq!(back.as_binary().map(|b| b.to_vec()), Some(payload));
    }

    #[test]
    fn test_container_length_covers_contents() {
        let bytes = Value::Array(vec![Value::Int(5), Value::Null]).to_bytes();
        let byte_len = u32::from_le_bytes([bytes[1], bytes[2], bytes[3], bytes[4]]) as usize;
        assert_eq!(byte_len + CONTAINER_HEADER_SIZE, bytes.len());
    }

    #[test]
    fn test_encoded_len_matches_encoding() {
        let v = Value::object([
            ("s", Value::from("héllo")),
            ("b", Value::from(vec![1u8, 2, 3])),
            (
                "l",
                Value::Array(vec![Value::Int(1), Value::Float(0.5), Value::Bool(false)]),
            ),
            ("u", Value::Undefined),
            ("o", Value::object([("n", Value::Null)])),
        ]);
        assert_eq!(v.encoded_len(), v.to_bytes().len());
        assert_eq!(Value::Array(vec![]).encoded_len(), 9);
    }

    #[test]
    fn test_unknown_tag() {
        let bytes = Bytes::from_static(&[0x7f]);
        assert_eq!(Value::decode(&bytes), Err(ProtocolError::UnknownTag(0x7f)));
    }

    #[test]
    fn test_truncated_string() {
        let mut buf = BytesMut::new();
        buf.put_u8(TAG_STRING);
        buf.put_u32_le(10);
        buf.put_slice(b"abc");
        assert!(matches!(
            Value::decode(&buf.freeze()),
            Err(ProtocolError::Truncated { .. })
        ));
    }

    #[test]
    fn test_invalid_utf8() {
        let mut buf = BytesMut::new();
        buf.put_u8(TAG_STRING);
        buf.put_u32_le(2);
        buf.put_slice(&[0xff, 0xfe]);
        assert_eq!(Value::decode(&buf.freeze()), Err(ProtocolError::InvalidUtf8));
    }

    /// `depth` arrays nested inside each other around a null.
    fn nested_arrays(depth: usize) -> BytesMut {
        let mut buf = BytesMut::with_capacity(depth * 9 + 1);
        for level in (1..=depth).rev() {
            buf.put_u8(TAG_ARRAY);
            buf.put_u32_le((4 + 1 + 9 * (level - 1)) as u32);
            buf.put_u32_le(1);
        }
        buf.put_u8(TAG_NULL);
        buf
    }

    #[test]
    fn test_deep_nesting_is_rejected() {
        let bytes = nested_arrays(10_000).freeze();
        let err = Value::decode(&bytes).unwrap_err();
        assert!(matches!(err, ProtocolError::InvalidMessage(ref m) if m.contains("nesting")));
        assert!(!err.is_fatal());

        let mut buf = BytesMut::new();
        buf.put_u8(TAG_OBJECT);
        buf.put_u32_le((4 + 4 + 1 + bytes.len()) as u32);
        buf.put_u32_le(1);
        put_len_prefixed(&mut buf, b"k");
        buf.put_slice(&bytes);
        assert!(matches!(
            Value::decode(&buf.freeze()),
            Err(ProtocolError::InvalidMessage(_))
        ));
    }

    #[test]
    fn test_nesting_up_to_limit_decodes() {
        let mut value = Value::decode(&nested_arrays(MAX_DEPTH).freeze()).unwrap();
        let mut levels = 0;
        while let Value::Array(mut items) = value {
            levels += 1;
            value = items.pop().unwrap_or_default();
        }
        assert_eq!(levels, MAX_DEPTH);
        assert_eq!(value, Value::Null);

        assert!(Value::decode(&nested_arrays(MAX_DEPTH + 1).freeze()).is_err());
    }

    #[test]
    fn test_json_conversion() {
        let json = serde_json::json!({"n": 1, "f": 1.5, "s": "x", "l": [true, null]});
        let value = Value::from(json.clone());
        assert_eq!(value.get("n"), Some(&Value::Int(1)));
        assert_eq!(value.get("f"), Some(&Value::Float(1.5)));
        assert_eq!(value.to_json(), json);
    }

    #[test]
    fn test_serde_helpers() {
        #[derive(serde::Serialize, serde::Deserialize, PartialEq, Debug)]
        struct Reading {
            sensor: String,
            value: i64,
        }

        let reading = Reading {
            sensor: "t1".into(),
            value: 21,
        };
        let value = Value::from_serialize(&reading).unwrap();
        let back: Reading = value.deserialize_into().unwrap();
        assert_eq!(back, reading);
    }
}
