//! Typed-value codec: the primitive layer of the wire format.
//!
//! Every property, ping timestamp, and event field travels as a *typed
//! value*: a one-byte type tag followed by a big-endian body. Values are
//! self-delimiting, so lists and dicts nest without outer length prefixes.

use indexmap::IndexMap;

use crate::ProtocolError;

/// Wire type tags. The numeric values are fixed by the protocol and must
/// never be reordered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Type {
    Null = 0,
    False = 1,
    True = 2,
    SByte = 3,
    Byte = 4,
    Short = 5,
    UShort = 6,
    Int = 7,
    UInt = 8,
    Long = 9,
    ULong = 10,
    Float = 11,
    Double = 12,
    Decimal = 13,
    Str8 = 14,
    Str16 = 15,
    Bytes = 16,
    List = 17,
    Dict = 18,
    Obj = 19,
}

impl Type {
    /// Maps a wire tag back to a `Type`. Unknown tags are a decode error,
    /// never silently skipped.
    pub fn from_tag(tag: u8) -> Result<Self, ProtocolError> {
        Ok(match tag {
            0 => Self::Null,
            1 => Self::False,
            2 => Self::True,
            3 => Self::SByte,
            4 => Self::Byte,
            5 => Self::Short,
            6 => Self::UShort,
            7 => Self::Int,
            8 => Self::UInt,
            9 => Self::Long,
            10 => Self::ULong,
            11 => Self::Float,
            12 => Self::Double,
            13 => Self::Decimal,
            14 => Self::Str8,
            15 => Self::Str16,
            16 => Self::Bytes,
            17 => Self::List,
            18 => Self::Dict,
            19 => Self::Obj,
            other => return Err(ProtocolError::UnknownType(other)),
        })
    }
}

/// A decoded typed value.
///
/// `Str` covers both `Str8` and `Str16` on the wire: encode picks the
/// short form when the UTF-8 byte length fits in one byte.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    SByte(i8),
    Byte(u8),
    Short(i16),
    UShort(u16),
    Int(i32),
    UInt(u32),
    Long(i64),
    ULong(u64),
    Float(f32),
    Double(f64),
    /// Raw 128-bit decimal, carried opaquely.
    Decimal(u128),
    Str(String),
    Bytes(Vec<u8>),
    List(Vec<Value>),
    Dict(Dict),
    Obj { class: u8, body: Vec<u8> },
}

impl Value {
    /// Encodes this value as a standalone typed value.
    pub fn marshal(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        self.marshal_into(&mut buf);
        buf
    }

    /// Appends the encoding of this value to `buf`.
    pub fn marshal_into(&self, buf: &mut Vec<u8>) {
        match self {
            Value::Null => buf.push(Type::Null as u8),
            Value::Bool(false) => buf.push(Type::False as u8),
            Value::Bool(true) => buf.push(Type::True as u8),
            Value::SByte(v) => {
                buf.push(Type::SByte as u8);
                buf.extend_from_slice(&v.to_be_bytes());
            }
            Value::Byte(v) => {
                buf.push(Type::Byte as u8);
                buf.push(*v);
            }
            Value::Short(v) => {
                buf.push(Type::Short as u8);
                buf.extend_from_slice(&v.to_be_bytes());
            }
            Value::UShort(v) => {
                buf.push(Type::UShort as u8);
                buf.extend_from_slice(&v.to_be_bytes());
            }
            Value::Int(v) => {
                buf.push(Type::Int as u8);
                buf.extend_from_slice(&v.to_be_bytes());
            }
            Value::UInt(v) => {
                buf.push(Type::UInt as u8);
                buf.extend_from_slice(&v.to_be_bytes());
            }
            Value::Long(v) => {
                buf.push(Type::Long as u8);
                buf.extend_from_slice(&v.to_be_bytes());
            }
            Value::ULong(v) => {
                buf.push(Type::ULong as u8);
                buf.extend_from_slice(&v.to_be_bytes());
            }
            Value::Float(v) => {
                buf.push(Type::Float as u8);
                buf.extend_from_slice(&v.to_be_bytes());
            }
            Value::Double(v) => {
                buf.push(Type::Double as u8);
                buf.extend_from_slice(&v.to_be_bytes());
            }
            Value::Decimal(v) => {
                buf.push(Type::Decimal as u8);
                buf.extend_from_slice(&v.to_be_bytes());
            }
            Value::Str(s) => marshal_str(s, buf),
            Value::Bytes(b) => {
                buf.push(Type::Bytes as u8);
                buf.extend_from_slice(&(b.len() as u16).to_be_bytes());
                buf.extend_from_slice(b);
            }
            Value::List(items) => {
                buf.push(Type::List as u8);
                buf.push(items.len() as u8);
                for item in items {
                    item.marshal_into(buf);
                }
            }
            Value::Dict(d) => d.marshal_into(buf),
            Value::Obj { class, body } => {
                buf.push(Type::Obj as u8);
                buf.push(*class);
                buf.extend_from_slice(&(body.len() as u16).to_be_bytes());
                buf.extend_from_slice(body);
            }
        }
    }

    /// Decodes one typed value from the front of `data`.
    ///
    /// Returns the value and the number of bytes consumed, so callers can
    /// walk a payload of several concatenated values.
    pub fn unmarshal(data: &[u8]) -> Result<(Value, usize), ProtocolError> {
        let (&tag, rest) = data
            .split_first()
            .ok_or(ProtocolError::TooShort(data.len()))?;
        let ty = Type::from_tag(tag)?;
        let (value, body_len) = match ty {
            Type::Null => (Value::Null, 0),
            Type::False => (Value::Bool(false), 0),
            Type::True => (Value::Bool(true), 0),
            Type::SByte => (Value::SByte(take::<1>(rest)?[0] as i8), 1),
            Type::Byte => (Value::Byte(take::<1>(rest)?[0]), 1),
            Type::Short => (Value::Short(i16::from_be_bytes(take::<2>(rest)?)), 2),
            Type::UShort => (Value::UShort(u16::from_be_bytes(take::<2>(rest)?)), 2),
            Type::Int => (Value::Int(i32::from_be_bytes(take::<4>(rest)?)), 4),
            Type::UInt => (Value::UInt(u32::from_be_bytes(take::<4>(rest)?)), 4),
            Type::Long => (Value::Long(i64::from_be_bytes(take::<8>(rest)?)), 8),
            Type::ULong => (Value::ULong(u64::from_be_bytes(take::<8>(rest)?)), 8),
            Type::Float => (Value::Float(f32::from_be_bytes(take::<4>(rest)?)), 4),
            Type::Double => (Value::Double(f64::from_be_bytes(take::<8>(rest)?)), 8),
            Type::Decimal => {
                (Value::Decimal(u128::from_be_bytes(take::<16>(rest)?)), 16)
            }
            Type::Str8 => {
                let len = take::<1>(rest)?[0] as usize;
                let s = take_str(&rest[1..], len)?;
                (Value::Str(s), 1 + len)
            }
            Type::Str16 => {
                let len = u16::from_be_bytes(take::<2>(rest)?) as usize;
                let s = take_str(&rest[2..], len)?;
                (Value::Str(s), 2 + len)
            }
            Type::Bytes => {
                let len = u16::from_be_bytes(take::<2>(rest)?) as usize;
                let b = take_slice(&rest[2..], len)?;
                (Value::Bytes(b.to_vec()), 2 + len)
            }
            Type::List => {
                let count = take::<1>(rest)?[0] as usize;
                let mut items = Vec::with_capacity(count);
                let mut used = 1;
                for _ in 0..count {
                    let (item, n) = Value::unmarshal(&rest[used..])?;
                    items.push(item);
                    used += n;
                }
                (Value::List(items), used)
            }
            Type::Dict => {
                let (dict, used) = Dict::unmarshal_body(rest)?;
                (Value::Dict(dict), used)
            }
            Type::Obj => {
                let class = take::<1>(rest)?[0];
                let len = u16::from_be_bytes(take::<2>(&rest[1..])?) as usize;
                let body = take_slice(&rest[3..], len)?;
                (
                    Value::Obj {
                        class,
                        body: body.to_vec(),
                    },
                    3 + len,
                )
            }
        };
        Ok((value, 1 + body_len))
    }

    /// Decodes one value and checks its wire type against `expected`.
    pub fn unmarshal_as(
        data: &[u8],
        expected: &[Type],
    ) -> Result<(Value, usize), ProtocolError> {
        let tag = *data.first().ok_or(ProtocolError::TooShort(0))?;
        let ty = Type::from_tag(tag)?;
        if !expected.contains(&ty) {
            return Err(ProtocolError::UnexpectedType {
                expected: expected.to_vec(),
                got: ty,
            });
        }
        Value::unmarshal(data)
    }

    /// Convenience for payload fields that must be short strings.
    pub fn unmarshal_str8(data: &[u8]) -> Result<(String, usize), ProtocolError> {
        match Value::unmarshal_as(data, &[Type::Str8])? {
            (Value::Str(s), n) => Ok((s, n)),
            _ => unreachable!("unmarshal_as checked the tag"),
        }
    }
}

fn marshal_str(s: &str, buf: &mut Vec<u8>) {
    let bytes = s.as_bytes();
    if bytes.len() <= u8::MAX as usize {
        buf.push(Type::Str8 as u8);
        buf.push(bytes.len() as u8);
    } else {
        buf.push(Type::Str16 as u8);
        buf.extend_from_slice(&(bytes.len() as u16).to_be_bytes());
    }
    buf.extend_from_slice(bytes);
}

fn take<const N: usize>(data: &[u8]) -> Result<[u8; N], ProtocolError> {
    data.get(..N)
        .ok_or(ProtocolError::TooShort(data.len()))?
        .try_into()
        .map_err(|_| ProtocolError::TooShort(data.len()))
}

fn take_slice(data: &[u8], len: usize) -> Result<&[u8], ProtocolError> {
    data.get(..len).ok_or(ProtocolError::TooShort(data.len()))
}

fn take_str(data: &[u8], len: usize) -> Result<String, ProtocolError> {
    let bytes = take_slice(data, len)?;
    String::from_utf8(bytes.to_vec()).map_err(|_| ProtocolError::InvalidUtf8)
}

// ---------------------------------------------------------------------------
// Dict
// ---------------------------------------------------------------------------

/// An insertion-ordered mapping from short string keys to *marshaled*
/// typed-value bytes.
///
/// Values stay in wire form on purpose: property merges move them around
/// without re-encoding, and a zero-length value is the wire-level "delete
/// this key" marker. Iteration order is the insertion order, which the
/// codec round-trip preserves.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Dict(IndexMap<String, Vec<u8>>);

impl Dict {
    pub fn new() -> Self {
        Self(IndexMap::new())
    }

    pub fn insert(&mut self, key: impl Into<String>, value: Vec<u8>) {
        self.0.insert(key.into(), value);
    }

    pub fn get(&self, key: &str) -> Option<&[u8]> {
        self.0.get(key).map(Vec::as_slice)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    /// Removes a key, preserving the order of the remaining entries.
    pub fn remove(&mut self, key: &str) -> Option<Vec<u8>> {
        self.0.shift_remove(key)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &[u8])> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_slice()))
    }

    /// Merges `delta` into this dict with the property-update rule: a
    /// zero-length value deletes an existing key, anything else replaces
    /// or appends.
    pub fn merge(&mut self, delta: &Dict) {
        for (k, v) in delta.iter() {
            if v.is_empty() && self.0.contains_key(k) {
                self.0.shift_remove(k);
            } else {
                self.0.insert(k.to_string(), v.to_vec());
            }
        }
    }

    /// Encodes as a full typed value (tag included).
    pub fn marshal(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        self.marshal_into(&mut buf);
        buf
    }

    pub(crate) fn marshal_into(&self, buf: &mut Vec<u8>) {
        buf.push(Type::Dict as u8);
        buf.push(self.0.len() as u8);
        for (key, value) in &self.0 {
            buf.push(key.len() as u8);
            buf.extend_from_slice(key.as_bytes());
            buf.extend_from_slice(value);
        }
    }

    /// Decodes a dict from marshaled bytes (tag included).
    pub fn unmarshal(data: &[u8]) -> Result<Dict, ProtocolError> {
        match Value::unmarshal_as(data, &[Type::Dict])? {
            (Value::Dict(d), _) => Ok(d),
            _ => unreachable!("unmarshal_as checked the tag"),
        }
    }

    /// Decodes the body following a `Dict` tag. Returns the dict and the
    /// number of body bytes consumed.
    fn unmarshal_body(data: &[u8]) -> Result<(Dict, usize), ProtocolError> {
        let count = *data.first().ok_or(ProtocolError::TooShort(data.len()))? as usize;
        let mut dict = IndexMap::with_capacity(count);
        let mut used = 1;
        for _ in 0..count {
            let klen = *data
                .get(used)
                .ok_or(ProtocolError::TooShort(data.len()))? as usize;
            used += 1;
            let key = take_str(&data[used..], klen)?;
            used += klen;
            // The value is a nested typed value; record its raw bytes.
            let (_, vlen) = Value::unmarshal(&data[used..])?;
            let raw = data[used..used + vlen].to_vec();
            used += vlen;
            dict.insert(key, raw);
        }
        Ok((Dict(dict), used))
    }
}

impl FromIterator<(String, Vec<u8>)> for Dict {
    fn from_iter<I: IntoIterator<Item = (String, Vec<u8>)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

// ---------------------------------------------------------------------------
// 24-bit helpers (message sequence numbers)
// ---------------------------------------------------------------------------

/// Writes `v` as a 3-byte big-endian integer. The top byte of `v` is
/// discarded; message sequence numbers stay below 2^24 by protocol.
pub fn put_u24(buf: &mut Vec<u8>, v: u32) {
    buf.extend_from_slice(&[(v >> 16) as u8, (v >> 8) as u8, v as u8]);
}

/// Reads a 3-byte big-endian integer.
pub fn get_u24(data: &[u8]) -> Result<u32, ProtocolError> {
    if data.len() < 3 {
        return Err(ProtocolError::TooShort(data.len()));
    }
    Ok(((data[0] as u32) << 16) | ((data[1] as u32) << 8) | data[2] as u32)
}

// =========================================================================
// Tests
// =========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(v: Value) {
        let bytes = v.marshal();
        let (decoded, used) = Value::unmarshal(&bytes).expect("decode");
        assert_eq!(decoded, v);
        assert_eq!(used, bytes.len(), "must consume the whole encoding");
    }

    #[test]
    fn test_scalar_round_trips() {
        round_trip(Value::Null);
        round_trip(Value::Bool(false));
        round_trip(Value::Bool(true));
        round_trip(Value::SByte(-100));
        round_trip(Value::Byte(200));
        round_trip(Value::Short(-30000));
        round_trip(Value::UShort(60000));
        round_trip(Value::Int(-2_000_000_000));
        round_trip(Value::UInt(4_000_000_000));
        round_trip(Value::Long(i64::MIN));
        round_trip(Value::ULong(u64::MAX));
        round_trip(Value::Float(1.5));
        round_trip(Value::Double(-2.25));
        round_trip(Value::Decimal(u128::MAX - 7));
    }

    #[test]
    fn test_integers_are_big_endian() {
        assert_eq!(Value::UInt(0x01020304).marshal(), vec![8, 1, 2, 3, 4]);
        assert_eq!(
            Value::UShort(0xBEEF).marshal(),
            vec![Type::UShort as u8, 0xBE, 0xEF]
        );
    }

    #[test]
    fn test_str8_round_trip_and_encoding() {
        let bytes = Value::Str("hi".into()).marshal();
        assert_eq!(bytes, vec![Type::Str8 as u8, 2, b'h', b'i']);
        round_trip(Value::Str("hello world".into()));
    }

    #[test]
    fn test_str8_boundary_lengths() {
        // Length 0 and length 255 are the Str8 extremes.
        round_trip(Value::Str(String::new()));
        let max8 = "a".repeat(255);
        let bytes = Value::Str(max8.clone()).marshal();
        assert_eq!(bytes[0], Type::Str8 as u8);
        round_trip(Value::Str(max8));
    }

    #[test]
    fn test_str16_boundary_lengths() {
        // 256 bytes no longer fits a Str8 length byte.
        let s = "b".repeat(256);
        let bytes = Value::Str(s.clone()).marshal();
        assert_eq!(bytes[0], Type::Str16 as u8);
        round_trip(Value::Str(s));

        round_trip(Value::Str("c".repeat(65535)));
    }

    #[test]
    fn test_bytes_round_trip() {
        round_trip(Value::Bytes(vec![]));
        round_trip(Value::Bytes(vec![0, 1, 2, 255]));
    }

    #[test]
    fn test_list_round_trip() {
        round_trip(Value::List(vec![]));
        round_trip(Value::List(vec![
            Value::Str("a".into()),
            Value::Int(-1),
            Value::List(vec![Value::Null]),
        ]));
    }

    #[test]
    fn test_obj_round_trip() {
        round_trip(Value::Obj {
            class: 7,
            body: vec![1, 2, 3],
        });
    }

    #[test]
    fn test_dict_round_trip_preserves_insertion_order() {
        let mut d = Dict::new();
        d.insert("zebra", Value::Int(1).marshal());
        d.insert("apple", Value::Str("x".into()).marshal());
        d.insert("mango", Value::Bool(true).marshal());

        let decoded = Dict::unmarshal(&d.marshal()).expect("decode");
        assert_eq!(decoded, d);

        let keys: Vec<&str> = decoded.iter().map(|(k, _)| k).collect();
        assert_eq!(keys, vec!["zebra", "apple", "mango"]);
    }

    #[test]
    fn test_dict_empty_round_trip() {
        let d = Dict::new();
        let decoded = Dict::unmarshal(&d.marshal()).expect("decode");
        assert!(decoded.is_empty());
    }

    #[test]
    fn test_dict_merge_deletes_on_empty_value() {
        let mut base = Dict::new();
        base.insert("keep", Value::Int(1).marshal());
        base.insert("drop", Value::Int(2).marshal());

        let mut delta = Dict::new();
        delta.insert("drop", Vec::new());
        delta.insert("new", Value::Int(3).marshal());
        base.merge(&delta);

        assert!(base.contains_key("keep"));
        assert!(!base.contains_key("drop"));
        assert!(base.contains_key("new"));
    }

    #[test]
    fn test_dict_merge_empty_value_for_absent_key_inserts() {
        // Deleting a key that was never present stores the empty marker,
        // mirroring the replace-or-append rule.
        let mut base = Dict::new();
        let mut delta = Dict::new();
        delta.insert("ghost", Vec::new());
        base.merge(&delta);
        assert_eq!(base.get("ghost"), Some(&[][..]));
    }

    #[test]
    fn test_unknown_tag_rejected() {
        let err = Value::unmarshal(&[200, 0, 0]).unwrap_err();
        assert!(matches!(err, ProtocolError::UnknownType(200)));
    }

    #[test]
    fn test_truncated_input_rejected() {
        assert!(Value::unmarshal(&[]).is_err());
        // UInt needs four body bytes.
        assert!(Value::unmarshal(&[Type::UInt as u8, 1, 2]).is_err());
        // Str8 claiming more bytes than available.
        assert!(Value::unmarshal(&[Type::Str8 as u8, 5, b'a']).is_err());
    }

    #[test]
    fn test_unmarshal_as_rejects_wrong_type() {
        let bytes = Value::Int(1).marshal();
        let err = Value::unmarshal_as(&bytes, &[Type::Str8]).unwrap_err();
        assert!(matches!(err, ProtocolError::UnexpectedType { .. }));
    }

    #[test]
    fn test_u24_round_trip() {
        let mut buf = Vec::new();
        put_u24(&mut buf, 0x012345);
        assert_eq!(buf, vec![0x01, 0x23, 0x45]);
        assert_eq!(get_u24(&buf).unwrap(), 0x012345);
        assert!(get_u24(&buf[..2]).is_err());
    }
}
