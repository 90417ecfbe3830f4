// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Tagged argument stream codec.
//!
//! Request and reply payloads carry their values as a count-prefixed stream
//! of tagged scalars:
//!
//! ```text
//! +------------+------+-------+------+-------+-----
//! | count 4B   | tag  | value | tag  | value | ...
//! +------------+------+-------+------+-------+-----
//! ```
//!
//! Scalars are fixed-width little-endian; strings and byte slices share one
//! tag and carry an explicit byte length with no terminator; null has no
//! value bytes; a tuple nests a count-prefixed stream of scalars (tuples do
//! not nest further). A request additionally carries a secondary section,
//! opened by its own marker tag, holding transport-level metadata -- today
//! the execution timeout in milliseconds as a single i64.

use super::{Cursor, WireError};
use crate::errors::{Error, Result};

// ============================================================================
// Value tags
// ============================================================================

/// Tag: null, no value bytes.
pub const TAG_NULL: u8 = 0;

/// Tag: signed 32-bit integer, 4 bytes LE.
pub const TAG_INT: u8 = 1;

/// Tag: signed 64-bit integer, 8 bytes LE.
pub const TAG_INT64: u8 = 2;

/// Tag: IEEE-754 double, 8 bytes LE.
pub const TAG_DOUBLE: u8 = 3;

/// Tag: boolean, 1 byte (0 or 1).
pub const TAG_BOOL: u8 = 4;

/// Tag: string or byte slice, u32 LE length + raw bytes.
pub const TAG_STRING: u8 = 5;

/// Tag: tuple, u32 LE element count + nested tagged scalars.
pub const TAG_TUPLE: u8 = 6;

/// Tag: opens the secondary (transport metadata) section of a request.
pub const TAG_SECONDARY: u8 = 7;

// ============================================================================
// Argument values
// ============================================================================

/// One argument value, mirroring the wire tags.
///
/// Strings and byte slices are the same thing on the wire, so both coerce
/// into [`Arg::Str`]; [`Arg::as_str`] recovers text when the bytes are UTF-8.
#[derive(Clone, Debug, PartialEq)]
pub enum Arg {
    /// Null placeholder
    Null,
    /// Signed 32-bit integer
    Int(i32),
    /// Signed 64-bit integer
    Int64(i64),
    /// Double-precision float
    Double(f64),
    /// Boolean
    Bool(bool),
    /// String or byte slice (length-prefixed bytes on the wire)
    Str(Vec<u8>),
    /// Composite of scalars; may not contain another tuple
    Tuple(Vec<Arg>),
}

impl Arg {
    /// The value as an i32, if it is one.
    pub fn as_int(&self) -> Option<i32> {
        match self {
            Self::Int(v) => Some(*v),
            _ => None,
        }
    }

    /// The value as an i64; plain ints widen.
    pub fn as_int64(&self) -> Option<i64> {
        match self {
            Self::Int(v) => Some(i64::from(*v)),
            Self::Int64(v) => Some(*v),
            _ => None,
        }
    }

    /// The value as a double, if it is one.
    pub fn as_double(&self) -> Option<f64> {
        match self {
            Self::Double(v) => Some(*v),
            _ => None,
        }
    }

    /// The value as a bool, if it is one.
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(v) => Some(*v),
            _ => None,
        }
    }

    /// The raw bytes of a string argument.
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Self::Str(b) => Some(b),
            _ => None,
        }
    }

    /// The string argument as text, when it is valid UTF-8.
    pub fn as_str(&self) -> Option<&str> {
        self.as_bytes().and_then(|b| std::str::from_utf8(b).ok())
    }
}

impl From<i32> for Arg {
    fn from(v: i32) -> Self {
        Self::Int(v)
    }
}

impl From<i16> for Arg {
    fn from(v: i16) -> Self {
        Self::Int(i32::from(v))
    }
}

impl From<i8> for Arg {
    fn from(v: i8) -> Self {
        Self::Int(i32::from(v))
    }
}

impl From<u8> for Arg {
    fn from(v: u8) -> Self {
        Self::Int(i32::from(v))
    }
}

impl From<u16> for Arg {
    fn from(v: u16) -> Self {
        Self::Int(i32::from(v))
    }
}

impl From<u32> for Arg {
    fn from(v: u32) -> Self {
        Self::Int64(i64::from(v))
    }
}

impl From<i64> for Arg {
    fn from(v: i64) -> Self {
        Self::Int64(v)
    }
}

impl From<f64> for Arg {
    fn from(v: f64) -> Self {
        Self::Double(v)
    }
}

impl From<bool> for Arg {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<&str> for Arg {
    fn from(v: &str) -> Self {
        Self::Str(v.as_bytes().to_vec())
    }
}

impl From<String> for Arg {
    fn from(v: String) -> Self {
        Self::Str(v.into_bytes())
    }
}

impl From<&[u8]> for Arg {
    fn from(v: &[u8]) -> Self {
        Self::Str(v.to_vec())
    }
}

impl From<Vec<u8>> for Arg {
    fn from(v: Vec<u8>) -> Self {
        Self::Str(v)
    }
}

impl From<&[i32]> for Arg {
    fn from(v: &[i32]) -> Self {
        Self::Tuple(v.iter().copied().map(Arg::Int).collect())
    }
}

impl From<Vec<i32>> for Arg {
    fn from(v: Vec<i32>) -> Self {
        Self::Tuple(v.into_iter().map(Arg::Int).collect())
    }
}

// ============================================================================
// Encoding
// ============================================================================

/// Check a slice of arguments without emitting anything.
///
/// Submission runs this before a slot is claimed so an unencodable argument
/// never reaches the wire path.
pub fn validate_args(args: &[Arg]) -> Result<()> {
    for arg in args {
        validate_value(arg, 0)?;
    }
    Ok(())
}

fn validate_value(arg: &Arg, depth: u32) -> Result<()> {
    match arg {
        Arg::Str(b) if b.len() > u32::MAX as usize => Err(Error::InvalidArgument(format!(
            "string argument of {} bytes exceeds the wire limit",
            b.len()
        ))),
        Arg::Tuple(_) if depth > 0 => {
            Err(Error::InvalidArgument("tuple may not contain a tuple".into()))
        }
        Arg::Tuple(items) => {
            for item in items {
                validate_value(item, depth + 1)?;
            }
            Ok(())
        }
        _ => Ok(()),
    }
}

/// Append a count-prefixed argument section.
pub fn encode_args(buf: &mut Vec<u8>, args: &[Arg]) -> Result<()> {
    buf.extend_from_slice(&(args.len() as u32).to_le_bytes());
    for arg in args {
        encode_value(buf, arg, 0)?;
    }
    Ok(())
}

/// Append the secondary metadata section: marker, count, exec timeout.
pub fn encode_secondary(buf: &mut Vec<u8>, exec_timeout_ms: i64) {
    buf.push(TAG_SECONDARY);
    buf.extend_from_slice(&1u32.to_le_bytes());
    buf.push(TAG_INT64);
    buf.extend_from_slice(&exec_timeout_ms.to_le_bytes());
}

fn encode_value(buf: &mut Vec<u8>, arg: &Arg, depth: u32) -> Result<()> {
    validate_value(arg, depth)?;
    match arg {
        Arg::Null => buf.push(TAG_NULL),
        Arg::Int(v) => {
            buf.push(TAG_INT);
            buf.extend_from_slice(&v.to_le_bytes());
        }
        Arg::Int64(v) => {
            buf.push(TAG_INT64);
            buf.extend_from_slice(&v.to_le_bytes());
        }
        Arg::Double(v) => {
            buf.push(TAG_DOUBLE);
            buf.extend_from_slice(&v.to_le_bytes());
        }
        Arg::Bool(v) => {
            buf.push(TAG_BOOL);
            buf.push(u8::from(*v));
        }
        Arg::Str(b) => {
            buf.push(TAG_STRING);
            buf.extend_from_slice(&(b.len() as u32).to_le_bytes());
            buf.extend_from_slice(b);
        }
        Arg::Tuple(items) => {
            buf.push(TAG_TUPLE);
            buf.extend_from_slice(&(items.len() as u32).to_le_bytes());
            for item in items {
                encode_value(buf, item, depth + 1)?;
            }
        }
    }
    Ok(())
}

// ============================================================================
// Decoding
// ============================================================================

/// Read a count-prefixed argument section.
pub(crate) fn decode_args(cur: &mut Cursor<'_>) -> std::result::Result<Vec<Arg>, WireError> {
    let count = cur.read_u32_le()? as usize;
    // Cap the pre-allocation; a hostile count still fails below on Truncated.
    let mut args = Vec::with_capacity(count.min(64));
    for _ in 0..count {
        args.push(decode_value(cur)?);
    }
    Ok(args)
}

/// Read the secondary metadata section (marker already required).
pub(crate) fn decode_secondary(cur: &mut Cursor<'_>) -> std::result::Result<Vec<Arg>, WireError> {
    let marker = cur.read_u8()?;
    if marker != TAG_SECONDARY {
        return Err(WireError::UnknownTag { tag: marker });
    }
    decode_args(cur)
}

fn decode_value(cur: &mut Cursor<'_>) -> std::result::Result<Arg, WireError> {
    let tag = cur.read_u8()?;
    let arg = match tag {
        TAG_NULL => Arg::Null,
        TAG_INT => Arg::Int(cur.read_u32_le()? as i32),
        TAG_INT64 => Arg::Int64(cur.read_u64_le()? as i64),
        TAG_DOUBLE => Arg::Double(f64::from_le_bytes(cur.read_array::<8>()?)),
        TAG_BOOL => Arg::Bool(cur.read_u8()? != 0),
        TAG_STRING => {
            let len = cur.read_u32_le()? as usize;
            Arg::Str(cur.read_bytes(len)?.to_vec())
        }
        TAG_TUPLE => {
            let count = cur.read_u32_le()? as usize;
            let mut items = Vec::with_capacity(count.min(64));
            for _ in 0..count {
                items.push(decode_value(cur)?);
            }
            Arg::Tuple(items)
        }
        other => return Err(WireError::UnknownTag { tag: other }),
    };
    Ok(arg)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(args: &[Arg]) -> Vec<Arg> {
        let mut buf = Vec::new();
        encode_args(&mut buf, args).unwrap();
        let mut cur = Cursor::new(&buf);
        let back = decode_args(&mut cur).unwrap();
        assert_eq!(cur.remaining(), 0);
        back
    }

    #[test]
    fn test_roundtrip_every_kind() {
        let args = vec![
            Arg::Null,
            Arg::Int(-12345),
            Arg::Int64(i64::MIN),
            Arg::Double(2.5),
            Arg::Bool(true),
            Arg::Bool(false),
            Arg::Str(b"hello".to_vec()),
            Arg::Str(Vec::new()),
            Arg::Tuple(vec![Arg::Int(1), Arg::Str(b"x".to_vec()), Arg::Null]),
        ];
        assert_eq!(roundtrip(&args), args);
    }

    #[test]
    fn test_roundtrip_empty() {
        assert_eq!(roundtrip(&[]), Vec::<Arg>::new());
    }

    #[test]
    fn test_bool_is_one_byte() {
        let mut buf = Vec::new();
        encode_args(&mut buf, &[Arg::Bool(true)]).unwrap();
        assert_eq!(buf.len(), 4 + 1 + 1); // count + tag + value
        assert_eq!(buf[5], 1);
    }

    #[test]
    fn test_null_has_no_payload() {
        let mut buf = Vec::new();
        encode_args(&mut buf, &[Arg::Null]).unwrap();
        assert_eq!(buf.len(), 4 + 1);
    }

    #[test]
    fn test_string_length_prefix_no_terminator() {
        let mut buf = Vec::new();
        encode_args(&mut buf, &[Arg::Str(b"ab".to_vec())]).unwrap();
        assert_eq!(&buf[4..], &[TAG_STRING, 2, 0, 0, 0, b'a', b'b']);
    }

    #[test]
    fn test_nested_tuple_rejected() {
        let arg = Arg::Tuple(vec![Arg::Tuple(vec![Arg::Int(1)])]);
        let mut buf = Vec::new();
        assert!(matches!(
            encode_args(&mut buf, &[arg.clone()]),
            Err(Error::InvalidArgument(_))
        ));
        assert!(validate_args(std::slice::from_ref(&arg)).is_err());
    }

    #[test]
    fn test_truncated_value() {
        let mut buf = Vec::new();
        encode_args(&mut buf, &[Arg::Int64(42)]).unwrap();
        buf.truncate(buf.len() - 3);
        let mut cur = Cursor::new(&buf);
        assert!(matches!(decode_args(&mut cur), Err(WireError::Truncated)));
    }

    #[test]
    fn test_truncated_string_body() {
        let mut buf = Vec::new();
        encode_args(&mut buf, &[Arg::Str(b"abcdef".to_vec())]).unwrap();
        buf.truncate(buf.len() - 2);
        let mut cur = Cursor::new(&buf);
        assert!(matches!(decode_args(&mut cur), Err(WireError::Truncated)));
    }

    #[test]
    fn test_unknown_tag() {
        let buf = [1u8, 0, 0, 0, 0x7F];
        let mut cur = Cursor::new(&buf);
        assert!(matches!(
            decode_args(&mut cur),
            Err(WireError::UnknownTag { tag: 0x7F })
        ));
    }

    #[test]
    fn test_secondary_section_roundtrip() {
        let mut buf = Vec::new();
        encode_secondary(&mut buf, 1500);
        let mut cur = Cursor::new(&buf);
        let meta = decode_secondary(&mut cur).unwrap();
        assert_eq!(meta, vec![Arg::Int64(1500)]);
    }

    #[test]
    fn test_secondary_requires_marker() {
        let buf = [TAG_INT, 0, 0, 0, 0];
        let mut cur = Cursor::new(&buf);
        assert!(matches!(
            decode_secondary(&mut cur),
            Err(WireError::UnknownTag { .. })
        ));
    }

    #[test]
    fn test_coercions() {
        assert_eq!(Arg::from(7i32), Arg::Int(7));
        assert_eq!(Arg::from(-3i16), Arg::Int(-3));
        assert_eq!(Arg::from(7u32), Arg::Int64(7));
        assert_eq!(Arg::from(7i64), Arg::Int64(7));
        assert_eq!(Arg::from("db"), Arg::Str(b"db".to_vec()));
        assert_eq!(Arg::from(&b"raw"[..]), Arg::Str(b"raw".to_vec()));
        assert_eq!(
            Arg::from(vec![1i32, 2, 3]),
            Arg::Tuple(vec![Arg::Int(1), Arg::Int(2), Arg::Int(3)])
        );
    }

    #[test]
    fn test_accessors() {
        assert_eq!(Arg::Int(5).as_int64(), Some(5));
        assert_eq!(Arg::Int64(5).as_int(), None);
        assert_eq!(Arg::Str(b"abc".to_vec()).as_str(), Some("abc"));
        assert_eq!(Arg::Str(vec![0xFF]).as_str(), None);
        assert_eq!(Arg::Bool(true).as_bool(), Some(true));
    }
}
