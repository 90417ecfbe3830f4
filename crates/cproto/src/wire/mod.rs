// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Wire codec for cproto frames.
//!
//! A frame is a fixed 16-byte header followed by a variable payload:
//!
//! ```text
//! +------------------+---------------------------------------------+
//! | header (16B)     | payload (header.payload_size bytes)         |
//! +------------------+---------------------------------------------+
//! ```
//!
//! Request payloads lead with the u16 command code, then the primary
//! argument section, then the secondary metadata section (execution
//! timeout). Reply payloads lead with the i32 status and a length-prefixed
//! status message, then the result argument section. See [`header`] and
//! [`args`] for the field-level layouts.
//!
//! The codec is agnostic to command meaning; it moves tagged values and
//! validates framing, nothing more.

pub mod args;
pub mod commands;
pub mod header;

pub use args::{encode_args, encode_secondary, validate_args, Arg};
pub use header::{
    FrameHeader, CPROTO_MAGIC, CPROTO_MIN_COMPAT_VERSION, CPROTO_VERSION, FRAME_HEADER_SIZE,
};

use crate::errors::{Error, Result};

/// Reply status meaning success.
pub const STATUS_OK: i32 = 0;

// ============================================================================
// Wire errors
// ============================================================================

/// Frame-level decode failures.
///
/// Every variant is fatal to the connection once observed on a live stream;
/// conversion into [`Error::Protocol`] happens at the transport boundary.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WireError {
    /// Header magic differs from [`CPROTO_MAGIC`]
    InvalidMagic { found: u32 },

    /// Peer version below [`CPROTO_MIN_COMPAT_VERSION`]
    UnsupportedVersion { version: u16 },

    /// Header sequence outside the connection's sequence space
    InvalidSequence { sequence: u32 },

    /// A field or tagged value could not be fully read
    Truncated,

    /// Unrecognised value tag
    UnknownTag { tag: u8 },
}

impl std::fmt::Display for WireError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidMagic { found } => write!(f, "invalid frame magic {:#010x}", found),
            Self::UnsupportedVersion { version } => {
                write!(
                    f,
                    "peer version {:#06x} below compatibility floor {:#06x}",
                    version, CPROTO_MIN_COMPAT_VERSION
                )
            }
            Self::InvalidSequence { sequence } => {
                write!(f, "sequence {} outside the sequence space", sequence)
            }
            Self::Truncated => write!(f, "truncated frame"),
            Self::UnknownTag { tag } => write!(f, "unknown value tag {:#04x}", tag),
        }
    }
}

impl std::error::Error for WireError {}

impl From<WireError> for Error {
    fn from(e: WireError) -> Self {
        Error::Protocol(e.to_string())
    }
}

// ============================================================================
// Cursor
// ============================================================================

/// Bounds-checked reader over a payload slice.
pub(crate) struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    pub fn read_bytes(&mut self, len: usize) -> std::result::Result<&'a [u8], WireError> {
        if self.remaining() < len {
            return Err(WireError::Truncated);
        }
        let out = &self.buf[self.pos..self.pos + len];
        self.pos += len;
        Ok(out)
    }

    pub fn read_array<const N: usize>(&mut self) -> std::result::Result<[u8; N], WireError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.read_bytes(N)?);
        Ok(out)
    }

    pub fn read_u8(&mut self) -> std::result::Result<u8, WireError> {
        Ok(self.read_array::<1>()?[0])
    }

    pub fn read_u16_le(&mut self) -> std::result::Result<u16, WireError> {
        Ok(u16::from_le_bytes(self.read_array::<2>()?))
    }

    pub fn read_u32_le(&mut self) -> std::result::Result<u32, WireError> {
        Ok(u32::from_le_bytes(self.read_array::<4>()?))
    }

    pub fn read_u64_le(&mut self) -> std::result::Result<u64, WireError> {
        Ok(u64::from_le_bytes(self.read_array::<8>()?))
    }
}

// ============================================================================
// Frame assembly
// ============================================================================

/// Append a complete request frame (header + payload) to `buf`.
///
/// The execution timeout always travels in the secondary section, 0 when the
/// request carries no deadline.
pub fn encode_request(
    buf: &mut Vec<u8>,
    cmd: u16,
    sequence: u32,
    args: &[Arg],
    exec_timeout_ms: i64,
) -> Result<()> {
    let start = buf.len();
    buf.resize(start + FRAME_HEADER_SIZE, 0);

    buf.extend_from_slice(&cmd.to_le_bytes());
    encode_args(buf, args)?;
    encode_secondary(buf, exec_timeout_ms);

    let payload_size = (buf.len() - start - FRAME_HEADER_SIZE) as u32;
    FrameHeader::new(payload_size, sequence).encode_into(&mut buf[start..]);
    Ok(())
}

/// Decoded request payload.
#[derive(Clone, Debug, PartialEq)]
pub struct RequestBody {
    /// Command code
    pub cmd: u16,
    /// Primary arguments in submission order
    pub args: Vec<Arg>,
    /// Secondary (transport metadata) section
    pub meta: Vec<Arg>,
}

impl RequestBody {
    /// Execution timeout carried in the secondary section, milliseconds.
    pub fn exec_timeout_ms(&self) -> i64 {
        self.meta.first().and_then(Arg::as_int64).unwrap_or(0)
    }
}

/// Decode a request payload (everything after the header).
pub fn decode_request(payload: &[u8]) -> std::result::Result<RequestBody, WireError> {
    let mut cur = Cursor::new(payload);
    let cmd = cur.read_u16_le()?;
    let args = args::decode_args(&mut cur)?;
    let meta = args::decode_secondary(&mut cur)?;
    Ok(RequestBody { cmd, args, meta })
}

/// Append a complete reply frame (header + payload) to `buf`.
///
/// Used by mock peers in tests; the live server speaks the same layout.
pub fn encode_reply(
    buf: &mut Vec<u8>,
    sequence: u32,
    status: i32,
    message: &str,
    args: &[Arg],
) -> Result<()> {
    let start = buf.len();
    buf.resize(start + FRAME_HEADER_SIZE, 0);

    buf.extend_from_slice(&status.to_le_bytes());
    buf.extend_from_slice(&(message.len() as u32).to_le_bytes());
    buf.extend_from_slice(message.as_bytes());
    encode_args(buf, args)?;

    let payload_size = (buf.len() - start - FRAME_HEADER_SIZE) as u32;
    FrameHeader::new(payload_size, sequence).encode_into(&mut buf[start..]);
    Ok(())
}

/// Decoded reply payload.
#[derive(Clone, Debug, PartialEq)]
pub struct ReplyBody {
    /// Server status; [`STATUS_OK`] on success
    pub status: i32,
    /// Status message, empty on success
    pub message: String,
    /// Result arguments
    pub args: Vec<Arg>,
}

/// Decode a reply payload (everything after the header).
pub fn decode_reply(payload: &[u8]) -> std::result::Result<ReplyBody, WireError> {
    let mut cur = Cursor::new(payload);
    let status = cur.read_u32_le()? as i32;
    let mlen = cur.read_u32_le()? as usize;
    let message = String::from_utf8_lossy(cur.read_bytes(mlen)?).into_owned();
    let args = args::decode_args(&mut cur)?;
    Ok(ReplyBody {
        status,
        message,
        args,
    })
}
