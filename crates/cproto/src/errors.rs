// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Error types for the cproto client transport.

use std::fmt;

/// Result type for transport operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by the cproto transport.
///
/// The terminal error of a failed connection is stored once and handed to
/// every current and future waiter, so all variants are cheaply cloneable.
#[derive(Debug, Clone, PartialEq)]
pub enum Error {
    /// Connect, login, or per-request deadline fired
    Timeout,

    /// Caller gave up (or the connection was finalized) before the request resolved
    Canceled,

    /// Unsupported argument kind or malformed connection string
    InvalidArgument(String),

    /// Frame-level violation: bad magic, version below the compatibility
    /// floor, truncated frame, or sequence out of range
    Protocol(String),

    /// Socket read/write failed or the peer closed the connection
    Network(String),

    /// Well-formed reply carrying a non-OK status; code and message are
    /// passed through verbatim
    Server { code: i32, message: String },
}

impl Error {
    /// Wrap an I/O error as a network failure.
    pub(crate) fn network(e: &std::io::Error) -> Self {
        Self::Network(e.to_string())
    }

    /// True when this error poisons the whole connection.
    ///
    /// `Timeout`, `Canceled` and `Server` are local to one request; the
    /// connection stays usable after them.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Protocol(_) | Self::Network(_))
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Timeout => write!(f, "request timed out"),
            Self::Canceled => write!(f, "request canceled"),
            Self::InvalidArgument(msg) => write!(f, "invalid argument: {}", msg),
            Self::Protocol(msg) => write!(f, "protocol error: {}", msg),
            Self::Network(msg) => write!(f, "network error: {}", msg),
            Self::Server { code, message } => {
                write!(f, "server error {}: {}", code, message)
            }
        }
    }
}

impl std::error::Error for Error {}
