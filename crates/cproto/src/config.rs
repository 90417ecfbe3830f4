// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Connection configuration.
//!
//! [`ConnectOptions`] controls pipeline sizing, buffering, and the three
//! transport timers (login, default request deadline, keep-alive).
//!
//! # Example
//!
//! ```
//! use cproto::ConnectOptions;
//!
//! let opts = ConnectOptions::default()
//!     .with_login_timeout(10)
//!     .with_request_timeout(30);
//! assert_eq!(opts.pipeline_depth, 40);
//! ```

use crate::errors::{Error, Result};

/// Largest supported pipeline depth.
///
/// The sequence space is `depth * 10_000_000` and must fit in a `u32`
/// together with the idle sentinel.
pub const MAX_PIPELINE_DEPTH: usize = 400;

/// Configuration for a single cproto connection.
#[derive(Clone, Debug)]
pub struct ConnectOptions {
    // === Pipeline ===
    /// Maximum number of in-flight requests; also the slot-table size
    pub pipeline_depth: usize,

    // === Buffers ===
    /// Capacity hint for the outbound coalescing buffers; buffers that grow
    /// well past the hint are shrunk back after a flush
    pub buffer_hint: usize,

    // === Timers ===
    /// Budget for dial plus login, in seconds (0 = wait indefinitely)
    pub login_timeout: u32,

    /// Default per-request deadline in seconds, inherited by calls submitted
    /// with deadline 0 (0 = no deadline)
    pub request_timeout: u32,

    /// Keep-alive ping interval in seconds (0 disables the pinger)
    pub keep_alive_interval: u32,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self {
            pipeline_depth: 40,

            buffer_hint: 16 * 1024, // 16 KiB

            login_timeout: 0,      // Wait indefinitely
            request_timeout: 0,    // No default deadline
            keep_alive_interval: 0, // Disabled
        }
    }
}

impl ConnectOptions {
    /// Builder: set the pipeline depth
    pub fn with_pipeline_depth(mut self, depth: usize) -> Self {
        self.pipeline_depth = depth;
        self
    }

    /// Builder: set the outbound buffer capacity hint
    pub fn with_buffer_hint(mut self, hint: usize) -> Self {
        self.buffer_hint = hint;
        self
    }

    /// Builder: set the login timeout in seconds
    pub fn with_login_timeout(mut self, secs: u32) -> Self {
        self.login_timeout = secs;
        self
    }

    /// Builder: set the default request deadline in seconds
    pub fn with_request_timeout(mut self, secs: u32) -> Self {
        self.request_timeout = secs;
        self
    }

    /// Builder: set the keep-alive ping interval in seconds
    pub fn with_keep_alive_interval(mut self, secs: u32) -> Self {
        self.keep_alive_interval = secs;
        self
    }

    /// Reject configurations the transport cannot honour.
    pub fn validate(&self) -> Result<()> {
        if self.pipeline_depth == 0 {
            return Err(Error::InvalidArgument("pipeline depth must be > 0".into()));
        }
        if self.pipeline_depth > MAX_PIPELINE_DEPTH {
            return Err(Error::InvalidArgument(format!(
                "pipeline depth {} exceeds maximum {}",
                self.pipeline_depth, MAX_PIPELINE_DEPTH
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let opts = ConnectOptions::default();
        assert_eq!(opts.pipeline_depth, 40);
        assert_eq!(opts.buffer_hint, 16 * 1024);
        assert_eq!(opts.login_timeout, 0);
        assert_eq!(opts.keep_alive_interval, 0);
        assert!(opts.validate().is_ok());
    }

    #[test]
    fn test_zero_depth_rejected() {
        let opts = ConnectOptions::default().with_pipeline_depth(0);
        assert!(opts.validate().is_err());
    }

    #[test]
    fn test_oversized_depth_rejected() {
        let opts = ConnectOptions::default().with_pipeline_depth(MAX_PIPELINE_DEPTH + 1);
        assert!(opts.validate().is_err());
    }
}
