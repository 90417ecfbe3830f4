// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Deadline ticker.
//!
//! A connection keeps its own coarse clock: a counter of seconds since
//! connect, advanced by a dedicated thread once per second. On every tick
//! the thread scans the slot table and fires the timeout channel of any slot
//! whose deadline has come due. Timeouts therefore resolve even when the
//! caller is parked on a dead socket, and no per-request timer objects
//! exist.
//!
//! The thread exits when the connection's failure channel closes.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam::channel::{Receiver, RecvTimeoutError};

use crate::connection::ConnStats;
use crate::slots::SlotTable;

/// Coarse clock granularity; also the deadline resolution.
pub const TICK_PERIOD: Duration = Duration::from_secs(1);

/// Connection-local coarse clock.
///
/// `now` is seconds since connect as observed by the ticker; `last_read` is
/// the `now` value at the most recent inbound header, the liveness signal
/// the keep-alive pinger consults.
pub(crate) struct Clock {
    now: AtomicU32,
    last_read: AtomicU32,
}

impl Clock {
    pub(crate) fn new() -> Self {
        Self {
            now: AtomicU32::new(0),
            last_read: AtomicU32::new(0),
        }
    }

    /// Seconds since connect, ticker-observed.
    pub(crate) fn now(&self) -> u32 {
        self.now.load(Ordering::Acquire)
    }

    /// Advance the clock by one second and return the new value.
    fn tick(&self) -> u32 {
        self.now.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Record inbound traffic at the current tick.
    pub(crate) fn stamp_read(&self) {
        self.last_read.store(self.now(), Ordering::Release);
    }

    /// Seconds since the last inbound header.
    pub(crate) fn idle_secs(&self) -> u32 {
        self.now().saturating_sub(self.last_read.load(Ordering::Acquire))
    }

    /// Advance the clock by hand (tests only).
    #[cfg(test)]
    pub(crate) fn tick_n(&self, n: u32) {
        for _ in 0..n {
            self.tick();
        }
    }
}

/// Spawn the ticker thread.
pub(crate) fn spawn_ticker(
    slots: Arc<SlotTable>,
    clock: Arc<Clock>,
    stats: Arc<ConnStats>,
    failure: Receiver<()>,
) -> JoinHandle<()> {
    #[allow(clippy::expect_used)] // thread spawn failure is unrecoverable
    let handle = thread::Builder::new()
        .name("cproto-ticker".into())
        .spawn(move || {
            log::debug!("[ticker] started (period={:?})", TICK_PERIOD);

            loop {
                match failure.recv_timeout(TICK_PERIOD) {
                    Err(RecvTimeoutError::Timeout) => {
                        let now = clock.tick();
                        for slot in slots.iter() {
                            if slot.fire_overdue(now) {
                                stats.timeouts_fired.fetch_add(1, Ordering::Relaxed);
                                log::trace!("[ticker] deadline fired at t={}", now);
                            }
                        }
                    }
                    // Nothing is ever sent; Ok is unreachable but harmless.
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                }
            }

            log::debug!("[ticker] stopped");
        })
        .expect("failed to spawn ticker thread");
    handle
}
