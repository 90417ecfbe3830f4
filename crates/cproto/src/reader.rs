// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Inbound frame routing.
//!
//! The reader thread owns the receive side of the socket. Each iteration
//! reads exactly one header, validates it, and routes the payload:
//!
//! - sequence matches its slot's live occupant -> payload is read in full and
//!   delivered on the slot's reply channel;
//! - no live occupant (a late reply after a local timeout, or a
//!   server-initiated push) -> the payload goes to the updates handler when
//!   one is installed, otherwise it is drained off the socket and dropped.
//!
//! Every successful header read stamps the connection's last-read clock,
//! which the keep-alive pinger uses as its idle signal. Any I/O or framing
//! error trips the connection's failure path and ends the thread.

use std::io::{self, Read};
use std::net::TcpStream;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use arc_swap::ArcSwapOption;

use crate::connection::{ConnStats, FailSwitch, UpdatesHandler};
use crate::errors::Error;
use crate::slots::SlotTable;
use crate::ticker::Clock;
use crate::wire::{FrameHeader, FRAME_HEADER_SIZE};

/// Anti-OOM bound on a single payload.
pub(crate) const MAX_PAYLOAD_SIZE: usize = 64 * 1024 * 1024;

/// How long the reader will wait on a briefly-full reply channel before
/// dropping the payload as stale.
const DELIVER_TIMEOUT: Duration = Duration::from_secs(1);

/// Spawn the reader thread.
pub(crate) fn spawn_reader(
    mut sock: TcpStream,
    slots: Arc<SlotTable>,
    clock: Arc<Clock>,
    updates: Arc<ArcSwapOption<UpdatesHandler>>,
    fail: Arc<FailSwitch>,
    stats: Arc<ConnStats>,
) -> JoinHandle<()> {
    #[allow(clippy::expect_used)] // thread spawn failure is unrecoverable
    let handle = thread::Builder::new()
        .name("cproto-reader".into())
        .spawn(move || {
            log::debug!("[reader] started");

            loop {
                let mut hdr = [0u8; FRAME_HEADER_SIZE];
                if let Err(e) = sock.read_exact(&mut hdr) {
                    trip_read_error(&fail, &e);
                    break;
                }

                let header = match FrameHeader::decode(&hdr, slots.seq_max()) {
                    Ok(h) => h,
                    Err(e) => {
                        log::warn!("[reader] {}", e);
                        fail.trip(e.into());
                        break;
                    }
                };

                // The writer may have tripped the failure path while this
                // header was in flight; deliver nothing once it is closed.
                if fail.tripped() {
                    break;
                }

                clock.stamp_read();
                stats.frames_received.fetch_add(1, Ordering::Relaxed);
                stats
                    .bytes_received
                    .fetch_add(FRAME_HEADER_SIZE as u64 + u64::from(header.payload_size), Ordering::Relaxed);

                let len = header.payload_size as usize;
                if len > MAX_PAYLOAD_SIZE {
                    fail.trip(Error::Protocol(format!(
                        "payload of {} bytes exceeds the {} byte limit",
                        len, MAX_PAYLOAD_SIZE
                    )));
                    break;
                }

                match slots.match_slot(header.sequence) {
                    Some(slot) => {
                        let mut payload = vec![0u8; len];
                        if let Err(e) = sock.read_exact(&mut payload) {
                            trip_read_error(&fail, &e);
                            break;
                        }
                        // A full channel means the occupant changed under us
                        // mid-frame; give the new waiter a moment to drain,
                        // then treat the payload as stale.
                        if slot
                            .reply_tx
                            .send_timeout((header.sequence, payload), DELIVER_TIMEOUT)
                            .is_err()
                        {
                            stats.stale_frames.fetch_add(1, Ordering::Relaxed);
                            log::trace!(
                                "[reader] dropped undeliverable reply seq={}",
                                header.sequence
                            );
                        }
                    }
                    None => {
                        if let Some(handler) = updates.load_full() {
                            let mut payload = vec![0u8; len];
                            if let Err(e) = sock.read_exact(&mut payload) {
                                trip_read_error(&fail, &e);
                                break;
                            }
                            handler(header.sequence, payload);
                        } else {
                            log::trace!(
                                "[reader] draining stale frame seq={} ({} bytes)",
                                header.sequence,
                                len
                            );
                            stats.stale_frames.fetch_add(1, Ordering::Relaxed);
                            match io::copy(&mut (&mut sock).take(len as u64), &mut io::sink()) {
                                Ok(n) if n as usize == len => {}
                                Ok(_) => {
                                    fail.trip(Error::Network(
                                        "connection closed by peer mid-frame".into(),
                                    ));
                                    break;
                                }
                                Err(e) => {
                                    trip_read_error(&fail, &e);
                                    break;
                                }
                            }
                        }
                    }
                }
            }

            log::debug!("[reader] stopped");
        })
        .expect("failed to spawn reader thread");
    handle
}

/// Classify a failed socket read and trip the failure path.
///
/// If the connection already failed (local shutdown included), the read error
/// is just the socket being torn down and is not reported again.
fn trip_read_error(fail: &FailSwitch, e: &io::Error) {
    if fail.tripped() {
        return;
    }
    let err = if e.kind() == io::ErrorKind::UnexpectedEof {
        Error::Network("connection closed by peer".into())
    } else {
        Error::network(e)
    };
    log::debug!("[reader] socket read failed: {}", err);
    fail.trip(err);
}
