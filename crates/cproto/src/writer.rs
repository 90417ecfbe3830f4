// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Outbound write coalescing.
//!
//! Producers append encoded frames to the active buffer under a short-held
//! lock and assert a non-blocking kick. The writer thread owns the standby
//! buffer: on each kick it swaps the two under the lock and pushes the
//! detached bytes to the socket with the lock released, so submission never
//! contends with the write syscall and concurrent submissions coalesce into
//! one flush.
//!
//! A socket write error trips the connection's failure path; the thread also
//! exits when the failure channel closes.

use std::io::Write;
use std::net::TcpStream;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam::channel::{bounded, Receiver, Sender};
use crossbeam::select;
use parking_lot::Mutex;

use crate::connection::{ConnStats, FailSwitch};
use crate::errors::Error;

/// Outbound frame queue: the active half of the double buffer plus the kick.
pub(crate) struct WriteQueue {
    active: Mutex<Vec<u8>>,
    kick_tx: Sender<()>,
    kick_rx: Receiver<()>,
    hint: usize,
}

impl WriteQueue {
    pub(crate) fn new(buffer_hint: usize) -> Self {
        let (kick_tx, kick_rx) = bounded(1);
        Self {
            active: Mutex::new(Vec::with_capacity(buffer_hint)),
            kick_tx,
            kick_rx,
            hint: buffer_hint,
        }
    }

    /// Queue one encoded frame and wake the writer.
    ///
    /// A full kick channel means a wake-up is already pending, which is all
    /// the writer needs to know.
    pub(crate) fn submit(&self, frame: &[u8]) {
        self.active.lock().extend_from_slice(frame);
        let _ = self.kick_tx.try_send(());
    }

    /// Swap the filled buffer out against an empty standby.
    ///
    /// Returns false when there was nothing to flush.
    fn swap_out(&self, standby: &mut Vec<u8>) -> bool {
        let mut active = self.active.lock();
        if active.is_empty() {
            return false;
        }
        std::mem::swap(&mut *active, standby);
        true
    }
}

/// Spawn the writer thread.
pub(crate) fn spawn_writer(
    mut sock: TcpStream,
    queue: Arc<WriteQueue>,
    fail: Arc<FailSwitch>,
    stats: Arc<ConnStats>,
    failure: Receiver<()>,
) -> JoinHandle<()> {
    #[allow(clippy::expect_used)] // thread spawn failure is unrecoverable
    let handle = thread::Builder::new()
        .name("cproto-writer".into())
        .spawn(move || {
            log::debug!("[writer] started");
            let mut standby: Vec<u8> = Vec::with_capacity(queue.hint);

            'outer: loop {
                select! {
                    recv(&queue.kick_rx) -> _ => {}
                    recv(&failure) -> _ => break,
                }

                // Drain until a swap finds the active buffer empty; frames
                // submitted during a flush ride the next iteration.
                while queue.swap_out(&mut standby) {
                    if let Err(e) = sock.write_all(&standby) {
                        log::debug!("[writer] socket write failed: {}", e);
                        fail.trip(Error::network(&e));
                        break 'outer;
                    }
                    stats
                        .bytes_sent
                        .fetch_add(standby.len() as u64, Ordering::Relaxed);
                    standby.clear();
                    if standby.capacity() > 4 * queue.hint {
                        standby.shrink_to(queue.hint);
                    }
                }
            }

            log::debug!("[writer] stopped");
        })
        .expect("failed to spawn writer thread");
    handle
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam::channel::unbounded;
    use std::io::Read;
    use std::net::TcpListener;
    use std::time::Duration;

    fn tcp_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).unwrap();
        let (server, _) = listener.accept().unwrap();
        (client, server)
    }

    #[test]
    fn test_submitted_bytes_reach_the_socket() {
        let (client, mut server) = tcp_pair();
        let queue = Arc::new(WriteQueue::new(1024));
        let fail = Arc::new(FailSwitch::new_detached());
        let stats = Arc::new(ConnStats::default());
        let (failure_tx, failure_rx) = unbounded::<()>();

        let handle = spawn_writer(
            client,
            Arc::clone(&queue),
            Arc::clone(&fail),
            Arc::clone(&stats),
            failure_rx,
        );

        queue.submit(b"alpha");
        queue.submit(b"beta");
        queue.submit(b"gamma");

        let mut got = vec![0u8; 14];
        server.read_exact(&mut got).unwrap();
        assert_eq!(&got, b"alphabetagamma");
        assert_eq!(stats.bytes_sent.load(Ordering::Relaxed), 14);

        drop(failure_tx);
        handle.join().unwrap();
    }

    #[test]
    fn test_swap_out_empty_is_noop() {
        let queue = WriteQueue::new(64);
        let mut standby = Vec::new();
        assert!(!queue.swap_out(&mut standby));
        queue.submit(b"x");
        assert!(queue.swap_out(&mut standby));
        assert_eq!(standby, b"x");
        assert!(!queue.swap_out(&mut standby));
    }

    #[test]
    fn test_write_error_trips_failure() {
        let (client, server) = tcp_pair();
        let queue = Arc::new(WriteQueue::new(64));
        let fail = Arc::new(FailSwitch::new_detached());
        let stats = Arc::new(ConnStats::default());
        let (_failure_tx, failure_rx) = unbounded::<()>();

        let handle = spawn_writer(
            client,
            Arc::clone(&queue),
            Arc::clone(&fail),
            stats,
            failure_rx,
        );

        drop(server);
        // The first write after the peer vanished may still land in the send
        // buffer; keep pushing until the failure registers.
        for _ in 0..100 {
            if fail.tripped() {
                break;
            }
            queue.submit(&[0u8; 64 * 1024]);
            std::thread::sleep(Duration::from_millis(10));
        }
        assert!(fail.tripped());
        assert!(fail.terminal_error().is_fatal());
        handle.join().unwrap();
    }
}
