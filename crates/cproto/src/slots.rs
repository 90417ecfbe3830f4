// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Pipeline slot table.
//!
//! A fixed array of slots multiplexes up to `pipeline_depth` in-flight
//! requests over one socket. Sequence numbers are drawn from
//! `[0, depth * 10_000_000)`; `seq % depth` selects the slot and the rest of
//! the number disambiguates the slot's successive occupants, so a late reply
//! can never be confused with the current one. The value `depth * 10_000_000`
//! itself is the idle sentinel.
//!
//! Admission control is the available-sequence queue: a bounded channel
//! preloaded with `0..depth`. Acquiring a sequence is a blocking receive,
//! releasing pushes the slot's next sequence, so slot `k` hands out
//! `k, k+depth, k+2*depth, ...` in order.

use std::sync::atomic::{AtomicU32, Ordering};

use crossbeam::channel::{bounded, Receiver, Sender};
use crossbeam::select;

/// Sequence-space stride reserved for each slot.
pub(crate) const SEQS_PER_SLOT: u32 = 10_000_000;

// ============================================================================
// Slot
// ============================================================================

/// One pipeline station.
///
/// The atomics are written by the claiming caller and read by the reader and
/// ticker threads; the channels are capacity-1 rendezvous points drained at
/// claim time so a previous occupant's leftovers never reach a new waiter.
pub(crate) struct Slot {
    /// Owning request's full sequence, or the idle sentinel
    sequence: AtomicU32,

    /// Ticker deadline (seconds since connect), 0 = none
    deadline: AtomicU32,

    /// Reader-side producer of `(sequence, payload)`
    pub(crate) reply_tx: Sender<(u32, Vec<u8>)>,

    /// Caller-side consumer of replies
    pub(crate) reply_rx: Receiver<(u32, Vec<u8>)>,

    /// Ticker-side producer of timed-out sequences
    pub(crate) timeout_tx: Sender<u32>,

    /// Caller-side consumer of timeout signals
    pub(crate) timeout_rx: Receiver<u32>,
}

impl Slot {
    fn new(idle: u32) -> Self {
        let (reply_tx, reply_rx) = bounded(1);
        let (timeout_tx, timeout_rx) = bounded(1);
        Self {
            sequence: AtomicU32::new(idle),
            deadline: AtomicU32::new(0),
            reply_tx,
            reply_rx,
            timeout_tx,
            timeout_rx,
        }
    }

    /// Current occupant's sequence (the sentinel when idle).
    pub(crate) fn sequence(&self) -> u32 {
        self.sequence.load(Ordering::Acquire)
    }

    /// True when `seq` is the live occupant of this slot.
    pub(crate) fn owns(&self, seq: u32) -> bool {
        self.sequence() == seq
    }

    /// Fire the deadline if it is due, at most once per claim.
    ///
    /// Returns true when a timeout signal was emitted.
    pub(crate) fn fire_overdue(&self, now: u32) -> bool {
        let due = self.deadline.load(Ordering::Acquire);
        if due == 0 || now < due {
            return false;
        }
        // The swap-to-zero is the single-firing guarantee; a concurrent
        // release also zeroes, in which case we lose the race and stay quiet.
        if self
            .deadline
            .compare_exchange(due, 0, Ordering::AcqRel, Ordering::Relaxed)
            .is_err()
        {
            return false;
        }
        let seq = self.sequence();
        let _ = self.timeout_tx.try_send(seq);
        true
    }
}

// ============================================================================
// Slot table
// ============================================================================

/// Fixed-size slot table plus the available-sequence queue.
pub(crate) struct SlotTable {
    slots: Box<[Slot]>,
    avail_tx: Sender<u32>,
    avail_rx: Receiver<u32>,
    seq_max: u32,
}

impl SlotTable {
    /// Build a table of `depth` slots with sequences `0..depth` available.
    pub(crate) fn new(depth: usize) -> Self {
        assert!(depth > 0, "pipeline depth must be > 0");
        let seq_max = depth as u32 * SEQS_PER_SLOT;
        let slots: Box<[Slot]> = (0..depth).map(|_| Slot::new(seq_max)).collect();

        let (avail_tx, avail_rx) = bounded(depth);
        for seq in 0..depth as u32 {
            // Cannot fail: capacity equals the number of seeds.
            let _ = avail_tx.send(seq);
        }

        Self {
            slots,
            avail_tx,
            avail_rx,
            seq_max,
        }
    }

    pub(crate) fn depth(&self) -> usize {
        self.slots.len()
    }

    /// Exclusive upper bound of the sequence space; doubles as the idle
    /// sentinel.
    pub(crate) fn seq_max(&self) -> u32 {
        self.seq_max
    }

    /// Successor of `seq` within its slot's progression.
    pub(crate) fn next_seq(&self, seq: u32) -> u32 {
        (seq + self.slots.len() as u32) % self.seq_max
    }

    /// The slot addressed by `seq`, regardless of ownership.
    pub(crate) fn slot(&self, seq: u32) -> &Slot {
        &self.slots[(seq as usize) % self.slots.len()]
    }

    /// The slot addressed by `seq`, only if `seq` is its live occupant.
    pub(crate) fn match_slot(&self, seq: u32) -> Option<&Slot> {
        let slot = self.slot(seq);
        slot.owns(seq).then_some(slot)
    }

    /// Iterate every slot (ticker scan).
    pub(crate) fn iter(&self) -> impl Iterator<Item = &Slot> {
        self.slots.iter()
    }

    /// Take the next free sequence, blocking while the pipeline is full.
    ///
    /// Returns `None` once the failure channel has closed. When both are
    /// ready the pick is arbitrary, so callers must still check the
    /// connection state after a successful acquire.
    pub(crate) fn acquire(&self, failure: &Receiver<()>) -> Option<u32> {
        select! {
            recv(self.avail_rx) -> seq => seq.ok(),
            recv(failure) -> _ => None,
        }
    }

    /// Publish `seq` as its slot's occupant with an absolute deadline
    /// (0 = none). Must only be called with a sequence obtained from
    /// [`SlotTable::acquire`].
    pub(crate) fn claim(&self, seq: u32, deadline: u32) {
        let slot = self.slot(seq);

        // Drain leftovers from the previous occupant before publishing.
        while slot.reply_rx.try_recv().is_ok() {}
        while slot.timeout_rx.try_recv().is_ok() {}

        slot.deadline.store(deadline, Ordering::Release);
        slot.sequence.store(seq, Ordering::Release);
    }

    /// Idle the slot and return its next sequence to the pool.
    pub(crate) fn release(&self, seq: u32) {
        let slot = self.slot(seq);
        slot.deadline.store(0, Ordering::Release);
        slot.sequence.store(self.seq_max, Ordering::Release);
        // Cannot fail: at most `depth` sequences circulate.
        let _ = self.avail_tx.send(self.next_seq(seq));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam::channel::unbounded;
    use std::time::Duration;

    fn no_failure() -> (Sender<()>, Receiver<()>) {
        unbounded()
    }

    #[test]
    fn test_initial_sequences() {
        let table = SlotTable::new(4);
        let (_tx, failure) = no_failure();
        let seqs: Vec<u32> = (0..4).map(|_| table.acquire(&failure).unwrap()).collect();
        assert_eq!(seqs, vec![0, 1, 2, 3]);
    }

    #[test]
    fn test_release_pushes_progression() {
        let table = SlotTable::new(4);
        let (_tx, failure) = no_failure();
        for _ in 0..4 {
            table.acquire(&failure).unwrap();
        }
        table.release(1);
        assert_eq!(table.acquire(&failure), Some(5));
        table.release(5);
        assert_eq!(table.acquire(&failure), Some(9));
    }

    #[test]
    fn test_progression_wraps() {
        let table = SlotTable::new(4);
        let last = table.seq_max() - 4; // slot 0's final sequence
        assert_eq!(table.next_seq(last), 0);
        assert_eq!(table.slot(last) as *const _, table.slot(0) as *const _);
    }

    #[test]
    fn test_claim_publishes_and_release_idles() {
        let table = SlotTable::new(4);
        table.claim(2, 0);
        assert!(table.slot(2).owns(2));
        assert!(table.match_slot(2).is_some());
        assert!(table.match_slot(6).is_none()); // same slot, other occupant

        table.release(2);
        assert_eq!(table.slot(2).sequence(), table.seq_max());
        assert!(table.match_slot(2).is_none());
    }

    #[test]
    fn test_acquire_blocks_when_saturated() {
        let table = std::sync::Arc::new(SlotTable::new(2));
        let (_tx, failure) = no_failure();
        assert_eq!(table.acquire(&failure), Some(0));
        assert_eq!(table.acquire(&failure), Some(1));

        let t2 = std::sync::Arc::clone(&table);
        let (f_tx, f_rx) = no_failure();
        let waiter = std::thread::spawn(move || t2.acquire(&f_rx));

        // The waiter must still be blocked; free a slot and it proceeds.
        std::thread::sleep(Duration::from_millis(50));
        assert!(!waiter.is_finished());
        table.release(0);
        assert_eq!(waiter.join().unwrap(), Some(2));
        drop(f_tx);
    }

    #[test]
    fn test_acquire_unblocks_on_failure_close() {
        let table = std::sync::Arc::new(SlotTable::new(1));
        let (_tx, failure) = no_failure();
        assert_eq!(table.acquire(&failure), Some(0));

        let t2 = std::sync::Arc::clone(&table);
        let (f_tx, f_rx) = no_failure();
        let waiter = std::thread::spawn(move || t2.acquire(&f_rx));
        std::thread::sleep(Duration::from_millis(20));
        drop(f_tx);
        assert_eq!(waiter.join().unwrap(), None);
    }

    #[test]
    fn test_fire_overdue_exactly_once() {
        let table = SlotTable::new(2);
        table.claim(1, 5);

        assert!(!table.slot(1).fire_overdue(4)); // not yet due
        assert!(table.slot(1).fire_overdue(5));
        assert!(!table.slot(1).fire_overdue(6)); // already fired

        assert_eq!(table.slot(1).timeout_rx.try_recv(), Ok(1));
    }

    #[test]
    fn test_zero_deadline_never_fires() {
        let table = SlotTable::new(1);
        table.claim(0, 0);
        assert!(!table.slot(0).fire_overdue(u32::MAX));
    }

    #[test]
    fn test_claim_drains_stale_rendezvous() {
        let table = SlotTable::new(1);
        table.claim(0, 0);
        table.slot(0).reply_tx.try_send((0, vec![1, 2, 3])).unwrap();
        table.slot(0).timeout_tx.try_send(0).unwrap();
        table.release(0);

        table.claim(1, 0);
        assert!(table.slot(1).reply_rx.try_recv().is_err());
        assert!(table.slot(1).timeout_rx.try_recv().is_err());
    }
}
