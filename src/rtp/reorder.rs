//! Bounded reordering of received RTP payloads.
//!
//! A small ring of slots indexed by `seq % WINDOW` holds payloads that
//! arrived ahead of the expected sequence. Anything further than twice the
//! window away, in either direction, abandons the current position and
//! resynchronizes onto the incoming packet.

use crate::stats::{self, STATS};

/// How many packets ahead of the expected sequence we hold on to.
pub const WINDOW: usize = 6;

/// Largest payload a slot can carry.
pub const SLOT_BYTES: usize = 8192;

struct Slot {
    seq: u16,
    len: usize,
    payload: Box<[u8; SLOT_BYTES]>,
}

impl Slot {
    fn new() -> Self {
        Self {
            seq: 0,
            len: 0,
            payload: Box::new([0u8; SLOT_BYTES]),
        }
    }
}

pub struct ReorderBuffer {
    slots: Vec<Slot>,
    /// Next expected sequence number.
    next: u16,
    /// Occupied slot count.
    used: usize,
}

impl ReorderBuffer {
    pub fn new() -> Self {
        Self {
            slots: (0..WINDOW).map(|_| Slot::new()).collect(),
            next: 0,
            used: 0,
        }
    }

    pub fn expected(&self) -> u16 {
        self.next
    }

    /// Admit one packet. In-order payloads (and any buffered run they
    /// complete) are handed to `sink` immediately; nearby future packets are
    /// buffered; far-off sequences resynchronize.
    pub fn admit(&mut self, seq: u16, payload: &[u8], sink: &mut dyn FnMut(&[u8])) {
        let dist = seq.wrapping_sub(self.next) as i16;
        let mut dist_abs = dist.unsigned_abs() as usize;

        if dist_abs > WINDOW * 2 {
            // too far out on either side: adopt this packet as the new head
            dist_abs = 0;
            self.used = 0;
            stats::inc(&STATS.rtp.resynced);
        } else if dist < 0 {
            return; // recent past, already played out
        }

        if dist_abs == 0 {
            sink(payload);
            self.next = seq.wrapping_add(1);
            self.scan(sink);
            return;
        }

        if dist_abs > WINDOW {
            // the missing packet cannot be waited for any longer
            stats::inc(&STATS.rtp.skipped);

            self.next = self.next.wrapping_add(1);
            self.scan(sink);

            // the skip may have closed the gap to exactly this packet
            if seq == self.next {
                sink(payload);
                self.next = seq.wrapping_add(1);
                return;
            }
        }

        let slot = &mut self.slots[seq as usize % WINDOW];
        self.used += 1;

        let len = payload.len().min(SLOT_BYTES);
        slot.seq = seq;
        slot.len = len;
        slot.payload[..len].copy_from_slice(&payload[..len]);

        stats::inc(&STATS.rtp.reordered);
    }

    /// Drain the run of consecutive buffered packets starting at the
    /// expected sequence.
    fn scan(&mut self, sink: &mut dyn FnMut(&[u8])) {
        for _ in 0..WINDOW {
            if self.used == 0 {
                return;
            }

            let slot = &self.slots[self.next as usize % WINDOW];
            if slot.seq != self.next {
                return;
            }

            sink(&slot.payload[..slot.len]);
            self.next = self.next.wrapping_add(1);
            self.used -= 1;
        }
    }
}

impl Default for ReorderBuffer {
    fn default() -> Self {
        Self::new()
    }
}
