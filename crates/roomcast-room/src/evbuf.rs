//! Per-client ring of outbound regular events.
//!
//! Every regular event a client should see is written here first and
//! assigned that client's next sequence number. The attached peer drains
//! from its own cursor, so a reconnecting peer can resume at
//! `lastAcked + 1` as long as the ring still holds that seq. Once a slot
//! is evicted the gap is permanent — resuming behind the ring is the
//! unrecoverable "too old" condition that removes the client.

use std::collections::VecDeque;
use std::sync::Arc;

use roomcast_protocol::RegularEvent;

/// Reading past the ring's tail.
#[derive(Debug, thiserror::Error)]
#[error("events from {requested} already evicted (first buffered: {first_buffered})")]
pub struct TooOld {
    pub requested: u32,
    pub first_buffered: u32,
}

/// Bounded ring addressable by absolute sequence number.
///
/// Single-owner: the client loop writes and reads; nothing else touches it.
#[derive(Debug)]
pub struct EventBuffer {
    buf: VecDeque<Arc<RegularEvent>>,
    /// Seq of the newest buffered event; 0 means nothing written yet.
    last_seq: u32,
    capacity: usize,
}

impl EventBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            buf: VecDeque::with_capacity(capacity.max(1)),
            last_seq: 0,
            capacity: capacity.max(1),
        }
    }

    /// Seq of the most recently written event (0 before the first write).
    pub fn last_seq(&self) -> u32 {
        self.last_seq
    }

    /// Seq of the oldest event still buffered. One past `last_seq` when
    /// the ring is empty.
    fn first_seq(&self) -> u32 {
        self.last_seq - self.buf.len() as u32 + 1
    }

    /// Appends an event, evicting the oldest slot if the ring is full.
    /// Returns the assigned sequence number.
    pub fn write(&mut self, ev: Arc<RegularEvent>) -> u32 {
        if self.buf.len() == self.capacity {
            self.buf.pop_front();
        }
        self.buf.push_back(ev);
        self.last_seq += 1;
        self.last_seq
    }

    /// Whether a peer that last acknowledged `last_ack` can still be
    /// served from this ring.
    pub fn can_resume_from(&self, last_ack: u32) -> bool {
        last_ack + 1 >= self.first_seq()
    }

    /// Returns the events after `last_ack` in order, paired with their
    /// sequence numbers.
    pub fn read_from(
        &self,
        last_ack: u32,
    ) -> Result<Vec<(u32, Arc<RegularEvent>)>, TooOld> {
        if !self.can_resume_from(last_ack) {
            return Err(TooOld {
                requested: last_ack + 1,
                first_buffered: self.first_seq(),
            });
        }
        let skip = (last_ack + 1 - self.first_seq()) as usize;
        Ok(self
            .buf
            .iter()
            .enumerate()
            .skip(skip)
            .map(|(i, ev)| (self.first_seq() + i as u32, ev.clone()))
            .collect())
    }
}

// =========================================================================
// Tests
// =========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn ev(n: u8) -> Arc<RegularEvent> {
        Arc::new(RegularEvent::message("sender", &[n]))
    }

    #[test]
    fn test_write_assigns_increasing_seqs_from_one() {
        let mut buf = EventBuffer::new(4);
        assert_eq!(buf.last_seq(), 0);
        assert_eq!(buf.write(ev(1)), 1);
        assert_eq!(buf.write(ev(2)), 2);
        assert_eq!(buf.write(ev(3)), 3);
        assert_eq!(buf.last_seq(), 3);
    }

    #[test]
    fn test_read_from_zero_returns_everything() {
        let mut buf = EventBuffer::new(4);
        buf.write(ev(1));
        buf.write(ev(2));

        let evs = buf.read_from(0).expect("readable");
        let seqs: Vec<u32> = evs.iter().map(|(s, _)| *s).collect();
        assert_eq!(seqs, vec![1, 2]);
    }

    #[test]
    fn test_read_from_midpoint() {
        let mut buf = EventBuffer::new(8);
        for n in 1..=5 {
            buf.write(ev(n));
        }
        let evs = buf.read_from(3).expect("readable");
        let seqs: Vec<u32> = evs.iter().map(|(s, _)| *s).collect();
        assert_eq!(seqs, vec![4, 5]);
    }

    #[test]
    fn test_read_from_tip_is_empty() {
        let mut buf = EventBuffer::new(4);
        buf.write(ev(1));
        assert!(buf.read_from(1).expect("readable").is_empty());
    }

    #[test]
    fn test_read_from_empty_buffer() {
        let buf = EventBuffer::new(4);
        assert!(buf.read_from(0).expect("readable").is_empty());
    }

    #[test]
    fn test_eviction_drops_oldest() {
        let mut buf = EventBuffer::new(3);
        for n in 1..=5 {
            buf.write(ev(n));
        }
        // Seqs 1 and 2 are gone; 3..=5 remain.
        let evs = buf.read_from(2).expect("3 is still buffered");
        let seqs: Vec<u32> = evs.iter().map(|(s, _)| *s).collect();
        assert_eq!(seqs, vec![3, 4, 5]);
    }

    #[test]
    fn test_read_behind_ring_is_too_old() {
        let mut buf = EventBuffer::new(3);
        for n in 1..=5 {
            buf.write(ev(n));
        }
        let err = buf.read_from(1).expect_err("seq 2 was evicted");
        assert_eq!(err.requested, 2);
        assert_eq!(err.first_buffered, 3);

        assert!(!buf.can_resume_from(1));
        assert!(buf.can_resume_from(2));
    }

    #[test]
    fn test_events_come_back_in_order_and_intact() {
        let mut buf = EventBuffer::new(4);
        buf.write(ev(9));
        buf.write(ev(8));
        let evs = buf.read_from(0).unwrap();
        assert_eq!(evs[0].1.payload()[evs[0].1.payload().len() - 1], 9);
        assert_eq!(evs[1].1.payload()[evs[1].1.payload().len() - 1], 8);
    }
}
