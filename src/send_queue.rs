use crate::packet_header::{Opt, PacketHeader};
use bytes::Bytes;
use std::collections::VecDeque;

/// One outgoing segment: a stamped header plus its payload bytes. The
///  header is mutated in place while the segment is queued (ack piggyback,
///  retransmit marking).
#[derive(Debug, Clone)]
pub struct Segment {
    pub header: PacketHeader,
    pub payload: Bytes,
}

impl Segment {
    pub fn is_reliable(&self) -> bool {
        self.header.opt.contains(Opt::RELIABLE)
    }

    pub fn was_transmitted(&self) -> bool {
        self.header.opt.contains(Opt::RETRANSMITTED)
    }
}

/// Ordered queue of segments awaiting first transmission or
///  retransmission.
///
/// Invariants: segments stay in sequence-assignment order; reliable
///  segments remain queued until acknowledged, unreliable segments are
///  removed right after their first transmission. The queue is unbounded -
///  pacing is the caller's problem.
#[derive(Default)]
pub struct SendQueue {
    segments: VecDeque<Segment>,
}

impl SendQueue {
    pub fn new() -> SendQueue {
        SendQueue::default()
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    pub fn len(&self) -> usize {
        self.segments.len()
    }

    pub fn push_back(&mut self, segment: Segment) {
        self.segments.push_back(segment);
    }

    pub fn front(&self) -> Option<&Segment> {
        self.segments.front()
    }

    pub fn pop_front(&mut self) -> Option<Segment> {
        self.segments.pop_front()
    }

    pub fn get_mut(&mut self, index: usize) -> Option<&mut Segment> {
        self.segments.get_mut(index)
    }

    pub fn remove(&mut self, index: usize) -> Option<Segment> {
        self.segments.remove(index)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Segment> {
        self.segments.iter()
    }

    pub fn clear(&mut self) {
        self.segments.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet_header::Command;

    fn segment(reliable_seq: u16) -> Segment {
        let mut header = PacketHeader::for_command(Command::App(0));
        header.reliable_seq = reliable_seq;
        header.opt = Opt::RELIABLE;
        Segment {
            header,
            payload: Bytes::from_static(b"x"),
        }
    }

    #[test]
    fn test_fifo_order() {
        let mut queue = SendQueue::new();
        queue.push_back(segment(1));
        queue.push_back(segment(2));
        queue.push_back(segment(3));

        assert_eq!(queue.len(), 3);
        assert_eq!(queue.pop_front().unwrap().header.reliable_seq, 1);
        assert_eq!(queue.front().unwrap().header.reliable_seq, 2);

        queue.remove(0);
        assert_eq!(queue.pop_front().unwrap().header.reliable_seq, 3);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_in_place_header_mutation() {
        let mut queue = SendQueue::new();
        queue.push_back(segment(7));

        queue.get_mut(0).unwrap().header.opt |= Opt::RETRANSMITTED;

        assert!(queue.front().unwrap().was_transmitted());
    }
}
