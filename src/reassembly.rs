use crate::packet_header::{Command, Opt, PacketHeader};
use bytes::{BufMut, Bytes, BytesMut};
use tracing::warn;

/// At most one multi-segment message is in flight per peer: segment 0
///  (re)initializes the buffer, middle segments append, and the final
///  segment yields the concatenated message.
///
/// Ordering is inherited from the reliable stream, so reliable
///  multi-segment messages cannot have gaps. Unreliable multi-segment
///  messages are best effort: a lost middle segment makes the message
///  garbage, which the next segment 0 discards.
pub struct Reassembly {
    command: Command,
    opt: Opt,
    buffer: BytesMut,
    capacity: usize,
}

/// A fully reassembled (or single-segment) inbound message.
#[derive(Debug, PartialEq, Eq)]
pub struct AssembledPacket {
    pub command: Command,
    pub opt: Opt,
    pub payload: Bytes,
}

impl Reassembly {
    fn start(header: &PacketHeader, payload: &[u8], recv_buffer_size: usize) -> Reassembly {
        let capacity = header.segments_size as usize * recv_buffer_size;
        let mut buffer = BytesMut::with_capacity(capacity);
        buffer.put_slice(payload);

        Reassembly {
            command: header.command,
            opt: header.opt,
            buffer,
            capacity,
        }
    }
}

/// Feed one accepted application segment. Returns a packet once the
///  message is complete. `slot` is the peer's single reassembly slot.
pub fn on_segment(
    slot: &mut Option<Reassembly>,
    header: &PacketHeader,
    payload: &[u8],
    recv_buffer_size: usize,
) -> Option<AssembledPacket> {
    if header.segments_size <= 1 {
        return Some(AssembledPacket {
            command: header.command,
            opt: header.opt,
            payload: Bytes::copy_from_slice(payload),
        });
    }

    if header.segment_index == 0 {
        // A previous partial message, if any, is abandoned here.
        *slot = Some(Reassembly::start(header, payload, recv_buffer_size));
    } else {
        let Some(reassembly) = slot.as_mut() else {
            warn!(
                "continuation segment {}/{} without a message in progress - dropping",
                header.segment_index, header.segments_size
            );
            return None;
        };

        if reassembly.buffer.len() + payload.len() > reassembly.capacity {
            warn!("reassembly overflow - dropping message in progress");
            *slot = None;
            return None;
        }

        reassembly.buffer.put_slice(payload);
    }

    if header.segment_index as u32 + 1 == header.segments_size as u32 {
        let reassembly = slot.take()?;
        return Some(AssembledPacket {
            command: reassembly.command,
            opt: reassembly.opt,
            payload: reassembly.buffer.freeze(),
        });
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn app_header(segment_index: u16, segments_size: u16) -> PacketHeader {
        let mut header = PacketHeader::for_command(Command::App(3));
        header.opt = Opt::RELIABLE;
        header.segment_index = segment_index;
        header.segments_size = segments_size;
        header
    }

    #[test]
    fn test_single_segment_passes_through() {
        let mut slot = None;
        let out = on_segment(&mut slot, &app_header(0, 1), b"hello", 1500).unwrap();

        assert_eq!(out.command, Command::App(3));
        assert_eq!(out.payload.as_ref(), b"hello");
        assert!(slot.is_none());
    }

    #[test]
    fn test_three_segments_concatenate() {
        let mut slot = None;

        assert!(on_segment(&mut slot, &app_header(0, 3), b"aaa", 1500).is_none());
        assert!(on_segment(&mut slot, &app_header(1, 3), b"bbb", 1500).is_none());
        let out = on_segment(&mut slot, &app_header(2, 3), b"cc", 1500).unwrap();

        assert_eq!(out.payload.as_ref(), b"aaabbbcc");
        assert_eq!(out.command, Command::App(3));
        assert!(slot.is_none());
    }

    #[test]
    fn test_fresh_start_discards_partial_message() {
        let mut slot = None;

        assert!(on_segment(&mut slot, &app_header(0, 3), b"old", 1500).is_none());
        assert!(on_segment(&mut slot, &app_header(0, 2), b"new", 1500).is_none());
        let out = on_segment(&mut slot, &app_header(1, 2), b"!", 1500).unwrap();

        assert_eq!(out.payload.as_ref(), b"new!");
    }

    #[test]
    fn test_continuation_without_start_is_dropped() {
        let mut slot = None;
        assert!(on_segment(&mut slot, &app_header(1, 3), b"bbb", 1500).is_none());
        assert!(slot.is_none());
    }

    #[test]
    fn test_overflow_drops_message() {
        let mut slot = None;

        assert!(on_segment(&mut slot, &app_header(0, 2), &[0u8; 10], 16).is_none());
        assert!(on_segment(&mut slot, &app_header(1, 2), &[0u8; 30], 16).is_none());
        assert!(slot.is_none());
    }
}
