use bitflags::bitflags;
use bytes::{Buf, BufMut};
use std::fmt::{Debug, Display};

bitflags! {
    /// Header option flags.
    #[derive(Debug, PartialEq, Eq, Copy, Clone)]
    pub struct Opt: u8 {
        /// Delivery is guaranteed: the segment stays queued until acked.
        const RELIABLE = 0b0000_0001;
        /// The segment has been transmitted at least once.
        const RETRANSMITTED = 0b0000_0010;
        /// `reliable_ack` carries a valid acknowledgement.
        const ACK = 0b0000_0100;
    }
}

/// Protocol commands. The single command byte is under-used, so everything
///  from `Command::APP_BASE` up is application payload.
#[derive(Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// Useless payload, handy as an ack carrier or NAT keepalive.
    Noop,
    /// Session teardown. The regular ack does the answering.
    Close,
    /// Connection request; answered with `ConnRsp`.
    ConnReq,
    /// Connection response carrying a 32-bit accepted field.
    ConnRsp,
    /// Must be answered with a `Pong` echoing the payload, unless the ping
    ///  was retransmitted.
    Ping,
    /// Ping answer.
    Pong,
    /// Application payload; the wrapped value is the application-level
    ///  command, i.e. wire byte minus `APP_BASE`.
    App(u8),
    /// Command bytes between the protocol commands and the application
    ///  range. Parsed, never dispatched.
    Reserved(u8),
}

impl Command {
    pub const APP_BASE: u8 = 16;

    pub fn from_wire(raw: u8) -> Command {
        match raw {
            0 => Command::Noop,
            1 => Command::Close,
            2 => Command::ConnReq,
            3 => Command::ConnRsp,
            4 => Command::Ping,
            5 => Command::Pong,
            n if n >= Command::APP_BASE => Command::App(n - Command::APP_BASE),
            n => Command::Reserved(n),
        }
    }

    pub fn to_wire(self) -> u8 {
        match self {
            Command::Noop => 0,
            Command::Close => 1,
            Command::ConnReq => 2,
            Command::ConnRsp => 3,
            Command::Ping => 4,
            Command::Pong => 5,
            Command::App(n) => Command::APP_BASE + n,
            Command::Reserved(n) => n,
        }
    }
}

impl Debug for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Command::Noop => write!(f, "NOOP"),
            Command::Close => write!(f, "CLOSE"),
            Command::ConnReq => write!(f, "CONN_REQ"),
            Command::ConnRsp => write!(f, "CONN_RSP"),
            Command::Ping => write!(f, "PING"),
            Command::Pong => write!(f, "PONG"),
            Command::App(n) => write!(f, "APP({})", n),
            Command::Reserved(n) => write!(f, "RESERVED({})", n),
        }
    }
}

impl Display for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        Debug::fmt(self, f)
    }
}

/// The fixed packet header, present on every datagram. All multi-byte
///  fields are in network byte order:
///
/// ```ascii
///  0: protocol version (u8) - must be 1
///  1: command (u8)
///  2: option flags (u8) - RELIABLE / RETRANSMITTED / ACK
///  3: reserved (u8) - zero on send, ignored on receive
///  4: reliable sequence number (u16)
///  6: unreliable sequence number (u16)
///  8: reliable ack (u16) - meaningful iff the ACK flag is set
/// 10: segment index (u16)
/// 12: segment count (u16)
/// ```
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct PacketHeader {
    pub command: Command,
    pub opt: Opt,
    pub reliable_seq: u16,
    pub unreliable_seq: u16,
    pub reliable_ack: u16,
    pub segment_index: u16,
    pub segments_size: u16,
}

impl Debug for PacketHeader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "PCKT{{V{} {:?} {:?} {:04x}:{:04x} ack {:04x} seg {}/{}}}",
            Self::PROTOCOL_VERSION,
            self.command,
            self.opt,
            self.reliable_seq,
            self.unreliable_seq,
            self.reliable_ack,
            self.segment_index,
            self.segments_size,
        )
    }
}

impl PacketHeader {
    pub const PROTOCOL_VERSION: u8 = 1;
    pub const SERIALIZED_LEN: usize = 14;

    /// A single-segment header for the given command; sequence numbers,
    ///  flags and ack are stamped later by the peer engine.
    pub fn for_command(command: Command) -> PacketHeader {
        PacketHeader {
            command,
            opt: Opt::empty(),
            reliable_seq: 0,
            unreliable_seq: 0,
            reliable_ack: 0,
            segment_index: 0,
            segments_size: 1,
        }
    }

    pub fn ser(&self, buf: &mut impl BufMut) {
        buf.put_u8(Self::PROTOCOL_VERSION);
        buf.put_u8(self.command.to_wire());
        buf.put_u8(self.opt.bits());
        buf.put_u8(0);
        buf.put_u16(self.reliable_seq);
        buf.put_u16(self.unreliable_seq);
        buf.put_u16(self.reliable_ack);
        buf.put_u16(self.segment_index);
        buf.put_u16(self.segments_size);
    }

    pub fn deser(buf: &mut impl Buf) -> anyhow::Result<PacketHeader> {
        let version = buf.try_get_u8()?;
        if version != Self::PROTOCOL_VERSION {
            return Err(anyhow::anyhow!("unsupported protocol version {}", version));
        }

        let command = Command::from_wire(buf.try_get_u8()?);
        let opt = Opt::from_bits_truncate(buf.try_get_u8()?);
        let _reserved = buf.try_get_u8()?;

        Ok(PacketHeader {
            command,
            opt,
            reliable_seq: buf.try_get_u16()?,
            unreliable_seq: buf.try_get_u16()?,
            reliable_ack: buf.try_get_u16()?,
            segment_index: buf.try_get_u16()?,
            segments_size: buf.try_get_u16()?,
        })
    }
}

/// Difference between two sequence numbers under 16-bit wrap-around
///  semantics: positive if `a` is ahead of `b`.
pub fn seq_delta(a: u16, b: u16) -> i16 {
    a.wrapping_sub(b) as i16
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;
    use rstest::rstest;

    #[rstest]
    #[case::noop(PacketHeader::for_command(Command::Noop))]
    #[case::close(PacketHeader::for_command(Command::Close))]
    #[case::conn_req(PacketHeader {
        command: Command::ConnReq, opt: Opt::RELIABLE,
        reliable_seq: 0x1234, unreliable_seq: 0, reliable_ack: 0,
        segment_index: 0, segments_size: 1,
    })]
    #[case::app_with_everything(PacketHeader {
        command: Command::App(7), opt: Opt::RELIABLE | Opt::RETRANSMITTED | Opt::ACK,
        reliable_seq: 0xffff, unreliable_seq: 0x8000, reliable_ack: 0xfffe,
        segment_index: 2, segments_size: 3,
    })]
    #[case::reserved_command(PacketHeader::for_command(Command::Reserved(9)))]
    #[case::app_max(PacketHeader::for_command(Command::App(239)))]
    fn test_header_roundtrip(#[case] header: PacketHeader) {
        let mut buf = BytesMut::new();
        header.ser(&mut buf);
        assert_eq!(buf.len(), PacketHeader::SERIALIZED_LEN);

        let deser = PacketHeader::deser(&mut buf).unwrap();
        assert!(buf.is_empty());
        assert_eq!(deser, header);
    }

    #[test]
    fn test_wire_layout() {
        let header = PacketHeader {
            command: Command::App(1),
            opt: Opt::RELIABLE | Opt::ACK,
            reliable_seq: 0x0102,
            unreliable_seq: 0x0304,
            reliable_ack: 0x0506,
            segment_index: 0x0708,
            segments_size: 0x090a,
        };
        let mut buf = BytesMut::new();
        header.ser(&mut buf);
        assert_eq!(
            buf.as_ref(),
            &[1, 17, 0b101, 0, 1, 2, 3, 4, 5, 6, 7, 8, 9, 10]
        );
    }

    #[test]
    fn test_wrong_version_rejected() {
        let mut buf = BytesMut::new();
        PacketHeader::for_command(Command::Noop).ser(&mut buf);
        buf[0] = 2;
        assert!(PacketHeader::deser(&mut buf).is_err());
    }

    #[test]
    fn test_truncated_header_rejected() {
        let mut buf = BytesMut::new();
        PacketHeader::for_command(Command::Noop).ser(&mut buf);
        buf.truncate(7);
        assert!(PacketHeader::deser(&mut buf).is_err());
    }

    #[rstest]
    #[case::equal(5, 5, 0)]
    #[case::ahead(6, 5, 1)]
    #[case::behind(5, 6, -1)]
    #[case::wrap_ahead(0, 0xffff, 1)]
    #[case::wrap_behind(0xffff, 0, -1)]
    #[case::far_ahead(0x8000, 0, -32768)]
    fn test_seq_delta(#[case] a: u16, #[case] b: u16, #[case] expected: i16) {
        assert_eq!(seq_delta(a, b), expected);
    }

    #[rstest]
    #[case(0, Command::Noop)]
    #[case(5, Command::Pong)]
    #[case(6, Command::Reserved(6))]
    #[case(15, Command::Reserved(15))]
    #[case(16, Command::App(0))]
    #[case(255, Command::App(239))]
    fn test_command_wire_mapping(#[case] raw: u8, #[case] expected: Command) {
        assert_eq!(Command::from_wire(raw), expected);
        assert_eq!(expected.to_wire(), raw);
    }
}
