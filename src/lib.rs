//! Reliable message-oriented transport on top of UDP.
//!
//! One UDP socket carries any number of peer sessions: a server endpoint
//!  multiplexes many peers by source address, a client endpoint tracks
//!  exactly one. Within a session the protocol provides:
//!
//! * in-order, exactly-once delivery of *reliable* messages, retransmitted
//!   on an RFC 6298 retransmission timeout until acknowledged
//! * best-effort delivery of *unreliable* messages interleaved in the same
//!   stream, at most once, sequenced within their "reliable epoch" (the
//!   span between two reliable messages)
//! * transparent segmentation and reassembly of messages larger than one
//!   datagram
//! * keepalive probing with RTT estimation, and peer-drop detection after
//!   a configurable window of silence
//!
//! Explicitly out of scope: congestion control beyond the RTO back-off,
//!  flow control (the send queue is unbounded and paced only by the RTO),
//!  encryption and authentication, NAT traversal, and ordering of
//!  unreliable messages across a reliable one.
//!
//! ## Wire format
//!
//! Every datagram starts with a fixed header (all numbers big-endian):
//!
//! ```ascii
//!  0: protocol version (u8), currently 1
//!  1: command (u8): NOOP=0, CLOSE=1, CONN_REQ=2, CONN_RSP=3, PING=4,
//!      PONG=5; 16..=255 are application commands
//!  2: flags (u8): RELIABLE=1, RETRANSMITTED=2, ACK=4
//!  3: reserved (u8)
//!  4: reliable sequence number (u16)
//!  6: unreliable sequence number (u16)
//!  8: reliable ack (u16), valid iff the ACK flag is set
//! 10: segment index (u16)
//! 12: segment count (u16)
//! ```
//!
//! The payload follows directly. `CONN_RSP` carries a u32 `accepted`
//!  field; `PING`/`PONG` carry the sender's 8-byte timestamp, echoed back
//!  verbatim.
//!
//! Sequence numbers are 16-bit and wrap; all comparisons use the signed
//!  delta of the difference. Acknowledgements are cumulative and ride
//!  piggyback on whatever goes out next - if nothing is pending, a NOOP is
//!  generated as the carrier.
//!
//! ## Connection lifecycle
//!
//! A client opens a session with a reliable `CONN_REQ`; the server answers
//!  `CONN_RSP` with the request acked. There is no closing handshake: a
//!  `CLOSE` is sent once (unqueued, best effort) and the receiving side
//!  drops the peer immediately. A peer that stays silent past its `drop`
//!  timeout is declared lost without any exchange.
//!
//! ## Driving it
//!
//! Everything is driven by two things per endpoint: the receive loop
//!  ([`Server::recv_loop`] / [`Client::run`]) and one service timer task
//!  per peer, which flushes the send queue, retransmits, and injects
//!  keepalives. Application callbacks arrive through the [`ServerHandler`]
//!  and [`ClientHandler`] traits.

pub mod buffer_pool;
pub mod client;
pub mod config;
pub mod end_point;
pub mod error;
pub mod packet_header;
pub mod peer;
pub mod reassembly;
pub mod rtt;
pub mod send_queue;
pub mod send_socket;
pub mod server;
pub mod time;

pub use client::{Client, ClientHandler};
pub use config::{PeerTimeouts, RudpConfig, RECV_BUFFER_SIZE};
pub use error::RudpError;
pub use server::{Server, ServerHandler};

#[cfg(test)]
mod tests {
    use tracing::Level;

    #[ctor::ctor]
    fn init_test_logging() {
        tracing_subscriber::fmt()
            .with_test_writer()
            .with_max_level(Level::DEBUG)
            .try_init()
            .ok();
    }
}
