use crate::packet_header::PacketHeader;
use anyhow::bail;

/// Size of the receive buffer, and therefore the largest datagram this
///  protocol ever produces. Messages bigger than what fits next to a header
///  are split into segments and reassembled on the far side.
pub const RECV_BUFFER_SIZE: usize = 1500;

pub struct RudpConfig {
    /// Buffer size for a single datagram, payload and header included.
    ///
    /// All peers of a conversation must agree on this value: a sender
    ///  segments against its own buffer size, and a receiver truncates at
    ///  its own. The default is chosen so a packet fits a full Ethernet
    ///  frame without IP-level fragmentation.
    pub recv_buffer_size: usize,

    /// Number of packet buffers kept pooled; buffers returned beyond this
    ///  are dropped on the floor.
    pub buffer_pool_size: usize,

    /// Default timeouts for every peer created on this endpoint. Can be
    ///  overridden per peer after creation.
    pub timeout: PeerTimeouts,
}

/// Per-peer protocol timing, all in milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerTimeouts {
    /// Lower clamp for the retransmission timeout.
    pub min_rto: i64,
    /// Upper clamp for the retransmission timeout.
    pub max_rto: i64,
    /// Idle interval after which a keepalive PING is sent.
    pub action: i64,
    /// Silence interval after which the peer is declared lost.
    pub drop: i64,
}

impl Default for PeerTimeouts {
    fn default() -> Self {
        PeerTimeouts {
            min_rto: 100,
            max_rto: 1000,
            action: 500,
            drop: 5000,
        }
    }
}

impl Default for RudpConfig {
    fn default() -> Self {
        RudpConfig {
            recv_buffer_size: RECV_BUFFER_SIZE,
            buffer_pool_size: 1024,
            timeout: PeerTimeouts::default(),
        }
    }
}

impl RudpConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.recv_buffer_size <= PacketHeader::SERIALIZED_LEN {
            bail!("receive buffer size {} does not leave room for a payload", self.recv_buffer_size);
        }
        if self.timeout.min_rto <= 0 || self.timeout.max_rto < self.timeout.min_rto {
            bail!("RTO bounds must satisfy 0 < min_rto <= max_rto");
        }
        if self.timeout.action <= 0 || self.timeout.drop <= self.timeout.action {
            bail!("drop timeout must exceed the keepalive interval");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::default_is_valid(RECV_BUFFER_SIZE, 100, 1000, 500, 5000, true)]
    #[case::tiny_buffer(12, 100, 1000, 500, 5000, false)]
    #[case::rto_bounds_inverted(RECV_BUFFER_SIZE, 1000, 100, 500, 5000, false)]
    #[case::zero_min_rto(RECV_BUFFER_SIZE, 0, 1000, 500, 5000, false)]
    #[case::drop_below_action(RECV_BUFFER_SIZE, 100, 1000, 500, 400, false)]
    fn test_validate(
        #[case] recv_buffer_size: usize,
        #[case] min_rto: i64,
        #[case] max_rto: i64,
        #[case] action: i64,
        #[case] drop: i64,
        #[case] expected_valid: bool,
    ) {
        let config = RudpConfig {
            recv_buffer_size,
            buffer_pool_size: 16,
            timeout: PeerTimeouts { min_rto, max_rto, action, drop },
        };
        assert_eq!(config.validate().is_ok(), expected_valid);
    }
}
