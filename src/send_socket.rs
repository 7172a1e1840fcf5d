use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::UdpSocket;
use tracing::trace;

/// Abstraction for writing one datagram to a destination address,
///  introduced to facilitate mocking the I/O part away for testing.
///
/// Unlike the receive path, send errors are *not* swallowed here: the peer
///  engine keeps the last error sticky and surfaces it from the next user
///  send call.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait SendSocket: Send + Sync + 'static {
    async fn send_packet(&self, to: SocketAddr, packet_buf: &[u8]) -> io::Result<usize>;

    fn local_addr(&self) -> io::Result<SocketAddr>;
}

#[async_trait]
impl SendSocket for Arc<UdpSocket> {
    async fn send_packet(&self, to: SocketAddr, packet_buf: &[u8]) -> io::Result<usize> {
        trace!("UDP socket: sending {} bytes to {:?}", packet_buf.len(), to);
        self.send_to(packet_buf, to).await
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        self.as_ref().local_addr()
    }
}
