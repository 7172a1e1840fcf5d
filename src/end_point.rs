use crate::buffer_pool::BufferPool;
use crate::error::RudpError;
use bytes::BytesMut;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{lookup_host, UdpSocket};
use tracing::{info, trace};

/// One bound UDP socket plus the buffer pool its datagrams are read into.
///  Demultiplexing by source address is the owner's job (`Server` keeps a
///  peer per source, `Client` has exactly one).
pub struct EndPoint {
    socket: Arc<UdpSocket>,
    buffer_pool: Arc<BufferPool>,
}

impl EndPoint {
    pub async fn bind(
        bind_addr: SocketAddr,
        buffer_pool: Arc<BufferPool>,
    ) -> Result<EndPoint, RudpError> {
        let socket = Arc::new(UdpSocket::bind(bind_addr).await?);
        info!("bound socket to {:?}", socket.local_addr()?);

        Ok(EndPoint {
            socket,
            buffer_pool,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, RudpError> {
        Ok(self.socket.local_addr()?)
    }

    /// The raw socket as a send-only handle for peer engines.
    pub fn send_socket(&self) -> Arc<UdpSocket> {
        self.socket.clone()
    }

    pub async fn send(&self, to: SocketAddr, bytes: &[u8]) -> io::Result<usize> {
        self.socket.send_to(bytes, to).await
    }

    /// Perform a single receive into a pool-allocated buffer. Failures are
    ///  the caller's to log; the buffer is recycled on the way out and
    ///  there is no retry loop here.
    pub async fn recv_packet(&self) -> io::Result<(BytesMut, SocketAddr)> {
        let mut buf = self.buffer_pool.get_from_pool();
        buf.resize(self.buffer_pool.buf_size(), 0);

        match self.socket.recv_from(buf.as_mut()).await {
            Ok((num_read, from)) => {
                buf.truncate(num_read);
                trace!("received {} bytes from {:?}", num_read, from);
                Ok((buf, from))
            }
            Err(e) => {
                self.buffer_pool.return_to_pool(buf);
                Err(e)
            }
        }
    }

    pub fn return_buffer(&self, buf: BytesMut) {
        self.buffer_pool.return_to_pool(buf);
    }
}

/// Resolve a hostname and port to a socket address. The first resolution
///  result wins; an empty result set is the address-required error.
pub async fn resolve_host(hostname: &str, port: u16) -> Result<SocketAddr, RudpError> {
    lookup_host((hostname, port))
        .await?
        .next()
        .ok_or(RudpError::AddressRequired)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_bind_and_roundtrip_on_loopback() {
        let pool = Arc::new(BufferPool::new(1500, 4));
        let a = EndPoint::bind("127.0.0.1:0".parse().unwrap(), pool.clone())
            .await
            .unwrap();
        let b = EndPoint::bind("127.0.0.1:0".parse().unwrap(), pool)
            .await
            .unwrap();

        a.send(b.local_addr().unwrap(), b"ping?").await.unwrap();

        let (buf, from) = b.recv_packet().await.unwrap();
        assert_eq!(buf.as_ref(), b"ping?");
        assert_eq!(from, a.local_addr().unwrap());
        b.return_buffer(buf);
    }

    #[tokio::test]
    async fn test_resolve_localhost() {
        let addr = resolve_host("localhost", 4567).await.unwrap();
        assert_eq!(addr.port(), 4567);
        assert!(addr.ip().is_loopback());
    }
}
