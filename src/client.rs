use crate::buffer_pool::BufferPool;
use crate::config::RudpConfig;
use crate::end_point::{resolve_host, EndPoint};
use crate::error::RudpError;
use crate::packet_header::PacketHeader;
use crate::peer::{dispatch_events, Peer, PeerHandler, PeerState};
use crate::send_socket::SendSocket;
use crate::time::MonotonicClock;
use async_trait::async_trait;
use bytes::Bytes;
#[cfg(test)]
use mockall::automock;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::{Notify, RwLock};
use tracing::{error, info, trace, warn};

/// Application-side interface of a client endpoint.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ClientHandler: Send + Sync + 'static {
    /// A complete application message from the server.
    async fn handle_packet(&self, command: u8, payload: Bytes);

    /// A reliable segment sent to the server was acknowledged.
    async fn link_info(&self, acked_seq: u16);

    /// The connection handshake completed. Fires once per connect.
    async fn connected(&self);

    /// The server closed the session or went silent past the drop
    ///  timeout. The client is torn down when this fires.
    async fn server_lost(&self);
}

struct ClientShared {
    peer: RwLock<Option<Arc<Peer>>>,
    connected: AtomicBool,
    shutdown: Notify,
}

/// Adapts peer engine events to the `ClientHandler` and tears the client
///  down when the peer reports the session gone.
struct ClientPeerRelay {
    shared: Weak<ClientShared>,
    handler: Arc<dyn ClientHandler>,
}

#[async_trait]
impl PeerHandler for ClientPeerRelay {
    async fn handle_packet(&self, _peer: SocketAddr, command: u8, payload: Bytes) {
        self.handler.handle_packet(command, payload).await;
    }

    async fn link_info(&self, _peer: SocketAddr, acked_seq: u16) {
        self.handler.link_info(acked_seq).await;
    }

    async fn dropped(&self, peer: SocketAddr) {
        info!("peer {:?} dropped (server lost)", peer);

        let Some(shared) = self.shared.upgrade() else {
            return;
        };

        shared.connected.store(false, Ordering::SeqCst);
        let peer = shared.peer.write().await.take();
        shared.shutdown.notify_one();

        self.handler.server_lost().await;

        // releasing the peer last: when this very call came from its
        //  service task, the abort in Peer::drop only lands after the
        //  upcall is done
        drop(peer);
    }
}

/// A client endpoint: one UDP socket tracking exactly one peer, the
///  server. Construction binds the socket and queues the connection
///  request; the handshake completes inside `run`.
pub struct Client {
    end_point: Arc<EndPoint>,
    shared: Arc<ClientShared>,
    relay: Arc<ClientPeerRelay>,
    handler: Arc<dyn ClientHandler>,
    server_addr: SocketAddr,
}

impl Client {
    pub async fn connect(
        server_addr: SocketAddr,
        config: Arc<RudpConfig>,
        handler: Arc<dyn ClientHandler>,
    ) -> Result<Arc<Client>, RudpError> {
        if let Err(e) = config.validate() {
            error!("invalid configuration: {}", e);
            return Err(RudpError::InvalidArgument);
        }

        let buffer_pool = Arc::new(BufferPool::new(
            config.recv_buffer_size,
            config.buffer_pool_size,
        ));

        // a wildcard local address of the server's family
        let bind_addr: SocketAddr = if server_addr.is_ipv4() {
            (Ipv4Addr::UNSPECIFIED, 0).into()
        } else {
            (Ipv6Addr::UNSPECIFIED, 0).into()
        };
        let end_point = Arc::new(EndPoint::bind(bind_addr, buffer_pool.clone()).await?);

        let shared = Arc::new(ClientShared {
            peer: RwLock::new(None),
            connected: AtomicBool::new(false),
            shutdown: Notify::new(),
        });
        let relay = Arc::new(ClientPeerRelay {
            shared: Arc::downgrade(&shared),
            handler: handler.clone(),
        });

        let peer = Peer::spawn(
            server_addr,
            Arc::new(end_point.send_socket()) as Arc<dyn SendSocket>,
            relay.clone(),
            config.timeout,
            config.recv_buffer_size,
            buffer_pool,
            MonotonicClock::new(),
        );
        peer.send_connect().await?;
        *shared.peer.write().await = Some(peer);

        Ok(Arc::new(Client {
            end_point,
            shared,
            relay,
            handler,
            server_addr,
        }))
    }

    /// Like `connect`, with the server given as hostname and port.
    pub async fn connect_host(
        hostname: &str,
        port: u16,
        config: Arc<RudpConfig>,
        handler: Arc<dyn ClientHandler>,
    ) -> Result<Arc<Client>, RudpError> {
        let addr = resolve_host(hostname, port).await?;
        Client::connect(addr, config, handler).await
    }

    pub fn local_addr(&self) -> Result<SocketAddr, RudpError> {
        self.end_point.local_addr()
    }

    pub fn server_addr(&self) -> SocketAddr {
        self.server_addr
    }

    pub fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::SeqCst)
    }

    /// Receive datagrams and feed them to the peer until the session ends
    ///  or the task is cancelled.
    pub async fn run(&self) {
        info!("starting client receive loop");

        loop {
            if self.shared.peer.read().await.is_none() {
                trace!("client torn down, leaving receive loop");
                return;
            }

            let received = tokio::select! {
                r = self.end_point.recv_packet() => r,
                _ = self.shared.shutdown.notified() => {
                    trace!("client shut down, leaving receive loop");
                    return;
                }
            };

            let (buf, _from) = match received {
                Ok(x) => x,
                Err(e) => {
                    error!("socket error: {}", e);
                    continue;
                }
            };

            self.handle_datagram(&buf).await;
            self.end_point.return_buffer(buf);
        }
    }

    async fn handle_datagram(&self, datagram: &[u8]) {
        let Some(peer) = self.shared.peer.read().await.clone() else {
            return;
        };

        let mut parse_buf = datagram;
        let header = match PacketHeader::deser(&mut parse_buf) {
            Ok(header) => header,
            Err(_) => {
                warn!("unparseable packet, dropping");
                return;
            }
        };

        let Ok(events) = peer.incoming_packet(&header, parse_buf).await else {
            return;
        };
        dispatch_events(peer.peer_addr(), events, self.relay.as_ref()).await;

        // handshake completion is observed here rather than signalled by
        //  the engine: the first fully ingested packet that leaves the
        //  peer running means the server answered
        if peer.state().await == PeerState::Run
            && !self.shared.connected.swap(true, Ordering::SeqCst)
        {
            self.handler.connected().await;
        }
    }

    /// Send one application message to the server. Fails with
    ///  `NotConnected` until the handshake has completed.
    pub async fn send(&self, reliable: bool, command: u8, data: &[u8]) -> Result<(), RudpError> {
        if !self.is_connected() {
            return Err(RudpError::NotConnected);
        }

        let peer = self
            .shared
            .peer
            .read()
            .await
            .clone()
            .ok_or(RudpError::NotConnected)?;

        peer.send(reliable, command, data).await
    }

    /// Override the session timeouts; RTO bounds apply immediately.
    pub async fn set_timeouts(&self, timeout: crate::config::PeerTimeouts) -> Result<(), RudpError> {
        let peer = self
            .shared
            .peer
            .read()
            .await
            .clone()
            .ok_or(RudpError::InvalidArgument)?;

        peer.set_timeouts(timeout).await;
        Ok(())
    }

    /// Tell the server goodbye and tear the session down. Unacked
    ///  in-flight data is lost.
    pub async fn close(&self) {
        let peer = self.shared.peer.write().await.take();

        if let Some(peer) = peer {
            let _ = peer.send_close_noqueue().await;
        }

        self.shared.connected.store(false, Ordering::SeqCst);
        // notify_one stores a permit, so the receive loop sees the
        //  shutdown even if it is not parked on notified() right now
        self.shared.shutdown.notify_one();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::UdpSocket;

    struct NullHandler;

    #[async_trait]
    impl ClientHandler for NullHandler {
        async fn handle_packet(&self, _command: u8, _payload: Bytes) {}
        async fn link_info(&self, _acked_seq: u16) {}
        async fn connected(&self) {}
        async fn server_lost(&self) {}
    }

    #[tokio::test]
    async fn test_send_before_handshake_is_not_connected() {
        // a server socket that never answers
        let silent = UdpSocket::bind("127.0.0.1:0").await.unwrap();

        let client = Client::connect(
            silent.local_addr().unwrap(),
            Arc::new(RudpConfig::default()),
            Arc::new(NullHandler),
        )
        .await
        .unwrap();

        assert!(!client.is_connected());
        assert!(matches!(
            client.send(true, 0, b"too early").await,
            Err(RudpError::NotConnected)
        ));
    }

    #[tokio::test]
    async fn test_connect_host_resolves() {
        let silent = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let port = silent.local_addr().unwrap().port();

        let client = Client::connect_host(
            "localhost",
            port,
            Arc::new(RudpConfig::default()),
            Arc::new(NullHandler),
        )
        .await
        .unwrap();

        assert_eq!(client.server_addr().port(), port);
        client.close().await;
    }

    #[tokio::test]
    async fn test_close_without_handshake_is_quiet() {
        let silent = UdpSocket::bind("127.0.0.1:0").await.unwrap();

        let client = Client::connect(
            silent.local_addr().unwrap(),
            Arc::new(RudpConfig::default()),
            Arc::new(NullHandler),
        )
        .await
        .unwrap();

        client.close().await;
        assert!(!client.is_connected());
        // a second close finds nothing left to tear down
        client.close().await;
    }
}
