use crate::buffer_pool::BufferPool;
use crate::config::RudpConfig;
use crate::end_point::{resolve_host, EndPoint};
use crate::error::RudpError;
use crate::packet_header::{Command, PacketHeader};
use crate::peer::{dispatch_events, Peer, PeerHandler};
use crate::send_socket::SendSocket;
use crate::time::MonotonicClock;
use async_trait::async_trait;
use bytes::Bytes;
#[cfg(test)]
use mockall::automock;
use rustc_hash::FxHashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::{Notify, RwLock};
use tracing::{debug, error, info, span, trace, warn, Instrument, Level};
use uuid::Uuid;

/// Application-side interface of a server endpoint.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ServerHandler: Send + Sync + 'static {
    /// A complete application message from a connected peer.
    async fn handle_packet(&self, peer: SocketAddr, command: u8, payload: Bytes);

    /// A reliable segment sent to this peer was acknowledged.
    async fn link_info(&self, peer: SocketAddr, acked_seq: u16);

    /// A peer completed the connection handshake.
    async fn peer_new(&self, peer: SocketAddr);

    /// A peer closed the session or timed out. The peer is forgotten right
    ///  after this returns.
    async fn peer_dropped(&self, peer: SocketAddr);
}

type PeerMap = FxHashMap<SocketAddr, Arc<Peer>>;

/// Adapts peer engine events to the `ServerHandler`, and removes peers
///  from the map when their engine reports them gone.
struct ServerPeerRelay {
    peers: Weak<RwLock<PeerMap>>,
    handler: Arc<dyn ServerHandler>,
}

#[async_trait]
impl PeerHandler for ServerPeerRelay {
    async fn handle_packet(&self, peer: SocketAddr, command: u8, payload: Bytes) {
        self.handler.handle_packet(peer, command, payload).await;
    }

    async fn link_info(&self, peer: SocketAddr, acked_seq: u16) {
        self.handler.link_info(peer, acked_seq).await;
    }

    async fn dropped(&self, peer: SocketAddr) {
        info!("peer {:?} dropped", peer);
        self.handler.peer_dropped(peer).await;

        if let Some(peers) = self.peers.upgrade() {
            peers.write().await.remove(&peer);
        }
    }
}

/// A server endpoint: one UDP socket, many peers, demultiplexed by source
///  address. Unknown sources are only admitted with a well-formed
///  connection request; everything else from them is garbage.
pub struct Server {
    end_point: Arc<EndPoint>,
    peers: Arc<RwLock<PeerMap>>,
    relay: Arc<ServerPeerRelay>,
    handler: Arc<dyn ServerHandler>,
    config: Arc<RudpConfig>,
    buffer_pool: Arc<BufferPool>,
    clock: MonotonicClock,
    closed: AtomicBool,
    shutdown: Notify,
}

impl Server {
    pub async fn bind(
        bind_addr: SocketAddr,
        config: Arc<RudpConfig>,
        handler: Arc<dyn ServerHandler>,
    ) -> Result<Arc<Server>, RudpError> {
        if let Err(e) = config.validate() {
            error!("invalid configuration: {}", e);
            return Err(RudpError::InvalidArgument);
        }

        let buffer_pool = Arc::new(BufferPool::new(
            config.recv_buffer_size,
            config.buffer_pool_size,
        ));

        let end_point = match EndPoint::bind(bind_addr, buffer_pool.clone()).await {
            Ok(ep) => Arc::new(ep),
            Err(e) => {
                error!("binding server to {:?} failed: {}", bind_addr, e);
                return Err(e);
            }
        };
        info!("bound server to {:?}", end_point.local_addr()?);

        let peers = Arc::new(RwLock::new(PeerMap::default()));
        let relay = Arc::new(ServerPeerRelay {
            peers: Arc::downgrade(&peers),
            handler: handler.clone(),
        });

        Ok(Arc::new(Server {
            end_point,
            peers,
            relay,
            handler,
            config,
            buffer_pool,
            clock: MonotonicClock::new(),
            closed: AtomicBool::new(false),
            shutdown: Notify::new(),
        }))
    }

    /// Like `bind`, with the local address given as hostname and port.
    pub async fn bind_host(
        hostname: &str,
        port: u16,
        config: Arc<RudpConfig>,
        handler: Arc<dyn ServerHandler>,
    ) -> Result<Arc<Server>, RudpError> {
        let addr = resolve_host(hostname, port).await?;
        Server::bind(addr, config, handler).await
    }

    pub fn local_addr(&self) -> Result<SocketAddr, RudpError> {
        self.end_point.local_addr()
    }

    pub async fn peer_count(&self) -> usize {
        self.peers.read().await.len()
    }

    /// Receive datagrams and feed them to their peers until the server is
    ///  closed or the task is cancelled. Socket errors are logged and
    ///  receiving continues.
    pub async fn recv_loop(&self) {
        info!("starting server receive loop");

        loop {
            if self.closed.load(Ordering::SeqCst) {
                trace!("server closed, leaving receive loop");
                return;
            }

            let received = tokio::select! {
                r = self.end_point.recv_packet() => r,
                _ = self.shutdown.notified() => {
                    trace!("server closed, leaving receive loop");
                    return;
                }
            };

            let (buf, from) = match received {
                Ok(x) => x,
                Err(e) => {
                    error!("socket error: {}", e);
                    continue;
                }
            };

            let correlation_id = Uuid::new_v4();
            let span = span!(Level::TRACE, "packet_received", ?correlation_id);
            self.handle_datagram(from, &buf).instrument(span).await;

            self.end_point.return_buffer(buf);
        }
    }

    /*
      - socket
         - receive loop
            - per-source demux  <===
               - new peer admission
               - peer engine ingress
     */
    async fn handle_datagram(&self, from: SocketAddr, datagram: &[u8]) {
        let mut parse_buf = datagram;
        let header = match PacketHeader::deser(&mut parse_buf) {
            Ok(header) => header,
            Err(_) => {
                warn!("unparseable packet from {:?}, dropping", from);
                return;
            }
        };

        let known = self.peers.read().await.get(&from).cloned();
        if let Some(peer) = known {
            if let Ok(events) = peer.incoming_packet(&header, parse_buf).await {
                dispatch_events(from, events, self.relay.as_ref()).await;
            }
            return;
        }

        // An unknown source is either a fresh connection attempt or
        //  garbage; we only know for sure once the handshake passes.
        if datagram.len() != PacketHeader::SERIALIZED_LEN + 4 || header.command != Command::ConnReq
        {
            debug!("garbage data from {:?}", from);
            return;
        }

        // a closed server admits nobody
        if self.closed.load(Ordering::SeqCst) {
            debug!("connection request from {:?} after close, ignored", from);
            return;
        }

        info!("new connection from {:?}", from);
        let peer = Peer::spawn(
            from,
            Arc::new(self.end_point.send_socket()) as Arc<dyn SendSocket>,
            self.relay.clone(),
            self.config.timeout,
            self.config.recv_buffer_size,
            self.buffer_pool.clone(),
            self.clock.clone(),
        );
        self.peers.write().await.insert(from, peer.clone());

        match peer.incoming_packet(&header, parse_buf).await {
            Ok(events) => {
                self.handler.peer_new(from).await;
                dispatch_events(from, events, self.relay.as_ref()).await;
            }
            Err(_) => {
                // never a valid peer, discard silently
                self.peers.write().await.remove(&from);
            }
        }
    }

    /// Send one application message to one connected peer.
    pub async fn send(
        &self,
        peer_addr: SocketAddr,
        reliable: bool,
        command: u8,
        data: &[u8],
    ) -> Result<(), RudpError> {
        let peer = self
            .peers
            .read()
            .await
            .get(&peer_addr)
            .cloned()
            .ok_or(RudpError::InvalidArgument)?;

        peer.send(reliable, command, data).await
    }

    /// Send one application message to every connected peer. Per-peer
    ///  sticky errors are left for the next per-peer send to report.
    pub async fn send_all(&self, reliable: bool, command: u8, data: &[u8]) -> Result<(), RudpError> {
        if command as u16 + Command::APP_BASE as u16 > 255 {
            return Err(RudpError::InvalidArgument);
        }

        let peers: Vec<Arc<Peer>> = self.peers.read().await.values().cloned().collect();
        for peer in peers {
            if let Err(e) = peer.send(reliable, command, data).await {
                debug!("send_all to {:?}: {}", peer.peer_addr(), e);
            }
        }
        Ok(())
    }

    /// Override the timeouts of one connected peer.
    pub async fn set_peer_timeouts(
        &self,
        peer_addr: SocketAddr,
        timeout: crate::config::PeerTimeouts,
    ) -> Result<(), RudpError> {
        let peer = self
            .peers
            .read()
            .await
            .get(&peer_addr)
            .cloned()
            .ok_or(RudpError::InvalidArgument)?;

        peer.set_timeouts(timeout).await;
        Ok(())
    }

    /// Server-initiated close of one peer: tell the remote side, then
    ///  forget the peer. No `peer_dropped` fires for it.
    pub async fn client_close(&self, peer_addr: SocketAddr) -> Result<(), RudpError> {
        let peer = self
            .peers
            .write()
            .await
            .remove(&peer_addr)
            .ok_or(RudpError::InvalidArgument)?;

        let _ = peer.send_close_noqueue().await;
        Ok(())
    }

    /// Drop every peer, signalling `peer_dropped` for each, and close the
    ///  endpoint: the receive loop exits and no new session is admitted.
    pub async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        // notify_one stores a permit, so the receive loop sees the
        //  shutdown even if it is not parked on notified() right now
        self.shutdown.notify_one();

        let peers: Vec<SocketAddr> = {
            let mut map = self.peers.write().await;
            let addrs = map.keys().cloned().collect();
            map.clear();
            addrs
        };

        for addr in peers {
            self.handler.peer_dropped(addr).await;
        }
    }
}
