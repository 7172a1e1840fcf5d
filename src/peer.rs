use crate::buffer_pool::BufferPool;
use crate::config::PeerTimeouts;
use crate::error::RudpError;
use crate::packet_header::{seq_delta, Command, Opt, PacketHeader};
use crate::reassembly::{self, Reassembly};
use crate::rtt::RttEstimator;
use crate::send_queue::{Segment, SendQueue};
use crate::send_socket::SendSocket;
use crate::time::MonotonicClock;
use async_trait::async_trait;
use bytes::{BufMut, Bytes};
#[cfg(test)]
use mockall::automock;
use std::cmp::{max, min};
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Notify, RwLock};
use tokio::task::JoinHandle;
use tokio::time;
use tracing::{debug, info, trace, warn};

/// Lifecycle of a peer session. `Dead` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    /// Server-created, handshake not yet seen.
    New,
    /// Client-initiated, CONN_REQ sent, waiting for CONN_RSP.
    Connecting,
    /// Handshake complete, payload flows.
    Run,
    /// Closed by the remote side or dropped on timeout.
    Dead,
}

/// What a peer has to tell its owner. Events are *returned* from engine
///  calls rather than called back directly, so the owner dispatches them
///  after the peer lock is released - an owner is free to destroy the peer
///  while handling `Dropped`.
#[derive(Debug)]
pub enum PeerEvent {
    /// A complete application message arrived in order.
    Packet { command: u8, payload: Bytes },
    /// A reliable segment was acknowledged by the remote side.
    LinkInfo { acked_seq: u16 },
    /// The session ended: CLOSE received or drop deadline exceeded.
    ///  Emitted exactly once per peer.
    Dropped,
}

/// Upward interface of a peer, implemented by the server- and client-side
///  relays.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait PeerHandler: Send + Sync + 'static {
    async fn handle_packet(&self, peer: SocketAddr, command: u8, payload: Bytes);
    async fn link_info(&self, peer: SocketAddr, acked_seq: u16);
    async fn dropped(&self, peer: SocketAddr);
}

pub(crate) async fn dispatch_events(
    peer_addr: SocketAddr,
    events: Vec<PeerEvent>,
    handler: &dyn PeerHandler,
) {
    for event in events {
        match event {
            PeerEvent::Packet { command, payload } => {
                handler.handle_packet(peer_addr, command, payload).await
            }
            PeerEvent::LinkInfo { acked_seq } => handler.link_info(peer_addr, acked_seq).await,
            PeerEvent::Dropped => handler.dropped(peer_addr).await,
        }
    }
}

enum PacketOrder {
    Sequenced,
    Unsequenced,
    Retransmitted,
}

/// The protocol engine proper. All mutation goes through the owning
///  `Peer`'s lock; methods take explicit timestamps so the logic is
///  deterministic under test.
struct PeerInner {
    peer_addr: SocketAddr,
    state: PeerState,

    /// Last accepted inbound reliable sequence; `0xffff` means none yet.
    in_seq_reliable: u16,
    /// Highest accepted inbound unreliable sequence within the current
    ///  reliable epoch.
    in_seq_unreliable: u16,
    /// Last assigned outbound reliable sequence, randomly seeded.
    out_seq_reliable: u16,
    /// Last assigned outbound unreliable sequence; reset to 0 whenever a
    ///  reliable segment is assigned.
    out_seq_unreliable: u16,
    /// Highest reliable sequence acknowledged by the remote side.
    out_seq_acked: u16,

    send_queue: SendQueue,
    reassembly: Option<Reassembly>,
    rtt: RttEstimator,
    timeout: PeerTimeouts,

    last_out_time: i64,
    abs_timeout_deadline: i64,
    must_ack: bool,
    last_send_error: Option<io::ErrorKind>,

    socket: Arc<dyn SendSocket>,
    recv_buffer_size: usize,
    buffer_pool: Arc<BufferPool>,
}

impl PeerInner {
    fn new(
        peer_addr: SocketAddr,
        socket: Arc<dyn SendSocket>,
        timeout: PeerTimeouts,
        recv_buffer_size: usize,
        buffer_pool: Arc<BufferPool>,
        now: i64,
    ) -> PeerInner {
        let out_seq_reliable = rand::random::<u16>();

        PeerInner {
            peer_addr,
            state: PeerState::New,
            in_seq_reliable: u16::MAX,
            in_seq_unreliable: 0,
            out_seq_reliable,
            out_seq_unreliable: 0,
            out_seq_acked: out_seq_reliable.wrapping_sub(1),
            send_queue: SendQueue::new(),
            reassembly: None,
            rtt: RttEstimator::new(timeout.min_rto, timeout.max_rto),
            timeout,
            last_out_time: now,
            abs_timeout_deadline: now + timeout.drop,
            must_ack: false,
            last_send_error: None,
            socket,
            recv_buffer_size,
            buffer_pool,
        }
    }

    /// Return the peer to a pristine state: queue cleared, counters
    ///  re-seeded, drop deadline re-armed.
    fn reset(&mut self, now: i64) {
        self.send_queue.clear();
        self.reassembly = None;

        self.abs_timeout_deadline = now + self.timeout.drop;
        self.in_seq_reliable = u16::MAX;
        self.in_seq_unreliable = 0;
        self.out_seq_reliable = rand::random::<u16>();
        self.out_seq_unreliable = 0;
        self.out_seq_acked = self.out_seq_reliable.wrapping_sub(1);
        self.state = PeerState::New;
        self.last_out_time = now;
        self.rtt = RttEstimator::new(self.timeout.min_rto, self.timeout.max_rto);
        self.must_ack = false;
        self.last_send_error = None;
    }

    /// Classify an inbound reliable sequence number, advancing the inbound
    ///  counters if it is the expected next one.
    fn analyse_reliable(&mut self, reliable_seq: u16) -> PacketOrder {
        if self.in_seq_reliable == reliable_seq {
            return PacketOrder::Retransmitted;
        }

        if self.in_seq_reliable.wrapping_add(1) != reliable_seq {
            if self.state != PeerState::New || self.in_seq_reliable != u16::MAX {
                warn!(
                    "unsequenced reliable packet: last seq {:04x}, packet {:04x}",
                    self.in_seq_reliable, reliable_seq
                );
            }
            return PacketOrder::Unsequenced;
        }

        self.in_seq_reliable = reliable_seq;
        self.in_seq_unreliable = 0;

        PacketOrder::Sequenced
    }

    /// An unreliable header is in sequence iff it belongs to the current
    ///  reliable epoch and advances the unreliable counter.
    fn analyse_unreliable(&mut self, reliable_seq: u16, unreliable_seq: u16) -> PacketOrder {
        trace!(
            "unreliable order: rel {:04x} == {:04x}, unrel {:04x} > {:04x}",
            reliable_seq,
            self.in_seq_reliable,
            unreliable_seq,
            self.in_seq_unreliable
        );

        if self.in_seq_reliable != reliable_seq {
            return PacketOrder::Unsequenced;
        }

        if seq_delta(unreliable_seq, self.in_seq_unreliable) <= 0 {
            return PacketOrder::Unsequenced;
        }

        self.in_seq_unreliable = unreliable_seq;

        PacketOrder::Sequenced
    }

    /// Ingress of one decoded packet. Returns the events to dispatch
    ///  upward; `InvalidArgument` means the packet was malformed (broken
    ///  ack) or the peer is already dead.
    fn incoming_packet(
        &mut self,
        now: i64,
        header: &PacketHeader,
        payload: &[u8],
    ) -> Result<Vec<PeerEvent>, RudpError> {
        if self.state == PeerState::Dead {
            return Err(RudpError::InvalidArgument);
        }

        trace!(
            "<<< incoming [{:?}] {}reliable {} {:04x}:{:04x}",
            self.state,
            if header.opt.contains(Opt::RELIABLE) { "" } else { "un" },
            header.command,
            header.reliable_seq,
            header.unreliable_seq
        );

        let mut events = Vec::new();

        if header.opt.contains(Opt::ACK) {
            trace!("    has ACK flag, {:04x}", header.reliable_ack);
            if self.handle_ack(header.reliable_ack, &mut events) {
                warn!("    broken ACK flag, ignoring packet");
                return Err(RudpError::InvalidArgument);
            }
        }

        let order = if header.opt.contains(Opt::RELIABLE) {
            self.analyse_reliable(header.reliable_seq)
        } else {
            self.analyse_unreliable(header.reliable_seq, header.unreliable_seq)
        };

        match order {
            PacketOrder::Unsequenced => {
                if self.state == PeerState::New && header.command == Command::ConnReq {
                    // server side, handling a new client
                    self.answer_conn_req();
                    self.in_seq_reliable = header.reliable_seq;
                    self.state = PeerState::Run;
                } else if self.state == PeerState::Connecting
                    && header.command == Command::ConnRsp
                {
                    // client side, handling the server's answer
                    self.in_seq_reliable = header.reliable_seq;
                    let _ = self.handle_ack(header.reliable_ack, &mut events);
                    self.state = PeerState::Run;
                } else {
                    warn!("    unsequenced packet in state {:?}, ignored", self.state);
                }
            }

            PacketOrder::Retransmitted => {
                self.abs_timeout_deadline = now + self.timeout.drop;
            }

            PacketOrder::Sequenced => {
                self.abs_timeout_deadline = now + self.timeout.drop;

                match header.command {
                    Command::Close => {
                        self.state = PeerState::Dead;
                        info!("    peer closed the session");
                        events.push(PeerEvent::Dropped);
                        // The owner may tear the peer down while handling
                        //  Dropped; nothing further may happen here.
                        return Ok(events);
                    }

                    Command::Ping => {
                        if self.state == PeerState::Run {
                            debug!("    ping");
                            self.answer_ping(header, payload);
                        } else {
                            warn!("    ping while not running");
                        }
                    }

                    Command::Pong => {
                        if self.state == PeerState::Run {
                            debug!("    pong");
                            self.handle_pong(now, payload);
                        } else {
                            warn!("    pong while not running");
                        }
                    }

                    Command::Noop | Command::ConnReq | Command::ConnRsp => {}

                    Command::App(_) => {
                        if self.state != PeerState::Run {
                            warn!("    user payload while not running");
                        } else if let Some(packet) = reassembly::on_segment(
                            &mut self.reassembly,
                            header,
                            payload,
                            self.recv_buffer_size,
                        ) {
                            if let Command::App(command) = packet.command {
                                events.push(PeerEvent::Packet {
                                    command,
                                    payload: packet.payload,
                                });
                            }
                        }
                    }

                    Command::Reserved(_) => {
                        if self.state != PeerState::Run {
                            warn!("    user payload while not running");
                        }
                    }
                }
            }
        }

        if header.opt.contains(Opt::RELIABLE) {
            debug!("    reliable packet, posting ack");
            self.post_ack();
        }

        Ok(events)
    }

    /// Process an acknowledged sequence number: advance `out_seq_acked`
    ///  and unqueue every transmitted reliable segment it covers. Returns
    ///  true if the ack refers to a sequence we never sent.
    fn handle_ack(&mut self, ack: u16, events: &mut Vec<PeerEvent>) -> bool {
        let ack_delta = seq_delta(ack, self.out_seq_acked);
        let adv_delta = seq_delta(ack, self.out_seq_reliable);

        if ack_delta < 0 {
            // ack in the past
            return false;
        }

        if adv_delta > 0 {
            // acking a sequence number we have not sent - broken packet
            return true;
        }

        debug!("acked seqno is now {:04x}", ack);
        self.out_seq_acked = ack;

        loop {
            let Some(front) = self.send_queue.front() else {
                break;
            };

            // not transmitted yet:
            //  - unreliable segments, if they are still here
            //  - reliable segments not yet marked retransmitted
            if !front.is_reliable() || !front.was_transmitted() {
                break;
            }

            let seqno = front.header.reliable_seq;
            if seq_delta(seqno, ack) > 0 {
                break;
            }

            debug!("unqueueing acked segment {:04x}", seqno);
            self.send_queue.pop_front();
            events.push(PeerEvent::LinkInfo { acked_seq: seqno });
        }

        false
    }

    /// The ack field rides on whatever goes out next. If nothing is
    ///  queued, a NOOP is enqueued as the carrier.
    fn post_ack(&mut self) {
        self.must_ack = true;

        if !self.send_queue.is_empty() {
            return;
        }

        debug!("pushing NOOP ack carrier");
        self.append_unreliable(Command::Noop, Bytes::new(), 0, 1);
    }

    fn answer_conn_req(&mut self) {
        info!("answering connection request");

        let mut accepted = bytes::BytesMut::with_capacity(4);
        accepted.put_u32(1);
        self.append_unreliable(Command::ConnRsp, accepted.freeze(), 0, 1);
    }

    fn answer_ping(&mut self, header: &PacketHeader, payload: &[u8]) {
        // RTT statistics must not be taken from retransmitted pings, so
        //  those get no answer. The generic ack still happens.
        if header.opt.contains(Opt::RETRANSMITTED) {
            return;
        }

        debug!("answering ping");
        self.append_unreliable(Command::Pong, Bytes::copy_from_slice(payload), 0, 1);
    }

    fn handle_pong(&mut self, now: i64, payload: &[u8]) {
        if payload.len() < 8 {
            warn!("short pong payload ({} bytes), ignored", payload.len());
            return;
        }

        let origin = i64::from_be_bytes(payload[..8].try_into().unwrap());
        self.rtt.on_sample(now - origin);
    }

    fn push_ping(&mut self, now: i64) {
        debug!("pushing keepalive PING");

        let mut payload = bytes::BytesMut::with_capacity(8);
        payload.put_i64(now);
        self.append_reliable(Command::Ping, payload.freeze(), 0, 1);
    }

    fn append_reliable(&mut self, command: Command, payload: Bytes, index: u16, count: u16) {
        self.out_seq_unreliable = 0;
        self.out_seq_reliable = self.out_seq_reliable.wrapping_add(1);

        let header = PacketHeader {
            command,
            opt: Opt::RELIABLE,
            reliable_seq: self.out_seq_reliable,
            unreliable_seq: 0,
            reliable_ack: 0,
            segment_index: index,
            segments_size: count,
        };

        trace!(
            ">>> outgoing reliable {} {:04x}:{:04x}",
            command,
            header.reliable_seq,
            header.unreliable_seq
        );

        self.send_queue.push_back(Segment { header, payload });
    }

    fn append_unreliable(&mut self, command: Command, payload: Bytes, index: u16, count: u16) {
        self.out_seq_unreliable = self.out_seq_unreliable.wrapping_add(1);

        let header = PacketHeader {
            command,
            opt: Opt::empty(),
            reliable_seq: self.out_seq_reliable,
            unreliable_seq: self.out_seq_unreliable,
            reliable_ack: 0,
            segment_index: index,
            segments_size: count,
        };

        trace!(
            ">>> outgoing unreliable {} {:04x}:{:04x}",
            command,
            header.reliable_seq,
            header.unreliable_seq
        );

        self.send_queue.push_back(Segment { header, payload });
    }

    /// Segment and enqueue one application message. Returns the sticky
    ///  send error from previous flushes, if any.
    fn send(&mut self, reliable: bool, command: u8, data: &[u8]) -> Result<(), RudpError> {
        if self.state == PeerState::Dead {
            return Err(RudpError::InvalidArgument);
        }
        if data.is_empty() {
            return Err(RudpError::InvalidArgument);
        }
        if command as u16 + Command::APP_BASE as u16 > 255 {
            return Err(RudpError::InvalidArgument);
        }

        let max_chunk = self.recv_buffer_size - PacketHeader::SERIALIZED_LEN;
        let count = data.len().div_ceil(max_chunk);
        if count > u16::MAX as usize {
            return Err(RudpError::InvalidArgument);
        }

        for (index, chunk) in data.chunks(max_chunk).enumerate() {
            let payload = Bytes::copy_from_slice(chunk);
            if reliable {
                self.append_reliable(Command::App(command), payload, index as u16, count as u16);
            } else {
                self.append_unreliable(Command::App(command), payload, index as u16, count as u16);
            }
        }

        self.sticky_send_error()
    }

    /// Open the session: queue a CONN_REQ and wait for the answer.
    fn send_connect(&mut self) -> Result<(), RudpError> {
        if self.state == PeerState::Dead {
            return Err(RudpError::InvalidArgument);
        }

        self.state = PeerState::Connecting;
        self.append_reliable(Command::ConnReq, Bytes::from_static(&[0, 0, 0, 0]), 0, 1);

        self.sticky_send_error()
    }

    /// Send a CLOSE past the queue, straight to the socket. Used on
    ///  teardown, when nothing will ever flush the queue again.
    async fn send_close_noqueue(&mut self, now: i64) -> Result<(), RudpError> {
        if self.state == PeerState::Dead {
            return Err(RudpError::InvalidArgument);
        }

        self.out_seq_unreliable = self.out_seq_unreliable.wrapping_add(1);

        let mut header = PacketHeader::for_command(Command::Close);
        header.reliable_seq = self.out_seq_reliable;
        header.unreliable_seq = self.out_seq_unreliable;

        trace!(
            ">>> outgoing noqueue CLOSE {:04x}:{:04x}",
            header.reliable_seq,
            header.unreliable_seq
        );

        let mut buf = self.buffer_pool.get_from_pool();
        header.ser(&mut buf);
        self.send_raw(now, &buf).await;
        self.buffer_pool.return_to_pool(buf);

        self.sticky_send_error()
    }

    fn sticky_send_error(&self) -> Result<(), RudpError> {
        match self.last_send_error {
            None => Ok(()),
            Some(kind) => Err(RudpError::Socket(io::Error::from(kind))),
        }
    }

    async fn send_raw(&mut self, now: i64, bytes: &[u8]) {
        match self.socket.send_packet(self.peer_addr, bytes).await {
            Ok(_) => {
                self.last_send_error = None;
                self.last_out_time = now;
            }
            Err(e) => {
                warn!("sendto {:?} failed: {}", self.peer_addr, e);
                let kind = e.kind();
                self.last_send_error = Some(kind);
                if kind != io::ErrorKind::InvalidInput {
                    self.last_out_time = now;
                }
            }
        }
    }

    /// Flush the send queue head-first. Retransmitting the head backs the
    ///  RTO off and ends the pass - one retransmission per tick.
    async fn flush_send_queue(&mut self, now: i64) {
        let mut index = 0;
        while index < self.send_queue.len() {
            let carried_ack = self.must_ack;
            let in_seq_reliable = self.in_seq_reliable;

            let (wire, reliable, retransmitted) = {
                let segment = self.send_queue.get_mut(index).expect("index is in bounds");

                if carried_ack {
                    segment.header.opt |= Opt::ACK;
                    segment.header.reliable_ack = in_seq_reliable;
                } else {
                    segment.header.reliable_ack = 0;
                }

                trace!(
                    ">>>>>> {}send {}reliable {} {:04x}:{:04x} {} {:04x}",
                    if segment.was_transmitted() { "RE" } else { "" },
                    if segment.is_reliable() { "" } else { "un" },
                    segment.header.command,
                    segment.header.reliable_seq,
                    segment.header.unreliable_seq,
                    if carried_ack { "ack" } else { "noack" },
                    segment.header.reliable_ack
                );

                let mut buf = self.buffer_pool.get_from_pool();
                segment.header.ser(&mut buf);
                buf.put_slice(&segment.payload);
                (buf, segment.is_reliable(), segment.was_transmitted())
            };

            self.send_raw(now, &wire).await;
            self.buffer_pool.return_to_pool(wire);

            if carried_ack {
                self.must_ack = false;
            }

            if reliable && retransmitted {
                self.rtt.backoff();
                break;
            }

            if reliable {
                self.send_queue
                    .get_mut(index)
                    .expect("index is in bounds")
                    .header
                    .opt |= Opt::RETRANSMITTED;
                index += 1;
            } else {
                self.send_queue.remove(index);
            }
        }
    }

    /// The service tick: drop on deadline, keep the link alive when idle,
    ///  flush whatever is queued.
    async fn service(&mut self, now: i64) -> Vec<PeerEvent> {
        let mut events = Vec::new();

        if self.state == PeerState::Dead {
            return events;
        }

        if self.abs_timeout_deadline < now {
            self.state = PeerState::Dead;
            info!("drop deadline exceeded, peer {:?} is gone", self.peer_addr);
            events.push(PeerEvent::Dropped);
            return events;
        }

        if self.send_queue.is_empty() && now - self.last_out_time > self.timeout.action {
            self.push_ping(now);
        }

        self.flush_send_queue(now).await;

        events
    }

    /// When the next service tick is due, in milliseconds from `now`:
    ///  immediately for a fresh head, one RTO after the last transmission
    ///  for a retransmit-pending head, the keepalive interval otherwise,
    ///  and never later than the drop deadline.
    fn next_service_delay(&self, now: i64) -> i64 {
        let mut delta = self.timeout.action;

        if let Some(head) = self.send_queue.front() {
            if head.was_transmitted() {
                // already transmitted head, wait for the RTO
                delta = self.last_out_time + self.rtt.rto() - now;
            } else {
                // transmit asap
                delta = 0;
            }
        }

        delta = max(min(delta, self.abs_timeout_deadline - now), 0);

        debug!("service scheduled in {} ms", delta);
        delta
    }
}

/// One remote peer on an endpoint: protocol state behind a lock, plus the
///  single-shot service timer task that does all the actual sending.
///
/// Owned by a `Server` (one per remote address) or a `Client` (exactly
///  one). Dropping the `Peer` aborts its timer task.
pub struct Peer {
    peer_addr: SocketAddr,
    inner: Arc<RwLock<PeerInner>>,
    service_notify: Arc<Notify>,
    service_task: JoinHandle<()>,
    clock: MonotonicClock,
}

impl Peer {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn spawn(
        peer_addr: SocketAddr,
        socket: Arc<dyn SendSocket>,
        handler: Arc<dyn PeerHandler>,
        timeout: PeerTimeouts,
        recv_buffer_size: usize,
        buffer_pool: Arc<BufferPool>,
        clock: MonotonicClock,
    ) -> Arc<Peer> {
        let inner = Arc::new(RwLock::new(PeerInner::new(
            peer_addr,
            socket,
            timeout,
            recv_buffer_size,
            buffer_pool,
            clock.now(),
        )));
        let service_notify = Arc::new(Notify::new());

        let service_task = tokio::spawn(service_loop(
            peer_addr,
            inner.clone(),
            service_notify.clone(),
            handler,
            clock.clone(),
        ));

        Arc::new(Peer {
            peer_addr,
            inner,
            service_notify,
            service_task,
            clock,
        })
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub(crate) async fn state(&self) -> PeerState {
        self.inner.read().await.state
    }

    /// Segment and queue one application message; the service timer
    ///  flushes it. Returns the sticky error of a previous flush, if any.
    pub async fn send(&self, reliable: bool, command: u8, data: &[u8]) -> Result<(), RudpError> {
        let result = self.inner.write().await.send(reliable, command, data);
        self.service_notify.notify_one();
        result
    }

    pub(crate) async fn send_connect(&self) -> Result<(), RudpError> {
        let result = self.inner.write().await.send_connect();
        self.service_notify.notify_one();
        result
    }

    pub(crate) async fn send_close_noqueue(&self) -> Result<(), RudpError> {
        let now = self.clock.now();
        self.inner.write().await.send_close_noqueue(now).await
    }

    /// Ingress of one decoded packet; returns the events for the owner to
    ///  dispatch after this call.
    pub(crate) async fn incoming_packet(
        &self,
        header: &PacketHeader,
        payload: &[u8],
    ) -> Result<Vec<PeerEvent>, RudpError> {
        let now = self.clock.now();
        let result = self.inner.write().await.incoming_packet(now, header, payload);
        self.service_notify.notify_one();
        result
    }

    /// Replace this peer's timeouts; RTO bounds apply immediately.
    pub async fn set_timeouts(&self, timeout: PeerTimeouts) {
        {
            let mut inner = self.inner.write().await;
            inner.timeout = timeout;
            inner.rtt.set_bounds(timeout.min_rto, timeout.max_rto);
        }
        self.service_notify.notify_one();
    }

    /// Return the peer to a pristine NEW state.
    pub async fn reset(&self) {
        let now = self.clock.now();
        self.inner.write().await.reset(now);
        self.service_notify.notify_one();
    }
}

impl Drop for Peer {
    fn drop(&mut self) {
        self.service_task.abort();
    }
}

async fn service_loop(
    peer_addr: SocketAddr,
    inner: Arc<RwLock<PeerInner>>,
    notify: Arc<Notify>,
    handler: Arc<dyn PeerHandler>,
    clock: MonotonicClock,
) {
    loop {
        let delay = inner.read().await.next_service_delay(clock.now());

        tokio::select! {
            _ = notify.notified() => continue,
            _ = time::sleep(Duration::from_millis(delay as u64)) => {}
        }

        let (events, dead) = {
            let mut guard = inner.write().await;
            let events = guard.service(clock.now()).await;
            (events, guard.state == PeerState::Dead)
        };

        dispatch_events(peer_addr, events, handler.as_ref()).await;

        if dead {
            // The Dropped dispatch above usually makes the owner release
            //  this peer, aborting us; if not, end the task anyway.
            return;
        }
    }
}
