//! The uTP multiplexer: one table of open content transfers keyed by
//! `(peer node id, connection id)`, dispatching raw TALKREQ payloads to the
//! owning socket and policing stalled transfers with a watchdog.
//!
//! Connection id discipline mirrors libutp: the flow is identified by the
//! advertised id `C`; the initiator receives on `C` and sends on `C + 1`,
//! the other side the reverse. A SYN always carries `C`.

use crate::error::UtpError;
use crate::framing::encode_frames;
use crate::packet::{Packet, PacketType};
use crate::socket::{SocketEvent, UtpSocket};
use crate::time::TimeProvider;
use portal_wire::{ProtocolId, RawContentKey};
use portal_wire::types::NodeId;
use rand::RngCore;
use rand::rngs::StdRng;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Default stall watchdog: a transfer whose socket makes no transition for
/// this long is torn down and reported as failed.
pub const DEFAULT_WATCHDOG: Duration = Duration::from_secs(180);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestDirection {
    /// We serve content for a FINDCONTENT we answered with a connection id.
    FoundContentWrite,
    /// We fetch content after receiving CONTENT(connection id).
    FindContentRead,
    /// We push offered content after the peer's ACCEPT.
    OfferWrite,
    /// We receive content we accepted from an OFFER.
    AcceptRead,
}

impl RequestDirection {
    pub fn is_read(self) -> bool {
        matches!(
            self,
            RequestDirection::FindContentRead | RequestDirection::AcceptRead
        )
    }

    /// OFFER/ACCEPT transfers carry several items and use varint framing;
    /// FINDCONTENT transfers are a single unframed blob.
    fn framed(self) -> bool {
        matches!(
            self,
            RequestDirection::OfferWrite | RequestDirection::AcceptRead
        )
    }
}

/// One open transfer in the multiplexer table.
#[derive(Debug)]
pub struct ContentRequest {
    pub direction: RequestDirection,
    pub network: ProtocolId,
    pub peer: NodeId,
    pub conn_id: u16,
    pub content_keys: Vec<RawContentKey>,
    /// WRITE transfers: the ordered item payloads still to be sent.
    payloads: Vec<Vec<u8>>,
    socket: Option<UtpSocket>,
    /// READ transfers: completed items, in stream order.
    received: Vec<Vec<u8>>,
    created_at: Instant,
}

impl ContentRequest {
    fn last_activity(&self) -> Instant {
        self.socket
            .as_ref()
            .map(|s| s.last_activity())
            .unwrap_or(self.created_at)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UtpMuxEvent {
    /// A READ transfer finished cleanly; `items` aligns with `content_keys`
    /// for ACCEPT batches and holds one element for FINDCONTENT reads.
    TransferComplete {
        network: ProtocolId,
        peer: NodeId,
        conn_id: u16,
        direction: RequestDirection,
        content_keys: Vec<RawContentKey>,
        items: Vec<Vec<u8>>,
    },
    /// A WRITE transfer was fully acknowledged by the peer.
    SendComplete {
        network: ProtocolId,
        peer: NodeId,
        conn_id: u16,
        direction: RequestDirection,
    },
    TransferFailed {
        network: ProtocolId,
        peer: NodeId,
        conn_id: u16,
        direction: RequestDirection,
        content_keys: Vec<RawContentKey>,
        error: UtpError,
    },
}

pub struct UtpMultiplexer {
    requests: HashMap<(NodeId, u16), ContentRequest>,
    events: VecDeque<UtpMuxEvent>,
    time: Arc<dyn TimeProvider>,
    watchdog: Duration,
    rng: StdRng,
}

impl UtpMultiplexer {
    pub fn new(time: Arc<dyn TimeProvider>, rng: StdRng) -> Self {
        Self::with_watchdog(time, rng, DEFAULT_WATCHDOG)
    }

    pub fn with_watchdog(time: Arc<dyn TimeProvider>, rng: StdRng, watchdog: Duration) -> Self {
        Self {
            requests: HashMap::new(),
            events: VecDeque::new(),
            time,
            watchdog,
            rng,
        }
    }

    pub fn open_request_count(&self) -> usize {
        self.requests.len()
    }

    pub fn poll_event(&mut self) -> Option<UtpMuxEvent> {
        self.events.pop_front()
    }

    fn alloc_conn_id(&mut self, peer: &NodeId) -> u16 {
        loop {
            let id = (self.rng.next_u32() & 0xffff) as u16;
            if !self.requests.contains_key(&(*peer, id))
                && !self.requests.contains_key(&(*peer, id.wrapping_add(1)))
            {
                return id;
            }
        }
    }

    /// Registers a transfer that will start when the peer's SYN arrives:
    /// FOUNDCONTENT (we write) or ACCEPT (we read). Returns the connection
    /// id to advertise in the CONTENT/ACCEPT response.
    pub fn register_inbound(
        &mut self,
        direction: RequestDirection,
        network: ProtocolId,
        peer: NodeId,
        content_keys: Vec<RawContentKey>,
        payloads: Vec<Vec<u8>>,
    ) -> u16 {
        debug_assert!(matches!(
            direction,
            RequestDirection::FoundContentWrite | RequestDirection::AcceptRead
        ));
        let conn_id = self.alloc_conn_id(&peer);
        let now = self.time.now_instant();
        self.requests.insert(
            (peer, conn_id),
            ContentRequest {
                direction,
                network,
                peer,
                conn_id,
                content_keys,
                payloads,
                socket: None,
                received: Vec::new(),
                created_at: now,
            },
        );
        debug!(?peer, conn_id, ?direction, "registered inbound utp request");
        conn_id
    }

    /// Starts a transfer for which the peer advertised the connection id:
    /// FINDCONTENT (we read) or OFFER (we write). Returns the datagrams to
    /// send (the SYN).
    pub fn initiate_outbound(
        &mut self,
        direction: RequestDirection,
        network: ProtocolId,
        peer: NodeId,
        conn_id: u16,
        content_keys: Vec<RawContentKey>,
        payloads: Vec<Vec<u8>>,
    ) -> Vec<(NodeId, Vec<u8>)> {
        debug_assert!(matches!(
            direction,
            RequestDirection::FindContentRead | RequestDirection::OfferWrite
        ));
        if self.requests.contains_key(&(peer, conn_id)) {
            warn!(?peer, conn_id, "connection id already open, dropping transfer");
            self.events.push_back(UtpMuxEvent::TransferFailed {
                network,
                peer,
                conn_id,
                direction,
                content_keys,
                error: UtpError::ConnectionIdCollision,
            });
            return Vec::new();
        }
        let now = self.time.now_instant();
        let micros = self.time.now_micros();
        let (socket, syn) = match direction {
            RequestDirection::FindContentRead => {
                UtpSocket::initiate_read(conn_id, direction.framed(), now, micros)
            }
            _ => {
                let stream = encode_frames(&payloads);
                UtpSocket::initiate_write(conn_id, stream, now, micros)
            }
        };
        self.requests.insert(
            (peer, conn_id),
            ContentRequest {
                direction,
                network,
                peer,
                conn_id,
                content_keys,
                payloads: Vec::new(),
                socket: Some(socket),
                received: Vec::new(),
                created_at: now,
            },
        );
        debug!(?peer, conn_id, ?direction, "initiated outbound utp request");
        vec![(peer, syn.encode())]
    }

    /// Entry point for every raw uTP TALKREQ payload. Packets for unknown
    /// flows are dropped silently unless they are a SYN matching a
    /// pre-registered expectation.
    pub fn handle_packet(&mut self, src: NodeId, raw: &[u8]) -> Vec<(NodeId, Vec<u8>)> {
        let pkt = match Packet::decode(raw) {
            Ok(pkt) => pkt,
            Err(err) => {
                debug!(?src, %err, "dropping malformed utp packet");
                return Vec::new();
            }
        };
        let now = self.time.now_instant();
        let micros = self.time.now_micros();

        let key = match self.resolve_key(&src, &pkt) {
            Some(key) => key,
            None => {
                debug!(?src, conn = pkt.connection_id, ptype = ?pkt.ptype, "no open request for packet");
                return Vec::new();
            }
        };

        let mut out = Vec::new();
        {
            let request = self.requests.get_mut(&key).expect("resolved key present");
            let replies = match (&mut request.socket, pkt.ptype) {
                (Some(socket), _) => socket.handle_packet(&pkt, now, micros),
                (slot @ None, PacketType::Syn) => {
                    // Bind the pre-registered expectation to a live socket.
                    let replies = match request.direction {
                        RequestDirection::AcceptRead => {
                            let framed = request.direction.framed();
                            let (socket, syn_ack) =
                                UtpSocket::accept_read(&pkt, framed, now, micros, &mut self.rng);
                            *slot = Some(socket);
                            vec![syn_ack]
                        }
                        RequestDirection::FoundContentWrite => {
                            let stream = match request.payloads.len() {
                                1 => request.payloads.pop().unwrap_or_default(),
                                _ => encode_frames(&request.payloads),
                            };
                            let (socket, packets) =
                                UtpSocket::accept_write(&pkt, stream, now, micros, &mut self.rng);
                            *slot = Some(socket);
                            packets
                        }
                        _ => Vec::new(),
                    };
                    replies
                }
                (None, _) => Vec::new(),
            };
            for reply in replies {
                out.push((src, reply.encode()));
            }
        }
        self.reap(key);
        out
    }

    /// Maps an incoming connection id to the flow key. Exact match first;
    /// the registered side of a flow also sees packets on `C + 1`.
    fn resolve_key(&self, src: &NodeId, pkt: &Packet) -> Option<(NodeId, u16)> {
        let exact = (*src, pkt.connection_id);
        if let Some(request) = self.requests.get(&exact) {
            let acceptable = match &request.socket {
                Some(socket) => socket.accepts_conn_id(pkt.connection_id),
                None => pkt.ptype == PacketType::Syn,
            };
            if acceptable {
                return Some(exact);
            }
        }
        let shifted = (*src, pkt.connection_id.wrapping_sub(1));
        if let Some(request) = self.requests.get(&shifted)
            && let Some(socket) = &request.socket
            && socket.accepts_conn_id(pkt.connection_id)
        {
            return Some(shifted);
        }
        None
    }

    /// Collects socket events for a flow and evicts it on any terminal
    /// transition. Removal on terminal states is unconditional; the table
    /// never leaks closed flows.
    fn reap(&mut self, key: (NodeId, u16)) {
        let Some(request) = self.requests.get_mut(&key) else {
            return;
        };
        let Some(socket) = &mut request.socket else {
            return;
        };
        let mut terminal: Option<Result<(), UtpError>> = None;
        while let Some(event) = socket.poll_event() {
            match event {
                SocketEvent::Connected => {}
                SocketEvent::Frame(item) => request.received.push(item),
                SocketEvent::Delivered(content) => request.received.push(content),
                SocketEvent::Closed => terminal = Some(Ok(())),
                SocketEvent::Reset(reason) => {
                    let error = match reason {
                        crate::socket::ResetReason::Timeout => UtpError::SocketTimeout,
                        crate::socket::ResetReason::PeerReset => UtpError::ConnectionReset,
                        crate::socket::ResetReason::BufferOverflow => UtpError::BufferOverflow,
                        crate::socket::ResetReason::ProtocolViolation => UtpError::UnexpectedState,
                    };
                    terminal = Some(Err(error));
                }
            }
        }
        if let Some(outcome) = terminal {
            let request = self.requests.remove(&key).expect("request present");
            self.finish(request, outcome);
        }
    }

    fn finish(&mut self, request: ContentRequest, outcome: Result<(), UtpError>) {
        let event = match outcome {
            Ok(()) if request.direction.is_read() => UtpMuxEvent::TransferComplete {
                network: request.network,
                peer: request.peer,
                conn_id: request.conn_id,
                direction: request.direction,
                content_keys: request.content_keys,
                items: request.received,
            },
            Ok(()) => UtpMuxEvent::SendComplete {
                network: request.network,
                peer: request.peer,
                conn_id: request.conn_id,
                direction: request.direction,
            },
            Err(error) => UtpMuxEvent::TransferFailed {
                network: request.network,
                peer: request.peer,
                conn_id: request.conn_id,
                direction: request.direction,
                content_keys: request.content_keys,
                error,
            },
        };
        self.events.push_back(event);
    }

    /// Timer entry point: socket retransmissions plus the stall watchdog.
    pub fn poll(&mut self) -> Vec<(NodeId, Vec<u8>)> {
        let now = self.time.now_instant();
        let micros = self.time.now_micros();
        let mut out = Vec::new();

        let keys: Vec<(NodeId, u16)> = self.requests.keys().copied().collect();
        for key in keys {
            let watchdog_expired = {
                let Some(request) = self.requests.get_mut(&key) else {
                    continue;
                };
                if now.saturating_duration_since(request.last_activity()) >= self.watchdog {
                    true
                } else {
                    let peer = request.peer;
                    if let Some(socket) = &mut request.socket {
                        for pkt in socket.on_tick(now, micros) {
                            out.push((peer, pkt.encode()));
                        }
                    }
                    false
                }
            };
            if watchdog_expired {
                warn!(peer = ?key.0, conn_id = key.1, "utp watchdog expired");
                let request = self.requests.remove(&key).expect("request present");
                self.finish(request, Err(UtpError::WatchdogExpired));
            } else {
                self.reap(key);
            }
        }
        out
    }

    /// Earliest instant at which `poll` has work: socket RTOs or watchdog
    /// expiries.
    pub fn next_wakeup(&self) -> Option<Instant> {
        let now = self.time.now_instant();
        let mut next: Option<Instant> = None;
        for request in self.requests.values() {
            let watchdog_at = request.last_activity() + self.watchdog;
            next = Some(next.map_or(watchdog_at, |n| n.min(watchdog_at)));
            if let Some(socket) = &request.socket
                && let Some(at) = socket.next_wakeup(now)
            {
                next = Some(next.map_or(at, |n| n.min(at)));
            }
        }
        next
    }
}
