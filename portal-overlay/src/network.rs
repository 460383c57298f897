//! Per-network overlay message handling: liveness, neighbor discovery,
//! content serving, and the OFFER/ACCEPT exchange, each expressed as a pure
//! transition returning the response plus any uTP work it scheduled.

use crate::table::{AddOutcome, RoutingTable};
use portal_utp::mux::{RequestDirection, UtpMultiplexer};
use portal_wire::constants::{
    BUCKET_SIZE, MAX_ENR_SIZE, MAX_INLINE_CONTENT, MAX_KEYS_PER_OFFER, MAX_TALK_PAYLOAD,
};
use portal_wire::enr::Enr;
use portal_wire::messages::{
    self, Accept, Content, FindContent, FindNodes, Message, Nodes, Offer, Ping, Pong,
};
use portal_wire::types::{Distance, NodeId};
use portal_wire::{ProtocolId, RawContentKey};
use std::time::Instant;
use tracing::{debug, warn};

/// Fan-out of neighborhood gossip: nearest interested peers per fresh key.
pub const GOSSIP_FANOUT: usize = 5;

/// What the overlay needs from the content layer to answer requests.
pub trait ContentBackend {
    /// Stored bytes for a key, if any.
    fn get(&self, key: &RawContentKey) -> Option<Vec<u8>>;

    /// Whether this node wants the key offered to it: unknown locally,
    /// within the storage radius, and of a type the validator understands.
    fn wants(&self, key: &RawContentKey) -> bool;

    /// The current storage radius, advertised in PING/PONG.
    fn radius(&self) -> Distance;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OverlayEvent {
    NodeAdded(NodeId),
    /// A full bucket produced a replacement candidate; the head of the
    /// bucket should be liveness-probed.
    ProbeRequested(Box<Enr>),
}

/// Everything a handler produced: the direct response (sent as TALKRESP),
/// datagrams the scheduled uTP work emitted (sent as uTP TALKREQs), and
/// events for the embedding node.
#[derive(Debug, Default)]
pub struct HandleOutcome {
    pub response: Option<Message>,
    pub datagrams: Vec<(NodeId, Vec<u8>)>,
    pub events: Vec<OverlayEvent>,
}

impl HandleOutcome {
    fn respond(response: Message) -> Self {
        Self {
            response: Some(response),
            ..Self::default()
        }
    }
}

/// One overlay network instance (history, state, or beacon); each owns its
/// routing table and shares the process-wide uTP multiplexer.
pub struct OverlayNetwork {
    protocol: ProtocolId,
    local_enr: Enr,
    pub table: RoutingTable,
}

impl OverlayNetwork {
    pub fn new(protocol: ProtocolId, local_enr: Enr) -> Self {
        let table = RoutingTable::new(local_enr.node_id());
        Self {
            protocol,
            local_enr,
            table,
        }
    }

    pub fn protocol(&self) -> ProtocolId {
        self.protocol
    }

    pub fn local_enr(&self) -> &Enr {
        &self.local_enr
    }

    /// Refreshes the local record (e.g. after learning our external
    /// address).
    pub fn set_local_enr(&mut self, enr: Enr) {
        self.local_enr = enr;
    }

    /// Adds a session-verified record to the routing table.
    pub fn register_enr(&mut self, enr: Enr, now: Instant) -> Vec<OverlayEvent> {
        match self.table.add(enr.clone(), now) {
            AddOutcome::Added => vec![OverlayEvent::NodeAdded(enr.node_id())],
            AddOutcome::Pending { probe } => vec![OverlayEvent::ProbeRequested(probe)],
            _ => Vec::new(),
        }
    }

    /// Dispatches an incoming overlay request.
    pub fn handle_talkreq<B: ContentBackend>(
        &mut self,
        src: NodeId,
        msg: Message,
        mux: &mut UtpMultiplexer,
        store: &B,
        now: Instant,
    ) -> HandleOutcome {
        match msg {
            Message::Ping(ping) => self.handle_ping(src, ping, store, now),
            Message::FindNodes(find) => self.handle_find_nodes(src, find),
            Message::FindContent(find) => self.handle_find_content(src, find, mux, store),
            Message::Offer(offer) => self.handle_offer(src, offer, mux, store),
            other => {
                // Response-type messages never arrive as requests.
                warn!(?src, selector = other.selector(), "response message sent as request");
                HandleOutcome::default()
            }
        }
    }

    /// Dispatches the response to a request we issued. `request` is the
    /// original message, needed to interpret ACCEPT bitmaps.
    pub fn handle_response<B: ContentBackend>(
        &mut self,
        src: NodeId,
        request: &Message,
        response: Message,
        mux: &mut UtpMultiplexer,
        store: &B,
        now: Instant,
    ) -> HandleOutcome {
        match response {
            Message::Pong(pong) => {
                self.handle_pong(src, pong, now);
                HandleOutcome::default()
            }
            Message::Nodes(nodes) => self.handle_nodes(src, nodes, now),
            Message::Accept(accept) => self.handle_accept(src, request, accept, mux, store),
            // CONTENT responses belong to whichever lookup issued the
            // FINDCONTENT; the node layer routes them there.
            other => {
                debug!(?src, selector = other.selector(), "unrouted response");
                HandleOutcome::default()
            }
        }
    }

    fn handle_ping<B: ContentBackend>(
        &mut self,
        src: NodeId,
        ping: Ping,
        store: &B,
        now: Instant,
    ) -> HandleOutcome {
        self.table.mark_alive(&src, now);
        if let Some(radius) = messages::parse_radius(&ping.custom_payload) {
            self.table.set_radius(&src, radius);
        }
        HandleOutcome::respond(Message::Pong(Pong {
            enr_seq: self.local_enr.seq,
            custom_payload: messages::radius_payload(store.radius()),
        }))
    }

    fn handle_pong(&mut self, src: NodeId, pong: Pong, now: Instant) {
        self.table.mark_alive(&src, now);
        if let Some(radius) = messages::parse_radius(&pong.custom_payload) {
            self.table.set_radius(&src, radius);
        }
        let _ = pong.enr_seq;
    }

    fn handle_find_nodes(&mut self, src: NodeId, find: FindNodes) -> HandleOutcome {
        let mut distances = find.distances;
        distances.sort_unstable();
        distances.dedup();

        let mut enrs = Vec::new();
        let mut budget = MAX_TALK_PAYLOAD.saturating_sub(16);
        for distance in distances {
            let bucket = if distance == 0 {
                vec![self.local_enr.clone()]
            } else {
                self.table.peers_at_wire_distance(distance)
            };
            for enr in bucket {
                if enr.node_id() == src {
                    continue;
                }
                let encoded_len = enr.encode().len() + 4;
                if encoded_len > budget {
                    break;
                }
                budget -= encoded_len;
                enrs.push(enr);
            }
        }
        HandleOutcome::respond(Message::Nodes(Nodes { total: 1, enrs }))
    }

    fn handle_find_content<B: ContentBackend>(
        &mut self,
        src: NodeId,
        find: FindContent,
        mux: &mut UtpMultiplexer,
        store: &B,
    ) -> HandleOutcome {
        let key = find.content_key;
        if let Some(content) = store.get(&key) {
            if content.len() <= MAX_INLINE_CONTENT {
                return HandleOutcome::respond(Message::Content(Content::Payload(content)));
            }
            let conn_id = mux.register_inbound(
                RequestDirection::FoundContentWrite,
                self.protocol,
                src,
                vec![key],
                vec![content],
            );
            return HandleOutcome::respond(Message::Content(Content::ConnectionId(conn_id)));
        }

        let content_id = key.content_id();
        let enrs = self.nearest_within_budget(content_id.as_bytes(), Some(src));
        HandleOutcome::respond(Message::Content(Content::Enrs(enrs)))
    }

    fn handle_offer<B: ContentBackend>(
        &mut self,
        src: NodeId,
        offer: Offer,
        mux: &mut UtpMultiplexer,
        store: &B,
    ) -> HandleOutcome {
        if offer.content_keys.is_empty() || offer.content_keys.len() > MAX_KEYS_PER_OFFER {
            return HandleOutcome::default();
        }
        let wanted: Vec<bool> = offer
            .content_keys
            .iter()
            .map(|key| store.wants(key))
            .collect();
        let accepted_keys: Vec<RawContentKey> = offer
            .content_keys
            .into_iter()
            .zip(&wanted)
            .filter(|(_, w)| **w)
            .map(|(k, _)| k)
            .collect();

        let connection_id = if accepted_keys.is_empty() {
            0
        } else {
            mux.register_inbound(
                RequestDirection::AcceptRead,
                self.protocol,
                src,
                accepted_keys,
                Vec::new(),
            )
        };
        HandleOutcome::respond(Message::Accept(Accept {
            connection_id,
            content_keys: wanted,
        }))
    }

    fn handle_accept<B: ContentBackend>(
        &mut self,
        src: NodeId,
        request: &Message,
        accept: Accept,
        mux: &mut UtpMultiplexer,
        store: &B,
    ) -> HandleOutcome {
        let Message::Offer(offer) = request else {
            warn!(?src, "accept without a matching offer");
            return HandleOutcome::default();
        };
        let mut keys = Vec::new();
        let mut payloads = Vec::new();
        for (i, key) in offer.content_keys.iter().enumerate() {
            if !accept.content_keys.get(i).copied().unwrap_or(false) {
                continue;
            }
            match store.get(key) {
                Some(bytes) => {
                    keys.push(key.clone());
                    payloads.push(bytes);
                }
                // Evicted between OFFER and ACCEPT; the transfer simply
                // carries the remaining items.
                None => debug!(?src, "accepted key no longer stored"),
            }
        }
        if keys.is_empty() {
            return HandleOutcome::default();
        }
        let datagrams = mux.initiate_outbound(
            RequestDirection::OfferWrite,
            self.protocol,
            src,
            accept.connection_id,
            keys,
            payloads,
        );
        HandleOutcome {
            response: None,
            datagrams,
            events: Vec::new(),
        }
    }

    fn handle_nodes(&mut self, src: NodeId, nodes: Nodes, now: Instant) -> HandleOutcome {
        self.table.mark_alive(&src, now);
        let mut events = Vec::new();
        for enr in nodes.enrs {
            if enr.verify().is_err() {
                warn!(?src, "discarding NODES entry with a bad signature");
                continue;
            }
            events.extend(self.register_enr(enr, now));
        }
        HandleOutcome {
            response: None,
            datagrams: Vec::new(),
            events,
        }
    }

    /// Nearest records to a target that fit the talk payload budget,
    /// farthest dropped first.
    fn nearest_within_budget(&self, target: &[u8; 32], exclude: Option<NodeId>) -> Vec<Enr> {
        let mut enrs = self.table.nearest(target, BUCKET_SIZE);
        if let Some(exclude) = exclude {
            enrs.retain(|e| e.node_id() != exclude);
        }
        let mut budget = MAX_TALK_PAYLOAD.saturating_sub(16);
        let mut out = Vec::new();
        for enr in enrs {
            let encoded_len = enr.encode().len().min(MAX_ENR_SIZE) + 4;
            if encoded_len > budget {
                break;
            }
            budget -= encoded_len;
            out.push(enr);
        }
        out
    }

    /// Builds a PING for a peer.
    pub fn make_ping<B: ContentBackend>(&self, store: &B) -> Message {
        Message::Ping(Ping {
            enr_seq: self.local_enr.seq,
            custom_payload: messages::radius_payload(store.radius()),
        })
    }

    /// Selects gossip targets for a freshly stored key: the nearest peers
    /// whose advertised radius covers the content id and which have not
    /// been offered it yet. Returns the OFFER to send to each.
    pub fn gossip_offers(&mut self, key: &RawContentKey) -> Vec<(Enr, Message)> {
        let content_id = key.content_id();
        let candidates = self.table.nearest(content_id.as_bytes(), BUCKET_SIZE);
        let mut out = Vec::new();
        for enr in candidates {
            if out.len() >= GOSSIP_FANOUT {
                break;
            }
            let peer = enr.node_id();
            let distance = content_id.distance_to(&peer);
            let radius = self.table.radius_of(&peer).unwrap_or(Distance::ZERO);
            if distance > radius {
                continue;
            }
            if self.table.content_known_to_peer(&peer, content_id.as_bytes()) {
                continue;
            }
            self.table.record_offered(&peer, *content_id.as_bytes());
            out.push((
                enr,
                Message::Offer(Offer {
                    content_keys: vec![key.clone()],
                }),
            ));
        }
        out
    }
}
