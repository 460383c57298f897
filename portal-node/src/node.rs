//! The node orchestrator: routes TALKREQs by protocol id to the uTP
//! multiplexer or an overlay network, correlates TALKRESPs with pending
//! requests, drives content lookups, and turns store events into gossip.

use crate::error::{NodeError, NodeResult};
use crate::identity::PersistedIdentity;
use crate::transport::TalkTransport;
use portal_overlay::lookup::{ContentLookup, LookupAction, LookupOutcome, LookupStatus};
use portal_overlay::network::{ContentBackend, HandleOutcome, OverlayEvent, OverlayNetwork};
use portal_store::kv::KvStore;
use portal_store::store::{BeaconVerifier, ContentStore, StoreConfig, StoreEvent};
use portal_store::{HistoricalRoots, MasterAccumulator, StoreError};
use portal_utp::mux::{RequestDirection, UtpMultiplexer, UtpMuxEvent};
use portal_utp::time::TimeProvider;
use portal_wire::content_key::ContentId;
use portal_wire::enr::Enr;
use portal_wire::identity::NodeKeypair;
use portal_wire::messages::{Content, FindContent, FindNodes, Message};
use portal_wire::types::{Distance, NodeId};
use portal_wire::{ProtocolId, RawContentKey};
use rand::rngs::StdRng;
use rand::{RngCore, SeedableRng};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// How long a TALKREQ may stay unanswered before the request fails over.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Interval of the routing-table refresh probe.
pub const BUCKET_REFRESH_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct NodeConfig {
    pub protocols: Vec<ProtocolId>,
    pub capacity_bytes: u64,
    pub beacon_fork_digest: [u8; 4],
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            protocols: vec![ProtocolId::History],
            capacity_bytes: 1 << 30,
            beacon_fork_digest: [0u8; 4],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PortalEvent {
    ContentAdded {
        key: RawContentKey,
        bytes: Vec<u8>,
    },
    Dropped {
        content_id: ContentId,
    },
    NodeAdded {
        node: NodeId,
        network: ProtocolId,
    },
    LookupCompleted {
        id: u64,
        outcome: LookupOutcome,
    },
}

struct PendingRequest {
    protocol: ProtocolId,
    peer: NodeId,
    message: Message,
    lookup: Option<u64>,
    sent_at: Instant,
}

struct LookupState {
    protocol: ProtocolId,
    lookup: ContentLookup,
}

/// Adapts the content store to the overlay's backend interface.
struct StoreBackend<'a, K: KvStore>(&'a ContentStore<K>);

impl<K: KvStore> ContentBackend for StoreBackend<'_, K> {
    fn get(&self, key: &RawContentKey) -> Option<Vec<u8>> {
        self.0.get(key).ok().flatten()
    }

    fn wants(&self, key: &RawContentKey) -> bool {
        self.0.wants(key)
    }

    fn radius(&self) -> Distance {
        self.0.radius()
    }
}

pub struct PortalNode<T: TalkTransport, K: KvStore> {
    transport: T,
    keypair: NodeKeypair,
    enr: Enr,
    networks: HashMap<ProtocolId, OverlayNetwork>,
    mux: UtpMultiplexer,
    store: ContentStore<K>,
    time: Arc<dyn TimeProvider>,
    rng: StdRng,
    pending: HashMap<u64, PendingRequest>,
    lookups: HashMap<u64, LookupState>,
    /// (peer, conn id) of uTP transfers opened on behalf of a lookup.
    transfer_lookups: HashMap<(NodeId, u16), u64>,
    events: VecDeque<PortalEvent>,
    next_request_id: u64,
    next_lookup_id: u64,
    last_bucket_refresh: Instant,
}

impl<T: TalkTransport, K: KvStore> PortalNode<T, K> {
    pub fn new(
        transport: T,
        kv: K,
        master: MasterAccumulator,
        historical: HistoricalRoots,
        beacon: Option<Box<dyn BeaconVerifier>>,
        config: NodeConfig,
        time: Arc<dyn TimeProvider>,
        mut rng: StdRng,
    ) -> NodeResult<Self> {
        let identity = PersistedIdentity::load_or_create(&kv, &mut rng)?;
        let local_id = identity.keypair.node_id();
        let store_config = StoreConfig {
            local_id,
            capacity_bytes: config.capacity_bytes,
            beacon_fork_digest: config.beacon_fork_digest,
        };
        let store = ContentStore::new(kv, master, historical, beacon, store_config);

        let mut networks = HashMap::new();
        for protocol in &config.protocols {
            networks.insert(*protocol, OverlayNetwork::new(*protocol, identity.enr.clone()));
        }

        let mux = UtpMultiplexer::new(time.clone(), StdRng::seed_from_u64(rng.next_u64()));
        let now = time.now_instant();
        let mut node = Self {
            transport,
            keypair: identity.keypair,
            enr: identity.enr,
            networks,
            mux,
            store,
            time,
            rng,
            pending: HashMap::new(),
            lookups: HashMap::new(),
            transfer_lookups: HashMap::new(),
            events: VecDeque::new(),
            next_request_id: 1,
            next_lookup_id: 1,
            last_bucket_refresh: now,
        };
        for bootnode in identity.bootnodes {
            node.session_established(bootnode);
        }
        Ok(node)
    }

    pub fn node_id(&self) -> NodeId {
        self.keypair.node_id()
    }

    pub fn enr(&self) -> &Enr {
        &self.enr
    }

    pub fn store(&self) -> &ContentStore<K> {
        &self.store
    }

    pub fn network(&self, protocol: ProtocolId) -> Option<&OverlayNetwork> {
        self.networks.get(&protocol)
    }

    pub fn poll_event(&mut self) -> Option<PortalEvent> {
        self.events.pop_front()
    }

    /// A discv5 session came up with a verified record: seed it into every
    /// overlay table and greet it.
    pub fn session_established(&mut self, enr: Enr) {
        let now = self.time.now_instant();
        let mut pings = Vec::new();
        let mut events = Vec::new();
        for network in self.networks.values_mut() {
            let protocol = network.protocol();
            for event in network.register_enr(enr.clone(), now) {
                match event {
                    OverlayEvent::NodeAdded(node) => {
                        events.push(PortalEvent::NodeAdded {
                            node,
                            network: protocol,
                        });
                        pings.push((protocol, node));
                    }
                    OverlayEvent::ProbeRequested(probe) => {
                        pings.push((protocol, probe.node_id()));
                    }
                }
            }
        }
        self.events.extend(events);
        for (protocol, node) in pings {
            self.send_ping(protocol, node);
        }
    }

    fn send_ping(&mut self, protocol: ProtocolId, peer: NodeId) {
        let Some(network) = self.networks.get(&protocol) else {
            return;
        };
        let ping = network.make_ping(&StoreBackend(&self.store));
        self.send_overlay_request(protocol, peer, ping, None);
    }

    fn send_overlay_request(
        &mut self,
        protocol: ProtocolId,
        peer: NodeId,
        message: Message,
        lookup: Option<u64>,
    ) {
        let request_id = self.next_request_id;
        self.next_request_id += 1;
        let payload = message.encode();
        let now = self.time.now_instant();
        self.pending.insert(
            request_id,
            PendingRequest {
                protocol,
                peer,
                message,
                lookup,
                sent_at: now,
            },
        );
        if let Err(err) = self
            .transport
            .send_talkreq(peer, protocol, request_id, payload)
        {
            debug!(?peer, %err, "talkreq send failed");
            if let Some(pending) = self.pending.remove(&request_id) {
                self.on_request_failure(pending);
            }
        }
    }

    fn send_utp_datagrams(&mut self, datagrams: Vec<(NodeId, Vec<u8>)>) {
        for (peer, payload) in datagrams {
            let request_id = self.next_request_id;
            self.next_request_id += 1;
            // uTP TALKRESPs are empty acks; no pending entry is kept.
            if let Err(err) = self
                .transport
                .send_talkreq(peer, ProtocolId::Utp, request_id, payload)
            {
                debug!(?peer, %err, "utp datagram send failed");
            }
        }
    }

    /// Entry point for every inbound TALKREQ.
    pub fn handle_talkreq(
        &mut self,
        src: NodeId,
        protocol: &[u8],
        request_id: Vec<u8>,
        payload: &[u8],
    ) {
        let Some(protocol) = ProtocolId::from_bytes(protocol) else {
            warn!(?src, "talkreq for unknown protocol");
            return;
        };
        match protocol {
            ProtocolId::Utp => {
                // Ack the datagram, then let the mux drive the socket.
                let _ = self.transport.send_talkresp(src, request_id, Vec::new());
                let out = self.mux.handle_packet(src, payload);
                self.send_utp_datagrams(out);
                self.process_mux_events();
            }
            ProtocolId::Rendezvous => {
                debug!(?src, "rendezvous is not served");
            }
            overlay => {
                let message = match Message::decode(payload) {
                    Ok(message) => message,
                    Err(err) => {
                        debug!(?src, %err, "dropping malformed overlay request");
                        return;
                    }
                };
                let now = self.time.now_instant();
                let Some(network) = self.networks.get_mut(&overlay) else {
                    debug!(?src, "request for unserved network");
                    return;
                };
                let outcome = network.handle_talkreq(
                    src,
                    message,
                    &mut self.mux,
                    &StoreBackend(&self.store),
                    now,
                );
                if let Some(response) = &outcome.response {
                    let _ = self
                        .transport
                        .send_talkresp(src, request_id, response.encode());
                }
                self.absorb_outcome(overlay, outcome);
            }
        }
    }

    /// Entry point for every TALKRESP to a request we sent.
    pub fn handle_talkresp(&mut self, src: NodeId, request_id: u64, payload: &[u8]) {
        let Some(pending) = self.pending.remove(&request_id) else {
            debug!(?src, request_id, "talkresp without a pending request");
            return;
        };
        if pending.peer != src {
            warn!(?src, "talkresp from the wrong peer");
            return;
        }
        if payload.is_empty() {
            self.on_request_failure(pending);
            return;
        }
        let response = match Message::decode(payload) {
            Ok(message) => message,
            Err(err) => {
                debug!(?src, %err, "malformed response");
                self.on_request_failure(pending);
                return;
            }
        };
        let now = self.time.now_instant();

        if let (Message::Content(content), Some(lookup_id)) = (&response, pending.lookup) {
            self.route_lookup_content(lookup_id, pending.protocol, src, content.clone(), now);
            return;
        }

        let Some(network) = self.networks.get_mut(&pending.protocol) else {
            return;
        };
        let outcome = network.handle_response(
            src,
            &pending.message,
            response,
            &mut self.mux,
            &StoreBackend(&self.store),
            now,
        );
        self.absorb_outcome(pending.protocol, outcome);
    }

    fn absorb_outcome(&mut self, protocol: ProtocolId, outcome: HandleOutcome) {
        self.send_utp_datagrams(outcome.datagrams);
        let mut pings = Vec::new();
        for event in outcome.events {
            match event {
                OverlayEvent::NodeAdded(node) => {
                    self.events.push_back(PortalEvent::NodeAdded {
                        node,
                        network: protocol,
                    });
                }
                OverlayEvent::ProbeRequested(probe) => pings.push(probe.node_id()),
            }
        }
        for node in pings {
            self.send_ping(protocol, node);
        }
        self.process_mux_events();
    }

    /// Starts a recursive lookup; completion surfaces as
    /// `PortalEvent::LookupCompleted`.
    pub fn lookup_content(&mut self, protocol: ProtocolId, key: RawContentKey) -> u64 {
        let id = self.next_lookup_id;
        self.next_lookup_id += 1;
        let now = self.time.now_instant();
        let bootstrap = self
            .networks
            .get(&protocol)
            .map(|n| {
                n.table
                    .nearest(key.content_id().as_bytes(), portal_wire::constants::BUCKET_SIZE)
            })
            .unwrap_or_default();
        let lookup = ContentLookup::new(key, bootstrap, now);
        self.lookups.insert(id, LookupState { protocol, lookup });
        self.drive_lookup(id);
        id
    }

    fn drive_lookup(&mut self, id: u64) {
        let now = self.time.now_instant();
        let Some(state) = self.lookups.get_mut(&id) else {
            return;
        };
        let protocol = state.protocol;
        let key = state.lookup.key().clone();
        let queries = state.lookup.next_queries(now);
        let targets: Vec<NodeId> = queries.iter().map(|e| e.node_id()).collect();
        for peer in targets {
            self.send_overlay_request(
                protocol,
                peer,
                Message::FindContent(FindContent {
                    content_key: key.clone(),
                }),
                Some(id),
            );
        }
        self.finish_lookup_if_complete(id);
    }

    fn route_lookup_content(
        &mut self,
        lookup_id: u64,
        protocol: ProtocolId,
        src: NodeId,
        content: Content,
        now: Instant,
    ) {
        // Inline payloads are validated before the lookup may settle on
        // them; a bad proof fails the branch and the search continues.
        if let Content::Payload(bytes) = &content {
            let key = self.lookup_key(lookup_id);
            if let Err(err) = self.ingest(protocol, src, key, bytes) {
                warn!(?src, %err, "lookup payload failed validation");
                if let Some(state) = self.lookups.get_mut(&lookup_id) {
                    state.lookup.on_failure(src, now);
                }
                self.drive_lookup(lookup_id);
                return;
            }
        }
        let Some(state) = self.lookups.get_mut(&lookup_id) else {
            return;
        };
        let action = state.lookup.on_content_response(src, content, now);
        if let Some(LookupAction::OpenTransfer { peer, conn_id }) = action {
            let key = state.lookup.key().clone();
            let datagrams = self.mux.initiate_outbound(
                RequestDirection::FindContentRead,
                protocol,
                peer,
                conn_id,
                vec![key],
                Vec::new(),
            );
            self.transfer_lookups.insert((peer, conn_id), lookup_id);
            self.send_utp_datagrams(datagrams);
        }
        self.drive_lookup(lookup_id);
    }

    fn lookup_key(&self, lookup_id: u64) -> RawContentKey {
        self.lookups
            .get(&lookup_id)
            .map(|s| s.lookup.key().clone())
            .unwrap_or_else(|| RawContentKey(Vec::new()))
    }

    fn finish_lookup_if_complete(&mut self, id: u64) {
        let complete = self
            .lookups
            .get(&id)
            .is_some_and(|s| s.lookup.status() == LookupStatus::Complete);
        if !complete {
            return;
        }
        let Some(state) = self.lookups.remove(&id) else {
            return;
        };
        if let Some(outcome) = state.lookup.into_outcome() {
            self.events
                .push_back(PortalEvent::LookupCompleted { id, outcome });
        }
    }

    /// Validates and stores incoming content, then spreads the word. The
    /// unvalidatable-but-plausible cases (no header yet, no accumulator
    /// for the epoch) pass through without being stored.
    fn ingest(
        &mut self,
        protocol: ProtocolId,
        from: NodeId,
        key: RawContentKey,
        bytes: &[u8],
    ) -> NodeResult<()> {
        match self.store.put(&key, bytes) {
            Ok(_) => {
                self.drain_store_events(protocol);
                Ok(())
            }
            Err(
                err @ (StoreError::MissingHeader(_)
                | StoreError::UnknownEpoch(_)
                | StoreError::UnknownPeriod(_)),
            ) => {
                debug!(%err, "content accepted but not stored");
                Ok(())
            }
            Err(err) => {
                if let Some(network) = self.networks.get_mut(&protocol) {
                    network.table.score_down(&from);
                }
                Err(NodeError::Store(err))
            }
        }
    }

    fn drain_store_events(&mut self, protocol: ProtocolId) {
        let mut offers = Vec::new();
        while let Some(event) = self.store.poll_event() {
            match event {
                StoreEvent::ContentAdded { key, bytes, .. } => {
                    if let Some(network) = self.networks.get_mut(&protocol) {
                        offers.extend(
                            network
                                .gossip_offers(&key)
                                .into_iter()
                                .map(|(enr, msg)| (enr.node_id(), msg)),
                        );
                    }
                    self.events.push_back(PortalEvent::ContentAdded { key, bytes });
                }
                StoreEvent::Dropped { content_id } => {
                    self.events.push_back(PortalEvent::Dropped { content_id });
                }
                // The next PING/PONG reads the shrunken radius directly.
                StoreEvent::RadiusChanged(_) => {}
            }
        }
        for (peer, message) in offers {
            self.send_overlay_request(protocol, peer, message, None);
        }
    }

    fn process_mux_events(&mut self) {
        while let Some(event) = self.mux.poll_event() {
            match event {
                UtpMuxEvent::TransferComplete {
                    network,
                    peer,
                    conn_id,
                    direction,
                    content_keys,
                    items,
                } => match direction {
                    RequestDirection::FindContentRead => {
                        let Some(lookup_id) = self.transfer_lookups.remove(&(peer, conn_id))
                        else {
                            continue;
                        };
                        let now = self.time.now_instant();
                        let Some(bytes) = items.into_iter().next() else {
                            continue;
                        };
                        let key = self.lookup_key(lookup_id);
                        if self.ingest(network, peer, key, &bytes).is_ok() {
                            if let Some(state) = self.lookups.get_mut(&lookup_id) {
                                state.lookup.on_transfer_complete(peer, bytes);
                            }
                        } else if let Some(state) = self.lookups.get_mut(&lookup_id) {
                            state.lookup.on_failure(peer, now);
                        }
                        self.drive_lookup(lookup_id);
                    }
                    RequestDirection::AcceptRead => {
                        for (key, bytes) in content_keys.into_iter().zip(items) {
                            if let Err(err) = self.ingest(network, peer, key, &bytes) {
                                warn!(?peer, %err, "offered content failed validation");
                            }
                        }
                    }
                    _ => {}
                },
                UtpMuxEvent::SendComplete { peer, conn_id, .. } => {
                    debug!(?peer, conn_id, "utp send complete");
                }
                UtpMuxEvent::TransferFailed {
                    network,
                    peer,
                    conn_id,
                    error,
                    ..
                } => {
                    debug!(?peer, conn_id, %error, "utp transfer failed");
                    if let Some(network) = self.networks.get_mut(&network) {
                        network.table.score_down(&peer);
                    }
                    if let Some(lookup_id) = self.transfer_lookups.remove(&(peer, conn_id)) {
                        let now = self.time.now_instant();
                        if let Some(state) = self.lookups.get_mut(&lookup_id) {
                            state.lookup.on_failure(peer, now);
                        }
                        self.drive_lookup(lookup_id);
                    }
                }
            }
        }
    }

    fn on_request_failure(&mut self, pending: PendingRequest) {
        let now = self.time.now_instant();
        if let Some(network) = self.networks.get_mut(&pending.protocol) {
            network.table.score_down(&pending.peer);
        }
        if let Some(lookup_id) = pending.lookup {
            if let Some(state) = self.lookups.get_mut(&lookup_id) {
                state.lookup.on_failure(pending.peer, now);
            }
            self.drive_lookup(lookup_id);
        }
    }

    fn expire_pending(&mut self, now: Instant) {
        let expired: Vec<u64> = self
            .pending
            .iter()
            .filter(|(_, p)| now.saturating_duration_since(p.sent_at) >= REQUEST_TIMEOUT)
            .map(|(id, _)| *id)
            .collect();
        for id in expired {
            if let Some(pending) = self.pending.remove(&id) {
                debug!(peer = ?pending.peer, "request timed out");
                self.on_request_failure(pending);
            }
        }
    }

    fn refresh_buckets(&mut self, now: Instant) {
        if now.saturating_duration_since(self.last_bucket_refresh) < BUCKET_REFRESH_INTERVAL {
            return;
        }
        self.last_bucket_refresh = now;
        let mut probes = Vec::new();
        for network in self.networks.values_mut() {
            let protocol = network.protocol();
            let Some(target) = network.table.refresh_target(&mut self.rng) else {
                continue;
            };
            for enr in network.table.nearest(&target, portal_wire::constants::LOOKUP_PARALLELISM)
            {
                let peer = enr.node_id();
                let distance = peer
                    .distance_to(&target)
                    .log2()
                    .map(|l| l as u16 + 1)
                    .unwrap_or(0);
                probes.push((protocol, peer, distance));
            }
        }
        for (protocol, peer, distance) in probes {
            let mut distances = vec![distance];
            if distance > 1 {
                distances.push(distance - 1);
            }
            if distance < 256 {
                distances.push(distance + 1);
            }
            self.send_overlay_request(
                protocol,
                peer,
                Message::FindNodes(FindNodes { distances }),
                None,
            );
        }
    }

    /// Timer entry point. Returns the next instant it wants to run.
    pub fn poll(&mut self) -> Instant {
        let now = self.time.now_instant();

        let datagrams = self.mux.poll();
        self.send_utp_datagrams(datagrams);
        self.process_mux_events();

        self.expire_pending(now);
        self.refresh_buckets(now);

        let ids: Vec<u64> = self.lookups.keys().copied().collect();
        for id in ids {
            if let Some(state) = self.lookups.get_mut(&id) {
                state.lookup.on_tick(now);
            }
            self.drive_lookup(id);
        }

        let mut next = now + BUCKET_REFRESH_INTERVAL;
        if let Some(at) = self.mux.next_wakeup() {
            next = next.min(at);
        }
        for state in self.lookups.values() {
            if let Some(at) = state.lookup.next_wakeup() {
                next = next.min(at);
            }
        }
        for pending in self.pending.values() {
            next = next.min(pending.sent_at + REQUEST_TIMEOUT);
        }
        next.max(now)
    }

    /// Persists the current record plus the liveliest peers as the next
    /// start's bootnodes.
    pub fn persist_peers(&mut self) -> NodeResult<()> {
        let mut peers = Vec::new();
        for network in self.networks.values() {
            for entry in network.table.peers() {
                peers.push(entry.enr.clone());
            }
        }
        peers.sort_by_key(|e| e.node_id());
        peers.dedup_by_key(|e| e.node_id());
        PersistedIdentity::save_peers(self.store.kv(), &self.enr, &peers)?;
        Ok(())
    }

    /// Offers one stored key to a specific peer (used by tests and by
    /// embedders that push content deliberately).
    pub fn offer_content(&mut self, protocol: ProtocolId, peer: NodeId, key: RawContentKey) {
        let message = Message::Offer(portal_wire::messages::Offer {
            content_keys: vec![key],
        });
        self.send_overlay_request(protocol, peer, message, None);
    }

    /// Pings every table entry of a network; used to spread radius updates
    /// after eviction shrank ours.
    pub fn ping_peers(&mut self, protocol: ProtocolId) {
        let peers: Vec<NodeId> = self
            .networks
            .get(&protocol)
            .map(|n| n.table.peers().map(|p| p.enr.node_id()).collect())
            .unwrap_or_default();
        for peer in peers {
            self.send_ping(protocol, peer);
        }
    }

    /// Direct access for the embedding application to seed content.
    pub fn put_content(&mut self, protocol: ProtocolId, key: &RawContentKey, bytes: &[u8]) -> NodeResult<()> {
        self.store.put(key, bytes)?;
        self.drain_store_events(protocol);
        Ok(())
    }
}
