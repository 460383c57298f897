use portal_overlay::network::{ContentBackend, OverlayNetwork};
use portal_overlay::table::AddOutcome;
use portal_utp::mux::UtpMultiplexer;
use portal_utp::time::ManualTimeProvider;
use portal_wire::constants::MAX_INLINE_CONTENT;
use portal_wire::messages::{Content, FindContent, FindNodes, Message, Offer, Ping};
use portal_wire::types::Distance;
use portal_wire::{NodeKeypair, ProtocolId, RawContentKey, messages};
use rand::SeedableRng;
use rand::rngs::StdRng;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

struct FakeStore {
    content: HashMap<Vec<u8>, Vec<u8>>,
    radius: Distance,
}

impl FakeStore {
    fn new() -> Self {
        Self {
            content: HashMap::new(),
            radius: Distance::MAX,
        }
    }

    fn put(&mut self, key: &RawContentKey, bytes: Vec<u8>) {
        self.content.insert(key.0.clone(), bytes);
    }
}

impl ContentBackend for FakeStore {
    fn get(&self, key: &RawContentKey) -> Option<Vec<u8>> {
        self.content.get(&key.0).cloned()
    }

    fn wants(&self, key: &RawContentKey) -> bool {
        !self.content.contains_key(&key.0)
    }

    fn radius(&self) -> Distance {
        self.radius
    }
}

fn setup() -> (OverlayNetwork, UtpMultiplexer, FakeStore, Vec<portal_wire::Enr>) {
    let mut rng = StdRng::seed_from_u64(77);
    let local = NodeKeypair::generate(&mut rng);
    let network = OverlayNetwork::new(ProtocolId::History, local.make_enr(1, None));
    let mux = UtpMultiplexer::new(
        Arc::new(ManualTimeProvider::new(Instant::now(), 0)),
        StdRng::seed_from_u64(78),
    );
    let peers = (0..32)
        .map(|i| NodeKeypair::generate(&mut rng).make_enr(i, None))
        .collect();
    (network, mux, FakeStore::new(), peers)
}

#[test]
fn ping_gets_pong_with_radius_and_updates_peer_radius() {
    let (mut network, mut mux, store, peers) = setup();
    let now = Instant::now();
    let peer = peers[0].clone();
    network.register_enr(peer.clone(), now);

    let ping = Message::Ping(Ping {
        enr_seq: 4,
        custom_payload: messages::radius_payload(Distance::MAX.halved()),
    });
    let outcome = network.handle_talkreq(peer.node_id(), ping, &mut mux, &store, now);
    let Some(Message::Pong(pong)) = outcome.response else {
        panic!("expected PONG");
    };
    assert_eq!(messages::parse_radius(&pong.custom_payload), Some(Distance::MAX));
    assert_eq!(
        network.table.radius_of(&peer.node_id()),
        Some(Distance::MAX.halved())
    );
}

#[test]
fn small_content_is_served_inline() {
    let (mut network, mut mux, mut store, peers) = setup();
    let now = Instant::now();
    let key = RawContentKey(vec![0x00; 33]);
    let bytes = vec![0xabu8; 900];
    assert!(bytes.len() <= MAX_INLINE_CONTENT);
    store.put(&key, bytes.clone());

    let outcome = network.handle_talkreq(
        peers[0].node_id(),
        Message::FindContent(FindContent {
            content_key: key.clone(),
        }),
        &mut mux,
        &store,
        now,
    );
    assert_eq!(
        outcome.response,
        Some(Message::Content(Content::Payload(bytes)))
    );
    // No uTP request was registered for inline content.
    assert_eq!(mux.open_request_count(), 0);
}

#[test]
fn large_content_redirects_to_utp() {
    let (mut network, mut mux, mut store, peers) = setup();
    let now = Instant::now();
    let key = RawContentKey(vec![0x00; 33]);
    store.put(&key, vec![0xcd; 50_000]);

    let outcome = network.handle_talkreq(
        peers[0].node_id(),
        Message::FindContent(FindContent {
            content_key: key.clone(),
        }),
        &mut mux,
        &store,
        now,
    );
    assert!(matches!(
        outcome.response,
        Some(Message::Content(Content::ConnectionId(_)))
    ));
    assert_eq!(mux.open_request_count(), 1);
}

#[test]
fn unknown_content_returns_closer_nodes_excluding_sender() {
    let (mut network, mut mux, store, peers) = setup();
    let now = Instant::now();
    for enr in &peers {
        network.register_enr(enr.clone(), now);
    }
    let key = RawContentKey(vec![0x00; 33]);
    let asker = peers[0].node_id();
    let outcome = network.handle_talkreq(
        asker,
        Message::FindContent(FindContent {
            content_key: key.clone(),
        }),
        &mut mux,
        &store,
        now,
    );
    let Some(Message::Content(Content::Enrs(enrs))) = outcome.response else {
        panic!("expected ENR redirect");
    };
    assert!(!enrs.is_empty());
    assert!(enrs.iter().all(|e| e.node_id() != asker));
    // Ascending distance to the content id.
    let target = key.content_id();
    let distances: Vec<_> = enrs.iter().map(|e| target.distance_to(&e.node_id())).collect();
    let mut sorted = distances.clone();
    sorted.sort();
    assert_eq!(distances, sorted);
}

#[test]
fn findnodes_honors_distances_and_payload_budget() {
    let (mut network, mut mux, store, peers) = setup();
    let now = Instant::now();
    for enr in &peers {
        network.register_enr(enr.clone(), now);
    }
    let outcome = network.handle_talkreq(
        peers[0].node_id(),
        Message::FindNodes(FindNodes {
            distances: (0..=256).map(|d| d as u16).collect(),
        }),
        &mut mux,
        &store,
        now,
    );
    let Some(msg @ Message::Nodes(_)) = outcome.response else {
        panic!("expected NODES");
    };
    assert!(msg.encode().len() <= portal_wire::constants::MAX_TALK_PAYLOAD);
    let Message::Nodes(nodes) = msg else {
        unreachable!()
    };
    // Distance 0 puts the local record first.
    assert_eq!(nodes.enrs[0].node_id(), network.local_enr().node_id());
}

#[test]
fn offer_accept_bitmap_reflects_wanted_keys() {
    let (mut network, mut mux, mut store, peers) = setup();
    let now = Instant::now();
    let k1 = RawContentKey(vec![0x00; 33]);
    let k2 = RawContentKey(vec![0x01; 33]);
    let k3 = RawContentKey(vec![0x02; 33]);
    // k2 already stored, so only k1 and k3 are wanted.
    store.put(&k2, vec![1]);

    let outcome = network.handle_talkreq(
        peers[0].node_id(),
        Message::Offer(Offer {
            content_keys: vec![k1.clone(), k2.clone(), k3.clone()],
        }),
        &mut mux,
        &store,
        now,
    );
    let Some(Message::Accept(accept)) = outcome.response else {
        panic!("expected ACCEPT");
    };
    assert_eq!(accept.content_keys, vec![true, false, true]);
    // An AcceptRead request is pending under the advertised id.
    assert_eq!(mux.open_request_count(), 1);
}

#[test]
fn accept_response_initiates_offer_write() {
    let (mut network, mut mux, mut store, peers) = setup();
    let now = Instant::now();
    let k1 = RawContentKey(vec![0x00; 33]);
    let k2 = RawContentKey(vec![0x01; 33]);
    store.put(&k1, vec![0xaa; 100]);
    store.put(&k2, vec![0xbb; 100]);

    let request = Message::Offer(Offer {
        content_keys: vec![k1.clone(), k2.clone()],
    });
    let response = Message::Accept(portal_wire::Accept {
        connection_id: 0x4444,
        content_keys: vec![true, false],
    });
    let outcome = network.handle_response(
        peers[0].node_id(),
        &request,
        response,
        &mut mux,
        &store,
        now,
    );
    // A SYN goes out to start the write transfer.
    assert_eq!(outcome.datagrams.len(), 1);
    assert_eq!(outcome.datagrams[0].0, peers[0].node_id());
    assert_eq!(mux.open_request_count(), 1);
}

#[test]
fn gossip_selects_interested_peers_once() {
    let (mut network, _mux, _store, peers) = setup();
    let now = Instant::now();
    for enr in &peers {
        if let AddOutcome::Added = network.table.add(enr.clone(), now) {
            network.table.set_radius(&enr.node_id(), Distance::MAX);
        }
    }
    let key = RawContentKey(vec![0x00; 33]);
    let first = network.gossip_offers(&key);
    assert!(!first.is_empty());
    assert!(first.len() <= portal_overlay::network::GOSSIP_FANOUT);

    // Same key again: every interested peer already saw it.
    let second = network.gossip_offers(&key);
    assert!(second.is_empty());
}

#[test]
fn gossip_skips_peers_whose_radius_excludes_the_content() {
    let (mut network, _mux, _store, peers) = setup();
    let now = Instant::now();
    for enr in &peers {
        network.table.add(enr.clone(), now);
        // Zero radius: stores nothing.
        network.table.set_radius(&enr.node_id(), Distance::ZERO);
    }
    let key = RawContentKey(vec![0x00; 33]);
    assert!(network.gossip_offers(&key).is_empty());
}
