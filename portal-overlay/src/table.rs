//! The Kademlia routing table: 256 k-buckets ordered by verification
//! recency, one pending replacement per bucket, and per-peer overlay
//! bookkeeping (advertised radius, offered-content suppression cache).

use portal_wire::constants::{BUCKET_COUNT, BUCKET_SIZE};
use portal_wire::enr::Enr;
use portal_wire::types::{Distance, NodeId};
use rand::RngCore;
use std::collections::{HashSet, VecDeque};
use std::time::Instant;
use tracing::debug;

/// Bound on the per-peer cache of already-offered content ids. Once an id
/// falls out, the same content may legitimately be offered again.
pub const OFFERED_CACHE_CAP: usize = 1024;

/// Bounded set remembering which content ids we already offered a peer.
#[derive(Debug, Default)]
struct OfferedCache {
    order: VecDeque<[u8; 32]>,
    set: HashSet<[u8; 32]>,
}

impl OfferedCache {
    fn contains(&self, id: &[u8; 32]) -> bool {
        self.set.contains(id)
    }

    fn insert(&mut self, id: [u8; 32]) {
        if !self.set.insert(id) {
            return;
        }
        self.order.push_back(id);
        while self.order.len() > OFFERED_CACHE_CAP {
            if let Some(evicted) = self.order.pop_front() {
                self.set.remove(&evicted);
            }
        }
    }
}

#[derive(Debug)]
pub struct PeerEntry {
    pub enr: Enr,
    pub last_seen: Instant,
    pub radius: Distance,
    offered: OfferedCache,
}

impl PeerEntry {
    fn new(enr: Enr, now: Instant) -> Self {
        Self {
            enr,
            last_seen: now,
            // Until the first PONG we assume the peer stores nothing.
            radius: Distance::ZERO,
            offered: OfferedCache::default(),
        }
    }
}

#[derive(Debug, Default)]
struct Bucket {
    /// Most-recently-verified peers sit at the tail.
    peers: Vec<PeerEntry>,
    pending: Option<PeerEntry>,
}

/// Result of offering a record to the table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AddOutcome {
    Added,
    Updated,
    /// Bucket full; the candidate went to the pending slot and the returned
    /// head-of-bucket peer should be liveness-probed.
    Pending { probe: Box<Enr> },
    /// The local record never enters the table.
    SelfRecord,
}

pub struct RoutingTable {
    local_id: NodeId,
    buckets: Vec<Bucket>,
}

impl RoutingTable {
    pub fn new(local_id: NodeId) -> Self {
        let mut buckets = Vec::with_capacity(BUCKET_COUNT);
        buckets.resize_with(BUCKET_COUNT, Bucket::default);
        Self { local_id, buckets }
    }

    pub fn local_id(&self) -> NodeId {
        self.local_id
    }

    pub fn len(&self) -> usize {
        self.buckets.iter().map(|b| b.peers.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn bucket_for(&self, node_id: &NodeId) -> Option<usize> {
        self.local_id
            .distance_to(node_id.as_bytes())
            .bucket_index()
    }

    /// Offers a record. A known peer moves to the verified tail of its
    /// bucket (and picks up a newer ENR by sequence number); a full bucket
    /// parks the candidate in the pending slot.
    pub fn add(&mut self, enr: Enr, now: Instant) -> AddOutcome {
        let node_id = enr.node_id();
        let Some(index) = self.bucket_for(&node_id) else {
            return AddOutcome::SelfRecord;
        };
        let bucket = &mut self.buckets[index];

        if let Some(pos) = bucket.peers.iter().position(|p| p.enr.node_id() == node_id) {
            let mut entry = bucket.peers.remove(pos);
            if enr.seq > entry.enr.seq {
                entry.enr = enr;
            }
            entry.last_seen = now;
            bucket.peers.push(entry);
            return AddOutcome::Updated;
        }

        if bucket.peers.len() < BUCKET_SIZE {
            bucket.peers.push(PeerEntry::new(enr, now));
            return AddOutcome::Added;
        }

        let probe = bucket.peers[0].enr.clone();
        match &mut bucket.pending {
            Some(pending) if pending.enr.node_id() == node_id => {
                if enr.seq > pending.enr.seq {
                    pending.enr = enr;
                }
                pending.last_seen = now;
            }
            slot => *slot = Some(PeerEntry::new(enr, now)),
        }
        AddOutcome::Pending {
            probe: Box::new(probe),
        }
    }

    /// A liveness probe succeeded: refresh the peer's position.
    pub fn mark_alive(&mut self, node_id: &NodeId, now: Instant) {
        let Some(index) = self.bucket_for(node_id) else {
            return;
        };
        let bucket = &mut self.buckets[index];
        if let Some(pos) = bucket.peers.iter().position(|p| p.enr.node_id() == *node_id) {
            let mut entry = bucket.peers.remove(pos);
            entry.last_seen = now;
            bucket.peers.push(entry);
        }
    }

    /// Drops a peer outright (failed probe, session loss); the pending
    /// candidate, if any, takes the open slot.
    pub fn remove(&mut self, node_id: &NodeId) {
        let Some(index) = self.bucket_for(node_id) else {
            return;
        };
        let bucket = &mut self.buckets[index];
        let before = bucket.peers.len();
        bucket.peers.retain(|p| p.enr.node_id() != *node_id);
        if bucket.peers.len() < before
            && bucket.peers.len() < BUCKET_SIZE
            && let Some(pending) = bucket.pending.take()
        {
            bucket.peers.push(pending);
        }
    }

    /// Temporary demotion for misbehavior (an invalid proof, a timeout):
    /// the peer falls to the head of its bucket, making it the next
    /// replacement candidate, without being dropped.
    pub fn score_down(&mut self, node_id: &NodeId) {
        let Some(index) = self.bucket_for(node_id) else {
            return;
        };
        let bucket = &mut self.buckets[index];
        if let Some(pos) = bucket.peers.iter().position(|p| p.enr.node_id() == *node_id) {
            let entry = bucket.peers.remove(pos);
            debug!(peer = %entry.enr.node_id(), "demoting peer");
            bucket.peers.insert(0, entry);
        }
    }

    /// Up to `n` records ordered by ascending XOR distance to `target`.
    pub fn nearest(&self, target: &[u8; 32], n: usize) -> Vec<Enr> {
        let mut all: Vec<(Distance, &Enr)> = self
            .buckets
            .iter()
            .flat_map(|b| b.peers.iter())
            .map(|p| (p.enr.node_id().distance_to(target), &p.enr))
            .collect();
        all.sort_by(|a, b| a.0.cmp(&b.0));
        all.into_iter().take(n).map(|(_, enr)| enr.clone()).collect()
    }

    /// Peers in the bucket addressed by a FINDNODES wire distance
    /// (`log2 + 1`; 0 means the local record and is handled by the caller).
    /// Ordering inside a bucket is insertion order.
    pub fn peers_at_wire_distance(&self, wire_distance: u16) -> Vec<Enr> {
        if wire_distance == 0 || wire_distance > 256 {
            return Vec::new();
        }
        let index = 256 - wire_distance as usize;
        self.buckets[index].peers.iter().map(|p| p.enr.clone()).collect()
    }

    pub fn enr_of(&self, node_id: &NodeId) -> Option<Enr> {
        let index = self.bucket_for(node_id)?;
        self.buckets[index]
            .peers
            .iter()
            .find(|p| p.enr.node_id() == *node_id)
            .map(|p| p.enr.clone())
    }

    pub fn set_radius(&mut self, node_id: &NodeId, radius: Distance) {
        if let Some(entry) = self.entry_mut(node_id) {
            entry.radius = radius;
        }
    }

    pub fn radius_of(&self, node_id: &NodeId) -> Option<Distance> {
        let index = self.bucket_for(node_id)?;
        self.buckets[index]
            .peers
            .iter()
            .find(|p| p.enr.node_id() == *node_id)
            .map(|p| p.radius)
    }

    fn entry_mut(&mut self, node_id: &NodeId) -> Option<&mut PeerEntry> {
        let index = self.bucket_for(node_id)?;
        self.buckets[index]
            .peers
            .iter_mut()
            .find(|p| p.enr.node_id() == *node_id)
    }

    /// Whether `content_id` was already offered to this peer (and not yet
    /// evicted from the suppression cache).
    pub fn content_known_to_peer(&self, node_id: &NodeId, content_id: &[u8; 32]) -> bool {
        let Some(index) = self.bucket_for(node_id) else {
            return false;
        };
        self.buckets[index]
            .peers
            .iter()
            .find(|p| p.enr.node_id() == *node_id)
            .is_some_and(|p| p.offered.contains(content_id))
    }

    pub fn record_offered(&mut self, node_id: &NodeId, content_id: [u8; 32]) {
        if let Some(entry) = self.entry_mut(node_id) {
            entry.offered.insert(content_id);
        }
    }

    /// A random target inside the lowest-populated non-empty bucket, used
    /// by the periodic bucket refresh.
    pub fn refresh_target(&self, rng: &mut dyn RngCore) -> Option<[u8; 32]> {
        let index = self
            .buckets
            .iter()
            .enumerate()
            .filter(|(_, b)| !b.peers.is_empty())
            .min_by_key(|(_, b)| b.peers.len())
            .map(|(i, _)| i)?;
        // Flip nothing above the bucket's prefix: keep the first
        // `index` bits equal to ours, force bit `index`, randomize the rest.
        let mut target = [0u8; 32];
        rng.fill_bytes(&mut target);
        let local = self.local_id.as_bytes();
        for bit in 0..=index {
            let byte = bit / 8;
            let mask = 0x80u8 >> (bit % 8);
            let local_bit = local[byte] & mask;
            if bit < index {
                target[byte] = (target[byte] & !mask) | local_bit;
            } else {
                // Differ exactly at the bucket's depth.
                target[byte] = (target[byte] & !mask) | (local_bit ^ mask);
            }
        }
        Some(target)
    }

    /// All peers, for snapshots and persistence.
    pub fn peers(&self) -> impl Iterator<Item = &PeerEntry> {
        self.buckets.iter().flat_map(|b| b.peers.iter())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use portal_wire::identity::NodeKeypair;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    fn keypairs(n: usize, seed: u64) -> Vec<NodeKeypair> {
        let mut rng = StdRng::seed_from_u64(seed);
        (0..n).map(|_| NodeKeypair::generate(&mut rng)).collect()
    }

    fn table() -> (RoutingTable, Vec<Enr>) {
        let pairs = keypairs(64, 99);
        let local = pairs[0].node_id();
        let table = RoutingTable::new(local);
        let enrs = pairs[1..].iter().map(|kp| kp.make_enr(1, None)).collect();
        (table, enrs)
    }

    #[test]
    fn nearest_orders_by_distance() {
        let (mut table, enrs) = table();
        let now = Instant::now();
        for enr in &enrs {
            table.add(enr.clone(), now);
        }
        let target = [0x5a; 32];
        let nearest = table.nearest(&target, 16);
        assert!(!nearest.is_empty());
        let distances: Vec<Distance> = nearest
            .iter()
            .map(|e| e.node_id().distance_to(&target))
            .collect();
        let mut sorted = distances.clone();
        sorted.sort();
        assert_eq!(distances, sorted);
    }

    #[test]
    fn self_record_is_rejected() {
        let pairs = keypairs(1, 5);
        let mut table = RoutingTable::new(pairs[0].node_id());
        let own = pairs[0].make_enr(1, None);
        assert_eq!(table.add(own, Instant::now()), AddOutcome::SelfRecord);
        assert!(table.is_empty());
    }

    #[test]
    fn re_adding_moves_to_tail_and_keeps_newest_enr() {
        let (mut table, enrs) = table();
        let now = Instant::now();
        let first = enrs[0].clone();
        assert_eq!(table.add(first.clone(), now), AddOutcome::Added);
        let mut newer = first.clone();
        newer.seq = 9;
        assert_eq!(table.add(newer.clone(), now), AddOutcome::Updated);
        assert_eq!(table.enr_of(&first.node_id()).unwrap().seq, 9);
        // A stale record does not replace a newer one.
        assert_eq!(table.add(first.clone(), now), AddOutcome::Updated);
        assert_eq!(table.enr_of(&first.node_id()).unwrap().seq, 9);
    }

    #[test]
    fn offered_cache_suppresses_until_evicted() {
        let (mut table, enrs) = table();
        let now = Instant::now();
        table.add(enrs[0].clone(), now);
        let peer = enrs[0].node_id();
        let id = [7u8; 32];
        assert!(!table.content_known_to_peer(&peer, &id));
        table.record_offered(&peer, id);
        assert!(table.content_known_to_peer(&peer, &id));

        // Fill the cache far past its cap; the old entry falls out.
        for i in 0..(OFFERED_CACHE_CAP + 1) {
            let mut other = [0u8; 32];
            other[..8].copy_from_slice(&(i as u64).to_be_bytes());
            other[31] = 0xfe;
            table.record_offered(&peer, other);
        }
        assert!(!table.content_known_to_peer(&peer, &id));
    }

    #[test]
    fn radius_defaults_to_zero_until_pong() {
        let (mut table, enrs) = table();
        let now = Instant::now();
        table.add(enrs[0].clone(), now);
        let peer = enrs[0].node_id();
        assert_eq!(table.radius_of(&peer), Some(Distance::ZERO));
        table.set_radius(&peer, Distance::MAX);
        assert_eq!(table.radius_of(&peer), Some(Distance::MAX));
    }

    #[test]
    fn refresh_target_lands_in_chosen_bucket() {
        let (mut table, enrs) = table();
        let now = Instant::now();
        for enr in &enrs {
            table.add(enr.clone(), now);
        }
        let mut rng = StdRng::seed_from_u64(123);
        for _ in 0..20 {
            let target = table.refresh_target(&mut rng).unwrap();
            let bucket = table
                .local_id()
                .distance_to(&target)
                .bucket_index()
                .unwrap();
            // The refresh always aims at a populated bucket.
            assert!(!table.peers_at_wire_distance((256 - bucket) as u16).is_empty());
        }
    }

    #[test]
    fn score_down_moves_peer_to_replacement_position() {
        let (mut table, enrs) = table();
        let now = Instant::now();
        for enr in enrs.iter().take(8) {
            table.add(enr.clone(), now);
        }
        let victim = enrs[0].node_id();
        table.score_down(&victim);
        // Still present.
        assert!(table.enr_of(&victim).is_some());
    }
}
