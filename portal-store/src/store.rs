//! The content store: proof-gated ingestion in front of the durable KV,
//! radius-based eviction under a size cap, and the events the embedding
//! node turns into gossip.

use crate::accumulator::{HistoricalRoots, MasterAccumulator};
use crate::error::{StoreError, StoreResult};
use crate::execution::{BlockBody, BlockHeader, HeaderProof, HeaderWithProof, Receipts};
use crate::kv::KvStore;
use portal_wire::content_key::{BeaconContentKey, ContentId, HistoryContentKey};
use portal_wire::types::{Distance, NodeId};
use portal_wire::RawContentKey;
use std::collections::VecDeque;
use tracing::{debug, info, warn};

/// Verifies beacon light-client artifacts (sync-committee signatures and
/// update semantics). The overlay only transports these; checking them is
/// an external concern.
pub trait BeaconVerifier: Send + Sync {
    fn verify(&self, key: &BeaconContentKey, content: &[u8]) -> StoreResult<()>;
}

#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub local_id: NodeId,
    /// Size cap; exceeding it halves the radius and evicts.
    pub capacity_bytes: u64,
    /// Expected fork digest prefix on beacon content.
    pub beacon_fork_digest: [u8; 4],
}

impl StoreConfig {
    pub fn new(local_id: NodeId, capacity_bytes: u64) -> Self {
        Self {
            local_id,
            capacity_bytes,
            beacon_fork_digest: [0u8; 4],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreEvent {
    /// Validated and written; candidates for gossip.
    ContentAdded {
        key: RawContentKey,
        content_type: u8,
        bytes: Vec<u8>,
    },
    /// Evicted by a radius shrink.
    Dropped { content_id: ContentId },
    /// The radius shrank; advertise it in the next PONG.
    RadiusChanged(Distance),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutOutcome {
    Stored,
    /// Identical content already present; the store is unchanged.
    AlreadyStored,
    /// The content id lies outside the storage radius.
    OutsideRadius,
}

pub struct ContentStore<K: KvStore> {
    kv: K,
    master: MasterAccumulator,
    historical: HistoricalRoots,
    beacon: Option<Box<dyn BeaconVerifier>>,
    config: StoreConfig,
    radius: Distance,
    events: VecDeque<StoreEvent>,
}

impl<K: KvStore> ContentStore<K> {
    pub fn new(
        kv: K,
        master: MasterAccumulator,
        historical: HistoricalRoots,
        beacon: Option<Box<dyn BeaconVerifier>>,
        config: StoreConfig,
    ) -> Self {
        Self {
            kv,
            master,
            historical,
            beacon,
            config,
            radius: Distance::MAX,
            events: VecDeque::new(),
        }
    }

    pub fn radius(&self) -> Distance {
        self.radius
    }

    pub fn local_id(&self) -> NodeId {
        self.config.local_id
    }

    pub fn poll_event(&mut self) -> Option<StoreEvent> {
        self.events.pop_front()
    }

    pub fn kv(&self) -> &K {
        &self.kv
    }

    fn distance_to_local(&self, id: &ContentId) -> Distance {
        id.distance_to(&self.config.local_id)
    }

    pub fn get(&self, key: &RawContentKey) -> StoreResult<Option<Vec<u8>>> {
        self.kv.get(&key.content_id().to_hex())
    }

    pub fn contains(&self, key: &RawContentKey) -> bool {
        matches!(self.get(key), Ok(Some(_)))
    }

    /// Whether an OFFER of this key should be accepted: a known content
    /// type, not yet stored, and inside the radius.
    pub fn wants(&self, key: &RawContentKey) -> bool {
        let Some(selector) = key.0.first() else {
            return false;
        };
        if !known_content_type(*selector) {
            return false;
        }
        // Receipts flow on demand, never through offers.
        if *selector == HistoryContentKey::SELECTOR_RECEIPTS {
            return false;
        }
        if self.distance_to_local(&key.content_id()) > self.radius {
            return false;
        }
        !self.contains(key)
    }

    /// Validates and stores one content item. Every write passes through
    /// the proof machinery; nothing unverified touches the KV.
    pub fn put(&mut self, key: &RawContentKey, bytes: &[u8]) -> StoreResult<PutOutcome> {
        let content_id = key.content_id();
        if self.distance_to_local(&content_id) > self.radius {
            return Ok(PutOutcome::OutsideRadius);
        }
        let id_hex = content_id.to_hex();
        if let Some(existing) = self.kv.get(&id_hex)? {
            if existing == bytes {
                return Ok(PutOutcome::AlreadyStored);
            }
            // Same id, different bytes: re-validate and overwrite below.
            debug!(id = %id_hex, "replacing divergent content for id");
        }

        let content_type = self.validate(key, bytes)?;
        self.kv.put(&id_hex, bytes)?;
        self.events.push_back(StoreEvent::ContentAdded {
            key: key.clone(),
            content_type,
            bytes: bytes.to_vec(),
        });
        self.enforce_capacity()?;
        Ok(PutOutcome::Stored)
    }

    /// Type-dispatched validation; returns the content-type selector.
    fn validate(&self, key: &RawContentKey, bytes: &[u8]) -> StoreResult<u8> {
        let selector = *key
            .0
            .first()
            .ok_or(StoreError::MalformedContent("empty content key"))?;
        match selector {
            0x00..=0x03 => {
                let key = HistoryContentKey::decode(&key.0)?;
                self.validate_history(&key, bytes)?;
            }
            0x10..=0x13 => {
                let key = BeaconContentKey::decode(&key.0)?;
                self.validate_beacon(&key, bytes)?;
            }
            other => return Err(StoreError::UnknownContentType(other)),
        }
        Ok(selector)
    }

    fn validate_history(&self, key: &HistoryContentKey, bytes: &[u8]) -> StoreResult<()> {
        match key {
            HistoryContentKey::BlockHeader { block_hash } => {
                let hwp = HeaderWithProof::decode(bytes)?;
                let (header, hash) = BlockHeader::decode_rlp(&hwp.header_rlp)?;
                if hash.0 != *block_hash {
                    return Err(StoreError::ReassemblyFailed("header hash mismatch"));
                }
                match &hwp.proof {
                    HeaderProof::Accumulator(branch) => {
                        self.master
                            .verify_header_proof(header.number, &hash, branch)?;
                    }
                    HeaderProof::HistoricalRoots(block_proof) => {
                        self.historical.verify(&hash, block_proof)?;
                    }
                }
                Ok(())
            }
            HistoryContentKey::BlockBody { block_hash } => {
                let header = self.stored_header(block_hash)?;
                BlockBody::decode(bytes)?.validate_against(&header)
            }
            HistoryContentKey::Receipts { block_hash } => {
                let header = self.stored_header(block_hash)?;
                Receipts::decode(bytes)?.validate_against(&header)
            }
            HistoryContentKey::EpochAccumulator { epoch_hash } => {
                let acc = crate::accumulator::EpochAccumulator::decode(bytes)?;
                let root = acc.hash_tree_root();
                if root.0 != *epoch_hash {
                    return Err(StoreError::ReassemblyFailed("epoch root mismatch"));
                }
                if !self.master.contains_epoch_root(&root) {
                    return Err(StoreError::InvalidProof);
                }
                Ok(())
            }
        }
    }

    fn validate_beacon(&self, key: &BeaconContentKey, bytes: &[u8]) -> StoreResult<()> {
        if bytes.len() < 4 || bytes[..4] != self.config.beacon_fork_digest {
            return Err(StoreError::ForkDigestMismatch);
        }
        match &self.beacon {
            Some(verifier) => verifier.verify(key, bytes),
            None => Err(StoreError::MalformedContent("no beacon verifier")),
        }
    }

    /// The validated header a body/receipts item must reassemble against.
    fn stored_header(&self, block_hash: &[u8; 32]) -> StoreResult<BlockHeader> {
        let header_key = HistoryContentKey::BlockHeader {
            block_hash: *block_hash,
        }
        .encode();
        let stored = self
            .get(&header_key)?
            .ok_or_else(|| StoreError::MissingHeader(hex::encode(block_hash)))?;
        let hwp = HeaderWithProof::decode(&stored)?;
        let (header, _) = BlockHeader::decode_rlp(&hwp.header_rlp)?;
        Ok(header)
    }

    /// Shrinks the radius and evicts until the store fits its cap again.
    fn enforce_capacity(&mut self) -> StoreResult<()> {
        while self.kv.size()? > self.config.capacity_bytes {
            if self.radius.is_zero() {
                warn!("store over capacity at zero radius");
                return Ok(());
            }
            self.radius = self.radius.halved();
            info!(radius = %self.radius, "store over capacity, shrinking radius");
            self.events.push_back(StoreEvent::RadiusChanged(self.radius));
            self.evict_outside_radius()?;
        }
        Ok(())
    }

    fn evict_outside_radius(&mut self) -> StoreResult<()> {
        for key in self.kv.keys()? {
            let Ok(raw) = hex::decode(&key) else {
                continue;
            };
            let Ok(id_bytes) = <[u8; 32]>::try_from(raw.as_slice()) else {
                continue;
            };
            let id = ContentId(id_bytes);
            if self.distance_to_local(&id) > self.radius {
                self.kv.del(&key)?;
                self.events.push_back(StoreEvent::Dropped { content_id: id });
            }
        }
        Ok(())
    }

    /// Every stored content id, for audits and tests.
    pub fn content_ids(&self) -> StoreResult<Vec<ContentId>> {
        let mut out = Vec::new();
        for key in self.kv.keys()? {
            if let Ok(raw) = hex::decode(&key)
                && let Ok(id) = <[u8; 32]>::try_from(raw.as_slice())
            {
                out.push(ContentId(id));
            }
        }
        Ok(out)
    }
}

fn known_content_type(selector: u8) -> bool {
    matches!(selector, 0x00..=0x03 | 0x10..=0x13)
}
