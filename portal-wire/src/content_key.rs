//! Typed content keys. The first byte of a key selects the content variant;
//! the content id every distance computation uses is the SHA-256 digest of
//! the full key bytes.

use crate::error::{WireError, WireResult};
use crate::types::{Distance, NodeId};
use sha2::{Digest, Sha256};
use ssz_derive::{Decode, Encode};
use std::fmt;

fn read_fixed32(raw: &[u8], at: usize) -> WireResult<[u8; 32]> {
    let end = at + 32;
    if raw.len() < end {
        return Err(WireError::Truncated {
            needed: end,
            had: raw.len(),
        });
    }
    let mut out = [0u8; 32];
    out.copy_from_slice(&raw[at..end]);
    Ok(out)
}

fn read_u64_le(raw: &[u8], at: usize) -> WireResult<u64> {
    let end = at + 8;
    if raw.len() < end {
        return Err(WireError::Truncated {
            needed: end,
            had: raw.len(),
        });
    }
    let mut out = [0u8; 8];
    out.copy_from_slice(&raw[at..end]);
    Ok(u64::from_le_bytes(out))
}

/// 32-byte content coordinate in the DHT keyspace.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContentId(pub [u8; 32]);

impl ContentId {
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn distance_to(&self, node: &NodeId) -> Distance {
        node.distance_to(&self.0)
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Debug for ContentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ContentId(0x{}..)", hex::encode(&self.0[..4]))
    }
}

/// An undecoded content key as it travels in overlay messages. On the wire
/// it is the bare byte list.
#[derive(Clone, PartialEq, Eq, Hash, Encode, Decode)]
#[ssz(struct_behaviour = "transparent")]
pub struct RawContentKey(pub Vec<u8>);

impl RawContentKey {
    pub fn content_id(&self) -> ContentId {
        let digest = Sha256::digest(&self.0);
        let mut raw = [0u8; 32];
        raw.copy_from_slice(&digest);
        ContentId(raw)
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.0
    }
}

impl From<Vec<u8>> for RawContentKey {
    fn from(raw: Vec<u8>) -> Self {
        RawContentKey(raw)
    }
}

impl fmt::Debug for RawContentKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RawContentKey(0x{})", hex::encode(&self.0))
    }
}

/// Content addressed by the history network.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HistoryContentKey {
    /// Execution block header, keyed by block hash, carried with its
    /// accumulator proof.
    BlockHeader { block_hash: [u8; 32] },
    /// Block body (transactions and uncles), keyed by block hash.
    BlockBody { block_hash: [u8; 32] },
    /// Transaction receipts, keyed by block hash.
    Receipts { block_hash: [u8; 32] },
    /// A full epoch accumulator, keyed by its hash tree root.
    EpochAccumulator { epoch_hash: [u8; 32] },
}

impl HistoryContentKey {
    pub const SELECTOR_HEADER: u8 = 0x00;
    pub const SELECTOR_BODY: u8 = 0x01;
    pub const SELECTOR_RECEIPTS: u8 = 0x02;
    pub const SELECTOR_EPOCH_ACCUMULATOR: u8 = 0x03;

    pub fn selector(&self) -> u8 {
        match self {
            HistoryContentKey::BlockHeader { .. } => Self::SELECTOR_HEADER,
            HistoryContentKey::BlockBody { .. } => Self::SELECTOR_BODY,
            HistoryContentKey::Receipts { .. } => Self::SELECTOR_RECEIPTS,
            HistoryContentKey::EpochAccumulator { .. } => Self::SELECTOR_EPOCH_ACCUMULATOR,
        }
    }

    pub fn hash(&self) -> &[u8; 32] {
        match self {
            HistoryContentKey::BlockHeader { block_hash }
            | HistoryContentKey::BlockBody { block_hash }
            | HistoryContentKey::Receipts { block_hash } => block_hash,
            HistoryContentKey::EpochAccumulator { epoch_hash } => epoch_hash,
        }
    }

    pub fn encode(&self) -> RawContentKey {
        let mut out = Vec::with_capacity(33);
        out.push(self.selector());
        out.extend_from_slice(self.hash());
        RawContentKey(out)
    }

    pub fn decode(raw: &[u8]) -> WireResult<Self> {
        let selector = *raw.first().ok_or(WireError::Truncated { needed: 1, had: 0 })?;
        let hash = read_fixed32(raw, 1)?;
        if raw.len() != 33 {
            return Err(WireError::TrailingBytes);
        }
        match selector {
            Self::SELECTOR_HEADER => Ok(HistoryContentKey::BlockHeader { block_hash: hash }),
            Self::SELECTOR_BODY => Ok(HistoryContentKey::BlockBody { block_hash: hash }),
            Self::SELECTOR_RECEIPTS => Ok(HistoryContentKey::Receipts { block_hash: hash }),
            Self::SELECTOR_EPOCH_ACCUMULATOR => {
                Ok(HistoryContentKey::EpochAccumulator { epoch_hash: hash })
            }
            other => Err(WireError::UnknownContentType(other)),
        }
    }

    pub fn content_id(&self) -> ContentId {
        self.encode().content_id()
    }
}

/// Content addressed by the beacon light-client network.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BeaconContentKey {
    LightClientBootstrap { block_root: [u8; 32] },
    LightClientUpdatesByRange { start_period: u64, count: u64 },
    LightClientFinalityUpdate { finalized_slot: u64 },
    LightClientOptimisticUpdate { signature_slot: u64 },
}

impl BeaconContentKey {
    pub const SELECTOR_BOOTSTRAP: u8 = 0x10;
    pub const SELECTOR_UPDATES_BY_RANGE: u8 = 0x11;
    pub const SELECTOR_FINALITY_UPDATE: u8 = 0x12;
    pub const SELECTOR_OPTIMISTIC_UPDATE: u8 = 0x13;

    pub fn selector(&self) -> u8 {
        match self {
            BeaconContentKey::LightClientBootstrap { .. } => Self::SELECTOR_BOOTSTRAP,
            BeaconContentKey::LightClientUpdatesByRange { .. } => Self::SELECTOR_UPDATES_BY_RANGE,
            BeaconContentKey::LightClientFinalityUpdate { .. } => Self::SELECTOR_FINALITY_UPDATE,
            BeaconContentKey::LightClientOptimisticUpdate { .. } => {
                Self::SELECTOR_OPTIMISTIC_UPDATE
            }
        }
    }

    pub fn encode(&self) -> RawContentKey {
        let mut out = Vec::with_capacity(33);
        out.push(self.selector());
        match self {
            BeaconContentKey::LightClientBootstrap { block_root } => {
                out.extend_from_slice(block_root);
            }
            BeaconContentKey::LightClientUpdatesByRange {
                start_period,
                count,
            } => {
                out.extend_from_slice(&start_period.to_le_bytes());
                out.extend_from_slice(&count.to_le_bytes());
            }
            BeaconContentKey::LightClientFinalityUpdate { finalized_slot } => {
                out.extend_from_slice(&finalized_slot.to_le_bytes());
            }
            BeaconContentKey::LightClientOptimisticUpdate { signature_slot } => {
                out.extend_from_slice(&signature_slot.to_le_bytes());
            }
        }
        RawContentKey(out)
    }

    pub fn decode(raw: &[u8]) -> WireResult<Self> {
        let selector = *raw.first().ok_or(WireError::Truncated { needed: 1, had: 0 })?;
        match selector {
            Self::SELECTOR_BOOTSTRAP => {
                let block_root = read_fixed32(raw, 1)?;
                if raw.len() != 33 {
                    return Err(WireError::TrailingBytes);
                }
                Ok(BeaconContentKey::LightClientBootstrap { block_root })
            }
            Self::SELECTOR_UPDATES_BY_RANGE => {
                let start_period = read_u64_le(raw, 1)?;
                let count = read_u64_le(raw, 9)?;
                if raw.len() != 17 {
                    return Err(WireError::TrailingBytes);
                }
                Ok(BeaconContentKey::LightClientUpdatesByRange {
                    start_period,
                    count,
                })
            }
            Self::SELECTOR_FINALITY_UPDATE => {
                let finalized_slot = read_u64_le(raw, 1)?;
                if raw.len() != 9 {
                    return Err(WireError::TrailingBytes);
                }
                Ok(BeaconContentKey::LightClientFinalityUpdate { finalized_slot })
            }
            Self::SELECTOR_OPTIMISTIC_UPDATE => {
                let signature_slot = read_u64_le(raw, 1)?;
                if raw.len() != 9 {
                    return Err(WireError::TrailingBytes);
                }
                Ok(BeaconContentKey::LightClientOptimisticUpdate { signature_slot })
            }
            other => Err(WireError::UnknownContentType(other)),
        }
    }

    pub fn content_id(&self) -> ContentId {
        self.encode().content_id()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn history_key_round_trip() {
        let keys = [
            HistoryContentKey::BlockHeader {
                block_hash: [0x11; 32],
            },
            HistoryContentKey::BlockBody {
                block_hash: [0x22; 32],
            },
            HistoryContentKey::Receipts {
                block_hash: [0x33; 32],
            },
            HistoryContentKey::EpochAccumulator {
                epoch_hash: [0x44; 32],
            },
        ];
        for key in keys {
            let raw = key.encode();
            assert_eq!(HistoryContentKey::decode(raw.as_slice()).unwrap(), key);
        }
    }

    #[test]
    fn beacon_key_round_trip() {
        let keys = [
            BeaconContentKey::LightClientBootstrap {
                block_root: [0xaa; 32],
            },
            BeaconContentKey::LightClientUpdatesByRange {
                start_period: 700,
                count: 4,
            },
            BeaconContentKey::LightClientFinalityUpdate {
                finalized_slot: 123_456,
            },
            BeaconContentKey::LightClientOptimisticUpdate {
                signature_slot: 654_321,
            },
        ];
        for key in keys {
            let raw = key.encode();
            assert_eq!(BeaconContentKey::decode(raw.as_slice()).unwrap(), key);
        }
    }

    #[test]
    fn unknown_selector_is_typed() {
        let mut raw = vec![0x7f];
        raw.extend_from_slice(&[0u8; 32]);
        assert_eq!(
            HistoryContentKey::decode(&raw),
            Err(WireError::UnknownContentType(0x7f))
        );
    }

    #[test]
    fn content_id_is_key_digest() {
        let key = HistoryContentKey::BlockHeader {
            block_hash: [0x55; 32],
        };
        let raw = key.encode();
        assert_eq!(key.content_id(), raw.content_id());
        // Distinct keys land on distinct ids.
        let other = HistoryContentKey::BlockBody {
            block_hash: [0x55; 32],
        };
        assert_ne!(key.content_id(), other.content_id());
    }
}
