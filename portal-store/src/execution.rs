//! Execution-layer content shapes: the RLP block header, the portal body
//! and receipts encodings, and the header-with-proof container that
//! history-network headers travel in.

use crate::accumulator::HistoricalRootsBlockProof;
use crate::error::{StoreError, StoreResult};
use crate::trie;
use alloy_primitives::{Address, B64, B256, Bytes, U256, keccak256};
use alloy_rlp::{Decodable, Header as RlpHeader};
use ssz::{Decode, Encode};
use ssz_derive::{Decode, Encode};
use tree_hash::Hash256;

/// Upper bound on transactions or receipts per block.
const MAX_ITEMS_PER_BLOCK: usize = 16_384;

/// An execution block header, pre-merge legacy through pre-Capella shape.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockHeader {
    pub parent_hash: B256,
    pub uncles_hash: B256,
    pub beneficiary: Address,
    pub state_root: B256,
    pub transactions_root: B256,
    pub receipts_root: B256,
    pub logs_bloom: Bytes,
    pub difficulty: U256,
    pub number: u64,
    pub gas_limit: u64,
    pub gas_used: u64,
    pub timestamp: u64,
    pub extra_data: Bytes,
    pub mix_hash: B256,
    pub nonce: B64,
    /// Present from the London fork onward.
    pub base_fee_per_gas: Option<U256>,
}

impl BlockHeader {
    /// Decodes the RLP header and returns it with its keccak block hash.
    pub fn decode_rlp(raw: &[u8]) -> StoreResult<(Self, B256)> {
        let hash = keccak256(raw);
        let mut outer = raw;
        let rlp_header = RlpHeader::decode(&mut outer)?;
        if !rlp_header.list {
            return Err(StoreError::MalformedContent("header is not an rlp list"));
        }
        if outer.len() != rlp_header.payload_length {
            return Err(StoreError::MalformedContent("trailing bytes after header"));
        }
        let buf = &mut &outer[..];
        let header = BlockHeader {
            parent_hash: B256::decode(buf)?,
            uncles_hash: B256::decode(buf)?,
            beneficiary: Address::decode(buf)?,
            state_root: B256::decode(buf)?,
            transactions_root: B256::decode(buf)?,
            receipts_root: B256::decode(buf)?,
            logs_bloom: Bytes::decode(buf)?,
            difficulty: U256::decode(buf)?,
            number: u64::decode(buf)?,
            gas_limit: u64::decode(buf)?,
            gas_used: u64::decode(buf)?,
            timestamp: u64::decode(buf)?,
            extra_data: Bytes::decode(buf)?,
            mix_hash: B256::decode(buf)?,
            nonce: B64::decode(buf)?,
            base_fee_per_gas: if buf.is_empty() {
                None
            } else {
                Some(U256::decode(buf)?)
            },
        };
        if !buf.is_empty() {
            // Withdrawals and later fork fields sit outside this network's
            // validation scope.
            return Err(StoreError::MalformedContent("unsupported header shape"));
        }
        Ok((header, hash))
    }
}

/// The proof variants a history-network header travels with.
#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
#[ssz(enum_behaviour = "union")]
pub enum HeaderProof {
    /// Pre-merge: a 15-witness epoch accumulator proof.
    Accumulator(Vec<Hash256>),
    /// Post-merge, pre-Capella: chained historical-roots proof.
    HistoricalRoots(HistoricalRootsBlockProof),
}

#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub struct HeaderWithProof {
    pub header_rlp: Vec<u8>,
    pub proof: HeaderProof,
}

impl HeaderWithProof {
    pub fn encode(&self) -> Vec<u8> {
        self.as_ssz_bytes()
    }

    pub fn decode(buf: &[u8]) -> StoreResult<Self> {
        Self::from_ssz_bytes(buf).map_err(StoreError::from_ssz)
    }
}

/// A block body: opaque transaction payloads plus the raw uncles RLP list.
#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub struct BlockBody {
    pub transactions: Vec<Vec<u8>>,
    pub uncles_rlp: Vec<u8>,
}

impl BlockBody {
    pub fn encode(&self) -> Vec<u8> {
        self.as_ssz_bytes()
    }

    pub fn decode(buf: &[u8]) -> StoreResult<Self> {
        let body = Self::from_ssz_bytes(buf).map_err(StoreError::from_ssz)?;
        if body.transactions.len() > MAX_ITEMS_PER_BLOCK {
            return Err(StoreError::MalformedContent("too many transactions"));
        }
        Ok(body)
    }

    /// Cross-checks the body against its header: the transactions trie root
    /// and the uncles hash must both match.
    pub fn validate_against(&self, header: &BlockHeader) -> StoreResult<()> {
        let txs_root = trie::ordered_trie_root(&self.transactions);
        if txs_root != header.transactions_root.0 {
            return Err(StoreError::ReassemblyFailed("transactions root mismatch"));
        }
        if keccak256(&self.uncles_rlp).0 != header.uncles_hash.0 {
            return Err(StoreError::ReassemblyFailed("uncles hash mismatch"));
        }
        Ok(())
    }
}

/// Receipts content: the list of raw (possibly type-prefixed) receipts.
#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
#[ssz(struct_behaviour = "transparent")]
pub struct Receipts {
    pub receipts: Vec<Vec<u8>>,
}

impl Receipts {
    pub fn encode(&self) -> Vec<u8> {
        self.as_ssz_bytes()
    }

    pub fn decode(buf: &[u8]) -> StoreResult<Self> {
        let receipts = Self::from_ssz_bytes(buf).map_err(StoreError::from_ssz)?;
        if receipts.receipts.len() > MAX_ITEMS_PER_BLOCK {
            return Err(StoreError::MalformedContent("too many receipts"));
        }
        Ok(receipts)
    }

    pub fn validate_against(&self, header: &BlockHeader) -> StoreResult<()> {
        let root = trie::ordered_trie_root(&self.receipts);
        if root != header.receipts_root.0 {
            return Err(StoreError::ReassemblyFailed("receipts root mismatch"));
        }
        Ok(())
    }
}

pub mod testing {
    //! Builders for synthetic blocks, shared by unit and scenario tests.

    use super::*;
    use alloy_rlp::Encodable;

    /// RLP-encodes a header with the given roots; everything else is fixed.
    pub fn make_header_rlp(
        number: u64,
        transactions_root: [u8; 32],
        receipts_root: [u8; 32],
        uncles_hash: [u8; 32],
    ) -> Vec<u8> {
        let mut payload = Vec::new();
        B256::from([1u8; 32]).encode(&mut payload);
        B256::from(uncles_hash).encode(&mut payload);
        Address::from([2u8; 20]).encode(&mut payload);
        B256::from([3u8; 32]).encode(&mut payload);
        B256::from(transactions_root).encode(&mut payload);
        B256::from(receipts_root).encode(&mut payload);
        Bytes::from(vec![0u8; 256]).encode(&mut payload);
        U256::from(131_072u64).encode(&mut payload);
        number.encode(&mut payload);
        8_000_000u64.encode(&mut payload);
        7_990_000u64.encode(&mut payload);
        1_600_000_000u64.encode(&mut payload);
        Bytes::from(b"portal".to_vec()).encode(&mut payload);
        B256::from([4u8; 32]).encode(&mut payload);
        B64::from([5u8; 8]).encode(&mut payload);

        let mut out = Vec::new();
        RlpHeader {
            list: true,
            payload_length: payload.len(),
        }
        .encode(&mut out);
        out.extend_from_slice(&payload);
        out
    }

    /// Empty uncles list RLP (`0xc0`).
    pub fn empty_uncles() -> Vec<u8> {
        vec![0xc0]
    }
}

#[cfg(test)]
mod tests {
    use super::testing::{empty_uncles, make_header_rlp};
    use super::*;
    use crate::accumulator::{EXECUTION_BLOCK_PROOF_LEN, HISTORICAL_ROOTS_PROOF_LEN};

    #[test]
    fn header_rlp_round_trips_with_hash() {
        let raw = make_header_rlp(1234, [7u8; 32], [8u8; 32], keccak256(empty_uncles()).0);
        let (header, hash) = BlockHeader::decode_rlp(&raw).unwrap();
        assert_eq!(header.number, 1234);
        assert_eq!(header.transactions_root.0, [7u8; 32]);
        assert_eq!(header.base_fee_per_gas, None);
        assert_eq!(hash, keccak256(&raw));
    }

    #[test]
    fn truncated_header_is_rejected() {
        let raw = make_header_rlp(1, [0u8; 32], [0u8; 32], [0u8; 32]);
        assert!(BlockHeader::decode_rlp(&raw[..raw.len() - 3]).is_err());
    }

    #[test]
    fn body_validation_matches_roots() {
        let transactions: Vec<Vec<u8>> = (0..5u8).map(|i| vec![i; 60]).collect();
        let txs_root = trie::ordered_trie_root(&transactions);
        let uncles = empty_uncles();
        let raw = make_header_rlp(10, txs_root, [0u8; 32], keccak256(&uncles).0);
        let (header, _) = BlockHeader::decode_rlp(&raw).unwrap();

        let body = BlockBody {
            transactions: transactions.clone(),
            uncles_rlp: uncles.clone(),
        };
        body.validate_against(&header).unwrap();

        // A tampered transaction breaks the trie root.
        let mut bad = body.clone();
        bad.transactions[2][0] ^= 0xff;
        assert!(matches!(
            bad.validate_against(&header),
            Err(StoreError::ReassemblyFailed("transactions root mismatch"))
        ));

        // Body codec round-trip.
        let decoded = BlockBody::decode(&body.encode()).unwrap();
        assert_eq!(decoded, body);
    }

    #[test]
    fn receipts_validation_matches_root() {
        let receipts: Vec<Vec<u8>> = (0..4u8).map(|i| vec![0x02, i, i]).collect();
        let root = trie::ordered_trie_root(&receipts);
        let raw = make_header_rlp(10, [0u8; 32], root, [0u8; 32]);
        let (header, _) = BlockHeader::decode_rlp(&raw).unwrap();

        let content = Receipts {
            receipts: receipts.clone(),
        };
        content.validate_against(&header).unwrap();
        assert_eq!(Receipts::decode(&content.encode()).unwrap(), content);

        let mut bad = content.clone();
        bad.receipts.pop();
        assert!(bad.validate_against(&header).is_err());
    }

    #[test]
    fn header_with_proof_codec_round_trips() {
        let raw = make_header_rlp(77, [0u8; 32], [0u8; 32], [0u8; 32]);
        let hwp = HeaderWithProof {
            header_rlp: raw.clone(),
            proof: HeaderProof::Accumulator(vec![Hash256::from([9u8; 32]); 15]),
        };
        assert_eq!(HeaderWithProof::decode(&hwp.encode()).unwrap(), hwp);

        let hist = HeaderWithProof {
            header_rlp: raw,
            proof: HeaderProof::HistoricalRoots(HistoricalRootsBlockProof {
                beacon_block_proof: vec![Hash256::from([1u8; 32]); HISTORICAL_ROOTS_PROOF_LEN],
                beacon_block_root: Hash256::from([2u8; 32]),
                execution_block_proof: vec![Hash256::from([3u8; 32]); EXECUTION_BLOCK_PROOF_LEN],
                slot: 5_000_000,
            }),
        };
        assert_eq!(HeaderWithProof::decode(&hist.encode()).unwrap(), hist);
    }
}
