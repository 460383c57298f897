//! The pre-merge header accumulator and the post-merge historical-roots
//! vector, together with the inclusion proofs that gate header ingestion.
//!
//! An epoch accumulator is the SSZ list of up to 8192 `(block_hash,
//! total_difficulty)` records covering one epoch. With the record pair and
//! the list-length mixin, the block-hash leaf of record `i` sits at
//! generalized index `2^15 + 2i`, which makes a header proof exactly 15
//! witnesses deep.

use crate::error::{StoreError, StoreResult};
use crate::proof;
use alloy_primitives::{B256, U256};
use portal_wire::constants::EPOCH_SIZE;
use ssz::{Decode, Encode};
use ssz_derive::{Decode, Encode};
use tree_hash::{Hash256, MerkleHasher, TreeHash, mix_in_length};
use tree_hash_derive::TreeHash;

/// Witness count of an epoch-accumulator single proof: 1 (record pair) +
/// 13 (record tree) + 1 (length mixin).
pub const ACCUMULATOR_PROOF_LEN: usize = 15;

/// Depth of the record tree (8192 records).
const RECORD_TREE_DEPTH: usize = 13;

/// Witness count of the beacon-block half of a historical-roots proof:
/// 13 (block_roots tree) + 1 (pairing with state_roots).
pub const HISTORICAL_ROOTS_PROOF_LEN: usize = 14;

/// Witness count of the execution-block-hash branch inside a bellatrix
/// beacon block.
pub const EXECUTION_BLOCK_PROOF_LEN: usize = 11;

/// Generalized index of `body.execution_payload.block_hash` in a bellatrix
/// `BeaconBlock`.
pub const EXECUTION_BLOCK_HASH_GINDEX: u64 = 3228;

#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode, TreeHash)]
pub struct HeaderRecord {
    pub block_hash: B256,
    pub total_difficulty: U256,
}

/// One epoch of header records, at most 8192.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EpochAccumulator {
    pub records: Vec<HeaderRecord>,
}

impl TreeHash for EpochAccumulator {
    fn tree_hash_type() -> tree_hash::TreeHashType {
        tree_hash::TreeHashType::List
    }

    fn tree_hash_packed_encoding(&self) -> tree_hash::PackedEncoding {
        unreachable!("List should never be packed.")
    }

    fn tree_hash_packing_factor() -> usize {
        unreachable!("List should never be packed.")
    }

    fn tree_hash_root(&self) -> Hash256 {
        let mut hasher = MerkleHasher::with_leaves(EPOCH_SIZE as usize);
        for record in &self.records {
            hasher
                .write(record.tree_hash_root().as_slice())
                .expect("record count is bounded by the epoch size");
        }
        let root = hasher
            .finish()
            .expect("record count is bounded by the epoch size");
        mix_in_length(&root, self.records.len())
    }
}

impl EpochAccumulator {
    pub fn new(records: Vec<HeaderRecord>) -> StoreResult<Self> {
        if records.len() > EPOCH_SIZE as usize {
            return Err(StoreError::MalformedContent("epoch accumulator too long"));
        }
        Ok(Self { records })
    }

    pub fn hash_tree_root(&self) -> Hash256 {
        self.tree_hash_root()
    }

    /// Builds the 15-witness proof for the block-hash leaf of `index`: the
    /// record's difficulty leaf, the record-tree branch, and the length
    /// mixin.
    pub fn generate_inclusion_proof(&self, index: usize) -> StoreResult<Vec<Hash256>> {
        let record = self
            .records
            .get(index)
            .ok_or(StoreError::MalformedContent("record index out of range"))?;
        let mut branch = Vec::with_capacity(ACCUMULATOR_PROOF_LEN);
        branch.push(record.total_difficulty.tree_hash_root());

        let roots: Vec<Hash256> = self.records.iter().map(HeaderRecord::tree_hash_root).collect();
        branch.extend(proof::build_branch(&roots, RECORD_TREE_DEPTH, index));

        let mut length_leaf = Hash256::ZERO;
        length_leaf.0[..8].copy_from_slice(&(self.records.len() as u64).to_le_bytes());
        branch.push(length_leaf);
        Ok(branch)
    }

    /// SSZ encoding: fixed 64-byte records, concatenated.
    pub fn encode(&self) -> Vec<u8> {
        self.records.as_ssz_bytes()
    }

    pub fn decode(buf: &[u8]) -> StoreResult<Self> {
        let records = Vec::<HeaderRecord>::from_ssz_bytes(buf).map_err(StoreError::from_ssz)?;
        Self::new(records)
    }
}

/// Generalized index of the block-hash leaf for `block_number` within its
/// epoch accumulator.
pub fn accumulator_gindex(block_number: u64) -> u64 {
    let leaf_index = (block_number % EPOCH_SIZE) * 2;
    (1u64 << ACCUMULATOR_PROOF_LEN) | leaf_index
}

/// The baked-in list of historical epoch accumulator roots covering
/// pre-merge history.
#[derive(Debug, Clone, Default)]
pub struct MasterAccumulator {
    pub epoch_roots: Vec<Hash256>,
}

impl MasterAccumulator {
    pub fn new(epoch_roots: Vec<Hash256>) -> Self {
        Self { epoch_roots }
    }

    pub fn epoch_root(&self, epoch_index: u64) -> StoreResult<&Hash256> {
        self.epoch_roots
            .get(epoch_index as usize)
            .ok_or(StoreError::UnknownEpoch(epoch_index))
    }

    /// Verifies a 15-witness accumulator proof for a header hash.
    pub fn verify_header_proof(
        &self,
        block_number: u64,
        block_hash: &Hash256,
        branch: &[Hash256],
    ) -> StoreResult<()> {
        let root = self.epoch_root(block_number / EPOCH_SIZE)?;
        let gindex = accumulator_gindex(block_number);
        if proof::verify_branch(block_hash, branch, gindex, root) {
            Ok(())
        } else {
            Err(StoreError::InvalidProof)
        }
    }

    /// Whether an epoch accumulator's own root is one of ours.
    pub fn contains_epoch_root(&self, root: &Hash256) -> bool {
        self.epoch_roots.iter().any(|r| r == root)
    }
}

/// Proof that a post-merge, pre-Capella execution header belongs to a
/// beacon block recorded in `historical_roots`.
#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub struct HistoricalRootsBlockProof {
    /// Branch from the beacon block root up through the historical batch.
    pub beacon_block_proof: Vec<Hash256>,
    pub beacon_block_root: Hash256,
    /// Branch from the execution block hash into the beacon block root.
    pub execution_block_proof: Vec<Hash256>,
    pub slot: u64,
}

/// The baked-in historical_roots vector (one root per 8192-slot period).
#[derive(Debug, Clone, Default)]
pub struct HistoricalRoots {
    pub roots: Vec<Hash256>,
}

impl HistoricalRoots {
    pub fn new(roots: Vec<Hash256>) -> Self {
        Self { roots }
    }

    pub fn verify(
        &self,
        execution_block_hash: &Hash256,
        block_proof: &HistoricalRootsBlockProof,
    ) -> StoreResult<()> {
        // First leg: the execution block hash sits inside the beacon block.
        if !proof::verify_branch(
            execution_block_hash,
            &block_proof.execution_block_proof,
            EXECUTION_BLOCK_HASH_GINDEX,
            &block_proof.beacon_block_root,
        ) {
            return Err(StoreError::InvalidProof);
        }
        // Second leg: the beacon block root is in the period's batch.
        let period = block_proof.slot / portal_wire::constants::SLOTS_PER_HISTORICAL_ROOT;
        let root = self
            .roots
            .get(period as usize)
            .ok_or(StoreError::UnknownPeriod(period))?;
        let gindex = (1u64 << HISTORICAL_ROOTS_PROOF_LEN)
            | (block_proof.slot % portal_wire::constants::SLOTS_PER_HISTORICAL_ROOT);
        if proof::verify_branch(
            &block_proof.beacon_block_root,
            &block_proof.beacon_block_proof,
            gindex,
            root,
        ) {
            Ok(())
        } else {
            Err(StoreError::InvalidProof)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_accumulator(n: usize) -> EpochAccumulator {
        let records = (0..n)
            .map(|i| {
                let mut hash = [0u8; 32];
                hash[..8].copy_from_slice(&(i as u64).to_be_bytes());
                HeaderRecord {
                    block_hash: B256::from(hash),
                    total_difficulty: U256::from(1000u64 + i as u64),
                }
            })
            .collect();
        EpochAccumulator::new(records).unwrap()
    }

    #[test]
    fn inclusion_proofs_round_trip() {
        let acc = sample_accumulator(100);
        let master = MasterAccumulator::new(vec![acc.hash_tree_root()]);
        for block_number in [0u64, 1, 42, 99] {
            let branch = acc.generate_inclusion_proof(block_number as usize).unwrap();
            assert_eq!(branch.len(), ACCUMULATOR_PROOF_LEN);
            let hash = acc.records[block_number as usize].block_hash;
            master
                .verify_header_proof(block_number, &hash, &branch)
                .unwrap();
        }
    }

    #[test]
    fn tampered_witness_is_rejected() {
        let acc = sample_accumulator(50);
        let master = MasterAccumulator::new(vec![acc.hash_tree_root()]);
        let mut branch = acc.generate_inclusion_proof(7).unwrap();
        let hash = acc.records[7].block_hash;
        master.verify_header_proof(7, &hash, &branch).unwrap();

        // Flip one byte of the last witness.
        branch[ACCUMULATOR_PROOF_LEN - 1].0[31] ^= 0x01;
        assert!(matches!(
            master.verify_header_proof(7, &hash, &branch),
            Err(StoreError::InvalidProof)
        ));
    }

    #[test]
    fn wrong_block_number_is_rejected() {
        let acc = sample_accumulator(50);
        let master = MasterAccumulator::new(vec![acc.hash_tree_root()]);
        let branch = acc.generate_inclusion_proof(7).unwrap();
        let hash = acc.records[7].block_hash;
        assert!(matches!(
            master.verify_header_proof(8, &hash, &branch),
            Err(StoreError::InvalidProof)
        ));
    }

    #[test]
    fn truncated_branch_is_rejected() {
        let acc = sample_accumulator(20);
        let master = MasterAccumulator::new(vec![acc.hash_tree_root()]);
        let branch = acc.generate_inclusion_proof(3).unwrap();
        let hash = acc.records[3].block_hash;
        assert!(matches!(
            master.verify_header_proof(3, &hash, &branch[..14]),
            Err(StoreError::InvalidProof)
        ));
    }

    #[test]
    fn second_epoch_uses_its_own_root() {
        let acc0 = sample_accumulator(EPOCH_SIZE as usize);
        let acc1 = sample_accumulator(10);
        let master =
            MasterAccumulator::new(vec![acc0.hash_tree_root(), acc1.hash_tree_root()]);
        let block_number = EPOCH_SIZE + 3;
        let branch = acc1.generate_inclusion_proof(3).unwrap();
        let hash = acc1.records[3].block_hash;
        master
            .verify_header_proof(block_number, &hash, &branch)
            .unwrap();
    }

    #[test]
    fn unknown_epoch_is_a_typed_error() {
        let master = MasterAccumulator::default();
        let branch = vec![Hash256::ZERO; ACCUMULATOR_PROOF_LEN];
        assert!(matches!(
            master.verify_header_proof(0, &Hash256::ZERO, &branch),
            Err(StoreError::UnknownEpoch(0))
        ));
    }

    #[test]
    fn accumulator_encoding_round_trips() {
        let acc = sample_accumulator(12);
        let decoded = EpochAccumulator::decode(&acc.encode()).unwrap();
        assert_eq!(decoded, acc);
        assert_eq!(decoded.hash_tree_root(), acc.hash_tree_root());
    }

    #[test]
    fn historical_roots_proof_round_trips() {
        // Build a beacon block tree where only the execution-hash path is
        // populated, then a block_roots batch containing its root.
        let execution_hash = Hash256::from([0x42u8; 32]);
        let mut node = execution_hash;
        let mut execution_branch = Vec::new();
        let mut gindex = EXECUTION_BLOCK_HASH_GINDEX;
        for i in 0..EXECUTION_BLOCK_PROOF_LEN {
            let sibling = Hash256::from([i as u8 + 1; 32]);
            execution_branch.push(sibling);
            node = if gindex & 1 == 1 {
                proof::hash_pair(&sibling, &node)
            } else {
                proof::hash_pair(&node, &sibling)
            };
            gindex >>= 1;
        }
        let beacon_block_root = node;

        let slot = 4_700_013u64;
        let index = (slot % portal_wire::constants::SLOTS_PER_HISTORICAL_ROOT) as usize;
        let mut block_roots = vec![Hash256::ZERO; 8192];
        block_roots[index] = beacon_block_root;
        let block_roots_root = proof::padded_root(&block_roots, 13);
        let state_roots_root = Hash256::from([0x77u8; 32]);
        let historical_root = proof::hash_pair(&block_roots_root, &state_roots_root);

        let mut beacon_branch = proof::build_branch(&block_roots, 13, index);
        beacon_branch.push(state_roots_root);

        let period = slot / portal_wire::constants::SLOTS_PER_HISTORICAL_ROOT;
        let mut roots = vec![Hash256::ZERO; period as usize + 1];
        roots[period as usize] = historical_root;
        let historical = HistoricalRoots::new(roots);

        let block_proof = HistoricalRootsBlockProof {
            beacon_block_proof: beacon_branch,
            beacon_block_root,
            execution_block_proof: execution_branch,
            slot,
        };
        historical.verify(&execution_hash, &block_proof).unwrap();

        // Any tampering breaks it.
        let mut bad = block_proof.clone();
        bad.execution_block_proof[0].0[0] ^= 0xff;
        assert!(historical.verify(&execution_hash, &bad).is_err());
    }
}
