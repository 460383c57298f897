//! Generalized-index single proofs over SSZ merkle trees.
//!
//! Roots and node hashing come from `tree_hash`; this module only adds what
//! that crate does not carry: extracting the sibling branch for one leaf
//! and walking a branch along a generalized index.

use tree_hash::{Hash256, merkle_root};

/// Parent of two tree nodes.
pub fn hash_pair(left: &Hash256, right: &Hash256) -> Hash256 {
    let mut buf = [0u8; 64];
    buf[..32].copy_from_slice(left.as_slice());
    buf[32..].copy_from_slice(right.as_slice());
    merkle_root(&buf, 0)
}

/// Root of the all-zero subtree of the given height.
pub fn zero_subtree_root(height: usize) -> Hash256 {
    let mut node = Hash256::ZERO;
    for _ in 0..height {
        node = hash_pair(&node, &node);
    }
    node
}

/// Root of `leaves` in a zero-padded tree of the given depth. Agrees with
/// `tree_hash::merkleize_padded` over the packed leaves.
pub fn padded_root(leaves: &[Hash256], depth: usize) -> Hash256 {
    let mut packed = Vec::with_capacity(leaves.len() * 32);
    for leaf in leaves {
        packed.extend_from_slice(leaf.as_slice());
    }
    tree_hash::merkleize_padded(&packed, 1 << depth)
}

/// Sibling branch for `index` among `leaves` in a zero-padded tree of the
/// given depth, ordered leaf to root. Verifies at `gindex = 2^depth + index`.
pub fn build_branch(leaves: &[Hash256], depth: usize, index: usize) -> Vec<Hash256> {
    assert!(index < 1 << depth, "leaf index outside the tree");
    let mut branch = Vec::with_capacity(depth);
    let mut level: Vec<Hash256> = leaves.to_vec();
    let mut position = index;
    for height in 0..depth {
        let zero = zero_subtree_root(height);
        if level.len() % 2 == 1 {
            level.push(zero);
        }
        branch.push(*level.get(position ^ 1).unwrap_or(&zero));
        level = level
            .chunks_exact(2)
            .map(|pair| hash_pair(&pair[0], &pair[1]))
            .collect();
        if level.is_empty() {
            level.push(zero_subtree_root(height + 1));
        }
        position /= 2;
    }
    branch
}

/// Verifies a single-leaf branch. `branch` holds the sibling of every node
/// on the path from the leaf up to the child of the root; `gindex` is the
/// generalized index of the leaf, so the branch length must match its
/// depth.
pub fn verify_branch(leaf: &Hash256, branch: &[Hash256], gindex: u64, root: &Hash256) -> bool {
    let depth = branch.len() as u32;
    if depth >= 64 || (gindex >> depth) != 1 {
        return false;
    }
    let mut node = *leaf;
    let mut index = gindex;
    for witness in branch {
        node = if index & 1 == 1 {
            hash_pair(witness, &node)
        } else {
            hash_pair(&node, witness)
        };
        index >>= 1;
    }
    node == *root
}

#[cfg(test)]
mod tests {
    use super::*;

    fn leaf(byte: u8) -> Hash256 {
        Hash256::from([byte; 32])
    }

    #[test]
    fn padded_root_of_empty_tree_is_the_zero_subtree() {
        assert_eq!(padded_root(&[], 4), zero_subtree_root(4));
    }

    #[test]
    fn padded_root_matches_manual_pairing() {
        let l = leaf(1);
        let expected = {
            let l1 = hash_pair(&l, &zero_subtree_root(0));
            let l2 = hash_pair(&l1, &zero_subtree_root(1));
            hash_pair(&l2, &zero_subtree_root(2))
        };
        assert_eq!(padded_root(&[l], 3), expected);
    }

    #[test]
    fn branches_verify_for_every_index() {
        let leaves: Vec<Hash256> = (0..11u8).map(leaf).collect();
        let depth = 4;
        let root = padded_root(&leaves, depth);
        for (i, l) in leaves.iter().enumerate() {
            let branch = build_branch(&leaves, depth, i);
            let gindex = (1u64 << depth) + i as u64;
            assert!(verify_branch(l, &branch, gindex, &root));
        }
    }

    #[test]
    fn tampered_witness_fails() {
        let leaves: Vec<Hash256> = (0..8u8).map(leaf).collect();
        let root = padded_root(&leaves, 3);
        let mut branch = build_branch(&leaves, 3, 2);
        assert!(verify_branch(&leaves[2], &branch, 8 + 2, &root));
        branch[2].0[31] ^= 0x01;
        assert!(!verify_branch(&leaves[2], &branch, 8 + 2, &root));
    }

    #[test]
    fn wrong_gindex_fails() {
        let leaves: Vec<Hash256> = (0..8u8).map(leaf).collect();
        let root = padded_root(&leaves, 3);
        let branch = build_branch(&leaves, 3, 2);
        assert!(!verify_branch(&leaves[2], &branch, 8 + 3, &root));
        // Branch length must match the generalized index depth.
        assert!(!verify_branch(&leaves[2], &branch, 4 + 2, &root));
    }
}
