//! # Keccak Merkle Tree
//!
//! Binary Merkle tree over Keccak-256 leaves. A bulletin's `sigma_mkl_root`
//! is the root of this tree over the per-item leaf hashes, and buyers check
//! every decrypted item against it with an inclusion proof.
//!
//! Odd levels duplicate their last node. Internal nodes are
//! `keccak256(left ‖ right)`.

use ethers::types::H256;
use serde::{Deserialize, Serialize};

use super::hash::keccak256;

/// A fully materialized Merkle tree. `levels[0]` holds the leaves.
#[derive(Clone, Debug)]
pub struct MerkleTree {
    levels: Vec<Vec<H256>>,
}

/// Sibling path from a leaf to the root.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MerkleProof {
    pub index: u64,
    pub siblings: Vec<H256>,
}

fn parent(left: &H256, right: &H256) -> H256 {
    let mut buf = [0u8; 64];
    buf[..32].copy_from_slice(left.as_bytes());
    buf[32..].copy_from_slice(right.as_bytes());
    H256(keccak256(buf))
}

/// Leaf hash of an item's plaintext bytes.
pub fn leaf_hash(item: &[u8]) -> H256 {
    H256(keccak256(item))
}

impl MerkleTree {
    /// Build a tree from leaf hashes. An empty input yields the zero root.
    pub fn from_leaves(leaves: Vec<H256>) -> Self {
        let mut levels = vec![leaves];
        while levels.last().map_or(false, |l| l.len() > 1) {
            let below = &levels[levels.len() - 1];
            let next = below
                .chunks(2)
                .map(|pair| parent(&pair[0], pair.get(1).unwrap_or(&pair[0])))
                .collect();
            levels.push(next);
        }
        Self { levels }
    }

    /// Build a tree directly from item contents.
    pub fn from_items<'a>(items: impl IntoIterator<Item = &'a [u8]>) -> Self {
        Self::from_leaves(items.into_iter().map(leaf_hash).collect())
    }

    pub fn root(&self) -> H256 {
        self.levels
            .last()
            .and_then(|l| l.first())
            .copied()
            .unwrap_or_default()
    }

    pub fn leaf_count(&self) -> usize {
        self.levels[0].len()
    }

    /// Inclusion proof for leaf `index`, or `None` if out of range.
    pub fn proof(&self, index: usize) -> Option<MerkleProof> {
        if index >= self.leaf_count() {
            return None;
        }
        let mut siblings = Vec::with_capacity(self.levels.len());
        let mut i = index;
        for level in &self.levels[..self.levels.len() - 1] {
            let sibling = if i % 2 == 0 {
                level.get(i + 1).unwrap_or(&level[i])
            } else {
                &level[i - 1]
            };
            siblings.push(*sibling);
            i /= 2;
        }
        Some(MerkleProof {
            index: index as u64,
            siblings,
        })
    }
}

impl MerkleProof {
    /// Fold the proof over `leaf` and compare with `root`.
    pub fn verify(&self, leaf: H256, root: H256) -> bool {
        let mut acc = leaf;
        let mut i = self.index;
        for sibling in &self.siblings {
            acc = if i % 2 == 0 {
                parent(&acc, sibling)
            } else {
                parent(sibling, &acc)
            };
            i /= 2;
        }
        acc == root
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn items(n: usize) -> Vec<Vec<u8>> {
        (0..n).map(|i| format!("item-{i}").into_bytes()).collect()
    }

    #[test]
    fn single_leaf_root_is_the_leaf() {
        let tree = MerkleTree::from_items([b"only".as_slice()]);
        assert_eq!(tree.root(), leaf_hash(b"only"));
        let proof = tree.proof(0).unwrap();
        assert!(proof.siblings.is_empty());
        assert!(proof.verify(leaf_hash(b"only"), tree.root()));
    }

    #[test]
    fn every_leaf_proves_against_the_root() {
        for n in [2, 3, 5, 8, 13] {
            let data = items(n);
            let tree = MerkleTree::from_items(data.iter().map(|v| v.as_slice()));
            for (i, item) in data.iter().enumerate() {
                let proof = tree.proof(i).unwrap();
                assert!(proof.verify(leaf_hash(item), tree.root()), "n={n} i={i}");
            }
            assert!(tree.proof(n).is_none());
        }
    }

    #[test]
    fn altered_item_fails_its_proof() {
        let data = items(6);
        let tree = MerkleTree::from_items(data.iter().map(|v| v.as_slice()));
        let proof = tree.proof(4).unwrap();
        assert!(!proof.verify(leaf_hash(b"item-x"), tree.root()));
    }

    #[test]
    fn empty_tree_has_zero_root() {
        let tree = MerkleTree::from_leaves(vec![]);
        assert_eq!(tree.root(), H256::zero());
        assert_eq!(tree.leaf_count(), 0);
    }
}
