//! Inclusion proofs.
//!
//! A proof is the ordered list of sibling hashes along the path from a
//! leaf to the root. Verification is a pure reduction over hex strings
//! and never consults the tree or storage.

use crate::{hash::hash_bytes, Digest, Error, MerkleTree};
use serde::{Deserialize, Serialize};

/// The side a sibling sits on relative to the running hash.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Position {
    Left,
    Right,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProofStep {
    pub sibling_hash: Digest,
    pub position: Position,
}

/// An inclusion proof with one step per tree level below the root.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Proof {
    steps: Vec<ProofStep>,
}

impl Proof {
    pub fn steps(&self) -> &[ProofStep] {
        &self.steps
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Reduces `leaf_hash` through the proof and compares the result to
    /// `expected_root`. A sibling at `Position::Left` is concatenated in
    /// front of the running hash, one at `Position::Right` behind it.
    pub fn verify(&self, leaf_hash: &Digest, expected_root: &Digest) -> bool {
        let mut current = leaf_hash.clone();
        for step in &self.steps {
            current = match step.position {
                Position::Left => hash_bytes(format!("{}{}", step.sibling_hash, current)),
                Position::Right => hash_bytes(format!("{}{}", current, step.sibling_hash)),
            };
        }
        &current == expected_root
    }
}

impl MerkleTree {
    /// Generates an inclusion proof for the leaf with the given hash.
    ///
    /// When several leaves share the hash, the proof targets the first.
    pub fn prove(&self, target: &Digest) -> Result<Proof, Error> {
        let levels = self.levels();
        let mut index = levels[0]
            .iter()
            .position(|&id| self.node(id).hash() == target)
            .ok_or_else(|| Error::LeafNotFound(target.clone()))?;

        let mut steps = Vec::with_capacity(levels.len().saturating_sub(1));
        for level in &levels[..levels.len() - 1] {
            let is_right = index % 2 == 1;
            let sibling = if is_right { index - 1 } else { index + 1 };
            // Past the end of an odd level the sibling is the node
            // itself (the duplicate-last pairing).
            let sibling_id = level.get(sibling).copied().unwrap_or(level[index]);

            steps.push(ProofStep {
                sibling_hash: self.node(sibling_id).hash().clone(),
                position: if is_right {
                    Position::Left
                } else {
                    Position::Right
                },
            });
            index /= 2;
        }

        Ok(Proof { steps })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const HASH_A: &str = "ca978112ca1bbdcafac231b39a23dc4da786eff8147c4e72b9807785afee48bb";
    const HASH_B: &str = "3e23e8160039594a33894f6564e1b1348bbd7a0088d42c4acb73eeaed59c009d";
    const HASH_C: &str = "2e7d2c03a9507ae265ecf5b5356885a53393a2029d241394997265a1a25aefc6";

    fn digest(s: &str) -> Digest {
        s.parse().unwrap()
    }

    #[test]
    fn two_block_proof_is_the_sibling() {
        let tree = MerkleTree::from_data(["a", "b"]).unwrap();
        let proof = tree.prove(&digest(HASH_A)).unwrap();

        assert_eq!(
            proof.steps(),
            [ProofStep {
                sibling_hash: digest(HASH_B),
                position: Position::Right,
            }]
        );
        assert!(proof.verify(&digest(HASH_A), tree.root_hash()));

        let altered = hash_bytes("not the root");
        assert!(!proof.verify(&digest(HASH_A), &altered));
    }

    #[test]
    fn odd_tail_proof_walks_the_duplicate() {
        let tree = MerkleTree::from_data(["a", "b", "c"]).unwrap();
        let proof = tree.prove(&digest(HASH_C)).unwrap();

        let level1_left = hash_bytes(format!("{HASH_A}{HASH_B}"));
        assert_eq!(
            proof.steps(),
            [
                ProofStep {
                    sibling_hash: digest(HASH_C),
                    position: Position::Right,
                },
                ProofStep {
                    sibling_hash: level1_left,
                    position: Position::Left,
                },
            ]
        );
        assert!(proof.verify(&digest(HASH_C), tree.root_hash()));
    }

    #[test]
    fn single_leaf_proof_is_empty() {
        let tree = MerkleTree::from_data(["only"]).unwrap();
        let leaf = hash_bytes("only");
        let proof = tree.prove(&leaf).unwrap();
        assert!(proof.is_empty());
        assert!(proof.verify(&leaf, tree.root_hash()));
    }

    #[test]
    fn every_leaf_proves_against_the_root() {
        for n in 1..=17usize {
            let items: Vec<String> = (0..n).map(|i| format!("block-{i}")).collect();
            let tree = MerkleTree::from_data(items.clone()).unwrap();
            for item in &items {
                let leaf = hash_bytes(item);
                let proof = tree.prove(&leaf).unwrap();
                assert_eq!(proof.len(), tree.depth() - 1);
                assert!(
                    proof.verify(&leaf, tree.root_hash()),
                    "proof of {item} in a {n}-leaf tree"
                );
            }
        }
    }

    #[test]
    fn unknown_leaf_is_not_found() {
        let tree = MerkleTree::from_data(["a", "b"]).unwrap();
        assert!(matches!(
            tree.prove(&hash_bytes("missing")),
            Err(Error::LeafNotFound(_))
        ));
    }

    #[test]
    fn steps_serialize_with_sibling_side() {
        let tree = MerkleTree::from_data(["a", "b"]).unwrap();
        let proof = tree.prove(&digest(HASH_A)).unwrap();
        let json = serde_json::to_value(&proof).unwrap();
        assert_eq!(
            json,
            serde_json::json!([{ "siblingHash": HASH_B, "position": "right" }])
        );
    }
}
