//! Merkle tree construction.
//!
//! Leaf hashes are content hashes; an interior hash is the SHA-256 of its
//! children's hex digests concatenated left-then-right with no separator.
//! When a level has odd cardinality the final node is paired with itself,
//! so the parent's hash covers the same digest twice. Leaves and interior
//! nodes are not domain-separated: roots stay compatible with trees
//! produced by existing deployments, but an interior digest could in
//! principle be replayed as a leaf by a second-preimage attacker that
//! controls leaf contents.

use crate::{
    hash::{hash_bytes, hash_file},
    Digest, Error,
};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Index of a node within a tree's arena.
pub type NodeId = usize;

/// What a leaf was hashed from.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LeafSource {
    /// A raw data block.
    Data(String),
    /// A file path; the leaf hash is the file's content hash.
    File(PathBuf),
}

impl LeafSource {
    fn display(&self) -> String {
        match self {
            Self::Data(block) => block.clone(),
            Self::File(path) => path.display().to_string(),
        }
    }
}

#[derive(Clone, Debug)]
pub enum NodeKind {
    Leaf { source: LeafSource },
    Interior { left: NodeId, right: NodeId },
}

#[derive(Clone, Debug)]
pub struct Node {
    hash: Digest,
    kind: NodeKind,
}

impl Node {
    pub fn hash(&self) -> &Digest {
        &self.hash
    }

    pub fn kind(&self) -> &NodeKind {
        &self.kind
    }
}

/// A bottom-up binary Merkle tree.
///
/// Nodes live in an arena addressed by dense [`NodeId`]s; interior nodes
/// reference their children by index and never own them. The per-level
/// index ([`MerkleTree::levels`]) and the root see the same node
/// identities, which is what proof generation walks.
#[derive(Clone, Debug)]
pub struct MerkleTree {
    nodes: Vec<Node>,
    levels: Vec<Vec<NodeId>>,
    root_id: NodeId,
    leaf_count: usize,
}

impl MerkleTree {
    /// Builds a tree from raw data blocks, in order.
    pub fn from_data<I>(items: I) -> Result<Self, Error>
    where
        I: IntoIterator,
        I::Item: Into<String>,
    {
        let leaves = items
            .into_iter()
            .map(|item| {
                let block = item.into();
                Node {
                    hash: hash_bytes(&block),
                    kind: NodeKind::Leaf {
                        source: LeafSource::Data(block),
                    },
                }
            })
            .collect();
        Self::from_leaves(leaves)
    }

    /// Builds a tree from file contents, in the order the paths are given.
    pub fn from_files<I>(paths: I) -> Result<Self, Error>
    where
        I: IntoIterator,
        I::Item: Into<PathBuf>,
    {
        let mut leaves = Vec::new();
        for path in paths {
            let path = path.into();
            let hash = hash_file(&path)?;
            leaves.push(Node {
                hash,
                kind: NodeKind::Leaf {
                    source: LeafSource::File(path),
                },
            });
        }
        Self::from_leaves(leaves)
    }

    fn from_leaves(leaves: Vec<Node>) -> Result<Self, Error> {
        if leaves.is_empty() {
            return Err(Error::Empty);
        }

        let leaf_count = leaves.len();
        let mut nodes = leaves;
        let mut levels = Vec::new();
        let mut current: Vec<NodeId> = (0..leaf_count).collect();

        while current.len() > 1 {
            let mut next = Vec::with_capacity(current.len().div_ceil(2));
            for pair in current.chunks(2) {
                let left = pair[0];
                // Odd tail: the final node pairs with itself.
                let right = pair.get(1).copied().unwrap_or(left);
                let hash = hash_bytes(format!(
                    "{left}{right}",
                    left = nodes[left].hash,
                    right = nodes[right].hash
                ));
                nodes.push(Node {
                    hash,
                    kind: NodeKind::Interior { left, right },
                });
                next.push(nodes.len() - 1);
            }
            levels.push(current);
            current = next;
        }

        let root_id = current[0];
        levels.push(current);

        Ok(Self {
            nodes,
            levels,
            root_id,
            leaf_count,
        })
    }

    pub fn node(&self, id: NodeId) -> &Node {
        &self.nodes[id]
    }

    pub fn root(&self) -> &Node {
        &self.nodes[self.root_id]
    }

    pub fn root_hash(&self) -> &Digest {
        &self.nodes[self.root_id].hash
    }

    /// Node ids per level; level 0 is the leaves, the last level is the root.
    pub fn levels(&self) -> &[Vec<NodeId>] {
        &self.levels
    }

    pub fn depth(&self) -> usize {
        self.levels.len()
    }

    pub fn leaf_count(&self) -> usize {
        self.leaf_count
    }

    /// Serializes the tree as a root-recursive body.
    ///
    /// Subtrees below a duplicated odd-tail node are emitted once per
    /// reference, matching the JSON shape consumers already parse.
    pub fn to_body(&self) -> TreeBody {
        self.body_of(self.root_id)
    }

    fn body_of(&self, id: NodeId) -> TreeBody {
        let node = &self.nodes[id];
        match &node.kind {
            NodeKind::Leaf { source } => TreeBody {
                hash: node.hash.clone(),
                source: Some(source.display()),
                left: None,
                right: None,
            },
            NodeKind::Interior { left, right } => TreeBody {
                hash: node.hash.clone(),
                source: None,
                left: Some(Box::new(self.body_of(*left))),
                right: Some(Box::new(self.body_of(*right))),
            },
        }
    }
}

/// The serialized form of a tree: each node carries its hash, leaves their
/// source, and interior nodes their two children.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct TreeBody {
    pub hash: Digest,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub left: Option<Box<TreeBody>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub right: Option<Box<TreeBody>>,
}
