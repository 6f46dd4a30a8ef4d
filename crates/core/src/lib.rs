//! Merkle tree primitives shared by the treesnap service and CLI.
//!
//! The building blocks are deliberately small: [`hash`] produces lowercase
//! hex SHA-256 digests, [`walk`] enumerates a directory deterministically,
//! [`tree`] assembles the digests into a Merkle tree, and [`proof`]
//! generates and verifies inclusion proofs against a known root.

use std::{io, path::PathBuf};
use thiserror::Error;

pub mod hash;
pub mod proof;
pub mod tree;
pub mod walk;

pub use hash::{hash_bytes, hash_file, Digest};
pub use proof::{Position, Proof, ProofStep};
pub use tree::{LeafSource, MerkleTree, Node, NodeId, NodeKind, TreeBody};

#[derive(Debug, Error)]
pub enum Error {
    #[error("failed to read `{path}`")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("no input items to build a tree from")]
    Empty,

    #[error("`{0}` is not a leaf of this tree")]
    LeafNotFound(Digest),
}
