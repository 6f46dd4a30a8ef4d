//! The treesnap offline Merkle tree builder and proof utility.

pub mod commands;
