//! Durable storage for committed Merkle trees.
//!
//! One contract, selected at startup: the in-memory store (default, also
//! the test suite's backend), the relational store behind the `postgres`
//! feature, and the object store behind the `s3` feature. Backend-specific
//! error shapes never leak through the trait.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use treesnap_core::{Digest, TreeBody};

mod memory;
#[cfg(feature = "postgres")]
mod postgres;
#[cfg(feature = "s3")]
mod s3;

pub use memory::*;
#[cfg(feature = "postgres")]
pub use postgres::*;
#[cfg(feature = "s3")]
pub use s3::*;

#[derive(Debug, Error)]
pub enum DataStoreError {
    #[error("tree data is invalid: {0}")]
    InvalidTree(String),

    #[error("a tree with root `{0}` has already been committed")]
    Conflict(Digest),

    #[error("root `{0}` was not found")]
    RootNotFound(Digest),

    #[error("storage backend error: {0}")]
    Backend(String),

    #[cfg(feature = "postgres")]
    #[error("a connection could not be established to the PostgreSQL server: {0}")]
    ConnectionPool(#[from] diesel_async::pooled_connection::deadpool::PoolError),

    #[cfg(feature = "postgres")]
    #[error(transparent)]
    Diesel(#[from] diesel::result::Error),
}

/// A committed root record. Records are immutable once stored.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RootRecord {
    pub root_hash: Digest,
    pub item_count: u64,
    pub source_path: String,
    pub created_at: DateTime<Utc>,
}

/// The input to [`DataStore::store_tree`].
pub struct NewTree<'a> {
    pub root_hash: &'a Digest,
    pub body: &'a TreeBody,
    pub item_count: u64,
    pub source_path: &'a str,
}

impl NewTree<'_> {
    /// Rejects malformed input before any write is attempted.
    pub fn validate(&self) -> Result<(), DataStoreError> {
        if self.item_count == 0 {
            return Err(DataStoreError::InvalidTree(
                "item count must be greater than zero".to_string(),
            ));
        }
        if &self.body.hash != self.root_hash {
            return Err(DataStoreError::InvalidTree(format!(
                "tree body root `{body}` does not match root hash `{root}`",
                body = self.body.hash,
                root = self.root_hash,
            )));
        }
        Ok(())
    }
}

/// The identity of a newly stored tree.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredTree {
    pub id: String,
    pub root_hash: Digest,
}

/// A root record together with its full tree body.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TreeRecord {
    #[serde(flatten)]
    pub record: RootRecord,
    pub tree: TreeBody,
}

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionStatus {
    pub connected: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ConnectionStatus {
    pub fn connected() -> Self {
        Self {
            connected: true,
            timestamp: Some(Utc::now()),
            error: None,
        }
    }

    pub fn failed(error: impl ToString) -> Self {
        Self {
            connected: false,
            timestamp: None,
            error: Some(error.to_string()),
        }
    }
}

/// Aggregate statistics over all committed trees.
#[derive(Clone, Debug, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreStats {
    pub total_trees: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latest_tree: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub earliest_tree: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub avg_item_count: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_size_bytes: Option<u64>,
}

/// Implemented by storage backends.
#[axum::async_trait]
pub trait DataStore: Send + Sync {
    /// The root hash of the most recently committed tree, if any.
    async fn latest_root_hash(&self) -> Result<Option<Digest>, DataStoreError>;

    /// Atomically stores a root record together with its tree body.
    async fn store_tree(&self, new: NewTree<'_>) -> Result<StoredTree, DataStoreError>;

    /// Fetches a committed tree by its root hash.
    async fn tree_by_root_hash(&self, root: &Digest)
        -> Result<Option<TreeRecord>, DataStoreError>;

    /// The most recent root records, newest first.
    async fn recent_roots(&self, limit: usize) -> Result<Vec<RootRecord>, DataStoreError>;

    /// Probes the backend connection.
    async fn test_connection(&self) -> ConnectionStatus;

    /// Aggregate statistics for the health endpoints.
    async fn stats(&self) -> Result<StoreStats, DataStoreError>;

    /// The variant name reported by the service descriptor.
    fn kind(&self) -> &'static str;
}
