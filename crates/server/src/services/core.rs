//! The build orchestrator and change-gated sync.

use crate::{
    cache::CacheClient,
    datastore::{DataStore, DataStoreError, NewTree, RootRecord},
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::{path::PathBuf, sync::Arc, time::Instant};
use thiserror::Error;
use tokio::sync::RwLock;
use treesnap_core::{walk, Digest, MerkleTree};

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error(transparent)]
    Core(#[from] treesnap_core::Error),

    #[error(transparent)]
    DataStore(#[from] DataStoreError),

    #[error("build task failed: {0}")]
    BuildTask(String),
}

/// The result of one pass through the change gate.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncOutcome {
    pub written: bool,
    pub root_hash: Digest,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub previous_hash: Option<Digest>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
}

/// A snapshot of the most recent build, exposed over the health surface.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LastBuild {
    pub timestamp: DateTime<Utc>,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub root_hash: Option<Digest>,
    pub files_processed: usize,
    pub build_time_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub written: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Wires the walker, builder, and sync together and records the result
/// of every build. Cloning shares the underlying service.
#[derive(Clone)]
pub struct CoreService {
    inner: Arc<Inner>,
}

struct Inner {
    store: Arc<dyn DataStore>,
    cache: CacheClient,
    source_dir: PathBuf,
    batch_limit: Option<usize>,
    last_build: RwLock<Option<LastBuild>>,
}

impl CoreService {
    pub fn new(
        store: Arc<dyn DataStore>,
        cache: CacheClient,
        source_dir: PathBuf,
        batch_limit: Option<usize>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                store,
                cache,
                source_dir,
                batch_limit,
                last_build: RwLock::new(None),
            }),
        }
    }

    pub fn store(&self) -> &Arc<dyn DataStore> {
        &self.inner.store
    }

    pub fn cache(&self) -> &CacheClient {
        &self.inner.cache
    }

    pub fn source_dir(&self) -> &std::path::Path {
        &self.inner.source_dir
    }

    pub async fn last_build(&self) -> Option<LastBuild> {
        self.inner.last_build.read().await.clone()
    }

    /// Walks the source directory, builds the tree, and syncs it through
    /// the change gate, recording the outcome either way. Failures are
    /// returned to the caller (the scheduler logs and continues).
    pub async fn build_and_sync(&self) -> Result<LastBuild, ServiceError> {
        let started = Instant::now();
        let result = self.run_build().await;

        let last_build = match &result {
            Ok((outcome, files_processed)) => LastBuild {
                timestamp: Utc::now(),
                success: true,
                root_hash: Some(outcome.root_hash.clone()),
                files_processed: *files_processed,
                build_time_ms: started.elapsed().as_millis() as u64,
                written: Some(outcome.written),
                error: None,
            },
            Err(e) => LastBuild {
                timestamp: Utc::now(),
                success: false,
                root_hash: None,
                files_processed: 0,
                build_time_ms: started.elapsed().as_millis() as u64,
                written: None,
                error: Some(e.to_string()),
            },
        };

        *self.inner.last_build.write().await = Some(last_build.clone());
        self.inner.cache.set_build_status(&last_build).await;

        result.map(|_| last_build)
    }

    async fn run_build(&self) -> Result<(SyncOutcome, usize), ServiceError> {
        let source_dir = self.inner.source_dir.clone();
        std::fs::metadata(&source_dir).map_err(|source| treesnap_core::Error::Io {
            path: source_dir.clone(),
            source,
        })?;

        // Walking and hashing are blocking filesystem work; keep them off
        // the runtime workers.
        let batch_limit = self.inner.batch_limit;
        let (tree, files_processed, truncated) = tokio::task::spawn_blocking(
            move || -> Result<(MerkleTree, usize, bool), treesnap_core::Error> {
                let walk = walk::walk_with_limit(&source_dir, batch_limit)?;
                let files_processed = walk.files.len();
                let tree = MerkleTree::from_files(walk.files)?;
                Ok((tree, files_processed, walk.truncated))
            },
        )
        .await
        .map_err(|e| ServiceError::BuildTask(e.to_string()))??;

        if truncated {
            tracing::warn!(
                limit = ?self.inner.batch_limit,
                "batch limit truncated the walk; the tree covers only the first entries"
            );
        }

        tracing::info!(
            files = files_processed,
            root = %tree.root_hash(),
            "built tree from source directory"
        );

        let outcome = self
            .sync_tree(&tree, &self.inner.source_dir.to_string_lossy())
            .await?;
        Ok((outcome, files_processed))
    }

    /// Commits the tree only when its root differs from the latest
    /// committed root. The latest root is read through the cache; on a
    /// miss the data store answers and the cache is repopulated. A data
    /// store failure propagates and leaves the cache untouched, so the
    /// cache never advertises a root the store has not accepted.
    pub async fn sync_tree(
        &self,
        tree: &MerkleTree,
        source_path: &str,
    ) -> Result<SyncOutcome, ServiceError> {
        let root = tree.root_hash();

        let latest = match self.inner.cache.latest_root().await {
            Some(cached) => Some(cached),
            None => {
                let stored = self.inner.store.latest_root_hash().await?;
                if let Some(stored) = &stored {
                    self.inner.cache.set_latest_root(stored).await;
                }
                stored
            }
        };

        if latest.as_ref() == Some(root) {
            tracing::info!(root = %root, "tree unchanged; skipping commit");
            return Ok(SyncOutcome {
                written: false,
                root_hash: root.clone(),
                previous_hash: latest,
                reason: Some("unchanged"),
                id: None,
            });
        }

        let body = tree.to_body();
        let stored = self
            .inner
            .store
            .store_tree(NewTree {
                root_hash: root,
                body: &body,
                item_count: tree.leaf_count() as u64,
                source_path,
            })
            .await?;

        self.inner.cache.set_latest_root(root).await;
        self.inner
            .cache
            .set_tree_metadata(
                root,
                &RootRecord {
                    root_hash: root.clone(),
                    item_count: tree.leaf_count() as u64,
                    source_path: source_path.to_string(),
                    created_at: Utc::now(),
                },
            )
            .await;

        tracing::info!(root = %root, id = %stored.id, "committed new tree");
        Ok(SyncOutcome {
            written: true,
            root_hash: root.clone(),
            previous_hash: latest,
            reason: None,
            id: Some(stored.id),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        cache::{CacheClient, CacheConfig},
        datastore::{
            ConnectionStatus, MemoryDataStore, StoreStats, StoredTree, TreeRecord,
        },
    };
    use std::sync::atomic::{AtomicBool, Ordering};

    async fn service_over(dir: &std::path::Path, store: Arc<dyn DataStore>) -> CoreService {
        let cache = CacheClient::connect(&CacheConfig::default()).await;
        CoreService::new(store, cache, dir.to_path_buf(), None)
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn change_gate_writes_once() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.txt"), "a").unwrap();
        std::fs::write(dir.path().join("b.txt"), "b").unwrap();

        let store = Arc::new(MemoryDataStore::default());
        let service = service_over(dir.path(), store.clone()).await;

        let first = service.build_and_sync().await.unwrap();
        assert!(first.success);
        assert_eq!(first.written, Some(true));
        assert_eq!(first.files_processed, 2);

        let second = service.build_and_sync().await.unwrap();
        assert_eq!(second.written, Some(false));
        assert_eq!(second.root_hash, first.root_hash);

        // Exactly one commit across the two runs.
        let stats = store.stats().await.unwrap();
        assert_eq!(stats.total_trees, 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn changed_content_produces_a_new_commit() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.txt"), "a").unwrap();

        let store = Arc::new(MemoryDataStore::default());
        let service = service_over(dir.path(), store.clone()).await;

        let first = service.build_and_sync().await.unwrap();
        std::fs::write(dir.path().join("b.txt"), "b").unwrap();
        let second = service.build_and_sync().await.unwrap();

        assert_ne!(first.root_hash, second.root_hash);
        assert_eq!(store.stats().await.unwrap().total_trees, 2);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn renaming_a_file_changes_the_root_through_leaf_order() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.txt"), "1").unwrap();
        std::fs::write(dir.path().join("b.txt"), "2").unwrap();

        let store = Arc::new(MemoryDataStore::default());
        let service = service_over(dir.path(), store.clone()).await;
        let first = service.build_and_sync().await.unwrap();

        // Same contents, but the rename reorders the sorted walk, which
        // reorders the leaves.
        std::fs::rename(dir.path().join("a.txt"), dir.path().join("z.txt")).unwrap();
        let second = service.build_and_sync().await.unwrap();

        assert_ne!(first.root_hash, second.root_hash);
        assert_eq!(second.written, Some(true));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn empty_directory_fails_the_build_and_records_it() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryDataStore::default());
        let service = service_over(dir.path(), store).await;

        let err = service.build_and_sync().await.unwrap_err();
        assert!(matches!(
            err,
            ServiceError::Core(treesnap_core::Error::Empty)
        ));

        let last = service.last_build().await.unwrap();
        assert!(!last.success);
        assert!(last.error.is_some());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn missing_directory_is_an_io_error() {
        let store = Arc::new(MemoryDataStore::default());
        let service = service_over(
            std::path::Path::new("/nonexistent/treesnap-test"),
            store,
        )
        .await;
        let err = service.build_and_sync().await.unwrap_err();
        assert!(matches!(
            err,
            ServiceError::Core(treesnap_core::Error::Io { .. })
        ));
    }

    /// A store that can be told to fail writes, for exercising the
    /// cache-untouched-on-failure contract.
    struct FailingStore {
        inner: MemoryDataStore,
        fail_writes: AtomicBool,
    }

    #[axum::async_trait]
    impl DataStore for FailingStore {
        async fn latest_root_hash(&self) -> Result<Option<Digest>, DataStoreError> {
            self.inner.latest_root_hash().await
        }

        async fn store_tree(&self, new: NewTree<'_>) -> Result<StoredTree, DataStoreError> {
            if self.fail_writes.load(Ordering::SeqCst) {
                return Err(DataStoreError::Backend("write refused".to_string()));
            }
            self.inner.store_tree(new).await
        }

        async fn tree_by_root_hash(
            &self,
            root: &Digest,
        ) -> Result<Option<TreeRecord>, DataStoreError> {
            self.inner.tree_by_root_hash(root).await
        }

        async fn recent_roots(&self, limit: usize) -> Result<Vec<RootRecord>, DataStoreError> {
            self.inner.recent_roots(limit).await
        }

        async fn test_connection(&self) -> ConnectionStatus {
            self.inner.test_connection().await
        }

        async fn stats(&self) -> Result<StoreStats, DataStoreError> {
            self.inner.stats().await
        }

        fn kind(&self) -> &'static str {
            "memory"
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn store_failure_propagates_and_then_recovers() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.txt"), "a").unwrap();

        let store = Arc::new(FailingStore {
            inner: MemoryDataStore::default(),
            fail_writes: AtomicBool::new(true),
        });
        let service = service_over(dir.path(), store.clone()).await;

        let err = service.build_and_sync().await.unwrap_err();
        assert!(matches!(err, ServiceError::DataStore(_)));

        // Once the store accepts writes again the same tree commits.
        store.fail_writes.store(false, Ordering::SeqCst);
        let ok = service.build_and_sync().await.unwrap();
        assert_eq!(ok.written, Some(true));
    }
}
