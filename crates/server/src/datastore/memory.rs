use super::{
    ConnectionStatus, DataStore, DataStoreError, NewTree, RootRecord, StoreStats, StoredTree,
    TreeRecord,
};
use chrono::Utc;
use tokio::sync::Mutex;
use treesnap_core::{Digest, TreeBody};

struct Entry {
    id: u64,
    record: RootRecord,
    body: TreeBody,
}

/// An in-memory data store.
///
/// The default backend for local runs and the test suite; nothing
/// survives a restart.
#[derive(Default)]
pub struct MemoryDataStore {
    entries: Mutex<Vec<Entry>>,
}

#[axum::async_trait]
impl DataStore for MemoryDataStore {
    async fn latest_root_hash(&self) -> Result<Option<Digest>, DataStoreError> {
        let entries = self.entries.lock().await;
        Ok(entries.last().map(|e| e.record.root_hash.clone()))
    }

    async fn store_tree(&self, new: NewTree<'_>) -> Result<StoredTree, DataStoreError> {
        new.validate()?;

        let mut entries = self.entries.lock().await;
        if entries
            .iter()
            .any(|e| &e.record.root_hash == new.root_hash)
        {
            return Err(DataStoreError::Conflict(new.root_hash.clone()));
        }

        let id = entries.last().map(|e| e.id + 1).unwrap_or(1);
        entries.push(Entry {
            id,
            record: RootRecord {
                root_hash: new.root_hash.clone(),
                item_count: new.item_count,
                source_path: new.source_path.to_string(),
                created_at: Utc::now(),
            },
            body: new.body.clone(),
        });

        Ok(StoredTree {
            id: id.to_string(),
            root_hash: new.root_hash.clone(),
        })
    }

    async fn tree_by_root_hash(
        &self,
        root: &Digest,
    ) -> Result<Option<TreeRecord>, DataStoreError> {
        let entries = self.entries.lock().await;
        Ok(entries
            .iter()
            .find(|e| &e.record.root_hash == root)
            .map(|e| TreeRecord {
                record: e.record.clone(),
                tree: e.body.clone(),
            }))
    }

    async fn recent_roots(&self, limit: usize) -> Result<Vec<RootRecord>, DataStoreError> {
        let entries = self.entries.lock().await;
        Ok(entries
            .iter()
            .rev()
            .take(limit)
            .map(|e| e.record.clone())
            .collect())
    }

    async fn test_connection(&self) -> ConnectionStatus {
        ConnectionStatus::connected()
    }

    async fn stats(&self) -> Result<StoreStats, DataStoreError> {
        let entries = self.entries.lock().await;
        let total = entries.len() as u64;
        let avg = if total == 0 {
            None
        } else {
            let sum: u64 = entries.iter().map(|e| e.record.item_count).sum();
            Some(sum as f64 / total as f64)
        };

        Ok(StoreStats {
            total_trees: total,
            latest_tree: entries.last().map(|e| e.record.created_at),
            earliest_tree: entries.first().map(|e| e.record.created_at),
            avg_item_count: avg,
            total_size_bytes: None,
        })
    }

    fn kind(&self) -> &'static str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use treesnap_core::MerkleTree;

    fn new_tree(items: &[&str]) -> (Digest, TreeBody, u64) {
        let tree = MerkleTree::from_data(items.iter().copied()).unwrap();
        (
            tree.root_hash().clone(),
            tree.to_body(),
            tree.leaf_count() as u64,
        )
    }

    #[tokio::test]
    async fn stores_and_fetches_trees() {
        let store = MemoryDataStore::default();
        assert_eq!(store.latest_root_hash().await.unwrap(), None);

        let (root, body, count) = new_tree(&["a", "b"]);
        let stored = store
            .store_tree(NewTree {
                root_hash: &root,
                body: &body,
                item_count: count,
                source_path: "/data",
            })
            .await
            .unwrap();
        assert_eq!(stored.root_hash, root);

        assert_eq!(store.latest_root_hash().await.unwrap(), Some(root.clone()));
        let fetched = store.tree_by_root_hash(&root).await.unwrap().unwrap();
        assert_eq!(fetched.record.item_count, 2);
        assert_eq!(fetched.tree, body);

        let missing = "0".repeat(64).parse().unwrap();
        assert!(store.tree_by_root_hash(&missing).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn rejects_invalid_and_duplicate_input() {
        let store = MemoryDataStore::default();
        let (root, body, count) = new_tree(&["a"]);

        let zero = store
            .store_tree(NewTree {
                root_hash: &root,
                body: &body,
                item_count: 0,
                source_path: "/data",
            })
            .await;
        assert!(matches!(zero, Err(DataStoreError::InvalidTree(_))));

        store
            .store_tree(NewTree {
                root_hash: &root,
                body: &body,
                item_count: count,
                source_path: "/data",
            })
            .await
            .unwrap();

        let dup = store
            .store_tree(NewTree {
                root_hash: &root,
                body: &body,
                item_count: count,
                source_path: "/data",
            })
            .await;
        assert!(matches!(dup, Err(DataStoreError::Conflict(_))));
    }

    #[tokio::test]
    async fn recent_roots_are_newest_first() {
        let store = MemoryDataStore::default();
        for items in [&["a"][..], &["a", "b"], &["a", "b", "c"]] {
            let (root, body, count) = new_tree(items);
            store
                .store_tree(NewTree {
                    root_hash: &root,
                    body: &body,
                    item_count: count,
                    source_path: "/data",
                })
                .await
                .unwrap();
        }

        let recent = store.recent_roots(2).await.unwrap();
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].item_count, 3);
        assert_eq!(recent[1].item_count, 2);

        let stats = store.stats().await.unwrap();
        assert_eq!(stats.total_trees, 3);
        assert_eq!(stats.avg_item_count, Some(2.0));
    }
}
