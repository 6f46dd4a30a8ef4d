use super::{
    ConnectionStatus, DataStore, DataStoreError, NewTree, RootRecord, StoreStats, StoredTree,
    TreeRecord,
};
use aws_credential_types::Credentials;
use aws_sdk_s3::{config::Region, primitives::ByteStream};
use chrono::{DateTime, Utc};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use treesnap_core::Digest;
use url::Url;

/// Key of the mutable pointer to the current latest root.
const LATEST_ROOT_KEY: &str = "metadata/latest-root.json";
/// Prefix under which one record object per committed root lives.
const ROOTS_PREFIX: &str = "metadata/roots/";
/// Prefix under which the full tree bodies live.
const TREES_PREFIX: &str = "trees/";

#[derive(Debug)]
pub struct S3StoreConfig {
    pub endpoint: Url,
    pub region: String,
    pub bucket: String,
    pub access_key_id: SecretString,
    pub secret_access_key: SecretString,
}

/// The record object stored per root: the root record plus a pointer to
/// the body object. Consumers depend on this key layout.
#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StoredRecord {
    #[serde(flatten)]
    record: RootRecord,
    tree_key: String,
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LatestPointer {
    root_hash: Digest,
    updated_at: DateTime<Utc>,
}

/// The object-store backend over any S3-compatible API.
#[derive(Clone)]
pub struct S3DataStore {
    client: aws_sdk_s3::Client,
    bucket: String,
}

impl S3DataStore {
    pub async fn new(config: S3StoreConfig) -> Self {
        let creds = Credentials::new(
            config.access_key_id.expose_secret().to_string(),
            config.secret_access_key.expose_secret().to_string(),
            None,
            None,
            "treesnap-s3-static-provider",
        );
        let sdk_config = aws_config::from_env()
            .region(Region::new(config.region))
            .endpoint_url(config.endpoint.as_str())
            .credentials_provider(creds)
            .load()
            .await;

        Self {
            client: aws_sdk_s3::Client::new(&sdk_config),
            bucket: config.bucket,
        }
    }

    fn tree_key(root: &Digest) -> String {
        format!("{TREES_PREFIX}{root}.json")
    }

    fn record_key(root: &Digest) -> String {
        format!("{ROOTS_PREFIX}{root}.json")
    }

    async fn put_json(
        &self,
        key: String,
        body: Vec<u8>,
        root: &Digest,
        item_count: u64,
    ) -> Result<(), DataStoreError> {
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(&key)
            .body(ByteStream::from(body))
            .content_type("application/json")
            .metadata("root-hash", root.to_string())
            .metadata("item-count", item_count.to_string())
            .send()
            .await
            .map_err(|e| DataStoreError::Backend(format!("cannot write `{key}`: {e}")))?;
        Ok(())
    }

    /// Reads and parses an object, mapping a missing key to `None`.
    async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        key: &str,
    ) -> Result<Option<T>, DataStoreError> {
        let object = match self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
        {
            Ok(object) => object,
            Err(e) => {
                let service_error = e.into_service_error();
                if service_error.is_no_such_key() {
                    return Ok(None);
                }
                return Err(DataStoreError::Backend(format!(
                    "cannot read `{key}`: {service_error}"
                )));
            }
        };

        let bytes = object
            .body
            .collect()
            .await
            .map_err(|e| DataStoreError::Backend(format!("cannot read `{key}`: {e}")))?
            .into_bytes();
        serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|e| DataStoreError::Backend(format!("cannot parse `{key}`: {e}")))
    }
}

#[axum::async_trait]
impl DataStore for S3DataStore {
    async fn latest_root_hash(&self) -> Result<Option<Digest>, DataStoreError> {
        Ok(self
            .get_json::<LatestPointer>(LATEST_ROOT_KEY)
            .await?
            .map(|pointer| pointer.root_hash))
    }

    async fn store_tree(&self, new: NewTree<'_>) -> Result<StoredTree, DataStoreError> {
        new.validate()?;

        let root = new.root_hash;
        let now = Utc::now();

        let body = serde_json::to_vec(new.body)
            .map_err(|e| DataStoreError::Backend(e.to_string()))?;
        let record = serde_json::to_vec(&StoredRecord {
            record: RootRecord {
                root_hash: root.clone(),
                item_count: new.item_count,
                source_path: new.source_path.to_string(),
                created_at: now,
            },
            tree_key: Self::tree_key(root),
        })
        .map_err(|e| DataStoreError::Backend(e.to_string()))?;
        let pointer = serde_json::to_vec(&LatestPointer {
            root_hash: root.clone(),
            updated_at: now,
        })
        .map_err(|e| DataStoreError::Backend(e.to_string()))?;

        // Body first, then the record, then the latest pointer: a reader
        // that observes the pointer always finds the objects it names.
        self.put_json(Self::tree_key(root), body, root, new.item_count)
            .await?;
        self.put_json(Self::record_key(root), record, root, new.item_count)
            .await?;
        self.put_json(LATEST_ROOT_KEY.to_string(), pointer, root, new.item_count)
            .await?;

        Ok(StoredTree {
            id: root.to_string(),
            root_hash: root.clone(),
        })
    }

    async fn tree_by_root_hash(
        &self,
        root: &Digest,
    ) -> Result<Option<TreeRecord>, DataStoreError> {
        let Some(stored) = self.get_json::<StoredRecord>(&Self::record_key(root)).await? else {
            return Ok(None);
        };

        let tree = self
            .get_json(&stored.tree_key)
            .await?
            .ok_or_else(|| {
                DataStoreError::Backend(format!(
                    "record for `{root}` points at missing object `{key}`",
                    key = stored.tree_key
                ))
            })?;

        Ok(Some(TreeRecord {
            record: stored.record,
            tree,
        }))
    }

    async fn recent_roots(&self, limit: usize) -> Result<Vec<RootRecord>, DataStoreError> {
        // Listing scales with the number of committed roots; the health
        // surface only ever asks for a handful.
        let mut records = Vec::new();
        let mut continuation: Option<String> = None;
        loop {
            let response = self
                .client
                .list_objects_v2()
                .bucket(&self.bucket)
                .prefix(ROOTS_PREFIX)
                .set_continuation_token(continuation.take())
                .send()
                .await
                .map_err(|e| DataStoreError::Backend(format!("cannot list roots: {e}")))?;

            for object in response.contents() {
                let Some(key) = object.key() else { continue };
                if let Some(stored) = self.get_json::<StoredRecord>(key).await? {
                    records.push(stored.record);
                }
            }

            match response.next_continuation_token() {
                Some(token) => continuation = Some(token.to_string()),
                None => break,
            }
        }

        records.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        records.truncate(limit);
        Ok(records)
    }

    async fn test_connection(&self) -> ConnectionStatus {
        match self
            .client
            .head_bucket()
            .bucket(&self.bucket)
            .send()
            .await
        {
            Ok(_) => ConnectionStatus::connected(),
            Err(e) => ConnectionStatus::failed(e),
        }
    }

    async fn stats(&self) -> Result<StoreStats, DataStoreError> {
        let mut total = 0u64;
        let mut total_size = 0u64;
        let mut earliest: Option<DateTime<Utc>> = None;
        let mut latest: Option<DateTime<Utc>> = None;

        let mut continuation: Option<String> = None;
        loop {
            let response = self
                .client
                .list_objects_v2()
                .bucket(&self.bucket)
                .prefix(ROOTS_PREFIX)
                .set_continuation_token(continuation.take())
                .send()
                .await
                .map_err(|e| DataStoreError::Backend(format!("cannot list roots: {e}")))?;

            for object in response.contents() {
                total += 1;
                total_size += object.size().unwrap_or_default().max(0) as u64;
                let modified = object
                    .last_modified()
                    .and_then(|t| DateTime::<Utc>::from_timestamp(t.secs(), 0));
                if let Some(modified) = modified {
                    earliest = Some(earliest.map_or(modified, |e| e.min(modified)));
                    latest = Some(latest.map_or(modified, |l| l.max(modified)));
                }
            }

            match response.next_continuation_token() {
                Some(token) => continuation = Some(token.to_string()),
                None => break,
            }
        }

        Ok(StoreStats {
            total_trees: total,
            latest_tree: latest,
            earliest_tree: earliest,
            avg_item_count: None,
            total_size_bytes: Some(total_size),
        })
    }

    fn kind(&self) -> &'static str {
        "s3"
    }
}
