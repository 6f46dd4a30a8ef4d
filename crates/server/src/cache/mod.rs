//! The redis cache tier.
//!
//! The cache is a pure accelerator in front of the data store: every
//! operation is safe when the connection is down or the tier is disabled.
//! Reads then report a miss, writes return `false`, and the failure is
//! logged at `warn` — a cache error never reaches a caller. The
//! connection manager reconnects in the background with exponential
//! backoff; a caller-facing attempt gives up after ten retries.

use crate::datastore::RootRecord;
use chrono::{DateTime, Utc};
use redis::{aio::ConnectionManager, AsyncCommands, ConnectionAddr, RedisConnectionInfo};
use secrecy::{ExposeSecret, SecretString};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use treesnap_core::Digest;

/// All cache keys live under this namespace.
pub const NAMESPACE: &str = "merkle:";
pub const LATEST_ROOT_KEY: &str = "merkle:latest_root_hash";
pub const BUILD_STATUS_KEY: &str = "merkle:build_status";

/// Build status entries outlive a scheduler tick but not much more.
const BUILD_STATUS_TTL_SECS: u64 = 300;

/// Backoff parameters for the connection manager: 100ms * 2^n delays,
/// giving up on the caller-facing connect after ten attempts (the
/// manager keeps retrying in the background once connected).
const RECONNECT_EXPONENT_BASE: u64 = 2;
const RECONNECT_FACTOR_MS: u64 = 100;
const RECONNECT_ATTEMPTS: usize = 10;

pub fn tree_metadata_key(root: &Digest) -> String {
    format!("merkle:tree_metadata:{root}")
}

#[derive(Clone, Debug)]
pub struct CacheConfig {
    pub enabled: bool,
    pub host: String,
    pub port: u16,
    pub password: Option<SecretString>,
    pub database: i64,
    pub default_ttl_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            host: "127.0.0.1".to_string(),
            port: 6379,
            password: None,
            database: 0,
            default_ttl_secs: 3600,
        }
    }
}

/// Every cached value is wrapped in an envelope recording when it was
/// written; consumers read `payload`.
#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Envelope<T> {
    payload: T,
    cached_at: DateTime<Utc>,
}

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheStats {
    pub enabled: bool,
    pub connected: bool,
    pub key_count: u64,
    pub keys: Vec<String>,
}

/// A shared handle to the cache tier. Cloning is cheap and all
/// operations are safe to invoke concurrently.
#[derive(Clone)]
pub struct CacheClient {
    manager: Option<ConnectionManager>,
    enabled: bool,
    default_ttl_secs: u64,
}

impl CacheClient {
    /// Connects to redis, or returns a disabled handle when the tier is
    /// turned off or the initial connection cannot be established. The
    /// surrounding system runs identically either way, minus the
    /// latency win.
    pub async fn connect(config: &CacheConfig) -> Self {
        let disabled = Self {
            manager: None,
            enabled: config.enabled,
            default_ttl_secs: config.default_ttl_secs,
        };

        if !config.enabled {
            tracing::info!("cache tier is disabled");
            return disabled;
        }

        let info = redis::ConnectionInfo {
            addr: ConnectionAddr::Tcp(config.host.clone(), config.port),
            redis: RedisConnectionInfo {
                db: config.database,
                username: None,
                password: config
                    .password
                    .as_ref()
                    .map(|p| p.expose_secret().to_string()),
            },
        };

        let client = match redis::Client::open(info) {
            Ok(client) => client,
            Err(e) => {
                tracing::warn!("invalid cache connection settings: {e}; running without cache");
                return disabled;
            }
        };

        match ConnectionManager::new_with_backoff(
            client,
            RECONNECT_EXPONENT_BASE,
            RECONNECT_FACTOR_MS,
            RECONNECT_ATTEMPTS,
        )
        .await
        {
            Ok(manager) => {
                tracing::info!(
                    host = %config.host,
                    port = config.port,
                    "connected to cache"
                );
                Self {
                    manager: Some(manager),
                    ..disabled
                }
            }
            Err(e) => {
                tracing::warn!("cache connection failed: {e}; running without cache");
                disabled
            }
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    fn connection(&self) -> Option<ConnectionManager> {
        self.manager.clone()
    }

    /// Reads a JSON envelope; any failure is a miss.
    pub async fn get_json<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let mut conn = self.connection()?;
        match conn.get::<_, Option<String>>(key).await {
            Ok(Some(raw)) => match serde_json::from_str::<Envelope<T>>(&raw) {
                Ok(envelope) => Some(envelope.payload),
                Err(e) => {
                    tracing::warn!("cache entry `{key}` is malformed: {e}");
                    None
                }
            },
            Ok(None) => None,
            Err(e) => {
                tracing::warn!("cache read of `{key}` failed: {e}");
                None
            }
        }
    }

    /// Writes a JSON envelope with the given TTL (default TTL when
    /// `None`). Returns whether the write happened.
    pub async fn set_json<T: Serialize>(&self, key: &str, value: &T, ttl_secs: Option<u64>) -> bool {
        let Some(mut conn) = self.connection() else {
            return false;
        };
        let envelope = Envelope {
            payload: value,
            cached_at: Utc::now(),
        };
        let raw = match serde_json::to_string(&envelope) {
            Ok(raw) => raw,
            Err(e) => {
                tracing::warn!("cannot serialize cache entry `{key}`: {e}");
                return false;
            }
        };

        let ttl = ttl_secs.unwrap_or(self.default_ttl_secs);
        match conn.set_ex::<_, _, ()>(key, raw, ttl).await {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!("cache write of `{key}` failed: {e}");
                false
            }
        }
    }

    pub async fn delete(&self, key: &str) -> bool {
        let Some(mut conn) = self.connection() else {
            return false;
        };
        match conn.del::<_, u64>(key).await {
            Ok(n) => n > 0,
            Err(e) => {
                tracing::warn!("cache delete of `{key}` failed: {e}");
                false
            }
        }
    }

    pub async fn exists(&self, key: &str) -> bool {
        let Some(mut conn) = self.connection() else {
            return false;
        };
        match conn.exists::<_, bool>(key).await {
            Ok(found) => found,
            Err(e) => {
                tracing::warn!("cache exists of `{key}` failed: {e}");
                false
            }
        }
    }

    /// Deletes every key matching a glob over the `merkle:` namespace
    /// and returns how many were removed. Patterns outside the
    /// namespace are rejected so a stray glob cannot clear foreign keys.
    pub async fn invalidate(&self, pattern: &str) -> u64 {
        if !pattern.starts_with(NAMESPACE) {
            tracing::warn!("refusing to invalidate outside the `{NAMESPACE}` namespace: {pattern}");
            return 0;
        }
        let Some(mut conn) = self.connection() else {
            return 0;
        };

        let keys = match conn.keys::<_, Vec<String>>(pattern).await {
            Ok(keys) => keys,
            Err(e) => {
                tracing::warn!("cache scan of `{pattern}` failed: {e}");
                return 0;
            }
        };
        if keys.is_empty() {
            return 0;
        }

        match conn.del::<_, u64>(&keys).await {
            Ok(n) => n,
            Err(e) => {
                tracing::warn!("cache invalidation of `{pattern}` failed: {e}");
                0
            }
        }
    }

    pub async fn stats(&self) -> CacheStats {
        let Some(mut conn) = self.connection() else {
            return CacheStats {
                enabled: self.enabled,
                connected: false,
                key_count: 0,
                keys: Vec::new(),
            };
        };

        let connected = redis::cmd("PING")
            .query_async::<_, String>(&mut conn)
            .await
            .is_ok();
        let keys = if connected {
            conn.keys::<_, Vec<String>>(format!("{NAMESPACE}*"))
                .await
                .unwrap_or_default()
        } else {
            Vec::new()
        };

        CacheStats {
            enabled: self.enabled,
            connected,
            key_count: keys.len() as u64,
            keys,
        }
    }

    // Typed helpers for the three well-known keys.

    pub async fn latest_root(&self) -> Option<Digest> {
        self.get_json(LATEST_ROOT_KEY).await
    }

    pub async fn set_latest_root(&self, root: &Digest) -> bool {
        self.set_json(LATEST_ROOT_KEY, root, None).await
    }

    pub async fn tree_metadata(&self, root: &Digest) -> Option<RootRecord> {
        self.get_json(&tree_metadata_key(root)).await
    }

    /// Metadata is read far more rarely than the latest root, so it
    /// lives twice as long.
    pub async fn set_tree_metadata(&self, root: &Digest, record: &RootRecord) -> bool {
        self.set_json(
            &tree_metadata_key(root),
            record,
            Some(self.default_ttl_secs * 2),
        )
        .await
    }

    pub async fn build_status<T: DeserializeOwned>(&self) -> Option<T> {
        self.get_json(BUILD_STATUS_KEY).await
    }

    pub async fn set_build_status<T: Serialize>(&self, status: &T) -> bool {
        self.set_json(BUILD_STATUS_KEY, status, Some(BUILD_STATUS_TTL_SECS))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn disconnected() -> CacheClient {
        CacheClient {
            manager: None,
            enabled: true,
            default_ttl_secs: 60,
        }
    }

    #[test]
    fn metadata_keys_are_namespaced() {
        let root: Digest = "a".repeat(64).parse().unwrap();
        assert_eq!(
            tree_metadata_key(&root),
            format!("merkle:tree_metadata:{root}")
        );
        assert!(LATEST_ROOT_KEY.starts_with(NAMESPACE));
        assert!(BUILD_STATUS_KEY.starts_with(NAMESPACE));
    }

    #[tokio::test]
    async fn every_operation_is_safe_without_a_connection() {
        let cache = disconnected();
        assert_eq!(cache.get_json::<String>("merkle:x").await, None);
        assert!(!cache.set_json("merkle:x", &"v", None).await);
        assert!(!cache.delete("merkle:x").await);
        assert!(!cache.exists("merkle:x").await);
        assert_eq!(cache.invalidate("merkle:*").await, 0);
        assert_eq!(cache.latest_root().await, None);

        let stats = cache.stats().await;
        assert!(stats.enabled);
        assert!(!stats.connected);
        assert_eq!(stats.key_count, 0);
    }

    #[tokio::test]
    async fn disabled_tier_reports_disabled() {
        let cache = CacheClient::connect(&CacheConfig::default()).await;
        assert!(!cache.is_enabled());
        assert_eq!(cache.latest_root().await, None);
        assert!(!cache.set_latest_root(&"b".repeat(64).parse().unwrap()).await);
    }

    #[tokio::test]
    async fn foreign_namespace_globs_are_rejected() {
        let cache = disconnected();
        assert_eq!(cache.invalidate("sessions:*").await, 0);
    }

    #[test]
    fn envelope_carries_the_payload_and_timestamp() {
        let raw = serde_json::to_value(Envelope {
            payload: "abc",
            cached_at: Utc::now(),
        })
        .unwrap();
        assert_eq!(raw["payload"], "abc");
        assert!(raw.get("cachedAt").is_some());
    }
}
