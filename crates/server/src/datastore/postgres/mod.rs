use super::{
    ConnectionStatus, DataStore, DataStoreError, NewTree, RootRecord, StoreStats, StoredTree,
    TreeRecord,
};
use chrono::{DateTime, Utc};
use diesel::{prelude::*, result::DatabaseErrorKind};
use diesel_async::{
    pooled_connection::{deadpool::Pool, AsyncDieselConnectionManager},
    scoped_futures::ScopedFutureExt,
    AsyncConnection, AsyncPgConnection, RunQueryDsl,
};
use diesel_migrations::{embed_migrations, EmbeddedMigrations, MigrationHarness};
use treesnap_core::Digest;

mod models;
mod schema;

pub const MIGRATIONS: EmbeddedMigrations = embed_migrations!();

fn parse_digest(raw: String) -> Result<Digest, DataStoreError> {
    raw.parse()
        .map_err(|_| DataStoreError::Backend(format!("stored root hash `{raw}` is not a digest")))
}

/// The relational store: a `merkle_roots` record plus its `merkle_tree_data`
/// body, written in a single transaction over a bounded connection pool.
pub struct PostgresDataStore {
    pool: Pool<AsyncPgConnection>,
}

impl PostgresDataStore {
    pub fn new(url: impl Into<String>, pool_size: usize) -> anyhow::Result<Self> {
        let config = AsyncDieselConnectionManager::new(url.into());
        let pool = Pool::builder(config).max_size(pool_size).build()?;
        Ok(Self { pool })
    }

    /// Applies any pending schema migrations over a blocking connection.
    pub async fn run_pending_migrations(database_url: &str) -> anyhow::Result<()> {
        let url = database_url.to_string();
        tokio::task::spawn_blocking(move || -> anyhow::Result<()> {
            let mut conn = diesel::PgConnection::establish(&url)?;
            conn.run_pending_migrations(MIGRATIONS)
                .map_err(|e| anyhow::anyhow!("failed to run migrations: {e}"))?;
            Ok(())
        })
        .await??;
        Ok(())
    }
}

#[axum::async_trait]
impl DataStore for PostgresDataStore {
    async fn latest_root_hash(&self) -> Result<Option<Digest>, DataStoreError> {
        let mut conn = self.pool.get().await?;
        schema::merkle_roots::table
            .select(schema::merkle_roots::root_hash)
            .order_by(schema::merkle_roots::created_at.desc())
            .first::<String>(&mut conn)
            .await
            .optional()?
            .map(parse_digest)
            .transpose()
    }

    async fn store_tree(&self, new: NewTree<'_>) -> Result<StoredTree, DataStoreError> {
        new.validate()?;

        let tree_json =
            serde_json::to_value(new.body).map_err(|e| DataStoreError::Backend(e.to_string()))?;
        let root_hash = new.root_hash.clone();
        let item_count = new.item_count as i64;
        let source_path = new.source_path;

        let mut conn = self.pool.get().await?;
        let id = conn
            .transaction::<i32, DataStoreError, _>(|conn| {
                let root_hash = root_hash.clone();
                let tree_json = &tree_json;
                async move {
                    let id = diesel::insert_into(schema::merkle_roots::table)
                        .values(models::NewRoot {
                            root_hash: root_hash.as_str(),
                            item_count,
                            source_path,
                        })
                        .returning(schema::merkle_roots::id)
                        .get_result::<i32>(conn)
                        .await
                        .map_err(|e| match e {
                            diesel::result::Error::DatabaseError(
                                DatabaseErrorKind::UniqueViolation,
                                _,
                            ) => DataStoreError::Conflict(root_hash.clone()),
                            e => e.into(),
                        })?;

                    diesel::insert_into(schema::merkle_tree_data::table)
                        .values(models::NewTreeData {
                            root_id: id,
                            tree_json,
                        })
                        .execute(conn)
                        .await?;

                    Ok(id)
                }
                .scope_boxed()
            })
            .await?;

        Ok(StoredTree {
            id: id.to_string(),
            root_hash: new.root_hash.clone(),
        })
    }

    async fn tree_by_root_hash(
        &self,
        root: &Digest,
    ) -> Result<Option<TreeRecord>, DataStoreError> {
        let mut conn = self.pool.get().await?;
        let row = schema::merkle_roots::table
            .inner_join(schema::merkle_tree_data::table)
            .filter(schema::merkle_roots::root_hash.eq(root.as_str()))
            .select((
                schema::merkle_roots::item_count,
                schema::merkle_roots::source_path,
                schema::merkle_roots::created_at,
                schema::merkle_tree_data::tree_json,
            ))
            .first::<(i64, String, DateTime<Utc>, serde_json::Value)>(&mut conn)
            .await
            .optional()?;

        row.map(|(item_count, source_path, created_at, tree_json)| {
            let tree = serde_json::from_value(tree_json)
                .map_err(|e| DataStoreError::Backend(format!("stored tree body: {e}")))?;
            Ok(TreeRecord {
                record: RootRecord {
                    root_hash: root.clone(),
                    item_count: item_count as u64,
                    source_path,
                    created_at,
                },
                tree,
            })
        })
        .transpose()
    }

    async fn recent_roots(&self, limit: usize) -> Result<Vec<RootRecord>, DataStoreError> {
        let mut conn = self.pool.get().await?;
        let rows = schema::merkle_roots::table
            .select((
                schema::merkle_roots::root_hash,
                schema::merkle_roots::item_count,
                schema::merkle_roots::source_path,
                schema::merkle_roots::created_at,
            ))
            .order_by(schema::merkle_roots::created_at.desc())
            .limit(limit as i64)
            .load::<(String, i64, String, DateTime<Utc>)>(&mut conn)
            .await?;

        rows.into_iter()
            .map(|(root_hash, item_count, source_path, created_at)| {
                Ok(RootRecord {
                    root_hash: parse_digest(root_hash)?,
                    item_count: item_count as u64,
                    source_path,
                    created_at,
                })
            })
            .collect()
    }

    async fn test_connection(&self) -> ConnectionStatus {
        match self.pool.get().await {
            Ok(mut conn) => match diesel::sql_query("SELECT 1").execute(&mut conn).await {
                Ok(_) => ConnectionStatus::connected(),
                Err(e) => ConnectionStatus::failed(e),
            },
            Err(e) => ConnectionStatus::failed(e),
        }
    }

    async fn stats(&self) -> Result<StoreStats, DataStoreError> {
        use diesel::dsl::{max, min};

        let mut conn = self.pool.get().await?;
        let total = schema::merkle_roots::table
            .count()
            .get_result::<i64>(&mut conn)
            .await?;
        let (earliest, latest) = schema::merkle_roots::table
            .select((
                min(schema::merkle_roots::created_at),
                max(schema::merkle_roots::created_at),
            ))
            .first::<(Option<DateTime<Utc>>, Option<DateTime<Utc>>)>(&mut conn)
            .await?;
        let avg = schema::merkle_roots::table
            .select(diesel::dsl::sql::<diesel::sql_types::Nullable<diesel::sql_types::Double>>(
                "avg(item_count)::float8",
            ))
            .first::<Option<f64>>(&mut conn)
            .await?;

        Ok(StoreStats {
            total_trees: total as u64,
            latest_tree: latest,
            earliest_tree: earliest,
            avg_item_count: avg,
            total_size_bytes: None,
        })
    }

    fn kind(&self) -> &'static str {
        "postgres"
    }
}
