use anyhow::Result;
use clap::{Parser, ValueEnum};
use secrecy::SecretString;
use std::{net::SocketAddr, path::PathBuf};
use tokio::signal;
use tracing_subscriber::filter::LevelFilter;
use treesnap_server::{args::resolve_optional_secret, cache::CacheConfig, Config, Environment, Server};

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq, Default)]
enum DataStoreKind {
    #[cfg(feature = "postgres")]
    Postgres,
    #[cfg(feature = "s3")]
    S3,
    #[default]
    Memory,
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
}

#[derive(Parser, Debug)]
struct Args {
    /// Use verbose output
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Logging level; `--verbose` overrides this upwards
    #[arg(long, value_enum, default_value = "info", env = "TREESNAP_LOG_LEVEL")]
    log_level: LogLevel,

    /// Address to listen to
    #[arg(short, long, default_value = "127.0.0.1:8090", env = "TREESNAP_LISTEN")]
    listen: SocketAddr,

    /// Deployment environment; outside development, error responses hide details
    #[arg(long, value_enum, default_value = "development", env = "TREESNAP_ENV")]
    environment: Environment,

    /// The directory tree to snapshot
    #[arg(long, env = "TREESNAP_SOURCE_DIR")]
    source_dir: PathBuf,

    /// Minutes between scheduled scans
    #[arg(long, default_value_t = 60, env = "TREESNAP_SCAN_INTERVAL_MINUTES")]
    scan_interval_minutes: u64,

    /// Cap the number of files hashed in a single build
    #[arg(long, env = "TREESNAP_BATCH_SIZE")]
    batch_size: Option<usize>,

    /// The data store to use for the server.
    #[arg(long, default_value = "memory")]
    data_store: DataStoreKind,

    /// PostgreSQL connection pool size
    #[cfg(feature = "postgres")]
    #[arg(long, default_value_t = 8)]
    database_pool_size: usize,

    /// S3-compatible endpoint URL
    #[cfg(feature = "s3")]
    #[arg(long, env = "TREESNAP_S3_ENDPOINT")]
    s3_endpoint: Option<url::Url>,

    /// S3 region
    #[cfg(feature = "s3")]
    #[arg(long, default_value = "auto", env = "TREESNAP_S3_REGION")]
    s3_region: String,

    /// S3 bucket holding the committed trees
    #[cfg(feature = "s3")]
    #[arg(long, env = "TREESNAP_S3_BUCKET")]
    s3_bucket: Option<String>,

    /// S3 access key id
    #[cfg(feature = "s3")]
    #[arg(long, env = "TREESNAP_S3_ACCESS_KEY_ID")]
    s3_access_key_id: Option<SecretString>,

    /// File containing the S3 access key id
    #[cfg(feature = "s3")]
    #[arg(long, conflicts_with = "s3_access_key_id")]
    s3_access_key_id_file: Option<PathBuf>,

    /// S3 secret access key
    #[cfg(feature = "s3")]
    #[arg(long, env = "TREESNAP_S3_SECRET_ACCESS_KEY")]
    s3_secret_access_key: Option<SecretString>,

    /// File containing the S3 secret access key
    #[cfg(feature = "s3")]
    #[arg(long, conflicts_with = "s3_secret_access_key")]
    s3_secret_access_key_file: Option<PathBuf>,

    /// Enable the redis cache tier
    #[arg(long, env = "TREESNAP_CACHE_ENABLED")]
    cache_enabled: bool,

    /// Redis host
    #[arg(long, default_value = "127.0.0.1", env = "TREESNAP_CACHE_HOST")]
    cache_host: String,

    /// Redis port
    #[arg(long, default_value_t = 6379, env = "TREESNAP_CACHE_PORT")]
    cache_port: u16,

    /// Redis password
    #[arg(long, env = "TREESNAP_CACHE_PASSWORD")]
    cache_password: Option<SecretString>,

    /// File containing the redis password
    #[arg(long, conflicts_with = "cache_password")]
    cache_password_file: Option<PathBuf>,

    /// Redis database index
    #[arg(long, default_value_t = 0, env = "TREESNAP_CACHE_DATABASE")]
    cache_database: i64,

    /// Default cache TTL in seconds
    #[arg(long, default_value_t = 3600, env = "TREESNAP_CACHE_TTL_SECS")]
    cache_ttl_secs: u64,
}

impl Args {
    fn init_tracing(&self) {
        let level_filter = match self.verbose {
            0 => match self.log_level {
                LogLevel::Error => LevelFilter::ERROR,
                LogLevel::Warn => LevelFilter::WARN,
                LogLevel::Info => LevelFilter::INFO,
                LogLevel::Debug => LevelFilter::DEBUG,
            },
            1 => LevelFilter::DEBUG,
            _ => LevelFilter::TRACE,
        };
        tracing_subscriber::fmt()
            .with_max_level(level_filter)
            .init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    args.init_tracing();
    tracing::debug!("args: {args:?}");

    let cache = CacheConfig {
        enabled: args.cache_enabled,
        host: args.cache_host.clone(),
        port: args.cache_port,
        password: resolve_optional_secret(
            "cache-password",
            args.cache_password_file.clone(),
            args.cache_password.clone(),
        )?,
        database: args.cache_database,
        default_ttl_secs: args.cache_ttl_secs,
    };

    let mut config = Config::new(args.source_dir.clone())
        .with_addr(args.listen)
        .with_environment(args.environment)
        .with_scan_interval_minutes(args.scan_interval_minutes)
        .with_cache(cache)
        .with_shutdown(shutdown_signal());
    if let Some(batch_size) = args.batch_size {
        config = config.with_batch_size(batch_size);
    }

    match args.data_store {
        #[cfg(feature = "postgres")]
        DataStoreKind::Postgres => {
            use anyhow::Context;
            use std::sync::Arc;
            use treesnap_server::datastore::PostgresDataStore;

            tracing::debug!("using PostgreSQL data store");
            let url = std::env::var("DATABASE_URL").context(
                "failed to get the PostgreSQL database URL from the `DATABASE_URL` environment variable",
            )?;
            PostgresDataStore::run_pending_migrations(&url).await?;
            config = config.with_data_store(Arc::new(PostgresDataStore::new(
                url,
                args.database_pool_size,
            )?));
        }
        #[cfg(feature = "s3")]
        DataStoreKind::S3 => {
            use anyhow::Context;
            use std::sync::Arc;
            use treesnap_server::{
                args::resolve_secret,
                datastore::{S3DataStore, S3StoreConfig},
            };

            tracing::debug!("using S3 data store");
            let store = S3DataStore::new(S3StoreConfig {
                endpoint: args
                    .s3_endpoint
                    .clone()
                    .context("option `s3-endpoint` is required for the s3 data store")?,
                region: args.s3_region.clone(),
                bucket: args
                    .s3_bucket
                    .clone()
                    .context("option `s3-bucket` is required for the s3 data store")?,
                access_key_id: resolve_secret(
                    "s3-access-key-id",
                    args.s3_access_key_id_file.clone(),
                    args.s3_access_key_id.clone(),
                )?,
                secret_access_key: resolve_secret(
                    "s3-secret-access-key",
                    args.s3_secret_access_key_file.clone(),
                    args.s3_secret_access_key.clone(),
                )?,
            })
            .await;
            config = config.with_data_store(Arc::new(store));
        }
        DataStoreKind::Memory => {
            tracing::debug!("using in-memory data store");
        }
    }

    Server::new(config).run().await
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");

        tracing::info!("starting shutdown (SIGINT)");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;

        tracing::info!("starting shutdown (SIGTERM)");
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
