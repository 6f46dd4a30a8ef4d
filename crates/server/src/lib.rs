//! The treesnap Merkle snapshot service.
//!
//! A scheduler periodically walks a configured directory, builds a
//! Merkle tree over the files found, and commits the tree to the data
//! store when its root hash differs from the latest committed root. A
//! redis cache tier accelerates latest-root and metadata reads, and an
//! HTTP surface exposes health, statistics, and manual triggers.

use anyhow::{bail, Context, Result};
use std::{future::Future, net::SocketAddr, path::PathBuf, pin::Pin, sync::Arc, time::Duration};

pub mod api;
pub mod args;
pub mod cache;
pub mod datastore;
pub mod services;

use cache::{CacheClient, CacheConfig};
use datastore::{DataStore, MemoryDataStore};
use services::{CoreService, Scheduler};

/// How long an in-flight build may keep running after shutdown begins.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

#[derive(clap::ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum Environment {
    /// Error responses include underlying error details.
    Development,
    /// Error details are suppressed from responses.
    Production,
}

pub struct Config {
    addr: SocketAddr,
    environment: Environment,
    source_dir: PathBuf,
    scan_interval_minutes: u64,
    batch_size: Option<usize>,
    cache: CacheConfig,
    data_store: Option<Arc<dyn DataStore>>,
    shutdown: Option<Pin<Box<dyn Future<Output = ()> + Send>>>,
}

impl Config {
    pub fn new(source_dir: PathBuf) -> Self {
        Self {
            addr: ([127, 0, 0, 1], 8090).into(),
            environment: Environment::Development,
            source_dir,
            scan_interval_minutes: 60,
            batch_size: None,
            cache: CacheConfig::default(),
            data_store: None,
            shutdown: None,
        }
    }

    pub fn with_addr(mut self, addr: SocketAddr) -> Self {
        self.addr = addr;
        self
    }

    pub fn with_environment(mut self, environment: Environment) -> Self {
        self.environment = environment;
        self
    }

    pub fn with_scan_interval_minutes(mut self, minutes: u64) -> Self {
        self.scan_interval_minutes = minutes;
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = Some(batch_size);
        self
    }

    pub fn with_cache(mut self, cache: CacheConfig) -> Self {
        self.cache = cache;
        self
    }

    pub fn with_data_store(mut self, store: Arc<dyn DataStore>) -> Self {
        self.data_store = Some(store);
        self
    }

    pub fn with_shutdown(
        mut self,
        shutdown: impl Future<Output = ()> + Send + 'static,
    ) -> Self {
        self.shutdown = Some(Box::pin(shutdown));
        self
    }
}

pub struct Server {
    config: Config,
}

impl Server {
    pub fn new(config: Config) -> Self {
        Self { config }
    }

    /// Runs the service until the shutdown future resolves: stops the
    /// scheduler, lets an in-flight build finish within a bounded grace
    /// period, and drops the cache and store connections on the way out.
    pub async fn run(self) -> Result<()> {
        let Config {
            addr,
            environment,
            source_dir,
            scan_interval_minutes,
            batch_size,
            cache,
            data_store,
            shutdown,
        } = self.config;

        if scan_interval_minutes < 1 {
            bail!("invalid scan interval: must be at least one minute");
        }

        let store = data_store
            .unwrap_or_else(|| Arc::new(MemoryDataStore::default()) as Arc<dyn DataStore>);
        let cache = CacheClient::connect(&cache).await;
        let core = CoreService::new(store, cache, source_dir, batch_size);
        let (scheduler, scheduler_handle) = Scheduler::spawn(core.clone(), scan_interval_minutes);

        let router = api::create_router(api::ApiState {
            core,
            scheduler: scheduler.clone(),
            environment,
        });

        let listener = tokio::net::TcpListener::bind(addr)
            .await
            .with_context(|| format!("failed to bind to `{addr}`"))?;
        tracing::info!("listening on {addr}");

        let shutdown = shutdown.unwrap_or_else(|| Box::pin(std::future::pending()));
        axum::serve(listener, router)
            .with_graceful_shutdown(shutdown)
            .await?;

        scheduler.stop();
        if tokio::time::timeout(SHUTDOWN_GRACE, scheduler_handle)
            .await
            .is_err()
        {
            tracing::warn!("a build was still running at the end of the shutdown grace period");
        }
        tracing::info!("shutdown complete");

        Ok(())
    }
}
