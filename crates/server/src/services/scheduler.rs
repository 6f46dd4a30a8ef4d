//! The periodic build scheduler.
//!
//! One in-process timer drives the orchestrator. Builds are single-flight:
//! a tick that fires while a build is running is dropped with a warning,
//! never queued, and a manual trigger fails fast with [`SchedulerError::Busy`].

use super::core::{CoreService, LastBuild, ServiceError};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::{sync::Arc, time::Duration};
use thiserror::Error;
use tokio::{sync::Mutex, task::JoinHandle, time::MissedTickBehavior};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("a build is already in progress")]
    Busy,

    #[error(transparent)]
    Service(#[from] ServiceError),
}

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SchedulerStatus {
    pub running: bool,
    pub healthy: bool,
    pub build_in_progress: bool,
    pub interval_minutes: u64,
    pub cron_expression: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_attempt: Option<DateTime<Utc>>,
    pub ticks: u64,
    pub ticks_dropped: u64,
    pub builds_succeeded: u64,
    pub builds_failed: u64,
}

#[derive(Default)]
struct State {
    running: bool,
    build_in_progress: bool,
    last_attempt: Option<DateTime<Utc>>,
    ticks: u64,
    ticks_dropped: u64,
    builds_succeeded: u64,
    builds_failed: u64,
}

struct Inner {
    core: CoreService,
    interval: Duration,
    interval_minutes: u64,
    state: Mutex<State>,
    cancel: CancellationToken,
}

/// A handle to the scheduler; cloning shares the underlying state.
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<Inner>,
}

impl Scheduler {
    /// Starts the scheduler, returning a handle and the loop's
    /// [`JoinHandle`]. The first build is issued immediately but
    /// asynchronously, so startup is never blocked on a build.
    pub fn spawn(core: CoreService, interval_minutes: u64) -> (Self, JoinHandle<()>) {
        let inner = Arc::new(Inner {
            core,
            interval: Duration::from_secs(interval_minutes * 60),
            interval_minutes,
            state: Mutex::default(),
            cancel: CancellationToken::new(),
        });

        let scheduler = Self {
            inner: inner.clone(),
        };
        let handle = tokio::spawn(Self { inner }.run());
        (scheduler, handle)
    }

    async fn run(self) {
        self.inner.state.lock().await.running = true;
        tracing::info!(
            interval_minutes = self.inner.interval_minutes,
            cron = %cron_expression(self.inner.interval_minutes),
            "scheduler started"
        );

        let mut ticker = tokio::time::interval(self.inner.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                () = self.inner.cancel.cancelled() => break,
                _ = ticker.tick() => self.tick().await,
            }
        }

        self.inner.state.lock().await.running = false;
        tracing::info!("scheduler stopped");
    }

    async fn tick(&self) {
        {
            let mut state = self.inner.state.lock().await;
            state.ticks += 1;
            if state.build_in_progress {
                state.ticks_dropped += 1;
                tracing::warn!("previous build still in progress; dropping tick");
                return;
            }
            state.build_in_progress = true;
            state.last_attempt = Some(Utc::now());
        }

        // A failed build never stops the service; log and wait for the
        // next tick.
        let result = self.inner.core.build_and_sync().await;
        let mut state = self.inner.state.lock().await;
        state.build_in_progress = false;
        match result {
            Ok(_) => state.builds_succeeded += 1,
            Err(e) => {
                state.builds_failed += 1;
                tracing::error!("scheduled build failed: {e}");
            }
        }
    }

    /// Runs a build outside the periodic cadence, taking the same
    /// single-flight guard as a tick. Fails fast when a build is
    /// already in progress.
    pub async fn trigger(&self) -> Result<LastBuild, SchedulerError> {
        {
            let mut state = self.inner.state.lock().await;
            if state.build_in_progress {
                return Err(SchedulerError::Busy);
            }
            state.build_in_progress = true;
            state.last_attempt = Some(Utc::now());
        }

        let result = self.inner.core.build_and_sync().await;
        let mut state = self.inner.state.lock().await;
        state.build_in_progress = false;
        match result {
            Ok(build) => {
                state.builds_succeeded += 1;
                Ok(build)
            }
            Err(e) => {
                state.builds_failed += 1;
                Err(e.into())
            }
        }
    }

    /// Stops issuing ticks. An in-flight build is allowed to finish;
    /// this returns immediately after signalling.
    pub fn stop(&self) {
        self.inner.cancel.cancel();
    }

    pub async fn status(&self) -> SchedulerStatus {
        let state = self.inner.state.lock().await;
        SchedulerStatus {
            running: state.running,
            healthy: self.healthy_inner(&state),
            build_in_progress: state.build_in_progress,
            interval_minutes: self.inner.interval_minutes,
            cron_expression: cron_expression(self.inner.interval_minutes),
            last_attempt: state.last_attempt,
            ticks: state.ticks,
            ticks_dropped: state.ticks_dropped,
            builds_succeeded: state.builds_succeeded,
            builds_failed: state.builds_failed,
        }
    }

    pub async fn is_healthy(&self) -> bool {
        let state = self.inner.state.lock().await;
        self.healthy_inner(&state)
    }

    /// Unhealthy when not running, or when the last attempt is older
    /// than 1.5 intervals (the timer has drifted or stalled).
    fn healthy_inner(&self, state: &State) -> bool {
        if !state.running {
            return false;
        }
        match state.last_attempt {
            // The immediate startup tick has not claimed the flag yet.
            None => true,
            Some(at) => {
                let elapsed = Utc::now().signed_duration_since(at);
                let bound = self.inner.interval.as_secs_f64() * 1.5;
                elapsed.num_milliseconds() as f64 / 1000.0 <= bound
            }
        }
    }

    #[cfg(test)]
    async fn claim_build_flag(&self) {
        self.inner.state.lock().await.build_in_progress = true;
    }
}

/// Maps a scan interval in minutes onto the cron expression advertised
/// by the service descriptor.
pub fn cron_expression(minutes: u64) -> String {
    match minutes {
        1 => "* * * * *".to_string(),
        2..=59 => format!("*/{minutes} * * * *"),
        m if m % 60 == 0 => format!("0 */{hours} * * *", hours = m / 60),
        _ => format!("*/{minutes} * * * *"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        cache::{CacheClient, CacheConfig},
        datastore::MemoryDataStore,
    };

    #[test]
    fn cron_mapping_covers_the_interval_ranges() {
        assert_eq!(cron_expression(1), "* * * * *");
        assert_eq!(cron_expression(2), "*/2 * * * *");
        assert_eq!(cron_expression(59), "*/59 * * * *");
        assert_eq!(cron_expression(60), "0 */1 * * *");
        assert_eq!(cron_expression(180), "0 */3 * * *");
        assert_eq!(cron_expression(90), "*/90 * * * *");
    }

    async fn scheduler_over(dir: &std::path::Path) -> (Scheduler, JoinHandle<()>) {
        let cache = CacheClient::connect(&CacheConfig::default()).await;
        let core = CoreService::new(
            Arc::new(MemoryDataStore::default()),
            cache,
            dir.to_path_buf(),
            None,
        );
        // A long interval: only the immediate startup tick fires.
        Scheduler::spawn(core, 60)
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn startup_tick_builds_immediately() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.txt"), "a").unwrap();

        let (scheduler, handle) = scheduler_over(dir.path()).await;
        // Give the immediate tick a moment to run.
        tokio::time::sleep(Duration::from_millis(200)).await;

        let status = scheduler.status().await;
        assert!(status.running);
        assert!(status.healthy);
        assert_eq!(status.ticks, 1);
        assert_eq!(status.builds_succeeded, 1);
        assert!(status.last_attempt.is_some());

        scheduler.stop();
        handle.await.unwrap();
        assert!(!scheduler.status().await.running);
        assert!(!scheduler.is_healthy().await);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn manual_trigger_fails_fast_when_busy() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.txt"), "a").unwrap();

        let (scheduler, handle) = scheduler_over(dir.path()).await;
        tokio::time::sleep(Duration::from_millis(200)).await;

        scheduler.claim_build_flag().await;
        assert!(matches!(
            scheduler.trigger().await,
            Err(SchedulerError::Busy)
        ));

        scheduler.stop();
        handle.await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn manual_trigger_runs_a_build() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.txt"), "a").unwrap();

        let (scheduler, handle) = scheduler_over(dir.path()).await;
        tokio::time::sleep(Duration::from_millis(200)).await;

        // The startup build already committed; the triggered one is a
        // clean pass through the unchanged gate.
        let build = scheduler.trigger().await.unwrap();
        assert!(build.success);
        assert_eq!(build.written, Some(false));

        scheduler.stop();
        handle.await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn failed_builds_do_not_stop_the_scheduler() {
        let dir = tempfile::tempdir().unwrap();
        // Empty directory: every build fails with `Empty`.
        let (scheduler, handle) = scheduler_over(dir.path()).await;
        tokio::time::sleep(Duration::from_millis(200)).await;

        let status = scheduler.status().await;
        assert!(status.running);
        assert_eq!(status.builds_failed, 1);

        assert!(matches!(
            scheduler.trigger().await,
            Err(SchedulerError::Service(_))
        ));
        assert!(scheduler.status().await.running);

        scheduler.stop();
        handle.await.unwrap();
    }
}
