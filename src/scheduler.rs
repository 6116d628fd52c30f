//! Poll scheduler
//!
//! Drives the read → normalize → store pipeline on a fixed interval.
//!
//! ```text
//! Idle --start()--> Running --stop()--> Stopping --> Stopped
//! ```
//!
//! Each tick runs one full cycle inline, so a slow controller stretches that
//! cycle and delays the next tick; ticks are never queued or overlapped.

use chrono::Utc;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{error, info, warn};

use crate::normalize::Normalizer;
use crate::pool::{ControllerPool, PoolError};
use crate::registry::TagRegistry;
use crate::store::{SqliteStore, StoreError};
use crate::telemetry as m;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    Idle,
    Running,
    Stopping,
    Stopped,
}

#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error("scheduler cannot start from state {0:?}")]
    NotIdle(SchedulerState),
    #[error("poll interval must be greater than zero")]
    ZeroInterval,
    #[error("no controller could be connected")]
    NoControllers {
        #[source]
        source: Option<PoolError>,
    },
    #[error("failed to open time-series store: {0}")]
    StoreOpen(#[source] StoreError),
}

/// Cloneable, idempotent stop request
#[derive(Clone)]
pub struct StopHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl Default for StopHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl StopHandle {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    pub fn stop(&self) {
        self.tx.send_replace(true);
    }

    /// Resolves once a stop has been requested
    pub async fn stopped(&self) {
        let mut rx = self.tx.subscribe();
        let _ = rx.wait_for(|stop| *stop).await;
    }
}

/// What one cycle did
#[derive(Debug, Clone)]
pub struct CycleReport {
    pub timestamp_ns: i64,
    pub values_read: usize,
    pub bad_samples: usize,
    /// Rows committed; `None` when the batch failed
    pub written: Option<usize>,
    pub failed_controllers: Vec<String>,
    pub duration: Duration,
}

/// Totals over one `start()` run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub cycles: u64,
    pub failed_cycles: u64,
    pub samples_written: u64,
}

pub struct PollScheduler {
    pool: ControllerPool,
    normalizer: Normalizer,
    database: PathBuf,
    interval: Duration,
    stop: StopHandle,
    state_tx: watch::Sender<SchedulerState>,
    last_timestamp_ns: i64,
}

impl PollScheduler {
    pub fn new(
        registry: Arc<TagRegistry>,
        pool: ControllerPool,
        database: impl Into<PathBuf>,
        interval: Duration,
    ) -> Self {
        let (state_tx, _) = watch::channel(SchedulerState::Idle);
        Self {
            pool,
            normalizer: Normalizer::new(registry),
            database: database.into(),
            interval,
            stop: StopHandle::new(),
            state_tx,
            last_timestamp_ns: i64::MIN,
        }
    }

    pub fn stop_handle(&self) -> StopHandle {
        self.stop.clone()
    }

    pub fn state(&self) -> SchedulerState {
        *self.state_tx.borrow()
    }

    /// Observe state transitions from another task
    pub fn subscribe_state(&self) -> watch::Receiver<SchedulerState> {
        self.state_tx.subscribe()
    }

    fn set_state(&self, state: SchedulerState) {
        self.state_tx.send_replace(state);
        info!("Scheduler state: {:?}", state);
    }

    /// Connect, open the store and tick until stopped.
    ///
    /// Fails without entering `Running` when the interval is zero, no
    /// controller connects or the store cannot be opened; everything after
    /// that is logged per cycle.
    pub async fn start(&mut self) -> Result<RunSummary, SchedulerError> {
        let state = self.state();
        if state != SchedulerState::Idle {
            return Err(SchedulerError::NotIdle(state));
        }
        if self.interval.is_zero() {
            return Err(SchedulerError::ZeroInterval);
        }

        let connect_error = self.pool.connect_all().await.err();
        if let Some(e) = &connect_error {
            warn!("Continuing with a degraded controller pool: {}", e);
        }
        if self.pool.connected_count() == 0 {
            error!("No controller connected, aborting start");
            self.pool.disconnect_all().await;
            self.set_state(SchedulerState::Stopped);
            return Err(SchedulerError::NoControllers {
                source: connect_error,
            });
        }

        let store = match SqliteStore::open(&self.database).await {
            Ok(store) => store,
            Err(e) => {
                error!("Cannot open store {}: {}", self.database.display(), e);
                self.pool.disconnect_all().await;
                self.set_state(SchedulerState::Stopped);
                return Err(SchedulerError::StoreOpen(e));
            }
        };

        self.set_state(SchedulerState::Running);
        info!(
            "Polling {}/{} controllers every {:?}",
            self.pool.connected_count(),
            self.pool.len(),
            self.interval
        );

        let summary = self.run(&store).await;

        self.set_state(SchedulerState::Stopping);
        self.pool.disconnect_all().await;
        store.close().await;
        self.set_state(SchedulerState::Stopped);

        info!(
            "Scheduler stopped after {} cycles ({} failed, {} samples written)",
            summary.cycles, summary.failed_cycles, summary.samples_written
        );
        Ok(summary)
    }

    async fn run(&mut self, store: &SqliteStore) -> RunSummary {
        let mut stop_rx = self.stop.tx.subscribe();
        let mut ticker = interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut summary = RunSummary::default();

        loop {
            if *stop_rx.borrow_and_update() {
                info!("Stop requested");
                break;
            }

            tokio::select! {
                _ = ticker.tick() => {
                    let report = self.run_cycle(store).await;
                    summary.cycles += 1;
                    match report.written {
                        Some(n) => summary.samples_written += n as u64,
                        None => summary.failed_cycles += 1,
                    }
                }
                changed = stop_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }

        summary
    }

    /// Capture time for a new cycle, forced strictly past the previous one
    fn next_timestamp_ns(&mut self) -> i64 {
        let now = Utc::now().timestamp_nanos_opt().unwrap_or(i64::MAX);
        let ts = if now > self.last_timestamp_ns {
            now
        } else {
            self.last_timestamp_ns.saturating_add(1)
        };
        self.last_timestamp_ns = ts;
        ts
    }

    /// One read → normalize → append pass. Never fails; problems end up in the report.
    pub async fn run_cycle(&mut self, store: &SqliteStore) -> CycleReport {
        let started = Instant::now();
        let timestamp_ns = self.next_timestamp_ns();

        let (values, poll_error) = self.pool.poll_all().await.into_parts();
        let failed_controllers: Vec<String> = poll_error
            .as_ref()
            .map(|e| e.controllers().into_iter().map(String::from).collect())
            .unwrap_or_default();
        if let Some(e) = &poll_error {
            warn!("Partial poll: {}", e);
        }

        let batch = self.normalizer.normalize_batch(&values, timestamp_ns);
        let bad_samples = batch.bad_count();

        let written = match store.append_batch(&batch.samples, batch.timestamp()).await {
            Ok(n) => Some(n),
            Err(e) => {
                error!("Cycle at {} persisted nothing: {}", timestamp_ns, e);
                None
            }
        };

        let duration = started.elapsed();
        metrics::counter!(m::POLL_CYCLES).increment(1);
        metrics::counter!(m::BAD_SAMPLES).increment(bad_samples as u64);
        metrics::histogram!(m::CYCLE_DURATION).record(duration.as_secs_f64());
        match written {
            Some(n) => {
                metrics::counter!(m::SAMPLES_WRITTEN).increment(n as u64);
                info!(
                    "Cycle {}: wrote {}/{} samples ({} bad, {} controller errors) in {:?}",
                    timestamp_ns,
                    n,
                    batch.samples.len(),
                    bad_samples,
                    failed_controllers.len(),
                    duration
                );
            }
            None => metrics::counter!(m::FAILED_CYCLES).increment(1),
        }

        CycleReport {
            timestamp_ns,
            values_read: values.len(),
            bad_samples,
            written,
            failed_controllers,
            duration,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    fn registry(fail_b: bool) -> Arc<TagRegistry> {
        let config = Config::from_yaml_str(&format!(
            r#"
controllers:
  plantA: {{ host: 10.0.0.1, driver: {{ kind: simulated, fail_connect: true }} }}
  plantB: {{ host: 10.0.0.2, driver: {{ kind: simulated, fail_connect: {} }} }}
tags:
  temp: {{ controller: plantA, type: float32, scale_factor: 2.0 }}
  level: {{ controller: plantB, type: uint16 }}
  running: {{ controller: plantB, type: bool }}
database: {{ path: unused.db }}
polling: {{ interval_ms: 10 }}
"#,
            fail_b
        ))
        .unwrap();
        Arc::new(TagRegistry::from_config(&config).unwrap())
    }

    fn scheduler(registry: Arc<TagRegistry>, db: PathBuf) -> PollScheduler {
        let pool = ControllerPool::from_registry(&registry, None);
        PollScheduler::new(registry, pool, db, Duration::from_millis(10))
    }

    #[tokio::test]
    async fn test_zero_controllers_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let mut scheduler = scheduler(registry(true), dir.path().join("plc.db"));

        let err = scheduler.start().await.unwrap_err();
        match err {
            SchedulerError::NoControllers { source } => {
                assert_eq!(source.unwrap().failures.len(), 2);
            }
            other => panic!("unexpected error: {}", other),
        }
        assert_eq!(scheduler.state(), SchedulerState::Stopped);
        assert!(!dir.path().join("plc.db").exists());
    }

    #[tokio::test]
    async fn test_store_open_failure_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        // a directory where the database file should be
        let mut scheduler = scheduler(registry(false), dir.path().to_path_buf());

        let err = scheduler.start().await.unwrap_err();
        assert!(matches!(err, SchedulerError::StoreOpen(_)));
        assert_eq!(scheduler.state(), SchedulerState::Stopped);
    }

    #[tokio::test]
    async fn test_runs_degraded_until_stopped() {
        let dir = tempfile::tempdir().unwrap();
        let db = dir.path().join("plc.db");
        let mut scheduler = scheduler(registry(false), db.clone());
        let stop = scheduler.stop_handle();
        let mut states = scheduler.subscribe_state();

        let run = tokio::spawn(async move {
            let summary = scheduler.start().await;
            (scheduler, summary)
        });

        states
            .wait_for(|s| *s == SchedulerState::Running)
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(60)).await;
        stop.stop();
        stop.stop();

        let (scheduler, summary) = run.await.unwrap();
        let summary = summary.unwrap();
        assert_eq!(scheduler.state(), SchedulerState::Stopped);
        assert!(summary.cycles >= 1);
        assert_eq!(summary.failed_cycles, 0);
        // plantB has two tags, plantA never connected
        assert_eq!(summary.samples_written, summary.cycles * 2);

        let store = SqliteStore::open(&db).await.unwrap();
        let stats = store.stats().await.unwrap();
        assert_eq!(stats.distinct_timestamps as u64, summary.cycles);
        assert!(store
            .recent(&["plantA/temp".to_string()], 10)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_zero_interval_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let registry = registry(false);
        let pool = ControllerPool::from_registry(&registry, None);
        let mut scheduler =
            PollScheduler::new(registry, pool, dir.path().join("plc.db"), Duration::ZERO);

        assert!(matches!(
            scheduler.start().await,
            Err(SchedulerError::ZeroInterval)
        ));
        assert_eq!(scheduler.state(), SchedulerState::Idle);
        assert_eq!(scheduler.pool.connected_count(), 0);
    }

    #[tokio::test]
    async fn test_start_twice_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut scheduler = scheduler(registry(false), dir.path().join("plc.db"));
        scheduler.stop_handle().stop();

        let summary = scheduler.start().await.unwrap();
        assert_eq!(summary.cycles, 0);
        assert!(matches!(
            scheduler.start().await,
            Err(SchedulerError::NotIdle(SchedulerState::Stopped))
        ));
    }

    #[tokio::test]
    async fn test_cycle_timestamps_strictly_increase() {
        let mut scheduler = scheduler(registry(false), PathBuf::from("unused.db"));
        let store = SqliteStore::open_in_memory().await.unwrap();
        let _ = scheduler.pool.connect_all().await;

        let first = scheduler.run_cycle(&store).await;
        let second = scheduler.run_cycle(&store).await;
        assert!(second.timestamp_ns > first.timestamp_ns);
        assert_eq!(first.failed_controllers, vec!["plantA".to_string()]);
        assert_eq!(first.written, Some(2));

        scheduler.last_timestamp_ns = i64::MAX - 1;
        assert_eq!(scheduler.next_timestamp_ns(), i64::MAX);
    }
}
