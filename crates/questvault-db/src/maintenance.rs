//! Background maintenance scheduler.
//!
//! After a warm-up delay the scheduler runs one maintenance pass per
//! interval against the active backend:
//!
//! 1. optimize (planner statistics, shrink in-memory maps)
//! 2. rebuild secondary indexes, once per rebuild cadence (weekly)
//! 3. compact the backing store, once per compaction cadence (monthly)
//! 4. create a backup and prune old ones, once per backup interval
//! 5. retention cleanup of synced offline data, finished action targets
//!    and ended battles
//!
//! A failed pass is logged and followed by the shorter failure back-off
//! instead of the regular interval. Nothing a pass does can end the
//! loop; only [`MaintenanceScheduler::stop`] does, and it interrupts a
//! pass that is still running.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex as SyncMutex, RwLock};
use questvault_types::MaintenanceStatus;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::backend::MaintenanceOps;
use crate::backup::BackupManager;
use crate::error::StoreResult;

const HOUR: Duration = Duration::from_secs(60 * 60);
const DAY: Duration = Duration::from_secs(24 * 60 * 60);

/// How long finished records are kept before retention cleanup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetentionWindows {
    /// Synced offline data.
    pub offline_data: Duration,
    /// Completed, cancelled or superseded action targets.
    pub action_history: Duration,
    /// Completed or aborted battles.
    pub battle_history: Duration,
}

impl Default for RetentionWindows {
    fn default() -> Self {
        Self {
            offline_data: DAY.saturating_mul(7),
            action_history: DAY.saturating_mul(30),
            battle_history: DAY.saturating_mul(90),
        }
    }
}

/// Scheduler timing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MaintenanceConfig {
    /// Delay between start and the first pass.
    pub warmup: Duration,
    /// Delay between successful passes.
    pub interval: Duration,
    /// Delay after a failed pass.
    pub failure_backoff: Duration,
    /// Minimum time between index rebuilds.
    pub index_rebuild_every: Duration,
    /// Minimum time between compactions.
    pub compaction_every: Duration,
    /// Minimum time between backups.
    pub backup_every: Duration,
    /// Retention cleanup windows.
    pub retention: RetentionWindows,
}

impl Default for MaintenanceConfig {
    fn default() -> Self {
        Self {
            warmup: Duration::from_secs(5 * 60),
            interval: HOUR.saturating_mul(6),
            failure_backoff: HOUR,
            index_rebuild_every: DAY.saturating_mul(7),
            compaction_every: DAY.saturating_mul(30),
            backup_every: DAY,
            retention: RetentionWindows::default(),
        }
    }
}

/// What one pass did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PassReport {
    /// Index entries rebuilt, when a rebuild was due.
    pub rebuilt_indexes: Option<u64>,
    /// Whether the store was compacted.
    pub compacted: bool,
    /// New backup artifact, when a backup was due.
    pub backup: Option<PathBuf>,
    /// Backup artifacts removed by retention.
    pub pruned_backups: usize,
    /// Synced offline-data rows removed.
    pub offline_data_removed: u64,
    /// Finished action targets removed.
    pub action_targets_removed: u64,
    /// Ended battles removed.
    pub battles_removed: u64,
}

#[derive(Debug, Clone, Copy)]
struct Cadence {
    last_rebuild: Instant,
    last_compaction: Instant,
    last_backup: Option<Instant>,
}

fn due(last: Instant, every: Duration, now: Instant) -> bool {
    now.saturating_duration_since(last) >= every
}

fn cutoff(now: DateTime<Utc>, window: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(window)
        .ok()
        .and_then(|w| now.checked_sub_signed(w))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

/// Periodic maintenance over one backend.
pub struct MaintenanceScheduler<M: MaintenanceOps + ?Sized> {
    ops: Arc<M>,
    config: MaintenanceConfig,
    backups: Option<BackupManager>,
    cadence: SyncMutex<Cadence>,
    status: RwLock<MaintenanceStatus>,
    shutdown: watch::Sender<bool>,
    worker: SyncMutex<Option<JoinHandle<()>>>,
}

impl<M: MaintenanceOps + ?Sized + 'static> MaintenanceScheduler<M> {
    /// Create a scheduler. Backups are skipped when `backups` is `None`.
    ///
    /// Rebuild and compaction cadences count from construction; the first
    /// backup is due on the first pass.
    pub fn new(ops: Arc<M>, config: MaintenanceConfig, backups: Option<BackupManager>) -> Self {
        let now = Instant::now();
        let (shutdown, _) = watch::channel(false);
        Self {
            ops,
            config,
            backups,
            cadence: SyncMutex::new(Cadence {
                last_rebuild: now,
                last_compaction: now,
                last_backup: None,
            }),
            status: RwLock::new(MaintenanceStatus::default()),
            shutdown,
            worker: SyncMutex::new(None),
        }
    }

    /// Snapshot of the scheduler's status.
    pub fn status(&self) -> MaintenanceStatus {
        self.status.read().clone()
    }

    /// Run one pass now. Steps run in order and the first failure ends
    /// the pass.
    ///
    /// # Errors
    ///
    /// Returns the failing step's error.
    pub async fn run_pass(&self) -> StoreResult<PassReport> {
        let mut report = PassReport::default();
        let now = Instant::now();
        let cadence = *self.cadence.lock();

        self.ops.optimize().await?;
        tracing::info!(backend = self.ops.kind(), "Maintenance: optimized");

        if due(cadence.last_rebuild, self.config.index_rebuild_every, now) {
            let rebuilt = self.ops.rebuild_indexes().await?;
            self.cadence.lock().last_rebuild = now;
            tracing::info!(backend = self.ops.kind(), entries = rebuilt, "Maintenance: rebuilt indexes");
            report.rebuilt_indexes = Some(rebuilt);
        }

        if due(cadence.last_compaction, self.config.compaction_every, now) {
            self.ops.compact().await?;
            self.cadence.lock().last_compaction = now;
            tracing::info!(backend = self.ops.kind(), "Maintenance: compacted");
            report.compacted = true;
        }

        if let Some(backups) = &self.backups {
            let backup_due = cadence
                .last_backup
                .is_none_or(|last| due(last, self.config.backup_every, now));
            if backup_due {
                let artifact = backups.create(self.ops.as_ref()).await?;
                self.cadence.lock().last_backup = Some(now);
                report.pruned_backups = backups.prune(Utc::now()).await?.len();
                self.status.write().last_backup = Some(artifact.path.display().to_string());
                report.backup = Some(artifact.path);
            }
        }

        let wall = Utc::now();
        let windows = self.config.retention;
        report.offline_data_removed = self
            .ops
            .cleanup_synced_offline_data(cutoff(wall, windows.offline_data))
            .await?;
        report.action_targets_removed = self.ops.cleanup_action_history(cutoff(wall, windows.action_history)).await?;
        report.battles_removed = self.ops.cleanup_battle_records(cutoff(wall, windows.battle_history)).await?;
        tracing::info!(
            backend = self.ops.kind(),
            offline_data = report.offline_data_removed,
            action_targets = report.action_targets_removed,
            battles = report.battles_removed,
            "Maintenance: retention cleanup"
        );
        Ok(report)
    }

    fn record(&self, outcome: &StoreResult<PassReport>) {
        let mut status = self.status.write();
        match outcome {
            Ok(_) => {
                status.passes_completed = status.passes_completed.saturating_add(1);
                status.consecutive_failures = 0;
                status.last_success_at = Some(Utc::now());
                status.last_error = None;
            }
            Err(e) => {
                status.passes_failed = status.passes_failed.saturating_add(1);
                status.consecutive_failures = status.consecutive_failures.saturating_add(1);
                status.last_error = Some(e.to_string());
            }
        }
    }

    /// Spawn the maintenance loop. Calling it again while running is a
    /// no-op.
    pub fn start(self: &Arc<Self>) {
        let mut worker = self.worker.lock();
        if worker.is_some() {
            return;
        }
        self.status.write().running = true;
        let scheduler = Arc::clone(self);
        let stop = self.shutdown.subscribe();
        *worker = Some(tokio::spawn(async move { scheduler.run(stop).await }));
        tracing::info!(
            backend = self.ops.kind(),
            warmup_secs = self.config.warmup.as_secs(),
            interval_secs = self.config.interval.as_secs(),
            "Maintenance scheduler started"
        );
    }

    async fn run(&self, mut stop: watch::Receiver<bool>) {
        let mut delay = self.config.warmup;
        loop {
            tokio::select! {
                () = tokio::time::sleep(delay) => {}
                _ = stop.changed() => break,
            }
            if *stop.borrow() {
                break;
            }

            let outcome = tokio::select! {
                outcome = self.run_pass() => outcome,
                _ = stop.changed() => {
                    tracing::info!("Maintenance pass interrupted by shutdown");
                    break;
                }
            };
            self.record(&outcome);
            delay = match &outcome {
                Ok(_) => self.config.interval,
                Err(e) => {
                    tracing::warn!(
                        backend = self.ops.kind(),
                        error = %e,
                        backoff_secs = self.config.failure_backoff.as_secs(),
                        "Maintenance pass failed, backing off"
                    );
                    self.config.failure_backoff
                }
            };
        }
        self.status.write().running = false;
    }

    /// Stop the loop, interrupting a running pass, and wait for it.
    pub async fn stop(&self) {
        let _ = self.shutdown.send(true);
        let handle = self.worker.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                tracing::warn!(error = %e, "Maintenance task ended abnormally");
            }
        }
        self.status.write().running = false;
        tracing::info!("Maintenance scheduler stopped");
    }
}
