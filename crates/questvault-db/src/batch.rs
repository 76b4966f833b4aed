//! Batch write coordinator.
//!
//! Saves are queued per entity class and committed by a flush, triggered
//! by whichever comes first: the queue reaching `max_batch_size`, or the
//! flush timer. A queued save for a key replaces any earlier queued save
//! for the same key, so a flush only ever commits the newest value and
//! flushes for a class never overlap.
//!
//! Player flushes go through [`StorageBackend::batch_save_players`] (one
//! transaction on relational backends); other classes commit item by
//! item. Either way a bad item fails alone and is only reported in the
//! [`BatchResult`]; resubmitting it is the caller's decision.
//!
//! Items taken by a running flush stay readable through
//! [`WriteCoordinator::pending_player`] until their commit finishes. A
//! direct write routed through [`WriteCoordinator::write_through`] waits
//! for any running flush of its class and then supersedes the queued save
//! for its key.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex as SyncMutex;
use questvault_types::{
    ActionTarget, BatchResult, BattleRecord, ClassWriteStats, EntityKind, OfflineData, Player, PlayerId, Team,
};
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::backend::StorageBackend;
use crate::error::{StoreError, StoreResult};

/// Default queue length that triggers a flush.
pub const DEFAULT_MAX_BATCH_SIZE: usize = 100;

/// Default flush timer period.
pub const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_secs(5);

/// Classes with a queue, in flush order.
const QUEUED_KINDS: [EntityKind; 5] = [
    EntityKind::Player,
    EntityKind::Team,
    EntityKind::ActionTarget,
    EntityKind::BattleRecord,
    EntityKind::OfflineData,
];

/// Batch coordinator settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchConfig {
    /// Queue length that triggers an immediate flush.
    pub max_batch_size: usize,
    /// Period of the background flush timer.
    pub flush_interval: Duration,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            max_batch_size: DEFAULT_MAX_BATCH_SIZE,
            flush_interval: DEFAULT_FLUSH_INTERVAL,
        }
    }
}

/// One queued save.
#[derive(Debug, Clone)]
pub enum PendingWrite {
    /// Save a player.
    Player(Player),
    /// Save a team.
    Team(Team),
    /// Save an action target.
    ActionTarget(ActionTarget),
    /// Save a battle record.
    BattleRecord(BattleRecord),
    /// Save an offline-data delta.
    OfflineData(OfflineData),
}

impl PendingWrite {
    /// Entity class of the write.
    pub const fn kind(&self) -> EntityKind {
        match self {
            Self::Player(_) => EntityKind::Player,
            Self::Team(_) => EntityKind::Team,
            Self::ActionTarget(_) => EntityKind::ActionTarget,
            Self::BattleRecord(_) => EntityKind::BattleRecord,
            Self::OfflineData(_) => EntityKind::OfflineData,
        }
    }

    /// Key the write replaces.
    pub fn key(&self) -> &str {
        match self {
            Self::Player(p) => p.id.as_str(),
            Self::Team(t) => t.id.as_str(),
            Self::ActionTarget(a) => a.id.as_str(),
            Self::BattleRecord(b) => b.id.as_str(),
            Self::OfflineData(o) => o.id.as_str(),
        }
    }
}

#[derive(Debug, Default)]
struct Queue {
    items: HashMap<String, (u64, PendingWrite)>,
    in_flight: HashMap<String, PendingWrite>,
    next_seq: u64,
}

#[derive(Debug, Default, Clone, Copy)]
struct Metrics {
    submitted: u64,
    coalesced: u64,
    flushed: u64,
    failed: u64,
    flush_count: u64,
    flush_time: Duration,
}

#[derive(Debug, Default)]
struct ClassQueue {
    queue: SyncMutex<Queue>,
    flushing: Mutex<()>,
    metrics: SyncMutex<Metrics>,
}

impl ClassQueue {
    fn len(&self) -> usize {
        self.queue.lock().items.len()
    }

    /// Queue `write`; returns the queue length afterwards.
    fn push(&self, write: PendingWrite) -> usize {
        let mut queue = self.queue.lock();
        let seq = queue.next_seq;
        queue.next_seq = seq.wrapping_add(1);
        let replaced = queue.items.insert(write.key().to_owned(), (seq, write)).is_some();
        let len = queue.items.len();
        drop(queue);

        let mut metrics = self.metrics.lock();
        metrics.submitted = metrics.submitted.saturating_add(1);
        if replaced {
            metrics.coalesced = metrics.coalesced.saturating_add(1);
        }
        len
    }

    /// Take everything queued, oldest submission first. The taken writes
    /// stay visible as in flight until [`settle`](Self::settle).
    fn drain(&self) -> Vec<PendingWrite> {
        let mut queue = self.queue.lock();
        let items = std::mem::take(&mut queue.items);
        let ordered: BTreeMap<u64, PendingWrite> = items.into_values().collect();
        queue.in_flight = ordered
            .values()
            .map(|w| (w.key().to_owned(), w.clone()))
            .collect();
        drop(queue);
        ordered.into_values().collect()
    }

    fn settle(&self) {
        self.queue.lock().in_flight.clear();
    }

    /// Newest queued or in-flight write for `key`.
    fn newest(&self, key: &str) -> Option<PendingWrite> {
        let queue = self.queue.lock();
        queue
            .items
            .get(key)
            .map(|(_, w)| w)
            .or_else(|| queue.in_flight.get(key))
            .cloned()
    }

    /// Drop queued saves for `keys`; returns how many were dropped.
    fn discard<'k>(&self, keys: impl IntoIterator<Item = &'k str>) -> usize {
        let mut queue = self.queue.lock();
        keys.into_iter()
            .filter(|key| queue.items.remove(*key).is_some())
            .count()
    }
}

/// Accumulates saves and commits them in batches.
pub struct WriteCoordinator {
    backend: Arc<dyn StorageBackend>,
    config: BatchConfig,
    classes: HashMap<EntityKind, ClassQueue>,
    shutdown: watch::Sender<bool>,
    timer: SyncMutex<Option<JoinHandle<()>>>,
}

impl WriteCoordinator {
    /// Create a coordinator committing to `backend`. Call
    /// [`start`](Self::start) to run the flush timer.
    pub fn new(backend: Arc<dyn StorageBackend>, config: BatchConfig) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            backend,
            config: BatchConfig {
                max_batch_size: config.max_batch_size.max(1),
                ..config
            },
            classes: QUEUED_KINDS.iter().map(|k| (*k, ClassQueue::default())).collect(),
            shutdown,
            timer: SyncMutex::new(None),
        }
    }

    /// Effective settings.
    pub const fn config(&self) -> BatchConfig {
        self.config
    }

    fn class(&self, kind: EntityKind) -> StoreResult<&ClassQueue> {
        self.classes
            .get(&kind)
            .ok_or_else(|| StoreError::Validation(format!("no batch queue for {kind}")))
    }

    /// Queue a save. If the class queue reaches `max_batch_size` the
    /// class is flushed before returning and its result is returned.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Validation`] for a blank key.
    pub async fn submit(&self, write: PendingWrite) -> StoreResult<Option<BatchResult>> {
        if write.key().trim().is_empty() {
            return Err(StoreError::Validation(String::from("queued entity key must not be empty")));
        }
        let kind = write.kind();
        let len = self.class(kind)?.push(write);
        if len >= self.config.max_batch_size {
            tracing::debug!(kind = %kind, queued = len, "Batch size reached, flushing");
            return self.flush(kind).await.map(Some);
        }
        Ok(None)
    }

    /// Queue a player save.
    ///
    /// # Errors
    ///
    /// See [`submit`](Self::submit).
    pub async fn save_player(&self, player: Player) -> StoreResult<Option<BatchResult>> {
        self.submit(PendingWrite::Player(player)).await
    }

    /// Queue a team save.
    ///
    /// # Errors
    ///
    /// See [`submit`](Self::submit).
    pub async fn save_team(&self, team: Team) -> StoreResult<Option<BatchResult>> {
        self.submit(PendingWrite::Team(team)).await
    }

    /// Queue an action-target save.
    ///
    /// # Errors
    ///
    /// See [`submit`](Self::submit).
    pub async fn save_action_target(&self, target: ActionTarget) -> StoreResult<Option<BatchResult>> {
        self.submit(PendingWrite::ActionTarget(target)).await
    }

    /// Queue a battle-record save.
    ///
    /// # Errors
    ///
    /// See [`submit`](Self::submit).
    pub async fn save_battle_record(&self, record: BattleRecord) -> StoreResult<Option<BatchResult>> {
        self.submit(PendingWrite::BattleRecord(record)).await
    }

    /// Queue an offline-data save.
    ///
    /// # Errors
    ///
    /// See [`submit`](Self::submit).
    pub async fn save_offline_data(&self, data: OfflineData) -> StoreResult<Option<BatchResult>> {
        self.submit(PendingWrite::OfflineData(data)).await
    }

    /// The newest save for a player that is queued or being flushed but
    /// not yet committed.
    pub fn pending_player(&self, id: &PlayerId) -> Option<Player> {
        match self.classes.get(&EntityKind::Player)?.newest(id.as_str()) {
            Some(PendingWrite::Player(player)) => Some(player),
            _ => None,
        }
    }

    /// Run a direct write for `key` of class `kind`, ordered after any
    /// running flush of that class. When the write succeeds the queued
    /// save for `key`, if any, is dropped so a later flush cannot
    /// overwrite it with an older value.
    ///
    /// # Errors
    ///
    /// Returns whatever `write` returns; the queue is untouched then.
    pub async fn write_through<T, F>(&self, kind: EntityKind, key: &str, write: F) -> StoreResult<T>
    where
        F: Future<Output = StoreResult<T>> + Send,
    {
        let class = self.class(kind)?;
        let _flushing = class.flushing.lock().await;
        let written = write.await?;
        if class.discard([key]) > 0 {
            tracing::debug!(kind = %kind, key, "Direct write superseded a queued save");
        }
        Ok(written)
    }

    /// Save `players` directly in one batch, ordered after any running
    /// player flush. Queued saves are dropped for every player the batch
    /// persisted.
    ///
    /// # Errors
    ///
    /// Returns the backend error when the whole batch failed.
    pub async fn save_players_now(&self, players: Vec<Player>) -> StoreResult<BatchResult> {
        let class = self.class(EntityKind::Player)?;
        let _flushing = class.flushing.lock().await;
        let keys: Vec<String> = players.iter().map(|p| p.id.as_str().to_owned()).collect();
        let result = self.backend.batch_save_players(players).await?;
        let persisted = keys.iter().filter(|key| {
            let prefix = format!("{key}: ");
            !result.errors.iter().any(|e| e.starts_with(&prefix))
        });
        class.discard(persisted.map(String::as_str));
        Ok(result)
    }

    /// Total number of queued saves across classes.
    pub fn pending_count(&self) -> u64 {
        let total: usize = self.classes.values().map(ClassQueue::len).sum();
        u64::try_from(total).unwrap_or(u64::MAX)
    }

    /// Commit everything queued for `kind`.
    ///
    /// # Errors
    ///
    /// Only fails for a class without a queue; backend failures are
    /// reported per item in the returned [`BatchResult`].
    pub async fn flush(&self, kind: EntityKind) -> StoreResult<BatchResult> {
        let class = self.class(kind)?;
        let _flushing = class.flushing.lock().await;
        let writes = class.drain();
        if writes.is_empty() {
            return Ok(BatchResult::default());
        }

        let started = Instant::now();
        let count = writes.len();
        let result = self.commit(writes).await;
        class.settle();
        let elapsed = started.elapsed();

        {
            let mut metrics = class.metrics.lock();
            metrics.flushed = metrics.flushed.saturating_add(result.success_count);
            metrics.failed = metrics.failed.saturating_add(result.error_count);
            metrics.flush_count = metrics.flush_count.saturating_add(1);
            metrics.flush_time = metrics.flush_time.saturating_add(elapsed);
        }

        if result.error_count > 0 {
            tracing::warn!(
                kind = %kind,
                items = count,
                succeeded = result.success_count,
                failed = result.error_count,
                "Batch flush had failures"
            );
        } else {
            tracing::debug!(
                kind = %kind,
                items = count,
                elapsed_ms = u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX),
                "Batch flushed"
            );
        }
        Ok(result)
    }

    /// Flush every class.
    pub async fn flush_all(&self) -> BatchResult {
        let mut total = BatchResult::default();
        for kind in QUEUED_KINDS {
            match self.flush(kind).await {
                Ok(result) => total.merge(result),
                Err(e) => total.record_failure(kind.as_str(), e),
            }
        }
        total
    }

    async fn commit(&self, writes: Vec<PendingWrite>) -> BatchResult {
        let mut players = Vec::new();
        let mut others = Vec::new();
        for write in writes {
            match write {
                PendingWrite::Player(p) => players.push(p),
                other => others.push(other),
            }
        }

        let mut result = BatchResult::default();
        if !players.is_empty() {
            let keys: Vec<PlayerId> = players.iter().map(|p| p.id.clone()).collect();
            match self.backend.batch_save_players(players).await {
                Ok(batch) => result.merge(batch),
                Err(e) => {
                    for key in keys {
                        result.record_failure(key.as_str(), &e);
                    }
                }
            }
        }
        for write in others {
            match self.commit_one(&write).await {
                Ok(()) => result.record_success(),
                Err(e) => result.record_failure(write.key(), &e),
            }
        }
        result
    }

    async fn commit_one(&self, write: &PendingWrite) -> StoreResult<()> {
        match write {
            PendingWrite::Player(p) => self.backend.save_player(p.clone()).await.map(drop),
            PendingWrite::Team(t) => self.backend.save_team(t.clone()).await.map(drop),
            PendingWrite::ActionTarget(a) => self.backend.save_action_target(a.clone()).await.map(drop),
            PendingWrite::BattleRecord(b) => self.backend.save_battle_record(b.clone()).await.map(drop),
            PendingWrite::OfflineData(o) => self.backend.save_offline_data(o.clone()).await.map(drop),
        }
    }

    /// Per-class counters.
    pub fn metrics(&self) -> Vec<ClassWriteStats> {
        QUEUED_KINDS
            .iter()
            .filter_map(|kind| {
                let class = self.classes.get(kind)?;
                let m = *class.metrics.lock();
                #[allow(clippy::cast_precision_loss)]
                let average_flush_ms = if m.flush_count == 0 {
                    0.0
                } else {
                    m.flush_time.as_secs_f64() * 1000.0 / m.flush_count as f64
                };
                Some(ClassWriteStats {
                    kind: *kind,
                    pending: u64::try_from(class.len()).unwrap_or(u64::MAX),
                    submitted: m.submitted,
                    coalesced: m.coalesced,
                    flushed: m.flushed,
                    failed: m.failed,
                    flush_count: m.flush_count,
                    average_flush_ms,
                })
            })
            .collect()
    }

    /// Spawn the flush timer. Calling it again while running is a no-op.
    pub fn start(self: &Arc<Self>) {
        let mut timer = self.timer.lock();
        if timer.is_some() {
            return;
        }
        let coordinator = Arc::clone(self);
        let mut stop = self.shutdown.subscribe();
        let period = self.config.flush_interval;
        *timer = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately.
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let result = coordinator.flush_all().await;
                        if result.total() > 0 {
                            tracing::trace!(
                                succeeded = result.success_count,
                                failed = result.error_count,
                                "Timed flush"
                            );
                        }
                    }
                    changed = stop.changed() => {
                        if changed.is_err() || *stop.borrow() {
                            break;
                        }
                    }
                }
            }
        }));
        tracing::info!(
            interval_ms = u64::try_from(period.as_millis()).unwrap_or(u64::MAX),
            max_batch_size = self.config.max_batch_size,
            "Batch write coordinator started"
        );
    }

    /// Stop the timer and flush what is still queued.
    pub async fn shutdown(&self) -> BatchResult {
        let _ = self.shutdown.send(true);
        let handle = self.timer.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                tracing::warn!(error = %e, "Batch timer task ended abnormally");
            }
        }
        let result = self.flush_all().await;
        tracing::info!(
            succeeded = result.success_count,
            failed = result.error_count,
            "Batch write coordinator drained"
        );
        result
    }
}

#[cfg(test)]
mod tests {
    use questvault_types::TeamId;

    use super::*;
    use crate::credentials::{AccountPolicy, CredentialHasher};
    use crate::memory::MemoryBackend;

    fn setup(config: BatchConfig) -> Option<(Arc<MemoryBackend>, Arc<WriteCoordinator>)> {
        let policy = AccountPolicy::new(CredentialHasher::fast().ok()?);
        let backend = Arc::new(MemoryBackend::new(policy));
        let coordinator = Arc::new(WriteCoordinator::new(backend.clone(), config));
        Some((backend, coordinator))
    }

    fn player(id: &str, level: u32) -> Player {
        let mut p = Player::new(PlayerId::from(id), id);
        p.level = level;
        p
    }

    #[tokio::test]
    async fn later_save_for_same_key_wins() {
        let Some((backend, coordinator)) = setup(BatchConfig::default()) else {
            return;
        };
        let _ = coordinator.save_player(player("char-1", 1)).await;
        let _ = coordinator.save_player(player("char-1", 3)).await;
        assert_eq!(coordinator.pending_player(&PlayerId::from("char-1")).map(|p| p.level), Some(3));

        let result = coordinator.flush(EntityKind::Player).await;
        assert_eq!(result.map(|r| r.success_count).ok(), Some(1));
        assert_eq!(backend.get_player(&PlayerId::from("char-1")).await.map(|p| p.level).ok(), Some(3));

        let stats = coordinator.metrics();
        let players = stats.iter().find(|s| s.kind == EntityKind::Player);
        assert!(players.is_some_and(|s| s.submitted == 2 && s.coalesced == 1 && s.flushed == 1));
    }

    #[tokio::test]
    async fn size_threshold_flushes_inline() {
        let config = BatchConfig {
            max_batch_size: 3,
            flush_interval: Duration::from_secs(3600),
        };
        let Some((backend, coordinator)) = setup(config) else {
            return;
        };
        assert!(matches!(coordinator.save_player(player("a", 1)).await, Ok(None)));
        assert!(matches!(coordinator.save_player(player("b", 1)).await, Ok(None)));
        let third = coordinator.save_player(player("c", 1)).await;
        assert!(third.is_ok_and(|r| r.is_some_and(|r| r.success_count == 3)));
        assert_eq!(coordinator.pending_count(), 0);
        assert!(backend.get_player(&PlayerId::from("b")).await.is_ok());
    }

    #[tokio::test]
    async fn partial_failure_reports_each_item() {
        let Some((backend, coordinator)) = setup(BatchConfig::default()) else {
            return;
        };
        for id in ["ok-1", "ok-2", "ok-3"] {
            let _ = coordinator.save_player(player(id, 2)).await;
        }
        let _ = coordinator.save_player(player("bad-1", 0)).await;
        let _ = coordinator.save_team(Team::new(TeamId::from("t-1"), "Vanguard", PlayerId::from("ok-1"))).await;

        let result = coordinator.flush_all().await;
        assert_eq!(result.success_count, 4);
        assert_eq!(result.error_count, 1);
        assert!(result.errors.iter().any(|e| e.contains("bad-1")));
        assert!(backend.get_player(&PlayerId::from("ok-3")).await.is_ok());
        assert_eq!(coordinator.pending_count(), 0);
    }

    #[tokio::test]
    async fn failed_items_are_reported_once_and_dropped() {
        let Some((backend, coordinator)) = setup(BatchConfig::default()) else {
            return;
        };
        let _ = coordinator.save_player(player("bad-1", 0)).await;
        let first = coordinator.flush_all().await;
        assert_eq!(first.error_count, 1);
        assert_eq!(coordinator.pending_count(), 0);

        let second = coordinator.flush_all().await;
        assert_eq!(second.total(), 0);
        assert!(backend.get_player(&PlayerId::from("bad-1")).await.is_err());
    }

    #[test]
    fn drained_writes_stay_visible_until_settled() {
        let class = ClassQueue::default();
        class.push(PendingWrite::Player(player("char-1", 2)));
        let drained = class.drain();
        assert_eq!(drained.len(), 1);
        assert_eq!(class.len(), 0);
        assert!(matches!(class.newest("char-1"), Some(PendingWrite::Player(p)) if p.level == 2));

        class.push(PendingWrite::Player(player("char-1", 4)));
        assert!(matches!(class.newest("char-1"), Some(PendingWrite::Player(p)) if p.level == 4));
        let _ = class.drain();

        class.settle();
        assert!(class.newest("char-1").is_none());
    }

    #[tokio::test]
    async fn write_through_drops_the_queued_save_only_on_success() {
        let Some((backend, coordinator)) = setup(BatchConfig::default()) else {
            return;
        };
        let id = PlayerId::from("char-2");
        let _ = coordinator.save_player(player("char-2", 3)).await;

        let rejected = coordinator
            .write_through(EntityKind::Player, id.as_str(), backend.save_player(player("char-2", 0)))
            .await;
        assert!(rejected.is_err());
        assert_eq!(coordinator.pending_player(&id).map(|p| p.level), Some(3));

        let written = coordinator
            .write_through(EntityKind::Player, id.as_str(), backend.save_player(player("char-2", 5)))
            .await;
        assert!(written.is_ok());
        assert!(coordinator.pending_player(&id).is_none());
        assert_eq!(coordinator.flush_all().await.total(), 0);
        assert_eq!(backend.get_player(&id).await.map(|p| p.level).ok(), Some(5));
    }

    #[tokio::test]
    async fn direct_batch_drops_queued_saves_it_persisted() {
        let Some((backend, coordinator)) = setup(BatchConfig::default()) else {
            return;
        };
        let _ = coordinator.save_player(player("kept", 2)).await;
        let _ = coordinator.save_player(player("replaced", 2)).await;

        let result = coordinator
            .save_players_now(vec![player("replaced", 6), player("kept", 0)])
            .await;
        assert!(result.is_ok_and(|r| r.success_count == 1 && r.error_count == 1));
        assert!(coordinator.pending_player(&PlayerId::from("replaced")).is_none());
        assert!(coordinator.pending_player(&PlayerId::from("kept")).is_some());

        let flushed = coordinator.flush_all().await;
        assert_eq!(flushed.success_count, 1);
        assert_eq!(backend.get_player(&PlayerId::from("replaced")).await.map(|p| p.level).ok(), Some(6));
    }

    #[tokio::test(start_paused = true)]
    async fn timer_flushes_and_shutdown_drains() {
        let config = BatchConfig {
            max_batch_size: 100,
            flush_interval: Duration::from_secs(5),
        };
        let Some((backend, coordinator)) = setup(config) else {
            return;
        };
        coordinator.start();
        let _ = coordinator.save_player(player("timed", 1)).await;

        tokio::time::sleep(Duration::from_secs(6)).await;
        assert!(backend.get_player(&PlayerId::from("timed")).await.is_ok());

        let _ = coordinator.save_player(player("late", 1)).await;
        let drained = coordinator.shutdown().await;
        assert_eq!(drained.success_count, 1);
        assert!(backend.get_player(&PlayerId::from("late")).await.is_ok());
    }

}
