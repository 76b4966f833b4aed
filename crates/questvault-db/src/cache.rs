//! Cache tier in front of any [`StorageBackend`].
//!
//! Reads go cache-first and populate on miss with a TTL chosen by entity
//! class. Writes go to the backend first, then invalidate the key; the
//! next read repopulates from the authoritative backend.
//!
//! # Key Patterns
//!
//! | Pattern | Entity | TTL tier |
//! |---------|--------|----------|
//! | `user:{ns}:{id}` | [`User`] | cold |
//! | `player:{ns}:{id}` | [`Player`] | hot |
//! | `team:{ns}:{id}` | [`Team`] | hot |
//! | `battle:{ns}:{id}` | [`BattleRecord`] | hot while in progress, cold after |
//!
//! `ns` is a namespace generation bumped by bulk deletions (retention
//! cleanup), which orphans every earlier entry at once.
//!
//! A read-through that raced a write must not leave the pre-write value
//! behind. Writers bump a per-key epoch and then remove the key; a
//! populate checks the epoch before storing and again after, and removes
//! its own entry if a write landed in between. The epoch lock is never
//! held across a store round-trip.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fred::prelude::*;
use fred::types::Expiration;
use parking_lot::Mutex as SyncMutex;
use questvault_types::{
    ActionTarget, ActionTargetId, BatchResult, BattleId, BattleQuery, BattleRecord, BattleStatus, CacheStats,
    NewUser, OfflineData, OfflineDataId, Player, PlayerId, StorageStats, Team, TeamId, User, UserCharacterLink,
    UserId,
};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::time::Instant;

use crate::backend::{BattleFilter, MaintenanceOps, StorageBackend};
use crate::error::{StoreError, StoreResult};

/// Default TTL for frequently-changing records.
pub const DEFAULT_HOT_TTL: Duration = Duration::from_secs(30 * 60);

/// Default TTL for rarely-changing records.
pub const DEFAULT_COLD_TTL: Duration = Duration::from_secs(2 * 60 * 60);

/// Default entry capacity of the in-process store.
pub const DEFAULT_CAPACITY: usize = 10_000;

/// Default share of entries evicted when the in-process store is full.
pub const DEFAULT_COMPACTION_FRACTION: f64 = 0.25;

/// Key prefix for every entry written to `Dragonfly`.
pub const DRAGONFLY_PREFIX: &str = "qv:";

/// Keys with a tracked write epoch before the table is reset.
const MAX_TRACKED_EPOCHS: usize = 65_536;

/// Storage seam for cached values (JSON text).
#[async_trait]
pub trait CacheStore: Send + Sync {
    /// Short name for logs and stats.
    fn name(&self) -> &'static str;

    /// Value at `key`, if present and not expired.
    async fn get(&self, key: &str) -> StoreResult<Option<String>>;

    /// Store `value` at `key` for `ttl`.
    async fn set(&self, key: &str, value: String, ttl: Duration) -> StoreResult<()>;

    /// Remove `key`. Missing keys are not an error.
    async fn remove(&self, key: &str) -> StoreResult<()>;

    /// Hit/miss/eviction counters.
    async fn stats(&self) -> CacheStats;
}

#[derive(Debug, Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

impl Counters {
    fn hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    fn miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    fn evicted(&self, count: usize) {
        self.evictions
            .fetch_add(u64::try_from(count).unwrap_or(u64::MAX), Ordering::Relaxed);
    }

    fn snapshot(&self, store: &str, entries: u64) -> CacheStats {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let lookups = hits.saturating_add(misses);
        #[allow(clippy::cast_precision_loss)]
        let hit_ratio = if lookups == 0 { 0.0 } else { hits as f64 / lookups as f64 };
        CacheStats {
            store: store.to_owned(),
            entries,
            hits,
            misses,
            evictions: self.evictions.load(Ordering::Relaxed),
            hit_ratio,
        }
    }
}

// =========================================================================
// In-process store
// =========================================================================

#[derive(Debug)]
struct Entry {
    value: String,
    expires_at: Instant,
    last_access: u64,
}

#[derive(Debug, Default)]
struct Slots {
    entries: HashMap<String, Entry>,
    clock: u64,
}

impl Slots {
    fn tick(&mut self) -> u64 {
        self.clock = self.clock.wrapping_add(1);
        self.clock
    }
}

/// In-process TTL store with approximate recency eviction.
///
/// When an insert finds the store at capacity, expired entries are
/// dropped first; if that is not enough, the least recently touched
/// `compaction_fraction` of entries go.
#[derive(Debug)]
pub struct MemoryCache {
    slots: SyncMutex<Slots>,
    capacity: usize,
    compaction_fraction: f64,
    counters: Counters,
}

impl MemoryCache {
    /// Create a store holding up to `capacity` entries.
    pub fn new(capacity: usize, compaction_fraction: f64) -> Self {
        Self {
            slots: SyncMutex::new(Slots::default()),
            capacity: capacity.max(1),
            compaction_fraction: compaction_fraction.clamp(0.01, 1.0),
            counters: Counters::default(),
        }
    }

    /// Number of live and not-yet-purged entries.
    pub fn len(&self) -> usize {
        self.slots.lock().entries.len()
    }

    /// Whether the store holds nothing.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn eviction_batch(&self) -> usize {
        #[allow(
            clippy::cast_possible_truncation,
            clippy::cast_sign_loss,
            clippy::cast_precision_loss
        )]
        let batch = (self.capacity as f64 * self.compaction_fraction).ceil() as usize;
        batch.max(1)
    }

    fn make_room(&self, slots: &mut Slots, now: Instant) {
        if slots.entries.len() < self.capacity {
            return;
        }
        let before = slots.entries.len();
        slots.entries.retain(|_, e| e.expires_at > now);
        let mut evicted = before.saturating_sub(slots.entries.len());

        if slots.entries.len() >= self.capacity {
            let mut by_age: Vec<(u64, String)> = slots
                .entries
                .iter()
                .map(|(k, e)| (e.last_access, k.clone()))
                .collect();
            by_age.sort_unstable();
            for (_, key) in by_age.into_iter().take(self.eviction_batch()) {
                slots.entries.remove(&key);
                evicted = evicted.saturating_add(1);
            }
        }
        if evicted > 0 {
            self.counters.evicted(evicted);
            tracing::debug!(evicted, remaining = slots.entries.len(), "Compacted in-process cache");
        }
    }
}

impl Default for MemoryCache {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY, DEFAULT_COMPACTION_FRACTION)
    }
}

#[async_trait]
impl CacheStore for MemoryCache {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        let now = Instant::now();
        let mut slots = self.slots.lock();
        let stamp = slots.tick();
        let value = match slots.entries.get_mut(key) {
            Some(entry) if entry.expires_at > now => {
                entry.last_access = stamp;
                Some(entry.value.clone())
            }
            Some(_) => {
                slots.entries.remove(key);
                None
            }
            None => None,
        };
        if value.is_some() {
            self.counters.hit();
        } else {
            self.counters.miss();
        }
        Ok(value)
    }

    async fn set(&self, key: &str, value: String, ttl: Duration) -> StoreResult<()> {
        let now = Instant::now();
        let mut slots = self.slots.lock();
        if !slots.entries.contains_key(key) {
            self.make_room(&mut slots, now);
        }
        let stamp = slots.tick();
        slots.entries.insert(
            key.to_owned(),
            Entry {
                value,
                expires_at: now.checked_add(ttl).unwrap_or(now),
                last_access: stamp,
            },
        );
        Ok(())
    }

    async fn remove(&self, key: &str) -> StoreResult<()> {
        self.slots.lock().entries.remove(key);
        Ok(())
    }

    async fn stats(&self) -> CacheStats {
        let entries = u64::try_from(self.len()).unwrap_or(u64::MAX);
        self.counters.snapshot(self.name(), entries)
    }
}

// =========================================================================
// Dragonfly store
// =========================================================================

/// Shared cache in `Dragonfly` (Redis-compatible), JSON values under
/// [`DRAGONFLY_PREFIX`] with `EX` expiry.
#[derive(Clone)]
pub struct DragonflyCache {
    client: Client,
    counters: Arc<Counters>,
}

impl DragonflyCache {
    /// Connect to `Dragonfly` at `url` (`redis://host:port[/db]`).
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Config`] if the URL cannot be parsed.
    /// Returns [`StoreError::BackendUnavailable`] if the connection fails.
    pub async fn connect(url: &str) -> StoreResult<Self> {
        let config = Config::from_url(url).map_err(|e| StoreError::Config(format!("Invalid Dragonfly URL: {e}")))?;
        let client = Builder::from_config(config).build()?;
        client.init().await?;
        tracing::info!("Connected to Dragonfly cache");
        Ok(Self {
            client,
            counters: Arc::new(Counters::default()),
        })
    }

    fn key(key: &str) -> String {
        format!("{DRAGONFLY_PREFIX}{key}")
    }
}

#[async_trait]
impl CacheStore for DragonflyCache {
    fn name(&self) -> &'static str {
        "dragonfly"
    }

    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        let value: Option<String> = self.client.get(Self::key(key)).await?;
        if value.is_some() {
            self.counters.hit();
        } else {
            self.counters.miss();
        }
        Ok(value)
    }

    async fn set(&self, key: &str, value: String, ttl: Duration) -> StoreResult<()> {
        let seconds = i64::try_from(ttl.as_secs().max(1)).unwrap_or(i64::MAX);
        let _: () = self
            .client
            .set(Self::key(key), value.as_str(), Some(Expiration::EX(seconds)), None, false)
            .await?;
        Ok(())
    }

    async fn remove(&self, key: &str) -> StoreResult<()> {
        let _: u32 = self.client.del(Self::key(key)).await?;
        Ok(())
    }

    async fn stats(&self) -> CacheStats {
        let entries: u64 = self.client.dbsize().await.unwrap_or(0);
        self.counters.snapshot(self.name(), entries)
    }
}

// =========================================================================
// Cached backend
// =========================================================================

/// TTL tiers by entity class.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheTtls {
    /// Players, teams and in-progress battles.
    pub hot: Duration,
    /// Users and finished battles.
    pub cold: Duration,
}

impl Default for CacheTtls {
    fn default() -> Self {
        Self {
            hot: DEFAULT_HOT_TTL,
            cold: DEFAULT_COLD_TTL,
        }
    }
}

#[derive(Debug, Default)]
struct Epochs {
    generation: u64,
    keys: HashMap<String, u64>,
}

impl Epochs {
    fn observe(&self, key: &str) -> (u64, u64) {
        (self.generation, self.keys.get(key).copied().unwrap_or(0))
    }

    fn bump(&mut self, key: &str) {
        if self.keys.len() >= MAX_TRACKED_EPOCHS && !self.keys.contains_key(key) {
            self.keys.clear();
            self.generation = self.generation.wrapping_add(1);
        }
        let epoch = self.keys.entry(key.to_owned()).or_insert(0);
        *epoch = epoch.wrapping_add(1);
    }
}

/// A [`StorageBackend`] that caches reads of another backend.
pub struct CachedBackend {
    inner: Arc<dyn StorageBackend>,
    cache: Arc<dyn CacheStore>,
    ttls: CacheTtls,
    namespace: AtomicU64,
    epochs: SyncMutex<Epochs>,
}

impl CachedBackend {
    /// Put `cache` in front of `inner`.
    pub fn new(inner: Arc<dyn StorageBackend>, cache: Arc<dyn CacheStore>, ttls: CacheTtls) -> Self {
        Self {
            inner,
            cache,
            ttls,
            namespace: AtomicU64::new(0),
            epochs: SyncMutex::new(Epochs::default()),
        }
    }

    /// The wrapped backend.
    pub fn inner(&self) -> &Arc<dyn StorageBackend> {
        &self.inner
    }

    /// Counters of the underlying store.
    pub async fn cache_stats(&self) -> CacheStats {
        self.cache.stats().await
    }

    fn key(&self, class: &str, id: &str) -> String {
        format!("{class}:{}:{id}", self.namespace.load(Ordering::Acquire))
    }

    async fn lookup<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        match self.cache.get(key).await {
            Ok(Some(raw)) => match serde_json::from_str(&raw) {
                Ok(value) => Some(value),
                Err(e) => {
                    tracing::warn!(key, error = %e, "Dropping undecodable cache entry");
                    self.drop_key(key).await;
                    None
                }
            },
            Ok(None) => None,
            Err(e) => {
                tracing::warn!(key, store = self.cache.name(), error = %e, "Cache read failed, using backend");
                None
            }
        }
    }

    /// Populate `key` unless a write touched it after `seen` was taken.
    async fn populate<T: Serialize + Sync>(&self, key: &str, seen: (u64, u64), value: &T, ttl: Duration) {
        let raw = match serde_json::to_string(value) {
            Ok(raw) => raw,
            Err(e) => {
                tracing::warn!(key, error = %e, "Cannot encode value for cache");
                return;
            }
        };
        if self.observe(key) != seen {
            tracing::trace!(key, "Skipped cache populate after concurrent write");
            return;
        }
        if let Err(e) = self.cache.set(key, raw, ttl).await {
            tracing::warn!(key, store = self.cache.name(), error = %e, "Cache write failed");
            return;
        }
        if self.observe(key) != seen {
            tracing::trace!(key, "Write landed during cache populate, dropping entry");
            self.drop_key(key).await;
        }
    }

    async fn drop_key(&self, key: &str) {
        if let Err(e) = self.cache.remove(key).await {
            tracing::warn!(key, store = self.cache.name(), error = %e, "Cache invalidation failed");
        }
    }

    async fn invalidate(&self, key: &str) {
        self.epochs.lock().bump(key);
        self.drop_key(key).await;
    }

    async fn invalidate_user(&self, id: &UserId) {
        self.invalidate(&self.key("user", id.as_str())).await;
    }

    async fn invalidate_player(&self, id: &PlayerId) {
        self.invalidate(&self.key("player", id.as_str())).await;
    }

    async fn invalidate_team(&self, id: &TeamId) {
        self.invalidate(&self.key("team", id.as_str())).await;
    }

    async fn invalidate_battle(&self, id: &BattleId) {
        self.invalidate(&self.key("battle", id.as_str())).await;
    }

    fn observe(&self, key: &str) -> (u64, u64) {
        self.epochs.lock().observe(key)
    }

    /// Orphan every entry by moving to a new namespace.
    fn rotate_namespace(&self) {
        let ns = self.namespace.fetch_add(1, Ordering::AcqRel);
        tracing::debug!(namespace = ns.wrapping_add(1), "Rotated cache namespace");
    }

    async fn read_through<T, F>(&self, key: String, ttl: impl Fn(&T) -> Duration + Send, load: F) -> StoreResult<T>
    where
        T: Serialize + DeserializeOwned + Send + Sync,
        F: Future<Output = StoreResult<T>> + Send,
    {
        if let Some(hit) = self.lookup(&key).await {
            return Ok(hit);
        }
        let seen = self.observe(&key);
        let value = load.await?;
        self.populate(&key, seen, &value, ttl(&value)).await;
        Ok(value)
    }

    const fn battle_ttl(&self, record: &BattleRecord) -> Duration {
        if record.status.is_terminal() {
            self.ttls.cold
        } else {
            self.ttls.hot
        }
    }
}

#[async_trait]
impl MaintenanceOps for CachedBackend {
    fn kind(&self) -> &'static str {
        self.inner.kind()
    }

    async fn optimize(&self) -> StoreResult<()> {
        self.inner.optimize().await
    }

    async fn rebuild_indexes(&self) -> StoreResult<u64> {
        self.inner.rebuild_indexes().await
    }

    async fn compact(&self) -> StoreResult<()> {
        self.inner.compact().await
    }

    async fn create_backup(&self, dir: &Path) -> StoreResult<PathBuf> {
        self.inner.create_backup(dir).await
    }

    async fn cleanup_synced_offline_data(&self, older_than: DateTime<Utc>) -> StoreResult<u64> {
        self.inner.cleanup_synced_offline_data(older_than).await
    }

    async fn cleanup_action_history(&self, older_than: DateTime<Utc>) -> StoreResult<u64> {
        self.inner.cleanup_action_history(older_than).await
    }

    async fn cleanup_battle_records(&self, older_than: DateTime<Utc>) -> StoreResult<u64> {
        let removed = self.inner.cleanup_battle_records(older_than).await?;
        if removed > 0 {
            self.rotate_namespace();
        }
        Ok(removed)
    }
}

#[async_trait]
impl StorageBackend for CachedBackend {
    async fn get_user(&self, id: &UserId) -> StoreResult<User> {
        let cold = self.ttls.cold;
        self.read_through(self.key("user", id.as_str()), |_| cold, self.inner.get_user(id))
            .await
    }

    async fn get_user_by_username(&self, username: &str) -> StoreResult<User> {
        self.inner.get_user_by_username(username).await
    }

    async fn get_user_by_email(&self, email: &str) -> StoreResult<User> {
        self.inner.get_user_by_email(email).await
    }

    async fn create_user(&self, input: NewUser, raw_password: &str) -> StoreResult<User> {
        self.inner.create_user(input, raw_password).await
    }

    async fn update_user(&self, user: User) -> StoreResult<User> {
        let id = user.id.clone();
        let result = self.inner.update_user(user).await;
        self.invalidate_user(&id).await;
        result
    }

    async fn delete_user(&self, id: &UserId) -> StoreResult<bool> {
        let result = self.inner.delete_user(id).await;
        self.invalidate_user(id).await;
        result
    }

    async fn validate_password(&self, id: &UserId, raw_password: &str) -> StoreResult<bool> {
        self.inner.validate_password(id, raw_password).await
    }

    async fn lock_user(&self, id: &UserId, until: Option<DateTime<Utc>>) -> StoreResult<bool> {
        let result = self.inner.lock_user(id, until).await;
        self.invalidate_user(id).await;
        result
    }

    async fn unlock_user(&self, id: &UserId) -> StoreResult<bool> {
        let result = self.inner.unlock_user(id).await;
        self.invalidate_user(id).await;
        result
    }

    async fn record_login(&self, id: &UserId, success: bool, source_ip: Option<&str>) -> StoreResult<User> {
        let result = self.inner.record_login(id, success, source_ip).await;
        self.invalidate_user(id).await;
        result
    }

    async fn create_user_character_link(&self, link: UserCharacterLink) -> StoreResult<UserCharacterLink> {
        let user_id = link.user_id.clone();
        let result = self.inner.create_user_character_link(link).await;
        self.invalidate_user(&user_id).await;
        result
    }

    async fn get_user_characters(&self, user_id: &UserId) -> StoreResult<Vec<UserCharacterLink>> {
        self.inner.get_user_characters(user_id).await
    }

    async fn get_character_owner(&self, character_id: &PlayerId) -> StoreResult<UserId> {
        self.inner.get_character_owner(character_id).await
    }

    async fn set_default_character(&self, user_id: &UserId, character_id: &PlayerId) -> StoreResult<bool> {
        let result = self.inner.set_default_character(user_id, character_id).await;
        self.invalidate_user(user_id).await;
        result
    }

    async fn delete_user_character_link(&self, user_id: &UserId, character_id: &PlayerId) -> StoreResult<bool> {
        let result = self.inner.delete_user_character_link(user_id, character_id).await;
        self.invalidate_user(user_id).await;
        result
    }

    async fn get_player(&self, id: &PlayerId) -> StoreResult<Player> {
        let hot = self.ttls.hot;
        self.read_through(self.key("player", id.as_str()), |_| hot, self.inner.get_player(id))
            .await
    }

    async fn save_player(&self, player: Player) -> StoreResult<Player> {
        let id = player.id.clone();
        let result = self.inner.save_player(player).await;
        self.invalidate_player(&id).await;
        result
    }

    async fn delete_player(&self, id: &PlayerId) -> StoreResult<bool> {
        let result = self.inner.delete_player(id).await;
        self.invalidate_player(id).await;
        result
    }

    async fn get_online_players(&self) -> StoreResult<Vec<Player>> {
        self.inner.get_online_players().await
    }

    async fn batch_save_players(&self, players: Vec<Player>) -> StoreResult<BatchResult> {
        let ids: Vec<PlayerId> = players.iter().map(|p| p.id.clone()).collect();
        let result = self.inner.batch_save_players(players).await;
        for id in &ids {
            self.invalidate_player(id).await;
        }
        result
    }

    async fn search_players(&self, term: &str, limit: u32) -> StoreResult<Vec<Player>> {
        self.inner.search_players(term, limit).await
    }

    async fn reset_player_progress(&self, id: &PlayerId) -> StoreResult<Player> {
        let result = self.inner.reset_player_progress(id).await;
        self.invalidate_player(id).await;
        result
    }

    async fn get_team(&self, id: &TeamId) -> StoreResult<Team> {
        let hot = self.ttls.hot;
        self.read_through(self.key("team", id.as_str()), |_| hot, self.inner.get_team(id))
            .await
    }

    async fn get_team_by_captain(&self, captain_id: &PlayerId) -> StoreResult<Option<Team>> {
        self.inner.get_team_by_captain(captain_id).await
    }

    async fn get_team_by_player(&self, player_id: &PlayerId) -> StoreResult<Option<Team>> {
        self.inner.get_team_by_player(player_id).await
    }

    async fn save_team(&self, team: Team) -> StoreResult<Team> {
        let id = team.id.clone();
        let result = self.inner.save_team(team).await;
        self.invalidate_team(&id).await;
        result
    }

    async fn delete_team(&self, id: &TeamId) -> StoreResult<bool> {
        let result = self.inner.delete_team(id).await;
        self.invalidate_team(id).await;
        result
    }

    async fn get_active_teams(&self) -> StoreResult<Vec<Team>> {
        self.inner.get_active_teams().await
    }

    async fn get_current_action_target(&self, player_id: &PlayerId) -> StoreResult<Option<ActionTarget>> {
        self.inner.get_current_action_target(player_id).await
    }

    async fn save_action_target(&self, target: ActionTarget) -> StoreResult<ActionTarget> {
        self.inner.save_action_target(target).await
    }

    async fn complete_action_target(&self, id: &ActionTargetId) -> StoreResult<ActionTarget> {
        self.inner.complete_action_target(id).await
    }

    async fn cancel_action_target(&self, player_id: &PlayerId) -> StoreResult<bool> {
        self.inner.cancel_action_target(player_id).await
    }

    async fn get_action_history(&self, player_id: &PlayerId, limit: u32) -> StoreResult<Vec<ActionTarget>> {
        self.inner.get_action_history(player_id, limit).await
    }

    async fn get_battle_record(&self, id: &BattleId) -> StoreResult<BattleRecord> {
        self.read_through(
            self.key("battle", id.as_str()),
            |record| self.battle_ttl(record),
            self.inner.get_battle_record(id),
        )
        .await
    }

    async fn save_battle_record(&self, record: BattleRecord) -> StoreResult<BattleRecord> {
        let id = record.id.clone();
        let result = self.inner.save_battle_record(record).await;
        self.invalidate_battle(&id).await;
        result
    }

    async fn end_battle_record(
        &self,
        id: &BattleId,
        status: BattleStatus,
        results: serde_json::Value,
    ) -> StoreResult<BattleRecord> {
        let result = self.inner.end_battle_record(id, status, results).await;
        self.invalidate_battle(id).await;
        result
    }

    async fn get_battle_history(&self, filter: &BattleFilter, query: &BattleQuery) -> StoreResult<Vec<BattleRecord>> {
        self.inner.get_battle_history(filter, query).await
    }

    async fn get_active_battles(&self) -> StoreResult<Vec<BattleRecord>> {
        self.inner.get_active_battles().await
    }

    async fn save_offline_data(&self, data: OfflineData) -> StoreResult<OfflineData> {
        self.inner.save_offline_data(data).await
    }

    async fn get_unsynced_offline_data(&self, player_id: &PlayerId) -> StoreResult<Vec<OfflineData>> {
        self.inner.get_unsynced_offline_data(player_id).await
    }

    async fn mark_offline_data_synced(&self, ids: &[OfflineDataId]) -> StoreResult<u64> {
        self.inner.mark_offline_data_synced(ids).await
    }

    async fn get_storage_stats(&self) -> StoreResult<StorageStats> {
        self.inner.get_storage_stats().await
    }

    async fn health_check(&self) -> StoreResult<bool> {
        self.inner.health_check().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::{AccountPolicy, CredentialHasher};
    use crate::memory::MemoryBackend;

    fn cached(cache: Arc<MemoryCache>) -> Option<(Arc<MemoryBackend>, CachedBackend)> {
        let policy = AccountPolicy::new(CredentialHasher::fast().ok()?);
        let inner = Arc::new(MemoryBackend::new(policy));
        let tier = CachedBackend::new(inner.clone(), cache, CacheTtls::default());
        Some((inner, tier))
    }

    #[tokio::test(start_paused = true)]
    async fn memory_cache_expires_entries() {
        let cache = MemoryCache::new(8, 0.5);
        assert!(cache.set("k", String::from("v"), Duration::from_secs(10)).await.is_ok());
        assert_eq!(cache.get("k").await.ok().flatten().as_deref(), Some("v"));

        tokio::time::advance(Duration::from_secs(11)).await;
        assert_eq!(cache.get("k").await.ok().flatten(), None);
        let stats = cache.stats().await;
        assert_eq!((stats.hits, stats.misses), (1, 1));
    }

    #[tokio::test]
    async fn memory_cache_stays_within_capacity() {
        let cache = MemoryCache::new(4, 0.5);
        for i in 0..20 {
            let _ = cache.set(&format!("k{i}"), i.to_string(), Duration::from_secs(60)).await;
        }
        assert!(cache.len() <= 4);
        assert!(cache.stats().await.evictions > 0);
        // Whatever survived must still map to its own value.
        for i in 0..20 {
            if let Ok(Some(v)) = cache.get(&format!("k{i}")).await {
                assert_eq!(v, i.to_string());
            }
        }
    }

    #[tokio::test]
    async fn reads_see_preceding_writes() {
        let Some((_, tier)) = cached(Arc::new(MemoryCache::default())) else {
            return;
        };
        let mut player = Player::new(PlayerId::from("char-1"), "Aria");
        assert!(tier.save_player(player.clone()).await.is_ok());
        assert_eq!(tier.get_player(&player.id).await.map(|p| p.level).ok(), Some(1));

        player.level = 2;
        assert!(tier.save_player(player.clone()).await.is_ok());
        assert_eq!(tier.get_player(&player.id).await.map(|p| p.level).ok(), Some(2));
    }

    #[tokio::test]
    async fn second_read_is_a_hit() {
        let cache = Arc::new(MemoryCache::default());
        let Some((_, tier)) = cached(cache.clone()) else {
            return;
        };
        let team = Team::new(TeamId::from("t-1"), "Vanguard", PlayerId::from("alice"));
        assert!(tier.save_team(team).await.is_ok());
        assert!(tier.get_team(&TeamId::from("t-1")).await.is_ok());
        assert!(tier.get_team(&TeamId::from("t-1")).await.is_ok());
        assert_eq!(cache.stats().await.hits, 1);
    }

    #[tokio::test]
    async fn stale_populate_is_discarded() {
        let cache = Arc::new(MemoryCache::default());
        let Some((_, tier)) = cached(cache.clone()) else {
            return;
        };
        let key = tier.key("player", "char-1");
        let seen = tier.observe(&key);
        tier.invalidate(&key).await;
        tier.populate(&key, seen, &Player::new(PlayerId::from("char-1"), "Old"), DEFAULT_HOT_TTL)
            .await;
        assert!(cache.get(&key).await.ok().flatten().is_none());
    }

    #[tokio::test]
    async fn battle_cleanup_orphans_cached_records() {
        let Some((inner, tier)) = cached(Arc::new(MemoryCache::default())) else {
            return;
        };
        let record = BattleRecord::begin(
            BattleId::from("b-1"),
            questvault_types::BattleType::Solo,
            vec![PlayerId::from("char-1")],
        );
        assert!(tier.save_battle_record(record).await.is_ok());
        assert!(
            tier.end_battle_record(&BattleId::from("b-1"), BattleStatus::Completed, serde_json::Value::Null)
                .await
                .is_ok()
        );
        assert!(tier.get_battle_record(&BattleId::from("b-1")).await.is_ok());

        let removed = tier
            .cleanup_battle_records(Utc::now() + chrono::Duration::seconds(1))
            .await;
        assert_eq!(removed.ok(), Some(1));
        assert!(inner.get_battle_record(&BattleId::from("b-1")).await.is_err());
        assert!(tier.get_battle_record(&BattleId::from("b-1")).await.is_err());
    }

    /// Holds every `set` until a permit is released.
    struct GatedStore {
        inner: MemoryCache,
        gate: tokio::sync::Semaphore,
    }

    #[async_trait]
    impl CacheStore for GatedStore {
        fn name(&self) -> &'static str {
            "gated"
        }
        async fn get(&self, key: &str) -> StoreResult<Option<String>> {
            self.inner.get(key).await
        }
        async fn set(&self, key: &str, value: String, ttl: Duration) -> StoreResult<()> {
            let _permit = self
                .gate
                .acquire()
                .await
                .map_err(|e| StoreError::BackendUnavailable(e.to_string()))?;
            self.inner.set(key, value, ttl).await
        }
        async fn remove(&self, key: &str) -> StoreResult<()> {
            self.inner.remove(key).await
        }
        async fn stats(&self) -> CacheStats {
            self.inner.stats().await
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn write_during_populate_round_trip_leaves_no_stale_entry() {
        let Ok(hasher) = CredentialHasher::fast() else {
            return;
        };
        let store = Arc::new(GatedStore {
            inner: MemoryCache::default(),
            gate: tokio::sync::Semaphore::new(0),
        });
        let inner: Arc<dyn StorageBackend> = Arc::new(MemoryBackend::new(AccountPolicy::new(hasher)));
        let tier = Arc::new(CachedBackend::new(inner, store.clone(), CacheTtls::default()));
        let key = tier.key("player", "char-1");
        let seen = tier.observe(&key);

        let populating = {
            let tier = Arc::clone(&tier);
            let key = key.clone();
            tokio::spawn(async move {
                let stale = Player::new(PlayerId::from("char-1"), "Old");
                tier.populate(&key, seen, &stale, DEFAULT_HOT_TTL).await;
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        // The populate is parked inside `set`; invalidation must not wait for it.
        let invalidated = tokio::time::timeout(Duration::from_secs(1), tier.invalidate(&key)).await;
        assert!(invalidated.is_ok());

        store.gate.add_permits(1);
        assert!(populating.await.is_ok());
        assert!(store.inner.get(&key).await.ok().flatten().is_none());
    }

    #[test]
    fn epoch_table_resets_when_full() {
        let mut epochs = Epochs::default();
        epochs.bump("a");
        assert_eq!(epochs.observe("a"), (0, 1));
        for i in 0..MAX_TRACKED_EPOCHS {
            epochs.bump(&i.to_string());
        }
        assert_eq!(epochs.observe("a").0, 1);
    }
}
