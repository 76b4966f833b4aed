//! Health and statistics reporting.
//!
//! Every backend or cache call made while building a report runs under a
//! short deadline, so an unreachable backend yields an unhealthy report
//! and a stalled cache a degraded one instead of a hung request.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use questvault_types::{HealthReport, MaintenanceStatus};

use crate::backend::{StorageBackend, with_deadline};
use crate::batch::WriteCoordinator;
use crate::cache::CacheStore;
use crate::maintenance::MaintenanceScheduler;

/// Default deadline for each call made by a report.
pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(2);

/// Builds [`HealthReport`]s from the runtime's components.
pub struct HealthReporter {
    backend: Arc<dyn StorageBackend>,
    writes: Option<Arc<WriteCoordinator>>,
    cache: Option<Arc<dyn CacheStore>>,
    maintenance: Option<Arc<MaintenanceScheduler<dyn StorageBackend>>>,
    timeout: Duration,
}

impl HealthReporter {
    /// Report on `backend` alone.
    pub fn new(backend: Arc<dyn StorageBackend>) -> Self {
        Self {
            backend,
            writes: None,
            cache: None,
            maintenance: None,
            timeout: DEFAULT_PROBE_TIMEOUT,
        }
    }

    /// Include batch coordinator metrics.
    #[must_use]
    pub fn with_writes(mut self, writes: Arc<WriteCoordinator>) -> Self {
        self.writes = Some(writes);
        self
    }

    /// Include cache counters.
    #[must_use]
    pub fn with_cache(mut self, cache: Arc<dyn CacheStore>) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Include the maintenance loop's status.
    #[must_use]
    pub fn with_maintenance(mut self, maintenance: Arc<MaintenanceScheduler<dyn StorageBackend>>) -> Self {
        self.maintenance = Some(maintenance);
        self
    }

    /// Set the per-call deadline.
    #[must_use]
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Ping the backend and collect counters.
    ///
    /// Healthy means the backend answered its ping and its statistics
    /// query in time.
    pub async fn report(&self) -> HealthReport {
        let mut issues = Vec::new();

        let started = Instant::now();
        let ping = with_deadline(self.timeout, self.backend.health_check()).await;
        let ping_latency_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
        let backend_connected = match ping {
            Ok(true) => true,
            Ok(false) => {
                issues.push(String::from("backend ping failed"));
                false
            }
            Err(e) => {
                issues.push(format!("backend ping: {e}"));
                false
            }
        };

        let stats = if backend_connected {
            match with_deadline(self.timeout, self.backend.get_storage_stats()).await {
                Ok(stats) => Some(stats),
                Err(e) => {
                    issues.push(format!("storage stats: {e}"));
                    None
                }
            }
        } else {
            None
        };

        let (pending_writes, writes) = self
            .writes
            .as_ref()
            .map_or_else(|| (0, Vec::new()), |w| (w.pending_count(), w.metrics()));

        // A stalled cache degrades the report but never makes it unhealthy.
        let cache = match &self.cache {
            Some(cache) => match tokio::time::timeout(self.timeout, cache.stats()).await {
                Ok(stats) => Some(stats),
                Err(_elapsed) => {
                    issues.push(format!(
                        "cache degraded: {} stats timed out after {} ms",
                        cache.name(),
                        self.timeout.as_millis()
                    ));
                    None
                }
            },
            None => None,
        };

        let maintenance = self
            .maintenance
            .as_ref()
            .map_or_else(MaintenanceStatus::default, |m| m.status());
        if maintenance.consecutive_failures > 0 {
            if let Some(error) = &maintenance.last_error {
                issues.push(format!("maintenance: {error}"));
            }
        }

        let healthy = backend_connected && stats.is_some();
        if !healthy {
            tracing::warn!(backend = self.backend.kind(), issues = ?issues, "Health check failed");
        }

        HealthReport {
            healthy,
            backend: self.backend.kind().to_owned(),
            backend_connected,
            ping_latency_ms,
            stats,
            pending_writes,
            writes,
            cache,
            maintenance,
            issues,
            checked_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::path::{Path, PathBuf};

    use async_trait::async_trait;
    use chrono::DateTime;
    use questvault_types::{
        ActionTarget, ActionTargetId, BatchResult, BattleId, BattleQuery, BattleRecord, BattleStatus, NewUser,
        OfflineData, OfflineDataId, Player, PlayerId, StorageStats, Team, TeamId, User, UserCharacterLink, UserId,
    };

    use super::*;
    use crate::backend::{BattleFilter, MaintenanceOps};
    use crate::cache::MemoryCache;
    use crate::credentials::{AccountPolicy, CredentialHasher};
    use crate::error::{StoreError, StoreResult};
    use crate::memory::MemoryBackend;

    /// A backend whose every call hangs.
    struct Stalled;

    fn stalled<T>() -> StoreResult<T> {
        Err(StoreError::BackendUnavailable(String::from("stalled")))
    }

    async fn hang<T>() -> StoreResult<T> {
        tokio::time::sleep(Duration::from_secs(3600)).await;
        stalled()
    }

    #[async_trait]
    impl MaintenanceOps for Stalled {
        fn kind(&self) -> &'static str {
            "stalled"
        }
        async fn optimize(&self) -> StoreResult<()> {
            hang().await
        }
        async fn rebuild_indexes(&self) -> StoreResult<u64> {
            hang().await
        }
        async fn compact(&self) -> StoreResult<()> {
            hang().await
        }
        async fn create_backup(&self, _dir: &Path) -> StoreResult<PathBuf> {
            hang().await
        }
        async fn cleanup_synced_offline_data(&self, _older_than: DateTime<Utc>) -> StoreResult<u64> {
            hang().await
        }
        async fn cleanup_action_history(&self, _older_than: DateTime<Utc>) -> StoreResult<u64> {
            hang().await
        }
        async fn cleanup_battle_records(&self, _older_than: DateTime<Utc>) -> StoreResult<u64> {
            hang().await
        }
    }

    #[async_trait]
    impl StorageBackend for Stalled {
        async fn get_user(&self, _id: &UserId) -> StoreResult<User> {
            hang().await
        }
        async fn get_user_by_username(&self, _username: &str) -> StoreResult<User> {
            hang().await
        }
        async fn get_user_by_email(&self, _email: &str) -> StoreResult<User> {
            hang().await
        }
        async fn create_user(&self, _input: NewUser, _raw_password: &str) -> StoreResult<User> {
            hang().await
        }
        async fn update_user(&self, _user: User) -> StoreResult<User> {
            hang().await
        }
        async fn delete_user(&self, _id: &UserId) -> StoreResult<bool> {
            hang().await
        }
        async fn validate_password(&self, _id: &UserId, _raw_password: &str) -> StoreResult<bool> {
            hang().await
        }
        async fn lock_user(&self, _id: &UserId, _until: Option<DateTime<Utc>>) -> StoreResult<bool> {
            hang().await
        }
        async fn unlock_user(&self, _id: &UserId) -> StoreResult<bool> {
            hang().await
        }
        async fn record_login(&self, _id: &UserId, _success: bool, _source_ip: Option<&str>) -> StoreResult<User> {
            hang().await
        }
        async fn create_user_character_link(&self, _link: UserCharacterLink) -> StoreResult<UserCharacterLink> {
            hang().await
        }
        async fn get_user_characters(&self, _user_id: &UserId) -> StoreResult<Vec<UserCharacterLink>> {
            hang().await
        }
        async fn get_character_owner(&self, _character_id: &PlayerId) -> StoreResult<UserId> {
            hang().await
        }
        async fn set_default_character(&self, _user_id: &UserId, _character_id: &PlayerId) -> StoreResult<bool> {
            hang().await
        }
        async fn delete_user_character_link(&self, _user_id: &UserId, _character_id: &PlayerId) -> StoreResult<bool> {
            hang().await
        }
        async fn get_player(&self, _id: &PlayerId) -> StoreResult<Player> {
            hang().await
        }
        async fn save_player(&self, _player: Player) -> StoreResult<Player> {
            hang().await
        }
        async fn delete_player(&self, _id: &PlayerId) -> StoreResult<bool> {
            hang().await
        }
        async fn get_online_players(&self) -> StoreResult<Vec<Player>> {
            hang().await
        }
        async fn batch_save_players(&self, _players: Vec<Player>) -> StoreResult<BatchResult> {
            hang().await
        }
        async fn search_players(&self, _term: &str, _limit: u32) -> StoreResult<Vec<Player>> {
            hang().await
        }
        async fn reset_player_progress(&self, _id: &PlayerId) -> StoreResult<Player> {
            hang().await
        }
        async fn get_team(&self, _id: &TeamId) -> StoreResult<Team> {
            hang().await
        }
        async fn get_team_by_captain(&self, _captain_id: &PlayerId) -> StoreResult<Option<Team>> {
            hang().await
        }
        async fn get_team_by_player(&self, _player_id: &PlayerId) -> StoreResult<Option<Team>> {
            hang().await
        }
        async fn save_team(&self, _team: Team) -> StoreResult<Team> {
            hang().await
        }
        async fn delete_team(&self, _id: &TeamId) -> StoreResult<bool> {
            hang().await
        }
        async fn get_active_teams(&self) -> StoreResult<Vec<Team>> {
            hang().await
        }
        async fn get_current_action_target(&self, _player_id: &PlayerId) -> StoreResult<Option<ActionTarget>> {
            hang().await
        }
        async fn save_action_target(&self, _target: ActionTarget) -> StoreResult<ActionTarget> {
            hang().await
        }
        async fn complete_action_target(&self, _id: &ActionTargetId) -> StoreResult<ActionTarget> {
            hang().await
        }
        async fn cancel_action_target(&self, _player_id: &PlayerId) -> StoreResult<bool> {
            hang().await
        }
        async fn get_action_history(&self, _player_id: &PlayerId, _limit: u32) -> StoreResult<Vec<ActionTarget>> {
            hang().await
        }
        async fn get_battle_record(&self, _id: &BattleId) -> StoreResult<BattleRecord> {
            hang().await
        }
        async fn save_battle_record(&self, _record: BattleRecord) -> StoreResult<BattleRecord> {
            hang().await
        }
        async fn end_battle_record(
            &self,
            _id: &BattleId,
            _status: BattleStatus,
            _results: serde_json::Value,
        ) -> StoreResult<BattleRecord> {
            hang().await
        }
        async fn get_battle_history(
            &self,
            _filter: &BattleFilter,
            _query: &BattleQuery,
        ) -> StoreResult<Vec<BattleRecord>> {
            hang().await
        }
        async fn get_active_battles(&self) -> StoreResult<Vec<BattleRecord>> {
            hang().await
        }
        async fn save_offline_data(&self, _data: OfflineData) -> StoreResult<OfflineData> {
            hang().await
        }
        async fn get_unsynced_offline_data(&self, _player_id: &PlayerId) -> StoreResult<Vec<OfflineData>> {
            hang().await
        }
        async fn mark_offline_data_synced(&self, _ids: &[OfflineDataId]) -> StoreResult<u64> {
            hang().await
        }
        async fn get_storage_stats(&self) -> StoreResult<StorageStats> {
            hang().await
        }
        async fn health_check(&self) -> StoreResult<bool> {
            hang().await
        }
    }

    #[async_trait]
    impl CacheStore for Stalled {
        fn name(&self) -> &'static str {
            "stalled"
        }
        async fn get(&self, _key: &str) -> StoreResult<Option<String>> {
            hang().await
        }
        async fn set(&self, _key: &str, _value: String, _ttl: Duration) -> StoreResult<()> {
            hang().await
        }
        async fn remove(&self, _key: &str) -> StoreResult<()> {
            hang().await
        }
        async fn stats(&self) -> questvault_types::CacheStats {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            questvault_types::CacheStats::default()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_cache_degrades_without_hanging() {
        let Ok(hasher) = CredentialHasher::fast() else {
            return;
        };
        let backend: Arc<dyn StorageBackend> = Arc::new(MemoryBackend::new(AccountPolicy::new(hasher)));
        let report = HealthReporter::new(backend)
            .with_cache(Arc::new(Stalled))
            .with_timeout(Duration::from_millis(50))
            .report()
            .await;
        assert!(report.healthy);
        assert!(report.cache.is_none());
        assert!(report.issues.iter().any(|i| i.starts_with("cache degraded")));

        let Ok(hasher) = CredentialHasher::fast() else {
            return;
        };
        let backend: Arc<dyn StorageBackend> = Arc::new(MemoryBackend::new(AccountPolicy::new(hasher)));
        let report = HealthReporter::new(backend)
            .with_cache(Arc::new(MemoryCache::default()))
            .report()
            .await;
        assert!(report.cache.is_some_and(|c| c.store == "memory"));
        assert!(report.issues.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_backend_is_reported_unhealthy() {
        let reporter = HealthReporter::new(Arc::new(Stalled)).with_timeout(Duration::from_millis(50));
        let report = reporter.report().await;
        assert!(!report.healthy);
        assert!(!report.backend_connected);
        assert!(report.stats.is_none());
        assert!(report.issues.iter().any(|i| i.contains("timed out")));
    }

    #[tokio::test]
    async fn live_backend_reports_counts_and_writes() {
        let Ok(hasher) = CredentialHasher::fast() else {
            return;
        };
        let backend: Arc<dyn StorageBackend> = Arc::new(MemoryBackend::new(AccountPolicy::new(hasher)));
        let writes = Arc::new(WriteCoordinator::new(backend.clone(), crate::batch::BatchConfig::default()));
        let _ = writes.save_player(Player::new(PlayerId::from("char-1"), "Aria")).await;

        let report = HealthReporter::new(backend).with_writes(writes).report().await;
        assert!(report.healthy);
        assert_eq!(report.backend, "in_memory");
        assert_eq!(report.pending_writes, 1);
        assert!(report.stats.is_some_and(|s| s.total_players == 0));
    }
}
