//! The storage contract every backend implements.
//!
//! [`StorageBackend`] is the fixed capability set the rest of the layer
//! programs against. A backend is chosen once at startup and used through
//! `Arc<dyn StorageBackend>`; the cache tier is itself a
//! [`StorageBackend`] wrapping another one.
//!
//! [`MaintenanceOps`] is the subset the maintenance scheduler needs.
//! Keeping it separate lets the scheduler be tested against a scripted
//! double without implementing the whole contract.
//!
//! # Shared rules
//!
//! - Writes replace the whole entity for its key (last-write-wins).
//! - Secondary indexes are updated in the same logical operation as the
//!   primary record.
//! - Reads of damaged blob columns degrade to defaults, never errors.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use questvault_types::{
    ActionTarget, ActionTargetId, BatchResult, BattleId, BattleQuery, BattleRecord, BattleStatus,
    NewUser, OfflineData, OfflineDataId, Player, PlayerId, StorageStats, Team, TeamId, User,
    UserCharacterLink, UserId,
};

use crate::error::{StoreError, StoreResult};

/// Whose battle history to read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BattleFilter {
    /// Battles the player participated in.
    Player(PlayerId),
    /// Battles fought by the team.
    Team(TeamId),
}

/// Maintenance capabilities used by the scheduler.
#[async_trait]
pub trait MaintenanceOps: Send + Sync {
    /// Short backend name (`in_memory`, `sqlite`, ...).
    fn kind(&self) -> &'static str;

    /// Reclaim space and refresh planner statistics.
    async fn optimize(&self) -> StoreResult<()>;

    /// Rebuild secondary indexes. Returns the number of index entries rebuilt.
    async fn rebuild_indexes(&self) -> StoreResult<u64>;

    /// Compact the backing store.
    async fn compact(&self) -> StoreResult<()>;

    /// Write a backup artifact into `dir` and return its path.
    async fn create_backup(&self, dir: &Path) -> StoreResult<PathBuf>;

    /// Delete synced offline data last written before `older_than`.
    async fn cleanup_synced_offline_data(&self, older_than: DateTime<Utc>) -> StoreResult<u64>;

    /// Delete finished action targets completed before `older_than`.
    async fn cleanup_action_history(&self, older_than: DateTime<Utc>) -> StoreResult<u64>;

    /// Delete finished battles ended before `older_than`.
    async fn cleanup_battle_records(&self, older_than: DateTime<Utc>) -> StoreResult<u64>;
}

/// The full storage contract.
#[async_trait]
pub trait StorageBackend: MaintenanceOps {
    // =========================================================================
    // Users
    // =========================================================================

    /// Load a user by id.
    async fn get_user(&self, id: &UserId) -> StoreResult<User>;

    /// Load an active user by username (case-insensitive).
    async fn get_user_by_username(&self, username: &str) -> StoreResult<User>;

    /// Load an active user by email (case-insensitive).
    async fn get_user_by_email(&self, email: &str) -> StoreResult<User>;

    /// Create a user, hashing `raw_password`.
    ///
    /// Fails with [`StoreError::Conflict`] when another active user holds
    /// the same username or email.
    async fn create_user(&self, input: NewUser, raw_password: &str) -> StoreResult<User>;

    /// Replace an existing user.
    async fn update_user(&self, user: User) -> StoreResult<User>;

    /// Delete a user with its indexes and character links.
    async fn delete_user(&self, id: &UserId) -> StoreResult<bool>;

    /// Whether `raw_password` is correct for a usable account.
    async fn validate_password(&self, id: &UserId, raw_password: &str) -> StoreResult<bool>;

    /// Lock a user, indefinitely when `until` is `None`.
    async fn lock_user(&self, id: &UserId, until: Option<DateTime<Utc>>) -> StoreResult<bool>;

    /// Clear a user's lock and failure counter.
    async fn unlock_user(&self, id: &UserId) -> StoreResult<bool>;

    /// Record a login attempt and apply the lockout rule.
    async fn record_login(&self, id: &UserId, success: bool, source_ip: Option<&str>) -> StoreResult<User>;

    // =========================================================================
    // Character links
    // =========================================================================

    /// Create an ownership link.
    ///
    /// Fails with [`StoreError::Conflict`] if the character already has an
    /// active owner, and [`StoreError::NotFound`] if the user is missing.
    async fn create_user_character_link(&self, link: UserCharacterLink) -> StoreResult<UserCharacterLink>;

    /// Active links of a user ordered by slot.
    async fn get_user_characters(&self, user_id: &UserId) -> StoreResult<Vec<UserCharacterLink>>;

    /// Owner of a character through its active link.
    async fn get_character_owner(&self, character_id: &PlayerId) -> StoreResult<UserId>;

    /// Make `character_id` the user's default character.
    async fn set_default_character(&self, user_id: &UserId, character_id: &PlayerId) -> StoreResult<bool>;

    /// Remove an ownership link.
    async fn delete_user_character_link(&self, user_id: &UserId, character_id: &PlayerId) -> StoreResult<bool>;

    // =========================================================================
    // Players
    // =========================================================================

    /// Load a player.
    async fn get_player(&self, id: &PlayerId) -> StoreResult<Player>;

    /// Upsert a player, enforcing record invariants and monotonic progression.
    async fn save_player(&self, player: Player) -> StoreResult<Player>;

    /// Delete a player.
    async fn delete_player(&self, id: &PlayerId) -> StoreResult<bool>;

    /// Players flagged online.
    async fn get_online_players(&self) -> StoreResult<Vec<Player>>;

    /// Save many players; each item succeeds or fails on its own.
    async fn batch_save_players(&self, players: Vec<Player>) -> StoreResult<BatchResult>;

    /// Players whose name contains `term` (case-insensitive).
    async fn search_players(&self, term: &str, limit: u32) -> StoreResult<Vec<Player>>;

    /// Reset level and experience; the only write allowed to lower them.
    async fn reset_player_progress(&self, id: &PlayerId) -> StoreResult<Player>;

    // =========================================================================
    // Teams
    // =========================================================================

    /// Load a team.
    async fn get_team(&self, id: &TeamId) -> StoreResult<Team>;

    /// The live team captained by `captain_id`, if any.
    async fn get_team_by_captain(&self, captain_id: &PlayerId) -> StoreResult<Option<Team>>;

    /// The live team `player_id` belongs to, if any.
    async fn get_team_by_player(&self, player_id: &PlayerId) -> StoreResult<Option<Team>>;

    /// Upsert a team and its member index.
    ///
    /// Fails with [`StoreError::Conflict`] when a member already belongs
    /// to another live team.
    async fn save_team(&self, team: Team) -> StoreResult<Team>;

    /// Delete a team and release its members.
    async fn delete_team(&self, id: &TeamId) -> StoreResult<bool>;

    /// Teams that are not disbanded.
    async fn get_active_teams(&self) -> StoreResult<Vec<Team>>;

    // =========================================================================
    // Action targets
    // =========================================================================

    /// The player's incomplete action target, if any.
    async fn get_current_action_target(&self, player_id: &PlayerId) -> StoreResult<Option<ActionTarget>>;

    /// Upsert an action target. An incomplete target supersedes the
    /// player's previous incomplete one in the same operation.
    async fn save_action_target(&self, target: ActionTarget) -> StoreResult<ActionTarget>;

    /// Mark an action target completed.
    async fn complete_action_target(&self, id: &ActionTargetId) -> StoreResult<ActionTarget>;

    /// Cancel the player's current action target. Returns whether one existed.
    async fn cancel_action_target(&self, player_id: &PlayerId) -> StoreResult<bool>;

    /// The player's action targets, newest first.
    async fn get_action_history(&self, player_id: &PlayerId, limit: u32) -> StoreResult<Vec<ActionTarget>>;

    // =========================================================================
    // Battles
    // =========================================================================

    /// Load a battle record.
    async fn get_battle_record(&self, id: &BattleId) -> StoreResult<BattleRecord>;

    /// Upsert a battle record.
    async fn save_battle_record(&self, record: BattleRecord) -> StoreResult<BattleRecord>;

    /// Close an in-progress battle with a terminal status.
    async fn end_battle_record(
        &self,
        id: &BattleId,
        status: BattleStatus,
        results: serde_json::Value,
    ) -> StoreResult<BattleRecord>;

    /// Battles of a player or team, newest first.
    async fn get_battle_history(&self, filter: &BattleFilter, query: &BattleQuery) -> StoreResult<Vec<BattleRecord>>;

    /// Battles still in progress.
    async fn get_active_battles(&self) -> StoreResult<Vec<BattleRecord>>;

    // =========================================================================
    // Offline data
    // =========================================================================

    /// Upsert an offline-data record, bumping its version.
    async fn save_offline_data(&self, data: OfflineData) -> StoreResult<OfflineData>;

    /// The player's unsynced records, oldest first.
    async fn get_unsynced_offline_data(&self, player_id: &PlayerId) -> StoreResult<Vec<OfflineData>>;

    /// Mark records synced. Returns how many changed state.
    async fn mark_offline_data_synced(&self, ids: &[OfflineDataId]) -> StoreResult<u64>;

    // =========================================================================
    // Diagnostics
    // =========================================================================

    /// Aggregate entity counts.
    async fn get_storage_stats(&self) -> StoreResult<StorageStats>;

    /// Connectivity check.
    async fn health_check(&self) -> StoreResult<bool>;
}

// =========================================================================
// Shared write rules
// =========================================================================

/// Reject a record-local invariant failure as a validation error.
pub(crate) fn validated(check: Result<(), String>) -> StoreResult<()> {
    check.map_err(StoreError::Validation)
}

/// Rules for replacing a stored offline-data record with `next`.
///
/// Returns the record to store with its version bumped and timestamps set.
pub(crate) fn next_offline_version(previous: Option<&OfflineData>, mut next: OfflineData) -> StoreResult<OfflineData> {
    validated(next.check_invariants())?;
    let now = Utc::now();
    if let Some(prev) = previous {
        if prev.is_synced && !next.is_synced {
            return Err(StoreError::Conflict(format!(
                "offline data {} is already synced and cannot be unsynced",
                next.id
            )));
        }
        next.version = prev.version.saturating_add(1);
        next.created_at = prev.created_at;
    } else {
        next.version = 1;
    }
    next.updated_at = now;
    Ok(next)
}

/// Rules for replacing a stored player with `next`.
pub(crate) fn check_player_write(previous: Option<&Player>, next: &Player) -> StoreResult<()> {
    validated(next.check_invariants())?;
    if let Some(prev) = previous {
        validated(next.check_progression(prev))?;
    }
    Ok(())
}

/// Rules for closing a battle.
pub(crate) fn close_battle(record: &mut BattleRecord, status: BattleStatus, results: serde_json::Value) -> StoreResult<()> {
    if !status.is_terminal() {
        return Err(StoreError::Validation(format!(
            "battle can only be ended with a terminal status, got {status}"
        )));
    }
    if record.status.is_terminal() {
        return Err(StoreError::Conflict(format!("battle {} already ended", record.id)));
    }
    record.close(status, results, Utc::now());
    Ok(())
}

// =========================================================================
// Deadlines and retries
// =========================================================================

/// Run `fut` under `timeout`, mapping expiry to [`StoreError::Timeout`].
pub async fn with_deadline<T, F>(timeout: Duration, fut: F) -> StoreResult<T>
where
    F: Future<Output = StoreResult<T>> + Send,
{
    match tokio::time::timeout(timeout, fut).await {
        Ok(result) => result,
        Err(_) => Err(StoreError::Timeout(u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX))),
    }
}

/// Run a read, retrying it once after a transient failure.
///
/// Writes must not go through this helper.
pub async fn read_with_retry<T, F, Fut>(operation: &'static str, mut read: F) -> StoreResult<T>
where
    F: FnMut() -> Fut + Send,
    Fut: Future<Output = StoreResult<T>> + Send,
{
    match read().await {
        Err(e) if e.is_transient() => {
            tracing::debug!(operation, error = %e, "Transient read failure, retrying once");
            read().await
        }
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    use questvault_types::{BattleType, PlayerId};

    use super::*;

    #[tokio::test]
    async fn deadline_expiry_is_a_timeout() {
        let result: StoreResult<()> = with_deadline(Duration::from_millis(5), async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        })
        .await;
        assert!(matches!(result, Err(StoreError::Timeout(5))));
    }

    #[tokio::test]
    async fn transient_read_is_retried_once() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);
        let result = read_with_retry("ping", move || {
            let counter = Arc::clone(&counter);
            async move {
                if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                    Err(StoreError::BackendUnavailable(String::from("blip")))
                } else {
                    Ok(7_u32)
                }
            }
        })
        .await;
        assert_eq!(result.ok(), Some(7));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn non_transient_read_is_not_retried() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);
        let result: StoreResult<u32> = read_with_retry("ping", move || {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(StoreError::not_found("player", "p"))
            }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn synced_offline_data_cannot_be_unsynced() {
        let mut stored = OfflineData::new(PlayerId::from("char-1"), "gathering_rewards", serde_json::Value::Null);
        stored.is_synced = true;
        stored.synced_at = Some(Utc::now());
        let mut next = stored.clone();
        next.is_synced = false;
        next.synced_at = None;
        assert!(matches!(
            next_offline_version(Some(&stored), next),
            Err(StoreError::Conflict(_))
        ));
    }

    #[test]
    fn offline_versions_count_writes() {
        let first = OfflineData::new(PlayerId::from("char-1"), "gathering_rewards", serde_json::Value::Null);
        let Ok(v1) = next_offline_version(None, first) else {
            return;
        };
        assert_eq!(v1.version, 1);
        let Ok(v2) = next_offline_version(Some(&v1), v1.clone()) else {
            return;
        };
        assert_eq!(v2.version, 2);
    }

    #[test]
    fn closing_twice_is_a_conflict() {
        let mut record = BattleRecord::begin(BattleId::from("b-1"), BattleType::Solo, vec![PlayerId::from("char-1")]);
        assert!(matches!(
            close_battle(&mut record, BattleStatus::InProgress, serde_json::Value::Null),
            Err(StoreError::Validation(_))
        ));
        assert!(close_battle(&mut record, BattleStatus::Completed, serde_json::Value::Null).is_ok());
        assert!(matches!(
            close_battle(&mut record, BattleStatus::Aborted, serde_json::Value::Null),
            Err(StoreError::Conflict(_))
        ));
    }
}
