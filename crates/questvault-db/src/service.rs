//! Inbound service facade.
//!
//! [`GameDataService`] is what the transport layer calls: one method per
//! contract operation, each returning an [`ApiResponse`] envelope instead
//! of a `Result`. Failures are logged here once and reported through the
//! envelope's `error_code`; nothing below this layer reaches a client as
//! a raw error.
//!
//! When a [`WriteCoordinator`] is attached, player reads consult its queue
//! first so a queued save is visible before it is flushed, and every
//! direct write is ordered against the coordinator's flushes so a queued
//! save can never overwrite a newer direct one.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use questvault_types::{
    ActionTarget, ActionTargetId, ApiResponse, BatchResult, BattleId, BattleQuery, BattleRecord, BattleStatus,
    CharacterListing, EntityKind, NewUser, OfflineData, OfflineDataId, Player, PlayerId, PlayerSummary, StorageStats, Team,
    TeamId, UserCharacterLink, UserDto, UserId,
};

use crate::backend::{BattleFilter, StorageBackend};
use crate::batch::WriteCoordinator;
use crate::error::{StoreError, StoreResult};

/// Wrap `result` in the envelope, logging a failure once.
fn envelope<T>(operation: &'static str, result: StoreResult<T>, message: &str) -> ApiResponse<T> {
    match result {
        Ok(data) => ApiResponse::ok(data, message),
        Err(e) => {
            if e.is_not_found() {
                tracing::debug!(operation, error = %e, "Lookup missed");
            } else {
                tracing::warn!(operation, code = ?e.code(), error = %e, "Operation failed");
            }
            ApiResponse::fail(e.code(), e.to_string())
        }
    }
}

/// Envelope-returning facade over a storage backend.
#[derive(Clone)]
pub struct GameDataService {
    backend: Arc<dyn StorageBackend>,
    writes: Option<Arc<WriteCoordinator>>,
}

impl GameDataService {
    /// A facade over `backend` with no queued writes.
    pub const fn new(backend: Arc<dyn StorageBackend>) -> Self {
        Self { backend, writes: None }
    }

    /// Route queued saves through `writes`.
    #[must_use]
    pub fn with_writes(mut self, writes: Arc<WriteCoordinator>) -> Self {
        self.writes = Some(writes);
        self
    }

    /// The backend calls go to.
    pub const fn backend(&self) -> &Arc<dyn StorageBackend> {
        &self.backend
    }

    /// Run a direct write for one key, superseding any queued save for it.
    async fn direct<T, F>(&self, kind: EntityKind, key: &str, write: F) -> StoreResult<T>
    where
        F: Future<Output = StoreResult<T>> + Send,
    {
        match &self.writes {
            Some(writes) => writes.write_through(kind, key, write).await,
            None => write.await,
        }
    }

    // =========================================================================
    // Users
    // =========================================================================

    /// Create an account.
    pub async fn create_user(&self, input: NewUser, raw_password: &str) -> ApiResponse<UserDto> {
        let result = self.backend.create_user(input, raw_password).await;
        envelope("create_user", result.map(|u| UserDto::from(&u)), "user created")
    }

    /// Load an account by id.
    pub async fn get_user(&self, id: &UserId) -> ApiResponse<UserDto> {
        let result = self.backend.get_user(id).await;
        envelope("get_user", result.map(|u| UserDto::from(&u)), "user loaded")
    }

    /// Load an account by username (case-insensitive).
    pub async fn get_user_by_username(&self, username: &str) -> ApiResponse<UserDto> {
        let result = self.backend.get_user_by_username(username).await;
        envelope("get_user_by_username", result.map(|u| UserDto::from(&u)), "user loaded")
    }

    /// Load an account by email (case-insensitive).
    pub async fn get_user_by_email(&self, email: &str) -> ApiResponse<UserDto> {
        let result = self.backend.get_user_by_email(email).await;
        envelope("get_user_by_email", result.map(|u| UserDto::from(&u)), "user loaded")
    }

    /// Replace the mutable profile fields of an account.
    ///
    /// Credentials are never taken from the caller: the stored hash and
    /// salt are kept.
    pub async fn update_user_profile(
        &self,
        id: &UserId,
        email: Option<String>,
        profile: Option<serde_json::Value>,
    ) -> ApiResponse<UserDto> {
        let result = async {
            let mut user = self.backend.get_user(id).await?;
            if let Some(email) = email {
                user.email = email;
            }
            if let Some(profile) = profile {
                user.profile = profile;
            }
            self.backend.update_user(user).await
        }
        .await;
        envelope("update_user_profile", result.map(|u| UserDto::from(&u)), "user updated")
    }

    /// Delete an account and its character links.
    pub async fn delete_user(&self, id: &UserId) -> ApiResponse<bool> {
        envelope("delete_user", self.backend.delete_user(id).await, "user deleted")
    }

    /// Check a password. Unknown, inactive or locked accounts never match.
    pub async fn validate_password(&self, id: &UserId, raw_password: &str) -> ApiResponse<bool> {
        let result = match self.backend.validate_password(id, raw_password).await {
            Err(e) if e.is_not_found() => Ok(false),
            other => other,
        };
        envelope("validate_password", result, "password checked")
    }

    /// Verify a login by username and record the attempt.
    ///
    /// Returns the account on success; a wrong password is a validation
    /// failure and counts toward the lockout threshold.
    pub async fn login(&self, username: &str, raw_password: &str, source_ip: Option<&str>) -> ApiResponse<UserDto> {
        let result = async {
            let user = self.backend.get_user_by_username(username).await?;
            let accepted = self.backend.validate_password(&user.id, raw_password).await?;
            let user = self.backend.record_login(&user.id, accepted, source_ip).await?;
            if accepted {
                Ok(user)
            } else {
                Err(StoreError::Validation(String::from("invalid credentials")))
            }
        }
        .await;
        envelope("login", result.map(|u| UserDto::from(&u)), "login accepted")
    }

    /// Lock an account until `until` (indefinitely when `None`).
    pub async fn lock_user(&self, id: &UserId, until: Option<DateTime<Utc>>) -> ApiResponse<bool> {
        envelope("lock_user", self.backend.lock_user(id, until).await, "user locked")
    }

    /// Clear a lock and the failure counter.
    pub async fn unlock_user(&self, id: &UserId) -> ApiResponse<bool> {
        envelope("unlock_user", self.backend.unlock_user(id).await, "user unlocked")
    }

    // =========================================================================
    // Character links
    // =========================================================================

    /// Attach a character to an account.
    pub async fn create_character_link(&self, link: UserCharacterLink) -> ApiResponse<CharacterListing> {
        let result = self.backend.create_user_character_link(link).await;
        envelope("create_character_link", result.map(|l| CharacterListing::from(&l)), "character linked")
    }

    /// The account's characters by slot.
    pub async fn get_user_characters(&self, user_id: &UserId) -> ApiResponse<Vec<CharacterListing>> {
        let result = self.backend.get_user_characters(user_id).await;
        envelope(
            "get_user_characters",
            result.map(|links| links.iter().map(CharacterListing::from).collect()),
            "characters loaded",
        )
    }

    /// Owner of a character.
    pub async fn get_character_owner(&self, character_id: &PlayerId) -> ApiResponse<UserId> {
        envelope(
            "get_character_owner",
            self.backend.get_character_owner(character_id).await,
            "owner loaded",
        )
    }

    /// Make one character the account's default.
    pub async fn set_default_character(&self, user_id: &UserId, character_id: &PlayerId) -> ApiResponse<bool> {
        envelope(
            "set_default_character",
            self.backend.set_default_character(user_id, character_id).await,
            "default character set",
        )
    }

    /// Detach a character from an account.
    pub async fn delete_character_link(&self, user_id: &UserId, character_id: &PlayerId) -> ApiResponse<bool> {
        envelope(
            "delete_character_link",
            self.backend.delete_user_character_link(user_id, character_id).await,
            "character unlinked",
        )
    }

    // =========================================================================
    // Players
    // =========================================================================

    /// Load a player, preferring a queued save that has not flushed yet.
    pub async fn get_player(&self, id: &PlayerId) -> ApiResponse<Player> {
        if let Some(pending) = self.writes.as_ref().and_then(|w| w.pending_player(id)) {
            return ApiResponse::ok(pending, "player loaded");
        }
        envelope("get_player", self.backend.get_player(id).await, "player loaded")
    }

    /// Save a player immediately. A queued save for the same player is
    /// superseded.
    pub async fn save_player(&self, player: Player) -> ApiResponse<Player> {
        let id = player.id.clone();
        let result = self
            .direct(EntityKind::Player, id.as_str(), self.backend.save_player(player))
            .await;
        envelope("save_player", result, "player saved")
    }

    /// Queue a player save for the next batch flush.
    ///
    /// Without a coordinator the save happens immediately. The payload is
    /// the flush result when this save filled the batch.
    pub async fn queue_player_save(&self, player: Player) -> ApiResponse<Option<BatchResult>> {
        let result = match &self.writes {
            Some(writes) => writes.save_player(player).await,
            None => self.backend.save_player(player).await.map(|_| None),
        };
        envelope("queue_player_save", result, "player save queued")
    }

    /// Delete a player.
    pub async fn delete_player(&self, id: &PlayerId) -> ApiResponse<bool> {
        let result = self
            .direct(EntityKind::Player, id.as_str(), self.backend.delete_player(id))
            .await;
        envelope("delete_player", result, "player deleted")
    }

    /// Players currently online.
    pub async fn get_online_players(&self) -> ApiResponse<Vec<PlayerSummary>> {
        let result = self.backend.get_online_players().await;
        envelope(
            "get_online_players",
            result.map(|players| players.iter().map(PlayerSummary::from).collect()),
            "online players loaded",
        )
    }

    /// Save many players, reporting each failure.
    pub async fn batch_save_players(&self, players: Vec<Player>) -> ApiResponse<BatchResult> {
        let result = match &self.writes {
            Some(writes) => writes.save_players_now(players).await,
            None => self.backend.batch_save_players(players).await,
        };
        envelope("batch_save_players", result, "batch processed")
    }

    /// Players whose name contains `term` (case-insensitive).
    pub async fn search_players(&self, term: &str, limit: u32) -> ApiResponse<Vec<PlayerSummary>> {
        let result = self.backend.search_players(term, limit).await;
        envelope(
            "search_players",
            result.map(|players| players.iter().map(PlayerSummary::from).collect()),
            "search complete",
        )
    }

    /// Reset a player to level 1 with no experience.
    pub async fn reset_player_progress(&self, id: &PlayerId) -> ApiResponse<Player> {
        let result = self
            .direct(EntityKind::Player, id.as_str(), self.backend.reset_player_progress(id))
            .await;
        envelope("reset_player_progress", result, "player progress reset")
    }

    // =========================================================================
    // Teams
    // =========================================================================

    /// Load a team.
    pub async fn get_team(&self, id: &TeamId) -> ApiResponse<Team> {
        envelope("get_team", self.backend.get_team(id).await, "team loaded")
    }

    /// Team led by a player, if any.
    pub async fn get_team_by_captain(&self, captain_id: &PlayerId) -> ApiResponse<Option<Team>> {
        envelope(
            "get_team_by_captain",
            self.backend.get_team_by_captain(captain_id).await,
            "team lookup complete",
        )
    }

    /// Live team a player belongs to, if any.
    pub async fn get_team_by_player(&self, player_id: &PlayerId) -> ApiResponse<Option<Team>> {
        envelope(
            "get_team_by_player",
            self.backend.get_team_by_player(player_id).await,
            "team lookup complete",
        )
    }

    /// Save a team.
    pub async fn save_team(&self, team: Team) -> ApiResponse<Team> {
        let id = team.id.clone();
        let result = self.direct(EntityKind::Team, id.as_str(), self.backend.save_team(team)).await;
        envelope("save_team", result, "team saved")
    }

    /// Add a member to a stored team.
    ///
    /// A full or disbanded team, or an existing member, is a conflict and
    /// leaves the stored team unchanged.
    pub async fn add_team_member(&self, team_id: &TeamId, player_id: PlayerId) -> ApiResponse<Team> {
        let result = async {
            let mut team = self.backend.get_team(team_id).await?;
            if !team.add_member(player_id.clone()) {
                return Err(StoreError::Conflict(format!(
                    "player {player_id} cannot join team {team_id} ({} members, status {})",
                    team.member_ids.len(),
                    team.status
                )));
            }
            self.backend.save_team(team).await
        };
        let result = self.direct(EntityKind::Team, team_id.as_str(), result).await;
        envelope("add_team_member", result, "member added")
    }

    /// Remove a non-captain member from a stored team.
    pub async fn remove_team_member(&self, team_id: &TeamId, player_id: &PlayerId) -> ApiResponse<Team> {
        let result = async {
            let mut team = self.backend.get_team(team_id).await?;
            if !team.remove_member(player_id) {
                return Err(StoreError::Conflict(format!(
                    "player {player_id} is the captain of or not a member of team {team_id}"
                )));
            }
            self.backend.save_team(team).await
        };
        let result = self.direct(EntityKind::Team, team_id.as_str(), result).await;
        envelope("remove_team_member", result, "member removed")
    }

    /// Delete a team.
    pub async fn delete_team(&self, id: &TeamId) -> ApiResponse<bool> {
        let result = self.direct(EntityKind::Team, id.as_str(), self.backend.delete_team(id)).await;
        envelope("delete_team", result, "team deleted")
    }

    /// Teams that are not disbanded.
    pub async fn get_active_teams(&self) -> ApiResponse<Vec<Team>> {
        envelope("get_active_teams", self.backend.get_active_teams().await, "teams loaded")
    }

    // =========================================================================
    // Action targets
    // =========================================================================

    /// The player's unfinished action, if any.
    pub async fn get_current_action_target(&self, player_id: &PlayerId) -> ApiResponse<Option<ActionTarget>> {
        envelope(
            "get_current_action_target",
            self.backend.get_current_action_target(player_id).await,
            "action lookup complete",
        )
    }

    /// Save an action; a new unfinished one supersedes the current one.
    pub async fn save_action_target(&self, target: ActionTarget) -> ApiResponse<ActionTarget> {
        let id = target.id.clone();
        let result = self
            .direct(EntityKind::ActionTarget, id.as_str(), self.backend.save_action_target(target))
            .await;
        envelope("save_action_target", result, "action saved")
    }

    /// Finish an action as completed.
    pub async fn complete_action_target(&self, id: &ActionTargetId) -> ApiResponse<ActionTarget> {
        let result = self
            .direct(EntityKind::ActionTarget, id.as_str(), self.backend.complete_action_target(id))
            .await;
        envelope("complete_action_target", result, "action completed")
    }

    /// Cancel the player's unfinished action.
    pub async fn cancel_action_target(&self, player_id: &PlayerId) -> ApiResponse<bool> {
        envelope(
            "cancel_action_target",
            self.backend.cancel_action_target(player_id).await,
            "action cancelled",
        )
    }

    /// Finished actions, newest first.
    pub async fn get_action_history(&self, player_id: &PlayerId, limit: u32) -> ApiResponse<Vec<ActionTarget>> {
        envelope(
            "get_action_history",
            self.backend.get_action_history(player_id, limit).await,
            "action history loaded",
        )
    }

    // =========================================================================
    // Battles
    // =========================================================================

    /// Load a battle.
    pub async fn get_battle_record(&self, id: &BattleId) -> ApiResponse<BattleRecord> {
        envelope("get_battle_record", self.backend.get_battle_record(id).await, "battle loaded")
    }

    /// Save a battle.
    pub async fn save_battle_record(&self, record: BattleRecord) -> ApiResponse<BattleRecord> {
        let id = record.id.clone();
        let result = self
            .direct(EntityKind::BattleRecord, id.as_str(), self.backend.save_battle_record(record))
            .await;
        envelope("save_battle_record", result, "battle saved")
    }

    /// Close an in-progress battle.
    pub async fn end_battle_record(
        &self,
        id: &BattleId,
        status: BattleStatus,
        results: serde_json::Value,
    ) -> ApiResponse<BattleRecord> {
        let result = self
            .direct(EntityKind::BattleRecord, id.as_str(), self.backend.end_battle_record(id, status, results))
            .await;
        envelope("end_battle_record", result, "battle ended")
    }

    /// Battles a player took part in, newest first.
    pub async fn get_player_battle_history(&self, player_id: &PlayerId, query: &BattleQuery) -> ApiResponse<Vec<BattleRecord>> {
        let filter = BattleFilter::Player(player_id.clone());
        envelope(
            "get_player_battle_history",
            self.backend.get_battle_history(&filter, query).await,
            "battle history loaded",
        )
    }

    /// Battles a team fought, newest first.
    pub async fn get_team_battle_history(&self, team_id: &TeamId, query: &BattleQuery) -> ApiResponse<Vec<BattleRecord>> {
        let filter = BattleFilter::Team(team_id.clone());
        envelope(
            "get_team_battle_history",
            self.backend.get_battle_history(&filter, query).await,
            "battle history loaded",
        )
    }

    /// Battles still in progress.
    pub async fn get_active_battles(&self) -> ApiResponse<Vec<BattleRecord>> {
        envelope("get_active_battles", self.backend.get_active_battles().await, "battles loaded")
    }

    // =========================================================================
    // Offline data
    // =========================================================================

    /// Save an offline-progress record.
    pub async fn save_offline_data(&self, data: OfflineData) -> ApiResponse<OfflineData> {
        let id = data.id.clone();
        let result = self
            .direct(EntityKind::OfflineData, id.as_str(), self.backend.save_offline_data(data))
            .await;
        envelope("save_offline_data", result, "offline data saved")
    }

    /// The player's unsynced records, oldest first.
    pub async fn get_unsynced_offline_data(&self, player_id: &PlayerId) -> ApiResponse<Vec<OfflineData>> {
        envelope(
            "get_unsynced_offline_data",
            self.backend.get_unsynced_offline_data(player_id).await,
            "offline data loaded",
        )
    }

    /// Mark records synced.
    pub async fn mark_offline_data_synced(&self, ids: &[OfflineDataId]) -> ApiResponse<u64> {
        envelope(
            "mark_offline_data_synced",
            self.backend.mark_offline_data_synced(ids).await,
            "offline data synced",
        )
    }

    // =========================================================================
    // Diagnostics
    // =========================================================================

    /// Aggregate entity counts.
    pub async fn get_storage_stats(&self) -> ApiResponse<StorageStats> {
        envelope("get_storage_stats", self.backend.get_storage_stats().await, "stats collected")
    }
}
