//! In-memory storage backend.
//!
//! Each entity class lives in one table struct behind a
//! [`parking_lot::RwLock`]: the primary records plus every secondary
//! index for that class. A logical operation takes exactly one table
//! lock, updates the primary map and its indexes, and releases the lock
//! before returning, so indexes can never be observed out of step with
//! their records. No lock is held across an `.await`.
//!
//! State can be exported as a [`MemorySnapshot`] and restored from one,
//! which is how this backend writes backups and survives restarts.

use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use questvault_types::{
    ActionEndReason, ActionTarget, ActionTargetId, BatchResult, BattleId, BattleQuery, BattleRecord,
    BattleStatus, NewUser, OfflineData, OfflineDataId, Player, PlayerId, StorageStats, Team, TeamId,
    User, UserCharacterLink, UserId, normalize_key,
};
use serde::{Deserialize, Serialize};

use crate::backend::{
    BattleFilter, MaintenanceOps, StorageBackend, check_player_write, close_battle, next_offline_version,
    validated,
};
use crate::backup::artifact_path;
use crate::credentials::AccountPolicy;
use crate::error::{StoreError, StoreResult};

/// File extension of in-memory backup artifacts.
pub const SNAPSHOT_EXTENSION: &str = "json";

/// Full serialisable state of a [`MemoryBackend`].
///
/// Indexes are not part of the snapshot; they are rebuilt on load.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MemorySnapshot {
    /// When the snapshot was taken.
    #[serde(default)]
    pub taken_at: Option<DateTime<Utc>>,
    /// User accounts.
    #[serde(default)]
    pub users: Vec<User>,
    /// Character links, active and inactive.
    #[serde(default)]
    pub links: Vec<UserCharacterLink>,
    /// Player characters.
    #[serde(default)]
    pub players: Vec<Player>,
    /// Teams.
    #[serde(default)]
    pub teams: Vec<Team>,
    /// Action targets, current and historical.
    #[serde(default)]
    pub action_targets: Vec<ActionTarget>,
    /// Battle records.
    #[serde(default)]
    pub battles: Vec<BattleRecord>,
    /// Offline-progress deltas.
    #[serde(default)]
    pub offline_data: Vec<OfflineData>,
}

// =========================================================================
// Tables
// =========================================================================

#[derive(Default)]
struct UserTable {
    records: HashMap<UserId, User>,
    /// Lower-cased username of active users.
    by_username: HashMap<String, UserId>,
    /// Lower-cased email of active users.
    by_email: HashMap<String, UserId>,
    links: HashMap<UserId, Vec<UserCharacterLink>>,
    /// Character to owning user, active links only.
    owners: HashMap<PlayerId, UserId>,
}

impl UserTable {
    fn index_user(&mut self, user: &User) {
        if user.is_active {
            self.by_username.insert(user.username_key(), user.id.clone());
            self.by_email.insert(user.email_key(), user.id.clone());
        }
    }

    fn unindex_user(&mut self, user: &User) {
        if self.by_username.get(&user.username_key()) == Some(&user.id) {
            self.by_username.remove(&user.username_key());
        }
        if self.by_email.get(&user.email_key()) == Some(&user.id) {
            self.by_email.remove(&user.email_key());
        }
    }

    /// Conflict if another active user holds `user`'s username or email.
    fn check_unique(&self, user: &User) -> StoreResult<()> {
        if !user.is_active {
            return Ok(());
        }
        if self.by_username.get(&user.username_key()).is_some_and(|id| *id != user.id) {
            return Err(StoreError::Conflict(format!("username '{}' is already taken", user.username)));
        }
        if self.by_email.get(&user.email_key()).is_some_and(|id| *id != user.id) {
            return Err(StoreError::Conflict(format!("email '{}' is already registered", user.email)));
        }
        Ok(())
    }

    fn active_character_ids(&self, user_id: &UserId) -> Vec<PlayerId> {
        let mut active: Vec<&UserCharacterLink> = self
            .links
            .get(user_id)
            .map(|links| links.iter().filter(|l| l.is_active).collect())
            .unwrap_or_default();
        active.sort_by(|a, b| a.slot_index.cmp(&b.slot_index).then_with(|| a.character_id.cmp(&b.character_id)));
        active.into_iter().map(|l| l.character_id.clone()).collect()
    }

    fn refresh_character_ids(&mut self, user_id: &UserId) {
        let ids = self.active_character_ids(user_id);
        if let Some(user) = self.records.get_mut(user_id) {
            user.character_ids = ids;
        }
    }

    fn rebuild(&mut self) -> u64 {
        self.by_username.clear();
        self.by_email.clear();
        self.owners.clear();
        let users: Vec<User> = self.records.values().cloned().collect();
        for user in &users {
            self.index_user(user);
        }
        for (user_id, links) in &self.links {
            for link in links.iter().filter(|l| l.is_active) {
                self.owners.insert(link.character_id.clone(), user_id.clone());
            }
        }
        let user_ids: Vec<UserId> = self.records.keys().cloned().collect();
        for id in &user_ids {
            self.refresh_character_ids(id);
        }
        count(self.by_username.len())
            .saturating_add(count(self.by_email.len()))
            .saturating_add(count(self.owners.len()))
    }

    fn shrink(&mut self) {
        self.records.shrink_to_fit();
        self.by_username.shrink_to_fit();
        self.by_email.shrink_to_fit();
        self.links.retain(|_, links| !links.is_empty());
        self.links.shrink_to_fit();
        self.owners.shrink_to_fit();
    }
}

#[derive(Default)]
struct TeamTable {
    records: HashMap<TeamId, Team>,
    /// Member to live team.
    by_player: HashMap<PlayerId, TeamId>,
    /// Captain to live team.
    by_captain: HashMap<PlayerId, TeamId>,
}

impl TeamTable {
    fn index_team(&mut self, team: &Team) {
        if !team.status.is_live() {
            return;
        }
        for member in &team.member_ids {
            self.by_player.insert(member.clone(), team.id.clone());
        }
        self.by_captain.insert(team.captain_id.clone(), team.id.clone());
    }

    fn unindex_team(&mut self, team_id: &TeamId) {
        self.by_player.retain(|_, t| t != team_id);
        self.by_captain.retain(|_, t| t != team_id);
    }

    fn rebuild(&mut self) -> u64 {
        self.by_player.clear();
        self.by_captain.clear();
        let teams: Vec<Team> = self.records.values().cloned().collect();
        for team in &teams {
            self.index_team(team);
        }
        count(self.by_player.len()).saturating_add(count(self.by_captain.len()))
    }
}

#[derive(Default)]
struct ActionTable {
    records: HashMap<ActionTargetId, ActionTarget>,
    /// Player to their single incomplete target.
    current: HashMap<PlayerId, ActionTargetId>,
    /// Player to all of their targets.
    history: HashMap<PlayerId, BTreeSet<ActionTargetId>>,
}

impl ActionTable {
    fn rebuild(&mut self) -> u64 {
        self.current.clear();
        self.history.clear();
        for target in self.records.values() {
            self.history
                .entry(target.player_id.clone())
                .or_default()
                .insert(target.id.clone());
            if !target.is_completed {
                self.current.insert(target.player_id.clone(), target.id.clone());
            }
        }
        let entries: usize = self.history.values().map(BTreeSet::len).sum();
        count(entries).saturating_add(count(self.current.len()))
    }
}

#[derive(Default)]
struct BattleTable {
    records: HashMap<BattleId, BattleRecord>,
    by_player: HashMap<PlayerId, BTreeSet<BattleId>>,
    by_team: HashMap<TeamId, BTreeSet<BattleId>>,
}

impl BattleTable {
    fn index_battle(&mut self, record: &BattleRecord) {
        for player in &record.participant_ids {
            self.by_player.entry(player.clone()).or_default().insert(record.id.clone());
        }
        if let Some(team) = &record.team_id {
            self.by_team.entry(team.clone()).or_default().insert(record.id.clone());
        }
    }

    fn unindex_battle(&mut self, record: &BattleRecord) {
        for player in &record.participant_ids {
            if let Some(ids) = self.by_player.get_mut(player) {
                ids.remove(&record.id);
            }
        }
        if let Some(team) = &record.team_id {
            if let Some(ids) = self.by_team.get_mut(team) {
                ids.remove(&record.id);
            }
        }
    }

    fn rebuild(&mut self) -> u64 {
        self.by_player.clear();
        self.by_team.clear();
        let records: Vec<BattleRecord> = self.records.values().cloned().collect();
        for record in &records {
            self.index_battle(record);
        }
        let players: usize = self.by_player.values().map(BTreeSet::len).sum();
        let teams: usize = self.by_team.values().map(BTreeSet::len).sum();
        count(players).saturating_add(count(teams))
    }
}

#[derive(Default)]
struct OfflineTable {
    records: HashMap<OfflineDataId, OfflineData>,
    by_player: HashMap<PlayerId, BTreeSet<OfflineDataId>>,
}

impl OfflineTable {
    fn rebuild(&mut self) -> u64 {
        self.by_player.clear();
        for data in self.records.values() {
            self.by_player
                .entry(data.player_id.clone())
                .or_default()
                .insert(data.id.clone());
        }
        count(self.by_player.values().map(BTreeSet::len).sum())
    }
}

fn count(n: usize) -> u64 {
    u64::try_from(n).unwrap_or(u64::MAX)
}

fn limit_of(limit: u32) -> usize {
    usize::try_from(limit).unwrap_or(usize::MAX)
}

/// Newest-first ordering shared with the relational backend: millisecond
/// start time, then id.
fn newest_first(a_at: DateTime<Utc>, a_id: &str, b_at: DateTime<Utc>, b_id: &str) -> std::cmp::Ordering {
    b_at.timestamp_millis()
        .cmp(&a_at.timestamp_millis())
        .then_with(|| b_id.cmp(a_id))
}

// =========================================================================
// Backend
// =========================================================================

/// Thread-safe in-process backend.
pub struct MemoryBackend {
    policy: AccountPolicy,
    users: RwLock<UserTable>,
    players: RwLock<HashMap<PlayerId, Player>>,
    teams: RwLock<TeamTable>,
    actions: RwLock<ActionTable>,
    battles: RwLock<BattleTable>,
    offline: RwLock<OfflineTable>,
}

impl MemoryBackend {
    /// Create an empty backend.
    pub fn new(policy: AccountPolicy) -> Self {
        Self {
            policy,
            users: RwLock::new(UserTable::default()),
            players: RwLock::new(HashMap::new()),
            teams: RwLock::new(TeamTable::default()),
            actions: RwLock::new(ActionTable::default()),
            battles: RwLock::new(BattleTable::default()),
            offline: RwLock::new(OfflineTable::default()),
        }
    }

    /// Create a backend holding the state of `snapshot`, with indexes rebuilt.
    pub fn from_snapshot(policy: AccountPolicy, snapshot: MemorySnapshot) -> Self {
        let backend = Self::new(policy);
        {
            let mut users = backend.users.write();
            for user in snapshot.users {
                users.records.insert(user.id.clone(), user);
            }
            for link in snapshot.links {
                users.links.entry(link.user_id.clone()).or_default().push(link);
            }
            users.rebuild();
        }
        {
            let mut players = backend.players.write();
            for player in snapshot.players {
                players.insert(player.id.clone(), player);
            }
        }
        {
            let mut teams = backend.teams.write();
            for team in snapshot.teams {
                teams.records.insert(team.id.clone(), team);
            }
            teams.rebuild();
        }
        {
            let mut actions = backend.actions.write();
            for target in snapshot.action_targets {
                actions.records.insert(target.id.clone(), target);
            }
            actions.rebuild();
        }
        {
            let mut battles = backend.battles.write();
            for record in snapshot.battles {
                battles.records.insert(record.id.clone(), record);
            }
            battles.rebuild();
        }
        {
            let mut offline = backend.offline.write();
            for data in snapshot.offline_data {
                offline.records.insert(data.id.clone(), data);
            }
            offline.rebuild();
        }
        backend
    }

    /// Load a snapshot file, or start empty when it does not exist yet.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Io`] if the file cannot be read and
    /// [`StoreError::Serialization`] if it is not a valid snapshot.
    pub async fn open(policy: AccountPolicy, path: &Path) -> StoreResult<Self> {
        match tokio::fs::read(path).await {
            Ok(bytes) => {
                let snapshot: MemorySnapshot = serde_json::from_slice(&bytes)?;
                tracing::info!(
                    path = %path.display(),
                    users = snapshot.users.len(),
                    players = snapshot.players.len(),
                    "Loaded in-memory snapshot"
                );
                Ok(Self::from_snapshot(policy, snapshot))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!(path = %path.display(), "No snapshot found, starting empty");
                Ok(Self::new(policy))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Copy the full state out. Each table is read under its own lock.
    pub fn export_snapshot(&self) -> MemorySnapshot {
        let (users, links) = {
            let table = self.users.read();
            let users: Vec<User> = table.records.values().cloned().collect();
            let links: Vec<UserCharacterLink> = table.links.values().flatten().cloned().collect();
            (users, links)
        };
        MemorySnapshot {
            taken_at: Some(Utc::now()),
            users,
            links,
            players: self.players.read().values().cloned().collect(),
            teams: self.teams.read().records.values().cloned().collect(),
            action_targets: self.actions.read().records.values().cloned().collect(),
            battles: self.battles.read().records.values().cloned().collect(),
            offline_data: self.offline.read().records.values().cloned().collect(),
        }
    }

    /// Write a snapshot to `path`, replacing it atomically.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Io`] or [`StoreError::Serialization`].
    pub async fn save_snapshot(&self, path: &Path) -> StoreResult<()> {
        let bytes = serde_json::to_vec(&self.export_snapshot())?;
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        let staging = path.with_extension("tmp");
        tokio::fs::write(&staging, &bytes).await?;
        tokio::fs::rename(&staging, path).await?;
        tracing::debug!(path = %path.display(), bytes = bytes.len(), "Saved in-memory snapshot");
        Ok(())
    }

    fn store_player(&self, mut player: Player) -> StoreResult<Player> {
        let mut players = self.players.write();
        let previous = players.get(&player.id);
        check_player_write(previous, &player)?;
        if let Some(prev) = previous {
            player.created_at = prev.created_at;
        }
        player.updated_at = Utc::now();
        players.insert(player.id.clone(), player.clone());
        Ok(player)
    }
}

#[async_trait]
impl MaintenanceOps for MemoryBackend {
    fn kind(&self) -> &'static str {
        "in_memory"
    }

    async fn optimize(&self) -> StoreResult<()> {
        self.users.write().shrink();
        self.players.write().shrink_to_fit();
        self.offline.write().by_player.retain(|_, ids| !ids.is_empty());
        self.battles.write().by_player.retain(|_, ids| !ids.is_empty());
        self.actions.write().history.retain(|_, ids| !ids.is_empty());
        Ok(())
    }

    async fn rebuild_indexes(&self) -> StoreResult<u64> {
        let mut rebuilt = self.users.write().rebuild();
        rebuilt = rebuilt.saturating_add(self.teams.write().rebuild());
        rebuilt = rebuilt.saturating_add(self.actions.write().rebuild());
        rebuilt = rebuilt.saturating_add(self.battles.write().rebuild());
        rebuilt = rebuilt.saturating_add(self.offline.write().rebuild());
        Ok(rebuilt)
    }

    async fn compact(&self) -> StoreResult<()> {
        self.optimize().await?;
        {
            let mut teams = self.teams.write();
            teams.records.shrink_to_fit();
            teams.by_player.shrink_to_fit();
            teams.by_captain.shrink_to_fit();
        }
        {
            let mut actions = self.actions.write();
            actions.records.shrink_to_fit();
            actions.history.shrink_to_fit();
        }
        self.battles.write().records.shrink_to_fit();
        self.offline.write().records.shrink_to_fit();
        Ok(())
    }

    async fn create_backup(&self, dir: &Path) -> StoreResult<PathBuf> {
        tokio::fs::create_dir_all(dir).await?;
        let path = artifact_path(dir, SNAPSHOT_EXTENSION, Utc::now());
        self.save_snapshot(&path).await?;
        Ok(path)
    }

    async fn cleanup_synced_offline_data(&self, older_than: DateTime<Utc>) -> StoreResult<u64> {
        let mut table = self.offline.write();
        let expired: Vec<(OfflineDataId, PlayerId)> = table
            .records
            .values()
            .filter(|d| d.is_synced && d.synced_at.unwrap_or(d.updated_at) < older_than)
            .map(|d| (d.id.clone(), d.player_id.clone()))
            .collect();
        for (id, player) in &expired {
            table.records.remove(id);
            if let Some(ids) = table.by_player.get_mut(player) {
                ids.remove(id);
            }
        }
        Ok(count(expired.len()))
    }

    async fn cleanup_action_history(&self, older_than: DateTime<Utc>) -> StoreResult<u64> {
        let mut table = self.actions.write();
        let expired: Vec<(ActionTargetId, PlayerId)> = table
            .records
            .values()
            .filter(|t| t.is_completed && t.completed_at.unwrap_or(t.started_at) < older_than)
            .map(|t| (t.id.clone(), t.player_id.clone()))
            .collect();
        for (id, player) in &expired {
            table.records.remove(id);
            if let Some(ids) = table.history.get_mut(player) {
                ids.remove(id);
            }
        }
        Ok(count(expired.len()))
    }

    async fn cleanup_battle_records(&self, older_than: DateTime<Utc>) -> StoreResult<u64> {
        let mut table = self.battles.write();
        let expired: Vec<BattleRecord> = table
            .records
            .values()
            .filter(|b| b.status.is_terminal() && b.ended_at.is_some_and(|at| at < older_than))
            .cloned()
            .collect();
        for record in &expired {
            table.records.remove(&record.id);
            table.unindex_battle(record);
        }
        Ok(count(expired.len()))
    }
}

#[async_trait]
impl StorageBackend for MemoryBackend {
    // =========================================================================
    // Users
    // =========================================================================

    async fn get_user(&self, id: &UserId) -> StoreResult<User> {
        self.users
            .read()
            .records
            .get(id)
            .cloned()
            .ok_or_else(|| StoreError::not_found("user", id))
    }

    async fn get_user_by_username(&self, username: &str) -> StoreResult<User> {
        let table = self.users.read();
        table
            .by_username
            .get(&normalize_key(username))
            .and_then(|id| table.records.get(id))
            .cloned()
            .ok_or_else(|| StoreError::not_found("user", username))
    }

    async fn get_user_by_email(&self, email: &str) -> StoreResult<User> {
        let table = self.users.read();
        table
            .by_email
            .get(&normalize_key(email))
            .and_then(|id| table.records.get(id))
            .cloned()
            .ok_or_else(|| StoreError::not_found("user", email))
    }

    async fn create_user(&self, input: NewUser, raw_password: &str) -> StoreResult<User> {
        let user = self.policy.build_user(&input, raw_password)?;
        let mut table = self.users.write();
        table.check_unique(&user)?;
        table.index_user(&user);
        table.records.insert(user.id.clone(), user.clone());
        tracing::info!(user_id = %user.id, username = %user.username, "Created user");
        Ok(user)
    }

    async fn update_user(&self, mut user: User) -> StoreResult<User> {
        if user.username.trim().is_empty() || user.email.trim().is_empty() {
            return Err(StoreError::Validation(String::from("username and email must not be blank")));
        }
        let mut table = self.users.write();
        let previous = table
            .records
            .get(&user.id)
            .cloned()
            .ok_or_else(|| StoreError::not_found("user", &user.id))?;
        table.check_unique(&user)?;
        table.unindex_user(&previous);
        user.created_at = previous.created_at;
        user.updated_at = Utc::now();
        user.character_ids = table.active_character_ids(&user.id);
        table.index_user(&user);
        table.records.insert(user.id.clone(), user.clone());
        Ok(user)
    }

    async fn delete_user(&self, id: &UserId) -> StoreResult<bool> {
        let mut table = self.users.write();
        let Some(user) = table.records.remove(id) else {
            return Ok(false);
        };
        table.unindex_user(&user);
        if let Some(links) = table.links.remove(id) {
            for link in links.iter().filter(|l| l.is_active) {
                if table.owners.get(&link.character_id) == Some(id) {
                    table.owners.remove(&link.character_id);
                }
            }
        }
        tracing::info!(user_id = %id, "Deleted user");
        Ok(true)
    }

    async fn validate_password(&self, id: &UserId, raw_password: &str) -> StoreResult<bool> {
        let user = self.users.read().records.get(id).cloned();
        Ok(user.is_some_and(|u| self.policy.accepts(&u, raw_password, Utc::now())))
    }

    async fn lock_user(&self, id: &UserId, until: Option<DateTime<Utc>>) -> StoreResult<bool> {
        let mut table = self.users.write();
        let Some(user) = table.records.get_mut(id) else {
            return Ok(false);
        };
        user.is_locked = true;
        user.locked_until = until;
        user.updated_at = Utc::now();
        Ok(true)
    }

    async fn unlock_user(&self, id: &UserId) -> StoreResult<bool> {
        let mut table = self.users.write();
        let Some(user) = table.records.get_mut(id) else {
            return Ok(false);
        };
        user.is_locked = false;
        user.locked_until = None;
        user.failed_login_attempts = 0;
        user.updated_at = Utc::now();
        Ok(true)
    }

    async fn record_login(&self, id: &UserId, success: bool, source_ip: Option<&str>) -> StoreResult<User> {
        let mut table = self.users.write();
        let user = table
            .records
            .get_mut(id)
            .ok_or_else(|| StoreError::not_found("user", id))?;
        self.policy.apply_login(user, success, source_ip, Utc::now());
        Ok(user.clone())
    }

    // =========================================================================
    // Character links
    // =========================================================================

    async fn create_user_character_link(&self, mut link: UserCharacterLink) -> StoreResult<UserCharacterLink> {
        if link.character_id.is_blank() {
            return Err(StoreError::Validation(String::from("character id must not be empty")));
        }
        let mut table = self.users.write();
        if !table.records.contains_key(&link.user_id) {
            return Err(StoreError::not_found("user", &link.user_id));
        }
        if link.is_active && table.owners.contains_key(&link.character_id) {
            return Err(StoreError::Conflict(format!(
                "character {} already has an active owner",
                link.character_id
            )));
        }
        link.created_at = Utc::now();
        let user_id = link.user_id.clone();
        let links = table.links.entry(user_id.clone()).or_default();
        links.retain(|l| l.character_id != link.character_id);
        if link.is_active && link.is_default {
            for other in links.iter_mut() {
                other.is_default = false;
            }
        }
        links.push(link.clone());
        if link.is_active {
            table.owners.insert(link.character_id.clone(), user_id.clone());
        }
        table.refresh_character_ids(&user_id);
        tracing::debug!(user_id = %user_id, character_id = %link.character_id, "Linked character");
        Ok(link)
    }

    async fn get_user_characters(&self, user_id: &UserId) -> StoreResult<Vec<UserCharacterLink>> {
        let table = self.users.read();
        let mut active: Vec<UserCharacterLink> = table
            .links
            .get(user_id)
            .map(|links| links.iter().filter(|l| l.is_active).cloned().collect())
            .unwrap_or_default();
        active.sort_by(|a, b| a.slot_index.cmp(&b.slot_index).then_with(|| a.character_id.cmp(&b.character_id)));
        Ok(active)
    }

    async fn get_character_owner(&self, character_id: &PlayerId) -> StoreResult<UserId> {
        self.users
            .read()
            .owners
            .get(character_id)
            .cloned()
            .ok_or_else(|| StoreError::not_found("character owner", character_id))
    }

    async fn set_default_character(&self, user_id: &UserId, character_id: &PlayerId) -> StoreResult<bool> {
        let mut table = self.users.write();
        let Some(links) = table.links.get_mut(user_id) else {
            return Ok(false);
        };
        if !links.iter().any(|l| l.is_active && l.character_id == *character_id) {
            return Ok(false);
        }
        for link in links.iter_mut() {
            link.is_default = link.is_active && link.character_id == *character_id;
        }
        Ok(true)
    }

    async fn delete_user_character_link(&self, user_id: &UserId, character_id: &PlayerId) -> StoreResult<bool> {
        let mut table = self.users.write();
        let Some(links) = table.links.get_mut(user_id) else {
            return Ok(false);
        };
        let before = links.len();
        links.retain(|l| l.character_id != *character_id);
        let removed = links.len() != before;
        if removed {
            if table.owners.get(character_id) == Some(user_id) {
                table.owners.remove(character_id);
            }
            table.refresh_character_ids(user_id);
        }
        Ok(removed)
    }

    // =========================================================================
    // Players
    // =========================================================================

    async fn get_player(&self, id: &PlayerId) -> StoreResult<Player> {
        self.players
            .read()
            .get(id)
            .cloned()
            .ok_or_else(|| StoreError::not_found("player", id))
    }

    async fn save_player(&self, player: Player) -> StoreResult<Player> {
        self.store_player(player)
    }

    async fn delete_player(&self, id: &PlayerId) -> StoreResult<bool> {
        Ok(self.players.write().remove(id).is_some())
    }

    async fn get_online_players(&self) -> StoreResult<Vec<Player>> {
        let mut online: Vec<Player> = self.players.read().values().filter(|p| p.is_online).cloned().collect();
        online.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(online)
    }

    async fn batch_save_players(&self, players: Vec<Player>) -> StoreResult<BatchResult> {
        let mut result = BatchResult::default();
        for player in players {
            let key = player.id.to_string();
            match self.store_player(player) {
                Ok(_) => result.record_success(),
                Err(e) => result.record_failure(&key, e),
            }
        }
        Ok(result)
    }

    async fn search_players(&self, term: &str, limit: u32) -> StoreResult<Vec<Player>> {
        let needle = normalize_key(term);
        if needle.is_empty() {
            return Err(StoreError::Validation(String::from("search term must not be empty")));
        }
        let mut found: Vec<Player> = self
            .players
            .read()
            .values()
            .filter(|p| p.name.to_lowercase().contains(&needle))
            .cloned()
            .collect();
        found.sort_by(|a, b| {
            a.name
                .to_lowercase()
                .cmp(&b.name.to_lowercase())
                .then_with(|| a.id.cmp(&b.id))
        });
        found.truncate(limit_of(limit));
        Ok(found)
    }

    async fn reset_player_progress(&self, id: &PlayerId) -> StoreResult<Player> {
        let mut players = self.players.write();
        let player = players.get_mut(id).ok_or_else(|| StoreError::not_found("player", id))?;
        player.reset_progress();
        tracing::info!(player_id = %id, "Reset player progress");
        Ok(player.clone())
    }

    // =========================================================================
    // Teams
    // =========================================================================

    async fn get_team(&self, id: &TeamId) -> StoreResult<Team> {
        self.teams
            .read()
            .records
            .get(id)
            .cloned()
            .ok_or_else(|| StoreError::not_found("team", id))
    }

    async fn get_team_by_captain(&self, captain_id: &PlayerId) -> StoreResult<Option<Team>> {
        let table = self.teams.read();
        Ok(table
            .by_captain
            .get(captain_id)
            .and_then(|id| table.records.get(id))
            .cloned())
    }

    async fn get_team_by_player(&self, player_id: &PlayerId) -> StoreResult<Option<Team>> {
        let table = self.teams.read();
        Ok(table
            .by_player
            .get(player_id)
            .and_then(|id| table.records.get(id))
            .cloned())
    }

    async fn save_team(&self, mut team: Team) -> StoreResult<Team> {
        validated(team.check_invariants())?;
        let mut table = self.teams.write();
        if team.status.is_live() {
            for member in &team.member_ids {
                if let Some(other) = table.by_player.get(member).filter(|t| **t != team.id) {
                    return Err(StoreError::Conflict(format!("player {member} already belongs to team {other}")));
                }
            }
        }
        if let Some(prev) = table.records.get(&team.id) {
            team.created_at = prev.created_at;
        }
        team.updated_at = Utc::now();
        table.unindex_team(&team.id);
        table.index_team(&team);
        table.records.insert(team.id.clone(), team.clone());
        Ok(team)
    }

    async fn delete_team(&self, id: &TeamId) -> StoreResult<bool> {
        let mut table = self.teams.write();
        let removed = table.records.remove(id).is_some();
        if removed {
            table.unindex_team(id);
        }
        Ok(removed)
    }

    async fn get_active_teams(&self) -> StoreResult<Vec<Team>> {
        let mut teams: Vec<Team> = self
            .teams
            .read()
            .records
            .values()
            .filter(|t| t.status.is_live())
            .cloned()
            .collect();
        teams.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(teams)
    }

    // =========================================================================
    // Action targets
    // =========================================================================

    async fn get_current_action_target(&self, player_id: &PlayerId) -> StoreResult<Option<ActionTarget>> {
        let table = self.actions.read();
        Ok(table
            .current
            .get(player_id)
            .and_then(|id| table.records.get(id))
            .cloned())
    }

    async fn save_action_target(&self, mut target: ActionTarget) -> StoreResult<ActionTarget> {
        validated(target.check_invariants())?;
        let now = Utc::now();
        if target.is_completed {
            target.completed_at.get_or_insert(now);
            target.end_reason.get_or_insert(ActionEndReason::Completed);
        }
        let mut table = self.actions.write();
        if let Some(prev) = table.records.get(&target.id) {
            if prev.player_id != target.player_id {
                return Err(StoreError::Validation(String::from(
                    "an action target cannot move between players",
                )));
            }
        }
        let player = target.player_id.clone();
        let current = table.current.get(&player).cloned();
        if target.is_completed {
            if current.as_ref() == Some(&target.id) {
                table.current.remove(&player);
            }
        } else {
            if let Some(previous_id) = current.filter(|id| *id != target.id) {
                if let Some(previous) = table.records.get_mut(&previous_id) {
                    previous.finish(ActionEndReason::Superseded, now);
                    tracing::debug!(
                        player_id = %player,
                        superseded = %previous_id,
                        "Superseded action target"
                    );
                }
            }
            table.current.insert(player.clone(), target.id.clone());
        }
        table.history.entry(player).or_default().insert(target.id.clone());
        table.records.insert(target.id.clone(), target.clone());
        Ok(target)
    }

    async fn complete_action_target(&self, id: &ActionTargetId) -> StoreResult<ActionTarget> {
        let mut table = self.actions.write();
        let target = table
            .records
            .get_mut(id)
            .ok_or_else(|| StoreError::not_found("action target", id))?;
        if !target.is_completed {
            target.finish(ActionEndReason::Completed, Utc::now());
        }
        let done = target.clone();
        if table.current.get(&done.player_id) == Some(id) {
            table.current.remove(&done.player_id);
        }
        Ok(done)
    }

    async fn cancel_action_target(&self, player_id: &PlayerId) -> StoreResult<bool> {
        let mut table = self.actions.write();
        let Some(id) = table.current.remove(player_id) else {
            return Ok(false);
        };
        if let Some(target) = table.records.get_mut(&id) {
            target.finish(ActionEndReason::Cancelled, Utc::now());
        }
        Ok(true)
    }

    async fn get_action_history(&self, player_id: &PlayerId, limit: u32) -> StoreResult<Vec<ActionTarget>> {
        let table = self.actions.read();
        let mut history: Vec<ActionTarget> = table
            .history
            .get(player_id)
            .map(|ids| ids.iter().filter_map(|id| table.records.get(id)).cloned().collect())
            .unwrap_or_default();
        history.sort_by(|a, b| newest_first(a.started_at, a.id.as_str(), b.started_at, b.id.as_str()));
        history.truncate(limit_of(limit));
        Ok(history)
    }

    // =========================================================================
    // Battles
    // =========================================================================

    async fn get_battle_record(&self, id: &BattleId) -> StoreResult<BattleRecord> {
        self.battles
            .read()
            .records
            .get(id)
            .cloned()
            .ok_or_else(|| StoreError::not_found("battle record", id))
    }

    async fn save_battle_record(&self, record: BattleRecord) -> StoreResult<BattleRecord> {
        validated(record.check_invariants())?;
        let mut table = self.battles.write();
        if let Some(prev) = table.records.remove(&record.id) {
            table.unindex_battle(&prev);
        }
        table.index_battle(&record);
        table.records.insert(record.id.clone(), record.clone());
        Ok(record)
    }

    async fn end_battle_record(
        &self,
        id: &BattleId,
        status: BattleStatus,
        results: serde_json::Value,
    ) -> StoreResult<BattleRecord> {
        let mut table = self.battles.write();
        let record = table
            .records
            .get_mut(id)
            .ok_or_else(|| StoreError::not_found("battle record", id))?;
        close_battle(record, status, results)?;
        Ok(record.clone())
    }

    async fn get_battle_history(&self, filter: &BattleFilter, query: &BattleQuery) -> StoreResult<Vec<BattleRecord>> {
        let table = self.battles.read();
        let ids = match filter {
            BattleFilter::Player(player) => table.by_player.get(player),
            BattleFilter::Team(team) => table.by_team.get(team),
        };
        let mut records: Vec<BattleRecord> = ids
            .map(|ids| {
                ids.iter()
                    .filter_map(|id| table.records.get(id))
                    .filter(|r| query.status.is_none_or(|s| r.status == s))
                    .filter(|r| query.battle_type.is_none_or(|t| r.battle_type == t))
                    .filter(|r| {
                        query
                            .since
                            .is_none_or(|since| r.started_at.timestamp_millis() >= since.timestamp_millis())
                    })
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        records.sort_by(|a, b| newest_first(a.started_at, a.id.as_str(), b.started_at, b.id.as_str()));
        Ok(records
            .into_iter()
            .skip(limit_of(query.offset))
            .take(limit_of(query.limit))
            .collect())
    }

    async fn get_active_battles(&self) -> StoreResult<Vec<BattleRecord>> {
        let mut active: Vec<BattleRecord> = self
            .battles
            .read()
            .records
            .values()
            .filter(|r| r.status == BattleStatus::InProgress)
            .cloned()
            .collect();
        active.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(active)
    }

    // =========================================================================
    // Offline data
    // =========================================================================

    async fn save_offline_data(&self, data: OfflineData) -> StoreResult<OfflineData> {
        let mut table = self.offline.write();
        let stored = next_offline_version(table.records.get(&data.id), data)?;
        if let Some(prev) = table.records.get(&stored.id) {
            if prev.player_id != stored.player_id {
                let (old_player, id) = (prev.player_id.clone(), prev.id.clone());
                if let Some(ids) = table.by_player.get_mut(&old_player) {
                    ids.remove(&id);
                }
            }
        }
        table
            .by_player
            .entry(stored.player_id.clone())
            .or_default()
            .insert(stored.id.clone());
        table.records.insert(stored.id.clone(), stored.clone());
        Ok(stored)
    }

    async fn get_unsynced_offline_data(&self, player_id: &PlayerId) -> StoreResult<Vec<OfflineData>> {
        let table = self.offline.read();
        let mut pending: Vec<OfflineData> = table
            .by_player
            .get(player_id)
            .map(|ids| {
                ids.iter()
                    .filter_map(|id| table.records.get(id))
                    .filter(|d| !d.is_synced)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        pending.sort_by(|a, b| {
            a.created_at
                .timestamp_millis()
                .cmp(&b.created_at.timestamp_millis())
                .then_with(|| a.id.cmp(&b.id))
        });
        Ok(pending)
    }

    async fn mark_offline_data_synced(&self, ids: &[OfflineDataId]) -> StoreResult<u64> {
        let now = Utc::now();
        let mut table = self.offline.write();
        let mut changed = 0_u64;
        for id in ids {
            if let Some(data) = table.records.get_mut(id).filter(|d| !d.is_synced) {
                data.is_synced = true;
                data.synced_at = Some(now);
                data.version = data.version.saturating_add(1);
                data.updated_at = now;
                changed = changed.saturating_add(1);
            }
        }
        Ok(changed)
    }

    // =========================================================================
    // Diagnostics
    // =========================================================================

    async fn get_storage_stats(&self) -> StoreResult<StorageStats> {
        let now = Utc::now();
        let mut stats = StorageStats {
            backend: self.kind().to_owned(),
            ..StorageStats::default()
        };
        {
            let users = self.users.read();
            stats.total_users = count(users.records.len());
            stats.active_users = count(users.records.values().filter(|u| u.is_active).count());
            stats.locked_users = count(users.records.values().filter(|u| u.is_locked_at(now)).count());
        }
        {
            let players = self.players.read();
            stats.total_players = count(players.len());
            stats.online_players = count(players.values().filter(|p| p.is_online).count());
        }
        {
            let teams = self.teams.read();
            stats.total_teams = count(teams.records.len());
            stats.active_teams = count(teams.records.values().filter(|t| t.status.is_live()).count());
        }
        {
            let actions = self.actions.read();
            stats.total_action_targets = count(actions.records.len());
            stats.in_progress_action_targets = count(actions.records.values().filter(|t| !t.is_completed).count());
        }
        {
            let battles = self.battles.read();
            for record in battles.records.values() {
                match record.status {
                    BattleStatus::InProgress => stats.in_progress_battles = stats.in_progress_battles.saturating_add(1),
                    BattleStatus::Completed => stats.completed_battles = stats.completed_battles.saturating_add(1),
                    BattleStatus::Aborted => stats.aborted_battles = stats.aborted_battles.saturating_add(1),
                }
            }
        }
        {
            let offline = self.offline.read();
            stats.total_offline_data = count(offline.records.len());
            stats.unsynced_offline_data = count(offline.records.values().filter(|d| !d.is_synced).count());
        }
        Ok(stats)
    }

    async fn health_check(&self) -> StoreResult<bool> {
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use questvault_types::{ActionType, BattleType};

    use super::*;
    use crate::credentials::CredentialHasher;

    fn backend() -> Option<MemoryBackend> {
        CredentialHasher::fast().ok().map(|h| MemoryBackend::new(AccountPolicy::new(h)))
    }

    #[tokio::test]
    async fn rebuild_recovers_corrupted_indexes() {
        let Some(store) = backend() else {
            return;
        };
        let Ok(user) = store.create_user(NewUser::new("alice", "alice@example.com"), "pw123").await else {
            return;
        };
        store.users.write().by_username.clear();
        assert!(store.get_user_by_username("alice").await.is_err());

        let rebuilt = store.rebuild_indexes().await.unwrap_or(0);
        assert!(rebuilt >= 2);
        assert_eq!(store.get_user_by_username("ALICE").await.map(|u| u.id).ok(), Some(user.id));
    }

    #[tokio::test]
    async fn snapshot_restores_state_and_indexes() {
        let Some(store) = backend() else {
            return;
        };
        let Ok(user) = store.create_user(NewUser::new("alice", "alice@example.com"), "pw123").await else {
            return;
        };
        let link = UserCharacterLink::new(user.id.clone(), PlayerId::from("char-1"), "Aria", true);
        assert!(store.create_user_character_link(link).await.is_ok());
        let target = ActionTarget::start(PlayerId::from("char-1"), ActionType::Gathering, "resource_node", "oak", 1_000);
        assert!(store.save_action_target(target.clone()).await.is_ok());

        let Some(policy) = CredentialHasher::fast().ok().map(AccountPolicy::new) else {
            return;
        };
        let restored = MemoryBackend::from_snapshot(policy, store.export_snapshot());
        assert_eq!(
            restored.get_character_owner(&PlayerId::from("char-1")).await.ok(),
            Some(user.id.clone())
        );
        let current = restored.get_current_action_target(&PlayerId::from("char-1")).await.ok().flatten();
        assert_eq!(current.map(|t| t.id), Some(target.id));
        assert!(restored.validate_password(&user.id, "pw123").await.unwrap_or(false));
    }

    #[tokio::test]
    async fn snapshot_file_roundtrip() {
        let Some(store) = backend() else {
            return;
        };
        let Ok(dir) = tempfile::tempdir() else {
            return;
        };
        let record = BattleRecord::begin(BattleId::from("b-1"), BattleType::Solo, vec![PlayerId::from("char-1")]);
        assert!(store.save_battle_record(record).await.is_ok());
        let path = dir.path().join("state.json");
        assert!(store.save_snapshot(&path).await.is_ok());

        let Some(policy) = CredentialHasher::fast().ok().map(AccountPolicy::new) else {
            return;
        };
        let Ok(reopened) = MemoryBackend::open(policy, &path).await else {
            return;
        };
        assert_eq!(reopened.get_active_battles().await.map(|b| b.len()).ok(), Some(1));
    }

    #[tokio::test]
    async fn missing_snapshot_file_starts_empty() {
        let Some(policy) = CredentialHasher::fast().ok().map(AccountPolicy::new) else {
            return;
        };
        let Ok(dir) = tempfile::tempdir() else {
            return;
        };
        let Ok(store) = MemoryBackend::open(policy, &dir.path().join("absent.json")).await else {
            return;
        };
        assert_eq!(store.get_storage_stats().await.map(|s| s.total_users).ok(), Some(0));
    }
}
