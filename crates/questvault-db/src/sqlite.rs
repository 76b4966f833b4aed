//! `SQLite` storage backend.
//!
//! Uses [`sqlx`] with runtime query construction (not compile-time
//! checked) so the crate builds without a live database. All queries are
//! parameterized. Schema lives in `migrations/` and is applied on
//! connect.
//!
//! Writes run inside one transaction each and are serialized through an
//! in-process lock (`SQLite` admits a single writer anyway). Secondary
//! indexes are ordinary tables (`team_members`, `battle_participants`)
//! or partial unique indexes, so they commit or roll back with the
//! primary row. Every operation runs under the configured deadline;
//! an expired deadline drops the transaction, which rolls it back.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use questvault_types::{
    ActionEndReason, ActionTarget, ActionTargetId, ActionType, BatchResult, BattleId, BattleQuery,
    BattleRecord, BattleStatus, BattleType, NewUser, OfflineData, OfflineDataId, Player, PlayerId,
    StorageStats, Team, TeamId, TeamStatus, User, UserCharacterLink, UserId, normalize_key,
};
use sqlx::sqlite::{SqliteConnectOptions, SqliteConnection, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use sqlx::{Connection, FromRow};
use tokio::sync::Mutex;

use crate::backend::{
    BattleFilter, MaintenanceOps, StorageBackend, check_player_write, close_battle, next_offline_version,
    read_with_retry, validated, with_deadline,
};
use crate::backup::artifact_path;
use crate::columns::{
    decode_optional, decode_or_default, encode, from_millis, from_millis_opt, parse_text, to_i64, to_millis,
    to_millis_opt, to_u32, to_u64,
};
use crate::credentials::AccountPolicy;
use crate::error::{StoreError, StoreResult};

/// Default maximum number of connections in the pool.
const DEFAULT_MAX_CONNECTIONS: u32 = 8;

/// Default connection acquire timeout in seconds.
const DEFAULT_ACQUIRE_TIMEOUT_SECS: u64 = 5;

/// Default per-operation deadline in milliseconds.
const DEFAULT_OPERATION_TIMEOUT_MS: u64 = 2_000;
const DEFAULT_MAINTENANCE_TIMEOUT_SECS: u64 = 300;

/// File extension of `SQLite` backup artifacts.
pub const BACKUP_EXTENSION: &str = "sqlite";

/// Configuration for the `SQLite` connection pool.
#[derive(Debug, Clone)]
pub struct SqliteConfig {
    /// Connection URL, e.g. `sqlite://data/questvault.db` or `sqlite::memory:`.
    pub url: String,
    /// Maximum number of connections in the pool.
    pub max_connections: u32,
    /// Connection acquire timeout.
    pub acquire_timeout: Duration,
    /// Deadline applied to every contract operation.
    pub operation_timeout: Duration,
    /// Deadline for one maintenance statement (`VACUUM`, `REINDEX`, backup).
    pub maintenance_timeout: Duration,
}

impl SqliteConfig {
    /// Create a new configuration from a database URL.
    pub fn new(url: &str) -> Self {
        Self {
            url: url.to_owned(),
            max_connections: DEFAULT_MAX_CONNECTIONS,
            acquire_timeout: Duration::from_secs(DEFAULT_ACQUIRE_TIMEOUT_SECS),
            operation_timeout: Duration::from_millis(DEFAULT_OPERATION_TIMEOUT_MS),
            maintenance_timeout: Duration::from_secs(DEFAULT_MAINTENANCE_TIMEOUT_SECS),
        }
    }

    /// Set the maximum number of connections.
    #[must_use]
    pub const fn with_max_connections(mut self, max: u32) -> Self {
        self.max_connections = max;
        self
    }

    /// Set the connection acquire timeout.
    #[must_use]
    pub const fn with_acquire_timeout(mut self, timeout: Duration) -> Self {
        self.acquire_timeout = timeout;
        self
    }

    /// Set the per-operation deadline.
    #[must_use]
    pub const fn with_operation_timeout(mut self, timeout: Duration) -> Self {
        self.operation_timeout = timeout;
        self
    }

    /// Set the deadline for maintenance statements.
    #[must_use]
    pub const fn with_maintenance_timeout(mut self, timeout: Duration) -> Self {
        self.maintenance_timeout = timeout;
        self
    }

    fn is_memory(&self) -> bool {
        self.url.contains(":memory:") || self.url.contains("mode=memory")
    }
}

// =========================================================================
// Rows
// =========================================================================

const USER_COLUMNS: &str = "id, username, email, password_hash, salt, roles, is_active, is_locked, \
     locked_until, failed_login_attempts, last_login_at, login_history, profile, created_at, updated_at";

#[derive(Debug, FromRow)]
struct UserRow {
    id: String,
    username: String,
    email: String,
    password_hash: String,
    salt: String,
    roles: String,
    is_active: bool,
    is_locked: bool,
    locked_until: Option<i64>,
    failed_login_attempts: i64,
    last_login_at: Option<i64>,
    login_history: String,
    profile: String,
    created_at: i64,
    updated_at: i64,
}

impl UserRow {
    fn into_user(self, character_ids: Vec<PlayerId>) -> User {
        let key = self.id.clone();
        User {
            roles: decode_or_default(Some(&self.roles), "user", &key, "roles"),
            login_history: decode_or_default(Some(&self.login_history), "user", &key, "login_history"),
            profile: decode_or_default(Some(&self.profile), "user", &key, "profile"),
            id: UserId(self.id),
            username: self.username,
            email: self.email,
            password_hash: self.password_hash,
            salt: self.salt,
            is_active: self.is_active,
            is_locked: self.is_locked,
            locked_until: from_millis_opt(self.locked_until),
            failed_login_attempts: to_u32(self.failed_login_attempts),
            last_login_at: from_millis_opt(self.last_login_at),
            character_ids,
            created_at: from_millis(self.created_at),
            updated_at: from_millis(self.updated_at),
        }
    }
}

const LINK_COLUMNS: &str =
    "user_id, character_id, is_default, is_active, slot_index, character_name, profession, level, created_at";

#[derive(Debug, FromRow)]
struct LinkRow {
    user_id: String,
    character_id: String,
    is_default: bool,
    is_active: bool,
    slot_index: i64,
    character_name: String,
    profession: String,
    level: i64,
    created_at: i64,
}

impl From<LinkRow> for UserCharacterLink {
    fn from(row: LinkRow) -> Self {
        Self {
            user_id: UserId(row.user_id),
            character_id: PlayerId(row.character_id),
            is_default: row.is_default,
            is_active: row.is_active,
            slot_index: to_u32(row.slot_index),
            character_name: row.character_name,
            profession: row.profession,
            level: to_u32(row.level),
            created_at: from_millis(row.created_at),
        }
    }
}

const PLAYER_COLUMNS: &str = "id, user_id, name, profession, level, experience, health, max_health, mana, \
     max_mana, gold, attributes, professions, reputation, inventory, equipment, consumables, skills, quests, \
     activity_slots, last_offline_session, is_online, last_online_at, is_dead, died_at, created_at, updated_at";

#[derive(Debug, FromRow)]
struct PlayerRow {
    id: String,
    user_id: Option<String>,
    name: String,
    profession: String,
    level: i64,
    experience: i64,
    health: i64,
    max_health: i64,
    mana: i64,
    max_mana: i64,
    gold: i64,
    attributes: Option<String>,
    professions: Option<String>,
    reputation: Option<String>,
    inventory: Option<String>,
    equipment: Option<String>,
    consumables: Option<String>,
    skills: Option<String>,
    quests: Option<String>,
    activity_slots: Option<String>,
    last_offline_session: Option<String>,
    is_online: bool,
    last_online_at: Option<i64>,
    is_dead: bool,
    died_at: Option<i64>,
    created_at: i64,
    updated_at: i64,
}

impl From<PlayerRow> for Player {
    fn from(row: PlayerRow) -> Self {
        let key = row.id.clone();
        let k = key.as_str();
        Self {
            attributes: decode_or_default(row.attributes.as_deref(), "player", k, "attributes"),
            professions: decode_or_default(row.professions.as_deref(), "player", k, "professions"),
            reputation: decode_or_default(row.reputation.as_deref(), "player", k, "reputation"),
            inventory: decode_or_default(row.inventory.as_deref(), "player", k, "inventory"),
            equipment: decode_or_default(row.equipment.as_deref(), "player", k, "equipment"),
            consumables: decode_or_default(row.consumables.as_deref(), "player", k, "consumables"),
            skills: decode_or_default(row.skills.as_deref(), "player", k, "skills"),
            quests: decode_or_default(row.quests.as_deref(), "player", k, "quests"),
            activity_slots: decode_or_default(row.activity_slots.as_deref(), "player", k, "activity_slots"),
            last_offline_session: decode_optional(
                row.last_offline_session.as_deref(),
                "player",
                k,
                "last_offline_session",
            ),
            id: PlayerId(row.id),
            user_id: row.user_id.map(UserId),
            name: row.name,
            profession: row.profession,
            level: to_u32(row.level),
            experience: to_u64(row.experience),
            health: row.health,
            max_health: row.max_health,
            mana: row.mana,
            max_mana: row.max_mana,
            gold: to_u64(row.gold),
            is_online: row.is_online,
            last_online_at: from_millis_opt(row.last_online_at),
            is_dead: row.is_dead,
            died_at: from_millis_opt(row.died_at),
            created_at: from_millis(row.created_at),
            updated_at: from_millis(row.updated_at),
        }
    }
}

const TEAM_COLUMNS: &str = "id, name, captain_id, member_ids, status, current_battle_id, created_at, updated_at";

#[derive(Debug, FromRow)]
struct TeamRow {
    id: String,
    name: String,
    captain_id: String,
    member_ids: String,
    status: String,
    current_battle_id: Option<String>,
    created_at: i64,
    updated_at: i64,
}

impl From<TeamRow> for Team {
    fn from(row: TeamRow) -> Self {
        let key = row.id.clone();
        Self {
            member_ids: decode_or_default(Some(&row.member_ids), "team", &key, "member_ids"),
            status: parse_text(&row.status, TeamStatus::parse, TeamStatus::Active, "team", &key, "status"),
            id: TeamId(row.id),
            name: row.name,
            captain_id: PlayerId(row.captain_id),
            current_battle_id: row.current_battle_id.map(BattleId),
            created_at: from_millis(row.created_at),
            updated_at: from_millis(row.updated_at),
        }
    }
}

const ACTION_COLUMNS: &str = "id, player_id, target_type, target_id, target_name, action_type, progress, \
     duration_ms, started_at, completed_at, is_completed, end_reason, progress_data";

#[derive(Debug, FromRow)]
struct ActionRow {
    id: String,
    player_id: String,
    target_type: String,
    target_id: String,
    target_name: String,
    action_type: String,
    progress: f64,
    duration_ms: i64,
    started_at: i64,
    completed_at: Option<i64>,
    is_completed: bool,
    end_reason: Option<String>,
    progress_data: String,
}

impl From<ActionRow> for ActionTarget {
    fn from(row: ActionRow) -> Self {
        let key = row.id.clone();
        Self {
            action_type: parse_text(
                &row.action_type,
                ActionType::parse,
                ActionType::Gathering,
                "action target",
                &key,
                "action_type",
            ),
            end_reason: row.end_reason.as_deref().and_then(ActionEndReason::parse),
            progress_data: decode_or_default(Some(&row.progress_data), "action target", &key, "progress_data"),
            id: ActionTargetId(row.id),
            player_id: PlayerId(row.player_id),
            target_type: row.target_type,
            target_id: row.target_id,
            target_name: row.target_name,
            progress: row.progress,
            duration_ms: to_u64(row.duration_ms),
            started_at: from_millis(row.started_at),
            completed_at: from_millis_opt(row.completed_at),
            is_completed: row.is_completed,
        }
    }
}

const BATTLE_COLUMNS: &str = "b.id, b.battle_type, b.participant_ids, b.status, b.started_at, b.ended_at, \
     b.duration_ms, b.team_id, b.dungeon_id, b.enemies, b.actions, b.results";

#[derive(Debug, FromRow)]
struct BattleRow {
    id: String,
    battle_type: String,
    participant_ids: String,
    status: String,
    started_at: i64,
    ended_at: Option<i64>,
    duration_ms: Option<i64>,
    team_id: Option<String>,
    dungeon_id: Option<String>,
    enemies: String,
    actions: String,
    results: String,
}

impl From<BattleRow> for BattleRecord {
    fn from(row: BattleRow) -> Self {
        let key = row.id.clone();
        let k = key.as_str();
        Self {
            battle_type: parse_text(&row.battle_type, BattleType::parse, BattleType::Solo, "battle record", k, "battle_type"),
            participant_ids: decode_or_default(Some(&row.participant_ids), "battle record", k, "participant_ids"),
            status: parse_text(&row.status, BattleStatus::parse, BattleStatus::Aborted, "battle record", k, "status"),
            enemies: decode_or_default(Some(&row.enemies), "battle record", k, "enemies"),
            actions: decode_or_default(Some(&row.actions), "battle record", k, "actions"),
            results: decode_or_default(Some(&row.results), "battle record", k, "results"),
            id: BattleId(row.id),
            started_at: from_millis(row.started_at),
            ended_at: from_millis_opt(row.ended_at),
            duration_ms: row.duration_ms.map(to_u64),
            team_id: row.team_id.map(TeamId),
            dungeon_id: row.dungeon_id,
        }
    }
}

const OFFLINE_COLUMNS: &str = "id, player_id, data_type, payload, is_synced, synced_at, version, created_at, updated_at";

#[derive(Debug, FromRow)]
struct OfflineRow {
    id: String,
    player_id: String,
    data_type: String,
    payload: String,
    is_synced: bool,
    synced_at: Option<i64>,
    version: i64,
    created_at: i64,
    updated_at: i64,
}

impl From<OfflineRow> for OfflineData {
    fn from(row: OfflineRow) -> Self {
        let key = row.id.clone();
        Self {
            payload: decode_or_default(Some(&row.payload), "offline data", &key, "payload"),
            id: OfflineDataId(row.id),
            player_id: PlayerId(row.player_id),
            data_type: row.data_type,
            is_synced: row.is_synced,
            synced_at: from_millis_opt(row.synced_at),
            version: to_u64(row.version),
            created_at: from_millis(row.created_at),
            updated_at: from_millis(row.updated_at),
        }
    }
}

#[derive(Debug, FromRow)]
struct StatsRow {
    total_users: i64,
    active_users: i64,
    locked_users: i64,
    total_players: i64,
    online_players: i64,
    total_teams: i64,
    active_teams: i64,
    in_progress_action_targets: i64,
    total_action_targets: i64,
    in_progress_battles: i64,
    completed_battles: i64,
    aborted_battles: i64,
    total_offline_data: i64,
    unsynced_offline_data: i64,
}

// =========================================================================
// Connection-level statements
// =========================================================================

/// Which unique key a user lookup goes through.
#[derive(Debug, Clone, Copy)]
enum UserLookup {
    Id,
    Username,
    Email,
}

impl UserLookup {
    const fn clause(self) -> &'static str {
        match self {
            Self::Id => "id = ?",
            Self::Username => "username_lower = ? AND is_active = 1",
            Self::Email => "email_lower = ? AND is_active = 1",
        }
    }
}

async fn character_ids(conn: &mut SqliteConnection, user_id: &str) -> StoreResult<Vec<PlayerId>> {
    let ids: Vec<String> = sqlx::query_scalar(
        "SELECT character_id FROM user_character_links \
         WHERE user_id = ? AND is_active = 1 ORDER BY slot_index, character_id",
    )
    .bind(user_id)
    .fetch_all(&mut *conn)
    .await?;
    Ok(ids.into_iter().map(PlayerId).collect())
}

async fn find_user(conn: &mut SqliteConnection, lookup: UserLookup, value: &str) -> StoreResult<Option<User>> {
    let sql = format!("SELECT {USER_COLUMNS} FROM users WHERE {} LIMIT 1", lookup.clause());
    let row: Option<UserRow> = sqlx::query_as(&sql).bind(value).fetch_optional(&mut *conn).await?;
    match row {
        Some(row) => {
            let ids = character_ids(conn, &row.id).await?;
            Ok(Some(row.into_user(ids)))
        }
        None => Ok(None),
    }
}

/// Conflict if another active user holds `user`'s username or email.
async fn check_user_unique(conn: &mut SqliteConnection, user: &User) -> StoreResult<()> {
    if !user.is_active {
        return Ok(());
    }
    let taken: Option<String> = sqlx::query_scalar(
        "SELECT id FROM users WHERE username_lower = ? AND is_active = 1 AND id <> ? LIMIT 1",
    )
    .bind(user.username_key())
    .bind(user.id.as_str())
    .fetch_optional(&mut *conn)
    .await?;
    if taken.is_some() {
        return Err(StoreError::Conflict(format!("username '{}' is already taken", user.username)));
    }
    let taken: Option<String> =
        sqlx::query_scalar("SELECT id FROM users WHERE email_lower = ? AND is_active = 1 AND id <> ? LIMIT 1")
            .bind(user.email_key())
            .bind(user.id.as_str())
            .fetch_optional(&mut *conn)
            .await?;
    if taken.is_some() {
        return Err(StoreError::Conflict(format!("email '{}' is already registered", user.email)));
    }
    Ok(())
}

async fn upsert_user(conn: &mut SqliteConnection, user: &User) -> StoreResult<()> {
    sqlx::query(
        "INSERT INTO users (id, username, username_lower, email, email_lower, password_hash, salt, roles, \
             is_active, is_locked, locked_until, failed_login_attempts, last_login_at, login_history, profile, \
             created_at, updated_at) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?) \
         ON CONFLICT(id) DO UPDATE SET \
             username = excluded.username, username_lower = excluded.username_lower, \
             email = excluded.email, email_lower = excluded.email_lower, \
             password_hash = excluded.password_hash, salt = excluded.salt, roles = excluded.roles, \
             is_active = excluded.is_active, is_locked = excluded.is_locked, \
             locked_until = excluded.locked_until, failed_login_attempts = excluded.failed_login_attempts, \
             last_login_at = excluded.last_login_at, login_history = excluded.login_history, \
             profile = excluded.profile, updated_at = excluded.updated_at",
    )
    .bind(user.id.as_str())
    .bind(&user.username)
    .bind(user.username_key())
    .bind(&user.email)
    .bind(user.email_key())
    .bind(&user.password_hash)
    .bind(&user.salt)
    .bind(encode(&user.roles)?)
    .bind(user.is_active)
    .bind(user.is_locked)
    .bind(to_millis_opt(user.locked_until))
    .bind(i64::from(user.failed_login_attempts))
    .bind(to_millis_opt(user.last_login_at))
    .bind(encode(&user.login_history)?)
    .bind(encode(&user.profile)?)
    .bind(to_millis(user.created_at))
    .bind(to_millis(user.updated_at))
    .execute(&mut *conn)
    .await?;
    Ok(())
}

async fn find_player(conn: &mut SqliteConnection, id: &str) -> StoreResult<Option<Player>> {
    let sql = format!("SELECT {PLAYER_COLUMNS} FROM players WHERE id = ?");
    let row: Option<PlayerRow> = sqlx::query_as(&sql).bind(id).fetch_optional(&mut *conn).await?;
    Ok(row.map(Player::from))
}

async fn upsert_player(conn: &mut SqliteConnection, player: &Player) -> StoreResult<()> {
    let last_offline_session = player.last_offline_session.as_ref().map(encode).transpose()?;
    sqlx::query(
        "INSERT INTO players (id, user_id, name, name_lower, profession, level, experience, health, max_health, \
             mana, max_mana, gold, attributes, professions, reputation, inventory, equipment, consumables, \
             skills, quests, activity_slots, last_offline_session, is_online, last_online_at, is_dead, died_at, \
             created_at, updated_at) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?) \
         ON CONFLICT(id) DO UPDATE SET \
             user_id = excluded.user_id, name = excluded.name, name_lower = excluded.name_lower, \
             profession = excluded.profession, level = excluded.level, experience = excluded.experience, \
             health = excluded.health, max_health = excluded.max_health, mana = excluded.mana, \
             max_mana = excluded.max_mana, gold = excluded.gold, attributes = excluded.attributes, \
             professions = excluded.professions, reputation = excluded.reputation, \
             inventory = excluded.inventory, equipment = excluded.equipment, \
             consumables = excluded.consumables, skills = excluded.skills, quests = excluded.quests, \
             activity_slots = excluded.activity_slots, last_offline_session = excluded.last_offline_session, \
             is_online = excluded.is_online, last_online_at = excluded.last_online_at, \
             is_dead = excluded.is_dead, died_at = excluded.died_at, updated_at = excluded.updated_at",
    )
    .bind(player.id.as_str())
    .bind(player.user_id.as_ref().map(UserId::as_str))
    .bind(&player.name)
    .bind(player.name.to_lowercase())
    .bind(&player.profession)
    .bind(i64::from(player.level))
    .bind(to_i64(player.experience))
    .bind(player.health)
    .bind(player.max_health)
    .bind(player.mana)
    .bind(player.max_mana)
    .bind(to_i64(player.gold))
    .bind(encode(&player.attributes)?)
    .bind(encode(&player.professions)?)
    .bind(encode(&player.reputation)?)
    .bind(encode(&player.inventory)?)
    .bind(encode(&player.equipment)?)
    .bind(encode(&player.consumables)?)
    .bind(encode(&player.skills)?)
    .bind(encode(&player.quests)?)
    .bind(encode(&player.activity_slots)?)
    .bind(last_offline_session)
    .bind(player.is_online)
    .bind(to_millis_opt(player.last_online_at))
    .bind(player.is_dead)
    .bind(to_millis_opt(player.died_at))
    .bind(to_millis(player.created_at))
    .bind(to_millis(player.updated_at))
    .execute(&mut *conn)
    .await?;
    Ok(())
}

/// Validate and store one player, preserving its creation time.
async fn write_player(conn: &mut SqliteConnection, mut player: Player) -> StoreResult<Player> {
    let previous = find_player(conn, player.id.as_str()).await?;
    check_player_write(previous.as_ref(), &player)?;
    if let Some(prev) = &previous {
        player.created_at = prev.created_at;
    }
    player.updated_at = Utc::now();
    upsert_player(conn, &player).await?;
    Ok(player)
}

async fn find_team(conn: &mut SqliteConnection, id: &str) -> StoreResult<Option<Team>> {
    let sql = format!("SELECT {TEAM_COLUMNS} FROM teams WHERE id = ?");
    let row: Option<TeamRow> = sqlx::query_as(&sql).bind(id).fetch_optional(&mut *conn).await?;
    Ok(row.map(Team::from))
}

async fn find_action(conn: &mut SqliteConnection, id: &str) -> StoreResult<Option<ActionTarget>> {
    let sql = format!("SELECT {ACTION_COLUMNS} FROM action_targets WHERE id = ?");
    let row: Option<ActionRow> = sqlx::query_as(&sql).bind(id).fetch_optional(&mut *conn).await?;
    Ok(row.map(ActionTarget::from))
}

async fn current_action(conn: &mut SqliteConnection, player_id: &str) -> StoreResult<Option<ActionTarget>> {
    let sql = format!("SELECT {ACTION_COLUMNS} FROM action_targets WHERE player_id = ? AND is_completed = 0 LIMIT 1");
    let row: Option<ActionRow> = sqlx::query_as(&sql).bind(player_id).fetch_optional(&mut *conn).await?;
    Ok(row.map(ActionTarget::from))
}

async fn upsert_action(conn: &mut SqliteConnection, target: &ActionTarget) -> StoreResult<()> {
    sqlx::query(
        "INSERT INTO action_targets (id, player_id, target_type, target_id, target_name, action_type, progress, \
             duration_ms, started_at, completed_at, is_completed, end_reason, progress_data) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?) \
         ON CONFLICT(id) DO UPDATE SET \
             target_type = excluded.target_type, target_id = excluded.target_id, \
             target_name = excluded.target_name, action_type = excluded.action_type, \
             progress = excluded.progress, duration_ms = excluded.duration_ms, \
             started_at = excluded.started_at, completed_at = excluded.completed_at, \
             is_completed = excluded.is_completed, end_reason = excluded.end_reason, \
             progress_data = excluded.progress_data",
    )
    .bind(target.id.as_str())
    .bind(target.player_id.as_str())
    .bind(&target.target_type)
    .bind(&target.target_id)
    .bind(&target.target_name)
    .bind(target.action_type.as_str())
    .bind(target.progress)
    .bind(to_i64(target.duration_ms))
    .bind(to_millis(target.started_at))
    .bind(to_millis_opt(target.completed_at))
    .bind(target.is_completed)
    .bind(target.end_reason.map(ActionEndReason::as_str))
    .bind(encode(&target.progress_data)?)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

async fn find_battle(conn: &mut SqliteConnection, id: &str) -> StoreResult<Option<BattleRecord>> {
    let sql = format!("SELECT {BATTLE_COLUMNS} FROM battle_records b WHERE b.id = ?");
    let row: Option<BattleRow> = sqlx::query_as(&sql).bind(id).fetch_optional(&mut *conn).await?;
    Ok(row.map(BattleRecord::from))
}

async fn upsert_battle(conn: &mut SqliteConnection, record: &BattleRecord) -> StoreResult<()> {
    sqlx::query(
        "INSERT INTO battle_records (id, battle_type, participant_ids, status, started_at, ended_at, duration_ms, \
             team_id, dungeon_id, enemies, actions, results) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?) \
         ON CONFLICT(id) DO UPDATE SET \
             battle_type = excluded.battle_type, participant_ids = excluded.participant_ids, \
             status = excluded.status, started_at = excluded.started_at, ended_at = excluded.ended_at, \
             duration_ms = excluded.duration_ms, team_id = excluded.team_id, \
             dungeon_id = excluded.dungeon_id, enemies = excluded.enemies, actions = excluded.actions, \
             results = excluded.results",
    )
    .bind(record.id.as_str())
    .bind(record.battle_type.as_str())
    .bind(encode(&record.participant_ids)?)
    .bind(record.status.as_str())
    .bind(to_millis(record.started_at))
    .bind(to_millis_opt(record.ended_at))
    .bind(record.duration_ms.map(to_i64))
    .bind(record.team_id.as_ref().map(TeamId::as_str))
    .bind(record.dungeon_id.as_deref())
    .bind(encode(&record.enemies)?)
    .bind(encode(&record.actions)?)
    .bind(encode(&record.results)?)
    .execute(&mut *conn)
    .await?;

    sqlx::query("DELETE FROM battle_participants WHERE battle_id = ?")
        .bind(record.id.as_str())
        .execute(&mut *conn)
        .await?;
    for player in &record.participant_ids {
        sqlx::query("INSERT OR IGNORE INTO battle_participants (battle_id, player_id) VALUES (?, ?)")
            .bind(record.id.as_str())
            .bind(player.as_str())
            .execute(&mut *conn)
            .await?;
    }
    Ok(())
}

async fn find_offline(conn: &mut SqliteConnection, id: &str) -> StoreResult<Option<OfflineData>> {
    let sql = format!("SELECT {OFFLINE_COLUMNS} FROM offline_data WHERE id = ?");
    let row: Option<OfflineRow> = sqlx::query_as(&sql).bind(id).fetch_optional(&mut *conn).await?;
    Ok(row.map(OfflineData::from))
}

async fn upsert_offline(conn: &mut SqliteConnection, data: &OfflineData) -> StoreResult<()> {
    sqlx::query(
        "INSERT INTO offline_data (id, player_id, data_type, payload, is_synced, synced_at, version, created_at, \
             updated_at) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?) \
         ON CONFLICT(id) DO UPDATE SET \
             player_id = excluded.player_id, data_type = excluded.data_type, payload = excluded.payload, \
             is_synced = excluded.is_synced, synced_at = excluded.synced_at, version = excluded.version, \
             updated_at = excluded.updated_at",
    )
    .bind(data.id.as_str())
    .bind(data.player_id.as_str())
    .bind(&data.data_type)
    .bind(encode(&data.payload)?)
    .bind(data.is_synced)
    .bind(to_millis_opt(data.synced_at))
    .bind(to_i64(data.version))
    .bind(to_millis(data.created_at))
    .bind(to_millis(data.updated_at))
    .execute(&mut *conn)
    .await?;
    Ok(())
}

// =========================================================================
// Backend
// =========================================================================

/// Backend over a `SQLite` database file or in-memory database.
pub struct SqliteBackend {
    pool: SqlitePool,
    policy: AccountPolicy,
    timeout: Duration,
    maintenance_timeout: Duration,
    writer: Mutex<()>,
}

impl SqliteBackend {
    /// Connect, configure the pool and apply migrations.
    ///
    /// In-memory URLs get a single pinned connection so the database
    /// lives as long as the pool.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Config`] for an unparsable URL,
    /// [`StoreError::BackendUnavailable`] if connecting or migrating fails,
    /// [`StoreError::Io`] if the database directory cannot be created.
    pub async fn connect(config: &SqliteConfig, policy: AccountPolicy) -> StoreResult<Self> {
        let mut options = SqliteConnectOptions::from_str(&config.url)
            .map_err(|e| StoreError::Config(format!("invalid database URL: {e}")))?
            .create_if_missing(true);

        let pool_options = if config.is_memory() {
            SqlitePoolOptions::new()
                .max_connections(1)
                .min_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
        } else {
            if let Some(parent) = options.get_filename().parent().filter(|p| !p.as_os_str().is_empty()) {
                tokio::fs::create_dir_all(parent).await?;
            }
            options = options.journal_mode(SqliteJournalMode::Wal);
            SqlitePoolOptions::new().max_connections(config.max_connections.max(1))
        };

        let pool = pool_options
            .acquire_timeout(config.acquire_timeout)
            .connect_with(options)
            .await?;

        sqlx::migrate!("./migrations").run(&pool).await?;
        tracing::info!(
            url = %config.url,
            max_connections = config.max_connections,
            "Connected to SQLite and applied migrations"
        );

        Ok(Self {
            pool,
            policy,
            timeout: config.operation_timeout,
            maintenance_timeout: config.maintenance_timeout,
            writer: Mutex::new(()),
        })
    }

    /// Return a reference to the underlying [`SqlitePool`].
    pub const fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Close all connections in the pool gracefully.
    pub async fn close(&self) {
        self.pool.close().await;
        tracing::info!("SQLite pool closed");
    }

    /// Run a read under the deadline, retrying once on transient failure.
    async fn read<T, F, Fut>(&self, operation: &'static str, read: F) -> StoreResult<T>
    where
        F: Fn() -> Fut + Send + Sync,
        Fut: Future<Output = StoreResult<T>> + Send,
        T: Send,
    {
        let timeout = self.timeout;
        read_with_retry(operation, || with_deadline(timeout, read())).await
    }

    /// Run a write under the deadline and the writer lock. Never retried.
    async fn write<T, Fut>(&self, write: Fut) -> StoreResult<T>
    where
        Fut: Future<Output = StoreResult<T>> + Send,
        T: Send,
    {
        with_deadline(self.timeout, async {
            let _guard = self.writer.lock().await;
            write.await
        })
        .await
    }

    /// Run a maintenance statement under the writer lock, so it never
    /// races a write transaction, bounded by the maintenance deadline.
    async fn maintain<T, Fut>(&self, operation: &'static str, work: Fut) -> StoreResult<T>
    where
        Fut: Future<Output = StoreResult<T>> + Send,
        T: Send,
    {
        let result = with_deadline(self.maintenance_timeout, async {
            let _guard = self.writer.lock().await;
            work.await
        })
        .await;
        if let Err(e) = &result {
            tracing::warn!(operation, error = %e, "SQLite maintenance statement failed");
        }
        result
    }

    async fn load_user(&self, lookup: UserLookup, value: &str) -> StoreResult<Option<User>> {
        let mut conn = self.pool.acquire().await?;
        find_user(&mut conn, lookup, value).await
    }
}

#[async_trait]
impl MaintenanceOps for SqliteBackend {
    fn kind(&self) -> &'static str {
        "sqlite"
    }

    async fn optimize(&self) -> StoreResult<()> {
        self.maintain("optimize", async {
            sqlx::query("PRAGMA optimize").execute(&self.pool).await?;
            sqlx::query("ANALYZE").execute(&self.pool).await?;
            Ok(())
        })
        .await
    }

    async fn rebuild_indexes(&self) -> StoreResult<u64> {
        self.maintain("rebuild_indexes", async {
            sqlx::query("REINDEX").execute(&self.pool).await?;
            let indexes: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM sqlite_master WHERE type = 'index'")
                .fetch_one(&self.pool)
                .await?;
            Ok(to_u64(indexes))
        })
        .await
    }

    async fn compact(&self) -> StoreResult<()> {
        self.maintain("compact", async {
            sqlx::query("VACUUM").execute(&self.pool).await?;
            Ok(())
        })
        .await
    }

    async fn create_backup(&self, dir: &Path) -> StoreResult<PathBuf> {
        tokio::fs::create_dir_all(dir).await?;
        let path = artifact_path(dir, BACKUP_EXTENSION, Utc::now());
        let target = path
            .to_str()
            .ok_or_else(|| StoreError::Config(format!("backup path is not valid UTF-8: {}", path.display())))?
            .to_owned();
        self.maintain("create_backup", async {
            sqlx::query("VACUUM INTO ?").bind(target).execute(&self.pool).await?;
            Ok(())
        })
        .await?;
        Ok(path)
    }

    async fn cleanup_synced_offline_data(&self, older_than: DateTime<Utc>) -> StoreResult<u64> {
        self.write(async {
            let result =
                sqlx::query("DELETE FROM offline_data WHERE is_synced = 1 AND COALESCE(synced_at, updated_at) < ?")
                    .bind(to_millis(older_than))
                    .execute(&self.pool)
                    .await?;
            Ok(result.rows_affected())
        })
        .await
    }

    async fn cleanup_action_history(&self, older_than: DateTime<Utc>) -> StoreResult<u64> {
        self.write(async {
            let result = sqlx::query(
                "DELETE FROM action_targets WHERE is_completed = 1 AND COALESCE(completed_at, started_at) < ?",
            )
            .bind(to_millis(older_than))
            .execute(&self.pool)
            .await?;
            Ok(result.rows_affected())
        })
        .await
    }

    async fn cleanup_battle_records(&self, older_than: DateTime<Utc>) -> StoreResult<u64> {
        self.write(async {
            let cutoff = to_millis(older_than);
            let mut tx = self.pool.begin().await?;
            sqlx::query(
                "DELETE FROM battle_participants WHERE battle_id IN \
                 (SELECT id FROM battle_records WHERE status <> 'in_progress' AND ended_at IS NOT NULL AND ended_at < ?)",
            )
            .bind(cutoff)
            .execute(&mut *tx)
            .await?;
            let result = sqlx::query(
                "DELETE FROM battle_records WHERE status <> 'in_progress' AND ended_at IS NOT NULL AND ended_at < ?",
            )
            .bind(cutoff)
            .execute(&mut *tx)
            .await?;
            tx.commit().await?;
            Ok(result.rows_affected())
        })
        .await
    }
}

#[async_trait]
impl StorageBackend for SqliteBackend {
    // =========================================================================
    // Users
    // =========================================================================

    async fn get_user(&self, id: &UserId) -> StoreResult<User> {
        self.read("get_user", || self.load_user(UserLookup::Id, id.as_str()))
            .await?
            .ok_or_else(|| StoreError::not_found("user", id))
    }

    async fn get_user_by_username(&self, username: &str) -> StoreResult<User> {
        let key = normalize_key(username);
        self.read("get_user_by_username", || self.load_user(UserLookup::Username, &key))
            .await?
            .ok_or_else(|| StoreError::not_found("user", username))
    }

    async fn get_user_by_email(&self, email: &str) -> StoreResult<User> {
        let key = normalize_key(email);
        self.read("get_user_by_email", || self.load_user(UserLookup::Email, &key))
            .await?
            .ok_or_else(|| StoreError::not_found("user", email))
    }

    async fn create_user(&self, input: NewUser, raw_password: &str) -> StoreResult<User> {
        let user = self.policy.build_user(&input, raw_password)?;
        self.write(async {
            let mut tx = self.pool.begin().await?;
            check_user_unique(&mut tx, &user).await?;
            upsert_user(&mut tx, &user).await?;
            tx.commit().await?;
            Ok(())
        })
        .await?;
        tracing::info!(user_id = %user.id, username = %user.username, "Created user");
        Ok(user)
    }

    async fn update_user(&self, mut user: User) -> StoreResult<User> {
        if user.username.trim().is_empty() || user.email.trim().is_empty() {
            return Err(StoreError::Validation(String::from("username and email must not be blank")));
        }
        self.write(async {
            let mut tx = self.pool.begin().await?;
            let previous = find_user(&mut tx, UserLookup::Id, user.id.as_str())
                .await?
                .ok_or_else(|| StoreError::not_found("user", &user.id))?;
            check_user_unique(&mut tx, &user).await?;
            user.created_at = previous.created_at;
            user.updated_at = Utc::now();
            user.character_ids = previous.character_ids;
            upsert_user(&mut tx, &user).await?;
            tx.commit().await?;
            Ok(user)
        })
        .await
    }

    async fn delete_user(&self, id: &UserId) -> StoreResult<bool> {
        let deleted = self
            .write(async {
                let mut tx = self.pool.begin().await?;
                sqlx::query("DELETE FROM user_character_links WHERE user_id = ?")
                    .bind(id.as_str())
                    .execute(&mut *tx)
                    .await?;
                let result = sqlx::query("DELETE FROM users WHERE id = ?")
                    .bind(id.as_str())
                    .execute(&mut *tx)
                    .await?;
                tx.commit().await?;
                Ok(result.rows_affected() > 0)
            })
            .await?;
        if deleted {
            tracing::info!(user_id = %id, "Deleted user");
        }
        Ok(deleted)
    }

    async fn validate_password(&self, id: &UserId, raw_password: &str) -> StoreResult<bool> {
        let user = self.read("validate_password", || self.load_user(UserLookup::Id, id.as_str())).await?;
        Ok(user.is_some_and(|u| self.policy.accepts(&u, raw_password, Utc::now())))
    }

    async fn lock_user(&self, id: &UserId, until: Option<DateTime<Utc>>) -> StoreResult<bool> {
        self.write(async {
            let result = sqlx::query("UPDATE users SET is_locked = 1, locked_until = ?, updated_at = ? WHERE id = ?")
                .bind(to_millis_opt(until))
                .bind(to_millis(Utc::now()))
                .bind(id.as_str())
                .execute(&self.pool)
                .await?;
            Ok(result.rows_affected() > 0)
        })
        .await
    }

    async fn unlock_user(&self, id: &UserId) -> StoreResult<bool> {
        self.write(async {
            let result = sqlx::query(
                "UPDATE users SET is_locked = 0, locked_until = NULL, failed_login_attempts = 0, updated_at = ? \
                 WHERE id = ?",
            )
            .bind(to_millis(Utc::now()))
            .bind(id.as_str())
            .execute(&self.pool)
            .await?;
            Ok(result.rows_affected() > 0)
        })
        .await
    }

    async fn record_login(&self, id: &UserId, success: bool, source_ip: Option<&str>) -> StoreResult<User> {
        self.write(async {
            let mut tx = self.pool.begin().await?;
            let mut user = find_user(&mut tx, UserLookup::Id, id.as_str())
                .await?
                .ok_or_else(|| StoreError::not_found("user", id))?;
            self.policy.apply_login(&mut user, success, source_ip, Utc::now());
            upsert_user(&mut tx, &user).await?;
            tx.commit().await?;
            Ok(user)
        })
        .await
    }

    // =========================================================================
    // Character links
    // =========================================================================

    async fn create_user_character_link(&self, mut link: UserCharacterLink) -> StoreResult<UserCharacterLink> {
        if link.character_id.is_blank() {
            return Err(StoreError::Validation(String::from("character id must not be empty")));
        }
        link.created_at = Utc::now();
        self.write(async {
            let mut tx = self.pool.begin().await?;
            let exists: Option<i64> = sqlx::query_scalar("SELECT 1 FROM users WHERE id = ?")
                .bind(link.user_id.as_str())
                .fetch_optional(&mut *tx)
                .await?;
            if exists.is_none() {
                return Err(StoreError::not_found("user", &link.user_id));
            }
            if link.is_active {
                let owner: Option<String> = sqlx::query_scalar(
                    "SELECT user_id FROM user_character_links WHERE character_id = ? AND is_active = 1",
                )
                .bind(link.character_id.as_str())
                .fetch_optional(&mut *tx)
                .await?;
                if owner.is_some() {
                    return Err(StoreError::Conflict(format!(
                        "character {} already has an active owner",
                        link.character_id
                    )));
                }
            }
            sqlx::query("DELETE FROM user_character_links WHERE user_id = ? AND character_id = ?")
                .bind(link.user_id.as_str())
                .bind(link.character_id.as_str())
                .execute(&mut *tx)
                .await?;
            if link.is_active && link.is_default {
                sqlx::query("UPDATE user_character_links SET is_default = 0 WHERE user_id = ?")
                    .bind(link.user_id.as_str())
                    .execute(&mut *tx)
                    .await?;
            }
            sqlx::query(
                "INSERT INTO user_character_links (user_id, character_id, is_default, is_active, slot_index, \
                     character_name, profession, level, created_at) \
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(link.user_id.as_str())
            .bind(link.character_id.as_str())
            .bind(link.is_default)
            .bind(link.is_active)
            .bind(i64::from(link.slot_index))
            .bind(&link.character_name)
            .bind(&link.profession)
            .bind(i64::from(link.level))
            .bind(to_millis(link.created_at))
            .execute(&mut *tx)
            .await?;
            tx.commit().await?;
            Ok(())
        })
        .await?;
        tracing::debug!(user_id = %link.user_id, character_id = %link.character_id, "Linked character");
        Ok(link)
    }

    async fn get_user_characters(&self, user_id: &UserId) -> StoreResult<Vec<UserCharacterLink>> {
        let sql = format!(
            "SELECT {LINK_COLUMNS} FROM user_character_links \
             WHERE user_id = ? AND is_active = 1 ORDER BY slot_index, character_id"
        );
        let rows: Vec<LinkRow> = self
            .read("get_user_characters", || async {
                Ok(sqlx::query_as(&sql).bind(user_id.as_str()).fetch_all(&self.pool).await?)
            })
            .await?;
        Ok(rows.into_iter().map(UserCharacterLink::from).collect())
    }

    async fn get_character_owner(&self, character_id: &PlayerId) -> StoreResult<UserId> {
        let owner: Option<String> = self
            .read("get_character_owner", || async {
                Ok(sqlx::query_scalar(
                    "SELECT user_id FROM user_character_links WHERE character_id = ? AND is_active = 1",
                )
                .bind(character_id.as_str())
                .fetch_optional(&self.pool)
                .await?)
            })
            .await?;
        owner
            .map(UserId)
            .ok_or_else(|| StoreError::not_found("character owner", character_id))
    }

    async fn set_default_character(&self, user_id: &UserId, character_id: &PlayerId) -> StoreResult<bool> {
        self.write(async {
            let mut tx = self.pool.begin().await?;
            let linked: Option<i64> = sqlx::query_scalar(
                "SELECT 1 FROM user_character_links WHERE user_id = ? AND character_id = ? AND is_active = 1",
            )
            .bind(user_id.as_str())
            .bind(character_id.as_str())
            .fetch_optional(&mut *tx)
            .await?;
            if linked.is_none() {
                return Ok(false);
            }
            // Clear first: SQLite checks the partial unique index row by row.
            sqlx::query("UPDATE user_character_links SET is_default = 0 WHERE user_id = ?")
                .bind(user_id.as_str())
                .execute(&mut *tx)
                .await?;
            sqlx::query("UPDATE user_character_links SET is_default = 1 WHERE user_id = ? AND character_id = ?")
                .bind(user_id.as_str())
                .bind(character_id.as_str())
                .execute(&mut *tx)
                .await?;
            tx.commit().await?;
            Ok(true)
        })
        .await
    }

    async fn delete_user_character_link(&self, user_id: &UserId, character_id: &PlayerId) -> StoreResult<bool> {
        self.write(async {
            let result = sqlx::query("DELETE FROM user_character_links WHERE user_id = ? AND character_id = ?")
                .bind(user_id.as_str())
                .bind(character_id.as_str())
                .execute(&self.pool)
                .await?;
            Ok(result.rows_affected() > 0)
        })
        .await
    }

    // =========================================================================
    // Players
    // =========================================================================

    async fn get_player(&self, id: &PlayerId) -> StoreResult<Player> {
        self.read("get_player", || async {
            let mut conn = self.pool.acquire().await?;
            find_player(&mut conn, id.as_str()).await
        })
        .await?
        .ok_or_else(|| StoreError::not_found("player", id))
    }

    async fn save_player(&self, player: Player) -> StoreResult<Player> {
        self.write(async {
            let mut tx = self.pool.begin().await?;
            let stored = write_player(&mut tx, player).await?;
            tx.commit().await?;
            Ok(stored)
        })
        .await
    }

    async fn delete_player(&self, id: &PlayerId) -> StoreResult<bool> {
        self.write(async {
            let result = sqlx::query("DELETE FROM players WHERE id = ?")
                .bind(id.as_str())
                .execute(&self.pool)
                .await?;
            Ok(result.rows_affected() > 0)
        })
        .await
    }

    async fn get_online_players(&self) -> StoreResult<Vec<Player>> {
        let sql = format!("SELECT {PLAYER_COLUMNS} FROM players WHERE is_online = 1 ORDER BY id");
        let rows: Vec<PlayerRow> = self
            .read("get_online_players", || async { Ok(sqlx::query_as(&sql).fetch_all(&self.pool).await?) })
            .await?;
        Ok(rows.into_iter().map(Player::from).collect())
    }

    async fn batch_save_players(&self, players: Vec<Player>) -> StoreResult<BatchResult> {
        self.write(async {
            let mut result = BatchResult::default();
            let mut tx = self.pool.begin().await?;
            for player in players {
                let key = player.id.to_string();
                let mut savepoint = Connection::begin(&mut *tx).await?;
                match write_player(&mut savepoint, player).await {
                    Ok(_) => {
                        savepoint.commit().await?;
                        result.record_success();
                    }
                    Err(e) => {
                        savepoint.rollback().await?;
                        result.record_failure(&key, e);
                    }
                }
            }
            tx.commit().await?;
            Ok(result)
        })
        .await
    }

    async fn search_players(&self, term: &str, limit: u32) -> StoreResult<Vec<Player>> {
        let needle = normalize_key(term);
        if needle.is_empty() {
            return Err(StoreError::Validation(String::from("search term must not be empty")));
        }
        let sql = format!(
            "SELECT {PLAYER_COLUMNS} FROM players WHERE instr(name_lower, ?) > 0 ORDER BY name_lower, id LIMIT ?"
        );
        let rows: Vec<PlayerRow> = self
            .read("search_players", || async {
                Ok(sqlx::query_as(&sql)
                    .bind(&needle)
                    .bind(i64::from(limit))
                    .fetch_all(&self.pool)
                    .await?)
            })
            .await?;
        Ok(rows.into_iter().map(Player::from).collect())
    }

    async fn reset_player_progress(&self, id: &PlayerId) -> StoreResult<Player> {
        let player = self
            .write(async {
                let mut tx = self.pool.begin().await?;
                let mut player = find_player(&mut tx, id.as_str())
                    .await?
                    .ok_or_else(|| StoreError::not_found("player", id))?;
                player.reset_progress();
                upsert_player(&mut tx, &player).await?;
                tx.commit().await?;
                Ok(player)
            })
            .await?;
        tracing::info!(player_id = %id, "Reset player progress");
        Ok(player)
    }

    // =========================================================================
    // Teams
    // =========================================================================

    async fn get_team(&self, id: &TeamId) -> StoreResult<Team> {
        self.read("get_team", || async {
            let mut conn = self.pool.acquire().await?;
            find_team(&mut conn, id.as_str()).await
        })
        .await?
        .ok_or_else(|| StoreError::not_found("team", id))
    }

    async fn get_team_by_captain(&self, captain_id: &PlayerId) -> StoreResult<Option<Team>> {
        let sql = format!("SELECT {TEAM_COLUMNS} FROM teams WHERE captain_id = ? AND status <> 'disbanded' LIMIT 1");
        let row: Option<TeamRow> = self
            .read("get_team_by_captain", || async {
                Ok(sqlx::query_as(&sql).bind(captain_id.as_str()).fetch_optional(&self.pool).await?)
            })
            .await?;
        Ok(row.map(Team::from))
    }

    async fn get_team_by_player(&self, player_id: &PlayerId) -> StoreResult<Option<Team>> {
        let sql = format!(
            "SELECT {TEAM_COLUMNS} FROM teams WHERE id = (SELECT team_id FROM team_members WHERE player_id = ?)"
        );
        let row: Option<TeamRow> = self
            .read("get_team_by_player", || async {
                Ok(sqlx::query_as(&sql).bind(player_id.as_str()).fetch_optional(&self.pool).await?)
            })
            .await?;
        Ok(row.map(Team::from))
    }

    async fn save_team(&self, mut team: Team) -> StoreResult<Team> {
        validated(team.check_invariants())?;
        self.write(async {
            let mut tx = self.pool.begin().await?;
            if team.status.is_live() {
                for member in &team.member_ids {
                    let other: Option<String> =
                        sqlx::query_scalar("SELECT team_id FROM team_members WHERE player_id = ? AND team_id <> ?")
                            .bind(member.as_str())
                            .bind(team.id.as_str())
                            .fetch_optional(&mut *tx)
                            .await?;
                    if let Some(other) = other {
                        return Err(StoreError::Conflict(format!(
                            "player {member} already belongs to team {other}"
                        )));
                    }
                }
            }
            if let Some(prev) = find_team(&mut tx, team.id.as_str()).await? {
                team.created_at = prev.created_at;
            }
            team.updated_at = Utc::now();
            sqlx::query(
                "INSERT INTO teams (id, name, captain_id, member_ids, status, current_battle_id, created_at, \
                     updated_at) \
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?) \
                 ON CONFLICT(id) DO UPDATE SET \
                     name = excluded.name, captain_id = excluded.captain_id, member_ids = excluded.member_ids, \
                     status = excluded.status, current_battle_id = excluded.current_battle_id, \
                     updated_at = excluded.updated_at",
            )
            .bind(team.id.as_str())
            .bind(&team.name)
            .bind(team.captain_id.as_str())
            .bind(encode(&team.member_ids)?)
            .bind(team.status.as_str())
            .bind(team.current_battle_id.as_ref().map(BattleId::as_str))
            .bind(to_millis(team.created_at))
            .bind(to_millis(team.updated_at))
            .execute(&mut *tx)
            .await?;

            sqlx::query("DELETE FROM team_members WHERE team_id = ?")
                .bind(team.id.as_str())
                .execute(&mut *tx)
                .await?;
            if team.status.is_live() {
                for member in &team.member_ids {
                    sqlx::query("INSERT INTO team_members (player_id, team_id) VALUES (?, ?)")
                        .bind(member.as_str())
                        .bind(team.id.as_str())
                        .execute(&mut *tx)
                        .await?;
                }
            }
            tx.commit().await?;
            Ok(team)
        })
        .await
    }

    async fn delete_team(&self, id: &TeamId) -> StoreResult<bool> {
        self.write(async {
            let mut tx = self.pool.begin().await?;
            sqlx::query("DELETE FROM team_members WHERE team_id = ?")
                .bind(id.as_str())
                .execute(&mut *tx)
                .await?;
            let result = sqlx::query("DELETE FROM teams WHERE id = ?")
                .bind(id.as_str())
                .execute(&mut *tx)
                .await?;
            tx.commit().await?;
            Ok(result.rows_affected() > 0)
        })
        .await
    }

    async fn get_active_teams(&self) -> StoreResult<Vec<Team>> {
        let sql = format!("SELECT {TEAM_COLUMNS} FROM teams WHERE status <> 'disbanded' ORDER BY id");
        let rows: Vec<TeamRow> = self
            .read("get_active_teams", || async { Ok(sqlx::query_as(&sql).fetch_all(&self.pool).await?) })
            .await?;
        Ok(rows.into_iter().map(Team::from).collect())
    }

    // =========================================================================
    // Action targets
    // =========================================================================

    async fn get_current_action_target(&self, player_id: &PlayerId) -> StoreResult<Option<ActionTarget>> {
        self.read("get_current_action_target", || async {
            let mut conn = self.pool.acquire().await?;
            current_action(&mut conn, player_id.as_str()).await
        })
        .await
    }

    async fn save_action_target(&self, mut target: ActionTarget) -> StoreResult<ActionTarget> {
        validated(target.check_invariants())?;
        let now = Utc::now();
        if target.is_completed {
            target.completed_at.get_or_insert(now);
            target.end_reason.get_or_insert(ActionEndReason::Completed);
        }
        self.write(async {
            let mut tx = self.pool.begin().await?;
            if let Some(prev) = find_action(&mut tx, target.id.as_str()).await? {
                if prev.player_id != target.player_id {
                    return Err(StoreError::Validation(String::from(
                        "an action target cannot move between players",
                    )));
                }
            }
            if !target.is_completed {
                let superseded = sqlx::query(
                    "UPDATE action_targets SET is_completed = 1, completed_at = ?, end_reason = ? \
                     WHERE player_id = ? AND is_completed = 0 AND id <> ?",
                )
                .bind(to_millis(now))
                .bind(ActionEndReason::Superseded.as_str())
                .bind(target.player_id.as_str())
                .bind(target.id.as_str())
                .execute(&mut *tx)
                .await?;
                if superseded.rows_affected() > 0 {
                    tracing::debug!(player_id = %target.player_id, "Superseded action target");
                }
            }
            upsert_action(&mut tx, &target).await?;
            tx.commit().await?;
            Ok(target)
        })
        .await
    }

    async fn complete_action_target(&self, id: &ActionTargetId) -> StoreResult<ActionTarget> {
        self.write(async {
            let mut tx = self.pool.begin().await?;
            let mut target = find_action(&mut tx, id.as_str())
                .await?
                .ok_or_else(|| StoreError::not_found("action target", id))?;
            if !target.is_completed {
                target.finish(ActionEndReason::Completed, Utc::now());
                upsert_action(&mut tx, &target).await?;
            }
            tx.commit().await?;
            Ok(target)
        })
        .await
    }

    async fn cancel_action_target(&self, player_id: &PlayerId) -> StoreResult<bool> {
        self.write(async {
            let mut tx = self.pool.begin().await?;
            let Some(mut target) = current_action(&mut tx, player_id.as_str()).await? else {
                return Ok(false);
            };
            target.finish(ActionEndReason::Cancelled, Utc::now());
            upsert_action(&mut tx, &target).await?;
            tx.commit().await?;
            Ok(true)
        })
        .await
    }

    async fn get_action_history(&self, player_id: &PlayerId, limit: u32) -> StoreResult<Vec<ActionTarget>> {
        let sql = format!(
            "SELECT {ACTION_COLUMNS} FROM action_targets WHERE player_id = ? \
             ORDER BY started_at DESC, id DESC LIMIT ?"
        );
        let rows: Vec<ActionRow> = self
            .read("get_action_history", || async {
                Ok(sqlx::query_as(&sql)
                    .bind(player_id.as_str())
                    .bind(i64::from(limit))
                    .fetch_all(&self.pool)
                    .await?)
            })
            .await?;
        Ok(rows.into_iter().map(ActionTarget::from).collect())
    }

    // =========================================================================
    // Battles
    // =========================================================================

    async fn get_battle_record(&self, id: &BattleId) -> StoreResult<BattleRecord> {
        self.read("get_battle_record", || async {
            let mut conn = self.pool.acquire().await?;
            find_battle(&mut conn, id.as_str()).await
        })
        .await?
        .ok_or_else(|| StoreError::not_found("battle record", id))
    }

    async fn save_battle_record(&self, record: BattleRecord) -> StoreResult<BattleRecord> {
        validated(record.check_invariants())?;
        self.write(async {
            let mut tx = self.pool.begin().await?;
            upsert_battle(&mut tx, &record).await?;
            tx.commit().await?;
            Ok(record)
        })
        .await
    }

    async fn end_battle_record(
        &self,
        id: &BattleId,
        status: BattleStatus,
        results: serde_json::Value,
    ) -> StoreResult<BattleRecord> {
        self.write(async {
            let mut tx = self.pool.begin().await?;
            let mut record = find_battle(&mut tx, id.as_str())
                .await?
                .ok_or_else(|| StoreError::not_found("battle record", id))?;
            close_battle(&mut record, status, results)?;
            upsert_battle(&mut tx, &record).await?;
            tx.commit().await?;
            Ok(record)
        })
        .await
    }

    async fn get_battle_history(&self, filter: &BattleFilter, query: &BattleQuery) -> StoreResult<Vec<BattleRecord>> {
        let (scope, key) = match filter {
            BattleFilter::Player(player) => (
                "JOIN battle_participants p ON p.battle_id = b.id WHERE p.player_id = ?1",
                player.as_str(),
            ),
            BattleFilter::Team(team) => ("WHERE b.team_id = ?1", team.as_str()),
        };
        let sql = format!(
            "SELECT {BATTLE_COLUMNS} FROM battle_records b {scope} \
             AND (?2 IS NULL OR b.status = ?2) \
             AND (?3 IS NULL OR b.battle_type = ?3) \
             AND (?4 IS NULL OR b.started_at >= ?4) \
             ORDER BY b.started_at DESC, b.id DESC LIMIT ?5 OFFSET ?6"
        );
        let rows: Vec<BattleRow> = self
            .read("get_battle_history", || async {
                Ok(sqlx::query_as(&sql)
                    .bind(key)
                    .bind(query.status.map(BattleStatus::as_str))
                    .bind(query.battle_type.map(BattleType::as_str))
                    .bind(to_millis_opt(query.since))
                    .bind(i64::from(query.limit))
                    .bind(i64::from(query.offset))
                    .fetch_all(&self.pool)
                    .await?)
            })
            .await?;
        Ok(rows.into_iter().map(BattleRecord::from).collect())
    }

    async fn get_active_battles(&self) -> StoreResult<Vec<BattleRecord>> {
        let sql = format!("SELECT {BATTLE_COLUMNS} FROM battle_records b WHERE b.status = 'in_progress' ORDER BY b.id");
        let rows: Vec<BattleRow> = self
            .read("get_active_battles", || async { Ok(sqlx::query_as(&sql).fetch_all(&self.pool).await?) })
            .await?;
        Ok(rows.into_iter().map(BattleRecord::from).collect())
    }

    // =========================================================================
    // Offline data
    // =========================================================================

    async fn save_offline_data(&self, data: OfflineData) -> StoreResult<OfflineData> {
        self.write(async {
            let mut tx = self.pool.begin().await?;
            let previous = find_offline(&mut tx, data.id.as_str()).await?;
            let stored = next_offline_version(previous.as_ref(), data)?;
            upsert_offline(&mut tx, &stored).await?;
            tx.commit().await?;
            Ok(stored)
        })
        .await
    }

    async fn get_unsynced_offline_data(&self, player_id: &PlayerId) -> StoreResult<Vec<OfflineData>> {
        let sql = format!(
            "SELECT {OFFLINE_COLUMNS} FROM offline_data WHERE player_id = ? AND is_synced = 0 ORDER BY created_at, id"
        );
        let rows: Vec<OfflineRow> = self
            .read("get_unsynced_offline_data", || async {
                Ok(sqlx::query_as(&sql).bind(player_id.as_str()).fetch_all(&self.pool).await?)
            })
            .await?;
        Ok(rows.into_iter().map(OfflineData::from).collect())
    }

    async fn mark_offline_data_synced(&self, ids: &[OfflineDataId]) -> StoreResult<u64> {
        let now = to_millis(Utc::now());
        self.write(async {
            let mut tx = self.pool.begin().await?;
            let mut changed = 0_u64;
            for id in ids {
                let result = sqlx::query(
                    "UPDATE offline_data SET is_synced = 1, synced_at = ?, version = version + 1, updated_at = ? \
                     WHERE id = ? AND is_synced = 0",
                )
                .bind(now)
                .bind(now)
                .bind(id.as_str())
                .execute(&mut *tx)
                .await?;
                changed = changed.saturating_add(result.rows_affected());
            }
            tx.commit().await?;
            Ok(changed)
        })
        .await
    }

    // =========================================================================
    // Diagnostics
    // =========================================================================

    async fn get_storage_stats(&self) -> StoreResult<StorageStats> {
        let now = to_millis(Utc::now());
        let row: StatsRow = self
            .read("get_storage_stats", || async {
                Ok(sqlx::query_as(
                    "SELECT \
                     (SELECT COUNT(*) FROM users) AS total_users, \
                     (SELECT COUNT(*) FROM users WHERE is_active = 1) AS active_users, \
                     (SELECT COUNT(*) FROM users WHERE is_locked = 1 \
                         AND (locked_until IS NULL OR locked_until > ?1)) AS locked_users, \
                     (SELECT COUNT(*) FROM players) AS total_players, \
                     (SELECT COUNT(*) FROM players WHERE is_online = 1) AS online_players, \
                     (SELECT COUNT(*) FROM teams) AS total_teams, \
                     (SELECT COUNT(*) FROM teams WHERE status <> 'disbanded') AS active_teams, \
                     (SELECT COUNT(*) FROM action_targets WHERE is_completed = 0) AS in_progress_action_targets, \
                     (SELECT COUNT(*) FROM action_targets) AS total_action_targets, \
                     (SELECT COUNT(*) FROM battle_records WHERE status = 'in_progress') AS in_progress_battles, \
                     (SELECT COUNT(*) FROM battle_records WHERE status = 'completed') AS completed_battles, \
                     (SELECT COUNT(*) FROM battle_records WHERE status = 'aborted') AS aborted_battles, \
                     (SELECT COUNT(*) FROM offline_data) AS total_offline_data, \
                     (SELECT COUNT(*) FROM offline_data WHERE is_synced = 0) AS unsynced_offline_data",
                )
                .bind(now)
                .fetch_one(&self.pool)
                .await?)
            })
            .await?;
        Ok(StorageStats {
            backend: self.kind().to_owned(),
            total_users: to_u64(row.total_users),
            active_users: to_u64(row.active_users),
            locked_users: to_u64(row.locked_users),
            total_players: to_u64(row.total_players),
            online_players: to_u64(row.online_players),
            total_teams: to_u64(row.total_teams),
            active_teams: to_u64(row.active_teams),
            in_progress_action_targets: to_u64(row.in_progress_action_targets),
            total_action_targets: to_u64(row.total_action_targets),
            in_progress_battles: to_u64(row.in_progress_battles),
            completed_battles: to_u64(row.completed_battles),
            aborted_battles: to_u64(row.aborted_battles),
            total_offline_data: to_u64(row.total_offline_data),
            unsynced_offline_data: to_u64(row.unsynced_offline_data),
        })
    }

    async fn health_check(&self) -> StoreResult<bool> {
        let ping = with_deadline(self.timeout, async {
            let one: i64 = sqlx::query_scalar("SELECT 1").fetch_one(&self.pool).await?;
            Ok(one == 1)
        })
        .await;
        match ping {
            Ok(ok) => Ok(ok),
            Err(e) => {
                tracing::warn!(error = %e, "SQLite health check failed");
                Ok(false)
            }
        }
    }
}
