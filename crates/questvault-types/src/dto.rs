//! Wire-facing projections and the uniform result envelope.
//!
//! These are the shapes the transport layer and the monitoring
//! collaborator see. Credentials never leave the persistence layer: the
//! user projection drops the hash and salt.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use ts_rs::TS;

use crate::enums::{BattleStatus, BattleType, EntityKind, ErrorCode, UserRole};
use crate::ids::{PlayerId, UserId};
use crate::player::Player;
use crate::user::{User, UserCharacterLink};

/// Uniform result envelope returned by every inbound operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[ts(export, export_to = "bindings/")]
pub struct ApiResponse<T> {
    /// Whether the operation succeeded.
    pub success: bool,
    /// Payload on success.
    pub data: Option<T>,
    /// Human-readable outcome.
    pub message: String,
    /// Failure class on error.
    pub error_code: Option<ErrorCode>,
}

impl<T> ApiResponse<T> {
    /// A successful response carrying `data`.
    pub fn ok(data: T, message: impl Into<String>) -> Self {
        Self {
            success: true,
            data: Some(data),
            message: message.into(),
            error_code: None,
        }
    }

    /// A failed response.
    pub fn fail(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            message: message.into(),
            error_code: Some(code),
        }
    }

    /// Transform the payload, keeping status and message.
    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> ApiResponse<U> {
        ApiResponse {
            success: self.success,
            data: self.data.map(f),
            message: self.message,
            error_code: self.error_code,
        }
    }
}

/// Public projection of a [`User`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[ts(export, export_to = "bindings/")]
pub struct UserDto {
    /// Account key.
    pub id: UserId,
    /// Username.
    pub username: String,
    /// Email address.
    pub email: String,
    /// Granted roles.
    pub roles: Vec<UserRole>,
    /// Whether the account is active.
    pub is_active: bool,
    /// Whether a lock flag is set.
    pub is_locked: bool,
    /// End of the current lockout.
    pub locked_until: Option<DateTime<Utc>>,
    /// Most recent successful login.
    pub last_login_at: Option<DateTime<Utc>>,
    /// Owned characters.
    pub character_ids: Vec<PlayerId>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
}

impl From<&User> for UserDto {
    fn from(user: &User) -> Self {
        Self {
            id: user.id.clone(),
            username: user.username.clone(),
            email: user.email.clone(),
            roles: user.roles.iter().copied().collect(),
            is_active: user.is_active,
            is_locked: user.is_locked,
            locked_until: user.locked_until,
            last_login_at: user.last_login_at,
            character_ids: user.character_ids.clone(),
            created_at: user.created_at,
        }
    }
}

/// Character-select listing built from a [`UserCharacterLink`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export, export_to = "bindings/")]
pub struct CharacterListing {
    /// Character key.
    pub character_id: PlayerId,
    /// Character name.
    pub name: String,
    /// Main profession.
    pub profession: String,
    /// Level at the time of the last link update.
    pub level: u32,
    /// Whether this is the default character.
    pub is_default: bool,
    /// Slot on the selection screen.
    pub slot_index: u32,
}

impl From<&UserCharacterLink> for CharacterListing {
    fn from(link: &UserCharacterLink) -> Self {
        Self {
            character_id: link.character_id.clone(),
            name: link.character_name.clone(),
            profession: link.profession.clone(),
            level: link.level,
            is_default: link.is_default,
            slot_index: link.slot_index,
        }
    }
}

/// Lightweight projection of a [`Player`] for lists and search results.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export, export_to = "bindings/")]
pub struct PlayerSummary {
    /// Character key.
    pub id: PlayerId,
    /// Character name.
    pub name: String,
    /// Level.
    pub level: u32,
    /// Main profession.
    pub profession: String,
    /// Connected right now.
    pub is_online: bool,
    /// Dead right now.
    pub is_dead: bool,
}

impl From<&Player> for PlayerSummary {
    fn from(player: &Player) -> Self {
        Self {
            id: player.id.clone(),
            name: player.name.clone(),
            level: player.level,
            profession: player.profession.clone(),
            is_online: player.is_online,
            is_dead: player.is_dead,
        }
    }
}

/// Per-item outcome of a batch write.
///
/// A batch is never rolled back because one item failed; valid items are
/// persisted and each failure is reported in `errors`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export, export_to = "bindings/")]
pub struct BatchResult {
    /// Items persisted.
    pub success_count: u64,
    /// Items rejected.
    pub error_count: u64,
    /// One message per rejected item, prefixed with its key.
    pub errors: Vec<String>,
}

impl BatchResult {
    /// Record a persisted item.
    pub const fn record_success(&mut self) {
        self.success_count = self.success_count.saturating_add(1);
    }

    /// Record a rejected item.
    pub fn record_failure(&mut self, key: &str, reason: impl core::fmt::Display) {
        self.error_count = self.error_count.saturating_add(1);
        self.errors.push(format!("{key}: {reason}"));
    }

    /// Fold another result into this one.
    pub fn merge(&mut self, other: Self) {
        self.success_count = self.success_count.saturating_add(other.success_count);
        self.error_count = self.error_count.saturating_add(other.error_count);
        self.errors.extend(other.errors);
    }

    /// Total number of items attempted.
    pub const fn total(&self) -> u64 {
        self.success_count.saturating_add(self.error_count)
    }
}

/// Filters for battle history queries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export, export_to = "bindings/")]
pub struct BattleQuery {
    /// Only battles with this status.
    #[serde(default)]
    pub status: Option<BattleStatus>,
    /// Only battles of this type.
    #[serde(default)]
    pub battle_type: Option<BattleType>,
    /// Only battles started at or after this time.
    #[serde(default)]
    pub since: Option<DateTime<Utc>>,
    /// Maximum rows returned.
    #[serde(default = "default_battle_limit")]
    pub limit: u32,
    /// Rows skipped before the first returned one (newest first).
    #[serde(default)]
    pub offset: u32,
}

const fn default_battle_limit() -> u32 {
    50
}

impl Default for BattleQuery {
    fn default() -> Self {
        Self {
            status: None,
            battle_type: None,
            since: None,
            limit: default_battle_limit(),
            offset: 0,
        }
    }
}

/// Aggregate entity counts reported by a backend.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export, export_to = "bindings/")]
pub struct StorageStats {
    /// Backend that produced the numbers.
    pub backend: String,
    /// All user accounts.
    pub total_users: u64,
    /// Active user accounts.
    pub active_users: u64,
    /// Accounts with a lock flag set.
    pub locked_users: u64,
    /// All player characters.
    pub total_players: u64,
    /// Characters online right now.
    pub online_players: u64,
    /// All teams, including disbanded ones.
    pub total_teams: u64,
    /// Teams that are not disbanded.
    pub active_teams: u64,
    /// Action targets not yet finished.
    pub in_progress_action_targets: u64,
    /// All stored action targets.
    pub total_action_targets: u64,
    /// Battles still running.
    pub in_progress_battles: u64,
    /// Battles completed normally.
    pub completed_battles: u64,
    /// Battles aborted.
    pub aborted_battles: u64,
    /// All offline-data records.
    pub total_offline_data: u64,
    /// Offline-data records awaiting sync.
    pub unsynced_offline_data: u64,
}

/// Write metrics for one entity class in the batch coordinator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[ts(export, export_to = "bindings/")]
pub struct ClassWriteStats {
    /// Entity class.
    pub kind: EntityKind,
    /// Saves currently queued.
    pub pending: u64,
    /// Saves accepted by the coordinator.
    pub submitted: u64,
    /// Saves replaced by a later save for the same key before flushing.
    pub coalesced: u64,
    /// Items committed by flushes.
    pub flushed: u64,
    /// Items rejected by flushes.
    pub failed: u64,
    /// Flushes executed.
    pub flush_count: u64,
    /// Mean flush latency in milliseconds.
    pub average_flush_ms: f64,
}

/// Cache tier counters.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, TS)]
#[ts(export, export_to = "bindings/")]
pub struct CacheStats {
    /// Store implementation name.
    pub store: String,
    /// Entries currently held (in-process store only).
    pub entries: u64,
    /// Lookups served from the cache.
    pub hits: u64,
    /// Lookups that fell through to the backend.
    pub misses: u64,
    /// Entries dropped by capacity compaction.
    pub evictions: u64,
    /// `hits / (hits + misses)`, or zero before the first lookup.
    pub hit_ratio: f64,
}

/// State of the background maintenance loop.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export, export_to = "bindings/")]
pub struct MaintenanceStatus {
    /// Whether the loop is running.
    pub running: bool,
    /// Passes completed successfully.
    pub passes_completed: u64,
    /// Passes that failed.
    pub passes_failed: u64,
    /// Consecutive failures since the last success.
    pub consecutive_failures: u64,
    /// End of the last successful pass.
    pub last_success_at: Option<DateTime<Utc>>,
    /// Error message of the last failed pass.
    pub last_error: Option<String>,
    /// Path of the most recent backup artifact.
    pub last_backup: Option<String>,
}

/// Health snapshot consumed by external monitoring.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[ts(export, export_to = "bindings/")]
pub struct HealthReport {
    /// Overall verdict.
    pub healthy: bool,
    /// Backend name.
    pub backend: String,
    /// Whether the backend answered its connectivity ping in time.
    pub backend_connected: bool,
    /// Ping round-trip in milliseconds.
    pub ping_latency_ms: u64,
    /// Entity counts, when the backend answered in time.
    pub stats: Option<StorageStats>,
    /// Total saves waiting in the batch coordinator.
    pub pending_writes: u64,
    /// Per-class coordinator metrics.
    pub writes: Vec<ClassWriteStats>,
    /// Cache tier counters, when the cache is enabled.
    pub cache: Option<CacheStats>,
    /// Maintenance loop state.
    pub maintenance: MaintenanceStatus,
    /// Reasons behind an unhealthy verdict.
    pub issues: Vec<String>,
    /// When the report was produced.
    pub checked_at: DateTime<Utc>,
}
