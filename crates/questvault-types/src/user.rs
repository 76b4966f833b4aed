//! User accounts and the account → character ownership links.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use validator::Validate;

use crate::enums::UserRole;
use crate::ids::{PlayerId, UserId};

/// One entry of a user's login history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoginRecord {
    /// When the attempt happened.
    pub at: DateTime<Utc>,
    /// Whether the credentials were accepted.
    pub success: bool,
    /// Source address reported by the transport layer, if any.
    #[serde(default)]
    pub source_ip: Option<String>,
}

/// A user account.
///
/// `username` and `email` are unique case-insensitively across all
/// active users. The password is never stored; only its Argon2 PHC hash
/// and the salt used to produce it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
    /// Primary key.
    pub id: UserId,
    /// Display/login name (original casing preserved).
    pub username: String,
    /// Contact address (original casing preserved).
    pub email: String,
    /// Argon2 PHC string.
    pub password_hash: String,
    /// Salt used for `password_hash`.
    pub salt: String,
    /// Granted roles.
    #[serde(default)]
    pub roles: BTreeSet<UserRole>,
    /// Inactive accounts are ignored by uniqueness checks and logins.
    pub is_active: bool,
    /// Explicit lock flag. A lock with no `locked_until` is indefinite.
    #[serde(default)]
    pub is_locked: bool,
    /// End of the current lockout, if time-bounded.
    #[serde(default)]
    pub locked_until: Option<DateTime<Utc>>,
    /// Consecutive failed logins since the last success.
    #[serde(default)]
    pub failed_login_attempts: u32,
    /// Most recent successful login.
    #[serde(default)]
    pub last_login_at: Option<DateTime<Utc>>,
    /// Bounded login history, oldest first.
    #[serde(default)]
    pub login_history: Vec<LoginRecord>,
    /// Free-form profile data.
    #[serde(default)]
    pub profile: serde_json::Value,
    /// Characters owned through active links.
    #[serde(default)]
    pub character_ids: Vec<PlayerId>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last write time.
    pub updated_at: DateTime<Utc>,
}

impl User {
    /// Lower-cased username used by the uniqueness index.
    pub fn username_key(&self) -> String {
        normalize_key(&self.username)
    }

    /// Lower-cased email used by the uniqueness index.
    pub fn email_key(&self) -> String {
        normalize_key(&self.email)
    }

    /// Whether a lock is in force at `now`.
    pub fn is_locked_at(&self, now: DateTime<Utc>) -> bool {
        if !self.is_locked {
            return false;
        }
        self.locked_until.is_none_or(|until| until > now)
    }

    /// Append a login attempt, keeping at most `max_entries` records.
    pub fn push_login(&mut self, record: LoginRecord, max_entries: usize) {
        self.login_history.push(record);
        if self.login_history.len() > max_entries {
            let excess = self.login_history.len().saturating_sub(max_entries);
            self.login_history.drain(..excess);
        }
    }
}

/// Normalise a username or email for case-insensitive uniqueness.
pub fn normalize_key(raw: &str) -> String {
    raw.trim().to_lowercase()
}

/// Input for creating a user.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
pub struct NewUser {
    /// Requested username.
    #[validate(length(min = 3, max = 32, message = "username must be 3-32 characters"))]
    pub username: String,
    /// Contact address.
    #[validate(email(message = "email address is malformed"))]
    pub email: String,
    /// Roles to grant; defaults to `Player` when empty.
    #[serde(default)]
    pub roles: BTreeSet<UserRole>,
    /// Initial profile blob.
    #[serde(default)]
    pub profile: serde_json::Value,
}

impl NewUser {
    /// Convenience constructor with the default role set.
    pub fn new(username: &str, email: &str) -> Self {
        Self {
            username: username.to_owned(),
            email: email.to_owned(),
            roles: BTreeSet::new(),
            profile: serde_json::Value::Null,
        }
    }
}

/// Ownership link between a user and one of their characters.
///
/// A character has at most one active owning link, and a user has at
/// most one active link flagged `is_default`. Name, profession and level
/// are denormalised copies for fast character-select listings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserCharacterLink {
    /// Owning account.
    pub user_id: UserId,
    /// Owned character.
    pub character_id: PlayerId,
    /// Selected by default at login.
    pub is_default: bool,
    /// Inactive links are kept for audit but grant no ownership.
    pub is_active: bool,
    /// Position on the character-select screen.
    pub slot_index: u32,
    /// Denormalised character name.
    pub character_name: String,
    /// Denormalised main profession.
    #[serde(default)]
    pub profession: String,
    /// Denormalised character level.
    #[serde(default)]
    pub level: u32,
    /// Creation time.
    pub created_at: DateTime<Utc>,
}

impl UserCharacterLink {
    /// Build an active link stamped with the current time.
    pub fn new(user_id: UserId, character_id: PlayerId, character_name: &str, is_default: bool) -> Self {
        Self {
            user_id,
            character_id,
            is_default,
            is_active: true,
            slot_index: 0,
            character_name: character_name.to_owned(),
            profession: String::new(),
            level: 1,
            created_at: Utc::now(),
        }
    }
}
