//! Argon2id password hashing and account login rules.
//!
//! Raw passwords never reach a backend table. [`CredentialHasher`] turns
//! them into a PHC string plus the salt used, and verifies candidates
//! against a stored PHC string. [`AccountPolicy`] holds the rules every
//! backend applies identically when creating users and recording logins.

use std::collections::BTreeSet;

use argon2::password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use argon2::{Algorithm, Argon2, Params, Version};
use chrono::{DateTime, Duration, Utc};
use questvault_types::{LoginRecord, NewUser, User, UserId, UserRole};
use uuid::Uuid;
use validator::Validate;

use crate::error::{StoreError, StoreResult};

/// Default Argon2 memory cost in KiB.
pub const DEFAULT_MEMORY_KIB: u32 = 19_456;

/// Default Argon2 iteration count.
pub const DEFAULT_ITERATIONS: u32 = 2;

/// Argon2id hasher with fixed cost parameters.
#[derive(Debug, Clone)]
pub struct CredentialHasher {
    params: Params,
}

impl CredentialHasher {
    /// Build a hasher with the given memory cost (KiB) and iteration count.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Config`] if Argon2 rejects the parameters.
    pub fn new(memory_kib: u32, iterations: u32) -> StoreResult<Self> {
        let params = Params::new(memory_kib, iterations, 1, None)
            .map_err(|e| StoreError::Config(format!("invalid argon2 parameters: {e}")))?;
        Ok(Self { params })
    }

    /// Cheapest parameters Argon2 accepts. Only suitable for tests.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Config`] if Argon2 rejects the parameters.
    pub fn fast() -> StoreResult<Self> {
        Self::new(Params::MIN_M_COST.max(64), 1)
    }

    fn argon(&self) -> Argon2<'static> {
        Argon2::new(Algorithm::Argon2id, Version::V0x13, self.params.clone())
    }

    /// Hash `raw` with a fresh random salt. Returns `(phc_hash, salt)`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Validation`] for an empty password and
    /// [`StoreError::Config`] if hashing fails.
    pub fn hash(&self, raw: &str) -> StoreResult<(String, String)> {
        if raw.is_empty() {
            return Err(StoreError::Validation(String::from("password must not be empty")));
        }
        let salt = SaltString::encode_b64(Uuid::new_v4().as_bytes())
            .map_err(|e| StoreError::Config(format!("salt encoding failed: {e}")))?;
        let hash = self
            .argon()
            .hash_password(raw.as_bytes(), &salt)
            .map_err(|e| StoreError::Config(format!("password hashing failed: {e}")))?
            .to_string();
        Ok((hash, salt.as_str().to_owned()))
    }

    /// Whether `raw` matches the stored PHC string.
    ///
    /// A malformed stored hash never matches.
    pub fn verify(&self, raw: &str, stored_hash: &str) -> bool {
        let Ok(parsed) = PasswordHash::new(stored_hash) else {
            tracing::warn!("stored password hash is not a valid PHC string");
            return false;
        };
        self.argon().verify_password(raw.as_bytes(), &parsed).is_ok()
    }
}

// =========================================================================
// Account policy
// =========================================================================

/// Default consecutive failures before an account is locked.
pub const DEFAULT_MAX_FAILED_LOGINS: u32 = 5;

/// Default lockout length in minutes.
pub const DEFAULT_LOCKOUT_MINUTES: i64 = 15;

/// Default number of login records kept per user.
pub const DEFAULT_LOGIN_HISTORY_LEN: usize = 20;

/// Account rules shared by every backend.
#[derive(Debug, Clone)]
pub struct AccountPolicy {
    hasher: CredentialHasher,
    max_failed_logins: u32,
    lockout: Duration,
    login_history_len: usize,
}

impl AccountPolicy {
    /// Policy with default thresholds around `hasher`.
    pub fn new(hasher: CredentialHasher) -> Self {
        Self {
            hasher,
            max_failed_logins: DEFAULT_MAX_FAILED_LOGINS,
            lockout: Duration::minutes(DEFAULT_LOCKOUT_MINUTES),
            login_history_len: DEFAULT_LOGIN_HISTORY_LEN,
        }
    }

    /// Set the failed-login threshold (0 disables automatic lockout).
    #[must_use]
    pub const fn with_max_failed_logins(mut self, max: u32) -> Self {
        self.max_failed_logins = max;
        self
    }

    /// Set the automatic lockout length.
    #[must_use]
    pub const fn with_lockout(mut self, lockout: Duration) -> Self {
        self.lockout = lockout;
        self
    }

    /// Set how many login records are kept per user.
    #[must_use]
    pub const fn with_login_history_len(mut self, len: usize) -> Self {
        self.login_history_len = len;
        self
    }

    /// The password hasher.
    pub const fn hasher(&self) -> &CredentialHasher {
        &self.hasher
    }

    /// Validate `input` and build the stored user, hashing `raw_password`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Validation`] for a malformed username, email
    /// or empty password.
    pub fn build_user(&self, input: &NewUser, raw_password: &str) -> StoreResult<User> {
        input.validate()?;
        if input.username.trim().is_empty() {
            return Err(StoreError::Validation(String::from("username must not be blank")));
        }
        let (password_hash, salt) = self.hasher.hash(raw_password)?;
        let roles = if input.roles.is_empty() {
            BTreeSet::from([UserRole::Player])
        } else {
            input.roles.clone()
        };
        let now = Utc::now();
        Ok(User {
            id: UserId::generate(),
            username: input.username.trim().to_owned(),
            email: input.email.trim().to_owned(),
            password_hash,
            salt,
            roles,
            is_active: true,
            is_locked: false,
            locked_until: None,
            failed_login_attempts: 0,
            last_login_at: None,
            login_history: Vec::new(),
            profile: input.profile.clone(),
            character_ids: Vec::new(),
            created_at: now,
            updated_at: now,
        })
    }

    /// Whether `raw` is the password of a usable account at `now`.
    ///
    /// Inactive or currently locked accounts never validate.
    pub fn accepts(&self, user: &User, raw: &str, now: DateTime<Utc>) -> bool {
        if !user.is_active || user.is_locked_at(now) {
            return false;
        }
        self.hasher.verify(raw, &user.password_hash)
    }

    /// Apply a login attempt to `user`.
    ///
    /// Success clears the failure counter and any expired lock. Failure
    /// increments it and locks the account once the threshold is hit.
    pub fn apply_login(&self, user: &mut User, success: bool, source_ip: Option<&str>, now: DateTime<Utc>) {
        user.push_login(
            LoginRecord {
                at: now,
                success,
                source_ip: source_ip.map(str::to_owned),
            },
            self.login_history_len,
        );
        if success {
            user.failed_login_attempts = 0;
            user.last_login_at = Some(now);
            if user.is_locked && !user.is_locked_at(now) {
                user.is_locked = false;
                user.locked_until = None;
            }
        } else {
            user.failed_login_attempts = user.failed_login_attempts.saturating_add(1);
            if self.max_failed_logins > 0 && user.failed_login_attempts >= self.max_failed_logins {
                user.is_locked = true;
                user.locked_until = now.checked_add_signed(self.lockout);
                tracing::warn!(
                    user_id = %user.id,
                    attempts = user.failed_login_attempts,
                    "Account locked after repeated failed logins"
                );
            }
        }
        user.updated_at = now;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hasher() -> Option<CredentialHasher> {
        CredentialHasher::fast().ok()
    }

    #[test]
    fn hash_then_verify() {
        let Some(h) = hasher() else {
            return;
        };
        let (hash, salt) = h.hash("pw123").unwrap_or_default();
        assert!(hash.starts_with("$argon2id$"));
        assert!(!salt.is_empty());
        assert!(h.verify("pw123", &hash));
        assert!(!h.verify("pw124", &hash));
    }

    #[test]
    fn salts_differ_per_hash() {
        let Some(h) = hasher() else {
            return;
        };
        let (a, sa) = h.hash("same").unwrap_or_default();
        let (b, sb) = h.hash("same").unwrap_or_default();
        assert_ne!(a, b);
        assert_ne!(sa, sb);
    }

    #[test]
    fn empty_password_is_rejected() {
        let Some(h) = hasher() else {
            return;
        };
        assert!(matches!(h.hash(""), Err(StoreError::Validation(_))));
    }

    #[test]
    fn garbage_hash_never_verifies() {
        let Some(h) = hasher() else {
            return;
        };
        assert!(!h.verify("pw123", "not-a-phc-string"));
    }

    #[test]
    fn zero_iterations_is_a_config_error() {
        assert!(matches!(CredentialHasher::new(64, 0), Err(StoreError::Config(_))));
    }

    #[test]
    fn lockout_after_threshold_then_reset_on_success() {
        let Some(h) = hasher() else {
            return;
        };
        let policy = AccountPolicy::new(h).with_max_failed_logins(3).with_login_history_len(2);
        let Ok(mut user) = policy.build_user(&NewUser::new("alice", "alice@example.com"), "pw123") else {
            return;
        };
        let now = Utc::now();
        for _ in 0..3 {
            policy.apply_login(&mut user, false, Some("10.0.0.1"), now);
        }
        assert!(user.is_locked_at(now));
        assert!(!policy.accepts(&user, "pw123", now));
        assert_eq!(user.login_history.len(), 2);

        let later = now + Duration::minutes(DEFAULT_LOCKOUT_MINUTES + 1);
        assert!(policy.accepts(&user, "pw123", later));
        policy.apply_login(&mut user, true, None, later);
        assert_eq!(user.failed_login_attempts, 0);
        assert!(!user.is_locked);
        assert_eq!(user.last_login_at, Some(later));
    }

    #[test]
    fn built_user_gets_player_role_and_trimmed_names() {
        let Some(h) = hasher() else {
            return;
        };
        let policy = AccountPolicy::new(h);
        let Ok(user) = policy.build_user(&NewUser::new(" Alice ", "alice@example.com"), "pw123") else {
            return;
        };
        assert_eq!(user.username, "Alice");
        assert!(user.roles.contains(&UserRole::Player));
        assert_ne!(user.password_hash, "pw123");
    }
}
