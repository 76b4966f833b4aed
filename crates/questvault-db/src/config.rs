//! Configuration loading and typed config structures for Questvault.
//!
//! The canonical configuration lives in `questvault.yaml`. The structs
//! below mirror the YAML structure; every field has a default so a
//! partial (or empty) file is valid.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::backup::RetentionPolicy;
use crate::batch::BatchConfig;
use crate::cache::CacheTtls;
use crate::credentials::{AccountPolicy, CredentialHasher};
use crate::error::StoreResult;
use crate::maintenance::{MaintenanceConfig, RetentionWindows};
use crate::sqlite::SqliteConfig;

/// Errors that can occur when loading configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Failed to read the configuration file from disk.
    #[error("failed to read config file: {source}")]
    Io {
        /// The underlying I/O error.
        #[from]
        source: std::io::Error,
    },

    /// Failed to parse YAML content.
    #[error("failed to parse config YAML: {source}")]
    Yaml {
        /// The underlying YAML parse error.
        source: serde_yml::Error,
    },

    /// A value parsed but is unusable.
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

impl From<serde_yml::Error> for ConfigError {
    fn from(source: serde_yml::Error) -> Self {
        Self::Yaml { source }
    }
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct StoreConfig {
    /// Backend selection and connection.
    #[serde(default)]
    pub backend: BackendSection,

    /// Cache tier.
    #[serde(default)]
    pub cache: CacheSection,

    /// Batch write coordinator.
    #[serde(default)]
    pub batch: BatchSection,

    /// Maintenance scheduler timing.
    #[serde(default)]
    pub maintenance: MaintenanceSection,

    /// Backups.
    #[serde(default)]
    pub backup: BackupSection,

    /// Retention cleanup windows.
    #[serde(default)]
    pub retention: RetentionSection,

    /// Credential hashing and lockout.
    #[serde(default)]
    pub security: SecuritySection,

    /// Monitoring server.
    #[serde(default)]
    pub server: ServerSection,

    /// Logging.
    #[serde(default)]
    pub logging: LoggingSection,
}

impl StoreConfig {
    /// Load configuration from a YAML file, then apply environment
    /// overrides:
    /// - `QUESTVAULT_BACKEND` overrides `backend.kind`
    /// - `QUESTVAULT_DATABASE_URL` overrides `backend.url`
    /// - `QUESTVAULT_DRAGONFLY_URL` overrides `cache.dragonfly_url`
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Io`] if the file cannot be read,
    /// [`ConfigError::Yaml`] if the content is not valid YAML, or
    /// [`ConfigError::Invalid`] if a value is out of range.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        let mut config = Self::parse(&contents)?;
        config.apply_env_overrides()?;
        Ok(config)
    }

    /// Parse configuration from a YAML string (no environment overrides).
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Yaml`] if the string is not valid YAML, or
    /// [`ConfigError::Invalid`] if a value is out of range.
    pub fn parse(yaml: &str) -> Result<Self, ConfigError> {
        let config: Self = if yaml.trim().is_empty() {
            Self::default()
        } else {
            serde_yml::from_str(yaml)?
        };
        config.validate()?;
        Ok(config)
    }

    /// Apply overrides from the process environment.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] for an unknown backend name.
    pub fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        self.apply_overrides(|name| std::env::var(name).ok())
    }

    /// Apply overrides from `lookup` (variable name to value).
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] for an unknown backend name.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<(), ConfigError> {
        if let Some(kind) = lookup("QUESTVAULT_BACKEND") {
            self.backend.kind = BackendKind::parse(&kind)
                .ok_or_else(|| ConfigError::Invalid(format!("unknown backend '{kind}'")))?;
        }
        if let Some(url) = lookup("QUESTVAULT_DATABASE_URL") {
            self.backend.url = url;
        }
        if let Some(url) = lookup("QUESTVAULT_DRAGONFLY_URL") {
            self.cache.dragonfly_url = url;
        }
        Ok(())
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let fraction = self.cache.compaction_fraction;
        if fraction.is_nan() || fraction <= 0.0 || fraction > 1.0 {
            return Err(ConfigError::Invalid(String::from(
                "cache.compaction_fraction must be in (0, 1]",
            )));
        }
        if self.batch.max_batch_size == 0 {
            return Err(ConfigError::Invalid(String::from("batch.max_batch_size must be at least 1")));
        }
        if self.maintenance.interval_secs == 0 {
            return Err(ConfigError::Invalid(String::from("maintenance.interval_secs must be positive")));
        }
        if self.backup.enabled && self.backup.directory.as_os_str().is_empty() {
            return Err(ConfigError::Invalid(String::from("backup.directory must be set when backups are enabled")));
        }
        Ok(())
    }

    /// `SQLite` pool settings.
    pub fn sqlite_config(&self) -> SqliteConfig {
        SqliteConfig::new(&self.backend.url)
            .with_max_connections(self.backend.max_connections)
            .with_operation_timeout(Duration::from_millis(self.backend.operation_timeout_ms))
            .with_maintenance_timeout(Duration::from_secs(self.backend.maintenance_timeout_secs))
    }

    /// Cache TTL tiers.
    pub const fn cache_ttls(&self) -> CacheTtls {
        CacheTtls {
            hot: Duration::from_secs(self.cache.hot_ttl_secs),
            cold: Duration::from_secs(self.cache.cold_ttl_secs),
        }
    }

    /// Batch coordinator settings.
    pub const fn batch_config(&self) -> BatchConfig {
        BatchConfig {
            max_batch_size: self.batch.max_batch_size,
            flush_interval: Duration::from_millis(self.batch.flush_interval_ms),
        }
    }

    /// Maintenance scheduler settings.
    pub const fn maintenance_config(&self) -> MaintenanceConfig {
        MaintenanceConfig {
            warmup: Duration::from_secs(self.maintenance.warmup_secs),
            interval: Duration::from_secs(self.maintenance.interval_secs),
            failure_backoff: Duration::from_secs(self.maintenance.failure_backoff_secs),
            index_rebuild_every: days(self.maintenance.index_rebuild_days),
            compaction_every: days(self.maintenance.compaction_days),
            backup_every: Duration::from_secs(self.backup.interval_secs),
            retention: RetentionWindows {
                offline_data: days(self.retention.offline_data_days),
                action_history: days(self.retention.action_history_days),
                battle_history: days(self.retention.battle_history_days),
            },
        }
    }

    /// Backup retention.
    pub fn backup_retention(&self) -> RetentionPolicy {
        RetentionPolicy {
            keep_count: self.backup.retention_count,
            max_age: chrono::Duration::days(i64::from(self.backup.retention_days)),
        }
    }

    /// Account policy with the configured hashing cost and lockout.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Config`](crate::StoreError::Config) for
    /// unusable Argon2 parameters.
    pub fn account_policy(&self) -> StoreResult<AccountPolicy> {
        let hasher = CredentialHasher::new(self.security.argon2_memory_kib, self.security.argon2_iterations)?;
        Ok(AccountPolicy::new(hasher)
            .with_max_failed_logins(self.security.max_failed_logins)
            .with_lockout(chrono::Duration::minutes(self.security.lockout_minutes))
            .with_login_history_len(self.security.login_history_len))
    }
}

const fn days(count: u64) -> Duration {
    Duration::from_secs(count.saturating_mul(24 * 60 * 60))
}

/// Which backend implementation to run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    /// Thread-safe in-process maps.
    #[default]
    InMemory,
    /// `SQLite` through `sqlx`.
    Sqlite,
}

impl BackendKind {
    /// Parse a backend name (`in_memory`/`memory` or `sqlite`).
    pub fn parse(text: &str) -> Option<Self> {
        match text.trim().to_ascii_lowercase().as_str() {
            "in_memory" | "inmemory" | "memory" => Some(Self::InMemory),
            "sqlite" => Some(Self::Sqlite),
            _ => None,
        }
    }
}

/// Backend selection and connection.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct BackendSection {
    /// Backend implementation.
    #[serde(default)]
    pub kind: BackendKind,

    /// Connection URL for relational backends.
    #[serde(default = "default_database_url")]
    pub url: String,

    /// Pool size for relational backends.
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,

    /// Deadline for every storage operation.
    #[serde(default = "default_operation_timeout_ms")]
    pub operation_timeout_ms: u64,

    /// Deadline for one maintenance statement (`VACUUM`, `REINDEX`, backup).
    #[serde(default = "default_maintenance_timeout_secs")]
    pub maintenance_timeout_secs: u64,

    /// JSON snapshot loaded at start and written at shutdown by the
    /// in-memory backend. No snapshot when absent.
    #[serde(default)]
    pub snapshot_path: Option<PathBuf>,
}

impl Default for BackendSection {
    fn default() -> Self {
        Self {
            kind: BackendKind::default(),
            url: default_database_url(),
            max_connections: default_max_connections(),
            operation_timeout_ms: default_operation_timeout_ms(),
            maintenance_timeout_secs: default_maintenance_timeout_secs(),
            snapshot_path: None,
        }
    }
}

/// Where the cache tier keeps entries.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheStoreKind {
    /// In-process TTL map.
    #[default]
    Memory,
    /// Shared `Dragonfly` instance.
    Dragonfly,
}

/// Cache tier.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct CacheSection {
    /// Whether reads go through the cache.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Store implementation.
    #[serde(default)]
    pub store: CacheStoreKind,

    /// `Dragonfly` URL for the shared store.
    #[serde(default = "default_dragonfly_url")]
    pub dragonfly_url: String,

    /// TTL for players, teams and in-progress battles.
    #[serde(default = "default_hot_ttl_secs")]
    pub hot_ttl_secs: u64,

    /// TTL for users and finished battles.
    #[serde(default = "default_cold_ttl_secs")]
    pub cold_ttl_secs: u64,

    /// Entry capacity of the in-process store.
    #[serde(default = "default_cache_capacity")]
    pub capacity: usize,

    /// Share of entries evicted when the in-process store is full.
    #[serde(default = "default_compaction_fraction")]
    pub compaction_fraction: f64,
}

impl Default for CacheSection {
    fn default() -> Self {
        Self {
            enabled: true,
            store: CacheStoreKind::default(),
            dragonfly_url: default_dragonfly_url(),
            hot_ttl_secs: default_hot_ttl_secs(),
            cold_ttl_secs: default_cold_ttl_secs(),
            capacity: default_cache_capacity(),
            compaction_fraction: default_compaction_fraction(),
        }
    }
}

/// Batch write coordinator.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct BatchSection {
    /// Whether the coordinator (and its timer) runs.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Queue length that triggers an immediate flush.
    #[serde(default = "default_max_batch_size")]
    pub max_batch_size: usize,

    /// Flush timer period.
    #[serde(default = "default_flush_interval_ms")]
    pub flush_interval_ms: u64,
}

impl Default for BatchSection {
    fn default() -> Self {
        Self {
            enabled: true,
            max_batch_size: default_max_batch_size(),
            flush_interval_ms: default_flush_interval_ms(),
        }
    }
}

/// Maintenance scheduler timing.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct MaintenanceSection {
    /// Whether the scheduler runs.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Delay before the first pass.
    #[serde(default = "default_warmup_secs")]
    pub warmup_secs: u64,

    /// Delay between successful passes.
    #[serde(default = "default_maintenance_interval_secs")]
    pub interval_secs: u64,

    /// Delay after a failed pass.
    #[serde(default = "default_failure_backoff_secs")]
    pub failure_backoff_secs: u64,

    /// Days between index rebuilds.
    #[serde(default = "default_index_rebuild_days")]
    pub index_rebuild_days: u64,

    /// Days between compactions.
    #[serde(default = "default_compaction_days")]
    pub compaction_days: u64,
}

impl Default for MaintenanceSection {
    fn default() -> Self {
        Self {
            enabled: true,
            warmup_secs: default_warmup_secs(),
            interval_secs: default_maintenance_interval_secs(),
            failure_backoff_secs: default_failure_backoff_secs(),
            index_rebuild_days: default_index_rebuild_days(),
            compaction_days: default_compaction_days(),
        }
    }
}

/// Backups.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct BackupSection {
    /// Whether maintenance passes take backups.
    #[serde(default)]
    pub enabled: bool,

    /// Artifact directory.
    #[serde(default = "default_backup_directory")]
    pub directory: PathBuf,

    /// Minimum time between backups.
    #[serde(default = "default_backup_interval_secs")]
    pub interval_secs: u64,

    /// Newest artifacts always kept.
    #[serde(default = "default_backup_retention_count")]
    pub retention_count: usize,

    /// Artifacts older than this many days are deleted.
    #[serde(default = "default_backup_retention_days")]
    pub retention_days: u32,
}

impl Default for BackupSection {
    fn default() -> Self {
        Self {
            enabled: false,
            directory: default_backup_directory(),
            interval_secs: default_backup_interval_secs(),
            retention_count: default_backup_retention_count(),
            retention_days: default_backup_retention_days(),
        }
    }
}

/// Retention cleanup windows.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct RetentionSection {
    /// Days synced offline data is kept.
    #[serde(default = "default_offline_data_days")]
    pub offline_data_days: u64,

    /// Days finished action targets are kept.
    #[serde(default = "default_action_history_days")]
    pub action_history_days: u64,

    /// Days ended battles are kept.
    #[serde(default = "default_battle_history_days")]
    pub battle_history_days: u64,
}

impl Default for RetentionSection {
    fn default() -> Self {
        Self {
            offline_data_days: default_offline_data_days(),
            action_history_days: default_action_history_days(),
            battle_history_days: default_battle_history_days(),
        }
    }
}

/// Credential hashing and lockout.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct SecuritySection {
    /// Argon2 memory cost in KiB.
    #[serde(default = "default_argon2_memory_kib")]
    pub argon2_memory_kib: u32,

    /// Argon2 iteration count.
    #[serde(default = "default_argon2_iterations")]
    pub argon2_iterations: u32,

    /// Consecutive failed logins that lock the account.
    #[serde(default = "default_max_failed_logins")]
    pub max_failed_logins: u32,

    /// Lockout length.
    #[serde(default = "default_lockout_minutes")]
    pub lockout_minutes: i64,

    /// Login history entries kept per user.
    #[serde(default = "default_login_history_len")]
    pub login_history_len: usize,
}

impl Default for SecuritySection {
    fn default() -> Self {
        Self {
            argon2_memory_kib: default_argon2_memory_kib(),
            argon2_iterations: default_argon2_iterations(),
            max_failed_logins: default_max_failed_logins(),
            lockout_minutes: default_lockout_minutes(),
            login_history_len: default_login_history_len(),
        }
    }
}

/// Monitoring server.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ServerSection {
    /// Bind address.
    #[serde(default = "default_host")]
    pub host: String,

    /// Bind port.
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

/// Logging.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct LoggingSection {
    /// Default filter directive when `RUST_LOG` is unset.
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Emit JSON lines instead of human-readable output.
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

// =========================================================================
// Defaults
// =========================================================================

const fn default_true() -> bool {
    true
}

fn default_database_url() -> String {
    String::from("sqlite://data/questvault.db")
}

const fn default_max_connections() -> u32 {
    8
}

const fn default_operation_timeout_ms() -> u64 {
    2_000
}

const fn default_maintenance_timeout_secs() -> u64 {
    300
}

fn default_dragonfly_url() -> String {
    String::from("redis://localhost:6379")
}

const fn default_hot_ttl_secs() -> u64 {
    30 * 60
}

const fn default_cold_ttl_secs() -> u64 {
    2 * 60 * 60
}

const fn default_cache_capacity() -> usize {
    crate::cache::DEFAULT_CAPACITY
}

const fn default_compaction_fraction() -> f64 {
    crate::cache::DEFAULT_COMPACTION_FRACTION
}

const fn default_max_batch_size() -> usize {
    crate::batch::DEFAULT_MAX_BATCH_SIZE
}

const fn default_flush_interval_ms() -> u64 {
    5_000
}

const fn default_warmup_secs() -> u64 {
    5 * 60
}

const fn default_maintenance_interval_secs() -> u64 {
    6 * 60 * 60
}

const fn default_failure_backoff_secs() -> u64 {
    60 * 60
}

const fn default_index_rebuild_days() -> u64 {
    7
}

const fn default_compaction_days() -> u64 {
    30
}

fn default_backup_directory() -> PathBuf {
    PathBuf::from("data/backups")
}

const fn default_backup_interval_secs() -> u64 {
    24 * 60 * 60
}

const fn default_backup_retention_count() -> usize {
    7
}

const fn default_backup_retention_days() -> u32 {
    30
}

const fn default_offline_data_days() -> u64 {
    7
}

const fn default_action_history_days() -> u64 {
    30
}

const fn default_battle_history_days() -> u64 {
    90
}

const fn default_argon2_memory_kib() -> u32 {
    crate::credentials::DEFAULT_MEMORY_KIB
}

const fn default_argon2_iterations() -> u32 {
    crate::credentials::DEFAULT_ITERATIONS
}

const fn default_max_failed_logins() -> u32 {
    crate::credentials::DEFAULT_MAX_FAILED_LOGINS
}

const fn default_lockout_minutes() -> i64 {
    crate::credentials::DEFAULT_LOCKOUT_MINUTES
}

const fn default_login_history_len() -> usize {
    crate::credentials::DEFAULT_LOGIN_HISTORY_LEN
}

fn default_host() -> String {
    String::from("0.0.0.0")
}

const fn default_port() -> u16 {
    8090
}

fn default_log_level() -> String {
    String::from("info")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        let config = StoreConfig::default();
        assert_eq!(config.backend.kind, BackendKind::InMemory);
        assert_eq!(config.cache_ttls(), CacheTtls::default());
        assert_eq!(config.batch_config(), BatchConfig::default());
        assert_eq!(config.maintenance_config(), MaintenanceConfig::default());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn empty_document_uses_defaults() {
        let config = StoreConfig::parse("");
        assert!(config.is_ok_and(|c| c == StoreConfig::default()));
    }

    #[test]
    fn parse_partial_yaml() {
        let yaml = r"
backend:
  kind: sqlite
  url: sqlite::memory:
cache:
  store: dragonfly
  hot_ttl_secs: 60
batch:
  max_batch_size: 10
backup:
  enabled: true
  directory: /var/backups/questvault
  retention_count: 3
";
        let Ok(config) = StoreConfig::parse(yaml) else {
            return;
        };
        assert_eq!(config.backend.kind, BackendKind::Sqlite);
        assert_eq!(config.backend.url, "sqlite::memory:");
        assert_eq!(config.backend.max_connections, 8);
        assert_eq!(config.cache.store, CacheStoreKind::Dragonfly);
        assert_eq!(config.cache_ttls().hot, Duration::from_secs(60));
        assert_eq!(config.cache.cold_ttl_secs, 7_200);
        assert_eq!(config.batch.max_batch_size, 10);
        assert_eq!(config.backup_retention().keep_count, 3);
        assert_eq!(config.maintenance_config().compaction_every, days(30));
    }

    #[test]
    fn shipped_config_parses() {
        let parsed = StoreConfig::parse(include_str!("../../../questvault.yaml"));
        assert!(parsed.is_ok());
        let Ok(config) = parsed else {
            return;
        };
        assert_eq!(config.backend.kind, BackendKind::Sqlite);
        assert!(config.backup.enabled);
        assert_eq!(config.security, SecuritySection::default());
        assert_eq!(config.server.port, 8090);
    }

    #[test]
    fn out_of_range_values_are_rejected() {
        assert!(matches!(
            StoreConfig::parse("cache:\n  compaction_fraction: 1.5\n"),
            Err(ConfigError::Invalid(_))
        ));
        assert!(matches!(
            StoreConfig::parse("batch:\n  max_batch_size: 0\n"),
            Err(ConfigError::Invalid(_))
        ));
        assert!(matches!(StoreConfig::parse("backend: [oops"), Err(ConfigError::Yaml { .. })));
    }

    #[test]
    fn overrides_replace_connection_settings() {
        let mut config = StoreConfig::default();
        let applied = config.apply_overrides(|name| match name {
            "QUESTVAULT_BACKEND" => Some(String::from("SQLite")),
            "QUESTVAULT_DATABASE_URL" => Some(String::from("sqlite://override.db")),
            _ => None,
        });
        assert!(applied.is_ok());
        assert_eq!(config.backend.kind, BackendKind::Sqlite);
        assert_eq!(config.backend.url, "sqlite://override.db");
        assert_eq!(config.cache.dragonfly_url, "redis://localhost:6379");

        let bad = config.apply_overrides(|name| (name == "QUESTVAULT_BACKEND").then(|| String::from("oracle")));
        assert!(matches!(bad, Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn account_policy_builds_from_defaults() {
        let mut config = StoreConfig::default();
        config.security.argon2_memory_kib = 64;
        config.security.argon2_iterations = 1;
        assert!(config.account_policy().is_ok());
    }
}
