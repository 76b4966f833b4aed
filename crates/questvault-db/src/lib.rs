//! Persistence and consistency layer for Questvault.
//!
//! One storage contract ([`StorageBackend`]) with two interchangeable
//! implementations, and the machinery that sits around it in a running
//! process.
//!
//! # Architecture
//!
//! ```text
//! Transport layer
//!     |
//!     +-- GameDataService (ApiResponse envelopes)
//!         |
//!         +-- WriteCoordinator --+   (queued saves, size/timer flush)
//!         |                      |
//!         +----------------------+--> CachedBackend --> CacheStore
//!                                         |              (memory | Dragonfly)
//!                                         +--> MemoryBackend | SqliteBackend
//!
//! MaintenanceScheduler --> optimize / reindex / compact / backup / retention
//! HealthReporter      --> ping + stats under a deadline
//! ```
//!
//! # Modules
//!
//! - [`backend`] -- The storage contract and shared write rules
//! - [`memory`] -- In-process backend with JSON snapshots
//! - [`sqlite`] -- `SQLite` backend via `sqlx`
//! - [`columns`] -- Blob-column encoding for relational rows
//! - [`credentials`] -- Argon2id hashing and login rules
//! - [`cache`] -- Read-through cache tier and its stores
//! - [`batch`] -- Batch write coordinator
//! - [`maintenance`] -- Periodic maintenance scheduler
//! - [`backup`] -- Backup artifacts and retention
//! - [`health`] -- Health and statistics reports
//! - [`service`] -- Envelope-returning inbound facade
//! - [`config`] -- YAML configuration
//! - [`runtime`] -- Process-wide wiring, start and drain
//! - [`error`] -- Shared error types

pub mod backend;
pub mod backup;
pub mod batch;
pub mod cache;
pub mod columns;
pub mod config;
pub mod credentials;
pub mod error;
pub mod health;
pub mod maintenance;
pub mod memory;
pub mod runtime;
pub mod service;
pub mod sqlite;

// Re-export primary types for convenience.
pub use backend::{BattleFilter, MaintenanceOps, StorageBackend};
pub use backup::{BackupManager, RetentionPolicy};
pub use batch::{BatchConfig, PendingWrite, WriteCoordinator};
pub use cache::{CacheStore, CacheTtls, CachedBackend, DragonflyCache, MemoryCache};
pub use config::{ConfigError, StoreConfig};
pub use credentials::{AccountPolicy, CredentialHasher};
pub use error::{StoreError, StoreResult};
pub use health::HealthReporter;
pub use maintenance::{MaintenanceConfig, MaintenanceScheduler, PassReport, RetentionWindows};
pub use memory::{MemoryBackend, MemorySnapshot};
pub use runtime::Runtime;
pub use service::GameDataService;
pub use sqlite::{SqliteBackend, SqliteConfig};
