//! Process-wide wiring of the persistence layer.
//!
//! [`Runtime::build`] turns a [`StoreConfig`] into a running stack:
//! backend, optional cache tier in front of it, batch coordinator,
//! maintenance scheduler and health reporter. [`Runtime::start`] spawns
//! the background tasks and [`Runtime::shutdown`] drains them.

use std::path::PathBuf;
use std::sync::Arc;

use questvault_types::{BatchResult, HealthReport};

use crate::backend::StorageBackend;
use crate::backup::BackupManager;
use crate::batch::WriteCoordinator;
use crate::cache::{CacheStore, CachedBackend, DragonflyCache, MemoryCache};
use crate::config::{BackendKind, CacheStoreKind, StoreConfig};
use crate::error::StoreResult;
use crate::health::HealthReporter;
use crate::maintenance::MaintenanceScheduler;
use crate::memory::MemoryBackend;
use crate::service::GameDataService;
use crate::sqlite::SqliteBackend;

/// Backend handle kept for shutdown work specific to the implementation.
enum Primary {
    Memory {
        backend: Arc<MemoryBackend>,
        snapshot: Option<PathBuf>,
    },
    Sqlite(Arc<SqliteBackend>),
}

/// The assembled persistence stack.
pub struct Runtime {
    primary: Primary,
    backend: Arc<dyn StorageBackend>,
    service: GameDataService,
    writes: Option<Arc<WriteCoordinator>>,
    maintenance: Option<Arc<MaintenanceScheduler<dyn StorageBackend>>>,
    health: HealthReporter,
}

impl Runtime {
    /// Build every component named by `config`. Nothing is spawned yet.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Config`](crate::StoreError::Config) for bad
    /// security parameters, [`StoreError::BackendUnavailable`](crate::StoreError::BackendUnavailable)
    /// if the database or cache store cannot be reached, and I/O or
    /// serialization errors when a snapshot cannot be loaded.
    pub async fn build(config: &StoreConfig) -> StoreResult<Self> {
        let policy = config.account_policy()?;

        let (primary, raw): (Primary, Arc<dyn StorageBackend>) = match config.backend.kind {
            BackendKind::InMemory => {
                let snapshot = config.backend.snapshot_path.clone();
                let backend = match &snapshot {
                    Some(path) => MemoryBackend::open(policy, path).await?,
                    None => MemoryBackend::new(policy),
                };
                let backend = Arc::new(backend);
                let raw: Arc<dyn StorageBackend> = backend.clone();
                (Primary::Memory { backend, snapshot }, raw)
            }
            BackendKind::Sqlite => {
                let backend = Arc::new(SqliteBackend::connect(&config.sqlite_config(), policy).await?);
                let raw: Arc<dyn StorageBackend> = backend.clone();
                (Primary::Sqlite(backend), raw)
            }
        };

        let cache: Option<Arc<dyn CacheStore>> = if config.cache.enabled {
            let store: Arc<dyn CacheStore> = match config.cache.store {
                CacheStoreKind::Memory => Arc::new(MemoryCache::new(
                    config.cache.capacity,
                    config.cache.compaction_fraction,
                )),
                CacheStoreKind::Dragonfly => Arc::new(DragonflyCache::connect(&config.cache.dragonfly_url).await?),
            };
            Some(store)
        } else {
            None
        };

        let backend: Arc<dyn StorageBackend> = match &cache {
            Some(store) => Arc::new(CachedBackend::new(raw, Arc::clone(store), config.cache_ttls())),
            None => raw,
        };

        let writes = config
            .batch
            .enabled
            .then(|| Arc::new(WriteCoordinator::new(Arc::clone(&backend), config.batch_config())));

        let maintenance = config.maintenance.enabled.then(|| {
            let backups = config
                .backup
                .enabled
                .then(|| BackupManager::new(config.backup.directory.clone(), config.backup_retention()));
            Arc::new(MaintenanceScheduler::new(
                Arc::clone(&backend),
                config.maintenance_config(),
                backups,
            ))
        });

        let mut service = GameDataService::new(Arc::clone(&backend));
        let mut health = HealthReporter::new(Arc::clone(&backend));
        if let Some(writes) = &writes {
            service = service.with_writes(Arc::clone(writes));
            health = health.with_writes(Arc::clone(writes));
        }
        if let Some(store) = cache {
            health = health.with_cache(store);
        }
        if let Some(maintenance) = &maintenance {
            health = health.with_maintenance(Arc::clone(maintenance));
        }

        tracing::info!(
            backend = backend.kind(),
            cache = config.cache.enabled,
            batch = config.batch.enabled,
            maintenance = config.maintenance.enabled,
            backups = config.backup.enabled,
            "Persistence runtime built"
        );

        Ok(Self {
            primary,
            backend,
            service,
            writes,
            maintenance,
            health,
        })
    }

    /// Spawn the flush timer and the maintenance loop.
    pub fn start(&self) {
        if let Some(writes) = &self.writes {
            writes.start();
        }
        if let Some(maintenance) = &self.maintenance {
            maintenance.start();
        }
    }

    /// The backend requests go to (cached when the cache is enabled).
    pub const fn backend(&self) -> &Arc<dyn StorageBackend> {
        &self.backend
    }

    /// The inbound facade.
    pub const fn service(&self) -> &GameDataService {
        &self.service
    }

    /// The batch coordinator, when enabled.
    pub const fn writes(&self) -> Option<&Arc<WriteCoordinator>> {
        self.writes.as_ref()
    }

    /// The maintenance scheduler, when enabled.
    pub const fn maintenance(&self) -> Option<&Arc<MaintenanceScheduler<dyn StorageBackend>>> {
        self.maintenance.as_ref()
    }

    /// Build a health report.
    pub async fn health(&self) -> HealthReport {
        self.health.report().await
    }

    /// Stop background work and release the backend.
    ///
    /// Order: stop maintenance (interrupting a running pass), drain the
    /// write queues, then save the snapshot or close the pool.
    pub async fn shutdown(&self) -> BatchResult {
        if let Some(maintenance) = &self.maintenance {
            maintenance.stop().await;
        }
        let drained = match &self.writes {
            Some(writes) => writes.shutdown().await,
            None => BatchResult::default(),
        };
        match &self.primary {
            Primary::Memory {
                backend,
                snapshot: Some(path),
            } => {
                if let Err(e) = backend.save_snapshot(path).await {
                    tracing::error!(path = %path.display(), error = %e, "Failed to save in-memory snapshot");
                }
            }
            Primary::Memory { snapshot: None, .. } => {}
            Primary::Sqlite(backend) => backend.close().await,
        }
        tracing::info!(
            flushed = drained.success_count,
            failed = drained.error_count,
            "Persistence runtime shut down"
        );
        drained
    }
}
