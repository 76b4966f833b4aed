//! Backup artifacts and their retention.
//!
//! Backends write the artifact itself ([`MaintenanceOps::create_backup`]);
//! this module owns naming, listing and pruning. Artifacts are named
//! `questvault-<UTC timestamp>.<ext>` so listing order does not depend
//! on filesystem metadata.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Duration, NaiveDateTime, Utc};

use crate::backend::MaintenanceOps;
use crate::error::StoreResult;

/// File name prefix of every artifact.
pub const ARTIFACT_PREFIX: &str = "questvault-";

const TIMESTAMP_FORMAT: &str = "%Y%m%dT%H%M%S%3fZ";

/// Path of a new artifact in `dir` for a backup taken at `at`.
pub fn artifact_path(dir: &Path, extension: &str, at: DateTime<Utc>) -> PathBuf {
    dir.join(format!("{ARTIFACT_PREFIX}{}.{extension}", at.format(TIMESTAMP_FORMAT)))
}

/// Timestamp encoded in an artifact file name, if it is one.
fn artifact_time(path: &Path) -> Option<DateTime<Utc>> {
    if path.extension().is_some_and(|e| e == "tmp") {
        return None;
    }
    let name = path.file_name()?.to_str()?;
    let stamp = name.strip_prefix(ARTIFACT_PREFIX)?.split('.').next()?;
    NaiveDateTime::parse_from_str(stamp, TIMESTAMP_FORMAT)
        .ok()
        .map(|t| t.and_utc())
}

/// One backup on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupArtifact {
    /// Location of the file.
    pub path: PathBuf,
    /// When the backup was taken.
    pub created_at: DateTime<Utc>,
    /// File size.
    pub size_bytes: u64,
}

/// How many backups to keep and for how long.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetentionPolicy {
    /// Newest artifacts always kept (older ones beyond this are deleted).
    pub keep_count: usize,
    /// Artifacts older than this are deleted regardless of count.
    pub max_age: Duration,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            keep_count: 7,
            max_age: Duration::days(30),
        }
    }
}

/// Creates, lists and prunes backups in one directory.
#[derive(Debug, Clone)]
pub struct BackupManager {
    dir: PathBuf,
    retention: RetentionPolicy,
}

impl BackupManager {
    /// Manage backups under `dir`.
    pub const fn new(dir: PathBuf, retention: RetentionPolicy) -> Self {
        Self { dir, retention }
    }

    /// Backup directory.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Ask `backend` for a new artifact in the backup directory.
    ///
    /// # Errors
    ///
    /// Propagates the backend's failure; nothing is pruned in that case.
    pub async fn create<M>(&self, backend: &M) -> StoreResult<BackupArtifact>
    where
        M: MaintenanceOps + ?Sized,
    {
        tokio::fs::create_dir_all(&self.dir).await?;
        let path = backend.create_backup(&self.dir).await?;
        let size_bytes = tokio::fs::metadata(&path).await.map(|m| m.len()).unwrap_or(0);
        let created_at = artifact_time(&path).unwrap_or_else(Utc::now);
        tracing::info!(
            path = %path.display(),
            size_bytes,
            backend = backend.kind(),
            "Backup created"
        );
        Ok(BackupArtifact {
            path,
            created_at,
            size_bytes,
        })
    }

    /// Artifacts in the directory, newest first. A missing directory is empty.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Io`](crate::StoreError::Io) if the directory
    /// cannot be read.
    pub async fn list(&self) -> StoreResult<Vec<BackupArtifact>> {
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut artifacts = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let Some(created_at) = artifact_time(&path) else {
                continue;
            };
            let size_bytes = entry.metadata().await.map(|m| m.len()).unwrap_or(0);
            artifacts.push(BackupArtifact {
                path,
                created_at,
                size_bytes,
            });
        }
        artifacts.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| b.path.cmp(&a.path)));
        Ok(artifacts)
    }

    /// Delete artifacts beyond the keep count or older than the max age.
    ///
    /// Returns the deleted paths. Running it twice in a row deletes
    /// nothing the second time.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Io`](crate::StoreError::Io) if listing or a
    /// deletion fails.
    pub async fn prune(&self, now: DateTime<Utc>) -> StoreResult<Vec<PathBuf>> {
        let cutoff = now.checked_sub_signed(self.retention.max_age).unwrap_or(DateTime::<Utc>::MIN_UTC);
        let mut deleted = Vec::new();
        for (index, artifact) in self.list().await?.into_iter().enumerate() {
            if index >= self.retention.keep_count || artifact.created_at < cutoff {
                tokio::fs::remove_file(&artifact.path).await?;
                tracing::info!(path = %artifact.path.display(), "Pruned backup");
                deleted.push(artifact.path);
            }
        }
        Ok(deleted)
    }
}
