//! Repository: one blob namespace, one ref table and one update log
//!
//! Layout on disk:
//! ```text
//! {root}/
//!   uuid                 repository UUID
//!   packs/raw-*.pack     published packs
//!   packs/tmp/           uploads in flight
//!   meta.sqlite          ref table + update log
//! ```

use crate::blob::{FsBlobStore, MemoryBlobStore};
use crate::coordinator::SyncCoordinator;
use crate::error::{Result, SyncError};
use crate::meta_db::META_DB_FILE;
use crate::recovery::ReconcileReport;
use crate::refs::{MemoryRefStore, SqliteRefStore};
use crate::update_log::{MemoryUpdateLog, SqliteUpdateLog};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

pub struct Repository {
    uuid: String,
    root: Option<PathBuf>,
    coordinator: SyncCoordinator,
}

impl Repository {
    /// Open (or create) a disk repository and reconcile its stores.
    pub async fn open(root: &Path) -> Result<Self> {
        let repo = Self::open_without_recovery(root)?;
        let report = repo.coordinator.reconcile().await?;
        if !report.is_clean() {
            tracing::warn!(
                root = %root.display(),
                appended = report.appended.len(),
                restored = report.restored.len(),
                "repository repaired on open"
            );
        }
        Ok(repo)
    }

    /// Open a disk repository without running reconciliation
    pub fn open_without_recovery(root: &Path) -> Result<Self> {
        fs::create_dir_all(root)?;
        let uuid = load_or_create_uuid(root)?;
        let db_path = root.join(META_DB_FILE);

        let coordinator = SyncCoordinator::new(
            Arc::new(FsBlobStore::open(&root.join("packs"))?),
            Arc::new(SqliteRefStore::open(&db_path)?),
            Arc::new(SqliteUpdateLog::open(&db_path)?),
        );
        tracing::debug!(root = %root.display(), %uuid, "repository opened");

        Ok(Self {
            uuid,
            root: Some(root.to_path_buf()),
            coordinator,
        })
    }

    /// Open an already initialized disk repository without reconciling.
    ///
    /// Unlike `open_without_recovery` this never creates anything, so a
    /// mistyped path is an error instead of a fresh empty repository.
    pub fn open_existing(root: &Path) -> Result<Self> {
        if !root.join("uuid").is_file() || !root.join(META_DB_FILE).is_file() {
            return Err(SyncError::NotFound(format!(
                "no repository at {}",
                root.display()
            )));
        }
        Self::open_without_recovery(root)
    }

    /// A repository that lives only as long as the process
    pub fn in_memory() -> Self {
        Self {
            uuid: uuid::Uuid::new_v4().to_string(),
            root: None,
            coordinator: SyncCoordinator::new(
                Arc::new(MemoryBlobStore::new()),
                Arc::new(MemoryRefStore::new()),
                Arc::new(MemoryUpdateLog::new()),
            ),
        }
    }

    pub fn uuid(&self) -> &str {
        &self.uuid
    }

    /// Directory of a disk repository, `None` when in memory
    pub fn root(&self) -> Option<&Path> {
        self.root.as_deref()
    }

    pub fn coordinator(&self) -> &SyncCoordinator {
        &self.coordinator
    }

    pub async fn reconcile(&self) -> Result<ReconcileReport> {
        self.coordinator.reconcile().await
    }
}

fn load_or_create_uuid(root: &Path) -> Result<String> {
    let path = root.join("uuid");
    if path.exists() {
        return Ok(fs::read_to_string(&path)?.trim().to_string());
    }
    let uuid = uuid::Uuid::new_v4().to_string();
    let tmp = path.with_extension("tmp");
    fs::write(&tmp, &uuid)?;
    fs::rename(&tmp, &path)?;
    Ok(uuid)
}
