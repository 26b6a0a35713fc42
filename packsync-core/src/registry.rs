//! Repository registry
//!
//! Maps repository names to independently locked repositories, creating
//! them lazily on first access.

use crate::error::{Result, SyncError};
use crate::repository::Repository;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{OnceCell, RwLock};

/// Maximum repository name length
pub const MAX_REPO_NAME_LEN: usize = 128;

/// Where repositories keep their state
#[derive(Debug, Clone)]
pub enum StorageBackend {
    /// One directory per repository under this root
    Disk(PathBuf),
    /// Process-local, lost on exit
    Memory,
}

/// A repository slot; opened at most once, outside the map lock
type Slot = Arc<OnceCell<Arc<Repository>>>;

pub struct RepositoryRegistry {
    backend: StorageBackend,
    repositories: RwLock<HashMap<String, Slot>>,
}

/// Repository names: `[A-Za-z0-9][A-Za-z0-9._-]*`, at most 128 chars.
pub fn validate_repo_name(name: &str) -> Result<()> {
    let mut bytes = name.bytes();
    let valid = match bytes.next() {
        Some(first) if first.is_ascii_alphanumeric() => {
            name.len() <= MAX_REPO_NAME_LEN
                && bytes.all(|b| b.is_ascii_alphanumeric() || matches!(b, b'.' | b'_' | b'-'))
        }
        _ => false,
    };
    if valid {
        Ok(())
    } else {
        Err(SyncError::BadRequest(format!(
            "invalid repository name: '{}'",
            name
        )))
    }
}

impl RepositoryRegistry {
    pub fn new(backend: StorageBackend) -> Self {
        Self {
            backend,
            repositories: RwLock::new(HashMap::new()),
        }
    }

    pub fn in_memory() -> Self {
        Self::new(StorageBackend::Memory)
    }

    pub fn backend(&self) -> &StorageBackend {
        &self.backend
    }

    /// Get a repository, creating it on first reference.
    ///
    /// The map lock only guards slot insertion; opening (disk I/O and
    /// reconciliation) runs on the slot, so other repositories stay
    /// available meanwhile.
    pub async fn get_or_open(&self, name: &str) -> Result<Arc<Repository>> {
        validate_repo_name(name)?;

        let existing = self.repositories.read().await.get(name).cloned();
        let slot = match existing {
            Some(slot) => slot,
            None => self
                .repositories
                .write()
                .await
                .entry(name.to_string())
                .or_default()
                .clone(),
        };

        let repo = slot
            .get_or_try_init(|| async {
                let repo = match &self.backend {
                    StorageBackend::Disk(root) => Repository::open(&root.join(name)).await?,
                    StorageBackend::Memory => Repository::in_memory(),
                };
                tracing::info!(repo = %name, uuid = %repo.uuid(), "repository registered");
                Ok::<_, SyncError>(Arc::new(repo))
            })
            .await?;
        Ok(repo.clone())
    }

    /// Get an already opened repository
    pub async fn get(&self, name: &str) -> Option<Arc<Repository>> {
        self.repositories
            .read()
            .await
            .get(name)
            .and_then(|slot| slot.get().cloned())
    }

    /// Names of opened repositories, sorted
    pub async fn list(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .repositories
            .read()
            .await
            .iter()
            .filter(|(_, slot)| slot.initialized())
            .map(|(name, _)| name.clone())
            .collect();
        names.sort();
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::RefUpdate;
    use bytes::Bytes;
    use tempfile::TempDir;

    #[test]
    fn test_repo_name_validation() {
        for ok in ["repo", "my-repo.git", "A_1", "x"] {
            assert!(validate_repo_name(ok).is_ok(), "{}", ok);
        }
        for bad in ["", ".hidden", "../etc", "a/b", "-x", "sp ace", &"a".repeat(129)] {
            assert!(validate_repo_name(bad).is_err(), "{}", bad);
        }
    }

    #[tokio::test]
    async fn test_lazy_creation_returns_same_instance() {
        let registry = RepositoryRegistry::in_memory();
        assert!(registry.get("alpha").await.is_none());

        let a1 = registry.get_or_open("alpha").await.unwrap();
        let a2 = registry.get_or_open("alpha").await.unwrap();
        assert!(Arc::ptr_eq(&a1, &a2));
        assert_eq!(registry.list().await, vec!["alpha"]);
    }

    #[tokio::test]
    async fn test_repositories_are_isolated() {
        let registry = RepositoryRegistry::in_memory();
        let alpha = registry.get_or_open("alpha").await.unwrap();
        let beta = registry.get_or_open("beta").await.unwrap();

        let info = alpha
            .coordinator()
            .upload_pack(Bytes::from_static(b"only in alpha"))
            .await
            .unwrap();
        alpha
            .coordinator()
            .submit_updates(vec![RefUpdate::new("main", "", "A", info.pack_id.clone())])
            .await
            .unwrap();

        assert!(beta.coordinator().list_refs().await.unwrap().is_empty());
        assert!(beta.coordinator().download_pack(&info.pack_id).await.is_err());
    }

    #[tokio::test]
    async fn test_disk_backend_creates_directory() {
        let tmp = TempDir::new().unwrap();
        let registry = RepositoryRegistry::new(StorageBackend::Disk(tmp.path().to_path_buf()));
        registry.get_or_open("proj").await.unwrap();
        assert!(tmp.path().join("proj").join("meta.sqlite").exists());
    }

    #[tokio::test]
    async fn test_concurrent_first_access_opens_once() {
        let tmp = TempDir::new().unwrap();
        let registry = Arc::new(RepositoryRegistry::new(StorageBackend::Disk(
            tmp.path().to_path_buf(),
        )));

        let mut handles = Vec::new();
        for i in 0..8 {
            let registry = registry.clone();
            let name = if i % 2 == 0 { "shared" } else { "other" };
            handles.push(tokio::spawn(async move {
                registry.get_or_open(name).await.unwrap()
            }));
        }
        let mut shared = Vec::new();
        for (i, handle) in handles.into_iter().enumerate() {
            let repo = handle.await.unwrap();
            if i % 2 == 0 {
                shared.push(repo);
            }
        }
        assert!(shared.windows(2).all(|w| Arc::ptr_eq(&w[0], &w[1])));
        assert_eq!(registry.list().await, vec!["other", "shared"]);
    }

    #[tokio::test]
    async fn test_failed_open_is_not_listed_and_can_retry() {
        let tmp = TempDir::new().unwrap();
        // A plain file where the repository directory should go.
        std::fs::write(tmp.path().join("blocked"), b"x").unwrap();
        let registry = RepositoryRegistry::new(StorageBackend::Disk(tmp.path().to_path_buf()));

        assert!(registry.get_or_open("blocked").await.is_err());
        assert!(registry.get("blocked").await.is_none());
        assert!(registry.list().await.is_empty());

        registry.get_or_open("fine").await.unwrap();

        std::fs::remove_file(tmp.path().join("blocked")).unwrap();
        registry.get_or_open("blocked").await.unwrap();
        assert_eq!(registry.list().await, vec!["blocked", "fine"]);
    }
}
