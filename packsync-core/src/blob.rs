//! Blob store for opaque pack bytes
//!
//! Packs are never decoded. Identity policy: content addressed,
//! `raw-<sha256>.pack`, and re-uploading identical bytes is idempotent
//! (same id, one stored copy). Once published a pack never changes and is
//! never deleted by this crate.

use crate::error::{Result, SyncError};
use crate::types::{is_valid_pack_id, pack_id_for, PackInfo, PACK_ID_PREFIX, PACK_ID_SUFFIX};
use async_trait::async_trait;
use bytes::Bytes;
use lru::LruCache;
use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tokio::io::AsyncWriteExt;
use tokio::sync::RwLock;

/// Default number of pack metadata entries kept in memory
pub const DEFAULT_INFO_CACHE_SIZE: usize = 4096;

/// Content-addressed pack storage
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Store bytes durably and return their pack metadata
    async fn put(&self, data: Bytes) -> Result<PackInfo>;

    /// Get pack bytes verbatim, `NotFound` if the id is unknown
    async fn get(&self, pack_id: &str) -> Result<Bytes>;

    /// Metadata of a stored pack, `None` if the id is unknown
    async fn stat(&self, pack_id: &str) -> Result<Option<PackInfo>>;

    /// Check if a pack exists
    async fn exists(&self, pack_id: &str) -> Result<bool> {
        Ok(self.stat(pack_id).await?.is_some())
    }

    /// List every stored pack
    async fn list(&self) -> Result<Vec<PackInfo>>;
}

fn check_pack_id(pack_id: &str) -> Result<()> {
    if is_valid_pack_id(pack_id) {
        Ok(())
    } else {
        Err(SyncError::BadRequest(format!("malformed pack id: {}", pack_id)))
    }
}

fn sha256_of(pack_id: &str) -> String {
    pack_id
        .trim_start_matches(PACK_ID_PREFIX)
        .trim_end_matches(PACK_ID_SUFFIX)
        .to_string()
}

/// Pack store on the local filesystem
///
/// Layout:
/// ```text
/// {dir}/raw-<sha256>.pack   published packs
/// {dir}/tmp/<uuid>.tmp      uploads being written
/// ```
pub struct FsBlobStore {
    dir: PathBuf,
    info_cache: Mutex<LruCache<String, PackInfo>>,
}

impl FsBlobStore {
    /// Open or create a pack directory
    pub fn open(dir: &Path) -> Result<Self> {
        Self::with_cache_size(dir, DEFAULT_INFO_CACHE_SIZE)
    }

    pub fn with_cache_size(dir: &Path, cache_size: usize) -> Result<Self> {
        std::fs::create_dir_all(dir.join("tmp"))?;
        let capacity = NonZeroUsize::new(cache_size).unwrap_or(NonZeroUsize::MIN);
        Ok(Self {
            dir: dir.to_path_buf(),
            info_cache: Mutex::new(LruCache::new(capacity)),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn pack_path(&self, pack_id: &str) -> PathBuf {
        self.dir.join(pack_id)
    }

    fn cached(&self, pack_id: &str) -> Option<PackInfo> {
        self.info_cache
            .lock()
            .ok()
            .and_then(|mut cache| cache.get(pack_id).cloned())
    }

    fn remember(&self, info: &PackInfo) {
        if let Ok(mut cache) = self.info_cache.lock() {
            cache.put(info.pack_id.clone(), info.clone());
        }
    }
}

#[async_trait]
impl BlobStore for FsBlobStore {
    async fn put(&self, data: Bytes) -> Result<PackInfo> {
        let (pack_id, sha256) = pack_id_for(&data);
        let info = PackInfo {
            pack_id: pack_id.clone(),
            sha256,
            size: data.len() as u64,
        };

        let path = self.pack_path(&pack_id);
        if tokio::fs::try_exists(&path).await? {
            tracing::debug!(pack = %pack_id, "pack already stored");
            self.remember(&info);
            return Ok(info);
        }

        // Write-then-publish: the id only becomes visible after the rename.
        let tmp_path = self
            .dir
            .join("tmp")
            .join(format!("{}.tmp", uuid::Uuid::new_v4()));
        let mut file = tokio::fs::File::create(&tmp_path).await?;
        let written = async {
            file.write_all(&data).await?;
            file.sync_all().await
        }
        .await;
        drop(file);
        if let Err(e) = written {
            let _ = tokio::fs::remove_file(&tmp_path).await;
            return Err(e.into());
        }
        if let Err(e) = tokio::fs::rename(&tmp_path, &path).await {
            let _ = tokio::fs::remove_file(&tmp_path).await;
            return Err(e.into());
        }

        tracing::info!(pack = %pack_id, size = info.size, "pack stored");
        self.remember(&info);
        Ok(info)
    }

    async fn get(&self, pack_id: &str) -> Result<Bytes> {
        check_pack_id(pack_id)?;
        match tokio::fs::read(self.pack_path(pack_id)).await {
            Ok(data) => Ok(Bytes::from(data)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(SyncError::NotFound(format!("pack {}", pack_id)))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn stat(&self, pack_id: &str) -> Result<Option<PackInfo>> {
        check_pack_id(pack_id)?;
        if let Some(info) = self.cached(pack_id) {
            return Ok(Some(info));
        }
        match tokio::fs::metadata(self.pack_path(pack_id)).await {
            Ok(meta) => {
                let info = PackInfo {
                    pack_id: pack_id.to_string(),
                    sha256: sha256_of(pack_id),
                    size: meta.len(),
                };
                self.remember(&info);
                Ok(Some(info))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn list(&self) -> Result<Vec<PackInfo>> {
        let mut packs = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().to_string();
            if !is_valid_pack_id(&name) {
                continue;
            }
            let meta = entry.metadata().await?;
            packs.push(PackInfo {
                sha256: sha256_of(&name),
                pack_id: name,
                size: meta.len(),
            });
        }
        packs.sort_by(|a, b| a.pack_id.cmp(&b.pack_id));
        Ok(packs)
    }
}

/// In-memory pack store
#[derive(Default)]
pub struct MemoryBlobStore {
    packs: RwLock<HashMap<String, Bytes>>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn put(&self, data: Bytes) -> Result<PackInfo> {
        let (pack_id, sha256) = pack_id_for(&data);
        let size = data.len() as u64;
        self.packs
            .write()
            .await
            .entry(pack_id.clone())
            .or_insert(data);
        Ok(PackInfo {
            pack_id,
            sha256,
            size,
        })
    }

    async fn get(&self, pack_id: &str) -> Result<Bytes> {
        check_pack_id(pack_id)?;
        self.packs
            .read()
            .await
            .get(pack_id)
            .cloned()
            .ok_or_else(|| SyncError::NotFound(format!("pack {}", pack_id)))
    }

    async fn stat(&self, pack_id: &str) -> Result<Option<PackInfo>> {
        check_pack_id(pack_id)?;
        Ok(self.packs.read().await.get(pack_id).map(|data| PackInfo {
            pack_id: pack_id.to_string(),
            sha256: sha256_of(pack_id),
            size: data.len() as u64,
        }))
    }

    async fn list(&self) -> Result<Vec<PackInfo>> {
        let packs = self.packs.read().await;
        let mut out: Vec<PackInfo> = packs
            .iter()
            .map(|(id, data)| PackInfo {
                pack_id: id.clone(),
                sha256: sha256_of(id),
                size: data.len() as u64,
            })
            .collect();
        out.sort_by(|a, b| a.pack_id.cmp(&b.pack_id));
        Ok(out)
    }
}
