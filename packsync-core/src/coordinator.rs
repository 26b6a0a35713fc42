//! Synchronization coordinator: the ref update protocol
//!
//! `submit_updates` is all-or-nothing per batch. The CAS check, the ref
//! commit and the log append for one batch run under the repository's
//! exclusive commit gate, so the log order per ref is exactly the order in
//! which batches won the CAS race. Readers take the gate shared and never
//! observe the ref table ahead of the log.

use crate::blob::BlobStore;
use crate::error::{Result, SyncError};
use crate::refs::RefStore;
use crate::types::{
    is_valid_pack_id, DeltaChain, NewUpdateRecord, PackInfo, RefEntry, RefUpdate, UpdateRecord,
};
use crate::update_log::UpdateLog;
use bytes::Bytes;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::RwLock;

pub struct SyncCoordinator {
    pub(crate) blobs: Arc<dyn BlobStore>,
    pub(crate) refs: Arc<dyn RefStore>,
    pub(crate) log: Arc<dyn UpdateLog>,
    pub(crate) gate: RwLock<()>,
}

impl SyncCoordinator {
    pub fn new(
        blobs: Arc<dyn BlobStore>,
        refs: Arc<dyn RefStore>,
        log: Arc<dyn UpdateLog>,
    ) -> Self {
        Self {
            blobs,
            refs,
            log,
            gate: RwLock::new(()),
        }
    }

    pub fn blobs(&self) -> &Arc<dyn BlobStore> {
        &self.blobs
    }

    /// Snapshot of every ref
    pub async fn list_refs(&self) -> Result<Vec<RefEntry>> {
        let _shared = self.gate.read().await;
        self.refs.list().await
    }

    /// Store an opaque pack
    pub async fn upload_pack(&self, data: Bytes) -> Result<PackInfo> {
        self.blobs.put(data).await
    }

    /// Fetch a stored pack verbatim
    pub async fn download_pack(&self, pack_id: &str) -> Result<Bytes> {
        self.blobs.get(pack_id).await
    }

    /// Apply a batch of ref updates atomically.
    ///
    /// Fails with `BadRequest` for malformed items, `NotFound` for unknown
    /// packs and `NonFastForward` when any item's `old_oid` is stale. On
    /// failure nothing is applied and nothing is logged.
    pub async fn submit_updates(&self, batch: Vec<RefUpdate>) -> Result<Vec<UpdateRecord>> {
        validate_batch(&batch)?;

        // Packs are immutable and never deleted, so these checks stay valid
        // once the gate is taken.
        let mut packs = Vec::with_capacity(batch.len());
        for u in &batch {
            let info = self
                .blobs
                .stat(&u.pack_id)
                .await?
                .ok_or_else(|| SyncError::NotFound(format!("pack {}", u.pack_id)))?;
            check_pack_assertions(u, &info)?;
            packs.push(info);
        }

        let _exclusive = self.gate.write().await;

        if let Err(e) = self.refs.apply_batch(&batch).await {
            if let SyncError::NonFastForward { ref name, .. } = e {
                tracing::warn!(ref_name = %name, "rejected non-fast-forward batch");
            }
            return Err(e);
        }

        let timestamp = chrono::Utc::now().timestamp();
        let records: Vec<NewUpdateRecord> = batch
            .iter()
            .zip(&packs)
            .map(|(u, info)| NewUpdateRecord {
                name: u.name.clone(),
                old_oid: u.old_oid.clone(),
                new_oid: u.new_oid.clone(),
                pack_id: u.pack_id.clone(),
                size: info.size,
                sha256: info.sha256.clone(),
                timestamp,
            })
            .collect();

        match self.log.append(records).await {
            Ok(appended) => {
                for r in &appended {
                    tracing::info!(
                        ref_name = %r.name,
                        old = %r.old_oid,
                        new = %r.new_oid,
                        pack = %r.pack_id,
                        seq = r.seq,
                        "ref updated"
                    );
                }
                Ok(appended)
            }
            Err(e) => {
                // Refs are committed but the log is behind; try to repair now,
                // otherwise the next open does it.
                tracing::error!("update log append failed after ref commit: {}", e);
                let report = self.reconcile_locked().await?;
                let names: HashSet<&str> = batch.iter().map(|u| u.name.as_str()).collect();
                Ok(report
                    .appended
                    .into_iter()
                    .filter(|r| names.contains(r.name.as_str()))
                    .collect())
            }
        }
    }

    /// Packs needed to advance `name` from `base` to its current tip.
    ///
    /// An empty `base` means a fresh clone and yields the whole history.
    /// A base that never appears as a record's `old_oid` yields
    /// `BaseNotFound` carrying the current tip.
    pub async fn resolve_delta_chain(&self, name: &str, base: &str) -> Result<DeltaChain> {
        if name.is_empty() {
            return Err(SyncError::BadRequest("ref required".to_string()));
        }
        let _shared = self.gate.read().await;

        let tip = self
            .refs
            .get(name)
            .await?
            .map(|r| r.oid)
            .unwrap_or_default();
        if tip.is_empty() {
            return Ok(DeltaChain::default());
        }
        if base == tip {
            return Ok(DeltaChain {
                packs: Vec::new(),
                final_oid: tip,
            });
        }

        let records = self.log.query_by_ref(name).await?;
        let start = if base.is_empty() {
            0
        } else {
            match records.iter().position(|r| r.old_oid == base) {
                Some(i) => i,
                None => {
                    tracing::debug!(ref_name = %name, %base, "delta base not found");
                    return Err(SyncError::BaseNotFound {
                        name: name.to_string(),
                        base: base.to_string(),
                        final_oid: tip,
                    });
                }
            }
        };

        Ok(DeltaChain {
            packs: records[start..].iter().map(|r| r.pack_id.clone()).collect(),
            final_oid: tip,
        })
    }

    /// Update records for one ref, or for the whole repository
    pub async fn log(&self, name: Option<&str>) -> Result<Vec<UpdateRecord>> {
        let _shared = self.gate.read().await;
        match name {
            Some(name) => self.log.query_by_ref(name).await,
            None => self.log.all().await,
        }
    }
}

fn validate_batch(batch: &[RefUpdate]) -> Result<()> {
    if batch.is_empty() {
        return Err(SyncError::BadRequest("empty update batch".to_string()));
    }
    let mut seen = HashSet::with_capacity(batch.len());
    for u in batch {
        if u.name.is_empty() || u.new_oid.is_empty() || u.pack_id.is_empty() {
            return Err(SyncError::BadRequest(format!(
                "bad update: name, newOid and packId are required (ref '{}')",
                u.name
            )));
        }
        if !is_valid_pack_id(&u.pack_id) {
            return Err(SyncError::BadRequest(format!(
                "malformed pack id: {}",
                u.pack_id
            )));
        }
        if !seen.insert(u.name.as_str()) {
            return Err(SyncError::BadRequest(format!(
                "ref '{}' appears more than once in batch",
                u.name
            )));
        }
    }
    Ok(())
}

fn check_pack_assertions(update: &RefUpdate, info: &PackInfo) -> Result<()> {
    if let Some(size) = update.size {
        if size != info.size {
            return Err(SyncError::BadRequest(format!(
                "size mismatch for {}: claimed {}, stored {}",
                info.pack_id, size, info.size
            )));
        }
    }
    if let Some(ref sha256) = update.sha256 {
        if !sha256.is_empty() && !sha256.eq_ignore_ascii_case(&info.sha256) {
            return Err(SyncError::BadRequest(format!(
                "sha256 mismatch for {}",
                info.pack_id
            )));
        }
    }
    Ok(())
}
