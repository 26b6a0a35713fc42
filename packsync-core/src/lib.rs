//! Packsync Core Library
//!
//! Core functionality for the packsync backend:
//! - Blob store for opaque, content-addressed pack bytes
//! - Ref store with compare-and-swap updates
//! - Append-only update log
//! - Synchronization coordinator (batched ref updates, delta chains)
//! - Crash reconciliation and invariant verification
//! - Repository registry keyed by name

pub mod blob;
pub mod coordinator;
pub mod error;
mod meta_db;
pub mod recovery;
pub mod refs;
pub mod registry;
pub mod repository;
pub mod types;
pub mod update_log;

pub use blob::{BlobStore, FsBlobStore, MemoryBlobStore};
pub use coordinator::SyncCoordinator;
pub use error::{Result, SyncError};
pub use meta_db::META_DB_FILE;
pub use recovery::{ReconcileReport, VerifyReport};
pub use refs::{MemoryRefStore, RefStore, SqliteRefStore};
pub use registry::{validate_repo_name, RepositoryRegistry, StorageBackend};
pub use repository::Repository;
pub use types::{
    is_valid_pack_id, pack_id_for, DeltaChain, NewUpdateRecord, PackInfo, RefEntry, RefUpdate,
    UpdateRecord,
};
pub use update_log::{MemoryUpdateLog, SqliteUpdateLog, UpdateLog};
