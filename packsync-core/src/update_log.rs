//! Append-only log of accepted ref transitions
//!
//! Insertion order is the authoritative history. `query_by_ref` returns a
//! ref's records oldest first, in exactly the order they were appended.

use crate::error::{Result, SyncError};
use crate::meta_db::{lock_conn, open_meta_db};
use crate::types::{NewUpdateRecord, UpdateRecord};
use async_trait::async_trait;
use rusqlite::{params, Connection, Row, TransactionBehavior};
use std::path::Path;
use std::sync::Mutex;
use tokio::sync::RwLock;

#[async_trait]
pub trait UpdateLog: Send + Sync {
    /// Append records in the given order; returns them with their sequence numbers
    async fn append(&self, records: Vec<NewUpdateRecord>) -> Result<Vec<UpdateRecord>>;

    /// Records for one ref, oldest first
    async fn query_by_ref(&self, name: &str) -> Result<Vec<UpdateRecord>>;

    /// Every record, oldest first
    async fn all(&self) -> Result<Vec<UpdateRecord>>;

    /// Most recent record for one ref
    async fn last_for_ref(&self, name: &str) -> Result<Option<UpdateRecord>> {
        Ok(self.query_by_ref(name).await?.pop())
    }
}

/// SQLite-backed update log (table `updates` in the metadata database)
pub struct SqliteUpdateLog {
    conn: Mutex<Connection>,
}

impl SqliteUpdateLog {
    pub fn open(db_path: &Path) -> Result<Self> {
        Ok(Self {
            conn: Mutex::new(open_meta_db(db_path)?),
        })
    }
}

fn record_from_row(row: &Row<'_>) -> rusqlite::Result<UpdateRecord> {
    Ok(UpdateRecord {
        seq: row.get::<_, i64>(0)? as u64,
        name: row.get(1)?,
        old_oid: row.get(2)?,
        new_oid: row.get(3)?,
        pack_id: row.get(4)?,
        size: row.get::<_, i64>(5)? as u64,
        sha256: row.get(6)?,
        timestamp: row.get(7)?,
    })
}

const SELECT_RECORD: &str =
    "SELECT seq, name, old_oid, new_oid, pack_id, size, sha256, timestamp FROM updates";

#[async_trait]
impl UpdateLog for SqliteUpdateLog {
    async fn append(&self, records: Vec<NewUpdateRecord>) -> Result<Vec<UpdateRecord>> {
        let mut conn = lock_conn(&self.conn)?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let mut appended = Vec::with_capacity(records.len());
        for r in records {
            let size = i64::try_from(r.size)
                .map_err(|_| SyncError::Storage(format!("pack size {} out of range", r.size)))?;
            tx.execute(
                "INSERT INTO updates (name, old_oid, new_oid, pack_id, size, sha256, timestamp) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![r.name, r.old_oid, r.new_oid, r.pack_id, size, r.sha256, r.timestamp],
            )?;
            let seq = tx.last_insert_rowid() as u64;
            appended.push(r.into_record(seq));
        }
        tx.commit()?;
        Ok(appended)
    }

    async fn query_by_ref(&self, name: &str) -> Result<Vec<UpdateRecord>> {
        let conn = lock_conn(&self.conn)?;
        let mut stmt = conn.prepare(&format!("{} WHERE name = ?1 ORDER BY seq", SELECT_RECORD))?;
        let rows = stmt.query_map(params![name], record_from_row)?;
        Ok(rows.collect::<std::result::Result<Vec<_>, _>>()?)
    }

    async fn all(&self) -> Result<Vec<UpdateRecord>> {
        let conn = lock_conn(&self.conn)?;
        let mut stmt = conn.prepare(&format!("{} ORDER BY seq", SELECT_RECORD))?;
        let rows = stmt.query_map([], record_from_row)?;
        Ok(rows.collect::<std::result::Result<Vec<_>, _>>()?)
    }
}

/// In-memory update log
#[derive(Default)]
pub struct MemoryUpdateLog {
    records: RwLock<Vec<UpdateRecord>>,
}

impl MemoryUpdateLog {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl UpdateLog for MemoryUpdateLog {
    async fn append(&self, records: Vec<NewUpdateRecord>) -> Result<Vec<UpdateRecord>> {
        let mut log = self.records.write().await;
        let mut appended = Vec::with_capacity(records.len());
        for r in records {
            let record = r.into_record(log.len() as u64 + 1);
            log.push(record.clone());
            appended.push(record);
        }
        Ok(appended)
    }

    async fn query_by_ref(&self, name: &str) -> Result<Vec<UpdateRecord>> {
        Ok(self
            .records
            .read()
            .await
            .iter()
            .filter(|r| r.name == name)
            .cloned()
            .collect())
    }

    async fn all(&self) -> Result<Vec<UpdateRecord>> {
        Ok(self.records.read().await.clone())
    }
}
