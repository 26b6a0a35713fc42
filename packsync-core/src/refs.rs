//! Ref store: ref name -> (oid, producing pack id)
//!
//! The only mutation is compare-and-swap. A batch validates every
//! precondition first and then commits all rows in one transaction, so a
//! single failing item leaves every ref in the batch untouched.

use crate::error::{Result, SyncError};
use crate::meta_db::{lock_conn, open_meta_db};
use crate::types::{RefEntry, RefUpdate};
use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Mutex;
use tokio::sync::RwLock;

/// Durable, linearizable ref table
#[async_trait]
pub trait RefStore: Send + Sync {
    /// Snapshot of every ref, ordered by name
    async fn list(&self) -> Result<Vec<RefEntry>>;

    /// Current state of one ref
    async fn get(&self, name: &str) -> Result<Option<RefEntry>>;

    /// Set `name` to `new_oid` only if it currently points at `expected_oid`
    /// (empty means "must not exist yet"); `NonFastForward` otherwise.
    async fn compare_and_swap(
        &self,
        name: &str,
        expected_oid: &str,
        new_oid: &str,
        pack_id: &str,
    ) -> Result<()>;

    /// Check-then-commit for a whole batch: all items apply or none do.
    async fn apply_batch(&self, updates: &[RefUpdate]) -> Result<()>;
}

fn check_precondition(name: &str, expected: &str, current: Option<&str>) -> Result<()> {
    let actual = current.unwrap_or("");
    if actual == expected {
        Ok(())
    } else {
        Err(SyncError::NonFastForward {
            name: name.to_string(),
            expected: expected.to_string(),
            actual: actual.to_string(),
        })
    }
}

/// SQLite-backed ref store (table `refs` in the metadata database)
pub struct SqliteRefStore {
    conn: Mutex<Connection>,
}

impl SqliteRefStore {
    pub fn open(db_path: &Path) -> Result<Self> {
        Ok(Self {
            conn: Mutex::new(open_meta_db(db_path)?),
        })
    }
}

fn current_oid(conn: &Connection, name: &str) -> Result<Option<String>> {
    Ok(conn
        .query_row("SELECT oid FROM refs WHERE name = ?1", params![name], |row| {
            row.get(0)
        })
        .optional()?)
}

fn upsert_ref(conn: &Connection, name: &str, oid: &str, pack_id: &str) -> Result<()> {
    conn.execute(
        "INSERT INTO refs (name, oid, pack_id) VALUES (?1, ?2, ?3) \
         ON CONFLICT(name) DO UPDATE SET oid = excluded.oid, pack_id = excluded.pack_id",
        params![name, oid, pack_id],
    )?;
    Ok(())
}

#[async_trait]
impl RefStore for SqliteRefStore {
    async fn list(&self) -> Result<Vec<RefEntry>> {
        let conn = lock_conn(&self.conn)?;
        let mut stmt = conn.prepare("SELECT name, oid, pack_id FROM refs ORDER BY name")?;
        let rows = stmt.query_map([], |row| {
            Ok(RefEntry {
                name: row.get(0)?,
                oid: row.get(1)?,
                pack_id: row.get(2)?,
            })
        })?;
        Ok(rows.collect::<std::result::Result<Vec<_>, _>>()?)
    }

    async fn get(&self, name: &str) -> Result<Option<RefEntry>> {
        let conn = lock_conn(&self.conn)?;
        Ok(conn
            .query_row(
                "SELECT name, oid, pack_id FROM refs WHERE name = ?1",
                params![name],
                |row| {
                    Ok(RefEntry {
                        name: row.get(0)?,
                        oid: row.get(1)?,
                        pack_id: row.get(2)?,
                    })
                },
            )
            .optional()?)
    }

    async fn compare_and_swap(
        &self,
        name: &str,
        expected_oid: &str,
        new_oid: &str,
        pack_id: &str,
    ) -> Result<()> {
        let mut conn = lock_conn(&self.conn)?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let current = current_oid(&tx, name)?;
        check_precondition(name, expected_oid, current.as_deref())?;
        upsert_ref(&tx, name, new_oid, pack_id)?;
        tx.commit()?;
        Ok(())
    }

    async fn apply_batch(&self, updates: &[RefUpdate]) -> Result<()> {
        let mut conn = lock_conn(&self.conn)?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        for u in updates {
            let current = current_oid(&tx, &u.name)?;
            check_precondition(&u.name, &u.old_oid, current.as_deref())?;
        }
        for u in updates {
            upsert_ref(&tx, &u.name, &u.new_oid, &u.pack_id)?;
        }
        tx.commit()?;
        Ok(())
    }
}

/// In-memory ref store
#[derive(Default)]
pub struct MemoryRefStore {
    refs: RwLock<BTreeMap<String, RefEntry>>,
}

impl MemoryRefStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RefStore for MemoryRefStore {
    async fn list(&self) -> Result<Vec<RefEntry>> {
        Ok(self.refs.read().await.values().cloned().collect())
    }

    async fn get(&self, name: &str) -> Result<Option<RefEntry>> {
        Ok(self.refs.read().await.get(name).cloned())
    }

    async fn compare_and_swap(
        &self,
        name: &str,
        expected_oid: &str,
        new_oid: &str,
        pack_id: &str,
    ) -> Result<()> {
        let mut refs = self.refs.write().await;
        check_precondition(name, expected_oid, refs.get(name).map(|r| r.oid.as_str()))?;
        refs.insert(
            name.to_string(),
            RefEntry {
                name: name.to_string(),
                oid: new_oid.to_string(),
                pack_id: pack_id.to_string(),
            },
        );
        Ok(())
    }

    async fn apply_batch(&self, updates: &[RefUpdate]) -> Result<()> {
        let mut refs = self.refs.write().await;
        for u in updates {
            check_precondition(&u.name, &u.old_oid, refs.get(&u.name).map(|r| r.oid.as_str()))?;
        }
        for u in updates {
            refs.insert(
                u.name.clone(),
                RefEntry {
                    name: u.name.clone(),
                    oid: u.new_oid.clone(),
                    pack_id: u.pack_id.clone(),
                },
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn sqlite_store(tmp: &TempDir) -> SqliteRefStore {
        SqliteRefStore::open(&tmp.path().join("meta.sqlite")).unwrap()
    }

    async fn exercise_cas(store: &dyn RefStore) {
        assert!(store.get("main").await.unwrap().is_none());

        store.compare_and_swap("main", "", "A", "p1").await.unwrap();
        let entry = store.get("main").await.unwrap().unwrap();
        assert_eq!(entry.oid, "A");
        assert_eq!(entry.pack_id, "p1");

        // Creating again must fail: the ref already exists.
        let err = store.compare_and_swap("main", "", "B", "p2").await.unwrap_err();
        assert!(matches!(err, SyncError::NonFastForward { ref actual, .. } if actual == "A"));

        store.compare_and_swap("main", "A", "B", "p2").await.unwrap();
        assert_eq!(store.get("main").await.unwrap().unwrap().oid, "B");
    }

    async fn exercise_batch_atomicity(store: &dyn RefStore) {
        store.compare_and_swap("main", "", "A", "p1").await.unwrap();

        let batch = vec![
            RefUpdate::new("feature", "", "F1", "p2"),
            RefUpdate::new("main", "stale", "B", "p3"),
        ];
        let err = store.apply_batch(&batch).await.unwrap_err();
        assert!(matches!(err, SyncError::NonFastForward { .. }));

        assert!(store.get("feature").await.unwrap().is_none());
        assert_eq!(store.get("main").await.unwrap().unwrap().oid, "A");

        let batch = vec![
            RefUpdate::new("feature", "", "F1", "p2"),
            RefUpdate::new("main", "A", "B", "p3"),
        ];
        store.apply_batch(&batch).await.unwrap();
        let names: Vec<String> = store.list().await.unwrap().into_iter().map(|r| r.name).collect();
        assert_eq!(names, vec!["feature", "main"]);
    }

    #[tokio::test]
    async fn test_memory_cas() {
        exercise_cas(&MemoryRefStore::new()).await;
    }

    #[tokio::test]
    async fn test_sqlite_cas() {
        let tmp = TempDir::new().unwrap();
        exercise_cas(&sqlite_store(&tmp)).await;
    }

    #[tokio::test]
    async fn test_memory_batch_atomicity() {
        exercise_batch_atomicity(&MemoryRefStore::new()).await;
    }

    #[tokio::test]
    async fn test_sqlite_batch_atomicity() {
        let tmp = TempDir::new().unwrap();
        exercise_batch_atomicity(&sqlite_store(&tmp)).await;
    }

    #[tokio::test]
    async fn test_sqlite_refs_survive_reopen() {
        let tmp = TempDir::new().unwrap();
        {
            let store = sqlite_store(&tmp);
            store.compare_and_swap("main", "", "A", "p1").await.unwrap();
        }
        let store = sqlite_store(&tmp);
        assert_eq!(store.get("main").await.unwrap().unwrap().oid, "A");
    }

    #[tokio::test]
    async fn test_concurrent_cas_single_winner() {
        let store = Arc::new(MemoryRefStore::new());
        let mut handles = Vec::new();
        for i in 0..16 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store
                    .compare_and_swap("main", "", &format!("oid-{}", i), "p")
                    .await
                    .is_ok()
            }));
        }
        let mut winners = 0;
        for h in handles {
            if h.await.unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
    }
}
