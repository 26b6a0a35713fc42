//! SQLite metadata database shared by the ref table and the update log

use crate::error::{Result, SyncError};
use rusqlite::Connection;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

/// File name of the metadata database inside a repository directory
pub const META_DB_FILE: &str = "meta.sqlite";

/// Open (and create if needed) the metadata database at `path`.
pub(crate) fn open_meta_db(path: &Path) -> Result<Connection> {
    let conn = Connection::open(path)?;
    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.pragma_update(None, "synchronous", "FULL")?;
    conn.busy_timeout(Duration::from_secs(5))?;
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS refs (
            name TEXT PRIMARY KEY,
            oid TEXT NOT NULL,
            pack_id TEXT NOT NULL
        ) WITHOUT ROWID;
        CREATE TABLE IF NOT EXISTS updates (
            seq INTEGER PRIMARY KEY AUTOINCREMENT,
            name TEXT NOT NULL,
            old_oid TEXT NOT NULL,
            new_oid TEXT NOT NULL,
            pack_id TEXT NOT NULL,
            size INTEGER NOT NULL,
            sha256 TEXT NOT NULL,
            timestamp INTEGER NOT NULL
        );
        CREATE INDEX IF NOT EXISTS updates_by_name ON updates (name, seq);",
    )?;
    Ok(conn)
}

pub(crate) fn lock_conn(conn: &Mutex<Connection>) -> Result<MutexGuard<'_, Connection>> {
    conn.lock()
        .map_err(|_| SyncError::Storage("metadata connection lock poisoned".to_string()))
}
