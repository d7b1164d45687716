//! Partitioned SQLite bootstrap shared by EI, UF, AQ, and LS.
//!
//! §9's redesign flag: "SQLite used as a monolithic everything store — keep
//! it, but partition logically by owner… no component reaches across
//! partitions." Each owner gets its own `rusqlite::Connection` guarded by a
//! `parking_lot::Mutex` (single-writer discipline), grounded on
//! `signals::db_storage`'s WAL-mode pragma preamble, generalized from one
//! inline schema blob to a numbered migration list since four independent
//! partitions now share this bootstrap.

use parking_lot::Mutex;
use rusqlite::Connection;
use std::path::Path;
use std::sync::Arc;

/// A single-writer SQLite partition. Cloning shares the same connection.
#[derive(Clone)]
pub struct Partition {
    conn: Arc<Mutex<Connection>>,
}

impl Partition {
    pub fn open(path: impl AsRef<Path>, migrations: &[&str]) -> rusqlite::Result<Self> {
        let conn = Connection::open(path)?;
        Self::bootstrap(&conn, migrations)?;
        Ok(Partition {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn open_in_memory(migrations: &[&str]) -> rusqlite::Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::bootstrap(&conn, migrations)?;
        Ok(Partition {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn bootstrap(conn: &Connection, migrations: &[&str]) -> rusqlite::Result<()> {
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;
             PRAGMA foreign_keys = ON;
             CREATE TABLE IF NOT EXISTS schema_version (version INTEGER NOT NULL);",
        )?;
        let current: i64 = conn
            .query_row("SELECT COALESCE(MAX(version), 0) FROM schema_version", [], |r| r.get(0))
            .unwrap_or(0);
        for (idx, migration) in migrations.iter().enumerate() {
            let version = (idx + 1) as i64;
            if version <= current {
                continue;
            }
            conn.execute_batch(migration)?;
            conn.execute(
                "INSERT INTO schema_version (version) VALUES (?1)",
                [version],
            )?;
        }
        Ok(())
    }

    /// Run a closure with exclusive access to the connection. All reads and
    /// writes in this crate go through this single entry point per partition,
    /// enforcing the single-writer discipline called for in §9.
    pub fn with<T>(&self, f: impl FnOnce(&Connection) -> rusqlite::Result<T>) -> rusqlite::Result<T> {
        let guard = self.conn.lock();
        f(&guard)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn migrations_apply_once_and_are_idempotent_on_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.db");
        let migrations = ["CREATE TABLE t (id INTEGER PRIMARY KEY);"];
        let p1 = Partition::open(&path, &migrations).unwrap();
        drop(p1);
        // Re-opening must not re-run the CREATE TABLE (would error if it did
        // without IF NOT EXISTS, but we also check schema_version directly).
        let p2 = Partition::open(&path, &migrations).unwrap();
        let version: i64 = p2
            .with(|c| c.query_row("SELECT MAX(version) FROM schema_version", [], |r| r.get(0)))
            .unwrap();
        assert_eq!(version, 1);
    }
}
