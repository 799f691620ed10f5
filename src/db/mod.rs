pub mod schema;

use rusqlite::{params, Connection, OptionalExtension, Transaction, TransactionBehavior};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use crate::error::{Error, Result};

/// How long a writer waits on a lock held by another process.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Shared SQLite handle for the queue, the caches and worker metadata.
pub struct Database {
  conn: Mutex<Connection>,
}

impl Database {
  /// Open or create the database at `path`.
  pub fn open(path: &Path) -> Result<Self> {
    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent).map_err(|e| {
        Error::StorageUnavailable(format!("failed to create {}: {}", parent.display(), e))
      })?;
    }

    let conn = Connection::open(path).map_err(|e| {
      Error::StorageUnavailable(format!("failed to open {}: {}", path.display(), e))
    })?;
    conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get::<_, String>(0))?;

    Self::init(conn)
  }

  /// Private, process-local database.
  pub fn open_in_memory() -> Result<Self> {
    Self::init(Connection::open_in_memory()?)
  }

  fn init(conn: Connection) -> Result<Self> {
    conn.busy_timeout(BUSY_TIMEOUT)?;
    conn.pragma_update(None, "foreign_keys", "ON")?;
    let db = Self {
      conn: Mutex::new(conn),
    };
    db.run_migrations()?;
    Ok(db)
  }

  /// Get the default database path
  pub fn default_path() -> Result<PathBuf> {
    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| Error::StorageUnavailable("could not determine data directory".into()))?;

    Ok(data_dir.join("offline-relay").join("relay.db"))
  }

  /// Run database migrations
  fn run_migrations(&self) -> Result<()> {
    self
      .lock()?
      .execute_batch(schema::SCHEMA)
      .map_err(|e| Error::StorageUnavailable(format!("failed to run migrations: {}", e)))?;
    Ok(())
  }

  pub fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
    self
      .conn
      .lock()
      .map_err(|e| Error::StorageUnavailable(format!("lock poisoned: {}", e)))
  }

  /// Run `f` inside an IMMEDIATE transaction so concurrent processes
  /// serialize on the write lock; commits only if `f` succeeds.
  pub fn write_tx<T, F>(&self, f: F) -> Result<T>
  where
    F: FnOnce(&Transaction<'_>) -> Result<T>,
  {
    let mut conn = self.lock()?;
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    let result = f(&tx)?;
    tx.commit()?;
    Ok(result)
  }

  pub fn get_meta(&self, key: &str) -> Result<Option<String>> {
    let conn = self.lock()?;
    let value = conn
      .query_row(
        "SELECT value FROM worker_meta WHERE key = ?",
        params![key],
        |row| row.get(0),
      )
      .optional()?;
    Ok(value)
  }

  pub fn set_meta(&self, key: &str, value: &str) -> Result<()> {
    self.lock()?.execute(
      "INSERT OR REPLACE INTO worker_meta (key, value) VALUES (?, ?)",
      params![key, value],
    )?;
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_meta_roundtrip_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("nested").join("relay.db");

    let db = Database::open(&path).unwrap();
    assert_eq!(db.get_meta("active_generation").unwrap(), None);
    db.set_meta("active_generation", "v1").unwrap();
    drop(db);

    let db = Database::open(&path).unwrap();
    assert_eq!(
      db.get_meta("active_generation").unwrap().as_deref(),
      Some("v1")
    );
  }

  #[test]
  fn test_write_tx_rolls_back_on_error() {
    let db = Database::open_in_memory().unwrap();
    let result: Result<()> = db.write_tx(|tx| {
      tx.execute(
        "INSERT INTO worker_meta (key, value) VALUES ('k', 'v')",
        [],
      )?;
      Err(Error::InvalidRequest("abort".into()))
    });
    assert!(result.is_err());
    assert_eq!(db.get_meta("k").unwrap(), None);
  }
}
