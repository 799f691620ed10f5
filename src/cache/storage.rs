//! Cache storage trait and SQLite implementation.

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, OptionalExtension, Row, Transaction};
use std::sync::Arc;

use super::traits::CachedResponse;
use crate::db::Database;
use crate::error::{Error, Result};

/// Trait for cache storage backends.
///
/// Storage is dumb: it does not decide what may be cached. That policy lives
/// in [`CacheManager`](super::CacheManager), the only writer.
pub trait CacheStorage: Send + Sync {
  /// Create the named cache if it does not exist.
  fn open_cache(&self, name: &str) -> Result<()>;

  /// Names of every existing cache.
  fn cache_names(&self) -> Result<Vec<String>>;

  /// Delete a cache and all its entries. Returns whether it existed.
  fn delete_cache(&self, name: &str) -> Result<bool>;

  /// Get a single entry.
  fn get(&self, name: &str, key: &str) -> Result<Option<CachedResponse>>;

  /// Store a single entry, creating the cache if needed.
  fn put(&self, name: &str, key: &str, entry: &CachedResponse) -> Result<()>;

  /// Store several entries in one transaction: all or none.
  fn put_all(&self, name: &str, entries: &[(String, CachedResponse)]) -> Result<()>;

  /// All entries of a cache, ordered by URL.
  fn entries(&self, name: &str) -> Result<Vec<CachedResponse>>;
}

/// SQLite-based cache storage implementation.
#[derive(Clone)]
pub struct SqliteStorage {
  db: Arc<Database>,
}

impl SqliteStorage {
  pub fn new(db: Arc<Database>) -> Self {
    Self { db }
  }
}

fn timestamp(at: DateTime<Utc>) -> String {
  at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Parse a stored RFC 3339 timestamp.
fn parse_datetime(s: &str) -> Result<DateTime<Utc>> {
  DateTime::parse_from_rfc3339(s)
    .map(|dt| dt.with_timezone(&Utc))
    .map_err(|e| Error::StorageUnavailable(format!("failed to parse datetime '{}': {}", s, e)))
}

struct EntryRow {
  url: String,
  method: String,
  status: u16,
  headers: String,
  body: Vec<u8>,
  cached_at: String,
}

impl EntryRow {
  const COLUMNS: &'static str = "url, method, status, headers, body, cached_at";

  fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
    Ok(Self {
      url: row.get(0)?,
      method: row.get(1)?,
      status: row.get(2)?,
      headers: row.get(3)?,
      body: row.get(4)?,
      cached_at: row.get(5)?,
    })
  }

  fn decode(self) -> Result<CachedResponse> {
    Ok(CachedResponse {
      url: self.url,
      method: self.method,
      status: self.status,
      headers: serde_json::from_str(&self.headers)?,
      body: self.body,
      cached_at: parse_datetime(&self.cached_at)?,
    })
  }
}

fn ensure_cache(tx: &Transaction<'_>, name: &str) -> Result<()> {
  tx.execute(
    "INSERT OR IGNORE INTO cache_names (name, created_at) VALUES (?, ?)",
    params![name, timestamp(Utc::now())],
  )?;
  Ok(())
}

fn insert_entry(tx: &Transaction<'_>, name: &str, key: &str, entry: &CachedResponse) -> Result<()> {
  let headers = serde_json::to_string(&entry.headers)?;
  tx.execute(
    "INSERT OR REPLACE INTO cache_entries
       (cache_name, request_key, url, method, status, headers, body, cached_at)
     VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
    params![
      name,
      key,
      entry.url,
      entry.method,
      entry.status,
      headers,
      entry.body,
      timestamp(entry.cached_at)
    ],
  )?;
  Ok(())
}

impl CacheStorage for SqliteStorage {
  fn open_cache(&self, name: &str) -> Result<()> {
    self.db.write_tx(|tx| ensure_cache(tx, name))
  }

  fn cache_names(&self) -> Result<Vec<String>> {
    let conn = self.db.lock()?;
    let mut stmt = conn.prepare("SELECT name FROM cache_names ORDER BY name")?;
    let names = stmt
      .query_map([], |row| row.get(0))?
      .collect::<rusqlite::Result<Vec<String>>>()?;
    Ok(names)
  }

  fn delete_cache(&self, name: &str) -> Result<bool> {
    self.db.write_tx(|tx| {
      tx.execute(
        "DELETE FROM cache_entries WHERE cache_name = ?",
        params![name],
      )?;
      let deleted = tx.execute("DELETE FROM cache_names WHERE name = ?", params![name])?;
      Ok(deleted > 0)
    })
  }

  fn get(&self, name: &str, key: &str) -> Result<Option<CachedResponse>> {
    let conn = self.db.lock()?;
    let sql = format!(
      "SELECT {} FROM cache_entries WHERE cache_name = ? AND request_key = ?",
      EntryRow::COLUMNS
    );
    let row = conn
      .query_row(&sql, params![name, key], EntryRow::from_row)
      .optional()?;
    drop(conn);

    row.map(EntryRow::decode).transpose()
  }

  fn put(&self, name: &str, key: &str, entry: &CachedResponse) -> Result<()> {
    self.db.write_tx(|tx| {
      ensure_cache(tx, name)?;
      insert_entry(tx, name, key, entry)
    })
  }

  fn put_all(&self, name: &str, entries: &[(String, CachedResponse)]) -> Result<()> {
    self.db.write_tx(|tx| {
      ensure_cache(tx, name)?;
      for (key, entry) in entries {
        insert_entry(tx, name, key, entry)?;
      }
      Ok(())
    })
  }

  fn entries(&self, name: &str) -> Result<Vec<CachedResponse>> {
    let conn = self.db.lock()?;
    let sql = format!(
      "SELECT {} FROM cache_entries WHERE cache_name = ? ORDER BY url",
      EntryRow::COLUMNS
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
      .query_map(params![name], EntryRow::from_row)?
      .collect::<rusqlite::Result<Vec<_>>>()?;
    drop(stmt);
    drop(conn);

    rows.into_iter().map(EntryRow::decode).collect()
  }
}
