//! Queue storage trait and SQLite implementation.

use std::sync::Arc;

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, OptionalExtension, Row};
use tracing::debug;

use super::action::{ActionId, NewAction, QueuedAction};
use crate::db::Database;
use crate::error::{Error, Result};
use crate::http::sanitize::strip_pairs;

/// Trait for durable queue backends.
///
/// Every mutating operation is atomic: a record is either fully written or
/// not at all.
pub trait QueueStore: Send + Sync {
  /// Persist an action and assign it a strictly increasing id.
  fn enqueue(&self, action: &NewAction) -> Result<QueuedAction>;

  /// Oldest record with `after < id <= upto`.
  fn next_after(&self, after: ActionId, upto: ActionId) -> Result<Option<QueuedAction>>;

  /// Highest id currently queued.
  fn max_id(&self) -> Result<Option<ActionId>>;

  /// Delete one record. Removing a missing id is not an error.
  fn remove(&self, id: ActionId) -> Result<()>;

  /// Delete every record, returning how many were removed.
  fn clear(&self) -> Result<usize>;

  fn len(&self) -> Result<usize>;

  /// Delete and return records enqueued before `cutoff`.
  fn purge_expired(&self, cutoff: DateTime<Utc>) -> Result<Vec<QueuedAction>>;

  /// Start a lazy, oldest-first pass over the records queued right now.
  fn drain(&self) -> Result<Drain<'_, Self>>
  where
    Self: Sized,
  {
    Drain::new(self)
  }

  fn is_empty(&self) -> Result<bool> {
    Ok(self.len()? == 0)
  }
}

/// One-shot iterator over queued actions in insertion order.
///
/// Bounded by the highest id present when the drain started, and reads the
/// store afresh on every step, so records removed mid-drain are skipped.
pub struct Drain<'a, Q: QueueStore + ?Sized> {
  store: &'a Q,
  cursor: ActionId,
  upto: Option<ActionId>,
}

impl<'a, Q: QueueStore + ?Sized> Drain<'a, Q> {
  pub fn new(store: &'a Q) -> Result<Self> {
    Ok(Self {
      store,
      cursor: 0,
      upto: store.max_id()?,
    })
  }
}

impl<Q: QueueStore + ?Sized> Iterator for Drain<'_, Q> {
  type Item = Result<QueuedAction>;

  fn next(&mut self) -> Option<Self::Item> {
    let upto = self.upto?;
    match self.store.next_after(self.cursor, upto) {
      Ok(Some(action)) => {
        self.cursor = action.id;
        Some(Ok(action))
      }
      Ok(None) => {
        self.upto = None;
        None
      }
      Err(e) => {
        self.upto = None;
        Some(Err(e))
      }
    }
  }
}

/// SQLite-backed queue.
#[derive(Clone)]
pub struct SqliteQueue {
  db: Arc<Database>,
}

impl SqliteQueue {
  pub fn new(db: Arc<Database>) -> Self {
    Self { db }
  }
}

fn timestamp(at: DateTime<Utc>) -> String {
  // Fixed width so text comparison in SQL orders correctly.
  at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_timestamp(s: &str) -> Result<DateTime<Utc>> {
  DateTime::parse_from_rfc3339(s)
    .map(|dt| dt.with_timezone(&Utc))
    .map_err(|e| Error::StorageUnavailable(format!("bad timestamp '{}': {}", s, e)))
}

/// Raw row, decoded outside the rusqlite callback so JSON errors keep their kind.
struct ActionRow {
  id: ActionId,
  url: String,
  method: String,
  body: Vec<u8>,
  headers: String,
  enqueued_at: String,
}

impl ActionRow {
  const COLUMNS: &'static str = "id, url, method, body, headers, enqueued_at";

  fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
    Ok(Self {
      id: row.get(0)?,
      url: row.get(1)?,
      method: row.get(2)?,
      body: row.get(3)?,
      headers: row.get(4)?,
      enqueued_at: row.get(5)?,
    })
  }

  fn decode(self) -> Result<QueuedAction> {
    let headers: Vec<(String, String)> = serde_json::from_str(&self.headers)?;
    Ok(QueuedAction {
      id: self.id,
      url: self.url,
      method: self.method,
      body: self.body,
      headers,
      enqueued_at: parse_timestamp(&self.enqueued_at)?,
    })
  }
}

impl QueueStore for SqliteQueue {
  fn enqueue(&self, action: &NewAction) -> Result<QueuedAction> {
    // The store re-checks so no caller can persist a credential.
    let headers = strip_pairs(&action.headers);
    let encoded = serde_json::to_string(&headers)?;
    let enqueued_at = Utc::now();

    let id = self.db.write_tx(|tx| {
      tx.execute(
        "INSERT INTO queued_actions (url, method, body, headers, enqueued_at)
         VALUES (?, ?, ?, ?, ?)",
        params![
          action.url,
          action.method,
          action.body,
          encoded,
          timestamp(enqueued_at)
        ],
      )?;
      Ok(tx.last_insert_rowid())
    })?;

    debug!(id, method = %action.method, url = %action.url, "action enqueued");

    Ok(QueuedAction {
      id,
      url: action.url.clone(),
      method: action.method.clone(),
      body: action.body.clone(),
      headers,
      // Round-trip through the stored precision.
      enqueued_at: parse_timestamp(&timestamp(enqueued_at))?,
    })
  }

  fn next_after(&self, after: ActionId, upto: ActionId) -> Result<Option<QueuedAction>> {
    let conn = self.db.lock()?;
    let sql = format!(
      "SELECT {} FROM queued_actions WHERE id > ? AND id <= ? ORDER BY id LIMIT 1",
      ActionRow::COLUMNS
    );
    let row = conn
      .query_row(&sql, params![after, upto], ActionRow::from_row)
      .optional()?;
    drop(conn);

    row.map(ActionRow::decode).transpose()
  }

  fn max_id(&self) -> Result<Option<ActionId>> {
    let conn = self.db.lock()?;
    let id: Option<ActionId> =
      conn.query_row("SELECT MAX(id) FROM queued_actions", [], |row| row.get(0))?;
    Ok(id)
  }

  fn remove(&self, id: ActionId) -> Result<()> {
    self.db.write_tx(|tx| {
      tx.execute("DELETE FROM queued_actions WHERE id = ?", params![id])?;
      Ok(())
    })
  }

  fn clear(&self) -> Result<usize> {
    self
      .db
      .write_tx(|tx| Ok(tx.execute("DELETE FROM queued_actions", [])?))
  }

  fn len(&self) -> Result<usize> {
    let conn = self.db.lock()?;
    let count: i64 = conn.query_row("SELECT COUNT(*) FROM queued_actions", [], |row| row.get(0))?;
    Ok(count as usize)
  }

  fn purge_expired(&self, cutoff: DateTime<Utc>) -> Result<Vec<QueuedAction>> {
    let cutoff = timestamp(cutoff);
    let rows = self.db.write_tx(|tx| {
      let sql = format!(
        "SELECT {} FROM queued_actions WHERE enqueued_at < ? ORDER BY id",
        ActionRow::COLUMNS
      );
      let mut stmt = tx.prepare(&sql)?;
      let rows = stmt
        .query_map(params![cutoff], ActionRow::from_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
      tx.execute(
        "DELETE FROM queued_actions WHERE enqueued_at < ?",
        params![cutoff],
      )?;
      Ok(rows)
    })?;

    rows.into_iter().map(ActionRow::decode).collect()
  }
}
