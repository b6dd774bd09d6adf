//! Durable storage for queued operations and the local entity replica.

pub mod schema;

use chrono::Utc;
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use crate::cache::CachedEntity;
use crate::error::{SyncError, SyncResult};
use crate::outbox::{OperationStatus, QueuedOperation};

/// Trait for storage backends.
///
/// Two disjoint tables addressed by `id`: queued operations (owned by the
/// outbox) and cached entities (owned by the entity replica).
pub trait Store: Send + Sync {
  /// Insert a new operation.
  fn insert_operation(&self, op: &QueuedOperation) -> SyncResult<()>;

  /// Overwrite an existing operation. Returns false if it no longer exists.
  fn update_operation(&self, op: &QueuedOperation) -> SyncResult<bool>;

  fn get_operation(&self, id: &str) -> SyncResult<Option<QueuedOperation>>;

  fn delete_operation(&self, id: &str) -> SyncResult<bool>;

  /// All operations in replay order.
  fn list_operations(&self) -> SyncResult<Vec<QueuedOperation>>;

  /// Operations of one type in replay order.
  fn list_operations_by_type(&self, op_type: &str) -> SyncResult<Vec<QueuedOperation>>;

  fn count_operations(&self) -> SyncResult<usize>;

  /// Remove operations of one type, or all of them.
  fn clear_operations(&self, op_type: Option<&str>) -> SyncResult<usize>;

  /// Upsert an entity, bumping its version on overwrite.
  fn put_entity(&self, entity_type: &str, entity_id: &str, data: &Value)
    -> SyncResult<CachedEntity>;

  fn get_entity(&self, id: &str) -> SyncResult<Option<CachedEntity>>;

  fn list_entities(&self, entity_type: &str) -> SyncResult<Vec<CachedEntity>>;

  fn delete_entity(&self, id: &str) -> SyncResult<bool>;

  /// Remove entities of one type, or all of them.
  fn clear_entities(&self, entity_type: Option<&str>) -> SyncResult<usize>;
}

/// SQLite-based storage implementation.
pub struct SqliteStore {
  conn: Mutex<Connection>,
}

impl SqliteStore {
  /// Open the store at the default location.
  pub fn open() -> SyncResult<Self> {
    let path = Self::default_path().ok_or_else(|| {
      std::io::Error::new(
        std::io::ErrorKind::NotFound,
        "Could not determine data directory",
      )
    })?;
    Self::open_at(&path)
  }

  /// Open or create the store at `path`.
  pub fn open_at(path: &Path) -> SyncResult<Self> {
    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
      if !parent.as_os_str().is_empty() {
        std::fs::create_dir_all(parent)?;
      }
    }

    let conn = Connection::open(path)?;
    Self::from_connection(conn)
  }

  /// Open a throwaway in-memory store.
  pub fn open_in_memory() -> SyncResult<Self> {
    Self::from_connection(Connection::open_in_memory()?)
  }

  fn from_connection(conn: Connection) -> SyncResult<Self> {
    conn.execute_batch(schema::SCHEMA)?;
    Ok(Self {
      conn: Mutex::new(conn),
    })
  }

  /// Get the default database path.
  pub fn default_path() -> Option<PathBuf> {
    let data_dir = dirs::data_dir().or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))?;
    Some(data_dir.join("offsync").join("offsync.db"))
  }

  fn conn(&self) -> SyncResult<MutexGuard<'_, Connection>> {
    self
      .conn
      .lock()
      .map_err(|e| SyncError::LockPoisoned(e.to_string()))
  }
}

const OPERATION_COLUMNS: &str = "id, op_type, payload, timestamp, retries, status, last_error";

const ENTITY_COLUMNS: &str = "id, entity_type, data, timestamp, version";

impl Store for SqliteStore {
  fn insert_operation(&self, op: &QueuedOperation) -> SyncResult<()> {
    let conn = self.conn()?;
    let payload = serde_json::to_string(&op.payload)?;

    conn.execute(
      "INSERT INTO queued_operations (id, op_type, payload, timestamp, retries, status, last_error)
       VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
      params![
        op.id,
        op.op_type,
        payload,
        op.timestamp,
        op.retries,
        op.status.as_str(),
        op.last_error,
      ],
    )?;

    Ok(())
  }

  fn update_operation(&self, op: &QueuedOperation) -> SyncResult<bool> {
    let conn = self.conn()?;
    let payload = serde_json::to_string(&op.payload)?;

    let rows = conn.execute(
      "UPDATE queued_operations
       SET op_type = ?1, payload = ?2, retries = ?3, status = ?4, last_error = ?5
       WHERE id = ?6",
      params![
        op.op_type,
        payload,
        op.retries,
        op.status.as_str(),
        op.last_error,
        op.id,
      ],
    )?;

    Ok(rows > 0)
  }

  fn get_operation(&self, id: &str) -> SyncResult<Option<QueuedOperation>> {
    let conn = self.conn()?;
    let sql = format!("SELECT {} FROM queued_operations WHERE id = ?1", OPERATION_COLUMNS);

    let op = conn
      .query_row(&sql, params![id], row_to_operation)
      .optional()?;

    Ok(op)
  }

  fn delete_operation(&self, id: &str) -> SyncResult<bool> {
    let conn = self.conn()?;
    let rows = conn.execute("DELETE FROM queued_operations WHERE id = ?1", params![id])?;
    Ok(rows > 0)
  }

  fn list_operations(&self) -> SyncResult<Vec<QueuedOperation>> {
    let conn = self.conn()?;
    let sql = format!(
      "SELECT {} FROM queued_operations ORDER BY timestamp ASC, rowid ASC",
      OPERATION_COLUMNS
    );

    let mut stmt = conn.prepare(&sql)?;
    let ops = stmt
      .query_map([], row_to_operation)?
      .collect::<Result<Vec<_>, _>>()?;

    Ok(ops)
  }

  fn list_operations_by_type(&self, op_type: &str) -> SyncResult<Vec<QueuedOperation>> {
    let conn = self.conn()?;
    let sql = format!(
      "SELECT {} FROM queued_operations WHERE op_type = ?1 ORDER BY timestamp ASC, rowid ASC",
      OPERATION_COLUMNS
    );

    let mut stmt = conn.prepare(&sql)?;
    let ops = stmt
      .query_map(params![op_type], row_to_operation)?
      .collect::<Result<Vec<_>, _>>()?;

    Ok(ops)
  }

  fn count_operations(&self) -> SyncResult<usize> {
    let conn = self.conn()?;
    let count: i64 = conn.query_row("SELECT COUNT(*) FROM queued_operations", [], |row| {
      row.get(0)
    })?;
    Ok(count as usize)
  }

  fn clear_operations(&self, op_type: Option<&str>) -> SyncResult<usize> {
    let conn = self.conn()?;
    let rows = match op_type {
      Some(t) => conn.execute("DELETE FROM queued_operations WHERE op_type = ?1", params![t])?,
      None => conn.execute("DELETE FROM queued_operations", [])?,
    };
    Ok(rows)
  }

  fn put_entity(
    &self,
    entity_type: &str,
    entity_id: &str,
    data: &Value,
  ) -> SyncResult<CachedEntity> {
    let conn = self.conn()?;
    let id = CachedEntity::compose_id(entity_type, entity_id);
    let encoded = serde_json::to_string(data)?;
    let now = Utc::now().timestamp_millis();

    conn.execute(
      "INSERT INTO cached_entities (id, entity_type, data, timestamp, version)
       VALUES (?1, ?2, ?3, ?4, 1)
       ON CONFLICT(id) DO UPDATE SET
         data = excluded.data,
         timestamp = excluded.timestamp,
         version = cached_entities.version + 1",
      params![id, entity_type, encoded, now],
    )?;

    let sql = format!("SELECT {} FROM cached_entities WHERE id = ?1", ENTITY_COLUMNS);
    let entity = conn.query_row(&sql, params![id], row_to_entity)?;

    Ok(entity)
  }

  fn get_entity(&self, id: &str) -> SyncResult<Option<CachedEntity>> {
    let conn = self.conn()?;
    let sql = format!("SELECT {} FROM cached_entities WHERE id = ?1", ENTITY_COLUMNS);

    let entity = conn
      .query_row(&sql, params![id], row_to_entity)
      .optional()?;

    Ok(entity)
  }

  fn list_entities(&self, entity_type: &str) -> SyncResult<Vec<CachedEntity>> {
    let conn = self.conn()?;
    let sql = format!(
      "SELECT {} FROM cached_entities WHERE entity_type = ?1 ORDER BY id",
      ENTITY_COLUMNS
    );

    let mut stmt = conn.prepare(&sql)?;
    let entities = stmt
      .query_map(params![entity_type], row_to_entity)?
      .collect::<Result<Vec<_>, _>>()?;

    Ok(entities)
  }

  fn delete_entity(&self, id: &str) -> SyncResult<bool> {
    let conn = self.conn()?;
    let rows = conn.execute("DELETE FROM cached_entities WHERE id = ?1", params![id])?;
    Ok(rows > 0)
  }

  fn clear_entities(&self, entity_type: Option<&str>) -> SyncResult<usize> {
    let conn = self.conn()?;
    let rows = match entity_type {
      Some(t) => conn.execute(
        "DELETE FROM cached_entities WHERE entity_type = ?1",
        params![t],
      )?,
      None => conn.execute("DELETE FROM cached_entities", [])?,
    };
    Ok(rows)
  }
}

fn parse_json(row: &Row<'_>, idx: usize) -> rusqlite::Result<Value> {
  let raw: String = row.get(idx)?;
  serde_json::from_str(&raw)
    .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn row_to_operation(row: &Row<'_>) -> rusqlite::Result<QueuedOperation> {
  let status: String = row.get(5)?;

  Ok(QueuedOperation {
    id: row.get(0)?,
    op_type: row.get(1)?,
    payload: parse_json(row, 2)?,
    timestamp: row.get(3)?,
    retries: row.get(4)?,
    status: OperationStatus::parse(&status),
    last_error: row.get(6)?,
  })
}

fn row_to_entity(row: &Row<'_>) -> rusqlite::Result<CachedEntity> {
  Ok(CachedEntity {
    id: row.get(0)?,
    entity_type: row.get(1)?,
    data: parse_json(row, 2)?,
    timestamp: row.get(3)?,
    version: row.get(4)?,
  })
}
