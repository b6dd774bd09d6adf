//! Durable local replica of server entities.

use serde_json::Value;
use std::sync::Arc;
use tracing::debug;

use super::entity::CachedEntity;
use crate::db::Store;
use crate::error::SyncResult;

/// Entity replica backed by the persistent store.
///
/// Unlike [`ResponseCache`](super::ResponseCache) entries never expire;
/// callers invalidate them after a known change.
pub struct EntityCache<S: Store> {
  store: Arc<S>,
}

impl<S: Store> EntityCache<S> {
  pub fn new(store: Arc<S>) -> Self {
    Self { store }
  }

  /// Write an entity. Overwrites bump `version`.
  pub fn put(&self, entity_type: &str, entity_id: &str, data: &Value) -> SyncResult<CachedEntity> {
    let entity = self.store.put_entity(entity_type, entity_id, data)?;
    debug!(id = %entity.id, version = entity.version, "cached entity");
    Ok(entity)
  }

  /// Write every object in `data` (a single object or an array of them),
  /// keyed by its `id_field`. Objects without a string or numeric id are
  /// skipped. Returns how many were written.
  pub fn put_all(&self, entity_type: &str, id_field: &str, data: &Value) -> SyncResult<usize> {
    let items = match data {
      Value::Array(items) => items.as_slice(),
      other => std::slice::from_ref(other),
    };

    let mut written = 0;
    for item in items {
      let entity_id = match item.get(id_field) {
        Some(Value::String(id)) => id.clone(),
        Some(Value::Number(id)) => id.to_string(),
        _ => {
          debug!(entity_type, id_field, "skipping entity without id");
          continue;
        }
      };
      self.put(entity_type, &entity_id, item)?;
      written += 1;
    }
    Ok(written)
  }

  pub fn get(&self, entity_type: &str, entity_id: &str) -> SyncResult<Option<CachedEntity>> {
    self
      .store
      .get_entity(&CachedEntity::compose_id(entity_type, entity_id))
  }

  pub fn list(&self, entity_type: &str) -> SyncResult<Vec<CachedEntity>> {
    self.store.list_entities(entity_type)
  }

  /// Drop one entity. Returns whether it existed.
  pub fn invalidate(&self, entity_type: &str, entity_id: &str) -> SyncResult<bool> {
    self
      .store
      .delete_entity(&CachedEntity::compose_id(entity_type, entity_id))
  }

  /// Drop every entity of a type, or all entities.
  pub fn clear(&self, entity_type: Option<&str>) -> SyncResult<usize> {
    let removed = self.store.clear_entities(entity_type)?;
    debug!(removed, entity_type = entity_type.unwrap_or("*"), "cleared entities");
    Ok(removed)
  }
}

impl<S: Store> Clone for EntityCache<S> {
  fn clone(&self) -> Self {
    Self {
      store: Arc::clone(&self.store),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::db::SqliteStore;
  use serde_json::json;

  fn entities() -> EntityCache<SqliteStore> {
    EntityCache::new(Arc::new(SqliteStore::open_in_memory().unwrap()))
  }

  #[test]
  fn test_put_all_keys_by_id_field() {
    let cache = entities();
    let response = json!([
      {"sku": "A1", "qty": 3},
      {"sku": 42, "qty": 1},
      {"qty": 9},
      "not an object"
    ]);

    assert_eq!(cache.put_all("product", "sku", &response).unwrap(), 2);
    assert_eq!(cache.get("product", "A1").unwrap().unwrap().data["qty"], 3);
    assert!(cache.get("product", "42").unwrap().is_some());
    assert_eq!(cache.list("product").unwrap().len(), 2);

    assert_eq!(cache.put_all("customer", "id", &json!({"id": "7"})).unwrap(), 1);
    assert_eq!(cache.get("customer", "7").unwrap().unwrap().version, 1);
  }

  #[test]
  fn test_put_get_invalidate() {
    let cache = entities();
    cache.put("customer", "9", &json!({"name": "Ada"})).unwrap();

    let loaded = cache.get("customer", "9").unwrap().unwrap();
    assert_eq!(loaded.id, "customer_9");
    assert_eq!(loaded.entity_type, "customer");
    assert_eq!(loaded.data, json!({"name": "Ada"}));

    assert!(cache.invalidate("customer", "9").unwrap());
    assert!(cache.get("customer", "9").unwrap().is_none());
  }

  #[test]
  fn test_clear_only_touches_one_type() {
    let cache = entities();
    cache.put("product", "1", &json!({})).unwrap();
    cache.put("product", "2", &json!({})).unwrap();
    cache.put("supplier", "1", &json!({})).unwrap();

    assert_eq!(cache.clear(Some("product")).unwrap(), 2);
    assert!(cache.list("product").unwrap().is_empty());
    assert_eq!(cache.list("supplier").unwrap().len(), 1);
  }
}
