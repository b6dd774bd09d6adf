//! Locally replicated entity record.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A server entity kept on device until explicitly invalidated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachedEntity {
  /// `{type}_{entity_id}`
  pub id: String,
  #[serde(rename = "type")]
  pub entity_type: String,
  pub data: Value,
  /// Last write time in milliseconds since the Unix epoch
  pub timestamp: i64,
  pub version: i64,
}

impl CachedEntity {
  /// Compose the primary key for an entity of `entity_type`.
  pub fn compose_id(entity_type: &str, entity_id: &str) -> String {
    format!("{}_{}", entity_type, entity_id)
  }
}
