/// Schema for the outbox and entity replica tables.
pub const SCHEMA: &str = r#"
-- Pending mutations, replayed in (timestamp, rowid) order
CREATE TABLE IF NOT EXISTS queued_operations (
    id TEXT PRIMARY KEY,
    op_type TEXT NOT NULL,
    payload TEXT NOT NULL,
    timestamp INTEGER NOT NULL,
    retries INTEGER NOT NULL DEFAULT 0,
    status TEXT NOT NULL DEFAULT 'pending',
    last_error TEXT
);

CREATE INDEX IF NOT EXISTS idx_queued_operations_order
    ON queued_operations(timestamp);

CREATE INDEX IF NOT EXISTS idx_queued_operations_type
    ON queued_operations(op_type);

-- Local read replica, invalidated explicitly
CREATE TABLE IF NOT EXISTS cached_entities (
    id TEXT PRIMARY KEY,
    entity_type TEXT NOT NULL,
    data TEXT NOT NULL,
    timestamp INTEGER NOT NULL,
    version INTEGER NOT NULL DEFAULT 1
);

CREATE INDEX IF NOT EXISTS idx_cached_entities_type
    ON cached_entities(entity_type);
"#;
