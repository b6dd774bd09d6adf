//! Offline resilience for REST clients.
//!
//! - `cache`: TTL response cache with request de-duplication, plus a durable
//!   entity replica
//! - `outbox`: durable write-behind queue replayed with bounded retries
//! - `connectivity`: online/offline edge detection
//! - `sync`: `SyncEngine`, which ties them together for the host application

pub mod cache;
pub mod config;
pub mod connectivity;
pub mod db;
pub mod error;
pub mod http;
pub mod outbox;
pub mod sync;

pub use error::{NetworkError, SyncError, SyncResult};
pub use sync::{EngineConfig, SyncEngine};
