//! Write-behind outbox for offline mutations.
//!
//! Operations are persisted before anything else happens, then replayed in
//! creation order once the network is back:
//! - Opaque payloads, applied through a host-supplied `ApplyRegistry`
//! - Bounded retries, then dead-lettering
//! - Re-entrancy safe drains

mod apply;
mod operation;
mod queue;

pub use apply::{ApplyFuture, ApplyRegistry};
pub use operation::{OperationStatus, QueuedOperation};
pub use queue::{DeadLetter, DrainReport, Outbox, OutboxConfig};
