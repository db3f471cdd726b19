//! Replication to external destinations
//!
//! - `transport`: segment envelope and upload/download of WAL parts
//! - `snapshot`: full database copies and retention
//! - `retention`: pluggable retention strategies
//! - `worker`: the per-destination sync engine

pub mod retention;
pub mod snapshot;
pub mod transport;
pub mod worker;

pub use retention::{KeepAll, KeepLast, MaxAge, RetentionPolicy};
pub use snapshot::SnapshotManager;
pub use transport::SegmentTransport;
pub use worker::{backoff_delay, Replica, ReplicaOptions, ReplicaState, ReplicaStatus};
