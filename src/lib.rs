pub mod client;
pub mod config;
pub mod db;
pub mod error;
pub mod pos;
pub mod replica;
pub mod restore;
pub mod service;

pub use client::{FileReplicaClient, ReplicaClient, SnapshotInfo, WalSegmentInfo};
pub use config::Config;
pub use db::{CheckpointMode, CheckpointResult, Db, DbOptions};
pub use error::{ShadowError, ShadowResult};
pub use pos::{Generation, Pos};
pub use replica::{Replica, ReplicaOptions, ReplicaState, ReplicaStatus};
pub use restore::{restore, RestoreOptions};
pub use service::ReplicationService;
