#![warn(missing_docs)]

//! peersync: active/passive file replication driven by filesystem change events

pub mod config;
pub mod diagnostics;
pub mod error;
pub mod item;
pub mod notify;
pub mod orchestrator;
pub mod role;
pub mod status;
pub mod transfer;

pub use config::{DaemonConfig, TransferConfig};
pub use diagnostics::{dump_watched_paths, WatchRegistry};
pub use error::{Result, SyncError};
pub use item::{load_items, ReplicationItem, RetryPolicy, SyncDirection, SyncTrigger};
pub use notify::NotifySiblingSpec;
pub use orchestrator::{FullSyncPolicy, ItemState, OrchestratorSettings, SyncOrchestrator};
pub use role::{is_eligible, PeerRole, RoleProvider, StaticRoleProvider};
pub use status::{
    FullSyncStatus, JsonStatusStore, MemoryStatusStore, StatusKey, StatusStore, SyncEventsHealth,
    SyncStatus,
};
pub use transfer::{
    copier_from_config, CopyOutcome, CopyRequest, DataCopier, LocalMirrorCopier, RsyncCopier,
};
