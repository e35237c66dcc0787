pub mod action_log;
pub mod error;
pub mod job;
pub mod pruner;
pub mod registry;
pub mod resolver;
pub mod scanner;
pub mod transfer;
pub mod usage;

pub use action_log::{format_size, ActionEntry, ActionLog, PruneLogEntry, PruneReason};
pub use error::{SyncError, SyncResult};
pub use job::{
    ItemState, JobItem, JobKind, JobManager, JobRequest, JobSnapshot, JobState, ProgressObserver,
    SharedSettings,
};
pub use pruner::{
    plan_eviction, usage_score, CachePruner, EvictionCandidate, PruneReport, PruneTrigger,
    UsageWeights,
};
pub use registry::{CategoryMapping, CategoryRegistry};
pub use resolver::{AssetKey, PathResolver, Side};
pub use scanner::{AssetStatus, LocalFile, LocalListing, ScanConfig, ScanReport, Scanner, SyncStatus};
pub use transfer::CopyEngine;
pub use usage::UsageStore;
