//! The sync engine: table and file reconciliation, the realtime bridge and
//! the orchestrating [`SyncService`].

pub mod config_document;
pub mod files;
mod orchestrator;
pub mod partial;
pub mod realtime;
pub mod table;

pub use files::{plan_transfers, FileCounts, FileReconciler, FileSyncMode};
pub use orchestrator::SyncService;
pub use partial::PartialFailures;
pub use realtime::{ChannelState, RealtimeBridge};
pub use table::{TableCounts, TableReconciler};
