//! Data models for Tally

mod endpoint;
pub mod record;
mod sync;
mod table;

pub use endpoint::{StoredCredential, SyncEndpointConfig};
pub use record::{row_id, row_updated_at, Row, Timestamp};
pub use sync::{
    ConflictPolicy, FailureTarget, FileManifestEntry, PartialFailure, SyncResult, SyncStatus,
    SyncStrategy, TransferDirection,
};
pub use table::{SyncTable, TableSchema};
