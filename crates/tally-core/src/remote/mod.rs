//! Remote service seams: row tables, blob storage and the change feed.
//!
//! Each seam is an object-safe async trait so a [`RemoteHandle`] can mix
//! backends (e.g. Supabase rows with R2 blobs) and tests can substitute
//! [`memory::MemoryRemote`].

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::error::{Error, RemoteError, Result};
use crate::models::{row_id, Row, SyncTable};

mod connector;
pub mod memory;
mod r2;
pub mod realtime;
mod storage;
mod supabase;

pub use connector::{RemoteConnector, RemoteFactory, SupabaseFactory};
pub use r2::R2BlobStore;
pub use realtime::SupabaseRealtime;
pub use storage::SupabaseStorage;
pub use supabase::PostgrestTables;

/// Row-level access to the remote relational tables, keyed on `id`.
#[async_trait]
pub trait RemoteTables: Send + Sync {
    async fn select_all(&self, table: SyncTable) -> Result<Vec<Row>>;

    async fn select_ids(&self, table: SyncTable) -> Result<Vec<String>>;

    async fn select_by_ids(&self, table: SyncTable, ids: &[String]) -> Result<Vec<Row>>;

    /// Insert rows; an empty slice is a no-op.
    async fn insert(&self, table: SyncTable, rows: &[Row]) -> Result<()>;

    /// Update the row with `id`, returning how many rows matched.
    async fn update(&self, table: SyncTable, id: &str, row: &Row) -> Result<u64>;

    /// Delete every row of `table`.
    async fn delete_all(&self, table: SyncTable) -> Result<()>;
}

/// Entry returned by a blob listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlobEntry {
    /// Name relative to the listed prefix (no slashes).
    pub name: String,
    /// Whether the entry is a folder to descend into rather than an object.
    pub is_container: bool,
}

impl BlobEntry {
    pub fn object(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            is_container: false,
        }
    }

    pub fn container(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            is_container: true,
        }
    }
}

/// Outcome of an upload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadOutcome {
    Uploaded,
    /// Create-if-absent upload found an existing object and left it alone.
    AlreadyExists,
}

/// Blob namespace holding the document tree.
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// One level of entries directly under `prefix` (`""` is the root).
    async fn list(&self, prefix: &str) -> Result<Vec<BlobEntry>>;

    async fn upload(&self, key: &str, bytes: Vec<u8>, overwrite: bool) -> Result<UploadOutcome>;

    async fn download(&self, key: &str) -> Result<Vec<u8>>;
}

/// Kind of a row change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
}

/// A row change pushed by the remote service.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeEvent {
    pub table: SyncTable,
    pub kind: ChangeKind,
    /// Row after the change (inserts and updates).
    pub new: Option<Row>,
    /// Row before the change; for deletes at least its `id`.
    pub old: Option<Row>,
}

/// A live subscription to one table's changes.
///
/// Dropping `shutdown` (or sending on it) ends the feed task, after which
/// `events` yields `None`.
pub struct ChangeSubscription {
    pub events: mpsc::Receiver<ChangeEvent>,
    pub shutdown: oneshot::Sender<()>,
    pub task: JoinHandle<()>,
}

impl fmt::Debug for ChangeSubscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChangeSubscription")
            .field("finished", &self.task.is_finished())
            .finish_non_exhaustive()
    }
}

/// Remote change-notification stream.
#[async_trait]
pub trait ChangeFeed: Send + Sync {
    /// Subscribe to `table`. Returns once the channel is joined.
    async fn subscribe(&self, table: SyncTable) -> Result<ChangeSubscription>;
}

/// One authenticated connection to the remote service.
#[derive(Clone)]
pub struct RemoteHandle {
    pub tables: Arc<dyn RemoteTables>,
    pub blobs: Arc<dyn BlobStore>,
    pub changes: Arc<dyn ChangeFeed>,
}

impl fmt::Debug for RemoteHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteHandle").finish_non_exhaustive()
    }
}

impl RemoteHandle {
    /// Whether two handles share the same underlying clients.
    pub fn same_as(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.tables, &other.tables)
            && Arc::ptr_eq(&self.blobs, &other.blobs)
            && Arc::ptr_eq(&self.changes, &other.changes)
    }
}

/// Update the remote row by id, inserting it when no row matched.
pub async fn upsert_remote(tables: &dyn RemoteTables, table: SyncTable, row: &Row) -> Result<()> {
    let id = row_id(row).ok_or_else(|| {
        Error::InvalidInput(format!("Cannot upsert {table} row without an id"))
    })?;
    if tables.update(table, &id, row).await? == 0 {
        tables.insert(table, std::slice::from_ref(row)).await?;
    }
    Ok(())
}

/// Map a transport failure (connect, timeout, body decode) to a remote error.
pub(crate) fn transport_error(operation: impl Into<String>, error: &reqwest::Error) -> Error {
    let mut remote = RemoteError::new(operation, error.to_string());
    if let Some(status) = error.status() {
        remote = remote.with_status(status.as_u16());
    }
    Error::Remote(remote)
}

#[cfg(test)]
mod tests {
    use super::memory::MemoryRemote;
    use super::*;
    use serde_json::json;

    #[tokio::test(flavor = "multi_thread")]
    async fn upsert_remote_updates_or_inserts() {
        let remote = MemoryRemote::new();
        let row = json!({ "id": "c1", "name": "Acme" }).as_object().cloned().unwrap();

        upsert_remote(&remote, SyncTable::Client, &row).await.unwrap();
        assert_eq!(remote.counts().inserts, 1);

        let renamed = json!({ "id": "c1", "name": "Acme Ltd" })
            .as_object()
            .cloned()
            .unwrap();
        upsert_remote(&remote, SyncTable::Client, &renamed).await.unwrap();
        assert_eq!(remote.counts().inserts, 1);
        assert_eq!(remote.counts().updates, 2);
        assert_eq!(remote.rows(SyncTable::Client)[0]["name"], "Acme Ltd");
    }
}
