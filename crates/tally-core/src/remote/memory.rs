//! In-process remote service for tests and offline runs.
//!
//! Behaves like the Supabase backends (duplicate-key and missing-table
//! errors, create-if-absent uploads, folder listings) and records how many
//! calls of each kind it served so callers can assert on side effects.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};

use crate::credential::ResolvedEndpoint;
use crate::error::{RemoteError, Result};
use crate::models::{row_id, Row, SyncTable};

use super::{
    BlobEntry, BlobStore, ChangeEvent, ChangeFeed, ChangeSubscription, RemoteFactory,
    RemoteHandle, RemoteTables, UploadOutcome,
};

/// Calls served, by kind.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CallCounts {
    pub selects: u64,
    pub inserts: u64,
    pub updates: u64,
    pub deletes: u64,
    pub lists: u64,
    pub uploads: u64,
    pub downloads: u64,
    pub subscribes: u64,
}

impl CallCounts {
    /// Calls that could have changed remote state.
    pub const fn mutations(&self) -> u64 {
        self.inserts + self.updates + self.deletes + self.uploads
    }

    pub const fn total(&self) -> u64 {
        self.selects + self.mutations() + self.lists + self.downloads + self.subscribes
    }
}

#[derive(Default)]
struct State {
    tables: BTreeMap<SyncTable, BTreeMap<String, Row>>,
    missing: BTreeSet<SyncTable>,
    blobs: BTreeMap<String, Vec<u8>>,
    counts: CallCounts,
    failing_inserts: BTreeSet<(SyncTable, String)>,
    failing_deletes: BTreeSet<SyncTable>,
    failing_uploads: BTreeSet<String>,
    failing_downloads: BTreeSet<String>,
    feeds: HashMap<SyncTable, Vec<mpsc::UnboundedSender<ChangeEvent>>>,
}

/// Shared in-memory remote. Clones share state.
#[derive(Clone, Default)]
pub struct MemoryRemote {
    state: Arc<Mutex<State>>,
}

impl std::fmt::Debug for MemoryRemote {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryRemote")
            .field("counts", &self.counts())
            .finish_non_exhaustive()
    }
}

impl MemoryRemote {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// A handle whose three seams all point at this remote.
    pub fn handle(&self) -> RemoteHandle {
        RemoteHandle {
            tables: Arc::new(self.clone()),
            blobs: Arc::new(self.clone()),
            changes: Arc::new(self.clone()),
        }
    }

    pub fn counts(&self) -> CallCounts {
        self.lock().counts
    }

    pub fn reset_counts(&self) {
        self.lock().counts = CallCounts::default();
    }

    /// Store rows directly, bypassing counters.
    pub fn seed(&self, table: SyncTable, rows: impl IntoIterator<Item = Row>) {
        let mut state = self.lock();
        let stored = state.tables.entry(table).or_default();
        for row in rows {
            if let Some(id) = row_id(&row) {
                stored.insert(id, row);
            }
        }
    }

    /// Rows of `table` ordered by id.
    pub fn rows(&self, table: SyncTable) -> Vec<Row> {
        self.lock()
            .tables
            .get(&table)
            .map(|rows| rows.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn row(&self, table: SyncTable, id: &str) -> Option<Row> {
        self.lock().tables.get(&table)?.get(id).cloned()
    }

    /// Make `table` behave as if it does not exist remotely.
    pub fn remove_table(&self, table: SyncTable) {
        let mut state = self.lock();
        state.tables.remove(&table);
        state.missing.insert(table);
    }

    /// Fail any insert batch containing the row `id`.
    pub fn fail_insert(&self, table: SyncTable, id: &str) {
        self.lock().failing_inserts.insert((table, id.to_string()));
    }

    pub fn fail_delete(&self, table: SyncTable) {
        self.lock().failing_deletes.insert(table);
    }

    pub fn fail_upload(&self, key: &str) {
        self.lock().failing_uploads.insert(key.to_string());
    }

    pub fn fail_download(&self, key: &str) {
        self.lock().failing_downloads.insert(key.to_string());
    }

    pub fn put_blob(&self, key: &str, bytes: impl Into<Vec<u8>>) {
        self.lock().blobs.insert(key.to_string(), bytes.into());
    }

    pub fn blob(&self, key: &str) -> Option<Vec<u8>> {
        self.lock().blobs.get(key).cloned()
    }

    pub fn blob_keys(&self) -> Vec<String> {
        self.lock().blobs.keys().cloned().collect()
    }

    /// Deliver a change to every live subscriber of its table.
    /// Returns how many subscribers received it.
    pub fn emit(&self, event: ChangeEvent) -> usize {
        let mut state = self.lock();
        let Some(feeds) = state.feeds.get_mut(&event.table) else {
            return 0;
        };
        feeds.retain(|feed| !feed.is_closed());
        feeds
            .iter()
            .filter(|feed| feed.send(event.clone()).is_ok())
            .count()
    }

    /// Close every feed for `table`, as a server dropping the socket would.
    pub fn disconnect(&self, table: SyncTable) {
        self.lock().feeds.remove(&table);
    }

    /// Number of live subscriptions for `table`.
    pub fn subscribers(&self, table: SyncTable) -> usize {
        self.lock()
            .feeds
            .get(&table)
            .map_or(0, |feeds| feeds.iter().filter(|feed| !feed.is_closed()).count())
    }
}

fn missing_table(operation: &str, table: SyncTable) -> RemoteError {
    RemoteError::new(
        operation,
        format!("Could not find the table 'public.{table}' in the schema cache"),
    )
    .with_status(404)
    .with_code("PGRST205")
}

fn check_table(state: &State, operation: &str, table: SyncTable) -> Result<()> {
    if state.missing.contains(&table) {
        return Err(missing_table(operation, table).into());
    }
    Ok(())
}

#[async_trait]
impl RemoteTables for MemoryRemote {
    async fn select_all(&self, table: SyncTable) -> Result<Vec<Row>> {
        let mut state = self.lock();
        state.counts.selects += 1;
        check_table(&state, &format!("select {table}"), table)?;
        Ok(state
            .tables
            .get(&table)
            .map(|rows| rows.values().cloned().collect())
            .unwrap_or_default())
    }

    async fn select_ids(&self, table: SyncTable) -> Result<Vec<String>> {
        let mut state = self.lock();
        state.counts.selects += 1;
        check_table(&state, &format!("select {table}"), table)?;
        Ok(state
            .tables
            .get(&table)
            .map(|rows| rows.keys().cloned().collect())
            .unwrap_or_default())
    }

    async fn select_by_ids(&self, table: SyncTable, ids: &[String]) -> Result<Vec<Row>> {
        let mut state = self.lock();
        state.counts.selects += 1;
        check_table(&state, &format!("select {table} by id"), table)?;
        let Some(rows) = state.tables.get(&table) else {
            return Ok(Vec::new());
        };
        Ok(ids.iter().filter_map(|id| rows.get(id).cloned()).collect())
    }

    async fn insert(&self, table: SyncTable, rows: &[Row]) -> Result<()> {
        let operation = format!("insert {table}");
        let mut state = self.lock();
        state.counts.inserts += 1;
        check_table(&state, &operation, table)?;

        // validate the whole batch first: a failed batch stores nothing
        let mut ids = Vec::with_capacity(rows.len());
        for row in rows {
            let id = row_id(row).ok_or_else(|| {
                RemoteError::new(&operation, "null value in column \"id\" violates not-null constraint")
                    .with_status(400)
                    .with_code("23502")
            })?;
            if state.failing_inserts.contains(&(table, id.clone())) {
                return Err(RemoteError::new(&operation, format!("injected failure for {id}"))
                    .with_status(500)
                    .with_code("P0001")
                    .into());
            }
            let exists = state
                .tables
                .get(&table)
                .is_some_and(|stored| stored.contains_key(&id));
            if exists || ids.contains(&id) {
                return Err(RemoteError::new(
                    &operation,
                    format!("duplicate key value violates unique constraint \"{table}_pkey\""),
                )
                .with_status(409)
                .with_code("23505")
                .into());
            }
            ids.push(id);
        }

        let stored = state.tables.entry(table).or_default();
        for (id, row) in ids.into_iter().zip(rows) {
            stored.insert(id, row.clone());
        }
        Ok(())
    }

    async fn update(&self, table: SyncTable, id: &str, row: &Row) -> Result<u64> {
        let mut state = self.lock();
        state.counts.updates += 1;
        check_table(&state, &format!("update {table}"), table)?;
        let Some(existing) = state.tables.get_mut(&table).and_then(|rows| rows.get_mut(id)) else {
            return Ok(0);
        };
        for (column, value) in row {
            existing.insert(column.clone(), value.clone());
        }
        Ok(1)
    }

    async fn delete_all(&self, table: SyncTable) -> Result<()> {
        let operation = format!("delete {table}");
        let mut state = self.lock();
        state.counts.deletes += 1;
        check_table(&state, &operation, table)?;
        if state.failing_deletes.contains(&table) {
            return Err(RemoteError::new(
                &operation,
                format!("update or delete on table \"{table}\" violates foreign key constraint"),
            )
            .with_status(409)
            .with_code("23503")
            .into());
        }
        state.tables.remove(&table);
        Ok(())
    }
}

#[async_trait]
impl BlobStore for MemoryRemote {
    async fn list(&self, prefix: &str) -> Result<Vec<BlobEntry>> {
        let mut state = self.lock();
        state.counts.lists += 1;
        let prefix = prefix.trim().trim_matches('/');
        let base = if prefix.is_empty() {
            String::new()
        } else {
            format!("{prefix}/")
        };

        let mut containers = BTreeSet::new();
        let mut entries = Vec::new();
        for key in state.blobs.keys() {
            let Some(rest) = key.strip_prefix(&base) else {
                continue;
            };
            match rest.split_once('/') {
                Some((folder, _)) => {
                    containers.insert(folder.to_string());
                }
                None => entries.push(BlobEntry::object(rest)),
            }
        }
        let mut listed = containers
            .into_iter()
            .map(BlobEntry::container)
            .collect::<Vec<_>>();
        listed.extend(entries);
        Ok(listed)
    }

    async fn upload(&self, key: &str, bytes: Vec<u8>, overwrite: bool) -> Result<UploadOutcome> {
        let mut state = self.lock();
        state.counts.uploads += 1;
        if state.failing_uploads.contains(key) {
            return Err(RemoteError::new(format!("upload {key}"), "injected failure")
                .with_status(500)
                .into());
        }
        if !overwrite && state.blobs.contains_key(key) {
            return Ok(UploadOutcome::AlreadyExists);
        }
        state.blobs.insert(key.to_string(), bytes);
        Ok(UploadOutcome::Uploaded)
    }

    async fn download(&self, key: &str) -> Result<Vec<u8>> {
        let mut state = self.lock();
        state.counts.downloads += 1;
        if state.failing_downloads.contains(key) {
            return Err(RemoteError::new(format!("download {key}"), "injected failure")
                .with_status(500)
                .into());
        }
        state.blobs.get(key).cloned().ok_or_else(|| {
            RemoteError::new(format!("download {key}"), "Object not found")
                .with_status(404)
                .into()
        })
    }
}

#[async_trait]
impl ChangeFeed for MemoryRemote {
    async fn subscribe(&self, table: SyncTable) -> Result<ChangeSubscription> {
        let (feed_tx, mut feed_rx) = mpsc::unbounded_channel();
        {
            let mut state = self.lock();
            state.counts.subscribes += 1;
            state.feeds.entry(table).or_default().push(feed_tx);
        }

        let (events_tx, events) = mpsc::channel(64);
        let (shutdown, mut shutdown_rx) = oneshot::channel::<()>();
        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = &mut shutdown_rx => break,
                    event = feed_rx.recv() => match event {
                        Some(event) => {
                            if events_tx.send(event).await.is_err() {
                                break;
                            }
                        }
                        None => break,
                    },
                }
            }
        });

        Ok(ChangeSubscription {
            events,
            shutdown,
            task,
        })
    }
}

/// Every connection, whatever the endpoint, reaches this one remote.
impl RemoteFactory for MemoryRemote {
    fn build(&self, _endpoint: &ResolvedEndpoint) -> Result<RemoteHandle> {
        Ok(self.handle())
    }
}
