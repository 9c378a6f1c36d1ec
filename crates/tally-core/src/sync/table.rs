//! Row reconciliation between the local store and the remote tables.

use std::collections::{BTreeMap, BTreeSet};

use crate::db::{LocalStore, TableSnapshot};
use crate::error::{Error, Result};
use crate::models::record::same_updated_at;
use crate::models::{row_id, ConflictPolicy, Row, SyncTable, TransferDirection};
use crate::remote::{upsert_remote, RemoteTables};

use super::partial::PartialFailures;

/// Rows moved by one reconciliation step.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TableCounts {
    pub pushed: u64,
    pub pulled: u64,
}

impl std::ops::AddAssign for TableCounts {
    fn add_assign(&mut self, other: Self) {
        self.pushed += other.pushed;
        self.pulled += other.pulled;
    }
}

/// Reconciles tables between a local store and a remote service.
pub struct TableReconciler<'a> {
    local: &'a dyn LocalStore,
    remote: &'a dyn RemoteTables,
}

impl<'a> TableReconciler<'a> {
    pub fn new(local: &'a dyn LocalStore, remote: &'a dyn RemoteTables) -> Self {
        Self { local, remote }
    }

    /// Two-way sync of `table`. Rows present on both sides with different
    /// `updated_at` move in the direction `policy` names, regardless of
    /// which timestamp is newer.
    pub async fn full(
        &self,
        table: SyncTable,
        policy: ConflictPolicy,
        failures: &mut PartialFailures,
    ) -> Result<TableCounts> {
        let (local_rows, remote_rows) =
            tokio::try_join!(self.local.fetch_all(table), self.remote.select_all(table))?;
        let local = index_by_id(table, local_rows);
        let remote = index_by_id(table, remote_rows);

        let mut counts = TableCounts::default();
        let mut local_only = Vec::new();
        let ids = local.keys().chain(remote.keys()).collect::<BTreeSet<_>>();
        for id in ids {
            match (local.get(id), remote.get(id)) {
                (Some(local_row), None) => local_only.push(local_row.clone()),
                (None, Some(remote_row)) => {
                    if self.pull_row(table, id, remote_row, failures).await {
                        counts.pulled += 1;
                    }
                }
                (Some(local_row), Some(remote_row)) => {
                    if same_updated_at(local_row, remote_row) {
                        continue;
                    }
                    match policy {
                        ConflictPolicy::CloudWins => {
                            if self.pull_row(table, id, remote_row, failures).await {
                                counts.pulled += 1;
                            }
                        }
                        ConflictPolicy::LocalWins => {
                            match upsert_remote(self.remote, table, local_row).await {
                                Ok(()) => counts.pushed += 1,
                                Err(error) => failures.record_row(
                                    table,
                                    id.as_str(),
                                    TransferDirection::Push,
                                    error,
                                ),
                            }
                        }
                    }
                }
                (None, None) => {}
            }
        }
        counts.pushed += self.push_new_rows(table, &local_only, failures).await;

        tracing::debug!(
            "Full sync of {table}: pushed {}, pulled {}",
            counts.pushed,
            counts.pulled
        );
        Ok(counts)
    }

    /// Copy rows that exist only remotely into the local store.
    pub async fn merge_pull(
        &self,
        table: SyncTable,
        failures: &mut PartialFailures,
    ) -> Result<TableCounts> {
        let (local_ids, remote_ids) =
            tokio::try_join!(self.local.fetch_ids(table), self.remote.select_ids(table))?;
        let missing = one_sided(&remote_ids, &local_ids);
        if missing.is_empty() {
            return Ok(TableCounts::default());
        }

        let rows = self.remote.select_by_ids(table, &missing).await?;
        let mut counts = TableCounts::default();
        for row in rows {
            let Some(id) = row_id(&row) else {
                continue;
            };
            match self.local.insert(table, &row).await {
                Ok(()) => counts.pulled += 1,
                Err(error) => failures.record_row(table, id, TransferDirection::Pull, error),
            }
        }
        tracing::debug!("Merge pull of {table}: pulled {}", counts.pulled);
        Ok(counts)
    }

    /// Copy rows that exist only locally to the remote service.
    pub async fn merge_push(
        &self,
        table: SyncTable,
        failures: &mut PartialFailures,
    ) -> Result<TableCounts> {
        let (local_ids, remote_ids) =
            tokio::try_join!(self.local.fetch_ids(table), self.remote.select_ids(table))?;
        let missing = one_sided(&local_ids, &remote_ids);
        if missing.is_empty() {
            return Ok(TableCounts::default());
        }

        let rows = self.local.fetch_by_ids(table, &missing).await?;
        let pushed = self.push_new_rows(table, &rows, failures).await;
        tracing::debug!("Merge push of {table}: pushed {pushed}");
        Ok(TableCounts { pushed, pulled: 0 })
    }

    /// Replace every local syncable table with the remote snapshot in one
    /// local transaction.
    ///
    /// An optional table missing remotely keeps its local rows. `automation`
    /// is always cleared because it references expenses and invoices.
    pub async fn force_pull_all(&self) -> Result<TableCounts> {
        let mut snapshots = Vec::new();
        let mut kept = BTreeSet::new();
        for table in SyncTable::FORCE_PULL_INSERT_ORDER {
            match self.remote.select_all(table).await {
                Ok(rows) => snapshots.push(TableSnapshot { table, rows }),
                Err(Error::Remote(error)) if table.is_optional() && error.is_missing_table() => {
                    tracing::info!("Remote has no {table} table, keeping local rows");
                    kept.insert(table);
                }
                Err(error) => return Err(error),
            }
        }

        let clear = SyncTable::FORCE_PULL_DELETE_ORDER
            .into_iter()
            .filter(|table| !kept.contains(table))
            .collect::<Vec<_>>();
        let pulled = self.local.replace_tables(&clear, &snapshots).await?;
        Ok(TableCounts { pushed: 0, pulled })
    }

    /// Replace the remote record tables with the local snapshot.
    ///
    /// Remote steps are not transactional: the first failed delete or insert
    /// aborts the rest and is returned as is.
    pub async fn force_push_all(&self) -> Result<TableCounts> {
        for table in SyncTable::FORCE_PUSH_DELETE_ORDER {
            match self.remote.delete_all(table).await {
                Ok(()) => tracing::debug!("Cleared remote {table}"),
                Err(Error::Remote(error)) if table.is_optional() && error.is_missing_table() => {
                    tracing::debug!("Remote has no {table} table, nothing to clear");
                }
                Err(error) => return Err(error),
            }
        }

        let mut pushed = 0u64;
        for table in SyncTable::FORCE_PUSH_INSERT_ORDER {
            let rows = self.local.fetch_all(table).await?;
            if rows.is_empty() {
                continue;
            }
            self.remote.insert(table, &rows).await?;
            pushed += u64::try_from(rows.len()).unwrap_or(u64::MAX);
            tracing::debug!("Inserted {} {table} rows remotely", rows.len());
        }
        Ok(TableCounts { pushed, pulled: 0 })
    }

    async fn pull_row(
        &self,
        table: SyncTable,
        id: &str,
        row: &Row,
        failures: &mut PartialFailures,
    ) -> bool {
        match self.local.upsert(table, row).await {
            Ok(()) => true,
            Err(error) => {
                failures.record_row(table, id, TransferDirection::Pull, error);
                false
            }
        }
    }

    /// Insert rows absent remotely. A rejected batch is retried row by row so
    /// one bad row only fails itself.
    async fn push_new_rows(
        &self,
        table: SyncTable,
        rows: &[Row],
        failures: &mut PartialFailures,
    ) -> u64 {
        if rows.is_empty() {
            return 0;
        }
        match self.remote.insert(table, rows).await {
            Ok(()) => return u64::try_from(rows.len()).unwrap_or(u64::MAX),
            Err(error) if rows.len() == 1 => {
                let id = row_id(&rows[0]).unwrap_or_default();
                failures.record_row(table, id, TransferDirection::Push, error);
                return 0;
            }
            Err(error) => {
                tracing::debug!("Batch insert into {table} failed, retrying per row: {error}");
            }
        }

        let mut pushed = 0;
        for row in rows {
            let id = row_id(row).unwrap_or_default();
            match self.remote.insert(table, std::slice::from_ref(row)).await {
                Ok(()) => pushed += 1,
                Err(error) => failures.record_row(table, id, TransferDirection::Push, error),
            }
        }
        pushed
    }
}

fn index_by_id(table: SyncTable, rows: Vec<Row>) -> BTreeMap<String, Row> {
    let mut indexed = BTreeMap::new();
    for row in rows {
        match row_id(&row) {
            Some(id) => {
                indexed.insert(id, row);
            }
            None => tracing::warn!("Skipping {table} row without an id"),
        }
    }
    indexed
}

/// Ids in `from` that `other` lacks, in `from` order.
fn one_sided(from: &[String], other: &[String]) -> Vec<String> {
    let other = other.iter().collect::<BTreeSet<_>>();
    from.iter()
        .filter(|id| !other.contains(id))
        .cloned()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::LibSqlStore;
    use crate::models::FailureTarget;
    use crate::remote::memory::MemoryRemote;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn client(id: &str, name: &str, updated_at: &str) -> Row {
        json!({ "id": id, "name": name, "updated_at": updated_at })
            .as_object()
            .cloned()
            .unwrap()
    }

    async fn local_names(store: &LibSqlStore, table: SyncTable) -> Vec<(String, String)> {
        store
            .fetch_all(table)
            .await
            .unwrap()
            .into_iter()
            .map(|row| {
                (
                    row_id(&row).unwrap(),
                    row["name"].as_str().unwrap_or_default().to_string(),
                )
            })
            .collect()
    }

    #[test]
    fn one_sided_keeps_source_order() {
        let from = ["c", "a", "b"].map(String::from);
        let other = ["a".to_string()];
        assert_eq!(one_sided(&from, &other), vec!["c".to_string(), "b".to_string()]);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn full_moves_one_sided_rows_both_ways() {
        let store = LibSqlStore::open_in_memory().await.unwrap();
        let remote = MemoryRemote::new();
        store
            .insert(SyncTable::Client, &client("local", "Local Co", "2024-01-01T00:00:00Z"))
            .await
            .unwrap();
        remote.seed(
            SyncTable::Client,
            [client("cloud", "Cloud Co", "2024-01-02T00:00:00Z")],
        );

        let reconciler = TableReconciler::new(&store, &remote);
        let mut failures = PartialFailures::new();
        let counts = reconciler
            .full(SyncTable::Client, ConflictPolicy::CloudWins, &mut failures)
            .await
            .unwrap();

        assert_eq!(counts, TableCounts { pushed: 1, pulled: 1 });
        assert!(failures.is_empty());
        assert!(remote.row(SyncTable::Client, "local").is_some());
        assert_eq!(
            local_names(&store, SyncTable::Client).await,
            vec![
                ("cloud".to_string(), "Cloud Co".to_string()),
                ("local".to_string(), "Local Co".to_string()),
            ]
        );
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn conflict_follows_policy_not_timestamp_order() {
        for policy in [ConflictPolicy::CloudWins, ConflictPolicy::LocalWins] {
            let store = LibSqlStore::open_in_memory().await.unwrap();
            let remote = MemoryRemote::new();
            // local copy is newer in both cases
            store
                .insert(SyncTable::Client, &client("c1", "Local", "2024-05-01T00:00:00Z"))
                .await
                .unwrap();
            remote.seed(
                SyncTable::Client,
                [client("c1", "Cloud", "2024-01-01T00:00:00Z")],
            );

            let mut failures = PartialFailures::new();
            let counts = TableReconciler::new(&store, &remote)
                .full(SyncTable::Client, policy, &mut failures)
                .await
                .unwrap();

            let local_name = local_names(&store, SyncTable::Client).await[0].1.clone();
            let remote_name = remote.row(SyncTable::Client, "c1").unwrap()["name"].clone();
            match policy {
                ConflictPolicy::CloudWins => {
                    assert_eq!(counts, TableCounts { pushed: 0, pulled: 1 });
                    assert_eq!(local_name, "Cloud");
                }
                ConflictPolicy::LocalWins => {
                    assert_eq!(counts, TableCounts { pushed: 1, pulled: 0 });
                    assert_eq!(remote_name, "Local");
                }
            }
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn merge_push_isolates_rejected_rows() {
        let store = LibSqlStore::open_in_memory().await.unwrap();
        let remote = MemoryRemote::new();
        for id in ["a", "b", "c"] {
            store
                .insert(SyncTable::Client, &client(id, id, "2024-01-01T00:00:00Z"))
                .await
                .unwrap();
        }
        remote.fail_insert(SyncTable::Client, "b");

        let mut failures = PartialFailures::new();
        let counts = TableReconciler::new(&store, &remote)
            .merge_push(SyncTable::Client, &mut failures)
            .await
            .unwrap();

        assert_eq!(counts.pushed, 2);
        let failures = failures.into_vec();
        assert_eq!(failures.len(), 1);
        assert_eq!(
            failures[0].target,
            FailureTarget::Row {
                table: SyncTable::Client,
                id: "b".to_string()
            }
        );
        assert!(remote.row(SyncTable::Client, "b").is_none());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn force_pull_keeps_local_settings_when_remote_lacks_them() {
        let store = LibSqlStore::open_in_memory().await.unwrap();
        let remote = MemoryRemote::new();
        store
            .insert(
                SyncTable::Setting,
                &json!({ "id": "default", "company_name": "Mine" })
                    .as_object()
                    .cloned()
                    .unwrap(),
            )
            .await
            .unwrap();
        store
            .insert(SyncTable::Client, &client("old", "Old", "2024-01-01T00:00:00Z"))
            .await
            .unwrap();
        remote.remove_table(SyncTable::Setting);
        remote.seed(
            SyncTable::Client,
            [client("new", "New", "2024-01-01T00:00:00Z")],
        );

        let counts = TableReconciler::new(&store, &remote)
            .force_pull_all()
            .await
            .unwrap();

        assert_eq!(counts, TableCounts { pushed: 0, pulled: 1 });
        assert_eq!(
            local_names(&store, SyncTable::Client).await,
            vec![("new".to_string(), "New".to_string())]
        );
        assert_eq!(store.fetch_all(SyncTable::Setting).await.unwrap().len(), 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn force_push_surfaces_remote_error_and_stops() {
        let store = LibSqlStore::open_in_memory().await.unwrap();
        let remote = MemoryRemote::new();
        remote.remove_table(SyncTable::Automation);
        remote.fail_delete(SyncTable::Invoice);

        let error = TableReconciler::new(&store, &remote)
            .force_push_all()
            .await
            .unwrap_err();
        match error {
            Error::Remote(remote_error) => assert_eq!(remote_error.code.as_deref(), Some("23503")),
            other => panic!("unexpected error: {other:?}"),
        }
        // automation (missing), expense, invoice; client never reached
        assert_eq!(remote.counts().deletes, 3);
        assert_eq!(remote.counts().inserts, 0);
    }
}
