//! Applies remote row changes to the local store as they arrive.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, PoisonError};

use serde::Serialize;
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;

use crate::db::LocalStore;
use crate::error::{Error, Result};
use crate::models::{row_id, SyncTable};
use crate::remote::{ChangeEvent, ChangeFeed, ChangeKind, ChangeSubscription};

/// Lifecycle of one table's channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelState {
    Unsubscribed,
    Subscribed,
}

type ChannelStates = Arc<std::sync::Mutex<BTreeMap<SyncTable, ChannelState>>>;

struct Channel {
    table: SyncTable,
    shutdown: oneshot::Sender<()>,
    feed: JoinHandle<()>,
    apply: JoinHandle<()>,
    open: Arc<AtomicBool>,
}

impl Channel {
    /// Cleared by the apply loop once the feed stops delivering events.
    fn is_live(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }
}

/// One change subscription per record table, writing straight into the
/// local store. Runs independently of orchestrated syncs.
pub struct RealtimeBridge {
    local: Arc<dyn LocalStore>,
    channels: Mutex<Vec<Channel>>,
    states: ChannelStates,
    applied: Arc<AtomicU64>,
}

impl std::fmt::Debug for RealtimeBridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RealtimeBridge")
            .field("applied", &self.applied_count())
            .finish_non_exhaustive()
    }
}

impl RealtimeBridge {
    pub fn new(local: Arc<dyn LocalStore>) -> Self {
        Self {
            local,
            channels: Mutex::new(Vec::new()),
            states: Arc::default(),
            applied: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Subscribe every record table that has no live channel. Channels
    /// whose feed closed are reaped and resubscribed. If any subscription
    /// fails every channel is torn down.
    pub async fn start(&self, feed: Arc<dyn ChangeFeed>) -> Result<()> {
        let mut channels = self.channels.lock().await;
        let (live, closed): (Vec<_>, Vec<_>) = channels.drain(..).partition(Channel::is_live);
        *channels = live;
        for channel in closed {
            tracing::info!("Realtime channel for {} closed, resubscribing", channel.table);
            self.close(channel).await;
        }

        let missing = SyncTable::RECORDS
            .into_iter()
            .filter(|table| !channels.iter().any(|channel| channel.table == *table))
            .collect::<Vec<_>>();
        if missing.is_empty() {
            return Ok(());
        }

        for table in missing {
            match feed.subscribe(table).await {
                Ok(subscription) => channels.push(self.spawn_channel(table, subscription)),
                Err(error) => {
                    tracing::warn!("Realtime subscription to {table} failed: {error}");
                    for channel in channels.drain(..) {
                        self.close(channel).await;
                    }
                    return Err(error);
                }
            }
        }
        tracing::info!("Realtime sync started for {} tables", channels.len());
        Ok(())
    }

    /// Tear down every channel and wait for them to finish.
    pub async fn stop(&self) {
        let mut channels = self.channels.lock().await;
        if channels.is_empty() {
            return;
        }
        for channel in channels.drain(..) {
            self.close(channel).await;
        }
        tracing::info!("Realtime sync stopped");
    }

    /// Whether any channel is still receiving events.
    pub async fn is_running(&self) -> bool {
        self.channels.lock().await.iter().any(Channel::is_live)
    }

    pub fn channel_state(&self, table: SyncTable) -> ChannelState {
        self.states
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&table)
            .copied()
            .unwrap_or(ChannelState::Unsubscribed)
    }

    /// Events applied successfully since the bridge was created.
    pub fn applied_count(&self) -> u64 {
        self.applied.load(Ordering::Relaxed)
    }

    fn spawn_channel(&self, table: SyncTable, subscription: ChangeSubscription) -> Channel {
        let ChangeSubscription {
            mut events,
            shutdown,
            task: feed,
        } = subscription;
        set_state(&self.states, table, ChannelState::Subscribed);

        let local = Arc::clone(&self.local);
        let states = Arc::clone(&self.states);
        let applied = Arc::clone(&self.applied);
        let open = Arc::new(AtomicBool::new(true));
        let still_open = Arc::clone(&open);
        let apply = tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                let kind = event.kind;
                match apply_change(local.as_ref(), event).await {
                    Ok(()) => {
                        applied.fetch_add(1, Ordering::Relaxed);
                    }
                    Err(error) => {
                        tracing::warn!("Failed to apply realtime {kind:?} on {table}: {error}");
                    }
                }
            }
            still_open.store(false, Ordering::Release);
            set_state(&states, table, ChannelState::Unsubscribed);
            tracing::debug!("Realtime channel for {table} closed");
        });

        Channel {
            table,
            shutdown,
            feed,
            apply,
            open,
        }
    }

    async fn close(&self, channel: Channel) {
        let Channel {
            table,
            shutdown,
            feed,
            apply,
            ..
        } = channel;
        // the feed may already be gone
        let _ = shutdown.send(());
        if let Err(error) = feed.await {
            tracing::warn!("Realtime feed task for {table} failed: {error}");
        }
        if let Err(error) = apply.await {
            tracing::warn!("Realtime apply task for {table} failed: {error}");
        }
        set_state(&self.states, table, ChannelState::Unsubscribed);
    }
}

fn set_state(states: &ChannelStates, table: SyncTable, state: ChannelState) {
    states
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .insert(table, state);
}

/// Insert and update upsert the new row; delete removes by the old row's id.
pub async fn apply_change(local: &dyn LocalStore, event: ChangeEvent) -> Result<()> {
    let table = event.table;
    match event.kind {
        ChangeKind::Insert | ChangeKind::Update => {
            let row = event.new.ok_or_else(|| {
                Error::InvalidInput(format!("{table} change event carries no new row"))
            })?;
            local.upsert(table, &row).await
        }
        ChangeKind::Delete => {
            let id = event.old.as_ref().and_then(row_id).ok_or_else(|| {
                Error::InvalidInput(format!("{table} delete event carries no id"))
            })?;
            local.delete_by_id(table, &id).await?;
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::LibSqlStore;
    use crate::models::Row;
    use crate::remote::memory::MemoryRemote;
    use serde_json::json;
    use std::time::Duration;

    fn client(id: &str, name: &str) -> Row {
        json!({ "id": id, "name": name, "updated_at": "2024-01-01T00:00:00Z" })
            .as_object()
            .cloned()
            .unwrap()
    }

    async fn wait_for_applied(bridge: &RealtimeBridge, count: u64) {
        for _ in 0..200 {
            if bridge.applied_count() >= count {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("only {} events applied", bridge.applied_count());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn applies_inserts_updates_and_deletes() {
        let store = Arc::new(LibSqlStore::open_in_memory().await.unwrap());
        let remote = MemoryRemote::new();
        let bridge = RealtimeBridge::new(store.clone());

        bridge.start(Arc::new(remote.clone())).await.unwrap();
        assert!(bridge.is_running().await);
        assert_eq!(bridge.channel_state(SyncTable::Client), ChannelState::Subscribed);
        assert_eq!(remote.subscribers(SyncTable::Expense), 1);

        remote.emit(ChangeEvent {
            table: SyncTable::Client,
            kind: ChangeKind::Insert,
            new: Some(client("c1", "Acme")),
            old: None,
        });
        remote.emit(ChangeEvent {
            table: SyncTable::Client,
            kind: ChangeKind::Update,
            new: Some(client("c1", "Acme Ltd")),
            old: None,
        });
        wait_for_applied(&bridge, 2).await;
        let rows = store.fetch_all(SyncTable::Client).await.unwrap();
        assert_eq!(rows[0]["name"], "Acme Ltd");

        remote.emit(ChangeEvent {
            table: SyncTable::Client,
            kind: ChangeKind::Delete,
            new: None,
            old: Some(client("c1", "Acme Ltd")),
        });
        wait_for_applied(&bridge, 3).await;
        assert!(store.fetch_all(SyncTable::Client).await.unwrap().is_empty());

        bridge.stop().await;
        assert!(!bridge.is_running().await);
        assert_eq!(bridge.channel_state(SyncTable::Client), ChannelState::Unsubscribed);
        assert_eq!(remote.subscribers(SyncTable::Client), 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn bad_event_does_not_stop_the_channel() {
        let store = Arc::new(LibSqlStore::open_in_memory().await.unwrap());
        let remote = MemoryRemote::new();
        let bridge = RealtimeBridge::new(store.clone());
        bridge.start(Arc::new(remote.clone())).await.unwrap();

        remote.emit(ChangeEvent {
            table: SyncTable::Invoice,
            kind: ChangeKind::Delete,
            new: None,
            old: None,
        });
        remote.emit(ChangeEvent {
            table: SyncTable::Invoice,
            kind: ChangeKind::Insert,
            new: Some(json!({ "id": "i1" }).as_object().cloned().unwrap()),
            old: None,
        });
        wait_for_applied(&bridge, 1).await;
        assert_eq!(store.fetch_ids(SyncTable::Invoice).await.unwrap(), vec!["i1"]);
        bridge.stop().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn start_twice_keeps_one_subscription_per_table() {
        let store = Arc::new(LibSqlStore::open_in_memory().await.unwrap());
        let remote = MemoryRemote::new();
        let bridge = RealtimeBridge::new(store);

        bridge.start(Arc::new(remote.clone())).await.unwrap();
        bridge.start(Arc::new(remote.clone())).await.unwrap();
        assert_eq!(remote.counts().subscribes, 3);
        bridge.stop().await;
    }

    async fn wait_for_state(bridge: &RealtimeBridge, table: SyncTable, state: ChannelState) {
        for _ in 0..200 {
            if bridge.channel_state(table) == state {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("{table} channel never reached {state:?}");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn closed_feeds_are_resubscribed_on_start() {
        let store = Arc::new(LibSqlStore::open_in_memory().await.unwrap());
        let remote = MemoryRemote::new();
        let bridge = RealtimeBridge::new(store.clone());
        bridge.start(Arc::new(remote.clone())).await.unwrap();

        for table in SyncTable::RECORDS {
            remote.disconnect(table);
        }
        for table in SyncTable::RECORDS {
            wait_for_state(&bridge, table, ChannelState::Unsubscribed).await;
        }
        assert!(!bridge.is_running().await);

        bridge.start(Arc::new(remote.clone())).await.unwrap();
        assert!(bridge.is_running().await);
        assert_eq!(remote.counts().subscribes, 6);
        assert_eq!(bridge.channel_state(SyncTable::Client), ChannelState::Subscribed);

        remote.emit(ChangeEvent {
            table: SyncTable::Client,
            kind: ChangeKind::Insert,
            new: Some(client("c1", "Acme")),
            old: None,
        });
        wait_for_applied(&bridge, 1).await;
        assert_eq!(store.fetch_ids(SyncTable::Client).await.unwrap(), vec!["c1"]);
        bridge.stop().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn start_only_replaces_the_closed_channel() {
        let store = Arc::new(LibSqlStore::open_in_memory().await.unwrap());
        let remote = MemoryRemote::new();
        let bridge = RealtimeBridge::new(store);
        bridge.start(Arc::new(remote.clone())).await.unwrap();

        remote.disconnect(SyncTable::Invoice);
        wait_for_state(&bridge, SyncTable::Invoice, ChannelState::Unsubscribed).await;
        assert!(bridge.is_running().await);

        bridge.start(Arc::new(remote.clone())).await.unwrap();
        assert_eq!(remote.counts().subscribes, 4);
        assert_eq!(remote.subscribers(SyncTable::Invoice), 1);
        assert_eq!(remote.subscribers(SyncTable::Client), 1);
        assert_eq!(bridge.channel_state(SyncTable::Invoice), ChannelState::Subscribed);
        bridge.stop().await;
    }
}
