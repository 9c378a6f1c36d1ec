//! Sync entry points: credential gating, per-table and per-file
//! reconciliation, result aggregation and `last_sync_at` bookkeeping.

use std::sync::Arc;

use crate::config::SyncRuntimeConfig;
use crate::credential::{CredentialResolver, ResolvedEndpoint};
use crate::db::{LibSqlStore, LocalStore, SettingsRepository};
use crate::error::{Error, ErrorResponse, Result};
use crate::models::{ConflictPolicy, SyncResult, SyncStatus, SyncStrategy, SyncTable};
use crate::remote::{RemoteConnector, RemoteFactory, RemoteHandle, SupabaseFactory};
use crate::util::{is_http_url, normalize_text_option, now_rfc3339};
use crate::vault::{generate_salt, Vault};

use super::config_document::{ensure_local, sync_config_document};
use super::files::{FileCounts, FileReconciler, FileSyncMode};
use super::partial::PartialFailures;
use super::realtime::{ChannelState, RealtimeBridge};
use super::table::{TableCounts, TableReconciler};

type ServiceResult<T> = std::result::Result<T, ErrorResponse>;

/// The sync engine's invocation surface.
///
/// Every public operation returns an [`ErrorResponse`] on failure.
pub struct SyncService {
    local: Arc<dyn LocalStore>,
    settings: Arc<dyn SettingsRepository>,
    vault: Vault,
    resolver: CredentialResolver,
    connector: RemoteConnector,
    runtime: SyncRuntimeConfig,
    realtime: RealtimeBridge,
}

impl std::fmt::Debug for SyncService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncService")
            .field("runtime", &self.runtime)
            .finish_non_exhaustive()
    }
}

impl SyncService {
    /// Service talking to the Supabase-style deployment configured in the store.
    pub fn new(store: LibSqlStore, vault: Vault, runtime: SyncRuntimeConfig) -> Self {
        let factory = Arc::new(SupabaseFactory::new(runtime.clone()));
        Self::with_factory(store, vault, runtime, factory)
    }

    pub fn with_factory(
        store: LibSqlStore,
        vault: Vault,
        runtime: SyncRuntimeConfig,
        factory: Arc<dyn RemoteFactory>,
    ) -> Self {
        let store = Arc::new(store);
        let local: Arc<dyn LocalStore> = store.clone();
        let settings: Arc<dyn SettingsRepository> = store;
        Self {
            resolver: CredentialResolver::new(Arc::clone(&settings), vault.clone()),
            connector: RemoteConnector::new(factory),
            realtime: RealtimeBridge::new(Arc::clone(&local)),
            local,
            settings,
            vault,
            runtime,
        }
    }

    pub fn vault(&self) -> &Vault {
        &self.vault
    }

    pub async fn get_sync_status(&self) -> ServiceResult<SyncStatus> {
        let endpoint = self.settings.load_endpoint().await?;
        Ok(SyncStatus {
            configured: endpoint.is_configured(),
            enabled: endpoint.enabled,
            conflict_policy: endpoint.conflict_policy,
            last_sync_at: self.settings.last_sync_at().await?,
            realtime: self.realtime.is_running().await,
        })
    }

    pub async fn run_full_sync(&self) -> ServiceResult<SyncResult> {
        Ok(self.run(SyncStrategy::Full).await?)
    }

    pub async fn run_merge_pull(&self) -> ServiceResult<SyncResult> {
        Ok(self.run(SyncStrategy::MergePull).await?)
    }

    pub async fn run_merge_push(&self) -> ServiceResult<SyncResult> {
        Ok(self.run(SyncStrategy::MergePush).await?)
    }

    pub async fn run_force_pull(&self) -> ServiceResult<SyncResult> {
        Ok(self.run(SyncStrategy::ForcePull).await?)
    }

    pub async fn run_force_push(&self) -> ServiceResult<SyncResult> {
        Ok(self.run(SyncStrategy::ForcePush).await?)
    }

    pub async fn run_strategy(&self, strategy: SyncStrategy) -> ServiceResult<SyncResult> {
        Ok(self.run(strategy).await?)
    }

    pub async fn set_conflict_policy(&self, policy: ConflictPolicy) -> ServiceResult<()> {
        let mut endpoint = self.settings.load_endpoint().await?;
        endpoint.conflict_policy = policy;
        self.settings.save_endpoint(&endpoint).await?;
        tracing::info!("Conflict policy set to {policy}");
        Ok(())
    }

    /// Store the endpoint, sealing the key when the vault is unlocked.
    pub async fn save_endpoint(&self, url: &str, key: &str, enabled: bool) -> ServiceResult<()> {
        let url = normalize_text_option(Some(url.to_string()))
            .ok_or_else(|| Error::InvalidInput("Sync URL cannot be empty".to_string()))?;
        if !is_http_url(&url) {
            return Err(Error::InvalidInput(format!("Sync URL must be http(s): {url}")).into());
        }
        if key.trim().is_empty() {
            return Err(Error::InvalidInput("Sync key cannot be empty".to_string()).into());
        }

        let credential = self.vault.seal(key.trim())?;
        let mut endpoint = self.settings.load_endpoint().await?;
        endpoint.url = Some(url.trim_end_matches('/').to_string());
        endpoint.credential = Some(credential);
        endpoint.enabled = enabled;
        self.settings.save_endpoint(&endpoint).await?;
        self.connector.invalidate().await;
        tracing::info!(
            "Saved sync endpoint ({} credential)",
            if self.vault.is_unlocked() { "sealed" } else { "plaintext" }
        );
        Ok(())
    }

    /// Open an unlock session, creating the vault salt on first use.
    pub async fn unlock_vault(&self, passphrase: &str) -> ServiceResult<()> {
        let salt = match self.settings.vault_salt().await? {
            Some(salt) => salt,
            None => {
                let salt = generate_salt();
                self.settings.save_vault_salt(&salt).await?;
                salt
            }
        };
        self.vault.unlock(passphrase, &salt)?;
        Ok(())
    }

    pub fn lock_vault(&self) {
        self.vault.lock();
    }

    pub async fn start_realtime(&self) -> ServiceResult<()> {
        let endpoint = self.resolver.resolve().await?.ok_or(Error::NotConfigured)?;
        let handle = self.connector.connect(&endpoint).await?;
        self.realtime.start(Arc::clone(&handle.changes)).await?;
        Ok(())
    }

    pub async fn stop_realtime(&self) -> ServiceResult<()> {
        self.realtime.stop().await;
        Ok(())
    }

    pub fn realtime_channel_state(&self, table: SyncTable) -> ChannelState {
        self.realtime.channel_state(table)
    }

    pub fn realtime_applied_count(&self) -> u64 {
        self.realtime.applied_count()
    }

    async fn run(&self, strategy: SyncStrategy) -> Result<SyncResult> {
        let endpoint = self.resolve_for(strategy).await?;
        let handle = self.connector.connect(&endpoint).await?;
        let policy = endpoint.conflict_policy;
        tracing::info!("Starting {strategy} sync ({policy})");

        let mut failures = PartialFailures::new();
        let tables = self
            .reconcile_tables(&handle, strategy, policy, &mut failures)
            .await?;
        let files = self
            .reconcile_files(&handle, FileSyncMode::new(strategy, policy), &mut failures)
            .await?;

        self.settings.set_last_sync_at(&now_rfc3339()).await?;
        let result = SyncResult {
            pushed: tables.pushed,
            pulled: tables.pulled,
            files_uploaded: files.uploaded,
            files_downloaded: files.downloaded,
            failures: failures.into_vec(),
        };
        tracing::info!(
            "Finished {strategy} sync: pushed {}, pulled {}, uploaded {}, downloaded {}, {} failures",
            result.pushed,
            result.pulled,
            result.files_uploaded,
            result.files_downloaded,
            result.failures.len()
        );
        Ok(result)
    }

    /// `force_push` needs an elevated key; the check happens before any
    /// connection is made.
    async fn resolve_for(&self, strategy: SyncStrategy) -> Result<ResolvedEndpoint> {
        if strategy == SyncStrategy::ForcePush {
            return self.resolver.resolve_elevated().await;
        }
        self.resolver.resolve().await?.ok_or(Error::NotConfigured)
    }

    async fn reconcile_tables(
        &self,
        handle: &RemoteHandle,
        strategy: SyncStrategy,
        policy: ConflictPolicy,
        failures: &mut PartialFailures,
    ) -> Result<TableCounts> {
        let reconciler = TableReconciler::new(self.local.as_ref(), handle.tables.as_ref());
        match strategy {
            SyncStrategy::ForcePull => reconciler.force_pull_all().await,
            SyncStrategy::ForcePush => reconciler.force_push_all().await,
            SyncStrategy::Full | SyncStrategy::MergePull | SyncStrategy::MergePush => {
                let mut counts = TableCounts::default();
                // parents first so foreign keys resolve
                for table in SyncTable::RECORDS {
                    counts += match strategy {
                        SyncStrategy::MergePull => reconciler.merge_pull(table, failures).await?,
                        SyncStrategy::MergePush => reconciler.merge_push(table, failures).await?,
                        _ => reconciler.full(table, policy, failures).await?,
                    };
                }
                Ok(counts)
            }
        }
    }

    async fn reconcile_files(
        &self,
        handle: &RemoteHandle,
        mode: FileSyncMode,
        failures: &mut PartialFailures,
    ) -> Result<FileCounts> {
        let Some(data_root) = self.runtime.data_root.as_deref() else {
            tracing::debug!("No data root configured, skipping document sync");
            return Ok(FileCounts::default());
        };

        // pull-only runs take the layout from the remote copy
        if mode.pushes() {
            ensure_local(data_root, &self.runtime.document_categories).await?;
        }
        let mut counts =
            sync_config_document(handle.blobs.as_ref(), data_root, mode, failures).await;

        let files = FileReconciler::new(handle.blobs.as_ref(), self.runtime.file_concurrency);
        for category in &self.runtime.document_categories {
            counts += files
                .sync_files(&data_root.join(category), category, mode, failures)
                .await?;
        }
        Ok(counts)
    }
}
