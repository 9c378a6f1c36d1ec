use std::env;
use std::path::{Path, PathBuf};

use tally_core::config::SyncRuntimeConfig;
use tally_core::db::LibSqlStore;
use tally_core::models::{FailureTarget, PartialFailure, TransferDirection};
use tally_core::util::normalize_text_option;
use tally_core::vault::Vault;
use tally_core::{SyncResult, SyncService, SyncStatus};

use crate::error::CliError;

const ENV_DB_PATH: &str = "TALLY_DB_PATH";
const ENV_VAULT_PASSPHRASE: &str = "TALLY_VAULT_PASSPHRASE";

pub fn resolve_db_path(cli_db_path: Option<PathBuf>) -> PathBuf {
    cli_db_path
        .or_else(|| env::var_os(ENV_DB_PATH).map(PathBuf::from))
        .unwrap_or_else(default_db_path)
}

fn default_db_path() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("tally")
        .join("tally.db")
}

pub fn resolve_passphrase(cli_passphrase: Option<String>) -> Option<String> {
    normalize_text_option(cli_passphrase)
        .or_else(|| normalize_text_option(env::var(ENV_VAULT_PASSPHRASE).ok()))
}

/// Open the store and build the service, unlocking the vault when a
/// passphrase is available.
pub async fn open_service(
    db_path: &Path,
    passphrase: Option<String>,
) -> Result<SyncService, CliError> {
    let store = LibSqlStore::open_path(db_path).await?;
    let runtime = SyncRuntimeConfig::from_env()?;
    let service = SyncService::new(store, Vault::locked(), runtime);
    if let Some(passphrase) = resolve_passphrase(passphrase) {
        service.unlock_vault(&passphrase).await?;
        tracing::debug!("Vault unlocked");
    }
    Ok(service)
}

pub fn format_status_lines(status: &SyncStatus) -> Vec<String> {
    let state = match (status.configured, status.enabled) {
        (false, _) => "not configured",
        (true, false) => "configured, disabled",
        (true, true) => "enabled",
    };
    vec![
        format!("Sync: {state}"),
        format!("Conflict policy: {}", status.conflict_policy),
        format!(
            "Last sync: {}",
            status.last_sync_at.as_deref().unwrap_or("never")
        ),
        format!(
            "Realtime: {}",
            if status.realtime { "running" } else { "stopped" }
        ),
    ]
}

pub fn format_result_lines(result: &SyncResult) -> Vec<String> {
    let mut lines = vec![
        format!("Records: {} pushed, {} pulled", result.pushed, result.pulled),
        format!(
            "Files: {} uploaded, {} downloaded",
            result.files_uploaded, result.files_downloaded
        ),
    ];
    if !result.failures.is_empty() {
        lines.push(format!("{} items failed:", result.failures.len()));
        lines.extend(result.failures.iter().map(format_failure));
    }
    lines
}

fn format_failure(failure: &PartialFailure) -> String {
    let direction = match failure.direction {
        TransferDirection::Push => "push",
        TransferDirection::Pull => "pull",
    };
    match &failure.target {
        FailureTarget::Row { table, id } => {
            format!("  {direction} {table} {id}: {}", failure.message)
        }
        FailureTarget::File { path } => format!("  {direction} {path}: {}", failure.message),
    }
}
